//! Variant generation: mutate, crossover, clone.
//!
//! Every operation hands out a fresh id, zero stats and a lineage pointer to
//! the (first) parent. The evolver owns the id counter so ids stay unique for
//! the life of a hive.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::agent::{Agent, AgentId, Decider, Parameters};
use crate::config::EvolverConfig;
use crate::logging::{self, Domain, Level};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variation {
    Mutate,
    Crossover,
    Clone,
}

#[derive(Debug)]
pub struct Evolver {
    cfg: EvolverConfig,
    next_id: u64,
}

impl Evolver {
    pub fn new(cfg: &EvolverConfig) -> Self {
        Self {
            cfg: cfg.clone(),
            next_id: 0,
        }
    }

    fn fresh_id(&mut self) -> AgentId {
        self.next_id += 1;
        format!("agent-{}", self.next_id)
    }

    /// Root agent built straight from a decider.
    pub fn spawn(&mut self, decider: Arc<dyn Decider>, overrides: &Parameters) -> Agent {
        let id = self.fresh_id();
        Agent::new(id, decider, overrides)
    }

    /// Each numeric parameter scaled by a factor in `[1 - s, 1 + s]`.
    pub fn mutate<R: Rng + ?Sized>(&mut self, parent: &Agent, rng: &mut R) -> Agent {
        let scale = self.cfg.mutation_scale.abs();
        let parameters: Parameters = parent
            .parameters
            .iter()
            .map(|(k, v)| {
                let delta = if scale > 0.0 { rng.gen_range(-scale..=scale) } else { 0.0 };
                (k.clone(), v * (1.0 + delta))
            })
            .collect();
        let id = self.fresh_id();
        self.announce(Variation::Mutate, &id, parent, None);
        parent.offspring(id, parameters)
    }

    /// Per-key pick from either parent. Keys only one parent has are kept.
    pub fn crossover<R: Rng + ?Sized>(&mut self, a: &Agent, b: &Agent, rng: &mut R) -> Agent {
        let mut parameters = Parameters::new();
        for (k, va) in &a.parameters {
            let v = match b.parameters.get(k) {
                Some(vb) if rng.gen_bool(0.5) => *vb,
                _ => *va,
            };
            parameters.insert(k.clone(), v);
        }
        for (k, vb) in &b.parameters {
            parameters.entry(k.clone()).or_insert(*vb);
        }
        let id = self.fresh_id();
        self.announce(Variation::Crossover, &id, a, Some(b));
        a.offspring(id, parameters)
    }

    pub fn clone_agent(&mut self, parent: &Agent) -> Agent {
        let id = self.fresh_id();
        self.announce(Variation::Clone, &id, parent, None);
        parent.offspring(id, parent.parameters.clone())
    }

    /// Default policy: mutate, occasionally crossover with a same-kind
    /// partner, clone when the kind has nothing to mutate.
    pub fn choose(&self, parent: &Agent, partner: Option<&Agent>, roll: f64) -> Variation {
        if !parent.supports_mutation() || parent.parameters.is_empty() {
            return Variation::Clone;
        }
        match partner {
            Some(p) if p.kind == parent.kind && roll < self.cfg.crossover_rate => Variation::Crossover,
            _ => Variation::Mutate,
        }
    }

    pub fn evolve<R: Rng + ?Sized>(&mut self, parent: &Agent, partner: Option<&Agent>, rng: &mut R) -> Agent {
        let roll: f64 = rng.gen();
        match (self.choose(parent, partner, roll), partner) {
            (Variation::Crossover, Some(p)) => self.crossover(parent, p, rng),
            (Variation::Mutate, _) => self.mutate(parent, rng),
            _ => self.clone_agent(parent),
        }
    }

    fn announce(&self, variation: Variation, id: &str, parent: &Agent, other: Option<&Agent>) {
        logging::log(
            Level::Info,
            Domain::Evolver,
            "variant",
            logging::obj(&[
                ("agent_id", logging::v_str(id)),
                ("variation", serde_json::json!(variation)),
                ("parent", logging::v_str(&parent.id)),
                ("other_parent", serde_json::json!(other.map(|o| o.id.clone()))),
                ("kind", logging::v_str(&parent.kind)),
            ]),
        );
    }
}
