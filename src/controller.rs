//! Population controller: one dispatch per cycle.
//!
//! Cycle steps:
//! 1. gate check (suspended cycles dispatch nothing)
//! 2. generator reads -> per-feature mean -> context fingerprint
//! 3. ledger `best_for` over live agents, round-robin fallback
//! 4. `decide` on a blocking task under a timeout, then `resolve`
//! 5. ledger record + agent stats/motivation, applied together
//! 6. periodic work: evolve/retire, generator upkeep, hive sync,
//!    checkpoint, summary

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::agent::{Action, AgentId, Outcome};
use crate::config::HiveConfig;
use crate::evolver::Evolver;
use crate::fingerprint::{fingerprint, Context};
use crate::guardian::SuspendGate;
use crate::journal::{JournalEntry, PersistenceSink};
use crate::ledger::{MergeOutcome, SharedLedger};
use crate::logging::{self, Domain, Level};
use crate::peer::PeerChannel;
use crate::population::SharedPopulation;
use crate::signals::{GeneratorBank, Observation};

/// Turns an action into a real-world effect and a reward.
#[async_trait]
pub trait ActionResolver: Send + Sync {
    /// Called with every observation before generators read it.
    fn on_observation(&self, _observation: &Observation) {}

    async fn resolve(&self, agent_id: &str, context: &Context, action: Action) -> AnyResult<Outcome>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    Ledger,
    RoundRobin,
}

impl Selection {
    fn as_str(&self) -> &'static str {
        match self {
            Selection::Ledger => "ledger",
            Selection::RoundRobin => "round_robin",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleReport {
    Suspended,
    Skipped(String),
    Dispatched { outcome: Outcome, selection: Selection },
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ControllerStats {
    pub cycles: u64,
    pub dispatches: u64,
    pub suspended_cycles: u64,
    pub skipped_cycles: u64,
    pub agent_failures: u64,
    pub resolver_failures: u64,
    pub clones: u64,
    pub retirements: u64,
    pub merges: u64,
    pub generator_replicas: u64,
}

pub struct Controller {
    cfg: HiveConfig,
    bank: GeneratorBank,
    ledger: SharedLedger,
    population: SharedPopulation,
    evolver: Evolver,
    gate: SuspendGate,
    resolver: Arc<dyn ActionResolver>,
    peers: Vec<Arc<dyn PeerChannel>>,
    sink: Option<Arc<dyn PersistenceSink>>,
    rng: StdRng,
    stats: ControllerStats,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: HiveConfig,
        bank: GeneratorBank,
        ledger: SharedLedger,
        population: SharedPopulation,
        evolver: Evolver,
        gate: SuspendGate,
        resolver: Arc<dyn ActionResolver>,
        rng: StdRng,
    ) -> Self {
        Self {
            cfg,
            bank,
            ledger,
            population,
            evolver,
            gate,
            resolver,
            peers: Vec::new(),
            sink: None,
            rng,
            stats: ControllerStats::default(),
        }
    }

    pub fn with_peers(mut self, peers: Vec<Arc<dyn PeerChannel>>) -> Self {
        self.peers = peers;
        self
    }

    pub fn with_sink(mut self, sink: Option<Arc<dyn PersistenceSink>>) -> Self {
        self.sink = sink;
        self
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub fn cycle(&self) -> u64 {
        self.stats.cycles
    }

    pub fn bank(&self) -> &GeneratorBank {
        &self.bank
    }

    fn skip(&mut self, reason: &str) -> CycleReport {
        self.stats.skipped_cycles += 1;
        logging::log_transient(Domain::Dispatch, "cycle", reason);
        CycleReport::Skipped(reason.to_string())
    }

    pub async fn run_cycle(&mut self, observation: Option<Observation>) -> CycleReport {
        self.stats.cycles += 1;
        let cycle = self.stats.cycles;

        if self.gate.is_suspended() {
            self.stats.suspended_cycles += 1;
            logging::log(
                Level::Debug,
                Domain::Dispatch,
                "suspended",
                logging::obj(&[("cycle", serde_json::json!(cycle))]),
            );
            return CycleReport::Suspended;
        }

        let report = self.dispatch(cycle, observation).await;
        self.periodic(cycle).await;
        report
    }

    async fn dispatch(&mut self, cycle: u64, observation: Option<Observation>) -> CycleReport {
        let _profile = logging::ProfileScope::with_context("dispatch", &[("cycle", serde_json::json!(cycle))]);

        let Some(observation) = observation else {
            return self.skip("no observation");
        };
        self.resolver.on_observation(&observation);

        let readings = self.bank.read_all(Arc::new(observation)).await;
        if readings.is_empty() {
            return self.skip("no generator readings");
        }
        let resolution = self.cfg.ledger.resolution;
        let context = fingerprint(&GeneratorBank::aggregate(&readings), resolution);
        let signals: BTreeMap<String, f64> = context
            .dims()
            .iter()
            .map(|(name, steps)| (name.clone(), *steps as f64 * resolution))
            .collect();

        let Some((agent_id, selection)) = self.select(&context) else {
            return self.skip("empty population");
        };

        let picked = self
            .population
            .lock()
            .get(&agent_id)
            .map(|a| (a.view(&context, signals), a.decider()));
        let Some((view, decider)) = picked else {
            return self.skip("selected agent vanished");
        };

        let decide_timeout = Duration::from_millis(self.cfg.runtime.decide_timeout_ms);
        let decision = tokio::time::timeout(
            decide_timeout,
            tokio::task::spawn_blocking(move || decider.decide(&view)),
        )
        .await;

        let outcome = match decision {
            Ok(Ok(Ok(action))) => self.resolve(&agent_id, &context, action).await,
            Ok(Ok(Err(err))) => self.agent_failed(cycle, &agent_id, &context, &err.to_string()),
            Ok(Err(join_err)) => self.agent_failed(cycle, &agent_id, &context, &format!("decide panicked: {}", join_err)),
            Err(_) => self.agent_failed(
                cycle,
                &agent_id,
                &context,
                &format!("decide timed out after {}ms", decide_timeout.as_millis()),
            ),
        };

        self.apply(&outcome);
        self.stats.dispatches += 1;
        logging::log_dispatch(
            cycle,
            &agent_id,
            &context.to_string(),
            outcome.action.map(|a| a.label()).unwrap_or("failed"),
            outcome.reward,
            selection.as_str(),
        );
        CycleReport::Dispatched { outcome, selection }
    }

    fn select(&mut self, context: &Context) -> Option<(AgentId, Selection)> {
        let rate = self.cfg.ledger.exploration_rate;
        let suggested = {
            let pop = self.population.lock();
            let ledger = self.ledger.read();
            ledger.best_among(context, rate, &mut self.rng, |id| pop.contains(id))
        };
        match suggested {
            Some(id) => Some((id, Selection::Ledger)),
            None => self
                .population
                .lock()
                .next_round_robin()
                .map(|id| (id, Selection::RoundRobin)),
        }
    }

    fn agent_failed(&mut self, cycle: u64, agent_id: &str, context: &Context, reason: &str) -> Outcome {
        self.stats.agent_failures += 1;
        logging::log_agent_failure(cycle, agent_id, reason);
        Outcome::failed(agent_id, context.clone())
    }

    async fn resolve(&mut self, agent_id: &str, context: &Context, action: Action) -> Outcome {
        let timeout = Duration::from_millis(self.cfg.runtime.resolve_timeout_ms);
        let reason = match tokio::time::timeout(timeout, self.resolver.resolve(agent_id, context, action)).await {
            Ok(Ok(outcome)) => return outcome,
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("resolve timed out after {}ms", timeout.as_millis()),
        };
        self.stats.resolver_failures += 1;
        logging::log_transient(Domain::Dispatch, "resolve", &reason);
        Outcome {
            agent_id: agent_id.to_string(),
            context: context.clone(),
            action: Some(action),
            reward: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// Ledger record and agent update under both write locks, so no reader
    /// sees one without the other.
    fn apply(&mut self, outcome: &Outcome) {
        let mut pop = self.population.lock();
        let mut ledger = self.ledger.write();
        ledger.record(&outcome.agent_id, &outcome.context, outcome.is_win());
        if let Some(agent) = pop.get_mut(&outcome.agent_id) {
            agent.absorb(outcome);
        }
    }

    async fn periodic(&mut self, cycle: u64) {
        let due = |every: u64| every > 0 && cycle % every == 0;

        if due(self.cfg.population.evolve_every) {
            self.evolve_step();
        }
        if due(self.cfg.generator.self_tune_every) {
            self.bank.self_tune_all();
        }
        let replicas = self.bank.replicate_hungry(&mut self.rng);
        self.stats.generator_replicas += replicas.len() as u64;

        if due(self.cfg.runtime.hive_sync_every) {
            self.sync_peers().await;
        }
        if due(self.cfg.runtime.checkpoint_every) {
            self.checkpoint(cycle);
        }
        if due(self.cfg.runtime.summary_every) {
            let population = self.population.lock().len();
            logging::log_periodic_summary(
                cycle,
                population,
                self.stats.dispatches,
                self.stats.suspended_cycles,
                self.stats.agent_failures,
            );
        }
    }

    /// Grow from the top performer, then retire the worst agent that has
    /// had its chance and still underperforms. The retirement candidate is
    /// ranked before the clone joins. Survivors then share hunger.
    pub fn evolve_step(&mut self) {
        let mut archived = None;
        {
            let mut pop = self.population.lock();
            let min_trials = self.cfg.population.min_trials_for_retirement;
            let retire_below = self.cfg.population.retire_below;
            let candidate = pop
                .ranked()
                .into_iter()
                .filter(|a| a.stats.trials > min_trials)
                .last()
                .filter(|a| a.stats.win_rate() <= retire_below)
                .map(|a| a.id.clone());

            if pop.has_room() {
                let child = {
                    let ranked = pop.ranked();
                    ranked.first().map(|top| {
                        let partner = ranked.iter().skip(1).find(|a| a.kind == top.kind).copied();
                        self.evolver.evolve(top, partner, &mut self.rng)
                    })
                };
                if let Some(child) = child {
                    match pop.add(child) {
                        Ok(()) => self.stats.clones += 1,
                        Err(err) => logging::log_transient(Domain::Population, "clone", &err.to_string()),
                    }
                }
            }

            if let Some(id) = candidate.filter(|_| pop.can_retire()) {
                match pop.retire(&id, "underperforming") {
                    Ok(agent) => {
                        self.stats.retirements += 1;
                        archived = Some(agent);
                    }
                    Err(err) => logging::log_transient(Domain::Population, "retire", &err.to_string()),
                }
            }
            pop.share_motivation();
        }

        if let Some(agent) = archived {
            self.ledger.write().forget_agent(&agent.summary.id);
            self.persist(JournalEntry::Archived { ts: agent.retired_at, agent });
        }
    }

    pub async fn sync_peers(&mut self) {
        for peer in &self.peers {
            let pulled = match peer.fetch_peer_ledger().await {
                Ok(p) => p,
                Err(err) => {
                    logging::log_transient(Domain::Ledger, "peer_fetch", &format!("{}: {}", peer.peer_id(), err));
                    continue;
                }
            };
            let merge_id = pulled.merge_id();
            if let MergeOutcome::Applied { .. } = self.ledger.write().merge(&pulled.ledger, &merge_id) {
                self.stats.merges += 1;
            }
        }
    }

    pub fn checkpoint(&mut self, cycle: u64) {
        let (hash, snapshot, entries, merges) = {
            let ledger = self.ledger.read();
            (ledger.state_hash(), ledger.snapshot(), ledger.len(), ledger.merge_count())
        };
        logging::log_checkpoint(&hash, entries, merges);
        self.persist(JournalEntry::LedgerCheckpoint {
            ts: Utc::now(),
            cycle,
            state_hash: hash,
            ledger: snapshot,
        });
    }

    fn persist(&self, entry: JournalEntry) {
        if let Some(sink) = &self.sink {
            if let Err(err) = sink.append(&entry) {
                logging::log_transient(Domain::Audit, "persist", &err.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentStats, Decider, DecisionView, DeciderRegistry, Parameters};
    use crate::error::Result;
    use crate::ledger::Ledger;
    use crate::population::Population;
    use crate::signals::GeneratorRegistry;
    use anyhow::anyhow;
    use parking_lot::Mutex;
    use rand::SeedableRng;

    struct AlwaysBuy;

    impl Decider for AlwaysBuy {
        fn kind(&self) -> &'static str {
            "always_buy"
        }
        fn decide(&self, _view: &DecisionView) -> AnyResult<Action> {
            Ok(Action::Buy { size: 1.0 })
        }
        fn default_parameters(&self) -> Parameters {
            Parameters::new()
        }
    }

    struct Rejecting;

    #[async_trait]
    impl ActionResolver for Rejecting {
        async fn resolve(&self, _agent_id: &str, _context: &Context, _action: Action) -> AnyResult<Outcome> {
            Err(anyhow!("venue rejected order"))
        }
    }

    struct Stalling;

    #[async_trait]
    impl ActionResolver for Stalling {
        async fn resolve(&self, _agent_id: &str, _context: &Context, _action: Action) -> AnyResult<Outcome> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Err(anyhow!("unreachable"))
        }
    }

    #[derive(Default)]
    struct Recording(Mutex<Vec<JournalEntry>>);

    impl PersistenceSink for Recording {
        fn append(&self, entry: &JournalEntry) -> Result<()> {
            self.0.lock().push(entry.clone());
            Ok(())
        }
    }

    fn config(min: usize, max: usize) -> HiveConfig {
        let mut cfg = HiveConfig::default();
        cfg.population.min_size = min;
        cfg.population.max_size = max;
        cfg.runtime.resolve_timeout_ms = 20;
        cfg
    }

    fn stats(wins: u64, trials: u64) -> AgentStats {
        AgentStats {
            wins,
            trials,
            failures: 0,
            total_reward: wins as f64,
        }
    }

    /// Controller over momentum agents with the given lifetime records.
    fn controller(cfg: HiveConfig, records: &[AgentStats], resolver: Arc<dyn ActionResolver>) -> Controller {
        let registry = DeciderRegistry::default();
        let mut evolver = Evolver::new(&cfg.evolver);
        let mut population = Population::new(&cfg.population);
        for record in records {
            let mut agent = evolver.spawn(registry.get("momentum").unwrap(), &Parameters::new());
            agent.stats = *record;
            population.add(agent).unwrap();
        }
        Controller::new(
            cfg.clone(),
            GeneratorBank::new(&cfg.generator),
            Ledger::new(&cfg.ledger).shared(),
            population.shared(),
            evolver,
            SuspendGate::new(),
            resolver,
            StdRng::seed_from_u64(5),
        )
    }

    fn seed_rows(c: &Controller, agent_id: &str) {
        let mut ledger = c.ledger.write();
        for v in [0.1, 0.7] {
            let ctx = fingerprint([("noise".to_string(), v)].iter().map(|(k, v)| (k, v)), 0.1);
            ledger.record(agent_id, &ctx, false);
        }
    }

    fn observation() -> Option<Observation> {
        let mut obs = Observation::new();
        for key in ["noise", "pressure", "volume", "spread"] {
            obs.insert(key.to_string(), 1.0);
        }
        Some(obs)
    }

    #[test]
    fn test_evolve_retires_worst_while_room_remains() {
        let records = [stats(18, 20), stats(10, 20), stats(2, 20)];
        let sink = Arc::new(Recording::default());
        let mut c = controller(config(2, 4), &records, Arc::new(Rejecting)).with_sink(Some(sink.clone() as Arc<dyn PersistenceSink>));
        seed_rows(&c, "agent-1");
        seed_rows(&c, "agent-3");

        c.evolve_step();

        assert_eq!(c.stats().clones, 1);
        assert_eq!(c.stats().retirements, 1);
        let pop = c.population.lock();
        assert_eq!(pop.len(), 3);
        assert!(!pop.contains("agent-3"));
        assert!(pop.contains("agent-4"));
        let archived: Vec<&str> = pop.archive().map(|a| a.summary.id.as_str()).collect();
        assert_eq!(archived, vec!["agent-3"]);
        drop(pop);

        let snapshot = c.ledger.read().snapshot();
        assert!(snapshot.rows.iter().all(|r| r.agent_id != "agent-3"));
        assert_eq!(snapshot.rows.iter().filter(|r| r.agent_id == "agent-1").count(), 2);

        let journal = sink.0.lock();
        assert!(journal
            .iter()
            .any(|e| matches!(e, JournalEntry::Archived { agent, .. } if agent.summary.id == "agent-3")));
    }

    #[test]
    fn test_evolve_keeps_floor_and_unproven_agents() {
        let records = [stats(18, 20), stats(10, 20), stats(2, 20)];
        let mut c = controller(config(3, 3), &records, Arc::new(Rejecting));
        seed_rows(&c, "agent-3");

        c.evolve_step();

        assert_eq!(c.stats().clones, 0);
        assert_eq!(c.stats().retirements, 0);
        assert_eq!(c.population.lock().len(), 3);
        assert_eq!(c.population.lock().archive().count(), 0);
        assert_eq!(c.ledger.read().len(), 2);

        // Room to spare, but the losing agent has not had enough trials.
        let records = [stats(18, 20), stats(0, 10)];
        let mut c = controller(config(1, 4), &records, Arc::new(Rejecting));
        c.evolve_step();
        assert_eq!(c.stats().clones, 1);
        assert_eq!(c.stats().retirements, 0);
        assert!(c.population.lock().contains("agent-2"));
    }

    async fn dispatch_with(resolver: Arc<dyn ActionResolver>) -> Controller {
        let cfg = config(1, 2);
        let mut c = controller(cfg.clone(), &[], resolver);
        c.bank = GeneratorBank::from_config(&GeneratorRegistry::default(), &cfg.generator).unwrap();
        let agent = c.evolver.spawn(Arc::new(AlwaysBuy), &Parameters::new());
        c.population.lock().add(agent).unwrap();

        match c.run_cycle(observation()).await {
            CycleReport::Dispatched { outcome, selection } => {
                assert_eq!(selection, Selection::RoundRobin);
                assert_eq!(outcome.action, Some(Action::Buy { size: 1.0 }));
                assert_eq!(outcome.reward, 0.0);
                let entry = c.ledger.read().entry(&outcome.agent_id, &outcome.context).unwrap();
                assert_eq!(entry.wins, 0.0);
                assert_eq!(entry.trials, 1.0);
            }
            other => panic!("unexpected report {other:?}"),
        }
        c
    }

    #[tokio::test]
    async fn test_resolver_error_keeps_action_with_zero_reward() {
        let c = dispatch_with(Arc::new(Rejecting)).await;
        assert_eq!(c.stats().resolver_failures, 1);
        assert_eq!(c.stats().agent_failures, 0);
        let pop = c.population.lock();
        let agent = pop.get("agent-1").unwrap();
        assert_eq!(agent.stats.trials, 1);
        assert_eq!(agent.stats.failures, 0);
    }

    #[tokio::test]
    async fn test_resolver_timeout_keeps_action_with_zero_reward() {
        let c = dispatch_with(Arc::new(Stalling)).await;
        assert_eq!(c.stats().resolver_failures, 1);
        assert_eq!(c.stats().agent_failures, 0);
        assert_eq!(c.stats().dispatches, 1);
    }
}
