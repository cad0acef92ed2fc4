//! Contextual performance ledger.
//!
//! Keyed by `(agent, context)`. Each record blends the prior counters with
//! the fresh trial so old evidence decays geometrically:
//!
//! ```text
//! wins'   = adaptivity * wins   + w
//! trials' = adaptivity * trials + 1
//! ```
//!
//! Peer ledgers merge by averaging shared keys and copying one-sided keys.
//! Every merge carries an id; a repeated id is reported as
//! [`MergeOutcome::Duplicate`] and changes nothing.

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use crate::agent::AgentId;
use crate::config::LedgerConfig;
use crate::fingerprint::Context;
use crate::logging::{self, Domain, Level};

pub type SharedLedger = Arc<RwLock<Ledger>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub wins: f64,
    pub trials: f64,
}

impl LedgerEntry {
    pub fn rate(&self) -> f64 {
        if self.trials > 0.0 {
            self.wins / self.trials
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Applied { keys: usize },
    Duplicate,
}

/// Ranked candidate for a context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub agent_id: AgentId,
    pub context: Context,
    pub wins: f64,
    pub trials: f64,
    pub rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerRow {
    pub agent_id: AgentId,
    pub context: Context,
    pub wins: f64,
    pub trials: f64,
}

/// Serializable form of a ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub version: u64,
    pub rows: Vec<LedgerRow>,
    pub merge_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Ledger {
    entries: HashMap<(AgentId, Context), LedgerEntry>,
    merge_ids: BTreeSet<String>,
    adaptivity: f64,
    resolution: f64,
    epsilon: f64,
    min_trials: f64,
    version: u64,
}

impl Ledger {
    pub fn new(cfg: &LedgerConfig) -> Self {
        Self {
            entries: HashMap::new(),
            merge_ids: BTreeSet::new(),
            adaptivity: cfg.adaptivity,
            resolution: cfg.resolution,
            epsilon: cfg.epsilon,
            min_trials: cfg.min_trials,
            version: 0,
        }
    }

    pub fn shared(self) -> SharedLedger {
        Arc::new(RwLock::new(self))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Bumped on every mutation; peers use it to build merge ids.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn merge_count(&self) -> usize {
        self.merge_ids.len()
    }

    pub fn entry(&self, agent_id: &str, context: &Context) -> Option<LedgerEntry> {
        self.entries.get(&(agent_id.to_string(), context.clone())).copied()
    }

    /// Overwrite one entry. Used for seeding and recovery.
    pub fn insert(&mut self, agent_id: &str, context: Context, entry: LedgerEntry) {
        self.entries.insert((agent_id.to_string(), context), entry);
        self.version += 1;
    }

    pub fn record(&mut self, agent_id: &str, context: &Context, success: bool) -> LedgerEntry {
        let a = self.adaptivity;
        let w = if success { 1.0 } else { 0.0 };
        let slot = self
            .entries
            .entry((agent_id.to_string(), context.clone()))
            .or_default();
        slot.wins = a * slot.wins + w;
        slot.trials = a * slot.trials + 1.0;
        let updated = *slot;
        self.version += 1;
        updated
    }

    /// Entries near `context` with enough trials, best entry per agent,
    /// sorted by rate then trials.
    pub fn ranked(&self, context: &Context) -> Vec<Candidate> {
        let mut best: HashMap<&AgentId, Candidate> = HashMap::new();
        for ((agent_id, ctx), entry) in &self.entries {
            if entry.trials <= self.min_trials || !ctx.within(context, self.resolution, self.epsilon) {
                continue;
            }
            let candidate = Candidate {
                agent_id: agent_id.clone(),
                context: ctx.clone(),
                wins: entry.wins,
                trials: entry.trials,
                rate: entry.rate(),
            };
            let replace = best
                .get(agent_id)
                .map_or(true, |existing| outranks(&candidate, existing));
            if replace {
                best.insert(agent_id, candidate);
            }
        }
        let mut out: Vec<Candidate> = best.into_values().collect();
        out.sort_by(|a, b| {
            if outranks(a, b) {
                std::cmp::Ordering::Less
            } else if outranks(b, a) {
                std::cmp::Ordering::Greater
            } else {
                std::cmp::Ordering::Equal
            }
        });
        out
    }

    pub fn best_for(&self, context: &Context, exploration_rate: f64) -> Option<AgentId> {
        self.best_for_with_rng(context, exploration_rate, &mut rand::thread_rng())
    }

    pub fn best_for_with_rng<R: Rng + ?Sized>(
        &self,
        context: &Context,
        exploration_rate: f64,
        rng: &mut R,
    ) -> Option<AgentId> {
        self.best_among(context, exploration_rate, rng, |_| true)
    }

    /// `best_for` restricted to agents accepted by `alive`.
    pub fn best_among<R, F>(&self, context: &Context, exploration_rate: f64, rng: &mut R, alive: F) -> Option<AgentId>
    where
        R: Rng + ?Sized,
        F: Fn(&str) -> bool,
    {
        let mut ranked = self.ranked(context);
        ranked.retain(|c| alive(&c.agent_id));
        if ranked.is_empty() {
            return None;
        }
        if exploration_rate > 0.0 && rng.gen::<f64>() < exploration_rate {
            return ranked.choose(rng).map(|c| c.agent_id.clone());
        }
        ranked.first().map(|c| c.agent_id.clone())
    }

    /// Merge a peer ledger under `merge_id`.
    pub fn merge(&mut self, remote: &Ledger, merge_id: &str) -> MergeOutcome {
        if self.merge_ids.contains(merge_id) {
            logging::log(
                Level::Debug,
                Domain::Ledger,
                "merge_duplicate",
                logging::obj(&[("merge_id", logging::v_str(merge_id))]),
            );
            return MergeOutcome::Duplicate;
        }

        let mut keys = 0;
        for (key, theirs) in &remote.entries {
            let merged = match self.entries.get(key) {
                Some(ours) => LedgerEntry {
                    wins: (ours.wins + theirs.wins) / 2.0,
                    trials: (ours.trials + theirs.trials) / 2.0,
                },
                None => *theirs,
            };
            self.entries.insert(key.clone(), merged);
            keys += 1;
        }
        self.merge_ids.insert(merge_id.to_string());
        self.version += 1;

        logging::log(
            Level::Info,
            Domain::Ledger,
            "merge_applied",
            logging::obj(&[
                ("merge_id", logging::v_str(merge_id)),
                ("keys", serde_json::json!(keys)),
            ]),
        );
        MergeOutcome::Applied { keys }
    }

    /// Drop every entry of a retired agent.
    pub fn forget_agent(&mut self, agent_id: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(id, _), _| id != agent_id);
        let removed = before - self.entries.len();
        if removed > 0 {
            self.version += 1;
        }
        removed
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut rows: Vec<LedgerRow> = self
            .entries
            .iter()
            .map(|((agent_id, context), e)| LedgerRow {
                agent_id: agent_id.clone(),
                context: context.clone(),
                wins: e.wins,
                trials: e.trials,
            })
            .collect();
        rows.sort_by(|a, b| (&a.agent_id, &a.context).cmp(&(&b.agent_id, &b.context)));
        LedgerSnapshot {
            version: self.version,
            rows,
            merge_ids: self.merge_ids.iter().cloned().collect(),
        }
    }

    pub fn restore(cfg: &LedgerConfig, snapshot: LedgerSnapshot) -> Self {
        let mut ledger = Self::new(cfg);
        for row in snapshot.rows {
            ledger.entries.insert(
                (row.agent_id, row.context),
                LedgerEntry {
                    wins: row.wins,
                    trials: row.trials,
                },
            );
        }
        ledger.merge_ids = snapshot.merge_ids.into_iter().collect();
        ledger.version = snapshot.version;
        ledger
    }

    /// sha256 over the sorted snapshot rows.
    pub fn state_hash(&self) -> String {
        let snapshot = self.snapshot();
        let mut hasher = Sha256::new();
        for row in &snapshot.rows {
            hasher.update(row.agent_id.as_bytes());
            hasher.update(row.context.to_string().as_bytes());
            hasher.update(row.wins.to_le_bytes());
            hasher.update(row.trials.to_le_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

fn outranks(a: &Candidate, b: &Candidate) -> bool {
    if a.rate != b.rate {
        return a.rate > b.rate;
    }
    if a.trials != b.trials {
        return a.trials > b.trials;
    }
    a.agent_id < b.agent_id
}
