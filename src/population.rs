use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::agent::{Agent, AgentId, AgentSummary};
use crate::config::PopulationConfig;
use crate::error::{HiveError, Result};
use crate::logging::{self, v_num, v_str};

pub type SharedPopulation = Arc<Mutex<Population>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedAgent {
    pub summary: AgentSummary,
    pub reason: String,
    pub retired_at: DateTime<Utc>,
}

/// Live agents bounded by `[min_size, max_size]`, plus a capped archive of
/// retired ones.
#[derive(Debug)]
pub struct Population {
    agents: Vec<Agent>,
    min_size: usize,
    max_size: usize,
    cursor: usize,
    archive: VecDeque<ArchivedAgent>,
    archive_capacity: usize,
}

impl Population {
    pub fn new(cfg: &PopulationConfig) -> Self {
        Self {
            agents: Vec::new(),
            min_size: cfg.min_size,
            max_size: cfg.max_size,
            cursor: 0,
            archive: VecDeque::new(),
            archive_capacity: cfg.archive_capacity.max(1),
        }
    }

    pub fn shared(self) -> SharedPopulation {
        Arc::new(Mutex::new(self))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn min_size(&self) -> usize {
        self.min_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn has_room(&self) -> bool {
        self.agents.len() < self.max_size
    }

    pub fn can_retire(&self) -> bool {
        self.agents.len() > self.min_size
    }

    pub fn add(&mut self, agent: Agent) -> Result<()> {
        if !self.has_room() {
            return Err(HiveError::PopulationBound(format!(
                "cannot add {}: population at max_size {}",
                agent.id, self.max_size
            )));
        }
        if self.contains(&agent.id) {
            return Err(HiveError::PopulationBound(format!("duplicate agent id {}", agent.id)));
        }
        logging::log_lifecycle(
            "agent_added",
            &agent.id,
            &[
                ("kind", v_str(&agent.kind)),
                ("generation", serde_json::json!(agent.generation)),
                ("lineage", serde_json::json!(agent.lineage)),
                ("population", serde_json::json!(self.agents.len() + 1)),
            ],
        );
        self.agents.push(agent);
        Ok(())
    }

    /// Move an agent to the archive. Refused at or below `min_size`.
    pub fn retire(&mut self, agent_id: &str, reason: &str) -> Result<ArchivedAgent> {
        if !self.can_retire() {
            return Err(HiveError::PopulationBound(format!(
                "cannot retire {}: population at min_size {}",
                agent_id, self.min_size
            )));
        }
        let idx = self
            .agents
            .iter()
            .position(|a| a.id == agent_id)
            .ok_or_else(|| HiveError::PopulationBound(format!("unknown agent {}", agent_id)))?;
        let agent = self.agents.remove(idx);
        if self.cursor > idx {
            self.cursor -= 1;
        }

        let archived = ArchivedAgent {
            summary: agent.summary(),
            reason: reason.to_string(),
            retired_at: Utc::now(),
        };
        logging::log_lifecycle(
            "agent_archived",
            agent_id,
            &[
                ("reason", v_str(reason)),
                ("win_rate", v_num(agent.stats.win_rate())),
                ("trials", serde_json::json!(agent.stats.trials)),
                ("failures", serde_json::json!(agent.stats.failures)),
                ("population", serde_json::json!(self.agents.len())),
            ],
        );
        if self.archive.len() >= self.archive_capacity {
            self.archive.pop_front();
        }
        self.archive.push_back(archived.clone());
        Ok(archived)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.iter().any(|a| a.id == agent_id)
    }

    pub fn get(&self, agent_id: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.id == agent_id)
    }

    pub fn get_mut(&mut self, agent_id: &str) -> Option<&mut Agent> {
        self.agents.iter_mut().find(|a| a.id == agent_id)
    }

    /// Next agent in insertion order, wrapping.
    pub fn next_round_robin(&mut self) -> Option<AgentId> {
        if self.agents.is_empty() {
            return None;
        }
        if self.cursor >= self.agents.len() {
            self.cursor = 0;
        }
        let id = self.agents[self.cursor].id.clone();
        self.cursor += 1;
        Some(id)
    }

    /// Best first: lifetime win rate, then trials, then fewer failures.
    pub fn ranked(&self) -> Vec<&Agent> {
        let mut out: Vec<&Agent> = self.agents.iter().collect();
        out.sort_by(|a, b| {
            b.stats
                .win_rate()
                .partial_cmp(&a.stats.win_rate())
                .unwrap_or(Ordering::Equal)
                .then(b.stats.trials.cmp(&a.stats.trials))
                .then(a.stats.failures.cmp(&b.stats.failures))
                .then(a.id.cmp(&b.id))
        });
        out
    }

    /// Pull every agent's hunger halfway toward the population mean.
    /// Returns the mean.
    pub fn share_motivation(&mut self) -> Option<f64> {
        if self.agents.is_empty() {
            return None;
        }
        let mean = self.agents.iter().map(|a| a.motivation.hunger).sum::<f64>() / self.agents.len() as f64;
        for agent in &mut self.agents {
            agent.motivation.hunger = (agent.motivation.hunger + mean) / 2.0;
        }
        logging::log(
            logging::Level::Debug,
            logging::Domain::Population,
            "motivation_shared",
            logging::obj(&[("mean_hunger", v_num(mean)), ("population", serde_json::json!(self.agents.len()))]),
        );
        Some(mean)
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(Agent::summary).collect()
    }

    pub fn archive(&self) -> impl Iterator<Item = &ArchivedAgent> {
        self.archive.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{DeciderRegistry, Parameters};

    fn agent(id: &str) -> Agent {
        let registry = DeciderRegistry::default();
        Agent::new(id.to_string(), registry.get("momentum").unwrap(), &Parameters::new())
    }

    fn population(min: usize, max: usize) -> Population {
        Population::new(&PopulationConfig {
            min_size: min,
            max_size: max,
            initial_size: min,
            ..PopulationConfig::default()
        })
    }

    #[test]
    fn test_add_refused_at_ceiling() {
        let mut p = population(1, 2);
        p.add(agent("a")).unwrap();
        p.add(agent("b")).unwrap();
        let err = p.add(agent("c")).unwrap_err();
        assert!(matches!(err, HiveError::PopulationBound(_)));
        assert_eq!(p.len(), 2);
    }

    #[test]
    fn test_retire_refused_at_floor() {
        let mut p = population(2, 3);
        p.add(agent("a")).unwrap();
        p.add(agent("b")).unwrap();
        p.add(agent("c")).unwrap();
        let archived = p.retire("b", "test").unwrap();
        assert_eq!(archived.summary.id, "b");
        assert!(p.retire("a", "test").is_err());
        assert_eq!(p.len(), 2);
        assert_eq!(p.archive().count(), 1);
    }

    #[test]
    fn test_round_robin_wraps_and_survives_removal() {
        let mut p = population(1, 5);
        for id in ["a", "b", "c"] {
            p.add(agent(id)).unwrap();
        }
        assert_eq!(p.next_round_robin().as_deref(), Some("a"));
        assert_eq!(p.next_round_robin().as_deref(), Some("b"));
        p.retire("a", "test").unwrap();
        assert_eq!(p.next_round_robin().as_deref(), Some("c"));
        assert_eq!(p.next_round_robin().as_deref(), Some("b"));
    }

    #[test]
    fn test_ranked_by_lifetime_win_rate() {
        let mut p = population(1, 5);
        p.add(agent("a")).unwrap();
        p.add(agent("b")).unwrap();
        p.get_mut("a").unwrap().stats.trials = 10;
        p.get_mut("a").unwrap().stats.wins = 2;
        p.get_mut("b").unwrap().stats.trials = 10;
        p.get_mut("b").unwrap().stats.wins = 7;
        let ranked: Vec<&str> = p.ranked().iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ranked, vec!["b", "a"]);
    }

    #[test]
    fn test_share_motivation_pulls_toward_mean() {
        let mut p = population(1, 5);
        assert_eq!(p.share_motivation(), None);
        for (id, hunger) in [("a", 0.0), ("b", 0.4), ("c", 0.8)] {
            p.add(agent(id)).unwrap();
            p.get_mut(id).unwrap().motivation.hunger = hunger;
        }
        let mean = p.share_motivation().unwrap();
        assert!((mean - 0.4).abs() < 1e-12);
        let hunger: Vec<f64> = p.summaries().iter().map(|s| s.motivation.hunger).collect();
        assert!((hunger[0] - 0.2).abs() < 1e-12);
        assert!((hunger[1] - 0.4).abs() < 1e-12);
        assert!((hunger[2] - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_duplicate_id_rejected() {
        let mut p = population(1, 5);
        p.add(agent("a")).unwrap();
        assert!(p.add(agent("a")).is_err());
    }
}
