//! Agents and the pluggable decision capability.

use anyhow::Result as AnyResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::{HiveError, Result};
use crate::fingerprint::Context;

pub type AgentId = String;
pub type Parameters = BTreeMap<String, f64>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Hold,
    Buy { size: f64 },
    Sell { size: f64 },
    Close,
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::Hold => "hold",
            Action::Buy { .. } => "buy",
            Action::Sell { .. } => "sell",
            Action::Close => "close",
        }
    }
}

/// Result of one decision cycle. `action` is `None` when the agent failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub agent_id: AgentId,
    pub context: Context,
    pub action: Option<Action>,
    pub reward: f64,
    pub timestamp: DateTime<Utc>,
}

impl Outcome {
    pub fn failed(agent_id: &str, context: Context) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            context,
            action: None,
            reward: 0.0,
            timestamp: Utc::now(),
        }
    }

    pub fn is_win(&self) -> bool {
        self.reward > 0.0
    }
}

// =============================================================================
// Motivation
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Motivation {
    pub hunger: f64,
    pub curiosity: f64,
    pub risk_bias: f64,
}

impl Default for Motivation {
    fn default() -> Self {
        Self {
            hunger: 0.5,
            curiosity: 0.2,
            risk_bias: 0.5,
        }
    }
}

const HUNGER_RELIEF: f64 = 0.1;
const MOTIVATION_STEP: f64 = 0.05;

/// Positive reward relaxes hunger and raises risk appetite; anything else
/// makes the agent hungrier and more curious. All fields stay in [0, 1].
pub fn update_motivation(state: Motivation, reward: f64) -> Motivation {
    let next = if reward > 0.0 {
        Motivation {
            hunger: state.hunger - HUNGER_RELIEF,
            risk_bias: state.risk_bias + MOTIVATION_STEP,
            ..state
        }
    } else {
        Motivation {
            hunger: state.hunger + MOTIVATION_STEP,
            curiosity: state.curiosity + MOTIVATION_STEP,
            ..state
        }
    };
    Motivation {
        hunger: next.hunger.clamp(0.0, 1.0),
        curiosity: next.curiosity.clamp(0.0, 1.0),
        risk_bias: next.risk_bias.clamp(0.0, 1.0),
    }
}

// =============================================================================
// Decider capability
// =============================================================================

/// Everything a decider sees for one cycle. Owned so it can cross into a
/// blocking task.
#[derive(Debug, Clone)]
pub struct DecisionView {
    pub context: Context,
    /// Quantized signal values keyed by feature.
    pub signals: BTreeMap<String, f64>,
    pub parameters: Parameters,
    pub motivation: Motivation,
}

impl DecisionView {
    pub fn signal(&self, name: &str) -> f64 {
        self.signals.get(name).copied().unwrap_or(0.0)
    }

    pub fn param(&self, name: &str, default: f64) -> f64 {
        self.parameters.get(name).copied().unwrap_or(default)
    }
}

pub trait Decider: Send + Sync {
    fn kind(&self) -> &'static str;
    fn decide(&self, view: &DecisionView) -> AnyResult<Action>;
    fn default_parameters(&self) -> Parameters;
    fn initial_motivation(&self) -> Motivation {
        Motivation::default()
    }
    fn supports_mutation(&self) -> bool {
        true
    }
}

fn params(pairs: &[(&str, f64)]) -> Parameters {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Follows pressure: buy into positive pressure, sell into negative.
pub struct MomentumDecider;

impl Decider for MomentumDecider {
    fn kind(&self) -> &'static str {
        "momentum"
    }

    fn decide(&self, view: &DecisionView) -> AnyResult<Action> {
        let threshold = view.param("threshold", 1.0);
        let size = view.param("size", 1.0) * (0.5 + view.motivation.risk_bias);
        let pressure = view.signal("pressure");
        if view.signal("noise").abs() > view.param("noise_cap", 3.0) {
            return Ok(Action::Close);
        }
        if pressure > threshold {
            Ok(Action::Buy { size })
        } else if pressure < -threshold {
            Ok(Action::Sell { size })
        } else {
            Ok(Action::Hold)
        }
    }

    fn default_parameters(&self) -> Parameters {
        params(&[("threshold", 1.0), ("size", 1.0), ("noise_cap", 3.0)])
    }

    fn initial_motivation(&self) -> Motivation {
        Motivation {
            hunger: 0.5,
            curiosity: 0.2,
            risk_bias: 0.7,
        }
    }
}

/// Fades stretched noise readings.
pub struct MeanReversionDecider;

impl Decider for MeanReversionDecider {
    fn kind(&self) -> &'static str {
        "mean_reversion"
    }

    fn decide(&self, view: &DecisionView) -> AnyResult<Action> {
        let stretch = view.param("stretch", 1.5);
        let size = view.param("size", 1.0) * (0.5 + view.motivation.risk_bias);
        let noise = view.signal("noise");
        if view.signal("spread") > view.param("spread_cap", 2.5) {
            return Ok(Action::Hold);
        }
        // Curious agents take the trade at a looser stretch.
        let effective = stretch * (1.0 - 0.3 * view.motivation.curiosity);
        if noise > effective {
            Ok(Action::Sell { size })
        } else if noise < -effective {
            Ok(Action::Buy { size })
        } else if noise.abs() < 0.2 {
            Ok(Action::Close)
        } else {
            Ok(Action::Hold)
        }
    }

    fn default_parameters(&self) -> Parameters {
        params(&[("stretch", 1.5), ("size", 1.0), ("spread_cap", 2.5)])
    }

    fn initial_motivation(&self) -> Motivation {
        Motivation {
            hunger: 0.5,
            curiosity: 0.3,
            risk_bias: 0.4,
        }
    }
}

/// Fixed rule: small long only when everything is calm, close on any stress.
pub struct CautiousDecider;

impl Decider for CautiousDecider {
    fn kind(&self) -> &'static str {
        "cautious"
    }

    fn decide(&self, view: &DecisionView) -> AnyResult<Action> {
        let stressed = view.signals.values().any(|v| v.abs() > 2.0);
        if stressed {
            return Ok(Action::Close);
        }
        if view.signal("pressure") > 0.5 && view.signal("noise").abs() < 1.0 {
            Ok(Action::Buy { size: 0.5 })
        } else {
            Ok(Action::Hold)
        }
    }

    fn default_parameters(&self) -> Parameters {
        Parameters::new()
    }

    fn initial_motivation(&self) -> Motivation {
        Motivation {
            hunger: 0.5,
            curiosity: 0.1,
            risk_bias: 0.2,
        }
    }

    fn supports_mutation(&self) -> bool {
        false
    }
}

// =============================================================================
// Registry and manifest
// =============================================================================

/// Decider kinds known to this build.
pub struct DeciderRegistry {
    deciders: BTreeMap<String, Arc<dyn Decider>>,
}

impl Default for DeciderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(MomentumDecider));
        registry.register(Arc::new(MeanReversionDecider));
        registry.register(Arc::new(CautiousDecider));
        registry
    }
}

impl DeciderRegistry {
    pub fn empty() -> Self {
        Self {
            deciders: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, decider: Arc<dyn Decider>) {
        self.deciders.insert(decider.kind().to_string(), decider);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.deciders.keys().cloned().collect()
    }

    pub fn get(&self, kind: &str) -> Result<Arc<dyn Decider>> {
        self.deciders
            .get(kind)
            .cloned()
            .ok_or_else(|| HiveError::config(format!("unknown agent kind '{}'", kind)))
    }
}

/// One line of the startup manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub kind: String,
    #[serde(default = "default_count")]
    pub count: usize,
    #[serde(default)]
    pub parameters: Parameters,
}

fn default_count() -> usize {
    1
}

/// Parse a manifest and check every kind against the registry.
pub fn parse_manifest(raw: &str, registry: &DeciderRegistry) -> Result<Vec<ManifestEntry>> {
    let entries: Vec<ManifestEntry> = serde_json::from_str(raw)
        .map_err(|e| HiveError::config(format!("invalid manifest: {}", e)))?;
    for entry in &entries {
        registry.get(&entry.kind)?;
    }
    Ok(entries)
}

pub fn load_manifest(path: &Path, registry: &DeciderRegistry) -> Result<Vec<ManifestEntry>> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HiveError::config(format!("cannot read manifest {}: {}", path.display(), e)))?;
    parse_manifest(&raw, registry)
}

/// Round-robin over the registered kinds when no manifest is given.
pub fn default_manifest(registry: &DeciderRegistry, size: usize) -> Vec<ManifestEntry> {
    let kinds = registry.kinds();
    if kinds.is_empty() {
        return Vec::new();
    }
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for i in 0..size {
        *counts.entry(kinds[i % kinds.len()].clone()).or_insert(0) += 1;
    }
    counts
        .into_iter()
        .map(|(kind, count)| ManifestEntry {
            kind,
            count,
            parameters: Parameters::new(),
        })
        .collect()
}

// =============================================================================
// Agent
// =============================================================================

/// Lifetime counters, independent of ledger decay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStats {
    pub wins: u64,
    pub trials: u64,
    pub failures: u64,
    pub total_reward: f64,
}

impl AgentStats {
    pub fn win_rate(&self) -> f64 {
        if self.trials == 0 {
            0.0
        } else {
            self.wins as f64 / self.trials as f64
        }
    }
}

#[derive(Clone)]
pub struct Agent {
    pub id: AgentId,
    pub kind: String,
    pub parameters: Parameters,
    pub motivation: Motivation,
    pub lineage: Option<AgentId>,
    pub birth_time: DateTime<Utc>,
    pub generation: u32,
    pub stats: AgentStats,
    decider: Arc<dyn Decider>,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("parameters", &self.parameters)
            .field("motivation", &self.motivation)
            .field("lineage", &self.lineage)
            .field("generation", &self.generation)
            .field("stats", &self.stats)
            .finish()
    }
}

/// Read-only view handed to operational tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub id: AgentId,
    pub kind: String,
    pub parameters: Parameters,
    pub motivation: Motivation,
    pub lineage: Option<AgentId>,
    pub birth_time: DateTime<Utc>,
    pub generation: u32,
    pub stats: AgentStats,
}

impl Agent {
    /// New root agent. Missing parameters take the decider's defaults.
    pub fn new(id: AgentId, decider: Arc<dyn Decider>, overrides: &Parameters) -> Self {
        let mut parameters = decider.default_parameters();
        for (k, v) in overrides {
            parameters.insert(k.clone(), *v);
        }
        Self {
            id,
            kind: decider.kind().to_string(),
            parameters,
            motivation: decider.initial_motivation(),
            lineage: None,
            birth_time: Utc::now(),
            generation: 0,
            stats: AgentStats::default(),
            decider,
        }
    }

    /// Offspring sharing this agent's decider; fresh id, stats and lineage.
    pub fn offspring(&self, id: AgentId, parameters: Parameters) -> Self {
        Self {
            id,
            kind: self.kind.clone(),
            parameters,
            motivation: self.decider.initial_motivation(),
            lineage: Some(self.id.clone()),
            birth_time: Utc::now(),
            generation: self.generation + 1,
            stats: AgentStats::default(),
            decider: Arc::clone(&self.decider),
        }
    }

    pub fn decider(&self) -> Arc<dyn Decider> {
        Arc::clone(&self.decider)
    }

    pub fn supports_mutation(&self) -> bool {
        self.decider.supports_mutation()
    }

    pub fn view(&self, context: &Context, signals: BTreeMap<String, f64>) -> DecisionView {
        DecisionView {
            context: context.clone(),
            signals,
            parameters: self.parameters.clone(),
            motivation: self.motivation,
        }
    }

    /// Fold one outcome into lifetime stats and motivation.
    pub fn absorb(&mut self, outcome: &Outcome) {
        self.stats.trials += 1;
        if outcome.action.is_none() {
            self.stats.failures += 1;
        }
        if outcome.is_win() {
            self.stats.wins += 1;
        }
        self.stats.total_reward += outcome.reward;
        self.motivation = update_motivation(self.motivation, outcome.reward);
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            id: self.id.clone(),
            kind: self.kind.clone(),
            parameters: self.parameters.clone(),
            motivation: self.motivation,
            lineage: self.lineage.clone(),
            birth_time: self.birth_time,
            generation: self.generation,
            stats: self.stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(signals: &[(&str, f64)]) -> DecisionView {
        DecisionView {
            context: Context::empty(),
            signals: signals.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            parameters: Parameters::new(),
            motivation: Motivation::default(),
        }
    }

    #[test]
    fn test_positive_reward_relaxes_hunger() {
        let start = Motivation {
            hunger: 0.5,
            curiosity: 0.5,
            risk_bias: 0.5,
        };
        let next = update_motivation(start, 1.0);
        assert!((next.hunger - 0.4).abs() < 1e-12);
        assert!((next.risk_bias - 0.55).abs() < 1e-12);
        assert_eq!(next.curiosity, 0.5);
    }

    #[test]
    fn test_non_positive_reward_raises_curiosity_and_hunger() {
        let start = Motivation {
            hunger: 0.5,
            curiosity: 0.5,
            risk_bias: 0.5,
        };
        let next = update_motivation(start, 0.0);
        assert!((next.hunger - 0.55).abs() < 1e-12);
        assert!((next.curiosity - 0.55).abs() < 1e-12);
        assert_eq!(next.risk_bias, 0.5);
    }

    #[test]
    fn test_motivation_is_clamped() {
        let mut m = Motivation::default();
        for _ in 0..100 {
            m = update_motivation(m, -1.0);
        }
        assert_eq!(m.hunger, 1.0);
        assert_eq!(m.curiosity, 1.0);
        for _ in 0..100 {
            m = update_motivation(m, 1.0);
        }
        assert_eq!(m.hunger, 0.0);
        assert_eq!(m.risk_bias, 1.0);
    }

    #[test]
    fn test_momentum_follows_pressure() {
        let d = MomentumDecider;
        assert!(matches!(d.decide(&view(&[("pressure", 1.5)])).unwrap(), Action::Buy { .. }));
        assert!(matches!(d.decide(&view(&[("pressure", -1.5)])).unwrap(), Action::Sell { .. }));
        assert_eq!(d.decide(&view(&[("pressure", 0.2)])).unwrap(), Action::Hold);
    }

    #[test]
    fn test_cautious_closes_under_stress() {
        let d = CautiousDecider;
        assert_eq!(d.decide(&view(&[("volume", 3.0)])).unwrap(), Action::Close);
        assert!(!d.supports_mutation());
    }

    #[test]
    fn test_manifest_rejects_unknown_kind() {
        let registry = DeciderRegistry::default();
        let ok = parse_manifest(r#"[{"kind":"momentum","count":2,"parameters":{"threshold":0.8}}]"#, &registry).unwrap();
        assert_eq!(ok[0].count, 2);
        let err = parse_manifest(r#"[{"kind":"oracle"}]"#, &registry).unwrap_err();
        assert!(matches!(err, HiveError::Configuration(_)));
    }

    #[test]
    fn test_default_manifest_covers_size() {
        let registry = DeciderRegistry::default();
        let manifest = default_manifest(&registry, 8);
        assert_eq!(manifest.iter().map(|e| e.count).sum::<usize>(), 8);
        assert_eq!(manifest.len(), 3);
    }

    #[test]
    fn test_absorb_counts_failures() {
        let registry = DeciderRegistry::default();
        let mut agent = Agent::new("agent-1".into(), registry.get("momentum").unwrap(), &Parameters::new());
        agent.absorb(&Outcome::failed("agent-1", Context::empty()));
        assert_eq!(agent.stats.failures, 1);
        assert_eq!(agent.stats.trials, 1);
        assert_eq!(agent.stats.wins, 0);
        assert_eq!(agent.parameters["threshold"], 1.0);
    }

    #[test]
    fn test_offspring_records_lineage() {
        let registry = DeciderRegistry::default();
        let parent = Agent::new("agent-1".into(), registry.get("cautious").unwrap(), &Parameters::new());
        let child = parent.offspring("agent-2".into(), parent.parameters.clone());
        assert_eq!(child.lineage.as_deref(), Some("agent-1"));
        assert_eq!(child.generation, 1);
        assert_eq!(child.stats.trials, 0);
    }
}
