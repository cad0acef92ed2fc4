use crate::error::{HiveError, Result};

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub window: usize,
    pub base_level: f64,
    pub learning_rate: f64,
    pub anomaly_decrement: f64,
    /// Readings are z-scores clamped to +/- this value.
    pub value_clamp: f64,
    pub max_generators_per_kind: usize,
    pub read_timeout_ms: u64,
    /// Cycles between `self_tune` passes over the bank. 0 disables.
    pub self_tune_every: u64,
    /// Generator kinds attached at startup, one generator each.
    pub kinds: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            window: 20,
            base_level: 1.0,
            learning_rate: 0.1,
            anomaly_decrement: 0.5,
            value_clamp: 5.0,
            max_generators_per_kind: 4,
            read_timeout_ms: 200,
            self_tune_every: 50,
            kinds: vec![
                "noise".to_string(),
                "pressure".to_string(),
                "volume".to_string(),
                "spread".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub adaptivity: f64,
    pub resolution: f64,
    /// Per-dimension tolerance used by `best_for`.
    pub epsilon: f64,
    /// Candidates need strictly more (blended) trials than this.
    pub min_trials: f64,
    pub exploration_rate: f64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            adaptivity: 0.5,
            resolution: 0.1,
            epsilon: 0.2,
            min_trials: 1.0,
            exploration_rate: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PopulationConfig {
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: usize,
    pub evolve_every: u64,
    pub min_trials_for_retirement: u64,
    /// Lifetime win rate at or below which the bottom agent is retired.
    pub retire_below: f64,
    pub archive_capacity: usize,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self {
            min_size: 5,
            max_size: 20,
            initial_size: 8,
            evolve_every: 25,
            min_trials_for_retirement: 10,
            retire_below: 0.4,
            archive_capacity: 1024,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvolverConfig {
    /// Maximum relative perturbation applied to each numeric parameter.
    pub mutation_scale: f64,
    pub crossover_rate: f64,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            mutation_scale: 0.2,
            crossover_rate: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GuardianConfig {
    pub max_drawdown: f64,
    pub max_open_trades: usize,
    pub max_grid_size: usize,
    pub min_margin_level: f64,
    pub cycle_ms: u64,
    /// Fraction of a limit that counts as a near breach.
    pub near_breach_ratio: f64,
    /// Consecutive near-breach reflections before thresholds tighten.
    pub tune_after: usize,
    pub tighten_factor: f64,
    pub auto_tune: bool,
    pub drawdown_floor: f64,
    pub open_trades_floor: usize,
    pub grid_size_floor: usize,
    pub margin_ceiling: f64,
    pub reflection_capacity: usize,
    pub snapshot_path: Option<String>,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            max_drawdown: 0.2,
            max_open_trades: 20,
            max_grid_size: 7,
            min_margin_level: 0.25,
            cycle_ms: 1000,
            near_breach_ratio: 0.8,
            tune_after: 3,
            tighten_factor: 0.9,
            auto_tune: true,
            drawdown_floor: 0.05,
            open_trades_floor: 3,
            grid_size_floor: 3,
            margin_ceiling: 0.5,
            reflection_capacity: 256,
            snapshot_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub cycle_ms: u64,
    pub decide_timeout_ms: u64,
    pub resolve_timeout_ms: u64,
    pub hive_sync_every: u64,
    pub summary_every: u64,
    pub checkpoint_every: u64,
    pub seed: Option<u64>,
    pub journal_path: Option<String>,
    pub sqlite_path: Option<String>,
    pub manifest_path: Option<String>,
    /// JSONL observation file; synthetic feed when unset.
    pub feed_path: Option<String>,
    pub initial_capital: f64,
    pub cycle_budget: Option<u64>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cycle_ms: 1000,
            decide_timeout_ms: 250,
            resolve_timeout_ms: 500,
            hive_sync_every: 50,
            summary_every: 100,
            checkpoint_every: 100,
            seed: None,
            journal_path: None,
            sqlite_path: None,
            manifest_path: None,
            feed_path: None,
            initial_capital: 10_000.0,
            cycle_budget: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HiveConfig {
    pub generator: GeneratorConfig,
    pub ledger: LedgerConfig,
    pub population: PopulationConfig,
    pub evolver: EvolverConfig,
    pub guardian: GuardianConfig,
    pub runtime: RuntimeConfig,
}

impl HiveConfig {
    pub fn from_env() -> Self {
        let g = GeneratorConfig::default();
        let l = LedgerConfig::default();
        let p = PopulationConfig::default();
        let e = EvolverConfig::default();
        let gd = GuardianConfig::default();
        let r = RuntimeConfig::default();
        Self {
            generator: GeneratorConfig {
                window: env_or("GEN_WINDOW", g.window),
                base_level: env_or("GEN_BASE_LEVEL", g.base_level),
                learning_rate: env_or("GEN_LEARNING_RATE", g.learning_rate),
                anomaly_decrement: env_or("GEN_ANOMALY_DECREMENT", g.anomaly_decrement),
                value_clamp: env_or("GEN_VALUE_CLAMP", g.value_clamp),
                max_generators_per_kind: env_or("GEN_MAX_PER_KIND", g.max_generators_per_kind),
                read_timeout_ms: env_or("GEN_READ_TIMEOUT_MS", g.read_timeout_ms),
                self_tune_every: env_or("GEN_SELF_TUNE_EVERY", g.self_tune_every),
                kinds: std::env::var("GEN_KINDS")
                    .map(|v| v.split(',').map(|k| k.trim().to_string()).filter(|k| !k.is_empty()).collect())
                    .unwrap_or(g.kinds),
            },
            ledger: LedgerConfig {
                adaptivity: env_or("LEDGER_ADAPTIVITY", l.adaptivity),
                resolution: env_or("LEDGER_RESOLUTION", l.resolution),
                epsilon: env_or("LEDGER_EPSILON", l.epsilon),
                min_trials: env_or("LEDGER_MIN_TRIALS", l.min_trials),
                exploration_rate: env_or("EXPLORATION_RATE", l.exploration_rate),
            },
            population: PopulationConfig {
                min_size: env_or("POP_MIN", p.min_size),
                max_size: env_or("POP_MAX", p.max_size),
                initial_size: env_or("POP_INITIAL", p.initial_size),
                evolve_every: env_or("EVOLVE_EVERY", p.evolve_every),
                min_trials_for_retirement: env_or("RETIRE_MIN_TRIALS", p.min_trials_for_retirement),
                retire_below: env_or("RETIRE_BELOW", p.retire_below),
                archive_capacity: env_or("ARCHIVE_CAPACITY", p.archive_capacity),
            },
            evolver: EvolverConfig {
                mutation_scale: env_or("MUTATION_SCALE", e.mutation_scale),
                crossover_rate: env_or("CROSSOVER_RATE", e.crossover_rate),
            },
            guardian: GuardianConfig {
                max_drawdown: env_or("MAX_DRAWDOWN", gd.max_drawdown),
                max_open_trades: env_or("MAX_OPEN_TRADES", gd.max_open_trades),
                max_grid_size: env_or("MAX_GRID_SIZE", gd.max_grid_size),
                min_margin_level: env_or("MIN_MARGIN_LEVEL", gd.min_margin_level),
                cycle_ms: env_or("GUARDIAN_CYCLE_MS", gd.cycle_ms),
                near_breach_ratio: env_or("NEAR_BREACH_RATIO", gd.near_breach_ratio),
                tune_after: env_or("GUARDIAN_TUNE_AFTER", gd.tune_after),
                tighten_factor: env_or("GUARDIAN_TIGHTEN_FACTOR", gd.tighten_factor),
                auto_tune: env_or("GUARDIAN_AUTO_TUNE", gd.auto_tune),
                drawdown_floor: env_or("DRAWDOWN_FLOOR", gd.drawdown_floor),
                open_trades_floor: env_or("OPEN_TRADES_FLOOR", gd.open_trades_floor),
                grid_size_floor: env_or("GRID_SIZE_FLOOR", gd.grid_size_floor),
                margin_ceiling: env_or("MARGIN_CEILING", gd.margin_ceiling),
                reflection_capacity: env_or("REFLECTION_CAPACITY", gd.reflection_capacity),
                snapshot_path: std::env::var("GUARDIAN_SNAPSHOT_PATH").ok(),
            },
            runtime: RuntimeConfig {
                cycle_ms: env_or("CYCLE_MS", r.cycle_ms),
                decide_timeout_ms: env_or("DECIDE_TIMEOUT_MS", r.decide_timeout_ms),
                resolve_timeout_ms: env_or("RESOLVE_TIMEOUT_MS", r.resolve_timeout_ms),
                hive_sync_every: env_or("HIVE_SYNC_EVERY", r.hive_sync_every),
                summary_every: env_or("SUMMARY_EVERY", r.summary_every),
                checkpoint_every: env_or("CHECKPOINT_EVERY", r.checkpoint_every),
                seed: std::env::var("SEED").ok().and_then(|v| v.parse().ok()),
                journal_path: std::env::var("JOURNAL_PATH").ok(),
                sqlite_path: std::env::var("SQLITE_PATH").ok(),
                manifest_path: std::env::var("HIVE_MANIFEST").ok(),
                feed_path: std::env::var("FEED_PATH").ok(),
                initial_capital: env_or("INITIAL_CAPITAL", r.initial_capital),
                cycle_budget: std::env::var("CYCLE_BUDGET").ok().and_then(|v| v.parse().ok()),
            },
        }
    }

    /// Startup checks. Any failure here means the hive refuses to run.
    pub fn validate(&self) -> Result<()> {
        let p = &self.population;
        if p.min_size == 0 {
            return Err(HiveError::config("population min_size must be at least 1"));
        }
        if p.min_size > p.max_size {
            return Err(HiveError::config(format!(
                "population min_size {} > max_size {}",
                p.min_size, p.max_size
            )));
        }
        if p.initial_size < p.min_size || p.initial_size > p.max_size {
            return Err(HiveError::config(format!(
                "initial population {} outside [{}, {}]",
                p.initial_size, p.min_size, p.max_size
            )));
        }

        let l = &self.ledger;
        if !(l.adaptivity > 0.0 && l.adaptivity < 1.0) {
            return Err(HiveError::config(format!("adaptivity {} outside (0, 1)", l.adaptivity)));
        }
        // Blended trials approach 1 / (1 - adaptivity) and never exceed it.
        let trial_ceiling = 1.0 / (1.0 - l.adaptivity);
        if !(l.min_trials >= 0.0 && l.min_trials < trial_ceiling) {
            return Err(HiveError::config(format!(
                "min_trials {} unreachable, blended trials stay below {:.3}",
                l.min_trials, trial_ceiling
            )));
        }
        if !(0.0..=1.0).contains(&l.exploration_rate) {
            return Err(HiveError::config(format!(
                "exploration rate {} outside [0, 1]",
                l.exploration_rate
            )));
        }
        if !(l.resolution > 0.0) {
            return Err(HiveError::config("fingerprint resolution must be positive"));
        }
        if l.epsilon < 0.0 {
            return Err(HiveError::config("ledger epsilon must be non-negative"));
        }

        let g = &self.generator;
        if g.window == 0 {
            return Err(HiveError::config("generator window must be at least 1"));
        }
        if !(g.value_clamp > 0.0 && g.value_clamp.is_finite()) {
            return Err(HiveError::config(format!("value_clamp {} must be positive", g.value_clamp)));
        }
        if g.max_generators_per_kind == 0 {
            return Err(HiveError::config("max_generators_per_kind must be at least 1"));
        }

        let gd = &self.guardian;
        if gd.drawdown_floor > gd.max_drawdown {
            return Err(HiveError::config(format!(
                "drawdown floor {} looser than limit {}",
                gd.drawdown_floor, gd.max_drawdown
            )));
        }
        if gd.open_trades_floor > gd.max_open_trades {
            return Err(HiveError::config(format!(
                "open trades floor {} looser than limit {}",
                gd.open_trades_floor, gd.max_open_trades
            )));
        }
        if gd.grid_size_floor > gd.max_grid_size {
            return Err(HiveError::config(format!(
                "grid size floor {} looser than limit {}",
                gd.grid_size_floor, gd.max_grid_size
            )));
        }
        if gd.margin_ceiling < gd.min_margin_level {
            return Err(HiveError::config(format!(
                "margin ceiling {} below margin floor {}",
                gd.margin_ceiling, gd.min_margin_level
            )));
        }
        if !(gd.tighten_factor > 0.0 && gd.tighten_factor < 1.0) {
            return Err(HiveError::config("guardian tighten_factor must be in (0, 1)"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(HiveConfig::default().validate().is_ok());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut cfg = HiveConfig::default();
        cfg.population.min_size = 30;
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, HiveError::Configuration(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_initial_size_outside_bounds_rejected() {
        let mut cfg = HiveConfig::default();
        cfg.population.initial_size = 2;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_adaptivity_range() {
        let mut cfg = HiveConfig::default();
        cfg.ledger.adaptivity = 1.0;
        assert!(cfg.validate().is_err());
        cfg.ledger.adaptivity = 0.0;
        assert!(cfg.validate().is_err());
        cfg.ledger.adaptivity = 0.5;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_unreachable_min_trials_rejected() {
        let mut cfg = HiveConfig::default();
        cfg.ledger.adaptivity = 0.5;
        cfg.ledger.min_trials = 2.0;
        assert!(matches!(cfg.validate(), Err(HiveError::Configuration(_))));
        cfg.ledger.min_trials = 1.9;
        assert!(cfg.validate().is_ok());
        cfg.ledger.adaptivity = 0.9;
        cfg.ledger.min_trials = 5.0;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_value_clamp_must_be_positive() {
        for clamp in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut cfg = HiveConfig::default();
            cfg.generator.value_clamp = clamp;
            assert!(matches!(cfg.validate(), Err(HiveError::Configuration(_))), "{clamp}");
        }
    }

    #[test]
    fn test_loose_tuning_floor_rejected() {
        let mut cfg = HiveConfig::default();
        cfg.guardian.drawdown_floor = 0.5;
        assert!(cfg.validate().is_err());
    }
}
