//! Adaptive anomaly generator.
//!
//! Each read appends the raw value, recomputes buffer statistics and compares
//! the value against an adaptive threshold:
//!
//! ```text
//! threshold = base_level + learning_rate * (std + drift_hunger)
//! ```
//!
//! `drift_hunger` climbs while the signal stays quiet and falls on anomaly,
//! so a quiet generator slowly loosens until it either fires or asks to be
//! replicated (`growth_signal`).

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use super::window::RollingWindow;
use super::{Observation, SignalReading};
use crate::config::GeneratorConfig;
use crate::logging;

/// Per-kind anomaly rule. The threshold formula is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyRule {
    /// |x - mean| > threshold
    Symmetric,
    /// x - mean > threshold
    OneSided,
    /// x > 2 * threshold or x < 0.5 * threshold
    MagnitudeRatio,
}

impl AnomalyRule {
    pub fn is_anomaly(&self, value: f64, mean: f64, threshold: f64) -> bool {
        match self {
            AnomalyRule::Symmetric => (value - mean).abs() > threshold,
            AnomalyRule::OneSided => value - mean > threshold,
            AnomalyRule::MagnitudeRatio => value > 2.0 * threshold || value < 0.5 * threshold,
        }
    }
}

/// Fixed behavior of a generator kind.
#[derive(Debug, Clone, PartialEq)]
pub struct KindProfile {
    pub kind: String,
    pub rule: AnomalyRule,
    /// Hunger gained per quiet read.
    pub hunger_step: f64,
    pub growth_ceiling: f64,
}

/// Capability every generator kind implements.
pub trait SignalSource: Send {
    fn name(&self) -> &str;
    fn kind(&self) -> &str;
    fn feature(&self) -> &str;
    /// `None` when the observation lacks a usable value for this feature.
    fn read(&mut self, observation: &Observation) -> Option<SignalReading>;
    fn drift_hunger(&self) -> f64;
    fn growth_signal(&self) -> bool;
    fn reset_hunger(&mut self);
    fn self_tune(&mut self);
    /// Independent copy with perturbed base level and an empty buffer.
    fn replicate(&self, name: String, rng: &mut StdRng) -> Box<dyn SignalSource>;
}

const BASE_LEVEL_MIN: f64 = 0.001;
const BASE_LEVEL_MAX: f64 = 1000.0;

#[derive(Debug, Clone)]
pub struct AdaptiveGenerator {
    name: String,
    feature: String,
    profile: KindProfile,
    base_level: f64,
    learning_rate: f64,
    decrement: f64,
    value_clamp: f64,
    window: RollingWindow,
    drift_hunger: f64,
    reads: u64,
    anomalies: u64,
}

impl AdaptiveGenerator {
    pub fn new(name: impl Into<String>, feature: impl Into<String>, profile: KindProfile, cfg: &GeneratorConfig) -> Self {
        Self {
            name: name.into(),
            feature: feature.into(),
            profile,
            base_level: cfg.base_level.clamp(BASE_LEVEL_MIN, BASE_LEVEL_MAX),
            learning_rate: cfg.learning_rate,
            decrement: cfg.anomaly_decrement,
            value_clamp: cfg.value_clamp,
            window: RollingWindow::new(cfg.window),
            drift_hunger: 0.0,
            reads: 0,
            anomalies: 0,
        }
    }

    pub fn base_level(&self) -> f64 {
        self.base_level
    }

    pub fn threshold(&self) -> f64 {
        self.base_level + self.learning_rate * (self.window.std() + self.drift_hunger)
    }

    pub fn buffered(&self) -> usize {
        self.window.len()
    }

    pub fn anomaly_count(&self) -> u64 {
        self.anomalies
    }

    pub fn read_count(&self) -> u64 {
        self.reads
    }

    /// Core update; exposed for callers that already hold the raw value.
    pub fn observe(&mut self, raw: f64) -> Option<SignalReading> {
        if !raw.is_finite() {
            return None;
        }

        self.window.push(raw);
        let mean = self.window.mean();
        let std = self.window.std();
        let threshold = self.threshold();
        let anomaly = self.profile.rule.is_anomaly(raw, mean, threshold);

        if anomaly {
            self.drift_hunger = (self.drift_hunger - self.decrement).max(0.0);
            self.anomalies += 1;
        } else {
            self.drift_hunger += self.profile.hunger_step;
        }
        self.reads += 1;

        let value = if std > f64::EPSILON {
            ((raw - mean) / std).clamp(-self.value_clamp, self.value_clamp)
        } else {
            0.0
        };

        logging::log_reading(&self.name, value, anomaly, self.drift_hunger, threshold);

        Some(SignalReading {
            name: self.name.clone(),
            feature: self.feature.clone(),
            value,
            anomaly,
            drift_hunger: self.drift_hunger,
        })
    }
}

impl SignalSource for AdaptiveGenerator {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        &self.profile.kind
    }

    fn feature(&self) -> &str {
        &self.feature
    }

    fn read(&mut self, observation: &Observation) -> Option<SignalReading> {
        let raw = observation.get(&self.feature).copied()?;
        self.observe(raw)
    }

    fn drift_hunger(&self) -> f64 {
        self.drift_hunger
    }

    fn growth_signal(&self) -> bool {
        self.drift_hunger > self.profile.growth_ceiling
    }

    fn reset_hunger(&mut self) {
        self.drift_hunger = 0.0;
    }

    fn self_tune(&mut self) {
        let old = self.base_level;
        if self.drift_hunger > 6.0 {
            self.base_level *= 0.95;
        } else if self.drift_hunger < 1.0 {
            self.base_level *= 1.03;
        }
        self.base_level = self.base_level.clamp(BASE_LEVEL_MIN, BASE_LEVEL_MAX);
        if (self.base_level - old).abs() > f64::EPSILON {
            logging::log(
                logging::Level::Debug,
                logging::Domain::Signal,
                "self_tune",
                logging::obj(&[
                    ("generator", logging::v_str(&self.name)),
                    ("old", logging::v_num(old)),
                    ("new", logging::v_num(self.base_level)),
                ]),
            );
        }
    }

    fn replicate(&self, name: String, rng: &mut StdRng) -> Box<dyn SignalSource> {
        let factor: f64 = rng.gen_range(0.8..=1.2);
        let mut copy = self.clone();
        copy.name = name;
        copy.base_level = (self.base_level * factor).clamp(BASE_LEVEL_MIN, BASE_LEVEL_MAX);
        copy.window.clear();
        copy.drift_hunger = 0.0;
        copy.reads = 0;
        copy.anomalies = 0;
        Box::new(copy)
    }
}
