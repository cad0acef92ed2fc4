//! Signal generators: bounded, normalized feature readings with adaptive
//! anomaly thresholds.

pub mod bank;
pub mod generator;
pub mod registry;
pub mod window;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use bank::GeneratorBank;
pub use generator::{AdaptiveGenerator, AnomalyRule, KindProfile, SignalSource};
pub use registry::GeneratorRegistry;
pub use window::RollingWindow;

/// One raw observation tick: feature name to raw value.
pub type Observation = HashMap<String, f64>;

/// Reading emitted once per tick by a generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalReading {
    pub name: String,
    /// Observation key the generator reads from.
    pub feature: String,
    pub value: f64,
    pub anomaly: bool,
    pub drift_hunger: f64,
}
