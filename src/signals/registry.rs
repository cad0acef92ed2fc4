use std::collections::BTreeMap;

use super::generator::{AdaptiveGenerator, AnomalyRule, KindProfile, SignalSource};
use crate::config::GeneratorConfig;
use crate::error::{HiveError, Result};

/// Builds a generator of one kind: `(name, config) -> generator`.
pub type GeneratorFactory = fn(String, &GeneratorConfig) -> Box<dyn SignalSource>;

/// Generator kinds known at build time.
pub struct GeneratorRegistry {
    factories: BTreeMap<String, GeneratorFactory>,
}

fn adaptive(name: String, cfg: &GeneratorConfig, kind: &str, rule: AnomalyRule, step: f64, ceiling: f64) -> Box<dyn SignalSource> {
    let profile = KindProfile {
        kind: kind.to_string(),
        rule,
        hunger_step: step,
        growth_ceiling: ceiling,
    };
    Box::new(AdaptiveGenerator::new(name, kind, profile, cfg))
}

fn noise(name: String, cfg: &GeneratorConfig) -> Box<dyn SignalSource> {
    adaptive(name, cfg, "noise", AnomalyRule::Symmetric, 0.10, 4.0)
}

fn pressure(name: String, cfg: &GeneratorConfig) -> Box<dyn SignalSource> {
    adaptive(name, cfg, "pressure", AnomalyRule::Symmetric, 0.14, 4.2)
}

fn volume(name: String, cfg: &GeneratorConfig) -> Box<dyn SignalSource> {
    adaptive(name, cfg, "volume", AnomalyRule::MagnitudeRatio, 0.11, 5.5)
}

fn spread(name: String, cfg: &GeneratorConfig) -> Box<dyn SignalSource> {
    adaptive(name, cfg, "spread", AnomalyRule::OneSided, 0.12, 5.0)
}

impl Default for GeneratorRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register("noise", noise);
        registry.register("pressure", pressure);
        registry.register("volume", volume);
        registry.register("spread", spread);
        registry
    }
}

impl GeneratorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, kind: &str, factory: GeneratorFactory) {
        self.factories.insert(kind.to_string(), factory);
    }

    pub fn kinds(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn build(&self, kind: &str, name: String, cfg: &GeneratorConfig) -> Result<Box<dyn SignalSource>> {
        let factory = self
            .factories
            .get(kind)
            .ok_or_else(|| HiveError::config(format!("unknown generator kind '{}'", kind)))?;
        Ok(factory(name, cfg))
    }
}
