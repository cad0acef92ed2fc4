//! Bank of live generators.
//!
//! Reads fan out to blocking tasks, one per generator, each under the
//! configured timeout. A generator that times out, panics or has nothing to
//! say contributes no reading for the tick.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::generator::SignalSource;
use super::registry::GeneratorRegistry;
use super::{Observation, SignalReading};
use crate::config::GeneratorConfig;
use crate::error::Result;
use crate::logging::{self, Domain};

type SharedSource = Arc<Mutex<Box<dyn SignalSource>>>;

pub struct GeneratorBank {
    generators: Vec<SharedSource>,
    next_id: HashMap<String, u64>,
    max_per_kind: usize,
    read_timeout: Duration,
}

impl GeneratorBank {
    pub fn new(cfg: &GeneratorConfig) -> Self {
        Self {
            generators: Vec::new(),
            next_id: HashMap::new(),
            max_per_kind: cfg.max_generators_per_kind,
            read_timeout: Duration::from_millis(cfg.read_timeout_ms),
        }
    }

    /// One generator per configured kind.
    pub fn from_config(registry: &GeneratorRegistry, cfg: &GeneratorConfig) -> Result<Self> {
        let mut bank = Self::new(cfg);
        for kind in &cfg.kinds {
            let name = bank.next_name(kind);
            bank.attach(registry.build(kind, name, cfg)?);
        }
        Ok(bank)
    }

    fn next_name(&mut self, kind: &str) -> String {
        let counter = self.next_id.entry(kind.to_string()).or_insert(0);
        *counter += 1;
        format!("{}-{}", kind, counter)
    }

    pub fn attach(&mut self, source: Box<dyn SignalSource>) {
        self.next_id.entry(source.kind().to_string()).or_insert(1);
        self.generators.push(Arc::new(Mutex::new(source)));
    }

    pub fn len(&self) -> usize {
        self.generators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.generators.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.generators.iter().map(|g| g.lock().name().to_string()).collect()
    }

    fn count_kind(&self, kind: &str) -> usize {
        self.generators.iter().filter(|g| g.lock().kind() == kind).count()
    }

    /// Read every generator concurrently.
    pub async fn read_all(&self, observation: Arc<Observation>) -> Vec<SignalReading> {
        let reads = self.generators.iter().map(|source| {
            let source = Arc::clone(source);
            let observation = Arc::clone(&observation);
            let timeout = self.read_timeout;
            async move {
                let task = tokio::task::spawn_blocking(move || source.lock().read(&observation));
                match tokio::time::timeout(timeout, task).await {
                    Ok(Ok(reading)) => reading,
                    Ok(Err(join_err)) => {
                        logging::log_transient(Domain::Signal, "generator_read", &join_err.to_string());
                        None
                    }
                    Err(_) => {
                        logging::log_transient(
                            Domain::Signal,
                            "generator_read",
                            &format!("timed out after {}ms", timeout.as_millis()),
                        );
                        None
                    }
                }
            }
        });

        futures_util::future::join_all(reads).await.into_iter().flatten().collect()
    }

    /// Clone every generator whose growth signal fired, up to the per-kind
    /// cap. The parent's hunger is reset either way. Returns replica names.
    pub fn replicate_hungry(&mut self, rng: &mut StdRng) -> Vec<String> {
        let hungry: Vec<SharedSource> = self
            .generators
            .iter()
            .filter(|g| g.lock().growth_signal())
            .cloned()
            .collect();

        let mut created = Vec::new();
        for parent in hungry {
            let kind = parent.lock().kind().to_string();
            if self.count_kind(&kind) < self.max_per_kind {
                let name = self.next_name(&kind);
                let replica = {
                    let guard = parent.lock();
                    guard.replicate(name.clone(), rng)
                };
                logging::log(
                    logging::Level::Info,
                    Domain::Signal,
                    "generator_replicated",
                    logging::obj(&[
                        ("generator", logging::v_str(&name)),
                        ("parent", logging::v_str(parent.lock().name())),
                    ]),
                );
                self.generators.push(Arc::new(Mutex::new(replica)));
                created.push(name);
            }
            parent.lock().reset_hunger();
        }
        created
    }

    pub fn self_tune_all(&self) {
        for g in &self.generators {
            g.lock().self_tune();
        }
    }

    /// Mean reading per feature, so replicas never add context dimensions.
    pub fn aggregate(readings: &[SignalReading]) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for r in readings {
            let slot = sums.entry(r.feature.clone()).or_insert((0.0, 0));
            slot.0 += r.value;
            slot.1 += 1;
        }
        sums.into_iter()
            .map(|(feature, (sum, n))| (feature, sum / n as f64))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn bank_with(kinds: &[&str], window: usize, max_per_kind: usize) -> GeneratorBank {
        let cfg = GeneratorConfig {
            window,
            max_generators_per_kind: max_per_kind,
            kinds: kinds.iter().map(|k| k.to_string()).collect(),
            ..GeneratorConfig::default()
        };
        GeneratorBank::from_config(&GeneratorRegistry::default(), &cfg).unwrap()
    }

    fn obs(pairs: &[(&str, f64)]) -> Arc<Observation> {
        Arc::new(pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect())
    }

    #[tokio::test]
    async fn test_read_all_skips_missing_features() {
        let bank = bank_with(&["noise", "pressure"], 5, 2);
        let readings = bank.read_all(obs(&[("noise", 1.0)])).await;
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].feature, "noise");
    }

    #[tokio::test]
    async fn test_replication_is_capped_per_kind() {
        let mut bank = bank_with(&["noise"], 5, 2);
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..45 {
            bank.read_all(obs(&[("noise", 1.0)])).await;
        }
        let created = bank.replicate_hungry(&mut rng);
        assert_eq!(created, vec!["noise-2".to_string()]);
        assert_eq!(bank.len(), 2);

        for _ in 0..45 {
            bank.read_all(obs(&[("noise", 1.0)])).await;
        }
        assert!(bank.replicate_hungry(&mut rng).is_empty());
        assert_eq!(bank.len(), 2);
    }

    #[test]
    fn test_aggregate_averages_per_feature() {
        let reading = |name: &str, feature: &str, value: f64| SignalReading {
            name: name.to_string(),
            feature: feature.to_string(),
            value,
            anomaly: false,
            drift_hunger: 0.0,
        };
        let agg = GeneratorBank::aggregate(&[
            reading("noise-1", "noise", 1.0),
            reading("noise-2", "noise", 2.0),
            reading("spread-1", "spread", -1.0),
        ]);
        assert_eq!(agg.len(), 2);
        assert!((agg["noise"] - 1.5).abs() < 1e-12);
        assert!((agg["spread"] + 1.0).abs() < 1e-12);
    }
}
