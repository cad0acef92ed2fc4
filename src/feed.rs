//! Observation sources.

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};

use crate::error::Result;
use crate::logging::{self, Domain};
use crate::signals::Observation;

#[async_trait]
pub trait ObservationSource: Send {
    /// `None` when nothing usable arrived this tick.
    async fn next_observation(&mut self) -> Option<Observation>;

    /// True once the source can never produce again.
    fn is_exhausted(&self) -> bool {
        false
    }
}

/// Random-walk market with occasional volatility bursts.
///
/// Emits `price`, `noise` (absolute return, bps), `pressure` (signed return
/// momentum, bps), `volume` (relative volume) and `spread` (bps).
pub struct SyntheticFeed {
    rng: StdRng,
    price: f64,
    momentum: f64,
    burst: u32,
}

impl SyntheticFeed {
    pub fn new(seed: u64, start_price: f64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            price: start_price,
            momentum: 0.0,
            burst: 0,
        }
    }

    pub fn tick(&mut self) -> Observation {
        if self.burst == 0 && self.rng.gen_bool(0.02) {
            self.burst = self.rng.gen_range(5..20);
        }
        let vol = if self.burst > 0 {
            self.burst -= 1;
            0.004
        } else {
            0.001
        };
        // Sum of uniforms is close enough to a normal draw here.
        let shock: f64 = (0..4).map(|_| self.rng.gen_range(-1.0..1.0)).sum::<f64>() * vol;
        let ret = 0.3 * self.momentum + shock;
        self.momentum = ret;
        self.price = (self.price * (1.0 + ret)).max(0.01);

        let volume = (1.0 + ret.abs() / vol * 0.5) * self.rng.gen_range(0.7..1.3);
        let spread = 1.0 + vol * 1000.0 * self.rng.gen_range(0.5..1.5);

        let mut obs = Observation::new();
        obs.insert("price".to_string(), self.price);
        obs.insert("noise".to_string(), ret.abs() * 10_000.0);
        obs.insert("pressure".to_string(), ret * 10_000.0);
        obs.insert("volume".to_string(), volume);
        obs.insert("spread".to_string(), spread);
        obs
    }
}

#[async_trait]
impl ObservationSource for SyntheticFeed {
    async fn next_observation(&mut self) -> Option<Observation> {
        Some(self.tick())
    }
}

/// Replays one JSON object of numbers per line.
pub struct JsonlFeed {
    lines: Lines<BufReader<File>>,
    exhausted: bool,
}

impl JsonlFeed {
    pub fn open(path: &str) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            lines: BufReader::new(file).lines(),
            exhausted: false,
        })
    }

    fn parse(line: &str) -> Option<Observation> {
        let value: serde_json::Value = serde_json::from_str(line).ok()?;
        let map = value.as_object()?;
        Some(
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect(),
        )
    }
}

#[async_trait]
impl ObservationSource for JsonlFeed {
    async fn next_observation(&mut self) -> Option<Observation> {
        match self.lines.next() {
            Some(Ok(line)) => {
                let parsed = Self::parse(&line);
                if parsed.is_none() {
                    logging::log_transient(Domain::Signal, "feed_line", "malformed observation");
                }
                parsed
            }
            Some(Err(err)) => {
                logging::log_transient(Domain::Signal, "feed_line", &err.to_string());
                None
            }
            None => {
                self.exhausted = true;
                None
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_synthetic_is_deterministic() {
        let mut a = SyntheticFeed::new(42, 100.0);
        let mut b = SyntheticFeed::new(42, 100.0);
        for _ in 0..20 {
            assert_eq!(a.next_observation().await, b.next_observation().await);
        }
        let obs = a.tick();
        for key in ["price", "noise", "pressure", "volume", "spread"] {
            assert!(obs[key].is_finite());
        }
    }

    #[tokio::test]
    async fn test_jsonl_skips_malformed_and_ends() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"price": 101.5, "noise": 3.0, "label": "x"}}"#).unwrap();
        writeln!(file, "garbage").unwrap();
        file.flush().unwrap();

        let mut feed = JsonlFeed::open(file.path().to_str().unwrap()).unwrap();
        let first = feed.next_observation().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first["price"], 101.5);
        assert!(feed.next_observation().await.is_none());
        assert!(!feed.is_exhausted());
        assert!(feed.next_observation().await.is_none());
        assert!(feed.is_exhausted());
    }
}
