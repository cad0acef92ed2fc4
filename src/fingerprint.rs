//! Context fingerprint: quantized, order-independent key over signal readings.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Quantized readings, sorted by name. Each value is stored as an integer
/// number of resolution steps so equality is exact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Context {
    dims: Vec<(String, i64)>,
}

impl Context {
    pub fn empty() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn dims(&self) -> &[(String, i64)] {
        &self.dims
    }

    pub fn len(&self) -> usize {
        self.dims.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dims.is_empty()
    }

    /// Quantized value of one dimension, in the original units.
    pub fn value(&self, name: &str, resolution: f64) -> Option<f64> {
        self.dims
            .binary_search_by(|(n, _)| n.as_str().cmp(name))
            .ok()
            .map(|idx| self.dims[idx].1 as f64 * resolution)
    }

    /// Same dimension names and every dimension within `epsilon`.
    pub fn within(&self, other: &Context, resolution: f64, epsilon: f64) -> bool {
        if self.dims.len() != other.dims.len() {
            return false;
        }
        // Half a step of slack absorbs float error in `steps * resolution`.
        let tolerance = epsilon + resolution * 0.5;
        self.dims
            .iter()
            .zip(other.dims.iter())
            .all(|((a_name, a), (b_name, b))| {
                a_name == b_name && (a.abs_diff(*b) as f64) * resolution < tolerance
            })
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, (name, steps)) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}={}", name, steps)?;
        }
        write!(f, ")")
    }
}

/// Quantize readings at `resolution`. Non-finite readings are dropped.
pub fn fingerprint<'a, I>(readings: I, resolution: f64) -> Context
where
    I: IntoIterator<Item = (&'a String, &'a f64)>,
{
    let mut dims: Vec<(String, i64)> = readings
        .into_iter()
        .filter(|(_, v)| v.is_finite())
        .map(|(name, v)| (name.clone(), (v / resolution).round() as i64))
        .collect();
    dims.sort();
    dims.dedup_by(|a, b| a.0 == b.0);
    Context { dims }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_order_independent() {
        let mut a = HashMap::new();
        a.insert("noise".to_string(), 0.31);
        a.insert("pressure".to_string(), -1.24);
        let mut b = BTreeMap::new();
        b.insert("pressure".to_string(), -1.24);
        b.insert("noise".to_string(), 0.31);
        assert_eq!(fingerprint(&a, 0.1), fingerprint(&b, 0.1));
    }

    #[test]
    fn test_noise_below_resolution_collapses() {
        let mut a = BTreeMap::new();
        a.insert("noise".to_string(), 0.3);
        let mut b = BTreeMap::new();
        b.insert("noise".to_string(), 0.3 + 1e-12);
        assert_eq!(fingerprint(&a, 0.1), fingerprint(&b, 0.1));
        assert_eq!(fingerprint(&a, 0.1).dims()[0].1, 3);
    }

    #[test]
    fn test_non_finite_dropped() {
        let mut a = BTreeMap::new();
        a.insert("noise".to_string(), f64::NAN);
        a.insert("volume".to_string(), 1.0);
        let ctx = fingerprint(&a, 0.1);
        assert_eq!(ctx.len(), 1);
        assert_eq!(ctx.value("volume", 0.1), Some(1.0));
    }

    #[test]
    fn test_within_tolerance() {
        let mut a = BTreeMap::new();
        a.insert("noise".to_string(), 0.3);
        let mut b = BTreeMap::new();
        b.insert("noise".to_string(), 0.5);
        let mut c = BTreeMap::new();
        c.insert("noise".to_string(), 0.6);
        let (a, b, c) = (fingerprint(&a, 0.1), fingerprint(&b, 0.1), fingerprint(&c, 0.1));
        assert!(a.within(&b, 0.1, 0.2));
        assert!(!a.within(&c, 0.1, 0.2));
        assert!(!a.within(&Context::empty(), 0.1, 0.2));
    }

    #[test]
    fn test_display() {
        let mut a = BTreeMap::new();
        a.insert("b".to_string(), 0.2);
        a.insert("a".to_string(), -0.1);
        assert_eq!(fingerprint(&a, 0.1).to_string(), "(a=-1,b=2)");
    }

    #[test]
    fn test_within_extreme_readings() {
        let mut hi = BTreeMap::new();
        hi.insert("x".to_string(), 1e300);
        let mut lo = BTreeMap::new();
        lo.insert("x".to_string(), -1e300);
        let (hi, lo) = (fingerprint(&hi, 0.1), fingerprint(&lo, 0.1));
        assert_eq!(hi.dims()[0].1, i64::MAX);
        assert_eq!(lo.dims()[0].1, i64::MIN);
        assert!(!hi.within(&lo, 0.1, 0.2));
        assert!(!lo.within(&hi, 0.1, 0.2));
        assert!(hi.within(&hi, 0.1, 0.2));
    }
}
