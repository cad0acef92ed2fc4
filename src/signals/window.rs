use std::collections::VecDeque;

/// Most recent raw readings of one generator, oldest first. Statistics are
/// computed from the buffer on demand; buffers are short.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    limit: usize,
    values: VecDeque<f64>,
}

impl RollingWindow {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            values: VecDeque::with_capacity(limit),
        }
    }

    /// Append a reading. Returns the evicted oldest reading once the buffer
    /// is at its limit.
    pub fn push(&mut self, value: f64) -> Option<f64> {
        let evicted = if self.values.len() == self.limit {
            self.values.pop_front()
        } else {
            None
        };
        self.values.push_back(value);
        evicted
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population standard deviation (divides by n).
    pub fn std(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let mean = self.mean();
        let var = self.values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / self.values.len() as f64;
        var.sqrt()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_latest_readings() {
        let mut w = RollingWindow::new(5);
        let evicted: Vec<f64> = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]
            .into_iter()
            .filter_map(|v| w.push(v))
            .collect();
        assert_eq!(evicted, vec![2.0, 4.0, 4.0]);
        // 4, 5, 5, 7, 9
        assert_eq!(w.len(), 5);
        assert!((w.mean() - 6.0).abs() < 1e-9);
        // (4 + 1 + 1 + 1 + 9) / 5 = 3.2
        assert!((w.std() - 3.2_f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn test_spike_after_flat_run() {
        let mut w = RollingWindow::new(5);
        for v in [1.0, 1.0, 1.0, 1.0, 1.0, 9.0] {
            w.push(v);
        }
        assert!((w.mean() - 2.6).abs() < 1e-9);
        assert!((w.std() - 3.2).abs() < 1e-9);
    }

    #[test]
    fn test_large_reading_leaves_no_residue() {
        let mut w = RollingWindow::new(2);
        w.push(1.0e12);
        w.push(3.0);
        w.push(3.0);
        assert_eq!(w.mean(), 3.0);
        assert_eq!(w.std(), 0.0);
    }

    #[test]
    fn test_empty_and_cleared() {
        let mut w = RollingWindow::new(0);
        assert_eq!(w.mean(), 0.0);
        assert_eq!(w.std(), 0.0);
        w.push(10.0);
        assert_eq!(w.push(11.0), Some(10.0));
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.std(), 0.0);
    }
}
