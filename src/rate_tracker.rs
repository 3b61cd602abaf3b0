use crate::CrawlError;
use std::collections::VecDeque;

pub const DEFAULT_WINDOW: usize = 20;

/// Rolling window of the most recent samples of a noisy signal.
///
/// A zero sample is only recorded once the window already holds data, so
/// the idle stretch before the first real measurement never counts as a
/// zero-throughput period.
#[derive(Debug, Clone)]
pub struct RateTracker {
    samples: VecDeque<f64>,
    limit: usize,
}

impl Default for RateTracker {
    fn default() -> Self {
        Self {
            samples: VecDeque::with_capacity(DEFAULT_WINDOW),
            limit: DEFAULT_WINDOW,
        }
    }
}

impl RateTracker {
    pub fn new(limit: usize) -> Result<Self, CrawlError> {
        if limit == 0 {
            return Err(CrawlError::Config("rate window must hold at least one sample".into()));
        }
        Ok(Self {
            samples: VecDeque::with_capacity(limit),
            limit,
        })
    }

    pub fn add(&mut self, sample: f64) {
        if sample == 0.0 && self.samples.is_empty() {
            return;
        }
        if self.samples.len() >= self.limit {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    /// High median: for an even count, the larger of the two middle values.
    pub fn median(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let mut sorted: Vec<f64> = self.samples.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        Some(sorted[sorted.len() / 2])
    }

    /// Sample standard deviation. Needs at least two samples.
    pub fn stdev(&self) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let mean = self.mean()?;
        let sum_sq: f64 = self.samples.iter().map(|s| (s - mean).powi(2)).sum();
        Some((sum_sq / (self.samples.len() - 1) as f64).sqrt())
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_has_no_statistics() {
        let tracker = RateTracker::default();
        assert_eq!(tracker.mean(), None);
        assert_eq!(tracker.median(), None);
        assert_eq!(tracker.stdev(), None);
    }

    #[test]
    fn test_leading_zero_is_ignored() {
        let mut tracker = RateTracker::default();
        tracker.add(0.0);
        tracker.add(0.0);
        assert!(tracker.is_empty(), "startup zeros must not seed the window");
        assert_eq!(tracker.mean(), None);
    }

    #[test]
    fn test_zero_after_data_is_recorded() {
        let mut tracker = RateTracker::default();
        tracker.add(4.0);
        tracker.add(0.0);
        assert_eq!(tracker.len(), 2);
        assert_eq!(tracker.mean(), Some(2.0));
    }

    #[test]
    fn test_window_evicts_oldest() {
        let mut tracker = RateTracker::new(3).unwrap();
        for sample in [1.0, 2.0, 3.0, 4.0] {
            tracker.add(sample);
        }
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.mean(), Some(3.0));
    }

    #[test]
    fn test_zero_window_is_rejected() {
        assert!(matches!(RateTracker::new(0), Err(CrawlError::Config(_))));
        assert_eq!(RateTracker::new(1).unwrap().capacity(), 1);
    }

    #[test]
    fn test_median_is_high_median() {
        let mut tracker = RateTracker::default();
        for sample in [5.0, 1.0, 3.0, 2.0] {
            tracker.add(sample);
        }
        assert_eq!(tracker.median(), Some(3.0));
    }

    #[test]
    fn test_stdev_matches_sample_definition() {
        let mut tracker = RateTracker::default();
        for sample in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            tracker.add(sample);
        }
        let stdev = tracker.stdev().unwrap();
        assert!((stdev - 2.138089935).abs() < 1e-6, "got {}", stdev);

        let mut single = RateTracker::default();
        single.add(1.0);
        assert_eq!(single.stdev(), None);
    }
}
