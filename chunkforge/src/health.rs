//! Download health classification primitives.
//!
//! The cloud chunk source keeps a rolling success-rate window over completed
//! downloads and a running mean/stddev of download durations. The first
//! drives the coarse health tier reported to observers; the second drives
//! the abnormal-slowness watchdog that cancels stalled transfers.

/// Coarse classification of recent download health.
///
/// Ordered worst to best so that tier comparisons read naturally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DownloadHealth {
    /// All outstanding downloads are retrying and no data has arrived for
    /// longer than the disconnect threshold.
    Disconnected,
    Poor,
    Ok,
    Good,
    Excellent,
}

impl DownloadHealth {
    /// User-facing status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            DownloadHealth::Disconnected => "Disconnected",
            DownloadHealth::Poor => "Poor",
            DownloadHealth::Ok => "OK",
            DownloadHealth::Good => "Good",
            DownloadHealth::Excellent => "Excellent",
        }
    }
}

/// Rolling success-rate window over recent download results.
#[derive(Debug)]
pub struct SuccessRate {
    window: std::collections::VecDeque<bool>,
    capacity: usize,
}

impl SuccessRate {
    /// A window of `capacity` most recent results. Starts empty; an empty
    /// window reports a rate of 1.0 (no evidence of trouble).
    pub fn new(capacity: usize) -> Self {
        Self {
            window: std::collections::VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Record one completed download result.
    pub fn record(&mut self, success: bool) {
        if self.window.len() == self.capacity {
            self.window.pop_front();
        }
        self.window.push_back(success);
    }

    /// Fraction of successes in the window, in `[0.0, 1.0]`.
    pub fn rate(&self) -> f64 {
        if self.window.is_empty() {
            return 1.0;
        }
        let successes = self.window.iter().filter(|&&s| s).count();
        successes as f64 / self.window.len() as f64
    }

    /// Number of recorded results currently in the window.
    pub fn sample_count(&self) -> usize {
        self.window.len()
    }
}

/// Minimum completed samples before the mean/stddev is considered reliable
/// enough to cancel in-flight downloads.
pub const MEAN_STDDEV_RELIABLE_SAMPLES: u64 = 10;

/// Running mean and standard deviation (Welford) of download durations.
#[derive(Debug, Default)]
pub struct MeanStdDev {
    count: u64,
    mean: f64,
    m2: f64,
}

impl MeanStdDev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one completed-download duration in seconds.
    pub fn push(&mut self, sample: f64) {
        self.count += 1;
        let delta = sample - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (sample - self.mean);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Population standard deviation; 0.0 until two samples exist.
    pub fn std_dev(&self) -> f64 {
        if self.count < 2 {
            return 0.0;
        }
        (self.m2 / self.count as f64).sqrt()
    }

    /// Whether enough samples have accumulated to act on the statistics.
    pub fn is_reliable(&self) -> bool {
        self.count >= MEAN_STDDEV_RELIABLE_SAMPLES
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_ordering() {
        assert!(DownloadHealth::Disconnected < DownloadHealth::Poor);
        assert!(DownloadHealth::Poor < DownloadHealth::Ok);
        assert!(DownloadHealth::Ok < DownloadHealth::Good);
        assert!(DownloadHealth::Good < DownloadHealth::Excellent);
    }

    #[test]
    fn test_health_as_str() {
        assert_eq!(DownloadHealth::Excellent.as_str(), "Excellent");
        assert_eq!(DownloadHealth::Disconnected.as_str(), "Disconnected");
    }

    #[test]
    fn test_success_rate_empty_is_perfect() {
        let rate = SuccessRate::new(16);
        assert_eq!(rate.rate(), 1.0);
        assert_eq!(rate.sample_count(), 0);
    }

    #[test]
    fn test_success_rate_mixed() {
        let mut rate = SuccessRate::new(16);
        rate.record(true);
        rate.record(true);
        rate.record(false);
        rate.record(true);
        assert!((rate.rate() - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_success_rate_window_evicts_oldest() {
        let mut rate = SuccessRate::new(2);
        rate.record(false);
        rate.record(true);
        rate.record(true);
        // The initial failure fell out of the window.
        assert_eq!(rate.rate(), 1.0);
        assert_eq!(rate.sample_count(), 2);
    }

    #[test]
    fn test_mean_stddev_constant_samples() {
        let mut stats = MeanStdDev::new();
        for _ in 0..20 {
            stats.push(2.0);
        }
        assert!((stats.mean() - 2.0).abs() < 1e-9);
        assert!(stats.std_dev().abs() < 1e-9);
        assert!(stats.is_reliable());
    }

    #[test]
    fn test_mean_stddev_known_spread() {
        let mut stats = MeanStdDev::new();
        for sample in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0] {
            stats.push(sample);
        }
        assert!((stats.mean() - 5.0).abs() < 1e-9);
        assert!((stats.std_dev() - 2.0).abs() < 1e-9);
        assert!(!stats.is_reliable());
    }

    #[test]
    fn test_mean_stddev_reliability_threshold() {
        let mut stats = MeanStdDev::new();
        for _ in 0..MEAN_STDDEV_RELIABLE_SAMPLES - 1 {
            stats.push(1.0);
        }
        assert!(!stats.is_reliable());
        stats.push(1.0);
        assert!(stats.is_reliable());
    }
}
