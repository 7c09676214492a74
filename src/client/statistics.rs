use crate::client::constants::*;
use crate::error::{ProbeError, Result};
use hdrhistogram::Histogram;
use tracing::{debug, warn};

/// Streaming round-trip statistics backed by an HDR histogram, in microseconds.
#[derive(Debug, Clone)]
pub struct Statistics {
    hist: Histogram<u64>,
    real_min: u64,
    real_max: u64,
    clamped_count: u64,
}

impl Statistics {
    pub fn new() -> Result<Self> {
        let hist = Histogram::<u64>::new_with_bounds(
            HISTOGRAM_LOW_BOUND_US,
            HISTOGRAM_HIGH_BOUND_US,
            HISTOGRAM_SIGNIFICANT_DIGITS,
        )
        .map_err(|e| ProbeError::Measurement(format!("Failed to create histogram: {}", e)))?;

        Ok(Self {
            hist,
            real_min: u64::MAX,
            real_max: 0,
            clamped_count: 0,
        })
    }

    /// Builds statistics from a batch of round trips.
    pub fn from_samples(samples: &[u64]) -> Result<Self> {
        debug!(sample_count = samples.len(), "Creating statistics from samples");
        let mut stats = Self::new()?;
        for &sample in samples {
            stats.record(sample)?;
        }
        Ok(stats)
    }

    pub fn record(&mut self, round_trip_us: u64) -> Result<()> {
        self.real_min = self.real_min.min(round_trip_us);
        self.real_max = self.real_max.max(round_trip_us);

        let clamped = round_trip_us.clamp(HISTOGRAM_LOW_BOUND_US, HISTOGRAM_HIGH_BOUND_US);
        if clamped != round_trip_us {
            self.clamped_count += 1;
            if self.clamped_count == 1 {
                warn!(
                    round_trip_us,
                    "Round trip outside histogram bounds, clamping"
                );
            }
        }

        self.hist.record(clamped).map_err(|e| {
            warn!(round_trip_us, error = %e, "Failed to record round trip");
            ProbeError::Measurement(format!("Failed to record round trip: {}", e))
        })
    }

    /// Get the mean round trip
    pub fn mean(&self) -> f64 {
        self.hist.mean()
    }

    /// Get the minimum round trip (unclamped)
    pub fn min(&self) -> u64 {
        if self.real_min == u64::MAX {
            0
        } else {
            self.real_min
        }
    }

    /// Get the maximum round trip (unclamped)
    pub fn max(&self) -> u64 {
        self.real_max
    }

    /// Get a percentile value
    pub fn percentile(&self, quantile: f64) -> u64 {
        self.hist.value_at_quantile(quantile)
    }

    /// Samples in `[low, high)`, at histogram resolution.
    pub fn count_in(&self, low: u64, high: u64) -> u64 {
        if high <= low {
            return 0;
        }
        self.hist.count_between(low, high - 1)
    }

    /// Get the number of values that were clamped
    pub fn clamped_count(&self) -> u64 {
        self.clamped_count
    }

    /// Get the total count of samples
    pub fn count(&self) -> u64 {
        self.hist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistics_calculation() -> Result<()> {
        let stats = Statistics::from_samples(&[10, 20, 30, 40, 50])?;

        assert_eq!(stats.min(), 10);
        assert_eq!(stats.max(), 50);
        assert!((stats.mean() - 30.0).abs() < 1.0);
        assert_eq!(stats.count(), 5);
        assert_eq!(stats.percentile(0.5), 30);
        Ok(())
    }

    #[test]
    fn test_empty_statistics() -> Result<()> {
        let stats = Statistics::new()?;
        assert_eq!(stats.count(), 0);
        assert_eq!(stats.min(), 0);
        assert_eq!(stats.max(), 0);
        Ok(())
    }

    #[test]
    fn test_zero_round_trip_is_clamped() -> Result<()> {
        let mut stats = Statistics::new()?;
        stats.record(0)?;
        stats.record(5)?;
        assert_eq!(stats.clamped_count(), 1);
        assert_eq!(stats.min(), 0);
        assert_eq!(stats.count(), 2);
        Ok(())
    }

    #[test]
    fn test_count_in_range() -> Result<()> {
        let stats = Statistics::from_samples(&[5, 15, 25, 25, 150])?;
        assert_eq!(stats.count_in(0, 20), 2);
        assert_eq!(stats.count_in(20, 40), 2);
        assert_eq!(stats.count_in(100, 200), 1);
        assert_eq!(stats.count_in(40, 40), 0);
        Ok(())
    }
}
