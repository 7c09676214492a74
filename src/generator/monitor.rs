//! Per-worker throughput counters and the monitor that polls them

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Counters owned by one worker. Only that worker writes them; the monitor
/// reads them without coordination, so totals are approximate while the
/// run is in progress.
#[derive(Debug, Default)]
pub struct WorkerStats {
    requests: AtomicU64,
    response_bytes: AtomicU64,
}

impl WorkerStats {
    #[inline]
    pub fn add_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_response_bytes(&self, bytes: usize) {
        self.response_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Totals {
        Totals {
            requests: self.requests.load(Ordering::Relaxed),
            response_bytes: self.response_bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub requests: u64,
    pub response_bytes: u64,
}

impl std::ops::Add for Totals {
    type Output = Totals;

    fn add(self, other: Totals) -> Totals {
        Totals {
            requests: self.requests + other.requests,
            response_bytes: self.response_bytes + other.response_bytes,
        }
    }
}

/// Rates over one sampling window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub requests_per_sec: f64,
    pub megabytes_per_sec: f64,
}

impl Throughput {
    pub fn between(previous: Totals, current: Totals, elapsed: Duration) -> Self {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return Self {
                requests_per_sec: 0.0,
                megabytes_per_sec: 0.0,
            };
        }
        let requests = current.requests.saturating_sub(previous.requests) as f64;
        let bytes = current.response_bytes.saturating_sub(previous.response_bytes) as f64;
        Self {
            requests_per_sec: requests / secs,
            megabytes_per_sec: bytes / BYTES_PER_MB / secs,
        }
    }
}

/// Sums every worker's counters and turns consecutive samples into rates.
pub struct GeneratorMonitor {
    workers: Vec<Arc<WorkerStats>>,
    last: Totals,
    last_sample: Instant,
}

impl GeneratorMonitor {
    pub fn new(workers: Vec<Arc<WorkerStats>>) -> Self {
        Self {
            workers,
            last: Totals::default(),
            last_sample: Instant::now(),
        }
    }

    pub fn totals(&self) -> Totals {
        self.workers
            .iter()
            .map(|w| w.snapshot())
            .fold(Totals::default(), |acc, t| acc + t)
    }

    /// Time since the previous sample (or since creation).
    pub fn since_last_sample(&self) -> Duration {
        self.last_sample.elapsed()
    }

    /// Rates since the previous sample.
    pub fn sample(&mut self) -> Throughput {
        let now = Instant::now();
        let current = self.totals();
        let throughput = Throughput::between(self.last, current, now - self.last_sample);
        self.last = current;
        self.last_sample = now;
        throughput
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_totals_sum_workers() {
        let workers: Vec<_> = (0..3).map(|_| Arc::new(WorkerStats::default())).collect();
        workers[0].add_request();
        workers[1].add_request();
        workers[1].add_response_bytes(100);
        workers[2].add_response_bytes(24);

        let monitor = GeneratorMonitor::new(workers);
        assert_eq!(
            monitor.totals(),
            Totals {
                requests: 2,
                response_bytes: 124
            }
        );
    }

    #[test]
    fn test_throughput_rates() {
        let previous = Totals {
            requests: 100,
            response_bytes: 0,
        };
        let current = Totals {
            requests: 300,
            response_bytes: 2 * 1024 * 1024,
        };
        let rate = Throughput::between(previous, current, Duration::from_secs(2));
        assert_eq!(rate.requests_per_sec, 100.0);
        assert_eq!(rate.megabytes_per_sec, 1.0);
    }

    #[test]
    fn test_zero_window() {
        let rate = Throughput::between(Totals::default(), Totals::default(), Duration::ZERO);
        assert_eq!(rate.requests_per_sec, 0.0);
    }

    #[test]
    fn test_sample_resets_window() {
        let worker = Arc::new(WorkerStats::default());
        let mut monitor = GeneratorMonitor::new(vec![Arc::clone(&worker)]);
        worker.add_request();
        monitor.sample();
        // Nothing new since the previous sample.
        assert_eq!(monitor.sample().requests_per_sec, 0.0);
    }
}
