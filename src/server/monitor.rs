//! Server monitoring and status display

use colored::*;
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Time without traffic before the status line shows the server as idle.
const IDLE_THRESHOLD: Duration = Duration::from_millis(150);

#[derive(Debug, Default)]
struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
    responses: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

/// Tracks server activity with lock-free counters.
///
/// Handlers bump counters through [`ServerCounters`]; an optional
/// background thread redraws a status line on stderr.
pub struct ServerMonitor {
    counters: Arc<Counters>,
    start_time: Instant,
}

impl Default for ServerMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMonitor {
    pub fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            start_time: Instant::now(),
        }
    }

    /// Handle for updating counters from connection handlers.
    pub fn counters(&self) -> ServerCounters {
        ServerCounters {
            inner: Arc::clone(&self.counters),
        }
    }

    /// Spawns the status line thread. It sleeps between redraws, so the
    /// handlers only ever pay for relaxed atomic increments.
    pub fn start_display(&self, update_interval: Duration) {
        let counters = Arc::clone(&self.counters);
        let spawned = thread::Builder::new()
            .name("status".into())
            .spawn(move || {
                let mut last_requests = 0u64;
                let mut last_activity = Instant::now();
                loop {
                    thread::sleep(update_interval);
                    let snapshot = Snapshot::load(&counters);
                    let now = Instant::now();
                    if snapshot.requests != last_requests {
                        last_activity = now;
                    }
                    let idle = now.duration_since(last_activity) >= IDLE_THRESHOLD;
                    Self::display_status_line(&snapshot, idle);
                    last_requests = snapshot.requests;
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "Failed to start status display");
        }
    }

    fn display_status_line(snapshot: &Snapshot, idle: bool) {
        let indicator = if idle {
            "░ IDLE  ".normal()
        } else {
            "█ ACTIVE".red().bold()
        };
        eprint!(
            "\r{} Connections: {} | Requests: {} | Responses: {} | Dropped: {} | Errors: {}",
            indicator,
            snapshot.connections,
            snapshot.requests,
            snapshot.responses,
            snapshot.dropped,
            snapshot.errors
        );
        std::io::stderr().flush().ok();
    }

    /// Get final statistics.
    pub fn stats(&self) -> ServerStats {
        let snapshot = Snapshot::load(&self.counters);
        ServerStats {
            connections: snapshot.connections,
            requests: snapshot.requests,
            responses: snapshot.responses,
            dropped: snapshot.dropped,
            errors: snapshot.errors,
            elapsed: self.start_time.elapsed(),
        }
    }

    pub fn log_summary(&self) {
        let stats = self.stats();
        info!(
            connections = stats.connections,
            requests = stats.requests,
            responses = stats.responses,
            dropped = stats.dropped,
            errors = stats.errors,
            elapsed_secs = stats.elapsed.as_secs_f64(),
            "Server statistics"
        );
    }
}

struct Snapshot {
    connections: u64,
    requests: u64,
    responses: u64,
    dropped: u64,
    errors: u64,
}

impl Snapshot {
    fn load(counters: &Counters) -> Self {
        Self {
            connections: counters.connections.load(Ordering::Relaxed),
            requests: counters.requests.load(Ordering::Relaxed),
            responses: counters.responses.load(Ordering::Relaxed),
            dropped: counters.dropped.load(Ordering::Relaxed),
            errors: counters.errors.load(Ordering::Relaxed),
        }
    }
}

/// Cloneable handle onto the monitor's counters.
#[derive(Debug, Clone)]
pub struct ServerCounters {
    inner: Arc<Counters>,
}

impl ServerCounters {
    #[inline]
    pub fn increment_connections(&self) {
        self.inner.connections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_requests(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_responses(&self) {
        self.inner.responses.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_dropped(&self) {
        self.inner.dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn increment_errors(&self) {
        self.inner.errors.fetch_add(1, Ordering::Relaxed);
    }
}

/// Final server statistics.
#[derive(Debug, Clone, Copy)]
pub struct ServerStats {
    pub connections: u64,
    pub requests: u64,
    pub responses: u64,
    pub dropped: u64,
    pub errors: u64,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let monitor = ServerMonitor::new();
        let counters = monitor.counters();

        counters.increment_connections();
        counters.increment_requests();
        counters.increment_requests();
        counters.increment_responses();
        counters.increment_dropped();
        counters.increment_errors();

        let stats = monitor.stats();
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.requests, 2);
        assert_eq!(stats.responses, 1);
        assert_eq!(stats.dropped, 1);
        assert_eq!(stats.errors, 1);
    }

    #[test]
    fn test_counters_shared_across_threads() {
        let monitor = ServerMonitor::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counters = monitor.counters();
                thread::spawn(move || {
                    for _ in 0..1_000 {
                        counters.increment_requests();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(monitor.stats().requests, 4_000);
    }
}
