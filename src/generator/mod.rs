//! Multi-worker traffic generator.
//!
//! Worker threads each drive one connection and bump their own counters;
//! the calling thread polls those counters to print throughput while it
//! waits for the workers to finish.

pub mod config;
pub mod monitor;
pub mod template;
pub mod worker;

pub use config::{GeneratorConfig, GeneratorSettings};
pub use monitor::{GeneratorMonitor, Throughput, Totals, WorkerStats};
pub use template::RequestTemplate;
pub use worker::{run_worker, WorkerOutcome};

use crate::clock::now_micros;
use crate::error::{ProbeError, Result};
use std::io::Write;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Outcome of a whole generator run.
#[derive(Debug, Clone)]
pub struct GeneratorReport {
    pub totals: Totals,
    pub finished: usize,
    pub peer_closed: usize,
    pub failed: usize,
    pub elapsed: Duration,
}

impl GeneratorReport {
    pub fn throughput(&self) -> Throughput {
        Throughput::between(Totals::default(), self.totals, self.elapsed)
    }
}

/// Runs every worker to completion, writing a throughput line to `out` each
/// print interval.
pub fn run_generator<W: Write>(settings: &GeneratorSettings, out: &mut W) -> Result<GeneratorReport> {
    let started = Instant::now();
    let cells: Vec<Arc<WorkerStats>> = (0..settings.workers)
        .map(|_| Arc::new(WorkerStats::default()))
        .collect();
    let mut monitor = GeneratorMonitor::new(cells.clone());
    info!(
        host = %settings.host,
        port = settings.port,
        workers = settings.workers,
        requests = ?settings.requests,
        delay_us = settings.delay_us,
        "Starting traffic generator"
    );

    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::with_capacity(settings.workers);
    for (id, stats) in cells.into_iter().enumerate() {
        let tx = tx.clone();
        let settings = settings.clone();
        let handle = thread::Builder::new()
            .name(format!("worker-{}", id))
            .spawn(move || {
                let result = run_worker(id, &settings, stats);
                let _ = tx.send((id, result));
            })?;
        handles.push(handle);
    }
    drop(tx);

    let mut report = GeneratorReport {
        totals: Totals::default(),
        finished: 0,
        peer_closed: 0,
        failed: 0,
        elapsed: Duration::ZERO,
    };
    let mut reported = 0;
    while reported < settings.workers {
        let received = match settings.print_interval {
            Some(interval) => rx.recv_timeout(interval.saturating_sub(monitor.since_last_sample())),
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        match received {
            Ok((id, result)) => {
                reported += 1;
                match result {
                    Ok(WorkerOutcome::Finished) => report.finished += 1,
                    Ok(WorkerOutcome::PeerClosed) => report.peer_closed += 1,
                    Err(e) => {
                        report.failed += 1;
                        error!(worker = id, error = %e, "Worker failed");
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => print_throughput(out, monitor.sample())?,
            // A worker died without reporting; the joins below account for it.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    for (id, handle) in handles.into_iter().enumerate() {
        if handle.join().is_err() {
            warn!(worker = id, "Worker panicked");
        }
    }
    report.failed += settings.workers - reported;
    report.totals = monitor.totals();
    report.elapsed = started.elapsed();
    info!(
        requests = report.totals.requests,
        response_bytes = report.totals.response_bytes,
        finished = report.finished,
        peer_closed = report.peer_closed,
        failed = report.failed,
        elapsed_secs = report.elapsed.as_secs_f64(),
        "Traffic generator finished"
    );
    Ok(report)
}

fn print_throughput<W: Write>(out: &mut W, rate: Throughput) -> Result<()> {
    writeln!(
        out,
        "{} generator: {:.2} requests/s, {:.2} MB/s",
        now_micros(),
        rate.requests_per_sec,
        rate.megabytes_per_sec
    )
    .and_then(|()| out.flush())
    .map_err(ProbeError::Io)
}
