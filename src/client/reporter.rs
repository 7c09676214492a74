use crate::client::constants::HISTOGRAM_HIGH_BOUND_US;
use crate::client::statistics::Statistics;
use crate::clock::OffsetBounds;
use colored::*;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How a client run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every request answered and completed.
    Completed,
    /// The server closed the connection.
    PeerClosed,
    /// The drain timeout expired with requests still unresolved.
    Drained { abandoned: u64 },
}

/// Totals for one client run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub outcome: RunOutcome,
    pub sent: u64,
    pub acked: u64,
    pub lines: u64,
    pub peak_outstanding: u64,
    pub drift_resets: u64,
    pub bounds: OffsetBounds,
    pub elapsed: Duration,
    pub stats: Statistics,
}

/// Reporter for printing the end-of-run summary.
///
/// Stdout carries metrics lines, so the summary goes to stderr.
pub struct Reporter;

const HISTOGRAM_BAR_WIDTH: usize = 30;
const LABEL_WIDTH: usize = 12;

// Percentage thresholds for color coding
const HIGH_PERCENTAGE_THRESHOLD: f64 = 50.0;
const MEDIUM_PERCENTAGE_THRESHOLD: f64 = 10.0;

const BUCKETS: [(u64, u64, &str); 9] = [
    (0, 20, "0-20 µs"),
    (20, 40, "20-40 µs"),
    (40, 60, "40-60 µs"),
    (60, 80, "60-80 µs"),
    (80, 100, "80-100 µs"),
    (100, 200, "100-200 µs"),
    (200, 500, "200-500 µs"),
    (500, 1_000, "500µs-1ms"),
    (1_000, 10_000, "1-10 ms"),
];

impl Reporter {
    /// Renders a bar scaled against the largest bucket; tiny non-zero
    /// buckets still get a sliver.
    fn render_bar(percentage: f64, max_percentage: f64, bar_width: usize) -> String {
        if percentage <= 0.0 || max_percentage <= 0.0 {
            return String::new();
        }
        let length = ((percentage / max_percentage) * bar_width as f64) as usize;
        match length {
            0 => "▏".to_string(),
            n => "█".repeat(n.min(bar_width)),
        }
    }

    fn format_percentage(percentage: f64) -> String {
        if percentage < 0.1 {
            format!("{:5.3}%", percentage)
        } else if percentage < 1.0 {
            format!("{:5.2}%", percentage)
        } else {
            format!("{:5.1}%", percentage)
        }
    }

    /// Formats a count value for display, using "k" suffix for thousands.
    fn format_count(count: u64) -> String {
        if count >= 1000 {
            format!("{:>6}k", count / 1000)
        } else {
            format!("{:>7}", count)
        }
    }

    fn colorize_label(label: &str, percentage: f64) -> String {
        let padded = format!("{:>width$}", label, width = LABEL_WIDTH);
        if percentage > HIGH_PERCENTAGE_THRESHOLD {
            padded.green().to_string()
        } else if percentage > MEDIUM_PERCENTAGE_THRESHOLD {
            padded.cyan().to_string()
        } else {
            padded
        }
    }

    fn outcome_line(outcome: RunOutcome) -> ColoredString {
        match outcome {
            RunOutcome::Completed => "✓ Run completed".green().bold(),
            RunOutcome::PeerClosed => "■ Server closed the connection".yellow().bold(),
            RunOutcome::Drained { abandoned } => {
                format!("✗ Drain timeout, {} request(s) abandoned", abandoned)
                    .red()
                    .bold()
            }
        }
    }

    /// Logs the summary and, unless `print` is false, renders it to stderr.
    pub fn report(&self, summary: &RunSummary, print: bool) {
        let stats = &summary.stats;
        info!(
            outcome = ?summary.outcome,
            sent = summary.sent,
            acked = summary.acked,
            lines = summary.lines,
            peak_outstanding = summary.peak_outstanding,
            drift_resets = summary.drift_resets,
            lower = summary.bounds.lower(),
            upper = summary.bounds.upper(),
            mean_us = stats.mean(),
            "Run finished"
        );
        if summary.drift_resets > 0 {
            warn!(
                drift_resets = summary.drift_resets,
                "Clock offset bounds were reset during the run"
            );
        }
        if print {
            self.print_summary(summary);
        }
    }

    pub fn print_summary(&self, summary: &RunSummary) {
        debug!("Printing run summary");
        let stats = &summary.stats;

        eprintln!("\n{}", "┌─────────────────────────────┐".cyan());
        eprintln!("{}", "│  Latency Summary            │".cyan());
        eprintln!("{}", "└─────────────────────────────┘".cyan());
        eprintln!();
        eprintln!(
            "Requests: {} sent, {} answered, {} completed",
            summary.sent, summary.acked, summary.lines
        );
        eprintln!("          └─ Peak in flight: {}", summary.peak_outstanding);
        eprintln!("Duration: {:.2}s", summary.elapsed.as_secs_f64());
        eprintln!(
            "Offset:   [{}, {}] µs (client minus server)",
            summary.bounds.lower(),
            summary.bounds.upper()
        );
        if summary.drift_resets > 0 {
            eprintln!(
                "          └─ {}",
                format!("{} drift reset(s)", summary.drift_resets).yellow()
            );
        }
        eprintln!();

        if stats.count() == 0 {
            eprintln!("{}", "No completed round trips recorded.".red());
        } else {
            eprintln!("Round Trip Statistics:");
            eprintln!("  Mean:      {:>10.1} µs", stats.mean());
            eprintln!("  Min:       {:>10} µs", stats.min());
            eprintln!("  Max:       {:>10} µs", stats.max());
            for (label, quantile) in [("P50", 0.5), ("P90", 0.9), ("P99", 0.99), ("P99.9", 0.999)] {
                eprintln!(
                    "  {:<10} {:>10} µs",
                    format!("{}:", label),
                    stats.percentile(quantile)
                );
            }
            if stats.clamped_count() > 0 {
                eprintln!(
                    "  ⚠ Note: {} sample(s) exceeded histogram bounds and were clamped",
                    stats.clamped_count()
                );
            }
            eprintln!();
            self.print_distribution(stats);
        }
        eprintln!();
        eprintln!("{}", Self::outcome_line(summary.outcome));
    }

    fn print_distribution(&self, stats: &Statistics) {
        eprintln!("Round Trip Distribution:");
        let total = stats.count() as f64;
        let counts: Vec<u64> = BUCKETS
            .iter()
            .map(|&(low, high, _)| stats.count_in(low, high))
            .collect();
        let percentages: Vec<f64> = counts.iter().map(|&c| c as f64 / total * 100.0).collect();
        let max_percentage = percentages.iter().fold(0.0f64, |a, &b| a.max(b));

        for ((&(_, _, label), &count), &percentage) in
            BUCKETS.iter().zip(&counts).zip(&percentages)
        {
            if count == 0 {
                continue;
            }
            eprintln!(
                "  {}:  {:30} {} ({} samples)",
                Self::colorize_label(label, percentage),
                Self::render_bar(percentage, max_percentage, HISTOGRAM_BAR_WIDTH),
                Self::format_percentage(percentage),
                Self::format_count(count)
            );
        }

        let outliers = stats.count_in(10_000, HISTOGRAM_HIGH_BOUND_US + 1);
        if outliers > 0 {
            let percentage = outliers as f64 / total * 100.0;
            eprintln!(
                "  {}:  {:30} {} ({} samples) ← MAX: {:.1}ms",
                format!("{:>width$}", ">10 ms", width = LABEL_WIDTH).red().bold(),
                Self::render_bar(percentage, max_percentage, HISTOGRAM_BAR_WIDTH),
                Self::format_percentage(percentage),
                Self::format_count(outliers),
                stats.max() as f64 / 1000.0
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;

    fn summary(samples: &[u64], outcome: RunOutcome) -> Result<RunSummary> {
        Ok(RunSummary {
            outcome,
            sent: samples.len() as u64,
            acked: samples.len() as u64,
            lines: samples.len() as u64,
            peak_outstanding: 1,
            drift_resets: 0,
            bounds: OffsetBounds::unbounded(),
            elapsed: Duration::from_secs(1),
            stats: Statistics::from_samples(samples)?,
        })
    }

    #[test]
    fn test_print_summary_empty() -> Result<()> {
        Reporter.print_summary(&summary(&[], RunOutcome::PeerClosed)?);
        Ok(())
    }

    #[test]
    fn test_print_summary_with_data() -> Result<()> {
        let summary = summary(&[10, 25, 90, 450, 20_000], RunOutcome::Drained { abandoned: 2 })?;
        Reporter.report(&summary, true);
        Ok(())
    }

    #[test]
    fn test_render_bar() {
        assert_eq!(Reporter::render_bar(0.0, 50.0, 30), "");
        assert_eq!(Reporter::render_bar(50.0, 50.0, 30).chars().count(), 30);
        assert_eq!(Reporter::render_bar(0.5, 50.0, 30), "▏");
    }

    #[test]
    fn test_format_count() {
        assert_eq!(Reporter::format_count(100), "    100");
        assert_eq!(Reporter::format_count(1000), "     1k");
        assert_eq!(Reporter::format_count(5000), "     5k");
    }
}
