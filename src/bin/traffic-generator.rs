use anyhow::{bail, Context, Result};
use colored::*;
use skewprobe::config::parse_or_exit;
use skewprobe::generator::{run_generator, GeneratorConfig};
use skewprobe::logging::init_logging;
use std::io;
use tracing::error;

fn main() {
    let config: GeneratorConfig = parse_or_exit();

    if let Err(e) = init_logging(&config.log.settings()) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    if let Err(e) = run(&config) {
        error!(error = %e, "Traffic generator failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: &GeneratorConfig) -> Result<()> {
    let settings = config.settings().context("Failed to load request template")?;
    let report = run_generator(&settings, &mut io::stdout())
        .with_context(|| format!("Traffic against {}:{} failed", settings.host, settings.port))?;

    if !config.log.quiet {
        let rate = report.throughput();
        eprintln!(
            "{} {} requests, {} response bytes in {:.2}s ({:.2} requests/s, {:.2} MB/s)",
            "Done:".green().bold(),
            report.totals.requests,
            report.totals.response_bytes,
            report.elapsed.as_secs_f64(),
            rate.requests_per_sec,
            rate.megabytes_per_sec
        );
    }
    if report.failed > 0 {
        bail!("{} of {} workers failed", report.failed, settings.workers);
    }
    Ok(())
}
