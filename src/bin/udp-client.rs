use anyhow::{Context, Result};
use skewprobe::client::{run_udp_client, Reporter, UdpClientConfig};
use skewprobe::config::parse_or_exit;
use skewprobe::logging::init_logging;
use skewprobe::metrics::LineWriter;
use tracing::{error, info};

fn main() {
    let config: UdpClientConfig = parse_or_exit();

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
        error!(error = %e, "Client failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: &UdpClientConfig) -> Result<()> {
    let settings = config.settings();
    let file = config
        .log
        .open_log_file()
        .context("Failed to open log file")?;
    let mut sink = LineWriter::new("client", file);

    let summary = run_udp_client(&settings, &mut sink)
        .with_context(|| format!("UDP run against {}:{} failed", settings.host, settings.port))?;
    Reporter.report(&summary, settings.summary);
    info!("Client finished");
    Ok(())
}
