use anyhow::{Context, Result};
use skewprobe::config::parse_or_exit;
use skewprobe::logging::init_logging;
use skewprobe::server::{ServerMonitor, TcpServer, TcpServerConfig};
use tracing::{error, info};

fn main() {
    let config: TcpServerConfig = parse_or_exit();

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
        error!(error = %e, "Server failed");
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn run(config: &TcpServerConfig) -> Result<()> {
    let settings = config.settings();
    let monitor = ServerMonitor::new();
    let server = TcpServer::bind(&settings, monitor.counters())
        .with_context(|| format!("Failed to listen on {}:{}", settings.bind, settings.port))?;

    match settings.status_interval {
        Some(interval) => monitor.start_display(interval),
        None => info!("Status display disabled"),
    }

    let result = server.serve();
    monitor.log_summary();
    result.context("Accept loop failed")
}
