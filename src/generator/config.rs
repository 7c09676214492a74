//! Traffic generator configuration

use crate::config::LogArgs;
use crate::error::{ProbeError, Result};
use crate::generator::template::RequestTemplate;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound on worker threads
pub const MAX_WORKERS: usize = 1024;

/// Name substituted for `%s` when `-n` is not given
pub const DEFAULT_NAME: &str = "traffic-generator";

/// Runtime parameters handed to the generator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorSettings {
    pub host: String,
    pub port: u16,
    pub template: RequestTemplate,
    pub name: String,
    /// Delay between requests across all workers, in microseconds
    pub delay_us: u64,
    /// Total requests over all workers; `None` for no limit
    pub requests: Option<u64>,
    pub workers: usize,
    pub print_interval: Option<Duration>,
    /// How long each worker keeps reading after its last request
    pub linger_us: u64,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "traffic-generator")]
#[command(about = "Generate request traffic from a template file against HOST:PORT")]
pub struct GeneratorConfig {
    /// File holding the request template (`%lu` = request id, `%s` = name)
    pub file: PathBuf,

    /// Server host name or address
    pub host: String,

    /// Server port
    pub port: u16,

    /// Delay between requests in microseconds, spread over all workers
    #[arg(short = 'd', long, default_value_t = 0)]
    pub delay: u64,

    /// Test name inserted into each request
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Print throughput every this many microseconds
    #[arg(short = 'p', long = "print-freq")]
    pub print_freq: Option<u64>,

    /// Number of requests to send (default: no limit)
    #[arg(short = 'r', long)]
    pub requests: Option<u64>,

    /// Number of worker threads
    #[arg(short = 't', long, default_value_t = 1)]
    pub threads: usize,

    /// Microseconds to keep reading after the last request before closing
    #[arg(short = 'w', long, default_value_t = 0)]
    pub wait: u64,

    #[command(flatten)]
    pub log: LogArgs,
}

impl GeneratorConfig {
    /// Validates the configuration values
    pub fn validate(&self) -> Result<()> {
        self.log.validate()?;
        if self.port == 0 {
            return Err(ProbeError::Config("port must be > 0".into()));
        }
        if !(1..=MAX_WORKERS).contains(&self.threads) {
            return Err(ProbeError::Config(format!(
                "threads ({}) must be between 1 and {}",
                self.threads, MAX_WORKERS
            )));
        }
        if self.print_freq == Some(0) {
            return Err(ProbeError::Config("print frequency must be > 0".into()));
        }
        Ok(())
    }

    /// Loads the template file and builds the runtime settings.
    pub fn settings(&self) -> Result<GeneratorSettings> {
        Ok(GeneratorSettings {
            host: self.host.clone(),
            port: self.port,
            template: RequestTemplate::load(&self.file)?,
            name: self.name.clone().unwrap_or_else(|| DEFAULT_NAME.to_string()),
            delay_us: self.delay,
            requests: self.requests,
            workers: self.threads,
            print_interval: self.print_freq.map(Duration::from_micros),
            linger_us: self.wait,
        })
    }
}
