//! Command-line pieces shared by every binary.

use crate::error::{ProbeError, Result};
use crate::logging::LogSettings;
use crate::socket::SocketOptions;
use clap::error::ErrorKind;
use clap::{Args, Parser};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::PathBuf;

/// Parses the command line, exiting 0 for help and 1 for usage errors.
pub fn parse_or_exit<T: Parser>() -> T {
    match T::try_parse() {
        Ok(config) => config,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

/// Collapses an enable/disable flag pair into a tri-state option.
pub fn tri_state(enable: bool, disable: bool) -> Option<bool> {
    match (enable, disable) {
        (true, _) => Some(true),
        (false, true) => Some(false),
        (false, false) => None,
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct LogArgs {
    /// Duplicate all output to this file (appended)
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// Verbose printing
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Quiet printing: metrics lines, warnings and errors only
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Log format (text or json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub log_format: String,
}

impl LogArgs {
    pub fn validate(&self) -> Result<()> {
        if self.verbose && self.quiet {
            return Err(ProbeError::Config(
                "verbose and quiet are mutually exclusive".into(),
            ));
        }
        Ok(())
    }

    pub fn level(&self) -> &'static str {
        if self.verbose {
            "debug"
        } else if self.quiet {
            "warn"
        } else {
            "info"
        }
    }

    /// Returns true if JSON format logging is enabled
    pub fn is_json_format(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }

    pub fn settings(&self) -> LogSettings {
        LogSettings {
            level: self.level().to_string(),
            json: self.is_json_format(),
            file: self.log_file.clone(),
        }
    }

    /// Opens the log file for metrics lines, if one was requested.
    pub fn open_log_file(&self) -> io::Result<Option<File>> {
        self.log_file
            .as_ref()
            .map(|path| OpenOptions::new().create(true).append(true).open(path))
            .transpose()
    }
}

/// TCP transport options. Upper case turns an option off explicitly;
/// leaving both out keeps the kernel default.
#[derive(Args, Debug, Clone, Default)]
pub struct SocketArgs {
    /// Set TCP_NODELAY
    #[arg(short = 'n', conflicts_with = "no_nodelay")]
    pub nodelay: bool,

    /// Clear TCP_NODELAY
    #[arg(short = 'N')]
    pub no_nodelay: bool,

    /// Set TCP_QUICKACK (re-armed after every write)
    #[arg(short = 'a', conflicts_with = "no_quickack")]
    pub quickack: bool,

    /// Clear TCP_QUICKACK
    #[arg(short = 'A')]
    pub no_quickack: bool,

    /// Set SO_PRIORITY
    #[arg(short = 'p', conflicts_with = "no_priority")]
    pub priority: bool,

    /// Clear SO_PRIORITY
    #[arg(short = 'P')]
    pub no_priority: bool,
}

impl SocketArgs {
    pub fn options(&self) -> SocketOptions {
        SocketOptions {
            nodelay: tri_state(self.nodelay, self.no_nodelay),
            quickack: tri_state(self.quickack, self.no_quickack),
            priority: tri_state(self.priority, self.no_priority),
        }
    }
}

/// UDP only knows about socket priority.
#[derive(Args, Debug, Clone, Default)]
pub struct PriorityArgs {
    /// Set SO_PRIORITY
    #[arg(short = 'p', conflicts_with = "no_priority")]
    pub priority: bool,

    /// Clear SO_PRIORITY
    #[arg(short = 'P')]
    pub no_priority: bool,
}

impl PriorityArgs {
    pub fn options(&self) -> SocketOptions {
        SocketOptions {
            priority: tri_state(self.priority, self.no_priority),
            ..SocketOptions::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tri_state() {
        assert_eq!(tri_state(true, false), Some(true));
        assert_eq!(tri_state(false, true), Some(false));
        assert_eq!(tri_state(false, false), None);
    }

    #[test]
    fn test_log_levels() {
        let mut args = LogArgs::default();
        assert_eq!(args.level(), "info");
        args.verbose = true;
        assert_eq!(args.level(), "debug");
        assert!(args.validate().is_ok());
        args.quiet = true;
        assert!(args.validate().is_err());
        args.verbose = false;
        assert_eq!(args.level(), "warn");
    }

    #[test]
    fn test_socket_args() {
        let args = SocketArgs {
            nodelay: true,
            no_quickack: true,
            ..SocketArgs::default()
        };
        assert_eq!(
            args.options(),
            SocketOptions {
                nodelay: Some(true),
                quickack: Some(false),
                priority: None,
            }
        );
    }
}
