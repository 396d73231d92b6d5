//! Command-line interface (spec.md §6.4).
//!
//! Flags, not subcommands — pRouter is a single long-running service, unlike
//! the teacher's `cli/config.rs` subcommand set. Grounded on
//! `original_source/prouter/config/cmdline.py`'s argparse definition, with
//! `clap`'s derive API standing in for argparse per the teacher's own CLI
//! idiom (`clap = { features = ["derive"] }`).

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
#[clap(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warning => tracing::Level::WARN,
            LogLevel::Error | LogLevel::Fatal => tracing::Level::ERROR,
        }
    }
}

/// One `key.path=value` override, parsed eagerly so a malformed flag fails
/// fast at argument-parsing time rather than after config load.
#[derive(Debug, Clone)]
pub struct SetOverride {
    pub path: String,
    pub literal: String,
}

impl std::str::FromStr for SetOverride {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, literal) = s
            .split_once('=')
            .ok_or_else(|| format!("expected 'key.path=value', got '{s}'"))?;
        if path.is_empty() {
            return Err(format!("expected 'key.path=value', got '{s}'"));
        }
        Ok(SetOverride { path: path.to_string(), literal: literal.to_string() })
    }
}

#[derive(Debug, Parser)]
#[command(name = "prouter", about = "Control-plane router for remote agent hosts")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Minimum log severity to emit.
    #[arg(long, value_enum, default_value_t = LogLevel::Debug)]
    pub log_level: LogLevel,

    /// `tracing_subscriber` format string for log lines.
    #[arg(long, default_value = "[{process}] [{timestamp}] [{target}] [{level}] {message}")]
    pub log_format: String,

    /// Log every inbound/outbound RPC frame at debug level.
    #[arg(long)]
    pub connection_debug: bool,

    /// Override a config value by dotted path, e.g. `--set client.polling_delay=0.1`.
    /// Repeatable.
    #[arg(long = "set", value_name = "key.path=value")]
    pub set: Vec<SetOverride>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn parses_minimal_args() {
        let cli = Cli::parse_from(["prouter"]);
        assert_eq!(cli.log_level, LogLevel::Debug);
        assert!(cli.set.is_empty());
    }

    #[test]
    fn parses_repeated_set_overrides() {
        let cli = Cli::parse_from([
            "prouter",
            "--set",
            "server.enabled=true",
            "--set",
            "client.polling_delay=0.1",
        ]);
        assert_eq!(cli.set.len(), 2);
        assert_eq!(cli.set[0].path, "server.enabled");
        assert_eq!(cli.set[1].literal, "0.1");
    }

    #[test]
    fn set_override_rejects_missing_equals() {
        assert!(SetOverride::from_str("no-equals-sign").is_err());
    }
}
