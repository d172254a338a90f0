//! Tracing/logging configuration for mux402
//!
//! The gateway logs exclusively to stderr: over the stdio MCP binding,
//! stdout belongs to the JSON-RPC stream and must never receive log output.
//!
//! Supports:
//! - Level from gateway config (`settings.logLevel`) with CLI overrides
//! - Pretty (colored), JSON, or compact output formats

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log level as it appears in gateway configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
}

impl LogLevel {
    fn as_tracing_level(self) -> Level {
        match self {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
        }
    }
}

/// Log output format
#[derive(Clone, Debug, Default, clap::ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Colored human-readable output
    #[default]
    Pretty,
    /// Structured JSON output (one JSON object per line)
    Json,
    /// Compact single-line format
    Compact,
}

/// Global flag to track if tracing has been initialized
static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize tracing with the given level and format.
///
/// Call once early in main() after config and CLI args are merged.
/// Subsequent calls are ignored.
pub fn init_tracing(level: LogLevel, format: &LogFormat) {
    if TRACING_INITIALIZED.get().is_some() {
        return;
    }

    let level = level.as_tracing_level();

    // RUST_LOG takes precedence when set; otherwise scope the configured
    // level to this crate and keep dependencies at warn.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("mux402={},warn", level.as_str().to_lowercase()))
    });

    match format {
        LogFormat::Pretty => {
            tracing_subscriber::fmt()
                .with_ansi(true)
                .with_target(false)
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt()
                .json()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt()
                .compact()
                .with_writer(std::io::stderr)
                .with_env_filter(filter)
                .init();
        }
    }

    let _ = TRACING_INITIALIZED.set(());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_level_maps_to_tracing() {
        assert_eq!(LogLevel::Error.as_tracing_level(), Level::ERROR);
        assert_eq!(LogLevel::Debug.as_tracing_level(), Level::DEBUG);
    }

    #[test]
    fn log_level_parses_from_config() {
        let level: LogLevel = serde_json::from_str("\"debug\"").unwrap();
        assert_eq!(level, LogLevel::Debug);
        assert_eq!(LogLevel::default(), LogLevel::Warn);
    }
}
