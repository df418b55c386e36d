//! Logging setup.

use anyhow::{Context, Result};
use std::str::FromStr;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// One JSON object per line.
    #[default]
    Json,
    /// Human-readable multi-line format.
    Pretty,
    /// Single-line text.
    Compact,
}

impl FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "pretty" => Self::Pretty,
            "compact" | "text" => Self::Compact,
            _ => Self::Json,
        })
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Output format.
    pub format: LogFormat,
    /// `EnvFilter` directives.
    pub filter: String,
    /// Include file and line.
    pub include_location: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            filter: "info,wko_operator=info,wko_core=info,kube=warn".to_string(),
            include_location: false,
        }
    }
}

impl TracingConfig {
    /// Read `WKO_LOG_FORMAT` (`json`, `pretty`, `compact`) and `RUST_LOG`.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            format: std::env::var("WKO_LOG_FORMAT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.format),
            filter: std::env::var("RUST_LOG")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.filter),
            include_location: std::env::var("WKO_LOG_LOCATION").is_ok(),
        }
    }
}

/// Install the global subscriber.
pub fn init_tracing(config: &TracingConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.filter).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.format {
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location)
                    .with_span_events(FmtSpan::CLOSE)
                    .flatten_event(true),
            )
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
        LogFormat::Compact => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .compact()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init(),
    }
    .context("Failed to initialize tracing subscriber")
}
