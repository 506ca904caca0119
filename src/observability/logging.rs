//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! The output format is controlled by the `LOG_FORMAT` environment variable:
//!
//! - `json` - Structured JSON format for log aggregation systems
//! - `pretty` - Human-readable format with colors and indentation
//! - `compact` - Terminal-friendly format with colors but minimal spacing
//!
//! ## Environment Variables
//!
//! - `PUBSUB_LOG_LEVEL`: Log level (ERROR, WARN, INFO, DEBUG, TRACE)
//! - `LOG_LEVEL`: Fallback when `PUBSUB_LOG_LEVEL` is unset - defaults to ERROR
//! - `LOG_FORMAT`: Output format (json, pretty, compact) - defaults to compact
//! - `PUBSUB_LOG_TIMESTAMP`: Print timestamps when set to anything
//! - `LOG_SPANS`: Include span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: Override log filtering (follows env_logger format)
//!
//! ## Examples
//!
//! ```bash
//! # Quiet by default: only errors
//! pubsub-cli tail orders
//!
//! # Follow every delivery
//! PUBSUB_LOG_LEVEL=debug PUBSUB_LOG_TIMESTAMP=1 pubsub-cli tail orders
//!
//! # JSON for log shipping
//! LOG_FORMAT=json LOG_LEVEL=info pubsub-cli tail orders
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// JSON format for structured logging (machine-readable)
    Json,
    /// Pretty format with colors and indentation (human-readable)
    Pretty,
    /// Compact format with colors but minimal spacing (terminal-friendly)
    Compact,
}

impl LogFormat {
    /// Parse log format from string
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "json" => LogFormat::Json,
            "pretty" => LogFormat::Pretty,
            _ => LogFormat::Compact,
        }
    }
}

/// Logging settings resolved from the environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub level: Level,
    pub format: LogFormat,
    pub timestamps: bool,
    pub include_spans: bool,
}

impl LogSettings {
    /// Resolve settings through `lookup`, which stands in for `std::env::var`
    pub fn resolve<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let level = lookup("PUBSUB_LOG_LEVEL")
            .or_else(|| lookup("LOG_LEVEL"))
            .map_or(Level::ERROR, |raw| parse_level(&raw));
        let format = lookup("LOG_FORMAT").map_or(LogFormat::Compact, |raw| LogFormat::parse(&raw));
        let timestamps = lookup("PUBSUB_LOG_TIMESTAMP").is_some();
        let include_spans = lookup("LOG_SPANS").is_some_and(|raw| raw.eq_ignore_ascii_case("true"));

        Self {
            level,
            format,
            timestamps,
            include_spans,
        }
    }

    pub fn from_env() -> Self {
        Self::resolve(|name| env::var(name).ok())
    }
}

/// Map a level name to a tracing level; unknown names mean ERROR
pub fn parse_level(raw: &str) -> Level {
    match raw.trim().to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" | "WARNING" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::ERROR,
    }
}

fn base_filter(level: Level) -> EnvFilter {
    // Allow RUST_LOG to override
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    let mut filter = EnvFilter::new(level.to_string());
    // Reduce noise from dependencies
    for directive in ["rumqttc=warn", "tokio=warn"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Initialize logging with explicit settings
///
/// Does nothing if a global subscriber is already installed.
pub fn init_logging(settings: &LogSettings) {
    let span_events = if settings.include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let subscriber = tracing_subscriber::registry().with(base_filter(settings.level));

    // `without_time` changes the layer type, so each branch installs its own
    let result = match (settings.format, settings.timestamps) {
        (LogFormat::Json, true) => subscriber
            .with(fmt::layer().json().with_span_events(span_events))
            .try_init(),
        (LogFormat::Json, false) => subscriber
            .with(fmt::layer().json().without_time().with_span_events(span_events))
            .try_init(),
        (LogFormat::Pretty, true) => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(span_events))
            .try_init(),
        (LogFormat::Pretty, false) => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .without_time()
                    .with_span_events(span_events),
            )
            .try_init(),
        (LogFormat::Compact, true) => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events),
            )
            .try_init(),
        (LogFormat::Compact, false) => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .without_time()
                    .with_span_events(span_events),
            )
            .try_init(),
    };

    if result.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Initialize logging from environment variables
pub fn init_default_logging() {
    init_logging(&LogSettings::from_env());
}
