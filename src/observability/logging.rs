//! Structured logging using the tracing crate
//!
//! ## Log Format Options
//!
//! `LOG_FORMAT` selects the output:
//!
//! - `json` - structured JSON for log aggregation (default)
//! - `pretty` - multi-line, coloured output for development
//! - `compact` - single-line coloured output for terminals
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG, TRACE - defaults to INFO
//! - `LOG_FORMAT`: json, pretty, compact - defaults to json
//! - `LOG_SPANS`: emit span open/close events (true/false) - defaults to false
//! - `RUST_LOG`: full filter override (env_logger syntax)
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG agentmesh run --config agentmesh.toml
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Dependencies whose logs are clamped to `warn`
const NOISY_TARGETS: [&str; 5] = ["hyper", "warp", "reqwest", "tokio", "h2"];

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Parse a `LOG_LEVEL` value; unknown values fall back to INFO
pub fn parse_level(s: &str) -> Level {
    match s.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if let Ok(rust_log) = env::var("RUST_LOG") {
        return EnvFilter::new(rust_log);
    }

    NOISY_TARGETS
        .iter()
        .filter_map(|target| format!("{target}=warn").parse().ok())
        .fold(EnvFilter::new(level.to_string()), |filter, directive| {
            filter.add_directive(directive)
        })
}

fn span_events(include_spans: bool) -> FmtSpan {
    if include_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    }
}

/// Install the global subscriber.
///
/// Returns `false` when a subscriber was already installed, which happens when
/// tests or embedders initialise logging more than once.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) -> bool {
    let subscriber = tracing_subscriber::registry().with(build_filter(level));

    let result = match format {
        LogFormat::Json => subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_ansi(true)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(span_events(include_spans)),
            )
            .try_init(),
    };
    result.is_ok()
}

/// Initialize logging from `LOG_LEVEL`, `LOG_FORMAT` and `LOG_SPANS`
pub fn init_default_logging() -> bool {
    let level = parse_level(&env::var("LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string()));
    let format = LogFormat::parse(&env::var("LOG_FORMAT").unwrap_or_else(|_| "json".to_string()));
    let include_spans = env::var("LOG_SPANS")
        .map(|v| v.to_lowercase() == "true")
        .unwrap_or(false);

    init_logging(level, format, include_spans)
}

/// Span for one routed protocol message
#[macro_export]
macro_rules! message_span {
    ($message_id:expr, $intent:expr, $sender:expr) => {
        tracing::info_span!(
            "message",
            message_id = %$message_id,
            intent = %$intent,
            sender = %$sender
        )
    };
}

/// Span for one tool invocation
#[macro_export]
macro_rules! invocation_span {
    ($tool:expr, $version:expr, $actor:expr) => {
        tracing::info_span!(
            "invocation",
            tool = %$tool,
            version = %$version,
            actor = %$actor
        )
    };
}

/// Span for a workflow execution bound to a session
#[macro_export]
macro_rules! workflow_span {
    ($session_id:expr, $workflow_id:expr) => {
        tracing::info_span!(
            "workflow",
            session_id = %$session_id,
            workflow_id = %$workflow_id
        )
    };
}

/// Span for coordinator lifecycle events, built from `key = value` fields
#[macro_export]
macro_rules! lifecycle_span {
    ($($field:tt)*) => {
        tracing::info_span!("lifecycle_event", $($field)*)
    };
}
