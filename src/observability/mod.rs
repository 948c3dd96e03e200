//! Structured logging, metrics and the health HTTP endpoints

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::HealthServer;
pub use logging::{LogFormat, init_default_logging, init_logging, parse_level};
pub use metrics::{MetricsCollector, MetricsSnapshot};

// Span macros for structured logging
pub use crate::{invocation_span, lifecycle_span, message_span, workflow_span};
