//! Tool dispatch over HTTP
//!
//! A failed dispatch is classified as transient (server errors, timeouts,
//! connection failures) or permanent (client errors, unreadable responses).
//! Only transient failures are retried.

use crate::config::DispatchConfig;
use crate::error::{CoordError, CoordResult, FailureKind};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Body sent to a tool endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchRequest {
    pub tool: String,
    pub version: String,
    pub arguments: Value,
    pub idempotency_key: String,
}

/// Sends one invocation to one endpoint
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, endpoint: &str, request: &DispatchRequest) -> CoordResult<Value>;
}

/// POSTs the request as JSON to the endpoint URL
#[derive(Debug, Clone)]
pub struct HttpDispatcher {
    client: Client,
}

impl HttpDispatcher {
    pub fn new(timeout: Duration) -> CoordResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CoordError::internal(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ToolDispatcher for HttpDispatcher {
    async fn dispatch(&self, endpoint: &str, request: &DispatchRequest) -> CoordResult<Value> {
        let response = self
            .client
            .post(endpoint)
            .header("Idempotency-Key", &request.idempotency_key)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                let message = format!(
                    "request to {endpoint} failed: {e} (is_connect: {}, is_timeout: {})",
                    e.is_connect(),
                    e.is_timeout()
                );
                warn!(tool = %request.tool, %message, "Tool dispatch network error");
                CoordError::tool_invocation(&request.tool, FailureKind::Transient, message)
            })?;

        let status = response.status();
        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordError::tool_invocation(
                &request.tool,
                FailureKind::Transient,
                format!("{status}: {body}"),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CoordError::tool_invocation(
                &request.tool,
                FailureKind::Permanent,
                format!("{status}: {body}"),
            ));
        }

        let body: Value = response.json().await.map_err(|e| {
            CoordError::tool_invocation(
                &request.tool,
                FailureKind::Permanent,
                format!("unreadable response: {e}"),
            )
        })?;
        debug!(tool = %request.tool, endpoint, "Tool dispatch succeeded");

        // Endpoints may wrap their output as {"result": ...}
        Ok(match body {
            Value::Object(mut map) if map.contains_key("result") => {
                map.remove("result").unwrap_or(Value::Null)
            }
            other => other,
        })
    }
}

/// Bounded exponential backoff for transient failures
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn from_config(config: &DispatchConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            multiplier: config.backoff_multiplier.max(1.0),
        }
    }

    /// Delay before retry number `retry` (1-based)
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = self.multiplier.powi(retry.saturating_sub(1) as i32);
        let delay = self.initial_backoff.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_backoff.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DispatchConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> DispatchRequest {
        DispatchRequest {
            tool: "calendar.create_event".to_string(),
            version: "1.0".to_string(),
            arguments: json!({"title": "standup"}),
            idempotency_key: "key-1".to_string(),
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(3), Duration::from_millis(400));
        assert_eq!(policy.backoff(10), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_success_unwraps_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/invoke"))
            .and(header("Idempotency-Key", "key-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"id": 7}})))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let value = dispatcher
            .dispatch(&format!("{}/invoke", server.uri()), &request())
            .await
            .unwrap();
        assert_eq!(value, json!({"id": 7}));
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/down"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/bad"))
            .respond_with(ResponseTemplate::new(422))
            .mount(&server)
            .await;

        let dispatcher = HttpDispatcher::new(Duration::from_secs(2)).unwrap();
        let transient = dispatcher
            .dispatch(&format!("{}/down", server.uri()), &request())
            .await
            .unwrap_err();
        assert!(transient.is_retryable());

        let permanent = dispatcher
            .dispatch(&format!("{}/bad", server.uri()), &request())
            .await
            .unwrap_err();
        assert!(matches!(
            permanent,
            CoordError::ToolInvocation {
                kind: FailureKind::Permanent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_transient() {
        let dispatcher = HttpDispatcher::new(Duration::from_millis(500)).unwrap();
        let err = dispatcher
            .dispatch("http://127.0.0.1:9/invoke", &request())
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
