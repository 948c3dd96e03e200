//! Per-endpoint circuit breaker
//!
//! `failure_threshold` consecutive transient failures open the circuit. While
//! open, calls fail fast with `CircuitOpen` and never reach the endpoint. After
//! the cool-down one probe call is let through (half-open): success closes the
//! circuit, failure re-opens it for another cool-down. A probe whose caller
//! never reports back holds the slot for one cool-down at most.

use crate::config::CircuitBreakerConfig;
use crate::error::{CoordError, CoordResult};
use dashmap::DashMap;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
enum Circuit {
    Closed { failures: u32 },
    Open { until: Instant },
    HalfOpen { probe_until: Instant },
}

#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown: Duration,
    circuits: DashMap<String, Circuit>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            cooldown,
            circuits: DashMap::new(),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.failure_threshold, config.cooldown())
    }

    /// Ask to call `endpoint`. Fails fast while the circuit is open.
    pub fn try_acquire(&self, endpoint: &str) -> CoordResult<()> {
        self.try_acquire_at(endpoint, Instant::now())
    }

    pub fn try_acquire_at(&self, endpoint: &str, now: Instant) -> CoordResult<()> {
        let Some(mut circuit) = self.circuits.get_mut(endpoint) else {
            return Ok(());
        };

        match *circuit {
            Circuit::Closed { .. } => Ok(()),
            Circuit::Open { until } if now >= until => {
                info!(endpoint, "Circuit half-open, allowing probe call");
                *circuit = Circuit::HalfOpen {
                    probe_until: now + self.cooldown,
                };
                Ok(())
            }
            Circuit::Open { until } => Err(CoordError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_in: until.saturating_duration_since(now),
            }),
            Circuit::HalfOpen { probe_until } if now >= probe_until => {
                warn!(endpoint, "Probe call abandoned, allowing a new one");
                *circuit = Circuit::HalfOpen {
                    probe_until: now + self.cooldown,
                };
                Ok(())
            }
            // A probe is already in flight
            Circuit::HalfOpen { probe_until } => Err(CoordError::CircuitOpen {
                endpoint: endpoint.to_string(),
                retry_in: probe_until.saturating_duration_since(now),
            }),
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        if let Some(mut circuit) = self.circuits.get_mut(endpoint) {
            if matches!(*circuit, Circuit::HalfOpen { .. }) {
                info!(endpoint, "Circuit closed after successful probe");
            }
            *circuit = Circuit::Closed { failures: 0 };
        }
    }

    /// Count a transient failure; returns true when this failure opened the circuit
    pub fn record_failure(&self, endpoint: &str) -> bool {
        self.record_failure_at(endpoint, Instant::now())
    }

    pub fn record_failure_at(&self, endpoint: &str, now: Instant) -> bool {
        let mut circuit = self
            .circuits
            .entry(endpoint.to_string())
            .or_insert(Circuit::Closed { failures: 0 });

        let next = match *circuit {
            Circuit::Closed { failures } if failures + 1 >= self.failure_threshold => {
                warn!(
                    endpoint,
                    failures = failures + 1,
                    cooldown_ms = self.cooldown.as_millis() as u64,
                    "Circuit opened"
                );
                Circuit::Open {
                    until: now + self.cooldown,
                }
            }
            Circuit::Closed { failures } => Circuit::Closed {
                failures: failures + 1,
            },
            Circuit::HalfOpen { .. } => {
                warn!(endpoint, "Probe failed, circuit re-opened");
                Circuit::Open {
                    until: now + self.cooldown,
                }
            }
            Circuit::Open { until } => Circuit::Open { until },
        };

        let tripped = matches!(next, Circuit::Open { .. }) && !matches!(*circuit, Circuit::Open { .. });
        *circuit = next;
        tripped
    }

    pub fn state(&self, endpoint: &str) -> CircuitState {
        match self.circuits.get(endpoint).as_deref() {
            None | Some(Circuit::Closed { .. }) => CircuitState::Closed,
            Some(Circuit::Open { .. }) => CircuitState::Open,
            Some(Circuit::HalfOpen { .. }) => CircuitState::HalfOpen,
        }
    }

    /// Endpoints whose circuit is not closed
    pub fn open_endpoints(&self) -> Vec<String> {
        self.circuits
            .iter()
            .filter(|entry| !matches!(entry.value(), Circuit::Closed { .. }))
            .map(|entry| entry.key().clone())
            .collect()
    }
}
