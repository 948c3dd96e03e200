//! Background health polling
//!
//! On each tick the poller probes every tool instance concurrently and sweeps
//! the agent directory for missed heartbeats.

use super::agents::AgentDirectory;
use super::capability::Liveness;
use super::tools::{InstanceKey, ToolRegistry};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

/// Reachability check for a tool endpoint
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `Ok` when the endpoint answered its health check
    async fn probe(&self, endpoint: &str) -> Result<(), String>;
}

/// Probe that issues `GET <endpoint>/health`
pub struct HttpHealthProbe {
    client: reqwest::Client,
}

impl HttpHealthProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self, endpoint: &str) -> Result<(), String> {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("health probe to {url} failed: {e}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("health probe to {url} returned {}", response.status()))
        }
    }
}

/// Result of one polling round
#[derive(Debug, Default, Clone)]
pub struct PollReport {
    pub probed: usize,
    pub unreachable: Vec<InstanceKey>,
    pub offline: Vec<InstanceKey>,
    pub agents_removed: Vec<String>,
}

/// Drives periodic health checks for tools and agents
pub struct HealthPoller {
    tools: Arc<ToolRegistry>,
    agents: Arc<AgentDirectory>,
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    missed_poll_threshold: u32,
}

impl HealthPoller {
    pub fn new(
        tools: Arc<ToolRegistry>,
        agents: Arc<AgentDirectory>,
        probe: Arc<dyn HealthProbe>,
        interval: Duration,
        missed_poll_threshold: u32,
    ) -> Self {
        Self {
            tools,
            agents,
            probe,
            interval,
            missed_poll_threshold,
        }
    }

    /// Run one polling round
    pub async fn poll_once(&self) -> PollReport {
        let mut probes = JoinSet::new();
        for key in self.tools.instance_keys() {
            let probe = Arc::clone(&self.probe);
            probes.spawn(async move {
                let result = probe.probe(&key.endpoint).await;
                (key, result)
            });
        }

        let mut report = PollReport::default();
        while let Some(joined) = probes.join_next().await {
            let (key, result) = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Health probe task failed: {}", e);
                    continue;
                }
            };

            report.probed += 1;
            let reachable = match result {
                Ok(()) => true,
                Err(reason) => {
                    debug!(tool = %key.name, endpoint = %key.endpoint, %reason, "Missed health poll");
                    false
                }
            };

            let liveness = self
                .tools
                .record_poll(&key, reachable, self.missed_poll_threshold);
            if !reachable {
                if liveness == Some(Liveness::Offline) {
                    report.offline.push(key.clone());
                }
                report.unreachable.push(key);
            }
        }

        report.agents_removed = self.agents.sweep().removed;
        report
    }

    /// Poll on a fixed interval until `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            info!(interval = ?self.interval, "Health poller started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.poll_once().await;
                        if !report.unreachable.is_empty() || !report.agents_removed.is_empty() {
                            info!(
                                probed = report.probed,
                                unreachable = report.unreachable.len(),
                                offline = report.offline.len(),
                                agents_removed = report.agents_removed.len(),
                                "Health poll completed"
                            );
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }

            info!("Health poller stopped");
        })
    }
}
