//! Agent directory
//!
//! Tracks agent profiles announced by heartbeat. Liveness decays as heartbeats
//! are missed: one missed interval degrades an agent, and reaching the
//! configured threshold removes it from the directory.

use super::capability::Liveness;
use crate::error::{CoordError, CoordResult};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

/// A registered agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentProfile {
    pub agent_id: String,
    /// Declared capabilities, kept sorted
    pub capabilities: BTreeSet<String>,
    pub liveness: Liveness,
    pub last_heartbeat: DateTime<Utc>,
    /// Where the agent receives messages
    pub endpoint: String,
    /// Reported load factor in 0.0..=1.0
    #[serde(default)]
    pub load: f64,
}

impl AgentProfile {
    pub fn new<I, S>(
        agent_id: impl Into<String>,
        endpoint: impl Into<String>,
        capabilities: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            agent_id: agent_id.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            liveness: Liveness::Online,
            last_heartbeat: Utc::now(),
            endpoint: endpoint.into(),
            load: 0.0,
        }
    }

    pub fn can_handle(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    pub fn can_handle_all(&self, capabilities: &[String]) -> bool {
        capabilities.iter().all(|c| self.capabilities.contains(c))
    }
}

/// Outcome of a heartbeat sweep
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub degraded: Vec<String>,
    pub removed: Vec<String>,
}

/// Thread-safe directory of agents
#[derive(Debug)]
pub struct AgentDirectory {
    agents: DashMap<String, AgentProfile>,
    heartbeat_interval: Duration,
    missed_threshold: u32,
}

impl AgentDirectory {
    pub fn new(heartbeat_interval: Duration, missed_threshold: u32) -> Self {
        Self {
            agents: DashMap::new(),
            heartbeat_interval,
            missed_threshold: missed_threshold.max(1),
        }
    }

    /// Register or replace an agent profile
    pub fn register(&self, mut profile: AgentProfile) -> CoordResult<()> {
        crate::protocol::ids::validate_id(&profile.agent_id)
            .map_err(|e| CoordError::invalid_input(format!("agent id: {e}")))?;

        profile.liveness = Liveness::Online;
        profile.last_heartbeat = Utc::now();
        let agent_id = profile.agent_id.clone();
        let is_new = self.agents.insert(agent_id.clone(), profile).is_none();

        if is_new {
            info!(agent_id = %agent_id, "Registered new agent");
        } else {
            debug!(agent_id = %agent_id, "Updated agent profile");
        }
        Ok(())
    }

    /// Record a heartbeat from the owning agent
    pub fn heartbeat(&self, agent_id: &str, load: f64) -> CoordResult<()> {
        let mut profile = self.agents.get_mut(agent_id).ok_or_else(|| {
            CoordError::invalid_input(format!("heartbeat from unregistered agent '{agent_id}'"))
        })?;

        profile.last_heartbeat = Utc::now();
        profile.load = load.clamp(0.0, 1.0);
        if profile.liveness != Liveness::Online {
            info!(agent_id, "Agent back online");
        }
        profile.liveness = Liveness::Online;
        Ok(())
    }

    /// Re-evaluate liveness from heartbeat age
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let interval = ChronoDuration::from_std(self.heartbeat_interval)
            .unwrap_or_else(|_| ChronoDuration::seconds(15));
        let interval_ms = interval.num_milliseconds().max(1);
        let mut report = SweepReport::default();

        self.agents.retain(|agent_id, profile| {
            let age_ms = (now - profile.last_heartbeat).num_milliseconds().max(0);
            let missed = (age_ms / interval_ms) as u32;

            if missed >= self.missed_threshold {
                info!(agent_id = %agent_id, missed, "Removing agent after missed heartbeats");
                report.removed.push(agent_id.clone());
                return false;
            }

            if missed >= 1 && profile.liveness == Liveness::Online {
                debug!(agent_id = %agent_id, missed, "Agent degraded");
                profile.liveness = Liveness::Degraded;
                report.degraded.push(agent_id.clone());
            }
            true
        });

        report
    }

    /// Mark an agent's liveness from an external probe
    pub fn set_liveness(&self, agent_id: &str, liveness: Liveness) {
        if let Some(mut profile) = self.agents.get_mut(agent_id) {
            if profile.liveness != liveness {
                info!(agent_id, from = %profile.liveness, to = %liveness, "Agent liveness changed");
                profile.liveness = liveness;
            }
        }
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentProfile> {
        self.agents.get(agent_id).map(|p| p.clone())
    }

    /// Selectable agents holding every requested capability, best first
    pub fn find_by_capabilities(&self, capabilities: &[String]) -> Vec<AgentProfile> {
        let mut matches: Vec<AgentProfile> = self
            .agents
            .iter()
            .filter(|entry| entry.liveness.is_selectable() && entry.can_handle_all(capabilities))
            .map(|entry| entry.value().clone())
            .collect();

        // Liveness first, then load, then agent_id for deterministic tie-breaking
        matches.sort_by(|a, b| {
            b.liveness
                .score()
                .cmp(&a.liveness.score())
                .then_with(|| {
                    a.load
                        .partial_cmp(&b.load)
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.agent_id.cmp(&b.agent_id))
        });
        matches
    }

    /// Best agent for a capability, skipping the excluded ids
    pub fn select_for_capability(
        &self,
        capability: &str,
        exclude: &[&str],
    ) -> CoordResult<AgentProfile> {
        let selected = self
            .find_by_capabilities(&[capability.to_string()])
            .into_iter()
            .find(|profile| !exclude.contains(&profile.agent_id.as_str()))
            .ok_or_else(|| CoordError::no_available_instance(capability))?;

        info!(
            agent_id = %selected.agent_id,
            capability,
            load = selected.load,
            "Selected agent for capability"
        );
        Ok(selected)
    }

    pub fn all(&self) -> Vec<AgentProfile> {
        let mut profiles: Vec<AgentProfile> =
            self.agents.iter().map(|p| p.value().clone()).collect();
        profiles.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        profiles
    }

    pub fn agent_count(&self) -> usize {
        self.agents.len()
    }

    pub fn online_count(&self) -> usize {
        self.agents
            .iter()
            .filter(|p| p.liveness == Liveness::Online)
            .count()
    }
}
