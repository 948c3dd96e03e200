//! Tool registry
//!
//! Tool instances are keyed by (name, version, endpoint). Registration is an
//! idempotent upsert; reads go through `DashMap` shards and never wait on a
//! registration in progress. Selection prefers the healthiest, least-loaded
//! instance and never returns one that is offline.

use super::capability::{compare_versions, CapabilityQuery, Liveness, ToolCapability};
use crate::error::{CoordError, CoordResult};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Key of one registered tool instance
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceKey {
    pub name: String,
    pub version: String,
    pub endpoint: String,
}

#[derive(Debug)]
struct ToolInstance {
    capability: Arc<ToolCapability>,
    liveness: Liveness,
    missed_polls: u32,
    in_flight: Arc<AtomicU32>,
    registered_at: DateTime<Utc>,
    last_poll: Option<DateTime<Utc>>,
}

/// Snapshot of a registered instance handed to callers
#[derive(Debug, Clone)]
pub struct ToolEndpoint {
    pub capability: Arc<ToolCapability>,
    pub endpoint: String,
    pub liveness: Liveness,
    in_flight: Arc<AtomicU32>,
}

impl ToolEndpoint {
    /// Invocations currently running against this instance
    pub fn load(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Count an invocation against this instance until the guard drops
    pub fn begin_invocation(&self) -> LoadGuard {
        self.in_flight.fetch_add(1, Ordering::Relaxed);
        LoadGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    pub fn key(&self) -> InstanceKey {
        InstanceKey {
            name: self.capability.name.clone(),
            version: self.capability.version.clone(),
            endpoint: self.endpoint.clone(),
        }
    }
}

/// Decrements the instance load when dropped
#[derive(Debug)]
pub struct LoadGuard {
    in_flight: Arc<AtomicU32>,
}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Serializable view of an instance for health reporting
#[derive(Debug, Clone, Serialize)]
pub struct InstanceStatus {
    pub name: String,
    pub version: String,
    pub endpoint: String,
    pub liveness: Liveness,
    pub missed_polls: u32,
    pub load: u32,
    pub registered_at: DateTime<Utc>,
    pub last_poll: Option<DateTime<Utc>>,
}

/// Thread-safe registry of tool instances
#[derive(Debug, Default)]
pub struct ToolRegistry {
    /// Canonical metadata per (name, version)
    capabilities: DashMap<(String, String), Arc<ToolCapability>>,
    instances: DashMap<InstanceKey, ToolInstance>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool instance.
    ///
    /// Re-registering identical metadata is a no-op that keeps the instance's
    /// health and load. Different metadata for an existing name and version
    /// fails with `DuplicateRegistration`.
    pub fn register(&self, capability: ToolCapability, endpoint: &str) -> CoordResult<()> {
        let version_key = (capability.name.clone(), capability.version.clone());
        let canonical = match self.capabilities.entry(version_key) {
            Entry::Occupied(existing) => {
                if **existing.get() != capability {
                    warn!(
                        tool = %capability.name,
                        version = %capability.version,
                        endpoint,
                        "Rejected conflicting tool registration"
                    );
                    return Err(CoordError::DuplicateRegistration {
                        name: capability.name,
                        version: capability.version,
                        endpoint: endpoint.to_string(),
                    });
                }
                Arc::clone(existing.get())
            }
            Entry::Vacant(vacant) => Arc::clone(&vacant.insert(Arc::new(capability))),
        };

        let key = InstanceKey {
            name: canonical.name.clone(),
            version: canonical.version.clone(),
            endpoint: endpoint.to_string(),
        };

        match self.instances.entry(key) {
            Entry::Occupied(_) => {
                debug!(
                    tool = %canonical.name,
                    version = %canonical.version,
                    endpoint,
                    "Tool instance already registered"
                );
            }
            Entry::Vacant(vacant) => {
                info!(
                    tool = %canonical.name,
                    version = %canonical.version,
                    endpoint,
                    risk = %canonical.risk,
                    "Registered tool instance"
                );
                vacant.insert(ToolInstance {
                    capability: canonical,
                    liveness: Liveness::Online,
                    missed_polls: 0,
                    in_flight: Arc::new(AtomicU32::new(0)),
                    registered_at: Utc::now(),
                    last_poll: None,
                });
            }
        }

        Ok(())
    }

    /// Capability metadata for a name, pinned version or latest registered
    pub fn capability(&self, query: &CapabilityQuery) -> Option<Arc<ToolCapability>> {
        match &query.version {
            Some(version) => self
                .capabilities
                .get(&(query.name.clone(), version.clone()))
                .map(|entry| Arc::clone(entry.value())),
            None => self
                .capabilities
                .iter()
                .filter(|entry| entry.key().0 == query.name)
                .max_by(|a, b| compare_versions(&a.key().1, &b.key().1))
                .map(|entry| Arc::clone(entry.value())),
        }
    }

    /// All instances of the queried capability, healthiest and least loaded first.
    ///
    /// Offline instances are included at the end of the ranking.
    pub fn discover(&self, query: &CapabilityQuery) -> Vec<ToolEndpoint> {
        let Some(capability) = self.capability(query) else {
            return Vec::new();
        };

        let mut endpoints: Vec<ToolEndpoint> = self
            .instances
            .iter()
            .filter(|entry| {
                entry.key().name == capability.name && entry.key().version == capability.version
            })
            .map(|entry| ToolEndpoint {
                capability: Arc::clone(&entry.value().capability),
                endpoint: entry.key().endpoint.clone(),
                liveness: entry.value().liveness,
                in_flight: Arc::clone(&entry.value().in_flight),
            })
            .collect();

        endpoints.sort_by(|a, b| {
            b.liveness
                .score()
                .cmp(&a.liveness.score())
                .then_with(|| a.load().cmp(&b.load()))
                .then_with(|| a.endpoint.cmp(&b.endpoint))
        });

        endpoints
    }

    /// Selectable instances in rank order
    pub fn candidates(&self, query: &CapabilityQuery) -> Vec<ToolEndpoint> {
        self.discover(query)
            .into_iter()
            .filter(|endpoint| endpoint.liveness.is_selectable())
            .collect()
    }

    /// Best selectable instance or `NoAvailableInstance`
    pub fn select(&self, query: &CapabilityQuery) -> CoordResult<ToolEndpoint> {
        let selected = self
            .candidates(query)
            .into_iter()
            .next()
            .ok_or_else(|| CoordError::no_available_instance(&query.name))?;

        debug!(
            tool = %selected.capability.name,
            endpoint = %selected.endpoint,
            load = selected.load(),
            liveness = %selected.liveness,
            "Selected tool instance"
        );
        Ok(selected)
    }

    /// Apply one health poll result.
    ///
    /// A successful poll restores the instance to online. Each miss degrades it;
    /// `threshold` consecutive misses take it offline. Instances are never removed.
    pub fn record_poll(
        &self,
        key: &InstanceKey,
        reachable: bool,
        threshold: u32,
    ) -> Option<Liveness> {
        let mut instance = self.instances.get_mut(key)?;
        let previous = instance.liveness;

        instance.last_poll = Some(Utc::now());
        if reachable {
            instance.missed_polls = 0;
            instance.liveness = Liveness::Online;
        } else {
            instance.missed_polls = instance.missed_polls.saturating_add(1);
            instance.liveness = if instance.missed_polls >= threshold {
                Liveness::Offline
            } else {
                Liveness::Degraded
            };
        }

        if previous != instance.liveness {
            info!(
                tool = %key.name,
                endpoint = %key.endpoint,
                from = %previous,
                to = %instance.liveness,
                missed_polls = instance.missed_polls,
                "Tool instance liveness changed"
            );
        }

        Some(instance.liveness)
    }

    /// Keys of every registered instance
    pub fn instance_keys(&self) -> Vec<InstanceKey> {
        self.instances.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn statuses(&self) -> Vec<InstanceStatus> {
        let mut statuses: Vec<InstanceStatus> = self
            .instances
            .iter()
            .map(|entry| InstanceStatus {
                name: entry.key().name.clone(),
                version: entry.key().version.clone(),
                endpoint: entry.key().endpoint.clone(),
                liveness: entry.value().liveness,
                missed_polls: entry.value().missed_polls,
                load: entry.value().in_flight.load(Ordering::Relaxed),
                registered_at: entry.value().registered_at,
                last_poll: entry.value().last_poll,
            })
            .collect();
        statuses.sort_by(|a, b| {
            (&a.name, &a.version, &a.endpoint).cmp(&(&b.name, &b.version, &b.endpoint))
        });
        statuses
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn online_count(&self) -> usize {
        self.instances
            .iter()
            .filter(|entry| entry.value().liveness == Liveness::Online)
            .count()
    }
}
