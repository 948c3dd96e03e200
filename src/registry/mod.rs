//! Capability discovery for tools and agents
//!
//! Tools are registered per (name, version, endpoint) and selected by health
//! and load. Agents announce themselves by heartbeat.

pub mod agents;
pub mod capability;
pub mod poller;
pub mod tools;

pub use agents::{AgentDirectory, AgentProfile, SweepReport};
pub use capability::{CapabilityQuery, Liveness, RiskLevel, ToolCapability};
pub use poller::{HealthPoller, HealthProbe, HttpHealthProbe, PollReport};
pub use tools::{InstanceKey, InstanceStatus, LoadGuard, ToolEndpoint, ToolRegistry};
