//! Namespaced keys for the typed state stores
//!
//! Each component keeps its own store (registry, checkpoints, approvals,
//! audit). Keys are built here so prefixes come from one configuration
//! section and never collide.

use crate::config::NamespaceConfig;

const SEPARATOR: char = ':';

/// Key builders for the configured namespaces
#[derive(Debug, Clone)]
pub struct Namespaces {
    agent: String,
    workflow: String,
    event: String,
    metrics: String,
}

impl Namespaces {
    pub fn new(config: &NamespaceConfig) -> Self {
        Self {
            agent: config.agent.clone(),
            workflow: config.workflow.clone(),
            event: config.event.clone(),
            metrics: config.metrics.clone(),
        }
    }

    /// Key for an agent profile, e.g. `agent_coordination:agent:planner`
    pub fn agent_key(&self, agent_id: &str) -> String {
        join(&[&self.agent, "agent", agent_id])
    }

    /// Key for a registered tool instance
    pub fn tool_key(&self, name: &str, version: &str, endpoint: &str) -> String {
        join(&[&self.agent, "tool", name, version, endpoint])
    }

    /// Key for an approval request
    pub fn approval_key(&self, approval_id: &str) -> String {
        join(&[&self.agent, "approval", approval_id])
    }

    /// Key for a session's checkpoint
    pub fn checkpoint_key(&self, session_id: &str) -> String {
        join(&[&self.workflow, "checkpoint", session_id])
    }

    /// Prefix under which all checkpoints live
    pub fn checkpoint_prefix(&self) -> String {
        join(&[&self.workflow, "checkpoint"])
    }

    /// Key for a workflow definition
    pub fn definition_key(&self, workflow_id: &str) -> String {
        join(&[&self.workflow, "definition", workflow_id])
    }

    /// Key for an audit record or published event stream
    pub fn event_key(&self, stream: &str, sequence: u64) -> String {
        join(&[&self.event, stream, &sequence.to_string()])
    }

    /// Metric name under the metrics namespace
    pub fn metric_key(&self, metric: &str) -> String {
        join(&[&self.metrics, metric])
    }

    pub fn workflow_prefix(&self) -> &str {
        &self.workflow
    }
}

impl Default for Namespaces {
    fn default() -> Self {
        Self::new(&NamespaceConfig::default())
    }
}

fn join(parts: &[&str]) -> String {
    let mut key = String::new();
    for (index, part) in parts.iter().enumerate() {
        if index > 0 {
            key.push(SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_keys() {
        let namespaces = Namespaces::default();
        assert_eq!(
            namespaces.agent_key("planner"),
            "agent_coordination:agent:planner"
        );
        assert_eq!(
            namespaces.checkpoint_key("session-1"),
            "workflow:checkpoint:session-1"
        );
        assert_eq!(namespaces.event_key("audit", 7), "events:audit:7");
        assert_eq!(
            namespaces.metric_key("messages_routed"),
            "metrics:messages_routed"
        );
    }

    #[test]
    fn test_custom_prefixes_do_not_collide() {
        let namespaces = Namespaces::new(&NamespaceConfig {
            agent: "a".to_string(),
            workflow: "w".to_string(),
            event: "e".to_string(),
            metrics: "m".to_string(),
        });
        assert!(namespaces
            .checkpoint_key("s")
            .starts_with(&namespaces.checkpoint_prefix()));
        assert_ne!(namespaces.agent_key("s"), namespaces.checkpoint_key("s"));
        assert_eq!(
            namespaces.tool_key("t", "1.0", "http://h"),
            "a:tool:t:1.0:http://h"
        );
    }
}
