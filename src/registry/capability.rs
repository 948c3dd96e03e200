//! Tool capability metadata and liveness
//!
//! A [`ToolCapability`] describes what a tool does and what it costs to call
//! it: the scopes a caller needs and the risk level that decides whether a
//! human has to sign off first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Risk classification of a tool capability
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Safe,
    Sensitive,
    Dangerous,
}

impl RiskLevel {
    /// Sensitive and dangerous invocations need human approval
    pub fn requires_approval(&self) -> bool {
        !matches!(self, RiskLevel::Safe)
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskLevel::Safe => f.write_str("safe"),
            RiskLevel::Sensitive => f.write_str("sensitive"),
            RiskLevel::Dangerous => f.write_str("dangerous"),
        }
    }
}

/// Registered tool capability
///
/// The risk level is fixed for a given name and version. Changing it means
/// registering a new version.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCapability {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    pub risk: RiskLevel,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Inline JSON Schema for invocation arguments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
}

impl ToolCapability {
    pub fn new(name: impl Into<String>, version: impl Into<String>, risk: RiskLevel) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            required_scopes: Vec::new(),
            risk,
            description: String::new(),
            input_schema: None,
            output_schema: None,
        }
    }

    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Lookup by capability name, optionally pinned to a version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityQuery {
    pub name: String,
    pub version: Option<String>,
}

impl CapabilityQuery {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Liveness of an agent or tool instance
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Liveness {
    Online,
    Degraded,
    Offline,
}

impl Liveness {
    /// Ranking weight, higher is better
    pub fn score(&self) -> u8 {
        match self {
            Liveness::Online => 2,
            Liveness::Degraded => 1,
            Liveness::Offline => 0,
        }
    }

    pub fn is_selectable(&self) -> bool {
        !matches!(self, Liveness::Offline)
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Liveness::Online => f.write_str("online"),
            Liveness::Degraded => f.write_str("degraded"),
            Liveness::Offline => f.write_str("offline"),
        }
    }
}

/// Compare dotted version strings numerically where possible (`1.10 > 1.9`)
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(l), Some(r)) => {
                let ordering = match (l.parse::<u64>(), r.parse::<u64>()) {
                    (Ok(l), Ok(r)) => l.cmp(&r),
                    _ => l.cmp(r),
                };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_risk_requires_approval() {
        assert!(!RiskLevel::Safe.requires_approval());
        assert!(RiskLevel::Sensitive.requires_approval());
        assert!(RiskLevel::Dangerous.requires_approval());
        assert!(RiskLevel::Safe < RiskLevel::Dangerous);
    }

    #[test]
    fn test_capability_builder() {
        let capability = ToolCapability::new("email.send", "1.0.0", RiskLevel::Dangerous)
            .with_scopes(["email:send"])
            .with_input_schema(json!({"type": "object"}));

        assert_eq!(capability.required_scopes, vec!["email:send".to_string()]);
        assert!(capability.input_schema.is_some());

        let value = serde_json::to_value(&capability).unwrap();
        assert_eq!(value["risk"], "dangerous");
        assert!(value.get("description").is_none());
    }

    #[test]
    fn test_liveness_ranking() {
        assert!(Liveness::Online.score() > Liveness::Degraded.score());
        assert!(Liveness::Degraded.score() > Liveness::Offline.score());
        assert!(!Liveness::Offline.is_selectable());
    }

    #[test]
    fn test_version_comparison() {
        assert_eq!(compare_versions("1.10.0", "1.9.3"), Ordering::Greater);
        assert_eq!(compare_versions("2.0", "2.0"), Ordering::Equal);
        assert_eq!(compare_versions("2.0", "2.0.1"), Ordering::Less);
        assert_eq!(compare_versions("1.0-beta", "1.0-alpha"), Ordering::Greater);
    }
}
