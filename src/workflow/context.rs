//! Context handed to a step from the steps it depends on

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextEntry {
    pub step_id: String,
    pub output: Value,
}

/// Dependency outputs bounded to a character budget
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContextPackage {
    pub entries: Vec<ContextEntry>,
    /// Characters of serialized output included
    pub size: usize,
    /// Older outputs were dropped to fit the budget
    pub truncated: bool,
}

impl ContextPackage {
    /// Build from outputs ordered oldest first. The oldest outputs are dropped
    /// until the rest fit within `max_chars`.
    pub fn build(outputs: Vec<(String, Value)>, max_chars: usize) -> Self {
        let sizes: Vec<usize> = outputs
            .iter()
            .map(|(_, output)| output.to_string().chars().count())
            .collect();

        let mut size: usize = sizes.iter().sum();
        let mut skip = 0;
        while size > max_chars && skip < sizes.len() {
            size -= sizes[skip];
            skip += 1;
        }

        Self {
            entries: outputs
                .into_iter()
                .skip(skip)
                .map(|(step_id, output)| ContextEntry { step_id, output })
                .collect(),
            size,
            truncated: skip > 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
