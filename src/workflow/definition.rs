//! Workflow definitions
//!
//! A workflow is a set of steps forming a DAG over `depends_on`. Definitions
//! are checked once, when they are defined: unknown dependencies, duplicate
//! step ids and cycles are rejected before any execution exists.

use crate::error::{CoordError, CoordResult};
use crate::protocol::validate_id;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// What a step runs against
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepTarget {
    /// Invoke a registered tool through the tool layer
    Tool {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    /// Delegate to an agent offering the capability
    Agent { capability: String },
}

impl StepTarget {
    pub fn describe(&self) -> String {
        match self {
            StepTarget::Tool {
                name,
                version: Some(version),
            } => format!("tool:{name}@{version}"),
            StepTarget::Tool { name, version: None } => format!("tool:{name}"),
            StepTarget::Agent { capability } => format!("agent:{capability}"),
        }
    }
}

/// Whether a step's failure fails the workflow
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    #[default]
    Required,
    Optional,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowStep {
    pub id: String,
    pub target: StepTarget,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub policy: CompletionPolicy,
    /// Run even when a dependency was skipped
    #[serde(default)]
    pub tolerate_skipped: bool,
    /// Instruction handed to a delegated agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
    /// Static input merged with the workflow input
    #[serde(default)]
    pub input: Value,
}

impl WorkflowStep {
    pub fn tool(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            id,
            StepTarget::Tool {
                name: name.into(),
                version: None,
            },
        )
    }

    pub fn agent(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self::new(
            id,
            StepTarget::Agent {
                capability: capability.into(),
            },
        )
    }

    fn new(id: impl Into<String>, target: StepTarget) -> Self {
        Self {
            id: id.into(),
            target,
            depends_on: Vec::new(),
            policy: CompletionPolicy::Required,
            tolerate_skipped: false,
            instruction: None,
            input: Value::Null,
        }
    }

    pub fn after<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(dependencies.into_iter().map(Into::into));
        self
    }

    pub fn optional(mut self) -> Self {
        self.policy = CompletionPolicy::Optional;
        self
    }

    pub fn tolerating_skipped(mut self) -> Self {
        self.tolerate_skipped = true;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    pub fn is_required(&self) -> bool {
        self.policy == CompletionPolicy::Required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<WorkflowStep>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<WorkflowStep>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            steps,
        }
    }

    pub fn from_value(value: Value) -> CoordResult<Self> {
        serde_json::from_value(value)
            .map_err(|e| CoordError::schema(format!("workflow definition: {e}")))
    }

    pub fn step(&self, step_id: &str) -> Option<&WorkflowStep> {
        self.steps.iter().find(|step| step.id == step_id)
    }

    /// Check ids, dependencies and acyclicity, returning a topological order
    pub fn validate(&self) -> CoordResult<Vec<String>> {
        validate_id(&self.id)
            .map_err(|e| CoordError::invalid_input(format!("workflow id: {e}")))?;
        if self.steps.is_empty() {
            return Err(CoordError::invalid_input(format!(
                "workflow '{}' has no steps",
                self.id
            )));
        }

        let mut positions: HashMap<&str, usize> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            validate_id(&step.id)
                .map_err(|e| CoordError::invalid_input(format!("step id: {e}")))?;
            if positions.insert(step.id.as_str(), index).is_some() {
                return Err(CoordError::invalid_input(format!(
                    "duplicate step '{}' in workflow '{}'",
                    step.id, self.id
                )));
            }
        }
        for step in &self.steps {
            if let Some(missing) = step
                .depends_on
                .iter()
                .find(|dependency| !positions.contains_key(dependency.as_str()))
            {
                return Err(CoordError::invalid_input(format!(
                    "step '{}' depends on unknown step '{missing}'",
                    step.id
                )));
            }
        }

        self.topological_order()
    }

    /// Kahn's algorithm, ties broken by declaration order
    fn topological_order(&self) -> CoordResult<Vec<String>> {
        let mut in_degree: BTreeMap<usize, usize> = BTreeMap::new();
        let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
        for (index, step) in self.steps.iter().enumerate() {
            in_degree.insert(index, step.depends_on.len());
            for dependency in &step.depends_on {
                dependents.entry(dependency.as_str()).or_default().push(index);
            }
        }

        let mut queue: VecDeque<usize> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| *index)
            .collect();
        let mut order = Vec::with_capacity(self.steps.len());

        while let Some(index) = queue.pop_front() {
            let step = &self.steps[index];
            order.push(step.id.clone());
            for dependent in dependents.get(step.id.as_str()).into_iter().flatten() {
                if let Some(degree) = in_degree.get_mut(dependent) {
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(*dependent);
                    }
                }
            }
        }

        if order.len() != self.steps.len() {
            return Err(CoordError::CyclicWorkflow {
                workflow_id: self.id.clone(),
                cycle: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// One dependency cycle, for the error message
    fn find_cycle(&self) -> Vec<String> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            InProgress,
            Done,
        }

        fn visit<'a>(
            definition: &'a WorkflowDefinition,
            step_id: &'a str,
            marks: &mut HashMap<&'a str, Mark>,
            path: &mut Vec<&'a str>,
        ) -> Option<Vec<String>> {
            match marks.get(step_id).copied().unwrap_or(Mark::Unvisited) {
                Mark::Done => return None,
                Mark::InProgress => {
                    let start = path.iter().position(|id| *id == step_id).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        path[start..].iter().map(|id| id.to_string()).collect();
                    cycle.push(step_id.to_string());
                    return Some(cycle);
                }
                Mark::Unvisited => {}
            }

            marks.insert(step_id, Mark::InProgress);
            path.push(step_id);
            if let Some(step) = definition.step(step_id) {
                for dependency in &step.depends_on {
                    if let Some(cycle) = visit(definition, dependency, marks, path) {
                        return Some(cycle);
                    }
                }
            }
            path.pop();
            marks.insert(step_id, Mark::Done);
            None
        }

        let mut marks = HashMap::new();
        for step in &self.steps {
            let mut path = Vec::new();
            if let Some(cycle) = visit(self, &step.id, &mut marks, &mut path) {
                return cycle;
            }
        }
        Vec::new()
    }
}
