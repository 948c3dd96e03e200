//! DAG workflows, their executions and checkpoint recovery

pub mod context;
pub mod definition;
pub mod execution;
pub mod scheduler;
pub mod store;

pub use context::{ContextEntry, ContextPackage};
pub use definition::{CompletionPolicy, StepTarget, WorkflowDefinition, WorkflowStep};
pub use execution::{
    Advance, Checkpoint, ExecutionStatus, StepRecord, StepState, WorkflowExecution,
};
pub use scheduler::{
    within_step_timeout, RecoveredSession, RecoveryReport, SchedulerSettings, StepExecutor,
    StepRequest, WorkflowScheduler,
};
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore, StoreError};
