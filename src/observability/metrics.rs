//! Thread-safe metrics collection
//!
//! Atomic counters for the hot paths (routing, invocations, approvals,
//! workflows) and a mutex-protected map for per-tool timing. One collector is
//! built at startup and shared by `Arc`.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Timing samples kept per tool
const MAX_TIMING_SAMPLES: usize = 1000;

/// Thread-safe metrics collector using atomics and mutexes
#[derive(Debug)]
pub struct MetricsCollector {
    // Routing
    messages_received: AtomicU64,
    messages_rejected: AtomicU64,
    messages_routed: AtomicU64,
    messages_delivered: AtomicU64,
    messages_failed: AtomicU64,
    messages_retried: AtomicU64,
    duplicates_ignored: AtomicU64,

    // Tool invocations
    invocations_in_flight: AtomicU64,
    invocations_succeeded: AtomicU64,
    invocations_failed: AtomicU64,
    dispatch_retries: AtomicU64,
    failovers: AtomicU64,
    circuit_trips: AtomicU64,
    circuit_fast_fails: AtomicU64,
    idempotent_replays: AtomicU64,

    // Security
    auth_failures: AtomicU64,
    rate_limit_denials: AtomicU64,
    approvals_requested: AtomicU64,
    approvals_granted: AtomicU64,
    approvals_rejected: AtomicU64,
    approvals_expired: AtomicU64,

    // Workflows
    workflows_queued: AtomicU64,
    workflows_active: AtomicU64,
    workflows_completed: AtomicU64,
    workflows_failed: AtomicU64,
    workflows_cancelled: AtomicU64,
    steps_completed: AtomicU64,
    steps_failed: AtomicU64,
    steps_skipped: AtomicU64,
    sessions_recovered: AtomicU64,

    tool_stats: Mutex<HashMap<String, ToolExecutionStats>>,
    uptime_start: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            messages_received: AtomicU64::new(0),
            messages_rejected: AtomicU64::new(0),
            messages_routed: AtomicU64::new(0),
            messages_delivered: AtomicU64::new(0),
            messages_failed: AtomicU64::new(0),
            messages_retried: AtomicU64::new(0),
            duplicates_ignored: AtomicU64::new(0),
            invocations_in_flight: AtomicU64::new(0),
            invocations_succeeded: AtomicU64::new(0),
            invocations_failed: AtomicU64::new(0),
            dispatch_retries: AtomicU64::new(0),
            failovers: AtomicU64::new(0),
            circuit_trips: AtomicU64::new(0),
            circuit_fast_fails: AtomicU64::new(0),
            idempotent_replays: AtomicU64::new(0),
            auth_failures: AtomicU64::new(0),
            rate_limit_denials: AtomicU64::new(0),
            approvals_requested: AtomicU64::new(0),
            approvals_granted: AtomicU64::new(0),
            approvals_rejected: AtomicU64::new(0),
            approvals_expired: AtomicU64::new(0),
            workflows_queued: AtomicU64::new(0),
            workflows_active: AtomicU64::new(0),
            workflows_completed: AtomicU64::new(0),
            workflows_failed: AtomicU64::new(0),
            workflows_cancelled: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            sessions_recovered: AtomicU64::new(0),
            tool_stats: Mutex::new(HashMap::new()),
            uptime_start: AtomicU64::new(current_timestamp()),
        }
    }

    // Routing metrics
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_rejected(&self) {
        self.messages_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_routed(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_failed(&self) {
        self.messages_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn message_retried(&self) {
        self.messages_retried.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_ignored(&self) {
        self.duplicates_ignored.fetch_add(1, Ordering::Relaxed);
    }

    // Invocation metrics
    pub fn invocation_started(&self) {
        self.invocations_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invocation_finished(&self, tool: &str, duration: Duration, success: bool) {
        self.invocations_in_flight.fetch_sub(1, Ordering::Relaxed);
        if success {
            self.invocations_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.invocations_failed.fetch_add(1, Ordering::Relaxed);
        }

        if let Ok(mut stats) = self.tool_stats.lock() {
            let entry = stats
                .entry(tool.to_string())
                .or_insert_with(|| ToolExecutionStats::new(tool));
            entry.record(duration, success);
        }
    }

    pub fn dispatch_retried(&self) {
        self.dispatch_retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_tripped(&self) {
        self.circuit_trips.fetch_add(1, Ordering::Relaxed);
    }

    pub fn circuit_fast_failed(&self) {
        self.circuit_fast_fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn idempotent_replay(&self) {
        self.idempotent_replays.fetch_add(1, Ordering::Relaxed);
    }

    // Security metrics
    pub fn auth_failed(&self) {
        self.auth_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit_denied(&self) {
        self.rate_limit_denials.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approval_requested(&self) {
        self.approvals_requested.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approval_granted(&self) {
        self.approvals_granted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approval_rejected(&self) {
        self.approvals_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn approval_expired(&self) {
        self.approvals_expired.fetch_add(1, Ordering::Relaxed);
    }

    // Workflow metrics
    pub fn workflow_queued(&self) {
        self.workflows_queued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_started(&self) {
        decrement(&self.workflows_queued);
        self.workflows_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_completed(&self) {
        decrement(&self.workflows_active);
        self.workflows_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_failed(&self) {
        decrement(&self.workflows_active);
        self.workflows_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn workflow_cancelled(&self) {
        decrement(&self.workflows_active);
        self.workflows_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_completed(&self) {
        self.steps_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_failed(&self) {
        self.steps_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn step_skipped(&self) {
        self.steps_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_recovered(&self) {
        self.sessions_recovered.fetch_add(1, Ordering::Relaxed);
    }

    /// Get complete metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages: MessageMetrics {
                received: load(&self.messages_received),
                rejected: load(&self.messages_rejected),
                routed: load(&self.messages_routed),
                delivered: load(&self.messages_delivered),
                failed: load(&self.messages_failed),
                retried: load(&self.messages_retried),
                duplicates_ignored: load(&self.duplicates_ignored),
            },
            invocations: InvocationMetrics {
                in_flight: load(&self.invocations_in_flight),
                succeeded: load(&self.invocations_succeeded),
                failed: load(&self.invocations_failed),
                dispatch_retries: load(&self.dispatch_retries),
                failovers: load(&self.failovers),
                circuit_trips: load(&self.circuit_trips),
                circuit_fast_fails: load(&self.circuit_fast_fails),
                idempotent_replays: load(&self.idempotent_replays),
                tools: self.tool_snapshots(),
            },
            security: SecurityMetrics {
                auth_failures: load(&self.auth_failures),
                rate_limit_denials: load(&self.rate_limit_denials),
                approvals_requested: load(&self.approvals_requested),
                approvals_granted: load(&self.approvals_granted),
                approvals_rejected: load(&self.approvals_rejected),
                approvals_expired: load(&self.approvals_expired),
            },
            workflows: WorkflowMetrics {
                queued: load(&self.workflows_queued),
                active: load(&self.workflows_active),
                completed: load(&self.workflows_completed),
                failed: load(&self.workflows_failed),
                cancelled: load(&self.workflows_cancelled),
                steps_completed: load(&self.steps_completed),
                steps_failed: load(&self.steps_failed),
                steps_skipped: load(&self.steps_skipped),
                sessions_recovered: load(&self.sessions_recovered),
            },
            uptime_seconds: now.saturating_sub(load(&self.uptime_start)),
            timestamp: now,
        }
    }

    fn tool_snapshots(&self) -> HashMap<String, ToolExecutionStatsSnapshot> {
        self.tool_stats
            .lock()
            .map(|stats| {
                stats
                    .iter()
                    .map(|(name, stats)| (name.clone(), stats.snapshot()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
        Some(v.saturating_sub(1))
    });
}

// Internal tool statistics (with timing data)
#[derive(Debug)]
struct ToolExecutionStats {
    name: String,
    executions: u64,
    failures: u64,
    execution_times: Vec<u64>, // milliseconds
    last_execution: u64,
}

impl ToolExecutionStats {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            executions: 0,
            failures: 0,
            execution_times: Vec::new(),
            last_execution: 0,
        }
    }

    fn record(&mut self, duration: Duration, success: bool) {
        self.executions += 1;
        self.last_execution = current_timestamp();
        self.execution_times.push(duration.as_millis() as u64);
        if self.execution_times.len() > MAX_TIMING_SAMPLES {
            self.execution_times.remove(0);
        }
        if !success {
            self.failures += 1;
        }
    }

    fn snapshot(&self) -> ToolExecutionStatsSnapshot {
        let mut sorted = self.execution_times.clone();
        sorted.sort_unstable();

        let avg_execution_time_ms = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<u64>() as f64 / sorted.len() as f64
        };

        let success_rate = if self.executions == 0 {
            0.0
        } else {
            (self.executions - self.failures) as f64 / self.executions as f64
        };

        ToolExecutionStatsSnapshot {
            name: self.name.clone(),
            executions: self.executions,
            failures: self.failures,
            avg_execution_time_ms,
            p95_execution_time_ms: percentile(&sorted, 95.0),
            last_execution: self.last_execution,
            success_rate,
        }
    }
}

// Public metrics structures
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages: MessageMetrics,
    pub invocations: InvocationMetrics,
    pub security: SecurityMetrics,
    pub workflows: WorkflowMetrics,
    pub uptime_seconds: u64,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MessageMetrics {
    pub received: u64,
    pub rejected: u64,
    pub routed: u64,
    pub delivered: u64,
    pub failed: u64,
    pub retried: u64,
    pub duplicates_ignored: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvocationMetrics {
    pub in_flight: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dispatch_retries: u64,
    pub failovers: u64,
    pub circuit_trips: u64,
    pub circuit_fast_fails: u64,
    pub idempotent_replays: u64,
    pub tools: HashMap<String, ToolExecutionStatsSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolExecutionStatsSnapshot {
    pub name: String,
    pub executions: u64,
    pub failures: u64,
    pub avg_execution_time_ms: f64,
    pub p95_execution_time_ms: f64,
    pub last_execution: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SecurityMetrics {
    pub auth_failures: u64,
    pub rate_limit_denials: u64,
    pub approvals_requested: u64,
    pub approvals_granted: u64,
    pub approvals_rejected: u64,
    pub approvals_expired: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetrics {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub sessions_recovered: u64,
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn percentile(sorted_values: &[u64], percentile: f64) -> f64 {
    if sorted_values.is_empty() {
        return 0.0;
    }

    let index = (percentile / 100.0) * (sorted_values.len() - 1) as f64;
    let lower = index.floor() as usize;
    let upper = index.ceil() as usize;

    if lower == upper {
        sorted_values[lower] as f64
    } else {
        let weight = index - lower as f64;
        sorted_values[lower] as f64 * (1.0 - weight) + sorted_values[upper] as f64 * weight
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_counters() {
        let metrics = MetricsCollector::new();
        metrics.message_received();
        metrics.message_routed();
        metrics.message_delivered();
        metrics.duplicate_ignored();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.messages.received, 1);
        assert_eq!(snapshot.messages.delivered, 1);
        assert_eq!(snapshot.messages.duplicates_ignored, 1);
        assert_eq!(snapshot.messages.failed, 0);
    }

    #[test]
    fn test_invocation_tool_stats() {
        let metrics = MetricsCollector::new();
        metrics.invocation_started();
        metrics.invocation_started();
        metrics.invocation_finished("email.send", Duration::from_millis(100), true);
        metrics.invocation_finished("email.send", Duration::from_millis(300), false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invocations.in_flight, 0);
        assert_eq!(snapshot.invocations.succeeded, 1);
        assert_eq!(snapshot.invocations.failed, 1);

        let tool = &snapshot.invocations.tools["email.send"];
        assert_eq!(tool.executions, 2);
        assert_eq!(tool.avg_execution_time_ms, 200.0);
        assert_eq!(tool.success_rate, 0.5);
    }

    #[test]
    fn test_workflow_gauges_never_underflow() {
        let metrics = MetricsCollector::new();
        metrics.workflow_completed();
        metrics.workflow_queued();
        metrics.workflow_started();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.workflows.queued, 0);
        assert_eq!(snapshot.workflows.active, 1);
        assert_eq!(snapshot.workflows.completed, 1);
    }

    #[test]
    fn test_percentile() {
        assert_eq!(percentile(&[], 95.0), 0.0);
        assert_eq!(percentile(&[10], 95.0), 10.0);
        assert_eq!(percentile(&[0, 100], 50.0), 50.0);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().snapshot()).unwrap();
        assert!(json["messages"]["routed"].is_number());
        assert!(json["workflows"]["sessions_recovered"].is_number());
    }
}
