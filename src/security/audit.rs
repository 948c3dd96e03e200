//! Append-only audit log
//!
//! Every authorization, approval and rate-limit decision is recorded. Each
//! record links to its predecessor through `prev_hash`, so editing or dropping
//! a record breaks the chain. Sinks are write-only; nothing in the
//! coordinator reads the audit log to make a decision.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;
use uuid::Uuid;

/// `prev_hash` of the first record in a chain
pub const GENESIS_HASH: &str = "genesis";

/// Result of an audited decision or operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Allowed,
    Denied,
    Approved,
    Rejected,
    Expired,
    Succeeded,
    Failed,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value = match self {
            AuditOutcome::Allowed => "allowed",
            AuditOutcome::Denied => "denied",
            AuditOutcome::Approved => "approved",
            AuditOutcome::Rejected => "rejected",
            AuditOutcome::Expired => "expired",
            AuditOutcome::Succeeded => "succeeded",
            AuditOutcome::Failed => "failed",
        };
        f.write_str(value)
    }
}

/// One audit log entry. Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuditRecord {
    pub sequence: u64,
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub target: String,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditRecord {
    /// Recompute the hash from the record's fields
    pub fn recompute_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.sequence.to_be_bytes());
        hasher.update(self.id.to_string());
        hasher.update(self.timestamp.to_rfc3339());
        hasher.update(&self.actor);
        hasher.update(&self.action);
        hasher.update(&self.target);
        hasher.update(self.outcome.to_string());
        hasher.update(self.detail.as_deref().unwrap_or_default());
        hasher.update(&self.prev_hash);
        hex::encode(hasher.finalize())
    }
}

/// Audit sink failures
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("audit record serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Where audit records are written
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// In-memory sink for embedding and tests
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: StdMutex<Vec<AuditRecord>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far
    pub fn records(&self) -> Vec<AuditRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
        Ok(())
    }
}

/// JSON-lines file sink, one record per line
#[derive(Debug)]
pub struct JsonlAuditSink {
    path: PathBuf,
}

impl JsonlAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in the file, for offline verification
    pub async fn load(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(AuditError::from))
            .collect()
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[derive(Debug)]
struct ChainHead {
    next_sequence: u64,
    last_hash: String,
}

/// Hash-chained audit writer
pub struct AuditLog {
    sink: Arc<dyn AuditSink>,
    head: Mutex<ChainHead>,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog").finish_non_exhaustive()
    }
}

impl AuditLog {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self::resume(sink, None)
    }

    /// Continue an existing chain after its last record
    pub fn resume(sink: Arc<dyn AuditSink>, last: Option<&AuditRecord>) -> Self {
        let head = match last {
            Some(last) => ChainHead {
                next_sequence: last.sequence + 1,
                last_hash: last.entry_hash.clone(),
            },
            None => ChainHead {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            },
        };
        Self {
            sink,
            head: Mutex::new(head),
        }
    }

    /// Append a record. Sink failures are logged and never reach the caller.
    pub async fn record(
        &self,
        actor: &str,
        action: &str,
        target: &str,
        outcome: AuditOutcome,
        detail: Option<String>,
    ) -> Option<AuditRecord> {
        let mut head = self.head.lock().await;

        let mut record = AuditRecord {
            sequence: head.next_sequence,
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            actor: actor.to_string(),
            action: action.to_string(),
            target: target.to_string(),
            outcome,
            detail,
            prev_hash: head.last_hash.clone(),
            entry_hash: String::new(),
        };
        record.entry_hash = record.recompute_hash();

        match self.sink.append(&record).await {
            Ok(()) => {
                head.next_sequence += 1;
                head.last_hash = record.entry_hash.clone();
                Some(record)
            }
            Err(e) => {
                error!(
                    actor,
                    action,
                    target,
                    outcome = %outcome,
                    error = %e,
                    "Failed to write audit record"
                );
                None
            }
        }
    }
}

/// Where a chain stops verifying
#[derive(Debug, Error, PartialEq)]
pub enum ChainError {
    #[error("record {sequence} hash does not match its contents")]
    HashMismatch { sequence: u64 },
    #[error("record {sequence} does not link to its predecessor")]
    BrokenLink { sequence: u64 },
    #[error("record {sequence} is out of order")]
    OutOfOrder { sequence: u64 },
}

/// Verify a contiguous run of records starting at the genesis record
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), ChainError> {
    let mut expected_prev = GENESIS_HASH.to_string();
    for (index, record) in records.iter().enumerate() {
        if record.sequence != index as u64 {
            return Err(ChainError::OutOfOrder {
                sequence: record.sequence,
            });
        }
        if record.prev_hash != expected_prev {
            return Err(ChainError::BrokenLink {
                sequence: record.sequence,
            });
        }
        if record.recompute_hash() != record.entry_hash {
            return Err(ChainError::HashMismatch {
                sequence: record.sequence,
            });
        }
        expected_prev = record.entry_hash.clone();
    }
    Ok(())
}
