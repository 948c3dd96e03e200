//! Human-in-the-loop approval queue
//!
//! Sensitive and dangerous invocations park here until a human approves or
//! rejects them, or until they expire. The terminal state of a request is set
//! exactly once, and an approval can authorize exactly one invocation. A
//! request whose waiter goes away is expired on the spot, so nobody can
//! approve an invocation that will never run.

use crate::error::{CoordError, CoordResult};
use crate::registry::capability::RiskLevel;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

/// Lifecycle of an approval request
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalState {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ApprovalState::Pending)
    }
}

/// The invocation an approval would authorize
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InvocationRef {
    pub tool: String,
    pub version: String,
    pub idempotency_key: String,
    /// Arguments shown to the approver
    #[serde(default)]
    pub arguments: Value,
}

/// A pending or decided approval
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub invocation: InvocationRef,
    pub risk: RiskLevel,
    pub requested_by: String,
    pub state: ApprovalState,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decided_at: Option<DateTime<Utc>>,
    /// Set once the approval has authorized its invocation
    #[serde(default)]
    pub consumed: bool,
}

struct ApprovalSlot {
    request: ApprovalRequest,
    state_tx: watch::Sender<ApprovalState>,
}

/// Expires the request if the waiting invocation is dropped undecided
struct WaitGuard<'a> {
    queue: &'a ApprovalQueue,
    id: Uuid,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.queue.abandon(self.id);
    }
}

/// Outcome of an [`ApprovalQueue::sweep`]
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApprovalSweep {
    pub expired: usize,
    pub evicted: usize,
}

/// Queue of approval requests
pub struct ApprovalQueue {
    requests: DashMap<Uuid, ApprovalSlot>,
    expiry: Duration,
    notifications: broadcast::Sender<ApprovalRequest>,
}

impl std::fmt::Debug for ApprovalQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalQueue")
            .field("requests", &self.requests.len())
            .field("expiry", &self.expiry)
            .finish()
    }
}

impl ApprovalQueue {
    pub fn new(expiry: Duration) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            requests: DashMap::new(),
            expiry,
            notifications,
        }
    }

    /// Stream of newly created requests, for approver front-ends
    pub fn notifications(&self) -> broadcast::Receiver<ApprovalRequest> {
        self.notifications.subscribe()
    }

    /// Create a pending request. Safe invocations never need one.
    pub fn submit(
        &self,
        invocation: InvocationRef,
        risk: RiskLevel,
        requested_by: &str,
    ) -> CoordResult<ApprovalRequest> {
        if !risk.requires_approval() {
            return Err(CoordError::invalid_input(format!(
                "tool '{}' is safe and needs no approval",
                invocation.tool
            )));
        }

        let now = Utc::now();
        let expires_at = now
            + ChronoDuration::from_std(self.expiry).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let request = ApprovalRequest {
            id: Uuid::new_v4(),
            invocation,
            risk,
            requested_by: requested_by.to_string(),
            state: ApprovalState::Pending,
            created_at: now,
            expires_at,
            decided_by: None,
            decided_at: None,
            consumed: false,
        };

        let (state_tx, _) = watch::channel(ApprovalState::Pending);
        self.requests.insert(
            request.id,
            ApprovalSlot {
                request: request.clone(),
                state_tx,
            },
        );

        info!(
            approval_id = %request.id,
            tool = %request.invocation.tool,
            risk = %risk,
            requested_by,
            expires_at = %request.expires_at,
            "Approval requested"
        );
        let _ = self.notifications.send(request.clone());
        Ok(request)
    }

    pub fn approve(&self, id: Uuid, approver: &str) -> CoordResult<ApprovalRequest> {
        self.decide(id, ApprovalState::Approved, approver)
    }

    pub fn reject(&self, id: Uuid, approver: &str) -> CoordResult<ApprovalRequest> {
        self.decide(id, ApprovalState::Rejected, approver)
    }

    fn decide(
        &self,
        id: Uuid,
        decision: ApprovalState,
        approver: &str,
    ) -> CoordResult<ApprovalRequest> {
        let mut slot = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| CoordError::invalid_input(format!("unknown approval {id}")))?;

        let now = Utc::now();
        if slot.request.state == ApprovalState::Pending && now >= slot.request.expires_at {
            Self::transition(&mut slot, ApprovalState::Expired, None, now);
        }

        match slot.request.state {
            ApprovalState::Pending => {
                Self::transition(&mut slot, decision, Some(approver), now);
                info!(approval_id = %id, state = ?decision, approver, "Approval decided");
                Ok(slot.request.clone())
            }
            ApprovalState::Expired => Err(CoordError::ApprovalTimeout {
                approval_id: id,
                expired_at: slot.request.expires_at,
            }),
            state => Err(CoordError::invalid_input(format!(
                "approval {id} already decided as {state:?}"
            ))),
        }
    }

    fn transition(
        slot: &mut ApprovalSlot,
        state: ApprovalState,
        approver: Option<&str>,
        now: DateTime<Utc>,
    ) {
        slot.request.state = state;
        slot.request.decided_at = Some(now);
        slot.request.decided_by = approver.map(str::to_string);
        slot.state_tx.send_replace(state);
    }

    /// Mark a still-pending request expired; returns the resulting state
    fn expire(&self, id: Uuid) -> Option<ApprovalState> {
        let mut slot = self.requests.get_mut(&id)?;
        if slot.request.state == ApprovalState::Pending {
            Self::transition(&mut slot, ApprovalState::Expired, None, Utc::now());
            warn!(approval_id = %id, tool = %slot.request.invocation.tool, "Approval expired");
        }
        Some(slot.request.state)
    }

    fn abandon(&self, id: Uuid) {
        if let Some(mut slot) = self.requests.get_mut(&id) {
            if slot.request.state == ApprovalState::Pending {
                Self::transition(&mut slot, ApprovalState::Expired, None, Utc::now());
                warn!(approval_id = %id, tool = %slot.request.invocation.tool, "Approval abandoned by its caller");
            }
        }
    }

    /// Expire overdue pending requests and drop terminal ones decided more
    /// than one expiry window ago.
    pub fn sweep(&self) -> ApprovalSweep {
        self.sweep_at(Utc::now(), self.expiry)
    }

    pub fn sweep_at(&self, now: DateTime<Utc>, retention: Duration) -> ApprovalSweep {
        let retention = ChronoDuration::from_std(retention).ok();
        let mut report = ApprovalSweep::default();

        for mut slot in self.requests.iter_mut() {
            if slot.request.state == ApprovalState::Pending && now >= slot.request.expires_at {
                Self::transition(&mut slot, ApprovalState::Expired, None, now);
                report.expired += 1;
            }
        }

        let before = self.requests.len();
        self.requests.retain(|_, slot| {
            let decided_at = match slot.request.decided_at {
                Some(at) if slot.request.state.is_terminal() => at,
                _ => return true,
            };
            retention
                .and_then(|retention| decided_at.checked_add_signed(retention))
                .map_or(true, |keep_until| now < keep_until)
        });
        report.evicted = before.saturating_sub(self.requests.len());

        report
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Block until the request is terminal or its expiry passes.
    ///
    /// Resolves to the approved request, `ApprovalRejected`, or `ApprovalTimeout`.
    pub async fn wait(&self, id: Uuid) -> CoordResult<ApprovalRequest> {
        let (mut state_rx, expires_at) = {
            let slot = self
                .requests
                .get(&id)
                .ok_or_else(|| CoordError::invalid_input(format!("unknown approval {id}")))?;
            (slot.state_tx.subscribe(), slot.request.expires_at)
        };

        let remaining = (expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let deadline = tokio::time::Instant::now() + remaining;

        loop {
            if state_rx.borrow_and_update().is_terminal() {
                break;
            }
            tokio::select! {
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline) => {
                    self.expire(id);
                    break;
                }
            }
        }

        let request = self
            .get(id)
            .ok_or_else(|| CoordError::invalid_input(format!("unknown approval {id}")))?;
        match request.state {
            ApprovalState::Approved => Ok(request),
            ApprovalState::Rejected => Err(CoordError::ApprovalRejected { approval_id: id }),
            ApprovalState::Expired | ApprovalState::Pending => Err(CoordError::ApprovalTimeout {
                approval_id: id,
                expired_at: request.expires_at,
            }),
        }
    }

    /// Spend an approval on its invocation. A second call fails.
    pub fn consume(&self, id: Uuid) -> CoordResult<ApprovalRequest> {
        let mut slot = self
            .requests
            .get_mut(&id)
            .ok_or_else(|| CoordError::invalid_input(format!("unknown approval {id}")))?;

        if slot.request.state != ApprovalState::Approved {
            return Err(CoordError::invalid_input(format!(
                "approval {id} is {:?}, not approved",
                slot.request.state
            )));
        }
        if slot.request.consumed {
            return Err(CoordError::invalid_input(format!(
                "approval {id} has already been used"
            )));
        }
        slot.request.consumed = true;
        Ok(slot.request.clone())
    }

    /// Submit, wait for a decision, and consume the approval
    pub async fn request_approval(
        &self,
        invocation: InvocationRef,
        risk: RiskLevel,
        requested_by: &str,
    ) -> CoordResult<ApprovalRequest> {
        let request = self.submit(invocation, risk, requested_by)?;
        let _guard = WaitGuard {
            queue: self,
            id: request.id,
        };
        self.wait(request.id).await?;
        self.consume(request.id)
    }

    pub fn get(&self, id: Uuid) -> Option<ApprovalRequest> {
        self.requests.get(&id).map(|slot| slot.request.clone())
    }

    /// Requests still awaiting a decision, oldest first
    pub fn pending(&self) -> Vec<ApprovalRequest> {
        let mut pending: Vec<ApprovalRequest> = self
            .requests
            .iter()
            .filter(|slot| slot.request.state == ApprovalState::Pending)
            .map(|slot| slot.request.clone())
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }
}
