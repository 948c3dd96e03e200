//! Message router
//!
//! Validated messages enter a delivery ledger keyed by message id, so a
//! resubmitted id is a no-op. Each message then moves through
//! Queued -> Routed -> Delivered | Failed. Retryable failures go back to
//! Queued until the retry budget is spent.
//!
//! Messages bound to a session (session recipients, or payloads carrying a
//! `session_id`) run one at a time on a per-session lane in submission order.
//! Everything else runs concurrently.

use super::dispatch::DispatchTable;
use super::validator::MessageValidator;
use crate::config::RoutingConfig;
use crate::error::{CoordError, CoordResult};
use crate::observability::metrics::MetricsCollector;
use crate::protocol::{Intent, Layer, ProtocolMessage, Recipient};
use crate::transport::{Intake, LocalBus, RecipientFilter, SubmitResult, Subscription};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// How long an idle session lane lingers before it is retired
const LANE_IDLE: Duration = Duration::from_millis(500);

/// Base delay before a retryable failure is re-queued
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Delivery state of a routed message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    Queued,
    Routed,
    Delivered,
    Failed,
}

impl DeliveryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Delivered | DeliveryState::Failed)
    }
}

/// Ledger entry for one message id
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub message_id: Uuid,
    pub intent: Intent,
    pub layer: Layer,
    pub state: DeliveryState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Returned by [`MessageRouter::route`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryReceipt {
    pub message_id: Uuid,
    pub layer: Layer,
    pub state: DeliveryState,
    /// The id was already in the ledger; nothing was enqueued
    pub duplicate: bool,
}

/// Ledger counts for health reporting
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RouterStats {
    pub queued: usize,
    pub routed: usize,
    pub delivered: usize,
    pub failed: usize,
    pub active_lanes: usize,
    pub subscribers: usize,
}

struct Job {
    message: ProtocolMessage,
    _permit: OwnedSemaphorePermit,
}

struct RouterInner {
    sender_id: String,
    validator: MessageValidator,
    table: DispatchTable,
    bus: LocalBus,
    metrics: Arc<MetricsCollector>,
    ledger: DashMap<Uuid, DeliveryRecord>,
    lanes: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    capacity: Arc<Semaphore>,
    max_retries: u32,
}

/// Validates, deduplicates and dispatches protocol messages
#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("sender_id", &self.inner.sender_id)
            .field("table", &self.inner.table)
            .field("tracked", &self.inner.ledger.len())
            .finish()
    }
}

impl MessageRouter {
    pub fn new(
        sender_id: impl Into<String>,
        config: &RoutingConfig,
        table: DispatchTable,
        bus: LocalBus,
        metrics: Arc<MetricsCollector>,
    ) -> CoordResult<Self> {
        Ok(Self {
            inner: Arc::new(RouterInner {
                sender_id: sender_id.into(),
                validator: MessageValidator::new()?,
                table,
                bus,
                metrics,
                ledger: DashMap::new(),
                lanes: Mutex::new(HashMap::new()),
                capacity: Arc::new(Semaphore::new(config.queue_capacity.max(1))),
                max_retries: config.max_delivery_retries,
            }),
        })
    }

    pub fn validator(&self) -> &MessageValidator {
        &self.inner.validator
    }

    pub fn bus(&self) -> &LocalBus {
        &self.inner.bus
    }

    /// Validate and enqueue a message for its layer service.
    ///
    /// Routing an id that is already in the ledger returns its current state
    /// with `duplicate` set and has no other effect.
    pub fn route(&self, message: ProtocolMessage) -> CoordResult<DeliveryReceipt> {
        let inner = &self.inner;
        let validation = match inner.validator.validate(&message) {
            Ok(validation) => validation,
            Err(e) => {
                inner.metrics.message_rejected();
                debug!(message_id = %message.id, error = %e, "Message rejected");
                return Err(e);
            }
        };

        let permit = match inner.ledger.entry(message.id) {
            Entry::Occupied(existing) => {
                inner.metrics.duplicate_ignored();
                debug!(message_id = %message.id, state = ?existing.get().state, "Duplicate message ignored");
                return Ok(DeliveryReceipt {
                    message_id: message.id,
                    layer: existing.get().layer,
                    state: existing.get().state,
                    duplicate: true,
                });
            }
            Entry::Vacant(vacant) => {
                let permit = Arc::clone(&inner.capacity)
                    .try_acquire_owned()
                    .map_err(|_| CoordError::internal("routing queue is full"))?;
                vacant.insert(DeliveryRecord {
                    message_id: message.id,
                    intent: message.intent,
                    layer: validation.layer,
                    state: DeliveryState::Queued,
                    attempts: 0,
                    last_error: None,
                    expires_at: validation.expires_at,
                    updated_at: Utc::now(),
                });
                permit
            }
        };

        inner.metrics.message_routed();
        let receipt = DeliveryReceipt {
            message_id: message.id,
            layer: validation.layer,
            state: DeliveryState::Queued,
            duplicate: false,
        };

        let key = ordering_key(&message);
        self.enqueue(
            key,
            Job {
                message,
                _permit: permit,
            },
        );
        Ok(receipt)
    }

    fn enqueue(&self, key: Option<String>, job: Job) {
        let Some(key) = key else {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.process(job).await });
            return;
        };

        let mut lanes = self.inner.lanes.lock().unwrap_or_else(|e| e.into_inner());
        let job = match lanes.get(&key) {
            Some(lane) => match lane.send(job) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (lane, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so the first send cannot fail
        let _ = lane.send(job);
        lanes.insert(key.clone(), lane);
        drop(lanes);

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move { inner.run_lane(key, receiver).await });
    }

    /// Current ledger entry for a message
    pub fn delivery(&self, message_id: Uuid) -> Option<DeliveryRecord> {
        self.inner
            .ledger
            .get(&message_id)
            .map(|record| record.clone())
    }

    /// Wait until a message reaches Delivered or Failed
    pub async fn await_delivery(
        &self,
        message_id: Uuid,
        timeout: Duration,
    ) -> Option<DeliveryRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.delivery(message_id) {
                Some(record) if record.state.is_terminal() => return Some(record),
                _ if tokio::time::Instant::now() >= deadline => return self.delivery(message_id),
                _ => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    pub fn stats(&self) -> RouterStats {
        let mut stats = RouterStats::default();
        for record in self.inner.ledger.iter() {
            match record.state {
                DeliveryState::Queued => stats.queued += 1,
                DeliveryState::Routed => stats.routed += 1,
                DeliveryState::Delivered => stats.delivered += 1,
                DeliveryState::Failed => stats.failed += 1,
            }
        }
        stats.active_lanes = self
            .inner
            .lanes
            .lock()
            .map(|lanes| lanes.len())
            .unwrap_or_default();
        stats.subscribers = self.inner.bus.subscriber_count();
        stats
    }

    /// Drop terminal ledger entries whose message has expired.
    ///
    /// A resubmission of such an id fails validation as expired, so forgetting
    /// it cannot cause a second delivery.
    pub fn prune_expired(&self, now: DateTime<Utc>) -> usize {
        let before = self.inner.ledger.len();
        self.inner
            .ledger
            .retain(|_, record| !(record.state.is_terminal() && record.expires_at <= now));
        before - self.inner.ledger.len()
    }

    /// Periodically prune the ledger until shutdown
    pub fn spawn_maintenance(
        &self,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let pruned = router.prune_expired(Utc::now());
                        if pruned > 0 {
                            debug!(pruned, "Pruned expired delivery records");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Router maintenance stopping");
                        break;
                    }
                }
            }
        })
    }
}

impl RouterInner {
    async fn run_lane(self: Arc<Self>, key: String, mut receiver: mpsc::UnboundedReceiver<Job>) {
        loop {
            let job = match receiver.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Disconnected) => return,
                Err(TryRecvError::Empty) => {
                    match tokio::time::timeout(LANE_IDLE, receiver.recv()).await {
                        Ok(Some(job)) => job,
                        Ok(None) => return,
                        Err(_) => match self.retire_lane(&key, &mut receiver) {
                            Some(job) => job,
                            None => return,
                        },
                    }
                }
            };
            Arc::clone(&self).process(job).await;
        }
    }

    /// Remove an idle lane unless a job slipped in; senders hold the same lock
    fn retire_lane(&self, key: &str, receiver: &mut mpsc::UnboundedReceiver<Job>) -> Option<Job> {
        let mut lanes = self.lanes.lock().unwrap_or_else(|e| e.into_inner());
        match receiver.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                lanes.remove(key);
                debug!(lane = key, "Session lane retired");
                None
            }
        }
    }

    fn update(&self, message_id: Uuid, state: DeliveryState, error: Option<String>) -> u32 {
        match self.ledger.get_mut(&message_id) {
            Some(mut record) => {
                if state == DeliveryState::Routed {
                    record.attempts += 1;
                }
                record.state = state;
                if error.is_some() {
                    record.last_error = error;
                }
                record.updated_at = Utc::now();
                record.attempts
            }
            None => 0,
        }
    }

    async fn process(self: Arc<Self>, job: Job) {
        let message = &job.message;
        let span = crate::message_span!(message.id, message.intent, message.metadata.sender);

        async {
            loop {
                if message.is_expired() {
                    let error = CoordError::ExpiredMessage {
                        message_id: message.id,
                        expired_at: message.expires_at(),
                    };
                    self.fail(message, &error);
                    return;
                }

                let attempts = self.update(message.id, DeliveryState::Routed, None);
                let Some(handler) = self.table.handler(message.intent) else {
                    self.fail(message, &CoordError::internal("no handler for intent"));
                    return;
                };

                match handler.handle(message).await {
                    Ok(reply) => {
                        self.update(message.id, DeliveryState::Delivered, None);
                        self.metrics.message_delivered();
                        if let Some(reply) = reply {
                            self.bus.publish(reply);
                        }
                        debug!(attempts, "Message delivered");
                        return;
                    }
                    Err(e) if e.is_retryable() && attempts <= self.max_retries => {
                        warn!(attempts, error = %e, "Delivery failed, re-queueing");
                        self.update(message.id, DeliveryState::Queued, Some(e.to_string()));
                        self.metrics.message_retried();
                        tokio::time::sleep(RETRY_BACKOFF * attempts).await;
                    }
                    Err(e) => {
                        self.fail(message, &e);
                        return;
                    }
                }
            }
        }
        .instrument(span)
        .await
    }

    fn fail(&self, message: &ProtocolMessage, error: &CoordError) {
        warn!(message_id = %message.id, error = %error, "Delivery failed");
        self.update(message.id, DeliveryState::Failed, Some(error.to_string()));
        self.metrics.message_failed();
        // Errors about errors are dropped to avoid loops
        if message.intent != Intent::Error {
            self.bus
                .publish(error.to_error_message(message, &self.sender_id));
        }
    }
}

/// Session that must see this message in order, if any
fn ordering_key(message: &ProtocolMessage) -> Option<String> {
    if let Recipient::Session(session_id) = &message.metadata.recipient {
        return Some(session_id.clone());
    }
    match message.intent {
        Intent::AgentDirect | Intent::TaskDelegation => message
            .payload
            .get("session_id")
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

#[async_trait::async_trait]
impl Intake for MessageRouter {
    async fn submit(&self, envelope: Value) -> SubmitResult {
        self.inner.metrics.message_received();
        let message_id = envelope
            .get("id")
            .and_then(Value::as_str)
            .and_then(|id| Uuid::parse_str(id).ok());

        let message = match self.inner.validator.parse(envelope) {
            Ok(message) => message,
            Err(e) => {
                self.inner.metrics.message_rejected();
                return SubmitResult::rejected(message_id, e.to_error_payload());
            }
        };

        let id = message.id;
        match self.route(message) {
            Ok(receipt) => SubmitResult::accepted(receipt.message_id),
            Err(e) => SubmitResult::rejected(Some(id), e.to_error_payload()),
        }
    }

    fn subscribe(&self, filter: RecipientFilter) -> Subscription {
        self.inner.bus.subscribe(filter)
    }
}
