//! Intake and delivery surface for coordination messages
//!
//! Callers hand raw envelopes to an [`Intake`] and read the messages addressed
//! to them from a [`Subscription`]. The in-process [`LocalBus`] carries outbound
//! messages; network front-ends sit outside this crate and adapt to the trait.

use crate::protocol::{canonicalize_topic, ErrorPayload, ProtocolMessage, Recipient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod bus;

pub use bus::{LocalBus, Subscription};

/// Result of handing an envelope to the intake
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitResult {
    pub accepted: bool,
    /// Id of the submitted message, when the envelope carried a readable one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl SubmitResult {
    pub fn accepted(message_id: Uuid) -> Self {
        Self {
            accepted: true,
            message_id: Some(message_id),
            error: None,
        }
    }

    pub fn rejected(message_id: Option<Uuid>, error: ErrorPayload) -> Self {
        Self {
            accepted: false,
            message_id,
            error: Some(error),
        }
    }
}

/// Which outbound messages a subscriber receives
#[derive(Debug, Clone, PartialEq)]
pub enum RecipientFilter {
    /// Messages addressed to exactly this recipient
    Recipient(Recipient),
    /// Messages sent by this agent
    Sender(String),
    /// Messages published on this topic or any topic below it
    Topic(String),
    /// Every message in one conversation
    Correlation(Uuid),
    Any,
}

impl RecipientFilter {
    pub fn agent(agent_id: impl Into<String>) -> Self {
        RecipientFilter::Recipient(Recipient::Agent(agent_id.into()))
    }

    pub fn matches(&self, message: &ProtocolMessage) -> bool {
        match self {
            RecipientFilter::Recipient(recipient) => &message.metadata.recipient == recipient,
            RecipientFilter::Sender(sender) => &message.metadata.sender == sender,
            RecipientFilter::Topic(topic) => match &message.metadata.recipient {
                Recipient::Topic(published) => {
                    let filter = canonicalize_topic(topic);
                    let published = canonicalize_topic(published);
                    published == filter || published.starts_with(&format!("{filter}/"))
                }
                _ => false,
            },
            RecipientFilter::Correlation(id) => &message.metadata.correlation_id == id,
            RecipientFilter::Any => true,
        }
    }
}

/// Entry point for callers of the coordination protocol
#[async_trait::async_trait]
pub trait Intake: Send + Sync {
    /// Validate and route a raw envelope
    async fn submit(&self, envelope: Value) -> SubmitResult;

    /// Stream of outbound messages matching `filter`
    fn subscribe(&self, filter: RecipientFilter) -> Subscription;
}
