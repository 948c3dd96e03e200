//! In-process publish/subscribe bus
//!
//! Outbound messages fan out to every subscriber over a tokio broadcast
//! channel; each [`Subscription`] filters for its recipient.

use super::RecipientFilter;
use crate::protocol::ProtocolMessage;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct LocalBus {
    sender: broadcast::Sender<Arc<ProtocolMessage>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber; returns how many received it
    pub fn publish(&self, message: ProtocolMessage) -> usize {
        let message_id = message.id;
        match self.sender.send(Arc::new(message)) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(%message_id, "Published with no subscribers");
                0
            }
        }
    }

    pub fn subscribe(&self, filter: RecipientFilter) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// Filtered view of the bus
#[derive(Debug)]
pub struct Subscription {
    receiver: broadcast::Receiver<Arc<ProtocolMessage>>,
    filter: RecipientFilter,
}

impl Subscription {
    /// Next matching message, or `None` once the bus is gone
    pub async fn recv(&mut self) -> Option<ProtocolMessage> {
        loop {
            match self.receiver.recv().await {
                Ok(message) if self.filter.matches(&message) => {
                    return Some(message.as_ref().clone())
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "Subscriber lagged behind the bus");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Matching message already buffered, without waiting
    pub fn try_recv(&mut self) -> Option<ProtocolMessage> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) if self.filter.matches(&message) => {
                    return Some(message.as_ref().clone())
                }
                Ok(_) => continue,
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, filter = ?self.filter, "Subscriber lagged behind the bus");
                }
                Err(_) => return None,
            }
        }
    }

    pub fn filter(&self) -> &RecipientFilter {
        &self.filter
    }
}
