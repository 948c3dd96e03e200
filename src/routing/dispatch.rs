//! Intent to layer handler dispatch table

use crate::error::{CoordError, CoordResult};
use crate::protocol::{Intent, Layer, ProtocolMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// A layer service entry point for routed messages.
///
/// Returns an optional reply, published back to the sender. Errors are turned
/// into `error` envelopes by the router.
#[async_trait]
pub trait LayerHandler: Send + Sync {
    fn layer(&self) -> Layer;

    async fn handle(&self, message: &ProtocolMessage) -> CoordResult<Option<ProtocolMessage>>;
}

/// Complete mapping from intent to handler
#[derive(Clone)]
pub struct DispatchTable {
    handlers: HashMap<Intent, Arc<dyn LayerHandler>>,
}

impl std::fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut routes: Vec<(Intent, Layer)> = self
            .handlers
            .iter()
            .map(|(intent, handler)| (*intent, handler.layer()))
            .collect();
        routes.sort_by_key(|(intent, _)| *intent);
        f.debug_struct("DispatchTable")
            .field("routes", &routes)
            .finish()
    }
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    pub fn handler(&self, intent: Intent) -> Option<&Arc<dyn LayerHandler>> {
        self.handlers.get(&intent)
    }
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<Intent, Arc<dyn LayerHandler>>,
}

impl DispatchTableBuilder {
    pub fn route(mut self, intent: Intent, handler: Arc<dyn LayerHandler>) -> Self {
        self.handlers.insert(intent, handler);
        self
    }

    /// Route every intent owned by the handler's layer to it
    pub fn layer(mut self, handler: Arc<dyn LayerHandler>) -> Self {
        let layer = handler.layer();
        for intent in Intent::ALL.into_iter().filter(|i| i.layer() == layer) {
            self.handlers.insert(intent, Arc::clone(&handler));
        }
        self
    }

    /// Fails unless every intent has a handler of the owning layer
    pub fn build(self) -> CoordResult<DispatchTable> {
        let missing: Vec<&str> = Intent::ALL
            .iter()
            .filter(|intent| !self.handlers.contains_key(intent))
            .map(|intent| intent.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(CoordError::internal(format!(
                "dispatch table has no handler for: {}",
                missing.join(", ")
            )));
        }

        for (intent, handler) in &self.handlers {
            if handler.layer() != intent.layer() {
                return Err(CoordError::internal(format!(
                    "intent {intent} belongs to {} but is routed to {}",
                    intent.layer(),
                    handler.layer()
                )));
            }
        }

        Ok(DispatchTable {
            handlers: self.handlers,
        })
    }
}
