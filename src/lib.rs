//! agentmesh - three-layer agent coordination
//!
//! A coordinator that sits between agents, tools and workflows:
//! - MCP layer: authorized, schema-checked tool invocation with retries,
//!   failover, circuit breaking and approval gating
//! - A2A layer: ordered direct messages, capability negotiation and task
//!   delegation between agents
//! - ACP layer: DAG workflows bound to sessions, checkpointed after every
//!   transition and recovered on restart
//!
//! Every message passes through [`routing::MessageRouter`], which validates
//! the envelope, deduplicates by id and hands it to the owning layer.
//!
//! # Quick Start
//!
//! ```rust
//! use agentmesh::protocol::{Intent, ProtocolMessage, Recipient};
//! use serde_json::json;
//!
//! let request = ProtocolMessage::new(
//!     Intent::ToolRequest,
//!     "planner",
//!     Recipient::Tool("calendar.create_event".to_string()),
//!     json!({"tool": "calendar.create_event", "arguments": {}, "auth_token": "..."}),
//! );
//! assert_eq!(request.metadata.correlation_id, request.id);
//! let envelope = serde_json::to_value(&request).unwrap();
//! assert_eq!(envelope["intent"], "tool-request");
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod health;
pub mod layers;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod routing;
pub mod security;
pub mod storage;
pub mod testing;
pub mod transport;
pub mod workflow;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use error::{CoordError, CoordResult, FailureKind};
pub use protocol::{Intent, Layer, ProtocolMessage, Recipient};
pub use transport::{Intake, RecipientFilter, SubmitResult};
