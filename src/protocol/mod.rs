//! Protocol message types and validation
//!
//! The envelope, intents and typed payloads shared by the tool, peer and
//! workflow layers.

pub mod ids;
pub mod messages;
pub mod schema;

pub use ids::*;
pub use messages::*;
pub use schema::{all_payload_schemas, payload_schema, PayloadSchemas};
