//! Protocol infrastructure: validation, dispatch and delivery

pub mod dispatch;
pub mod router;
pub mod validator;

pub use dispatch::{DispatchTable, DispatchTableBuilder, LayerHandler};
pub use router::{DeliveryReceipt, DeliveryRecord, DeliveryState, MessageRouter, RouterStats};
pub use validator::{MessageValidator, ValidationResult};
