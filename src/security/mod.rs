//! Security framework: tokens, approvals, rate limits and audit

pub mod approval;
pub mod audit;
pub mod auth;
pub mod framework;
pub mod rate_limit;

pub use approval::{ApprovalQueue, ApprovalRequest, ApprovalState, ApprovalSweep, InvocationRef};
pub use audit::{
    verify_chain, AuditLog, AuditOutcome, AuditRecord, AuditSink, ChainError, JsonlAuditSink,
    MemoryAuditSink,
};
pub use auth::{Claims, TokenValidator};
pub use framework::SecurityFramework;
pub use rate_limit::{action, RateDecision, RateLimiter};
