//! Login attempt audit trail.

pub mod store;
pub mod types;

pub use store::{AuditStore, RedbAuditStore};
pub use types::LoginAttempt;
