//! SSO session issuance and lookup.
//!
//! Sessions are persisted in redb and expire lazily after a fixed 8 hours.

pub mod store;
pub mod types;

pub use store::{RedbSessionStore, SessionStore};
pub use types::{SessionId, SsoSession, SESSION_LIFETIME_HOURS};
