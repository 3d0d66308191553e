//! Identity resolution and account provisioning.
//!
//! Turns a canonical identity plus its provider into an application account,
//! creating one when the provider allows it.

pub mod provisioning;
pub mod store;
pub mod types;

pub use provisioning::{check_identity, resolve_account, ResolvedAccount};
pub use store::{AccountStore, AccountStoreError, RedbAccountStore};
pub use types::{normalize_email, Account, NewAccount, Role};
