//! Pending OAuth authorizations, keyed by `state`.
//!
//! Entries survive restarts and are shared by every instance using the same
//! database. Each entry can be taken exactly once.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use redb::{Database, ReadableTableMetadata, TableDefinition};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::{SsoError, SsoResult};
use crate::storage::{expiry_key, purge_lapsed};

/// Default lifetime of a pending authorization.
pub const DEFAULT_STATE_TTL_SECS: u64 = 600;

const PENDING_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("oauth_pending");

/// Expiry index over `PENDING_TABLE`.
const PENDING_EXPIRY_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("oauth_pending_expiry");

/// Everything the callback needs to finish an authorization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAuthorization {
    pub state: String,
    pub code_verifier: String,
    pub provider_id: String,
    pub nonce: Option<String>,
    pub redirect_uri: String,
    /// Relative path to land on after login.
    pub return_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl PendingAuthorization {
    /// New entry expiring `ttl` from now.
    pub fn new(
        state: String,
        code_verifier: String,
        provider_id: String,
        nonce: Option<String>,
        redirect_uri: String,
        return_to: Option<String>,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            state,
            code_verifier,
            provider_id,
            nonce,
            redirect_uri,
            return_to,
            created_at: now,
            expires_at: now + ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// Short-lived store for PKCE verifiers.
pub trait AuthStateStore: Send + Sync {
    fn put(&self, pending: &PendingAuthorization) -> Result<()>;

    /// Remove and return the entry for `state`. Unknown states yield `None`;
    /// expired ones are removed and returned so the caller can tell them
    /// apart.
    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>>;
}

/// Take `state`, mapping absence to `InvalidState` and lapse to
/// `ExpiredState`.
pub fn take_valid(store: &dyn AuthStateStore, state: &str) -> SsoResult<PendingAuthorization> {
    match store.take(state).map_err(SsoError::persistence)? {
        None => Err(SsoError::InvalidState),
        Some(pending) if pending.is_expired() => Err(SsoError::ExpiredState),
        Some(pending) => Ok(pending),
    }
}

pub struct RedbAuthStateStore {
    db: Arc<Database>,
}

impl RedbAuthStateStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PENDING_TABLE)?;
            let _ = write_txn.open_table(PENDING_EXPIRY_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PENDING_TABLE)?;
        Ok(table.len()? as usize)
    }
}

impl AuthStateStore for RedbAuthStateStore {
    fn put(&self, pending: &PendingAuthorization) -> Result<()> {
        let data =
            rmp_serde::to_vec_named(pending).context("Failed to serialize pending authorization")?;
        let key = pending.state.as_str();

        let write_txn = self.db.begin_write()?;
        let purged = {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            let mut expiry = write_txn.open_table(PENDING_EXPIRY_TABLE)?;
            let purged = purge_lapsed(&mut table, &mut expiry, Utc::now())?;

            let replaced = table.insert(key, data.as_slice())?.and_then(|old| {
                rmp_serde::from_slice::<PendingAuthorization>(old.value()).ok()
            });
            if let Some(old) = replaced {
                expiry.remove(expiry_key(old.expires_at, key).as_str())?;
            }
            expiry.insert(expiry_key(pending.expires_at, key).as_str(), key)?;
            purged
        };
        write_txn.commit()?;

        if purged > 0 {
            debug!(purged, "Purged expired pending authorizations");
        }
        Ok(())
    }

    fn take(&self, state: &str) -> Result<Option<PendingAuthorization>> {
        let write_txn = self.db.begin_write()?;
        let taken = {
            let mut table = write_txn.open_table(PENDING_TABLE)?;
            let removed = table.remove(state)?;
            let pending = match removed {
                Some(ref value) => Some(
                    rmp_serde::from_slice::<PendingAuthorization>(value.value())
                        .context("Failed to deserialize pending authorization")?,
                ),
                None => None,
            };
            drop(removed);
            if let Some(ref pending) = pending {
                let mut expiry = write_txn.open_table(PENDING_EXPIRY_TABLE)?;
                expiry.remove(expiry_key(pending.expires_at, state).as_str())?;
            }
            pending
        };
        write_txn.commit()?;
        Ok(taken)
    }
}
