//! Session store backed by redb embedded database.
//!
//! Holds issued SSO sessions and the set of consumed SAML assertion ids used
//! for replay prevention.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;
use tracing::{debug, warn};

use super::types::{SessionId, SsoSession};
use crate::storage::{expiry_key, purge_lapsed};

/// redb table for sessions (key: session_id hex, value: MessagePack bytes).
const SESSIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sso_sessions");

/// redb table for assertion ID tracking
/// (key: "{provider_id}\n{assertion_id}", value: retention timestamp).
const ASSERTIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("saml_assertions");

/// Expiry index over `ASSERTIONS_TABLE`.
const ASSERTION_EXPIRY_TABLE: TableDefinition<&str, &str> =
    TableDefinition::new("saml_assertion_expiry");

/// Session persistence used by the callback controllers.
pub trait SessionStore: Send + Sync {
    /// Issue a session with the fixed 8h lifetime. A user may hold any
    /// number of concurrent sessions.
    fn create(
        &self,
        provider_id: &str,
        user_id: &str,
        external_session_id: Option<&str>,
        name_id: &str,
    ) -> Result<SsoSession>;

    /// The session, unless it is unknown or expired.
    fn get_valid(&self, id: SessionId) -> Result<Option<SsoSession>>;

    /// Record an assertion id issued by `provider_id` as consumed until
    /// `expires_at`. Returns false if it was already consumed.
    fn consume_assertion(
        &self,
        provider_id: &str,
        assertion_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool>;
}

pub struct RedbSessionStore {
    db: Arc<Database>,
}

impl RedbSessionStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SESSIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTIONS_TABLE)?;
            let _ = write_txn.open_table(ASSERTION_EXPIRY_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Get a session by ID regardless of expiry.
    pub fn get(&self, id: SessionId) -> Result<Option<SsoSession>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        match table.get(id.to_hex().as_str())? {
            Some(value) => {
                let session = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize session")?;
                Ok(Some(session))
            }
            None => Ok(None),
        }
    }

    /// Delete a session by ID.
    pub fn delete(&self, id: SessionId) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            let key = id.to_hex();
            let result = table.remove(key.as_str())?;
            result.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// All sessions held by an account, newest first.
    pub fn list_by_user(&self, user_id: &str) -> Result<Vec<SsoSession>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;

        let mut sessions = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<SsoSession>(value.value()) {
                Ok(session) if session.user_id == user_id => sessions.push(session),
                Ok(_) => {}
                Err(e) => {
                    warn!(key = key.value(), error = %e, "Failed to deserialize session, skipping");
                }
            }
        }
        sessions.sort_by(|a, b| b.issued_at.cmp(&a.issued_at));
        Ok(sessions)
    }

    /// Revoke every session held by an account.
    pub fn delete_by_user(&self, user_id: &str) -> Result<usize> {
        let mut deleted = 0;
        for session in self.list_by_user(user_id)? {
            if self.delete(session.id)? {
                deleted += 1;
            }
        }
        debug!(user_id = %user_id, deleted, "Revoked user sessions");
        Ok(deleted)
    }

    /// Get session count (including expired ones).
    pub fn session_count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SESSIONS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn persist(&self, session: &SsoSession) -> Result<()> {
        let data = rmp_serde::to_vec_named(session).context("Failed to serialize session")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(SESSIONS_TABLE)?;
            table.insert(session.id.to_hex().as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}

impl SessionStore for RedbSessionStore {
    fn create(
        &self,
        provider_id: &str,
        user_id: &str,
        external_session_id: Option<&str>,
        name_id: &str,
    ) -> Result<SsoSession> {
        let session = SsoSession::new(
            provider_id,
            user_id,
            external_session_id.map(String::from),
            name_id,
        );
        self.persist(&session)?;
        debug!(
            session_id = %session.id,
            provider_id = %provider_id,
            expires_at = %session.expires_at,
            "SSO session created"
        );
        Ok(session)
    }

    fn get_valid(&self, id: SessionId) -> Result<Option<SsoSession>> {
        Ok(self.get(id)?.filter(|session| !session.is_expired()))
    }

    fn consume_assertion(
        &self,
        provider_id: &str,
        assertion_id: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let key = assertion_key(provider_id, assertion_id);
        let data = rmp_serde::to_vec(&expires_at)?;

        let write_txn = self.db.begin_write()?;
        let (fresh, purged) = {
            let mut table = write_txn.open_table(ASSERTIONS_TABLE)?;
            let mut expiry = write_txn.open_table(ASSERTION_EXPIRY_TABLE)?;
            let purged = purge_lapsed(&mut table, &mut expiry, Utc::now())?;

            let fresh = table.get(key.as_str())?.is_none();
            if fresh {
                table.insert(key.as_str(), data.as_slice())?;
                expiry.insert(expiry_key(expires_at, &key).as_str(), key.as_str())?;
            }
            (fresh, purged)
        };
        write_txn.commit()?;

        if purged > 0 {
            debug!(purged, "Purged lapsed assertion ids");
        }
        Ok(fresh)
    }
}

fn assertion_key(provider_id: &str, assertion_id: &str) -> String {
    format!("{}\n{}", provider_id, assertion_id)
}
