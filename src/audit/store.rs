//! Audit log backed by redb embedded database.
//!
//! Records are keyed by `{created_at nanos}-{uuid}` so iteration order is
//! chronological.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;
use tracing::warn;

use super::types::LoginAttempt;

const LOGIN_ATTEMPTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("sso_login_attempts");

/// Append-only login audit.
pub trait AuditStore: Send + Sync {
    fn record(&self, attempt: &LoginAttempt) -> Result<()>;
}

pub struct RedbAuditStore {
    db: Arc<Database>,
}

impl RedbAuditStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LOGIN_ATTEMPTS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn count(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOGIN_ATTEMPTS_TABLE)?;
        Ok(table.len()? as usize)
    }

    /// All attempts, oldest first.
    pub fn list(&self) -> Result<Vec<LoginAttempt>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOGIN_ATTEMPTS_TABLE)?;

        let mut attempts = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match rmp_serde::from_slice::<LoginAttempt>(value.value()) {
                Ok(attempt) => attempts.push(attempt),
                Err(e) => {
                    warn!(key = key.value(), error = %e, "Failed to deserialize login attempt, skipping");
                }
            }
        }
        Ok(attempts)
    }

    /// Attempts recorded for one provider, oldest first.
    pub fn list_by_provider(&self, provider_id: &str) -> Result<Vec<LoginAttempt>> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| a.provider_id.as_deref() == Some(provider_id))
            .collect())
    }
}

impl AuditStore for RedbAuditStore {
    fn record(&self, attempt: &LoginAttempt) -> Result<()> {
        let key = format!(
            "{:020}-{}",
            attempt.created_at.timestamp_nanos_opt().unwrap_or_default(),
            attempt.id
        );
        let data = rmp_serde::to_vec_named(attempt).context("Failed to serialize login attempt")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOGIN_ATTEMPTS_TABLE)?;
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
