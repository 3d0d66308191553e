//! Account store backed by redb embedded database.
//!
//! Accounts are keyed by UUID with a unique secondary index on
//! `(organization_id, email)`. The index check and both inserts happen in a
//! single write transaction, so two concurrent creations for the same key
//! cannot both succeed.

use anyhow::Context;
use chrono::Utc;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::types::{normalize_email, Account, NewAccount};

/// Primary account table: UUID -> MessagePack<Account>.
pub(super) const ACCOUNTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("accounts");
/// Unique index: "{organization_id}\n{email}" -> UUID.
const ACCOUNT_EMAIL_INDEX: TableDefinition<&str, &str> = TableDefinition::new("account_email_index");

#[derive(Debug, Error)]
pub enum AccountStoreError {
    #[error("account {email} already exists in organization {organization_id}")]
    Duplicate {
        organization_id: String,
        email: String,
    },
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Account lookup and creation used by provisioning.
pub trait AccountStore: Send + Sync {
    fn find_by_email(
        &self,
        organization_id: &str,
        email: &str,
    ) -> Result<Option<Account>, AccountStoreError>;

    /// Fails with [`AccountStoreError::Duplicate`] if the email is taken
    /// within the organization.
    fn create(&self, account: NewAccount) -> Result<Account, AccountStoreError>;

    /// Set `display_name` only if the stored account still has none.
    ///
    /// The read and the write happen in one transaction, so fields changed
    /// concurrently by others are kept. Returns the stored account after the
    /// call, or `None` if it no longer exists.
    fn fill_display_name(&self, id: &str, name: &str) -> Result<Option<Account>, AccountStoreError>;
}

pub struct RedbAccountStore {
    db: Arc<Database>,
}

fn index_key(organization_id: &str, email: &str) -> String {
    format!("{}\n{}", organization_id, email)
}

impl RedbAccountStore {
    pub fn new(db: Arc<Database>) -> anyhow::Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(ACCOUNTS_TABLE)?;
            let _ = write_txn.open_table(ACCOUNT_EMAIL_INDEX)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    pub fn get(&self, id: &str) -> anyhow::Result<Option<Account>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        match table.get(id)? {
            Some(value) => {
                let account = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize account")?;
                Ok(Some(account))
            }
            None => Ok(None),
        }
    }

    pub fn count(&self) -> anyhow::Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ACCOUNTS_TABLE)?;
        Ok(table.len()? as usize)
    }

    fn lookup(&self, organization_id: &str, email: &str) -> anyhow::Result<Option<Account>> {
        let key = index_key(organization_id, &normalize_email(email));
        let id = {
            let read_txn = self.db.begin_read()?;
            let index = read_txn.open_table(ACCOUNT_EMAIL_INDEX)?;
            index.get(key.as_str())?.map(|value| value.value().to_string())
        };

        match id {
            Some(id) => self.get(&id),
            None => Ok(None),
        }
    }

    /// Returns false when the index key is already taken.
    fn insert_if_absent(&self, account: &Account) -> anyhow::Result<bool> {
        let key = index_key(&account.organization_id, &account.email);
        let data = rmp_serde::to_vec_named(account).context("Failed to serialize account")?;

        let write_txn = self.db.begin_write()?;
        {
            let mut index = write_txn.open_table(ACCOUNT_EMAIL_INDEX)?;
            if index.get(key.as_str())?.is_some() {
                return Ok(false);
            }
            let mut accounts = write_txn.open_table(ACCOUNTS_TABLE)?;
            accounts.insert(account.id.as_str(), data.as_slice())?;
            index.insert(key.as_str(), account.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    fn fill_blank_name(&self, id: &str, name: &str) -> anyhow::Result<Option<Account>> {
        let write_txn = self.db.begin_write()?;
        let account = {
            let mut table = write_txn.open_table(ACCOUNTS_TABLE)?;
            let current: Option<Account> = match table.get(id)? {
                Some(value) => Some(
                    rmp_serde::from_slice(value.value()).context("Failed to deserialize account")?,
                ),
                None => None,
            };
            match current {
                Some(mut account) if account.display_name.is_none() => {
                    account.display_name = Some(name.to_string());
                    account.updated_at = Utc::now();
                    let data =
                        rmp_serde::to_vec_named(&account).context("Failed to serialize account")?;
                    table.insert(id, data.as_slice())?;
                    Some(account)
                }
                other => other,
            }
        };
        write_txn.commit()?;
        Ok(account)
    }
}

impl AccountStore for RedbAccountStore {
    fn find_by_email(
        &self,
        organization_id: &str,
        email: &str,
    ) -> Result<Option<Account>, AccountStoreError> {
        Ok(self.lookup(organization_id, email)?)
    }

    fn create(&self, new: NewAccount) -> Result<Account, AccountStoreError> {
        let now = Utc::now();
        let account = Account {
            id: Uuid::new_v4().to_string(),
            organization_id: new.organization_id,
            email: normalize_email(&new.email),
            display_name: new.display_name,
            first_name: new.first_name,
            last_name: new.last_name,
            role: new.role,
            sso_provider_id: new.sso_provider_id,
            external_user_id: new.external_user_id,
            created_at: now,
            updated_at: now,
        };

        if !self.insert_if_absent(&account)? {
            return Err(AccountStoreError::Duplicate {
                organization_id: account.organization_id,
                email: account.email,
            });
        }

        Ok(account)
    }

    fn fill_display_name(&self, id: &str, name: &str) -> Result<Option<Account>, AccountStoreError> {
        Ok(self.fill_blank_name(id, name)?)
    }
}
