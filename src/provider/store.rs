//! Provider configuration store.
//!
//! Providers are owned by the administrative side; login flows only read
//! them. The redb store also exposes writes for that collaborator and for
//! loading a providers file at startup.

use anyhow::{Context, Result};
use redb::{Database, ReadableTable, TableDefinition};
use std::sync::Arc;

use super::types::SsoProvider;

/// Provider table (key: provider id, value: MessagePack bytes).
const PROVIDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sso_providers");

/// Read access to provider configuration.
pub trait ProviderStore: Send + Sync {
    fn get(&self, id: &str) -> Result<Option<SsoProvider>>;
}

/// Provider store backed by redb.
pub struct RedbProviderStore {
    db: Arc<Database>,
}

impl RedbProviderStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(PROVIDERS_TABLE)?;
        }
        write_txn.commit()?;
        Ok(Self { db })
    }

    /// Insert or replace a provider after validating it.
    pub fn upsert(&self, provider: &SsoProvider) -> Result<()> {
        provider.validate().map_err(|e| anyhow::anyhow!(e))?;

        let data = rmp_serde::to_vec_named(provider).context("Failed to serialize provider")?;
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(PROVIDERS_TABLE)?;
            table.insert(provider.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn delete(&self, id: &str) -> Result<bool> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(PROVIDERS_TABLE)?;
            let result = table.remove(id)?;
            result.is_some()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    pub fn list(&self) -> Result<Vec<SsoProvider>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVIDERS_TABLE)?;

        let mut providers = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let provider: SsoProvider =
                rmp_serde::from_slice(value.value()).context("Failed to deserialize provider")?;
            providers.push(provider);
        }
        Ok(providers)
    }
}

impl ProviderStore for RedbProviderStore {
    fn get(&self, id: &str) -> Result<Option<SsoProvider>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROVIDERS_TABLE)?;
        match table.get(id)? {
            Some(value) => {
                let provider = rmp_serde::from_slice(value.value())
                    .context("Failed to deserialize provider")?;
                Ok(Some(provider))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::types::fixtures::{oauth_provider, saml_provider};
    use crate::storage::temp_database;

    #[test]
    fn test_upsert_and_get() {
        let (db, _dir) = temp_database();
        let store = RedbProviderStore::new(db).unwrap();

        store.upsert(&oauth_provider("okta", "https://idp.example.com")).unwrap();
        store.upsert(&saml_provider("adfs")).unwrap();

        let okta = store.get("okta").unwrap().unwrap();
        assert_eq!(okta.oauth().unwrap().client_id, "client-123");
        let adfs = store.get("adfs").unwrap().unwrap();
        assert!(adfs.saml().is_some());
        assert!(store.get("missing").unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_rejects_invalid() {
        let (db, _dir) = temp_database();
        let store = RedbProviderStore::new(db).unwrap();

        let mut provider = saml_provider("adfs");
        provider.organization_id.clear();
        assert!(store.upsert(&provider).is_err());
        assert!(store.get("adfs").unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let (db, _dir) = temp_database();
        let store = RedbProviderStore::new(db).unwrap();
        store.upsert(&saml_provider("adfs")).unwrap();

        assert!(store.delete("adfs").unwrap());
        assert!(!store.delete("adfs").unwrap());
        assert!(store.get("adfs").unwrap().is_none());
    }
}
