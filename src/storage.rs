//! Shared embedded database handle.
//!
//! All stores live in one redb file. redb serializes write transactions,
//! which is what the account store relies on for atomic create-if-absent.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, Table};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Open or create the database file, creating parent directories.
pub fn open_database(path: &Path) -> Result<Arc<Database>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
    }

    let db = Database::create(path)
        .with_context(|| format!("Failed to open SSO database: {:?}", path))?;

    debug!(path = ?path, "SSO database opened");
    Ok(Arc::new(db))
}

/// Most lapsed entries a single write removes.
pub(crate) const PURGE_BATCH: usize = 64;

/// Expiry index key: zero-padded epoch millis, then the entry key, so the
/// index iterates oldest first.
pub(crate) fn expiry_key(expires_at: DateTime<Utc>, key: &str) -> String {
    format!("{:020}\n{}", expires_at.timestamp_millis().max(0), key)
}

/// Remove up to [`PURGE_BATCH`] entries that expired before `now`.
///
/// `expiry` maps [`expiry_key`] to the key in `entries`. Only the lapsed
/// prefix of the index is read.
pub(crate) fn purge_lapsed(
    entries: &mut Table<'_, &'static str, &'static [u8]>,
    expiry: &mut Table<'_, &'static str, &'static str>,
    now: DateTime<Utc>,
) -> Result<usize> {
    let upper = format!("{:020}", now.timestamp_millis().max(0));
    let lapsed = expiry
        .range(..upper.as_str())?
        .take(PURGE_BATCH)
        .map(|entry| entry.map(|(k, v)| (k.value().to_string(), v.value().to_string())))
        .collect::<Result<Vec<_>, _>>()?;

    for (index_key, key) in &lapsed {
        expiry.remove(index_key.as_str())?;
        entries.remove(key.as_str())?;
    }
    Ok(lapsed.len())
}

#[cfg(test)]
pub(crate) fn temp_database() -> (Arc<Database>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let db = open_database(&dir.path().join("sso.redb")).unwrap();
    (db, dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry_keys_sort_by_time() {
        let now = Utc::now();
        let earlier = expiry_key(now - Duration::seconds(1), "zzz");
        let later = expiry_key(now, "aaa");
        assert!(earlier < later);
        assert!(later.ends_with("\naaa"));
    }
}
