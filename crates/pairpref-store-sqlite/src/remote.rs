use std::fs;
use std::io::ErrorKind;

use pairpref_blob::{CacheSync, SyncOutcome};
use pairpref_core::PrefError;

use crate::SqlitePrefStore;

/// A store opened on a freshly pulled copy of the remote database blob.
///
/// One handle per request. Writes reach the remote only through
/// [`RemoteStore::publish`]; dropping the handle leaves the remote as it was.
pub struct RemoteStore {
    sync: CacheSync,
    store: SqlitePrefStore,
}

impl RemoteStore {
    /// Pulls the blob (unconditionally when `always_download`), then opens
    /// and migrates the cached copy.
    pub fn open(sync: CacheSync, always_download: bool) -> Result<Self, PrefError> {
        let pulled = sync.pull(always_download)?;
        tracing::debug!(
            path = %pulled.path.display(),
            transferred = pulled.transferred,
            "opening cached database"
        );
        let store = SqlitePrefStore::open(&pulled.path)?;
        store.migrate()?;
        Ok(Self { sync, store })
    }

    /// Creates an empty migrated database and force pushes it when the remote
    /// blob does not exist yet. Returns whether anything was created.
    pub fn bootstrap(sync: &CacheSync) -> Result<bool, PrefError> {
        if sync.remote_exists()? {
            tracing::info!(name = sync.name(), "remote database already exists");
            return Ok(false);
        }

        let path = sync.local_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| {
                PrefError::StorageUnavailable(format!(
                    "failed to create cache dir {}: {err}",
                    parent.display()
                ))
            })?;
        }
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(PrefError::StorageUnavailable(format!(
                    "failed to clear stale cache {}: {err}",
                    path.display()
                )))
            }
        }

        let store = SqlitePrefStore::open(&path)?;
        store.migrate()?;
        store.close()?;
        sync.push(true)?;
        tracing::info!(name = sync.name(), remote = %sync.remote().describe(), "bootstrapped remote database");
        Ok(true)
    }

    #[must_use]
    pub fn store(&self) -> &SqlitePrefStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut SqlitePrefStore {
        &mut self.store
    }

    #[must_use]
    pub fn sync(&self) -> &CacheSync {
        &self.sync
    }

    /// Closes the connection and pushes the cached file. Without `force` the
    /// push only happens when the cache is newer than the remote.
    pub fn publish(self, force: bool) -> Result<SyncOutcome, PrefError> {
        let Self { sync, store } = self;
        store.close()?;
        let outcome = sync.push(force)?;
        tracing::info!(
            name = sync.name(),
            force,
            transferred = outcome.transferred,
            "published database"
        );
        Ok(outcome)
    }
}
