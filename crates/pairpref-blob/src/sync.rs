use std::path::PathBuf;
use std::sync::Arc;

use pairpref_core::PrefError;
use serde::Serialize;

use crate::{copy_if_newer, copy_unconditional, BlobStore, LocalBlobStore};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SyncOutcome {
    /// Local cache path holding the synchronized snapshot.
    pub path: PathBuf,
    /// Whether bytes actually moved.
    pub transferred: bool,
}

/// Keeps a local cached copy of one remote blob.
///
/// Nothing happens in the background: the caller decides when to pull and
/// when to push. The last push wins; two writers that interleave
/// pull, mutate, push can silently drop each other's changes.
#[derive(Debug)]
pub struct CacheSync {
    remote: Arc<dyn BlobStore>,
    local: LocalBlobStore,
    name: String,
}

impl CacheSync {
    pub fn new(remote: Arc<dyn BlobStore>, cache_dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            remote,
            local: LocalBlobStore::new(cache_dir),
            name: name.to_string(),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn local_path(&self) -> PathBuf {
        self.local.path_of(&self.name)
    }

    #[must_use]
    pub fn local(&self) -> &LocalBlobStore {
        &self.local
    }

    #[must_use]
    pub fn remote(&self) -> &Arc<dyn BlobStore> {
        &self.remote
    }

    pub fn remote_exists(&self) -> Result<bool, PrefError> {
        self.remote.exists(&self.name)
    }

    /// Copies the remote blob into the local cache. Without `force` the copy
    /// only happens when the remote is newer than the cached file.
    ///
    /// # Errors
    /// Returns [`PrefError::StorageUnavailable`] when the remote blob is
    /// missing or either side fails.
    pub fn pull(&self, force: bool) -> Result<SyncOutcome, PrefError> {
        if !self.remote.exists(&self.name)? {
            return Err(PrefError::StorageUnavailable(format!(
                "remote blob {} does not exist in {}",
                self.name,
                self.remote.describe()
            )));
        }

        let transferred = if force {
            copy_unconditional(self.remote.as_ref(), &self.name, &self.local, &self.name)?;
            true
        } else {
            copy_if_newer(self.remote.as_ref(), &self.name, &self.local, &self.name)?
        };

        tracing::debug!(name = %self.name, force, transferred, "pulled cache");
        Ok(SyncOutcome {
            path: self.local_path(),
            transferred,
        })
    }

    /// Copies the local cache to the remote blob. Without `force` the copy
    /// only happens when the cached file is newer than the remote.
    ///
    /// # Errors
    /// Returns [`PrefError::StorageUnavailable`] when there is no local copy
    /// or either side fails.
    pub fn push(&self, force: bool) -> Result<SyncOutcome, PrefError> {
        if !self.local.exists(&self.name)? {
            return Err(PrefError::StorageUnavailable(format!(
                "local cache {} does not exist",
                self.local_path().display()
            )));
        }

        let transferred = if force {
            copy_unconditional(&self.local, &self.name, self.remote.as_ref(), &self.name)?;
            true
        } else {
            copy_if_newer(&self.local, &self.name, self.remote.as_ref(), &self.name)?
        };

        tracing::debug!(name = %self.name, force, transferred, "pushed cache");
        Ok(SyncOutcome {
            path: self.local_path(),
            transferred,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pairpref_core::now_utc;
    use time::Duration;

    fn must<T>(result: Result<T, PrefError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn scratch() -> tempfile::TempDir {
        match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create scratch dir: {err}"),
        }
    }

    fn fixture(dir: &tempfile::TempDir) -> (Arc<LocalBlobStore>, CacheSync) {
        let remote = Arc::new(LocalBlobStore::new(dir.path().join("remote")));
        let shared: Arc<dyn BlobStore> = remote.clone();
        let sync = CacheSync::new(shared, dir.path().join("cache"), "experiments.db");
        (remote, sync)
    }

    #[test]
    fn pull_without_force_skips_when_local_is_newer() {
        let dir = scratch();
        let (remote, sync) = fixture(&dir);

        must(remote.write("experiments.db", b"remote"));
        must(remote.set_modified("experiments.db", now_utc() - Duration::hours(1)));
        must(sync.local().write("experiments.db", b"local"));

        let outcome = must(sync.pull(false));
        assert!(!outcome.transferred);
        assert_eq!(outcome.path, dir.path().join("cache").join("experiments.db"));
        assert_eq!(must(sync.local().read("experiments.db")), b"local");

        let forced = must(sync.pull(true));
        assert!(forced.transferred);
        assert_eq!(must(sync.local().read("experiments.db")), b"remote");
    }

    #[test]
    fn pull_without_force_copies_when_remote_is_newer() {
        let dir = scratch();
        let (remote, sync) = fixture(&dir);

        must(sync.local().write("experiments.db", b"stale"));
        must(sync
            .local()
            .set_modified("experiments.db", now_utc() - Duration::hours(1)));
        must(remote.write("experiments.db", b"fresh"));

        assert!(must(sync.pull(false)).transferred);
        assert_eq!(must(sync.local().read("experiments.db")), b"fresh");
    }

    #[test]
    fn push_mirrors_pull() {
        let dir = scratch();
        let (remote, sync) = fixture(&dir);

        must(remote.write("experiments.db", b"remote"));
        must(sync.local().write("experiments.db", b"local"));
        must(remote.set_modified("experiments.db", now_utc() + Duration::hours(1)));

        assert!(!must(sync.push(false)).transferred);
        assert_eq!(must(remote.read("experiments.db")), b"remote");

        assert!(must(sync.push(true)).transferred);
        assert_eq!(must(remote.read("experiments.db")), b"local");
    }

    #[test]
    fn missing_sides_are_storage_errors() {
        let dir = scratch();
        let (_remote, sync) = fixture(&dir);

        assert!(!must(sync.remote_exists()));
        assert!(matches!(
            sync.pull(false),
            Err(PrefError::StorageUnavailable(_))
        ));
        assert!(matches!(
            sync.push(true),
            Err(PrefError::StorageUnavailable(_))
        ));
    }
}
