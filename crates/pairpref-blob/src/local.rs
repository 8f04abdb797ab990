use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use pairpref_core::PrefError;
use time::OffsetDateTime;

use crate::{validate_name, BlobStore};

/// Blobs as plain files under a root directory.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
}

impl LocalBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem path backing `name`.
    #[must_use]
    pub fn path_of(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Stamps `name` with an explicit modification time.
    pub fn set_modified(&self, name: &str, at: OffsetDateTime) -> Result<(), PrefError> {
        validate_name(name)?;
        let path = self.path_of(name);
        let file = fs::File::options()
            .write(true)
            .open(&path)
            .map_err(|err| unavailable("open", &path, &err))?;
        file.set_modified(SystemTime::from(at))
            .map_err(|err| unavailable("set mtime on", &path, &err))
    }
}

impl BlobStore for LocalBlobStore {
    fn read(&self, name: &str) -> Result<Vec<u8>, PrefError> {
        validate_name(name)?;
        let path = self.path_of(name);
        fs::read(&path).map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                PrefError::NotFound(format!("blob {}", path.display()))
            } else {
                unavailable("read", &path, &err)
            }
        })
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), PrefError> {
        validate_name(name)?;
        let path = self.path_of(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| unavailable("create", parent, &err))?;
        }
        fs::write(&path, bytes).map_err(|err| unavailable("write", &path, &err))
    }

    fn exists(&self, name: &str) -> Result<bool, PrefError> {
        validate_name(name)?;
        let path = self.path_of(name);
        path.try_exists()
            .map_err(|err| unavailable("stat", &path, &err))
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, PrefError> {
        let path = if dir.is_empty() {
            self.root.clone()
        } else {
            validate_name(dir)?;
            self.path_of(dir)
        };

        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(unavailable("list", &path, &err)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| unavailable("list", &path, &err))?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }

    fn modified(&self, name: &str) -> Result<Option<OffsetDateTime>, PrefError> {
        validate_name(name)?;
        let path = self.path_of(name);
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(unavailable("stat", &path, &err)),
        };
        let modified = metadata
            .modified()
            .map_err(|err| unavailable("read mtime of", &path, &err))?;
        Ok(Some(OffsetDateTime::from(modified)))
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

fn unavailable(action: &str, path: &Path, err: &std::io::Error) -> PrefError {
    PrefError::StorageUnavailable(format!("failed to {action} {}: {err}", path.display()))
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

    #[test]
    fn write_read_list_and_stat() {
        let dir = scratch();
        let store = LocalBlobStore::new(dir.path());

        assert!(!must(store.exists("raters/user_0.json")));
        assert_eq!(must(store.modified("raters/user_0.json")), None);
        assert_eq!(must(store.list("raters")), Vec::<String>::new());

        must(store.write("raters/user_1.json", b"{}"));
        must(store.write("raters/user_0.json", b"{}"));
        must(store.write("experiments.db", b"db"));

        assert!(must(store.exists("raters/user_0.json")));
        assert!(must(store.modified("experiments.db")).is_some());
        assert_eq!(
            must(store.list("raters")),
            vec!["user_0.json".to_string(), "user_1.json".to_string()]
        );
        assert_eq!(
            must(store.list("")),
            vec!["experiments.db".to_string(), "raters".to_string()]
        );
        assert_eq!(must(store.read("experiments.db")), b"db");
    }

    #[test]
    fn missing_blob_read_is_not_found() {
        let dir = scratch();
        let store = LocalBlobStore::new(dir.path());
        assert!(matches!(
            store.read("absent.db"),
            Err(PrefError::NotFound(_))
        ));
    }

    #[test]
    fn copy_if_newer_respects_strict_ordering() {
        let dir = scratch();
        let src = LocalBlobStore::new(dir.path().join("src"));
        let dst = LocalBlobStore::new(dir.path().join("dst"));
        let base = now_utc() - Duration::hours(2);

        must(src.write("blob", b"one"));
        must(src.set_modified("blob", base));
        assert!(must(crate::copy_if_newer(&src, "blob", &dst, "blob")));

        must(dst.set_modified("blob", base));
        must(src.write("blob", b"two"));
        must(src.set_modified("blob", base));
        assert!(!must(crate::copy_if_newer(&src, "blob", &dst, "blob")));
        assert_eq!(must(dst.read("blob")), b"one");

        must(src.set_modified("blob", base + Duration::seconds(1)));
        assert!(must(crate::copy_if_newer(&src, "blob", &dst, "blob")));
        assert_eq!(must(dst.read("blob")), b"two");
    }
}
