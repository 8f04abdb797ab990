//! Blob storage for the experiment database and rater files.
//!
//! - [`BlobStore`] is the uniform contract over the local filesystem
//!   ([`LocalBlobStore`]) and object stores ([`ObjectBlobStore`]).
//! - [`CacheSync`] keeps a local copy of one named blob and moves it in either
//!   direction on request.
//! - [`RaterFile`] is the per-rater JSON document kept next to the database.

#![allow(clippy::missing_errors_doc)]

mod local;
mod object;
mod rater;
mod sync;

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pairpref_core::PrefError;
use time::OffsetDateTime;

pub use local::LocalBlobStore;
pub use object::{ObjectBlobStore, RequestCounter, RequestPrices};
pub use rater::{next_rater_id, parse_rater_file_name, RaterFile};
pub use sync::{CacheSync, SyncOutcome};

/// Uniform blob operations. Names are relative, `/`-separated paths inside
/// the store root.
pub trait BlobStore: Send + Sync {
    fn read(&self, name: &str) -> Result<Vec<u8>, PrefError>;

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), PrefError>;

    fn exists(&self, name: &str) -> Result<bool, PrefError>;

    /// Entry names directly under `dir`, sorted. A missing directory lists as
    /// empty.
    fn list(&self, dir: &str) -> Result<Vec<String>, PrefError>;

    /// Last modification time, or `None` when the blob does not exist.
    fn modified(&self, name: &str) -> Result<Option<OffsetDateTime>, PrefError>;

    fn describe(&self) -> String;
}

impl Debug for dyn BlobStore {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Copies `src_name` to `dst_name` only when the destination is missing or
/// strictly older than the source. Returns whether a copy happened.
pub fn copy_if_newer(
    src: &dyn BlobStore,
    src_name: &str,
    dst: &dyn BlobStore,
    dst_name: &str,
) -> Result<bool, PrefError> {
    let src_modified = src.modified(src_name)?;
    let dst_modified = dst.modified(dst_name)?;

    let newer = match (src_modified, dst_modified) {
        (_, None) | (None, Some(_)) => true,
        (Some(src_at), Some(dst_at)) => src_at > dst_at,
    };

    tracing::debug!(
        src = %src.describe(),
        dst = %dst.describe(),
        name = src_name,
        ?src_modified,
        ?dst_modified,
        newer,
        "copy_if_newer decision"
    );

    if newer {
        copy_unconditional(src, src_name, dst, dst_name)?;
    }
    Ok(newer)
}

pub fn copy_unconditional(
    src: &dyn BlobStore,
    src_name: &str,
    dst: &dyn BlobStore,
    dst_name: &str,
) -> Result<(), PrefError> {
    let bytes = src.read(src_name)?;
    dst.write(dst_name, &bytes)?;
    tracing::info!(
        src = %src.describe(),
        dst = %dst.describe(),
        name = src_name,
        bytes = bytes.len(),
        "copied blob"
    );
    Ok(())
}

/// A scheme-qualified blob store location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlobLocation {
    /// `file://<dir>`, `osfs://<dir>` or a bare path.
    Local(PathBuf),
    /// `s3://<bucket>[/<prefix>]`.
    S3 {
        bucket: String,
        prefix: Option<String>,
    },
    /// `memory://`, a process-local object store.
    Memory,
}

impl FromStr for BlobLocation {
    type Err = PrefError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(PrefError::Validation(
                "blob location must not be empty".to_string(),
            ));
        }

        let Some((scheme, rest)) = raw.split_once("://") else {
            return Ok(Self::Local(PathBuf::from(raw)));
        };

        match scheme {
            "file" | "osfs" => {
                if rest.is_empty() {
                    return Err(PrefError::Validation(format!(
                        "blob location {raw} has no directory"
                    )));
                }
                Ok(Self::Local(PathBuf::from(rest)))
            }
            "s3" => {
                let (bucket, prefix) = match rest.split_once('/') {
                    Some((bucket, prefix)) => (bucket, prefix.trim_matches('/')),
                    None => (rest, ""),
                };
                if bucket.is_empty() {
                    return Err(PrefError::Validation(format!(
                        "blob location {raw} has no bucket"
                    )));
                }
                Ok(Self::S3 {
                    bucket: bucket.to_string(),
                    prefix: (!prefix.is_empty()).then(|| prefix.to_string()),
                })
            }
            "memory" | "mem" => Ok(Self::Memory),
            other => Err(PrefError::Validation(format!(
                "unsupported blob scheme {other:?} in {raw}"
            ))),
        }
    }
}

/// Opens the store named by `location`, attaching `counter` to object-store
/// backends.
pub fn open_store(
    location: &str,
    counter: Option<Arc<RequestCounter>>,
) -> Result<Arc<dyn BlobStore>, PrefError> {
    let store: Arc<dyn BlobStore> = match location.parse::<BlobLocation>()? {
        BlobLocation::Local(root) => Arc::new(LocalBlobStore::new(root)),
        BlobLocation::S3 { bucket, prefix } => {
            let mut store = ObjectBlobStore::s3(&bucket)?;
            if let Some(prefix) = prefix {
                store = store.with_prefix(&prefix);
            }
            if let Some(counter) = counter {
                store = store.with_counter(counter);
            }
            Arc::new(store)
        }
        BlobLocation::Memory => {
            let mut store = ObjectBlobStore::in_memory()?;
            if let Some(counter) = counter {
                store = store.with_counter(counter);
            }
            Arc::new(store)
        }
    };
    tracing::debug!(location, store = %store.describe(), "opened blob store");
    Ok(store)
}

pub(crate) fn validate_name(name: &str) -> Result<(), PrefError> {
    if name.is_empty()
        || name.starts_with('/')
        || name.split('/').any(|part| part.is_empty() || part == "..")
    {
        return Err(PrefError::Validation(format!("invalid blob name {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must<T>(result: Result<T, PrefError>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    #[test]
    fn locations_parse_by_scheme() {
        assert_eq!(
            must("osfs:///tmp/pairpref".parse::<BlobLocation>()),
            BlobLocation::Local(PathBuf::from("/tmp/pairpref"))
        );
        assert_eq!(
            must("./data".parse::<BlobLocation>()),
            BlobLocation::Local(PathBuf::from("./data"))
        );
        assert_eq!(
            must("s3://mrl-experiment/raters/".parse::<BlobLocation>()),
            BlobLocation::S3 {
                bucket: "mrl-experiment".to_string(),
                prefix: Some("raters".to_string()),
            }
        );
        assert_eq!(
            must("s3://mrl-experiment".parse::<BlobLocation>()),
            BlobLocation::S3 {
                bucket: "mrl-experiment".to_string(),
                prefix: None,
            }
        );
        assert_eq!(must("memory://".parse::<BlobLocation>()), BlobLocation::Memory);
        assert!(matches!(
            "ftp://host".parse::<BlobLocation>(),
            Err(PrefError::Validation(_))
        ));
        assert!(matches!(
            "s3://".parse::<BlobLocation>(),
            Err(PrefError::Validation(_))
        ));
    }

    #[test]
    fn names_must_stay_inside_the_root() {
        assert!(validate_name("experiments.db").is_ok());
        assert!(validate_name("raters/user_1.json").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("/etc/passwd").is_err());
        assert!(validate_name("../escape").is_err());
        assert!(validate_name("a//b").is_err());
    }

    #[test]
    fn copy_between_backends_uses_timestamps() {
        let dir = match tempfile::tempdir() {
            Ok(value) => value,
            Err(err) => panic!("failed to create scratch dir: {err}"),
        };
        let local = LocalBlobStore::new(dir.path());
        let remote = must(ObjectBlobStore::in_memory());

        must(remote.write("experiments.db", b"remote-v1"));
        assert!(must(copy_if_newer(&remote, "experiments.db", &local, "experiments.db")));
        assert_eq!(must(local.read("experiments.db")), b"remote-v1");

        must(local.set_modified(
            "experiments.db",
            pairpref_core::now_utc() + time::Duration::hours(1),
        ));
        assert!(!must(copy_if_newer(&remote, "experiments.db", &local, "experiments.db")));

        must(copy_unconditional(&local, "experiments.db", &remote, "backup.db"));
        assert_eq!(must(remote.read("backup.db")), b"remote-v1");
    }
}
