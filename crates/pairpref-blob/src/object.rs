use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use pairpref_core::PrefError;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::runtime::Runtime;

use crate::{validate_name, BlobStore};

/// Per-request prices used to estimate what a run cost.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct RequestPrices {
    pub cheap_cents: f64,
    pub expensive_cents: f64,
}

/// Counts object-store requests by price class. Writes and listings are
/// expensive; reads and metadata lookups are cheap.
#[derive(Debug, Default)]
pub struct RequestCounter {
    cheap: AtomicU64,
    expensive: AtomicU64,
    prices: Option<RequestPrices>,
}

impl RequestCounter {
    #[must_use]
    pub fn new(prices: Option<RequestPrices>) -> Self {
        Self {
            cheap: AtomicU64::new(0),
            expensive: AtomicU64::new(0),
            prices,
        }
    }

    fn record_cheap(&self) {
        self.cheap.fetch_add(1, Ordering::Relaxed);
    }

    fn record_expensive(&self) {
        self.expensive.fetch_add(1, Ordering::Relaxed);
    }

    /// `(cheap, expensive)` request counts so far.
    #[must_use]
    pub fn counts(&self) -> (u64, u64) {
        (
            self.cheap.load(Ordering::Relaxed),
            self.expensive.load(Ordering::Relaxed),
        )
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost_cents(&self) -> Option<f64> {
        let prices = self.prices?;
        let (cheap, expensive) = self.counts();
        Some(prices.cheap_cents * cheap as f64 + prices.expensive_cents * expensive as f64)
    }
}

/// A [`BlobStore`] over any `object_store` backend.
///
/// Calls block on a private current-thread runtime, so this type must not be
/// used from inside another tokio runtime.
#[derive(Debug)]
pub struct ObjectBlobStore {
    inner: Arc<dyn ObjectStore>,
    label: String,
    prefix: Option<String>,
    counter: Option<Arc<RequestCounter>>,
    runtime: Runtime,
}

impl ObjectBlobStore {
    pub fn new(inner: Arc<dyn ObjectStore>, label: &str) -> Result<Self, PrefError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                PrefError::StorageUnavailable(format!("failed to start io runtime: {err}"))
            })?;

        Ok(Self {
            inner,
            label: label.to_string(),
            prefix: None,
            counter: None,
            runtime,
        })
    }

    pub fn in_memory() -> Result<Self, PrefError> {
        Self::new(Arc::new(InMemory::new()), "memory://")
    }

    /// S3 bucket with credentials and region taken from the standard AWS
    /// environment variables.
    pub fn s3(bucket: &str) -> Result<Self, PrefError> {
        let s3 = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .build()
            .map_err(|err| {
                PrefError::StorageUnavailable(format!("failed to configure s3://{bucket}: {err}"))
            })?;
        Self::new(Arc::new(s3), &format!("s3://{bucket}"))
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let prefix = prefix.trim_matches('/');
        if !prefix.is_empty() {
            self.prefix = Some(prefix.to_string());
        }
        self
    }

    #[must_use]
    pub fn with_counter(mut self, counter: Arc<RequestCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    fn location(&self, name: &str) -> ObjectPath {
        match &self.prefix {
            Some(prefix) => ObjectPath::from(format!("{prefix}/{name}")),
            None => ObjectPath::from(name),
        }
    }

    fn cheap(&self) {
        if let Some(counter) = &self.counter {
            counter.record_cheap();
        }
    }

    fn expensive(&self) {
        if let Some(counter) = &self.counter {
            counter.record_expensive();
        }
    }

    fn unavailable(&self, action: &str, name: &str, err: &object_store::Error) -> PrefError {
        PrefError::StorageUnavailable(format!(
            "failed to {action} {name} in {}: {err}",
            self.describe()
        ))
    }
}

impl BlobStore for ObjectBlobStore {
    fn read(&self, name: &str) -> Result<Vec<u8>, PrefError> {
        validate_name(name)?;
        let location = self.location(name);
        self.cheap();
        let bytes = self.runtime.block_on(async {
            let result = self.inner.get(&location).await?;
            result.bytes().await
        });
        match bytes {
            Ok(bytes) => Ok(bytes.to_vec()),
            Err(object_store::Error::NotFound { .. }) => Err(PrefError::NotFound(format!(
                "blob {name} in {}",
                self.describe()
            ))),
            Err(err) => Err(self.unavailable("read", name, &err)),
        }
    }

    fn write(&self, name: &str, bytes: &[u8]) -> Result<(), PrefError> {
        validate_name(name)?;
        let location = self.location(name);
        self.expensive();
        self.runtime
            .block_on(self.inner.put(&location, PutPayload::from(bytes.to_vec())))
            .map(|_| ())
            .map_err(|err| self.unavailable("write", name, &err))
    }

    fn exists(&self, name: &str) -> Result<bool, PrefError> {
        Ok(self.modified(name)?.is_some())
    }

    fn list(&self, dir: &str) -> Result<Vec<String>, PrefError> {
        let prefix = if dir.is_empty() {
            self.prefix.as_deref().map(ObjectPath::from)
        } else {
            validate_name(dir)?;
            Some(self.location(dir))
        };

        self.expensive();
        let listing = self
            .runtime
            .block_on(self.inner.list_with_delimiter(prefix.as_ref()))
            .map_err(|err| self.unavailable("list", dir, &err))?;

        let mut names: Vec<String> = listing
            .objects
            .iter()
            .filter_map(|meta| meta.location.filename().map(str::to_string))
            .chain(
                listing
                    .common_prefixes
                    .iter()
                    .filter_map(|path| path.filename().map(str::to_string)),
            )
            .collect();
        names.sort();
        Ok(names)
    }

    fn modified(&self, name: &str) -> Result<Option<OffsetDateTime>, PrefError> {
        validate_name(name)?;
        let location = self.location(name);
        self.cheap();
        match self.runtime.block_on(self.inner.head(&location)) {
            Ok(meta) => Ok(Some(OffsetDateTime::from(SystemTime::from(
                meta.last_modified,
            )))),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(err) => Err(self.unavailable("stat", name, &err)),
        }
    }

    fn describe(&self) -> String {
        match &self.prefix {
            Some(prefix) if self.label.ends_with('/') => format!("{}{prefix}", self.label),
            Some(prefix) => format!("{}/{prefix}", self.label),
            None => self.label.clone(),
        }
    }
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
    fn in_memory_store_behaves_like_a_blob_store() {
        let store = must(ObjectBlobStore::in_memory());

        assert!(!must(store.exists("experiments.db")));
        assert!(matches!(
            store.read("experiments.db"),
            Err(PrefError::NotFound(_))
        ));

        must(store.write("experiments.db", b"v1"));
        must(store.write("raters/user_3.json", b"{}"));
        must(store.write("raters/user_10.json", b"{}"));

        assert!(must(store.exists("experiments.db")));
        assert_eq!(must(store.read("experiments.db")), b"v1");
        assert_eq!(
            must(store.list("raters")),
            vec!["user_10.json".to_string(), "user_3.json".to_string()]
        );
        assert_eq!(
            must(store.list("")),
            vec!["experiments.db".to_string(), "raters".to_string()]
        );
    }

    #[test]
    fn prefix_scopes_names() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let scoped = must(ObjectBlobStore::new(Arc::clone(&inner), "memory://")).with_prefix("/raters/");
        let root = must(ObjectBlobStore::new(inner, "memory://"));

        must(scoped.write("user_1.json", b"{}"));
        assert!(must(root.exists("raters/user_1.json")));
        assert_eq!(must(scoped.list("")), vec!["user_1.json".to_string()]);
        assert_eq!(scoped.describe(), "memory://raters");
    }

    #[test]
    fn counter_classifies_requests_and_prices_them() {
        let counter = Arc::new(RequestCounter::new(Some(RequestPrices {
            cheap_cents: 0.04,
            expensive_cents: 0.5,
        })));
        let store = must(ObjectBlobStore::in_memory()).with_counter(Arc::clone(&counter));

        must(store.write("a", b"1"));
        let _ = must(store.read("a"));
        let _ = must(store.exists("a"));
        let _ = must(store.list(""));

        assert_eq!(counter.counts(), (2, 2));
        let cost = counter.cost_cents().unwrap_or(f64::NAN);
        assert!((cost - 1.08).abs() < 1e-9);

        let unpriced = RequestCounter::new(None);
        assert_eq!(unpriced.cost_cents(), None);
    }

    #[test]
    fn unreachable_backend_surfaces_as_storage_unavailable() {
        let s3 = match AmazonS3Builder::new()
            .with_bucket_name("pairpref-test")
            .with_region("us-east-1")
            .with_endpoint("http://127.0.0.1:1")
            .with_allow_http(true)
            .with_access_key_id("test")
            .with_secret_access_key("test")
            .with_retry(object_store::RetryConfig {
                max_retries: 0,
                retry_timeout: std::time::Duration::from_secs(2),
                ..object_store::RetryConfig::default()
            })
            .build()
        {
            Ok(value) => value,
            Err(err) => panic!("failed to configure s3 client: {err}"),
        };
        let store = must(ObjectBlobStore::new(Arc::new(s3), "s3://pairpref-test"));

        for result in [
            store.read("experiments.db").map(|_| ()),
            store.write("experiments.db", b"v1"),
            store.exists("experiments.db").map(|_| ()),
            store.list("").map(|_| ()),
        ] {
            match result {
                Err(PrefError::StorageUnavailable(message)) => {
                    assert!(message.contains("s3://pairpref-test"), "message={message}");
                }
                other => panic!("expected storage unavailable, got {other:?}"),
            }
        }
    }
}
