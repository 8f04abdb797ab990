use std::collections::BTreeSet;
use std::sync::Arc;

use pairpref_core::{Answer, PrefError, User};
use time::OffsetDateTime;

use crate::BlobStore;

/// The per-rater JSON document, `user_<id>.json`.
///
/// Rater writes are frequent, so they go to one small file per rater instead
/// of the shared database blob.
#[derive(Debug)]
pub struct RaterFile {
    store: Arc<dyn BlobStore>,
    user_id: i64,
    name: String,
}

impl RaterFile {
    #[must_use]
    pub fn file_name(user_id: i64) -> String {
        format!("user_{user_id}.json")
    }

    /// Opens the document for `user_id`, creating it when absent, and checks
    /// that the stored identity matches.
    ///
    /// # Errors
    /// Returns [`PrefError::IdentityMismatch`] when an existing document
    /// carries a different payment code or user id.
    pub fn open(
        store: Arc<dyn BlobStore>,
        user_id: i64,
        payment_code: &str,
    ) -> Result<Self, PrefError> {
        let file = Self {
            store,
            user_id,
            name: Self::file_name(user_id),
        };

        if !file.store.exists(&file.name)? {
            tracing::info!(user_id, "creating rater file");
            file.write(&User::new(user_id, payment_code))?;
        }

        let user = file.get()?;
        if user.payment_code != payment_code {
            return Err(PrefError::IdentityMismatch(format!(
                "payment code mismatch for rater {user_id}"
            )));
        }
        if user.user_id != user_id {
            return Err(PrefError::IdentityMismatch(format!(
                "{} stores rater {} instead of {user_id}",
                file.name, user.user_id
            )));
        }

        Ok(file)
    }

    #[must_use]
    pub fn user_id(&self) -> i64 {
        self.user_id
    }

    pub fn get(&self) -> Result<User, PrefError> {
        let bytes = self.store.read(&self.name)?;
        serde_json::from_slice(&bytes)
            .map_err(|err| PrefError::Codec(format!("invalid rater file {}: {err}", self.name)))
    }

    pub fn write(&self, user: &User) -> Result<(), PrefError> {
        let bytes = serde_json::to_vec(user)
            .map_err(|err| PrefError::Codec(format!("failed to encode {}: {err}", self.name)))?;
        self.store.write(&self.name, &bytes)
    }

    /// Question ids this rater has already answered; the sampler's exclusion
    /// set.
    pub fn used_question_ids(&self) -> Result<BTreeSet<i64>, PrefError> {
        Ok(self.get()?.used_question_ids())
    }

    pub fn record_answer(&self, answer: Answer) -> Result<User, PrefError> {
        answer.warn_if_reversed();
        let mut user = self.get()?;
        user.responses.push(answer);
        self.write(&user)?;
        Ok(user)
    }

    pub fn record_interact_times(
        &self,
        start: OffsetDateTime,
        end: OffsetDateTime,
    ) -> Result<User, PrefError> {
        let mut user = self.get()?;
        user.interact_times = Some((start, end));
        self.write(&user)?;
        Ok(user)
    }
}

/// Extracts the rater id from a `user_<id>.json` file name.
#[must_use]
pub fn parse_rater_file_name(name: &str) -> Option<i64> {
    let digits = name.strip_prefix("user_")?.strip_suffix(".json")?;
    if digits.is_empty() || !digits.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Next free rater id: one past the largest `user_<id>.json` in the store
/// root, or 0 when there are none.
pub fn next_rater_id(store: &dyn BlobStore) -> Result<i64, PrefError> {
    let max = store
        .list("")?
        .iter()
        .filter_map(|name| parse_rater_file_name(name))
        .max();
    match max {
        None => Ok(0),
        Some(id) => id.checked_add(1).ok_or_else(|| {
            PrefError::Validation(format!("rater id space exhausted after {id}"))
        }),
    }
}
