use std::collections::BTreeSet;

use pairpref_core::{inspect_pair, Modality, PairValidator, PayloadCodec, PrefError, Question};
use rusqlite::types::Value as SqlValue;
use rusqlite::params_from_iter;
use serde::{Deserialize, Serialize};

use crate::{collect_rows, parse_algorithm, RawTrajectory, SqlContext, SqlitePrefStore};

const PAIR_COLUMNS: &str = "q.id, q.algorithm, q.env, q.label,
    l.id, l.start_state, l.actions, l.env, l.modality, l.reason, l.cstates,
    r.id, r.start_state, r.actions, r.env, r.modality, r.reason, r.cstates";

const PAIR_JOIN: &str = "FROM questions AS q
    INNER JOIN trajectories AS l ON q.first_id = l.id
    INNER JOIN trajectories AS r ON q.second_id = r.id";

/// Constraints for one random draw of questions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SampleRequest {
    pub n: usize,
    pub env: String,
    #[serde(default)]
    pub modality: Option<Modality>,
    #[serde(default)]
    pub length: Option<i64>,
    #[serde(default)]
    pub exclude_ids: BTreeSet<i64>,
}

impl SampleRequest {
    pub fn new(n: usize, env: &str) -> Self {
        Self {
            n,
            env: env.to_string(),
            modality: None,
            length: None,
            exclude_ids: BTreeSet::new(),
        }
    }

    fn to_sql(&self) -> Result<(String, Vec<SqlValue>), PrefError> {
        let mut clauses = vec![
            "q.env = ?".to_string(),
            "l.env = ?".to_string(),
            "r.env = ?".to_string(),
        ];
        let mut values: Vec<SqlValue> = vec![
            self.env.clone().into(),
            self.env.clone().into(),
            self.env.clone().into(),
        ];

        if let Some(modality) = self.modality {
            clauses.push("l.modality = ? AND r.modality = ?".to_string());
            values.push(modality.as_str().to_string().into());
            values.push(modality.as_str().to_string().into());
        }

        if let Some(length) = self.length {
            clauses.push("l.length = ? AND r.length = ?".to_string());
            values.push(length.into());
            values.push(length.into());
        }

        if !self.exclude_ids.is_empty() {
            let placeholders = vec!["?"; self.exclude_ids.len()].join(", ");
            clauses.push(format!("q.id NOT IN ({placeholders})"));
            values.extend(self.exclude_ids.iter().map(|id| SqlValue::from(*id)));
        }

        let limit = i64::try_from(self.n)
            .map_err(|_| PrefError::Validation(format!("sample size {} is too large", self.n)))?;
        values.push(limit.into());

        let sql = format!(
            "SELECT {PAIR_COLUMNS} {PAIR_JOIN} WHERE {} ORDER BY RANDOM() LIMIT ?",
            clauses.join(" AND ")
        );
        Ok((sql, values))
    }
}

struct RawPair {
    id: i64,
    algorithm: String,
    env: String,
    label: Option<String>,
    left: RawTrajectory,
    right: RawTrajectory,
}

impl RawPair {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            algorithm: row.get(1)?,
            env: row.get(2)?,
            label: row.get(3)?,
            left: RawTrajectory::from_row(row, 4)?,
            right: RawTrajectory::from_row(row, 11)?,
        })
    }

    fn decode<C: PayloadCodec>(self, codec: &C) -> Result<Question, PrefError> {
        Ok(Question {
            id: self.id,
            algorithm: parse_algorithm(&self.algorithm)?,
            env_name: self.env,
            label: self.label,
            trajs: [self.left.decode(codec)?, self.right.decode(codec)?],
        })
    }
}

impl<C: PayloadCodec> SqlitePrefStore<C> {
    /// Draws exactly `request.n` distinct questions uniformly at random among
    /// those matching the request.
    ///
    /// Every decoded pair goes through `validators`; findings are logged and
    /// never drop a pair.
    ///
    /// # Errors
    /// Returns [`PrefError::InsufficientData`] when fewer than `n` questions
    /// match. No partial result is returned.
    pub fn sample_random_pairs(
        &self,
        request: &SampleRequest,
        validators: &[&dyn PairValidator],
    ) -> Result<Vec<Question>, PrefError> {
        let (sql, values) = request.to_sql()?;
        tracing::debug!(%sql, ?request, "sampling questions");

        let mut stmt = self
            .connection()
            .prepare(&sql)
            .context("failed to prepare sample query")?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawPair::from_row)
            .context("failed to run sample query")?;
        let raw = collect_rows(rows)?;

        if raw.len() != request.n {
            return Err(PrefError::InsufficientData {
                requested: request.n,
                available: raw.len(),
            });
        }

        let mut questions = Vec::with_capacity(raw.len());
        for pair in raw {
            let question = pair.decode(self.codec())?;
            inspect_pair(&question, validators);
            questions.push(question);
        }
        Ok(questions)
    }

    /// Fetches a question by label, choosing randomly when several share it.
    pub fn get_named_question(&self, name: &str) -> Result<Question, PrefError> {
        let sql = format!("SELECT {PAIR_COLUMNS} {PAIR_JOIN} WHERE q.label = ?1 ORDER BY RANDOM() LIMIT 1");
        tracing::debug!(%sql, name, "fetching named question");

        let mut stmt = self
            .connection()
            .prepare(&sql)
            .context("failed to prepare named question query")?;
        let rows = stmt
            .query_map([name], RawPair::from_row)
            .context("failed to run named question query")?;

        match collect_rows(rows)?.into_iter().next() {
            Some(pair) => pair.decode(self.codec()),
            None => Err(PrefError::NotFound(format!("question labelled {name:?}"))),
        }
    }
}
