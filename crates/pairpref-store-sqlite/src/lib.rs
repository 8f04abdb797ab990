#![allow(clippy::missing_errors_doc)]

mod remote;
mod sampler;

use std::collections::BTreeMap;
use std::path::Path;

use pairpref_core::{
    format_rfc3339, now_utc, parse_rfc3339, Answer, Demographics, JsonCodec, Modality,
    NewQuestion, PayloadCodec, PrefError, QuestionAlgorithm, QuestionRecord, State, Trajectory,
    TrajectoryRecord,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

pub use remote::RemoteStore;
pub use sampler::SampleRequest;

const SCHEMA_VERSION: i64 = 1;

/// Retries `create_user` makes after the first failed attempt.
pub const DEFAULT_CREATE_USER_RETRIES: u32 = 3;

const SCHEMA_V1: &str = r"
CREATE TABLE IF NOT EXISTS users (
  id INTEGER PRIMARY KEY,
  sequence INTEGER NOT NULL,
  demographics BLOB NOT NULL,
  payment_code TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS trajectories (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  start_state BLOB NOT NULL,
  actions BLOB NOT NULL,
  length INTEGER NOT NULL,
  env TEXT NOT NULL,
  modality TEXT NOT NULL CHECK (modality IN ('state','action','traj')),
  reason TEXT,
  cstates BLOB
);

CREATE TABLE IF NOT EXISTS questions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  first_id INTEGER NOT NULL REFERENCES trajectories(id),
  second_id INTEGER NOT NULL REFERENCES trajectories(id),
  algorithm TEXT NOT NULL CHECK (algorithm IN ('random','infogain','manual')),
  env TEXT NOT NULL,
  label TEXT
);

CREATE TABLE IF NOT EXISTS answers (
  user_id INTEGER,
  question_id INTEGER NOT NULL REFERENCES questions(id),
  answer INTEGER NOT NULL CHECK (answer IN (0,1)),
  start_time TEXT NOT NULL,
  end_time TEXT NOT NULL,
  max_steps_first INTEGER,
  max_steps_second INTEGER
);

CREATE INDEX IF NOT EXISTS idx_questions_env ON questions(env);
CREATE INDEX IF NOT EXISTS idx_questions_label ON questions(label);
CREATE INDEX IF NOT EXISTS idx_answers_question ON answers(question_id);
";

const COUNTED_TABLES: [&str; 4] = ["answers", "questions", "trajectories", "users"];

/// Attaches a short description to SQLite failures, mapping them to
/// [`PrefError::Database`].
trait SqlContext<T> {
    fn context(self, what: &str) -> Result<T, PrefError>;
}

impl<T> SqlContext<T> for rusqlite::Result<T> {
    fn context(self, what: &str) -> Result<T, PrefError> {
        self.map_err(|err| PrefError::Database(format!("{what}: {err}")))
    }
}

/// Preference data in an embedded SQLite file.
///
/// `start_state`, `actions`, `cstates` and `demographics` are opaque BLOBs
/// produced by the codec `C`; SQL never looks inside them.
pub struct SqlitePrefStore<C: PayloadCodec = JsonCodec> {
    conn: Connection,
    codec: C,
}

impl SqlitePrefStore<JsonCodec> {
    pub fn open(path: &Path) -> Result<Self, PrefError> {
        Self::open_with_codec(path, JsonCodec)
    }
}

impl<C: PayloadCodec> SqlitePrefStore<C> {
    pub fn open_with_codec(path: &Path, codec: C) -> Result<Self, PrefError> {
        let conn = Connection::open(path)
            .context(&format!("failed to open sqlite database at {}", path.display()))?;

        // The pushed blob is the main file alone, so no WAL side files.
        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, codec })
    }

    pub fn migrate(&self) -> Result<(), PrefError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_V1)
            .context("failed to apply preference schema")?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SCHEMA_VERSION, now],
            )
            .context("failed to register schema migration")?;

        Ok(())
    }

    /// Closes the connection, flushing everything to the database file.
    pub fn close(self) -> Result<(), PrefError> {
        self.conn
            .close()
            .map_err(|(_, err)| PrefError::Database(format!("failed to close database: {err}")))
    }

    #[must_use]
    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn insert_trajectory(&self, trajectory: &Trajectory) -> Result<i64, PrefError> {
        insert_trajectory_row(&self.conn, &self.codec, trajectory)
    }

    pub fn insert_question(&self, question: &NewQuestion) -> Result<i64, PrefError> {
        insert_question_row(&self.conn, question)
    }

    pub fn insert_answer(&self, answer: &Answer) -> Result<(), PrefError> {
        insert_answer_row(&self.conn, answer)
    }

    /// Inserts every answer or none of them.
    pub fn insert_answers(&mut self, answers: &[Answer]) -> Result<(), PrefError> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start answers transaction")?;
        for answer in answers {
            insert_answer_row(&tx, answer)?;
        }
        tx.commit().context("failed to commit answers transaction")?;
        tracing::debug!(count = answers.len(), "inserted answers");
        Ok(())
    }

    /// Stores both trajectories of every pair plus a question joining them,
    /// in one transaction. Returns the new question ids in input order.
    pub fn save_question_pairs(
        &mut self,
        pairs: &[(Trajectory, Trajectory)],
        algorithm: QuestionAlgorithm,
        env: &str,
    ) -> Result<Vec<i64>, PrefError> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start question transaction")?;

        let mut ids = Vec::with_capacity(pairs.len());
        for (first, second) in pairs {
            let first_traj_id = insert_trajectory_row(&tx, &self.codec, first)?;
            let second_traj_id = insert_trajectory_row(&tx, &self.codec, second)?;
            ids.push(insert_question_row(
                &tx,
                &NewQuestion {
                    first_traj_id,
                    second_traj_id,
                    algorithm,
                    env_name: env.to_string(),
                    label: None,
                },
            )?);
        }

        tx.commit().context("failed to commit question transaction")?;
        tracing::info!(count = ids.len(), env, algorithm = algorithm.as_str(), "saved question pairs");
        Ok(ids)
    }

    /// Creates a user with the next free id and returns it.
    pub fn create_user(
        &self,
        demographics: &Demographics,
        payment_code: &str,
        max_retries: u32,
    ) -> Result<i64, PrefError> {
        self.create_user_with(demographics, payment_code, max_retries, next_user_id)
    }

    /// Like [`Self::create_user`] with a caller-supplied id allocator.
    ///
    /// Only a collision on `users.id` triggers a fresh allocation. After
    /// `max_retries + 1` collisions the result is [`PrefError::WriteConflict`].
    /// Allocator errors and every other insert failure are returned as they are.
    pub fn create_user_with<F>(
        &self,
        demographics: &Demographics,
        payment_code: &str,
        max_retries: u32,
        mut allocate: F,
    ) -> Result<i64, PrefError>
    where
        F: FnMut(&Connection) -> Result<i64, PrefError>,
    {
        let payload = self.codec.encode(demographics)?;
        let attempts = max_retries.saturating_add(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            let user_id = allocate(&self.conn)?;
            let inserted = self.conn.execute(
                "INSERT INTO users(id, sequence, demographics, payment_code)
                 VALUES (?1, (SELECT COALESCE(MAX(sequence), -1) + 1 FROM users), ?2, ?3)",
                params![user_id, payload, payment_code],
            );

            match inserted {
                Ok(_) => {
                    tracing::info!(user_id, attempt, "created user");
                    return Ok(user_id);
                }
                Err(err) if is_id_collision(&err) => {
                    tracing::warn!(user_id, attempt, attempts, error = %err, "user id collision");
                    last_error = format!("failed to insert user {user_id}: {err}");
                }
                Err(err) => {
                    return Err(PrefError::Database(format!("failed to insert user: {err}")))
                }
            }
        }

        Err(PrefError::WriteConflict {
            attempts,
            message: last_error,
        })
    }

    pub fn get_payment_code(&self, user_id: i64) -> Result<String, PrefError> {
        self.conn
            .query_row(
                "SELECT payment_code FROM users WHERE id = ?1",
                params![user_id],
                |row| row.get(0),
            )
            .optional()
            .context("failed to read payment code")?
            .ok_or_else(|| PrefError::NotFound(format!("user {user_id}")))
    }

    pub fn get_trajectory(&self, id: i64) -> Result<TrajectoryRecord, PrefError> {
        let raw = self
            .conn
            .query_row(
                "SELECT id, start_state, actions, env, modality, reason, cstates
                 FROM trajectories WHERE id = ?1",
                params![id],
                |row| RawTrajectory::from_row(row, 0),
            )
            .optional()
            .context("failed to read trajectory")?
            .ok_or_else(|| PrefError::NotFound(format!("trajectory {id}")))?;
        raw.decode(&self.codec)
    }

    pub fn get_question(&self, id: i64) -> Result<QuestionRecord, PrefError> {
        let row = self
            .conn
            .query_row(
                "SELECT id, first_id, second_id, algorithm, env, label FROM questions WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, Option<String>>(5)?,
                    ))
                },
            )
            .optional()
            .context("failed to read question")?
            .ok_or_else(|| PrefError::NotFound(format!("question {id}")))?;

        let (id, first_traj_id, second_traj_id, algorithm, env_name, label) = row;
        Ok(QuestionRecord {
            id,
            first_traj_id,
            second_traj_id,
            algorithm: parse_algorithm(&algorithm)?,
            env_name,
            label,
        })
    }

    pub fn list_answers(&self, question_id: i64) -> Result<Vec<Answer>, PrefError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT user_id, question_id, answer, start_time, end_time,
                        max_steps_first, max_steps_second
                 FROM answers WHERE question_id = ?1 ORDER BY rowid ASC",
            )
            .context("failed to prepare answer listing")?;
        let rows = stmt
            .query_map(params![question_id], |row| {
                Ok((
                    row.get::<_, Option<i64>>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<i64>>(5)?,
                    row.get::<_, Option<i64>>(6)?,
                ))
            })
            .context("failed to list answers")?;

        let mut answers = Vec::new();
        for row in collect_rows(rows)? {
            let (user_id, question_id, answer, start_time, end_time, first, second) = row;
            answers.push(Answer {
                question_id,
                user_id,
                answer: answer != 0,
                start_time: parse_rfc3339(&start_time)?,
                end_time: parse_rfc3339(&end_time)?,
                max_steps: first.zip(second),
            });
        }
        Ok(answers)
    }

    /// Row counts for every preference table.
    pub fn table_counts(&self) -> Result<BTreeMap<String, i64>, PrefError> {
        let mut counts = BTreeMap::new();
        for table in COUNTED_TABLES {
            let count: i64 = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .context(&format!("failed to count {table}"))?;
            counts.insert(table.to_string(), count);
        }
        Ok(counts)
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// Default id allocator: one past the largest user id, 0 for the first user.
pub fn next_user_id(conn: &Connection) -> Result<i64, PrefError> {
    conn.query_row("SELECT COALESCE(MAX(id), -1) + 1 FROM users", [], |row| {
        row.get(0)
    })
    .context("failed to allocate user id")
}

fn is_id_collision(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Builds an `INSERT` whose column list depends on which optional values are
/// present, so an absent value leaves the column NULL instead of binding one.
struct InsertBuilder {
    table: &'static str,
    columns: Vec<&'static str>,
    values: Vec<SqlValue>,
}

impl InsertBuilder {
    fn new(table: &'static str) -> Self {
        Self {
            table,
            columns: Vec::new(),
            values: Vec::new(),
        }
    }

    fn column(mut self, name: &'static str, value: impl Into<SqlValue>) -> Self {
        self.columns.push(name);
        self.values.push(value.into());
        self
    }

    fn optional<V: Into<SqlValue>>(self, name: &'static str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.column(name, value),
            None => self,
        }
    }

    fn sql(&self) -> String {
        let placeholders = (1..=self.columns.len())
            .map(|index| format!("?{index}"))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "INSERT INTO {}({}) VALUES ({placeholders})",
            self.table,
            self.columns.join(", ")
        )
    }

    fn execute(self, conn: &Connection) -> Result<i64, PrefError> {
        let sql = self.sql();
        tracing::debug!(%sql, "insert");
        conn.execute(&sql, params_from_iter(self.values.iter()))
            .context(&format!("failed to insert into {}", self.table))?;
        Ok(conn.last_insert_rowid())
    }
}

fn insert_trajectory_row<C: PayloadCodec>(
    conn: &Connection,
    codec: &C,
    trajectory: &Trajectory,
) -> Result<i64, PrefError> {
    let cstates = trajectory
        .cstates
        .as_ref()
        .map(|value| codec.encode(value))
        .transpose()?;

    InsertBuilder::new("trajectories")
        .column("start_state", codec.encode(&trajectory.start_state)?)
        .column("actions", codec.encode(&trajectory.actions)?)
        .column("length", trajectory.length())
        .column("env", trajectory.env_name.clone())
        .column("modality", trajectory.modality.as_str().to_string())
        .optional("reason", trajectory.reason.clone())
        .optional("cstates", cstates)
        .execute(conn)
}

fn insert_question_row(conn: &Connection, question: &NewQuestion) -> Result<i64, PrefError> {
    InsertBuilder::new("questions")
        .column("first_id", question.first_traj_id)
        .column("second_id", question.second_traj_id)
        .column("algorithm", question.algorithm.as_str().to_string())
        .column("env", question.env_name.clone())
        .optional("label", question.label.clone())
        .execute(conn)
}

fn insert_answer_row(conn: &Connection, answer: &Answer) -> Result<(), PrefError> {
    answer.warn_if_reversed();
    InsertBuilder::new("answers")
        .optional("user_id", answer.user_id)
        .column("question_id", answer.question_id)
        .column("answer", i64::from(answer.answer))
        .column("start_time", format_rfc3339(answer.start_time)?)
        .column("end_time", format_rfc3339(answer.end_time)?)
        .optional("max_steps_first", answer.max_steps.map(|steps| steps.0))
        .optional("max_steps_second", answer.max_steps.map(|steps| steps.1))
        .execute(conn)?;
    Ok(())
}

/// Undecoded trajectory columns in the order
/// `id, start_state, actions, env, modality, reason, cstates`.
struct RawTrajectory {
    id: i64,
    start_state: Vec<u8>,
    actions: Vec<u8>,
    env: String,
    modality: String,
    reason: Option<String>,
    cstates: Option<Vec<u8>>,
}

impl RawTrajectory {
    fn from_row(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(offset)?,
            start_state: row.get(offset + 1)?,
            actions: row.get(offset + 2)?,
            env: row.get(offset + 3)?,
            modality: row.get(offset + 4)?,
            reason: row.get(offset + 5)?,
            cstates: row.get(offset + 6)?,
        })
    }

    fn decode<C: PayloadCodec>(self, codec: &C) -> Result<TrajectoryRecord, PrefError> {
        let modality = Modality::parse(&self.modality).ok_or_else(|| {
            PrefError::Database(format!(
                "trajectory {} has unknown modality {}",
                self.id, self.modality
            ))
        })?;
        let start_state: State = codec.decode(&self.start_state)?;
        let actions: Option<Vec<i64>> = codec.decode(&self.actions)?;
        let cstates = self
            .cstates
            .as_deref()
            .map(|bytes| codec.decode(bytes))
            .transpose()?;

        Ok(TrajectoryRecord {
            id: self.id,
            trajectory: Trajectory {
                start_state,
                actions,
                env_name: self.env,
                modality,
                reason: self.reason,
                cstates,
            },
        })
    }
}

fn parse_algorithm(raw: &str) -> Result<QuestionAlgorithm, PrefError> {
    QuestionAlgorithm::parse(raw)
        .ok_or_else(|| PrefError::Database(format!("unknown question algorithm {raw}")))
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, PrefError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.context("failed to read row")?);
    }
    Ok(values)
}
