//! Domain model shared by the blob, store and CLI crates.
//!
//! Trajectories, questions, answers and rater records live here together with
//! the error taxonomy, the payload codec seam used for opaque BLOB columns and
//! the pluggable pair validators run after sampling.

use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

/// Number of questions a rater answers in one session.
pub const MAX_QUESTIONS: usize = 20;

/// Grid value the miner environment uses for a fire cell.
pub const FIRE_CELL: i64 = 12;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum PrefError {
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("insufficient data: requested {requested} questions, {available} available")]
    InsufficientData { requested: usize, available: usize },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("identity mismatch: {0}")]
    IdentityMismatch(String),
    #[error("write conflict after {attempts} attempts: {message}")]
    WriteConflict { attempts: u32, message: String },
    #[error("invalid modality: {0}")]
    InvalidModality(String),
    #[error("codec error: {0}")]
    Codec(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("validation error: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Modality {
    State,
    Action,
    Traj,
}

impl Modality {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::State => "state",
            Self::Action => "action",
            Self::Traj => "traj",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "state" => Some(Self::State),
            "action" => Some(Self::Action),
            "traj" => Some(Self::Traj),
            _ => None,
        }
    }

    /// Parses a caller-supplied modality string.
    ///
    /// # Errors
    /// Returns [`PrefError::InvalidModality`] for anything other than
    /// `state`, `action` or `traj`.
    pub fn from_request(value: &str) -> Result<Self, PrefError> {
        Self::parse(value).ok_or_else(|| PrefError::InvalidModality(value.to_string()))
    }
}

impl Display for Modality {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuestionAlgorithm {
    Random,
    Infogain,
    Manual,
}

impl QuestionAlgorithm {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Random => "random",
            Self::Infogain => "infogain",
            Self::Manual => "manual",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "random" => Some(Self::Random),
            "infogain" => Some(Self::Infogain),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct State {
    pub grid: Vec<Vec<i64>>,
    pub grid_shape: (usize, usize),
    pub agent_pos: (usize, usize),
    pub exit_pos: (usize, usize),
}

impl State {
    /// Decodes a start state as submitted by the recording front end, where
    /// the grid may arrive either as an array of rows or as an object whose
    /// values are the rows in order.
    ///
    /// # Errors
    /// Returns [`PrefError::Validation`] when a field is missing, has the
    /// wrong shape, or the grid disagrees with `grid_shape`.
    pub fn from_json(value: &Value) -> Result<Self, PrefError> {
        let grid_raw = value
            .get("grid")
            .ok_or_else(|| PrefError::Validation("start_state.grid is required".to_string()))?;
        let rows: Vec<&Value> = match grid_raw {
            Value::Array(items) => items.iter().collect(),
            Value::Object(map) => map.values().collect(),
            _ => {
                return Err(PrefError::Validation(
                    "start_state.grid must be an array or an object of rows".to_string(),
                ))
            }
        };

        let mut grid = Vec::with_capacity(rows.len());
        for row in rows {
            let cells: Vec<i64> = serde_json::from_value(row.clone()).map_err(|err| {
                PrefError::Validation(format!("start_state.grid row is not numeric: {err}"))
            })?;
            grid.push(cells);
        }

        let state = Self {
            grid,
            grid_shape: pair_field(value, "grid_shape")?,
            agent_pos: pair_field(value, "agent_pos")?,
            exit_pos: pair_field(value, "exit_pos")?,
        };
        state.validate()?;
        Ok(state)
    }

    /// Checks that the grid dimensions agree with `grid_shape`.
    ///
    /// # Errors
    /// Returns [`PrefError::Validation`] on any mismatch.
    pub fn validate(&self) -> Result<(), PrefError> {
        let (rows, cols) = self.grid_shape;
        if self.grid.len() != rows {
            return Err(PrefError::Validation(format!(
                "grid has {} rows but grid_shape says {rows}",
                self.grid.len()
            )));
        }
        if let Some(row) = self.grid.iter().find(|row| row.len() != cols) {
            return Err(PrefError::Validation(format!(
                "grid row has {} columns but grid_shape says {cols}",
                row.len()
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains_cell(&self, value: i64) -> bool {
        self.grid.iter().flatten().any(|cell| *cell == value)
    }
}

fn pair_field(value: &Value, field: &str) -> Result<(usize, usize), PrefError> {
    let raw = value
        .get(field)
        .ok_or_else(|| PrefError::Validation(format!("start_state.{field} is required")))?;
    serde_json::from_value(raw.clone())
        .map_err(|err| PrefError::Validation(format!("start_state.{field} must be a pair: {err}")))
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trajectory {
    pub start_state: State,
    pub actions: Option<Vec<i64>>,
    pub env_name: String,
    pub modality: Modality,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub cstates: Option<Value>,
}

impl Trajectory {
    #[must_use]
    pub fn length(&self) -> i64 {
        self.actions
            .as_ref()
            .map_or(0, |actions| i64::try_from(actions.len()).unwrap_or(i64::MAX))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrajectoryRecord {
    pub id: i64,
    #[serde(flatten)]
    pub trajectory: Trajectory,
}

/// Input for a new question row.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct NewQuestion {
    pub first_traj_id: i64,
    pub second_traj_id: i64,
    pub algorithm: QuestionAlgorithm,
    pub env_name: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// A stored question row without its trajectories.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct QuestionRecord {
    pub id: i64,
    pub first_traj_id: i64,
    pub second_traj_id: i64,
    pub algorithm: QuestionAlgorithm,
    pub env_name: String,
    pub label: Option<String>,
}

/// A question joined with both of its trajectories, as shown to a rater.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Question {
    pub id: i64,
    pub algorithm: QuestionAlgorithm,
    pub env_name: String,
    pub label: Option<String>,
    pub trajs: [TrajectoryRecord; 2],
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Answer {
    pub question_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<i64>,
    /// `true` when the rater preferred the second (right) trajectory.
    pub answer: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub start_time: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub end_time: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<(i64, i64)>,
}

impl Answer {
    /// Browser clocks drift, so a reversed interval is kept as recorded.
    #[must_use]
    pub fn interval_is_reversed(&self) -> bool {
        self.end_time < self.start_time
    }

    pub fn warn_if_reversed(&self) {
        if self.interval_is_reversed() {
            tracing::warn!(
                question_id = self.question_id,
                start_time = %self.start_time,
                end_time = %self.end_time,
                "answer ends before it starts; keeping it"
            );
        }
    }
}

/// Placeholder for rater demographics; no fields are collected yet.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct Demographics {}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct User {
    pub user_id: i64,
    pub payment_code: String,
    pub responses: Vec<Answer>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "rfc3339_pair")]
    pub interact_times: Option<(OffsetDateTime, OffsetDateTime)>,
}

impl User {
    #[must_use]
    pub fn new(user_id: i64, payment_code: &str) -> Self {
        Self {
            user_id,
            payment_code: payment_code.to_string(),
            responses: Vec::new(),
            interact_times: None,
        }
    }

    #[must_use]
    pub fn used_question_ids(&self) -> BTreeSet<i64> {
        self.responses.iter().map(|answer| answer.question_id).collect()
    }
}

mod rfc3339_pair {
    use serde::de::Error as _;
    use serde::ser::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<(OffsetDateTime, OffsetDateTime)>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some((start, end)) => {
                let start = start.format(&Rfc3339).map_err(S::Error::custom)?;
                let end = end.format(&Rfc3339).map_err(S::Error::custom)?;
                Some((start, end)).serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<(OffsetDateTime, OffsetDateTime)>, D::Error> {
        let raw: Option<(String, String)> = Option::deserialize(deserializer)?;
        raw.map(|(start, end)| {
            let start = OffsetDateTime::parse(&start, &Rfc3339).map_err(D::Error::custom)?;
            let end = OffsetDateTime::parse(&end, &Rfc3339).map_err(D::Error::custom)?;
            Ok((start, end))
        })
        .transpose()
    }
}

/// Encodes and decodes the opaque payloads kept in BLOB columns.
///
/// The store never looks inside the bytes; it only hands values to the codec
/// on the way in and back out.
pub trait PayloadCodec {
    /// # Errors
    /// Returns [`PrefError::Codec`] when the value cannot be encoded.
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, PrefError>;

    /// # Errors
    /// Returns [`PrefError::Codec`] when the bytes do not decode to `T`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PrefError>;
}

/// JSON payload codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, PrefError> {
        serde_json::to_vec(value).map_err(|err| PrefError::Codec(format!("encode failed: {err}")))
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, PrefError> {
        serde_json::from_slice(bytes)
            .map_err(|err| PrefError::Codec(format!("decode failed: {err}")))
    }
}

/// Post-sample check over a decoded pair. Findings are diagnostics only and
/// never cause a pair to be dropped.
pub trait PairValidator {
    fn name(&self) -> &'static str;

    fn inspect(&self, question: &Question) -> Option<String>;
}

/// Flags pairs whose start states both contain a given grid cell value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct HazardMarker {
    pub cell_value: i64,
}

impl Default for HazardMarker {
    fn default() -> Self {
        Self {
            cell_value: FIRE_CELL,
        }
    }
}

impl PairValidator for HazardMarker {
    fn name(&self) -> &'static str {
        "hazard_marker"
    }

    fn inspect(&self, question: &Question) -> Option<String> {
        let [left, right] = &question.trajs;
        if left.trajectory.start_state.contains_cell(self.cell_value)
            && right.trajectory.start_state.contains_cell(self.cell_value)
        {
            return Some(format!(
                "both trajectories of question {} start with cell {} present (reasons: {:?}, {:?})",
                question.id, self.cell_value, left.trajectory.reason, right.trajectory.reason
            ));
        }
        None
    }
}

/// Runs every validator over `question`, logging each finding as a warning.
pub fn inspect_pair(question: &Question, validators: &[&dyn PairValidator]) -> Vec<String> {
    let mut findings = Vec::new();
    for validator in validators {
        if let Some(finding) = validator.inspect(question) {
            tracing::warn!(validator = validator.name(), question_id = question.id, "{finding}");
            findings.push(finding);
        }
    }
    findings
}

/// How many more questions a rater may be served.
#[must_use]
pub fn questions_remaining(max_questions: usize, used: &BTreeSet<i64>) -> usize {
    max_questions.saturating_sub(used.len())
}

/// Parses an RFC3339 timestamp and normalizes it to UTC.
///
/// # Errors
/// Returns [`PrefError::Validation`] when parsing fails.
pub fn parse_rfc3339(value: &str) -> Result<OffsetDateTime, PrefError> {
    OffsetDateTime::parse(value, &Rfc3339)
        .map(|parsed| parsed.to_offset(UtcOffset::UTC))
        .map_err(|err| PrefError::Validation(format!("invalid RFC3339 timestamp {value:?}: {err}")))
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`PrefError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, PrefError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&Rfc3339)
        .map_err(|err| PrefError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_state(hazard: bool) -> State {
        let mut grid = vec![vec![0, 1, 2], vec![3, 4, 5]];
        if hazard {
            grid[1][2] = FIRE_CELL;
        }
        State {
            grid,
            grid_shape: (2, 3),
            agent_pos: (0, 0),
            exit_pos: (1, 2),
        }
    }

    fn fixture_question(left_hazard: bool, right_hazard: bool) -> Question {
        let trajectory = |hazard: bool, reason: &str| Trajectory {
            start_state: fixture_state(hazard),
            actions: Some(vec![1, 2, 3]),
            env_name: "miner".to_string(),
            modality: Modality::Traj,
            reason: Some(reason.to_string()),
            cstates: None,
        };
        Question {
            id: 9,
            algorithm: QuestionAlgorithm::Random,
            env_name: "miner".to_string(),
            label: None,
            trajs: [
                TrajectoryRecord {
                    id: 1,
                    trajectory: trajectory(left_hazard, "left"),
                },
                TrajectoryRecord {
                    id: 2,
                    trajectory: trajectory(right_hazard, "right"),
                },
            ],
        }
    }

    #[test]
    fn modality_rejects_unknown_values() {
        assert_eq!(must_ok(Modality::from_request("traj")), Modality::Traj);
        assert_eq!(
            Modality::from_request("video"),
            Err(PrefError::InvalidModality("video".to_string()))
        );
    }

    #[test]
    fn state_from_json_accepts_object_rows_in_order() {
        let value = json!({
            "grid": {"0": [0, 1, 2], "1": [3, 4, 12]},
            "grid_shape": [2, 3],
            "agent_pos": [0, 0],
            "exit_pos": [1, 2],
        });

        let state = must_ok(State::from_json(&value));
        assert_eq!(state, fixture_state(true));
    }

    #[test]
    fn state_from_json_rejects_shape_mismatch() {
        let value = json!({
            "grid": [[0, 1], [2, 3]],
            "grid_shape": [2, 3],
            "agent_pos": [0, 0],
            "exit_pos": [1, 1],
        });

        assert!(matches!(
            State::from_json(&value),
            Err(PrefError::Validation(_))
        ));
    }

    #[test]
    fn trajectory_length_is_zero_without_actions() {
        let mut trajectory = fixture_question(false, false).trajs[0].trajectory.clone();
        assert_eq!(trajectory.length(), 3);
        trajectory.actions = None;
        assert_eq!(trajectory.length(), 0);
    }

    #[test]
    fn json_codec_round_trips_state() {
        let codec = JsonCodec;
        let state = fixture_state(true);
        let bytes = must_ok(codec.encode(&state));
        let decoded: State = must_ok(codec.decode(&bytes));
        assert_eq!(decoded, state);
        assert!(matches!(
            codec.decode::<State>(b"not json"),
            Err(PrefError::Codec(_))
        ));
    }

    #[test]
    fn hazard_marker_needs_both_sides() {
        let marker = HazardMarker::default();
        assert!(marker.inspect(&fixture_question(true, false)).is_none());
        assert!(marker.inspect(&fixture_question(false, true)).is_none());

        let findings = inspect_pair(&fixture_question(true, true), &[&marker]);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].contains("question 9"));
    }

    #[test]
    fn user_file_shape_round_trips() {
        let start = must_ok(parse_rfc3339("2026-02-07T12:00:00Z"));
        let end = must_ok(parse_rfc3339("2026-02-07T12:00:30+00:00"));
        let mut user = User::new(4, "abc123");
        user.responses.push(Answer {
            question_id: 7,
            user_id: None,
            answer: true,
            start_time: start,
            end_time: end,
            max_steps: Some((40, 55)),
        });
        user.interact_times = Some((start, end));

        let raw = must_ok(serde_json::to_value(&user));
        assert_eq!(raw["responses"][0]["max_steps"], json!([40, 55]));
        assert_eq!(raw["interact_times"][0], json!("2026-02-07T12:00:00Z"));
        assert!(raw["responses"][0].get("user_id").is_none());

        let decoded: User = must_ok(serde_json::from_value(raw));
        assert_eq!(decoded, user);
        assert_eq!(decoded.used_question_ids(), BTreeSet::from([7]));
    }

    #[test]
    fn inverted_interval_is_detected_but_not_rejected() {
        let answer = Answer {
            question_id: 1,
            user_id: Some(2),
            answer: false,
            start_time: must_ok(parse_rfc3339("2026-02-07T12:00:10Z")),
            end_time: must_ok(parse_rfc3339("2026-02-07T12:00:00Z")),
            max_steps: None,
        };
        assert!(answer.interval_is_reversed());
        answer.warn_if_reversed();

        let forward = Answer {
            start_time: answer.end_time,
            end_time: answer.start_time,
            ..answer
        };
        assert!(!forward.interval_is_reversed());
    }

    #[test]
    fn remaining_questions_saturates() {
        assert_eq!(questions_remaining(MAX_QUESTIONS, &BTreeSet::from([5, 7])), 18);
        let many: BTreeSet<i64> = (0..30).collect();
        assert_eq!(questions_remaining(MAX_QUESTIONS, &many), 0);
    }

    #[test]
    fn timestamps_normalize_to_utc() {
        let parsed = must_ok(parse_rfc3339("2026-02-07T14:00:00+02:00"));
        assert_eq!(must_ok(format_rfc3339(parsed)), "2026-02-07T12:00:00Z");
    }
}
