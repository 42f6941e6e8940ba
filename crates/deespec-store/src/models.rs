//! Row and value types shared by every repository implementation.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Opaque task identifier.
///
/// Conventionally a UUID or ULID string, but the type makes no assumption
/// beyond "non-empty string" -- callers that reconstruct tasks from external
/// input sources may hand in any stable identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Generate a fresh random identifier (UUID v4).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl sqlx::Type<sqlx::Sqlite> for TaskId {
    fn type_info() -> <sqlx::Sqlite as sqlx::Database>::TypeInfo {
        <String as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TaskId {
    fn decode(
        value: <sqlx::Sqlite as sqlx::Database>::ValueRef<'r>,
    ) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <String as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(TaskId(s))
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TaskId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, sqlx::error::BoxDynError> {
        <String as sqlx::Encode<sqlx::Sqlite>>::encode_by_ref(&self.0, buf)
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Position of a task in the EPIC -> PBI -> SBI hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskKind {
    Epic,
    Pbi,
    Sbi,
}

impl TaskKind {
    /// The kind that may legally be this kind's parent, or `None` for EPIC.
    pub fn expected_parent_kind(self) -> Option<TaskKind> {
        match self {
            TaskKind::Epic => None,
            TaskKind::Pbi => Some(TaskKind::Epic),
            TaskKind::Sbi => Some(TaskKind::Pbi),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Epic => "EPIC",
            Self::Pbi => "PBI",
            Self::Sbi => "SBI",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "EPIC" => Ok(Self::Epic),
            "PBI" => Ok(Self::Pbi),
            "SBI" => Ok(Self::Sbi),
            other => Err(ParseEnumError::new("task kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle status of a task. See the transition table in
/// [`crate::models::TaskStatus::is_valid_transition`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Picked,
    Implementing,
    Reviewing,
    Done,
    Failed,
}

impl TaskStatus {
    /// Closed transition table: any pair not listed here is rejected.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Picked)
                | (Picked, Implementing)
                | (Picked, Pending)
                | (Implementing, Reviewing)
                | (Implementing, Failed)
                | (Implementing, Pending)
                | (Reviewing, Done)
                | (Reviewing, Implementing)
                | (Reviewing, Failed)
                | (Failed, Pending)
        )
    }

    /// Terminal statuses never mutate execution counters again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Picked => "picked",
            Self::Implementing => "implementing",
            Self::Reviewing => "reviewing",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "picked" => Ok(Self::Picked),
            "implementing" => Ok(Self::Implementing),
            "reviewing" => Ok(Self::Reviewing),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(ParseEnumError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Which lifecycle step a task is currently on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Pick,
    Implement,
    Review,
    Done,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pick => "pick",
            Self::Implement => "implement",
            Self::Review => "review",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

impl FromStr for Step {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pick" => Ok(Self::Pick),
            "implement" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            "done" => Ok(Self::Done),
            other => Err(ParseEnumError::new("step", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Review-stage outcome carried on the global state snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Pending,
    NeedsChanges,
    Succeeded,
    Failed,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::NeedsChanges => "NEEDS_CHANGES",
            Self::Succeeded => "SUCCEEDED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

impl FromStr for Decision {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(Self::Pending),
            "NEEDS_CHANGES" => Ok(Self::NeedsChanges),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            // Per the decision cascade in decide_after_review, any other
            // string is treated as NEEDS_CHANGES rather than rejected.
            _ => Ok(Self::NeedsChanges),
        }
    }
}

// ---------------------------------------------------------------------------

/// Read/write intent recorded on a state-lock. The manager currently treats
/// both as fully exclusive (see Open Questions in the design notes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LockType {
    Read,
    Write,
}

impl fmt::Display for LockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Read => "read",
            Self::Write => "write",
        };
        f.write_str(s)
    }
}

impl FromStr for LockType {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(ParseEnumError::new("lock type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for ParseEnumError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for ParseEnumError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// Execution state tracked for leaf (SBI) tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionState {
    pub current_turn: u32,
    pub current_attempt: u32,
    pub max_turns: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub artifacts: Vec<String>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self {
            current_turn: 1,
            current_attempt: 1,
            max_turns: 10,
            max_attempts: 3,
            last_error: None,
            artifacts: Vec::new(),
        }
    }
}

/// Metadata common to every task regardless of kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    pub priority: i32,
    pub sequence: u64,
    pub registered_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub file_paths: Vec<String>,
    pub dependencies: HashSet<TaskId>,
    pub only_implement: bool,
    pub max_turns_override: Option<u32>,
    pub max_attempts_override: Option<u32>,
}

impl Default for TaskMetadata {
    fn default() -> Self {
        Self {
            priority: 0,
            sequence: 0,
            registered_at: Utc::now(),
            started_at: None,
            completed_at: None,
            file_paths: Vec::new(),
            dependencies: HashSet::new(),
            only_implement: false,
            max_turns_override: None,
            max_attempts_override: None,
        }
    }
}

/// The canonical task entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    pub parent_id: Option<TaskId>,
    pub title: String,
    pub description: String,
    pub labels: HashSet<String>,
    pub assigned_agent: Option<String>,
    pub status: TaskStatus,
    pub step: Step,
    pub execution: Option<ExecutionState>,
    pub metadata: TaskMetadata,
}

/// A single run-lock or state-lock row.
///
/// `lock_type` is `None` for run-locks and `Some` for state-locks; the two
/// flavors share every other field.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LockRecord {
    pub lock_id: String,
    pub pid: i64,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    #[sqlx(json)]
    pub metadata: HashMap<String, String>,
    pub lock_type: Option<LockType>,
}

impl LockRecord {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    pub fn is_heartbeat_stale(&self, now: DateTime<Utc>, max_staleness: chrono::Duration) -> bool {
        now - self.heartbeat_at > max_staleness
    }
}

/// An artifact recorded by a single journal entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactKind {
    Diff { path: String },
    Log { path: String },
    Report { path: String },
    Other { path: String, label: String },
}

/// Append-only record of one lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub ts: DateTime<Utc>,
    pub turn: u32,
    pub step: Step,
    pub decision: Decision,
    pub elapsed_ms: u64,
    pub error: String,
    pub artifacts: Vec<ArtifactKind>,
}

/// CAS-guarded global pointer describing "what is happening right now".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub version: u64,
    pub current: Step,
    pub status: TaskStatus,
    pub turn: u32,
    pub wip: String,
    pub lease_expires_at: String,
    pub inputs: HashMap<String, String>,
    pub last_artifacts: HashMap<String, String>,
    pub decision: Decision,
    pub attempt: u32,
    pub meta: StateMeta,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMeta {
    pub updated_at: DateTime<Utc>,
}

impl Default for StateSnapshot {
    fn default() -> Self {
        Self {
            version: 0,
            current: Step::Pick,
            status: TaskStatus::Pending,
            turn: 0,
            wip: String::new(),
            lease_expires_at: String::new(),
            inputs: HashMap::new(),
            last_artifacts: HashMap::new(),
            decision: Decision::Pending,
            attempt: 1,
            meta: StateMeta {
                updated_at: Utc::now(),
            },
        }
    }
}

/// A draft note emitted by the incomplete-instruction detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackDraft {
    pub task_id: TaskId,
    pub reason: String,
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_kind_display_roundtrip() {
        for v in [TaskKind::Epic, TaskKind::Pbi, TaskKind::Sbi] {
            let parsed: TaskKind = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_kind_invalid() {
        assert!("bogus".parse::<TaskKind>().is_err());
    }

    #[test]
    fn task_status_display_roundtrip() {
        let variants = [
            TaskStatus::Pending,
            TaskStatus::Picked,
            TaskStatus::Implementing,
            TaskStatus::Reviewing,
            TaskStatus::Done,
            TaskStatus::Failed,
        ];
        for v in variants {
            let parsed: TaskStatus = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn task_status_invalid() {
        assert!("nope".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn step_display_roundtrip() {
        for v in [Step::Pick, Step::Implement, Step::Review, Step::Done] {
            let parsed: Step = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn decision_display_roundtrip() {
        let variants = [
            Decision::Pending,
            Decision::NeedsChanges,
            Decision::Succeeded,
            Decision::Failed,
        ];
        for v in variants {
            let parsed: Decision = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn decision_unknown_string_treated_as_needs_changes() {
        let parsed: Decision = "WEIRD".parse().expect("unknown strings are tolerated");
        assert_eq!(parsed, Decision::NeedsChanges);
    }

    #[test]
    fn lock_type_display_roundtrip() {
        for v in [LockType::Read, LockType::Write] {
            let parsed: LockType = v.to_string().parse().expect("should parse");
            assert_eq!(v, parsed);
        }
    }

    #[test]
    fn expected_parent_kind() {
        assert_eq!(TaskKind::Epic.expected_parent_kind(), None);
        assert_eq!(TaskKind::Pbi.expected_parent_kind(), Some(TaskKind::Epic));
        assert_eq!(TaskKind::Sbi.expected_parent_kind(), Some(TaskKind::Pbi));
    }

    #[test]
    fn status_transition_table_closed() {
        use TaskStatus::*;
        let allowed = [
            (Pending, Picked),
            (Picked, Implementing),
            (Picked, Pending),
            (Implementing, Reviewing),
            (Implementing, Failed),
            (Implementing, Pending),
            (Reviewing, Done),
            (Reviewing, Implementing),
            (Reviewing, Failed),
            (Failed, Pending),
        ];
        let all = [Pending, Picked, Implementing, Reviewing, Done, Failed];
        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    TaskStatus::is_valid_transition(from, to),
                    expected,
                    "transition {from} -> {to} mismatch"
                );
            }
        }
    }

    #[test]
    fn lock_record_expiry() {
        let now = Utc::now();
        let mut rec = LockRecord {
            lock_id: "sbi/SBI-1".into(),
            pid: 1,
            hostname: "h".into(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(10),
            heartbeat_at: now,
            metadata: HashMap::new(),
            lock_type: None,
        };
        assert!(!rec.is_expired(now));
        rec.expires_at = now - chrono::Duration::seconds(1);
        assert!(rec.is_expired(now));
    }
}
