//! Domain model: validated newtypes and the todo record schema.
//!
//! TodoId: `todo_{n}`, counter-issued, never reused
//! AgentName: self-asserted label, validated shape
//! Priority: 0-4 (0 = critical)
//! TodoRecord: the closed mutable schema; unknown fields survive rewrites

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::time::WallClock;

/// Stable todo identifier of the form `todo_{n}`.
///
/// `Ord` is numeric (`todo_2 < todo_10`) and orders collections and the
/// export; the queue comparator breaks its ties on the rendered id
/// instead, which is lexicographic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TodoId(u64);

impl TodoId {
    pub fn from_index(n: u64) -> Self {
        Self(n)
    }

    pub fn index(self) -> u64 {
        self.0
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let digits = raw.strip_prefix("todo_").ok_or_else(|| Error::InvalidInput {
            field: "todo_id",
            reason: format!("`{raw}` is not of the form todo_<n>"),
        })?;
        let n: u64 = digits.parse().map_err(|_| Error::InvalidInput {
            field: "todo_id",
            reason: format!("`{raw}` is not of the form todo_<n>"),
        })?;
        if n == 0 {
            return Err(Error::InvalidInput {
                field: "todo_id",
                reason: "todo numbering starts at 1".into(),
            });
        }
        Ok(Self(n))
    }
}

impl fmt::Display for TodoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "todo_{}", self.0)
    }
}

impl TryFrom<String> for TodoId {
    type Error = Error;
    fn try_from(raw: String) -> Result<Self, Error> {
        Self::parse(&raw)
    }
}

impl From<TodoId> for String {
    fn from(id: TodoId) -> String {
        id.to_string()
    }
}

/// Self-asserted agent label.
///
/// Shape-validated only; agent identity is not authenticated.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentName(String);

impl AgentName {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        if raw.is_empty() {
            return Err(Error::InvalidInput {
                field: "agent",
                reason: "agent name cannot be empty".into(),
            });
        }
        if raw.len() > 50 {
            return Err(Error::InvalidInput {
                field: "agent",
                reason: "agent name too long (max 50 chars)".into(),
            });
        }
        if raw == "default_agent" {
            return Err(Error::InvalidInput {
                field: "agent",
                reason: "pick a unique agent name, not the placeholder".into(),
            });
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(Error::InvalidInput {
                field: "agent",
                reason: "agent name may contain letters, digits, underscore, hyphen".into(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for AgentName {
    type Error = Error;
    fn try_from(raw: String) -> Result<Self, Error> {
        Self::parse(&raw)
    }
}

impl From<AgentName> for String {
    fn from(name: AgentName) -> String {
        name.0
    }
}

/// Durable workflow status.
///
/// `Blocked` is a user-set override; the ready/blocked queues derive from
/// edges and statuses, never by rewriting this field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Open,
    InProgress,
    Blocked,
    Closed,
    Deferred,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Closed => "closed",
            Self::Deferred => "deferred",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw {
            "open" => Ok(Self::Open),
            "in_progress" => Ok(Self::InProgress),
            "blocked" => Ok(Self::Blocked),
            "closed" => Ok(Self::Closed),
            "deferred" => Ok(Self::Deferred),
            _ => Err(Error::InvalidInput {
                field: "status",
                reason: format!("`{raw}` is not open|in_progress|blocked|closed|deferred"),
            }),
        }
    }

    /// Statuses eligible for the ready/blocked queues and for claiming.
    pub fn is_workable(self) -> bool {
        matches!(self, Self::Open | Self::InProgress)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Priority level: 0-4 inclusive, 0 = critical.
///
/// Validated at construction - invalid values are unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(1);
    pub const MEDIUM: Priority = Priority(2);
    pub const LOW: Priority = Priority(3);
    pub const BACKLOG: Priority = Priority(4);

    pub fn new(n: u8) -> Result<Self, Error> {
        if n > 4 {
            Err(Error::InvalidInput {
                field: "priority",
                reason: format!("{n} out of range 0..=4"),
            })
        } else {
            Ok(Self(n))
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "critical",
            1 => "high",
            2 => "medium",
            3 => "low",
            _ => "backlog",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::MEDIUM
    }
}

/// The closed set of mutable, diffable fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Title,
    Description,
    Status,
    Priority,
    Kind,
    Assignee,
    Parent,
    Reason,
    Labels,
    NiwaRefs,
    BlockedBy,
}

impl Field {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Title => "title",
            Self::Description => "description",
            Self::Status => "status",
            Self::Priority => "priority",
            Self::Kind => "kind",
            Self::Assignee => "assignee",
            Self::Parent => "parent",
            Self::Reason => "reason",
            Self::Labels => "labels",
            Self::NiwaRefs => "niwa_refs",
            Self::BlockedBy => "blocked_by",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        Ok(match raw {
            "title" => Self::Title,
            "description" => Self::Description,
            "status" => Self::Status,
            "priority" => Self::Priority,
            "kind" | "type" => Self::Kind,
            "assignee" => Self::Assignee,
            "parent" | "parent_id" => Self::Parent,
            "reason" => Self::Reason,
            "labels" => Self::Labels,
            "niwa_refs" => Self::NiwaRefs,
            "blocked_by" => Self::BlockedBy,
            _ => {
                return Err(Error::InvalidInput {
                    field: "field",
                    reason: format!("unknown field `{raw}`"),
                });
            }
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership change for a set-valued field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SetOp<T> {
    Add(T),
    Remove(T),
}

/// One proposed change, tagged by field.
///
/// Set-valued fields take membership ops, not whole-set assignment, so two
/// agents' disjoint edits can merge.
#[derive(Clone, Debug)]
pub enum FieldChange {
    Title(String),
    Description(String),
    Status(Status),
    Priority(Priority),
    Kind(String),
    Assignee(String),
    Parent(Option<TodoId>),
    Reason(Option<String>),
    Label(SetOp<String>),
    NiwaRef(SetOp<String>),
    BlockedBy(SetOp<TodoId>),
}

impl FieldChange {
    pub fn field(&self) -> Field {
        match self {
            Self::Title(_) => Field::Title,
            Self::Description(_) => Field::Description,
            Self::Status(_) => Field::Status,
            Self::Priority(_) => Field::Priority,
            Self::Kind(_) => Field::Kind,
            Self::Assignee(_) => Field::Assignee,
            Self::Parent(_) => Field::Parent,
            Self::Reason(_) => Field::Reason,
            Self::Label(_) => Field::Labels,
            Self::NiwaRef(_) => Field::NiwaRefs,
            Self::BlockedBy(_) => Field::BlockedBy,
        }
    }
}

/// The todo record.
///
/// Fields not in the closed schema are preserved verbatim across
/// read-modify-write cycles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TodoRecord {
    pub id: TodoId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: Status,
    pub priority: Priority,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub niwa_refs: BTreeSet<String>,
    #[serde(default)]
    pub parent_id: Option<TodoId>,
    #[serde(default)]
    pub blocked_by: BTreeSet<TodoId>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub closed_at: Option<WallClock>,
    pub version: u64,
    pub created_at: WallClock,
    pub updated_at: WallClock,
    pub created_by: AgentName,
    pub updated_by: AgentName,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl TodoRecord {
    /// JSON view of a scalar field, used for diffing and conflict capture.
    pub fn scalar(&self, field: Field) -> serde_json::Value {
        use serde_json::json;
        match field {
            Field::Title => json!(self.title),
            Field::Description => json!(self.description),
            Field::Status => json!(self.status),
            Field::Priority => json!(self.priority),
            Field::Kind => json!(self.kind),
            Field::Assignee => json!(self.assignee),
            Field::Parent => json!(self.parent_id),
            Field::Reason => json!(self.reason),
            Field::Labels | Field::NiwaRefs | Field::BlockedBy => {
                unreachable!("set-valued field diffed element-wise")
            }
        }
    }
}

/// Immutable copy of a todo at one version, plus provenance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub agent: AgentName,
    pub at: WallClock,
    pub operation: String,
    pub todo: TodoRecord,
}

/// The version an agent last observed for a todo.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingRead {
    pub agent: AgentName,
    pub todo_id: TodoId,
    pub version: u64,
    pub read_at: WallClock,
}

/// A captured write-write conflict awaiting resolution.
///
/// For set-valued fields `yours`/`theirs` are the opposing membership ops,
/// encoded as `{"add": elem}` / `{"remove": elem}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub todo_id: TodoId,
    pub seq: u64,
    pub agent: AgentName,
    pub field: Field,
    pub base_version: u64,
    pub their_version: u64,
    pub yours: serde_json::Value,
    pub theirs: serde_json::Value,
    pub at: WallClock,
}

/// First/last sighting of an agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentInfo {
    pub first_seen: WallClock,
    pub last_seen: WallClock,
}

/// Conflict resolution strategy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolution {
    AcceptYours,
    AcceptTheirs,
    ManualMerge,
}

impl Resolution {
    pub fn parse(raw: &str) -> Result<Self, Error> {
        match raw.to_ascii_uppercase().as_str() {
            "ACCEPT_YOURS" => Ok(Self::AcceptYours),
            "ACCEPT_THEIRS" => Ok(Self::AcceptTheirs),
            "MANUAL_MERGE" => Ok(Self::ManualMerge),
            _ => Err(Error::InvalidInput {
                field: "strategy",
                reason: format!("`{raw}` is not ACCEPT_YOURS|ACCEPT_THEIRS|MANUAL_MERGE"),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn todo_id_roundtrip_and_numeric_order() {
        let a = TodoId::parse("todo_2").unwrap();
        let b = TodoId::parse("todo_10").unwrap();
        assert!(a < b);
        assert_eq!(b.to_string(), "todo_10");
    }

    #[test]
    fn todo_id_rejects_malformed() {
        assert!(TodoId::parse("todo_").is_err());
        assert!(TodoId::parse("todo_0").is_err());
        assert!(TodoId::parse("t_1").is_err());
        assert!(TodoId::parse("todo_1x").is_err());
    }

    #[test]
    fn agent_name_validation() {
        assert!(AgentName::parse("claude_1").is_ok());
        assert!(AgentName::parse("").is_err());
        assert!(AgentName::parse("default_agent").is_err());
        assert!(AgentName::parse("has space").is_err());
        assert!(AgentName::parse(&"x".repeat(51)).is_err());
    }

    #[test]
    fn priority_range() {
        assert_eq!(Priority::new(0).unwrap(), Priority::CRITICAL);
        assert_eq!(Priority::new(4).unwrap().name(), "backlog");
        assert!(Priority::new(5).is_err());
        assert_eq!(Priority::default(), Priority::MEDIUM);
    }

    #[test]
    fn status_parse_roundtrip() {
        for s in [
            Status::Open,
            Status::InProgress,
            Status::Blocked,
            Status::Closed,
            Status::Deferred,
        ] {
            assert_eq!(Status::parse(s.as_str()).unwrap(), s);
        }
        assert!(Status::parse("done").is_err());
    }

    #[test]
    fn record_preserves_unknown_fields() {
        let raw = serde_json::json!({
            "id": "todo_1",
            "title": "t",
            "status": "open",
            "priority": 2,
            "type": "task",
            "version": 1,
            "created_at": 1,
            "updated_at": 1,
            "created_by": "a1",
            "updated_by": "a1",
            "future_field": {"nested": true},
        });
        let rec: TodoRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(rec.extra["future_field"]["nested"], true);
        let out = serde_json::to_value(&rec).unwrap();
        assert_eq!(out["future_field"]["nested"], true);
    }

    #[test]
    fn resolution_parse_is_case_tolerant() {
        assert_eq!(
            Resolution::parse("accept_yours").unwrap(),
            Resolution::AcceptYours
        );
        assert!(Resolution::parse("merge").is_err());
    }
}
