//! Canonical error sum for the tracker.
//!
//! Domain errors are bounded and recoverable; storage errors are fatal and
//! abort the enclosing transaction. The CLI maps variants onto exit codes.

use thiserror::Error;

use crate::model::Field;

#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum Error {
    #[error("todo {0} not found")]
    NotFound(String),

    #[error("invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    #[error("dependency cycle: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },

    #[error("cannot depend on self")]
    SelfEdge,

    #[error("conflict pending on {}", render_fields(fields))]
    ConflictPending { fields: Vec<Field> },

    #[error("already claimed by {by}")]
    AlreadyClaimed { by: String },

    #[error("not claimable: {reason}")]
    NotClaimable { reason: String },

    #[error("no pending conflicts")]
    NoConflicts,

    #[error("todo {0} is not closed")]
    NotClosed(String),

    #[error("invalid override for {field}: {reason}")]
    InvalidOverride { field: String, reason: String },

    #[error("storage full")]
    StorageFull,

    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),
}

fn render_fields(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Error {
    /// Process exit code for the CLI surface.
    ///
    /// 1 = user error, 2 = conflict pending (actionable), 3 = storage,
    /// 4 = cycle detected.
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::ConflictPending { .. } => 2,
            Error::StorageFull | Error::StorageCorrupt(_) => 3,
            Error::CycleDetected { .. } => 4,
            _ => 1,
        }
    }

    /// Storage errors abort the whole operation; nothing was committed.
    pub fn is_storage(&self) -> bool {
        matches!(self, Error::StorageFull | Error::StorageCorrupt(_))
    }
}

impl From<heed::Error> for Error {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(heed::MdbError::MapFull) => Error::StorageFull,
            other => Error::StorageCorrupt(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_surface_contract() {
        assert_eq!(Error::NotFound("todo_9".into()).exit_code(), 1);
        assert_eq!(
            Error::ConflictPending { fields: vec![Field::Priority] }.exit_code(),
            2
        );
        assert_eq!(Error::StorageFull.exit_code(), 3);
        assert_eq!(Error::CycleDetected { path: vec![] }.exit_code(), 4);
    }

    #[test]
    fn conflict_message_names_fields() {
        let err = Error::ConflictPending {
            fields: vec![Field::Priority, Field::Title],
        };
        assert_eq!(err.to_string(), "conflict pending on priority, title");
    }
}
