//! Jari: an embedded task/issue tracker for concurrent autonomous agents.
//!
//! The core is a transactional data layer over a memory-mapped key-value
//! store: todos with priorities and dependency edges, a blocker-aware
//! ready queue, field-level optimistic concurrency with persisted
//! conflicts, and an append-only version history.

pub mod cli;
mod codec;
pub mod engine;
pub mod error;
pub mod graph;
pub mod model;
pub mod paths;
pub mod query;
pub mod service;
mod store;
pub mod time;

pub use engine::UpdateOutcome;
pub use error::{Error, Result};
pub use graph::{Direction, TreeNode};
pub use model::{
    AgentInfo, AgentName, ConflictRecord, Field, FieldChange, PendingRead, Priority, Resolution,
    SetOp, Snapshot, Status, TodoId, TodoRecord,
};
pub use query::{AgentStatus, BlockedTodo, ListFilter, Stats};
pub use service::{CreateTodo, Jari, TodoView};
pub use time::WallClock;
