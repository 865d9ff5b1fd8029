//! Read-side queries: filters, ready/blocked queues, search, history,
//! agent status, stats and export.
//!
//! Readiness is derived, never stored: closing a blocker makes its
//! children appear in the next `ready` evaluation without any status
//! rewrite.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::graph::{self, Direction, TreeNode};
use crate::model::{
    AgentInfo, AgentName, ConflictRecord, Priority, Snapshot, Status, TodoId, TodoRecord,
};
use crate::service::Jari;

/// Snapshots reported per agent by `agent_status`.
const RECENT_SNAPSHOTS: usize = 10;

/// Conjunctive list filter; `None` matches everything.
#[derive(Clone, Debug, Default)]
pub struct ListFilter {
    pub status: Option<Status>,
    pub priority: Option<Priority>,
    pub assignee: Option<String>,
    pub kind: Option<String>,
    pub label: Option<String>,
}

impl ListFilter {
    fn matches(&self, rec: &TodoRecord) -> bool {
        self.status.is_none_or(|s| rec.status == s)
            && self.priority.is_none_or(|p| rec.priority == p)
            && self
                .assignee
                .as_deref()
                .is_none_or(|a| rec.assignee == a)
            && self.kind.as_deref().is_none_or(|k| rec.kind == k)
            && self
                .label
                .as_deref()
                .is_none_or(|l| rec.labels.contains(l))
    }
}

/// A queue entry with the blockers holding it back.
#[derive(Clone, Debug)]
pub struct BlockedTodo {
    pub todo: TodoRecord,
    pub blockers: Vec<(TodoId, Status)>,
}

/// Everything an agent needs to pick up where it left off.
#[derive(Clone, Debug)]
pub struct AgentStatus {
    pub agent: AgentName,
    pub assigned: Vec<TodoRecord>,
    pub conflicts: Vec<ConflictRecord>,
    pub recent: Vec<Snapshot>,
}

/// Database totals for `status` and the prime context.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Stats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_priority: BTreeMap<String, usize>,
    pub by_kind: BTreeMap<String, usize>,
    pub pending_conflicts: usize,
}

/// Ready-queue order: priority first, then age, then lexicographic id.
///
/// The id tiebreak is byte order over the rendered id, not numeric, so
/// `todo_10` sorts before `todo_2` when priority and age tie.
fn queue_order(a: &TodoRecord, b: &TodoRecord) -> std::cmp::Ordering {
    (a.priority, a.created_at)
        .cmp(&(b.priority, b.created_at))
        .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
}

impl Jari {
    /// All todos matching `filter`, in queue order.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<TodoRecord>> {
        let txn = self.store.read_txn()?;
        let mut todos: Vec<TodoRecord> = self
            .store
            .all_todos(&txn)?
            .into_iter()
            .filter(|rec| filter.matches(rec))
            .collect();
        todos.sort_by(queue_order);
        Ok(todos)
    }

    /// Workable todos with no active blockers, in queue order.
    pub fn ready(&self) -> Result<Vec<TodoRecord>> {
        let txn = self.store.read_txn()?;
        let all = self.store.all_todos(&txn)?;
        let mut ready: Vec<TodoRecord> = Vec::new();
        for rec in all {
            if !rec.status.is_workable() {
                continue;
            }
            if graph::active_blockers(&self.store, &txn, &rec)?.is_empty() {
                ready.push(rec);
            }
        }
        ready.sort_by(queue_order);
        Ok(ready)
    }

    /// Workable todos with at least one active blocker.
    ///
    /// Disjoint from `ready` by construction; together they cover exactly
    /// the open/in_progress todos.
    pub fn blocked(&self) -> Result<Vec<BlockedTodo>> {
        let txn = self.store.read_txn()?;
        let all = self.store.all_todos(&txn)?;
        let mut blocked = Vec::new();
        for rec in all {
            if !rec.status.is_workable() {
                continue;
            }
            let blockers = graph::active_blockers(&self.store, &txn, &rec)?;
            if !blockers.is_empty() {
                blocked.push(BlockedTodo { todo: rec, blockers });
            }
        }
        blocked.sort_by(|a, b| queue_order(&a.todo, &b.todo));
        Ok(blocked)
    }

    /// Case-insensitive substring search over title, description, labels.
    pub fn search(&self, query: &str) -> Result<Vec<TodoRecord>> {
        let needle = query.to_lowercase();
        let txn = self.store.read_txn()?;
        let mut hits: Vec<TodoRecord> = self
            .store
            .all_todos(&txn)?
            .into_iter()
            .filter(|rec| {
                rec.title.to_lowercase().contains(&needle)
                    || rec.description.to_lowercase().contains(&needle)
                    || rec
                        .labels
                        .iter()
                        .any(|l| l.to_lowercase().contains(&needle))
            })
            .collect();
        hits.sort_by(queue_order);
        Ok(hits)
    }

    /// Full version history, ascending.
    pub fn history(&self, id: TodoId) -> Result<Vec<Snapshot>> {
        let txn = self.store.read_txn()?;
        self.store.require_todo(&txn, id)?;
        self.store.history(&txn, id)
    }

    /// Pending conflicts, optionally narrowed to one agent.
    pub fn conflicts(&self, agent: Option<&AgentName>) -> Result<Vec<ConflictRecord>> {
        let txn = self.store.read_txn()?;
        Ok(self
            .store
            .all_conflicts(&txn)?
            .into_iter()
            .filter(|c| agent.is_none_or(|a| c.agent == *a))
            .collect())
    }

    pub fn agent_status(&self, agent: &AgentName) -> Result<AgentStatus> {
        let txn = self.store.read_txn()?;
        let mut assigned: Vec<TodoRecord> = self
            .store
            .all_todos(&txn)?
            .into_iter()
            .filter(|rec| rec.assignee == agent.as_str())
            .collect();
        assigned.sort_by(queue_order);

        let conflicts = self
            .store
            .all_conflicts(&txn)?
            .into_iter()
            .filter(|c| c.agent == *agent)
            .collect();

        let mut recent: Vec<Snapshot> = self
            .store
            .all_snapshots(&txn)?
            .into_iter()
            .filter(|s| s.agent == *agent)
            .collect();
        recent.sort_by(|a, b| (b.at, b.version).cmp(&(a.at, a.version)));
        recent.truncate(RECENT_SNAPSHOTS);

        Ok(AgentStatus {
            agent: agent.clone(),
            assigned,
            conflicts,
            recent,
        })
    }

    /// Every agent that has ever touched the database.
    pub fn agents(&self) -> Result<Vec<(AgentName, AgentInfo)>> {
        let txn = self.store.read_txn()?;
        self.store.agents(&txn)
    }

    pub fn stats(&self) -> Result<Stats> {
        let txn = self.store.read_txn()?;
        let mut stats = Stats::default();
        for rec in self.store.all_todos(&txn)? {
            stats.total += 1;
            *stats
                .by_status
                .entry(rec.status.as_str().to_string())
                .or_default() += 1;
            *stats
                .by_priority
                .entry(rec.priority.name().to_string())
                .or_default() += 1;
            *stats.by_kind.entry(rec.kind.clone()).or_default() += 1;
        }
        stats.pending_conflicts = self.store.all_conflicts(&txn)?.len();
        Ok(stats)
    }

    /// Todos linked to a niwa node, in queue order.
    pub fn linked(&self, niwa_node: &str) -> Result<Vec<TodoRecord>> {
        let txn = self.store.read_txn()?;
        let mut hits: Vec<TodoRecord> = self
            .store
            .all_todos(&txn)?
            .into_iter()
            .filter(|rec| rec.niwa_refs.contains(niwa_node))
            .collect();
        hits.sort_by(queue_order);
        Ok(hits)
    }

    /// Transitive dependency view for display.
    pub fn tree(&self, id: TodoId, direction: Direction) -> Result<Option<TreeNode>> {
        let txn = self.store.read_txn()?;
        graph::tree(&self.store, &txn, id, direction)
    }

    /// One self-contained JSON record per line, ascending by numeric id.
    pub fn export_jsonl(&self) -> Result<String> {
        let txn = self.store.read_txn()?;
        let mut todos = self.store.all_todos(&txn)?;
        todos.sort_by_key(|rec| rec.id);
        let mut out = String::new();
        for rec in &todos {
            out.push_str(&crate::codec::encode_string(rec)?);
            out.push('\n');
        }
        Ok(out)
    }
}
