//! The tracker service: every public operation is one transaction.
//!
//! Mutations funnel through the concurrency engine's commit path, so each
//! commits a version bump plus a history snapshot, clears the acting
//! agent's pending read, and registers the agent.

use std::collections::BTreeMap;
use std::path::Path;

use tracing::debug;

use crate::engine::{self, UpdateOutcome};
use crate::error::{Error, Result};
use crate::graph;
use crate::model::{
    AgentName, FieldChange, Priority, Resolution, Snapshot, Status, TodoId, TodoRecord,
};
use crate::store::Store;
use crate::time::WallClock;

/// Inputs for `create`. Only `title` and `agent` are mandatory.
#[derive(Clone, Debug, Default)]
pub struct CreateTodo {
    pub title: String,
    pub description: String,
    pub priority: Option<Priority>,
    pub kind: Option<String>,
    pub parent_id: Option<TodoId>,
    pub niwa_ref: Option<String>,
    pub labels: Vec<String>,
}

/// A todo with the blockers that currently keep it out of the ready queue.
#[derive(Clone, Debug)]
pub struct TodoView {
    pub todo: TodoRecord,
    pub active_blockers: Vec<(TodoId, Status)>,
}

/// Handle to one tracker database.
pub struct Jari {
    pub(crate) store: Store,
}

impl Jari {
    /// Open (creating if needed) the database under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            store: Store::open(dir.as_ref())?,
        })
    }

    /// Open at the configured location (`JARI_DB` or the per-user default).
    pub fn open_default() -> Result<Self> {
        Self::open(crate::paths::db_dir())
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    pub fn create(&self, agent: &AgentName, req: CreateTodo) -> Result<TodoRecord> {
        if req.title.trim().is_empty() {
            return Err(Error::InvalidInput {
                field: "title",
                reason: "title cannot be empty".into(),
            });
        }

        let mut txn = self.store.write_txn()?;

        if let Some(parent) = req.parent_id
            && self.store.todo(&txn, parent)?.is_none()
        {
            return Err(Error::InvalidInput {
                field: "parent",
                reason: format!("{parent} not found"),
            });
        }

        let id = self.store.next_todo_id(&mut txn)?;
        let now = WallClock::now();
        let rec = TodoRecord {
            id,
            title: req.title,
            description: req.description,
            status: Status::Open,
            priority: req.priority.unwrap_or_default(),
            kind: req.kind.unwrap_or_else(|| "task".to_string()),
            assignee: String::new(),
            labels: req.labels.into_iter().collect(),
            niwa_refs: req.niwa_ref.into_iter().collect(),
            parent_id: req.parent_id,
            blocked_by: Default::default(),
            reason: None,
            closed_at: None,
            version: 1,
            created_at: now,
            updated_at: now,
            created_by: agent.clone(),
            updated_by: agent.clone(),
            extra: BTreeMap::new(),
        };

        self.store.put_todo(&mut txn, &rec)?;
        self.store.put_snapshot(
            &mut txn,
            &Snapshot {
                version: 1,
                agent: agent.clone(),
                at: now,
                operation: "create".to_string(),
                todo: rec.clone(),
            },
        )?;
        self.store.touch_agent(&mut txn, agent)?;
        txn.commit()?;

        debug!(id = %rec.id, agent = %agent, "created todo");
        Ok(rec)
    }

    /// Fetch a todo with its active blockers.
    ///
    /// When `agent` is given this is a read-for-edit: the observed version
    /// is recorded as the agent's optimistic base for its next update.
    pub fn show(&self, id: TodoId, agent: Option<&AgentName>) -> Result<TodoView> {
        match agent {
            Some(agent) => {
                let mut txn = self.store.write_txn()?;
                let todo = self.store.require_todo(&txn, id)?;
                engine::record_read(&self.store, &mut txn, agent, &todo)?;
                let active_blockers = graph::active_blockers(&self.store, &txn, &todo)?;
                txn.commit()?;
                Ok(TodoView {
                    todo,
                    active_blockers,
                })
            }
            None => {
                let txn = self.store.read_txn()?;
                let todo = self.store.require_todo(&txn, id)?;
                let active_blockers = graph::active_blockers(&self.store, &txn, &todo)?;
                Ok(TodoView {
                    todo,
                    active_blockers,
                })
            }
        }
    }

    /// Field-level optimistic update; see the engine for the merge rules.
    ///
    /// Returns `ConflictPending` when nothing merged; a mixed outcome (some
    /// fields merged, some conflicted) commits and reports both.
    pub fn update(
        &self,
        id: TodoId,
        agent: &AgentName,
        changes: Vec<FieldChange>,
    ) -> Result<UpdateOutcome> {
        let mut txn = self.store.write_txn()?;
        let outcome = engine::update(&self.store, &mut txn, agent, id, changes)?;
        txn.commit()?;

        debug!(
            id = %id,
            agent = %agent,
            merged = outcome.merged.len(),
            conflicts = outcome.conflicts.len(),
            "update"
        );
        if outcome.merged.is_empty() && !outcome.conflicts.is_empty() {
            return Err(Error::ConflictPending {
                fields: outcome.conflicts.iter().map(|c| c.field).collect(),
            });
        }
        Ok(outcome)
    }

    /// Close a todo. Idempotent: closing a closed todo is a no-op.
    pub fn close(
        &self,
        id: TodoId,
        agent: &AgentName,
        reason: Option<String>,
    ) -> Result<TodoRecord> {
        let mut txn = self.store.write_txn()?;
        let mut rec = self.store.require_todo(&txn, id)?;
        if rec.status == Status::Closed {
            return Ok(rec);
        }
        rec.status = Status::Closed;
        rec.closed_at = Some(WallClock::now());
        rec.reason = Some(reason.unwrap_or_else(|| "completed".to_string()));
        engine::commit_mutation(&self.store, &mut txn, &mut rec, agent, "close")?;
        txn.commit()?;
        debug!(id = %id, agent = %agent, "closed todo");
        Ok(rec)
    }

    pub fn reopen(&self, id: TodoId, agent: &AgentName) -> Result<TodoRecord> {
        let mut txn = self.store.write_txn()?;
        let mut rec = self.store.require_todo(&txn, id)?;
        if rec.status != Status::Closed {
            return Err(Error::NotClosed(id.to_string()));
        }
        rec.status = Status::Open;
        rec.closed_at = None;
        rec.reason = None;
        engine::commit_mutation(&self.store, &mut txn, &mut rec, agent, "reopen")?;
        txn.commit()?;
        Ok(rec)
    }

    /// Delete a todo and cascade: both edge directions, its conflicts and
    /// every agent's pending read of it. History is retained; children's
    /// `parent_id` is left dangling.
    pub fn delete(&self, id: TodoId, agent: &AgentName) -> Result<()> {
        let mut txn = self.store.write_txn()?;
        let rec = self.store.require_todo(&txn, id)?;

        // Outgoing edges: drop our entries in parents' reverse indexes.
        for parent in &rec.blocked_by {
            self.store.delete_edge_marker(&mut txn, *parent, id)?;
        }

        // Incoming edges: detach this todo from every dependent child.
        for child_id in self.store.dependents_of(&txn, id)? {
            if let Some(mut child) = self.store.todo(&txn, child_id)? {
                if graph::detach_edge(&self.store, &mut txn, &mut child, id)? {
                    engine::commit_mutation(
                        &self.store,
                        &mut txn,
                        &mut child,
                        agent,
                        "blocker deleted",
                    )?;
                }
            } else {
                self.store.delete_edge_marker(&mut txn, id, child_id)?;
            }
        }

        self.store.clear_conflicts(&mut txn, id, None)?;
        self.store.clear_pending_reads_of(&mut txn, id)?;
        self.store.delete_todo(&mut txn, id)?;
        self.store.touch_agent(&mut txn, agent)?;
        txn.commit()?;
        debug!(id = %id, agent = %agent, "deleted todo");
        Ok(())
    }

    /// Atomic claim; first committer wins.
    pub fn claim(&self, id: TodoId, agent: &AgentName) -> Result<TodoRecord> {
        let mut txn = self.store.write_txn()?;
        let rec = engine::claim(&self.store, &mut txn, agent, id)?;
        txn.commit()?;
        debug!(id = %id, agent = %agent, "claimed todo");
        Ok(rec)
    }

    // =========================================================================
    // Dependencies
    // =========================================================================

    /// `child` becomes blocked by `parent`. Idempotent for existing edges.
    pub fn add_dep(&self, child: TodoId, parent: TodoId, agent: &AgentName) -> Result<()> {
        let mut txn = self.store.write_txn()?;
        let mut child_rec = self.store.require_todo(&txn, child)?;
        graph::check_new_edge(&self.store, &txn, child, parent)?;
        if graph::attach_edge(&self.store, &mut txn, &mut child_rec, parent)? {
            engine::commit_mutation(&self.store, &mut txn, &mut child_rec, agent, "dep add")?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove the edge; idempotent.
    pub fn remove_dep(&self, child: TodoId, parent: TodoId, agent: &AgentName) -> Result<()> {
        let mut txn = self.store.write_txn()?;
        let mut child_rec = self.store.require_todo(&txn, child)?;
        self.store.require_todo(&txn, parent)?;
        if graph::detach_edge(&self.store, &mut txn, &mut child_rec, parent)? {
            engine::commit_mutation(&self.store, &mut txn, &mut child_rec, agent, "dep remove")?;
        }
        txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Labels and external refs
    // =========================================================================

    pub fn add_label(&self, id: TodoId, label: &str, agent: &AgentName) -> Result<TodoRecord> {
        self.set_membership(id, agent, "label add", |rec| {
            rec.labels.insert(label.to_string())
        })
    }

    pub fn remove_label(&self, id: TodoId, label: &str, agent: &AgentName) -> Result<TodoRecord> {
        self.set_membership(id, agent, "label remove", |rec| rec.labels.remove(label))
    }

    pub fn link(&self, id: TodoId, niwa_node: &str, agent: &AgentName) -> Result<TodoRecord> {
        self.set_membership(id, agent, "link", |rec| {
            rec.niwa_refs.insert(niwa_node.to_string())
        })
    }

    pub fn unlink(&self, id: TodoId, niwa_node: &str, agent: &AgentName) -> Result<TodoRecord> {
        self.set_membership(id, agent, "unlink", |rec| rec.niwa_refs.remove(niwa_node))
    }

    /// Shared shape for label/link ops: mutate a membership set, commit
    /// only if it actually changed.
    fn set_membership(
        &self,
        id: TodoId,
        agent: &AgentName,
        operation: &str,
        mutate: impl FnOnce(&mut TodoRecord) -> bool,
    ) -> Result<TodoRecord> {
        let mut txn = self.store.write_txn()?;
        let mut rec = self.store.require_todo(&txn, id)?;
        if mutate(&mut rec) {
            engine::commit_mutation(&self.store, &mut txn, &mut rec, agent, operation)?;
        }
        txn.commit()?;
        Ok(rec)
    }

    // =========================================================================
    // Conflict resolution
    // =========================================================================

    pub fn resolve(
        &self,
        id: TodoId,
        agent: &AgentName,
        strategy: Resolution,
        overrides: &[(String, String)],
    ) -> Result<TodoRecord> {
        let mut txn = self.store.write_txn()?;
        let rec = engine::resolve(&self.store, &mut txn, agent, id, strategy, overrides)?;
        txn.commit()?;
        debug!(id = %id, agent = %agent, ?strategy, "resolved conflicts");
        Ok(rec)
    }
}
