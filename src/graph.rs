//! Dependency graph over `blocked_by` edges.
//!
//! Edges live in two places that must move together: the child's
//! `blocked_by` set and the `meta` reverse index `blocks/{parent}/{child}`.
//! Every mutation here updates both sides inside the caller's transaction.
//!
//! INVARIANT: the edge relation is a DAG. An edge (child, parent) is
//! admitted only if `child` is not reachable from `parent` over
//! `blocked_by`.

use std::collections::BTreeSet;

use heed::{RoTxn, RwTxn};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::model::{Status, TodoId, TodoRecord};
use crate::store::Store;

/// Traversal direction for `tree`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Follow `blocked_by`: what this todo waits on.
    Up,
    /// Follow the reverse index: what waits on this todo.
    Down,
}

/// One node of a dependency tree view.
#[derive(Clone, Debug, Serialize)]
pub struct TreeNode {
    pub id: TodoId,
    pub title: String,
    pub status: Status,
    pub assignee: String,
    pub deps: Vec<TreeNode>,
}

/// Admission check for a new edge: self-loops, missing endpoints, cycles.
///
/// Returns the would-be cycle path child -> ... -> parent -> child on
/// rejection. The child's own outgoing edges cannot contribute to the
/// check (any path reaching the child has already closed the cycle), so
/// callers may validate several new edges of one child independently.
pub(crate) fn check_new_edge(
    store: &Store,
    txn: &RoTxn<'_>,
    child: TodoId,
    parent: TodoId,
) -> Result<()> {
    if child == parent {
        return Err(Error::SelfEdge);
    }
    store.require_todo(txn, parent)?;

    // DFS from parent over blocked_by, tracking the discovery path.
    let mut visited: BTreeSet<TodoId> = BTreeSet::new();
    let mut stack: Vec<(TodoId, Vec<TodoId>)> = vec![(parent, vec![parent])];
    while let Some((current, path)) = stack.pop() {
        if current == child {
            // child -> parent -> ... -> child, in depends-on direction.
            let mut cycle: Vec<String> = Vec::with_capacity(path.len() + 1);
            cycle.push(child.to_string());
            cycle.extend(path.iter().map(|id| id.to_string()));
            return Err(Error::CycleDetected { path: cycle });
        }
        if !visited.insert(current) {
            continue;
        }
        if let Some(rec) = store.todo(txn, current)? {
            for blocker in &rec.blocked_by {
                if !visited.contains(blocker) {
                    let mut next = path.clone();
                    next.push(*blocker);
                    stack.push((*blocker, next));
                }
            }
        }
    }
    Ok(())
}

/// Attach the edge to a loaded child record and the reverse index.
///
/// Callers run `check_new_edge` first and persist the child themselves.
pub(crate) fn attach_edge(
    store: &Store,
    txn: &mut RwTxn<'_>,
    child: &mut TodoRecord,
    parent: TodoId,
) -> Result<bool> {
    if !child.blocked_by.insert(parent) {
        return Ok(false);
    }
    store.put_edge_marker(txn, parent, child.id)?;
    Ok(true)
}

/// Detach the edge from a loaded child record and the reverse index.
/// Idempotent.
pub(crate) fn detach_edge(
    store: &Store,
    txn: &mut RwTxn<'_>,
    child: &mut TodoRecord,
    parent: TodoId,
) -> Result<bool> {
    if !child.blocked_by.remove(&parent) {
        return Ok(false);
    }
    store.delete_edge_marker(txn, parent, child.id)?;
    Ok(true)
}

/// Blockers of `rec` whose status is not `closed`, with that status.
///
/// Blockers missing from the store are skipped; edges are removed on
/// deletion, so a miss can only be a reader racing a delete.
pub(crate) fn active_blockers(
    store: &Store,
    txn: &RoTxn<'_>,
    rec: &TodoRecord,
) -> Result<Vec<(TodoId, Status)>> {
    let mut out = Vec::new();
    for blocker_id in &rec.blocked_by {
        if let Some(blocker) = store.todo(txn, *blocker_id)?
            && blocker.status != Status::Closed
        {
            out.push((*blocker_id, blocker.status));
        }
    }
    Ok(out)
}

/// Transitive dependency view for display.
///
/// Cycles cannot occur by invariant; the visited set still bounds the walk
/// so a corrupt store cannot hang the caller.
pub(crate) fn tree(
    store: &Store,
    txn: &RoTxn<'_>,
    id: TodoId,
    direction: Direction,
) -> Result<Option<TreeNode>> {
    let mut visited = BTreeSet::new();
    build_tree(store, txn, id, direction, &mut visited)
}

fn build_tree(
    store: &Store,
    txn: &RoTxn<'_>,
    id: TodoId,
    direction: Direction,
    visited: &mut BTreeSet<TodoId>,
) -> Result<Option<TreeNode>> {
    let Some(rec) = store.todo(txn, id)? else {
        return Ok(None);
    };
    if !visited.insert(id) {
        return Ok(None);
    }

    let next: Vec<TodoId> = match direction {
        Direction::Up => rec.blocked_by.iter().copied().collect(),
        Direction::Down => store.dependents_of(txn, id)?,
    };

    let mut deps = Vec::new();
    for dep_id in next {
        if let Some(node) = build_tree(store, txn, dep_id, direction, visited)? {
            deps.push(node);
        }
    }

    Ok(Some(TreeNode {
        id: rec.id,
        title: rec.title,
        status: rec.status,
        assignee: rec.assignee,
        deps,
    }))
}
