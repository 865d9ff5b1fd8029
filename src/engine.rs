//! Field-level optimistic concurrency.
//!
//! Reads record the observed version per (agent, todo). A later update by
//! that agent diffs three views: the base (the agent's recorded read), the
//! agent's intent, and the current record. Disjoint changes auto-merge;
//! overlapping changes become persisted conflicts the agent must resolve
//! before it may update that todo again.
//!
//! Set-valued fields merge element-wise: additions and removals from both
//! sides combine, and only an add-vs-remove of the same element conflicts.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use heed::RwTxn;
use serde_json::json;

use crate::error::{Error, Result};
use crate::graph;
use crate::model::{
    AgentName, ConflictRecord, Field, FieldChange, PendingRead, Resolution, SetOp, Snapshot,
    Status, TodoId, TodoRecord,
};
use crate::store::Store;
use crate::time::WallClock;

/// What an update did: which fields merged, which are now in conflict.
#[derive(Clone, Debug)]
pub struct UpdateOutcome {
    pub id: TodoId,
    pub new_version: u64,
    pub merged: Vec<Field>,
    pub conflicts: Vec<ConflictRecord>,
}

// =============================================================================
// Read path
// =============================================================================

/// Record that `agent` observed `rec` at its current version.
///
/// The recorded version becomes the optimistic base for the agent's next
/// update of this todo.
pub(crate) fn record_read(
    store: &Store,
    txn: &mut RwTxn<'_>,
    agent: &AgentName,
    rec: &TodoRecord,
) -> Result<()> {
    store.put_pending_read(
        txn,
        &PendingRead {
            agent: agent.clone(),
            todo_id: rec.id,
            version: rec.version,
            read_at: WallClock::now(),
        },
    )?;
    store.touch_agent(txn, agent)
}

// =============================================================================
// Write path
// =============================================================================

/// Bump, persist, snapshot, and clear the actor's pending read.
///
/// Every committed mutation funnels through here so that invariants hold:
/// versions strictly increase and each version has a history snapshot.
pub(crate) fn commit_mutation(
    store: &Store,
    txn: &mut RwTxn<'_>,
    rec: &mut TodoRecord,
    agent: &AgentName,
    operation: &str,
) -> Result<()> {
    rec.version += 1;
    rec.updated_at = WallClock::now();
    rec.updated_by = agent.clone();
    store.put_todo(txn, rec)?;
    store.put_snapshot(
        txn,
        &Snapshot {
            version: rec.version,
            agent: agent.clone(),
            at: rec.updated_at,
            operation: operation.to_string(),
            todo: rec.clone(),
        },
    )?;
    store.clear_pending_read(txn, agent, rec.id)?;
    store.touch_agent(txn, agent)
}

pub(crate) fn update(
    store: &Store,
    txn: &mut RwTxn<'_>,
    agent: &AgentName,
    id: TodoId,
    changes: Vec<FieldChange>,
) -> Result<UpdateOutcome> {
    let mut current = store.require_todo(txn, id)?;

    // An agent with unresolved conflicts here must resolve them first.
    let unresolved: Vec<Field> = store
        .conflicts_of(txn, id)?
        .into_iter()
        .filter(|c| c.agent == *agent)
        .map(|c| c.field)
        .collect();
    if !unresolved.is_empty() {
        return Err(Error::ConflictPending { fields: unresolved });
    }

    // Base = the agent's recorded read, defaulting to "no prior read".
    let base_version = store
        .pending_read(txn, agent, id)?
        .map(|p| p.version.min(current.version))
        .unwrap_or(current.version);
    let base_view = if base_version == current.version {
        current.clone()
    } else {
        store
            .snapshot(txn, id, base_version)?
            .ok_or_else(|| {
                Error::StorageCorrupt(format!("missing history snapshot {id} v{base_version}"))
            })?
            .todo
    };

    let proposal = normalize(changes, &base_view)?;

    let mut merged: Vec<Field> = Vec::new();
    let mut ctx = ConflictCtx {
        agent,
        id,
        base_version,
        their_version: current.version,
        at: WallClock::now(),
        seq: store.next_conflict_seq(txn, id)?,
        records: Vec::new(),
    };

    // Scalars: theirs = current vs base; yours = proposal (already != base).
    for (field, change) in &proposal.scalars {
        if current.scalar(*field) != base_view.scalar(*field) {
            ctx.push(*field, proposed_value(change), current.scalar(*field));
        } else {
            apply_scalar(&mut current, change);
            merged.push(*field);
        }
    }

    // Plain string sets.
    if merge_plain_set(
        Field::Labels,
        &proposal.labels,
        &base_view.labels,
        &mut current.labels,
        &mut ctx,
    ) {
        merged.push(Field::Labels);
    }
    if merge_plain_set(
        Field::NiwaRefs,
        &proposal.niwa_refs,
        &base_view.niwa_refs,
        &mut current.niwa_refs,
        &mut ctx,
    ) {
        merged.push(Field::NiwaRefs);
    }

    // Dependency edges: same element-wise rule, plus DAG revalidation and
    // reverse-index maintenance. A cycle aborts the whole update.
    let delta = &proposal.blocked_by;
    if !(delta.adds.is_empty() && delta.removes.is_empty()) {
        let their_adds: BTreeSet<TodoId> = current
            .blocked_by
            .difference(&base_view.blocked_by)
            .copied()
            .collect();
        let their_removes: BTreeSet<TodoId> = base_view
            .blocked_by
            .difference(&current.blocked_by)
            .copied()
            .collect();
        let mut applied = false;
        for e in &delta.removes {
            if their_adds.contains(e) {
                ctx.push(Field::BlockedBy, json!({"remove": e}), json!({"add": e}));
            } else if graph::detach_edge(store, txn, &mut current, *e)? {
                applied = true;
            }
        }
        for e in &delta.adds {
            if their_removes.contains(e) {
                ctx.push(Field::BlockedBy, json!({"add": e}), json!({"remove": e}));
            } else if !current.blocked_by.contains(e) {
                graph::check_new_edge(store, txn, id, *e)?;
                graph::attach_edge(store, txn, &mut current, *e)?;
                applied = true;
            }
        }
        if applied {
            merged.push(Field::BlockedBy);
        }
    }

    let conflicts = ctx.records;
    for conflict in &conflicts {
        store.put_conflict(txn, conflict)?;
    }

    if !merged.is_empty() {
        let op = format!(
            "update: {}",
            merged
                .iter()
                .map(|f| f.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        commit_mutation(store, txn, &mut current, agent, &op)?;
    } else if !conflicts.is_empty() {
        // Conflict-only: no version bump, pending read retained.
        store.touch_agent(txn, agent)?;
    }

    Ok(UpdateOutcome {
        id,
        new_version: current.version,
        merged,
        conflicts,
    })
}

// =============================================================================
// Claim
// =============================================================================

/// Atomic claim: assignee + in_progress in one write transaction.
///
/// First committer wins; the serialized writer guarantees the loser
/// observes the winner's assignee and gets `AlreadyClaimed`.
pub(crate) fn claim(
    store: &Store,
    txn: &mut RwTxn<'_>,
    agent: &AgentName,
    id: TodoId,
) -> Result<TodoRecord> {
    let mut rec = store.require_todo(txn, id)?;

    if !rec.status.is_workable() {
        return Err(Error::NotClaimable {
            reason: format!("status is {}", rec.status),
        });
    }
    let blockers = graph::active_blockers(store, txn, &rec)?;
    if !blockers.is_empty() {
        let ids = blockers
            .iter()
            .map(|(id, _)| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(Error::NotClaimable {
            reason: format!("blocked by {ids}"),
        });
    }
    if !rec.assignee.is_empty() && rec.assignee != agent.as_str() {
        return Err(Error::AlreadyClaimed {
            by: rec.assignee.clone(),
        });
    }

    rec.assignee = agent.as_str().to_string();
    rec.status = Status::InProgress;
    commit_mutation(store, txn, &mut rec, agent, "claim")?;
    Ok(rec)
}

// =============================================================================
// Resolution
// =============================================================================

pub(crate) fn resolve(
    store: &Store,
    txn: &mut RwTxn<'_>,
    agent: &AgentName,
    id: TodoId,
    strategy: Resolution,
    overrides: &[(String, String)],
) -> Result<TodoRecord> {
    let mut current = store.require_todo(txn, id)?;

    let mine: Vec<ConflictRecord> = store
        .conflicts_of(txn, id)?
        .into_iter()
        .filter(|c| c.agent == *agent)
        .collect();
    if mine.is_empty() {
        return Err(Error::NoConflicts);
    }

    match strategy {
        Resolution::AcceptYours => {
            for conflict in &mine {
                apply_yours(store, txn, &mut current, conflict)?;
            }
        }
        Resolution::AcceptTheirs => {
            // Keep the current values; the resolution still snapshots below
            // so the audit trail records the choice.
        }
        Resolution::ManualMerge => {
            if overrides.is_empty() {
                return Err(Error::InvalidOverride {
                    field: "*".into(),
                    reason: "MANUAL_MERGE requires field=value overrides".into(),
                });
            }
            for (field_raw, value_raw) in overrides {
                apply_override(store, txn, &mut current, field_raw, value_raw)?;
            }
        }
    }

    store.clear_conflicts(txn, id, Some(agent))?;
    commit_mutation(store, txn, &mut current, agent, "conflict resolved")?;
    Ok(current)
}

/// Re-apply the losing side's value from a conflict record.
fn apply_yours(
    store: &Store,
    txn: &mut RwTxn<'_>,
    rec: &mut TodoRecord,
    conflict: &ConflictRecord,
) -> Result<()> {
    let corrupt = |e: serde_json::Error| {
        Error::StorageCorrupt(format!(
            "conflict {} seq {} field {}: {e}",
            conflict.todo_id, conflict.seq, conflict.field
        ))
    };
    match conflict.field {
        Field::Title => rec.title = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?,
        Field::Description => {
            rec.description = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?;
        }
        Field::Status => rec.status = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?,
        Field::Priority => {
            rec.priority = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?;
        }
        Field::Kind => rec.kind = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?,
        Field::Assignee => {
            rec.assignee = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?;
        }
        Field::Parent => {
            rec.parent_id = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?;
        }
        Field::Reason => {
            rec.reason = serde_json::from_value(conflict.yours.clone()).map_err(corrupt)?;
        }
        Field::Labels => match parse_set_op::<String>(conflict, &conflict.yours)? {
            SetOp::Add(e) => {
                rec.labels.insert(e);
            }
            SetOp::Remove(e) => {
                rec.labels.remove(&e);
            }
        },
        Field::NiwaRefs => match parse_set_op::<String>(conflict, &conflict.yours)? {
            SetOp::Add(e) => {
                rec.niwa_refs.insert(e);
            }
            SetOp::Remove(e) => {
                rec.niwa_refs.remove(&e);
            }
        },
        Field::BlockedBy => match parse_set_op::<TodoId>(conflict, &conflict.yours)? {
            SetOp::Add(parent) => {
                if !rec.blocked_by.contains(&parent) {
                    graph::check_new_edge(store, txn, rec.id, parent)?;
                    graph::attach_edge(store, txn, rec, parent)?;
                }
            }
            SetOp::Remove(parent) => {
                graph::detach_edge(store, txn, rec, parent)?;
            }
        },
    }
    Ok(())
}

/// Apply one `field=value` override, validated against the field's domain.
fn apply_override(
    store: &Store,
    txn: &mut RwTxn<'_>,
    rec: &mut TodoRecord,
    field_raw: &str,
    value: &str,
) -> Result<()> {
    let invalid = |reason: String| Error::InvalidOverride {
        field: field_raw.to_string(),
        reason,
    };
    let field = Field::parse(field_raw).map_err(|e| invalid(e.to_string()))?;
    match field {
        Field::Title => {
            if value.trim().is_empty() {
                return Err(invalid("title cannot be empty".into()));
            }
            rec.title = value.to_string();
        }
        Field::Description => rec.description = value.to_string(),
        Field::Status => rec.status = Status::parse(value).map_err(|e| invalid(e.to_string()))?,
        Field::Priority => {
            let n: u8 = value.parse().map_err(|_| invalid(format!("`{value}` is not 0..=4")))?;
            rec.priority = crate::model::Priority::new(n).map_err(|e| invalid(e.to_string()))?;
        }
        Field::Kind => rec.kind = value.to_string(),
        Field::Assignee => {
            if !value.is_empty() {
                AgentName::parse(value).map_err(|e| invalid(e.to_string()))?;
            }
            rec.assignee = value.to_string();
        }
        Field::Parent => {
            rec.parent_id = match value {
                "" | "none" => None,
                raw => {
                    let id = TodoId::parse(raw).map_err(|e| invalid(e.to_string()))?;
                    store
                        .todo(txn, id)?
                        .ok_or_else(|| invalid(format!("{id} not found")))?;
                    Some(id)
                }
            };
        }
        Field::Reason => {
            rec.reason = if value.is_empty() {
                None
            } else {
                Some(value.to_string())
            };
        }
        Field::Labels => {
            rec.labels = split_list(value).into_iter().collect();
        }
        Field::NiwaRefs => {
            rec.niwa_refs = split_list(value).into_iter().collect();
        }
        Field::BlockedBy => {
            let mut target = BTreeSet::new();
            for raw in split_list(value) {
                target.insert(TodoId::parse(&raw).map_err(|e| invalid(e.to_string()))?);
            }
            for parent in rec.blocked_by.clone() {
                if !target.contains(&parent) {
                    graph::detach_edge(store, txn, rec, parent)?;
                }
            }
            for parent in target {
                if !rec.blocked_by.contains(&parent) {
                    graph::check_new_edge(store, txn, rec.id, parent)?;
                    graph::attach_edge(store, txn, rec, parent)?;
                }
            }
        }
    }
    Ok(())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_set_op<T: serde::de::DeserializeOwned>(
    conflict: &ConflictRecord,
    value: &serde_json::Value,
) -> Result<SetOp<T>> {
    let corrupt = || {
        Error::StorageCorrupt(format!(
            "conflict {} seq {}: malformed set op",
            conflict.todo_id, conflict.seq
        ))
    };
    let obj = value.as_object().ok_or_else(corrupt)?;
    if let Some(v) = obj.get("add") {
        Ok(SetOp::Add(
            serde_json::from_value(v.clone()).map_err(|_| corrupt())?,
        ))
    } else if let Some(v) = obj.get("remove") {
        Ok(SetOp::Remove(
            serde_json::from_value(v.clone()).map_err(|_| corrupt())?,
        ))
    } else {
        Err(corrupt())
    }
}

// =============================================================================
// Diff plumbing
// =============================================================================

struct ConflictCtx<'a> {
    agent: &'a AgentName,
    id: TodoId,
    base_version: u64,
    their_version: u64,
    at: WallClock,
    seq: u64,
    records: Vec<ConflictRecord>,
}

impl ConflictCtx<'_> {
    fn push(&mut self, field: Field, yours: serde_json::Value, theirs: serde_json::Value) {
        self.records.push(ConflictRecord {
            todo_id: self.id,
            seq: self.seq,
            agent: self.agent.clone(),
            field,
            base_version: self.base_version,
            their_version: self.their_version,
            yours,
            theirs,
            at: self.at,
        });
        self.seq += 1;
    }
}

#[derive(Debug)]
struct SetDelta<T: Ord> {
    adds: BTreeSet<T>,
    removes: BTreeSet<T>,
}

impl<T: Ord> Default for SetDelta<T> {
    fn default() -> Self {
        Self {
            adds: BTreeSet::new(),
            removes: BTreeSet::new(),
        }
    }
}

struct Proposal {
    scalars: BTreeMap<Field, FieldChange>,
    labels: SetDelta<String>,
    niwa_refs: SetDelta<String>,
    blocked_by: SetDelta<TodoId>,
}

/// Coalesce raw changes into one intent per field.
///
/// Scalars equal to the base view are dropped (no intent); a later change
/// to the same scalar wins. Set ops keep their operational meaning and are
/// only rejected when one request both adds and removes the same element.
fn normalize(changes: Vec<FieldChange>, base: &TodoRecord) -> Result<Proposal> {
    let mut proposal = Proposal {
        scalars: BTreeMap::new(),
        labels: SetDelta::default(),
        niwa_refs: SetDelta::default(),
        blocked_by: SetDelta::default(),
    };

    for change in changes {
        if let FieldChange::Title(t) = &change
            && t.trim().is_empty()
        {
            return Err(Error::InvalidInput {
                field: "title",
                reason: "title cannot be empty".into(),
            });
        }
        match change {
            FieldChange::Label(op) => push_op(&mut proposal.labels, op, "labels")?,
            FieldChange::NiwaRef(op) => push_op(&mut proposal.niwa_refs, op, "niwa_refs")?,
            FieldChange::BlockedBy(op) => push_op(&mut proposal.blocked_by, op, "blocked_by")?,
            scalar => {
                let field = scalar.field();
                if proposed_value(&scalar) != base.scalar(field) {
                    proposal.scalars.insert(field, scalar);
                } else {
                    proposal.scalars.remove(&field);
                }
            }
        }
    }
    Ok(proposal)
}

fn push_op<T: Ord + fmt::Display>(
    delta: &mut SetDelta<T>,
    op: SetOp<T>,
    field: &'static str,
) -> Result<()> {
    match op {
        SetOp::Add(e) => {
            if delta.removes.contains(&e) {
                return Err(Error::InvalidInput {
                    field,
                    reason: format!("`{e}` both added and removed"),
                });
            }
            delta.adds.insert(e);
        }
        SetOp::Remove(e) => {
            if delta.adds.contains(&e) {
                return Err(Error::InvalidInput {
                    field,
                    reason: format!("`{e}` both added and removed"),
                });
            }
            delta.removes.insert(e);
        }
    }
    Ok(())
}

fn proposed_value(change: &FieldChange) -> serde_json::Value {
    match change {
        FieldChange::Title(v)
        | FieldChange::Description(v)
        | FieldChange::Kind(v)
        | FieldChange::Assignee(v) => json!(v),
        FieldChange::Status(v) => json!(v),
        FieldChange::Priority(v) => json!(v),
        FieldChange::Parent(v) => json!(v),
        FieldChange::Reason(v) => json!(v),
        FieldChange::Label(_) | FieldChange::NiwaRef(_) | FieldChange::BlockedBy(_) => {
            unreachable!("set-valued changes merge element-wise")
        }
    }
}

fn apply_scalar(rec: &mut TodoRecord, change: &FieldChange) {
    match change {
        FieldChange::Title(v) => rec.title = v.clone(),
        FieldChange::Description(v) => rec.description = v.clone(),
        FieldChange::Status(v) => rec.status = *v,
        FieldChange::Priority(v) => rec.priority = *v,
        FieldChange::Kind(v) => rec.kind = v.clone(),
        FieldChange::Assignee(v) => rec.assignee = v.clone(),
        FieldChange::Parent(v) => rec.parent_id = *v,
        FieldChange::Reason(v) => rec.reason = v.clone(),
        FieldChange::Label(_) | FieldChange::NiwaRef(_) | FieldChange::BlockedBy(_) => {
            unreachable!("set-valued changes merge element-wise")
        }
    }
}

/// Element-wise merge for labels/niwa_refs. Returns whether anything
/// applied; contested elements land in `ctx` instead.
fn merge_plain_set(
    field: Field,
    delta: &SetDelta<String>,
    base: &BTreeSet<String>,
    current: &mut BTreeSet<String>,
    ctx: &mut ConflictCtx<'_>,
) -> bool {
    if delta.adds.is_empty() && delta.removes.is_empty() {
        return false;
    }
    let their_adds: BTreeSet<&String> = current.difference(base).collect();
    let their_removes: BTreeSet<&String> = base.difference(current).collect();

    let mut to_add = Vec::new();
    let mut to_remove = Vec::new();
    for e in &delta.adds {
        if their_removes.contains(e) {
            ctx.push(field, json!({"add": e}), json!({"remove": e}));
        } else if !current.contains(e) {
            to_add.push(e.clone());
        }
    }
    for e in &delta.removes {
        if their_adds.contains(e) {
            ctx.push(field, json!({"remove": e}), json!({"add": e}));
        } else if current.contains(e) {
            to_remove.push(e.clone());
        }
    }

    let applied = !(to_add.is_empty() && to_remove.is_empty());
    for e in to_add {
        current.insert(e);
    }
    for e in &to_remove {
        current.remove(e);
    }
    applied
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Priority;

    fn base_record() -> TodoRecord {
        TodoRecord {
            id: TodoId::from_index(1),
            title: "t".into(),
            description: String::new(),
            status: Status::Open,
            priority: Priority::MEDIUM,
            kind: "task".into(),
            assignee: String::new(),
            labels: BTreeSet::new(),
            niwa_refs: BTreeSet::new(),
            parent_id: None,
            blocked_by: BTreeSet::new(),
            reason: None,
            closed_at: None,
            version: 1,
            created_at: WallClock(1),
            updated_at: WallClock(1),
            created_by: AgentName::parse("a1").unwrap(),
            updated_by: AgentName::parse("a1").unwrap(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn normalize_drops_no_op_scalars() {
        let base = base_record();
        let proposal = normalize(
            vec![
                FieldChange::Title("t".into()),
                FieldChange::Priority(Priority::CRITICAL),
            ],
            &base,
        )
        .unwrap();
        assert!(!proposal.scalars.contains_key(&Field::Title));
        assert!(proposal.scalars.contains_key(&Field::Priority));
    }

    #[test]
    fn normalize_last_scalar_wins() {
        let base = base_record();
        let proposal = normalize(
            vec![
                FieldChange::Priority(Priority::CRITICAL),
                FieldChange::Priority(Priority::MEDIUM), // back to base: no intent
            ],
            &base,
        )
        .unwrap();
        assert!(proposal.scalars.is_empty());
    }

    #[test]
    fn normalize_rejects_empty_title() {
        let base = base_record();
        assert!(normalize(vec![FieldChange::Title("  ".into())], &base).is_err());
    }

    #[test]
    fn normalize_rejects_add_remove_of_same_element() {
        let base = base_record();
        let result = normalize(
            vec![
                FieldChange::Label(SetOp::Add("x".into())),
                FieldChange::Label(SetOp::Remove("x".into())),
            ],
            &base,
        );
        assert!(result.is_err());
    }

    #[test]
    fn plain_set_merge_combines_and_contests() {
        let agent = AgentName::parse("a1").unwrap();
        let mut ctx = ConflictCtx {
            agent: &agent,
            id: TodoId::from_index(1),
            base_version: 1,
            their_version: 2,
            at: WallClock(9),
            seq: 1,
            records: Vec::new(),
        };
        // Base had {kept, dropped}; they removed "dropped" and added "new".
        let base: BTreeSet<String> = ["kept".into(), "dropped".into()].into();
        let mut current: BTreeSet<String> = ["kept".into(), "new".into()].into();
        // We re-add what they dropped (contested), drop what they added
        // (contested), and add something fresh (merges).
        let mut delta = SetDelta::default();
        delta.adds.insert("dropped".to_string());
        delta.adds.insert("fresh".to_string());
        delta.removes.insert("new".to_string());

        let applied = merge_plain_set(Field::Labels, &delta, &base, &mut current, &mut ctx);
        assert!(applied);
        assert!(current.contains("fresh"));
        assert!(current.contains("new"), "contested remove must not apply");
        assert!(!current.contains("dropped"), "contested add must not apply");
        assert_eq!(ctx.records.len(), 2);
        assert_eq!(ctx.records[0].seq, 1);
        assert_eq!(ctx.records[1].seq, 2);
    }
}
