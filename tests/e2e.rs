//! End-to-end scenarios over a real database: lifecycle, dependency
//! chains, optimistic merges and conflict resolution.

use jari::{
    AgentName, CreateTodo, Error, Field, FieldChange, Jari, Priority, Resolution, SetOp, Status,
    TodoId,
};
use tempfile::TempDir;

fn open_db() -> (TempDir, Jari) {
    let dir = TempDir::new().expect("tempdir");
    let db = Jari::open(dir.path()).expect("open database");
    (dir, db)
}

fn agent(name: &str) -> AgentName {
    AgentName::parse(name).expect("agent name")
}

fn create(db: &Jari, title: &str, priority: u8, by: &AgentName) -> TodoId {
    db.create(
        by,
        CreateTodo {
            title: title.to_string(),
            priority: Some(Priority::new(priority).expect("priority")),
            ..Default::default()
        },
    )
    .expect("create")
    .id
}

#[test]
fn create_ready_claim() {
    let (_dir, db) = open_db();
    let x = agent("agent_x");
    let y = agent("agent_y");

    let id = create(&db, "A", 1, &x);
    assert_eq!(id.to_string(), "todo_1");

    let ready = db.ready().unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, id);

    let claimed = db.claim(id, &y).unwrap();
    assert_eq!(claimed.assignee, "agent_y");
    assert_eq!(claimed.status, Status::InProgress);
    assert_eq!(claimed.version, 2);

    // in_progress stays in the ready queue
    let ready = db.ready().unwrap();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].id, id);
}

#[test]
fn dependency_chain_unblocks_in_order() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    let t3 = create(&db, "three", 2, &a);

    db.add_dep(t2, t1, &a).unwrap();
    db.add_dep(t3, t2, &a).unwrap();

    let ids = |todos: Vec<jari::TodoRecord>| todos.into_iter().map(|t| t.id).collect::<Vec<_>>();
    assert_eq!(ids(db.ready().unwrap()), vec![t1]);

    db.close(t1, &a, None).unwrap();
    assert_eq!(ids(db.ready().unwrap()), vec![t2]);

    db.close(t2, &a, None).unwrap();
    assert_eq!(ids(db.ready().unwrap()), vec![t3]);
}

#[test]
fn cycle_rejected_and_edges_untouched() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    let t3 = create(&db, "three", 2, &a);

    db.add_dep(t2, t1, &a).unwrap();
    db.add_dep(t3, t2, &a).unwrap();

    let err = db.add_dep(t1, t3, &a).unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));

    // edge set unchanged
    assert!(db.show(t1, None).unwrap().todo.blocked_by.is_empty());
    let t3_view = db.show(t3, None).unwrap().todo;
    assert_eq!(t3_view.blocked_by.into_iter().collect::<Vec<_>>(), vec![t2]);
}

#[test]
fn self_dependency_rejected() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 2, &a);
    assert!(matches!(db.add_dep(t1, t1, &a), Err(Error::SelfEdge)));
}

#[test]
fn disjoint_fields_auto_merge() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    // both read at version 1
    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();

    let out_a = db
        .update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    assert_eq!(out_a.new_version, 2);
    assert!(out_a.conflicts.is_empty());

    let out_b = db
        .update(id, &b, vec![FieldChange::Title("X".into())])
        .unwrap();
    assert_eq!(out_b.new_version, 3);
    assert!(out_b.conflicts.is_empty());

    let rec = db.show(id, None).unwrap().todo;
    assert_eq!(rec.priority, Priority::CRITICAL);
    assert_eq!(rec.title, "X");
    assert_eq!(rec.version, 3);
    assert!(db.conflicts(None).unwrap().is_empty());
}

#[test]
fn same_field_conflict_and_accept_yours() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();

    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();

    let err = db
        .update(id, &b, vec![FieldChange::Priority(Priority::new(2).unwrap())])
        .unwrap_err();
    assert!(matches!(err, Error::ConflictPending { .. }));

    // loser's value is not applied, version unchanged
    let rec = db.show(id, None).unwrap().todo;
    assert_eq!(rec.priority, Priority::CRITICAL);
    assert_eq!(rec.version, 2);

    let pending = db.conflicts(Some(&b)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].field, Field::Priority);
    assert_eq!(pending[0].yours, serde_json::json!(2));
    assert_eq!(pending[0].theirs, serde_json::json!(0));
    assert_eq!(pending[0].base_version, 1);
    assert_eq!(pending[0].their_version, 2);

    let resolved = db.resolve(id, &b, Resolution::AcceptYours, &[]).unwrap();
    assert_eq!(resolved.priority, Priority::new(2).unwrap());
    assert_eq!(resolved.version, 3);
    assert!(db.conflicts(None).unwrap().is_empty());
}

#[test]
fn accept_theirs_keeps_value_but_snapshots() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();
    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    let _ = db
        .update(id, &b, vec![FieldChange::Priority(Priority::HIGH)])
        .unwrap_err();

    let resolved = db.resolve(id, &b, Resolution::AcceptTheirs, &[]).unwrap();
    assert_eq!(resolved.priority, Priority::CRITICAL);
    assert_eq!(resolved.version, 3);

    let history = db.history(id).unwrap();
    let last = history.last().unwrap();
    assert_eq!(last.version, 3);
    assert_eq!(last.operation, "conflict resolved");
}

#[test]
fn resolve_without_conflicts_is_refused() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let id = create(&db, "one", 2, &a);
    assert!(matches!(
        db.resolve(id, &a, Resolution::AcceptYours, &[]),
        Err(Error::NoConflicts)
    ));
}

#[test]
fn manual_merge_validates_domain() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();
    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    let _ = db
        .update(id, &b, vec![FieldChange::Priority(Priority::HIGH)])
        .unwrap_err();

    let err = db
        .resolve(
            id,
            &b,
            Resolution::ManualMerge,
            &[("priority".into(), "9".into())],
        )
        .unwrap_err();
    assert!(matches!(err, Error::InvalidOverride { .. }));

    let resolved = db
        .resolve(
            id,
            &b,
            Resolution::ManualMerge,
            &[("priority".into(), "3".into())],
        )
        .unwrap();
    assert_eq!(resolved.priority, Priority::LOW);
    assert!(db.conflicts(None).unwrap().is_empty());
}

#[test]
fn mixed_update_merges_and_conflicts() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();
    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();

    // priority conflicts, title merges: the merge commits in the same
    // transaction that records the conflict
    let outcome = db
        .update(
            id,
            &b,
            vec![
                FieldChange::Priority(Priority::HIGH),
                FieldChange::Title("renamed".into()),
            ],
        )
        .unwrap();
    assert_eq!(outcome.merged, vec![Field::Title]);
    assert_eq!(outcome.conflicts.len(), 1);

    let rec = db.show(id, None).unwrap().todo;
    assert_eq!(rec.title, "renamed");
    assert_eq!(rec.priority, Priority::CRITICAL);
    assert_eq!(rec.version, 3);
    assert_eq!(db.conflicts(Some(&b)).unwrap().len(), 1);
}

#[test]
fn unresolved_conflict_blocks_next_update() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let id = create(&db, "A", 1, &a);

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();
    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    let _ = db
        .update(id, &b, vec![FieldChange::Priority(Priority::HIGH)])
        .unwrap_err();

    // even a disjoint follow-up is refused until b resolves
    let err = db
        .update(id, &b, vec![FieldChange::Title("later".into())])
        .unwrap_err();
    assert!(matches!(err, Error::ConflictPending { .. }));

    // other agents are unaffected
    db.update(id, &a, vec![FieldChange::Title("fine".into())])
        .unwrap();
}

#[test]
fn set_ops_merge_and_contest_elementwise() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let rec = db
        .create(
            &a,
            CreateTodo {
                title: "A".into(),
                labels: vec!["shared".into()],
                ..Default::default()
            },
        )
        .unwrap();
    let id = rec.id;

    db.show(id, Some(&a)).unwrap();
    db.show(id, Some(&b)).unwrap();

    // a removes the shared label
    db.update(
        id,
        &a,
        vec![FieldChange::Label(SetOp::Remove("shared".into()))],
    )
    .unwrap();

    // b re-adds it (contested) and adds a fresh one (merges)
    let outcome = db
        .update(
            id,
            &b,
            vec![
                FieldChange::Label(SetOp::Add("shared".into())),
                FieldChange::Label(SetOp::Add("fresh".into())),
            ],
        )
        .unwrap();
    assert_eq!(outcome.merged, vec![Field::Labels]);
    assert_eq!(outcome.conflicts.len(), 1);

    let rec = db.show(id, None).unwrap().todo;
    assert!(rec.labels.contains("fresh"));
    assert!(
        !rec.labels.contains("shared"),
        "contested add must not apply"
    );

    db.resolve(id, &b, Resolution::AcceptYours, &[]).unwrap();
    let rec = db.show(id, None).unwrap().todo;
    assert!(rec.labels.contains("shared"));
}

#[test]
fn dep_update_through_engine_keeps_dag() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    db.add_dep(t2, t1, &a).unwrap();

    // adding the reverse edge through update aborts whole, title included
    let err = db
        .update(
            t1,
            &a,
            vec![
                FieldChange::Title("poisoned".into()),
                FieldChange::BlockedBy(SetOp::Add(t2)),
            ],
        )
        .unwrap_err();
    assert!(matches!(err, Error::CycleDetected { .. }));
    let rec = db.show(t1, None).unwrap().todo;
    assert_eq!(rec.title, "one");
    assert_eq!(rec.version, 1);

    // a legal edge through update maintains the reverse index
    let t3 = create(&db, "three", 2, &a);
    db.update(t1, &a, vec![FieldChange::BlockedBy(SetOp::Add(t3))])
        .unwrap();
    let blocked = db.blocked().unwrap();
    assert!(blocked.iter().any(|b| b.todo.id == t1));
    db.close(t3, &a, None).unwrap();
    assert!(db.ready().unwrap().iter().any(|t| t.id == t1));
}

#[test]
fn ready_is_idempotent_and_disjoint_from_blocked() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 0, &a);
    let t2 = create(&db, "two", 2, &a);
    let t3 = create(&db, "three", 2, &a);
    let t4 = create(&db, "four", 4, &a);
    db.add_dep(t2, t1, &a).unwrap();
    db.close(t4, &a, None).unwrap();
    db.claim(t3, &a).unwrap();

    let first = db.ready().unwrap();
    let second = db.ready().unwrap();
    assert_eq!(
        first.iter().map(|t| t.id).collect::<Vec<_>>(),
        second.iter().map(|t| t.id).collect::<Vec<_>>()
    );

    let ready_ids: Vec<TodoId> = first.iter().map(|t| t.id).collect();
    let blocked_ids: Vec<TodoId> = db.blocked().unwrap().iter().map(|b| b.todo.id).collect();
    assert!(ready_ids.iter().all(|id| !blocked_ids.contains(id)));

    let workable: Vec<TodoId> = db
        .list(&Default::default())
        .unwrap()
        .into_iter()
        .filter(|t| t.status.is_workable())
        .map(|t| t.id)
        .collect();
    let mut union: Vec<TodoId> = ready_ids
        .iter()
        .chain(blocked_ids.iter())
        .copied()
        .collect();
    union.sort();
    let mut expected = workable;
    expected.sort();
    assert_eq!(union, expected);
}

#[test]
fn ready_orders_by_priority_then_age_then_id() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let low = create(&db, "low", 3, &a);
    let crit = create(&db, "crit", 0, &a);
    let med_1 = create(&db, "m1", 2, &a);
    let med_2 = create(&db, "m2", 2, &a);

    let order: Vec<TodoId> = db.ready().unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(order, vec![crit, med_1, med_2, low]);
}

#[test]
fn history_round_trip() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let id = create(&db, "one", 2, &a);

    db.update(id, &a, vec![FieldChange::Title("renamed".into())])
        .unwrap();
    let observed_v2 = db.show(id, None).unwrap().todo;

    db.update(id, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();

    let history = db.history(id).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(
        history.iter().map(|s| s.version).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(history[1].todo, observed_v2);
}

#[test]
fn claim_refusals() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    db.add_dep(t2, t1, &a).unwrap();

    assert!(matches!(db.claim(t2, &a), Err(Error::NotClaimable { .. })));

    db.claim(t1, &a).unwrap();
    assert!(matches!(
        db.claim(t1, &b),
        Err(Error::AlreadyClaimed { by }) if by == "agent_a"
    ));

    // re-claim by the holder is permitted
    db.claim(t1, &a).unwrap();

    db.close(t1, &a, None).unwrap();
    assert!(matches!(db.claim(t1, &b), Err(Error::NotClaimable { .. })));
}

#[test]
fn close_is_idempotent_and_reopen_requires_closed() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let id = create(&db, "one", 2, &a);

    assert!(matches!(db.reopen(id, &a), Err(Error::NotClosed(_))));

    let closed = db.close(id, &a, Some("done".into())).unwrap();
    assert_eq!(closed.status, Status::Closed);
    assert_eq!(closed.reason.as_deref(), Some("done"));
    assert_eq!(closed.version, 2);

    // closing again is a no-op
    let again = db.close(id, &a, None).unwrap();
    assert_eq!(again.version, 2);

    let reopened = db.reopen(id, &a).unwrap();
    assert_eq!(reopened.status, Status::Open);
    assert_eq!(reopened.reason, None);
    assert_eq!(reopened.version, 3);
}

#[test]
fn delete_cascades_edges_conflicts_and_pending() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    db.add_dep(t2, t1, &a).unwrap();

    // manufacture a conflict on t1
    db.show(t1, Some(&a)).unwrap();
    db.show(t1, Some(&b)).unwrap();
    db.update(t1, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    let _ = db
        .update(t1, &b, vec![FieldChange::Priority(Priority::HIGH)])
        .unwrap_err();
    assert_eq!(db.conflicts(None).unwrap().len(), 1);

    db.delete(t1, &a).unwrap();

    assert!(matches!(db.show(t1, None), Err(Error::NotFound(_))));
    assert!(db.conflicts(None).unwrap().is_empty());
    let t2_rec = db.show(t2, None).unwrap().todo;
    assert!(t2_rec.blocked_by.is_empty());
    assert!(db.ready().unwrap().iter().any(|t| t.id == t2));

    // ids are never reused
    let t3 = create(&db, "three", 2, &a);
    assert_eq!(t3.to_string(), "todo_3");
}

#[test]
fn search_is_case_insensitive_over_title_description_labels() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    db.create(
        &a,
        CreateTodo {
            title: "Fix Login".into(),
            description: "OAuth flow breaks".into(),
            ..Default::default()
        },
    )
    .unwrap();
    db.create(
        &a,
        CreateTodo {
            title: "unrelated".into(),
            labels: vec!["LOGIN-page".into()],
            ..Default::default()
        },
    )
    .unwrap();
    db.create(
        &a,
        CreateTodo {
            title: "noise".into(),
            ..Default::default()
        },
    )
    .unwrap();

    assert_eq!(db.search("login").unwrap().len(), 2);
    assert_eq!(db.search("oauth").unwrap().len(), 1);
    assert!(db.search("nothing").unwrap().is_empty());
}

#[test]
fn link_unlink_and_linked() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let id = create(&db, "one", 2, &a);

    db.link(id, "h2_3", &a).unwrap();
    assert_eq!(db.linked("h2_3").unwrap().len(), 1);
    assert!(db.linked("h9_9").unwrap().is_empty());

    db.unlink(id, "h2_3", &a).unwrap();
    assert!(db.linked("h2_3").unwrap().is_empty());
}

#[test]
fn agent_status_reports_assignments_and_conflicts() {
    let (_dir, db) = open_db();
    let a = agent("agent_a");
    let b = agent("agent_b");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &b);
    db.claim(t2, &b).unwrap();

    db.show(t1, Some(&a)).unwrap();
    db.show(t1, Some(&b)).unwrap();
    db.update(t1, &a, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    let _ = db
        .update(t1, &b, vec![FieldChange::Priority(Priority::HIGH)])
        .unwrap_err();

    let status = db.agent_status(&b).unwrap();
    assert_eq!(status.assigned.len(), 1);
    assert_eq!(status.assigned[0].id, t2);
    assert_eq!(status.conflicts.len(), 1);
    assert!(!status.recent.is_empty());

    let names: Vec<String> = db
        .agents()
        .unwrap()
        .into_iter()
        .map(|(name, _)| name.to_string())
        .collect();
    assert!(names.contains(&"agent_a".to_string()));
    assert!(names.contains(&"agent_b".to_string()));
}

#[test]
fn export_is_jsonl_ascending_by_id() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    for i in 0..12 {
        create(&db, &format!("todo number {i}"), 2, &a);
    }

    let jsonl = db.export_jsonl().unwrap();
    let ids: Vec<String> = jsonl
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid json line");
            value["id"].as_str().unwrap().to_string()
        })
        .collect();
    let expected: Vec<String> = (1..=12).map(|n| format!("todo_{n}")).collect();
    assert_eq!(ids, expected);
}

#[test]
fn update_without_prior_read_applies_directly() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let b = agent("b1");
    let id = create(&db, "one", 2, &a);

    // b never read; base defaults to the current version
    let outcome = db
        .update(id, &b, vec![FieldChange::Priority(Priority::CRITICAL)])
        .unwrap();
    assert_eq!(outcome.new_version, 2);
    assert!(outcome.conflicts.is_empty());
}

#[test]
fn dep_tree_walks_both_directions() {
    let (_dir, db) = open_db();
    let a = agent("a1");
    let t1 = create(&db, "one", 2, &a);
    let t2 = create(&db, "two", 2, &a);
    let t3 = create(&db, "three", 2, &a);
    db.add_dep(t2, t1, &a).unwrap();
    db.add_dep(t3, t2, &a).unwrap();

    let up = db.tree(t3, jari::Direction::Up).unwrap().unwrap();
    assert_eq!(up.id, t3);
    assert_eq!(up.deps.len(), 1);
    assert_eq!(up.deps[0].id, t2);
    assert_eq!(up.deps[0].deps[0].id, t1);

    let down = db.tree(t1, jari::Direction::Down).unwrap().unwrap();
    assert_eq!(down.deps[0].id, t2);
    assert_eq!(down.deps[0].deps[0].id, t3);
}
