//! Human renderer for CLI outputs.
//!
//! Pure formatting; handlers gather the data.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use crate::engine::UpdateOutcome;
use crate::graph::TreeNode;
use crate::model::{AgentInfo, AgentName, ConflictRecord, Snapshot, Status, TodoId, TodoRecord};
use crate::query::{AgentStatus, BlockedTodo, Stats};
use crate::service::TodoView;

fn status_glyph(status: Status) -> &'static str {
    match status {
        Status::Open => "·",
        Status::InProgress => "▶",
        Status::Blocked => "⊘",
        Status::Closed => "✓",
        Status::Deferred => "⏸",
    }
}

pub fn join(set: &BTreeSet<String>) -> String {
    set.iter().cloned().collect::<Vec<_>>().join(", ")
}

pub fn created(rec: &TodoRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "✓ Created {}", rec.id);
    let _ = writeln!(out, "  Title:    {}", rec.title);
    let _ = writeln!(out, "  Priority: {}", rec.priority.name());
    let _ = writeln!(out, "  Type:     {}", rec.kind);
    out
}

pub fn todo_detail(view: &TodoView) -> String {
    let rec = &view.todo;
    let mut out = String::new();
    let _ = writeln!(out, "{} {} — {}", status_glyph(rec.status), rec.id, rec.title);
    let _ = writeln!(out, "  Status:     {}", rec.status);
    let _ = writeln!(out, "  Priority:   {}", rec.priority.name());
    let _ = writeln!(out, "  Type:       {}", rec.kind);
    let assignee = if rec.assignee.is_empty() { "-" } else { &rec.assignee };
    let _ = writeln!(out, "  Assignee:   {assignee}");
    let _ = writeln!(out, "  Version:    {}", rec.version);
    let _ = writeln!(out, "  Created:    {} by {}", rec.created_at.render(), rec.created_by);
    let _ = writeln!(out, "  Updated:    {} by {}", rec.updated_at.render(), rec.updated_by);
    if let Some(closed_at) = rec.closed_at {
        let _ = writeln!(out, "  Closed:     {}", closed_at.render());
    }
    if let Some(reason) = &rec.reason {
        let _ = writeln!(out, "  Reason:     {reason}");
    }
    if !rec.labels.is_empty() {
        let _ = writeln!(out, "  Labels:     {}", join(&rec.labels));
    }
    if !rec.niwa_refs.is_empty() {
        let _ = writeln!(out, "  Niwa refs:  {}", join(&rec.niwa_refs));
    }
    if let Some(parent) = rec.parent_id {
        let _ = writeln!(out, "  Parent:     {parent}");
    }
    if !rec.blocked_by.is_empty() {
        let ids = rec
            .blocked_by
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  Blocked by: {ids}");
    }
    if !view.active_blockers.is_empty() {
        let active = view
            .active_blockers
            .iter()
            .map(|(id, status)| format!("{id}({status})"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  Waiting on: {active}");
    }
    if !rec.description.is_empty() {
        let _ = writeln!(out, "\n{}", rec.description);
    }
    out
}

pub fn todo_table(todos: &[TodoRecord]) -> String {
    if todos.is_empty() {
        return "no todos found\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(
        out,
        " {:<10} {:<2} {:<8} {:<8} {:<15} TITLE",
        "ID", "ST", "PRI", "TYPE", "ASSIGNEE"
    );
    for rec in todos {
        let assignee = if rec.assignee.is_empty() { "-" } else { &rec.assignee };
        let _ = writeln!(
            out,
            " {:<10} {:<2} {:<8} {:<8} {:<15} {}",
            rec.id.to_string(),
            status_glyph(rec.status),
            rec.priority.name(),
            rec.kind,
            assignee,
            rec.title
        );
    }
    out
}

pub fn ready(todos: &[TodoRecord]) -> String {
    if todos.is_empty() {
        return "✨ no ready work\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "📋 Ready ({} todos with no active blockers):", todos.len());
    for (i, rec) in todos.iter().enumerate() {
        let _ = writeln!(
            out,
            "{}. [P{}] {}: {}",
            i + 1,
            rec.priority.value(),
            rec.id,
            rec.title
        );
        if !rec.assignee.is_empty() {
            let _ = writeln!(out, "   Assignee: {}", rec.assignee);
        }
    }
    let _ = writeln!(out, "\nto claim: jari claim <id> --agent <name>");
    out
}

pub fn blocked(blocked: &[BlockedTodo]) -> String {
    if blocked.is_empty() {
        return "✨ nothing is blocked\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "⊘ Blocked ({}):", blocked.len());
    for entry in blocked {
        let blockers = entry
            .blockers
            .iter()
            .map(|(id, status)| format!("{id}({status})"))
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "  [{}] {}", entry.todo.id, entry.todo.title);
        let _ = writeln!(out, "    waiting on: {blockers}");
    }
    out
}

pub fn updated(outcome: &UpdateOutcome) -> String {
    let mut out = String::new();
    if !outcome.merged.is_empty() {
        let fields = outcome
            .merged
            .iter()
            .map(|f| f.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        let _ = writeln!(out, "✓ {} updated: {} (v{})", outcome.id, fields, outcome.new_version);
    } else if outcome.conflicts.is_empty() {
        let _ = writeln!(out, "no changes for {}", outcome.id);
    }
    for conflict in &outcome.conflicts {
        let _ = writeln!(
            out,
            "⚠ conflict on {}: yours={} theirs={}",
            conflict.field, conflict.yours, conflict.theirs
        );
    }
    out
}

pub fn conflict_help(id: TodoId, agent: &AgentName, pending: &[ConflictRecord]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "⚠ conflict detected on {id}");
    for conflict in pending.iter().filter(|c| c.todo_id == id) {
        let _ = writeln!(
            out,
            "  {}: yours={} theirs={} (base v{}, theirs v{})",
            conflict.field, conflict.yours, conflict.theirs, conflict.base_version, conflict.their_version
        );
    }
    let _ = writeln!(out, "resolve with one of:");
    let _ = writeln!(out, "  jari resolve {id} ACCEPT_YOURS --agent {agent}");
    let _ = writeln!(out, "  jari resolve {id} ACCEPT_THEIRS --agent {agent}");
    let _ = writeln!(out, "  jari resolve {id} MANUAL_MERGE field=value --agent {agent}");
    out
}

pub fn conflicts(pending: &[ConflictRecord]) -> String {
    if pending.is_empty() {
        return "no pending conflicts\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "⚠ Pending conflicts ({}):", pending.len());
    for conflict in pending {
        let _ = writeln!(
            out,
            "  [{}] {} by {}: yours={} theirs={}",
            conflict.todo_id, conflict.field, conflict.agent, conflict.yours, conflict.theirs
        );
    }
    out
}

pub fn dep_tree(node: &TreeNode) -> String {
    let mut out = String::new();
    render_tree_node(node, 0, &mut out);
    out
}

fn render_tree_node(node: &TreeNode, depth: usize, out: &mut String) {
    let indent = "  ".repeat(depth);
    let assignee = if node.assignee.is_empty() {
        String::new()
    } else {
        format!(" @{}", node.assignee)
    };
    let _ = writeln!(
        out,
        "{indent}{} [{}] {}{assignee}",
        status_glyph(node.status),
        node.id,
        node.title
    );
    for dep in &node.deps {
        render_tree_node(dep, depth + 1, out);
    }
}

pub fn agent_status(status: &AgentStatus) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📊 Agent {}", status.agent);
    if !status.assigned.is_empty() {
        let _ = writeln!(out, "\nassigned:");
        for rec in &status.assigned {
            let _ = writeln!(
                out,
                "  [{}] {} ({}, {})",
                rec.id,
                rec.title,
                rec.status,
                rec.priority.name()
            );
        }
    }
    if !status.conflicts.is_empty() {
        let _ = writeln!(out, "\npending conflicts:");
        for conflict in &status.conflicts {
            let _ = writeln!(out, "  [{}] {}", conflict.todo_id, conflict.field);
        }
    }
    if !status.recent.is_empty() {
        let _ = writeln!(out, "\nrecent edits:");
        for snap in &status.recent {
            let _ = writeln!(
                out,
                "  [{}] v{} {} {}",
                snap.todo.id,
                snap.version,
                snap.at.render(),
                snap.operation
            );
        }
    }
    if status.assigned.is_empty() && status.conflicts.is_empty() {
        let _ = writeln!(out, "nothing assigned, no conflicts — ready to work");
    }
    out
}

pub fn stats(stats: &Stats) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📊 Database: {} todos", stats.total);
    for (status, count) in &stats.by_status {
        let _ = writeln!(out, "  {status:<12} {count}");
    }
    if stats.pending_conflicts > 0 {
        let _ = writeln!(out, "⚠ {} pending conflicts", stats.pending_conflicts);
    }
    out
}

pub fn agents(agents: &[(AgentName, AgentInfo)]) -> String {
    if agents.is_empty() {
        return "no agents have used this database yet\n".into();
    }
    let mut out = String::new();
    let _ = writeln!(out, "👥 Agents ({}):", agents.len());
    for (name, info) in agents {
        let _ = writeln!(
            out,
            "  {:<20} first={} last={}",
            name.as_str(),
            info.first_seen.render(),
            info.last_seen.render()
        );
    }
    out
}

pub fn history(id: TodoId, snapshots: &[Snapshot]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "📜 History of {id}:");
    for snap in snapshots {
        let _ = writeln!(
            out,
            "  v{} | {} | {} | {}",
            snap.version,
            snap.at.render(),
            snap.agent,
            snap.operation
        );
    }
    out
}

/// Workflow context for LLM injection: stats, top of the ready queue,
/// blocked summary, quick reference.
pub fn prime(stats: &Stats, ready: &[TodoRecord], blocked: &[BlockedTodo]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[Jari — task tracker context]");
    let by_status = stats
        .by_status
        .iter()
        .map(|(s, n)| format!("{s}={n}"))
        .collect::<Vec<_>>()
        .join(", ");
    let _ = writeln!(out, "\nDATABASE: {} todos ({by_status})", stats.total);
    if stats.pending_conflicts > 0 {
        let _ = writeln!(out, "⚠ CONFLICTS: {} pending", stats.pending_conflicts);
    }

    if !ready.is_empty() {
        let _ = writeln!(out, "\nREADY ({} items, priority-sorted):", ready.len());
        for rec in ready.iter().take(10) {
            let assignee = if rec.assignee.is_empty() {
                String::new()
            } else {
                format!(" @{}", rec.assignee)
            };
            let _ = writeln!(
                out,
                "  [{}] {}: {}{assignee}",
                rec.id,
                rec.priority.name(),
                rec.title
            );
        }
        if ready.len() > 10 {
            let _ = writeln!(out, "  ... and {} more", ready.len() - 10);
        }
    }

    if !blocked.is_empty() {
        let _ = writeln!(out, "\nBLOCKED ({} items):", blocked.len());
        for entry in blocked.iter().take(5) {
            let blockers = entry
                .blockers
                .iter()
                .map(|(id, _)| id.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            let _ = writeln!(out, "  [{}] {} <- {blockers}", entry.todo.id, entry.todo.title);
        }
    }

    let _ = writeln!(out, "\nWORKFLOW: ready -> claim -> work -> close -> ready");
    let _ = writeln!(
        out,
        "COMMANDS: create, list, show, update, close, ready, claim, dep, search, status"
    );
    out
}
