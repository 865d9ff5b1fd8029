//! CLI surface.
//!
//! Thin adapters over the service API: parse, dispatch, render. Exit codes
//! are derived from the error sum in the binary, not here.

use clap::{Args, Parser, Subcommand};

use crate::error::{Error, Result};
use crate::model::{AgentName, Priority, Status};

mod commands;
mod render;

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "jari",
    version,
    about = "Embedded task/issue tracker for agent workflows",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Acting agent name (or set JARI_AGENT).
    #[arg(long, global = true, value_name = "NAME")]
    pub agent: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::parse_from(args)
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize the database.
    Init,

    /// Create a new todo.
    #[command(alias = "new")]
    Create(CreateArgs),

    /// Show a todo with its active blockers.
    Show(ShowArgs),

    /// List todos.
    #[command(alias = "ls")]
    List(ListArgs),

    /// Search title, description and labels.
    Search(SearchArgs),

    /// Todos ready to work on: no active blockers, priority-sorted.
    Ready,

    /// Todos held back by active blockers.
    Blocked,

    /// Atomically claim a todo: assignee + in_progress.
    Claim(IdArg),

    /// Update fields with conflict detection.
    Update(UpdateArgs),

    /// Close a todo.
    Close(CloseArgs),

    /// Reopen a closed todo.
    Reopen(IdArg),

    /// Delete a todo and its edges.
    Delete(IdArg),

    /// Dependency operations.
    #[command(alias = "deps")]
    Dep {
        #[command(subcommand)]
        cmd: DepCmd,
    },

    /// Label operations.
    Label {
        #[command(subcommand)]
        cmd: LabelCmd,
    },

    /// Link a todo to a niwa node.
    Link(LinkArgs),

    /// Unlink a todo from a niwa node.
    Unlink(LinkArgs),

    /// Todos linked to a niwa node.
    Linked(LinkedArgs),

    /// Agent status, or database stats without --agent.
    Status,

    /// Pending conflicts.
    Conflicts,

    /// Agents that have used this database.
    Agents,

    /// Version history of a todo.
    History(IdArg),

    /// Export all todos as JSON lines.
    Export(ExportArgs),

    /// Resolve pending conflicts on a todo.
    Resolve(ResolveArgs),

    /// Workflow context for LLM injection.
    Prime,
}

// =============================================================================
// Per-command args
// =============================================================================

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Title.
    pub title: String,

    /// Priority 0-4 (0 = critical).
    #[arg(short = 'p', long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Type (task, bug, feature, ...).
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub kind: Option<String>,

    /// Description.
    #[arg(short = 'd', long, allow_hyphen_values = true)]
    pub description: Option<String>,

    /// Parent todo id (epic/subtask).
    #[arg(long, value_name = "ID")]
    pub parent: Option<String>,

    /// Niwa node reference.
    #[arg(long = "niwa-ref", value_name = "NODE")]
    pub niwa_ref: Option<String>,

    /// Labels (repeat or comma-separated).
    #[arg(long = "label", value_delimiter = ',', num_args = 0..)]
    pub labels: Vec<String>,

    /// Read the description from a file.
    #[arg(long, value_name = "PATH")]
    pub file: Option<std::path::PathBuf>,

    /// Read the description from stdin.
    #[arg(long)]
    pub stdin: bool,
}

#[derive(Args, Debug)]
pub struct ShowArgs {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct IdArg {
    pub id: String,
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Status filter.
    #[arg(long, value_parser = parse_status)]
    pub status: Option<Status>,

    /// Priority filter.
    #[arg(short = 'p', long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// Assignee filter.
    #[arg(long)]
    pub assignee: Option<String>,

    /// Type filter.
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub kind: Option<String>,

    /// Label filter.
    #[arg(long)]
    pub label: Option<String>,
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    pub query: String,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    pub id: String,

    /// New title.
    #[arg(long)]
    pub title: Option<String>,

    /// New status.
    #[arg(long, value_parser = parse_status)]
    pub status: Option<Status>,

    /// New priority.
    #[arg(short = 'p', long, value_parser = parse_priority)]
    pub priority: Option<Priority>,

    /// New type.
    #[arg(short = 't', long = "type", value_name = "TYPE")]
    pub kind: Option<String>,

    /// New description.
    #[arg(short = 'd', long, allow_hyphen_values = true)]
    pub description: Option<String>,

    /// Assign to an agent.
    #[arg(long, value_name = "NAME")]
    pub assign: Option<String>,

    /// Read the description from a file.
    #[arg(long, value_name = "PATH")]
    pub file: Option<std::path::PathBuf>,

    /// Read the description from stdin.
    #[arg(long)]
    pub stdin: bool,
}

#[derive(Args, Debug)]
pub struct CloseArgs {
    pub id: String,

    /// Closure reason.
    #[arg(long)]
    pub reason: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum DepCmd {
    /// Add a dependency: child blocked by parent (cycle-checked).
    Add { child: String, parent: String },
    /// Remove a dependency.
    Remove { child: String, parent: String },
    /// Show the dependency tree.
    Tree {
        id: String,
        /// Walk dependents instead of blockers.
        #[arg(long)]
        down: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum LabelCmd {
    /// Add a label.
    Add { id: String, label: String },
    /// Remove a label.
    Remove { id: String, label: String },
}

#[derive(Args, Debug)]
pub struct LinkArgs {
    pub id: String,
    pub niwa_node: String,
}

#[derive(Args, Debug)]
pub struct LinkedArgs {
    pub niwa_node: String,
}

#[derive(Args, Debug)]
pub struct ExportArgs {
    /// Write to a file instead of stdout.
    #[arg(long, value_name = "PATH")]
    pub output: Option<std::path::PathBuf>,
}

#[derive(Args, Debug)]
pub struct ResolveArgs {
    pub id: String,

    /// ACCEPT_YOURS, ACCEPT_THEIRS or MANUAL_MERGE.
    pub strategy: String,

    /// field=value overrides for MANUAL_MERGE.
    #[arg(value_name = "FIELD=VALUE")]
    pub overrides: Vec<String>,
}

// =============================================================================
// Value parsing
// =============================================================================

fn parse_priority(raw: &str) -> std::result::Result<Priority, String> {
    let n: u8 = raw.parse().map_err(|_| format!("`{raw}` is not 0..=4"))?;
    Priority::new(n).map_err(|e| e.to_string())
}

fn parse_status(raw: &str) -> std::result::Result<Status, String> {
    Status::parse(raw).map_err(|e| e.to_string())
}

/// The acting agent: `--agent` first, then `JARI_AGENT`.
fn require_agent(flag: &Option<String>) -> Result<AgentName> {
    match flag.clone().or_else(crate::paths::default_agent) {
        Some(raw) => AgentName::parse(&raw),
        None => Err(Error::InvalidInput {
            field: "agent",
            reason: "pass --agent <name> or set JARI_AGENT".into(),
        }),
    }
}

fn optional_agent(flag: &Option<String>) -> Result<Option<AgentName>> {
    match flag.clone().or_else(crate::paths::default_agent) {
        Some(raw) => Ok(Some(AgentName::parse(&raw)?)),
        None => Ok(None),
    }
}

/// Dispatch a parsed invocation.
pub fn run(cli: Cli) -> Result<()> {
    commands::dispatch(cli)
}
