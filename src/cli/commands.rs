//! Thin command handlers: parse inputs, call the service, render.

use std::io::Read;

use super::{
    Cli, CloseArgs, Commands, CreateArgs, DepCmd, ExportArgs, IdArg, LabelCmd, LinkArgs,
    LinkedArgs, ListArgs, ResolveArgs, SearchArgs, ShowArgs, UpdateArgs, optional_agent, render,
    require_agent,
};
use crate::error::{Error, Result};
use crate::graph::Direction;
use crate::model::{FieldChange, Resolution, TodoId};
use crate::query::ListFilter;
use crate::service::{CreateTodo, Jari};

pub(super) fn dispatch(cli: Cli) -> Result<()> {
    let agent_flag = cli.agent;

    if let Commands::Init = cli.command {
        let dir = crate::paths::db_dir();
        Jari::open(&dir)?;
        println!("initialized database at {}", dir.display());
        return Ok(());
    }

    let db = Jari::open_default()?;
    match cli.command {
        Commands::Init => unreachable!("handled above"),
        Commands::Create(args) => create(&db, &agent_flag, args),
        Commands::Show(args) => show(&db, &agent_flag, args),
        Commands::List(args) => list(&db, args),
        Commands::Search(args) => search(&db, args),
        Commands::Ready => ready(&db),
        Commands::Blocked => blocked(&db),
        Commands::Claim(args) => claim(&db, &agent_flag, args),
        Commands::Update(args) => update(&db, &agent_flag, args),
        Commands::Close(args) => close(&db, &agent_flag, args),
        Commands::Reopen(args) => reopen(&db, &agent_flag, args),
        Commands::Delete(args) => delete(&db, &agent_flag, args),
        Commands::Dep { cmd } => dep(&db, &agent_flag, cmd),
        Commands::Label { cmd } => label(&db, &agent_flag, cmd),
        Commands::Link(args) => link(&db, &agent_flag, args, true),
        Commands::Unlink(args) => link(&db, &agent_flag, args, false),
        Commands::Linked(args) => linked(&db, args),
        Commands::Status => status(&db, &agent_flag),
        Commands::Conflicts => conflicts(&db, &agent_flag),
        Commands::Agents => agents(&db),
        Commands::History(args) => history(&db, args),
        Commands::Export(args) => export(&db, args),
        Commands::Resolve(args) => resolve(&db, &agent_flag, args),
        Commands::Prime => prime(&db),
    }
}

/// Description precedence: --stdin, then --file, then -d.
fn read_description(
    flag: Option<String>,
    file: Option<std::path::PathBuf>,
    stdin: bool,
) -> Result<String> {
    if stdin {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .map_err(|e| Error::InvalidInput {
                field: "stdin",
                reason: e.to_string(),
            })?;
        return Ok(buf);
    }
    if let Some(path) = file {
        return std::fs::read_to_string(&path).map_err(|e| Error::InvalidInput {
            field: "file",
            reason: format!("{}: {e}", path.display()),
        });
    }
    Ok(flag.unwrap_or_default())
}

fn create(db: &Jari, agent_flag: &Option<String>, args: CreateArgs) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let description = read_description(args.description, args.file, args.stdin)?;
    let parent_id = args.parent.as_deref().map(TodoId::parse).transpose()?;

    let rec = db.create(
        &agent,
        CreateTodo {
            title: args.title,
            description,
            priority: args.priority,
            kind: args.kind,
            parent_id,
            niwa_ref: args.niwa_ref,
            labels: args.labels,
        },
    )?;
    print!("{}", render::created(&rec));
    Ok(())
}

fn show(db: &Jari, agent_flag: &Option<String>, args: ShowArgs) -> Result<()> {
    let id = TodoId::parse(&args.id)?;
    let agent = optional_agent(agent_flag)?;
    let view = db.show(id, agent.as_ref())?;
    print!("{}", render::todo_detail(&view));
    Ok(())
}

fn list(db: &Jari, args: ListArgs) -> Result<()> {
    let filter = ListFilter {
        status: args.status,
        priority: args.priority,
        assignee: args.assignee,
        kind: args.kind,
        label: args.label,
    };
    let todos = db.list(&filter)?;
    print!("{}", render::todo_table(&todos));
    Ok(())
}

fn search(db: &Jari, args: SearchArgs) -> Result<()> {
    let hits = db.search(&args.query)?;
    if hits.is_empty() {
        println!("no todos matching \"{}\"", args.query);
    } else {
        print!("{}", render::todo_table(&hits));
    }
    Ok(())
}

fn ready(db: &Jari) -> Result<()> {
    print!("{}", render::ready(&db.ready()?));
    Ok(())
}

fn blocked(db: &Jari) -> Result<()> {
    print!("{}", render::blocked(&db.blocked()?));
    Ok(())
}

fn claim(db: &Jari, agent_flag: &Option<String>, args: IdArg) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let rec = db.claim(TodoId::parse(&args.id)?, &agent)?;
    println!("✓ {} claimed by {} (v{})", rec.id, agent, rec.version);
    Ok(())
}

fn update(db: &Jari, agent_flag: &Option<String>, args: UpdateArgs) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let id = TodoId::parse(&args.id)?;

    let mut changes = Vec::new();
    if let Some(title) = args.title {
        changes.push(FieldChange::Title(title));
    }
    if let Some(status) = args.status {
        changes.push(FieldChange::Status(status));
    }
    if let Some(priority) = args.priority {
        changes.push(FieldChange::Priority(priority));
    }
    if let Some(kind) = args.kind {
        changes.push(FieldChange::Kind(kind));
    }
    if args.description.is_some() || args.file.is_some() || args.stdin {
        changes.push(FieldChange::Description(read_description(
            args.description,
            args.file,
            args.stdin,
        )?));
    }
    if let Some(assign) = args.assign {
        changes.push(FieldChange::Assignee(assign));
    }
    if changes.is_empty() {
        return Err(Error::InvalidInput {
            field: "changes",
            reason: "nothing to update; pass --title, --status, --priority, ...".into(),
        });
    }

    match db.update(id, &agent, changes) {
        Ok(outcome) => {
            print!("{}", render::updated(&outcome));
            if outcome.conflicts.is_empty() {
                Ok(())
            } else {
                // Partial merge: the unresolved part still demands action.
                Err(Error::ConflictPending {
                    fields: outcome.conflicts.iter().map(|c| c.field).collect(),
                })
            }
        }
        Err(Error::ConflictPending { fields }) => {
            let pending = db.conflicts(Some(&agent))?;
            print!("{}", render::conflict_help(id, &agent, &pending));
            Err(Error::ConflictPending { fields })
        }
        Err(e) => Err(e),
    }
}

fn close(db: &Jari, agent_flag: &Option<String>, args: CloseArgs) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let rec = db.close(TodoId::parse(&args.id)?, &agent, args.reason)?;
    println!("✓ {} closed (v{})", rec.id, rec.version);
    Ok(())
}

fn reopen(db: &Jari, agent_flag: &Option<String>, args: IdArg) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let rec = db.reopen(TodoId::parse(&args.id)?, &agent)?;
    println!("✓ {} reopened (v{})", rec.id, rec.version);
    Ok(())
}

fn delete(db: &Jari, agent_flag: &Option<String>, args: IdArg) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let id = TodoId::parse(&args.id)?;
    db.delete(id, &agent)?;
    println!("✓ {id} deleted");
    Ok(())
}

fn dep(db: &Jari, agent_flag: &Option<String>, cmd: DepCmd) -> Result<()> {
    match cmd {
        DepCmd::Add { child, parent } => {
            let agent = require_agent(agent_flag)?;
            let (child, parent) = (TodoId::parse(&child)?, TodoId::parse(&parent)?);
            db.add_dep(child, parent, &agent)?;
            println!("✓ {child} blocked by {parent}");
        }
        DepCmd::Remove { child, parent } => {
            let agent = require_agent(agent_flag)?;
            let (child, parent) = (TodoId::parse(&child)?, TodoId::parse(&parent)?);
            db.remove_dep(child, parent, &agent)?;
            println!("✓ {child} no longer blocked by {parent}");
        }
        DepCmd::Tree { id, down } => {
            let id = TodoId::parse(&id)?;
            let direction = if down { Direction::Down } else { Direction::Up };
            match db.tree(id, direction)? {
                Some(tree) => print!("{}", render::dep_tree(&tree)),
                None => return Err(Error::NotFound(id.to_string())),
            }
        }
    }
    Ok(())
}

fn label(db: &Jari, agent_flag: &Option<String>, cmd: LabelCmd) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    match cmd {
        LabelCmd::Add { id, label } => {
            let rec = db.add_label(TodoId::parse(&id)?, &label, &agent)?;
            println!("✓ {} labels: {}", rec.id, render::join(&rec.labels));
        }
        LabelCmd::Remove { id, label } => {
            let rec = db.remove_label(TodoId::parse(&id)?, &label, &agent)?;
            println!("✓ {} labels: {}", rec.id, render::join(&rec.labels));
        }
    }
    Ok(())
}

fn link(db: &Jari, agent_flag: &Option<String>, args: LinkArgs, attach: bool) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let id = TodoId::parse(&args.id)?;
    if attach {
        db.link(id, &args.niwa_node, &agent)?;
        println!("✓ {id} linked to {}", args.niwa_node);
    } else {
        db.unlink(id, &args.niwa_node, &agent)?;
        println!("✓ {id} unlinked from {}", args.niwa_node);
    }
    Ok(())
}

fn linked(db: &Jari, args: LinkedArgs) -> Result<()> {
    let todos = db.linked(&args.niwa_node)?;
    if todos.is_empty() {
        println!("no todos linked to {}", args.niwa_node);
    } else {
        print!("{}", render::todo_table(&todos));
    }
    Ok(())
}

fn status(db: &Jari, agent_flag: &Option<String>) -> Result<()> {
    match optional_agent(agent_flag)? {
        Some(agent) => print!("{}", render::agent_status(&db.agent_status(&agent)?)),
        None => print!("{}", render::stats(&db.stats()?)),
    }
    Ok(())
}

fn conflicts(db: &Jari, agent_flag: &Option<String>) -> Result<()> {
    let agent = optional_agent(agent_flag)?;
    let pending = db.conflicts(agent.as_ref())?;
    print!("{}", render::conflicts(&pending));
    Ok(())
}

fn agents(db: &Jari) -> Result<()> {
    print!("{}", render::agents(&db.agents()?));
    Ok(())
}

fn history(db: &Jari, args: IdArg) -> Result<()> {
    let id = TodoId::parse(&args.id)?;
    print!("{}", render::history(id, &db.history(id)?));
    Ok(())
}

fn export(db: &Jari, args: ExportArgs) -> Result<()> {
    let jsonl = db.export_jsonl()?;
    match args.output {
        Some(path) => {
            std::fs::write(&path, &jsonl).map_err(|e| Error::InvalidInput {
                field: "output",
                reason: format!("{}: {e}", path.display()),
            })?;
            println!("✓ exported {} todos to {}", jsonl.lines().count(), path.display());
        }
        None => print!("{jsonl}"),
    }
    Ok(())
}

fn resolve(db: &Jari, agent_flag: &Option<String>, args: ResolveArgs) -> Result<()> {
    let agent = require_agent(agent_flag)?;
    let id = TodoId::parse(&args.id)?;
    let strategy = Resolution::parse(&args.strategy)?;

    let mut overrides = Vec::new();
    for raw in &args.overrides {
        let (field, value) = raw.split_once('=').ok_or_else(|| Error::InvalidInput {
            field: "overrides",
            reason: format!("`{raw}` is not field=value"),
        })?;
        overrides.push((field.to_string(), value.to_string()));
    }

    let rec = db.resolve(id, &agent, strategy, &overrides)?;
    println!("✓ {} conflicts resolved (v{})", rec.id, rec.version);
    Ok(())
}

fn prime(db: &Jari) -> Result<()> {
    let stats = db.stats()?;
    let ready = db.ready()?;
    let blocked = db.blocked()?;
    print!("{}", render::prime(&stats, &ready, &blocked));
    Ok(())
}
