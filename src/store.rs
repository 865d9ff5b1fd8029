//! Memory-mapped storage engine with named sub-stores.
//!
//! Four LMDB sub-databases back the tracker: `todos` (current records),
//! `history` (version snapshots), `pending` (per-agent read versions) and
//! `meta` (reverse edges, conflicts, agent registry, counters). Writers
//! serialize globally; readers see a consistent snapshot and never block.
//!
//! `MDB_MAP_FULL` surfaces as `StorageFull`; every other engine failure is
//! `StorageCorrupt`. Both abort the enclosing transaction whole.

use std::path::Path;

use heed::types::{Bytes, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn, RwTxn};

use crate::codec;
use crate::error::{Error, Result};
use crate::model::{
    AgentInfo, AgentName, ConflictRecord, PendingRead, Snapshot, TodoId, TodoRecord,
};
use crate::time::WallClock;

const MAP_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB
const MAX_DBS: u32 = 4;

pub struct Store {
    env: Env,
    todos: Database<Str, Bytes>,
    history: Database<Str, Bytes>,
    pending: Database<Str, Bytes>,
    meta: Database<Str, Bytes>,
}

impl Store {
    /// Open (creating if needed) the database under `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::StorageCorrupt(format!("create {}: {e}", dir.display())))?;

        // SAFETY: the process must not have the same file mapped twice; we
        // open each database directory through a single Store.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(MAP_SIZE)
                .max_dbs(MAX_DBS)
                .open(dir)?
        };

        let mut wtxn = env.write_txn()?;
        let todos = env.create_database(&mut wtxn, Some("todos"))?;
        let history = env.create_database(&mut wtxn, Some("history"))?;
        let pending = env.create_database(&mut wtxn, Some("pending"))?;
        let meta = env.create_database(&mut wtxn, Some("meta"))?;
        wtxn.commit()?;

        Ok(Self {
            env,
            todos,
            history,
            pending,
            meta,
        })
    }

    pub fn read_txn(&self) -> Result<RoTxn<'_>> {
        Ok(self.env.read_txn()?)
    }

    /// Waits for the global writer lock; commit is atomic across sub-stores.
    pub fn write_txn(&self) -> Result<RwTxn<'_>> {
        Ok(self.env.write_txn()?)
    }

    // =========================================================================
    // todos
    // =========================================================================

    pub fn todo(&self, txn: &RoTxn<'_>, id: TodoId) -> Result<Option<TodoRecord>> {
        match self.todos.get(txn, &codec::todo_key(id))? {
            Some(bytes) => Ok(Some(codec::decode(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn require_todo(&self, txn: &RoTxn<'_>, id: TodoId) -> Result<TodoRecord> {
        self.todo(txn, id)?.ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn put_todo(&self, txn: &mut RwTxn<'_>, rec: &TodoRecord) -> Result<()> {
        self.todos
            .put(txn, &codec::todo_key(rec.id), &codec::encode(rec)?)?;
        Ok(())
    }

    pub fn delete_todo(&self, txn: &mut RwTxn<'_>, id: TodoId) -> Result<bool> {
        Ok(self.todos.delete(txn, &codec::todo_key(id))?)
    }

    /// Every live record, unordered (callers sort).
    pub fn all_todos(&self, txn: &RoTxn<'_>) -> Result<Vec<TodoRecord>> {
        let mut out = Vec::new();
        for entry in self.todos.iter(txn)? {
            let (_, bytes) = entry?;
            out.push(codec::decode(bytes)?);
        }
        Ok(out)
    }

    /// Issue the next todo id. The counter stores the next index to issue
    /// and survives deletions, so ids are never reused.
    pub fn next_todo_id(&self, txn: &mut RwTxn<'_>) -> Result<TodoId> {
        let next: u64 = match self.meta.get(txn, codec::TODO_COUNTER_KEY)? {
            Some(bytes) => codec::decode(bytes)?,
            None => 1,
        };
        self.meta
            .put(txn, codec::TODO_COUNTER_KEY, &codec::encode(&(next + 1))?)?;
        Ok(TodoId::from_index(next))
    }

    // =========================================================================
    // history
    // =========================================================================

    pub fn put_snapshot(&self, txn: &mut RwTxn<'_>, snap: &Snapshot) -> Result<()> {
        self.history.put(
            txn,
            &codec::history_key(snap.todo.id, snap.version),
            &codec::encode(snap)?,
        )?;
        Ok(())
    }

    pub fn snapshot(&self, txn: &RoTxn<'_>, id: TodoId, version: u64) -> Result<Option<Snapshot>> {
        match self.history.get(txn, &codec::history_key(id, version))? {
            Some(bytes) => Ok(Some(codec::decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Full history for one todo, version ascending.
    pub fn history(&self, txn: &RoTxn<'_>, id: TodoId) -> Result<Vec<Snapshot>> {
        let mut out = Vec::new();
        for entry in self.history.prefix_iter(txn, &codec::history_prefix(id))? {
            let (_, bytes) = entry?;
            out.push(codec::decode(bytes)?);
        }
        Ok(out)
    }

    /// All snapshots in the store (agent-status scans filter by author).
    pub fn all_snapshots(&self, txn: &RoTxn<'_>) -> Result<Vec<Snapshot>> {
        let mut out = Vec::new();
        for entry in self.history.iter(txn)? {
            let (_, bytes) = entry?;
            out.push(codec::decode(bytes)?);
        }
        Ok(out)
    }

    // =========================================================================
    // pending reads
    // =========================================================================

    pub fn pending_read(
        &self,
        txn: &RoTxn<'_>,
        agent: &AgentName,
        id: TodoId,
    ) -> Result<Option<PendingRead>> {
        match self.pending.get(txn, &codec::pending_key(agent, id))? {
            Some(bytes) => Ok(Some(codec::decode(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_pending_read(&self, txn: &mut RwTxn<'_>, read: &PendingRead) -> Result<()> {
        self.pending.put(
            txn,
            &codec::pending_key(&read.agent, read.todo_id),
            &codec::encode(read)?,
        )?;
        Ok(())
    }

    pub fn clear_pending_read(
        &self,
        txn: &mut RwTxn<'_>,
        agent: &AgentName,
        id: TodoId,
    ) -> Result<()> {
        self.pending.delete(txn, &codec::pending_key(agent, id))?;
        Ok(())
    }

    /// Drop every agent's pending read of `id` (todo deletion cascade).
    pub fn clear_pending_reads_of(&self, txn: &mut RwTxn<'_>, id: TodoId) -> Result<()> {
        let mut stale = Vec::new();
        for entry in self.pending.iter(txn)? {
            let (key, _) = entry?;
            if codec::pending_key_todo(key) == Some(id) {
                stale.push(key.to_string());
            }
        }
        for key in stale {
            self.pending.delete(txn, &key)?;
        }
        Ok(())
    }

    // =========================================================================
    // reverse dependency index
    // =========================================================================

    pub fn put_edge_marker(
        &self,
        txn: &mut RwTxn<'_>,
        parent: TodoId,
        child: TodoId,
    ) -> Result<()> {
        self.meta.put(txn, &codec::blocks_key(parent, child), &[])?;
        Ok(())
    }

    pub fn delete_edge_marker(
        &self,
        txn: &mut RwTxn<'_>,
        parent: TodoId,
        child: TodoId,
    ) -> Result<()> {
        self.meta.delete(txn, &codec::blocks_key(parent, child))?;
        Ok(())
    }

    /// Children blocked by `parent`, from the reverse index.
    pub fn dependents_of(&self, txn: &RoTxn<'_>, parent: TodoId) -> Result<Vec<TodoId>> {
        let mut out = Vec::new();
        for entry in self.meta.prefix_iter(txn, &codec::blocks_prefix(parent))? {
            let (key, _) = entry?;
            if let Some(child) = codec::blocks_key_child(key) {
                out.push(child);
            }
        }
        Ok(out)
    }

    // =========================================================================
    // conflicts
    // =========================================================================

    pub fn put_conflict(&self, txn: &mut RwTxn<'_>, conflict: &ConflictRecord) -> Result<()> {
        self.meta.put(
            txn,
            &codec::conflict_key(conflict.todo_id, conflict.seq),
            &codec::encode(conflict)?,
        )?;
        Ok(())
    }

    /// Conflicts on one todo, sequence ascending.
    pub fn conflicts_of(&self, txn: &RoTxn<'_>, id: TodoId) -> Result<Vec<ConflictRecord>> {
        let mut out = Vec::new();
        for entry in self.meta.prefix_iter(txn, &codec::conflict_prefix(id))? {
            let (_, bytes) = entry?;
            out.push(codec::decode(bytes)?);
        }
        Ok(out)
    }

    /// Every pending conflict in the store.
    pub fn all_conflicts(&self, txn: &RoTxn<'_>) -> Result<Vec<ConflictRecord>> {
        let mut out = Vec::new();
        for entry in self.meta.prefix_iter(txn, codec::CONFLICT_ROOT)? {
            let (_, bytes) = entry?;
            out.push(codec::decode(bytes)?);
        }
        Ok(out)
    }

    /// Next conflict sequence number for `id` (monotone per todo).
    pub fn next_conflict_seq(&self, txn: &RoTxn<'_>, id: TodoId) -> Result<u64> {
        let mut iter = self.meta.rev_prefix_iter(txn, &codec::conflict_prefix(id))?;
        match iter.next().transpose()? {
            Some((_, bytes)) => {
                let last: ConflictRecord = codec::decode(bytes)?;
                Ok(last.seq + 1)
            }
            None => Ok(1),
        }
    }

    /// Remove the given agent's conflicts on `id`; `None` removes them all.
    pub fn clear_conflicts(
        &self,
        txn: &mut RwTxn<'_>,
        id: TodoId,
        agent: Option<&AgentName>,
    ) -> Result<()> {
        let mut doomed = Vec::new();
        for entry in self.meta.prefix_iter(txn, &codec::conflict_prefix(id))? {
            let (key, bytes) = entry?;
            let conflict: ConflictRecord = codec::decode(bytes)?;
            if agent.is_none_or(|a| conflict.agent == *a) {
                doomed.push(key.to_string());
            }
        }
        for key in doomed {
            self.meta.delete(txn, &key)?;
        }
        Ok(())
    }

    // =========================================================================
    // agent registry
    // =========================================================================

    /// Record a sighting of `agent`, creating the registry entry on first
    /// contact.
    pub fn touch_agent(&self, txn: &mut RwTxn<'_>, agent: &AgentName) -> Result<()> {
        let now = WallClock::now();
        let info = match self.meta.get(txn, &codec::agent_key(agent))? {
            Some(bytes) => {
                let mut info: AgentInfo = codec::decode(bytes)?;
                info.last_seen = now;
                info
            }
            None => AgentInfo {
                first_seen: now,
                last_seen: now,
            },
        };
        self.meta
            .put(txn, &codec::agent_key(agent), &codec::encode(&info)?)?;
        Ok(())
    }

    pub fn agents(&self, txn: &RoTxn<'_>) -> Result<Vec<(AgentName, AgentInfo)>> {
        let mut out = Vec::new();
        for entry in self.meta.prefix_iter(txn, codec::AGENT_ROOT)? {
            let (key, bytes) = entry?;
            if let Some(name) = codec::agent_key_name(key) {
                out.push((name, codec::decode(bytes)?));
            }
        }
        Ok(out)
    }
}
