//! Key layout and record encoding.
//!
//! Records are self-describing JSON maps: deterministic bytes for equal
//! logical values (struct field order, B-tree collections) and unknown
//! fields preserved on read-modify-write. Keys are designed so that
//! lexicographic order inside each sub-store matches the logical order.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Error, Result};
use crate::model::{AgentName, TodoId};

// =============================================================================
// Keys
// =============================================================================

/// `todos` sub-store: one record per todo.
pub fn todo_key(id: TodoId) -> String {
    id.to_string()
}

/// `history` sub-store: `{id}/{version:012}`.
///
/// Zero-pad width 12 keeps lexicographic order numeric up to 10^12 versions.
pub fn history_key(id: TodoId, version: u64) -> String {
    format!("{id}/{version:012}")
}

pub fn history_prefix(id: TodoId) -> String {
    format!("{id}/")
}

/// `pending` sub-store: `{agent}/{id}`.
pub fn pending_key(agent: &AgentName, id: TodoId) -> String {
    format!("{agent}/{id}")
}

pub fn pending_prefix(agent: &AgentName) -> String {
    format!("{agent}/")
}

/// Parse a `pending` key back into its todo id.
pub fn pending_key_todo(key: &str) -> Option<TodoId> {
    let (_, id) = key.split_once('/')?;
    TodoId::parse(id).ok()
}

/// `meta` sub-store: reverse dependency edge marker `blocks/{parent}/{child}`.
pub fn blocks_key(parent: TodoId, child: TodoId) -> String {
    format!("blocks/{parent}/{child}")
}

pub fn blocks_prefix(parent: TodoId) -> String {
    format!("blocks/{parent}/")
}

/// Parse the child id out of a `blocks/{parent}/{child}` key.
pub fn blocks_key_child(key: &str) -> Option<TodoId> {
    let child = key.rsplit_once('/')?.1;
    TodoId::parse(child).ok()
}

/// `meta` sub-store: `conflict/{id}/{seq:06}`.
pub fn conflict_key(id: TodoId, seq: u64) -> String {
    format!("conflict/{id}/{seq:06}")
}

pub fn conflict_prefix(id: TodoId) -> String {
    format!("conflict/{id}/")
}

pub const CONFLICT_ROOT: &str = "conflict/";

/// `meta` sub-store: agent registry entry.
pub fn agent_key(agent: &AgentName) -> String {
    format!("agent/{agent}")
}

pub const AGENT_ROOT: &str = "agent/";

/// Parse an `agent/{name}` key back into the agent name.
pub fn agent_key_name(key: &str) -> Option<AgentName> {
    let name = key.strip_prefix(AGENT_ROOT)?;
    AgentName::parse(name).ok()
}

/// `meta` sub-store: the id-issue counter (last issued index).
pub const TODO_COUNTER_KEY: &str = "counter/todo_id";

// =============================================================================
// Records
// =============================================================================

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| Error::StorageCorrupt(format!("encode: {e}")))
}

pub fn encode_string<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::StorageCorrupt(format!("encode: {e}")))
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| Error::StorageCorrupt(format!("decode: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_keys_sort_numerically() {
        let id = TodoId::from_index(7);
        let mut keys = vec![
            history_key(id, 10),
            history_key(id, 2),
            history_key(id, 100),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                history_key(id, 2),
                history_key(id, 10),
                history_key(id, 100)
            ]
        );
    }

    #[test]
    fn blocks_key_parses_child() {
        let key = blocks_key(TodoId::from_index(1), TodoId::from_index(42));
        assert_eq!(key, "blocks/todo_1/todo_42");
        assert_eq!(blocks_key_child(&key), Some(TodoId::from_index(42)));
    }

    #[test]
    fn pending_key_parses_todo() {
        let agent = AgentName::parse("a1").unwrap();
        let key = pending_key(&agent, TodoId::from_index(3));
        assert_eq!(pending_key_todo(&key), Some(TodoId::from_index(3)));
    }

    #[test]
    fn encoding_is_deterministic() {
        use std::collections::BTreeSet;
        let a: BTreeSet<&str> = ["b", "a"].into();
        let b: BTreeSet<&str> = ["a", "b"].into();
        assert_eq!(encode(&a).unwrap(), encode(&b).unwrap());
    }
}
