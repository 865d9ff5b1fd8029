//! Database directory and default-agent resolution.

use std::path::PathBuf;

/// Directory holding the memory-mapped database.
///
/// Uses `JARI_DB` if set, otherwise `$XDG_DATA_HOME/jari` or
/// `~/.local/share/jari`.
pub fn db_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("JARI_DB")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("jari")
}

/// Default agent name from `JARI_AGENT`, if set and non-empty.
pub fn default_agent() -> Option<String> {
    std::env::var("JARI_AGENT")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}
