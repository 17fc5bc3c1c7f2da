// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persistence hook.
//!
//! The engine does not persist anything itself. After every applied write it
//! tells a [`SaveSink`] which identifiers changed, and an external store
//! decides what to durably write.
//!
//! # Example
//!
//! ```rust
//! use realm_replica::save::{SaveKeys, SaveSink};
//! use std::sync::Mutex;
//!
//! #[derive(Default)]
//! struct DirtySet(Mutex<Vec<String>>);
//!
//! impl SaveSink for DirtySet {
//!     fn save(&self, scope: &str, keys: SaveKeys) {
//!         let mut dirty = self.0.lock().unwrap();
//!         match keys {
//!             SaveKeys::All => dirty.push(format!("{}:*", scope)),
//!             SaveKeys::Ids(ids) => dirty.extend(ids),
//!         }
//!     }
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt;

/// Identifiers an external persistence layer should write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveKeys {
    /// Everything in the store (after a full import).
    All,
    /// Specific entity ids and collection names.
    Ids(BTreeSet<String>),
}

impl SaveKeys {
    pub fn ids<I: IntoIterator<Item = String>>(ids: I) -> Self {
        SaveKeys::Ids(ids.into_iter().collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        match self {
            SaveKeys::All => true,
            SaveKeys::Ids(ids) => ids.contains(id),
        }
    }
}

impl fmt::Display for SaveKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SaveKeys::All => f.write_str("*"),
            SaveKeys::Ids(ids) => {
                let joined: Vec<&str> = ids.iter().map(String::as_str).collect();
                write!(f, "{}", joined.join(","))
            }
        }
    }
}

/// Receives save notifications.
///
/// `scope` names the store that changed (a realm coordinate, or the name of
/// an authority). Called synchronously from the message loop, so
/// implementations should only record the keys and defer any I/O.
pub trait SaveSink: Send + Sync + 'static {
    fn save(&self, scope: &str, keys: SaveKeys);
}

/// Sink that only logs, for standalone mode and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpSaveSink;

impl SaveSink for NoOpSaveSink {
    fn save(&self, scope: &str, keys: SaveKeys) {
        tracing::trace!(scope = %scope, keys = %keys, "NoOp: would save");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_contains_everything() {
        assert!(SaveKeys::All.contains("anything"));
        assert_eq!(SaveKeys::All.to_string(), "*");
    }

    #[test]
    fn test_ids_dedupe_and_display_sorted() {
        let keys = SaveKeys::ids(["p1".to_string(), "players".to_string(), "p1".to_string()]);
        assert!(keys.contains("p1"));
        assert!(keys.contains("players"));
        assert!(!keys.contains("p2"));
        assert_eq!(keys.to_string(), "p1,players");
    }

    #[test]
    fn test_noop_sink_accepts_anything() {
        let sink = NoOpSaveSink;
        sink.save("realm", SaveKeys::All);
        sink.save("realm", SaveKeys::ids(["e".to_string()]));
    }
}
