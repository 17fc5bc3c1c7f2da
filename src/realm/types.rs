//! Realm manager types.
//!
//! # State Transitions
//!
//! ```text
//!            start()              shutdown()
//! Created ───────────→ Running ───────────→ ShuttingDown ──→ Stopped
//!    │                                                          ↑
//!    └──────────────────────── shutdown() ──────────────────────┘
//! ```
//!
//! Per realm, [`RealmEvent`]s trace `Connecting → Joined → Left` or
//! `Connecting → ConnectFailed`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of the realm manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// Created but not started. Position updates are accepted and applied
    /// once the worker starts.
    Created,

    /// Worker running; position updates produce transactions.
    Running,

    /// `shutdown()` called. Closing every realm.
    ShuttingDown,

    /// All realms closed, worker exited.
    Stopped,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Created => write!(f, "Created"),
            ManagerState::Running => write!(f, "Running"),
            ManagerState::ShuttingDown => write!(f, "ShuttingDown"),
            ManagerState::Stopped => write!(f, "Stopped"),
        }
    }
}

/// A tracked position in world space.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Position {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// Identity of a realm: its minimum corner on the grid plus the grid size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RealmCoord {
    pub x: i64,
    pub y: i64,
    pub z: i64,
    pub size: u32,
}

impl fmt::Display for RealmCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "realm:{},{},{}@{}", self.x, self.y, self.z, self.size)
    }
}

/// Membership notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RealmEvent {
    /// A transaction started opening this realm.
    Connecting(RealmCoord),
    /// The realm's snapshot was imported and its session is live.
    Joined(RealmCoord),
    /// The realm was closed, either by a move or because its session failed.
    Left(RealmCoord),
    /// Opening the realm failed; it is not in the connected set.
    ConnectFailed(RealmCoord),
}

impl RealmEvent {
    pub fn realm(&self) -> RealmCoord {
        match self {
            RealmEvent::Connecting(c)
            | RealmEvent::Joined(c)
            | RealmEvent::Left(c)
            | RealmEvent::ConnectFailed(c) => *c,
        }
    }
}

/// Summary of one completed membership transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionReport {
    /// Generation of the position request this transaction served.
    pub generation: u64,
    pub joined: Vec<RealmCoord>,
    pub left: Vec<RealmCoord>,
    pub failed: Vec<RealmCoord>,
}
