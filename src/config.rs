// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replica engine.
//!
//! Configuration is passed to [`RealmManager::new()`](crate::RealmManager::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use realm_replica::config::ReplicaConfig;
//!
//! let config = ReplicaConfig {
//!     client_id: "client-7".into(),
//!     ..Default::default()
//! };
//! assert_eq!(config.realm.realm_size, 16);
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicaConfig
//! ├── client_id: String            # Identifies this client in logs
//! ├── realm: RealmConfig           # Grid and neighborhood
//! └── session: SessionConfig       # Channel open and snapshots
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! client_id: "client-7"
//!
//! realm:
//!   realm_size: 32
//!   aggregate_collections: ["players", "worldApps"]
//!
//! session:
//!   connect_timeout: "5s"
//!   connect_attempts: 5
//! ```

use crate::error::{ReplicaError, Result};
use crate::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to `RealmManager::new()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Identity of this client, attached to log spans.
    pub client_id: String,

    #[serde(default)]
    pub realm: RealmConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            client_id: "local.client.default".to_string(),
            realm: RealmConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl ReplicaConfig {
    /// Minimal config with fast timeouts for tests.
    pub fn for_testing(client_id: &str) -> Self {
        Self {
            client_id: client_id.to_string(),
            realm: RealmConfig::default(),
            session: SessionConfig::for_testing(),
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.is_empty() {
            return Err(ReplicaError::Config("client_id must not be empty".to_string()));
        }
        self.realm.validate()?;
        self.session.validate()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RealmConfig: grid and neighborhood
// ═══════════════════════════════════════════════════════════════════════════════

/// Spatial partitioning settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    /// Edge length of a realm cell.
    #[serde(default = "default_realm_size")]
    pub realm_size: u32,

    /// Neighborhood radius in cells; 1 gives the 3×3 neighborhood.
    #[serde(default = "default_radius")]
    pub radius: u32,

    /// Collections merged across every connected realm.
    #[serde(default = "default_aggregate_collections")]
    pub aggregate_collections: Vec<String>,

    /// Buffer size of the realm and aggregate notification channels.
    /// Slow receivers lag and skip past the oldest notifications.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_realm_size() -> u32 {
    16
}

fn default_radius() -> u32 {
    1
}

fn default_aggregate_collections() -> Vec<String> {
    vec!["players".to_string()]
}

fn default_event_capacity() -> usize {
    256
}

impl Default for RealmConfig {
    fn default() -> Self {
        Self {
            realm_size: default_realm_size(),
            radius: default_radius(),
            aggregate_collections: default_aggregate_collections(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl RealmConfig {
    pub fn validate(&self) -> Result<()> {
        if self.realm_size == 0 {
            return Err(ReplicaError::Config("realm_size must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(ReplicaError::Config(
                "event_capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Number of realms in a full neighborhood.
    pub fn neighborhood_size(&self) -> usize {
        let side = 2 * self.radius as usize + 1;
        side * side
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SessionConfig: channel open and snapshots
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-session settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Timeout for each channel-open attempt, as a duration string ("10s").
    /// The wait for the initial IMPORT is never timed out.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,

    /// Channel-open attempts before the realm is reported as failed.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: usize,

    /// Whether an authority compresses the snapshots it serves.
    #[serde(default = "default_true")]
    pub compress_snapshots: bool,

    /// Snapshots smaller than this many bytes are sent uncompressed.
    #[serde(default = "default_compression_threshold")]
    pub compression_threshold: usize,

    /// zstd level for snapshot compression.
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

fn default_connect_attempts() -> usize {
    3
}

fn default_true() -> bool {
    true
}

fn default_compression_threshold() -> usize {
    16 * 1024
}

fn default_compression_level() -> i32 {
    3
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            connect_attempts: default_connect_attempts(),
            compress_snapshots: true,
            compression_threshold: default_compression_threshold(),
            compression_level: default_compression_level(),
        }
    }
}

impl SessionConfig {
    pub fn for_testing() -> Self {
        Self {
            connect_timeout: "200ms".to_string(),
            connect_attempts: 2,
            ..Self::default()
        }
    }

    /// Parse `connect_timeout`, falling back to 10s on a malformed string.
    pub fn connect_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.connect_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Channel-open retry policy derived from these settings.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.connect_attempts.max(1),
            connection_timeout: self.connect_timeout_duration(),
            ..RetryConfig::default()
        }
    }

    /// Compression parameters for served snapshots, if enabled.
    pub fn compression(&self) -> Option<(usize, i32)> {
        self.compress_snapshots
            .then_some((self.compression_threshold, self.compression_level))
    }

    pub fn validate(&self) -> Result<()> {
        humantime::parse_duration(&self.connect_timeout).map_err(|e| {
            ReplicaError::Config(format!(
                "invalid connect_timeout {:?}: {}",
                self.connect_timeout, e
            ))
        })?;
        if self.connect_attempts == 0 {
            return Err(ReplicaError::Config(
                "connect_attempts must be at least 1".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ReplicaError::Config(format!(
                "compression_level {} out of range 1..=22",
                self.compression_level
            )));
        }
        Ok(())
    }
}
