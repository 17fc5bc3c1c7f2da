// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replica engine.
//!
//! Errors are categorized by what they say about the two replicas involved.
//! A fatal error means the session that hit it can no longer trust its store
//! and must be torn down; the realm manager then treats the realm as left.
//!
//! # Error Categories
//!
//! | Error Type | Fatal | Description |
//! |------------|-------|-------------|
//! | `Channel` | Yes | Connect failed, or the link closed unexpectedly |
//! | `NotFound` | Yes | Remove/rollback/write target missing (replicas diverged) |
//! | `ProtocolViolation` | Yes | Malformed envelope or argument shape |
//! | `Codec` | Yes | Bytes could not be encoded or decoded |
//! | `Decompression` | Yes | Compressed snapshot is corrupt |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Lifecycle method called in the wrong state |
//! | `Shutdown` | No | Component is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! Losing an epoch comparison is **not** an error. It is reported as
//! [`WriteOutcome::Rejected`](crate::store::WriteOutcome::Rejected) and turned
//! into a rollback for the writer.

use thiserror::Error;

/// Result type alias for replica operations.
pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Errors that can occur while replicating realm state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    /// Channel open failed or the link dropped.
    ///
    /// Propagated to the realm manager, which treats the realm as
    /// never-joined (during connect) or abruptly-left (while active).
    #[error("Channel error ({realm}): {message}")]
    Channel { realm: String, message: String },

    /// Target of a remove, rollback or field write does not exist.
    ///
    /// On the wire this means the two replicas have diverged, either through
    /// a bug or a dropped message. Not recoverable within the session.
    #[error("Not found: {id}")]
    NotFound { id: String },

    /// Envelope or argument list has an unexpected shape.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Codec failed to encode or decode a value.
    #[error("Codec error: {0}")]
    Codec(String),

    /// zstd decompression of a snapshot failed.
    #[error("Decompression error: {0}")]
    Decompression(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Lifecycle violation (e.g. `start()` on a running manager).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicaError {
    /// Create a channel error for a realm or session name.
    pub fn channel(realm: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            realm: realm.into(),
            message: message.into(),
        }
    }

    /// Create a not-found error for an entity or collection id.
    pub fn not_found(id: impl Into<String>) -> Self {
        Self::NotFound { id: id.into() }
    }

    /// Check if this error must tear down the session that raised it.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Channel { .. } => true,
            Self::NotFound { .. } => true,
            Self::ProtocolViolation(_) => true,
            Self::Codec(_) => true,
            Self::Decompression(_) => true,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }

    /// Short label used for metrics and structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Channel { .. } => "channel",
            Self::NotFound { .. } => "not_found",
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::Codec(_) => "codec",
            Self::Decompression(_) => "decompression",
            Self::Config(_) => "config",
            Self::InvalidState { .. } => "invalid_state",
            Self::Shutdown => "shutdown",
            Self::Internal(_) => "internal",
        }
    }
}
