// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Messages applied per method
//! - Arbitration outcomes and rollbacks
//! - Snapshot sizes
//! - Realm membership and transaction timing
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replica_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use realm_replica::metrics;
//! use std::time::Duration;
//!
//! metrics::record_message_applied("realm:0,0,0@16", "SET");
//! metrics::record_transaction(Duration::from_millis(12), 3, 3);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Message Metrics
// =============================================================================

/// Record an inbound message applied to a store.
pub fn record_message_applied(scope: &str, method: &str) {
    counter!(
        "replica_messages_applied_total",
        "scope" => scope.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
}

/// Record an inbound message skipped (sibling protocol, or received before import).
pub fn record_message_ignored(scope: &str, reason: &str) {
    counter!(
        "replica_messages_ignored_total",
        "scope" => scope.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record an outbound message handed to a link.
pub fn record_message_sent(scope: &str, method: &str, bytes: usize) {
    counter!(
        "replica_messages_sent_total",
        "scope" => scope.to_string(),
        "method" => method.to_string()
    )
    .increment(1);
    counter!("replica_bytes_sent_total", "scope" => scope.to_string()).increment(bytes as u64);
}

// =============================================================================
// Arbitration Metrics
// =============================================================================

/// Record a client write arbitration outcome.
pub fn record_arbitration(scope: &str, accepted: bool) {
    let outcome = if accepted { "accepted" } else { "rejected" };
    counter!(
        "replica_arbitrations_total",
        "scope" => scope.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a rollback applied to a replica.
pub fn record_rollback_applied(scope: &str) {
    counter!("replica_rollbacks_applied_total", "scope" => scope.to_string()).increment(1);
}

// =============================================================================
// Snapshot Metrics
// =============================================================================

/// Record a snapshot import and its encoded size.
pub fn record_snapshot_imported(scope: &str, bytes: usize) {
    counter!("replica_snapshots_imported_total", "scope" => scope.to_string()).increment(1);
    histogram!("replica_snapshot_import_bytes", "scope" => scope.to_string()).record(bytes as f64);
}

/// Record a snapshot export and its encoded size (after compression).
pub fn record_snapshot_exported(scope: &str, bytes: usize) {
    counter!("replica_snapshots_exported_total", "scope" => scope.to_string()).increment(1);
    histogram!("replica_snapshot_export_bytes", "scope" => scope.to_string()).record(bytes as f64);
}

// =============================================================================
// Realm Metrics
// =============================================================================

/// Record a realm connect attempt outcome.
pub fn record_realm_connect(realm: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "replica_realm_connects_total",
        "realm" => realm.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a realm dropped because its session failed.
pub fn record_realm_fault(realm: &str, error_type: &str) {
    counter!(
        "replica_realm_faults_total",
        "realm" => realm.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for number of connected realms.
pub fn set_connected_realms(count: usize) {
    gauge!("replica_connected_realms").set(count as f64);
}

/// Record one membership transaction.
pub fn record_transaction(duration: Duration, joined: usize, left: usize) {
    histogram!("replica_transaction_duration_seconds").record(duration.as_secs_f64());
    counter!("replica_realms_joined_total").increment(joined as u64);
    counter!("replica_realms_left_total").increment(left as u64);
}

/// Record an error by kind.
pub fn record_error(scope: &str, error_type: &str) {
    counter!(
        "replica_errors_total",
        "scope" => scope.to_string(),
        "error_type" => error_type.to_string()
    )
    .increment(1);
}

/// Gauge for realm manager state.
pub fn set_manager_state(state: &str) {
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "ShuttingDown" => 2.0,
        "Stopped" => 3.0,
        _ => -1.0,
    };
    gauge!("replica_manager_state").set(value);
}
