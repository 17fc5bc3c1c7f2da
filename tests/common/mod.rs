//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - A save sink that records every call
//! - Realm coordinate helpers
//! - Manager construction over the in-memory connector
//! - Polling helpers for asynchronous effects

#![allow(dead_code)]

use parking_lot::Mutex;
use realm_replica::resilience::RetryConfig;
use realm_replica::{
    MemoryConnector, RealmCoord, RealmEvent, RealmManager, ReplicaConfig, SaveKeys, SaveSink,
    SessionContext,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub const REALM_SIZE: u32 = 16;

/// Records `(scope, keys)` for every save call.
#[derive(Default)]
pub struct RecordingSaveSink {
    calls: Mutex<Vec<(String, SaveKeys)>>,
}

impl RecordingSaveSink {
    pub fn calls(&self) -> Vec<(String, SaveKeys)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, scope: &str) -> Vec<SaveKeys> {
        self.calls
            .lock()
            .iter()
            .filter(|(s, _)| s == scope)
            .map(|(_, keys)| keys.clone())
            .collect()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

impl SaveSink for RecordingSaveSink {
    fn save(&self, scope: &str, keys: SaveKeys) {
        self.calls.lock().push((scope.to_string(), keys));
    }
}

/// Cell at grid indices `(i, k)` in the x/z plane.
pub fn cell(i: i64, k: i64) -> RealmCoord {
    RealmCoord {
        x: i * i64::from(REALM_SIZE),
        y: 0,
        z: k * i64::from(REALM_SIZE),
        size: REALM_SIZE,
    }
}

pub fn origin() -> RealmCoord {
    cell(0, 0)
}

/// Fast-failing session context.
pub fn test_context() -> SessionContext {
    SessionContext::default().with_retry(RetryConfig::testing())
}

/// A started manager over a fresh in-memory connector.
pub async fn started_manager(connector: Arc<MemoryConnector>) -> RealmManager {
    let mut manager = RealmManager::with_context(
        ReplicaConfig::for_testing("test-client"),
        connector,
        test_context(),
    );
    manager.start().await.expect("manager start");
    manager
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until<F: FnMut() -> bool>(mut condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Next realm event, failing the test after two seconds.
pub async fn next_event(rx: &mut broadcast::Receiver<RealmEvent>) -> RealmEvent {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("realm event timed out")
        .expect("realm event channel closed")
}

/// Every event currently buffered.
pub fn drain_events(rx: &mut broadcast::Receiver<RealmEvent>) -> Vec<RealmEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
