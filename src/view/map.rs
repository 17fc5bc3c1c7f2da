// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-entity view.

use super::SubscriptionGuard;
use crate::error::{ReplicaError, Result};
use crate::protocol::Message;
use crate::store::{StoreEvent, StoreHandle, Topic, WriteOutcome};
use crate::value::{Fields, Value};
use std::fmt;
use tokio::sync::mpsc;

/// View over one entity of a collection.
#[derive(Clone)]
pub struct MapView {
    store: StoreHandle,
    collection: String,
    entity: String,
}

impl fmt::Debug for MapView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MapView")
            .field("collection", &self.collection)
            .field("entity", &self.entity)
            .finish()
    }
}

impl PartialEq for MapView {
    fn eq(&self, other: &Self) -> bool {
        self.store.same_store(&other.store)
            && self.collection == other.collection
            && self.entity == other.entity
    }
}

impl MapView {
    pub fn new(
        store: StoreHandle,
        collection: impl Into<String>,
        entity: impl Into<String>,
    ) -> Self {
        Self {
            store,
            collection: collection.into(),
            entity: entity.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.entity
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn exists(&self) -> bool {
        self.store.read().entity(&self.entity).is_some()
    }

    /// All fields with epochs stripped.
    pub fn read_all(&self) -> Result<Fields> {
        self.store
            .read()
            .entity(&self.entity)
            .map(|record| record.read_all())
            .ok_or_else(|| ReplicaError::not_found(&self.entity))
    }

    pub fn read_key(&self, key: &str) -> Option<Value> {
        self.store
            .read()
            .entity(&self.entity)
            .and_then(|record| record.value(key).cloned())
    }

    /// Current epoch of `key`; 0 when the key or entity is absent.
    pub fn read_epoch(&self, key: &str) -> u64 {
        self.store
            .read()
            .entity(&self.entity)
            .map_or(0, |record| record.epoch(key))
    }

    /// Speculative local write at `current + 1`.
    ///
    /// Returns the SET message to transmit upstream. If the upstream loses
    /// the write to a concurrent one, a ROLLBACK later restores the winner.
    pub fn write_local(&self, key: &str, value: impl Into<Value>) -> Result<Message> {
        let value = value.into();
        let mut store = self.store.write();
        let epoch = store
            .entity(&self.entity)
            .ok_or_else(|| ReplicaError::not_found(&self.entity))?
            .epoch(key)
            + 1;

        match store.apply_client_write(&self.collection, &self.entity, key, epoch, value.clone())? {
            WriteOutcome::Accepted(_) => Ok(Message::Set {
                collection: self.collection.clone(),
                entity: self.entity.clone(),
                key: key.to_string(),
                epoch,
                value,
            }),
            // Unreachable under the write lock: current + 1 always wins.
            WriteOutcome::Rejected { epoch: current, .. } => Err(ReplicaError::Internal(format!(
                "local write to {}.{} at epoch {} rejected (current {})",
                self.entity, key, epoch, current
            ))),
        }
    }

    /// Remove this entity from its collection. Returns the REMOVE message.
    pub fn remove_local(&self) -> Result<Message> {
        self.store
            .write()
            .remove_entity(&self.collection, &self.entity)?;
        Ok(Message::Remove {
            collection: self.collection.clone(),
            entity: self.entity.clone(),
        })
    }

    /// Subscribe to updates and removal of this entity.
    pub fn subscribe(&self) -> MapSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = {
            let mut store = self.store.write();
            vec![
                store.subscribe(
                    Topic::Set {
                        collection: self.collection.clone(),
                        entity: self.entity.clone(),
                    },
                    tx.clone(),
                ),
                store.subscribe(
                    Topic::Remove {
                        collection: self.collection.clone(),
                    },
                    tx,
                ),
            ]
        };
        MapSubscription {
            entity: self.entity.clone(),
            rx,
            guard: SubscriptionGuard::new(self.store.downgrade(), ids),
        }
    }
}

/// Notification from a [`MapSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum MapEvent {
    /// A field changed (accepted write, authoritative write or rollback).
    Updated {
        key: String,
        epoch: u64,
        value: Value,
    },
    /// The entity was removed.
    Removed,
    /// The store was re-imported; re-read the entity.
    Reloaded,
}

/// Live subscription to one entity. Unsubscribes on drop.
#[derive(Debug)]
pub struct MapSubscription {
    entity: String,
    rx: mpsc::UnboundedReceiver<StoreEvent>,
    guard: SubscriptionGuard,
}

impl MapSubscription {
    fn translate(&self, event: StoreEvent) -> Option<MapEvent> {
        match event {
            StoreEvent::Updated {
                key, epoch, value, ..
            } => Some(MapEvent::Updated { key, epoch, value }),
            StoreEvent::Removed { entity, .. } if entity == self.entity => Some(MapEvent::Removed),
            StoreEvent::Imported => Some(MapEvent::Reloaded),
            _ => None,
        }
    }

    /// Wait for the next event. `None` once unsubscribed or the store is gone.
    pub async fn recv(&mut self) -> Option<MapEvent> {
        while self.guard.is_active() {
            let event = self.rx.recv().await?;
            if let Some(event) = self.translate(event) {
                return Some(event);
            }
        }
        None
    }

    /// Next already-delivered event, without waiting.
    pub fn try_recv(&mut self) -> Option<MapEvent> {
        while self.guard.is_active() {
            let event = self.rx.try_recv().ok()?;
            if let Some(event) = self.translate(event) {
                return Some(event);
            }
        }
        None
    }

    /// Stop receiving. Idempotent; other subscriptions are unaffected.
    pub fn unsubscribe(&mut self) {
        self.guard.release();
    }

    pub fn is_active(&self) -> bool {
        self.guard.is_active()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::value::fields;

    fn view() -> MapView {
        let store = StoreHandle::new("test");
        store
            .write()
            .add_entity("players", "p1", fields([("hp", Value::Int(10))]))
            .unwrap();
        MapView::new(store, "players", "p1")
    }

    #[test]
    fn test_reads() {
        let view = view();
        assert_eq!(view.read_all().unwrap(), fields([("hp", Value::Int(10))]));
        assert_eq!(view.read_key("hp"), Some(Value::Int(10)));
        assert_eq!(view.read_key("mana"), None);
        assert_eq!(view.read_epoch("hp"), 0);
        assert_eq!(view.read_epoch("mana"), 0);
    }

    #[test]
    fn test_write_local_bumps_epoch_and_returns_set() {
        let view = view();
        let msg = view.write_local("hp", 9).unwrap();
        assert_eq!(
            msg,
            Message::Set {
                collection: "players".to_string(),
                entity: "p1".to_string(),
                key: "hp".to_string(),
                epoch: 1,
                value: Value::Int(9),
            }
        );
        assert_eq!(view.read_epoch("hp"), 1);

        view.write_local("hp", 8).unwrap();
        assert_eq!(view.read_epoch("hp"), 2);
    }

    #[test]
    fn test_write_local_new_key_starts_at_one() {
        let view = view();
        view.write_local("mana", 3).unwrap();
        assert_eq!(view.read_epoch("mana"), 1);
    }

    #[test]
    fn test_write_local_missing_entity() {
        let view = MapView::new(StoreHandle::new("test"), "players", "ghost");
        assert!(matches!(
            view.write_local("hp", 1),
            Err(ReplicaError::NotFound { .. })
        ));
        assert!(view.read_all().is_err());
    }

    #[test]
    fn test_subscription_sees_updates_and_removal() {
        let view = view();
        let mut sub = view.subscribe();

        view.write_local("hp", 9).unwrap();
        assert_eq!(
            sub.try_recv(),
            Some(MapEvent::Updated {
                key: "hp".to_string(),
                epoch: 1,
                value: Value::Int(9)
            })
        );

        view.remove_local().unwrap();
        assert_eq!(sub.try_recv(), Some(MapEvent::Removed));
        assert!(!view.exists());
    }

    #[test]
    fn test_removal_of_sibling_is_filtered() {
        let view = view();
        view.store()
            .write()
            .add_entity("players", "p2", Fields::new())
            .unwrap();
        let mut sub = view.subscribe();

        MapView::new(view.store().clone(), "players", "p2")
            .remove_local()
            .unwrap();

        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_independent_subscriptions() {
        let view = view();
        let mut a = view.subscribe();
        let mut b = MapView::new(view.store().clone(), "players", "p1").subscribe();

        a.unsubscribe();
        a.unsubscribe();
        view.write_local("hp", 1).unwrap();

        assert_eq!(a.try_recv(), None);
        assert!(matches!(b.try_recv(), Some(MapEvent::Updated { .. })));
    }

    #[test]
    fn test_drop_unsubscribes() {
        let view = view();
        let topic = Topic::Set {
            collection: "players".to_string(),
            entity: "p1".to_string(),
        };
        let sub = view.subscribe();
        assert_eq!(view.store().read().subscriber_count(&topic), 1);
        drop(sub);
        assert_eq!(view.store().read().subscriber_count(&topic), 0);
    }

    #[tokio::test]
    async fn test_recv_ends_when_store_dropped() {
        let store = StoreHandle::new("test");
        store
            .write()
            .add_entity("players", "p1", Fields::new())
            .unwrap();
        let mut sub = MapView::new(store.clone(), "players", "p1").subscribe();
        drop(store);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_reimport_reloads_once() {
        let view = view();
        let mut sub = view.subscribe();
        let snapshot = view.store().read().export_snapshot(&PostcardCodec).unwrap();

        view.store()
            .write()
            .import_snapshot(&PostcardCodec, &snapshot)
            .unwrap();

        assert_eq!(sub.try_recv(), Some(MapEvent::Reloaded));
        assert_eq!(sub.try_recv(), None);
    }
}
