// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicated store.
//!
//! One flat namespace keyed by id, where each [`Slot`] is either an entity
//! record or a collection membership set. Writes come in two flavours:
//!
//! - **Client writes** ([`Store::apply_client_write`]) are arbitrated: the
//!   write wins only if its epoch is strictly greater than the stored one.
//!   Ties go to the existing value, so replaying an already-applied write is
//!   rejected rather than re-emitted.
//! - **Authoritative writes** ([`Store::apply_authoritative_write`],
//!   [`Store::rollback`]) come from an upstream that already arbitrated and
//!   are stored unconditionally.
//!
//! Every mutation publishes a [`StoreEvent`] on a typed [`Topic`].
//!
//! # Sharing
//!
//! The store itself is single-threaded. [`StoreHandle`] wraps it in one
//! `parking_lot::RwLock` so a session and any number of views can share it;
//! every mutation (and its event fan-out) happens inside the write lock.

mod bus;
mod record;

pub use bus::{StoreEvent, SubscriptionId, Topic};
pub use record::{EntityRecord, Field, Slot};

use crate::codec::{maybe_compress, maybe_decompress, Codec};
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::value::{Fields, Value};
use bus::Bus;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Result of a non-authoritative write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome {
    /// The write won and was stored.
    Accepted(StoreEvent),
    /// The write lost. Carries the stored pair so the caller can roll the
    /// writer back to it.
    Rejected { epoch: u64, value: Value },
}

impl WriteOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, WriteOutcome::Accepted(_))
    }
}

/// Replicated entity store.
pub struct Store {
    scope: String,
    slots: BTreeMap<String, Slot>,
    bus: Bus,
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("scope", &self.scope)
            .field("slots", &self.slots.len())
            .field("subscriptions", &self.bus.len())
            .finish()
    }
}

impl Store {
    /// Create an empty store. `scope` labels logs, metrics and save calls.
    pub fn new(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            slots: BTreeMap::new(),
            bus: Bus::default(),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    // =========================================================================
    // Raw namespace access
    // =========================================================================

    pub fn get(&self, id: &str) -> Option<&Slot> {
        self.slots.get(id)
    }

    /// Overwrite a slot without arbitration or events.
    pub fn set(&mut self, id: impl Into<String>, slot: Slot) -> Option<Slot> {
        self.slots.insert(id.into(), slot)
    }

    pub fn entity(&self, id: &str) -> Option<&EntityRecord> {
        self.slots.get(id).and_then(Slot::as_entity)
    }

    pub fn members(&self, collection: &str) -> Option<&BTreeSet<String>> {
        self.slots.get(collection).and_then(Slot::as_collection)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Membership entries whose entity record is missing, as
    /// `(collection, entity)` pairs. Empty for a consistent store.
    pub fn dangling_members(&self) -> Vec<(String, String)> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.as_collection().map(|m| (name, m)))
            .flat_map(|(name, members)| {
                members
                    .iter()
                    .filter(|id| self.entity(id).is_none())
                    .map(move |id| (name.clone(), id.clone()))
            })
            .collect()
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Replace the whole namespace with a decoded snapshot.
    ///
    /// zstd-compressed snapshots are detected and decompressed. The snapshot
    /// is fully parsed before anything is replaced, so a corrupt snapshot
    /// leaves the store untouched.
    pub fn import_snapshot(&mut self, codec: &dyn Codec, bytes: &[u8]) -> Result<()> {
        let raw = maybe_decompress(bytes)?;
        let root = codec
            .decode(&raw)?
            .into_map()
            .ok_or_else(|| ReplicaError::ProtocolViolation("snapshot is not a map".to_string()))?;

        let slots = root
            .into_iter()
            .map(|(id, value)| Slot::from_value(&id, value).map(|slot| (id, slot)))
            .collect::<Result<BTreeMap<_, _>>>()?;

        debug!(
            scope = %self.scope,
            slots = slots.len(),
            bytes = bytes.len(),
            "Imported snapshot"
        );
        metrics::record_snapshot_imported(&self.scope, bytes.len());
        self.slots = slots;
        self.bus.publish(&StoreEvent::Imported);
        Ok(())
    }

    /// The namespace as a snapshot value.
    pub fn snapshot_value(&self) -> Value {
        Value::Map(
            self.slots
                .iter()
                .map(|(id, slot)| (id.clone(), slot.to_value()))
                .collect(),
        )
    }

    /// Encode the whole namespace.
    pub fn export_snapshot(&self, codec: &dyn Codec) -> Result<Vec<u8>> {
        let bytes = codec.encode(&self.snapshot_value())?;
        metrics::record_snapshot_exported(&self.scope, bytes.len());
        Ok(bytes)
    }

    /// Encode the whole namespace, zstd-compressing it when it is at least
    /// `threshold` bytes.
    pub fn export_compressed(
        &self,
        codec: &dyn Codec,
        threshold: usize,
        level: i32,
    ) -> Result<Vec<u8>> {
        let raw = codec.encode(&self.snapshot_value())?;
        let bytes = maybe_compress(raw, threshold, level)?;
        metrics::record_snapshot_exported(&self.scope, bytes.len());
        Ok(bytes)
    }

    // =========================================================================
    // Writes
    // =========================================================================

    fn entity_mut(&mut self, entity: &str) -> Result<&mut EntityRecord> {
        match self.slots.get_mut(entity) {
            Some(Slot::Entity(record)) => Ok(record),
            _ => Err(ReplicaError::not_found(entity)),
        }
    }

    /// Arbitrated write: stored only if `epoch` is strictly greater than the
    /// current epoch for `key`.
    pub fn apply_client_write(
        &mut self,
        collection: &str,
        entity: &str,
        key: &str,
        epoch: u64,
        value: Value,
    ) -> Result<WriteOutcome> {
        let record = self.entity_mut(entity)?;
        let current = record.epoch(key);
        if epoch <= current {
            let existing = record.value(key).cloned().unwrap_or_default();
            trace!(entity, key, epoch, current, "Client write lost arbitration");
            metrics::record_arbitration(&self.scope, false);
            return Ok(WriteOutcome::Rejected {
                epoch: current,
                value: existing,
            });
        }

        record.put(key, Field::new(epoch, value.clone()));
        metrics::record_arbitration(&self.scope, true);
        let event = self.publish_update(collection, entity, key, epoch, value);
        Ok(WriteOutcome::Accepted(event))
    }

    /// Unconditional write of an already-arbitrated value.
    ///
    /// Returns `None` when the field already holds this exact pair; nothing is
    /// emitted in that case.
    pub fn apply_authoritative_write(
        &mut self,
        collection: &str,
        entity: &str,
        key: &str,
        epoch: u64,
        value: Value,
    ) -> Result<Option<StoreEvent>> {
        let record = self.entity_mut(entity)?;
        if record.field(key) == Some(&Field::new(epoch, value.clone())) {
            return Ok(None);
        }
        record.put(key, Field::new(epoch, value.clone()));
        Ok(Some(self.publish_update(collection, entity, key, epoch, value)))
    }

    /// Force a field to the authoritative pair carried by a rollback.
    ///
    /// Emits the same event as an accepted write.
    pub fn rollback(
        &mut self,
        collection: &str,
        entity: &str,
        key: &str,
        epoch: u64,
        value: Value,
    ) -> Result<StoreEvent> {
        let record = self.entity_mut(entity)?;
        record.put(key, Field::new(epoch, value.clone()));
        metrics::record_rollback_applied(&self.scope);
        Ok(self.publish_update(collection, entity, key, epoch, value))
    }

    /// Insert an entity with every field at epoch 0 and add it to
    /// `collection`, creating the collection if needed.
    pub fn add_entity(&mut self, collection: &str, id: &str, initial: Fields) -> Result<()> {
        if id == collection || matches!(self.slots.get(id), Some(Slot::Collection(_))) {
            return Err(ReplicaError::ProtocolViolation(format!(
                "`{}` is a collection, not an entity",
                id
            )));
        }
        let members = match self
            .slots
            .entry(collection.to_string())
            .or_insert_with(|| Slot::Collection(BTreeSet::new()))
        {
            Slot::Collection(members) => members,
            Slot::Entity(_) => {
                return Err(ReplicaError::ProtocolViolation(format!(
                    "`{}` is an entity, not a collection",
                    collection
                )))
            }
        };
        members.insert(id.to_string());
        self.slots
            .insert(id.to_string(), Slot::Entity(EntityRecord::from_initial(initial)));

        self.bus.publish(&StoreEvent::Added {
            collection: collection.to_string(),
            entity: id.to_string(),
        });
        Ok(())
    }

    /// Delete an entity record and its membership in `collection`.
    ///
    /// Fails with `NotFound` if the collection does not exist.
    pub fn remove_entity(&mut self, collection: &str, id: &str) -> Result<()> {
        match self.slots.get_mut(collection) {
            Some(Slot::Collection(members)) => {
                members.remove(id);
            }
            _ => return Err(ReplicaError::not_found(collection)),
        }
        if matches!(self.slots.get(id), Some(Slot::Entity(_))) {
            self.slots.remove(id);
        }

        self.bus.publish(&StoreEvent::Removed {
            collection: collection.to_string(),
            entity: id.to_string(),
        });
        Ok(())
    }

    fn publish_update(
        &mut self,
        collection: &str,
        entity: &str,
        key: &str,
        epoch: u64,
        value: Value,
    ) -> StoreEvent {
        let event = StoreEvent::Updated {
            collection: collection.to_string(),
            entity: entity.to_string(),
            key: key.to_string(),
            epoch,
            value,
        };
        self.bus.publish(&event);
        event
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    pub fn subscribe(
        &mut self,
        topic: Topic,
        sender: UnboundedSender<StoreEvent>,
    ) -> SubscriptionId {
        self.bus.subscribe(topic, sender)
    }

    /// Idempotent: returns false if `id` was not subscribed.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.bus.unsubscribe(id)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.bus.subscriber_count(topic)
    }
}

/// Shared, lock-protected store.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<RwLock<Store>>,
}

impl StoreHandle {
    pub fn new(scope: impl Into<String>) -> Self {
        Self::from_store(Store::new(scope))
    }

    pub fn from_store(store: Store) -> Self {
        Self {
            inner: Arc::new(RwLock::new(store)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Store> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, Store> {
        self.inner.write()
    }

    pub fn downgrade(&self) -> WeakStore {
        WeakStore(Arc::downgrade(&self.inner))
    }

    pub fn same_store(&self, other: &StoreHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.read().fmt(f)
    }
}

/// Non-owning store reference held by subscriptions.
#[derive(Clone, Debug, Default)]
pub struct WeakStore(Weak<RwLock<Store>>);

impl WeakStore {
    pub fn upgrade(&self) -> Option<StoreHandle> {
        self.0.upgrade().map(|inner| StoreHandle { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::value::fields;
    use tokio::sync::mpsc;

    fn store_with_p1() -> Store {
        let mut store = Store::new("test");
        store
            .add_entity("players", "p1", fields([("hp", Value::Int(10))]))
            .unwrap();
        store
    }

    #[test]
    fn test_client_write_strictly_greater_wins() {
        let mut store = store_with_p1();
        let outcome = store
            .apply_client_write("players", "p1", "hp", 1, Value::Int(9))
            .unwrap();
        assert!(outcome.is_accepted());
        assert_eq!(store.entity("p1").unwrap().epoch("hp"), 1);
    }

    #[test]
    fn test_client_write_tie_loses() {
        let mut store = store_with_p1();
        store
            .apply_client_write("players", "p1", "hp", 4, Value::Int(9))
            .unwrap();
        let outcome = store
            .apply_client_write("players", "p1", "hp", 4, Value::Int(8))
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Rejected {
                epoch: 4,
                value: Value::Int(9)
            }
        );
        assert_eq!(store.entity("p1").unwrap().value("hp"), Some(&Value::Int(9)));
    }

    #[test]
    fn test_client_write_absent_key_rejects_with_null() {
        let mut store = store_with_p1();
        let outcome = store
            .apply_client_write("players", "p1", "mana", 0, Value::Int(5))
            .unwrap();
        assert_eq!(
            outcome,
            WriteOutcome::Rejected {
                epoch: 0,
                value: Value::Null
            }
        );
    }

    #[test]
    fn test_client_write_missing_entity_not_found() {
        let mut store = Store::new("test");
        let err = store
            .apply_client_write("players", "ghost", "hp", 1, Value::Int(1))
            .unwrap_err();
        assert_eq!(err, ReplicaError::not_found("ghost"));
    }

    #[test]
    fn test_authoritative_write_is_idempotent() {
        let mut store = store_with_p1();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(
            Topic::Set {
                collection: "players".to_string(),
                entity: "p1".to_string(),
            },
            tx,
        );

        let first = store
            .apply_authoritative_write("players", "p1", "hp", 5, Value::Int(1))
            .unwrap();
        let second = store
            .apply_authoritative_write("players", "p1", "hp", 5, Value::Int(1))
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_authoritative_write_ignores_epoch_order() {
        let mut store = store_with_p1();
        store
            .apply_authoritative_write("players", "p1", "hp", 9, Value::Int(1))
            .unwrap();
        store
            .apply_authoritative_write("players", "p1", "hp", 2, Value::Int(2))
            .unwrap();
        let record = store.entity("p1").unwrap();
        assert_eq!(record.epoch("hp"), 2);
        assert_eq!(record.value("hp"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_rollback_requires_entity() {
        let mut store = Store::new("test");
        assert!(matches!(
            store.rollback("players", "p1", "hp", 1, Value::Int(1)),
            Err(ReplicaError::NotFound { .. })
        ));
    }

    #[test]
    fn test_add_creates_collection_and_emits() {
        let mut store = Store::new("test");
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(
            Topic::Add {
                collection: "players".to_string(),
            },
            tx,
        );

        store
            .add_entity("players", "p1", fields([("hp", Value::Int(10))]))
            .unwrap();

        assert!(store.members("players").unwrap().contains("p1"));
        assert_eq!(
            rx.try_recv().unwrap(),
            StoreEvent::Added {
                collection: "players".to_string(),
                entity: "p1".to_string()
            }
        );
    }

    #[test]
    fn test_add_into_entity_slot_rejected() {
        let mut store = store_with_p1();
        assert!(matches!(
            store.add_entity("p1", "x", Fields::new()),
            Err(ReplicaError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_add_over_collection_slot_rejected() {
        let mut store = store_with_p1();
        store
            .add_entity("items", "lamp", Fields::new())
            .unwrap();
        let before = store.snapshot_value();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(
            Topic::Add {
                collection: "players".to_string(),
            },
            tx,
        );

        for (collection, id) in [("players", "items"), ("players", "players")] {
            assert!(matches!(
                store.add_entity(collection, id, Fields::new()),
                Err(ReplicaError::ProtocolViolation(_))
            ));
        }

        assert_eq!(store.snapshot_value(), before);
        assert!(store.members("items").unwrap().contains("lamp"));
        assert!(rx.try_recv().is_err());
        assert!(store.dangling_members().is_empty());
    }

    #[test]
    fn test_remove_deletes_record_and_membership() {
        let mut store = store_with_p1();
        store.remove_entity("players", "p1").unwrap();
        assert!(store.entity("p1").is_none());
        assert!(store.members("players").unwrap().is_empty());
        assert!(store.dangling_members().is_empty());
    }

    #[test]
    fn test_remove_from_missing_collection_not_found() {
        let mut store = store_with_p1();
        assert_eq!(
            store.remove_entity("monsters", "p1").unwrap_err(),
            ReplicaError::not_found("monsters")
        );
        assert!(store.entity("p1").is_some());
    }

    #[test]
    fn test_snapshot_round_trip() {
        let mut store = store_with_p1();
        store
            .apply_client_write("players", "p1", "hp", 3, Value::Int(7))
            .unwrap();
        let bytes = store.export_snapshot(&PostcardCodec).unwrap();

        let mut fresh = Store::new("fresh");
        fresh.import_snapshot(&PostcardCodec, &bytes).unwrap();

        assert_eq!(fresh.entity("p1"), store.entity("p1"));
        assert_eq!(fresh.members("players"), store.members("players"));
    }

    #[test]
    fn test_compressed_snapshot_round_trip() {
        let mut store = Store::new("big");
        for i in 0..200 {
            store
                .add_entity(
                    "items",
                    &format!("item-{}", i),
                    fields([("label", Value::from("the same label every time"))]),
                )
                .unwrap();
        }
        let bytes = store.export_compressed(&PostcardCodec, 64, 3).unwrap();
        let plain = store.export_snapshot(&PostcardCodec).unwrap();
        assert!(bytes.len() < plain.len());

        let mut fresh = Store::new("fresh");
        fresh.import_snapshot(&PostcardCodec, &bytes).unwrap();
        assert_eq!(fresh.members("items").unwrap().len(), 200);
    }

    #[test]
    fn test_corrupt_snapshot_leaves_store_untouched() {
        let mut store = store_with_p1();
        let bad = PostcardCodec.encode(&Value::Int(3)).unwrap();
        assert!(store.import_snapshot(&PostcardCodec, &bad).is_err());
        assert!(store.entity("p1").is_some());
    }

    #[test]
    fn test_import_publishes_imported() {
        let mut store = store_with_p1();
        let bytes = store.export_snapshot(&PostcardCodec).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        store.subscribe(
            Topic::Remove {
                collection: "players".to_string(),
            },
            tx,
        );
        store.import_snapshot(&PostcardCodec, &bytes).unwrap();
        assert_eq!(rx.try_recv().unwrap(), StoreEvent::Imported);
    }

    #[test]
    fn test_weak_store_does_not_keep_store_alive() {
        let handle = StoreHandle::new("test");
        let weak = handle.downgrade();
        assert!(weak.upgrade().is_some());
        drop(handle);
        assert!(weak.upgrade().is_none());
    }
}
