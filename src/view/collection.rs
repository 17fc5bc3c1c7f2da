// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Collection view.

use super::{MapView, SubscriptionGuard};
use crate::error::Result;
use crate::protocol::Message;
use crate::store::{StoreEvent, StoreHandle, Topic};
use crate::value::Fields;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// View over one named collection.
#[derive(Clone)]
pub struct CollectionView {
    store: StoreHandle,
    collection: String,
}

impl fmt::Debug for CollectionView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionView")
            .field("collection", &self.collection)
            .finish()
    }
}

impl CollectionView {
    pub fn new(store: StoreHandle, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    /// Member ids. Empty if the collection does not exist yet.
    pub fn ids(&self) -> Vec<String> {
        self.store
            .read()
            .members(&self.collection)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.store
            .read()
            .members(&self.collection)
            .map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every member's fields, epochs stripped, ordered by id.
    pub fn read_all(&self) -> Vec<(String, Fields)> {
        let store = self.store.read();
        let Some(members) = store.members(&self.collection) else {
            return Vec::new();
        };
        members
            .iter()
            .filter_map(|id| {
                store
                    .entity(id)
                    .map(|record| (id.clone(), record.read_all()))
            })
            .collect()
    }

    pub fn view(&self, id: impl Into<String>) -> MapView {
        MapView::new(self.store.clone(), self.collection.clone(), id)
    }

    /// Add an entity under a fresh random id.
    pub fn add(&self, fields: Fields) -> Result<(MapView, Message)> {
        self.add_at(Uuid::new_v4().to_string(), fields)
    }

    /// Add an entity under a caller-supplied id (e.g. when moving an entity
    /// between collections).
    pub fn add_at(&self, id: impl Into<String>, fields: Fields) -> Result<(MapView, Message)> {
        let id = id.into();
        self.store
            .write()
            .add_entity(&self.collection, &id, fields.clone())?;
        let message = Message::Add {
            collection: self.collection.clone(),
            entity: id.clone(),
            value: fields,
        };
        Ok((self.view(id), message))
    }

    /// Subscribe to members being added and removed.
    pub fn subscribe(&self) -> CollectionSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let ids = {
            let mut store = self.store.write();
            vec![
                store.subscribe(
                    Topic::Add {
                        collection: self.collection.clone(),
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
        CollectionSubscription {
            view: self.clone(),
            rx,
            guard: SubscriptionGuard::new(self.store.downgrade(), ids),
        }
    }
}

/// Notification from a [`CollectionSubscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent {
    Added(MapView),
    Removed(MapView),
    /// The store was re-imported; re-read the collection.
    Reloaded,
}

/// Live subscription to a collection. Unsubscribes on drop.
///
/// Holds a strong store handle so the `MapView`s it yields stay usable.
#[derive(Debug)]
pub struct CollectionSubscription {
    view: CollectionView,
    rx: mpsc::UnboundedReceiver<StoreEvent>,
    guard: SubscriptionGuard,
}

impl CollectionSubscription {
    fn translate(&self, event: StoreEvent) -> Option<CollectionEvent> {
        match event {
            StoreEvent::Added { entity, .. } => Some(CollectionEvent::Added(self.view.view(entity))),
            StoreEvent::Removed { entity, .. } => {
                Some(CollectionEvent::Removed(self.view.view(entity)))
            }
            StoreEvent::Imported => Some(CollectionEvent::Reloaded),
            StoreEvent::Updated { .. } => None,
        }
    }

    /// Wait for the next event. `None` once unsubscribed.
    pub async fn recv(&mut self) -> Option<CollectionEvent> {
        while self.guard.is_active() {
            let event = self.rx.recv().await?;
            if let Some(event) = self.translate(event) {
                return Some(event);
            }
        }
        None
    }

    pub fn try_recv(&mut self) -> Option<CollectionEvent> {
        while self.guard.is_active() {
            let event = self.rx.try_recv().ok()?;
            if let Some(event) = self.translate(event) {
                return Some(event);
            }
        }
        None
    }

    pub fn unsubscribe(&mut self) {
        self.guard.release();
    }

    pub fn collection(&self) -> &CollectionView {
        &self.view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::store::Store;
    use crate::value::{fields, Value};

    fn players() -> CollectionView {
        CollectionView::new(StoreHandle::new("test"), "players")
    }

    #[test]
    fn test_add_generates_unique_ids() {
        let players = players();
        let (a, msg_a) = players.add(fields([("hp", Value::Int(1))])).unwrap();
        let (b, _) = players.add(fields([("hp", Value::Int(2))])).unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(players.len(), 2);
        match msg_a {
            Message::Add {
                collection, entity, ..
            } => {
                assert_eq!(collection, "players");
                assert_eq!(entity, a.id());
            }
            other => panic!("expected ADD, got {:?}", other),
        }
    }

    #[test]
    fn test_add_at_preserves_id() {
        let players = players();
        let (view, _) = players.add_at("p1", fields([("hp", Value::Int(10))])).unwrap();
        assert_eq!(view.id(), "p1");
        assert_eq!(view.read_epoch("hp"), 0);
        assert_eq!(
            players.read_all(),
            vec![("p1".to_string(), fields([("hp", Value::Int(10))]))]
        );
    }

    #[test]
    fn test_read_all_of_missing_collection_is_empty() {
        assert!(players().read_all().is_empty());
        assert!(players().is_empty());
    }

    #[test]
    fn test_subscription_yields_map_views() {
        let players = players();
        let mut sub = players.subscribe();

        let (view, _) = players.add_at("p1", Fields::new()).unwrap();
        assert_eq!(sub.try_recv(), Some(CollectionEvent::Added(view.clone())));

        view.remove_local().unwrap();
        assert_eq!(sub.try_recv(), Some(CollectionEvent::Removed(view)));
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_field_updates_not_reported() {
        let players = players();
        let (view, _) = players.add_at("p1", Fields::new()).unwrap();
        let mut sub = players.subscribe();
        view.write_local("hp", 3).unwrap();
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_other_collection_not_reported() {
        let players = players();
        let items = CollectionView::new(players.view("x").store().clone(), "items");
        let mut sub = players.subscribe();
        items.add(Fields::new()).unwrap();
        assert_eq!(sub.try_recv(), None);
    }

    #[test]
    fn test_unsubscribe_one_of_two() {
        let players = players();
        let mut first = players.subscribe();
        let mut second = players.subscribe();
        first.unsubscribe();

        players.add_at("p1", Fields::new()).unwrap();

        assert_eq!(first.try_recv(), None);
        assert!(matches!(second.try_recv(), Some(CollectionEvent::Added(_))));
    }

    #[test]
    fn test_reimport_reloads_once() {
        let players = players();
        players.add_at("p1", Fields::new()).unwrap();
        let mut sub = players.subscribe();
        let empty = Store::new("empty").export_snapshot(&PostcardCodec).unwrap();

        players
            .view("p1")
            .store()
            .write()
            .import_snapshot(&PostcardCodec, &empty)
            .unwrap();

        assert_eq!(sub.try_recv(), Some(CollectionEvent::Reloaded));
        assert_eq!(sub.try_recv(), None);
        assert!(players.is_empty());
    }
}
