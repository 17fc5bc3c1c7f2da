// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cross-realm virtual collections.
//!
//! An [`Aggregate`] merges one named collection across every connected realm.
//! The realm manager attaches a realm's store when the realm joins and
//! detaches it when the realm leaves; detaching retracts every entity that
//! realm contributed.
//!
//! Members are keyed by `(realm, entity)`: the same entity id in two realms is
//! two members.
//!
//! Lock order is store, then source state. The realm table lock is never
//! held while either is taken.

use crate::realm::RealmCoord;
use crate::store::{Store, StoreEvent, StoreHandle, SubscriptionId, Topic, WeakStore};
use crate::value::{Fields, Value};
use crate::view::CollectionView;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Change to an aggregate's membership or a member's fields.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateEvent {
    Added {
        realm: RealmCoord,
        entity: String,
        fields: Fields,
    },
    Updated {
        realm: RealmCoord,
        entity: String,
        key: String,
        value: Value,
    },
    Removed {
        realm: RealmCoord,
        entity: String,
    },
}

/// One member as read from its realm's store.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateEntry {
    pub realm: RealmCoord,
    pub entity: String,
    pub fields: Fields,
}

#[derive(Debug, Default)]
struct SourceState {
    detached: bool,
    collection_subs: Vec<SubscriptionId>,
    members: BTreeMap<String, SubscriptionId>,
}

struct Source {
    store: StoreHandle,
    state: Arc<Mutex<SourceState>>,
    task: JoinHandle<()>,
}

/// Merges one collection across realms.
pub struct Aggregate {
    collection: String,
    events_tx: broadcast::Sender<AggregateEvent>,
    sources: Mutex<BTreeMap<RealmCoord, Source>>,
}

impl std::fmt::Debug for Aggregate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregate")
            .field("collection", &self.collection)
            .field("realms", &self.realms())
            .finish()
    }
}

impl Aggregate {
    pub fn new(collection: impl Into<String>, capacity: usize) -> Self {
        let (events_tx, _) = broadcast::channel(capacity.max(1));
        Self {
            collection: collection.into(),
            events_tx,
            sources: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.collection
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AggregateEvent> {
        self.events_tx.subscribe()
    }

    /// Start merging `store`'s collection. Current members are announced as
    /// `Added` immediately. Re-attaching a realm replaces its previous source.
    ///
    /// Must be called from within a tokio runtime.
    pub fn attach(&self, realm: RealmCoord, store: StoreHandle) {
        self.detach(realm);

        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(Mutex::new(SourceState::default()));
        {
            let mut s = store.write();
            let mut st = state.lock();
            st.collection_subs.push(s.subscribe(
                Topic::Add {
                    collection: self.collection.clone(),
                },
                tx.clone(),
            ));
            st.collection_subs.push(s.subscribe(
                Topic::Remove {
                    collection: self.collection.clone(),
                },
                tx.clone(),
            ));
            let current: Vec<String> = s
                .members(&self.collection)
                .map(|m| m.iter().cloned().collect())
                .unwrap_or_default();
            for entity in current {
                self.track(realm, &mut s, &mut st, &tx, entity);
            }
        }

        let forwarder = Forwarder {
            realm,
            collection: self.collection.clone(),
            store: store.downgrade(),
            state: state.clone(),
            tx,
            events_tx: self.events_tx.clone(),
        };
        let task = tokio::spawn(forwarder.run(rx));

        debug!(collection = %self.collection, realm = %realm, "Attached realm to aggregate");
        self.sources
            .lock()
            .insert(realm, Source { store, state, task });
    }

    /// Stop merging `realm` and retract everything it contributed.
    ///
    /// Returns the number of entities retracted.
    pub fn detach(&self, realm: RealmCoord) -> usize {
        let Some(source) = self.sources.lock().remove(&realm) else {
            return 0;
        };
        source.task.abort();

        let mut s = source.store.write();
        let mut st = source.state.lock();
        st.detached = true;
        for sub in st.collection_subs.drain(..) {
            s.unsubscribe(sub);
        }
        let members = std::mem::take(&mut st.members);
        for (entity, sub) in &members {
            s.unsubscribe(*sub);
            let _ = self.events_tx.send(AggregateEvent::Removed {
                realm,
                entity: entity.clone(),
            });
        }
        debug!(
            collection = %self.collection,
            realm = %realm,
            retracted = members.len(),
            "Detached realm from aggregate"
        );
        members.len()
    }

    /// Detach every realm.
    pub fn detach_all(&self) -> usize {
        self.realms().into_iter().map(|realm| self.detach(realm)).sum()
    }

    pub fn realms(&self) -> Vec<RealmCoord> {
        self.sources.lock().keys().copied().collect()
    }

    /// Current members as `(realm, entity)` pairs.
    pub fn members(&self) -> Vec<(RealmCoord, String)> {
        let states: Vec<_> = self
            .sources
            .lock()
            .iter()
            .map(|(realm, source)| (*realm, source.state.clone()))
            .collect();
        states
            .into_iter()
            .flat_map(|(realm, state)| {
                let ids: Vec<String> = state.lock().members.keys().cloned().collect();
                ids.into_iter().map(move |id| (realm, id))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sources
            .lock()
            .values()
            .map(|source| source.state.lock().members.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every member's current fields, read from the realm stores.
    pub fn read_all(&self) -> Vec<AggregateEntry> {
        let stores: Vec<_> = self
            .sources
            .lock()
            .iter()
            .map(|(realm, source)| (*realm, source.store.clone()))
            .collect();
        stores
            .into_iter()
            .flat_map(|(realm, store)| {
                CollectionView::new(store, self.collection.clone())
                    .read_all()
                    .into_iter()
                    .map(move |(entity, fields)| AggregateEntry {
                        realm,
                        entity,
                        fields,
                    })
            })
            .collect()
    }

    fn track(
        &self,
        realm: RealmCoord,
        store: &mut Store,
        state: &mut SourceState,
        tx: &mpsc::UnboundedSender<StoreEvent>,
        entity: String,
    ) {
        track_member(
            &self.collection,
            realm,
            store,
            state,
            tx,
            &self.events_tx,
            entity,
        );
    }
}

impl Drop for Aggregate {
    fn drop(&mut self) {
        for source in self.sources.get_mut().values() {
            source.task.abort();
        }
    }
}

fn track_member(
    collection: &str,
    realm: RealmCoord,
    store: &mut Store,
    state: &mut SourceState,
    tx: &mpsc::UnboundedSender<StoreEvent>,
    events_tx: &broadcast::Sender<AggregateEvent>,
    entity: String,
) {
    if state.members.contains_key(&entity) {
        return;
    }
    let sub = store.subscribe(
        Topic::Set {
            collection: collection.to_string(),
            entity: entity.clone(),
        },
        tx.clone(),
    );
    state.members.insert(entity.clone(), sub);
    let fields = store
        .entity(&entity)
        .map(|record| record.read_all())
        .unwrap_or_default();
    let _ = events_tx.send(AggregateEvent::Added {
        realm,
        entity,
        fields,
    });
}

fn untrack_member(
    realm: RealmCoord,
    store: &mut Store,
    state: &mut SourceState,
    events_tx: &broadcast::Sender<AggregateEvent>,
    entity: &str,
) {
    if let Some(sub) = state.members.remove(entity) {
        store.unsubscribe(sub);
        let _ = events_tx.send(AggregateEvent::Removed {
            realm,
            entity: entity.to_string(),
        });
    }
}

/// Per-realm task re-emitting store events as aggregate events.
struct Forwarder {
    realm: RealmCoord,
    collection: String,
    store: WeakStore,
    state: Arc<Mutex<SourceState>>,
    tx: mpsc::UnboundedSender<StoreEvent>,
    events_tx: broadcast::Sender<AggregateEvent>,
}

impl Forwarder {
    async fn run(self, mut rx: mpsc::UnboundedReceiver<StoreEvent>) {
        while let Some(event) = rx.recv().await {
            let Some(store) = self.store.upgrade() else {
                break;
            };
            let mut s = store.write();
            let mut st = self.state.lock();
            if st.detached {
                break;
            }
            self.handle(&mut s, &mut st, event);
        }
        trace!(collection = %self.collection, realm = %self.realm, "Aggregate forwarder exited");
    }

    fn handle(&self, s: &mut Store, st: &mut SourceState, event: StoreEvent) {
        match event {
            StoreEvent::Added { entity, .. } => self.track(s, st, entity),
            StoreEvent::Removed { entity, .. } => {
                untrack_member(self.realm, s, st, &self.events_tx, &entity)
            }
            StoreEvent::Updated {
                entity, key, value, ..
            } => {
                if st.members.contains_key(&entity) {
                    let _ = self.events_tx.send(AggregateEvent::Updated {
                        realm: self.realm,
                        entity,
                        key,
                        value,
                    });
                }
            }
            StoreEvent::Imported => self.resync(s, st),
        }
    }

    fn track(&self, s: &mut Store, st: &mut SourceState, entity: String) {
        track_member(
            &self.collection,
            self.realm,
            s,
            st,
            &self.tx,
            &self.events_tx,
            entity,
        );
    }

    /// After a re-import: retract members that vanished, announce new ones.
    fn resync(&self, s: &mut Store, st: &mut SourceState) {
        let current: Vec<String> = s
            .members(&self.collection)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        let gone: Vec<String> = st
            .members
            .keys()
            .filter(|id| !current.contains(id))
            .cloned()
            .collect();
        for entity in gone {
            untrack_member(self.realm, s, st, &self.events_tx, &entity);
        }
        for entity in current {
            self.track(s, st, entity);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::value::fields;
    use std::time::Duration;

    fn realm(x: i64) -> RealmCoord {
        RealmCoord {
            x,
            y: 0,
            z: 0,
            size: 16,
        }
    }

    fn store_with(entities: &[&str]) -> StoreHandle {
        let store = StoreHandle::new("test");
        for id in entities {
            store
                .write()
                .add_entity("players", id, fields([("hp", Value::Int(10))]))
                .unwrap();
        }
        store
    }

    async fn next(rx: &mut broadcast::Receiver<AggregateEvent>) -> AggregateEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("aggregate event timed out")
            .expect("aggregate channel closed")
    }

    #[tokio::test]
    async fn test_attach_announces_existing_members() {
        let aggregate = Aggregate::new("players", 16);
        let mut rx = aggregate.subscribe();
        aggregate.attach(realm(0), store_with(&["p1", "p2"]));

        assert!(matches!(next(&mut rx).await, AggregateEvent::Added { .. }));
        assert!(matches!(next(&mut rx).await, AggregateEvent::Added { .. }));
        assert_eq!(aggregate.len(), 2);
    }

    #[tokio::test]
    async fn test_merges_across_realms() {
        let aggregate = Aggregate::new("players", 16);
        aggregate.attach(realm(0), store_with(&["p1"]));
        aggregate.attach(realm(16), store_with(&["p1", "p2"]));

        assert_eq!(aggregate.len(), 3);
        assert_eq!(aggregate.read_all().len(), 3);
        assert_eq!(aggregate.realms(), vec![realm(0), realm(16)]);
    }

    #[tokio::test]
    async fn test_forwards_adds_updates_and_removes() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&[]);
        let mut rx = aggregate.subscribe();
        aggregate.attach(realm(0), store.clone());

        store
            .write()
            .add_entity("players", "p1", fields([("hp", Value::Int(1))]))
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Added {
                realm: realm(0),
                entity: "p1".to_string(),
                fields: fields([("hp", Value::Int(1))]),
            }
        );

        store
            .write()
            .apply_authoritative_write("players", "p1", "hp", 1, Value::Int(2))
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Updated {
                realm: realm(0),
                entity: "p1".to_string(),
                key: "hp".to_string(),
                value: Value::Int(2),
            }
        );

        store.write().remove_entity("players", "p1").unwrap();
        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Removed {
                realm: realm(0),
                entity: "p1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_detach_retracts_contributions() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&["p1", "p2"]);
        aggregate.attach(realm(0), store.clone());
        let mut rx = aggregate.subscribe();

        assert_eq!(aggregate.detach(realm(0)), 2);
        assert!(aggregate.is_empty());
        assert!(matches!(next(&mut rx).await, AggregateEvent::Removed { .. }));
        assert!(matches!(next(&mut rx).await, AggregateEvent::Removed { .. }));

        // Detached store has no aggregate subscribers left.
        let topic = Topic::Add {
            collection: "players".to_string(),
        };
        assert_eq!(store.read().subscriber_count(&topic), 0);
        assert_eq!(aggregate.detach(realm(0)), 0);
    }

    #[tokio::test]
    async fn test_other_collections_ignored() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&[]);
        aggregate.attach(realm(0), store.clone());
        store
            .write()
            .add_entity("items", "lamp", Fields::new())
            .unwrap();
        tokio::task::yield_now().await;
        assert!(aggregate.is_empty());
    }

    fn added(x: i64, entity: &str, hp: i64) -> AggregateEvent {
        AggregateEvent::Added {
            realm: realm(x),
            entity: entity.to_string(),
            fields: fields([("hp", Value::Int(hp))]),
        }
    }

    #[tokio::test]
    async fn test_reimport_of_same_state_is_silent() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&["p1"]);
        aggregate.attach(realm(0), store.clone());
        let mut rx = aggregate.subscribe();

        let snapshot = store.read().export_snapshot(&PostcardCodec).unwrap();
        store.write().import_snapshot(&PostcardCodec, &snapshot).unwrap();
        store.write().import_snapshot(&PostcardCodec, &snapshot).unwrap();

        // Marker add: anything emitted by the imports would arrive first.
        store
            .write()
            .add_entity("players", "p9", fields([("hp", Value::Int(9))]))
            .unwrap();
        assert_eq!(next(&mut rx).await, added(0, "p9", 9));
        assert!(rx.try_recv().is_err());
        assert_eq!(aggregate.len(), 2);
    }

    #[tokio::test]
    async fn test_import_then_add_announces_once() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&["p1"]);
        aggregate.attach(realm(0), store.clone());
        let mut rx = aggregate.subscribe();

        let empty = Store::new("empty").export_snapshot(&PostcardCodec).unwrap();
        {
            let mut s = store.write();
            s.import_snapshot(&PostcardCodec, &empty).unwrap();
            s.add_entity("players", "p2", fields([("hp", Value::Int(2))]))
                .unwrap();
        }

        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Removed {
                realm: realm(0),
                entity: "p1".to_string(),
            }
        );
        assert_eq!(next(&mut rx).await, added(0, "p2", 2));

        store
            .write()
            .add_entity("players", "p3", fields([("hp", Value::Int(3))]))
            .unwrap();
        assert_eq!(next(&mut rx).await, added(0, "p3", 3));
        assert!(rx.try_recv().is_err());
        assert_eq!(
            aggregate.members(),
            vec![(realm(0), "p2".to_string()), (realm(0), "p3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_import_swapping_members() {
        let aggregate = Aggregate::new("players", 16);
        let store = store_with(&["p1", "p2"]);
        aggregate.attach(realm(0), store.clone());
        let mut rx = aggregate.subscribe();

        let mut next_state = Store::new("next");
        for (id, hp) in [("p2", 10), ("p3", 30)] {
            next_state
                .add_entity("players", id, fields([("hp", Value::Int(hp))]))
                .unwrap();
        }
        let snapshot = next_state.export_snapshot(&PostcardCodec).unwrap();
        store.write().import_snapshot(&PostcardCodec, &snapshot).unwrap();

        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Removed {
                realm: realm(0),
                entity: "p1".to_string(),
            }
        );
        assert_eq!(next(&mut rx).await, added(0, "p3", 30));

        store
            .write()
            .apply_authoritative_write("players", "p3", "hp", 1, Value::Int(31))
            .unwrap();
        assert_eq!(
            next(&mut rx).await,
            AggregateEvent::Updated {
                realm: realm(0),
                entity: "p3".to_string(),
                key: "hp".to_string(),
                value: Value::Int(31),
            }
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(aggregate.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_all_retracts_every_realm() {
        let aggregate = Aggregate::new("players", 16);
        aggregate.attach(realm(0), store_with(&["p1"]));
        aggregate.attach(realm(16), store_with(&["p1", "p2"]));

        assert_eq!(aggregate.detach_all(), 3);
        assert!(aggregate.realms().is_empty());
        assert_eq!(aggregate.detach_all(), 0);
    }
}
