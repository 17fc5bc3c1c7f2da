// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed publish/subscribe over store topics.

use crate::value::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// Address of a stream of store events.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// Field writes to one entity of a collection.
    Set { collection: String, entity: String },
    /// Entities added to a collection.
    Add { collection: String },
    /// Entities removed from a collection.
    Remove { collection: String },
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Set { collection, entity } => write!(f, "set:{}:{}", collection, entity),
            Topic::Add { collection } => write!(f, "add:{}", collection),
            Topic::Remove { collection } => write!(f, "remove:{}", collection),
        }
    }
}

/// A change applied to a store.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A field was written (accepted, authoritative, or rolled back).
    Updated {
        collection: String,
        entity: String,
        key: String,
        epoch: u64,
        value: Value,
    },
    Added { collection: String, entity: String },
    Removed { collection: String, entity: String },
    /// The whole namespace was replaced by a snapshot. Delivered to every
    /// subscriber, who should re-read what they project.
    Imported,
}

impl StoreEvent {
    /// Topic this event is published on; `None` for broadcast events.
    pub fn topic(&self) -> Option<Topic> {
        match self {
            StoreEvent::Updated {
                collection, entity, ..
            } => Some(Topic::Set {
                collection: collection.clone(),
                entity: entity.clone(),
            }),
            StoreEvent::Added { collection, .. } => Some(Topic::Add {
                collection: collection.clone(),
            }),
            StoreEvent::Removed { collection, .. } => Some(Topic::Remove {
                collection: collection.clone(),
            }),
            StoreEvent::Imported => None,
        }
    }
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub#{}", self.0)
    }
}

/// Explicit subscriber table.
///
/// Each subscription owns its sender; several subscriptions may share one
/// receiver by cloning the sender (used by aggregates).
#[derive(Debug, Default)]
pub(crate) struct Bus {
    next_id: u64,
    by_topic: HashMap<Topic, BTreeMap<SubscriptionId, UnboundedSender<StoreEvent>>>,
    index: HashMap<SubscriptionId, Topic>,
}

impl Bus {
    pub(crate) fn subscribe(
        &mut self,
        topic: Topic,
        sender: UnboundedSender<StoreEvent>,
    ) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.by_topic
            .entry(topic.clone())
            .or_default()
            .insert(id, sender);
        self.index.insert(id, topic);
        id
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub(crate) fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(topic) = self.index.remove(&id) else {
            return false;
        };
        if let Some(subs) = self.by_topic.get_mut(&topic) {
            subs.remove(&id);
            if subs.is_empty() {
                self.by_topic.remove(&topic);
            }
        }
        true
    }

    pub(crate) fn publish(&mut self, event: &StoreEvent) {
        let mut dead = Vec::new();
        match event.topic() {
            Some(topic) => {
                if let Some(subs) = self.by_topic.get(&topic) {
                    for (id, tx) in subs {
                        if tx.send(event.clone()).is_err() {
                            dead.push(*id);
                        }
                    }
                }
            }
            None => {
                // Once per channel, however many topics it listens on.
                let mut delivered: Vec<&UnboundedSender<StoreEvent>> = Vec::new();
                for subs in self.by_topic.values() {
                    for (id, tx) in subs {
                        if delivered.iter().any(|seen| seen.same_channel(tx)) {
                            continue;
                        }
                        if tx.send(event.clone()).is_err() {
                            dead.push(*id);
                        } else {
                            delivered.push(tx);
                        }
                    }
                }
            }
        }
        for id in dead {
            tracing::trace!(subscription = %id, "Pruning closed subscriber");
            self.unsubscribe(id);
        }
    }

    pub(crate) fn subscriber_count(&self, topic: &Topic) -> usize {
        self.by_topic.get(topic).map_or(0, BTreeMap::len)
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }
}
