// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Typed views over a store.
//!
//! [`MapView`] projects one entity, [`CollectionView`] one collection. Views
//! are cheap handles; any number may exist over the same ids. Each
//! subscription owns its own channel and subscriber ids, and unsubscribes
//! when dropped, so views never interfere with each other.

mod collection;
mod map;

pub use collection::{CollectionEvent, CollectionSubscription, CollectionView};
pub use map::{MapEvent, MapSubscription, MapView};

use crate::store::{SubscriptionId, WeakStore};

/// Unsubscribes a set of bus subscriptions on drop.
#[derive(Debug)]
struct SubscriptionGuard {
    store: WeakStore,
    ids: Vec<SubscriptionId>,
}

impl SubscriptionGuard {
    fn new(store: WeakStore, ids: Vec<SubscriptionId>) -> Self {
        Self { store, ids }
    }

    /// Idempotent.
    fn release(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            let mut store = store.write();
            for id in self.ids.drain(..) {
                store.unsubscribe(id);
            }
        }
        self.ids.clear();
    }

    fn is_active(&self) -> bool {
        !self.ids.is_empty()
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
