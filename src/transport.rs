// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transport seam.
//!
//! The engine assumes one ordered, reliable duplex message channel per realm
//! and does not implement reliability itself. A [`Link`] is that channel as
//! seen by one end; a [`Connector`] opens links to realms.
//!
//! [`MemoryConnector`] serves every realm from an in-process [`Authority`],
//! for tests and single-process hosts.
//!
//! # Example
//!
//! ```rust,no_run
//! use realm_replica::transport::{BoxFuture, Connector, Link};
//! use realm_replica::realm::RealmCoord;
//!
//! struct WebSocketConnector { /* ... */ }
//!
//! impl Connector for WebSocketConnector {
//!     fn open(&self, realm: RealmCoord) -> BoxFuture<'_, Link> {
//!         Box::pin(async move {
//!             let (ours, theirs) = Link::pair();
//!             // bridge `theirs` to a socket for `realm` ...
//!             # drop((theirs, realm));
//!             Ok(ours)
//!         })
//!     }
//! }
//! ```

use crate::authority::Authority;
use crate::codec::{Codec, PostcardCodec};
use crate::config::SessionConfig;
use crate::error::{ReplicaError, Result};
use crate::realm::RealmCoord;
use crate::save::{NoOpSaveSink, SaveSink};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// One end of an ordered duplex byte channel.
#[derive(Debug)]
pub struct Link {
    pub outbound: mpsc::UnboundedSender<Vec<u8>>,
    pub inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Link {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair() -> (Link, Link) {
        let (a_tx, a_rx) = mpsc::unbounded_channel();
        let (b_tx, b_rx) = mpsc::unbounded_channel();
        (
            Link {
                outbound: a_tx,
                inbound: b_rx,
            },
            Link {
                outbound: b_tx,
                inbound: a_rx,
            },
        )
    }
}

/// Opens links to realms.
pub trait Connector: Send + Sync + 'static {
    /// Open a channel to `realm`. An error means the channel never opened.
    fn open(&self, realm: RealmCoord) -> BoxFuture<'_, Link>;
}

/// In-process connector with one [`Authority`] per realm.
///
/// Authorities are created on first use. Realms can be marked unreachable to
/// simulate connect failures, and links can be torn down to simulate drops.
pub struct MemoryConnector {
    codec: Arc<dyn Codec>,
    save: Arc<dyn SaveSink>,
    session: SessionConfig,
    authorities: Mutex<HashMap<RealmCoord, Arc<Authority>>>,
    unreachable: Mutex<HashSet<RealmCoord>>,
    open_delay: Option<Duration>,
    opens: AtomicUsize,
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new(Arc::new(PostcardCodec))
    }
}

impl MemoryConnector {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            save: Arc::new(NoOpSaveSink),
            session: SessionConfig::default(),
            authorities: Mutex::new(HashMap::new()),
            unreachable: Mutex::new(HashSet::new()),
            open_delay: None,
            opens: AtomicUsize::new(0),
        }
    }

    /// Save sink handed to every authority this connector creates.
    pub fn with_save_sink(mut self, save: Arc<dyn SaveSink>) -> Self {
        self.save = save;
        self
    }

    /// Snapshot compression settings for created authorities.
    pub fn with_session_config(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    /// Delay every open, to widen race windows in tests.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = Some(delay);
        self
    }

    /// The authority serving `realm`, created if needed.
    pub fn authority(&self, realm: RealmCoord) -> Arc<Authority> {
        self.authorities
            .lock()
            .entry(realm)
            .or_insert_with(|| {
                let authority = Authority::new(realm.to_string(), self.codec.clone())
                    .with_save_sink(self.save.clone())
                    .with_compression(self.session.compression());
                Arc::new(authority)
            })
            .clone()
    }

    /// Existing authority for `realm`, without creating one.
    pub fn existing_authority(&self, realm: RealmCoord) -> Option<Arc<Authority>> {
        self.authorities.lock().get(&realm).cloned()
    }

    pub fn set_unreachable(&self, realm: RealmCoord, unreachable: bool) {
        let mut set = self.unreachable.lock();
        if unreachable {
            set.insert(realm);
        } else {
            set.remove(&realm);
        }
    }

    /// Total successful and failed open attempts.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::Acquire)
    }
}

impl Connector for MemoryConnector {
    fn open(&self, realm: RealmCoord) -> BoxFuture<'_, Link> {
        Box::pin(async move {
            self.opens.fetch_add(1, Ordering::AcqRel);
            if let Some(delay) = self.open_delay {
                tokio::time::sleep(delay).await;
            }
            if self.unreachable.lock().contains(&realm) {
                return Err(ReplicaError::channel(realm.to_string(), "realm unreachable"));
            }

            let (client, server) = Link::pair();
            self.authority(realm).accept(server)?;
            debug!(realm = %realm, "Opened in-memory link");
            Ok(client)
        })
    }
}
