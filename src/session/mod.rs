// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync session: one channel's handshake and message loop.
//!
//! # State Transitions
//!
//! ```text
//! Connecting ──(open)──→ AwaitingImport ──(IMPORT)──→ Active ──(close)──→ Closed
//!     │                        │                         │
//!     │ (open failed)          │ (link closed)           │ (fatal error / link closed)
//!     ↓                        ↓                         ↓
//!  error returned        error returned               Failed
//! ```
//!
//! Channel open is retried per [`RetryConfig`] with a per-attempt timeout;
//! the IMPORT wait is not timed out. Once active, the loop runs as its own
//! task and stops at the first fatal error, recording it for
//! [`SyncSession::failure`].
//!
//! Outbound messages are encoded and handed to the link as-is. The session
//! never arbitrates; that happens upstream.

mod active;
mod handshake;

pub use active::apply_inbound;

use crate::codec::{Codec, PostcardCodec};
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::Message;
use crate::realm::RealmCoord;
use crate::resilience::RetryConfig;
use crate::save::{NoOpSaveSink, SaveSink};
use crate::store::StoreHandle;
use crate::transport::{Connector, Link};
use active::LoopContext;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info_span, Instrument};

/// State of a sync session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the channel to open.
    Connecting,
    /// Channel open; waiting for the first IMPORT.
    AwaitingImport,
    /// Applying inbound messages.
    Active,
    /// Closed explicitly. Further inbound messages are discarded.
    Closed,
    /// Stopped on a fatal error or an unexpected link close.
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::AwaitingImport => write!(f, "AwaitingImport"),
            SessionState::Active => write!(f, "Active"),
            SessionState::Closed => write!(f, "Closed"),
            SessionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Collaborators shared by every session of a manager.
#[derive(Clone)]
pub struct SessionContext {
    pub codec: Arc<dyn Codec>,
    pub save: Arc<dyn SaveSink>,
    pub retry: RetryConfig,
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            codec: Arc::new(PostcardCodec),
            save: Arc::new(NoOpSaveSink),
            retry: RetryConfig::default(),
        }
    }
}

impl SessionContext {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self {
            codec,
            ..Self::default()
        }
    }

    pub fn with_save_sink(mut self, save: Arc<dyn SaveSink>) -> Self {
        self.save = save;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

/// A live replica session for one channel.
pub struct SyncSession {
    name: String,
    store: StoreHandle,
    codec: Arc<dyn Codec>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    state_tx: Arc<watch::Sender<SessionState>>,
    state_rx: watch::Receiver<SessionState>,
    shutdown_tx: watch::Sender<bool>,
    failure: Arc<Mutex<Option<ReplicaError>>>,
    task: Option<JoinHandle<()>>,
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl SyncSession {
    /// Open a channel to `realm` and complete the handshake into `store`.
    ///
    /// Returns once the first IMPORT has been applied.
    pub async fn connect(
        realm: RealmCoord,
        connector: &dyn Connector,
        store: StoreHandle,
        ctx: SessionContext,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        let link = handshake::open_with_retry(connector, realm, &ctx.retry).await?;
        Self::establish(realm.to_string(), link, store, ctx, state_tx, state_rx).await
    }

    /// Run the handshake over an already-open link.
    pub async fn from_link(
        name: impl Into<String>,
        link: Link,
        store: StoreHandle,
        ctx: SessionContext,
    ) -> Result<Self> {
        let (state_tx, state_rx) = watch::channel(SessionState::Connecting);
        Self::establish(name.into(), link, store, ctx, state_tx, state_rx).await
    }

    async fn establish(
        name: String,
        link: Link,
        store: StoreHandle,
        ctx: SessionContext,
        state_tx: watch::Sender<SessionState>,
        state_rx: watch::Receiver<SessionState>,
    ) -> Result<Self> {
        let Link {
            outbound,
            mut inbound,
        } = link;
        let span = info_span!("session", realm = %name);

        state_tx.send_replace(SessionState::AwaitingImport);
        handshake::await_import(&name, &mut inbound, &store, ctx.codec.as_ref(), ctx.save.as_ref())
            .instrument(span.clone())
            .await?;
        state_tx.send_replace(SessionState::Active);

        let state_tx = Arc::new(state_tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let failure = Arc::new(Mutex::new(None));

        let task = tokio::spawn(
            active::run(LoopContext {
                scope: name.clone(),
                inbound,
                store: store.clone(),
                codec: ctx.codec.clone(),
                save: ctx.save,
                state_tx: state_tx.clone(),
                shutdown_rx,
                failure: failure.clone(),
            })
            .instrument(span),
        );

        Ok(Self {
            name,
            store,
            codec: ctx.codec,
            outbound: Mutex::new(Some(outbound)),
            state_tx,
            state_rx,
            shutdown_tx,
            failure,
            task: Some(task),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch state changes (used by the realm manager to detect failures).
    pub fn state_receiver(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// The error that stopped the loop, if it failed.
    pub fn failure(&self) -> Option<ReplicaError> {
        self.failure.lock().clone()
    }

    /// Encode and send a message upstream.
    pub fn send(&self, message: &Message) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Err(ReplicaError::channel(
                &self.name,
                format!("cannot send on {} session", state),
            ));
        }
        let bytes = message.encode(self.codec.as_ref())?;
        let len = bytes.len();
        let guard = self.outbound.lock();
        let tx = guard
            .as_ref()
            .ok_or_else(|| ReplicaError::channel(&self.name, "session closed"))?;
        tx.send(bytes)
            .map_err(|_| ReplicaError::channel(&self.name, "link closed"))?;
        metrics::record_message_sent(&self.name, message.method().as_str(), len);
        Ok(())
    }

    /// Close the channel. Inbound messages not yet applied are discarded.
    ///
    /// Idempotent. A failed session stays `Failed`.
    pub fn close(&self) {
        self.state_tx.send_if_modified(|state| {
            if state.is_terminal() {
                return false;
            }
            *state = SessionState::Closed;
            true
        });
        let _ = self.shutdown_tx.send(true);
        if self.outbound.lock().take().is_some() {
            debug!(realm = %self.name, "Session closed");
        }
    }

    /// Close and wait for the loop task to exit.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SyncSession {
    fn drop(&mut self) {
        self.close();
    }
}
