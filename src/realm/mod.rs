// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Realm connection manager.
//!
//! Keeps this client connected to exactly the realms around its position.
//!
//! # Architecture
//!
//! 1. [`RealmManager::update_position`] snaps the position to a cell and, if
//!    the cell changed, posts a request into a single-slot queue.
//! 2. A worker task serves requests one at a time. Each request runs a
//!    transaction that connects the missing neighbors concurrently, then
//!    closes the realms that fell out of the neighborhood.
//! 3. A watcher per realm reports session failures back to the worker, which
//!    drops the realm and emits [`RealmEvent::Left`].
//!
//! Requests posted while a transaction runs overwrite each other; only the
//! latest is served next. [`RealmManager::settle`] waits until the latest
//! request at call time has been served.

mod aggregate;
mod grid;
mod transaction;
mod types;

pub use aggregate::{Aggregate, AggregateEntry, AggregateEvent};
pub use types::{ManagerState, Position, RealmCoord, RealmEvent, TransactionReport};

use crate::config::ReplicaConfig;
use crate::config::RealmConfig;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::Message;
use crate::session::{SessionContext, SyncSession};
use crate::store::StoreHandle;
use crate::transport::{Connector, MemoryConnector};
use crate::view::CollectionView;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use transaction::Fault;

/// Latest position request. `cell` is `None` until the first update.
#[derive(Debug, Clone, Copy, Default)]
struct Request {
    generation: u64,
    cell: Option<RealmCoord>,
}

#[derive(Debug, Default)]
struct Tracked {
    position: Option<Position>,
    cell: Option<RealmCoord>,
    generation: u64,
}

/// A connected realm.
struct Realm {
    coord: RealmCoord,
    serial: u64,
    store: StoreHandle,
    session: SyncSession,
    watcher: JoinHandle<()>,
}

impl Realm {
    fn close(self) {
        self.watcher.abort();
        self.session.close();
    }
}

/// State shared with the worker task.
struct Inner<C: Connector> {
    config: RealmConfig,
    connector: Arc<C>,
    ctx: SessionContext,
    realms: Mutex<BTreeMap<RealmCoord, Realm>>,
    aggregates: BTreeMap<String, Arc<Aggregate>>,
    events_tx: broadcast::Sender<RealmEvent>,
    completed_tx: watch::Sender<u64>,
    faults_tx: mpsc::UnboundedSender<Fault>,
    last_report: Mutex<Option<TransactionReport>>,
    next_serial: AtomicU64,
}

impl<C: Connector> Inner<C> {
    fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }
}

/// Maintains the set of connected realms around a moving position.
///
/// Generic over the [`Connector`] that opens realm channels.
pub struct RealmManager<C: Connector = MemoryConnector> {
    client_id: String,
    config: ReplicaConfig,
    inner: Arc<Inner<C>>,

    /// Manager state (broadcast to watchers)
    state_tx: watch::Sender<ManagerState>,
    state_rx: watch::Receiver<ManagerState>,

    tracked: Mutex<Tracked>,
    request_tx: watch::Sender<Request>,

    /// Taken by `start()`.
    pending: Option<(watch::Receiver<Request>, mpsc::UnboundedReceiver<Fault>)>,

    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Option<JoinHandle<()>>,
}

impl<C: Connector> RealmManager<C> {
    /// Create a manager whose sessions retry per `config.session`.
    ///
    /// The manager starts in `Created` state. Call [`start()`](Self::start)
    /// to begin serving position updates.
    pub fn new(config: ReplicaConfig, connector: Arc<C>) -> Self {
        let ctx = SessionContext::default().with_retry(config.session.retry_config());
        Self::with_context(config, connector, ctx)
    }

    /// Create a manager with explicit session collaborators.
    pub fn with_context(config: ReplicaConfig, connector: Arc<C>, ctx: SessionContext) -> Self {
        let (state_tx, state_rx) = watch::channel(ManagerState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (request_tx, request_rx) = watch::channel(Request::default());
        let (completed_tx, _) = watch::channel(0u64);
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.realm.event_capacity.max(1));

        let aggregates = config
            .realm
            .aggregate_collections
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    Arc::new(Aggregate::new(name.clone(), config.realm.event_capacity)),
                )
            })
            .collect();

        let inner = Arc::new(Inner {
            config: config.realm.clone(),
            connector,
            ctx,
            realms: Mutex::new(BTreeMap::new()),
            aggregates,
            events_tx,
            completed_tx,
            faults_tx,
            last_report: Mutex::new(None),
            next_serial: AtomicU64::new(1),
        });

        Self {
            client_id: config.client_id.clone(),
            config,
            inner,
            state_tx,
            state_rx,
            tracked: Mutex::new(Tracked::default()),
            request_tx,
            pending: Some((request_rx, faults_rx)),
            shutdown_tx,
            shutdown_rx,
            worker: None,
        }
    }

    /// Start the worker. Position updates posted before this are served
    /// as soon as it runs.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != ManagerState::Created {
            return Err(ReplicaError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }
        self.config.validate()?;

        let Some((requests, faults)) = self.pending.take() else {
            return Err(ReplicaError::Internal("worker channels already taken".to_string()));
        };

        info!(client_id = %self.client_id, "Starting realm manager");
        let span = info_span!("realm_manager", client_id = %self.client_id);
        self.worker = Some(tokio::spawn(
            transaction::run_worker(
                self.inner.clone(),
                requests,
                faults,
                self.shutdown_rx.clone(),
            )
            .instrument(span),
        ));

        let _ = self.state_tx.send(ManagerState::Running);
        metrics::set_manager_state("Running");
        Ok(())
    }

    /// Close every realm and stop the worker. An in-flight transaction is
    /// abandoned.
    pub async fn shutdown(&mut self) {
        if self.state() == ManagerState::Stopped {
            return;
        }
        info!(client_id = %self.client_id, "Shutting down realm manager");
        let _ = self.state_tx.send(ManagerState::ShuttingDown);
        metrics::set_manager_state("ShuttingDown");

        let _ = self.shutdown_tx.send(true);
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "Realm worker panicked during shutdown");
            }
        }

        let retracted: usize = self
            .inner
            .aggregates
            .values()
            .map(|aggregate| aggregate.detach_all())
            .sum();
        let realms = std::mem::take(&mut *self.inner.realms.lock());
        let count = realms.len();
        for realm in realms.into_values() {
            self.inner.release(realm);
        }
        if count > 0 {
            debug!(count, retracted, "Closed realms");
        }
        metrics::set_connected_realms(0);

        let _ = self.state_tx.send(ManagerState::Stopped);
        metrics::set_manager_state("Stopped");
        info!("Realm manager stopped");
    }

    /// Report a new position.
    ///
    /// Returns `true` if the containing cell changed and a transaction was
    /// queued. Non-finite positions and positions in the current cell are
    /// ignored.
    pub fn update_position(&self, position: Position, realm_size: u32) -> bool {
        if !position.is_finite() || realm_size == 0 {
            warn!(?position, realm_size, "Ignoring invalid position update");
            return false;
        }
        if matches!(
            self.state(),
            ManagerState::ShuttingDown | ManagerState::Stopped
        ) {
            return false;
        }

        let cell = RealmCoord::containing(position, realm_size);
        let mut tracked = self.tracked.lock();
        tracked.position = Some(position);
        if tracked.cell == Some(cell) {
            return false;
        }

        tracked.cell = Some(cell);
        tracked.generation += 1;
        self.request_tx.send_replace(Request {
            generation: tracked.generation,
            cell: Some(cell),
        });
        debug!(cell = %cell, generation = tracked.generation, "Queued realm transaction");
        true
    }

    /// [`update_position`](Self::update_position) with the configured realm size.
    pub fn move_to(&self, position: Position) -> bool {
        self.update_position(position, self.config.realm.realm_size)
    }

    /// Wait until the latest queued request has been served.
    pub async fn settle(&self) -> Result<()> {
        let target = self.tracked.lock().generation;
        let mut completed = self.inner.completed_tx.subscribe();
        if *completed.borrow() >= target {
            return Ok(());
        }
        if self.state() != ManagerState::Running {
            return Err(ReplicaError::InvalidState {
                expected: "Running".to_string(),
                actual: self.state().to_string(),
            });
        }

        let mut state_rx = self.state_rx.clone();
        tokio::select! {
            done = completed.wait_for(|generation| *generation >= target) => {
                done.map(|_| ()).map_err(|_| ReplicaError::Shutdown)
            }
            _ = state_rx.wait_for(|state| {
                matches!(state, ManagerState::ShuttingDown | ManagerState::Stopped)
            }) => Err(ReplicaError::Shutdown),
        }
    }

    pub fn state(&self) -> ManagerState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ManagerState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ManagerState::Running
    }

    pub fn config(&self) -> &ReplicaConfig {
        &self.config
    }

    pub fn connector(&self) -> &Arc<C> {
        &self.inner.connector
    }

    pub fn position(&self) -> Option<Position> {
        self.tracked.lock().position
    }

    /// Cell of the latest accepted position.
    pub fn current_cell(&self) -> Option<RealmCoord> {
        self.tracked.lock().cell
    }

    /// Realm membership events.
    pub fn subscribe(&self) -> broadcast::Receiver<RealmEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn connected(&self) -> Vec<RealmCoord> {
        self.inner.realms.lock().keys().copied().collect()
    }

    pub fn is_connected(&self, realm: RealmCoord) -> bool {
        self.inner.realms.lock().contains_key(&realm)
    }

    /// Store of a connected realm.
    pub fn realm_store(&self, realm: RealmCoord) -> Option<StoreHandle> {
        self.inner
            .realms
            .lock()
            .get(&realm)
            .map(|r| r.store.clone())
    }

    pub fn collection(&self, realm: RealmCoord, name: &str) -> Option<CollectionView> {
        self.realm_store(realm)
            .map(|store| CollectionView::new(store, name))
    }

    /// Send a locally-produced message on a realm's session.
    pub fn send(&self, realm: RealmCoord, message: &Message) -> Result<()> {
        let realms = self.inner.realms.lock();
        let Some(connected) = realms.get(&realm) else {
            return Err(ReplicaError::channel(realm.to_string(), "realm not connected"));
        };
        connected.session.send(message)
    }

    pub fn aggregate(&self, name: &str) -> Option<Arc<Aggregate>> {
        self.inner.aggregates.get(name).cloned()
    }

    /// Report of the most recently completed transaction.
    pub fn last_transaction(&self) -> Option<TransactionReport> {
        self.inner.last_report.lock().clone()
    }
}

impl<C: Connector> Drop for RealmManager<C> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}
