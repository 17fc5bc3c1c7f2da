// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Membership transactions.
//!
//! The worker task owns every change to the realm table. Position requests
//! arrive through a watch channel, so only the latest one is ever pending.
//! Faults from realm watchers are handled between transactions.

use super::{Inner, Realm, RealmCoord, RealmEvent, Request, TransactionReport};
use crate::metrics;
use crate::session::SyncSession;
use crate::store::StoreHandle;
use crate::transport::Connector;
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// A realm whose session failed, tagged with the instance that failed.
#[derive(Debug, Clone, Copy)]
pub(super) struct Fault {
    pub realm: RealmCoord,
    pub serial: u64,
}

/// Serve position requests and faults until shutdown.
pub(super) async fn run_worker<C: Connector>(
    inner: Arc<Inner<C>>,
    mut requests: watch::Receiver<Request>,
    mut faults: mpsc::UnboundedReceiver<Fault>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!("Realm worker started");

    loop {
        tokio::select! {
            biased;

            _ = shutdown_rx.changed() => {
                debug!("Realm worker received shutdown signal");
                break;
            }

            Some(fault) = faults.recv() => {
                inner.handle_fault(fault);
            }

            changed = requests.changed() => {
                if changed.is_err() {
                    break;
                }
                let request = *requests.borrow_and_update();
                let Some(cell) = request.cell else {
                    continue;
                };

                tokio::select! {
                    biased;

                    _ = shutdown_rx.changed() => {
                        debug!(generation = request.generation, "Transaction abandoned for shutdown");
                        break;
                    }

                    report = inner.run_transaction(request.generation, cell) => {
                        *inner.last_report.lock() = Some(report);
                        inner.completed_tx.send_replace(request.generation);
                    }
                }
            }
        }
    }

    info!("Realm worker stopped");
}

impl<C: Connector> Inner<C> {
    /// Bring the connected set to exactly the neighborhood of `cell`.
    ///
    /// Missing realms are connected concurrently and inserted only after
    /// every attempt has finished, so an abandoned transaction leaves the
    /// table untouched.
    pub(super) async fn run_transaction(
        &self,
        generation: u64,
        cell: RealmCoord,
    ) -> TransactionReport {
        let started = Instant::now();
        let wanted: BTreeSet<RealmCoord> =
            cell.neighborhood(self.config.radius).into_iter().collect();

        let missing: Vec<RealmCoord> = {
            let realms = self.realms.lock();
            wanted
                .iter()
                .filter(|coord| !realms.contains_key(coord))
                .copied()
                .collect()
        };

        for coord in &missing {
            self.emit(RealmEvent::Connecting(*coord));
        }

        let attempts = join_all(missing.iter().map(|coord| self.open_realm(*coord))).await;

        let mut report = TransactionReport {
            generation,
            ..TransactionReport::default()
        };

        for (coord, attempt) in missing.iter().zip(attempts) {
            match attempt {
                Ok(realm) => {
                    for aggregate in self.aggregates.values() {
                        aggregate.attach(*coord, realm.store.clone());
                    }
                    self.realms.lock().insert(*coord, realm);
                    self.emit(RealmEvent::Joined(*coord));
                    report.joined.push(*coord);
                }
                Err(e) => {
                    warn!(realm = %coord, error = %e, "Realm connect failed");
                    metrics::record_realm_fault(&coord.to_string(), e.kind());
                    self.emit(RealmEvent::ConnectFailed(*coord));
                    report.failed.push(*coord);
                }
            }
        }

        let extras: Vec<Realm> = {
            let mut realms = self.realms.lock();
            let stale: Vec<RealmCoord> = realms
                .keys()
                .filter(|coord| !cell.is_near(coord, self.config.radius))
                .copied()
                .collect();
            stale
                .into_iter()
                .filter_map(|coord| realms.remove(&coord))
                .collect()
        };

        for realm in extras {
            let coord = realm.coord;
            self.release(realm);
            report.left.push(coord);
        }

        let connected = self.realms.lock().len();
        metrics::record_transaction(started.elapsed(), report.joined.len(), report.left.len());
        metrics::set_connected_realms(connected);

        info!(
            generation,
            cell = %cell,
            joined = report.joined.len(),
            left = report.left.len(),
            failed = report.failed.len(),
            connected,
            "Transaction complete"
        );
        report
    }

    /// Connect one realm into a fresh store and watch it for failure.
    async fn open_realm(&self, coord: RealmCoord) -> crate::error::Result<Realm> {
        let store = StoreHandle::new(coord.to_string());
        let session =
            SyncSession::connect(coord, self.connector.as_ref(), store.clone(), self.ctx.clone())
                .await?;

        let serial = self.next_serial();
        let mut state_rx = session.state_receiver();
        let faults = self.faults_tx.clone();
        let watcher = tokio::spawn(async move {
            let failed = matches!(
                state_rx.wait_for(|state| state.is_terminal()).await.map(|s| *s),
                Ok(crate::session::SessionState::Failed)
            );
            if failed {
                let _ = faults.send(Fault {
                    realm: coord,
                    serial,
                });
            }
        });

        Ok(Realm {
            coord,
            serial,
            store,
            session,
            watcher,
        })
    }

    /// Drop a failed realm if it is still the instance that failed.
    pub(super) fn handle_fault(&self, fault: Fault) {
        let realm = {
            let mut realms = self.realms.lock();
            match realms.get(&fault.realm) {
                Some(realm) if realm.serial == fault.serial => realms.remove(&fault.realm),
                _ => None,
            }
        };
        let Some(realm) = realm else {
            debug!(realm = %fault.realm, "Ignoring fault for a realm no longer connected");
            return;
        };

        let kind = realm
            .session
            .failure()
            .map(|e| e.kind())
            .unwrap_or("unknown");
        warn!(realm = %fault.realm, kind, "Realm session failed, dropping realm");
        metrics::record_realm_fault(&fault.realm.to_string(), kind);

        self.release(realm);
        metrics::set_connected_realms(self.realms.lock().len());
    }

    /// Detach aggregates, close the session, and announce the departure.
    pub(super) fn release(&self, realm: Realm) {
        let coord = realm.coord;
        for aggregate in self.aggregates.values() {
            aggregate.detach(coord);
        }
        realm.close();
        self.emit(RealmEvent::Left(coord));
    }

    pub(super) fn emit(&self, event: RealmEvent) {
        let _ = self.events_tx.send(event);
    }
}
