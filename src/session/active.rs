// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Active message loop.
//!
//! Inbound messages are already arbitrated upstream, so every write goes
//! through the authoritative path. One message is fully applied (store
//! mutation plus event fan-out) before the next is read.

use super::SessionState;
use crate::codec::Codec;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::Message;
use crate::save::{SaveKeys, SaveSink};
use crate::store::{Store, StoreHandle};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Apply one inbound replication message to a store.
///
/// Returns the keys the save hook should receive.
///
/// # Errors
///
/// - REMOVE from a collection that does not exist: `ProtocolViolation`.
/// - SET or ROLLBACK for an entity that does not exist: `NotFound`.
///
/// Both mean this replica has diverged from upstream.
pub fn apply_inbound(store: &mut Store, codec: &dyn Codec, message: Message) -> Result<SaveKeys> {
    let keys = message.save_keys();
    let method = message.method();

    match message {
        Message::Import { snapshot } => store.import_snapshot(codec, &snapshot)?,
        Message::Set {
            collection,
            entity,
            key,
            epoch,
            value,
        } => {
            store.apply_authoritative_write(&collection, &entity, &key, epoch, value)?;
        }
        Message::Add {
            collection,
            entity,
            value,
        } => store.add_entity(&collection, &entity, value)?,
        Message::Remove { collection, entity } => {
            store
                .remove_entity(&collection, &entity)
                .map_err(|e| match e {
                    ReplicaError::NotFound { id } => ReplicaError::ProtocolViolation(format!(
                        "REMOVE of {} from missing collection {}",
                        entity, id
                    )),
                    other => other,
                })?
        }
        Message::Rollback {
            collection,
            entity,
            key,
            epoch,
            value,
        } => {
            store.rollback(&collection, &entity, &key, epoch, value)?;
        }
    }

    metrics::record_message_applied(store.scope(), method.as_str());
    Ok(keys)
}

/// Everything the loop task owns.
pub(super) struct LoopContext {
    pub scope: String,
    pub inbound: UnboundedReceiver<Vec<u8>>,
    pub store: StoreHandle,
    pub codec: Arc<dyn Codec>,
    pub save: Arc<dyn SaveSink>,
    pub state_tx: Arc<watch::Sender<SessionState>>,
    pub shutdown_rx: watch::Receiver<bool>,
    pub failure: Arc<Mutex<Option<ReplicaError>>>,
}

impl LoopContext {
    fn handle(&self, bytes: &[u8]) -> Result<()> {
        let Some(message) = Message::decode(self.codec.as_ref(), bytes)? else {
            metrics::record_message_ignored(&self.scope, "sibling");
            return Ok(());
        };
        let keys = apply_inbound(&mut self.store.write(), self.codec.as_ref(), message)?;
        self.save.save(&self.scope, keys);
        Ok(())
    }

    fn fail(&self, err: ReplicaError) {
        error!(error = %err, kind = err.kind(), "Session failed");
        metrics::record_error(&self.scope, err.kind());
        *self.failure.lock() = Some(err);
        self.state_tx.send_if_modified(|state| {
            if *state == SessionState::Closed {
                return false;
            }
            *state = SessionState::Failed;
            true
        });
    }

    fn is_closing(&self) -> bool {
        *self.shutdown_rx.borrow()
    }
}

/// Run until closed or a fatal error.
pub(super) async fn run(mut ctx: LoopContext) {
    info!("Session active");

    loop {
        tokio::select! {
            biased;

            changed = ctx.shutdown_rx.changed() => {
                if changed.is_err() || *ctx.shutdown_rx.borrow() {
                    debug!("Session closed, discarding further inbound messages");
                    break;
                }
            }

            next = ctx.inbound.recv() => {
                match next {
                    Some(bytes) => {
                        if ctx.is_closing() {
                            break;
                        }
                        if let Err(e) = ctx.handle(&bytes) {
                            ctx.fail(e);
                            break;
                        }
                    }
                    None => {
                        if !ctx.is_closing() {
                            ctx.fail(ReplicaError::channel(&ctx.scope, "link closed unexpectedly"));
                        }
                        break;
                    }
                }
            }
        }
    }
}
