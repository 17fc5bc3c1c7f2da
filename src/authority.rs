// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Upstream arbiter for one realm.
//!
//! An [`Authority`] owns the arbitrating store for a realm. Each accepted
//! link first receives an IMPORT of the current snapshot, then has its
//! client writes arbitrated:
//!
//! | Inbound | Outcome |
//! |---|---|
//! | SET, epoch wins | stored, SET broadcast to every other peer |
//! | SET, epoch loses or ties | ROLLBACK with the stored pair, to the writer only |
//! | ADD | stored, broadcast to every other peer |
//! | REMOVE | stored, broadcast; missing target is ignored |
//! | IMPORT / ROLLBACK | ignored (clients do not send these) |
//! | sibling or malformed | ignored with a warning |
//!
//! Nothing a client sends can stop the authority. Peer bookkeeping and
//! arbitration share one lock so a newly accepted peer sees every write
//! exactly once: either in its snapshot or as a broadcast.

use crate::codec::Codec;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::Message;
use crate::save::{NoOpSaveSink, SaveSink};
use crate::store::{StoreHandle, WriteOutcome};
use crate::transport::Link;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, info_span, warn, Instrument};

/// Identifies a link accepted by an authority.
pub type PeerId = u64;

/// Decision for one inbound client message.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Applied; relay to every other peer.
    Broadcast(Message),
    /// Rejected; send this correction to the writer only.
    Reply(Message),
    /// Nothing to send.
    Ignore,
}

#[derive(Default)]
struct Peers {
    next_id: PeerId,
    links: BTreeMap<PeerId, UnboundedSender<Vec<u8>>>,
}

/// Arbitrating store plus its connected peers.
pub struct Authority {
    name: String,
    store: StoreHandle,
    codec: Arc<dyn Codec>,
    save: Arc<dyn SaveSink>,
    compression: Option<(usize, i32)>,
    peers: Mutex<Peers>,
}

impl Authority {
    pub fn new(name: impl Into<String>, codec: Arc<dyn Codec>) -> Self {
        let name = name.into();
        Self {
            store: StoreHandle::new(name.clone()),
            name,
            codec,
            save: Arc::new(NoOpSaveSink),
            compression: None,
            peers: Mutex::new(Peers::default()),
        }
    }

    pub fn with_save_sink(mut self, save: Arc<dyn SaveSink>) -> Self {
        self.save = save;
        self
    }

    /// Compress served snapshots: `(threshold_bytes, zstd_level)`.
    pub fn with_compression(mut self, compression: Option<(usize, i32)>) -> Self {
        self.compression = compression;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The arbitrating store. Seed it before accepting links, or use
    /// [`publish`](Self::publish) afterwards so peers hear about changes.
    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn peer_count(&self) -> usize {
        self.peers.lock().links.len()
    }

    /// Serve a new link: send it the current snapshot, then arbitrate
    /// whatever it sends until it closes.
    pub fn accept(self: &Arc<Self>, link: Link) -> Result<PeerId> {
        let Link {
            outbound,
            mut inbound,
        } = link;

        let id = {
            let mut peers = self.peers.lock();
            let snapshot = self.export()?;
            let import = Message::Import { snapshot }.encode(self.codec.as_ref())?;
            outbound
                .send(import)
                .map_err(|_| ReplicaError::channel(&self.name, "peer closed before import"))?;

            peers.next_id += 1;
            let id = peers.next_id;
            peers.links.insert(id, outbound);
            id
        };
        info!(authority = %self.name, peer = id, "Accepted peer");

        let authority = Arc::clone(self);
        let span = info_span!("authority_peer", authority = %self.name, peer = id);
        tokio::spawn(
            async move {
                while let Some(bytes) = inbound.recv().await {
                    authority.handle_inbound(id, &bytes);
                }
                authority.peers.lock().links.remove(&id);
                debug!("Peer link closed");
            }
            .instrument(span),
        );
        Ok(id)
    }

    /// Disconnect every peer.
    pub fn drop_all_peers(&self) -> usize {
        let mut peers = self.peers.lock();
        let count = peers.links.len();
        peers.links.clear();
        count
    }

    fn export(&self) -> Result<Vec<u8>> {
        let store = self.store.read();
        match self.compression {
            Some((threshold, level)) => {
                store.export_compressed(self.codec.as_ref(), threshold, level)
            }
            None => store.export_snapshot(self.codec.as_ref()),
        }
    }

    fn handle_inbound(&self, from: PeerId, bytes: &[u8]) {
        let message = match Message::decode(self.codec.as_ref(), bytes) {
            Ok(Some(message)) => message,
            Ok(None) => {
                metrics::record_message_ignored(&self.name, "sibling");
                return;
            }
            Err(e) => {
                warn!(peer = from, error = %e, "Dropping malformed message");
                metrics::record_error(&self.name, e.kind());
                return;
            }
        };

        let peers = self.peers.lock();
        match self.arbitrate(message) {
            Verdict::Broadcast(message) => {
                if let Err(e) = self.send_to_all(&peers, &message, Some(from)) {
                    warn!(peer = from, error = %e, "Broadcast failed");
                }
            }
            Verdict::Reply(message) => {
                if let Some(tx) = peers.links.get(&from) {
                    match message.encode(self.codec.as_ref()) {
                        Ok(bytes) => {
                            let _ = tx.send(bytes);
                        }
                        Err(e) => warn!(peer = from, error = %e, "Failed to encode reply"),
                    }
                }
            }
            Verdict::Ignore => {}
        }
    }

    /// Arbitrate one client message against the store.
    pub fn arbitrate(&self, message: Message) -> Verdict {
        let method = message.method();
        let save_keys = message.save_keys();
        let mut store = self.store.write();

        let verdict = match message {
            Message::Set {
                collection,
                entity,
                key,
                epoch,
                value,
            } => match store.apply_client_write(&collection, &entity, &key, epoch, value.clone()) {
                Ok(WriteOutcome::Accepted(_)) => Verdict::Broadcast(Message::Set {
                    collection,
                    entity,
                    key,
                    epoch,
                    value,
                }),
                Ok(WriteOutcome::Rejected {
                    epoch: current,
                    value: existing,
                }) => {
                    debug!(entity = %entity, key = %key, epoch, current, "Rejected write, rolling back");
                    return Verdict::Reply(Message::Rollback {
                        collection,
                        entity,
                        key,
                        epoch: current,
                        value: existing,
                    });
                }
                Err(e) => {
                    warn!(entity = %entity, key = %key, error = %e, "Ignoring write to unknown entity");
                    return Verdict::Ignore;
                }
            },
            Message::Add {
                collection,
                entity,
                value,
            } => match store.add_entity(&collection, &entity, value.clone()) {
                Ok(()) => Verdict::Broadcast(Message::Add {
                    collection,
                    entity,
                    value,
                }),
                Err(e) => {
                    warn!(collection = %collection, entity = %entity, error = %e, "Ignoring add");
                    return Verdict::Ignore;
                }
            },
            Message::Remove { collection, entity } => {
                match store.remove_entity(&collection, &entity) {
                    Ok(()) => Verdict::Broadcast(Message::Remove { collection, entity }),
                    Err(e) => {
                        warn!(collection = %collection, entity = %entity, error = %e, "Ignoring remove");
                        return Verdict::Ignore;
                    }
                }
            }
            Message::Import { .. } | Message::Rollback { .. } => {
                debug!(method = %method, "Ignoring upstream-only method from client");
                return Verdict::Ignore;
            }
        };

        drop(store);
        metrics::record_message_applied(&self.name, method.as_str());
        self.save.save(&self.name, save_keys);
        verdict
    }

    /// Apply a server-originated change and send it to every peer.
    ///
    /// Writes are authoritative: a SET is stored regardless of epoch.
    pub fn publish(&self, message: Message) -> Result<()> {
        let peers = self.peers.lock();
        {
            let mut store = self.store.write();
            match &message {
                Message::Set {
                    collection,
                    entity,
                    key,
                    epoch,
                    value,
                } => {
                    store.apply_authoritative_write(collection, entity, key, *epoch, value.clone())?;
                }
                Message::Add {
                    collection,
                    entity,
                    value,
                } => store.add_entity(collection, entity, value.clone())?,
                Message::Remove { collection, entity } => store.remove_entity(collection, entity)?,
                Message::Import { snapshot } => {
                    store.import_snapshot(self.codec.as_ref(), snapshot)?
                }
                Message::Rollback { .. } => {
                    return Err(ReplicaError::ProtocolViolation(
                        "ROLLBACK is addressed to a single writer".to_string(),
                    ))
                }
            }
        }
        self.save.save(&self.name, message.save_keys());
        self.send_to_all(&peers, &message, None)
    }

    fn send_to_all(&self, peers: &Peers, message: &Message, except: Option<PeerId>) -> Result<()> {
        let bytes = message.encode(self.codec.as_ref())?;
        for (id, tx) in &peers.links {
            if Some(*id) == except {
                continue;
            }
            // A closed peer is removed by its reader task.
            let _ = tx.send(bytes.clone());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::value::{fields, Value};

    fn authority() -> Arc<Authority> {
        let authority = Authority::new("test", Arc::new(PostcardCodec));
        authority
            .store()
            .write()
            .add_entity("players", "p1", fields([("hp", Value::Int(10))]))
            .unwrap();
        authority
            .store()
            .write()
            .apply_authoritative_write("players", "p1", "hp", 3, Value::Int(10))
            .unwrap();
        Arc::new(authority)
    }

    fn set(epoch: u64, value: i64) -> Message {
        Message::Set {
            collection: "players".to_string(),
            entity: "p1".to_string(),
            key: "hp".to_string(),
            epoch,
            value: Value::Int(value),
        }
    }

    #[test]
    fn test_tie_goes_to_first_writer() {
        let authority = authority();
        assert_eq!(authority.arbitrate(set(4, 9)), Verdict::Broadcast(set(4, 9)));
        assert_eq!(
            authority.arbitrate(set(4, 8)),
            Verdict::Reply(Message::Rollback {
                collection: "players".to_string(),
                entity: "p1".to_string(),
                key: "hp".to_string(),
                epoch: 4,
                value: Value::Int(9),
            })
        );
    }

    #[test]
    fn test_remove_missing_is_ignored() {
        let authority = authority();
        let verdict = authority.arbitrate(Message::Remove {
            collection: "monsters".to_string(),
            entity: "m1".to_string(),
        });
        assert_eq!(verdict, Verdict::Ignore);
    }

    #[test]
    fn test_client_rollback_is_ignored() {
        let authority = authority();
        let verdict = authority.arbitrate(Message::Rollback {
            collection: "players".to_string(),
            entity: "p1".to_string(),
            key: "hp".to_string(),
            epoch: 99,
            value: Value::Int(0),
        });
        assert_eq!(verdict, Verdict::Ignore);
        assert_eq!(authority.store().read().entity("p1").unwrap().epoch("hp"), 3);
    }

    #[tokio::test]
    async fn test_accept_sends_import_and_relays_to_others() {
        let authority = authority();
        let (mut a, a_server) = Link::pair();
        let (mut b, b_server) = Link::pair();
        authority.accept(a_server).unwrap();
        authority.accept(b_server).unwrap();
        assert_eq!(authority.peer_count(), 2);

        let codec = PostcardCodec;
        for link in [&mut a, &mut b] {
            let first = link.inbound.recv().await.unwrap();
            assert!(matches!(
                Message::decode(&codec, &first).unwrap(),
                Some(Message::Import { .. })
            ));
        }

        a.outbound.send(set(5, 1).encode(&codec).unwrap()).unwrap();
        let relayed = b.inbound.recv().await.unwrap();
        assert_eq!(Message::decode(&codec, &relayed).unwrap(), Some(set(5, 1)));

        // Writer does not get its own write echoed back.
        tokio::task::yield_now().await;
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_peer_removed_when_link_closes() {
        let authority = authority();
        let (client, server) = Link::pair();
        authority.accept(server).unwrap();
        drop(client);

        for _ in 0..50 {
            if authority.peer_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(authority.peer_count(), 0);
    }

    #[test]
    fn test_publish_rollback_rejected() {
        let authority = authority();
        let result = authority.publish(Message::Rollback {
            collection: "players".to_string(),
            entity: "p1".to_string(),
            key: "hp".to_string(),
            epoch: 1,
            value: Value::Null,
        });
        assert!(result.is_err());
    }
}
