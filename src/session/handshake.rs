// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Session handshake: open the channel, then wait for the first IMPORT.

use super::active::apply_inbound;
use crate::codec::Codec;
use crate::error::{ReplicaError, Result};
use crate::metrics;
use crate::protocol::Message;
use crate::realm::RealmCoord;
use crate::resilience::RetryConfig;
use crate::save::SaveSink;
use crate::store::StoreHandle;
use crate::transport::{Connector, Link};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

/// Open a link to `realm`, retrying per `retry`.
///
/// Each attempt is bounded by `retry.connection_timeout`.
pub(super) async fn open_with_retry(
    connector: &dyn Connector,
    realm: RealmCoord,
    retry: &RetryConfig,
) -> Result<Link> {
    let name = realm.to_string();
    let max_attempts = retry.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;

        let failure = match timeout(retry.connection_timeout, connector.open(realm)).await {
            Ok(Ok(link)) => {
                metrics::record_realm_connect(&name, true);
                if attempt > 1 {
                    info!(realm = %realm, attempt, "Opened channel after retry");
                } else {
                    debug!(realm = %realm, "Opened channel");
                }
                return Ok(link);
            }
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!(
                "timed out after {}ms",
                retry.connection_timeout.as_millis()
            ),
        };

        if attempt >= max_attempts {
            metrics::record_realm_connect(&name, false);
            error!(realm = %realm, attempt, error = %failure, "Failed to open channel");
            return Err(ReplicaError::channel(
                name,
                format!("open failed after {} attempts: {}", attempt, failure),
            ));
        }

        let delay = retry.delay_for_attempt(attempt);
        warn!(
            realm = %realm,
            attempt,
            delay_ms = delay.as_millis(),
            error = %failure,
            "Channel open failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}

/// Wait for the first IMPORT and apply it.
///
/// Replication messages that arrive first are discarded. Undecodable bytes
/// are fatal. There is no timeout: a server that never sends IMPORT stalls
/// this session until it is closed.
pub(super) async fn await_import(
    scope: &str,
    inbound: &mut UnboundedReceiver<Vec<u8>>,
    store: &StoreHandle,
    codec: &dyn Codec,
    save: &dyn SaveSink,
) -> Result<()> {
    loop {
        let Some(bytes) = inbound.recv().await else {
            return Err(ReplicaError::channel(scope, "closed before import"));
        };

        match Message::decode(codec, &bytes)? {
            Some(message @ Message::Import { .. }) => {
                let keys = apply_inbound(&mut store.write(), codec, message)?;
                save.save(scope, keys);
                return Ok(());
            }
            Some(other) => {
                trace!(scope, method = %other.method(), "Discarding message before import");
                metrics::record_message_ignored(scope, "before_import");
            }
            None => {
                metrics::record_message_ignored(scope, "sibling");
            }
        }
    }
}
