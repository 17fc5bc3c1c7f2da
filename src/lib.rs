//! # Realm Replica
//!
//! A client-side replica of partitioned world state, kept in sync with one
//! authoritative server per realm.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              realm-replica                                │
//! │                                                                           │
//! │  ┌──────────────┐    ┌─────────────┐    ┌──────────────────────────────┐  │
//! │  │ RealmManager │───►│ SyncSession │───►│ Store (epoch arbitration)    │  │
//! │  │ (3×3 cells)  │    │ (per realm) │    │ + MapView / CollectionView   │  │
//! │  └──────────────┘    └─────────────┘    └──────────────────────────────┘  │
//! │         │                   ▲                                             │
//! │         ▼                   │ Link (bytes)                                │
//! │  ┌──────────────┐    ┌─────────────┐                                      │
//! │  │ Aggregates   │    │ Authority   │  (one per realm, server side)        │
//! │  │ (cross-realm)│    │ arbitrates  │                                      │
//! │  └──────────────┘    └─────────────┘                                      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Write Path
//!
//! 1. A view produces a message (`MapView::write_local`) at `epoch + 1`.
//! 2. The session sends it to the realm's authority.
//! 3. The authority arbitrates: a strictly newer epoch wins and is
//!    broadcast; a loser gets a ROLLBACK carrying the current pair.
//! 4. Every replica applies the broadcast through the authoritative path.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use realm_replica::{MemoryConnector, Position, RealmManager, ReplicaConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = ReplicaConfig::default();
//!     let mut manager = RealmManager::new(config, Arc::new(MemoryConnector::default()));
//!     manager.start().await.expect("Failed to start");
//!
//!     manager.move_to(Position::new(4.0, 0.0, 4.0));
//!     manager.settle().await.expect("Failed to settle");
//!     assert_eq!(manager.connected().len(), 9);
//!
//!     manager.shutdown().await;
//! }
//! ```

pub mod authority;
pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod realm;
pub mod resilience;
pub mod save;
pub mod session;
pub mod store;
pub mod transport;
pub mod value;
pub mod view;

// Re-exports for convenience
pub use authority::{Authority, Verdict};
pub use codec::{Codec, PostcardCodec};
pub use config::{RealmConfig, ReplicaConfig, SessionConfig};
pub use error::{ReplicaError, Result};
pub use protocol::{Envelope, Message, Method};
pub use realm::{
    Aggregate, AggregateEvent, ManagerState, Position, RealmCoord, RealmEvent, RealmManager,
    TransactionReport,
};
pub use save::{NoOpSaveSink, SaveKeys, SaveSink};
pub use session::{SessionContext, SessionState, SyncSession};
pub use store::{Store, StoreEvent, StoreHandle, WriteOutcome};
pub use transport::{Connector, Link, MemoryConnector};
pub use value::{Fields, Value};
pub use view::{CollectionEvent, CollectionView, MapEvent, MapView};
