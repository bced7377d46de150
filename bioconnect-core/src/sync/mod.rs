//! Offline-first replication of locally enrolled identities.
//!
//! Mutations are appended to a durable queue in the same transaction that
//! changes the local store. A single [`SyncEngine`] task drains the queue
//! against the [`RemoteDirectory`] whenever connectivity returns or a sync
//! is requested.

pub mod config;
pub mod engine;
pub mod models;
pub mod network;
pub mod queue;
pub mod remote;

pub use config::SyncConfig;
pub use engine::{SyncEngine, SyncHandle};
pub use models::{
    EngineState, ErrorKind, SyncAction, SyncErrorRecord, SyncQueueItem, SyncStatus,
};
pub use network::NetworkMonitor;
pub use queue::SyncQueue;
pub use remote::{HttpDirectory, IdentityFields, RemoteDirectory, RemoteError};
