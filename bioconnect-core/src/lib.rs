//! BioConnect Core Library
//!
//! Offline-first worker enrollment and identification:
//! - Local SQLite store of enrolled identities and their face templates
//! - 1:N identification against the enrolled set with a tunable threshold
//! - Append-only queue of pending mutations, replicated to a remote
//!   directory by a single background sync engine once connectivity returns

pub mod biometric;
pub mod clock;
pub mod config;
pub mod database;
pub mod pipeline;
pub mod platform;
pub mod store;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use biometric::{BiometricTemplate, MatchEngine, MatchOutcome, DEFAULT_ACCEPT_THRESHOLD};
pub use clock::{Clock, SystemClock};
pub use config::AppConfig;
pub use database::{Database, Identity, Role, SharedDatabase};
pub use pipeline::{BiometricPipeline, Camera, CaptureError, Extractor, ImageHandle, PipelineError};
pub use platform::{
    ensure_data_dir, get_config_dir, get_data_dir, get_default_config_path,
    get_default_database_path,
};
pub use store::LocalStore;
pub use sync::{
    EngineState, ErrorKind, HttpDirectory, NetworkMonitor, RemoteDirectory, RemoteError,
    SyncAction, SyncConfig, SyncEngine, SyncErrorRecord, SyncHandle, SyncQueue, SyncQueueItem,
    SyncStatus,
};

use thiserror::Error;

/// Result type for BioConnect operations
pub type Result<T> = std::result::Result<T, BioConnectError>;

/// Local persistence failures.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Database lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("Schema version mismatch: expected {expected}, found {found}")]
    SchemaMismatch { expected: i32, found: i32 },

    #[error("{0}")]
    Other(String),
}

/// General error type for BioConnect operations
#[derive(Error, Debug)]
pub enum BioConnectError {
    /// Local persistence failure. Fatal to the current operation, never retried.
    #[error("Storage failure: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid template: {0}")]
    InvalidTemplate(String),

    #[error("Template already enrolled as {existing} (distance {distance:.4})")]
    DuplicateTemplate { existing: String, distance: f32 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Remote directory error: {0}")]
    Remote(#[from] sync::RemoteError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BioConnectError {
    /// The taxonomy bucket this error belongs to.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Database(_) | Self::Io(_) => ErrorKind::StorageFailure,
            Self::InvalidTemplate(_) => ErrorKind::InvalidTemplate,
            Self::DuplicateTemplate { .. } => ErrorKind::DuplicateTemplate,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Remote(e) => e.kind(),
            Self::InvalidInput(_) | Self::Config(_) => ErrorKind::Rejected,
        }
    }
}
