//! Database layer for BioConnect.
//!
//! This module handles schema management and the record types persisted in
//! the `identities` and `sync_queue` tables.

pub mod models;
pub mod schema;

pub use models::{Identity, Role};
pub use schema::{Database, CURRENT_SCHEMA_VERSION};

use crate::{DatabaseError, Result};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};

/// Database handle shared by the store, the queue and the sync engine.
pub type SharedDatabase = Arc<Mutex<Database>>;

/// Wrap an opened database for sharing.
pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Lock the shared database, mapping poisoning to a storage failure.
pub(crate) fn lock<'a>(db: &'a SharedDatabase, context: &str) -> Result<MutexGuard<'a, Database>> {
    db.lock()
        .map_err(|_| DatabaseError::LockPoisoned(context.to_string()).into())
}

/// Timestamps are stored as Unix milliseconds.
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| DatabaseError::Other(format!("Invalid timestamp: {}", ms)).into())
}
