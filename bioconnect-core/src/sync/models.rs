//! Sync data models: queued mutations, engine state and status snapshots.

use crate::database::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of mutation recorded in the sync queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Register,
    Update,
}

impl SyncAction {
    /// Convert the action to its stored string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Register => "register",
            Self::Update => "update",
        }
    }

    /// Parse an action from its stored string representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "register" => Some(Self::Register),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

/// One pending (or already replicated) mutation.
///
/// `sequence` is strictly increasing and defines replay order. Items are
/// never removed; they flip from unsynced to synced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    pub sequence: u64,
    pub action: SyncAction,
    /// Snapshot of the identity at the moment the mutation was made.
    pub payload: Identity,
    pub enqueued_at: DateTime<Utc>,
    pub synced: bool,
    pub synced_at: Option<DateTime<Utc>>,
}

/// Error taxonomy shared by matching, storage and replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidTemplate,
    DuplicateTemplate,
    /// Network failure or timeout; retried after a backoff delay.
    Transient,
    /// Payload refused by the remote directory; never retried.
    Rejected,
    NotFound,
    StorageFailure,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidTemplate => "invalid_template",
            Self::DuplicateTemplate => "duplicate_template",
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::NotFound => "not_found",
            Self::StorageFailure => "storage_failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "invalid_template" => Some(Self::InvalidTemplate),
            "duplicate_template" => Some(Self::DuplicateTemplate),
            "transient" => Some(Self::Transient),
            "rejected" => Some(Self::Rejected),
            "not_found" => Some(Self::NotFound),
            "storage_failure" => Some(Self::StorageFailure),
            _ => None,
        }
    }
}

/// State of the sync engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Draining,
    Backoff {
        error: ErrorKind,
        retry_at: DateTime<Utc>,
        attempt: u32,
    },
}

/// Snapshot returned by `SyncHandle::status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    pub online: bool,
    pub pending_count: u64,
    pub state: EngineState,
    pub last_error: Option<ErrorKind>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Default for SyncStatus {
    fn default() -> Self {
        Self {
            online: false,
            pending_count: 0,
            state: EngineState::Idle,
            last_error: None,
            last_sync_at: None,
        }
    }
}

/// A queue item that failed permanently and was marked synced anyway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub sequence: u64,
    pub local_id: String,
    pub kind: ErrorKind,
    pub message: String,
    pub recorded_at: DateTime<Utc>,
}
