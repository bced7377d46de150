//! Pending-mutation queue: append, list pending, mark synced.
//!
//! The queue is an append-only log. Rows are never deleted; replication
//! only flips `synced` from 0 to 1, so the log doubles as an audit trail.

use crate::clock::{Clock, SystemClock};
use crate::database::{self, from_millis, to_millis, Identity, SharedDatabase};
use crate::sync::models::{ErrorKind, SyncAction, SyncErrorRecord, SyncQueueItem};
use crate::{BioConnectError, DatabaseError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::sync::Arc;

/// Raw `sync_queue` row before payload decoding.
type QueueRow = (i64, String, String, i64, bool, Option<i64>);

fn read_queue_row(row: &Row<'_>) -> rusqlite::Result<QueueRow> {
    Ok((
        row.get::<_, i64>(0)?,         // sequence
        row.get::<_, String>(1)?,      // action
        row.get::<_, String>(2)?,      // payload (json)
        row.get::<_, i64>(3)?,         // enqueued_at
        row.get::<_, bool>(4)?,        // synced
        row.get::<_, Option<i64>>(5)?, // synced_at
    ))
}

fn decode_queue_row(raw: QueueRow) -> Result<SyncQueueItem> {
    let (sequence, action, payload, enqueued_at, synced, synced_at) = raw;

    let action = SyncAction::parse(&action)
        .ok_or_else(|| DatabaseError::Other(format!("Unknown sync action: {}", action)))?;
    let payload: Identity = serde_json::from_str(&payload)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    Ok(SyncQueueItem {
        sequence: sequence as u64,
        action,
        payload,
        enqueued_at: from_millis(enqueued_at)?,
        synced,
        synced_at: synced_at.map(from_millis).transpose()?,
    })
}

fn query_items(conn: &Connection, sql: &str) -> Result<Vec<SyncQueueItem>> {
    let mut stmt = conn.prepare(sql).map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map([], read_queue_row)
        .map_err(DatabaseError::Sqlite)?;

    let mut items = Vec::new();
    for row in rows {
        items.push(decode_queue_row(row.map_err(DatabaseError::Sqlite)?)?);
    }
    Ok(items)
}

/// Append a mutation and return it with its assigned sequence number.
pub(crate) fn append(
    conn: &Connection,
    action: SyncAction,
    payload: &Identity,
    at: DateTime<Utc>,
) -> Result<SyncQueueItem> {
    let payload_json =
        serde_json::to_string(payload).map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        "INSERT INTO sync_queue (action, local_id, payload, enqueued_at, synced)
         VALUES (?1, ?2, ?3, ?4, 0)",
        rusqlite::params![action.as_str(), payload.local_id, payload_json, to_millis(at)],
    )
    .map_err(DatabaseError::Sqlite)?;

    Ok(SyncQueueItem {
        sequence: conn.last_insert_rowid() as u64,
        action,
        payload: payload.clone(),
        enqueued_at: at,
        synced: false,
        synced_at: None,
    })
}

/// Unsynced items in ascending sequence order.
pub(crate) fn load_pending(conn: &Connection) -> Result<Vec<SyncQueueItem>> {
    query_items(
        conn,
        "SELECT sequence, action, payload, enqueued_at, synced, synced_at
         FROM sync_queue
         WHERE synced = 0
         ORDER BY sequence ASC",
    )
}

/// Every item ever enqueued, in ascending sequence order.
pub(crate) fn load_all(conn: &Connection) -> Result<Vec<SyncQueueItem>> {
    query_items(
        conn,
        "SELECT sequence, action, payload, enqueued_at, synced, synced_at
         FROM sync_queue
         ORDER BY sequence ASC",
    )
}

pub(crate) fn count_pending(conn: &Connection) -> Result<u64> {
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM sync_queue WHERE synced = 0", [], |row| {
            row.get(0)
        })
        .map_err(DatabaseError::Sqlite)?;
    Ok(count as u64)
}

/// Mark an item synced. Returns `false` when it already was.
pub(crate) fn mark_synced(conn: &Connection, sequence: u64, at: DateTime<Utc>) -> Result<bool> {
    let updated = conn
        .execute(
            "UPDATE sync_queue SET synced = 1, synced_at = ?1 WHERE sequence = ?2 AND synced = 0",
            rusqlite::params![to_millis(at), sequence as i64],
        )
        .map_err(DatabaseError::Sqlite)?;

    if updated > 0 {
        return Ok(true);
    }

    let exists: Option<i64> = conn
        .query_row(
            "SELECT sequence FROM sync_queue WHERE sequence = ?1",
            [sequence as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;

    match exists {
        Some(_) => Ok(false),
        None => Err(BioConnectError::NotFound(format!(
            "sync queue item {}",
            sequence
        ))),
    }
}

/// Log a permanent replication failure for an item.
pub(crate) fn record_error(
    conn: &Connection,
    item: &SyncQueueItem,
    kind: ErrorKind,
    message: &str,
    at: DateTime<Utc>,
) -> Result<()> {
    conn.execute(
        "INSERT INTO sync_errors (sequence, local_id, kind, message, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        rusqlite::params![
            item.sequence as i64,
            item.payload.local_id,
            kind.as_str(),
            message,
            to_millis(at),
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

pub(crate) fn load_errors(conn: &Connection) -> Result<Vec<SyncErrorRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT sequence, local_id, kind, message, recorded_at
             FROM sync_errors
             ORDER BY error_id ASC",
        )
        .map_err(DatabaseError::Sqlite)?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .map_err(DatabaseError::Sqlite)?;

    let mut records = Vec::new();
    for row in rows {
        let (sequence, local_id, kind, message, recorded_at) =
            row.map_err(DatabaseError::Sqlite)?;
        records.push(SyncErrorRecord {
            sequence: sequence as u64,
            local_id,
            kind: ErrorKind::parse(&kind)
                .ok_or_else(|| DatabaseError::Other(format!("Unknown error kind: {}", kind)))?,
            message,
            recorded_at: from_millis(recorded_at)?,
        });
    }
    Ok(records)
}

/// Durable log of mutations awaiting replication.
#[derive(Clone)]
pub struct SyncQueue {
    db: SharedDatabase,
    clock: Arc<dyn Clock>,
}

impl SyncQueue {
    pub fn new(db: SharedDatabase) -> Self {
        Self::with_clock(db, Arc::new(SystemClock))
    }

    pub fn with_clock(db: SharedDatabase, clock: Arc<dyn Clock>) -> Self {
        Self { db, clock }
    }

    /// Append a mutation. The row is committed before this returns.
    pub fn enqueue(&self, action: SyncAction, payload: &Identity) -> Result<SyncQueueItem> {
        let mut db = database::lock(&self.db, "enqueue")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;
        let item = append(&tx, action, payload, self.clock.now())?;
        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(item)
    }

    /// Unsynced items, ascending by sequence.
    pub fn pending(&self) -> Result<Vec<SyncQueueItem>> {
        let db = database::lock(&self.db, "pending")?;
        load_pending(db.conn())
    }

    /// All items, synced or not, ascending by sequence.
    pub fn all(&self) -> Result<Vec<SyncQueueItem>> {
        let db = database::lock(&self.db, "all")?;
        load_all(db.conn())
    }

    pub fn pending_count(&self) -> Result<u64> {
        let db = database::lock(&self.db, "pending count")?;
        count_pending(db.conn())
    }

    /// Mark an item synced. Marking an already-synced item is a no-op.
    pub fn mark_synced(&self, sequence: u64) -> Result<()> {
        let db = database::lock(&self.db, "mark synced")?;
        mark_synced(db.conn(), sequence, self.clock.now())?;
        Ok(())
    }

    /// Items that failed permanently and were skipped.
    pub fn errors(&self) -> Result<Vec<SyncErrorRecord>> {
        let db = database::lock(&self.db, "sync errors")?;
        load_errors(db.conn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{shared, Database};
    use crate::test_support::identity;

    fn queue() -> SyncQueue {
        SyncQueue::new(shared(Database::in_memory().unwrap()))
    }

    #[test]
    fn enqueue_assigns_increasing_sequences() {
        let queue = queue();
        let a = queue.enqueue(SyncAction::Register, &identity("Ana", 1.0)).unwrap();
        let b = queue.enqueue(SyncAction::Register, &identity("Luis", 2.0)).unwrap();
        let c = queue.enqueue(SyncAction::Update, &identity("Ana", 1.0)).unwrap();

        assert!(a.sequence < b.sequence && b.sequence < c.sequence);
        assert!(!a.synced);

        let pending: Vec<u64> = queue.pending().unwrap().iter().map(|i| i.sequence).collect();
        assert_eq!(pending, vec![a.sequence, b.sequence, c.sequence]);
        assert_eq!(queue.pending_count().unwrap(), 3);
    }

    #[test]
    fn payload_snapshot_round_trips() {
        let queue = queue();
        let ana = identity("Ana", 1.0);
        queue.enqueue(SyncAction::Register, &ana).unwrap();

        let stored = queue.all().unwrap().remove(0);
        assert_eq!(stored.payload, ana);
        assert_eq!(stored.action, SyncAction::Register);
    }

    #[test]
    fn mark_synced_is_idempotent() {
        let queue = queue();
        let item = queue.enqueue(SyncAction::Register, &identity("Ana", 1.0)).unwrap();

        queue.mark_synced(item.sequence).unwrap();
        let after_first = queue.all().unwrap();

        queue.mark_synced(item.sequence).unwrap();
        let after_second = queue.all().unwrap();

        assert_eq!(after_first, after_second);
        assert!(after_second[0].synced);
        assert!(after_second[0].synced_at.is_some());
        assert!(queue.pending().unwrap().is_empty());
    }

    #[test]
    fn mark_synced_unknown_sequence_is_not_found() {
        let queue = queue();
        assert!(matches!(
            queue.mark_synced(42),
            Err(BioConnectError::NotFound(_))
        ));
    }

    #[test]
    fn synced_items_are_retained() {
        let queue = queue();
        let a = queue.enqueue(SyncAction::Register, &identity("Ana", 1.0)).unwrap();
        let b = queue.enqueue(SyncAction::Register, &identity("Luis", 2.0)).unwrap();
        queue.mark_synced(a.sequence).unwrap();

        let all = queue.all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].synced);
        assert!(!all[1].synced);

        let pending = queue.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].sequence, b.sequence);
    }

    #[test]
    fn errors_are_logged_per_item() {
        let queue = queue();
        let item = queue.enqueue(SyncAction::Register, &identity("Ana", 1.0)).unwrap();
        {
            let db = database::lock(&queue.db, "test").unwrap();
            record_error(db.conn(), &item, ErrorKind::Rejected, "bad payload", Utc::now()).unwrap();
        }

        let errors = queue.errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].sequence, item.sequence);
        assert_eq!(errors[0].kind, ErrorKind::Rejected);
        assert_eq!(errors[0].local_id, item.payload.local_id);
    }

    #[test]
    fn queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.db");

        let first = SyncQueue::new(shared(Database::open(&path).unwrap()));
        let a = first.enqueue(SyncAction::Register, &identity("Ana", 1.0)).unwrap();
        first.enqueue(SyncAction::Register, &identity("Luis", 2.0)).unwrap();
        first.mark_synced(a.sequence).unwrap();
        drop(first);

        let reopened = SyncQueue::new(shared(Database::open(&path).unwrap()));
        assert_eq!(reopened.all().unwrap().len(), 2);
        let pending = reopened.pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload.display_name, "Luis");

        let next = reopened.enqueue(SyncAction::Update, &identity("Ana", 1.0)).unwrap();
        assert!(next.sequence > pending[0].sequence);
    }
}
