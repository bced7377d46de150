//! Database schema and connection management.

use crate::{DatabaseError, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::time::Duration;

/// Current schema version. Incremented when the schema changes.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Main database connection and schema manager
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open (or create) a database at the specified path and make sure the
    /// schema is in place.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path).map_err(DatabaseError::Sqlite)?;
        // The daemon and one-shot CLI commands share the file.
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(DatabaseError::Sqlite)?;
        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
            .map_err(DatabaseError::Sqlite)?;
        conn.pragma_update(None, "synchronous", "FULL")
            .map_err(DatabaseError::Sqlite)?;

        let db = Self { conn };
        db.initialize_schema()?;
        db.validate_schema_version()?;
        Ok(db)
    }

    /// Create a new in-memory database for testing
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(DatabaseError::Sqlite)?;

        conn.execute("PRAGMA foreign_keys = ON", [])
            .map_err(DatabaseError::Sqlite)?;

        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Initialize the database schema
    pub fn initialize_schema(&self) -> Result<()> {
        self.create_db_metadata_table()?;
        self.create_identities_table()?;
        self.create_session_table()?;
        self.create_sync_tables()?;
        self.create_indexes()?;
        Ok(())
    }

    fn create_db_metadata_table(&self) -> Result<()> {
        self.conn
            .execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS db_metadata (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    version INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                INSERT OR IGNORE INTO db_metadata (id, version, created_at)
                VALUES (1, {}, strftime('%s', 'now'));",
                CURRENT_SCHEMA_VERSION
            ))
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_identities_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS identities (
                enrolled_seq INTEGER PRIMARY KEY AUTOINCREMENT,
                local_id TEXT NOT NULL UNIQUE,
                remote_id TEXT,
                display_name TEXT NOT NULL,
                role TEXT NOT NULL,
                template BLOB NOT NULL,
                enrolled_at INTEGER NOT NULL,
                last_synced_at INTEGER
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_session_table(&self) -> Result<()> {
        self.conn
            .execute(
                "CREATE TABLE IF NOT EXISTS session (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                local_id TEXT NOT NULL,
                started_at INTEGER NOT NULL,
                FOREIGN KEY (local_id) REFERENCES identities(local_id)
            )",
                [],
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_sync_tables(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS sync_queue (
                    sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                    action TEXT NOT NULL,
                    local_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    enqueued_at INTEGER NOT NULL,
                    synced INTEGER NOT NULL DEFAULT 0,
                    synced_at INTEGER
                );

                CREATE TABLE IF NOT EXISTS sync_errors (
                    error_id INTEGER PRIMARY KEY AUTOINCREMENT,
                    sequence INTEGER NOT NULL,
                    local_id TEXT NOT NULL,
                    kind TEXT NOT NULL,
                    message TEXT NOT NULL,
                    recorded_at INTEGER NOT NULL,
                    FOREIGN KEY (sequence) REFERENCES sync_queue(sequence)
                );",
            )
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn create_indexes(&self) -> Result<()> {
        let indexes = [
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_identities_remote_id ON identities(remote_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_synced ON sync_queue(synced, sequence)",
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_local_id ON sync_queue(local_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_errors_sequence ON sync_errors(sequence)",
        ];
        for sql in &indexes {
            self.conn.execute(sql, []).map_err(DatabaseError::Sqlite)?;
        }
        Ok(())
    }

    /// Validate the stored schema version against this build.
    pub fn validate_schema_version(&self) -> Result<()> {
        let version: Option<i32> = self
            .conn
            .query_row("SELECT version FROM db_metadata WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        match version {
            Some(found) if found == CURRENT_SCHEMA_VERSION => Ok(()),
            Some(found) => Err(DatabaseError::SchemaMismatch {
                expected: CURRENT_SCHEMA_VERSION,
                found,
            }
            .into()),
            None => Err(DatabaseError::Other("missing db_metadata row".to_string()).into()),
        }
    }

    /// Get a reference to the underlying connection
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Mutable access, needed to open transactions.
    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}
