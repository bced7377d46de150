//! Local identity store: enrollment, lookup, remote-id assignment and the
//! current session.
//!
//! Every write runs inside one SQLite transaction, so readers never see a
//! half-written identity. Mutations that must be replicated append their
//! queue item inside the same transaction.

use crate::biometric::{BiometricTemplate, MatchEngine, MatchOutcome};
use crate::clock::{Clock, SystemClock};
use crate::database::{self, from_millis, to_millis, Identity, Role, SharedDatabase};
use crate::sync::models::{SyncAction, SyncQueueItem};
use crate::sync::queue;
use crate::{BioConnectError, DatabaseError, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{info, warn};

const IDENTITY_COLUMNS: &str =
    "local_id, remote_id, display_name, role, template, enrolled_at, last_synced_at";

/// Raw `identities` row before template decoding.
type IdentityRow = (String, Option<String>, String, String, Vec<u8>, i64, Option<i64>);

fn read_identity_row(row: &Row<'_>) -> rusqlite::Result<IdentityRow> {
    Ok((
        row.get::<_, String>(0)?,         // local_id
        row.get::<_, Option<String>>(1)?, // remote_id
        row.get::<_, String>(2)?,         // display_name
        row.get::<_, String>(3)?,         // role
        row.get::<_, Vec<u8>>(4)?,        // template blob
        row.get::<_, i64>(5)?,            // enrolled_at
        row.get::<_, Option<i64>>(6)?,    // last_synced_at
    ))
}

fn decode_identity_row(raw: IdentityRow) -> Result<Identity> {
    let (local_id, remote_id, display_name, role, template, enrolled_at, last_synced_at) = raw;

    let role = Role::parse(&role)
        .ok_or_else(|| DatabaseError::Other(format!("Unknown role for {}: {}", local_id, role)))?;
    let template = BiometricTemplate::from_blob(&template).map_err(|e| {
        DatabaseError::Serialization(format!("Stored template for {}: {}", local_id, e))
    })?;

    Ok(Identity {
        local_id,
        remote_id,
        display_name,
        role,
        template,
        enrolled_at: from_millis(enrolled_at)?,
        last_synced_at: last_synced_at.map(from_millis).transpose()?,
    })
}

pub(crate) fn load_identity(conn: &Connection, local_id: &str) -> Result<Option<Identity>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM identities WHERE local_id = ?1", IDENTITY_COLUMNS),
            [local_id],
            read_identity_row,
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;

    raw.map(decode_identity_row).transpose()
}

/// All identities in enrollment order.
pub(crate) fn load_identities(conn: &Connection) -> Result<Vec<Identity>> {
    query_identities(
        conn,
        &format!(
            "SELECT {} FROM identities ORDER BY enrolled_seq ASC",
            IDENTITY_COLUMNS
        ),
        [],
    )
}

/// Identities without a remote id that never had a registration queued.
pub(crate) fn load_unregistered(conn: &Connection) -> Result<Vec<Identity>> {
    query_identities(
        conn,
        &format!(
            "SELECT {} FROM identities i
             WHERE i.remote_id IS NULL
               AND NOT EXISTS (
                   SELECT 1 FROM sync_queue q
                   WHERE q.local_id = i.local_id AND q.action = ?1
               )
             ORDER BY i.enrolled_seq ASC",
            IDENTITY_COLUMNS
        ),
        [SyncAction::Register.as_str()],
    )
}

fn query_identities(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Identity>> {
    let mut stmt = conn.prepare(sql).map_err(DatabaseError::Sqlite)?;
    let rows = stmt
        .query_map(params, read_identity_row)
        .map_err(DatabaseError::Sqlite)?;

    let mut identities = Vec::new();
    for row in rows {
        identities.push(decode_identity_row(row.map_err(DatabaseError::Sqlite)?)?);
    }
    Ok(identities)
}

fn insert_identity(conn: &Connection, identity: &Identity) -> Result<()> {
    conn.execute(
        "INSERT INTO identities (
            local_id, remote_id, display_name, role, template, enrolled_at, last_synced_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            identity.local_id,
            identity.remote_id,
            identity.display_name,
            identity.role.as_str(),
            identity.template.to_blob()?,
            to_millis(identity.enrolled_at),
            identity.last_synced_at.map(to_millis),
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Replace the mutable columns of an existing row with `identity`.
fn replace_identity(conn: &Connection, identity: &Identity) -> Result<()> {
    conn.execute(
        "UPDATE identities SET display_name = ?1, role = ?2, template = ?3
         WHERE local_id = ?4",
        rusqlite::params![
            identity.display_name,
            identity.role.as_str(),
            identity.template.to_blob()?,
            identity.local_id,
        ],
    )
    .map_err(DatabaseError::Sqlite)?;
    Ok(())
}

/// Closest enrolled identity within the acceptance threshold, if any.
fn find_duplicate(
    conn: &Connection,
    matcher: &MatchEngine,
    template: &BiometricTemplate,
    ignore_local_id: Option<&str>,
) -> Result<Option<(String, f32)>> {
    let enrolled = load_identities(conn)?;
    let candidates = enrolled
        .iter()
        .filter(|i| Some(i.local_id.as_str()) != ignore_local_id)
        .map(|i| (i.local_id.as_str(), &i.template));

    match matcher.identify(template, candidates)? {
        MatchOutcome::Match { local_id, distance } => Ok(Some((local_id, distance))),
        MatchOutcome::NoMatch => Ok(None),
    }
}

/// Record the directory-assigned id for an identity.
///
/// A remote id, once set, is never replaced: a different id arriving later
/// is ignored with a warning, while `last_synced_at` still advances.
pub(crate) fn set_remote_id(
    conn: &Connection,
    local_id: &str,
    remote_id: &str,
    synced_at: DateTime<Utc>,
) -> Result<()> {
    let existing: Option<Option<String>> = conn
        .query_row(
            "SELECT remote_id FROM identities WHERE local_id = ?1",
            [local_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(DatabaseError::Sqlite)?;

    match existing {
        None => Err(BioConnectError::NotFound(format!("identity {}", local_id))),
        Some(Some(current)) => {
            if current != remote_id {
                warn!(
                    "Ignoring remote id {} for {}: already bound to {}",
                    remote_id, local_id, current
                );
            }
            touch_synced(conn, local_id, synced_at)
        }
        Some(None) => {
            conn.execute(
                "UPDATE identities SET remote_id = ?1, last_synced_at = ?2 WHERE local_id = ?3",
                rusqlite::params![remote_id, to_millis(synced_at), local_id],
            )
            .map_err(DatabaseError::Sqlite)?;
            Ok(())
        }
    }
}

pub(crate) fn touch_synced(conn: &Connection, local_id: &str, at: DateTime<Utc>) -> Result<()> {
    let updated = conn
        .execute(
            "UPDATE identities SET last_synced_at = ?1 WHERE local_id = ?2",
            rusqlite::params![to_millis(at), local_id],
        )
        .map_err(DatabaseError::Sqlite)?;

    if updated == 0 {
        return Err(BioConnectError::NotFound(format!("identity {}", local_id)));
    }
    Ok(())
}

/// Durable store of enrolled identities.
#[derive(Clone)]
pub struct LocalStore {
    db: SharedDatabase,
    matcher: MatchEngine,
    clock: Arc<dyn Clock>,
}

impl LocalStore {
    pub fn new(db: SharedDatabase, matcher: MatchEngine) -> Self {
        Self::with_clock(db, matcher, Arc::new(SystemClock))
    }

    pub fn with_clock(db: SharedDatabase, matcher: MatchEngine, clock: Arc<dyn Clock>) -> Self {
        Self { db, matcher, clock }
    }

    pub fn matcher(&self) -> &MatchEngine {
        &self.matcher
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    /// Validate and insert a new identity inside an open transaction.
    fn enroll_in(&self, conn: &Connection, identity: &Identity) -> Result<()> {
        self.matcher.validate(&identity.template)?;

        if load_identity(conn, &identity.local_id)?.is_some() {
            return Err(BioConnectError::InvalidInput(format!(
                "local id {} is already enrolled",
                identity.local_id
            )));
        }
        if let Some((existing, distance)) =
            find_duplicate(conn, &self.matcher, &identity.template, None)?
        {
            return Err(BioConnectError::DuplicateTemplate { existing, distance });
        }

        insert_identity(conn, identity)
    }

    /// Enroll an identity.
    ///
    /// Fails with `DuplicateTemplate` when the template is within the
    /// acceptance threshold of an already-enrolled one.
    pub fn enroll(&self, identity: Identity) -> Result<Identity> {
        let mut db = database::lock(&self.db, "enroll")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;
        self.enroll_in(&tx, &identity)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!("Enrolled {} ({})", identity.local_id, identity.role.as_str());
        Ok(identity)
    }

    /// Enroll a new person and queue its registration for replication,
    /// atomically.
    pub fn register(
        &self,
        display_name: &str,
        role: Role,
        template: BiometricTemplate,
    ) -> Result<(Identity, SyncQueueItem)> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(BioConnectError::InvalidInput(
                "display name cannot be empty".to_string(),
            ));
        }

        let now = self.clock.now();
        let identity = Identity::new(display_name, role, template, now);

        let mut db = database::lock(&self.db, "register")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;
        self.enroll_in(&tx, &identity)?;
        let item = queue::append(&tx, SyncAction::Register, &identity, now)?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!(
            "Registered {} as {} (queue #{})",
            identity.local_id,
            identity.role.as_str(),
            item.sequence
        );
        Ok((identity, item))
    }

    pub fn get(&self, local_id: &str) -> Result<Option<Identity>> {
        let db = database::lock(&self.db, "get identity")?;
        load_identity(db.conn(), local_id)
    }

    /// All identities in enrollment order.
    pub fn list_all(&self) -> Result<Vec<Identity>> {
        let db = database::lock(&self.db, "list identities")?;
        load_identities(db.conn())
    }

    pub fn apply_remote_id(
        &self,
        local_id: &str,
        remote_id: &str,
        synced_at: DateTime<Utc>,
    ) -> Result<()> {
        let db = database::lock(&self.db, "apply remote id")?;
        set_remote_id(db.conn(), local_id, remote_id, synced_at)
    }

    /// Change display name and role, queueing an update.
    pub fn update_profile(
        &self,
        local_id: &str,
        display_name: &str,
        role: Role,
    ) -> Result<(Identity, SyncQueueItem)> {
        let display_name = display_name.trim();
        if display_name.is_empty() {
            return Err(BioConnectError::InvalidInput(
                "display name cannot be empty".to_string(),
            ));
        }

        let mut db = database::lock(&self.db, "update profile")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;

        let mut identity = load_identity(&tx, local_id)?
            .ok_or_else(|| BioConnectError::NotFound(format!("identity {}", local_id)))?;
        identity.display_name = display_name.to_string();
        identity.role = role;

        replace_identity(&tx, &identity)?;
        let item = queue::append(&tx, SyncAction::Update, &identity, self.clock.now())?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        Ok((identity, item))
    }

    /// Replace an identity's template with a freshly captured one.
    ///
    /// The whole record is swapped in one transaction and an update is
    /// queued; the duplicate check skips the identity being replaced.
    pub fn reenroll(
        &self,
        local_id: &str,
        template: BiometricTemplate,
    ) -> Result<(Identity, SyncQueueItem)> {
        self.matcher.validate(&template)?;

        let mut db = database::lock(&self.db, "reenroll")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;

        let current = load_identity(&tx, local_id)?
            .ok_or_else(|| BioConnectError::NotFound(format!("identity {}", local_id)))?;
        if let Some((existing, distance)) =
            find_duplicate(&tx, &self.matcher, &template, Some(local_id))?
        {
            return Err(BioConnectError::DuplicateTemplate { existing, distance });
        }

        let replacement = Identity {
            template,
            ..current
        };
        replace_identity(&tx, &replacement)?;
        let item = queue::append(&tx, SyncAction::Update, &replacement, self.clock.now())?;
        tx.commit().map_err(DatabaseError::Sqlite)?;

        info!("Re-enrolled {} (queue #{})", local_id, item.sequence);
        Ok((replacement, item))
    }

    /// 1:N identification against every enrolled identity.
    pub fn identify(&self, live: &BiometricTemplate) -> Result<MatchOutcome> {
        let enrolled = self.list_all()?;
        self.matcher.identify(
            live,
            enrolled.iter().map(|i| (i.local_id.as_str(), &i.template)),
        )
    }

    /// 1:1 verification against a specific identity.
    pub fn verify(&self, local_id: &str, live: &BiometricTemplate) -> Result<bool> {
        let identity = self
            .get(local_id)?
            .ok_or_else(|| BioConnectError::NotFound(format!("identity {}", local_id)))?;
        self.matcher.verify(live, &identity.template)
    }

    /// Start a session for an enrolled identity.
    pub fn set_current(&self, local_id: &str) -> Result<Identity> {
        let db = database::lock(&self.db, "set session")?;
        let identity = load_identity(db.conn(), local_id)?
            .ok_or_else(|| BioConnectError::NotFound(format!("identity {}", local_id)))?;

        db.conn()
            .execute(
                "INSERT INTO session (id, local_id, started_at) VALUES (1, ?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET
                    local_id = excluded.local_id,
                    started_at = excluded.started_at",
                rusqlite::params![local_id, to_millis(self.clock.now())],
            )
            .map_err(DatabaseError::Sqlite)?;

        Ok(identity)
    }

    pub fn current(&self) -> Result<Option<Identity>> {
        let db = database::lock(&self.db, "current session")?;
        let local_id: Option<String> = db
            .conn()
            .query_row("SELECT local_id FROM session WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()
            .map_err(DatabaseError::Sqlite)?;

        match local_id {
            Some(id) => load_identity(db.conn(), &id),
            None => Ok(None),
        }
    }

    pub fn clear_current(&self) -> Result<()> {
        let db = database::lock(&self.db, "clear session")?;
        db.conn()
            .execute("DELETE FROM session WHERE id = 1", [])
            .map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Whether the current session belongs to a supervisor.
    pub fn is_supervisor(&self) -> Result<bool> {
        Ok(self.current()?.is_some_and(|i| i.is_supervisor()))
    }
}
