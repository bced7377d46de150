//! Sync engine: drains the pending queue against the remote directory.
//!
//! A single background task owns the engine state. Triggers (connectivity
//! regained, `force_sync`, backoff timer) arrive as events on that task,
//! so at most one drain runs at a time and triggers that arrive during a
//! drain are absorbed by it.

use crate::clock::{Clock, SystemClock};
use crate::database::{self, SharedDatabase};
use crate::store;
use crate::sync::config::SyncConfig;
use crate::sync::models::{EngineState, ErrorKind, SyncAction, SyncQueueItem, SyncStatus};
use crate::sync::queue::{self, SyncQueue};
use crate::sync::remote::{IdentityFields, RemoteDirectory, RemoteError};
use crate::{BioConnectError, DatabaseError, Result};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, info, warn};

const COMMAND_BUFFER: usize = 16;

#[derive(Debug)]
enum Command {
    ForceSync,
    Shutdown,
}

/// Why a drain stopped before the queue was exhausted.
enum DrainStop {
    Transient(RemoteError),
    Storage(BioConnectError),
}

#[derive(Debug, Default)]
struct DrainSummary {
    replicated: usize,
    failed: usize,
    last_failure: Option<ErrorKind>,
}

/// Mutable state owned by the engine task.
#[derive(Debug)]
struct SyncSession {
    online: bool,
    state: EngineState,
    attempt: u32,
    retry_deadline: Option<Instant>,
    last_error: Option<ErrorKind>,
    last_sync_at: Option<DateTime<Utc>>,
}

impl SyncSession {
    fn new(online: bool) -> Self {
        Self {
            online,
            state: EngineState::Idle,
            attempt: 0,
            retry_deadline: None,
            last_error: None,
            last_sync_at: None,
        }
    }
}

/// Replicates queued mutations to a [`RemoteDirectory`].
pub struct SyncEngine<R: RemoteDirectory + 'static> {
    db: SharedDatabase,
    remote: Arc<R>,
    config: SyncConfig,
    clock: Arc<dyn Clock>,
    status: watch::Sender<SyncStatus>,
}

impl<R: RemoteDirectory + 'static> SyncEngine<R> {
    pub fn new(db: SharedDatabase, remote: Arc<R>, config: SyncConfig) -> Self {
        Self::with_clock(db, remote, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        db: SharedDatabase,
        remote: Arc<R>,
        config: SyncConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let (status, _rx) = watch::channel(SyncStatus::default());
        Self {
            db,
            remote,
            config,
            clock,
            status,
        }
    }

    /// Start the engine task. It subscribes to `connectivity` once and
    /// drains immediately if already online.
    pub fn spawn(self, connectivity: watch::Receiver<bool>) -> SyncHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let status = self.status.subscribe();
        let queue = SyncQueue::with_clock(self.db.clone(), self.clock.clone());

        let task = tokio::spawn(self.run(rx, connectivity));

        SyncHandle {
            commands: tx,
            status,
            queue,
            task: Arc::new(Mutex::new(Some(task))),
        }
    }

    async fn run(
        self,
        mut commands: mpsc::Receiver<Command>,
        mut connectivity: watch::Receiver<bool>,
    ) {
        let mut session = SyncSession::new(*connectivity.borrow_and_update());
        let mut connectivity_open = true;
        self.publish(&session);
        info!("Sync engine started (online={})", session.online);

        if session.online {
            self.drain(&mut session).await;
        }

        // Other processes append to the queue without a way to notify us.
        let poll_every = self.config.poll_interval();
        let mut poll = time::interval_at(Instant::now() + poll_every, poll_every);
        poll.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            let deadline = session.retry_deadline;

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::ForceSync) => {
                        if session.online {
                            self.drain(&mut session).await;
                        } else {
                            debug!("Ignoring sync request while offline");
                        }
                    }
                    Some(Command::Shutdown) | None => break,
                },
                changed = connectivity.changed(), if connectivity_open => {
                    if changed.is_err() {
                        warn!("Connectivity source closed; waiting for explicit sync requests");
                        connectivity_open = false;
                        continue;
                    }
                    let online = *connectivity.borrow_and_update();
                    if online == session.online {
                        continue;
                    }
                    session.online = online;
                    self.publish(&session);
                    if online && !matches!(session.state, EngineState::Backoff { .. }) {
                        self.drain(&mut session).await;
                    }
                },
                _ = time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    session.retry_deadline = None;
                    if session.online {
                        self.drain(&mut session).await;
                    } else {
                        debug!("Backoff elapsed while offline; idling");
                        session.state = EngineState::Idle;
                        self.publish(&session);
                    }
                },
                _ = poll.tick() => {
                    if session.online && session.state == EngineState::Idle {
                        if let Err(e) = self.reconcile_unregistered() {
                            warn!("Could not queue missing registrations: {}", e);
                        }
                        if self.has_pending() {
                            debug!("Found pending items without a trigger");
                            self.drain(&mut session).await;
                        }
                    }
                },
            }

            if !self.absorb_buffered(&mut commands, &mut session).await {
                break;
            }
        }

        info!("Sync engine stopped");
    }

    /// Collapse sync requests that queued up during a drain. Returns
    /// `false` when a shutdown was among them.
    async fn absorb_buffered(
        &self,
        commands: &mut mpsc::Receiver<Command>,
        session: &mut SyncSession,
    ) -> bool {
        let mut requested = false;
        while let Ok(command) = commands.try_recv() {
            match command {
                Command::ForceSync => requested = true,
                Command::Shutdown => return false,
            }
        }

        // Items enqueued after the drain's last read would otherwise wait
        // for the next trigger.
        if requested
            && session.online
            && session.state == EngineState::Idle
            && self.has_pending()
        {
            self.drain(session).await;
        }
        true
    }

    async fn drain(&self, session: &mut SyncSession) {
        session.state = EngineState::Draining;
        session.retry_deadline = None;
        self.publish(session);
        debug!("Draining sync queue");

        match self.drain_pending().await {
            Ok(summary) => {
                if summary.replicated + summary.failed > 0 {
                    info!(
                        "Sync drain complete: {} replicated, {} failed permanently",
                        summary.replicated, summary.failed
                    );
                }
                session.state = EngineState::Idle;
                session.attempt = 0;
                session.last_sync_at = Some(self.clock.now());
                session.last_error = summary.last_failure;
            }
            Err(DrainStop::Transient(e)) => {
                session.attempt = session.attempt.saturating_add(1);
                let delay = self.config.backoff_delay(session.attempt);
                let retry_at = self.clock.now()
                    + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
                warn!(
                    "Sync paused after transient failure (attempt {}), retrying in {:?}: {}",
                    session.attempt, delay, e
                );
                session.state = EngineState::Backoff {
                    error: ErrorKind::Transient,
                    retry_at,
                    attempt: session.attempt,
                };
                session.retry_deadline = Some(Instant::now() + delay);
                session.last_error = Some(ErrorKind::Transient);
            }
            Err(DrainStop::Storage(e)) => {
                error!("Sync drain aborted by storage failure: {}", e);
                session.state = EngineState::Idle;
                session.last_error = Some(ErrorKind::StorageFailure);
            }
        }

        self.publish(session);
    }

    async fn drain_pending(&self) -> std::result::Result<DrainSummary, DrainStop> {
        let mut summary = DrainSummary::default();
        self.reconcile_unregistered().map_err(DrainStop::Storage)?;

        loop {
            let batch = self.load_pending().map_err(DrainStop::Storage)?;
            if batch.is_empty() {
                return Ok(summary);
            }

            for item in batch {
                let remote_id = match item.action {
                    SyncAction::Register => None,
                    SyncAction::Update => self.resolve_remote_id(&item).map_err(DrainStop::Storage)?,
                };

                match self.replicate(&item, remote_id.as_deref()).await {
                    Ok(assigned) => match self.commit_success(&item, assigned.as_deref()) {
                        Ok(()) => {
                            debug!(
                                "Replicated #{} {} {}",
                                item.sequence,
                                item.action.as_str(),
                                item.payload.local_id
                            );
                            summary.replicated += 1;
                        }
                        // The payload's identity is not stored here; retrying
                        // cannot fix that, so it must not hold up the queue.
                        Err(BioConnectError::NotFound(what)) => {
                            warn!(
                                "Dropping #{} {}: {} is missing locally",
                                item.sequence,
                                item.action.as_str(),
                                what
                            );
                            let message = format!("{} missing from the local store", what);
                            self.commit_failure(&item, ErrorKind::NotFound, &message)
                                .map_err(DrainStop::Storage)?;
                            summary.failed += 1;
                            summary.last_failure = Some(ErrorKind::NotFound);
                        }
                        Err(e) => return Err(DrainStop::Storage(e)),
                    },
                    Err(e) if e.is_transient() => return Err(DrainStop::Transient(e)),
                    Err(e) => {
                        warn!(
                            "Dropping #{} {} {} after permanent failure: {}",
                            item.sequence,
                            item.action.as_str(),
                            item.payload.local_id,
                            e
                        );
                        self.commit_failure(&item, e.kind(), &e.to_string())
                            .map_err(DrainStop::Storage)?;
                        summary.failed += 1;
                        summary.last_failure = Some(e.kind());
                    }
                }
            }
        }
    }

    /// Send one item to the directory. Returns the assigned remote id for
    /// registrations.
    async fn replicate(
        &self,
        item: &SyncQueueItem,
        remote_id: Option<&str>,
    ) -> std::result::Result<Option<String>, RemoteError> {
        let identity = &item.payload;
        match item.action {
            SyncAction::Register => {
                let assigned = self
                    .with_deadline(self.remote.create_identity(
                        &identity.local_id,
                        &identity.display_name,
                        identity.role,
                    ))
                    .await?;
                Ok(Some(assigned))
            }
            SyncAction::Update => {
                let remote_id = remote_id.ok_or_else(|| {
                    RemoteError::NotFound(format!(
                        "identity {} has no remote id",
                        identity.local_id
                    ))
                })?;
                let fields = IdentityFields {
                    display_name: identity.display_name.clone(),
                    role: identity.role,
                };
                self.with_deadline(self.remote.update_identity(remote_id, &fields))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = std::result::Result<T, RemoteError>>,
    ) -> std::result::Result<T, RemoteError> {
        let deadline = self.config.replicate_timeout();
        match time::timeout(deadline, call).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "no response within {:?}",
                deadline
            ))),
        }
    }

    /// Remote id for an update: the stored one (set by an earlier
    /// registration in this or a previous drain), else the snapshot's.
    fn resolve_remote_id(&self, item: &SyncQueueItem) -> Result<Option<String>> {
        let db = database::lock(&self.db, "resolve remote id")?;
        let stored = store::load_identity(db.conn(), &item.payload.local_id)?
            .and_then(|identity| identity.remote_id);
        Ok(stored.or_else(|| item.payload.remote_id.clone()))
    }

    fn commit_success(&self, item: &SyncQueueItem, remote_id: Option<&str>) -> Result<()> {
        let now = self.clock.now();
        let mut db = database::lock(&self.db, "commit replication")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;

        match remote_id {
            Some(remote_id) => store::set_remote_id(&tx, &item.payload.local_id, remote_id, now)?,
            None => store::touch_synced(&tx, &item.payload.local_id, now)?,
        }
        queue::mark_synced(&tx, item.sequence, now)?;

        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    fn commit_failure(&self, item: &SyncQueueItem, kind: ErrorKind, message: &str) -> Result<()> {
        let now = self.clock.now();
        let mut db = database::lock(&self.db, "commit replication failure")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;

        queue::record_error(&tx, item, kind, message, now)?;
        queue::mark_synced(&tx, item.sequence, now)?;

        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(())
    }

    /// Queue a registration for identities that never got one, e.g. those
    /// added through `LocalStore::enroll`.
    fn reconcile_unregistered(&self) -> Result<usize> {
        let now = self.clock.now();
        let mut db = database::lock(&self.db, "reconcile registrations")?;
        let tx = db.conn_mut().transaction().map_err(DatabaseError::Sqlite)?;

        let missing = store::load_unregistered(&tx)?;
        for identity in &missing {
            let item = queue::append(&tx, SyncAction::Register, identity, now)?;
            info!(
                "Queued missing registration #{} for {}",
                item.sequence, identity.local_id
            );
        }

        tx.commit().map_err(DatabaseError::Sqlite)?;
        Ok(missing.len())
    }

    fn load_pending(&self) -> Result<Vec<SyncQueueItem>> {
        let db = database::lock(&self.db, "load pending")?;
        queue::load_pending(db.conn())
    }

    fn pending_count(&self) -> Result<u64> {
        let db = database::lock(&self.db, "pending count")?;
        queue::count_pending(db.conn())
    }

    /// Whether anything awaits replication. A failed count reads as empty.
    fn has_pending(&self) -> bool {
        match self.pending_count() {
            Ok(count) => count > 0,
            Err(e) => {
                warn!("Could not count pending items: {}", e);
                false
            }
        }
    }

    fn publish(&self, session: &SyncSession) {
        let pending_count = match self.pending_count() {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not count pending items: {}", e);
                self.status.borrow().pending_count
            }
        };

        self.status.send_replace(SyncStatus {
            online: session.online,
            pending_count,
            state: session.state,
            last_error: session.last_error,
            last_sync_at: session.last_sync_at,
        });
    }
}

/// Caller-side handle to a running [`SyncEngine`]. Every method returns
/// without waiting for replication.
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncStatus>,
    queue: SyncQueue,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl SyncHandle {
    /// Request a drain. Ignored while offline; coalesced while one runs.
    pub fn force_sync(&self) {
        match self.commands.try_send(Command::ForceSync) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!("Sync request coalesced with pending requests");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Sync request dropped: engine is not running");
            }
        }
    }

    /// Latest engine status, with a live pending count.
    pub fn status(&self) -> Result<SyncStatus> {
        let mut status = self.status.borrow().clone();
        status.pending_count = self.queue.pending_count()?;
        Ok(status)
    }

    /// Notifications of engine status changes.
    pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop the engine and wait for its task to finish. An in-flight item
    /// stays pending and is replicated again on the next start.
    pub async fn shutdown(&self) {
        if self.commands.send(Command::Shutdown).await.is_err() {
            debug!("Sync engine already stopped");
        }
        if let Some(task) = self.task.lock().await.take() {
            if let Err(e) = task.await {
                error!("Sync engine task failed: {}", e);
            }
        }
    }
}
