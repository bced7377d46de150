//! End-to-end replication against an in-process directory.

use async_trait::async_trait;
use bioconnect_core::database::shared;
use bioconnect_core::sync::IdentityFields;
use bioconnect_core::{
    BioConnectError, BiometricTemplate, Database, LocalStore, MatchEngine, NetworkMonitor,
    RemoteDirectory, RemoteError, Role, SyncConfig, SyncEngine, SyncHandle, SyncQueue, SyncStatus,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time;

/// Directory keyed by the idempotency key, failing after `budget` creates
/// to simulate the link dropping mid-drain.
#[derive(Default)]
struct Directory {
    records: Mutex<HashMap<String, String>>,
    create_calls: Mutex<Vec<String>>,
    budget: Mutex<Option<usize>>,
}

impl Directory {
    fn with_budget(budget: usize) -> Self {
        let directory = Self::default();
        *directory.budget.lock().unwrap() = Some(budget);
        directory
    }

    fn create_calls(&self) -> Vec<String> {
        self.create_calls.lock().unwrap().clone()
    }

    fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    fn lift_budget(&self) {
        *self.budget.lock().unwrap() = None;
    }
}

#[async_trait]
impl RemoteDirectory for Directory {
    async fn create_identity(
        &self,
        local_id: &str,
        _display_name: &str,
        _role: Role,
    ) -> Result<String, RemoteError> {
        {
            let mut budget = self.budget.lock().unwrap();
            match budget.as_mut() {
                Some(0) => return Err(RemoteError::Transient("link down".to_string())),
                Some(n) => *n -= 1,
                None => {}
            }
        }

        self.create_calls.lock().unwrap().push(local_id.to_string());
        let mut records = self.records.lock().unwrap();
        let next = format!("dir-{}", records.len() + 1);
        Ok(records.entry(local_id.to_string()).or_insert(next).clone())
    }

    async fn update_identity(
        &self,
        _remote_id: &str,
        _fields: &IdentityFields,
    ) -> Result<(), RemoteError> {
        Ok(())
    }
}

fn face(seed: f32) -> BiometricTemplate {
    BiometricTemplate::new(
        (0..128)
            .map(|i| ((i as f32 + 1.0) * seed * 0.37).sin() * 0.25)
            .collect(),
    )
    .unwrap()
}

fn config() -> SyncConfig {
    SyncConfig {
        backoff_base_secs: 3600,
        backoff_max_secs: 3600,
        ..SyncConfig::default()
    }
}

async fn wait_for(handle: &SyncHandle, done: impl Fn(&SyncStatus) -> bool) -> SyncStatus {
    let mut rx = handle.subscribe();
    time::timeout(Duration::from_secs(10), async {
        loop {
            let status = rx.borrow_and_update().clone();
            if done(&status) {
                return status;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("engine never reached the expected status")
}

#[tokio::test]
async fn offline_enrollments_replicate_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let db = shared(Database::open(dir.path().join("bioconnect.db")).unwrap());
    let store = LocalStore::new(db.clone(), MatchEngine::default());

    let monitor = NetworkMonitor::new(false);
    let directory = Arc::new(Directory::default());
    let handle = SyncEngine::new(db.clone(), directory.clone(), config()).spawn(monitor.subscribe());

    let mut enrolled = Vec::new();
    for (i, name) in ["Ana", "Luis", "Eva", "Marta"].iter().enumerate() {
        let (identity, _) = store
            .register(name, Role::Worker, face(i as f32 + 1.0))
            .unwrap();
        enrolled.push(identity.local_id);
    }
    assert_eq!(handle.status().unwrap().pending_count, 4);

    monitor.set_connected(true);
    wait_for(&handle, |s| s.last_sync_at.is_some() && s.pending_count == 0).await;

    assert_eq!(directory.create_calls(), enrolled);
    let items = SyncQueue::new(db).all().unwrap();
    assert_eq!(items.len(), 4);
    assert!(items.iter().all(|item| item.synced && item.synced_at.is_some()));
    for identity in store.list_all().unwrap() {
        assert!(identity.remote_id.is_some());
    }

    handle.shutdown().await;
}

#[tokio::test]
async fn drain_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bioconnect.db");
    let directory = Arc::new(Directory::with_budget(2));

    let local_ids: Vec<String> = {
        let db = shared(Database::open(&path).unwrap());
        let store = LocalStore::new(db.clone(), MatchEngine::default());
        let ids = (1..=5)
            .map(|seed| {
                store
                    .register(&format!("Worker {}", seed), Role::Worker, face(seed as f32))
                    .unwrap()
                    .0
                    .local_id
            })
            .collect();

        // Link drops after two items; the long backoff keeps the engine
        // from retrying before it is torn down.
        let monitor = NetworkMonitor::new(true);
        let handle =
            SyncEngine::new(db.clone(), directory.clone(), config()).spawn(monitor.subscribe());
        let status = wait_for(&handle, |s| s.last_error.is_some()).await;
        assert_eq!(status.pending_count, 3);
        handle.shutdown().await;
        ids
    };

    // Restart on the same file.
    directory.lift_budget();
    let db = shared(Database::open(&path).unwrap());
    let queue = SyncQueue::new(db.clone());
    let pending: Vec<String> = queue
        .pending()
        .unwrap()
        .into_iter()
        .map(|item| item.payload.local_id)
        .collect();
    assert_eq!(pending, local_ids[2..].to_vec());

    let monitor = NetworkMonitor::new(true);
    let handle = SyncEngine::new(db.clone(), directory.clone(), config()).spawn(monitor.subscribe());
    wait_for(&handle, |s| s.last_sync_at.is_some() && s.pending_count == 0).await;

    assert_eq!(directory.create_calls(), local_ids);
    assert_eq!(directory.record_count(), 5);
    assert_eq!(queue.pending_count().unwrap(), 0);

    handle.shutdown().await;
}

#[tokio::test]
async fn same_face_cannot_enroll_twice() {
    let dir = tempfile::tempdir().unwrap();
    let db = shared(Database::open(dir.path().join("bioconnect.db")).unwrap());
    let store = LocalStore::new(db.clone(), MatchEngine::default());

    let (ana, _) = store.register("Ana", Role::Worker, face(1.0)).unwrap();
    let err = store
        .register("Ana (again)", Role::Supervisor, face(1.0))
        .unwrap_err();

    match err {
        BioConnectError::DuplicateTemplate { existing, distance } => {
            assert_eq!(existing, ana.local_id);
            assert_eq!(distance, 0.0);
        }
        other => panic!("expected duplicate, got {:?}", other),
    }
    assert_eq!(SyncQueue::new(db).all().unwrap().len(), 1);
}
