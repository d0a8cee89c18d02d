// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Integration tests for replication workers against an in-memory ledger.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use copyledger_core::ReplicaTarget::{Backblaze, Scaleway, Wasabi};
use copyledger_core::{Clock, LedgerConfig, ManualClock, ReplicaTarget, TargetFlags, WorkerConfig};
use copyledger_replication::{CycleOutcome, ReplicaUploader, ReplicationWorker, UploadError, WorkerPool};
use copyledger_store::Ledger;
use parking_lot::Mutex;

const HOUR: Duration = Duration::from_secs(60 * 60);

/// Records every upload and fails keys on request.
#[derive(Debug)]
struct MockUploader {
    target: ReplicaTarget,
    uploads: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    lost: Mutex<HashSet<String>>,
    delay: Option<Duration>,
}

impl MockUploader {
    fn new(target: ReplicaTarget) -> Arc<Self> {
        Arc::new(Self {
            target,
            uploads: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            lost: Mutex::new(HashSet::new()),
            delay: None,
        })
    }

    fn slow(target: ReplicaTarget, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            target,
            uploads: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            lost: Mutex::new(HashSet::new()),
            delay: Some(delay),
        })
    }

    fn fail(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    /// Simulates the local copy of `key` being unreadable.
    fn lose(&self, key: &str) {
        self.lost.lock().insert(key.to_string());
    }

    fn heal(&self, key: &str) {
        self.failing.lock().remove(key);
    }

    fn uploads(&self) -> Vec<String> {
        self.uploads.lock().clone()
    }
}

#[async_trait]
impl ReplicaUploader for MockUploader {
    fn target(&self) -> ReplicaTarget {
        self.target
    }

    async fn upload(&self, object_key: &str) -> Result<(), UploadError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.lost.lock().contains(object_key) {
            return Err(UploadError::SourceUnavailable {
                object_key: object_key.to_string(),
                reason: "no such file".to_string(),
            });
        }
        if self.failing.lock().contains(object_key) {
            return Err(UploadError::failed(self.target, "injected failure"));
        }
        self.uploads.lock().push(object_key.to_string());
        Ok(())
    }
}

fn ledger() -> (Ledger, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()));
    let ledger = Ledger::open_in_memory(&LedgerConfig::default(), clock.clone()).unwrap();
    (ledger, clock)
}

fn worker_config() -> WorkerConfig {
    WorkerConfig::new().poll_interval(Duration::from_millis(10)).upload_timeout(Duration::from_secs(5))
}

fn uploaders(list: &[&Arc<MockUploader>]) -> Vec<Arc<dyn ReplicaUploader>> {
    list.iter().map(|u| Arc::clone(*u) as Arc<dyn ReplicaUploader>).collect()
}

async fn create(ledger: &Ledger, key: &str, wants: &[ReplicaTarget], completed: ReplicaTarget) {
    let mut txn = ledger.begin();
    txn.create_record(key, wants.iter().copied().collect::<TargetFlags>(), completed).await.unwrap();
    txn.commit().await.unwrap();
}

#[tokio::test]
async fn test_run_once_idle_on_empty_ledger() {
    let (ledger, _) = ledger();
    let worker = ReplicationWorker::new(ledger, Vec::new(), worker_config());
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);
}

#[tokio::test]
async fn test_run_once_replicates_missing_targets() {
    let (ledger, clock) = ledger();
    let b2 = MockUploader::new(Backblaze);
    let wasabi = MockUploader::new(Wasabi);
    let scw = MockUploader::new(Scaleway);
    create(&ledger, "photos/1.jpg", &[Wasabi, Scaleway], Backblaze).await;

    let worker = ReplicationWorker::new(ledger.clone(), uploaders(&[&b2, &wasabi, &scw]), worker_config());
    let outcome = worker.run_once().await.unwrap();

    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "photos/1.jpg".into(),
            replicated: vec![Wasabi, Scaleway],
            failed: vec![],
            skipped: vec![],
        }
    );
    assert!(outcome.is_complete());

    // The source copy is never re-uploaded.
    assert!(b2.uploads().is_empty());
    assert_eq!(wasabi.uploads(), vec!["photos/1.jpg".to_string()]);
    assert_eq!(scw.uploads(), vec!["photos/1.jpg".to_string()]);

    let record = ledger.get("photos/1.jpg").await.unwrap().unwrap();
    assert_eq!(record.target(Wasabi).have, Some(clock.now()));
    assert_eq!(record.target(Scaleway).have, Some(clock.now()));
    assert_eq!(record.last_attempt, Some(clock.now()));
    assert!(!record.needs_replication());

    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);
    assert_eq!(ledger.locked_rows(), 0);
}

#[tokio::test]
async fn test_failed_upload_backs_off_then_retries() {
    let (ledger, clock) = ledger();
    let wasabi = MockUploader::new(Wasabi);
    let scw = MockUploader::new(Scaleway);
    scw.fail("doc");
    create(&ledger, "doc", &[Wasabi, Scaleway], Backblaze).await;

    let worker = ReplicationWorker::new(ledger.clone(), uploaders(&[&wasabi, &scw]), worker_config());
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "doc".into(),
            replicated: vec![Wasabi],
            failed: vec![Scaleway],
            skipped: vec![],
        }
    );

    let record = ledger.get("doc").await.unwrap().unwrap();
    assert!(record.target(Wasabi).have.is_some());
    assert!(record.target(Scaleway).have.is_none());
    assert_eq!(record.last_attempt, Some(clock.now()));

    // Still inside the backoff window.
    scw.heal("doc");
    clock.advance(HOUR);
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);

    clock.advance(24 * HOUR);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "doc".into(),
            replicated: vec![Scaleway],
            failed: vec![],
            skipped: vec![],
        }
    );
    // Wasabi already had its copy and was not uploaded again.
    assert_eq!(wasabi.uploads().len(), 1);
    assert!(!ledger.get("doc").await.unwrap().unwrap().needs_replication());
}

#[tokio::test]
async fn test_unreadable_source_counts_as_failure() {
    let (ledger, clock) = ledger();
    let wasabi = MockUploader::new(Wasabi);
    wasabi.lose("orphan");
    create(&ledger, "orphan", &[Wasabi], Backblaze).await;

    let worker = ReplicationWorker::new(ledger, uploaders(&[&wasabi]), worker_config());
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "orphan".into(),
            replicated: vec![],
            failed: vec![Wasabi],
            skipped: vec![],
        }
    );
    assert!(wasabi.uploads().is_empty());

    let record = worker.ledger().get("orphan").await.unwrap().unwrap();
    assert_eq!(record.last_attempt, Some(clock.now()));
    assert!(record.target(Wasabi).have.is_none());
    assert_eq!(worker.ledger().locked_rows(), 0);
}

#[tokio::test]
async fn test_missing_uploader_is_skipped() {
    let (ledger, _) = ledger();
    let wasabi = MockUploader::new(Wasabi);
    create(&ledger, "k", &[Wasabi, Scaleway], Backblaze).await;

    let worker = ReplicationWorker::new(ledger.clone(), uploaders(&[&wasabi]), worker_config());
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "k".into(),
            replicated: vec![Wasabi],
            failed: vec![],
            skipped: vec![Scaleway],
        }
    );
    assert!(!outcome.is_complete());

    // The attempt was committed, so the record is backing off.
    assert_eq!(worker.run_once().await.unwrap(), CycleOutcome::Idle);
    let stats = ledger.stats().await.unwrap();
    assert_eq!(stats.backing_off, 1);
    assert_eq!(stats.missing_for(Scaleway), 1);
}

#[tokio::test]
async fn test_upload_timeout_counts_as_failure() {
    let (ledger, _) = ledger();
    let slow = MockUploader::slow(Wasabi, Duration::from_secs(30));
    create(&ledger, "big", &[Wasabi], Backblaze).await;

    let config = worker_config().upload_timeout(Duration::from_millis(50));
    let worker = ReplicationWorker::new(ledger.clone(), uploaders(&[&slow]), config);
    let outcome = worker.run_once().await.unwrap();
    assert_eq!(
        outcome,
        CycleOutcome::Attempted {
            object_key: "big".into(),
            replicated: vec![],
            failed: vec![Wasabi],
            skipped: vec![],
        }
    );

    let record = ledger.get("big").await.unwrap().unwrap();
    assert!(record.target(Wasabi).have.is_none());
    assert!(record.last_attempt.is_some());
    assert_eq!(ledger.locked_rows(), 0);
}

#[tokio::test]
async fn test_later_uploader_replaces_earlier_for_same_target() {
    let (ledger, _) = ledger();
    let first = MockUploader::new(Wasabi);
    let second = MockUploader::new(Wasabi);
    create(&ledger, "k", &[Wasabi], Backblaze).await;

    let worker = ReplicationWorker::new(ledger, uploaders(&[&first, &second]), worker_config());
    worker.run_once().await.unwrap();

    assert!(first.uploads().is_empty());
    assert_eq!(second.uploads(), vec!["k".to_string()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_drains_ledger_without_duplicate_uploads() {
    let (ledger, _) = ledger();
    let wasabi = MockUploader::slow(Wasabi, Duration::from_millis(2));
    let scw = MockUploader::slow(Scaleway, Duration::from_millis(2));

    let keys: Vec<String> = (0..40).map(|i| format!("object-{i:03}")).collect();
    for key in &keys {
        create(&ledger, key, &[Wasabi, Scaleway], Backblaze).await;
    }

    let worker = Arc::new(ReplicationWorker::new(ledger.clone(), uploaders(&[&wasabi, &scw]), worker_config()));
    let pool = WorkerPool::start(worker, 4);
    assert_eq!(pool.len(), 4);

    let drained = tokio::time::timeout(Duration::from_secs(30), async {
        loop {
            let stats = ledger.stats().await.unwrap();
            if stats.missing_for(Wasabi) == 0 && stats.missing_for(Scaleway) == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    pool.shutdown().await;
    assert!(drained.is_ok(), "workers did not drain the ledger");

    for uploader in [&wasabi, &scw] {
        let mut counts: HashMap<String, usize> = HashMap::new();
        for key in uploader.uploads() {
            *counts.entry(key).or_default() += 1;
        }
        assert_eq!(counts.len(), keys.len());
        assert!(counts.values().all(|n| *n == 1), "an object was uploaded twice: {counts:?}");
    }
    assert_eq!(ledger.locked_rows(), 0);
}

#[tokio::test]
async fn test_pool_shutdown_while_idle() {
    let (ledger, _) = ledger();
    let worker = Arc::new(ReplicationWorker::new(
        ledger,
        Vec::new(),
        worker_config().poll_interval(Duration::from_secs(60)).workers(2),
    ));

    let pool = WorkerPool::start_configured(worker);
    assert_eq!(pool.len(), 2);
    tokio::time::sleep(Duration::from_millis(20)).await;

    // Idle workers sleep for a minute; shutdown must interrupt that.
    tokio::time::timeout(Duration::from_secs(5), pool.shutdown()).await.unwrap();
}
