// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Replication workers.
//!
//! A worker repeatedly claims one record from the ledger, stamps the attempt,
//! uploads the object to every target still missing a copy and commits. The
//! attempt is committed whether or not the uploads succeed, so a failing
//! object waits out the backoff window instead of being retried in a loop.

use std::sync::Arc;

use async_trait::async_trait;
use copyledger_core::{ReplicaTarget, Result, WorkerConfig};
use copyledger_store::Ledger;
use metrics::{counter, gauge};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::UploadError;

/// Copies stored objects to one replica target.
///
/// Implementations own the byte transfer; the worker only decides what to
/// copy and records the outcome.
#[async_trait]
pub trait ReplicaUploader: Send + Sync {
    /// The target this uploader writes to.
    fn target(&self) -> ReplicaTarget;

    /// Copies `object_key` to the target.
    async fn upload(&self, object_key: &str) -> std::result::Result<(), UploadError>;
}

/// What one claim cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing was eligible.
    Idle,
    /// A record was claimed and its attempt committed.
    Attempted {
        /// The claimed object.
        object_key: String,
        /// Targets now holding a confirmed copy.
        replicated: Vec<ReplicaTarget>,
        /// Targets whose upload failed or timed out.
        failed: Vec<ReplicaTarget>,
        /// Targets with no configured uploader.
        skipped: Vec<ReplicaTarget>,
    },
}

impl CycleOutcome {
    /// Whether every missing target was replicated.
    pub fn is_complete(&self) -> bool {
        match self {
            Self::Idle => false,
            Self::Attempted { failed, skipped, .. } => failed.is_empty() && skipped.is_empty(),
        }
    }
}

/// Drains the ledger's claim queue using one uploader per target.
pub struct ReplicationWorker {
    ledger: Ledger,
    uploaders: [Option<Arc<dyn ReplicaUploader>>; ReplicaTarget::COUNT],
    config: WorkerConfig,
}

impl ReplicationWorker {
    /// Creates a worker. Later uploaders replace earlier ones for the same target.
    pub fn new(
        ledger: Ledger,
        uploaders: impl IntoIterator<Item = Arc<dyn ReplicaUploader>>,
        config: WorkerConfig,
    ) -> Self {
        let mut slots: [Option<Arc<dyn ReplicaUploader>>; ReplicaTarget::COUNT] =
            std::array::from_fn(|_| None);
        for uploader in uploaders {
            let idx = uploader.target().index();
            slots[idx] = Some(uploader);
        }
        Self { ledger, uploaders: slots, config }
    }

    /// The ledger this worker claims from.
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    fn uploader(&self, target: ReplicaTarget) -> Option<&Arc<dyn ReplicaUploader>> {
        self.uploaders[target.index()].as_ref()
    }

    /// Claims one record and tries to replicate it to every missing target.
    ///
    /// # Errors
    ///
    /// Returns ledger errors. The claim is rolled back in that case, including
    /// the attempt timestamp.
    pub async fn run_once(&self) -> Result<CycleOutcome> {
        let Some(mut claim) = self.ledger.claim().await? else {
            counter!("copyledger_idle_polls_total").increment(1);
            return Ok(CycleOutcome::Idle);
        };
        counter!("copyledger_claims_total").increment(1);

        let object_key = claim.object_key().to_string();
        debug!(object_key = %object_key, missing = ?claim.missing_targets(), "Claimed object");

        claim.record_attempt().await?;

        let timeout = self.config.upload_timeout_duration();
        let mut replicated = Vec::new();
        let mut failed = Vec::new();
        let mut skipped = Vec::new();

        for target in claim.missing_targets() {
            let Some(uploader) = self.uploader(target) else {
                warn!(object_key = %object_key, target = %target, "No uploader configured for target");
                skipped.push(target);
                continue;
            };

            let outcome = match tokio::time::timeout(timeout, uploader.upload(&object_key)).await {
                Ok(result) => result,
                Err(_) => Err(UploadError::Timeout { target, timeout_ms: timeout.as_millis() as u64 }),
            };

            match outcome {
                Ok(()) => {
                    claim.mark_replicated(target).await?;
                    counter!("copyledger_uploads_total", "target" => target.as_str(), "outcome" => "success")
                        .increment(1);
                    replicated.push(target);
                }
                Err(err) => {
                    warn!(object_key = %object_key, target = %target, error = %err, "Replication failed");
                    counter!("copyledger_uploads_total", "target" => target.as_str(), "outcome" => "failure")
                        .increment(1);
                    failed.push(target);
                }
            }
        }

        claim.commit().await?;

        info!(
            object_key = %object_key,
            replicated = ?replicated,
            failed = ?failed,
            skipped = ?skipped,
            "Replication attempt recorded"
        );

        Ok(CycleOutcome::Attempted { object_key, replicated, failed, skipped })
    }

    /// Runs claim cycles until `shutdown` flips to true, sleeping between
    /// cycles that find nothing to do.
    async fn run(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "Starting replication worker");
        let poll_interval = self.config.poll_interval_duration();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(CycleOutcome::Idle) => true,
                Ok(CycleOutcome::Attempted { .. }) => false,
                Err(err) => {
                    warn!(worker_id, error = %err, transient = err.is_transient(), "Replication cycle failed");
                    counter!("copyledger_cycle_errors_total").increment(1);
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        info!(worker_id, "Replication worker stopped");
    }
}

/// A set of running replication workers sharing one [`ReplicationWorker`].
pub struct WorkerPool {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawns `worker_count` tasks on the current tokio runtime.
    pub fn start(worker: Arc<ReplicationWorker>, worker_count: usize) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handles = (0..worker_count)
            .map(|worker_id| {
                let worker = Arc::clone(&worker);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { worker.run(worker_id, shutdown_rx).await })
            })
            .collect::<Vec<_>>();

        gauge!("copyledger_active_workers").set(handles.len() as f64);
        info!(workers = handles.len(), "Replication worker pool started");

        Self { shutdown_tx, handles }
    }

    /// Spawns as many workers as `worker.config` asks for.
    pub fn start_configured(worker: Arc<ReplicationWorker>) -> Self {
        let count = worker.config.workers;
        Self::start(worker, count)
    }

    /// Number of workers in the pool.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Signals every worker to stop and waits for them. A worker finishes the
    /// cycle it is in before stopping.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "Replication worker panicked");
            }
        }
        gauge!("copyledger_active_workers").set(0.0);
        info!("Replication worker pool stopped");
    }
}
