// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! redb-backed replication ledger.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use copyledger_core::{
    Clock, Error, LedgerConfig, LedgerStats, ReplicaTarget, ReplicationRecord, Result,
    SyncStrategy, TargetState,
};
use redb::{Database, Durability, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};

use crate::locks::{Acquire, RowLocks};
use crate::transaction::{Claim, Transaction};

/// Replication state table: object_key -> StoredRecord (bincode)
pub(crate) const OBJECT_COPIES: TableDefinition<'static, &'static str, &'static [u8]> =
    TableDefinition::new("object_copies");

// === Stored Types (for bincode serialization) ===

#[derive(Serialize, Deserialize)]
pub(crate) struct StoredRecord {
    want: [bool; ReplicaTarget::COUNT],
    have_micros: [Option<i64>; ReplicaTarget::COUNT],
    last_attempt_micros: Option<i64>,
}

fn micros_to_datetime(micros: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(micros).unwrap_or(DateTime::UNIX_EPOCH)
}

impl StoredRecord {
    pub(crate) fn from_record(record: &ReplicationRecord) -> Self {
        Self {
            want: record.targets.map(|t| t.want),
            have_micros: record.targets.map(|t| t.have.map(|at| at.timestamp_micros())),
            last_attempt_micros: record.last_attempt.map(|at| at.timestamp_micros()),
        }
    }

    pub(crate) fn to_record(&self, object_key: &str) -> ReplicationRecord {
        let mut targets = [TargetState::default(); ReplicaTarget::COUNT];
        for target in ReplicaTarget::ALL {
            let i = target.index();
            targets[i] =
                TargetState { want: self.want[i], have: self.have_micros[i].map(micros_to_datetime) };
        }
        ReplicationRecord {
            object_key: object_key.to_string(),
            targets,
            last_attempt: self.last_attempt_micros.map(micros_to_datetime),
        }
    }
}

pub(crate) fn encode(operation: &'static str, record: &ReplicationRecord) -> Result<Vec<u8>> {
    bincode::serialize(&StoredRecord::from_record(record))
        .map_err(|e| Error::store_for(operation, record.object_key.as_str(), e))
}

pub(crate) fn decode(
    operation: &'static str,
    object_key: &str,
    bytes: &[u8],
) -> Result<ReplicationRecord> {
    let stored: StoredRecord =
        bincode::deserialize(bytes).map_err(|e| Error::store_for(operation, object_key, e))?;
    Ok(stored.to_record(object_key))
}

/// State shared by a ledger and every transaction opened on it.
pub(crate) struct Shared {
    pub(crate) db: Database,
    pub(crate) durability: Durability,
    pub(crate) locks: RowLocks,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) backoff: Duration,
    pub(crate) lock_timeout: Duration,
    next_txn_id: AtomicU64,
}

impl Shared {
    pub(crate) fn next_txn_id(&self) -> u64 {
        self.next_txn_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Reads the committed row for `object_key`.
    pub(crate) fn read_record(
        &self,
        operation: &'static str,
        object_key: &str,
    ) -> Result<Option<ReplicationRecord>> {
        let txn = self.db.begin_read().map_err(|e| Error::store_for(operation, object_key, e))?;
        let table =
            txn.open_table(OBJECT_COPIES).map_err(|e| Error::store_for(operation, object_key, e))?;

        match table.get(object_key).map_err(|e| Error::store_for(operation, object_key, e))? {
            Some(value) => decode(operation, object_key, value.value()).map(Some),
            None => Ok(None),
        }
    }

    /// Finds and locks one eligible row.
    ///
    /// The claim is built here, on the blocking thread, so that if the caller
    /// stops waiting the dropped result still releases its lock.
    fn claim_blocking(self: Arc<Self>) -> Result<Option<Claim>> {
        let txn = Transaction::new(Arc::clone(&self));
        let now = self.clock.now();

        let read = self.db.begin_read().map_err(|e| Error::store("claim", e))?;
        let table = read.open_table(OBJECT_COPIES).map_err(|e| Error::store("claim", e))?;

        for entry in table.iter().map_err(|e| Error::store("claim", e))? {
            let (key, value) = entry.map_err(|e| Error::store("claim", e))?;
            let object_key = key.value();
            // A bad row must not stall the rest of the queue.
            let candidate = match decode("claim", object_key, value.value()) {
                Ok(candidate) => candidate,
                Err(err) => {
                    error!(object_key = %object_key, error = %err, "Skipping undecodable row");
                    continue;
                }
            };
            if !candidate.is_eligible(now, self.backoff) {
                continue;
            }

            match self.locks.try_lock(object_key, txn.owner()) {
                Acquire::Acquired => {}
                Acquire::Busy | Acquire::Closed => {
                    trace!(object_key = %object_key, "Skipping locked row");
                    continue;
                }
            }

            // The scan snapshot may predate a commit by the previous holder.
            match self.read_record("claim", object_key)? {
                Some(current) if current.is_eligible(now, self.backoff) => {
                    debug!(object_key = %object_key, txn = txn.id(), "Claimed row");
                    return Ok(Some(Claim::new(current, txn)));
                }
                _ => {
                    trace!(object_key = %object_key, "Row changed before lock, skipping");
                    self.locks.release(object_key, txn.id());
                }
            }
        }

        Ok(None)
    }

    fn stats_blocking(&self) -> Result<LedgerStats> {
        let now = self.clock.now();
        let txn = self.db.begin_read().map_err(|e| Error::store("stats", e))?;
        let table = txn.open_table(OBJECT_COPIES).map_err(|e| Error::store("stats", e))?;

        let mut stats = LedgerStats::default();
        for entry in table.iter().map_err(|e| Error::store("stats", e))? {
            let (key, value) = entry.map_err(|e| Error::store("stats", e))?;
            match decode("stats", key.value(), value.value()) {
                Ok(record) => stats.observe(&record, now, self.backoff),
                Err(err) => {
                    error!(object_key = %key.value(), error = %err, "Undecodable row");
                    stats.unreadable += 1;
                }
            }
        }
        Ok(stats)
    }
}

/// Persistent ledger of per-object replication state.
///
/// Cheap to clone; clones share the database, the row locks and the clock.
#[derive(Clone)]
pub struct Ledger {
    pub(crate) shared: Arc<Shared>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("backoff", &self.shared.backoff)
            .field("lock_timeout", &self.shared.lock_timeout)
            .field("locked_rows", &self.shared.locks.held())
            .finish()
    }
}

impl Ledger {
    /// Open or create a ledger database at `config.path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open(config: &LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::open_at(&config.path, config, clock)
    }

    /// Open or create a ledger database at `path`, taking every other setting
    /// from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open_at(path: &Path, config: &LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        debug!(?path, sync = ?config.sync, backoff_secs = config.backoff_secs, "Opening ledger");

        let db = Database::create(path).map_err(|e| Error::store("open", e))?;
        Self::from_database(db, Self::sync_to_durability(config.sync), config, clock)
    }

    /// Open an in-memory ledger for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn open_in_memory(config: &LedgerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(|e| Error::store("open", e))?;
        Self::from_database(db, Durability::None, config, clock)
    }

    fn from_database(
        db: Database,
        durability: Durability,
        config: &LedgerConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        // Create the table up front so reads never see it missing.
        {
            let txn = db.begin_write().map_err(|e| Error::store("open", e))?;
            let _ = txn.open_table(OBJECT_COPIES).map_err(|e| Error::store("open", e))?;
            txn.commit().map_err(|e| Error::store("open", e))?;
        }

        Ok(Self {
            shared: Arc::new(Shared {
                db,
                durability,
                locks: RowLocks::new(),
                clock,
                backoff: config.backoff_duration(),
                lock_timeout: config.lock_timeout_duration(),
                next_txn_id: AtomicU64::new(1),
            }),
        })
    }

    fn sync_to_durability(strategy: SyncStrategy) -> Durability {
        match strategy {
            SyncStrategy::Always => Durability::Immediate,
            // Flushed by the next Immediate commit.
            SyncStrategy::None => Durability::None,
        }
    }

    /// Starts a transaction. Its changes become visible only on commit.
    pub fn begin(&self) -> Transaction {
        Transaction::new(Arc::clone(&self.shared))
    }

    /// Selects and locks one record that needs replication.
    ///
    /// Rows held by other transactions are skipped, never waited on. Returns
    /// `Ok(None)` when nothing is eligible. The returned claim keeps its row
    /// locked until it is committed, rolled back or dropped.
    pub async fn claim(&self) -> Result<Option<Claim>> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.claim_blocking())
            .await
            .map_err(|e| Error::store("claim", e))?
    }

    /// Clears the confirmed copy on `target` so the object is replicated there
    /// again, whatever its `want` flag says. Commits on its own.
    ///
    /// Waits for the row if it is currently claimed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if no record exists for `object_key`.
    pub async fn reset_target(&self, object_key: &str, target: ReplicaTarget) -> Result<()> {
        let mut txn = self.begin();
        txn.reset_target(object_key, target).await?;
        txn.commit().await
    }

    /// Reads the committed record for `object_key` without locking it.
    pub async fn get(&self, object_key: &str) -> Result<Option<ReplicationRecord>> {
        let shared = Arc::clone(&self.shared);
        let key = object_key.to_string();
        tokio::task::spawn_blocking(move || shared.read_record("get", &key))
            .await
            .map_err(|e| Error::store_for("get", object_key, e))?
    }

    /// Summarises every committed record.
    pub async fn stats(&self) -> Result<LedgerStats> {
        let shared = Arc::clone(&self.shared);
        tokio::task::spawn_blocking(move || shared.stats_blocking())
            .await
            .map_err(|e| Error::store("stats", e))?
    }

    /// Whether some open transaction holds the row for `object_key`.
    pub fn is_locked(&self, object_key: &str) -> bool {
        self.shared.locks.holder(object_key).is_some()
    }

    /// Number of rows currently held by open transactions.
    pub fn locked_rows(&self) -> usize {
        self.shared.locks.held()
    }

    /// The backoff window this ledger enforces.
    pub fn backoff(&self) -> Duration {
        self.shared.backoff
    }

    /// The clock this ledger stamps records with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.shared.clock
    }
}
