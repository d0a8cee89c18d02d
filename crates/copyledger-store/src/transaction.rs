// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Ledger transactions and claims.
//!
//! A [`Transaction`] buffers its mutations and applies them to the database
//! in a single write on [`Transaction::commit`]. Every row it touches is
//! locked from the first touch until the transaction ends, so two open
//! transactions never modify the same row. Ending a transaction by commit,
//! rollback or drop always releases its locks.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use copyledger_core::{Error, ReplicaTarget, ReplicationRecord, Result, TargetFlags};
use redb::ReadableTable;
use tracing::{debug, error, warn};

use crate::ledger::{decode, encode, Shared, OBJECT_COPIES};
use crate::locks::{Acquire, LockOwner};

/// A change to an existing row.
#[derive(Debug, Clone)]
enum Change {
    LastAttempt(DateTime<Utc>),
    Replicated(ReplicaTarget, DateTime<Utc>),
    Reset(ReplicaTarget),
    ClearWants,
}

impl Change {
    fn operation(&self) -> &'static str {
        match self {
            Self::LastAttempt(_) => "record_attempt",
            Self::Replicated(..) => "mark_replicated",
            Self::Reset(_) => "reset_target",
            Self::ClearWants => "unmark_all_targets",
        }
    }

    fn apply(&self, record: &mut ReplicationRecord) {
        match *self {
            Self::LastAttempt(at) => record.last_attempt = Some(at),
            Self::Replicated(target, at) => record.target_mut(target).have = Some(at),
            Self::Reset(target) => record.target_mut(target).have = None,
            Self::ClearWants => {
                for state in &mut record.targets {
                    state.want = false;
                }
            }
        }
    }

    /// The error to raise when the row is gone, or `None` if a missing row is
    /// a no-op for this change.
    fn missing_row(&self, object_key: &str) -> Option<Error> {
        match self {
            Self::LastAttempt(_) | Self::ClearWants => None,
            Self::Replicated(..) => Some(Error::UnexpectedRowCount {
                operation: self.operation(),
                object_key: object_key.to_string(),
                affected: 0,
            }),
            Self::Reset(_) => Some(Error::NotFound { object_key: object_key.to_string() }),
        }
    }
}

#[derive(Debug, Clone)]
enum Mutation {
    Insert(ReplicationRecord),
    Update { object_key: String, change: Change },
}

impl Mutation {
    fn object_key(&self) -> &str {
        match self {
            Self::Insert(record) => &record.object_key,
            Self::Update { object_key, .. } => object_key,
        }
    }
}

/// Applies `pending` in one write transaction. Nothing is written unless every
/// mutation succeeds.
fn apply_blocking(shared: &Shared, pending: &[Mutation]) -> Result<()> {
    let mut txn = shared.db.begin_write().map_err(|e| Error::store("commit", e))?;

    {
        let mut table = txn.open_table(OBJECT_COPIES).map_err(|e| Error::store("commit", e))?;

        for mutation in pending {
            let object_key = mutation.object_key();
            let existing = table
                .get(object_key)
                .map_err(|e| Error::store_for("commit", object_key, e))?
                .map(|value| value.value().to_vec());

            let record = match (mutation, existing) {
                (Mutation::Insert(_), Some(_)) => {
                    return Err(Error::DuplicateKey { object_key: object_key.to_string() });
                }
                (Mutation::Insert(record), None) => record.clone(),
                (Mutation::Update { change, .. }, None) => match change.missing_row(object_key) {
                    Some(err) => {
                        if matches!(err, Error::UnexpectedRowCount { .. }) {
                            error!(object_key = %object_key, error = %err, "Ledger inconsistency at commit");
                        }
                        return Err(err);
                    }
                    None => {
                        debug!(object_key = %object_key, operation = change.operation(), "No row to update");
                        continue;
                    }
                },
                (Mutation::Update { change, .. }, Some(bytes)) => {
                    let mut record = decode("commit", object_key, &bytes)?;
                    change.apply(&mut record);
                    record
                }
            };

            let bytes = encode("commit", &record)?;
            table
                .insert(object_key, bytes.as_slice())
                .map_err(|e| Error::store_for("commit", object_key, e))?;
        }
    }

    txn.set_durability(shared.durability).map_err(|e| Error::store("commit", e))?;
    txn.commit().map_err(|e| Error::store("commit", e))?;

    Ok(())
}

/// An open unit of work on the ledger.
///
/// Exactly one of [`commit`](Self::commit) or [`rollback`](Self::rollback)
/// should end it. Dropping it rolls back.
pub struct Transaction {
    shared: Arc<Shared>,
    owner: LockOwner,
    pending: Vec<Mutation>,
    /// Rows known to exist for the life of this transaction: created here, or
    /// read while locked. Rows are never deleted, so the lock keeps this true.
    known: HashSet<String>,
    finished: bool,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.owner.id())
            .field("pending", &self.pending.len())
            .field("finished", &self.finished)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let owner = LockOwner::new(shared.next_txn_id());
        Self { shared, owner, pending: Vec::new(), known: HashSet::new(), finished: false }
    }

    pub(crate) fn owner(&self) -> &LockOwner {
        &self.owner
    }

    /// Identifier of this transaction, unique within the ledger.
    pub fn id(&self) -> u64 {
        self.owner.id()
    }

    /// Number of buffered mutations.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn lock_row(&self, operation: &'static str, object_key: &str) -> Result<()> {
        match self.shared.locks.try_lock(object_key, &self.owner) {
            Acquire::Acquired => return Ok(()),
            Acquire::Closed => {
                return Err(Error::store_for(operation, object_key, "transaction is closed"))
            }
            Acquire::Busy => {}
        }

        debug!(object_key = %object_key, txn = self.id(), "Waiting for row lock");

        let shared = Arc::clone(&self.shared);
        let owner = self.owner.clone();
        let key = object_key.to_string();
        let timeout = shared.lock_timeout;
        let outcome = tokio::task::spawn_blocking(move || shared.locks.lock(&key, &owner, timeout))
            .await
            .map_err(|e| Error::store_for(operation, object_key, e))?;

        match outcome {
            Acquire::Acquired => Ok(()),
            Acquire::Busy => Err(Error::LockTimeout {
                object_key: object_key.to_string(),
                waited_ms: timeout.as_millis() as u64,
            }),
            Acquire::Closed => Err(Error::store_for(operation, object_key, "transaction is closed")),
        }
    }

    /// Whether a committed row exists. Call only with the row locked.
    async fn row_exists(&mut self, operation: &'static str, object_key: &str) -> Result<bool> {
        if self.known.contains(object_key) {
            return Ok(true);
        }

        let shared = Arc::clone(&self.shared);
        let key = object_key.to_string();
        let exists = tokio::task::spawn_blocking(move || shared.read_record(operation, &key))
            .await
            .map_err(|e| Error::store_for(operation, object_key, e))??
            .is_some();

        if exists {
            self.known.insert(object_key.to_string());
        }
        Ok(exists)
    }

    pub(crate) fn mark_known(&mut self, object_key: &str) {
        self.known.insert(object_key.to_string());
    }

    /// Registers a new object that was just stored on `completed`.
    ///
    /// `completed` is recorded as wanted and replicated now; every other
    /// target is wanted according to `wants` and not yet replicated.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DuplicateKey`] if a record for `object_key` already
    /// exists or was created earlier in this transaction.
    pub async fn create_record(
        &mut self,
        object_key: &str,
        wants: TargetFlags,
        completed: ReplicaTarget,
    ) -> Result<()> {
        self.lock_row("create_record", object_key).await?;
        if self.row_exists("create_record", object_key).await? {
            return Err(Error::DuplicateKey { object_key: object_key.to_string() });
        }

        let record =
            ReplicationRecord::new(object_key, wants, completed, self.shared.clock.now());
        debug!(object_key = %object_key, completed = %completed, txn = self.id(), "Creating record");

        self.pending.push(Mutation::Insert(record));
        self.known.insert(object_key.to_string());
        Ok(())
    }

    /// Stamps the record with the current time as its last attempt, starting
    /// the backoff window. A missing record is left alone.
    pub async fn record_attempt(&mut self, object_key: &str) -> Result<()> {
        self.lock_row("record_attempt", object_key).await?;
        let now = self.shared.clock.now();
        self.push_change(object_key, Change::LastAttempt(now));
        Ok(())
    }

    /// Records a confirmed copy of the object on `target`, stamped now.
    ///
    /// Marking an already replicated target moves its timestamp forward.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnexpectedRowCount`] if there is no record to update.
    /// The transaction should then be rolled back.
    pub async fn mark_replicated(&mut self, object_key: &str, target: ReplicaTarget) -> Result<()> {
        self.lock_row("mark_replicated", object_key).await?;
        if !self.row_exists("mark_replicated", object_key).await? {
            let err = Error::UnexpectedRowCount {
                operation: "mark_replicated",
                object_key: object_key.to_string(),
                affected: 0,
            };
            error!(object_key = %object_key, target = %target, error = %err, "Ledger inconsistency");
            return Err(err);
        }

        let now = self.shared.clock.now();
        self.push_change(object_key, Change::Replicated(target, now));
        Ok(())
    }

    /// Stops all further replication of the object by clearing every `want`
    /// flag. A missing record is left alone.
    pub async fn unmark_all_targets(&mut self, object_key: &str) -> Result<()> {
        self.lock_row("unmark_all_targets", object_key).await?;
        self.push_change(object_key, Change::ClearWants);
        Ok(())
    }

    pub(crate) async fn reset_target(&mut self, object_key: &str, target: ReplicaTarget) -> Result<()> {
        self.lock_row("reset_target", object_key).await?;
        if !self.row_exists("reset_target", object_key).await? {
            return Err(Error::NotFound { object_key: object_key.to_string() });
        }
        self.push_change(object_key, Change::Reset(target));
        Ok(())
    }

    fn push_change(&mut self, object_key: &str, change: Change) {
        debug!(object_key = %object_key, operation = change.operation(), txn = self.id(), "Buffered change");
        self.pending.push(Mutation::Update { object_key: object_key.to_string(), change });
    }

    /// Reads `object_key` as this transaction sees it: the committed row with
    /// this transaction's own changes applied. Does not lock.
    pub async fn get(&self, object_key: &str) -> Result<Option<ReplicationRecord>> {
        let shared = Arc::clone(&self.shared);
        let key = object_key.to_string();
        let mut record = tokio::task::spawn_blocking(move || shared.read_record("get", &key))
            .await
            .map_err(|e| Error::store_for("get", object_key, e))??;

        for mutation in self.pending.iter().filter(|m| m.object_key() == object_key) {
            match mutation {
                Mutation::Insert(created) => record = Some(created.clone()),
                Mutation::Update { change, .. } => {
                    if let Some(record) = record.as_mut() {
                        change.apply(record);
                    }
                }
            }
        }
        Ok(record)
    }

    /// Applies every buffered mutation atomically, then releases all locks.
    ///
    /// On error nothing is written and the locks are still released.
    pub async fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.owner.close();

        let pending = std::mem::take(&mut self.pending);
        let shared = Arc::clone(&self.shared);
        let id = self.id();

        if pending.is_empty() {
            shared.locks.release_all(id);
            return Ok(());
        }

        let count = pending.len();
        let task_shared = Arc::clone(&shared);
        // Locks are released on the blocking thread once the write is done,
        // even if this future is dropped while waiting.
        let result = tokio::task::spawn_blocking(move || {
            let result = apply_blocking(&task_shared, &pending);
            task_shared.locks.release_all(id);
            result
        })
        .await;

        match result {
            Ok(Ok(())) => {
                debug!(txn = id, mutations = count, "Committed transaction");
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(txn = id, error = %err, "Commit failed, transaction rolled back");
                Err(err)
            }
            Err(join_err) => {
                shared.locks.release_all(id);
                Err(Error::store("commit", join_err))
            }
        }
    }

    /// Discards every buffered mutation and releases all locks.
    pub fn rollback(mut self) {
        debug!(txn = self.id(), discarded = self.pending.len(), "Rolled back transaction");
        self.pending.clear();
        self.close();
    }

    fn close(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.owner.close();
        self.shared.locks.release_all(self.owner.id());
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished && !self.pending.is_empty() {
            warn!(
                txn = self.id(),
                discarded = self.pending.len(),
                "Transaction dropped without commit, changes discarded"
            );
        }
        self.close();
    }
}

/// A locked record handed out by [`Ledger::claim`](crate::Ledger::claim).
///
/// The record stays locked until the claim is committed, rolled back or
/// dropped. The snapshot is taken when the claim is made and does not reflect
/// changes buffered afterwards.
#[derive(Debug)]
pub struct Claim {
    record: ReplicationRecord,
    txn: Transaction,
}

impl Claim {
    pub(crate) fn new(record: ReplicationRecord, mut txn: Transaction) -> Self {
        txn.mark_known(&record.object_key);
        Self { record, txn }
    }

    /// The record as it was when claimed.
    pub fn record(&self) -> &ReplicationRecord {
        &self.record
    }

    /// Key of the claimed object.
    pub fn object_key(&self) -> &str {
        &self.record.object_key
    }

    /// Targets that needed a copy when the record was claimed.
    pub fn missing_targets(&self) -> Vec<ReplicaTarget> {
        self.record.missing_targets().collect()
    }

    /// The transaction holding the lock.
    pub fn transaction(&mut self) -> &mut Transaction {
        &mut self.txn
    }

    /// Stamps the claimed record's last attempt with the current time.
    pub async fn record_attempt(&mut self) -> Result<()> {
        self.txn.record_attempt(&self.record.object_key).await
    }

    /// Records a confirmed copy of the claimed object on `target`.
    pub async fn mark_replicated(&mut self, target: ReplicaTarget) -> Result<()> {
        self.txn.mark_replicated(&self.record.object_key, target).await
    }

    /// Commits the claim's transaction and releases the row.
    pub async fn commit(self) -> Result<()> {
        self.txn.commit().await
    }

    /// Rolls back the claim's transaction and releases the row.
    pub fn rollback(self) {
        self.txn.rollback();
    }

    /// Splits the claim into its transaction and record snapshot.
    pub fn into_parts(self) -> (Transaction, ReplicationRecord) {
        (self.txn, self.record)
    }
}
