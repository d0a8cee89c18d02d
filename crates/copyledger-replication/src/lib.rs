// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Replication workers for copyledger.
//!
//! A [`ReplicationWorker`] pulls one record at a time from the ledger's claim
//! queue and copies the object to each target that still lacks it. Several
//! workers can share a ledger; the row locks taken by a claim keep them off
//! each other's records.
//!
//! ```text
//!  claim ──► record_attempt ──► upload per missing target ──► commit
//!    │                               │
//!    └── no work: sleep poll_interval └── success: mark_replicated
//! ```
//!
//! # Example
//!
//! ```ignore
//! let worker = Arc::new(ReplicationWorker::new(ledger, uploaders, config.worker.clone()));
//! let pool = WorkerPool::start_configured(worker);
//! // ...
//! pool.shutdown().await;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod worker;

pub use error::UploadError;
pub use worker::{CycleOutcome, ReplicaUploader, ReplicationWorker, WorkerPool};
