// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Core types and utilities for the copyledger replication ledger.
//!
//! This crate provides the building blocks shared by every copyledger component:
//! - Replica targets and the per-object replication record
//! - An injectable clock with microsecond resolution
//! - Configuration management
//! - Error types

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    Config, ConfigValidationError, LedgerConfig, LogFormat, LoggingConfig, SyncStrategy,
    WorkerConfig, DEFAULT_BACKOFF, DEFAULT_BACKOFF_SECS,
};
pub use error::{Error, Result};
pub use types::{
    LedgerStats, ParseReplicaTargetError, ReplicaTarget, ReplicationRecord, TargetFlags,
    TargetState,
};
