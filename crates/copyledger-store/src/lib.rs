// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Persistent replication ledger for copyledger.
//!
//! This crate provides:
//! - [`Ledger`]: the redb-backed table of per-object replication state
//! - [`Transaction`]: buffered, row-locked units of work on the ledger
//! - [`Claim`]: a locked record handed to a replication worker
//!
//! # Claiming work
//!
//! ```ignore
//! use copyledger_store::Ledger;
//!
//! while let Some(mut claim) = ledger.claim().await? {
//!     claim.record_attempt().await?;
//!     for target in claim.missing_targets() {
//!         if upload(claim.object_key(), target).await.is_ok() {
//!             claim.mark_replicated(target).await?;
//!         }
//!     }
//!     claim.commit().await?;
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ledger;
mod locks;
mod transaction;

pub use ledger::Ledger;
pub use transaction::{Claim, Transaction};
