// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Error types for ledger operations.

use thiserror::Error;

/// A specialized `Result` type for copyledger operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during ledger operations.
///
/// "No work available" is not represented here: a claim that finds nothing
/// returns `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    /// The underlying store failed (I/O, corruption, serialization).
    ///
    /// The transaction involved has been rolled back and the operation may be
    /// retried later.
    #[error("store error during {operation} (object {}): {message}", .object_key.as_deref().unwrap_or("-"))]
    Store {
        /// Name of the ledger operation that failed.
        operation: &'static str,
        /// The object being operated on, if any.
        object_key: Option<String>,
        /// Description of the underlying failure.
        message: String,
    },

    /// A record for this object key already exists.
    #[error("replication record for {object_key} already exists")]
    DuplicateKey {
        /// The duplicated object key.
        object_key: String,
    },

    /// A mutation that must touch exactly one row touched a different number.
    #[error("{operation} on {object_key}: expected 1 row to be updated, but got {affected}")]
    UnexpectedRowCount {
        /// Name of the ledger operation.
        operation: &'static str,
        /// The object key the mutation targeted.
        object_key: String,
        /// Number of rows actually affected.
        affected: usize,
    },

    /// No record exists for this object key.
    #[error("no replication record for {object_key}")]
    NotFound {
        /// The missing object key.
        object_key: String,
    },

    /// Timed out waiting for another transaction to release a row.
    #[error("timed out after {waited_ms}ms waiting for the lock on {object_key}")]
    LockTimeout {
        /// The contended object key.
        object_key: String,
        /// How long the caller waited.
        waited_ms: u64,
    },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Creates a store error for an operation that is not tied to one object.
    pub fn store(operation: &'static str, e: impl std::fmt::Display) -> Self {
        Self::Store { operation, object_key: None, message: e.to_string() }
    }

    /// Creates a store error carrying the object key being operated on.
    pub fn store_for(
        operation: &'static str,
        object_key: impl Into<String>,
        e: impl std::fmt::Display,
    ) -> Self {
        Self::Store { operation, object_key: Some(object_key.into()), message: e.to_string() }
    }

    /// Returns true if retrying the operation later may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Store { .. } | Self::LockTimeout { .. } | Self::Io(_))
    }

    /// Returns the object key this error refers to, if any.
    #[must_use]
    pub fn object_key(&self) -> Option<&str> {
        match self {
            Self::Store { object_key, .. } => object_key.as_deref(),
            Self::DuplicateKey { object_key }
            | Self::UnexpectedRowCount { object_key, .. }
            | Self::NotFound { object_key }
            | Self::LockTimeout { object_key, .. } => Some(object_key),
            Self::Config(_) | Self::Io(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::store_for("claim", "photos/1", "disk on fire");
        assert_eq!(err.to_string(), "store error during claim (object photos/1): disk on fire");

        let err = Error::store("stats", "disk on fire");
        assert_eq!(err.to_string(), "store error during stats (object -): disk on fire");

        let err = Error::UnexpectedRowCount {
            operation: "mark_replicated",
            object_key: "photos/1".to_string(),
            affected: 0,
        };
        assert_eq!(
            err.to_string(),
            "mark_replicated on photos/1: expected 1 row to be updated, but got 0"
        );
    }

    #[test]
    fn test_is_transient() {
        assert!(Error::store("claim", "x").is_transient());
        assert!(Error::LockTimeout { object_key: "k".into(), waited_ms: 10 }.is_transient());
        assert!(!Error::DuplicateKey { object_key: "k".into() }.is_transient());
        assert!(!Error::NotFound { object_key: "k".into() }.is_transient());
    }

    #[test]
    fn test_object_key() {
        assert_eq!(Error::DuplicateKey { object_key: "k".into() }.object_key(), Some("k"));
        assert_eq!(Error::store("stats", "x").object_key(), None);
        assert_eq!(Error::Config("bad".into()).object_key(), None);
    }
}
