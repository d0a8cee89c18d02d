// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Upload error types.

use copyledger_core::ReplicaTarget;
use thiserror::Error;

/// Errors reported by a [`ReplicaUploader`](crate::ReplicaUploader).
///
/// None of these are fatal to the worker. A failed upload leaves the target
/// missing and the record backs off until the next attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    /// The local copy of the object could not be read.
    #[error("source object {object_key} is not readable: {reason}")]
    SourceUnavailable {
        /// The object that could not be read.
        object_key: String,
        /// The reason for failure.
        reason: String,
    },

    /// The target rejected or failed the upload.
    #[error("upload to {target} failed: {reason}")]
    Failed {
        /// The target that failed.
        target: ReplicaTarget,
        /// The reason for failure.
        reason: String,
    },

    /// The upload did not finish within the configured timeout.
    #[error("upload to {target} timed out after {timeout_ms}ms")]
    Timeout {
        /// The target that timed out.
        target: ReplicaTarget,
        /// The timeout duration in milliseconds.
        timeout_ms: u64,
    },
}

impl UploadError {
    /// Shorthand for [`UploadError::Failed`].
    pub fn failed(target: ReplicaTarget, reason: impl Into<String>) -> Self {
        Self::Failed { target, reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = UploadError::Timeout { target: ReplicaTarget::Wasabi, timeout_ms: 1500 };
        assert_eq!(err.to_string(), "upload to wasabi timed out after 1500ms");

        let err = UploadError::failed(ReplicaTarget::Backblaze, "403 Forbidden");
        assert_eq!(err.to_string(), "upload to b2 failed: 403 Forbidden");

        let err = UploadError::SourceUnavailable {
            object_key: "photos/1.jpg".into(),
            reason: "no such file".into(),
        };
        assert_eq!(err.to_string(), "source object photos/1.jpg is not readable: no such file");
    }
}
