// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Replica targets and per-object replication records.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A storage provider that holds a replica of an object.
///
/// The set is closed; per-target state is kept in arrays indexed by
/// [`ReplicaTarget::index`] in [`ReplicaTarget::ALL`] order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ReplicaTarget {
    /// Backblaze B2.
    #[serde(rename = "b2")]
    Backblaze,
    /// Wasabi.
    #[serde(rename = "wasabi")]
    Wasabi,
    /// Scaleway object storage.
    #[serde(rename = "scw")]
    Scaleway,
}

impl ReplicaTarget {
    /// Number of replica targets.
    pub const COUNT: usize = 3;

    /// Every target, in storage order.
    pub const ALL: [ReplicaTarget; Self::COUNT] = [Self::Backblaze, Self::Wasabi, Self::Scaleway];

    /// Position of this target in per-target arrays.
    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Backblaze => 0,
            Self::Wasabi => 1,
            Self::Scaleway => 2,
        }
    }

    /// Short name used in configuration, the CLI and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backblaze => "b2",
            Self::Wasabi => "wasabi",
            Self::Scaleway => "scw",
        }
    }
}

impl std::fmt::Display for ReplicaTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ReplicaTarget {
    type Err = ParseReplicaTargetError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "b2" | "backblaze" => Ok(Self::Backblaze),
            "wasabi" => Ok(Self::Wasabi),
            "scw" | "scaleway" => Ok(Self::Scaleway),
            _ => Err(ParseReplicaTargetError(s.to_string())),
        }
    }
}

/// Error parsing a replica target name.
#[derive(Debug, Clone)]
pub struct ParseReplicaTargetError(String);

impl std::fmt::Display for ParseReplicaTargetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid replica target '{}': expected 'b2', 'wasabi', or 'scw'", self.0)
    }
}

impl std::error::Error for ParseReplicaTargetError {}

/// A set of boolean flags, one per replica target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetFlags([bool; ReplicaTarget::COUNT]);

impl TargetFlags {
    /// No target set.
    #[must_use]
    pub const fn none() -> Self {
        Self([false; ReplicaTarget::COUNT])
    }

    /// Every target set.
    #[must_use]
    pub const fn all() -> Self {
        Self([true; ReplicaTarget::COUNT])
    }

    /// Returns a copy with `target` set.
    #[must_use]
    pub fn with(mut self, target: ReplicaTarget) -> Self {
        self.0[target.index()] = true;
        self
    }

    /// Returns whether `target` is set.
    #[must_use]
    pub fn get(&self, target: ReplicaTarget) -> bool {
        self.0[target.index()]
    }

    /// Sets or clears `target`.
    pub fn set(&mut self, target: ReplicaTarget, value: bool) {
        self.0[target.index()] = value;
    }

    /// Iterates the targets that are set.
    pub fn targets(&self) -> impl Iterator<Item = ReplicaTarget> + '_ {
        ReplicaTarget::ALL.into_iter().filter(|t| self.get(*t))
    }
}

impl FromIterator<ReplicaTarget> for TargetFlags {
    fn from_iter<I: IntoIterator<Item = ReplicaTarget>>(iter: I) -> Self {
        iter.into_iter().fold(Self::none(), Self::with)
    }
}

/// Replication state of one object on one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TargetState {
    /// Whether a copy on this target is still desired.
    pub want: bool,
    /// When the copy was last confirmed, `None` if never (or since a reset).
    pub have: Option<DateTime<Utc>>,
}

impl TargetState {
    /// Wanted but not yet confirmed.
    #[inline]
    #[must_use]
    pub fn is_missing(&self) -> bool {
        self.want && self.have.is_none()
    }
}

/// Per-object replication bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationRecord {
    /// Unique key of the stored object.
    pub object_key: String,
    /// State per target, indexed by [`ReplicaTarget::index`].
    pub targets: [TargetState; ReplicaTarget::COUNT],
    /// When a claim on this record last recorded an attempt.
    pub last_attempt: Option<DateTime<Utc>>,
}

impl ReplicationRecord {
    /// Builds the initial record for an object that was just written to
    /// `completed` at `now`. The completed target is always wanted.
    #[must_use]
    pub fn new(
        object_key: impl Into<String>,
        wants: TargetFlags,
        completed: ReplicaTarget,
        now: DateTime<Utc>,
    ) -> Self {
        let mut targets = [TargetState::default(); ReplicaTarget::COUNT];
        for target in ReplicaTarget::ALL {
            targets[target.index()].want = wants.get(target);
        }
        targets[completed.index()] = TargetState { want: true, have: Some(now) };

        Self { object_key: object_key.into(), targets, last_attempt: None }
    }

    /// State of one target.
    #[must_use]
    pub fn target(&self, target: ReplicaTarget) -> &TargetState {
        &self.targets[target.index()]
    }

    /// Mutable state of one target.
    pub fn target_mut(&mut self, target: ReplicaTarget) -> &mut TargetState {
        &mut self.targets[target.index()]
    }

    /// Targets that are wanted but not yet confirmed.
    pub fn missing_targets(&self) -> impl Iterator<Item = ReplicaTarget> + '_ {
        ReplicaTarget::ALL.into_iter().filter(|t| self.target(*t).is_missing())
    }

    /// Whether any wanted target still lacks a confirmed copy.
    #[must_use]
    pub fn needs_replication(&self) -> bool {
        self.missing_targets().next().is_some()
    }

    /// Whether the last attempt is recent enough to still be backing off.
    #[must_use]
    pub fn in_backoff(&self, now: DateTime<Utc>, backoff: Duration) -> bool {
        match self.last_attempt {
            None => false,
            Some(last) => {
                let window = i64::try_from(backoff.as_micros()).unwrap_or(i64::MAX);
                now.timestamp_micros().saturating_sub(last.timestamp_micros()) <= window
            }
        }
    }

    /// The claim predicate: some wanted target is missing and the last attempt
    /// is absent or strictly older than `now - backoff`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>, backoff: Duration) -> bool {
        self.needs_replication() && !self.in_backoff(now, backoff)
    }
}

/// Summary counts over the whole ledger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Total number of records.
    pub records: u64,
    /// Records that can be claimed right now.
    pub eligible: u64,
    /// Records with missing targets whose last attempt is inside the backoff window.
    pub backing_off: u64,
    /// Per target, records where the target is wanted but missing.
    pub missing: [u64; ReplicaTarget::COUNT],
    /// Per target, records where the target holds a confirmed copy.
    pub replicated: [u64; ReplicaTarget::COUNT],
    /// Rows that could not be decoded. Not counted in `records`.
    #[serde(default)]
    pub unreadable: u64,
}

impl LedgerStats {
    /// Folds one record into the counts.
    pub fn observe(&mut self, record: &ReplicationRecord, now: DateTime<Utc>, backoff: Duration) {
        self.records += 1;
        for target in ReplicaTarget::ALL {
            let state = record.target(target);
            if state.is_missing() {
                self.missing[target.index()] += 1;
            }
            if state.have.is_some() {
                self.replicated[target.index()] += 1;
            }
        }
        if record.needs_replication() {
            if record.in_backoff(now, backoff) {
                self.backing_off += 1;
            } else {
                self.eligible += 1;
            }
        }
    }

    /// Wanted-but-missing count for one target.
    #[must_use]
    pub fn missing_for(&self, target: ReplicaTarget) -> u64 {
        self.missing[target.index()]
    }

    /// Replicated count for one target.
    #[must_use]
    pub fn replicated_for(&self, target: ReplicaTarget) -> u64 {
        self.replicated[target.index()]
    }
}
