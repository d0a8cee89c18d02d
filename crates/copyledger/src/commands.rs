// Copyright 2024 The Copyledger Authors
// SPDX-License-Identifier: Apache-2.0

//! Admin command handlers.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use copyledger_core::{LedgerStats, ReplicaTarget, ReplicationRecord};
use copyledger_store::Ledger;
use tracing::info;

use crate::cli::{KeyArgs, OutputFormat, ResetArgs, ShowArgs, StatusArgs};

pub async fn handle_status(ledger: &Ledger, args: StatusArgs) -> Result<()> {
    let stats = ledger.stats().await.context("Failed to compute ledger stats")?;

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&stats)?),
        OutputFormat::Text => print!("{}", format_stats(&stats)),
    }

    Ok(())
}

pub async fn handle_show(ledger: &Ledger, args: ShowArgs) -> Result<()> {
    let Some(record) = ledger.get(&args.key).await.context("Failed to read record")? else {
        bail!("No record for object '{}'", args.key);
    };

    match args.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
        OutputFormat::Text => print!("{}", format_record(&record)),
    }

    Ok(())
}

pub async fn handle_reset(ledger: &Ledger, args: ResetArgs) -> Result<()> {
    ledger
        .reset_target(&args.key, args.target)
        .await
        .with_context(|| format!("Failed to reset {} for '{}'", args.target, args.key))?;

    info!(object_key = %args.key, target = %args.target, "Target reset");
    println!("✓ {} will be replicated to {} again", args.key, args.target);
    Ok(())
}

pub async fn handle_unmark(ledger: &Ledger, args: KeyArgs) -> Result<()> {
    let mut txn = ledger.begin();
    if txn.get(&args.key).await.context("Failed to read record")?.is_none() {
        txn.rollback();
        bail!("No record for object '{}'", args.key);
    }
    txn.unmark_all_targets(&args.key).await.context("Failed to unmark targets")?;
    txn.commit().await.context("Failed to commit unmark")?;

    info!(object_key = %args.key, "All targets unmarked");
    println!("✓ {} will no longer be replicated", args.key);
    Ok(())
}

fn format_time(at: Option<DateTime<Utc>>) -> String {
    at.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
}

pub fn format_stats(stats: &LedgerStats) -> String {
    let mut out = String::new();
    out.push_str("\n  Ledger Status\n");
    out.push_str("  ─────────────────────────────────────────────\n");
    out.push_str(&format!("  Records:        {}\n", stats.records));
    out.push_str(&format!("  Eligible:       {}\n", stats.eligible));
    out.push_str(&format!("  Backing off:    {}\n", stats.backing_off));
    if stats.unreadable > 0 {
        out.push_str(&format!("  Unreadable:     {}\n", stats.unreadable));
    }
    out.push('\n');
    out.push_str(&format!("  {:>8}  {:>10}  {:>10}\n", "TARGET", "MISSING", "REPLICATED"));
    for target in ReplicaTarget::ALL {
        out.push_str(&format!(
            "  {:>8}  {:>10}  {:>10}\n",
            target.as_str(),
            stats.missing_for(target),
            stats.replicated_for(target)
        ));
    }
    out.push('\n');
    out
}

pub fn format_record(record: &ReplicationRecord) -> String {
    let mut out = format!("{} (last attempt {})\n", record.object_key, format_time(record.last_attempt));
    for target in ReplicaTarget::ALL {
        let state = record.target(target);
        out.push_str(&format!(
            "  {:>8}  want={:<5}  have={}\n",
            target.as_str(),
            state.want,
            format_time(state.have)
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use copyledger_core::{LedgerConfig, ManualClock, TargetFlags};

    use super::*;

    async fn ledger() -> (tempfile::TempDir, Ledger) {
        let dir = tempfile::tempdir().unwrap();
        let config = LedgerConfig::new().path(dir.path().join("ledger.redb"));
        let clock = Arc::new(ManualClock::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap()));
        let ledger = Ledger::open(&config, clock).unwrap();

        let mut txn = ledger.begin();
        txn.create_record(
            "photos/1.jpg",
            TargetFlags::none().with(ReplicaTarget::Wasabi),
            ReplicaTarget::Backblaze,
        )
        .await
        .unwrap();
        txn.commit().await.unwrap();

        (dir, ledger)
    }

    #[test]
    fn test_format_stats() {
        let stats = LedgerStats {
            records: 3,
            eligible: 1,
            backing_off: 1,
            missing: [0, 2, 0],
            replicated: [3, 1, 0],
            unreadable: 0,
        };
        let text = format_stats(&stats);
        assert!(text.contains("Records:        3"));
        assert!(text.contains("Backing off:    1"));
        assert!(text.contains("wasabi           2           1"));
    }

    #[tokio::test]
    async fn test_format_record() {
        let (_dir, ledger) = ledger().await;
        let record = ledger.get("photos/1.jpg").await.unwrap().unwrap();
        let text = format_record(&record);
        assert!(text.starts_with("photos/1.jpg (last attempt -)"));
        assert!(text.contains("wasabi  want=true   have=-"));
    }

    #[tokio::test]
    async fn test_reset_and_unmark() {
        let (_dir, ledger) = ledger().await;

        handle_reset(
            &ledger,
            ResetArgs { key: "photos/1.jpg".into(), target: ReplicaTarget::Backblaze },
        )
        .await
        .unwrap();
        let record = ledger.get("photos/1.jpg").await.unwrap().unwrap();
        assert!(record.target(ReplicaTarget::Backblaze).have.is_none());

        handle_unmark(&ledger, KeyArgs { key: "photos/1.jpg".into() }).await.unwrap();
        let record = ledger.get("photos/1.jpg").await.unwrap().unwrap();
        assert!(!record.needs_replication());
        assert_eq!(ledger.locked_rows(), 0);
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let (_dir, ledger) = ledger().await;
        assert!(handle_show(&ledger, ShowArgs { key: "nope".into(), format: OutputFormat::Json }).await.is_err());
        assert!(handle_unmark(&ledger, KeyArgs { key: "nope".into() }).await.is_err());
        assert!(handle_reset(
            &ledger,
            ResetArgs { key: "nope".into(), target: ReplicaTarget::Wasabi }
        )
        .await
        .is_err());
        assert_eq!(ledger.locked_rows(), 0);
    }
}
