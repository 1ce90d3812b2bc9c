//! Job and fleet reporting.
//!
//! [`RunReport`] is the outcome of one account-day job and the exact
//! shape of its `summary.json`; [`FleetReport`] aggregates the reports
//! of one scheduler pass for the notification collaborator. Reports
//! round-trip through serde because the read-facing API re-reads
//! summaries from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::archive::SealedArchive;
use crate::index::IndexStats;
use crate::{Error, Result};

/// Terminal state of one account-day job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every folder processed, archive sealed, no errors.
    Success,
    /// Errors occurred but something usable was produced.
    Partial,
    /// Nothing usable was produced.
    Failed,
}

/// One recorded failure inside a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobError {
    /// Failure class (`connection`, `auth`, `fetch`, `storage`,
    /// `archive`).
    pub kind: String,
    /// Folder being processed, when the failure was folder-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
    /// Human-readable description.
    pub message: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl JobError {
    /// Records a failure now.
    #[must_use]
    pub fn new(kind: &str, folder: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.to_string(),
            folder: folder.map(str::to_string),
            message: message.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Message counters for one job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunStats {
    /// Messages stored across all folders.
    pub total_messages: usize,
    /// Sum of raw message sizes.
    pub total_size_bytes: u64,
    /// Messages stored per folder.
    pub folders: BTreeMap<String, usize>,
}

impl From<IndexStats> for RunStats {
    fn from(stats: IndexStats) -> Self {
        Self {
            total_messages: stats.total_messages,
            total_size_bytes: stats.total_bytes,
            folders: stats.per_folder,
        }
    }
}

/// Metadata of the sealed archive, absent when sealing never happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveMetadata {
    /// Archive filename.
    pub filename: String,
    /// Compressed size in bytes.
    pub size_bytes: u64,
    /// Lowercase hex SHA-256 of the compressed bytes.
    pub sha256: String,
}

impl From<&SealedArchive> for ArchiveMetadata {
    fn from(sealed: &SealedArchive) -> Self {
        Self {
            filename: sealed.name.clone(),
            size_bytes: sealed.size,
            sha256: sealed.sha256.clone(),
        }
    }
}

/// Wall-clock span of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Processing {
    /// Job start.
    pub started_at: DateTime<Utc>,
    /// Job end.
    pub finished_at: DateTime<Utc>,
    /// End minus start, in seconds.
    pub duration_seconds: f64,
}

impl Processing {
    /// Builds the span from two instants.
    #[must_use]
    pub fn between(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> Self {
        let duration = (finished_at - started_at)
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            started_at,
            finished_at,
            duration_seconds: duration,
        }
    }
}

/// Names of the files the job left in the per-date directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileNames {
    /// CSV index filename.
    pub index_csv: String,
    /// JSON index filename.
    pub index_json: String,
    /// Archive filename, absent when sealing never happened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<String>,
    /// Digest sidecar filename, absent alongside `archive`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Outcome of one account-day job; serialized as `summary.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    /// Mailbox address.
    pub account: String,
    /// Day that was archived.
    pub date: NaiveDate,
    /// When this report was produced.
    pub generated_at: DateTime<Utc>,
    /// Terminal state.
    pub status: RunStatus,
    /// Message counters.
    pub stats: RunStats,
    /// Sealed archive metadata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub archive: Option<ArchiveMetadata>,
    /// Wall-clock span.
    pub processing: Processing,
    /// Files left in the per-date directory.
    pub files: FileNames,
    /// Failures, empty on full success.
    pub errors: Vec<JobError>,
}

impl RunReport {
    /// Derives the terminal state: no errors is success; errors with at
    /// least one stored message or a sealed archive is partial;
    /// otherwise the job failed outright.
    #[must_use]
    pub fn status_for(errors: &[JobError], stats: &RunStats, archive_sealed: bool) -> RunStatus {
        if errors.is_empty() {
            RunStatus::Success
        } else if stats.total_messages > 0 || archive_sealed {
            RunStatus::Partial
        } else {
            RunStatus::Failed
        }
    }

    /// Writes this report as `summary.json` inside `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on write failure or [`Error::Serde`]
    /// on serialization failure.
    pub async fn write_summary(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("summary.json");
        let body = serde_json::to_string_pretty(self)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", path.display())))?;
        Ok(path)
    }
}

/// Per-account row inside a [`FleetReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRow {
    /// Mailbox address.
    pub account: String,
    /// Terminal state of the account's job.
    pub status: RunStatus,
    /// Messages stored.
    pub total_messages: usize,
    /// Failure count.
    pub errors: usize,
}

/// Aggregate of one scheduler pass over all accounts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetReport {
    /// Day the pass archived.
    pub date: NaiveDate,
    /// When the aggregate was produced.
    pub generated_at: DateTime<Utc>,
    /// Accounts the pass attempted.
    pub accounts_processed: usize,
    /// Jobs that finished `success`.
    pub accounts_successful: usize,
    /// Jobs that finished `partial`.
    pub accounts_partial: usize,
    /// Jobs that finished `failed`.
    pub accounts_failed: usize,
    /// Messages stored across the fleet.
    pub total_messages: usize,
    /// Bytes stored across the fleet.
    pub total_bytes: u64,
    /// Failures across the fleet.
    pub total_errors: usize,
    /// One row per account, in configuration order.
    pub accounts: Vec<AccountRow>,
}

impl FleetReport {
    /// Rolls the pass's reports up into the fleet aggregate.
    #[must_use]
    pub fn aggregate(date: NaiveDate, reports: &[RunReport]) -> Self {
        let mut aggregate = Self {
            date,
            generated_at: Utc::now(),
            accounts_processed: reports.len(),
            accounts_successful: 0,
            accounts_partial: 0,
            accounts_failed: 0,
            total_messages: 0,
            total_bytes: 0,
            total_errors: 0,
            accounts: Vec::with_capacity(reports.len()),
        };
        for report in reports {
            match report.status {
                RunStatus::Success => aggregate.accounts_successful += 1,
                RunStatus::Partial => aggregate.accounts_partial += 1,
                RunStatus::Failed => aggregate.accounts_failed += 1,
            }
            aggregate.total_messages += report.stats.total_messages;
            aggregate.total_bytes += report.stats.total_size_bytes;
            aggregate.total_errors += report.errors.len();
            aggregate.accounts.push(AccountRow {
                account: report.account.clone(),
                status: report.status,
                total_messages: report.stats.total_messages,
                errors: report.errors.len(),
            });
        }
        aggregate
    }
}
