//! Configuration object types.
//!
//! Loading and file-format concerns live in the deployment layer; this
//! module only defines the shapes the pipeline consumes, with serde
//! defaults matching the deployment defaults, and structural validation.

use std::path::PathBuf;
use std::time::Duration;

use certvault_imap::{RetryPolicy, SessionConfig};
use serde::Deserialize;

use crate::{Error, Result};

/// Top-level configuration consumed by the scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Root of the archive directory tree.
    pub base_path: PathBuf,
    /// Maximum number of accounts processed in parallel.
    #[serde(default = "defaults::concurrency")]
    pub concurrency: usize,
    /// Retry/backoff policy for transient IMAP failures.
    #[serde(default)]
    pub retry: RetrySettings,
    /// IMAP client settings.
    #[serde(default)]
    pub imap: ImapSettings,
    /// Recurring-run settings.
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    /// Extraction cache settings.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Accounts to archive.
    pub accounts: Vec<AccountConfig>,
}

/// One certified-mail account.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    /// Mailbox address, e.g. `box@pec.example`.
    pub address: String,
    /// IMAP server hostname.
    pub host: String,
    /// IMAP port.
    #[serde(default = "defaults::imap_port")]
    pub port: u16,
    /// Mailbox password.
    pub password: String,
    /// Folders to archive, in processing order.
    pub folders: Vec<String>,
}

impl AccountConfig {
    /// The part of the address before `@`, used in the directory layout.
    #[must_use]
    pub fn local_part(&self) -> &str {
        self.address.split('@').next().unwrap_or(&self.address)
    }

    /// Builds the IMAP session configuration for this account.
    #[must_use]
    pub fn session_config(&self, imap: &ImapSettings) -> SessionConfig {
        SessionConfig::new(self.host.clone(), self.port)
            .credentials(self.address.clone(), self.password.clone())
            .timeout(Duration::from_secs(imap.timeout_secs))
    }
}

/// Retry policy settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Seconds before the first retry.
    pub initial_delay: u64,
    /// Delay multiplier per retry.
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: 5,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetrySettings {
    /// Converts to the IMAP crate's policy type.
    #[must_use]
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_secs(self.initial_delay),
            backoff_multiplier: self.backoff_multiplier,
        }
    }
}

/// IMAP client settings shared by all accounts.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct ImapSettings {
    /// Per-operation network timeout in seconds.
    pub timeout_secs: u64,
    /// Messages fetched per batch.
    pub batch_size: usize,
}

impl Default for ImapSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            batch_size: 100,
        }
    }
}

/// Recurring-run settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSettings {
    /// Daily trigger time, `HH:MM`, in the deployment's local time zone.
    pub run_time: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            run_time: "01:00".to_string(),
        }
    }
}

/// Extraction cache settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Whether extracted messages are retained at all.
    pub enabled: bool,
    /// Maximum total cache footprint in megabytes.
    pub max_size_mb: u64,
    /// Directory backing the cache.
    pub path: PathBuf,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_size_mb: 500,
            path: PathBuf::from("extract-cache"),
        }
    }
}

impl CacheSettings {
    /// Maximum footprint in bytes.
    #[must_use]
    pub const fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }
}

impl Config {
    /// Validates the configuration structurally.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(Error::Config("base_path must not be empty".into()));
        }
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.accounts.is_empty() {
            return Err(Error::Config("at least one account must be configured".into()));
        }
        for (i, account) in self.accounts.iter().enumerate() {
            if !account.address.contains('@') {
                return Err(Error::Config(format!(
                    "account {}: address '{}' is not a mailbox address",
                    i + 1,
                    account.address
                )));
            }
            if account.host.is_empty() {
                return Err(Error::Config(format!("account {}: host is empty", i + 1)));
            }
            if account.folders.is_empty() {
                return Err(Error::Config(format!(
                    "account {}: at least one folder must be specified",
                    i + 1
                )));
            }
        }
        crate::scheduler::parse_run_time(&self.scheduler.run_time)?;
        if self.cache.enabled && self.cache.max_size_mb == 0 {
            return Err(Error::Config(
                "cache.max_size_mb must be at least 1 when the cache is enabled".into(),
            ));
        }
        Ok(())
    }
}

mod defaults {
    pub(super) const fn concurrency() -> usize {
        4
    }

    pub(super) const fn imap_port() -> u16 {
        993
    }
}
