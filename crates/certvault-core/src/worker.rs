//! Per-account archival job.
//!
//! [`AccountWorker::run`] drives one account through one day: connect,
//! fetch folder by folder, store and index every message, seal the
//! archive, verify it, and write `summary.json`. A summary is written
//! on every outcome that produced a per-date directory, including
//! outright failure.
//!
//! Folder failures are isolated: a folder that keeps failing after its
//! retries are exhausted is recorded as an error and the remaining
//! folders still run. Only an authentication rejection abandons the
//! whole account, since every folder would hit the same wall.

use std::collections::HashMap;
use std::path::PathBuf;

use certvault_imap::{
    Error as ImapError, FolderFetch, ImapStream, RetryPolicy, Session, SessionConfig, Uid,
    with_retry,
};
use chrono::{NaiveDate, Utc};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::config::{AccountConfig, ImapSettings};
use crate::index::{Index, MessageMeta};
use crate::report::{FileNames, JobError, Processing, RunReport, RunStats};
use crate::storage::{SavedMessage, Storage};
use crate::{Error, Result, archive};

/// Produces authenticated IMAP sessions for one account.
///
/// The production implementation dials TLS; tests substitute scripted
/// streams. A factory is reusable: the worker reconnects through it
/// after transient mid-folder failures.
pub trait SessionFactory: Send + Sync {
    /// Transport the sessions run over.
    type Stream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Opens a connection and authenticates.
    fn connect(&self)
    -> impl Future<Output = certvault_imap::Result<Session<Self::Stream>>> + Send;
}

/// [`SessionFactory`] dialing TLS from a [`SessionConfig`].
#[derive(Debug, Clone)]
pub struct TlsSessionFactory {
    config: SessionConfig,
}

impl TlsSessionFactory {
    /// Creates a factory for one server/credential pair.
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }
}

impl SessionFactory for TlsSessionFactory {
    type Stream = ImapStream;

    async fn connect(&self) -> certvault_imap::Result<Session<Self::Stream>> {
        Session::connect(&self.config).await
    }
}

/// One account-day archival job.
#[derive(Debug)]
pub struct AccountWorker<F> {
    address: String,
    folders: Vec<String>,
    base_path: PathBuf,
    factory: F,
    retry: RetryPolicy,
    batch_size: usize,
}

impl AccountWorker<TlsSessionFactory> {
    /// Builds a TLS-backed worker from configuration.
    #[must_use]
    pub fn from_config(
        account: &AccountConfig,
        imap: &ImapSettings,
        base_path: impl Into<PathBuf>,
        retry: RetryPolicy,
    ) -> Self {
        Self::new(
            account.address.clone(),
            account.folders.clone(),
            base_path,
            TlsSessionFactory::new(account.session_config(imap)),
            retry,
            imap.batch_size,
        )
    }
}

impl<F: SessionFactory> AccountWorker<F> {
    /// Mailbox address this worker archives.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Builds a worker over an arbitrary session factory.
    #[must_use]
    pub fn new(
        address: String,
        folders: Vec<String>,
        base_path: impl Into<PathBuf>,
        factory: F,
        retry: RetryPolicy,
        batch_size: usize,
    ) -> Self {
        Self {
            address,
            folders,
            base_path: base_path.into(),
            factory,
            retry,
            batch_size,
        }
    }

    /// Runs the job for one day. Never fails outright: every outcome is
    /// expressed as the returned [`RunReport`].
    pub async fn run(&self, date: NaiveDate) -> RunReport {
        let started_at = Utc::now();
        tracing::info!(account = %self.address, %date, "archival job started");

        let mut storage = Storage::new(&self.base_path);
        let mut index = Index::new();
        let mut errors: Vec<JobError> = Vec::new();
        let mut sealed = None;

        let day_dir = match storage
            .create_directory_structure(&self.address, date, &self.folders)
            .await
        {
            Ok(dir) => Some(dir),
            Err(e) => {
                tracing::error!(account = %self.address, error = %e, "cannot create layout");
                errors.push(JobError::new("storage", None, e.to_string()));
                None
            }
        };

        if let Some(day_dir) = &day_dir {
            let mut session = match with_retry(&self.retry, || self.factory.connect()).await {
                Ok(session) => Some(session),
                Err(e) => {
                    let kind = match &e {
                        ImapError::Auth(_) => "auth",
                        _ => "connection",
                    };
                    tracing::error!(account = %self.address, error = %e, "cannot connect");
                    errors.push(JobError::new(kind, None, e.to_string()));
                    None
                }
            };

            if session.is_some() {
                for folder in &self.folders {
                    let auth_failed = self
                        .process_folder(&mut session, folder, date, &mut storage, &mut index, &mut errors)
                        .await;
                    if auth_failed {
                        break;
                    }
                }
            }

            if let Some(session) = session {
                if let Err(e) = session.logout().await {
                    tracing::debug!(account = %self.address, error = %e, "logout failed");
                }
            }

            if let Err(e) = index.write_files(day_dir).await {
                errors.push(JobError::new("storage", None, e.to_string()));
            }

            let stats = index.stats();
            if errors.is_empty() || stats.total_messages > 0 {
                match archive::create_archive(day_dir, &self.address, date).await {
                    Ok(archive) => match archive::verify_archive(&archive.path).await {
                        Ok(_) => {
                            index.seal(&archive.name);
                            sealed = Some(archive);
                        }
                        Err(e) => errors.push(JobError::new("archive", None, e.to_string())),
                    },
                    Err(e) => errors.push(JobError::new("archive", None, e.to_string())),
                }
            }
        }

        let stats = RunStats::from(index.stats());
        let status = RunReport::status_for(&errors, &stats, sealed.is_some());
        let report = RunReport {
            account: self.address.clone(),
            date,
            generated_at: Utc::now(),
            status,
            stats,
            archive: sealed.as_ref().map(Into::into),
            processing: Processing::between(started_at, Utc::now()),
            files: FileNames {
                index_csv: "index.csv".to_string(),
                index_json: "index.json".to_string(),
                archive: sealed.as_ref().map(|s| s.name.clone()),
                digest: sealed.as_ref().map(|_| archive::DIGEST_FILE.to_string()),
            },
            errors,
        };

        if let Some(day_dir) = &day_dir {
            if let Err(e) = report.write_summary(day_dir).await {
                tracing::error!(account = %self.address, error = %e, "cannot write summary");
            }
        }
        tracing::info!(
            account = %self.address,
            %date,
            status = ?report.status,
            messages = report.stats.total_messages,
            errors = report.errors.len(),
            "archival job finished"
        );
        report
    }

    /// Processes one folder, reconnecting and re-passing on transient
    /// failures until the retry budget runs out. Returns `true` when
    /// the failure was an authentication rejection, which dooms every
    /// remaining folder too.
    async fn process_folder(
        &self,
        session: &mut Option<Session<F::Stream>>,
        folder: &str,
        date: NaiveDate,
        storage: &mut Storage,
        index: &mut Index,
        errors: &mut Vec<JobError>,
    ) -> bool {
        // Files already written survive a re-pass: the same UID lands
        // on the same path again, last write wins.
        let mut saved: HashMap<Uid, SavedMessage> = HashMap::new();
        let mut attempt = 0u32;
        loop {
            match self
                .folder_pass(session, folder, date, storage, index, &mut saved)
                .await
            {
                Ok(count) => {
                    tracing::info!(account = %self.address, folder, messages = count, "folder done");
                    return false;
                }
                Err(Error::Imap(e)) if e.is_transient() && attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(
                        account = %self.address,
                        folder,
                        attempt,
                        error = %e,
                        delay_secs = delay.as_secs_f64(),
                        "transient folder failure, will reconnect"
                    );
                    *session = None;
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    // A dead transport cannot serve the next folder or
                    // the final logout.
                    if matches!(&e, Error::Imap(ie) if ie.is_transient()) {
                        *session = None;
                    }
                    let auth = matches!(&e, Error::Imap(ImapError::Auth(_)));
                    let kind = match &e {
                        Error::Imap(ImapError::Auth(_)) => "auth",
                        Error::Imap(_) => "fetch",
                        _ => "storage",
                    };
                    tracing::error!(account = %self.address, folder, error = %e, "folder failed");
                    errors.push(JobError::new(kind, Some(folder), e.to_string()));
                    return auth;
                }
            }
        }
    }

    /// One pass over a folder: ensure a session, stream every message,
    /// store and index each one.
    async fn folder_pass(
        &self,
        session: &mut Option<Session<F::Stream>>,
        folder: &str,
        date: NaiveDate,
        storage: &mut Storage,
        index: &mut Index,
        saved: &mut HashMap<Uid, SavedMessage>,
    ) -> Result<usize> {
        if session.is_none() {
            *session = Some(self.factory.connect().await?);
        }
        let Some(session) = session.as_mut() else {
            return Err(Error::Imap(ImapError::InvalidState(
                "no session after connect".into(),
            )));
        };

        let mut fetch = FolderFetch::start(session, folder, date, self.batch_size).await?;
        let mut count = 0usize;
        while let Some(message) = fetch.next().await? {
            let meta = MessageMeta::parse(&message.raw);
            let record = match saved.get(&message.uid) {
                Some(previous) => {
                    storage.overwrite_message(&previous.path, &message.raw).await?;
                    previous.clone()
                }
                None => {
                    let record = storage
                        .save_message(
                            &self.address,
                            date,
                            folder,
                            meta.subject.as_deref(),
                            &message.raw,
                        )
                        .await?;
                    saved.insert(message.uid, record.clone());
                    record
                }
            };
            index.record(
                message.uid,
                folder,
                &meta,
                message.raw.len() as u64,
                &record.relative_path,
            );
            count += 1;
        }
        Ok(count)
    }
}
