//! Canonical on-disk layout and atomic message writes.
//!
//! Layout, stable across runs:
//!
//! ```text
//! <base>/<account-local-part>/<YYYY>/<YYYY-MM-DD>/<folder>/<seq>_<subject>.eml
//! ```
//!
//! The per-date directory is exclusively owned by its job for the
//! duration of the job; nothing here locks across processes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::{Error, Result};

/// Longest filename fragment taken from a subject.
const SUBJECT_FRAGMENT_LEN: usize = 50;

/// Longest sanitized filename component.
const MAX_FILENAME_LEN: usize = 200;

/// Replaces filesystem-hostile characters and strips control characters.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let mut out: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    out.truncate(
        out.char_indices()
            .nth(MAX_FILENAME_LEN)
            .map_or(out.len(), |(i, _)| i),
    );
    out
}

/// Sanitizes an IMAP folder name for use as a directory name.
///
/// Spaces become underscores so `Posta inviata` round-trips through
/// shells and archive-internal paths without quoting.
#[must_use]
pub fn sanitize_folder_name(folder: &str) -> String {
    sanitize_filename(&folder.replace(' ', "_"))
}

/// Derives the filename fragment from a message subject.
#[must_use]
pub fn subject_fragment(subject: Option<&str>) -> String {
    let subject = subject.map(str::trim).filter(|s| !s.is_empty());
    let Some(subject) = subject else {
        return "no_subject".to_string();
    };
    let mut fragment = sanitize_filename(subject);
    fragment.truncate(
        fragment
            .char_indices()
            .nth(SUBJECT_FRAGMENT_LEN)
            .map_or(fragment.len(), |(i, _)| i),
    );
    if fragment.is_empty() {
        "no_subject".to_string()
    } else {
        fragment
    }
}

/// A message written to disk.
#[derive(Debug, Clone)]
pub struct SavedMessage {
    /// Absolute path of the written file.
    pub path: PathBuf,
    /// Filename component.
    pub filename: String,
    /// Path relative to the per-date directory (`<folder>/<filename>`),
    /// which doubles as the archive-internal path after sealing.
    pub relative_path: String,
}

/// Storage handle for one archive tree.
///
/// Owns the per-folder sequence counters, so one handle belongs to one
/// job; sequence numbers restart at 1 for every job.
#[derive(Debug)]
pub struct Storage {
    base_path: PathBuf,
    sequence: HashMap<String, u32>,
}

impl Storage {
    /// Creates a storage handle rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            sequence: HashMap::new(),
        }
    }

    /// Root of the archive tree.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Per-date directory for an account:
    /// `<base>/<local-part>/<YYYY>/<YYYY-MM-DD>`.
    #[must_use]
    pub fn account_dir(&self, account: &str, date: NaiveDate) -> PathBuf {
        let local = account.split('@').next().unwrap_or(account);
        self.base_path
            .join(sanitize_filename(local))
            .join(date.format("%Y").to_string())
            .join(date.format("%Y-%m-%d").to_string())
    }

    /// Folder directory inside the per-date directory.
    #[must_use]
    pub fn folder_dir(&self, account: &str, date: NaiveDate, folder: &str) -> PathBuf {
        self.account_dir(account, date).join(sanitize_folder_name(folder))
    }

    /// Creates the per-date directory and one subdirectory per folder.
    ///
    /// Idempotent: pre-existing directories are left as they are.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] when a directory cannot be created.
    pub async fn create_directory_structure(
        &self,
        account: &str,
        date: NaiveDate,
        folders: &[String],
    ) -> Result<PathBuf> {
        let account_dir = self.account_dir(account, date);
        for folder in folders {
            let dir = account_dir.join(sanitize_folder_name(folder));
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Storage(format!("cannot create {}: {e}", dir.display()))
            })?;
            tracing::debug!(dir = %dir.display(), "directory ready");
        }
        Ok(account_dir)
    }

    /// Writes a message under the next sequence number for its folder.
    ///
    /// The write is atomic with respect to partial content: bytes go to
    /// a temporary name in the same directory and are renamed into place,
    /// so a crash never leaves a half-written file under the final name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any I/O failure.
    pub async fn save_message(
        &mut self,
        account: &str,
        date: NaiveDate,
        folder: &str,
        subject: Option<&str>,
        raw: &[u8],
    ) -> Result<SavedMessage> {
        let folder_name = sanitize_folder_name(folder);
        let dir = self.account_dir(account, date).join(&folder_name);

        let seq = self.sequence.entry(folder_name.clone()).or_insert(0);
        *seq += 1;
        let filename = format!("{:04}_{}.eml", *seq, subject_fragment(subject));
        let path = dir.join(&filename);

        write_atomic(&path, raw).await?;
        tracing::debug!(path = %path.display(), bytes = raw.len(), "message stored");

        Ok(SavedMessage {
            path,
            relative_path: format!("{folder_name}/{filename}"),
            filename,
        })
    }

    /// Rewrites an already-saved message in place (duplicate UID,
    /// last write wins). Same atomicity as [`Self::save_message`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on any I/O failure.
    pub async fn overwrite_message(&self, path: &Path, raw: &[u8]) -> Result<()> {
        write_atomic(path, raw).await
    }
}

async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Storage(format!("invalid path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| Error::Storage(format!("cannot write {}: {e}", tmp.display())))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| Error::Storage(format!("cannot rename into {}: {e}", path.display())))
}
