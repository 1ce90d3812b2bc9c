//! Read path: serving single messages back out of the archive tree.
//!
//! A message is addressed by account, day and archive-internal path
//! (`<folder>/<filename>.eml`). Resolution order:
//!
//! 1. loose file under the per-date directory (day not yet sealed)
//! 2. entry inside the sealed `archive-<account>-<date>.tar.gz`,
//!    through the extraction cache when one is attached
//!
//! Tar decompression runs on the blocking pool.

use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use chrono::NaiveDate;

use crate::cache::ExtractionCache;
use crate::config::CacheSettings;
use crate::storage::Storage;
use crate::{Error, Result, archive};

/// Read-side handle over an archive tree.
#[derive(Debug, Clone)]
pub struct ReadPath {
    storage: Arc<Storage>,
    cache: Option<Arc<ExtractionCache>>,
}

impl ReadPath {
    /// Creates a read path over `base_path`, optionally caching
    /// extracted messages.
    pub fn new(base_path: impl Into<PathBuf>, cache: Option<Arc<ExtractionCache>>) -> Self {
        Self {
            storage: Arc::new(Storage::new(base_path)),
            cache,
        }
    }

    /// Builds a read path from the deployment's cache settings:
    /// cache-backed when the cache is enabled, plain archive extraction
    /// otherwise. A disabled cache never touches its directory.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] when the cache directory cannot be
    /// created or scanned.
    pub async fn from_settings(
        base_path: impl Into<PathBuf>,
        settings: &CacheSettings,
    ) -> Result<Self> {
        let cache = if settings.enabled {
            let cache =
                ExtractionCache::open(settings.path.clone(), settings.max_size_bytes()).await?;
            Some(Arc::new(cache))
        } else {
            None
        };
        Ok(Self::new(base_path, cache))
    }

    /// The attached extraction cache, when one is enabled.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<ExtractionCache>> {
        self.cache.as_ref()
    }

    /// Expected location of the sealed archive for an account-day,
    /// inside the per-date directory.
    #[must_use]
    pub fn archive_path(&self, account: &str, date: NaiveDate) -> PathBuf {
        self.storage
            .account_dir(account, date)
            .join(archive::archive_name(account, date))
    }

    /// Recomputes and checks the digest of an account-day's archive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DigestMismatch`] on corruption and
    /// [`Error::Archive`] when the archive or sidecar cannot be read.
    pub async fn verify_archive(&self, account: &str, date: NaiveDate) -> Result<String> {
        archive::verify_archive(&self.archive_path(account, date)).await
    }

    /// Fetches one message body.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] when the path is malformed, when
    /// neither a loose file nor a sealed archive holds the message, or
    /// when the archive cannot be read.
    pub async fn fetch_message(
        &self,
        account: &str,
        date: NaiveDate,
        internal_path: &str,
    ) -> Result<Bytes> {
        validate_internal_path(internal_path)?;

        let day_dir = self.storage.account_dir(account, date);
        let loose = day_dir.join(internal_path);
        match tokio::fs::read(&loose).await {
            Ok(bytes) => {
                tracing::debug!(path = %loose.display(), "served from loose file");
                return Ok(Bytes::from(bytes));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Extraction(format!(
                    "cannot read {}: {e}",
                    loose.display()
                )));
            }
        }

        let archive_path = self.archive_path(account, date);
        if !tokio::fs::try_exists(&archive_path).await.unwrap_or(false) {
            return Err(Error::Extraction(format!(
                "no stored message or archive for {account} on {date}: {internal_path}"
            )));
        }

        let archive_name = archive::archive_name(account, date);
        match &self.cache {
            Some(cache) => {
                let key = format!("{archive_name}/{internal_path}");
                let entry = internal_path.to_string();
                cache
                    .get_or_insert_with(&key, || extract_entry(archive_path, entry))
                    .await
            }
            None => extract_entry(archive_path, internal_path.to_string()).await,
        }
    }
}

/// Rejects absolute paths and parent-directory components; a request
/// must never reach outside its per-date directory.
fn validate_internal_path(internal_path: &str) -> Result<()> {
    let path = Path::new(internal_path);
    let plain = !internal_path.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if plain {
        Ok(())
    } else {
        Err(Error::Extraction(format!(
            "invalid message path: {internal_path}"
        )))
    }
}

/// Pulls a single entry out of a sealed archive.
async fn extract_entry(archive_path: PathBuf, internal_path: String) -> Result<Bytes> {
    tokio::task::spawn_blocking(move || extract_blocking(&archive_path, &internal_path))
        .await
        .map_err(|e| Error::Extraction(format!("extraction task panicked: {e}")))?
}

fn extract_blocking(archive_path: &Path, internal_path: &str) -> Result<Bytes> {
    let file = std::fs::File::open(archive_path)
        .map_err(|e| Error::Extraction(format!("cannot open {}: {e}", archive_path.display())))?;
    let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let entries = tar
        .entries()
        .map_err(|e| Error::Extraction(format!("cannot read {}: {e}", archive_path.display())))?;
    for entry in entries {
        let mut entry = entry
            .map_err(|e| Error::Extraction(format!("cannot read {}: {e}", archive_path.display())))?;
        let matches = entry
            .path()
            .is_ok_and(|p| p == Path::new(internal_path));
        if matches {
            let mut body = Vec::with_capacity(usize::try_from(entry.size()).unwrap_or(0));
            entry.read_to_end(&mut body).map_err(|e| {
                Error::Extraction(format!("cannot read entry {internal_path}: {e}"))
            })?;
            tracing::debug!(
                archive = %archive_path.display(),
                entry = internal_path,
                bytes = body.len(),
                "extracted from archive"
            );
            return Ok(Bytes::from(body));
        }
    }
    Err(Error::Extraction(format!(
        "{} has no entry {internal_path}",
        archive_path.display()
    )))
}
