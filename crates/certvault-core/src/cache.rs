//! Size-bounded disk cache for messages extracted from sealed archives.
//!
//! Entries are whole `.eml` bodies keyed by a slash-separated string
//! (archive name plus internal path); the key doubles as the file's
//! path under the cache root. Eviction is least-recently-used over a
//! logical access clock, and runs synchronously inside [`insert`]
//! before it returns, so the configured budget is only ever exceeded
//! while an insert is in progress.
//!
//! Readers hold [`Bytes`] bodies, never open files across await points,
//! so eviction can delete any file at any time without invalidating an
//! in-progress read.
//!
//! [`insert`]: ExtractionCache::insert

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use bytes::Bytes;
use tokio::sync::Mutex as AsyncMutex;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
struct EntryMeta {
    size: u64,
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, EntryMeta>,
    total: u64,
    clock: u64,
}

impl CacheState {
    fn touch(&mut self, key: &str) -> bool {
        self.clock += 1;
        let clock = self.clock;
        match self.entries.get_mut(key) {
            Some(meta) => {
                meta.last_access = clock;
                true
            }
            None => false,
        }
    }

    fn remove(&mut self, key: &str) -> Option<EntryMeta> {
        let meta = self.entries.remove(key)?;
        self.total -= meta.size;
        Some(meta)
    }

    fn insert(&mut self, key: String, size: u64) {
        self.clock += 1;
        let clock = self.clock;
        if let Some(old) = self.entries.insert(
            key,
            EntryMeta {
                size,
                last_access: clock,
            },
        ) {
            self.total -= old.size;
        }
        self.total += size;
    }

    /// Pops keys in LRU order until `total` fits `max`.
    fn evict_to(&mut self, max: u64) -> Vec<String> {
        let mut victims = Vec::new();
        while self.total > max {
            let Some(key) = self
                .entries
                .iter()
                .min_by_key(|(_, meta)| meta.last_access)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            self.remove(&key);
            victims.push(key);
        }
        victims
    }
}

/// Disk-backed LRU cache of extracted messages.
///
/// Cheap to clone is not a goal; share it behind an [`Arc`].
#[derive(Debug)]
pub struct ExtractionCache {
    root: PathBuf,
    max_bytes: u64,
    state: StdMutex<CacheState>,
    in_flight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ExtractionCache {
    /// Opens (or creates) a cache rooted at `root`, bounded to
    /// `max_bytes`.
    ///
    /// Files already present under `root` are adopted as entries, with
    /// recency seeded from their modification times, then trimmed to
    /// the budget. Leftovers from a previous process thus keep serving
    /// hits after a restart.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] when the root cannot be created or
    /// scanned.
    pub async fn open(root: impl Into<PathBuf>, max_bytes: u64) -> Result<Self> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Extraction(format!("cannot create {}: {e}", root.display())))?;

        let scan_root = root.clone();
        let found = tokio::task::spawn_blocking(move || scan_existing(&scan_root))
            .await
            .map_err(|e| Error::Extraction(format!("scan task panicked: {e}")))??;

        let mut state = CacheState::default();
        for (key, size) in found {
            state.insert(key, size);
        }
        let adopted = state.entries.len();
        let victims = state.evict_to(max_bytes);

        let cache = Self {
            root,
            max_bytes,
            state: StdMutex::new(state),
            in_flight: AsyncMutex::new(HashMap::new()),
        };
        cache.delete_files(&victims).await;
        tracing::debug!(
            root = %cache.root.display(),
            adopted,
            evicted = victims.len(),
            "extraction cache ready"
        );
        Ok(cache)
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sum of cached entry sizes.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.lock_state().total
    }

    /// Fetches an entry, refreshing its recency.
    ///
    /// A bookkept entry whose backing file has gone missing (external
    /// deletion) is dropped and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<Bytes> {
        if !self.lock_state().touch(key) {
            return None;
        }
        let path = self.root.join(key);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Some(Bytes::from(bytes)),
            Err(e) => {
                tracing::warn!(key, error = %e, "cached file unreadable, dropping entry");
                self.lock_state().remove(key);
                None
            }
        }
    }

    /// Stores an entry and evicts down to the budget before returning.
    ///
    /// A body larger than the whole budget is not cached at all; the
    /// caller still has the bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Extraction`] when the entry file cannot be
    /// written.
    pub async fn insert(&self, key: &str, body: &Bytes) -> Result<()> {
        let size = body.len() as u64;
        if size > self.max_bytes {
            tracing::warn!(key, bytes = size, "body exceeds cache budget, not caching");
            return Ok(());
        }

        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Extraction(format!("cannot create {}: {e}", parent.display())))?;
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| Error::Extraction(format!("invalid cache key: {key}")))?;
        let tmp = path.with_file_name(format!(".{file_name}.tmp"));
        tokio::fs::write(&tmp, body)
            .await
            .map_err(|e| Error::Extraction(format!("cannot write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| Error::Extraction(format!("cannot rename into {}: {e}", path.display())))?;

        let victims = {
            let mut state = self.lock_state();
            state.insert(key.to_string(), size);
            state.evict_to(self.max_bytes)
        };
        self.delete_files(&victims).await;
        Ok(())
    }

    /// Looks up `key`, running `produce` on a miss and caching its
    /// result.
    ///
    /// Concurrent callers for the same key are collapsed: one runs
    /// `produce`, the rest wait and then hit the fresh entry. Callers
    /// for different keys do not contend.
    ///
    /// # Errors
    ///
    /// Propagates the error from `produce`; a cache write failure after
    /// a successful `produce` is logged but not propagated, since the
    /// caller got its bytes.
    pub async fn get_or_insert_with<F, Fut>(&self, key: &str, produce: F) -> Result<Bytes>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Bytes>>,
    {
        let gate = {
            let mut in_flight = self.in_flight.lock().await;
            Arc::clone(
                in_flight
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };

        let result = {
            let _guard = gate.lock().await;
            if let Some(hit) = self.get(key).await {
                Ok(hit)
            } else {
                match produce().await {
                    Ok(body) => {
                        if let Err(e) = self.insert(key, &body).await {
                            tracing::warn!(key, error = %e, "extraction succeeded but caching failed");
                        }
                        Ok(body)
                    }
                    Err(e) => Err(e),
                }
            }
        };

        let mut in_flight = self.in_flight.lock().await;
        if in_flight
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 2)
        {
            in_flight.remove(key);
        }
        drop(in_flight);

        result
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CacheState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Deletes evicted files and prunes directories they leave empty.
    async fn delete_files(&self, keys: &[String]) {
        for key in keys {
            let path = self.root.join(key);
            if let Err(e) = tokio::fs::remove_file(&path).await {
                tracing::warn!(key, error = %e, "cannot delete evicted entry");
            }
            let mut dir = path.parent().map(Path::to_path_buf);
            while let Some(d) = dir {
                if d == self.root || tokio::fs::remove_dir(&d).await.is_err() {
                    break;
                }
                dir = d.parent().map(Path::to_path_buf);
            }
        }
        if !keys.is_empty() {
            tracing::debug!(evicted = keys.len(), "cache trimmed");
        }
    }
}

/// Walks the cache root, returning `(key, size)` pairs ordered oldest
/// modification first, so adoption assigns older files lower recency.
fn scan_existing(root: &Path) -> Result<Vec<(String, u64)>> {
    let mut found: Vec<(String, u64, SystemTime)> = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir)
            .map_err(|e| Error::Extraction(format!("cannot scan {}: {e}", dir.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::Extraction(format!("cannot scan {}: {e}", dir.display())))?;
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if let Ok(meta) = entry.metadata() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                // Abandoned in-progress writes are not entries.
                if name.starts_with('.') && name.ends_with(".tmp") {
                    let _ = std::fs::remove_file(&path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(root) else {
                    continue;
                };
                let key = rel.to_string_lossy().into_owned();
                let mtime = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                found.push((key, meta.len(), mtime));
            }
        }
    }
    found.sort_by_key(|(_, _, mtime)| *mtime);
    Ok(found.into_iter().map(|(key, size, _)| (key, size)).collect())
}
