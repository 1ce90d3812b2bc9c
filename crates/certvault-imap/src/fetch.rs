//! Lazy, batched message fetching.
//!
//! [`FolderFetch`] is a finite, non-restartable producer over one folder
//! and one date. It holds the UID list from the initial search and pulls
//! message bodies from the server in batches of at most `batch_size`,
//! so peak memory is bounded by one batch regardless of folder size.

use std::collections::{HashSet, VecDeque};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::response::Uid;
use crate::session::Session;
use crate::{Error, Result};

/// One fetched message.
#[derive(Debug, Clone)]
pub struct FetchedMessage {
    /// Server-assigned UID, unique within the folder.
    pub uid: Uid,
    /// Raw RFC 822 bytes.
    pub raw: Bytes,
}

/// Batched producer of messages for one (folder, date).
///
/// Borrows the session exclusively for its lifetime, which is what makes
/// the sequence non-restartable: once exhausted, a new search is needed.
#[derive(Debug)]
pub struct FolderFetch<'a, S> {
    session: &'a mut Session<S>,
    pending: VecDeque<Uid>,
    ready: VecDeque<FetchedMessage>,
    batch_size: usize,
}

impl<'a, S> FolderFetch<'a, S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Opens `folder` read-only, searches for messages dated `date` and
    /// returns a producer over them.
    ///
    /// Duplicate UIDs in the search result are collapsed before any
    /// fetch is issued.
    ///
    /// # Errors
    ///
    /// Propagates session errors from EXAMINE and SEARCH.
    pub async fn start(
        session: &'a mut Session<S>,
        folder: &str,
        date: chrono::NaiveDate,
        batch_size: usize,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidState("batch_size must be positive".into()));
        }

        session.examine(folder).await?;
        let uids = session.uid_search_on(date).await?;

        let mut seen = HashSet::with_capacity(uids.len());
        let pending: VecDeque<Uid> = uids.into_iter().filter(|u| seen.insert(*u)).collect();

        tracing::info!(folder, %date, messages = pending.len(), "starting folder fetch");

        Ok(Self {
            session,
            pending,
            ready: VecDeque::new(),
            batch_size,
        })
    }

    /// Total number of messages not yet yielded.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.pending.len() + self.ready.len()
    }

    /// Yields the next message, refilling from the server when the
    /// current batch is drained. Returns `Ok(None)` once exhausted.
    ///
    /// # Errors
    ///
    /// Propagates fetch errors; messages already yielded stay valid.
    pub async fn next(&mut self) -> Result<Option<FetchedMessage>> {
        if self.ready.is_empty() && !self.pending.is_empty() {
            self.refill().await?;
        }
        Ok(self.ready.pop_front())
    }

    async fn refill(&mut self) -> Result<()> {
        let take = self.pending.len().min(self.batch_size);
        let batch: Vec<Uid> = self.pending.drain(..take).collect();

        let fetched = self.session.uid_fetch_raw(&batch).await?;
        if fetched.len() < batch.len() {
            tracing::warn!(
                requested = batch.len(),
                received = fetched.len(),
                "server returned fewer messages than requested"
            );
        }

        self.ready
            .extend(fetched.into_iter().map(|(uid, raw)| FetchedMessage { uid, raw }));
        Ok(())
    }
}
