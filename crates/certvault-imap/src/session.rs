//! Owned IMAP session.
//!
//! One [`Session`] wraps one connection to one mailbox. The session is
//! deliberately an owned, stateful object passed explicitly to the fetch
//! producer: two jobs for the same account can never silently interleave
//! on a shared connection.
//!
//! The session is generic over the underlying stream so tests can drive
//! it with scripted in-memory streams; production code uses
//! [`Session::connect`] which dials TLS.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use chrono::NaiveDate;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::connection::{FramedStream, ImapStream, connect_tls};
use crate::response::{self, TaggedResponse, TaggedStatus, Uid};
use crate::{Error, Result};

/// Configuration for one IMAP session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Server hostname.
    pub host: String,
    /// Server port (993 for implicit TLS).
    pub port: u16,
    /// Username for LOGIN.
    pub username: String,
    /// Password for LOGIN.
    pub password: String,
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,
    /// Timeout for a single command round-trip.
    pub command_timeout: Duration,
}

impl SessionConfig {
    /// Creates a configuration with default timeouts.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: String::new(),
            password: String::new(),
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
        }
    }

    /// Sets the credentials.
    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Sets both network timeouts to the same value.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self.command_timeout = timeout;
        self
    }
}

/// An authenticated IMAP session over stream `S`.
pub struct Session<S> {
    stream: FramedStream<S>,
    command_timeout: Duration,
    tag_seq: u32,
}

impl Session<ImapStream> {
    /// Dials the server with implicit TLS, reads the greeting and logs in.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the server rejects the credentials,
    /// and transport-level errors for everything else.
    pub async fn connect(config: &SessionConfig) -> Result<Self> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            connect_tls(&config.host, config.port),
        )
        .await
        .map_err(|_| Error::Timeout(config.connect_timeout))??;

        let session = Self::from_stream(stream, config).await?;
        tracing::info!(host = %config.host, user = %config.username, "imap session established");
        Ok(session)
    }
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Builds a session from an already-connected stream: reads the
    /// server greeting and authenticates.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] on rejected credentials, [`Error::Bye`] if
    /// the server refuses the connection.
    pub async fn from_stream(stream: S, config: &SessionConfig) -> Result<Self> {
        let mut session = Self {
            stream: FramedStream::new(stream),
            command_timeout: config.command_timeout,
            tag_seq: 0,
        };

        session.read_greeting().await?;
        session.login(&config.username, &config.password).await?;
        Ok(session)
    }

    async fn read_greeting(&mut self) -> Result<()> {
        let timeout = self.command_timeout;
        let line = tokio::time::timeout(timeout, self.stream.read_response())
            .await
            .map_err(|_| Error::Timeout(timeout))??;

        if let Some(text) = response::parse_bye(&line) {
            return Err(Error::Bye(text));
        }
        let text = String::from_utf8_lossy(&line);
        if text.len() >= 4 && text[..4].eq_ignore_ascii_case("* OK") {
            Ok(())
        } else {
            Err(Error::Protocol(format!(
                "unexpected greeting: {}",
                text.trim_end()
            )))
        }
    }

    async fn login(&mut self, username: &str, password: &str) -> Result<()> {
        let cmd = format!("LOGIN {} {}", quote(username), quote(password));
        let (_, tagged) = self.run_command(&cmd, false).await?;
        match tagged.status {
            TaggedStatus::Ok => Ok(()),
            TaggedStatus::No | TaggedStatus::Bad => Err(Error::Auth(tagged.text)),
        }
    }

    /// Opens a folder read-only and returns its message count.
    ///
    /// EXAMINE rather than SELECT: archiving must never alter flags on
    /// the origin mailbox.
    ///
    /// # Errors
    ///
    /// Returns [`Error::No`] when the folder does not exist.
    pub async fn examine(&mut self, folder: &str) -> Result<u32> {
        let cmd = format!("EXAMINE {}", quote(folder));
        let (untagged, tagged) = self.run_command(&cmd, false).await?;
        check_ok(tagged)?;

        let exists = untagged
            .iter()
            .find_map(|line| response::parse_exists(line))
            .unwrap_or(0);
        tracing::debug!(folder, exists, "folder opened read-only");
        Ok(exists)
    }

    /// Searches the open folder for messages whose internal date is
    /// `date`, returning their UIDs.
    ///
    /// # Errors
    ///
    /// Returns [`Error::No`] when the server rejects the search.
    pub async fn uid_search_on(&mut self, date: NaiveDate) -> Result<Vec<Uid>> {
        // IMAP date-text is DD-Mon-YYYY, always English month names.
        let cmd = format!("UID SEARCH ON {}", date.format("%d-%b-%Y"));
        let (untagged, tagged) = self.run_command(&cmd, false).await?;
        check_ok(tagged)?;

        let uids = untagged
            .iter()
            .find_map(|line| response::parse_search(line))
            .unwrap_or_default();
        tracing::debug!(%date, count = uids.len(), "uid search completed");
        Ok(uids)
    }

    /// Fetches raw RFC 822 bytes for a batch of UIDs.
    ///
    /// Responses without a UID item or body literal are skipped with a
    /// warning rather than failing the batch.
    ///
    /// # Errors
    ///
    /// Returns [`Error::No`] when the server rejects the fetch.
    pub async fn uid_fetch_raw(&mut self, uids: &[Uid]) -> Result<Vec<(Uid, Bytes)>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }

        let set = uids
            .iter()
            .map(|u| u.get().to_string())
            .collect::<Vec<_>>()
            .join(",");
        let cmd = format!("UID FETCH {set} (UID RFC822)");
        let (untagged, tagged) = self.run_command(&cmd, false).await?;
        check_ok(tagged)?;

        let mut messages = Vec::with_capacity(uids.len());
        for line in &untagged {
            let Some(fetched) = response::parse_fetch(line) else {
                continue;
            };
            match fetched.uid {
                Some(uid) => messages.push((uid, fetched.body)),
                None => tracing::warn!("fetch response without UID item, skipping"),
            }
        }
        Ok(messages)
    }

    /// Logs out and closes the session.
    ///
    /// # Errors
    ///
    /// Returns transport errors; the connection is dropped regardless.
    pub async fn logout(mut self) -> Result<()> {
        let (_, tagged) = self.run_command("LOGOUT", true).await?;
        check_ok(tagged)?;
        Ok(())
    }

    fn next_tag(&mut self) -> String {
        self.tag_seq += 1;
        format!("A{:03}", self.tag_seq)
    }

    /// Sends one command and collects untagged responses until the
    /// matching tagged line. `expect_bye` suppresses the BYE error during
    /// LOGOUT, where BYE is the normal farewell.
    async fn run_command(
        &mut self,
        cmd: &str,
        expect_bye: bool,
    ) -> Result<(Vec<BytesMut>, TaggedResponse)> {
        let tag = self.next_tag();
        let line = format!("{tag} {cmd}\r\n");
        let timeout = self.command_timeout;

        let exchange = async {
            self.stream.write_command(line.as_bytes()).await?;

            let mut untagged = Vec::new();
            loop {
                let resp = self.stream.read_response().await?;
                if let Some(tagged) = response::parse_tagged(&resp) {
                    if tagged.tag == tag {
                        return Ok((untagged, tagged));
                    }
                    // Stale tag from a previous command; skip.
                    continue;
                }
                if !expect_bye {
                    if let Some(text) = response::parse_bye(&resp) {
                        return Err(Error::Bye(text));
                    }
                }
                untagged.push(resp);
            }
        };

        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::Timeout(timeout))?
    }
}

impl<S> std::fmt::Debug for Session<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("tag_seq", &self.tag_seq)
            .finish_non_exhaustive()
    }
}

fn check_ok(tagged: TaggedResponse) -> Result<()> {
    match tagged.status {
        TaggedStatus::Ok => Ok(()),
        TaggedStatus::No => Err(Error::No(tagged.text)),
        TaggedStatus::Bad => Err(Error::Bad(tagged.text)),
    }
}

/// Quotes a string for use in an IMAP command.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
