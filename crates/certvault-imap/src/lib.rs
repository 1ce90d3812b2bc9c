//! # certvault-imap
//!
//! Minimal async IMAP client for certified-mail archiving.
//!
//! This crate implements exactly the read-only slice of IMAP that a daily
//! mailbox archiver needs:
//!
//! - **TLS via rustls**: implicit TLS connections without OpenSSL
//! - **Owned sessions**: one [`Session`] per connection, generic over the
//!   underlying stream so tests can drive scripted mock streams
//! - **Read-only access**: folders are opened with EXAMINE, never SELECT
//! - **Date-scoped fetching**: `UID SEARCH ON <date>` plus batched
//!   `UID FETCH`, exposed as a lazy [`FolderFetch`] producer that never
//!   materializes a whole folder in memory
//! - **Retry with backoff**: [`with_retry`] retries transient failures
//!   with exponential backoff; authentication failures are never retried
//!
//! ## Quick start
//!
//! ```ignore
//! use certvault_imap::{FolderFetch, Session, SessionConfig};
//!
//! let config = SessionConfig::new("imaps.pec.example", 993)
//!     .credentials("box@pec.example", "secret");
//!
//! let mut session = Session::connect(&config).await?;
//! let mut fetch = FolderFetch::start(&mut session, "INBOX", date, 100).await?;
//! while let Some(message) = fetch.next().await? {
//!     println!("{}: {} bytes", message.uid, message.raw.len());
//! }
//! session.logout().await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod connection;
mod error;
mod fetch;
pub mod response;
mod retry;
mod session;

pub use connection::{FramedStream, ImapStream, connect_plain, connect_tls};
pub use error::{Error, Result};
pub use fetch::{FetchedMessage, FolderFetch};
pub use response::{TaggedResponse, TaggedStatus, Uid};
pub use retry::{RetryPolicy, with_retry};
pub use session::{Session, SessionConfig};
