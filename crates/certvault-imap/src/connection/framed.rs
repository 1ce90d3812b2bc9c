//! Framed I/O for the IMAP wire protocol.
//!
//! IMAP responses are CRLF-terminated lines; a line may end in a literal
//! marker `{n}` announcing that the next `n` bytes are opaque data (message
//! bodies arrive this way). [`FramedStream`] reads one logical response at
//! a time, literals included, and writes complete command lines.

#![allow(clippy::missing_errors_doc)]

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::{Error, Result};

const READ_CAPACITY: usize = 8192;

/// Upper bound for a single response line. Protects against a server
/// that never sends CRLF.
const MAX_LINE_LEN: usize = 1024 * 1024;

/// Upper bound for a single literal. Certified-mail messages carry signed
/// attachments, so this is generous.
const MAX_LITERAL_LEN: usize = 128 * 1024 * 1024;

/// Buffered reader/writer speaking IMAP framing over any async stream.
pub struct FramedStream<S> {
    reader: BufReader<S>,
}

impl<S> FramedStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps a stream in IMAP framing.
    pub fn new(stream: S) -> Self {
        Self {
            reader: BufReader::with_capacity(READ_CAPACITY, stream),
        }
    }

    /// Reads one complete response: a CRLF-terminated line plus any
    /// literals it announces, until a line without a trailing literal.
    pub async fn read_response(&mut self) -> Result<BytesMut> {
        let mut response = BytesMut::new();

        loop {
            self.read_line_into(&mut response).await?;

            let Some(len) = trailing_literal_len(&response) else {
                return Ok(response);
            };
            if len > MAX_LITERAL_LEN {
                return Err(Error::Protocol(format!(
                    "literal of {len} bytes exceeds limit of {MAX_LITERAL_LEN}"
                )));
            }

            let start = response.len();
            response.resize(start + len, 0);
            self.reader.read_exact(&mut response[start..]).await?;
            // The line after a literal continues the same response.
        }
    }

    /// Appends one CRLF-terminated line to `out`.
    async fn read_line_into(&mut self, out: &mut BytesMut) -> Result<()> {
        let line_start = out.len();

        loop {
            let buf = self.reader.fill_buf().await?;
            if buf.is_empty() {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }

            if let Some(pos) = buf.windows(2).position(|w| w == b"\r\n") {
                out.extend_from_slice(&buf[..=pos + 1]);
                self.reader.consume(pos + 2);
                return Ok(());
            }

            let consumed = buf.len();
            out.extend_from_slice(buf);
            self.reader.consume(consumed);

            if out.len() - line_start > MAX_LINE_LEN {
                return Err(Error::Protocol("response line too long".to_string()));
            }
        }
    }

    /// Writes a complete command line and flushes.
    pub async fn write_command(&mut self, line: &[u8]) -> Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(line).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Consumes the framing and returns the inner stream.
    pub fn into_inner(self) -> S {
        self.reader.into_inner()
    }
}

/// Returns the literal length announced at the end of a line, if any.
///
/// Recognizes `... {123}\r\n` and the non-synchronizing form `{123+}\r\n`.
fn trailing_literal_len(data: &[u8]) -> Option<usize> {
    let line = data.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);

    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = std::str::from_utf8(&line[open + 1..]).ok()?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}
