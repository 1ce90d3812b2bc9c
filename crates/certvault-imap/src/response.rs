//! Minimal IMAP response parsing.
//!
//! This is deliberately not a full RFC 9051 parser. An archival fetch
//! client only ever looks at four shapes of server data: the greeting,
//! tagged status lines, `* SEARCH` UID lists, and `* n FETCH` responses
//! carrying a message body literal. Everything else is untagged noise we
//! skip over.

use bytes::Bytes;

/// Server-assigned message identifier, unique within one folder and
/// stable across sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uid(u32);

impl Uid {
    /// Wraps a raw UID value.
    #[must_use]
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    /// Returns the raw UID value.
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Uid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Completion status of a tagged response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaggedStatus {
    /// Command completed.
    Ok,
    /// Command failed.
    No,
    /// Command was rejected as malformed.
    Bad,
}

/// A parsed tagged status line, e.g. `A003 OK SEARCH completed`.
#[derive(Debug, Clone)]
pub struct TaggedResponse {
    /// Command tag this response answers.
    pub tag: String,
    /// Completion status.
    pub status: TaggedStatus,
    /// Human-readable response text.
    pub text: String,
}

/// Parses a tagged status line. Returns `None` for untagged lines or
/// anything that does not match `tag SP status SP text`.
#[must_use]
pub fn parse_tagged(line: &[u8]) -> Option<TaggedResponse> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches("\r\n");
    let mut parts = line.splitn(3, ' ');

    let tag = parts.next()?;
    if tag == "*" || tag == "+" || tag.is_empty() {
        return None;
    }

    let status = match parts.next()? {
        s if s.eq_ignore_ascii_case("OK") => TaggedStatus::Ok,
        s if s.eq_ignore_ascii_case("NO") => TaggedStatus::No,
        s if s.eq_ignore_ascii_case("BAD") => TaggedStatus::Bad,
        _ => return None,
    };

    Some(TaggedResponse {
        tag: tag.to_string(),
        status,
        text: parts.next().unwrap_or_default().to_string(),
    })
}

/// Returns the text of an untagged `* BYE` line, if this is one.
#[must_use]
pub fn parse_bye(line: &[u8]) -> Option<String> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches("\r\n");
    let rest = line.strip_prefix("* ")?;
    if rest.len() >= 3 && rest[..3].eq_ignore_ascii_case("BYE") {
        Some(rest[3..].trim_start().to_string())
    } else {
        None
    }
}

/// Parses an untagged `* SEARCH 10 11 12` line into UIDs.
///
/// Returns `None` if the line is not a SEARCH response. An empty result
/// set (`* SEARCH` with no numbers) yields an empty vector.
#[must_use]
pub fn parse_search(line: &[u8]) -> Option<Vec<Uid>> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches("\r\n");
    let rest = line.strip_prefix("* ")?;
    let rest = if rest.len() >= 6 && rest[..6].eq_ignore_ascii_case("SEARCH") {
        &rest[6..]
    } else {
        return None;
    };

    let mut uids = Vec::new();
    for token in rest.split_ascii_whitespace() {
        let value: u32 = token.parse().ok()?;
        uids.push(Uid::new(value));
    }
    Some(uids)
}

/// Parses the `n` out of an untagged `* n EXISTS` line.
#[must_use]
pub fn parse_exists(line: &[u8]) -> Option<u32> {
    let line = std::str::from_utf8(line).ok()?.trim_end_matches("\r\n");
    let rest = line.strip_prefix("* ")?;
    let mut parts = rest.split_ascii_whitespace();
    let count: u32 = parts.next()?.parse().ok()?;
    if parts.next()?.eq_ignore_ascii_case("EXISTS") {
        Some(count)
    } else {
        None
    }
}

/// A message body pulled out of a FETCH response.
#[derive(Debug, Clone)]
pub struct FetchBody {
    /// UID item from the response, when the server included one.
    pub uid: Option<Uid>,
    /// Raw RFC 822 message bytes.
    pub body: Bytes,
}

/// Parses an untagged FETCH response carrying a body literal.
///
/// Expects the shape `* n FETCH (... {len}\r\n<len bytes>...)`. Returns
/// `None` for FETCH responses without a literal (flag updates and the
/// like) and for non-FETCH lines.
#[must_use]
pub fn parse_fetch(response: &[u8]) -> Option<FetchBody> {
    let line_end = response.windows(2).position(|w| w == b"\r\n")?;
    let first_line = &response[..line_end + 2];

    let text = std::str::from_utf8(first_line).ok()?;
    if !text.starts_with("* ") || !text.to_ascii_uppercase().contains(" FETCH ") {
        return None;
    }

    let len = literal_len(first_line)?;
    let body_start = line_end + 2;
    let body = response.get(body_start..body_start + len)?;

    // UID may precede the literal or trail it.
    let uid = find_uid_item(first_line).or_else(|| find_uid_item(&response[body_start + len..]));

    Some(FetchBody {
        uid,
        body: Bytes::copy_from_slice(body),
    })
}

/// Returns the literal length announced at the end of a line.
fn literal_len(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n")?;
    let line = line.strip_suffix(b"}")?;
    let line = line.strip_suffix(b"+").unwrap_or(line);
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = std::str::from_utf8(&line[open + 1..]).ok()?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Scans a response fragment for a `UID <n>` data item.
fn find_uid_item(fragment: &[u8]) -> Option<Uid> {
    let text = std::str::from_utf8(fragment).ok()?;
    let pos = text.find("UID ")?;
    let digits: String = text[pos + 4..]
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();
    digits.parse().ok().map(Uid::new)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tagged_ok() {
        let resp = parse_tagged(b"A001 OK LOGIN completed\r\n").unwrap();
        assert_eq!(resp.tag, "A001");
        assert_eq!(resp.status, TaggedStatus::Ok);
        assert_eq!(resp.text, "LOGIN completed");
    }

    #[test]
    fn test_parse_tagged_no_and_bad() {
        let no = parse_tagged(b"A002 NO [AUTHENTICATIONFAILED] bad credentials\r\n").unwrap();
        assert_eq!(no.status, TaggedStatus::No);

        let bad = parse_tagged(b"A003 BAD parse error\r\n").unwrap();
        assert_eq!(bad.status, TaggedStatus::Bad);
    }

    #[test]
    fn test_parse_tagged_rejects_untagged() {
        assert!(parse_tagged(b"* OK ready\r\n").is_none());
        assert!(parse_tagged(b"+ continue\r\n").is_none());
    }

    #[test]
    fn test_parse_bye() {
        assert_eq!(
            parse_bye(b"* BYE server shutting down\r\n").as_deref(),
            Some("server shutting down")
        );
        assert!(parse_bye(b"* OK ready\r\n").is_none());
    }

    #[test]
    fn test_parse_search() {
        let uids = parse_search(b"* SEARCH 10 11 12\r\n").unwrap();
        assert_eq!(uids, vec![Uid::new(10), Uid::new(11), Uid::new(12)]);

        let empty = parse_search(b"* SEARCH\r\n").unwrap();
        assert!(empty.is_empty());

        assert!(parse_search(b"* 3 EXISTS\r\n").is_none());
    }

    #[test]
    fn test_parse_exists() {
        assert_eq!(parse_exists(b"* 42 EXISTS\r\n"), Some(42));
        assert!(parse_exists(b"* SEARCH 1\r\n").is_none());
    }

    #[test]
    fn test_parse_fetch_uid_before_literal() {
        let resp = b"* 1 FETCH (UID 10 RFC822 {5}\r\nhello)\r\n";
        let fetched = parse_fetch(resp).unwrap();
        assert_eq!(fetched.uid, Some(Uid::new(10)));
        assert_eq!(&fetched.body[..], b"hello");
    }

    #[test]
    fn test_parse_fetch_uid_after_literal() {
        let resp = b"* 1 FETCH (RFC822 {5}\r\nhello UID 11)\r\n";
        let fetched = parse_fetch(resp).unwrap();
        assert_eq!(fetched.uid, Some(Uid::new(11)));
        assert_eq!(&fetched.body[..], b"hello");
    }

    #[test]
    fn test_parse_fetch_ignores_flag_updates() {
        assert!(parse_fetch(b"* 4 FETCH (FLAGS (\\Seen))\r\n").is_none());
        assert!(parse_fetch(b"* 3 EXISTS\r\n").is_none());
    }
}
