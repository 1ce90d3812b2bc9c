//! Per-day message index.
//!
//! The index accumulates one entry per stored message and renders the
//! two sibling files written next to the message folders before the day
//! is sealed:
//!
//! - `index.csv`, spreadsheet-friendly, one row per message
//! - `index.json`, machine-readable, with a generation timestamp
//!
//! Both carry identical per-message fields. Entry order is insertion
//! order, which the worker drives folder by folder, UID-ascending
//! within a folder.

use std::collections::BTreeMap;
use std::path::Path;

use certvault_imap::Uid;
use chrono::Utc;
use mail_parser::{Address, MessageParser};
use serde::Serialize;

use crate::{Error, Result};

/// Metadata pulled out of a raw RFC 5322 message.
///
/// Every field is best-effort: an unparseable message yields a value
/// with all fields empty rather than an error, so one malformed message
/// never blocks the rest of a folder.
#[derive(Debug, Clone, Default)]
pub struct MessageMeta {
    /// `Subject:` header, unfolded.
    pub subject: Option<String>,
    /// `From:` addresses, comma-joined.
    pub from: String,
    /// `To:` addresses, comma-joined.
    pub to: String,
    /// `Cc:` addresses, comma-joined.
    pub cc: String,
    /// `Message-ID:` header.
    pub message_id: Option<String>,
    /// `Date:` header in RFC 3339 form.
    pub date: Option<String>,
}

impl MessageMeta {
    /// Parses the headers of a raw message.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let Some(message) = MessageParser::default().parse(raw) else {
            tracing::warn!(bytes = raw.len(), "unparseable message, indexing without headers");
            return Self::default();
        };
        Self {
            subject: message.subject().map(str::to_string),
            from: format_addresses(message.from()),
            to: format_addresses(message.to()),
            cc: format_addresses(message.cc()),
            message_id: message.message_id().map(str::to_string),
            date: message.date().map(mail_parser::DateTime::to_rfc3339),
        }
    }
}

fn format_addresses(address: Option<&Address<'_>>) -> String {
    let Some(address) = address else {
        return String::new();
    };
    let mut parts = Vec::new();
    match address {
        Address::List(list) => collect_addrs(list, &mut parts),
        Address::Group(groups) => {
            for group in groups {
                collect_addrs(&group.addresses, &mut parts);
            }
        }
    }
    parts.join(", ")
}

fn collect_addrs(list: &[mail_parser::Addr<'_>], parts: &mut Vec<String>) {
    for addr in list {
        let email = addr.address.as_deref().unwrap_or("");
        match addr.name.as_deref() {
            Some(name) if !name.is_empty() => parts.push(format!("{name} <{email}>")),
            _ => parts.push(email.to_string()),
        }
    }
}

/// Where an indexed message lives right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum MessageLocation {
    /// Loose file under the per-date directory.
    Disk {
        /// Path relative to the per-date directory.
        filepath: String,
    },
    /// Inside a sealed archive.
    Archived {
        /// Archive filename, e.g. `archive-a@pec.it-2024-01-15.tar.gz`.
        archive_name: String,
        /// Entry path inside the archive.
        archive_path_internal: String,
    },
}

/// One indexed message.
#[derive(Debug, Clone, Serialize)]
pub struct IndexEntry {
    /// IMAP UID within its folder.
    pub uid: u32,
    /// Original (unsanitized) folder name.
    pub folder: String,
    /// `Date:` header in RFC 3339 form, empty when absent.
    pub date: String,
    /// Sender addresses.
    pub from: String,
    /// Recipient addresses.
    pub to: String,
    /// Carbon-copy addresses.
    pub cc: String,
    /// Subject, empty when absent.
    pub subject: String,
    /// `Message-ID:`, empty when absent.
    pub message_id: String,
    /// Raw message size in bytes.
    pub size: u64,
    /// Current location.
    #[serde(flatten)]
    pub location: MessageLocation,
}

/// Aggregate counters over an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    /// Total indexed messages.
    pub total_messages: usize,
    /// Sum of raw message sizes.
    pub total_bytes: u64,
    /// Message count per folder, sorted by folder name.
    pub per_folder: BTreeMap<String, usize>,
}

#[derive(Serialize)]
struct IndexDocument<'a> {
    generated_at: String,
    total_messages: usize,
    messages: &'a [IndexEntry],
}

/// Accumulates entries for one account-day and renders the index files.
#[derive(Debug, Default)]
pub struct Index {
    entries: Vec<IndexEntry>,
}

impl Index {
    /// Creates an empty index.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All entries in insertion order.
    #[must_use]
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// Records one stored message.
    ///
    /// A second record with the same folder and UID replaces the first
    /// in place (last write wins, matching the storage overwrite), so
    /// the index never lists a message twice.
    pub fn record(
        &mut self,
        uid: Uid,
        folder: &str,
        meta: &MessageMeta,
        size: u64,
        relative_path: &str,
    ) {
        let entry = IndexEntry {
            uid: uid.get(),
            folder: folder.to_string(),
            date: meta.date.clone().unwrap_or_default(),
            from: meta.from.clone(),
            to: meta.to.clone(),
            cc: meta.cc.clone(),
            subject: meta.subject.clone().unwrap_or_default(),
            message_id: meta.message_id.clone().unwrap_or_default(),
            size,
            location: MessageLocation::Disk {
                filepath: relative_path.to_string(),
            },
        };
        if let Some(existing) = self
            .entries
            .iter_mut()
            .find(|e| e.uid == entry.uid && e.folder == entry.folder)
        {
            *existing = entry;
        } else {
            self.entries.push(entry);
        }
    }

    /// Retargets every entry into `archive_name` after sealing.
    ///
    /// The on-disk index files keep their disk-relative paths (they are
    /// themselves inside the archive); only the in-memory view moves.
    pub fn seal(&mut self, archive_name: &str) {
        for entry in &mut self.entries {
            if let MessageLocation::Disk { filepath } = &entry.location {
                entry.location = MessageLocation::Archived {
                    archive_name: archive_name.to_string(),
                    archive_path_internal: filepath.clone(),
                };
            }
        }
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> IndexStats {
        let mut per_folder = BTreeMap::new();
        let mut total_bytes = 0u64;
        for entry in &self.entries {
            *per_folder.entry(entry.folder.clone()).or_insert(0) += 1;
            total_bytes += entry.size;
        }
        IndexStats {
            total_messages: self.entries.len(),
            total_bytes,
            per_folder,
        }
    }

    /// Renders the CSV form.
    #[must_use]
    pub fn to_csv(&self) -> String {
        let mut out = String::from("uid,folder,date,from,to,cc,subject,message_id,size,filepath\n");
        for entry in &self.entries {
            let filepath = match &entry.location {
                MessageLocation::Disk { filepath }
                | MessageLocation::Archived {
                    archive_path_internal: filepath,
                    ..
                } => filepath,
            };
            out.push_str(&format!(
                "{},{},{},{},{},{},{},{},{},{}\n",
                entry.uid,
                csv_escape(&entry.folder),
                csv_escape(&entry.date),
                csv_escape(&entry.from),
                csv_escape(&entry.to),
                csv_escape(&entry.cc),
                csv_escape(&entry.subject),
                csv_escape(&entry.message_id),
                entry.size,
                csv_escape(filepath),
            ));
        }
        out
    }

    /// Renders the JSON form.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Serde`] when serialization fails.
    pub fn to_json(&self) -> Result<String> {
        let doc = IndexDocument {
            generated_at: Utc::now().to_rfc3339(),
            total_messages: self.entries.len(),
            messages: &self.entries,
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Writes `index.csv` and `index.json` into `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on write failure or [`Error::Serde`]
    /// on serialization failure.
    pub async fn write_files(&self, dir: &Path) -> Result<()> {
        let json = self.to_json()?;
        let csv_path = dir.join("index.csv");
        tokio::fs::write(&csv_path, self.to_csv())
            .await
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", csv_path.display())))?;
        let json_path = dir.join("index.json");
        tokio::fs::write(&json_path, json)
            .await
            .map_err(|e| Error::Storage(format!("cannot write {}: {e}", json_path.display())))?;
        tracing::debug!(dir = %dir.display(), entries = self.entries.len(), "index written");
        Ok(())
    }
}

/// Quotes a CSV field when it contains a delimiter, quote or newline.
fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const RAW: &[u8] = b"From: Mario Rossi <mario@pec.it>\r\n\
To: anna@pec.it\r\n\
Cc: ufficio@pec.it, Luca <luca@pec.it>\r\n\
Subject: Conferma ricezione\r\n\
Date: Mon, 15 Jan 2024 09:30:00 +0100\r\n\
Message-ID: <abc123@pec.it>\r\n\
\r\n\
Corpo del messaggio.\r\n";

    #[test]
    fn test_meta_parse() {
        let meta = MessageMeta::parse(RAW);
        assert_eq!(meta.subject.as_deref(), Some("Conferma ricezione"));
        assert_eq!(meta.from, "Mario Rossi <mario@pec.it>");
        assert_eq!(meta.to, "anna@pec.it");
        assert_eq!(meta.cc, "ufficio@pec.it, Luca <luca@pec.it>");
        assert_eq!(meta.message_id.as_deref(), Some("abc123@pec.it"));
        assert!(meta.date.unwrap().starts_with("2024-01-15T09:30:00"));
    }

    #[test]
    fn test_meta_parse_garbage_is_empty_not_error() {
        let meta = MessageMeta::parse(&[0xff, 0xfe, 0x00]);
        assert!(meta.subject.is_none());
        assert!(meta.from.is_empty());
    }

    #[test]
    fn test_record_and_stats() {
        let mut index = Index::new();
        let meta = MessageMeta::parse(RAW);
        index.record(Uid::new(10), "INBOX", &meta, 120, "INBOX/0001_Conferma.eml");
        index.record(Uid::new(11), "INBOX", &meta, 80, "INBOX/0002_Conferma.eml");
        index.record(Uid::new(3), "Posta inviata", &meta, 50, "Posta_inviata/0001_Conferma.eml");

        let stats = index.stats();
        assert_eq!(stats.total_messages, 3);
        assert_eq!(stats.total_bytes, 250);
        assert_eq!(stats.per_folder["INBOX"], 2);
        assert_eq!(stats.per_folder["Posta inviata"], 1);
    }

    #[test]
    fn test_duplicate_uid_replaces_entry() {
        let mut index = Index::new();
        let meta = MessageMeta::parse(RAW);
        index.record(Uid::new(10), "INBOX", &meta, 120, "INBOX/0001_a.eml");
        index.record(Uid::new(10), "INBOX", &meta, 300, "INBOX/0002_b.eml");

        assert_eq!(index.entries().len(), 1);
        assert_eq!(index.entries()[0].size, 300);
        assert_eq!(
            index.entries()[0].location,
            MessageLocation::Disk {
                filepath: "INBOX/0002_b.eml".to_string()
            }
        );
        // Same UID in a different folder is a different message.
        index.record(Uid::new(10), "Sent", &meta, 40, "Sent/0001_c.eml");
        assert_eq!(index.entries().len(), 2);
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_csv_output() {
        let mut index = Index::new();
        let meta = MessageMeta::parse(RAW);
        index.record(Uid::new(10), "INBOX", &meta, 120, "INBOX/0001_Conferma.eml");

        let csv = index.to_csv();
        let mut lines = csv.lines();
        assert_eq!(
            lines.next().unwrap(),
            "uid,folder,date,from,to,cc,subject,message_id,size,filepath"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("10,INBOX,"));
        assert!(row.contains("\"ufficio@pec.it, Luca <luca@pec.it>\""));
        assert!(row.ends_with(",120,INBOX/0001_Conferma.eml"));
        assert!(lines.next().is_none());
    }

    #[test]
    fn test_json_output_and_seal() {
        let mut index = Index::new();
        let meta = MessageMeta::parse(RAW);
        index.record(Uid::new(10), "INBOX", &meta, 120, "INBOX/0001_Conferma.eml");

        let doc: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        assert_eq!(doc["total_messages"], 1);
        assert_eq!(doc["messages"][0]["filepath"], "INBOX/0001_Conferma.eml");
        assert!(doc["messages"][0].get("archive_name").is_none());

        index.seal("archive-a@pec.it-2024-01-15.tar.gz");
        let doc: serde_json::Value = serde_json::from_str(&index.to_json().unwrap()).unwrap();
        assert_eq!(
            doc["messages"][0]["archive_name"],
            "archive-a@pec.it-2024-01-15.tar.gz"
        );
        assert_eq!(
            doc["messages"][0]["archive_path_internal"],
            "INBOX/0001_Conferma.eml"
        );
        assert!(doc["messages"][0].get("filepath").is_none());
    }

    #[tokio::test]
    async fn test_write_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut index = Index::new();
        index.record(
            Uid::new(1),
            "INBOX",
            &MessageMeta::default(),
            10,
            "INBOX/0001_no_subject.eml",
        );
        index.write_files(tmp.path()).await.unwrap();

        assert!(tmp.path().join("index.csv").is_file());
        let json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(tmp.path().join("index.json")).unwrap())
                .unwrap();
        assert_eq!(json["total_messages"], 1);
    }
}
