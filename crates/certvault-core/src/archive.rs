//! Archive sealing and integrity.
//!
//! A finished day is sealed into `archive-<account>-<date>.tar.gz`
//! inside the per-date directory, with a `digest.sha256` sidecar
//! recording the SHA-256 of the compressed bytes. Entry paths inside
//! the archive are relative to the per-date directory
//! (`INBOX/0001_x.eml`, `index.csv`), so a plain `tar -xzf` reproduces
//! the message tree. The archive itself, digest files and
//! `summary.json` are never members of the archive.
//!
//! Tar and gzip work is synchronous and runs on the blocking pool.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use flate2::Compression;
use flate2::write::GzEncoder;
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Filename of the digest sidecar inside the per-date directory.
pub const DIGEST_FILE: &str = "digest.sha256";

/// A sealed archive and its digest.
#[derive(Debug, Clone)]
pub struct SealedArchive {
    /// Path of the `.tar.gz` file.
    pub path: PathBuf,
    /// Archive filename.
    pub name: String,
    /// Path of the `digest.sha256` sidecar.
    pub digest_path: PathBuf,
    /// Lowercase hex SHA-256 of the compressed bytes.
    pub sha256: String,
    /// Compressed size in bytes.
    pub size: u64,
}

/// Canonical archive filename for an account and day.
#[must_use]
pub fn archive_name(account: &str, date: NaiveDate) -> String {
    format!("archive-{account}-{}.tar.gz", date.format("%Y-%m-%d"))
}

/// Seals the contents of `day_dir` into an archive inside `day_dir`
/// and writes the digest sidecar next to it.
///
/// The archive is written under a temporary name and renamed into
/// place once complete, so a crash never leaves a truncated file under
/// the final name. The sidecar is written after the rename.
///
/// # Errors
///
/// Returns [`Error::Archive`] when the directory cannot be read or the
/// archive cannot be written.
pub async fn create_archive(
    day_dir: &Path,
    account: &str,
    date: NaiveDate,
) -> Result<SealedArchive> {
    let day_dir = day_dir.to_path_buf();
    let name = archive_name(account, date);
    let sealed = tokio::task::spawn_blocking(move || seal_blocking(&day_dir, &name))
        .await
        .map_err(|e| Error::Archive(format!("sealing task panicked: {e}")))??;
    tracing::info!(
        archive = %sealed.path.display(),
        sha256 = %sealed.sha256,
        bytes = sealed.size,
        "archive sealed"
    );
    Ok(sealed)
}

fn seal_blocking(day_dir: &Path, name: &str) -> Result<SealedArchive> {
    let archive_path = day_dir.join(name);
    let tmp = day_dir.join(format!(".{name}.tmp"));

    let out = File::create(&tmp)
        .map_err(|e| Error::Archive(format!("cannot create {}: {e}", tmp.display())))?;
    let encoder = GzEncoder::new(out, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    append_tree(&mut builder, day_dir, Path::new(""))
        .and_then(|()| builder.into_inner())
        .and_then(GzEncoder::finish)
        .and_then(|f| f.sync_all())
        .map_err(|e| Error::Archive(format!("cannot write {}: {e}", tmp.display())))?;

    std::fs::rename(&tmp, &archive_path)
        .map_err(|e| Error::Archive(format!("cannot rename into {}: {e}", archive_path.display())))?;

    let (sha256, size) = digest_file(&archive_path)?;
    let digest_path = day_dir.join(DIGEST_FILE);
    let mut sidecar = File::create(&digest_path)
        .map_err(|e| Error::Archive(format!("cannot create {}: {e}", digest_path.display())))?;
    sidecar
        .write_all(format!("{sha256}  {name}\n").as_bytes())
        .map_err(|e| Error::Archive(format!("cannot write {}: {e}", digest_path.display())))?;

    Ok(SealedArchive {
        path: archive_path,
        name: name.to_string(),
        digest_path,
        sha256,
        size,
    })
}

/// Whether a directory entry belongs in the archive. The archive
/// itself, digests, summaries and in-progress temporaries stay out.
fn is_archive_member(name: &str) -> bool {
    !(name.ends_with(".tar.gz")
        || name.ends_with(".sha256")
        || name == "summary.json"
        || (name.starts_with('.') && name.ends_with(".tmp")))
}

/// Appends every eligible file under `dir` with a name relative to the
/// walk root. Entries are sorted so repeated seals of the same tree
/// produce the same member order.
fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(std::fs::DirEntry::file_name);
    for entry in entries {
        let file_name = entry.file_name();
        if !is_archive_member(&file_name.to_string_lossy()) {
            continue;
        }
        let name = prefix.join(&file_name);
        if entry.file_type()?.is_dir() {
            append_tree(builder, &entry.path(), &name)?;
        } else {
            builder.append_path_with_name(entry.path(), &name)?;
        }
    }
    Ok(())
}

/// Recomputes the digest of `archive_path` and checks it against the
/// `digest.sha256` sidecar in the same directory.
///
/// # Errors
///
/// Returns [`Error::DigestMismatch`] when the bytes no longer match,
/// and [`Error::Archive`] when either file cannot be read or the
/// sidecar is malformed.
pub async fn verify_archive(archive_path: &Path) -> Result<String> {
    let archive_path = archive_path.to_path_buf();
    tokio::task::spawn_blocking(move || verify_blocking(&archive_path))
        .await
        .map_err(|e| Error::Archive(format!("verify task panicked: {e}")))?
}

fn verify_blocking(archive_path: &Path) -> Result<String> {
    let digest_path = archive_path
        .parent()
        .map_or_else(|| PathBuf::from(DIGEST_FILE), |p| p.join(DIGEST_FILE));
    let contents = std::fs::read_to_string(&digest_path)
        .map_err(|e| Error::Archive(format!("cannot read {}: {e}", digest_path.display())))?;
    let expected = parse_digest_line(&contents).ok_or_else(|| {
        Error::Archive(format!("malformed digest file: {}", digest_path.display()))
    })?;
    let (actual, _) = digest_file(archive_path)?;
    if actual == expected {
        Ok(actual)
    } else {
        Err(Error::DigestMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Extracts the hex digest from a `<hex>  <filename>` sidecar line.
#[must_use]
pub fn parse_digest_line(contents: &str) -> Option<&str> {
    let hex = contents.split_whitespace().next()?;
    (hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit())).then_some(hex)
}

fn digest_file(path: &Path) -> Result<(String, u64)> {
    let file = File::open(path)
        .map_err(|e| Error::Archive(format!("cannot open {}: {e}", path.display())))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    let mut size = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .map_err(|e| Error::Archive(format!("cannot read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    fn build_day_dir(root: &Path) -> PathBuf {
        let day = root.join("2024-01-15");
        std::fs::create_dir_all(day.join("INBOX")).unwrap();
        std::fs::write(day.join("INBOX/0001_Conferma.eml"), b"raw message one").unwrap();
        std::fs::write(day.join("INBOX/0002_no_subject.eml"), b"raw message two").unwrap();
        std::fs::write(day.join("index.csv"), b"uid,folder\n").unwrap();
        std::fs::write(day.join("summary.json"), b"{}").unwrap();
        day
    }

    #[test]
    fn test_archive_name() {
        assert_eq!(
            archive_name("a@pec.it", date()),
            "archive-a@pec.it-2024-01-15.tar.gz"
        );
    }

    #[test]
    fn test_parse_digest_line() {
        let hex = "a".repeat(64);
        assert_eq!(
            parse_digest_line(&format!("{hex}  archive.tar.gz\n")),
            Some(hex.as_str())
        );
        assert_eq!(parse_digest_line("short  archive.tar.gz\n"), None);
        assert_eq!(parse_digest_line(""), None);
    }

    #[tokio::test]
    async fn test_seal_and_verify_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let day = build_day_dir(tmp.path());

        let sealed = create_archive(&day, "a@pec.it", date()).await.unwrap();
        assert_eq!(sealed.path, day.join("archive-a@pec.it-2024-01-15.tar.gz"));
        assert!(sealed.path.is_file());
        assert_eq!(sealed.size, std::fs::metadata(&sealed.path).unwrap().len());

        let sidecar = std::fs::read_to_string(&sealed.digest_path).unwrap();
        assert_eq!(
            sidecar,
            format!("{}  archive-a@pec.it-2024-01-15.tar.gz\n", sealed.sha256)
        );

        assert_eq!(verify_archive(&sealed.path).await.unwrap(), sealed.sha256);

        // No temporary file left behind.
        assert!(!day.join(".archive-a@pec.it-2024-01-15.tar.gz.tmp").exists());
    }

    #[tokio::test]
    async fn test_archive_membership() {
        let tmp = tempfile::tempdir().unwrap();
        let day = build_day_dir(tmp.path());
        let sealed = create_archive(&day, "a@pec.it", date()).await.unwrap();
        // Re-sealing after the first pass must not swallow the first
        // archive or its digest.
        let resealed = create_archive(&day, "a@pec.it", date()).await.unwrap();

        let file = File::open(&resealed.path).unwrap();
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
        let names: BTreeSet<String> = tar
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().into_owned())
            .collect();
        assert!(names.contains("INBOX/0001_Conferma.eml"));
        assert!(names.contains("INBOX/0002_no_subject.eml"));
        assert!(names.contains("index.csv"));
        assert!(!names.iter().any(|n| n.ends_with(".tar.gz")));
        assert!(!names.contains("summary.json"));
        assert!(!names.contains(DIGEST_FILE));
        drop(sealed);
    }

    #[tokio::test]
    async fn test_verify_detects_tampering() {
        let tmp = tempfile::tempdir().unwrap();
        let day = build_day_dir(tmp.path());
        let sealed = create_archive(&day, "a@pec.it", date()).await.unwrap();

        let mut bytes = std::fs::read(&sealed.path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&sealed.path, &bytes).unwrap();

        match verify_archive(&sealed.path).await {
            Err(Error::DigestMismatch { expected, actual }) => {
                assert_ne!(expected, actual);
            }
            other => panic!("expected digest mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_missing_sidecar_is_archive_error() {
        let tmp = tempfile::tempdir().unwrap();
        let day = build_day_dir(tmp.path());
        let sealed = create_archive(&day, "a@pec.it", date()).await.unwrap();
        std::fs::remove_file(&sealed.digest_path).unwrap();

        assert!(matches!(
            verify_archive(&sealed.path).await,
            Err(Error::Archive(_))
        ));
    }
}
