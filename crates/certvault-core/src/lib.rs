//! # certvault-core
//!
//! Archival pipeline and on-demand extraction cache for certified-mail
//! (PEC) mailboxes.
//!
//! The pipeline runs one fetch→store→index→seal cycle per account per
//! day:
//!
//! - [`Scheduler`] dispatches one [`worker::AccountWorker`] job per
//!   configured account with bounded parallelism, in one-shot,
//!   date-range and recurring-daily modes
//! - [`worker::AccountWorker`] drives a single account through fetching
//!   (via `certvault-imap`), storage, indexing, sealing and reporting
//! - [`storage::Storage`] owns the canonical on-disk layout and atomic
//!   message writes
//! - [`index::Index`] accumulates per-message metadata and serializes
//!   `index.csv` / `index.json`
//! - [`archive`] seals a day's directory into `archive-<account>-<date>.tar.gz`
//!   with a SHA-256 digest, and verifies sealed archives
//! - [`extract::ReadPath`] and [`cache::ExtractionCache`] serve single
//!   messages back out of sealed archives under a bounded LRU cache
//!
//! Configuration loading, the HTTP API transport and notification
//! delivery are external collaborators; this crate exposes the types
//! they consume ([`Config`], [`report::RunReport`], [`report::FleetReport`],
//! the read-path lookup and archive verification).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod archive;
pub mod cache;
pub mod config;
mod error;
pub mod extract;
pub mod index;
pub mod report;
pub mod scheduler;
pub mod storage;
pub mod worker;

pub use config::{AccountConfig, CacheSettings, Config, ImapSettings, SchedulerSettings};
pub use error::{Error, Result};
pub use scheduler::Scheduler;
