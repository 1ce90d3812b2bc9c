//! Fleet dispatch: one archival job per account, bounded parallelism,
//! one-shot, date-range and recurring-daily modes.
//!
//! Jobs are isolated from one another. A job that fails, or even
//! panics, contributes a `failed` row to the [`FleetReport`] and never
//! cancels its siblings.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Config;
use crate::report::{FileNames, FleetReport, JobError, Processing, RunReport, RunStats, RunStatus};
use crate::worker::{AccountWorker, SessionFactory};
use crate::{Error, Result};

/// Source of the current local time; injected so the recurring loop is
/// testable.
pub trait Clock: Send + Sync {
    /// The current instant in the deployment's local time zone.
    fn now(&self) -> DateTime<Local>;
}

/// [`Clock`] reading the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Parses a `HH:MM` daily trigger time.
///
/// # Errors
///
/// Returns [`Error::Config`] when the string is not a valid time.
pub fn parse_run_time(run_time: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(run_time, "%H:%M")
        .map_err(|e| Error::Config(format!("invalid run_time '{run_time}': {e}")))
}

/// Next local instant at `run_time` strictly after `now`.
///
/// A nonexistent or ambiguous local time (daylight-saving transitions)
/// resolves to the earliest valid instant on the next possible day.
#[must_use]
pub fn next_run_after(now: DateTime<Local>, run_time: NaiveTime) -> DateTime<Local> {
    let mut date = now.date_naive();
    loop {
        if let Some(candidate) = Local
            .from_local_datetime(&date.and_time(run_time))
            .earliest()
        {
            if candidate > now {
                return candidate;
            }
        }
        let Some(next) = date.succ_opt() else {
            return now;
        };
        date = next;
    }
}

/// Dispatches archival jobs for every configured account.
#[derive(Debug)]
pub struct Scheduler<C = SystemClock> {
    config: Config,
    clock: C,
}

impl Scheduler<SystemClock> {
    /// Creates a scheduler over a validated configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the configuration is invalid.
    pub fn new(config: Config) -> Result<Self> {
        Self::with_clock(config, SystemClock)
    }
}

impl<C: Clock> Scheduler<C> {
    /// Creates a scheduler with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the configuration is invalid.
    pub fn with_clock(config: Config, clock: C) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, clock })
    }

    /// The configuration the scheduler runs.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs one pass over all accounts for `date`.
    pub async fn run_once(&self, date: NaiveDate) -> FleetReport {
        let retry = self.config.retry.policy();
        let workers: Vec<_> = self
            .config
            .accounts
            .iter()
            .map(|account| {
                AccountWorker::from_config(
                    account,
                    &self.config.imap,
                    &self.config.base_path,
                    retry,
                )
            })
            .collect();
        run_jobs(date, workers, self.config.concurrency).await
    }

    /// Runs one pass per day over the inclusive range, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `from > to` or the range reaches
    /// into the future.
    pub async fn run_range(&self, from: NaiveDate, to: NaiveDate) -> Result<Vec<FleetReport>> {
        if from > to {
            return Err(Error::Config(format!("invalid range: {from} is after {to}")));
        }
        let today = self.clock.now().date_naive();
        if to > today {
            return Err(Error::Config(format!("range end {to} is in the future")));
        }

        let mut reports = Vec::new();
        let mut date = from;
        while date <= to {
            tracing::info!(%date, "range pass");
            reports.push(self.run_once(date).await);
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        Ok(reports)
    }
}

impl<C: Clock + 'static> Scheduler<C> {
    /// Runs forever, triggering one pass per day at the configured
    /// `run_time` for the previous day.
    ///
    /// Each triggered pass runs as its own task; a slow pass never
    /// delays the next trigger.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when `run_time` cannot be parsed.
    pub async fn run_forever(self: Arc<Self>) -> Result<()> {
        let scheduler = Arc::clone(&self);
        self.trigger_daily(move |date| {
            let scheduler = Arc::clone(&scheduler);
            tokio::spawn(async move {
                let fleet = scheduler.run_once(date).await;
                tracing::info!(
                    %date,
                    processed = fleet.accounts_processed,
                    successful = fleet.accounts_successful,
                    partial = fleet.accounts_partial,
                    failed = fleet.accounts_failed,
                    "daily pass finished"
                );
            });
        })
        .await
    }

    /// Waits out each daily trigger on the injected clock and hands the
    /// previous day's date to `dispatch`. Dispatching must not block;
    /// `run_forever` spawns each pass as its own task.
    async fn trigger_daily(&self, mut dispatch: impl FnMut(NaiveDate) + Send) -> Result<()> {
        let run_time = parse_run_time(&self.config.scheduler.run_time)?;
        loop {
            let now = self.clock.now();
            let trigger = next_run_after(now, run_time);
            let wait = (trigger - now).to_std().unwrap_or_default();
            tracing::info!(next = %trigger, wait_secs = wait.as_secs(), "waiting for next pass");
            tokio::time::sleep(wait).await;

            let Some(date) = self.clock.now().date_naive().pred_opt() else {
                continue;
            };
            dispatch(date);
        }
    }
}

/// Runs the given jobs with at most `concurrency` in flight and rolls
/// their reports up, preserving configuration order.
async fn run_jobs<F>(
    date: NaiveDate,
    workers: Vec<AccountWorker<F>>,
    concurrency: usize,
) -> FleetReport
where
    F: SessionFactory + 'static,
    F::Stream: Send,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();
    let mut task_index = HashMap::new();

    for (index, worker) in workers.into_iter().enumerate() {
        let semaphore = Arc::clone(&semaphore);
        let account = worker.address().to_string();
        let handle = join_set.spawn(async move {
            // Closed only when the JoinSet is dropped.
            let _permit = semaphore.acquire().await;
            (index, worker.run(date).await)
        });
        task_index.insert(handle.id(), (index, account));
    }

    let mut slots: Vec<Option<RunReport>> = Vec::new();
    slots.resize_with(task_index.len(), || None);
    while let Some(joined) = join_set.join_next_with_id().await {
        match joined {
            Ok((_, (index, report))) => slots[index] = Some(report),
            Err(join_err) => {
                let (index, account) = task_index
                    .get(&join_err.id())
                    .cloned()
                    .unwrap_or((0, "unknown".to_string()));
                tracing::error!(account, error = %join_err, "job aborted");
                slots[index] = Some(synthetic_failure(&account, date, &join_err.to_string()));
            }
        }
    }

    let reports: Vec<RunReport> = slots.into_iter().flatten().collect();
    FleetReport::aggregate(date, &reports)
}

/// Report row for a job that never produced its own report.
fn synthetic_failure(account: &str, date: NaiveDate, message: &str) -> RunReport {
    let now = Utc::now();
    RunReport {
        account: account.to_string(),
        date,
        generated_at: now,
        status: RunStatus::Failed,
        stats: RunStats::default(),
        archive: None,
        processing: Processing::between(now, now),
        files: FileNames {
            index_csv: "index.csv".to_string(),
            index_json: "index.json".to_string(),
            archive: None,
            digest: None,
        },
        errors: vec![JobError::new("job", None, message)],
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use certvault_imap::{Error as ImapError, RetryPolicy, Session};
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    /// Always refuses to connect, tracking how many connects overlap.
    struct RefusingFactory {
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        panics: bool,
    }

    impl SessionFactory for RefusingFactory {
        type Stream = tokio_test::io::Mock;

        async fn connect(&self) -> certvault_imap::Result<Session<Self::Stream>> {
            assert!(!self.panics, "scripted panic");
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            Err(ImapError::InvalidState("refused".into()))
        }
    }

    fn refusing_workers(
        base: &std::path::Path,
        count: usize,
        peak: &Arc<AtomicUsize>,
        panic_index: Option<usize>,
    ) -> Vec<AccountWorker<RefusingFactory>> {
        let current = Arc::new(AtomicUsize::new(0));
        (0..count)
            .map(|i| {
                AccountWorker::new(
                    format!("box{i}@pec.it"),
                    vec!["INBOX".to_string()],
                    base,
                    RefusingFactory {
                        current: Arc::clone(&current),
                        peak: Arc::clone(peak),
                        panics: panic_index == Some(i),
                    },
                    RetryPolicy::none(),
                    100,
                )
            })
            .collect()
    }

    #[test]
    fn test_parse_run_time() {
        assert_eq!(
            parse_run_time("01:00").unwrap(),
            NaiveTime::from_hms_opt(1, 0, 0).unwrap()
        );
        assert!(parse_run_time("25:99").is_err());
        assert!(parse_run_time("soon").is_err());
    }

    #[test]
    fn test_next_run_after() {
        let run_time = NaiveTime::from_hms_opt(1, 0, 0).unwrap();
        let evening = Local.with_ymd_and_hms(2024, 1, 15, 22, 30, 0).unwrap();
        let next = next_run_after(evening, run_time);
        assert_eq!(next, Local.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap());

        // Before the trigger time, same day.
        let small_hours = Local.with_ymd_and_hms(2024, 1, 15, 0, 15, 0).unwrap();
        let next = next_run_after(small_hours, run_time);
        assert_eq!(next, Local.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap());

        // Exactly at the trigger: strictly after, so tomorrow.
        let exact = Local.with_ymd_and_hms(2024, 1, 15, 1, 0, 0).unwrap();
        let next = next_run_after(exact, run_time);
        assert_eq!(next, Local.with_ymd_and_hms(2024, 1, 16, 1, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn test_run_jobs_bounds_concurrency_and_keeps_order() {
        let tmp = tempfile::tempdir().unwrap();
        let peak = Arc::new(AtomicUsize::new(0));
        let workers = refusing_workers(tmp.path(), 6, &peak, None);

        let fleet = run_jobs(date(), workers, 2).await;

        assert_eq!(fleet.accounts_processed, 6);
        assert_eq!(fleet.accounts_failed, 6);
        assert!(peak.load(Ordering::SeqCst) <= 2);
        let order: Vec<_> = fleet.accounts.iter().map(|r| r.account.as_str()).collect();
        assert_eq!(
            order,
            ["box0@pec.it", "box1@pec.it", "box2@pec.it", "box3@pec.it", "box4@pec.it", "box5@pec.it"]
        );
    }

    #[tokio::test]
    async fn test_panicking_job_does_not_cancel_siblings() {
        let tmp = tempfile::tempdir().unwrap();
        let peak = Arc::new(AtomicUsize::new(0));
        let workers = refusing_workers(tmp.path(), 3, &peak, Some(1));

        let fleet = run_jobs(date(), workers, 3).await;

        assert_eq!(fleet.accounts_processed, 3);
        assert_eq!(fleet.accounts_failed, 3);
        assert_eq!(fleet.accounts[1].account, "box1@pec.it");
        // The panicked slot carries a synthesized error row; its
        // siblings produced their own reports and summaries.
        assert!(tmp.path().join("box0/2024/2024-01-15/summary.json").is_file());
        assert!(tmp.path().join("box2/2024/2024-01-15/summary.json").is_file());
    }

    fn config() -> crate::Config {
        crate::Config {
            base_path: "/tmp/x".into(),
            concurrency: 1,
            retry: crate::config::RetrySettings::default(),
            imap: crate::ImapSettings::default(),
            scheduler: crate::SchedulerSettings::default(),
            cache: crate::CacheSettings::default(),
            accounts: vec![crate::AccountConfig {
                address: "a@pec.it".to_string(),
                host: "imaps.pec.it".to_string(),
                port: 993,
                password: "pw".to_string(),
                folders: vec!["INBOX".to_string()],
            }],
        }
    }

    /// Local clock driven by the (paused) tokio clock.
    struct PausedClock {
        start: DateTime<Local>,
        base: tokio::time::Instant,
    }

    impl Clock for PausedClock {
        fn now(&self) -> DateTime<Local> {
            self.start + ChronoDuration::from_std(self.base.elapsed()).unwrap_or_default()
        }
    }

    #[tokio::test]
    async fn test_run_range_validation() {
        let scheduler = Scheduler::new(config()).unwrap();

        let from = date();
        let before = from - ChronoDuration::days(1);
        assert!(matches!(
            scheduler.run_range(from, before).await,
            Err(Error::Config(_))
        ));

        let tomorrow = Local::now().date_naive() + ChronoDuration::days(1);
        assert!(matches!(
            scheduler.run_range(from, tomorrow).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_daily_trigger_fires_for_yesterday_and_keeps_going() {
        // run_time defaults to 01:00; start half an hour before it.
        let clock = PausedClock {
            start: Local.with_ymd_and_hms(2024, 1, 15, 0, 30, 0).unwrap(),
            base: tokio::time::Instant::now(),
        };
        let scheduler = Arc::new(Scheduler::with_clock(config(), clock).unwrap());

        let dates: Arc<std::sync::Mutex<Vec<NaiveDate>>> = Arc::default();
        let recorded = Arc::clone(&dates);
        let trigger_loop = tokio::spawn(async move {
            scheduler
                .trigger_daily(move |date| {
                    recorded
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner)
                        .push(date);
                })
                .await
        });

        // The 01:00 trigger targets the previous day.
        tokio::time::sleep(std::time::Duration::from_secs(60 * 60)).await;
        assert_eq!(
            *dates.lock().unwrap(),
            vec![NaiveDate::from_ymd_opt(2024, 1, 14).unwrap()]
        );

        // Dispatch returned immediately, so the loop is already waiting
        // out the next day's trigger.
        tokio::time::sleep(std::time::Duration::from_secs(24 * 60 * 60)).await;
        assert_eq!(
            *dates.lock().unwrap(),
            vec![
                NaiveDate::from_ymd_opt(2024, 1, 14).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            ]
        );
        trigger_loop.abort();
    }
}
