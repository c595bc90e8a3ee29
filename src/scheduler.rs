use std::collections::HashSet;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use crossbeam_channel::{RecvTimeoutError, Sender};
use parking_lot::Mutex;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;

use crate::archive::expand;
use crate::domain::{
    DatasetId, FileFormat, Source, SourceError, SourceErrorKind, SourceId, UpdateId, UpdateOrigin,
    Validators,
};
use crate::error::KiraError;
use crate::fetch::{FetchOutcome, FetchRequest, Payload, SourceFetcher};
use crate::filter::{Decision, FilterPipeline};
use crate::revisions::{IngestOutcome, Repository};
use crate::updates::{ResourceInfo, UpdateRecorder};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[derive(Debug, Default)]
pub struct SourceLocks {
    held: Mutex<HashSet<SourceId>>,
}

impl SourceLocks {
    pub fn try_acquire(&self, source: SourceId) -> Option<SourceLease<'_>> {
        if self.held.lock().insert(source) {
            Some(SourceLease {
                locks: self,
                source,
            })
        } else {
            None
        }
    }

    pub fn is_held(&self, source: SourceId) -> bool {
        self.held.lock().contains(&source)
    }
}

#[derive(Debug)]
pub struct SourceLease<'a> {
    locks: &'a SourceLocks,
    source: SourceId,
}

impl Drop for SourceLease<'_> {
    fn drop(&mut self) {
        self.locks.held.lock().remove(&self.source);
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerOptions {
    pub workers: usize,
    /// Polls running past this stop before their next entry and commit what they have.
    pub poll_deadline: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_deadline: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollStatus {
    Updated { update: UpdateId },
    NoChanges,
    NotModified,
    FetchFailed { message: String },
    ArchiveFailed { message: String },
    StorageFailed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub source: SourceId,
    pub dataset: DatasetId,
    pub url: String,
    #[serde(flatten)]
    pub status: PollStatus,
    pub revisions: usize,
    pub unchanged: usize,
    pub discarded: usize,
    pub skipped_entries: Vec<String>,
    pub cancelled: bool,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub polled: Vec<PollReport>,
    pub locked: Vec<SourceId>,
}

pub struct SourceScheduler {
    repository: Arc<Repository>,
    fetcher: Arc<dyn SourceFetcher>,
    clock: Arc<dyn Clock>,
    locks: Arc<SourceLocks>,
    pool: ThreadPool,
    options: SchedulerOptions,
}

impl SourceScheduler {
    pub fn new(
        repository: Arc<Repository>,
        fetcher: Arc<dyn SourceFetcher>,
        clock: Arc<dyn Clock>,
        options: SchedulerOptions,
    ) -> Result<Self, KiraError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.workers.max(1))
            .thread_name(|index| format!("kira-br-poll-{index}"))
            .build()
            .map_err(|err| KiraError::Scheduler(err.to_string()))?;
        Ok(Self {
            repository,
            fetcher,
            clock,
            locks: Arc::new(SourceLocks::default()),
            pool,
            options,
        })
    }

    pub fn locks(&self) -> &Arc<SourceLocks> {
        &self.locks
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn due_sources(&self, now: DateTime<Utc>) -> Vec<Source> {
        self.repository
            .catalog()
            .sources()
            .iter()
            .filter(|source| source.is_due(now))
            .cloned()
            .collect()
    }

    pub fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut leased = Vec::new();
        let mut locked = Vec::new();
        for source in self.due_sources(now) {
            match self.locks.try_acquire(source.id) {
                Some(lease) => leased.push((source, lease)),
                None => {
                    tracing::debug!(source = %source.id, "source busy, skipping");
                    locked.push(source.id);
                }
            }
        }

        let mut polled = self.pool.install(|| {
            leased
                .into_par_iter()
                .map(|(source, lease)| {
                    let report = self.poll(&source);
                    drop(lease);
                    report
                })
                .collect::<Vec<_>>()
        });
        polled.sort_by_key(|report| report.source);

        tracing::info!(
            polled = polled.len(),
            locked = locked.len(),
            "scheduler tick finished"
        );
        TickReport { polled, locked }
    }

    fn poll(&self, source: &Source) -> PollReport {
        let started = self.clock.now();
        let deadline = self.options.poll_deadline.map(|limit| started + limit);
        let mut report = PollReport {
            source: source.id,
            dataset: source.dataset,
            url: source.url.clone(),
            status: PollStatus::NoChanges,
            revisions: 0,
            unchanged: 0,
            discarded: 0,
            skipped_entries: Vec::new(),
            cancelled: false,
            checked_at: started,
        };

        let request = FetchRequest {
            url: source.url.clone(),
            credentials: source.credentials.clone(),
            validators: source.validators.clone(),
        };
        let (status, failure, validators) = match self.fetcher.fetch(&request) {
            Err(err) => {
                tracing::warn!(source = %source.id, error = %err, "fetch failed");
                let message = err.to_string();
                (
                    PollStatus::FetchFailed {
                        message: message.clone(),
                    },
                    Some((SourceErrorKind::Fetch, message)),
                    None,
                )
            }
            Ok(FetchOutcome::Unchanged) => {
                tracing::debug!(source = %source.id, "source not modified");
                (PollStatus::NotModified, None, None)
            }
            Ok(FetchOutcome::Payload(payload)) => self.run_pass(source, payload, deadline, &mut report),
        };
        report.status = status;

        let finished = self.clock.now();
        report.checked_at = finished;
        let recorded = self.repository.edit(|catalog| {
            let stored = catalog.source_mut(source.id)?;
            stored.checked_at = Some(finished);
            match failure {
                Some((kind, message)) => {
                    // A partial pass still committed what it could.
                    if kind == SourceErrorKind::Partial {
                        stored.last_success_at = Some(finished);
                    }
                    stored.last_error = Some(SourceError {
                        kind,
                        message,
                        at: finished,
                    });
                }
                None => {
                    stored.last_error = None;
                    stored.last_success_at = Some(finished);
                    if let Some(validators) = validators {
                        stored.validators = validators;
                    }
                }
            }
            Ok(())
        });
        if let Err(err) = recorded {
            tracing::error!(source = %source.id, error = %err, "could not record poll result");
        }
        report
    }

    fn run_pass(
        &self,
        source: &Source,
        payload: Payload,
        deadline: Option<DateTime<Utc>>,
        report: &mut PollReport,
    ) -> (PollStatus, Option<(SourceErrorKind, String)>, Option<Validators>) {
        let expansion = match expand(&payload, &source.url) {
            Ok(expansion) => expansion,
            Err(err) => {
                tracing::warn!(source = %source.id, error = %err, "archive unreadable");
                let message = err.to_string();
                return (
                    PollStatus::ArchiveFailed {
                        message: message.clone(),
                    },
                    Some((SourceErrorKind::Archive, message)),
                    None,
                );
            }
        };
        report.skipped_entries = expansion.skipped;

        let pipeline = match FilterPipeline::compile(&source.filters) {
            Ok(pipeline) => pipeline,
            Err(err) => {
                let message = err.to_string();
                return (
                    PollStatus::StorageFailed {
                        message: message.clone(),
                    },
                    Some((SourceErrorKind::Filter, message)),
                    None,
                );
            }
        };

        let mut pass = match self
            .repository
            .begin(source.dataset, UpdateOrigin::Source(source.id))
        {
            Ok(pass) => pass,
            Err(err) => {
                let message = err.to_string();
                return (
                    PollStatus::StorageFailed {
                        message: message.clone(),
                    },
                    Some((SourceErrorKind::Storage, message)),
                    None,
                );
            }
        };

        for entry in expansion.entries {
            if deadline.is_some_and(|deadline| self.clock.now() > deadline) {
                tracing::warn!(source = %source.id, "poll deadline passed, committing partial pass");
                report.cancelled = true;
                break;
            }
            match pipeline.apply(&entry.name) {
                Decision::Discard => report.discarded += 1,
                Decision::Keep(name) => {
                    match pass.ingest(&name, &entry.data, entry.modified_at, FileFormat::Raw) {
                        Ok(IngestOutcome::NewRevision(_)) => report.revisions += 1,
                        Ok(IngestOutcome::Unchanged) => report.unchanged += 1,
                        Err(err) => {
                            tracing::warn!(source = %source.id, entry = %name, error = %err, "entry skipped");
                            report.skipped_entries.push(format!("{name}: {err}"));
                        }
                    }
                }
            }
        }

        let resource = ResourceInfo {
            size: payload
                .validators
                .content_length
                .or(Some(payload.bytes.len() as u64)),
            modified_at: payload.last_modified,
        };
        let complete = !report.cancelled && report.skipped_entries.is_empty();
        match UpdateRecorder::new(&self.repository).record(pass, self.clock.now(), resource) {
            Ok(update) => {
                let status = match update {
                    Some(update) => PollStatus::Updated { update: update.id },
                    None => PollStatus::NoChanges,
                };
                // Incomplete passes keep the old validators so the next poll refetches.
                let validators = complete.then_some(payload.validators);
                let failure = (!report.skipped_entries.is_empty()).then(|| {
                    (
                        SourceErrorKind::Partial,
                        format!(
                            "skipped {} entries: {}",
                            report.skipped_entries.len(),
                            report.skipped_entries.join("; ")
                        ),
                    )
                });
                (status, failure, validators)
            }
            Err(err) => {
                tracing::warn!(source = %source.id, error = %err, "pass not committed");
                report.revisions = 0;
                let message = err.to_string();
                (
                    PollStatus::StorageFailed {
                        message: message.clone(),
                    },
                    Some((SourceErrorKind::Storage, message)),
                    None,
                )
            }
        }
    }
}

pub struct SchedulerHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl SchedulerHandle {
    pub fn start(scheduler: Arc<SourceScheduler>, interval: StdDuration) -> Self {
        let (stop, stopped) = crossbeam_channel::bounded::<()>(1);
        let thread = thread::Builder::new()
            .name("kira-br-scheduler".to_string())
            .spawn(move || {
                loop {
                    let now = scheduler.clock.now();
                    scheduler.tick(now);
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                tracing::info!("scheduler stopped");
            });
        let thread = match thread {
            Ok(thread) => Some(thread),
            Err(err) => {
                tracing::error!(error = %err, "could not start scheduler thread");
                None
            }
        };
        Self {
            stop: Some(stop),
            thread,
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
