use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration as StdDuration, Instant};

use assert_matches::assert_matches;
use camino::Utf8PathBuf;
use chrono::{DateTime, Duration, TimeZone, Utc};

use kira_biodata_repository::domain::{
    DatasetId, FilterSpec, SourceErrorKind, SourceId, UpdateOrigin, Validators,
};
use kira_biodata_repository::error::KiraError;
use kira_biodata_repository::fetch::{FetchOutcome, FetchRequest, Payload, SourceFetcher};
use kira_biodata_repository::revisions::{Repository, StorageOptions};
use kira_biodata_repository::scheduler::{
    Clock, ManualClock, PollStatus, SchedulerHandle, SchedulerOptions, SourceScheduler,
};
use kira_biodata_repository::store::Store;

// Replays canned answers and remembers every request it saw.
#[derive(Default)]
struct ScriptedFetcher {
    answers: Mutex<VecDeque<Result<FetchOutcome, KiraError>>>,
    requests: Mutex<Vec<FetchRequest>>,
    clock: Option<Arc<ManualClock>>,
    delay: Option<Duration>,
}

impl ScriptedFetcher {
    fn push(&self, answer: Result<FetchOutcome, KiraError>) {
        self.answers.lock().unwrap().push_back(answer);
    }

    fn requests(&self) -> Vec<FetchRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl SourceFetcher for ScriptedFetcher {
    fn fetch(&self, request: &FetchRequest) -> Result<FetchOutcome, KiraError> {
        self.requests.lock().unwrap().push(request.clone());
        if let (Some(clock), Some(delay)) = (&self.clock, self.delay) {
            clock.advance(delay);
        }
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(FetchOutcome::Unchanged))
    }
}

// Moves forward by `step` every time it is read.
struct SteppingClock {
    current: Mutex<DateTime<Utc>>,
    step: Duration,
}

impl Clock for SteppingClock {
    fn now(&self) -> DateTime<Utc> {
        let mut current = self.current.lock().unwrap();
        let now = *current;
        *current = now + self.step;
        now
    }
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

struct Fixture {
    _temp: tempfile::TempDir,
    repository: Arc<Repository>,
    dataset: DatasetId,
}

impl Fixture {
    fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("repo")).unwrap();
        let repository =
            Arc::new(Repository::open(Store::new_with_root(root), StorageOptions::default()).unwrap());
        let dataset = repository
            .edit(|catalog| catalog.add_dataset("drugbank", ""))
            .unwrap();
        Self {
            _temp: temp,
            repository,
            dataset,
        }
    }

    fn source(&self, url: &str, period_hours: i64, filters: &[FilterSpec]) -> SourceId {
        self.repository
            .edit(|catalog| catalog.add_source(self.dataset, url, None, period_hours, filters))
            .unwrap()
    }

    fn scheduler(
        &self,
        fetcher: Arc<ScriptedFetcher>,
        clock: Arc<ManualClock>,
        options: SchedulerOptions,
    ) -> SourceScheduler {
        SourceScheduler::new(self.repository.clone(), fetcher, clock, options).unwrap()
    }
}

fn plain(bytes: &[u8], etag: Option<&str>) -> FetchOutcome {
    FetchOutcome::Payload(Payload {
        bytes: bytes.to_vec(),
        content_type: Some("text/plain".to_string()),
        last_modified: None,
        validators: Validators {
            etag: etag.map(str::to_string),
            last_modified: None,
            content_length: Some(bytes.len() as u64),
        },
    })
}

fn tar_payload(files: &[(&str, &[u8])]) -> FetchOutcome {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *data).unwrap();
    }
    FetchOutcome::Payload(Payload {
        bytes: builder.into_inner().unwrap(),
        content_type: Some("application/x-tar".to_string()),
        last_modified: None,
        validators: Validators::default(),
    })
}

fn zip_payload(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Stored);
    for (name, data) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

#[test]
fn conditional_hit_advances_checked_at_without_update() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.txt", 24, &[]);
    fixture
        .repository
        .edit(|catalog| {
            let stored = catalog.source_mut(source)?;
            stored.checked_at = Some(t0());
            stored.validators.etag = Some("\"v1\"".to_string());
            Ok(())
        })
        .unwrap();

    let clock = Arc::new(ManualClock::new(t0() + Duration::hours(25)));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(FetchOutcome::Unchanged));
    let scheduler = fixture.scheduler(fetcher.clone(), clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    assert_eq!(report.polled.len(), 1);
    assert_eq!(report.polled[0].status, PollStatus::NotModified);
    assert_eq!(
        fetcher.requests()[0].validators.etag.as_deref(),
        Some("\"v1\"")
    );

    let catalog = fixture.repository.catalog();
    assert_eq!(catalog.source(source).unwrap().checked_at, Some(clock.now()));
    assert!(catalog.updates().is_empty());
}

#[test]
fn source_not_due_is_left_alone() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.txt", 24, &[]);
    fixture
        .repository
        .edit(|catalog| {
            catalog.source_mut(source)?.checked_at = Some(t0());
            Ok(())
        })
        .unwrap();
    let clock = Arc::new(ManualClock::new(t0() + Duration::hours(23)));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let scheduler = fixture.scheduler(fetcher.clone(), clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    assert!(report.polled.is_empty());
    assert!(fetcher.requests().is_empty());
}

#[test]
fn disabled_source_is_never_polled() {
    let fixture = Fixture::new();
    fixture.source("https://example.org/off.txt", 0, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let scheduler = fixture.scheduler(fetcher.clone(), clock.clone(), SchedulerOptions::default());
    assert!(scheduler.tick(clock.now()).polled.is_empty());
    assert!(fetcher.requests().is_empty());
}

#[test]
fn filtered_pass_records_one_update() {
    let fixture = Fixture::new();
    let source = fixture.source(
        "https://example.org/bundle.tar",
        24,
        &[
            FilterSpec::new(r"^data_(\d+)\.csv$").with_mapping(r"rec_\1.csv"),
            FilterSpec::new(r"\.txt$"),
        ],
    );
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(tar_payload(&[
        ("data_42.csv", b"1,2,3"),
        ("notes.txt", b"hello"),
        ("image.png", b"\x89PNG"),
    ])));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    let poll = &report.polled[0];
    assert_matches!(poll.status, PollStatus::Updated { .. });
    assert_eq!(poll.revisions, 2);
    assert_eq!(poll.discarded, 1);

    let catalog = fixture.repository.catalog();
    let mut names = catalog
        .files_for(fixture.dataset)
        .map(|file| file.name.clone())
        .collect::<Vec<_>>();
    names.sort();
    assert_eq!(names, vec!["notes.txt", "rec_42.csv"]);
    assert_eq!(catalog.updates().len(), 1);
    assert_eq!(catalog.updates()[0].origin, UpdateOrigin::Source(source));
    assert_eq!(catalog.updates()[0].revisions.len(), 2);
    assert!(catalog.source(source).unwrap().last_success_at.is_some());
}

#[test]
fn identical_payload_yields_no_update() {
    let fixture = Fixture::new();
    fixture.source("https://example.org/db.txt", 1, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(plain(b"AAAA", None)));
    fetcher.push(Ok(plain(b"AAAA", None)));
    fetcher.push(Ok(plain(b"AAAB", None)));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    assert_matches!(
        scheduler.tick(clock.now()).polled[0].status,
        PollStatus::Updated { .. }
    );
    clock.advance(Duration::hours(1));
    let second = scheduler.tick(clock.now());
    assert_eq!(second.polled[0].status, PollStatus::NoChanges);
    assert_eq!(second.polled[0].unchanged, 1);
    assert_eq!(fixture.repository.catalog().updates().len(), 1);

    clock.advance(Duration::hours(1));
    assert_matches!(
        scheduler.tick(clock.now()).polled[0].status,
        PollStatus::Updated { .. }
    );
    let file = fixture
        .repository
        .catalog()
        .file_by_name(fixture.dataset, "db.txt")
        .unwrap()
        .id;
    assert_eq!(fixture.repository.materialize(file, 2).unwrap(), b"AAAB");
}

#[test]
fn validators_are_stored_after_commit_and_sent_next_time() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.txt", 1, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(plain(b"content", Some("\"abc\""))));
    fetcher.push(Ok(FetchOutcome::Unchanged));
    let scheduler = fixture.scheduler(fetcher.clone(), clock.clone(), SchedulerOptions::default());

    scheduler.tick(clock.now());
    assert_eq!(
        fixture
            .repository
            .catalog()
            .source(source)
            .unwrap()
            .validators
            .etag
            .as_deref(),
        Some("\"abc\"")
    );
    clock.advance(Duration::hours(2));
    scheduler.tick(clock.now());
    let requests = fetcher.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].validators.etag.as_deref(), Some("\"abc\""));
}

#[test]
fn fetch_error_is_recorded_and_checked_at_advances() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.txt", 6, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Err(KiraError::FetchStatus {
        status: 503,
        message: "maintenance".to_string(),
    }));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    assert_matches!(report.polled[0].status, PollStatus::FetchFailed { .. });

    let catalog = fixture.repository.catalog();
    let stored = catalog.source(source).unwrap();
    assert_eq!(stored.checked_at, Some(t0()));
    let error = stored.last_error.as_ref().unwrap();
    assert_eq!(error.kind, SourceErrorKind::Fetch);
    assert!(error.message.contains("503"));
    assert!(catalog.updates().is_empty());
    assert!(!stored.is_due(t0() + Duration::hours(5)));
    assert!(stored.is_due(t0() + Duration::hours(6)));
}

#[test]
fn unreadable_archive_annotates_source() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.zip", 24, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(FetchOutcome::Payload(Payload {
        bytes: b"truncated".to_vec(),
        content_type: Some("application/zip".to_string()),
        last_modified: None,
        validators: Validators::default(),
    })));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    assert_matches!(report.polled[0].status, PollStatus::ArchiveFailed { .. });
    let catalog = fixture.repository.catalog();
    assert_eq!(
        catalog.source(source).unwrap().last_error.as_ref().unwrap().kind,
        SourceErrorKind::Archive
    );
    assert!(catalog.files().is_empty());
}

#[test]
fn locked_source_is_skipped_without_touching_checked_at() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/db.txt", 24, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    let scheduler = fixture.scheduler(fetcher.clone(), clock.clone(), SchedulerOptions::default());

    let lease = scheduler.locks().try_acquire(source).unwrap();
    let report = scheduler.tick(clock.now());
    assert!(report.polled.is_empty());
    assert_eq!(report.locked, vec![source]);
    assert!(fetcher.requests().is_empty());
    assert!(
        fixture
            .repository
            .catalog()
            .source(source)
            .unwrap()
            .checked_at
            .is_none()
    );

    drop(lease);
    assert_eq!(scheduler.tick(clock.now()).polled.len(), 1);
}

#[test]
fn deadline_commits_work_done_so_far() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/bundle.tar", 24, &[]);
    let clock = Arc::new(SteppingClock {
        current: Mutex::new(t0()),
        step: Duration::minutes(1),
    });
    let fetcher = Arc::new(ScriptedFetcher::default());
    let mut payload = tar_payload(&[("a.txt", b"a"), ("b.txt", b"b"), ("c.txt", b"c")]);
    if let FetchOutcome::Payload(payload) = &mut payload {
        payload.validators.etag = Some("\"bundle-v2\"".to_string());
    }
    fetcher.push(Ok(payload));
    let options = SchedulerOptions {
        workers: 1,
        poll_deadline: Some(Duration::seconds(150)),
    };
    let scheduler =
        SourceScheduler::new(fixture.repository.clone(), fetcher, clock, options).unwrap();

    // Poll starts at t0; entries are checked at t0+1m, t0+2m and t0+3m.
    let report = scheduler.tick(t0());
    let poll = &report.polled[0];
    assert!(poll.cancelled);
    assert_eq!(poll.revisions, 2);
    assert_matches!(poll.status, PollStatus::Updated { .. });

    let catalog = fixture.repository.catalog();
    assert_eq!(catalog.files().len(), 2);
    assert!(catalog.file_by_name(fixture.dataset, "c.txt").is_none());
    assert_eq!(catalog.updates()[0].revisions.len(), 2);
    // A cut-short pass must not make the next poll look unchanged.
    assert!(catalog.source(source).unwrap().validators.is_empty());
}

#[test]
fn fetch_overrunning_deadline_ingests_nothing() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/bundle.tar", 24, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher {
        clock: Some(clock.clone()),
        delay: Some(Duration::hours(2)),
        ..ScriptedFetcher::default()
    });
    fetcher.push(Ok(tar_payload(&[("a.txt", b"a"), ("b.txt", b"b")])));
    let options = SchedulerOptions {
        workers: 1,
        poll_deadline: Some(Duration::hours(1)),
    };
    let scheduler = fixture.scheduler(fetcher, clock.clone(), options);

    let report = scheduler.tick(clock.now());
    let poll = &report.polled[0];
    assert!(poll.cancelled);
    assert_eq!(poll.revisions, 0);
    assert_eq!(poll.status, PollStatus::NoChanges);

    let catalog = fixture.repository.catalog();
    assert!(catalog.files().is_empty());
    assert!(catalog.updates().is_empty());
    assert!(catalog.source(source).unwrap().validators.is_empty());
}

#[test]
fn corrupt_member_commits_the_rest_and_annotates_source() {
    let fixture = Fixture::new();
    let source = fixture.source("https://example.org/bundle.zip", 24, &[]);
    let mut bytes = zip_payload(&[
        ("good.txt", b"intact member"),
        ("bad.txt", b"member with a broken checksum"),
    ]);
    let needle = b"broken checksum";
    let at = bytes
        .windows(needle.len())
        .position(|window| window == needle)
        .unwrap();
    bytes[at] ^= 0xff;

    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(FetchOutcome::Payload(Payload {
        bytes,
        content_type: Some("application/zip".to_string()),
        last_modified: None,
        validators: Validators {
            etag: Some("\"zip-v1\"".to_string()),
            last_modified: None,
            content_length: None,
        },
    })));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    let poll = &report.polled[0];
    assert_matches!(poll.status, PollStatus::Updated { .. });
    assert_eq!(poll.revisions, 1);
    assert_eq!(poll.skipped_entries.len(), 1);
    assert!(poll.skipped_entries[0].starts_with("bad.txt"));

    let catalog = fixture.repository.catalog();
    assert_eq!(catalog.files().len(), 1);
    assert!(catalog.file_by_name(fixture.dataset, "good.txt").is_some());
    let stored = catalog.source(source).unwrap();
    let error = stored.last_error.as_ref().unwrap();
    assert_eq!(error.kind, SourceErrorKind::Partial);
    assert!(error.message.contains("bad.txt"));
    assert_eq!(stored.last_success_at, Some(t0()));
    assert!(stored.validators.is_empty());
}

#[test]
fn handle_polls_in_background_until_stopped() {
    let fixture = Fixture::new();
    fixture.source("https://example.org/db.txt", 24, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(plain(b"first", None)));
    let scheduler = Arc::new(fixture.scheduler(
        fetcher.clone(),
        clock.clone(),
        SchedulerOptions::default(),
    ));

    let handle = SchedulerHandle::start(scheduler, StdDuration::from_millis(20));
    let started = Instant::now();
    while fetcher.requests().is_empty() && started.elapsed() < StdDuration::from_secs(5) {
        thread::sleep(StdDuration::from_millis(10));
    }
    assert!(handle.is_running());
    assert_eq!(fetcher.requests().len(), 1);

    handle.stop();
    let fetched = fetcher.requests().len();
    clock.advance(Duration::hours(48));
    thread::sleep(StdDuration::from_millis(100));
    assert_eq!(fetcher.requests().len(), fetched);
    assert_eq!(fixture.repository.catalog().updates().len(), 1);
}

#[test]
fn independent_sources_are_polled_in_one_tick() {
    let fixture = Fixture::new();
    let a = fixture.source("https://example.org/a.txt", 24, &[]);
    let b = fixture.source("https://example.org/b.txt", 24, &[]);
    let clock = Arc::new(ManualClock::new(t0()));
    let fetcher = Arc::new(ScriptedFetcher::default());
    fetcher.push(Ok(plain(b"one", None)));
    fetcher.push(Ok(plain(b"two", None)));
    let scheduler = fixture.scheduler(fetcher, clock.clone(), SchedulerOptions::default());

    let report = scheduler.tick(clock.now());
    let polled = report.polled.iter().map(|poll| poll.source).collect::<Vec<_>>();
    assert_eq!(polled, vec![a, b]);
    assert_eq!(fixture.repository.catalog().updates().len(), 2);
    assert_eq!(fixture.repository.catalog().files().len(), 2);
}
