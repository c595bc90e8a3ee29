use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    DatasetsResult, ExportResult, FilesResult, FilterTestResult, IngestResult, ProgressEvent,
    ProgressSink, RevisionsResult, SourcesResult, SyncResult, TagResult,
};
use crate::filter::Decision;
use crate::revisions::IngestOutcome;
use crate::scheduler::{PollStatus, TickReport};

const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const CYAN: &str = "\x1b[36m";
const RED: &str = "\x1b[31m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct TextOutput;

impl ProgressSink for TextOutput {
    fn event(&self, event: ProgressEvent) {
        eprintln!("{CYAN}» {}{RESET}", event.message);
    }
}

impl TextOutput {
    pub fn print_sync(result: &SyncResult) {
        println!(
            "{GREEN}datasets created: {}, sources added: {}, sources updated: {}{RESET}",
            result.datasets_created.len(),
            result.sources_added.len(),
            result.sources_updated.len()
        );
    }

    pub fn print_tick(report: &TickReport) {
        println!("{CYAN}KIRA-BR update{RESET}");
        if report.polled.is_empty() && report.locked.is_empty() {
            println!("{YELLOW}no sources due{RESET}");
        }
        for poll in &report.polled {
            let (color, label) = match &poll.status {
                PollStatus::Updated { update } => (GREEN, format!("update {update}")),
                PollStatus::NoChanges => (GREEN, "no changes".to_string()),
                PollStatus::NotModified => (GREEN, "not modified".to_string()),
                PollStatus::FetchFailed { message } => (RED, format!("fetch failed: {message}")),
                PollStatus::ArchiveFailed { message } => {
                    (RED, format!("archive failed: {message}"))
                }
                PollStatus::StorageFailed { message } => {
                    (RED, format!("storage failed: {message}"))
                }
            };
            println!(
                "{color}#{} {} ({label}; {} new, {} unchanged, {} discarded){RESET}",
                poll.source, poll.url, poll.revisions, poll.unchanged, poll.discarded
            );
            for skipped in &poll.skipped_entries {
                println!("{YELLOW}   skipped {skipped}{RESET}");
            }
            if poll.cancelled {
                println!("{YELLOW}   deadline reached, partial pass committed{RESET}");
            }
        }
        for source in &report.locked {
            println!("{YELLOW}#{source} busy, skipped{RESET}");
        }
    }

    pub fn print_datasets(result: &DatasetsResult) {
        for dataset in &result.datasets {
            let last = dataset
                .last_update
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            println!(
                "{} {} sources={} files={} updates={} last={last}",
                dataset.id, dataset.name, dataset.sources, dataset.files, dataset.updates
            );
        }
    }

    pub fn print_sources(result: &SourcesResult) {
        for source in &result.sources {
            let checked = source
                .checked_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            let state = if source.enabled { "" } else { " (disabled)" };
            println!(
                "{} [{}] {} every {}h{state}, checked {checked}",
                source.id, source.dataset, source.url, source.period_hours
            );
            if let Some(error) = &source.last_error {
                println!("{RED}   {} error: {}{RESET}", error.kind, error.message);
            }
            for filter in &source.filters {
                let inverted = if filter.inverted { "!" } else { "" };
                if filter.mapping.is_empty() {
                    println!("   {}: {inverted}/{}/", filter.position, filter.pattern);
                } else {
                    println!(
                        "   {}: {inverted}/{}/ -> {}",
                        filter.position, filter.pattern, filter.mapping
                    );
                }
            }
        }
    }

    pub fn print_files(result: &FilesResult) {
        println!("{CYAN}{}{RESET}", result.dataset);
        for file in &result.files {
            println!(
                "{} {} r{} {} bytes ({})",
                file.id,
                file.name,
                file.revisions,
                file.size.unwrap_or(0),
                file.default_format
            );
        }
    }

    pub fn print_revisions(result: &RevisionsResult) {
        println!("{CYAN}{} {}{RESET}", result.file, result.name);
        for summary in &result.revisions {
            let revision = &summary.revision;
            let tags = revision.tags.iter().cloned().collect::<Vec<_>>().join(",");
            println!(
                "r{} {} bytes, {} {} stored, update {} at {}{}",
                revision.number,
                revision.size,
                revision.encoding,
                revision.stored_size,
                revision.update,
                revision.created_at.to_rfc3339(),
                if tags.is_empty() {
                    String::new()
                } else {
                    format!(" [{tags}]")
                }
            );
        }
    }

    pub fn print_export(result: &ExportResult) {
        println!(
            "{GREEN}wrote r{} of file {} ({} bytes) to {}{RESET}",
            result.number, result.file, result.bytes, result.path
        );
    }

    pub fn print_ingest(result: &IngestResult) {
        match &result.outcome {
            IngestOutcome::NewRevision(revision) => println!(
                "{GREEN}{} r{} stored as {} in {}{RESET}",
                revision.name, revision.number, revision.encoding, result.dataset
            ),
            IngestOutcome::Unchanged => {
                println!("{YELLOW}{} unchanged{RESET}", result.name)
            }
        }
    }

    pub fn print_filter_test(result: &FilterTestResult) {
        for candidate in &result.candidates {
            match &candidate.decision {
                Decision::Keep(name) if *name == candidate.name => {
                    println!("{GREEN}keep    {}{RESET}", candidate.name)
                }
                Decision::Keep(name) => {
                    println!("{GREEN}keep    {} -> {name}{RESET}", candidate.name)
                }
                Decision::Discard => println!("{RED}discard {}{RESET}", candidate.name),
            }
        }
    }

    pub fn print_tag(result: &TagResult) {
        println!(
            "{GREEN}tagged r{} of file {} as {}{RESET}",
            result.number, result.file, result.tag
        );
    }
}
