use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid filter pattern {pattern:?}: {message}")]
    InvalidFilterPattern { pattern: String, message: String },

    #[error("filter mapping {mapping:?} references group {group}, but the pattern only has {available}")]
    InvalidFilterMapping {
        mapping: String,
        group: String,
        available: usize,
    },

    #[error("invalid source url: {0}")]
    InvalidSourceUrl(String),

    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),

    #[error("missing config file kira-br.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("fetch failed: {0}")]
    FetchHttp(String),

    #[error("source returned status {status}: {message}")]
    FetchStatus { status: u16, message: String },

    #[error("unreadable archive: {0}")]
    Archive(String),

    #[error("delta codec failed: {0}")]
    Delta(String),

    #[error("stored revision is corrupt: {0}")]
    CorruptRevision(String),

    #[error("concurrent update of file {0}; retry on the next pass")]
    Conflict(String),

    #[error("dataset not found: {0}")]
    DatasetNotFound(String),

    #[error("source not found: {0}")]
    SourceNotFound(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("revision not found: {0}")]
    RevisionNotFound(String),

    #[error("duplicate source {url} in dataset {dataset}")]
    DuplicateSource { dataset: String, url: String },

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("scheduler error: {0}")]
    Scheduler(String),
}
