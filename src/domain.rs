use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

macro_rules! id_type {
    ($name:ident, $label:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = KiraError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                value
                    .trim()
                    .parse::<u64>()
                    .map(Self)
                    .map_err(|_| KiraError::Catalog(format!("invalid {} id: {value}", $label)))
            }
        }
    };
}

id_type!(DatasetId, "dataset");
id_type!(SourceId, "source");
id_type!(FileId, "file");
id_type!(UpdateId, "update");

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    #[default]
    Raw,
    Simple,
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Raw => write!(f, "raw"),
            FileFormat::Simple => write!(f, "simple"),
        }
    }
}

impl FromStr for FileFormat {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "raw" => Ok(FileFormat::Raw),
            "simple" => Ok(FileFormat::Simple),
            _ => Err(KiraError::InvalidFormat(value.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validators {
    #[serde(default)]
    pub etag: Option<String>,
    #[serde(default)]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub content_length: Option<u64>,
}

impl Validators {
    pub fn is_empty(&self) -> bool {
        self.etag.is_none() && self.last_modified.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub position: u32,
    pub pattern: String,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub mapping: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterSpec {
    pub pattern: String,
    #[serde(default)]
    pub inverted: bool,
    #[serde(default)]
    pub mapping: String,
}

impl FilterSpec {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            inverted: false,
            mapping: String::new(),
        }
    }

    pub fn inverted(mut self) -> Self {
        self.inverted = true;
        self
    }

    pub fn with_mapping(mut self, mapping: impl Into<String>) -> Self {
        self.mapping = mapping.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceErrorKind {
    Fetch,
    Archive,
    Filter,
    Storage,
    Partial,
}

impl fmt::Display for SourceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceErrorKind::Fetch => write!(f, "fetch"),
            SourceErrorKind::Archive => write!(f, "archive"),
            SourceErrorKind::Filter => write!(f, "filter"),
            SourceErrorKind::Storage => write!(f, "storage"),
            SourceErrorKind::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceError {
    pub kind: SourceErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: SourceId,
    pub dataset: DatasetId,
    pub url: String,
    #[serde(default)]
    pub credentials: Option<Credentials>,
    /// Polling period in hours; zero or negative disables the source.
    pub period_hours: i64,
    #[serde(default)]
    pub checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub validators: Validators,
    #[serde(default)]
    pub last_success_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<SourceError>,
}

impl Source {
    pub fn is_enabled(&self) -> bool {
        self.period_hours > 0
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self.checked_at {
            None => true,
            Some(checked_at) => checked_at + Duration::hours(self.period_hours) <= now,
        }
    }

    pub fn ordered_filters(&self) -> Vec<&Filter> {
        let mut filters = self.filters.iter().collect::<Vec<_>>();
        filters.sort_by_key(|filter| filter.position);
        filters
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dataset {
    pub id: DatasetId,
    pub name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub categories: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RevisionEncoding {
    Snapshot,
    Delta,
}

impl fmt::Display for RevisionEncoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevisionEncoding::Snapshot => write!(f, "snapshot"),
            RevisionEncoding::Delta => write!(f, "delta"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    pub number: u32,
    pub size: u64,
    pub stored_size: u64,
    pub encoding: RevisionEncoding,
    pub sha256: String,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub format: FileFormat,
    pub update: UpdateId,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: FileId,
    pub dataset: DatasetId,
    pub name: String,
    pub default_format: FileFormat,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Revision `n` lives at index `n - 1`.
    #[serde(default)]
    pub revisions: Vec<Revision>,
}

impl FileRecord {
    pub fn head(&self) -> Option<&Revision> {
        self.revisions.last()
    }

    pub fn head_number(&self) -> u32 {
        self.head().map(|rev| rev.number).unwrap_or(0)
    }

    pub fn revision(&self, number: u32) -> Option<&Revision> {
        if number == 0 {
            return None;
        }
        self.revisions
            .get(number as usize - 1)
            .filter(|rev| rev.number == number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionRef {
    pub file: FileId,
    pub number: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "source", rename_all = "lowercase")]
pub enum UpdateOrigin {
    Source(SourceId),
    Manual,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub id: UpdateId,
    pub dataset: DatasetId,
    pub origin: UpdateOrigin,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub modified_at: Option<DateTime<Utc>>,
    pub revisions: Vec<RevisionRef>,
}
