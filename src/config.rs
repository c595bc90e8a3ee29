use std::fs;
use std::path::PathBuf;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::domain::{Credentials, FilterSpec};
use crate::error::KiraError;
use crate::fetch::FetchOptions;
use crate::filter::validate_filter;
use crate::revisions::StorageOptions;
use crate::scheduler::SchedulerOptions;

pub const CONFIG_FILE: &str = "kira-br.json";
pub const DEFAULT_PERIOD_HOURS: i64 = 24;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub fetch: FetchSection,
    #[serde(default)]
    pub datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct StorageSection {
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub global: bool,
    #[serde(default)]
    pub snapshot_every: Option<u32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub tick_minutes: Option<u64>,
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default)]
    pub poll_deadline_minutes: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FetchSection {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retries: Option<usize>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatasetEntry {
    pub name: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SourceEntry {
    Shorthand(String),
    Detailed(SourceEntryObject),
}

#[derive(Debug, Deserialize, Serialize)]
pub struct SourceEntryObject {
    pub url: String,
    #[serde(default)]
    pub period_hours: Option<i64>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub filters: Vec<FilterEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum FilterEntry {
    Shorthand(String),
    Detailed(FilterSpec),
}

#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub url: String,
    pub period_hours: i64,
    pub credentials: Option<Credentials>,
    pub filters: Vec<FilterSpec>,
}

#[derive(Debug, Clone)]
pub struct DatasetRequest {
    pub name: String,
    pub notes: String,
    pub sources: Vec<SourceRequest>,
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub storage_root: Option<String>,
    pub global_storage: bool,
    pub storage: StorageOptions,
    pub scheduler: SchedulerOptions,
    pub tick_interval: StdDuration,
    pub fetch: FetchOptions,
    pub datasets: Vec<DatasetRequest>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            storage_root: None,
            global_storage: false,
            storage: StorageOptions::default(),
            scheduler: SchedulerOptions::default(),
            tick_interval: StdDuration::from_secs(15 * 60),
            fetch: FetchOptions::default(),
            datasets: Vec::new(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_or_default(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        match Self::resolve(path) {
            Err(KiraError::MissingConfig) => Ok(ResolvedConfig::default()),
            other => other,
        }
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        let defaults = ResolvedConfig::default();
        let schema_version = config.schema_version.unwrap_or(1);

        let datasets = config
            .datasets
            .into_iter()
            .map(|dataset| {
                let sources = dataset
                    .sources
                    .into_iter()
                    .map(resolve_source)
                    .collect::<Result<Vec<_>, KiraError>>()?;
                Ok(DatasetRequest {
                    name: dataset.name,
                    notes: dataset.notes,
                    sources,
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;

        let fetch = FetchOptions {
            timeout: config
                .fetch
                .timeout_secs
                .map(StdDuration::from_secs)
                .unwrap_or(defaults.fetch.timeout),
            max_retries: config.fetch.retries.unwrap_or(defaults.fetch.max_retries),
            ..defaults.fetch
        };
        let scheduler = SchedulerOptions {
            workers: config
                .scheduler
                .workers
                .unwrap_or(defaults.scheduler.workers),
            poll_deadline: config
                .scheduler
                .poll_deadline_minutes
                .filter(|minutes| *minutes > 0)
                .map(Duration::minutes),
        };
        let tick_interval = config
            .scheduler
            .tick_minutes
            .filter(|minutes| *minutes > 0)
            .map(|minutes| StdDuration::from_secs(minutes * 60))
            .unwrap_or(defaults.tick_interval);

        Ok(ResolvedConfig {
            schema_version,
            storage_root: config.storage.root,
            global_storage: config.storage.global,
            storage: StorageOptions {
                snapshot_every: config.storage.snapshot_every.unwrap_or(0),
            },
            scheduler,
            tick_interval,
            fetch,
            datasets,
        })
    }
}

fn resolve_source(entry: SourceEntry) -> Result<SourceRequest, KiraError> {
    match entry {
        SourceEntry::Shorthand(url) => Ok(SourceRequest {
            url,
            period_hours: DEFAULT_PERIOD_HOURS,
            credentials: None,
            filters: Vec::new(),
        }),
        SourceEntry::Detailed(obj) => {
            let filters = obj
                .filters
                .into_iter()
                .map(|filter| {
                    let spec = match filter {
                        FilterEntry::Shorthand(pattern) => FilterSpec::new(pattern),
                        FilterEntry::Detailed(spec) => spec,
                    };
                    validate_filter(&spec)?;
                    Ok(spec)
                })
                .collect::<Result<Vec<_>, KiraError>>()?;
            let credentials = obj.username.map(|username| Credentials {
                username,
                password: obj.password.unwrap_or_default(),
            });
            Ok(SourceRequest {
                url: obj.url,
                period_hours: obj.period_hours.unwrap_or(DEFAULT_PERIOD_HOURS),
                credentials,
                filters,
            })
        }
    }
}
