use std::fs;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::Catalog;
use crate::config::ResolvedConfig;
use crate::domain::{
    DatasetId, FileFormat, FileId, Filter, FilterSpec, Revision, SourceError, SourceId,
    UpdateOrigin,
};
use crate::error::KiraError;
use crate::fetch::SourceFetcher;
use crate::filter::{Decision, FilterPipeline, build_filters};
use crate::revisions::{IngestOutcome, Repository};
use crate::scheduler::{SourceScheduler, SystemClock, TickReport};
use crate::store::Store;

#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    pub datasets_created: Vec<String>,
    pub sources_added: Vec<String>,
    pub sources_updated: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetsResult {
    pub datasets: Vec<DatasetSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DatasetSummary {
    pub id: DatasetId,
    pub name: String,
    pub notes: String,
    pub sources: usize,
    pub files: usize,
    pub updates: usize,
    pub last_update: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResult {
    pub sources: Vec<SourceSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceSummary {
    pub id: SourceId,
    pub dataset: String,
    pub url: String,
    pub period_hours: i64,
    pub enabled: bool,
    pub checked_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error: Option<SourceError>,
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilesResult {
    pub dataset: String,
    pub files: Vec<FileSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub id: FileId,
    pub name: String,
    pub default_format: FileFormat,
    pub revisions: u32,
    pub size: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionsResult {
    pub file: FileId,
    pub name: String,
    pub revisions: Vec<RevisionSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RevisionSummary {
    #[serde(flatten)]
    pub revision: Revision,
    pub origin: Option<UpdateOrigin>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExportResult {
    pub file: FileId,
    pub number: u32,
    pub bytes: u64,
    pub path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub dataset: String,
    pub name: String,
    #[serde(flatten)]
    pub outcome: IngestOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterTestResult {
    pub filters: Vec<Filter>,
    pub candidates: Vec<FilterCandidate>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FilterCandidate {
    pub name: String,
    #[serde(flatten)]
    pub decision: Decision,
}

#[derive(Debug, Clone, Serialize)]
pub struct TagResult {
    pub file: FileId,
    pub number: u32,
    pub tag: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

pub struct App<F: SourceFetcher + 'static> {
    repository: Arc<Repository>,
    fetcher: Arc<F>,
    config: ResolvedConfig,
}

impl<F: SourceFetcher + 'static> App<F> {
    pub fn new(repository: Arc<Repository>, fetcher: Arc<F>, config: ResolvedConfig) -> Self {
        Self {
            repository,
            fetcher,
            config,
        }
    }

    pub fn open(config: ResolvedConfig, fetcher: F) -> Result<Self, KiraError> {
        let store = match (&config.storage_root, config.global_storage) {
            (Some(root), _) => Store::new_with_root(Utf8PathBuf::from(root.as_str())),
            (None, true) => Store::global()?,
            (None, false) => Store::new()?,
        };
        let repository = Repository::open(store, config.storage)?;
        Ok(Self::new(Arc::new(repository), Arc::new(fetcher), config))
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repository
    }

    pub fn config(&self) -> &ResolvedConfig {
        &self.config
    }

    pub fn init(&self) -> Result<String, KiraError> {
        self.repository.store().ensure_root()?;
        Ok(self.repository.store().root().to_string())
    }

    pub fn sync_config(&self, sink: &dyn ProgressSink) -> Result<SyncResult, KiraError> {
        let mut result = SyncResult {
            datasets_created: Vec::new(),
            sources_added: Vec::new(),
            sources_updated: Vec::new(),
        };
        for dataset in &self.config.datasets {
            let existing = self
                .repository
                .catalog()
                .dataset_by_name(&dataset.name)
                .map(|found| found.id);
            let dataset_id = match existing {
                Some(id) => id,
                None => {
                    let id = self
                        .repository
                        .edit(|catalog| catalog.add_dataset(&dataset.name, &dataset.notes))?;
                    sink.event(ProgressEvent {
                        message: format!("created dataset {}", dataset.name),
                    });
                    result.datasets_created.push(dataset.name.clone());
                    id
                }
            };

            for source in &dataset.sources {
                let existing = self
                    .repository
                    .catalog()
                    .source_by_url(dataset_id, &source.url)
                    .map(|found| found.id);
                match existing {
                    Some(source_id) => {
                        self.repository.edit(|catalog| {
                            catalog.set_period(source_id, source.period_hours)?;
                            catalog.set_credentials(source_id, source.credentials.clone())?;
                            catalog.set_filters(source_id, &source.filters)
                        })?;
                        result.sources_updated.push(source.url.clone());
                    }
                    None => {
                        self.repository.edit(|catalog| {
                            catalog.add_source(
                                dataset_id,
                                &source.url,
                                source.credentials.clone(),
                                source.period_hours,
                                &source.filters,
                            )
                        })?;
                        sink.event(ProgressEvent {
                            message: format!("added source {}", source.url),
                        });
                        result.sources_added.push(source.url.clone());
                    }
                }
            }
        }
        Ok(result)
    }

    pub fn scheduler(&self) -> Result<Arc<SourceScheduler>, KiraError> {
        let fetcher: Arc<dyn SourceFetcher> = self.fetcher.clone();
        let scheduler = SourceScheduler::new(
            self.repository.clone(),
            fetcher,
            Arc::new(SystemClock),
            self.config.scheduler,
        )?;
        Ok(Arc::new(scheduler))
    }

    pub fn update(&self, sink: &dyn ProgressSink) -> Result<TickReport, KiraError> {
        let scheduler = self.scheduler()?;
        let now = Utc::now();
        let due = scheduler.due_sources(now).len();
        sink.event(ProgressEvent {
            message: format!("{due} source(s) due"),
        });
        Ok(scheduler.tick(now))
    }

    pub fn datasets(&self) -> Result<DatasetsResult, KiraError> {
        let catalog = self.repository.catalog();
        let datasets = catalog
            .datasets()
            .iter()
            .map(|dataset| DatasetSummary {
                id: dataset.id,
                name: dataset.name.clone(),
                notes: dataset.notes.clone(),
                sources: catalog.sources_for(dataset.id).count(),
                files: catalog.files_for(dataset.id).count(),
                updates: catalog.updates_for(dataset.id).count(),
                last_update: catalog
                    .updates_for(dataset.id)
                    .map(|update| update.timestamp)
                    .max(),
            })
            .collect();
        Ok(DatasetsResult { datasets })
    }

    pub fn sources(&self, dataset: Option<&str>) -> Result<SourcesResult, KiraError> {
        let catalog = self.repository.catalog();
        let filter = dataset
            .map(|key| resolve_dataset(&catalog, key))
            .transpose()?;
        let sources = catalog
            .sources()
            .iter()
            .filter(|source| filter.is_none_or(|id| source.dataset == id))
            .map(|source| {
                Ok(SourceSummary {
                    id: source.id,
                    dataset: catalog.dataset(source.dataset)?.name.clone(),
                    url: source.url.clone(),
                    period_hours: source.period_hours,
                    enabled: source.is_enabled(),
                    checked_at: source.checked_at,
                    last_success_at: source.last_success_at,
                    last_error: source.last_error.clone(),
                    filters: source.ordered_filters().into_iter().cloned().collect(),
                })
            })
            .collect::<Result<Vec<_>, KiraError>>()?;
        Ok(SourcesResult { sources })
    }

    pub fn files(&self, dataset: &str) -> Result<FilesResult, KiraError> {
        let catalog = self.repository.catalog();
        let dataset_id = resolve_dataset(&catalog, dataset)?;
        let mut files = catalog
            .files_for(dataset_id)
            .map(|file| FileSummary {
                id: file.id,
                name: file.name.clone(),
                default_format: file.default_format,
                revisions: file.head_number(),
                size: file.head().map(|rev| rev.size),
                updated_at: file.head().map(|rev| rev.created_at),
            })
            .collect::<Vec<_>>();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(FilesResult {
            dataset: catalog.dataset(dataset_id)?.name.clone(),
            files,
        })
    }

    pub fn revisions(&self, file: FileId) -> Result<RevisionsResult, KiraError> {
        let catalog = self.repository.catalog();
        let record = catalog.file(file)?;
        let revisions = record
            .revisions
            .iter()
            .map(|revision| RevisionSummary {
                revision: revision.clone(),
                origin: catalog.update(revision.update).map(|update| update.origin),
            })
            .collect();
        Ok(RevisionsResult {
            file,
            name: record.name.clone(),
            revisions,
        })
    }

    pub fn export(
        &self,
        file: FileId,
        number: Option<u32>,
        dest: &Utf8Path,
    ) -> Result<ExportResult, KiraError> {
        let number = match number {
            Some(number) => number,
            None => self.repository.catalog().file(file)?.head_number(),
        };
        let content = self.repository.materialize(file, number)?;
        if let Some(parent) = dest.parent().filter(|parent| !parent.as_str().is_empty()) {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        }
        Store::write_bytes_atomic(dest, &content)?;
        Ok(ExportResult {
            file,
            number,
            bytes: content.len() as u64,
            path: dest.to_string(),
        })
    }

    pub fn ingest(
        &self,
        dataset: &str,
        path: &Utf8Path,
        name: Option<&str>,
        format: FileFormat,
    ) -> Result<IngestResult, KiraError> {
        let dataset_id = resolve_dataset(&self.repository.catalog(), dataset)?;
        let content = fs::read(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
        let name = match name {
            Some(name) => name.to_string(),
            None => path
                .file_name()
                .ok_or_else(|| KiraError::Filesystem(format!("{path} has no file name")))?
                .to_string(),
        };
        let modified_at = fs::metadata(path.as_std_path())
            .and_then(|meta| meta.modified())
            .ok()
            .map(DateTime::<Utc>::from);
        let outcome = self
            .repository
            .ingest(dataset_id, &name, &content, modified_at, format)?;
        Ok(IngestResult {
            dataset: dataset.to_string(),
            name,
            outcome,
        })
    }

    pub fn filter_test(
        &self,
        source: Option<SourceId>,
        patterns: &[FilterSpec],
        names: &[String],
    ) -> Result<FilterTestResult, KiraError> {
        let filters = match source {
            Some(id) if patterns.is_empty() => self.repository.catalog().source(id)?.filters.clone(),
            _ => build_filters(patterns)?,
        };
        let pipeline = FilterPipeline::compile(&filters)?;
        let candidates = names
            .iter()
            .map(|name| FilterCandidate {
                name: name.clone(),
                decision: pipeline.apply(name),
            })
            .collect();
        Ok(FilterTestResult {
            filters,
            candidates,
        })
    }

    pub fn tag(&self, file: FileId, number: u32, tag: &str) -> Result<TagResult, KiraError> {
        self.repository
            .edit(|catalog| catalog.tag_revision(file, number, tag))?;
        Ok(TagResult {
            file,
            number,
            tag: tag.trim().to_string(),
        })
    }
}

pub fn resolve_dataset(catalog: &Catalog, key: &str) -> Result<DatasetId, KiraError> {
    if let Some(dataset) = catalog.dataset_by_name(key) {
        return Ok(dataset.id);
    }
    let id = key
        .parse::<DatasetId>()
        .map_err(|_| KiraError::DatasetNotFound(key.to_string()))?;
    catalog.dataset(id).map(|dataset| dataset.id)
}
