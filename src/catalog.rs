use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::domain::{
    Credentials, Dataset, DatasetId, FileId, FileRecord, FilterSpec, Source, SourceId, Update,
    UpdateId, Validators,
};
use crate::error::KiraError;
use crate::filter::build_filters;

pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Catalog {
    pub schema_version: u32,
    next_id: u64,
    #[serde(default)]
    datasets: Vec<Dataset>,
    #[serde(default)]
    sources: Vec<Source>,
    #[serde(default)]
    files: Vec<FileRecord>,
    #[serde(default)]
    updates: Vec<Update>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            next_id: 1,
            datasets: Vec::new(),
            sources: Vec::new(),
            files: Vec::new(),
            updates: Vec::new(),
        }
    }
}

impl Catalog {
    pub(crate) fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn add_dataset(&mut self, name: &str, notes: &str) -> Result<DatasetId, KiraError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(KiraError::Catalog("dataset name must not be empty".to_string()));
        }
        if self.dataset_by_name(name).is_some() {
            return Err(KiraError::Catalog(format!("dataset {name} already exists")));
        }
        let id = DatasetId(self.allocate_id());
        self.datasets.push(Dataset {
            id,
            name: name.to_string(),
            notes: notes.to_string(),
            tags: BTreeSet::new(),
            categories: BTreeSet::new(),
        });
        Ok(id)
    }

    pub fn datasets(&self) -> &[Dataset] {
        &self.datasets
    }

    pub fn dataset(&self, id: DatasetId) -> Result<&Dataset, KiraError> {
        self.datasets
            .iter()
            .find(|dataset| dataset.id == id)
            .ok_or_else(|| KiraError::DatasetNotFound(id.to_string()))
    }

    pub fn dataset_by_name(&self, name: &str) -> Option<&Dataset> {
        self.datasets.iter().find(|dataset| dataset.name == name)
    }

    pub fn add_source(
        &mut self,
        dataset: DatasetId,
        url: &str,
        credentials: Option<Credentials>,
        period_hours: i64,
        filters: &[FilterSpec],
    ) -> Result<SourceId, KiraError> {
        self.dataset(dataset)?;
        let url = validate_url(url)?;
        if self.source_by_url(dataset, &url).is_some() {
            return Err(KiraError::DuplicateSource {
                dataset: dataset.to_string(),
                url,
            });
        }
        let filters = build_filters(filters)?;
        let id = SourceId(self.allocate_id());
        self.sources.push(Source {
            id,
            dataset,
            url,
            credentials,
            period_hours,
            checked_at: None,
            filters,
            validators: Validators::default(),
            last_success_at: None,
            last_error: None,
        });
        Ok(id)
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn source(&self, id: SourceId) -> Result<&Source, KiraError> {
        self.sources
            .iter()
            .find(|source| source.id == id)
            .ok_or_else(|| KiraError::SourceNotFound(id.to_string()))
    }

    pub fn source_mut(&mut self, id: SourceId) -> Result<&mut Source, KiraError> {
        self.sources
            .iter_mut()
            .find(|source| source.id == id)
            .ok_or_else(|| KiraError::SourceNotFound(id.to_string()))
    }

    pub fn source_by_url(&self, dataset: DatasetId, url: &str) -> Option<&Source> {
        self.sources
            .iter()
            .find(|source| source.dataset == dataset && source.url == url)
    }

    pub fn sources_for(&self, dataset: DatasetId) -> impl Iterator<Item = &Source> {
        self.sources
            .iter()
            .filter(move |source| source.dataset == dataset)
    }

    pub fn set_filters(&mut self, id: SourceId, filters: &[FilterSpec]) -> Result<(), KiraError> {
        let filters = build_filters(filters)?;
        self.source_mut(id)?.filters = filters;
        Ok(())
    }

    pub fn set_period(&mut self, id: SourceId, period_hours: i64) -> Result<(), KiraError> {
        self.source_mut(id)?.period_hours = period_hours;
        Ok(())
    }

    pub fn set_url(&mut self, id: SourceId, url: &str) -> Result<(), KiraError> {
        let url = validate_url(url)?;
        let dataset = self.source(id)?.dataset;
        if let Some(existing) = self.source_by_url(dataset, &url) {
            if existing.id != id {
                return Err(KiraError::DuplicateSource {
                    dataset: dataset.to_string(),
                    url,
                });
            }
        }
        let source = self.source_mut(id)?;
        if source.url != url {
            source.url = url;
            source.validators = Validators::default();
        }
        Ok(())
    }

    pub fn set_credentials(
        &mut self,
        id: SourceId,
        credentials: Option<Credentials>,
    ) -> Result<(), KiraError> {
        self.source_mut(id)?.credentials = credentials;
        Ok(())
    }

    pub fn files(&self) -> &[FileRecord] {
        &self.files
    }

    pub fn file(&self, id: FileId) -> Result<&FileRecord, KiraError> {
        self.files
            .iter()
            .find(|file| file.id == id)
            .ok_or_else(|| KiraError::FileNotFound(id.to_string()))
    }

    pub(crate) fn file_mut(&mut self, id: FileId) -> Result<&mut FileRecord, KiraError> {
        self.files
            .iter_mut()
            .find(|file| file.id == id)
            .ok_or_else(|| KiraError::FileNotFound(id.to_string()))
    }

    pub fn file_by_name(&self, dataset: DatasetId, name: &str) -> Option<&FileRecord> {
        self.files
            .iter()
            .find(|file| file.dataset == dataset && file.name == name)
    }

    pub fn files_for(&self, dataset: DatasetId) -> impl Iterator<Item = &FileRecord> {
        self.files.iter().filter(move |file| file.dataset == dataset)
    }

    pub(crate) fn insert_file(&mut self, file: FileRecord) {
        self.files.push(file);
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }

    pub fn update(&self, id: UpdateId) -> Option<&Update> {
        self.updates.iter().find(|update| update.id == id)
    }

    pub fn updates_for(&self, dataset: DatasetId) -> impl Iterator<Item = &Update> {
        self.updates
            .iter()
            .filter(move |update| update.dataset == dataset)
    }

    pub(crate) fn insert_update(&mut self, update: Update) -> Result<(), KiraError> {
        if update.revisions.is_empty() {
            return Err(KiraError::Catalog(
                "refusing to record an update without revisions".to_string(),
            ));
        }
        self.updates.push(update);
        Ok(())
    }

    pub fn tag_revision(&mut self, file: FileId, number: u32, tag: &str) -> Result<(), KiraError> {
        let tag = tag.trim();
        if tag.is_empty() {
            return Err(KiraError::Catalog("tag must not be empty".to_string()));
        }
        let record = self.file_mut(file)?;
        let revision = record
            .revisions
            .get_mut((number as usize).wrapping_sub(1))
            .filter(|rev| rev.number == number)
            .ok_or_else(|| KiraError::RevisionNotFound(format!("{file}@{number}")))?;
        revision.tags.insert(tag.to_string());
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<String, KiraError> {
    let trimmed = url.trim();
    let parsed = Url::parse(trimmed).map_err(|err| KiraError::InvalidSourceUrl(format!("{trimmed}: {err}")))?;
    match parsed.scheme() {
        "http" | "https" | "ftp" | "file" => Ok(trimmed.to_string()),
        other => Err(KiraError::UnsupportedScheme(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn source_urls_are_unique_per_dataset() {
        let mut catalog = Catalog::default();
        let a = catalog.add_dataset("drugbank", "").unwrap();
        let b = catalog.add_dataset("uniprot", "").unwrap();
        catalog
            .add_source(a, "https://example.org/db.zip", None, 24, &[])
            .unwrap();
        let err = catalog
            .add_source(a, "https://example.org/db.zip", None, 24, &[])
            .unwrap_err();
        assert_matches!(err, KiraError::DuplicateSource { .. });
        catalog
            .add_source(b, "https://example.org/db.zip", None, 24, &[])
            .unwrap();
    }

    #[test]
    fn invalid_filter_is_rejected_before_saving() {
        let mut catalog = Catalog::default();
        let dataset = catalog.add_dataset("go", "").unwrap();
        let source = catalog
            .add_source(dataset, "https://example.org/go.obo", None, 24, &[])
            .unwrap();
        let err = catalog
            .set_filters(source, &[FilterSpec::new("(unclosed")])
            .unwrap_err();
        assert_matches!(err, KiraError::InvalidFilterPattern { .. });
        assert!(catalog.source(source).unwrap().filters.is_empty());
    }

    #[test]
    fn only_known_transports_are_accepted() {
        let mut catalog = Catalog::default();
        let dataset = catalog.add_dataset("refseq", "").unwrap();
        catalog
            .add_source(dataset, "ftp://ftp.ncbi.nlm.nih.gov/refseq/x.gz", None, 24, &[])
            .unwrap();
        let err = catalog
            .add_source(dataset, "gopher://example.org/1/refseq", None, 24, &[])
            .unwrap_err();
        assert_matches!(err, KiraError::UnsupportedScheme(_));
    }

    #[test]
    fn changing_url_forgets_validators() {
        let mut catalog = Catalog::default();
        let dataset = catalog.add_dataset("kegg", "").unwrap();
        let source = catalog
            .add_source(dataset, "https://example.org/a", None, 1, &[])
            .unwrap();
        catalog.source_mut(source).unwrap().validators.etag = Some("\"v1\"".to_string());
        catalog.set_url(source, "https://example.org/b").unwrap();
        assert!(catalog.source(source).unwrap().validators.is_empty());
    }

    #[test]
    fn ids_are_never_reused() {
        let mut catalog = Catalog::default();
        let a = catalog.add_dataset("a", "").unwrap();
        let b = catalog.add_dataset("b", "").unwrap();
        assert_ne!(a.get(), b.get());
    }
}
