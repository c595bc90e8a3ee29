use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard};
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::catalog::Catalog;
use crate::delta::{self, Delta};
use crate::domain::{
    DatasetId, FileFormat, FileId, FileRecord, Revision, RevisionEncoding, RevisionRef, Update,
    UpdateId, UpdateOrigin,
};
use crate::error::KiraError;
use crate::store::{StagedBlob, Store};
use crate::updates::{ResourceInfo, UpdateRecorder};

pub trait DeltaCodec: Send + Sync {
    fn encode(&self, basis: &[u8], target: &[u8]) -> Result<Vec<u8>, KiraError>;
    fn decode(&self, basis: &[u8], delta: &[u8]) -> Result<Vec<u8>, KiraError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct BlockDeltaCodec;

impl DeltaCodec for BlockDeltaCodec {
    fn encode(&self, basis: &[u8], target: &[u8]) -> Result<Vec<u8>, KiraError> {
        Ok(delta::diff(basis, target).encode())
    }

    fn decode(&self, basis: &[u8], delta: &[u8]) -> Result<Vec<u8>, KiraError> {
        delta::apply(basis, &Delta::decode(delta)?)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StorageOptions {
    pub snapshot_every: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewRevision {
    pub file: FileId,
    pub name: String,
    pub number: u32,
    pub size: u64,
    pub encoding: RevisionEncoding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    NewRevision(NewRevision),
    Unchanged,
}

pub struct Repository {
    store: Store,
    catalog: RwLock<Catalog>,
    codec: Box<dyn DeltaCodec>,
    options: StorageOptions,
}

impl Repository {
    pub fn open(store: Store, options: StorageOptions) -> Result<Self, KiraError> {
        Self::open_with_codec(store, options, Box::new(BlockDeltaCodec))
    }

    pub fn open_with_codec(
        store: Store,
        options: StorageOptions,
        codec: Box<dyn DeltaCodec>,
    ) -> Result<Self, KiraError> {
        store.ensure_root()?;
        let catalog = match Store::read_json::<Catalog>(&store.catalog_path())? {
            Some(catalog) => catalog,
            None => {
                let catalog = Catalog::default();
                Store::write_json_atomic(&store.catalog_path(), &catalog)?;
                catalog
            }
        };
        tracing::debug!(root = %store.root(), "opened repository");
        Ok(Self {
            store,
            catalog: RwLock::new(catalog),
            codec,
            options,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn options(&self) -> StorageOptions {
        self.options
    }

    pub fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog.read()
    }

    pub fn edit<T>(
        &self,
        apply: impl FnOnce(&mut Catalog) -> Result<T, KiraError>,
    ) -> Result<T, KiraError> {
        let mut guard = self.catalog.write();
        let mut draft = guard.clone();
        let value = apply(&mut draft)?;
        Store::write_json_atomic(&self.store.catalog_path(), &draft)?;
        *guard = draft;
        Ok(value)
    }

    pub fn begin(
        &self,
        dataset: DatasetId,
        origin: UpdateOrigin,
    ) -> Result<PassTransaction<'_>, KiraError> {
        self.catalog.read().dataset(dataset)?;
        Ok(PassTransaction {
            repository: self,
            dataset,
            origin,
            staged: Vec::new(),
            heads: HashMap::new(),
        })
    }

    pub fn ingest(
        &self,
        dataset: DatasetId,
        name: &str,
        content: &[u8],
        modified_at: Option<DateTime<Utc>>,
        format: FileFormat,
    ) -> Result<IngestOutcome, KiraError> {
        let mut pass = self.begin(dataset, UpdateOrigin::Manual)?;
        let outcome = pass.ingest(name, content, modified_at, format)?;
        UpdateRecorder::new(self).record(pass, Utc::now(), ResourceInfo::default())?;
        Ok(outcome)
    }

    pub fn materialize(&self, file: FileId, number: u32) -> Result<Vec<u8>, KiraError> {
        let (dataset, chain, digest) = {
            let catalog = self.catalog.read();
            let record = catalog.file(file)?;
            let target = record
                .revision(number)
                .ok_or_else(|| KiraError::RevisionNotFound(format!("{file}@{number}")))?;
            let start = record.revisions[..number as usize]
                .iter()
                .rposition(|rev| rev.encoding == RevisionEncoding::Snapshot)
                .ok_or_else(|| {
                    KiraError::CorruptRevision(format!("{file}@{number} has no snapshot"))
                })?;
            let chain = record.revisions[start..number as usize]
                .iter()
                .map(|rev| (rev.number, rev.encoding))
                .collect::<Vec<_>>();
            (record.dataset, chain, target.sha256.clone())
        };

        let mut content = Vec::new();
        for (rev, encoding) in chain {
            let blob = self
                .store
                .read_blob(&self.store.blob_path(dataset, file, rev))?;
            content = match encoding {
                RevisionEncoding::Snapshot => blob,
                RevisionEncoding::Delta => self.codec.decode(&content, &blob).map_err(|err| {
                    KiraError::CorruptRevision(format!("{file}@{rev}: {err}"))
                })?,
            };
        }

        if sha256_hex(&content) != digest {
            return Err(KiraError::CorruptRevision(format!(
                "{file}@{number} does not match its recorded digest"
            )));
        }
        Ok(content)
    }

    fn reserve_file_id(&self) -> FileId {
        FileId(self.catalog.write().allocate_id())
    }

    fn wants_snapshot(&self, number: u32) -> bool {
        number == 1
            || (self.options.snapshot_every > 0 && (number - 1) % self.options.snapshot_every == 0)
    }

    /// Publishes a pass: conflict checks, blob placement and the catalog
    /// rewrite all happen under the catalog write lock.
    pub(crate) fn commit_pass(
        &self,
        pass: PassTransaction<'_>,
        timestamp: DateTime<Utc>,
        resource: ResourceInfo,
    ) -> Result<Option<Update>, KiraError> {
        let PassTransaction {
            dataset,
            origin,
            staged,
            ..
        } = pass;
        if staged.is_empty() {
            return Ok(None);
        }

        let mut guard = self.catalog.write();
        let mut draft = guard.clone();
        let update_id = UpdateId(draft.allocate_id());

        for entry in &staged {
            let existing = draft.file_by_name(dataset, &entry.name).map(|file| file.id);
            match existing {
                Some(id) if id != entry.file => {
                    return Err(KiraError::Conflict(entry.name.clone()));
                }
                Some(_) => {}
                None if entry.number == 1 => draft.insert_file(FileRecord {
                    id: entry.file,
                    dataset,
                    name: entry.name.clone(),
                    default_format: entry.format,
                    tags: BTreeSet::new(),
                    revisions: Vec::new(),
                }),
                None => return Err(KiraError::Conflict(entry.name.clone())),
            }
            let record = draft.file_mut(entry.file)?;
            if record.head_number() + 1 != entry.number {
                return Err(KiraError::Conflict(entry.name.clone()));
            }
            record.revisions.push(Revision {
                number: entry.number,
                size: entry.size,
                stored_size: entry.blob.stored_size,
                encoding: entry.encoding,
                sha256: entry.sha256.clone(),
                modified_at: entry.modified_at,
                created_at: timestamp,
                format: entry.format,
                update: update_id,
                tags: BTreeSet::new(),
            });
        }

        let update = Update {
            id: update_id,
            dataset,
            origin,
            timestamp,
            size: resource.size,
            modified_at: resource.modified_at,
            revisions: staged
                .iter()
                .map(|entry| RevisionRef {
                    file: entry.file,
                    number: entry.number,
                })
                .collect(),
        };
        draft.insert_update(update.clone())?;

        for entry in staged {
            let dest = self.store.blob_path(dataset, entry.file, entry.number);
            self.store.place_blob(entry.blob, &dest)?;
        }
        Store::write_json_atomic(&self.store.catalog_path(), &draft)?;
        *guard = draft;
        Ok(Some(update))
    }
}

struct StagedRevision {
    file: FileId,
    name: String,
    number: u32,
    size: u64,
    encoding: RevisionEncoding,
    sha256: String,
    modified_at: Option<DateTime<Utc>>,
    format: FileFormat,
    blob: StagedBlob,
}

struct StagedHead {
    file: FileId,
    number: u32,
    content: Vec<u8>,
}

pub struct PassTransaction<'a> {
    repository: &'a Repository,
    dataset: DatasetId,
    origin: UpdateOrigin,
    staged: Vec<StagedRevision>,
    heads: HashMap<String, StagedHead>,
}

impl PassTransaction<'_> {
    pub fn dataset(&self) -> DatasetId {
        self.dataset
    }

    pub fn origin(&self) -> UpdateOrigin {
        self.origin
    }

    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }

    pub fn len(&self) -> usize {
        self.staged.len()
    }

    pub fn ingest(
        &mut self,
        name: &str,
        content: &[u8],
        modified_at: Option<DateTime<Utc>>,
        format: FileFormat,
    ) -> Result<IngestOutcome, KiraError> {
        let repository = self.repository;
        let (file, previous) = match self.heads.get(name) {
            Some(head) => (head.file, Some((head.number, head.content.clone()))),
            None => {
                let committed = repository
                    .catalog
                    .read()
                    .file_by_name(self.dataset, name)
                    .map(|file| (file.id, file.head_number()));
                match committed {
                    Some((id, 0)) => (id, None),
                    Some((id, head)) => (id, Some((head, repository.materialize(id, head)?))),
                    None => (repository.reserve_file_id(), None),
                }
            }
        };

        if let Some((_, previous)) = &previous {
            if previous.as_slice() == content {
                return Ok(IngestOutcome::Unchanged);
            }
        }

        let number = previous.as_ref().map(|(head, _)| head + 1).unwrap_or(1);
        let (encoding, payload) = match &previous {
            Some((_, basis)) if !repository.wants_snapshot(number) => {
                match encode_verified(repository.codec.as_ref(), basis, content) {
                    Ok(delta) => (RevisionEncoding::Delta, delta),
                    Err(err) => {
                        tracing::warn!(name, number, error = %err, "delta encoding failed, storing snapshot");
                        (RevisionEncoding::Snapshot, content.to_vec())
                    }
                }
            }
            _ => (RevisionEncoding::Snapshot, content.to_vec()),
        };

        let blob = repository.store.stage_blob(&payload)?;
        tracing::debug!(name, number, %encoding, stored = blob.stored_size, "staged revision");
        self.staged.push(StagedRevision {
            file,
            name: name.to_string(),
            number,
            size: content.len() as u64,
            encoding,
            sha256: sha256_hex(content),
            modified_at,
            format,
            blob,
        });
        self.heads.insert(
            name.to_string(),
            StagedHead {
                file,
                number,
                content: content.to_vec(),
            },
        );

        Ok(IngestOutcome::NewRevision(NewRevision {
            file,
            name: name.to_string(),
            number,
            size: content.len() as u64,
            encoding,
        }))
    }
}

fn encode_verified(
    codec: &dyn DeltaCodec,
    basis: &[u8],
    target: &[u8],
) -> Result<Vec<u8>, KiraError> {
    let encoded = codec.encode(basis, target)?;
    let decoded = codec.decode(basis, &encoded)?;
    if decoded != target {
        return Err(KiraError::Delta("delta does not reproduce its target".to_string()));
    }
    Ok(encoded)
}

pub fn sha256_hex(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}
