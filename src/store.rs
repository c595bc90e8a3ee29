use std::fs;
use std::io::{Read, Write};

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::{Builder, TempPath};

use crate::domain::{DatasetId, FileId};
use crate::error::KiraError;

#[derive(Debug)]
pub struct StagedBlob {
    path: TempPath,
    pub stored_size: u64,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: Utf8PathBuf,
}

impl Store {
    pub fn new() -> Result<Self, KiraError> {
        let cwd = std::env::current_dir().map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let root = Utf8PathBuf::from_path_buf(cwd.join(".kira-br"))
            .map_err(|_| KiraError::Filesystem("invalid project path".to_string()))?;
        Ok(Self { root })
    }

    pub fn global() -> Result<Self, KiraError> {
        let root = BaseDirs::new()
            .and_then(|dirs| {
                Utf8PathBuf::from_path_buf(dirs.data_dir().join("kira-biodata-repository")).ok()
            })
            .ok_or_else(|| KiraError::Filesystem("unable to resolve data directory".to_string()))?;
        Ok(Self { root })
    }

    pub fn new_with_root(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn catalog_path(&self) -> Utf8PathBuf {
        self.root.join("catalog.json")
    }

    pub fn blob_path(&self, dataset: DatasetId, file: FileId, number: u32) -> Utf8PathBuf {
        self.root
            .join("blobs")
            .join(format!("{:06x}", dataset.get()))
            .join(format!("{:06x}", file.get()))
            .join(format!("{number:06x}.rev"))
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, path: &Utf8Path) -> bool {
        path.as_std_path().exists()
    }

    pub fn staging_dir(&self) -> Utf8PathBuf {
        self.root.join("staging")
    }

    /// Compresses a blob into the staging area. The returned path deletes
    /// the file when dropped unless it is placed with [`Store::place_blob`].
    pub fn stage_blob(&self, content: &[u8]) -> Result<StagedBlob, KiraError> {
        let staging = self.staging_dir();
        fs::create_dir_all(staging.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let compressed = encoder
            .finish()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("stage")
            .suffix(".rev")
            .tempfile_in(staging.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.write_all(&compressed)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(StagedBlob {
            path: temp.into_temp_path(),
            stored_size: compressed.len() as u64,
        })
    }

    pub fn place_blob(&self, staged: StagedBlob, dest: &Utf8Path) -> Result<(), KiraError> {
        let parent = dest
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid blob path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        staged
            .path
            .persist(dest.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("place {dest}: {err}")))
    }

    pub fn read_blob(&self, path: &Utf8Path) -> Result<Vec<u8>, KiraError> {
        let compressed = fs::read(path.as_std_path())
            .map_err(|err| KiraError::CorruptRevision(format!("read {path}: {err}")))?;
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut content = Vec::new();
        decoder
            .read_to_end(&mut content)
            .map_err(|err| KiraError::CorruptRevision(format!("decompress {path}: {err}")))?;
        Ok(content)
    }

    pub fn read_json<T: DeserializeOwned>(path: &Utf8Path) -> Result<Option<T>, KiraError> {
        if !path.as_std_path().exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("read {path}: {err}")))?;
        let value = serde_json::from_str(&content)
            .map_err(|err| KiraError::Catalog(format!("parse {path}: {err}")))?;
        Ok(Some(value))
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), KiraError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| KiraError::Catalog(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), KiraError> {
        let parent = path
            .parent()
            .ok_or_else(|| KiraError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        let mut temp = Builder::new()
            .prefix("kira-br-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist(path.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(())
    }
}
