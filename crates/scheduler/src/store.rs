//! Storage for exports of completed jobs.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};

use batchq_core::{DomainError, JobName};

use crate::types::JobExport;

/// Export store abstraction.
///
/// Holds one document per completed job, keyed by job name. Saving a name
/// that already exists replaces the document.
pub trait ExportStore: Send + Sync {
    /// Store (or replace) the export of a completed job.
    fn save(&self, export: &JobExport) -> Result<(), StoreError>;

    /// Load an export by job name.
    fn load(&self, name: &str) -> Result<Option<JobExport>, StoreError>;

    /// Names of every stored export, sorted.
    fn names(&self) -> Result<Vec<JobName>, StoreError>;

    fn contains(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.load(name)?.is_some())
    }
}

/// Export store error.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("invalid job name: {0}")]
    InvalidName(#[from] DomainError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("storage error: {0}")]
    Storage(String),
}

/// Directory of JSON documents, one `<name>.json` per job.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// The directory is created on first save if it does not exist.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &JobName) -> PathBuf {
        self.dir.join(format!("{}.json", name.as_str()))
    }
}

impl ExportStore for DirectoryStore {
    fn save(&self, export: &JobExport) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&export.name);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(export)?;

        // Write-then-rename so readers never see a partial document.
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<JobExport>, StoreError> {
        let name = JobName::parse(name)?;
        let body = match fs::read(self.path_for(&name)) {
            Ok(body) => body,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_slice(&body)?))
    }

    fn names(&self) -> Result<Vec<JobName>, StoreError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let stem = path.file_stem().and_then(|s| s.to_str());
            if let Some(name) = stem.and_then(|s| JobName::parse(s).ok()) {
                names.push(name);
            }
        }

        names.sort();
        Ok(names)
    }
}

/// In-memory export store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    exports: RwLock<BTreeMap<JobName, JobExport>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.exports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ExportStore for InMemoryStore {
    fn save(&self, export: &JobExport) -> Result<(), StoreError> {
        let mut exports = self
            .exports
            .write()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        exports.insert(export.name.clone(), export.clone());
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<JobExport>, StoreError> {
        let exports = self
            .exports
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(exports.get(name).cloned())
    }

    fn names(&self) -> Result<Vec<JobName>, StoreError> {
        let exports = self
            .exports
            .read()
            .map_err(|_| StoreError::Storage("lock poisoned".to_string()))?;
        Ok(exports.keys().cloned().collect())
    }
}

impl<S: ExportStore + ?Sized> ExportStore for Arc<S> {
    fn save(&self, export: &JobExport) -> Result<(), StoreError> {
        (**self).save(export)
    }

    fn load(&self, name: &str) -> Result<Option<JobExport>, StoreError> {
        (**self).load(name)
    }

    fn names(&self) -> Result<Vec<JobName>, StoreError> {
        (**self).names()
    }

    fn contains(&self, name: &str) -> Result<bool, StoreError> {
        (**self).contains(name)
    }
}
