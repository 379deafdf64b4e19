use common::{JobId, JobRecord};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(JobId),
    #[error("invalid job id {0:?}")]
    InvalidId(String),
    #[error("job file {path:?} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Key-value view over job records with whole-record atomic writes.
pub trait JobStore: Send + Sync {
    fn list(&self) -> StoreResult<BTreeSet<JobId>>;
    fn load(&self, id: &JobId) -> StoreResult<JobRecord>;
    fn save(&self, job: &JobRecord) -> StoreResult<()>;
    fn delete(&self, id: &JobId) -> StoreResult<()>;
}

/// Every record that can currently be read. Unreadable ones are logged and
/// skipped so a single bad file never stalls a cycle.
pub fn load_all(store: &dyn JobStore) -> StoreResult<Vec<JobRecord>> {
    let ids = store.list()?;
    let mut jobs = Vec::with_capacity(ids.len());
    for id in ids {
        match store.load(&id) {
            Ok(job) => jobs.push(job),
            // Deleted between list and load.
            Err(StoreError::NotFound(_)) => {}
            Err(e) => log::warn!("Skipping unreadable job {}: {}", id, e),
        }
    }
    Ok(jobs)
}

fn check_id(id: &str) -> StoreResult<()> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(StoreError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// One `<id>.json` file per record inside `dir`.
pub struct FsJobStore {
    dir: PathBuf,
}

impl FsJobStore {
    pub fn open(dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| StoreError::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: &JobId) -> StoreResult<PathBuf> {
        check_id(&id.0)?;
        Ok(self.dir.join(format!("{}.json", id.0)))
    }
}

impl JobStore for FsJobStore {
    fn list(&self) -> StoreResult<BTreeSet<JobId>> {
        let io_err = |source: std::io::Error| StoreError::Io {
            path: self.dir.clone(),
            source,
        };
        let mut ids = BTreeSet::new();
        for entry in std::fs::read_dir(&self.dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                // Temp files from in-flight saves start with a dot.
                if check_id(stem).is_ok() {
                    ids.insert(JobId(stem.to_string()));
                }
            }
        }
        Ok(ids)
    }

    fn load(&self, id: &JobId) -> StoreResult<JobRecord> {
        let path = self.path_for(id)?;
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.clone()))
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        serde_json::from_slice(&bytes).map_err(|source| StoreError::Corrupt { path, source })
    }

    fn save(&self, job: &JobRecord) -> StoreResult<()> {
        let path = self.path_for(&job.id)?;
        let io_err = |source: std::io::Error| StoreError::Io {
            path: path.clone(),
            source,
        };
        let body = serde_json::to_vec_pretty(job).map_err(|source| StoreError::Corrupt {
            path: path.clone(),
            source,
        })?;

        // Same directory so the rename never crosses filesystems.
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(".tmp")
            .tempfile_in(&self.dir)
            .map_err(io_err)?;
        tmp.write_all(&body).map_err(io_err)?;
        tmp.as_file().sync_all().map_err(io_err)?;
        tmp.persist(&path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    fn delete(&self, id: &JobId) -> StoreResult<()> {
        let path = self.path_for(id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id.clone())),
            Err(source) => Err(StoreError::Io { path, source }),
        }
    }
}

/// In-process store for tests and embedding.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<BTreeMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jobs(jobs: impl IntoIterator<Item = JobRecord>) -> Self {
        let store = Self::new();
        if let Ok(mut map) = store.jobs.lock() {
            map.extend(jobs.into_iter().map(|j| (j.id.clone(), j)));
        }
        store
    }

    fn map(&self) -> std::sync::MutexGuard<'_, BTreeMap<JobId, JobRecord>> {
        // A panic while holding the lock cannot leave a half-written record.
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl JobStore for MemoryJobStore {
    fn list(&self) -> StoreResult<BTreeSet<JobId>> {
        Ok(self.map().keys().cloned().collect())
    }

    fn load(&self, id: &JobId) -> StoreResult<JobRecord> {
        self.map()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    fn save(&self, job: &JobRecord) -> StoreResult<()> {
        check_id(&job.id.0)?;
        self.map().insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn delete(&self, id: &JobId) -> StoreResult<()> {
        self.map()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}
