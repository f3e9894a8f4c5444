use std::collections::HashMap;
use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::{debug, warn};
use tokio::sync::RwLock;
use uuid::Uuid;
use crate::error::{EngineError, EngineResult};
use crate::job::EncodeJob;

/// Shared job storage; implementations synchronise internally
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, id: Uuid) -> EngineResult<Option<EncodeJob>>;
    async fn put(&self, job: &EncodeJob) -> EngineResult<()>;
    /// Returns whether a job was removed
    async fn delete(&self, id: Uuid) -> EngineResult<bool>;
    async fn list(&self) -> EngineResult<Vec<EncodeJob>>;
}

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<Uuid, EncodeJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<EncodeJob>> {
        Ok(self.jobs.read().await.get(&id).cloned())
    }

    async fn put(&self, job: &EncodeJob) -> EngineResult<()> {
        self.jobs.write().await.insert(job.id, job.clone());
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> EngineResult<bool> {
        Ok(self.jobs.write().await.remove(&id).is_some())
    }

    async fn list(&self) -> EngineResult<Vec<EncodeJob>> {
        let mut jobs: Vec<EncodeJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}

/// One JSON file per job under a state directory, so jobs survive restarts
pub struct FileJobStore {
    dir: PathBuf,
    // Serialises writers so a half-written file is never read back
    lock: RwLock<()>,
}

impl FileJobStore {
    pub async fn open(dir: impl Into<PathBuf>) -> EngineResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::resource(format!("failed to create job state dir {}", dir.display()), e))?;
        Ok(Self {
            dir,
            lock: RwLock::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn job_path(&self, id: Uuid) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}

async fn read_job(path: &Path) -> EngineResult<Option<EncodeJob>> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(EngineError::resource(format!("failed to read job file {}", path.display()), e)),
    };
    match serde_json::from_slice(&raw) {
        Ok(job) => Ok(Some(job)),
        Err(e) => {
            warn!("Ignoring unreadable job file {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn get(&self, id: Uuid) -> EngineResult<Option<EncodeJob>> {
        let _guard = self.lock.read().await;
        read_job(&self.job_path(id)).await
    }

    async fn put(&self, job: &EncodeJob) -> EngineResult<()> {
        let _guard = self.lock.write().await;
        let path = self.job_path(job.id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(job).map_err(|e| {
            EngineError::resource(format!("failed to serialize job {}", job.id), std::io::Error::other(e))
        })?;

        // Write then rename so readers see the old or the new file, never half of one
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| EngineError::resource(format!("failed to write job file {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::resource(format!("failed to move job file into {}", path.display()), e))?;
        debug!("Saved job {} ({:?})", job.id, job.status);
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> EngineResult<bool> {
        let _guard = self.lock.write().await;
        let path = self.job_path(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(EngineError::resource(format!("failed to delete job file {}", path.display()), e)),
        }
    }

    async fn list(&self) -> EngineResult<Vec<EncodeJob>> {
        let _guard = self.lock.read().await;
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| EngineError::resource(format!("failed to list {}", self.dir.display()), e))?;

        let mut jobs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| EngineError::resource(format!("failed to list {}", self.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(job) = read_job(&path).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }
}
