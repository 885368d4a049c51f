//! Persistent job store.
//!
//! Jobs are persisted as one JSON document per job in a state directory.
//! Every write goes through a temp file and a rename so a crash never
//! leaves a half-written record behind; the store is the single source of
//! truth for crash recovery.

use crate::jobs::{Job, JobPatch, Stage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// Error type for job store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    NotFound(String),

    #[error("invalid job id {0:?}")]
    InvalidId(String),

    #[error("job store IO error: {0}")]
    Io(#[from] io::Error),

    #[error("job record could not be (de)serialized: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Create/read/update/delete access to job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert(&self, job: &Job) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError>;

    /// Apply `patch` to an existing record. Fails with `NotFound` when the
    /// record is gone.
    async fn update(&self, id: &str, patch: &JobPatch) -> Result<(), StoreError>;

    /// Returns whether a record was removed.
    async fn delete(&self, id: &str) -> Result<bool, StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Records whose stage is Queued, Transcoding, Tagging or Moving,
    /// oldest first so recovery preserves arrival order.
    async fn list_unfinished(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self
            .list()
            .await?
            .into_iter()
            .filter(|job| Stage::UNFINISHED.contains(&job.stage))
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }
}

fn is_record_id(id: &str) -> bool {
    let mut components = Path::new(id).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !id.starts_with('.')
        && !id.contains(['/', '\\'])
}

fn sort_newest_first(jobs: &mut [Job]) {
    jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

/// Job store keeping `{id}.json` files in a directory.
pub struct FsJobStore {
    state_dir: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: tokio::sync::Mutex<()>,
}

impl FsJobStore {
    /// Opens (and creates, if needed) the state directory.
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let state_dir = state_dir.into();
        std::fs::create_dir_all(&state_dir)?;
        Ok(Self {
            state_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    /// `None` for ids that would not name a record file directly inside
    /// the state directory.
    fn job_path(&self, id: &str) -> Option<PathBuf> {
        is_record_id(id).then(|| self.state_dir.join(format!("{}.json", id)))
    }

    async fn read_job(path: &Path) -> Result<Option<Job>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_job(&self, job: &Job) -> Result<(), StoreError> {
        let path = self
            .job_path(&job.id)
            .ok_or_else(|| StoreError::InvalidId(job.id.clone()))?;
        let tmp = self.state_dir.join(format!(".{}.json.tmp", job.id));
        let json = serde_json::to_vec_pretty(job)?;
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for FsJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        self.write_job(job).await
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        match self.job_path(id) {
            Some(path) => Self::read_job(&path).await,
            None => Ok(None),
        }
    }

    async fn update(&self, id: &str, patch: &JobPatch) -> Result<(), StoreError> {
        let path = self
            .job_path(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let _guard = self.write_lock.lock().await;
        let mut job = Self::read_job(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        job.apply(patch);
        self.write_job(&job).await
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let Some(path) = self.job_path(id) else {
            return Ok(false);
        };
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();

            // Only process .json files; temp files start with a dot
            let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
            let is_hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(true, |n| n.starts_with('.'));
            if !is_json || is_hidden {
                continue;
            }

            match Self::read_job(&path).await {
                Ok(Some(job)) => jobs.push(job),
                Ok(None) => {}
                Err(e) => {
                    // Log warning but continue loading other jobs
                    warn!(path = %path.display(), error = %e, "skipping unreadable job record");
                }
            }
        }

        sort_newest_first(&mut jobs);
        Ok(jobs)
    }
}

/// In-process job store.
#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.lock().is_empty()
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: &Job) -> Result<(), StoreError> {
        self.jobs.lock().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.lock().get(id).cloned())
    }

    async fn update(&self, id: &str, patch: &JobPatch) -> Result<(), StoreError> {
        let mut jobs = self.jobs.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        job.apply(patch);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.jobs.lock().remove(id).is_some())
    }

    async fn list(&self) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<Job> = self.jobs.lock().values().cloned().collect();
        sort_newest_first(&mut jobs);
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::tests::make_job;
    use crate::jobs::TranscodeMode;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_store_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsJobStore::open(temp_dir.path().join("nested/state")).unwrap();
        let job = make_job(TranscodeMode::Server);

        store.insert(&job).await.unwrap();

        let job_file = store.state_dir().join(format!("{}.json", job.id));
        assert!(job_file.exists());

        let loaded = store.get(&job.id).await.unwrap().expect("job exists");
        assert_eq!(loaded, job);
    }

    #[tokio::test]
    async fn test_fs_store_update_and_delete() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsJobStore::open(temp_dir.path()).unwrap();
        let job = make_job(TranscodeMode::None);
        store.insert(&job).await.unwrap();

        store
            .update(&job.id, &JobPatch::stage(Stage::Moving, 85.0))
            .await
            .unwrap();
        let loaded = store.get(&job.id).await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Moving);
        assert_eq!(loaded.progress, 85.0);

        assert!(store.delete(&job.id).await.unwrap());
        assert!(!store.delete(&job.id).await.unwrap());
        assert!(store.get(&job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsJobStore::open(temp_dir.path()).unwrap();
        let result = store
            .update("missing", &JobPatch::stage(Stage::Failed, 0.0))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));

        let memory = MemoryJobStore::new();
        let result = memory
            .update("missing", &JobPatch::stage(Stage::Failed, 0.0))
            .await;
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_fs_store_ignores_ids_outside_state_dir() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsJobStore::open(temp_dir.path().join("state")).unwrap();

        let outside = make_job(TranscodeMode::None);
        let outside_file = temp_dir.path().join("outside.json");
        std::fs::write(&outside_file, serde_json::to_vec(&outside).unwrap()).unwrap();

        for id in ["../outside", "..", "", ".hidden", "a/b", "/etc/passwd"] {
            assert!(store.get(id).await.unwrap().is_none(), "get {:?}", id);
            assert!(!store.delete(id).await.unwrap(), "delete {:?}", id);
            let result = store.update(id, &JobPatch::stage(Stage::Failed, 0.0)).await;
            assert!(matches!(result, Err(StoreError::NotFound(_))), "update {:?}", id);
        }
        assert!(outside_file.exists());

        let mut escaping = make_job(TranscodeMode::None);
        escaping.id = "../escaped".to_string();
        assert!(matches!(
            store.insert(&escaping).await,
            Err(StoreError::InvalidId(_))
        ));
        assert!(!temp_dir.path().join("escaped.json").exists());
    }

    #[tokio::test]
    async fn test_fs_store_list_skips_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let store = FsJobStore::open(temp_dir.path()).unwrap();
        let job = make_job(TranscodeMode::Local);
        store.insert(&job).await.unwrap();

        std::fs::write(temp_dir.path().join("broken.json"), b"{ not json").unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"hello").unwrap();

        let jobs = store.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job.id);
    }

    #[tokio::test]
    async fn test_list_unfinished_filters_terminal_stages() {
        let store = MemoryJobStore::new();
        for stage in [
            Stage::Queued,
            Stage::Transcoding,
            Stage::Tagging,
            Stage::Moving,
            Stage::Failed,
            Stage::Canceled,
            Stage::Completed,
        ] {
            let mut job = make_job(TranscodeMode::Server);
            job.stage = stage;
            store.insert(&job).await.unwrap();
        }

        let unfinished = store.list_unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 4);
        assert!(unfinished
            .iter()
            .all(|job| Stage::UNFINISHED.contains(&job.stage)));
        assert_eq!(store.len(), 7);
    }
}
