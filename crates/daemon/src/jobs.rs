//! Job records for the processing pipeline.
//!
//! A [`Job`] is the persistent document that tracks one uploaded file on its
//! way to becoming a playable library asset. [`JobPatch`] is the field-level
//! update applied on every stage transition, and [`JobUpdate`] is the
//! ephemeral event broadcast to live observers.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Stage of a job in the processing pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Job record exists and waits for a worker.
    Queued,
    /// Job is being encoded (or about to be).
    Transcoding,
    /// Metadata and artwork are being embedded.
    Tagging,
    /// The file is being filed into the library.
    Moving,
    /// Job finished successfully.
    Completed,
    /// Job failed; see `error_message`.
    Failed,
    /// Job was canceled while running.
    Canceled,
}

impl Default for Stage {
    fn default() -> Self {
        Self::Queued
    }
}

impl Stage {
    /// Stages that a crash may leave behind and that recovery re-enqueues.
    pub const UNFINISHED: [Stage; 4] = [
        Stage::Queued,
        Stage::Transcoding,
        Stage::Tagging,
        Stage::Moving,
    ];

    /// Completed, Failed and Canceled are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Failed | Stage::Canceled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Transcoding => "transcoding",
            Stage::Tagging => "tagging",
            Stage::Moving => "moving",
            Stage::Completed => "completed",
            Stage::Failed => "failed",
            Stage::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of catalog entity a job produces an asset for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaType {
    Movie,
    Episode,
}

impl std::fmt::Display for MediaType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MediaType::Movie => write!(f, "movie"),
            MediaType::Episode => write!(f, "episode"),
        }
    }
}

/// Selects which stage sequence a job runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranscodeMode {
    /// File is already playable; relocate only.
    None,
    /// Encoding happened on the uploading client.
    Local,
    /// Encode on this server.
    Server,
}

impl Default for TranscodeMode {
    fn default() -> Self {
        Self::Server
    }
}

impl std::fmt::Display for TranscodeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscodeMode::None => write!(f, "none"),
            TranscodeMode::Local => write!(f, "local"),
            TranscodeMode::Server => write!(f, "server"),
        }
    }
}

/// Flags that pick the library category a finished file is filed under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeOptions {
    pub documentary: bool,
    pub kids: bool,
}

/// Persistent job record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Unique job identifier (UUID).
    pub id: String,
    pub media_type: MediaType,
    /// Catalog id of the movie or episode.
    pub media_id: String,
    pub stage: Stage,
    /// 0-100.
    pub progress: f64,
    /// Estimated seconds remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Current source file; replaced by the encoder output after encoding.
    pub input_path: PathBuf,
    /// Final library location once relocated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(default)]
    pub transcode_mode: TranscodeMode,
    #[serde(default)]
    pub transcode_options: TranscodeOptions,
    /// Unix timestamp (milliseconds) when job was created.
    pub created_at: i64,
    /// Unix timestamp (milliseconds) when job was last updated.
    pub updated_at: i64,
    /// Unix timestamp (milliseconds) when a terminal stage was written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
}

impl Job {
    /// Update the job's updated_at timestamp to now.
    pub fn touch(&mut self) {
        self.updated_at = current_timestamp_ms();
    }

    pub fn is_terminal(&self) -> bool {
        self.stage.is_terminal()
    }

    /// Apply a field-level update, refreshing `updated_at` and stamping
    /// `completed_at` when the new stage is terminal.
    pub fn apply(&mut self, patch: &JobPatch) {
        if let Some(stage) = patch.stage {
            self.stage = stage;
            if stage.is_terminal() {
                self.completed_at = Some(current_timestamp_ms());
            }
        }
        if let Some(progress) = patch.progress {
            self.progress = progress;
        }
        if let Some(eta) = patch.eta {
            self.eta = eta;
        }
        if let Some(message) = &patch.error_message {
            self.error_message = Some(message.clone());
        }
        if let Some(path) = &patch.input_path {
            self.input_path = path.clone();
        }
        if let Some(path) = &patch.output_path {
            self.output_path = Some(path.clone());
        }
        self.touch();
    }
}

/// Field-level update of a [`Job`]. `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub stage: Option<Stage>,
    pub progress: Option<f64>,
    /// `Some(None)` clears the ETA.
    pub eta: Option<Option<u64>>,
    pub error_message: Option<String>,
    pub input_path: Option<PathBuf>,
    pub output_path: Option<PathBuf>,
}

impl JobPatch {
    /// A stage transition. The ETA is cleared unless set afterwards.
    pub fn stage(stage: Stage, progress: f64) -> Self {
        Self {
            stage: Some(stage),
            progress: Some(progress),
            eta: Some(None),
            ..Self::default()
        }
    }

    pub fn with_eta(mut self, eta: Option<u64>) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    pub fn with_input_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.input_path = Some(path.into());
        self
    }

    pub fn with_output_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_path = Some(path.into());
        self
    }
}

/// Progress event multicast to live subscribers. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobUpdate {
    pub job_id: String,
    pub stage: Stage,
    pub progress: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobUpdate {
    /// The event matching a transition patch. Patches without a stage are
    /// not transitions and produce no event.
    pub fn from_patch(job_id: &str, patch: &JobPatch) -> Option<Self> {
        let stage = patch.stage?;
        Some(Self {
            job_id: job_id.to_string(),
            stage,
            progress: patch.progress.unwrap_or_default(),
            eta: patch.eta.flatten(),
            error: patch.error_message.clone(),
        })
    }
}

/// Rejections of a job creation request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("media id is required")]
    MissingMediaId,

    #[error("input path is required")]
    MissingInputPath,

    #[error("input path must not contain '..': {0}")]
    TraversalInInputPath(String),
}

/// Request to create a job. Validated before any record is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewJob {
    pub media_type: MediaType,
    pub media_id: String,
    pub input_path: PathBuf,
    #[serde(default)]
    pub transcode_mode: TranscodeMode,
    #[serde(default)]
    pub transcode_options: TranscodeOptions,
}

impl NewJob {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.media_id.trim().is_empty() {
            return Err(ValidationError::MissingMediaId);
        }
        if self.input_path.as_os_str().is_empty() {
            return Err(ValidationError::MissingInputPath);
        }
        if has_parent_segment(&self.input_path) {
            return Err(ValidationError::TraversalInInputPath(
                self.input_path.display().to_string(),
            ));
        }
        Ok(())
    }
}

/// True when any component of `path` is `..`.
pub(crate) fn has_parent_segment(path: &Path) -> bool {
    path.components().any(|c| matches!(c, Component::ParentDir))
}

/// Get current timestamp in milliseconds since Unix epoch.
pub(crate) fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Creates a new Queued job from a validated request.
///
/// Generates a UUID for the job id and stamps creation time.
pub fn create_job(request: NewJob) -> Result<Job, ValidationError> {
    request.validate()?;
    let now = current_timestamp_ms();

    Ok(Job {
        id: Uuid::new_v4().to_string(),
        media_type: request.media_type,
        media_id: request.media_id,
        stage: Stage::Queued,
        progress: 0.0,
        eta: None,
        error_message: None,
        input_path: request.input_path,
        output_path: None,
        transcode_mode: request.transcode_mode,
        transcode_options: request.transcode_options,
        created_at: now,
        updated_at: now,
        completed_at: None,
    })
}
