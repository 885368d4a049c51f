//! Job processor: drives one job through its stages.
//!
//! Sequences by transcode mode:
//! - `none`: Transcoding(0) -> Moving(85) -> Completed(100)
//! - `local`: Transcoding(0) -> Tagging(85) -> Moving(95) -> Completed(100)
//! - `server`: Transcoding(0..=75) -> Tagging(85) -> Moving(95) -> Completed(100)
//!
//! Any stage error ends in Failed(0) with the record retained. Only the
//! Completed path deletes the record. Every transition is persisted and then
//! broadcast, even when the write fails.

use crate::broadcast::Broadcaster;
use crate::cancel::{ActiveHandle, CancellationRegistry};
use crate::catalog::Catalog;
use crate::encode::{EncodeError, Encoder};
use crate::jobs::{Job, JobPatch, JobUpdate, Stage, TranscodeMode};
use crate::relocate::Relocator;
use crate::store::JobStore;
use crate::tag::Tagger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Upper bound of the encode phase on the overall progress scale.
pub const ENCODE_WINDOW: f64 = 75.0;
/// Progress written with the Tagging stage.
pub const TAGGING_PROGRESS: f64 = 85.0;
/// Progress written with the Moving stage after encoding/tagging.
pub const MOVING_PROGRESS: f64 = 95.0;
/// Progress written with the Moving stage when nothing else ran.
pub const DIRECT_MOVING_PROGRESS: f64 = 85.0;

/// Buffer between the encoder and the progress writer.
const PROGRESS_BUFFER: usize = 8;
/// Smallest progress increase worth a store write during encoding.
const PROGRESS_STEP: f64 = 0.5;

/// Why a run stopped before Completed.
#[derive(Debug)]
enum Abort {
    /// Canceled through `cancel_job`, which already wrote the terminal stage.
    Canceled,
    Failed(String),
}

/// Collaborators of the [`Processor`].
pub struct ProcessorDeps {
    pub store: Arc<dyn JobStore>,
    pub catalog: Arc<dyn Catalog>,
    pub encoder: Arc<dyn Encoder>,
    pub tagger: Arc<dyn Tagger>,
    pub relocator: Arc<Relocator>,
    pub registry: Arc<CancellationRegistry>,
    pub broadcaster: Arc<Broadcaster>,
    /// Where intermediate encodes (`<jobId>.mp4`) are written.
    pub temp_dir: PathBuf,
}

pub struct Processor {
    store: Arc<dyn JobStore>,
    catalog: Arc<dyn Catalog>,
    encoder: Arc<dyn Encoder>,
    tagger: Arc<dyn Tagger>,
    relocator: Arc<Relocator>,
    registry: Arc<CancellationRegistry>,
    broadcaster: Arc<Broadcaster>,
    temp_dir: PathBuf,
}

/// Rough seconds remaining from the time spent reaching `percent`.
pub fn estimate_eta(elapsed_secs: f64, percent: f64) -> Option<u64> {
    if percent <= 0.0 || percent >= 100.0 || !elapsed_secs.is_finite() {
        return None;
    }
    Some((elapsed_secs * (100.0 - percent) / percent).round() as u64)
}

/// Maps raw encoder progress onto the encode window.
pub fn scale_encode_progress(raw: f64) -> f64 {
    raw.clamp(0.0, 100.0) * ENCODE_WINDOW / 100.0
}

impl Processor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self {
            store: deps.store,
            catalog: deps.catalog,
            encoder: deps.encoder,
            tagger: deps.tagger,
            relocator: deps.relocator,
            registry: deps.registry,
            broadcaster: deps.broadcaster,
            temp_dir: deps.temp_dir,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// Intermediate encode output of a job.
    pub fn intermediate_path(&self, job_id: &str) -> PathBuf {
        self.temp_dir.join(format!("{}.mp4", job_id))
    }

    /// Processes one job to a terminal stage.
    ///
    /// A job that no longer exists is abandoned silently.
    pub async fn process(&self, job_id: &str) {
        let job = match self.store.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id, "job vanished before processing");
                return;
            }
            Err(e) => {
                error!(job_id, error = %e, "failed to load job");
                return;
            }
        };
        if job.is_terminal() {
            debug!(job_id, stage = %job.stage, "job already finished, skipping");
            return;
        }

        let Some(guard) = self.registry.try_register(&job.id) else {
            debug!(job_id, "job already running on another worker");
            return;
        };
        let handle = guard.handle();
        info!(job_id, mode = %job.transcode_mode, "processing job");

        let result = match self
            .step(handle, job_id, JobPatch::stage(Stage::Transcoding, 0.0))
            .await
        {
            Ok(()) => self.run(handle, job).await,
            Err(abort) => Err(abort),
        };

        match result {
            Ok(dest) => {
                let done = JobPatch::stage(Stage::Completed, 100.0).with_output_path(&dest);
                if self.transition(handle, job_id, done).await {
                    match self.store.delete(job_id).await {
                        Ok(_) => info!(job_id, dest = %dest.display(), "job completed"),
                        Err(e) => error!(job_id, error = %e, "failed to delete completed job"),
                    }
                } else {
                    info!(job_id, dest = %dest.display(), "file relocated after cancellation");
                }
            }
            Err(Abort::Canceled) => info!(job_id, "job stopped after cancellation"),
            Err(Abort::Failed(message)) => {
                warn!(job_id, error = %message, "job failed");
                let failed = JobPatch::stage(Stage::Failed, 0.0).with_error(message);
                self.transition(handle, job_id, failed).await;
            }
        }
    }

    /// Stages after the initial Transcoding transition. Returns the final
    /// library path.
    async fn run(&self, handle: &ActiveHandle, mut job: Job) -> Result<PathBuf, Abort> {
        match job.transcode_mode {
            TranscodeMode::None => {
                self.step(
                    handle,
                    &job.id,
                    JobPatch::stage(Stage::Moving, DIRECT_MOVING_PROGRESS),
                )
                .await?;
            }
            TranscodeMode::Server => {
                let encoded = self.encode(handle, &job).await?;
                if encoded != job.input_path {
                    self.remove_upload(&job.id, &job.input_path).await;
                    job.input_path = encoded;
                }
                self.step(
                    handle,
                    &job.id,
                    JobPatch::stage(Stage::Tagging, TAGGING_PROGRESS)
                        .with_input_path(&job.input_path),
                )
                .await?;
                self.tag(handle, &job).await?;
                self.step(handle, &job.id, JobPatch::stage(Stage::Moving, MOVING_PROGRESS))
                    .await?;
            }
            TranscodeMode::Local => {
                self.step(
                    handle,
                    &job.id,
                    JobPatch::stage(Stage::Tagging, TAGGING_PROGRESS),
                )
                .await?;
                self.tag(handle, &job).await?;
                self.step(handle, &job.id, JobPatch::stage(Stage::Moving, MOVING_PROGRESS))
                    .await?;
            }
        }

        // The move itself is not interruptible
        self.relocator
            .relocate(&job)
            .await
            .map_err(|e| Abort::Failed(format!("relocation failed: {}", e)))
    }

    /// Runs the encoder, writing scaled progress as it arrives.
    async fn encode(&self, handle: &ActiveHandle, job: &Job) -> Result<PathBuf, Abort> {
        let output = self.intermediate_path(&job.id);
        if job.input_path == output {
            // Encode finished before a restart; the input already is the output
            debug!(job_id = %job.id, "intermediate file already present, skipping encode");
            return Ok(output);
        }

        let (tx, mut rx) = mpsc::channel(PROGRESS_BUFFER);
        let started = Instant::now();
        let mut last = 0.0_f64;

        // The encoder future borrows `output` and is dropped at the end of this block
        let result = {
            let encode = self
                .encoder
                .encode(&job.input_path, &output, tx, handle.token().clone());
            tokio::pin!(encode);

            loop {
                tokio::select! {
                    biased;
                    Some(raw) = rx.recv() => {
                        self.report_encode_progress(handle, &job.id, raw, &mut last, started).await;
                    }
                    result = &mut encode => break result,
                }
            }
        };
        if result.is_ok() {
            while let Ok(raw) = rx.try_recv() {
                self.report_encode_progress(handle, &job.id, raw, &mut last, started).await;
            }
        }

        match result {
            Ok(()) => Ok(output),
            Err(EncodeError::Canceled) => Err(Abort::Canceled),
            Err(_) if handle.is_canceled() => Err(Abort::Canceled),
            Err(e) => Err(Abort::Failed(format!("transcoding failed: {}", e))),
        }
    }

    /// Writes one scaled, non-decreasing encode progress value.
    async fn report_encode_progress(
        &self,
        handle: &ActiveHandle,
        job_id: &str,
        raw: f64,
        last: &mut f64,
        started: Instant,
    ) {
        let scaled = scale_encode_progress(raw).max(*last);
        if scaled <= *last || (scaled - *last < PROGRESS_STEP && scaled < ENCODE_WINDOW) {
            return;
        }
        *last = scaled;
        let eta = estimate_eta(started.elapsed().as_secs_f64(), raw);
        let patch = JobPatch::stage(Stage::Transcoding, scaled).with_eta(eta);
        // A closed gate means a cancel is in progress; the token stops the encoder
        self.transition(handle, job_id, patch).await;
    }

    /// Runs the tagger until it finishes or the job is canceled. Dropping
    /// the tagger future kills its ffmpeg child.
    async fn tag(&self, handle: &ActiveHandle, job: &Job) -> Result<(), Abort> {
        tokio::select! {
            biased;
            _ = handle.token().cancelled() => {
                debug!(job_id = %job.id, "tagging interrupted by cancellation");
                Err(Abort::Canceled)
            }
            _ = self.enrich(job) => Ok(()),
        }
    }

    /// Best-effort enrichment; failures are logged only.
    async fn enrich(&self, job: &Job) {
        let record = match self.catalog.get_media(job.media_type, &job.media_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "skipping tagging, media lookup failed");
                return;
            }
        };
        match self.tagger.tag(&job.input_path, &record).await {
            Ok(()) => debug!(job_id = %job.id, "tagged media file"),
            Err(e) => warn!(job_id = %job.id, error = %e, "tagging failed, continuing"),
        }
    }

    /// Removes the original upload once an encode has replaced it.
    async fn remove_upload(&self, job_id: &str, upload: &Path) {
        if self.relocator.guard().check(upload).is_err() {
            debug!(job_id, path = %upload.display(), "upload outside storage roots, leaving it");
            return;
        }
        if let Err(e) = tokio::fs::remove_file(upload).await {
            debug!(job_id, error = %e, "failed to remove original upload");
        }
    }

    /// A non-terminal transition that ends the run if the job was canceled.
    async fn step(&self, handle: &ActiveHandle, job_id: &str, patch: JobPatch) -> Result<(), Abort> {
        if handle.is_canceled() || !self.transition(handle, job_id, patch).await {
            return Err(Abort::Canceled);
        }
        Ok(())
    }

    /// Writes `patch` while the job's gate is open. Returns false when a
    /// terminal stage was already written.
    async fn transition(&self, handle: &ActiveHandle, job_id: &str, patch: JobPatch) -> bool {
        let mut gate = handle.gate().await;
        if !gate.is_open() {
            return false;
        }
        self.record(job_id, &patch).await;
        if let Some(progress) = patch.progress {
            gate.set_progress(progress);
        }
        if patch.stage.is_some_and(Stage::is_terminal) {
            gate.close();
        }
        true
    }

    /// Persists and broadcasts. A failed write is logged and the event
    /// still goes out.
    async fn record(&self, job_id: &str, patch: &JobPatch) {
        if let Err(e) = self.store.update(job_id, patch).await {
            error!(job_id, stage = ?patch.stage, error = %e, "failed to persist job transition");
        }
        if let Some(update) = JobUpdate::from_patch(job_id, patch) {
            self.broadcaster.publish(&update);
        }
    }

    /// Cancels a running job.
    ///
    /// Returns false, without touching the record, when the job is not
    /// registered as running or already reached a terminal stage.
    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let Some(handle) = self.registry.take(job_id) else {
            return false;
        };
        let mut gate = handle.gate().await;
        if !gate.is_open() {
            return false;
        }
        handle.token().cancel();
        let patch = JobPatch::stage(Stage::Canceled, gate.progress());
        self.record(job_id, &patch).await;
        gate.close();
        info!(job_id, "job canceled");
        true
    }
}
