//! Nitflex pipeline daemon
//!
//! Background service that turns uploaded video files into tagged, playable
//! library assets: a bounded job queue with a worker pool, the per-job stage
//! machine, ffmpeg encoding and tagging, relocation into the library tree,
//! cancellation, and live progress fan-out.

pub mod broadcast;
pub mod cancel;
pub mod catalog;
pub mod concurrency;
pub mod daemon;
pub mod encode;
pub mod jobs;
pub mod processor;
pub mod queue;
pub mod relocate;
pub mod server;
pub mod startup;
pub mod store;
pub mod tag;

pub use nitflex_config as config;
pub use nitflex_config::Config;
pub use broadcast::{Broadcaster, SubscriberId, Subscription};
pub use cancel::{ActiveHandle, CancellationRegistry};
pub use catalog::{Catalog, CatalogError, Episode, MediaRecord, MemoryCatalog, Movie, Series};
pub use concurrency::{derive_plan, QueuePlan};
pub use daemon::{Daemon, DaemonError};
pub use encode::{EncodeError, Encoder, EncoderSettings, FfmpegEncoder, ProgressParser};
pub use jobs::{
    create_job, Job, JobPatch, JobUpdate, MediaType, NewJob, Stage, TranscodeMode,
    TranscodeOptions, ValidationError,
};
pub use processor::{Processor, ProcessorDeps};
pub use queue::{Dispatcher, QueueError};
pub use relocate::{LibraryRoots, PathGuard, RelocateError, Relocator};
pub use server::{create_router, run_server, ServerError};
pub use startup::{parse_ffmpeg_version, run_startup_checks, FfmpegVersion, StartupError};
pub use store::{FsJobStore, JobStore, MemoryJobStore, StoreError};
pub use tag::{FfmpegTagger, TagError, Tagger};
