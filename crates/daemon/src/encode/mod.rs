//! Encoding modules for the Nitflex pipeline

pub mod ffmpeg;
pub mod progress;

pub use ffmpeg::{build_ffmpeg_args, EncoderSettings, FfmpegEncoder, HwAccel};
pub use progress::{parse_timestamp, split_lines, ProgressParser};

use async_trait::async_trait;
use std::path::Path;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Error type for encoding operations
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Encoder binary could not be started
    #[error("failed to start encoder: {0}")]
    Spawn(std::io::Error),

    /// Encoder exited with non-zero status
    #[error("encoder failed with exit code: {code}")]
    Failed { code: i32 },

    /// Encoder was terminated by a signal
    #[error("encoder process was terminated by signal")]
    Terminated,

    /// The job's cancellation token fired; the process was killed
    #[error("encode canceled")]
    Canceled,

    /// The configured hard limit elapsed; the process was killed
    #[error("encode timed out after {0:?}")]
    TimedOut(std::time::Duration),

    /// IO error while supervising the process
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts one input file into a playback-compatible output file.
///
/// Implementations report raw progress (0-100) on `progress` without
/// blocking: when the receiver is not keeping up, values are dropped. When
/// `cancel` fires the encode must stop its work and return
/// [`EncodeError::Canceled`].
#[async_trait]
pub trait Encoder: Send + Sync {
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: mpsc::Sender<f64>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError>;
}
