//! ffmpeg encoder driver
//!
//! Builds the ffmpeg invocation for playback-compatible H.264/AAC MP4 output
//! and supervises the subprocess: stderr is streamed through the
//! [`ProgressParser`], and the process is killed when the job is canceled or
//! the optional hard timeout elapses.

use super::progress::{split_lines, ProgressParser};
use super::{EncodeError, Encoder};
use async_trait::async_trait;
use nitflex_config::EncoderConfig;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Diagnostic lines kept for failure reports
const STDERR_TAIL_LINES: usize = 8;

/// Platform hardware encoders
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwAccel {
    /// macOS VideoToolbox
    VideoToolbox,
    /// NVIDIA NVENC with CUDA decode
    Nvenc,
    /// Linux VA-API on the first render node
    Vaapi,
}

impl HwAccel {
    /// Hardware encoder for the host platform, if one is known.
    pub fn for_host() -> Option<Self> {
        if cfg!(target_os = "macos") {
            Some(Self::VideoToolbox)
        } else if cfg!(target_os = "windows") {
            Some(Self::Nvenc)
        } else if cfg!(target_os = "linux") {
            Some(Self::Vaapi)
        } else {
            None
        }
    }

    /// Flags placed before `-i`.
    pub fn input_args(self) -> &'static [&'static str] {
        match self {
            HwAccel::VideoToolbox => &[],
            HwAccel::Nvenc => &["-hwaccel", "cuda", "-hwaccel_output_format", "cuda"],
            HwAccel::Vaapi => &["-hwaccel", "vaapi", "-hwaccel_device", "/dev/dri/renderD128"],
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            HwAccel::VideoToolbox => "h264_videotoolbox",
            HwAccel::Nvenc => "h264_nvenc",
            HwAccel::Vaapi => "h264_vaapi",
        }
    }
}

/// Fixed encode policy derived from the `[encoder]` config section
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    pub ffmpeg_path: String,
    pub hwaccel: Option<HwAccel>,
    pub crf: u8,
    pub preset: String,
    pub audio_bitrate: String,
    pub timeout: Option<Duration>,
}

impl EncoderSettings {
    pub fn from_config(config: &EncoderConfig) -> Self {
        Self {
            ffmpeg_path: config.ffmpeg_path.clone(),
            hwaccel: if config.hardware_acceleration {
                HwAccel::for_host()
            } else {
                None
            },
            crf: config.crf,
            preset: config.preset.clone(),
            audio_bitrate: config.audio_bitrate.clone(),
            timeout: config.timeout_secs.map(Duration::from_secs),
        }
    }
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self::from_config(&EncoderConfig::default())
    }
}

/// Build the ffmpeg argument list
///
/// Creates arguments for:
/// - Overwriting the output and optional hardware decode flags
/// - H.264 High@4.1 video (libx264 with CRF/preset, or the hardware codec)
/// - Stereo AAC audio
/// - Fast-start MP4 container
/// - Machine-readable progress on stderr
///
/// # Arguments
/// * `settings` - Encode policy
/// * `input` - Source file
/// * `output` - Destination file
///
/// # Returns
/// The arguments, without the program name
pub fn build_ffmpeg_args(settings: &EncoderSettings, input: &Path, output: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into()];

    if let Some(hw) = settings.hwaccel {
        args.extend(hw.input_args().iter().map(OsString::from));
    }
    args.push("-i".into());
    args.push(input.into());

    match settings.hwaccel {
        Some(hw) => {
            args.push("-c:v".into());
            args.push(hw.video_codec().into());
        }
        None => {
            args.push("-c:v".into());
            args.push("libx264".into());
            args.push("-crf".into());
            args.push(settings.crf.to_string().into());
            args.push("-preset".into());
            args.push(settings.preset.as_str().into());
        }
    }

    for arg in ["-profile:v", "high", "-level:v", "4.1", "-c:a", "aac", "-b:a"] {
        args.push(arg.into());
    }
    args.push(settings.audio_bitrate.as_str().into());
    for arg in [
        "-ac",
        "2",
        "-movflags",
        "+faststart",
        "-f",
        "mp4",
        "-progress",
        "pipe:2",
    ] {
        args.push(arg.into());
    }
    args.push(output.into());
    args
}

/// Production [`Encoder`] backed by an ffmpeg subprocess
#[derive(Debug, Clone, Default)]
pub struct FfmpegEncoder {
    settings: EncoderSettings,
}

impl FfmpegEncoder {
    pub fn new(settings: EncoderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Canceled,
    TimedOut(Duration),
}

/// Streams stderr through the parser and returns the last non-progress lines.
async fn pump_stderr(mut stderr: ChildStderr, progress: mpsc::Sender<f64>) -> VecDeque<String> {
    let mut parser = ProgressParser::new();
    let mut pending = Vec::new();
    let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut buf = vec![0u8; 8192];

    loop {
        let n = match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for line in split_lines(&mut pending, &buf[..n]) {
            if let Some(pct) = parser.feed(&line) {
                // Dropped when the consumer lags; the next value supersedes it
                let _ = progress.try_send(pct);
            } else if !line.contains('=') {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }
    }
    tail
}

#[async_trait]
impl Encoder for FfmpegEncoder {
    async fn encode(
        &self,
        input: &Path,
        output: &Path,
        progress: mpsc::Sender<f64>,
        cancel: CancellationToken,
    ) -> Result<(), EncodeError> {
        let args = build_ffmpeg_args(&self.settings, input, output);
        debug!(program = %self.settings.ffmpeg_path, ?args, "starting encoder");

        let mut child = Command::new(&self.settings.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(EncodeError::Spawn)?;

        let reader = child
            .stderr
            .take()
            .map(|stderr| tokio::spawn(pump_stderr(stderr, progress)));

        let timeout = self.settings.timeout;
        let deadline = async {
            match timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status?),
            _ = cancel.cancelled() => Outcome::Canceled,
            _ = deadline => Outcome::TimedOut(timeout.unwrap_or_default()),
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            // kill() also reaps the process
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill encoder process");
            }
        }

        let tail = match reader {
            Some(handle) => handle.await.unwrap_or_default(),
            None => VecDeque::new(),
        };

        match outcome {
            Outcome::Exited(status) if status.success() => {
                info!(output = %output.display(), "encode finished");
                Ok(())
            }
            // A process that dies while the token fires was killed on our behalf
            Outcome::Exited(_) if cancel.is_cancelled() => Err(EncodeError::Canceled),
            Outcome::Exited(status) => {
                let stderr_tail = tail.into_iter().collect::<Vec<_>>().join(" | ");
                warn!(status = %status, stderr = %stderr_tail, "encoder exited unsuccessfully");
                match status.code() {
                    Some(code) => Err(EncodeError::Failed { code }),
                    None => Err(EncodeError::Terminated),
                }
            }
            Outcome::Canceled => Err(EncodeError::Canceled),
            Outcome::TimedOut(limit) => Err(EncodeError::TimedOut(limit)),
        }
    }
}
