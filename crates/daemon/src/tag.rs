//! Tagger: embeds descriptive metadata and poster artwork into finished
//! files.
//!
//! Tagging is best-effort. The processor logs a [`TagError`] and moves on;
//! a failure here never fails a job.

use crate::catalog::MediaRecord;
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TagError {
    #[error("failed to start ffmpeg for tagging: {0}")]
    Spawn(std::io::Error),

    #[error("tagging ffmpeg exited with {0}")]
    Failed(std::process::ExitStatus),

    #[error("poster download failed: {0}")]
    Download(#[from] reqwest::Error),

    #[error("tagging IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Post-encode enrichment of a playable file.
#[async_trait]
pub trait Tagger: Send + Sync {
    async fn tag(&self, video: &Path, record: &MediaRecord) -> Result<(), TagError>;
}

/// Container metadata for a media record, as `key=value` pairs.
pub fn metadata_for(record: &MediaRecord) -> Vec<(&'static str, String)> {
    let mut tags = vec![("title", record.display_title().to_string())];

    match record {
        MediaRecord::Movie(movie) => {
            if let Some(year) = movie.year {
                tags.push(("date", year.to_string()));
            }
            if let Some(overview) = movie.overview.as_deref().filter(|o| !o.is_empty()) {
                tags.push(("comment", overview.to_string()));
                tags.push(("description", overview.to_string()));
            }
        }
        MediaRecord::Episode { episode, series } => {
            tags.push(("show", series.title.clone()));
            tags.push(("season_number", episode.season_number.to_string()));
            tags.push(("episode_sort", episode.episode_number.to_string()));
            tags.push((
                "episode_id",
                format!("S{:02}E{:02}", episode.season_number, episode.episode_number),
            ));
            if let Some(overview) = episode.overview.as_deref().filter(|o| !o.is_empty()) {
                tags.push(("comment", overview.to_string()));
                tags.push(("description", overview.to_string()));
            }
        }
    }
    tags
}

/// Build the stream-copy tagging invocation.
///
/// With a poster, the image is mapped as a second video stream and marked
/// as attached picture.
pub fn build_tag_args(
    video: &Path,
    poster: Option<&Path>,
    metadata: &[(&'static str, String)],
    output: &Path,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["-y".into(), "-i".into(), video.into()];

    match poster {
        Some(poster) => {
            args.push("-i".into());
            args.push(poster.into());
            for arg in ["-map", "0", "-map", "1", "-c", "copy", "-disposition:v:1", "attached_pic"] {
                args.push(arg.into());
            }
        }
        None => {
            for arg in ["-map", "0", "-c", "copy"] {
                args.push(arg.into());
            }
        }
    }

    for (key, value) in metadata {
        args.push("-metadata".into());
        args.push(format!("{}={}", key, value).into());
    }

    for arg in ["-movflags", "+faststart", "-f", "mp4"] {
        args.push(arg.into());
    }
    args.push(output.into());
    args
}

/// Poster downloads give up after this long.
pub const POSTER_TIMEOUT: Duration = Duration::from_secs(30);

/// Tagging rewrites the file as mp4, so only mp4-family uploads qualify.
fn is_mp4_container(video: &Path) -> bool {
    video
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .is_some_and(|e| e == "mp4" || e == "m4v")
}

fn is_remote(poster: &str) -> bool {
    poster.starts_with("http://") || poster.starts_with("https://")
}

/// `<video>.tagged.mp4`
fn tagged_path(video: &Path) -> PathBuf {
    let mut name = video.as_os_str().to_owned();
    name.push(".tagged.mp4");
    PathBuf::from(name)
}

/// Production [`Tagger`] running ffmpeg in stream-copy mode.
pub struct FfmpegTagger {
    ffmpeg_path: String,
    temp_dir: PathBuf,
    http: reqwest::Client,
}

impl FfmpegTagger {
    pub fn new(ffmpeg_path: impl Into<String>, temp_dir: impl Into<PathBuf>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(POSTER_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to configure poster client, using defaults");
                reqwest::Client::new()
            });
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            temp_dir: temp_dir.into(),
            http,
        }
    }

    async fn download_poster(&self, url: &str, video: &Path) -> Result<PathBuf, TagError> {
        let stem = video
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "poster".to_string());
        let path = self.temp_dir.join(format!("{}_poster.jpg", stem));

        let bytes = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        tokio::fs::create_dir_all(&self.temp_dir).await?;
        tokio::fs::write(&path, &bytes).await?;
        debug!(url, path = %path.display(), "downloaded poster");
        Ok(path)
    }

    /// Returns the poster file to embed and whether it is a temporary download.
    async fn resolve_poster(&self, record: &MediaRecord, video: &Path) -> Option<(PathBuf, bool)> {
        let poster = record.poster().filter(|p| !p.trim().is_empty())?;
        if is_remote(poster) {
            match self.download_poster(poster, video).await {
                Ok(path) => Some((path, true)),
                Err(e) => {
                    warn!(error = %e, url = poster, "poster unavailable, tagging without artwork");
                    None
                }
            }
        } else {
            let path = PathBuf::from(poster);
            path.is_file().then_some((path, false))
        }
    }

    async fn run_ffmpeg(&self, args: &[OsString]) -> Result<(), TagError> {
        let status = Command::new(&self.ffmpeg_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(TagError::Spawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(TagError::Failed(status))
        }
    }
}

#[async_trait]
impl Tagger for FfmpegTagger {
    async fn tag(&self, video: &Path, record: &MediaRecord) -> Result<(), TagError> {
        if !is_mp4_container(video) {
            debug!(path = %video.display(), "not an mp4 container, leaving file untagged");
            return Ok(());
        }

        let poster = self.resolve_poster(record, video).await;
        let output = tagged_path(video);
        let args = build_tag_args(
            video,
            poster.as_ref().map(|(p, _)| p.as_path()),
            &metadata_for(record),
            &output,
        );

        let result = self.run_ffmpeg(&args).await;

        if let Some((path, true)) = &poster {
            let _ = tokio::fs::remove_file(path).await;
        }

        match result {
            Ok(()) => {
                tokio::fs::rename(&output, video).await?;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&output).await;
                Err(e)
            }
        }
    }
}
