//! Startup checks for the media pipeline daemon
//!
//! Provides preflight checks to verify system requirements before starting the daemon:
//! - FFmpeg availability (`ffmpeg -version`), version logged
//! - Storage roots exist, are directories and are writable

use crate::config::Config;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;
use tracing::{info, warn};

/// File written and removed to prove a storage root is writable
const WRITE_PROBE: &str = ".nitflex-write-probe";

/// Error types for startup checks
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("FFmpeg not available: {0}")]
    FfmpegUnavailable(String),

    #[error("Storage root {path} is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("Storage root {path} is not usable: {source}")]
    Storage {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// FFmpeg version as reported by `ffmpeg -version`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FfmpegVersion {
    /// Version token as printed, e.g. `6.1.1` or `n8.0-12-gabcdef0`
    pub raw: String,
    /// Major version, when the token starts with one
    pub major: Option<u32>,
}

impl fmt::Display for FfmpegVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse FFmpeg version output
///
/// Handles various FFmpeg version formats:
/// - Standard: "ffmpeg version 6.1.1 ..."
/// - N-prefixed: "ffmpeg version n8.0-... ..."
/// - Git builds: "ffmpeg version N-113245-g..." (no major version)
pub fn parse_ffmpeg_version(version_output: &str) -> Option<FfmpegVersion> {
    let version_line = version_output
        .lines()
        .find(|line| line.to_lowercase().contains("ffmpeg version"))?;

    let raw = version_line
        .to_lowercase()
        .split("ffmpeg version")
        .nth(1)?
        .split_whitespace()
        .next()?
        .to_string();

    let major = raw
        .trim_start_matches('n')
        .split(|c| c == '.' || c == '-')
        .next()
        .and_then(|s| s.parse().ok());

    Some(FfmpegVersion { raw, major })
}

/// Check that FFmpeg runs by executing `<ffmpeg_path> -version`
pub fn check_ffmpeg_available(ffmpeg_path: &str) -> Result<FfmpegVersion, StartupError> {
    let output = Command::new(ffmpeg_path)
        .arg("-version")
        .output()
        .map_err(|e| {
            StartupError::FfmpegUnavailable(format!(
                "{} -version failed; is FFmpeg installed and in PATH? Error: {}",
                ffmpeg_path, e
            ))
        })?;

    if !output.status.success() {
        return Err(StartupError::FfmpegUnavailable(format!(
            "{} -version exited with {}",
            ffmpeg_path, output.status
        )));
    }

    let version_output = String::from_utf8_lossy(&output.stdout);
    parse_ffmpeg_version(&version_output).ok_or_else(|| {
        StartupError::FfmpegUnavailable(format!(
            "Could not parse FFmpeg version from output: {}",
            version_output.lines().next().unwrap_or("(empty)")
        ))
    })
}

/// Ensure a storage root exists, is a directory and accepts writes
pub fn ensure_storage_root(path: &Path) -> Result<(), StartupError> {
    let storage_err = |source| StartupError::Storage {
        path: path.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(path).map_err(|e| {
        if path.exists() && !path.is_dir() {
            return StartupError::NotADirectory {
                path: path.to_path_buf(),
            };
        }
        storage_err(e)
    })?;
    if !std::fs::metadata(path).map_err(storage_err)?.is_dir() {
        return Err(StartupError::NotADirectory {
            path: path.to_path_buf(),
        });
    }

    let probe = path.join(WRITE_PROBE);
    std::fs::write(&probe, b"ok").map_err(storage_err)?;
    std::fs::remove_file(&probe).map_err(storage_err)?;
    Ok(())
}

/// Validate every directory the pipeline reads from or writes to
///
/// Covers the upload temp dir, the library roots, the job state dir and
/// the directory holding the catalog file.
pub fn validate_storage(cfg: &Config) -> Result<(), StartupError> {
    let mut dirs = cfg.allowed_roots();
    dirs.push(cfg.storage.state_dir.clone());
    if let Some(parent) = cfg.storage.catalog_path.parent() {
        if !parent.as_os_str().is_empty() {
            dirs.push(parent.to_path_buf());
        }
    }

    for dir in &dirs {
        ensure_storage_root(dir)?;
    }
    info!(roots = dirs.len(), "storage roots validated");
    Ok(())
}

/// Run all startup checks in order
///
/// Checks are run in the following order:
/// 1. FFmpeg availability
/// 2. Storage roots
pub fn run_startup_checks(cfg: &Config) -> Result<(), StartupError> {
    let version = check_ffmpeg_available(&cfg.encoder.ffmpeg_path)?;
    match version.major {
        Some(major) => info!(version = %version, major, "ffmpeg available"),
        None => warn!(version = %version, "ffmpeg available, major version unknown"),
    }
    validate_storage(cfg)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_ffmpeg_version_parsing_standard(
            major in 1u32..20,
            minor in 0u32..10,
            patch in 0u32..10,
        ) {
            let version_output = format!(
                "ffmpeg version {}.{}.{} Copyright (c) 2000-2024 the FFmpeg developers",
                major, minor, patch
            );

            let parsed = parse_ffmpeg_version(&version_output).unwrap();
            prop_assert_eq!(parsed.major, Some(major));
            prop_assert_eq!(parsed.raw, format!("{}.{}.{}", major, minor, patch));
        }

        #[test]
        fn prop_ffmpeg_version_parsing_n_prefixed(
            major in 1u32..20,
            minor in 0u32..10,
            git_hash in "[a-f0-9]{7}",
        ) {
            let version_output = format!(
                "ffmpeg version n{}.{}-123-g{} Copyright (c) 2000-2024",
                major, minor, git_hash
            );

            let parsed = parse_ffmpeg_version(&version_output).unwrap();
            prop_assert_eq!(parsed.major, Some(major));
        }
    }

    #[test]
    fn test_version_on_later_line() {
        let output = "built with gcc 12.2.0\nffmpeg version 7.0.2-static https://johnvansickle.com\n";
        let parsed = parse_ffmpeg_version(output).unwrap();
        assert_eq!(parsed.raw, "7.0.2-static");
        assert_eq!(parsed.major, Some(7));
    }

    #[test]
    fn test_git_build_has_no_major() {
        let parsed = parse_ffmpeg_version("ffmpeg version N-113245-g1a2b3c4 Copyright").unwrap();
        assert_eq!(parsed.major, None);
        assert_eq!(parsed.to_string(), "n-113245-g1a2b3c4");
    }

    #[test]
    fn test_unrecognised_output() {
        assert!(parse_ffmpeg_version("").is_none());
        assert!(parse_ffmpeg_version("avconv version 12").is_none());
    }

    #[test]
    fn test_missing_ffmpeg_binary() {
        let result = check_ffmpeg_available("/nonexistent/bin/ffmpeg-for-tests");
        assert!(matches!(result, Err(StartupError::FfmpegUnavailable(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_ffmpeg_check_with_stub_binary() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("ffmpeg");
        std::fs::write(
            &script,
            "#!/bin/sh\necho 'ffmpeg version 6.1.1 Copyright (c) 2000-2023'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let version = check_ffmpeg_available(script.to_str().unwrap()).unwrap();
        assert_eq!(version.major, Some(6));
    }

    #[test]
    fn test_storage_roots_are_created() {
        let dir = TempDir::new().unwrap();
        let mut cfg = Config::default();
        cfg.storage.temp_dir = dir.path().join("uploads");
        cfg.storage.state_dir = dir.path().join("state/jobs");
        cfg.storage.catalog_path = dir.path().join("state/catalog.json");
        cfg.storage.movies_dir = dir.path().join("library/movies");
        cfg.storage.movies_docu_dir = dir.path().join("library/movies_docu");
        cfg.storage.series_dir = dir.path().join("library/series");
        cfg.storage.series_docu_dir = dir.path().join("library/series_docu");
        cfg.storage.series_kid_dir = dir.path().join("library/series_kid");

        validate_storage(&cfg).unwrap();

        for root in cfg.allowed_roots() {
            assert!(root.is_dir(), "{} should exist", root.display());
            assert!(!root.join(WRITE_PROBE).exists());
        }
        assert!(cfg.storage.state_dir.is_dir());
    }

    #[test]
    fn test_file_in_place_of_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movies");
        std::fs::write(&path, b"not a directory").unwrap();

        let result = ensure_storage_root(&path);
        assert!(matches!(result, Err(StartupError::NotADirectory { .. })));
    }
}
