//! Relocator module for filing finished media into the library.
//!
//! This module computes category-aware, collision-safe destinations, guards
//! every destination against path escape, and moves files with an atomic
//! rename that falls back to copy + delete across filesystems.

use crate::catalog::{Catalog, CatalogError, MediaRecord};
use crate::jobs::{has_parent_segment, Job, TranscodeOptions};
use nitflex_config::StorageConfig;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Errors that can occur while relocating a file.
#[derive(Debug, Error)]
pub enum RelocateError {
    /// Destination contains a `..` segment.
    #[error("path contains a parent-directory segment: {0}")]
    Traversal(PathBuf),

    /// Destination does not resolve under any allowed root.
    #[error("path is outside the allowed storage roots: {0}")]
    OutsideRoots(PathBuf),

    #[error("source file does not exist: {0}")]
    MissingSource(PathBuf),

    #[error("failed to move file: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Validates paths against a fixed set of allowed root directories.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    /// Builds a guard from configured roots. Relative roots are resolved
    /// against the current working directory.
    pub fn new<I, P>(roots: I) -> io::Result<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let roots = roots
            .into_iter()
            .map(|root| std::path::absolute(root.as_ref()))
            .collect::<io::Result<Vec<_>>>()?;
        Ok(Self { roots })
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Checks `path` and returns its absolute form.
    ///
    /// # Returns
    ///
    /// * `Err(Traversal)` if any component is `..`
    /// * `Err(OutsideRoots)` if the path is not under an allowed root
    pub fn check(&self, path: &Path) -> Result<PathBuf, RelocateError> {
        if has_parent_segment(path) {
            return Err(RelocateError::Traversal(path.to_path_buf()));
        }
        let absolute = std::path::absolute(path)?;
        // starts_with compares whole components, so /movies2 is not under /movies
        if self.roots.iter().any(|root| absolute.starts_with(root)) {
            Ok(absolute)
        } else {
            Err(RelocateError::OutsideRoots(path.to_path_buf()))
        }
    }
}

/// Library category roots used by the destination policy.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryRoots {
    pub movies: PathBuf,
    pub movies_docu: PathBuf,
    pub series: PathBuf,
    pub series_docu: PathBuf,
    pub series_kid: PathBuf,
}

impl LibraryRoots {
    pub fn from_storage(storage: &StorageConfig) -> Self {
        Self {
            movies: storage.movies_dir.clone(),
            movies_docu: storage.movies_docu_dir.clone(),
            series: storage.series_dir.clone(),
            series_docu: storage.series_docu_dir.clone(),
            series_kid: storage.series_kid_dir.clone(),
        }
    }

    fn movie_root(&self, options: TranscodeOptions) -> &Path {
        if options.documentary {
            &self.movies_docu
        } else {
            &self.movies
        }
    }

    fn series_root(&self, options: TranscodeOptions) -> &Path {
        if options.documentary {
            &self.series_docu
        } else if options.kids {
            &self.series_kid
        } else {
            &self.series
        }
    }
}

/// Makes a title safe to use as a single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.trim().chars() {
        match c {
            '/' | '\\' => out.push('_'),
            ':' => out.push_str(" - "),
            '*' | '|' => out.push('-'),
            '?' | '"' | '\'' | '<' | '>' => {}
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    // Collapse the runs left behind by replacements and removals
    let out = out.split_whitespace().collect::<Vec<_>>().join(" ");
    if out.is_empty() || out == "." || out == ".." {
        "untitled".to_string()
    } else {
        out
    }
}

/// Lowercased extension of `input` including the dot, `.mp4` if absent.
pub fn output_extension(input: &Path) -> String {
    match input.extension().and_then(|e| e.to_str()) {
        Some(ext) if !ext.is_empty() => format!(".{}", ext.to_lowercase()),
        _ => ".mp4".to_string(),
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// Computes the library destination of a media record.
///
/// Movies land at `<root>/<Title>_<tmdbId><ext>`, episodes at
/// `<root>/<Series>_<tmdbId>/[<CustomTitle>/]Season <n>/S<nn>E<nn> - <Title><ext>`.
pub fn destination_for(
    record: &MediaRecord,
    options: TranscodeOptions,
    roots: &LibraryRoots,
    ext: &str,
) -> PathBuf {
    match record {
        MediaRecord::Movie(movie) => {
            let title = non_empty(&movie.custom_title).unwrap_or(&movie.title);
            let name = format!("{}_{}{}", sanitize_file_name(title), movie.tmdb_id, ext);
            roots.movie_root(options).join(name)
        }
        MediaRecord::Episode { episode, series } => {
            let mut dir = roots.series_root(options).join(format!(
                "{}_{}",
                sanitize_file_name(&series.title),
                series.tmdb_id
            ));
            if let Some(custom) = non_empty(&series.custom_title) {
                dir.push(sanitize_file_name(custom));
            }
            dir.push(format!("Season {}", episode.season_number));
            dir.join(format!(
                "S{:02}E{:02} - {}{}",
                episode.season_number,
                episode.episode_number,
                sanitize_file_name(&episode.title),
                ext
            ))
        }
    }
}

/// Claims the first free name among `path`, `<stem> (2)<ext>`,
/// `<stem> (3)<ext>`, ... by creating an empty placeholder there.
///
/// Creation uses `create_new`, so two concurrent callers never receive the
/// same name. The caller replaces the placeholder with the real file, or
/// removes it on failure.
pub fn reserve_free_path(path: &Path) -> io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    let candidates = std::iter::once(path.to_path_buf())
        .chain((2u32..).map(|n| path.with_file_name(format!("{} ({}){}", stem, n, ext))));
    for candidate in candidates {
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(_) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("no free name for {}", path.display()),
    ))
}

/// Moves `src` to `dst`, preferring an atomic rename.
pub fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
    move_file_using(src, dst, |from, to| fs::rename(from, to))
}

/// Like [`move_file`], with the rename step supplied by the caller.
///
/// If `rename` fails (cross-device moves, some network filesystems), the
/// file is copied and the source removed. A partially written destination
/// is removed when the copy fails.
pub fn move_file_using<F>(src: &Path, dst: &Path, rename: F) -> io::Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }

    if let Err(e) = rename(src, dst) {
        debug!(error = %e, src = %src.display(), "rename failed, copying instead");
        if let Err(copy_err) = fs::copy(src, dst) {
            let _ = fs::remove_file(dst);
            return Err(copy_err);
        }
        fs::remove_file(src)?;
    }
    Ok(())
}

/// Files processed media into the library and records the new location in
/// the catalog.
pub struct Relocator {
    guard: PathGuard,
    roots: LibraryRoots,
    catalog: Arc<dyn Catalog>,
}

impl Relocator {
    pub fn new(guard: PathGuard, roots: LibraryRoots, catalog: Arc<dyn Catalog>) -> Self {
        Self {
            guard,
            roots,
            catalog,
        }
    }

    pub fn guard(&self) -> &PathGuard {
        &self.guard
    }

    /// Moves the job's current input into its library destination.
    ///
    /// # Returns
    ///
    /// The final (collision-free) destination path.
    pub async fn relocate(&self, job: &Job) -> Result<PathBuf, RelocateError> {
        let record = self.catalog.get_media(job.media_type, &job.media_id).await?;
        let ext = output_extension(&job.input_path);
        let planned = destination_for(&record, job.transcode_options, &self.roots, &ext);
        let planned = self.guard.check(&planned)?;

        let src = job.input_path.clone();
        let dst = tokio::task::spawn_blocking(move || -> Result<PathBuf, RelocateError> {
            if !src.is_file() {
                return Err(RelocateError::MissingSource(src));
            }
            let dst = reserve_free_path(&planned)?;
            if let Err(e) = move_file(&src, &dst) {
                let _ = fs::remove_file(&dst);
                return Err(e.into());
            }
            Ok(dst)
        })
        .await
        .map_err(io::Error::other)??;

        self.catalog
            .update_file_path(job.media_type, &job.media_id, &dst)
            .await?;

        info!(job_id = %job.id, dest = %dst.display(), "relocated media file");
        Ok(dst)
    }
}
