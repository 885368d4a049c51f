//! Catalog interface consumed by the pipeline.
//!
//! The pipeline only needs two things from the catalog of movies, series
//! and episodes: look a media record up by type and id, and store the final
//! file location once a job has filed the asset into the library.

use crate::jobs::MediaType;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("{media_type} {id} not found in catalog")]
    NotFound { media_type: MediaType, id: String },

    #[error("series {0} not found in catalog")]
    SeriesNotFound(String),

    #[error("catalog IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("catalog file is invalid: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Movie {
    pub id: String,
    pub title: String,
    /// Filesystem-facing title override.
    #[serde(default)]
    pub custom_title: Option<String>,
    pub tmdb_id: u64,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub overview: Option<String>,
    /// Poster URL or local image path.
    #[serde(default)]
    pub poster: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Series {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub custom_title: Option<String>,
    pub tmdb_id: u64,
    #[serde(default)]
    pub poster: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Episode {
    pub id: String,
    pub series_id: String,
    pub season_number: u32,
    pub episode_number: u32,
    pub title: String,
    #[serde(default)]
    pub overview: Option<String>,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}

/// What the pipeline knows about the entity a job produces an asset for.
#[derive(Debug, Clone, PartialEq)]
pub enum MediaRecord {
    Movie(Movie),
    Episode { episode: Episode, series: Series },
}

impl MediaRecord {
    pub fn media_type(&self) -> MediaType {
        match self {
            MediaRecord::Movie(_) => MediaType::Movie,
            MediaRecord::Episode { .. } => MediaType::Episode,
        }
    }

    /// Title shown to viewers (never the filesystem override).
    pub fn display_title(&self) -> &str {
        match self {
            MediaRecord::Movie(movie) => &movie.title,
            MediaRecord::Episode { episode, .. } => &episode.title,
        }
    }

    /// Poster of the movie, or of the series an episode belongs to.
    pub fn poster(&self) -> Option<&str> {
        match self {
            MediaRecord::Movie(movie) => movie.poster.as_deref(),
            MediaRecord::Episode { series, .. } => series.poster.as_deref(),
        }
    }
}

/// Catalog operations the pipeline depends on.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_media(&self, media_type: MediaType, id: &str) -> Result<MediaRecord, CatalogError>;

    async fn update_file_path(
        &self,
        media_type: MediaType,
        id: &str,
        path: &Path,
    ) -> Result<(), CatalogError>;
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
struct CatalogData {
    movies: HashMap<String, Movie>,
    series: HashMap<String, Series>,
    episodes: HashMap<String, Episode>,
}

/// In-memory catalog, optionally mirrored to a JSON file.
#[derive(Default)]
pub struct MemoryCatalog {
    data: RwLock<CatalogData>,
    backing_file: Option<PathBuf>,
    // Held across snapshot, write and rename of the backing file.
    persist_lock: tokio::sync::Mutex<()>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the catalog from `path` (empty if the file does not exist) and
    /// rewrites the file after every file-location update.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, CatalogError> {
        let path = path.into();
        let data = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CatalogData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            data: RwLock::new(data),
            backing_file: Some(path),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn insert_movie(&self, movie: Movie) {
        self.data.write().movies.insert(movie.id.clone(), movie);
    }

    pub fn insert_series(&self, series: Series) {
        self.data.write().series.insert(series.id.clone(), series);
    }

    pub fn insert_episode(&self, episode: Episode) {
        self.data.write().episodes.insert(episode.id.clone(), episode);
    }

    pub fn movie(&self, id: &str) -> Option<Movie> {
        self.data.read().movies.get(id).cloned()
    }

    pub fn episode(&self, id: &str) -> Option<Episode> {
        self.data.read().episodes.get(id).cloned()
    }

    async fn persist(&self) -> Result<(), CatalogError> {
        let Some(path) = &self.backing_file else {
            return Ok(());
        };
        let _guard = self.persist_lock.lock().await;
        let json = serde_json::to_vec_pretty(&*self.data.read())?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn get_media(&self, media_type: MediaType, id: &str) -> Result<MediaRecord, CatalogError> {
        let data = self.data.read();
        let not_found = || CatalogError::NotFound {
            media_type,
            id: id.to_string(),
        };

        match media_type {
            MediaType::Movie => data
                .movies
                .get(id)
                .cloned()
                .map(MediaRecord::Movie)
                .ok_or_else(not_found),
            MediaType::Episode => {
                let episode = data.episodes.get(id).cloned().ok_or_else(not_found)?;
                let series = data
                    .series
                    .get(&episode.series_id)
                    .cloned()
                    .ok_or_else(|| CatalogError::SeriesNotFound(episode.series_id.clone()))?;
                Ok(MediaRecord::Episode { episode, series })
            }
        }
    }

    async fn update_file_path(
        &self,
        media_type: MediaType,
        id: &str,
        path: &Path,
    ) -> Result<(), CatalogError> {
        {
            let mut data = self.data.write();
            let slot = match media_type {
                MediaType::Movie => data.movies.get_mut(id).map(|m| &mut m.file_path),
                MediaType::Episode => data.episodes.get_mut(id).map(|e| &mut e.file_path),
            };
            let slot = slot.ok_or_else(|| CatalogError::NotFound {
                media_type,
                id: id.to_string(),
            })?;
            *slot = Some(path.to_path_buf());
        }
        self.persist().await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    pub(crate) fn make_movie(id: &str) -> Movie {
        Movie {
            id: id.to_string(),
            title: "Blade Runner: Final Cut".to_string(),
            custom_title: None,
            tmdb_id: 78,
            year: Some(1982),
            overview: Some("A blade runner must pursue replicants.".to_string()),
            poster: None,
            file_path: None,
        }
    }

    pub(crate) fn make_series(id: &str) -> Series {
        Series {
            id: id.to_string(),
            title: "The Expanse".to_string(),
            custom_title: None,
            tmdb_id: 63639,
            poster: None,
        }
    }

    pub(crate) fn make_episode(id: &str, series_id: &str) -> Episode {
        Episode {
            id: id.to_string(),
            series_id: series_id.to_string(),
            season_number: 2,
            episode_number: 5,
            title: "Home".to_string(),
            overview: None,
            file_path: None,
        }
    }

    #[tokio::test]
    async fn test_lookup_movie_and_episode() {
        let catalog = MemoryCatalog::new();
        catalog.insert_movie(make_movie("m1"));
        catalog.insert_series(make_series("s1"));
        catalog.insert_episode(make_episode("e1", "s1"));

        let movie = catalog.get_media(MediaType::Movie, "m1").await.unwrap();
        assert_eq!(movie.media_type(), MediaType::Movie);
        assert_eq!(movie.display_title(), "Blade Runner: Final Cut");

        match catalog.get_media(MediaType::Episode, "e1").await.unwrap() {
            MediaRecord::Episode { episode, series } => {
                assert_eq!(episode.season_number, 2);
                assert_eq!(series.tmdb_id, 63639);
            }
            other => panic!("expected episode, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lookup_missing_records() {
        let catalog = MemoryCatalog::new();
        catalog.insert_episode(make_episode("e1", "orphan"));

        assert!(matches!(
            catalog.get_media(MediaType::Movie, "nope").await,
            Err(CatalogError::NotFound { .. })
        ));
        assert!(matches!(
            catalog.get_media(MediaType::Episode, "e1").await,
            Err(CatalogError::SeriesNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_file_path_persists_to_backing_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state/catalog.json");

        let catalog = MemoryCatalog::open(&path).unwrap();
        catalog.insert_movie(make_movie("m1"));
        catalog
            .update_file_path(MediaType::Movie, "m1", Path::new("/movies/a.mp4"))
            .await
            .unwrap();
        assert_eq!(
            catalog.movie("m1").unwrap().file_path,
            Some(PathBuf::from("/movies/a.mp4"))
        );

        let reopened = MemoryCatalog::open(&path).unwrap();
        assert_eq!(
            reopened.movie("m1").unwrap().file_path,
            Some(PathBuf::from("/movies/a.mp4"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_all_persist() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("catalog.json");

        let catalog = Arc::new(MemoryCatalog::open(&path).unwrap());
        for i in 0..50 {
            catalog.insert_movie(make_movie(&format!("m{}", i)));
        }

        let mut tasks = Vec::new();
        for i in 0..50 {
            let catalog = Arc::clone(&catalog);
            tasks.push(tokio::spawn(async move {
                let id = format!("m{}", i);
                let file = PathBuf::from(format!("/movies/{}.mp4", id));
                catalog.update_file_path(MediaType::Movie, &id, &file).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = MemoryCatalog::open(&path).unwrap();
        for i in 0..50 {
            assert_eq!(
                reopened.movie(&format!("m{}", i)).unwrap().file_path,
                Some(PathBuf::from(format!("/movies/m{}.mp4", i)))
            );
        }
    }

    #[tokio::test]
    async fn test_update_file_path_unknown_id() {
        let catalog = MemoryCatalog::new();
        let result = catalog
            .update_file_path(MediaType::Episode, "e404", Path::new("/series/x.mp4"))
            .await;
        assert!(matches!(result, Err(CatalogError::NotFound { .. })));
    }
}
