//! Daemon startup and lifecycle for the media pipeline
//!
//! Wires the job store, catalog, encoder, tagger, relocator, processor and
//! dispatcher together from a [`Config`], then runs them until Ctrl-C.

use crate::broadcast::Broadcaster;
use crate::cancel::CancellationRegistry;
use crate::catalog::{CatalogError, MemoryCatalog};
use crate::concurrency::{derive_plan, QueuePlan};
use crate::config::{Config, ConfigError};
use crate::encode::{EncoderSettings, FfmpegEncoder};
use crate::processor::{Processor, ProcessorDeps};
use crate::queue::Dispatcher;
use crate::relocate::{LibraryRoots, PathGuard, Relocator};
use crate::server::{run_server, ServerError};
use crate::startup::{run_startup_checks, StartupError};
use crate::store::{FsJobStore, StoreError};
use crate::tag::FfmpegTagger;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Invalid status server address '{0}'")]
    BindAddr(String),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived worker pool and queue sizing
    pub plan: QueuePlan,
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file (missing file = defaults)
    /// 2. Apply environment overrides
    /// 3. Run startup checks (ffmpeg, storage roots)
    /// 4. Build the pipeline components
    pub async fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load_or_default(config_path)?;
        Self::with_config(config).await
    }

    /// Initialize the daemon with an existing configuration
    pub async fn with_config(config: Config) -> Result<Self, DaemonError> {
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when ffmpeg is not available. The job state
    /// directory is still created.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        let plan = derive_plan(&config);

        let store = Arc::new(FsJobStore::open(&config.storage.state_dir)?);
        let catalog = Arc::new(MemoryCatalog::open(&config.storage.catalog_path)?);
        let guard = PathGuard::new(config.allowed_roots())?;
        let relocator = Relocator::new(
            guard,
            LibraryRoots::from_storage(&config.storage),
            catalog.clone(),
        );

        let processor = Arc::new(Processor::new(ProcessorDeps {
            store,
            catalog,
            encoder: Arc::new(FfmpegEncoder::new(EncoderSettings::from_config(
                &config.encoder,
            ))),
            tagger: Arc::new(FfmpegTagger::new(
                config.encoder.ffmpeg_path.clone(),
                config.storage.temp_dir.clone(),
            )),
            relocator: Arc::new(relocator),
            registry: Arc::new(CancellationRegistry::new()),
            broadcaster: Arc::new(Broadcaster::new(config.queue.subscriber_buffer)),
            temp_dir: config.storage.temp_dir.clone(),
        }));
        let dispatcher = Arc::new(Dispatcher::from_plan(processor, &plan));

        Ok(Self {
            config,
            plan,
            dispatcher,
            shutdown: CancellationToken::new(),
        })
    }

    /// The job dispatcher, for embedding layers that submit jobs or subscribe
    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    /// Token that stops [`Daemon::run`] when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Start the status HTTP server if enabled
    ///
    /// Spawns the server as a background task that ends on shutdown.
    pub fn start_server(
        &self,
    ) -> Result<Option<JoinHandle<Result<(), ServerError>>>, DaemonError> {
        if !self.config.server.enabled {
            return Ok(None);
        }
        let addr: SocketAddr = self
            .config
            .server
            .bind_addr
            .parse()
            .map_err(|_| DaemonError::BindAddr(self.config.server.bind_addr.clone()))?;
        Ok(Some(tokio::spawn(run_server(
            self.dispatcher.clone(),
            addr,
            self.shutdown.clone(),
        ))))
    }

    /// Run the daemon until Ctrl-C or the shutdown token fires
    ///
    /// Starts the workers and crash recovery, serves the status API, then
    /// stops the dispatcher gracefully: in-flight jobs finish first.
    pub async fn run(&self) -> Result<(), DaemonError> {
        info!(
            workers = self.plan.workers,
            cores = self.plan.total_cores,
            capacity = self.plan.capacity,
            "starting pipeline"
        );
        let recovery = self.dispatcher.start(self.plan.workers);
        let mut server = self.start_server()?;

        let server_exit = tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                match signal {
                    Ok(()) => info!("shutdown requested"),
                    Err(e) => error!(error = %e, "failed to listen for Ctrl-C, shutting down"),
                }
                None
            }
            _ = self.shutdown.cancelled() => None,
            joined = wait_for_server(&mut server) => {
                server = None;
                Some(joined)
            }
        };

        self.shutdown.cancel();
        self.dispatcher.stop().await;
        if let Err(e) = recovery.await {
            error!(error = %e, "recovery task panicked");
        }

        let joined = match (server_exit, server) {
            (Some(joined), _) => Some(joined),
            (None, Some(handle)) => Some(handle.await),
            (None, None) => None,
        };
        match joined {
            Some(Ok(result)) => result?,
            Some(Err(e)) => error!(error = %e, "status server task panicked"),
            None => {}
        }
        info!("pipeline stopped");
        Ok(())
    }
}

/// Resolves when the server task ends; never when there is no server.
async fn wait_for_server(
    server: &mut Option<JoinHandle<Result<(), ServerError>>>,
) -> Result<Result<(), ServerError>, JoinError> {
    match server.as_mut() {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::tests::make_movie;
    use crate::catalog::Catalog;
    use crate::jobs::{MediaType, NewJob, Stage, TranscodeMode, TranscodeOptions};
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_test_config(dir: &Path) -> Config {
        let mut config = Config::default();
        config.queue.workers = 1;
        config.server.enabled = false;
        config.storage.temp_dir = dir.join("uploads");
        config.storage.state_dir = dir.join("state/jobs");
        config.storage.catalog_path = dir.join("state/catalog.json");
        config.storage.movies_dir = dir.join("movies");
        config.storage.movies_docu_dir = dir.join("movies_docu");
        config.storage.series_dir = dir.join("series");
        config.storage.series_docu_dir = dir.join("series_docu");
        config.storage.series_kid_dir = dir.join("series_kid");
        config
    }

    #[tokio::test]
    async fn test_daemon_initialization_without_checks() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(dir.path());
        let daemon = Daemon::new_without_checks(config.clone()).unwrap();

        assert_eq!(daemon.config, config);
        assert_eq!(daemon.plan.workers, 1);
        assert_eq!(daemon.plan.capacity, 100);
        assert!(config.storage.state_dir.is_dir());
        assert_eq!(daemon.dispatcher().queued_len(), 0);
    }

    #[test]
    fn test_invalid_bind_addr_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut config = create_test_config(dir.path());
        config.server.enabled = true;
        config.server.bind_addr = "not-an-address".to_string();
        let daemon = Daemon::new_without_checks(config).unwrap();

        assert!(matches!(daemon.start_server(), Err(DaemonError::BindAddr(_))));
    }

    #[tokio::test]
    async fn test_run_processes_job_and_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        let config = create_test_config(dir.path());
        let catalog = MemoryCatalog::open(&config.storage.catalog_path).unwrap();
        catalog.insert_movie(make_movie("movie-1"));
        catalog
            .update_file_path(MediaType::Movie, "movie-1", Path::new("/placeholder"))
            .await
            .unwrap();
        std::fs::create_dir_all(&config.storage.temp_dir).unwrap();
        let upload = config.storage.temp_dir.join("upload.mp4");
        std::fs::write(&upload, b"video bytes").unwrap();

        let daemon = Arc::new(Daemon::new_without_checks(config.clone()).unwrap());
        let dispatcher = daemon.dispatcher();
        let mut sub = dispatcher.subscribe();
        let runner = {
            let daemon = daemon.clone();
            tokio::spawn(async move { daemon.run().await })
        };

        let job = dispatcher
            .submit(NewJob {
                media_type: MediaType::Movie,
                media_id: "movie-1".to_string(),
                input_path: upload.clone(),
                transcode_mode: TranscodeMode::None,
                transcode_options: TranscodeOptions::default(),
            })
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(update) = sub.receiver.recv().await {
                if update.job_id == job.id && update.stage.is_terminal() {
                    assert_eq!(update.stage, Stage::Completed);
                    break;
                }
            }
        })
        .await
        .unwrap();

        daemon.shutdown_token().cancel();
        tokio::time::timeout(Duration::from_secs(10), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let dest = config.storage.movies_dir.join("Blade Runner - Final Cut_78.mp4");
        assert!(dest.exists());
        assert!(!upload.exists());

        // The catalog file on disk records the new location
        let reloaded = MemoryCatalog::open(&config.storage.catalog_path).unwrap();
        assert_eq!(reloaded.movie("movie-1").unwrap().file_path, Some(dest));
    }
}
