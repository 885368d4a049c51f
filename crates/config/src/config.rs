//! Core configuration structures and loading logic

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration operations
#[derive(Debug, Error)]
pub enum ConfigError {
    /// IO error reading config file
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    /// TOML parsing error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Job queue configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Number of worker tasks (0 = auto-derive from core count)
    #[serde(default)]
    pub workers: u32,
    /// Capacity of the pending job channel
    #[serde(default = "default_capacity")]
    pub capacity: usize,
    /// Seconds `enqueue` may wait on a full channel before giving up
    #[serde(default = "default_enqueue_timeout_secs")]
    pub enqueue_timeout_secs: u64,
    /// Per-subscriber buffer of the update broadcaster
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

fn default_capacity() -> usize {
    100
}

fn default_enqueue_timeout_secs() -> u64 {
    5
}

fn default_subscriber_buffer() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            capacity: default_capacity(),
            enqueue_timeout_secs: default_enqueue_timeout_secs(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// Filesystem layout: upload staging, job state and library roots
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    pub temp_dir: PathBuf,
    pub state_dir: PathBuf,
    pub catalog_path: PathBuf,
    pub movies_dir: PathBuf,
    pub movies_docu_dir: PathBuf,
    pub series_dir: PathBuf,
    pub series_docu_dir: PathBuf,
    pub series_kid_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("./uploads"),
            state_dir: PathBuf::from("./state/jobs"),
            catalog_path: PathBuf::from("./state/catalog.json"),
            movies_dir: PathBuf::from("./movies"),
            movies_docu_dir: PathBuf::from("./movies_docu"),
            series_dir: PathBuf::from("./series"),
            series_docu_dir: PathBuf::from("./series_docu"),
            series_kid_dir: PathBuf::from("./series_kid"),
        }
    }
}

/// Encoder (ffmpeg) configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EncoderConfig {
    /// ffmpeg binary name or path
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    /// Use the platform hardware encoder instead of libx264
    #[serde(default)]
    pub hardware_acceleration: bool,
    /// Constant rate factor for software encodes
    #[serde(default = "default_crf")]
    pub crf: u8,
    /// x264 preset for software encodes
    #[serde(default = "default_preset")]
    pub preset: String,
    /// AAC bitrate, e.g. "160k"
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate: String,
    /// Hard limit for a single encode (None = unbounded)
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}

fn default_crf() -> u8 {
    21
}

fn default_preset() -> String {
    "veryfast".to_string()
}

fn default_audio_bitrate() -> String {
    "160k".to_string()
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: default_ffmpeg_path(),
            hardware_acceleration: false,
            crf: default_crf(),
            preset: default_preset(),
            audio_bitrate: default_audio_bitrate(),
            timeout_secs: None,
        }
    }
}

/// Status server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    #[serde(default = "default_server_enabled")]
    pub enabled: bool,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_server_enabled() -> bool {
    true
}

fn default_bind_addr() -> String {
    "127.0.0.1:7878".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            enabled: default_server_enabled(),
            bind_addr: default_bind_addr(),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub encoder: EncoderConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Parses the config.toml file and handles missing optional fields with defaults.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse_toml(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration
    ///
    /// Path variables (`TEMP_DIR`, `MOVIES_DIR`, ...) replace the matching
    /// storage entry when set and non-empty. Numeric and boolean variables
    /// that fail to parse are ignored.
    pub fn apply_env_overrides(&mut self) {
        let storage = &mut self.storage;
        for (key, slot) in [
            ("TEMP_DIR", &mut storage.temp_dir),
            ("JOBS_STATE_DIR", &mut storage.state_dir),
            ("CATALOG_PATH", &mut storage.catalog_path),
            ("MOVIES_DIR", &mut storage.movies_dir),
            ("MOVIES_DOCU_DIR", &mut storage.movies_docu_dir),
            ("SERIES_DIR", &mut storage.series_dir),
            ("SERIES_DOCU_DIR", &mut storage.series_docu_dir),
            ("SERIES_KID_DIR", &mut storage.series_kid_dir),
        ] {
            if let Ok(val) = env::var(key) {
                if !val.trim().is_empty() {
                    *slot = PathBuf::from(val);
                }
            }
        }

        if let Ok(val) = env::var("PIPELINE_WORKERS") {
            if let Ok(workers) = val.parse::<u32>() {
                self.queue.workers = workers;
            }
        }

        if let Ok(val) = env::var("FFMPEG_PATH") {
            if !val.trim().is_empty() {
                self.encoder.ffmpeg_path = val;
            }
        }

        if let Ok(val) = env::var("ENCODER_HWACCEL") {
            // Accept "true", "1", "yes" as true; "false", "0", "no" as false
            match val.to_lowercase().as_str() {
                "true" | "1" | "yes" => self.encoder.hardware_acceleration = true,
                "false" | "0" | "no" => self.encoder.hardware_acceleration = false,
                _ => {}
            }
        }

        if let Ok(val) = env::var("STATUS_BIND_ADDR") {
            if !val.trim().is_empty() {
                self.server.bind_addr = val;
            }
        }
    }

    /// Load configuration from file and apply environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Like [`Config::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = if path.as_ref().exists() {
            Self::load_from_file(path)?
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Directories the relocator may write into: the upload staging area
    /// plus every library root.
    pub fn allowed_roots(&self) -> Vec<PathBuf> {
        let s = &self.storage;
        vec![
            s.temp_dir.clone(),
            s.movies_dir.clone(),
            s.movies_docu_dir.clone(),
            s.series_dir.clone(),
            s.series_docu_dir.clone(),
            s.series_kid_dir.clone(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Mutex;

    // Mutex to ensure env var tests don't interfere with each other
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "TEMP_DIR",
        "JOBS_STATE_DIR",
        "CATALOG_PATH",
        "MOVIES_DIR",
        "MOVIES_DOCU_DIR",
        "SERIES_DIR",
        "SERIES_DOCU_DIR",
        "SERIES_KID_DIR",
        "PIPELINE_WORKERS",
        "FFMPEG_PATH",
        "ENCODER_HWACCEL",
        "STATUS_BIND_ADDR",
    ];

    fn clear_env_vars() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_config_parses_all_sections(
            workers in 0u32..64,
            capacity in 1usize..1000,
            timeout in 1u64..60,
            crf in 0u8..51,
            hwaccel in proptest::bool::ANY,
            movies in "[a-z]{1,12}",
        ) {
            let toml_str = format!(
                r#"
[queue]
workers = {}
capacity = {}
enqueue_timeout_secs = {}

[storage]
movies_dir = "/srv/{}"

[encoder]
crf = {}
hardware_acceleration = {}
"#,
                workers, capacity, timeout, movies, crf, hwaccel
            );

            let config = Config::parse_toml(&toml_str).expect("Valid TOML should parse");

            prop_assert_eq!(config.queue.workers, workers);
            prop_assert_eq!(config.queue.capacity, capacity);
            prop_assert_eq!(config.queue.enqueue_timeout_secs, timeout);
            prop_assert_eq!(config.storage.movies_dir, PathBuf::from(format!("/srv/{}", movies)));
            prop_assert_eq!(config.encoder.crf, crf);
            prop_assert_eq!(config.encoder.hardware_acceleration, hwaccel);
            // Untouched fields keep their defaults
            prop_assert_eq!(config.storage.series_dir, PathBuf::from("./series"));
            prop_assert_eq!(config.queue.subscriber_buffer, 256);
        }

        #[test]
        fn prop_env_overrides_workers(
            initial in 0u32..32,
            override_workers in 0u32..64,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[queue]\nworkers = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("PIPELINE_WORKERS", override_workers.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.queue.workers, override_workers);
        }

        #[test]
        fn prop_env_overrides_hwaccel(
            initial in proptest::bool::ANY,
            override_value in proptest::bool::ANY,
        ) {
            let _guard = ENV_MUTEX.lock().unwrap();
            clear_env_vars();

            let toml_str = format!("[encoder]\nhardware_acceleration = {}\n", initial);
            let mut config = Config::parse_toml(&toml_str).expect("Valid TOML");

            env::set_var("ENCODER_HWACCEL", override_value.to_string());
            config.apply_env_overrides();
            clear_env_vars();

            prop_assert_eq!(config.encoder.hardware_acceleration, override_value);
        }
    }

    #[test]
    fn test_env_overrides_storage_dirs() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        env::set_var("MOVIES_DIR", "/data/movies");
        env::set_var("SERIES_KID_DIR", "/data/kids");
        env::set_var("TEMP_DIR", "");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.storage.movies_dir, PathBuf::from("/data/movies"));
        assert_eq!(config.storage.series_kid_dir, PathBuf::from("/data/kids"));
        // Empty values are ignored
        assert_eq!(config.storage.temp_dir, PathBuf::from("./uploads"));
    }

    #[test]
    fn test_invalid_env_values_are_ignored() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let mut config = Config::default();
        config.queue.workers = 3;
        env::set_var("PIPELINE_WORKERS", "many");
        env::set_var("ENCODER_HWACCEL", "maybe");
        config.apply_env_overrides();
        clear_env_vars();

        assert_eq!(config.queue.workers, 3);
        assert!(!config.encoder.hardware_acceleration);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::parse_toml("").expect("Empty TOML should parse");

        assert_eq!(config, Config::default());
        assert_eq!(config.queue.capacity, 100);
        assert_eq!(config.queue.enqueue_timeout_secs, 5);
        assert_eq!(config.encoder.ffmpeg_path, "ffmpeg");
        assert_eq!(config.encoder.timeout_secs, None);
        assert!(config.server.enabled);
    }

    #[test]
    fn test_allowed_roots_cover_temp_and_library() {
        let config = Config::default();
        let roots = config.allowed_roots();

        assert_eq!(roots.len(), 6);
        assert!(roots.contains(&PathBuf::from("./uploads")));
        assert!(roots.contains(&PathBuf::from("./movies_docu")));
        assert!(roots.contains(&PathBuf::from("./series_kid")));
        assert!(!roots.contains(&config.storage.state_dir));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::TempDir::new().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_rejects_malformed_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[queue\nworkers = ").unwrap();

        assert!(matches!(Config::load(&path), Err(ConfigError::Parse(_))));
    }
}
