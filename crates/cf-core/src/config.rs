//! Application configuration types.
//!
//! The top-level [`Config`] struct is deserialized from JSON and carries all
//! sub-configs for the database, queues, workers, blob storage, tools, and
//! transcoding. Every section defaults sensibly so a completely empty `{}`
//! file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;
use crate::Error;

/// Presets the transcode engine understands.
pub const KNOWN_PRESETS: &[&str] = &["720p", "1080p"];

// ---------------------------------------------------------------------------
// Top-level Config
// ---------------------------------------------------------------------------

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
    pub tools: ToolsConfig,
    pub transcode: TranscodeConfig,
}

impl Config {
    /// Deserialize a `Config` from a JSON string.
    ///
    /// This is intentionally string-based so the caller can read the file
    /// however it sees fit.
    pub fn from_json(json_str: &str) -> Result<Self> {
        serde_json::from_str(json_str).map_err(|e| Error::Config(format!("config parse error: {e}")))
    }

    /// Load configuration from a file path, falling back to defaults if the
    /// path is `None` or the file does not exist.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        match std::fs::read_to_string(path) {
            Ok(contents) => Self::from_json(&contents).unwrap_or_else(|e| {
                tracing::warn!("Failed to parse config file {}: {e}", path.display());
                Self::default()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("No config file at {}; using defaults", path.display());
                Self::default()
            }
            Err(e) => {
                tracing::warn!("Failed to read config file {}: {e}", path.display());
                Self::default()
            }
        }
    }

    /// Return a list of validation warnings (non-fatal issues).
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.queue.work_queue == self.queue.dead_letter_queue {
            warnings.push("queue.work_queue and queue.dead_letter_queue must differ".into());
        }
        if self.queue.max_receive_count == 0 {
            warnings.push(
                "queue.max_receive_count is 0; every message will be dead-lettered unseen".into(),
            );
        }
        if self.queue.visibility_timeout_secs == 0 {
            warnings.push(
                "queue.visibility_timeout_secs is 0; leased messages are immediately redeliverable"
                    .into(),
            );
        }
        if self.worker.concurrency == 0 {
            warnings.push("worker.concurrency is 0; no jobs will be processed".into());
        }
        if self.worker.batch_size == 0 || self.worker.batch_size > 10 {
            warnings.push(format!(
                "worker.batch_size {} is outside 1..=10",
                self.worker.batch_size
            ));
        }
        if self.storage.signing_secret.is_none() {
            warnings.push(
                "storage.signing_secret is not set; download links use an ephemeral secret".into(),
            );
        }
        if !KNOWN_PRESETS.contains(&self.transcode.default_preset.as_str()) {
            warnings.push(format!(
                "transcode.default_preset '{}' is not a recognized preset (valid: {})",
                self.transcode.default_preset,
                KNOWN_PRESETS.join(", ")
            ));
        }

        warnings
    }
}

// ---------------------------------------------------------------------------
// Sub-configs
// ---------------------------------------------------------------------------

/// Job store / queue database location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/clipforge.db"),
        }
    }
}

/// Work queue and dead-letter channel settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub work_queue: String,
    pub dead_letter_queue: String,
    pub visibility_timeout_secs: u64,
    pub wait_time_secs: u64,
    pub max_receive_count: u32,
    pub retention_secs: u64,
    pub poll_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            work_queue: "transcode".into(),
            dead_letter_queue: "transcode-dlq".into(),
            visibility_timeout_secs: 900,
            wait_time_secs: 20,
            max_receive_count: 3,
            retention_secs: 4 * 24 * 60 * 60,
            poll_interval_ms: 250,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn wait_time(&self) -> Duration {
        Duration::from_secs(self.wait_time_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Upper bound on how long a client may wait before a job settles:
    /// every delivery may hold its lease for the full visibility timeout.
    pub fn resolution_bound(&self) -> Duration {
        self.visibility_timeout() * self.max_receive_count
    }
}

/// Worker loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of independent worker loops to run in this process.
    pub concurrency: usize,
    /// Maximum messages leased per receive.
    pub batch_size: usize,
    /// Parent directory for per-job scratch areas.
    pub work_dir: PathBuf,
    /// Pause after a failed receive before polling again.
    pub error_backoff_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            batch_size: 1,
            work_dir: PathBuf::from("./data/work"),
            error_backoff_secs: 3,
        }
    }
}

impl WorkerConfig {
    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }
}

/// Blob storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub root: PathBuf,
    pub base_url: String,
    pub signing_secret: Option<String>,
    pub link_ttl_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./data/blobs"),
            base_url: "http://localhost:8080/blobs".into(),
            signing_secret: None,
            link_ttl_secs: 300,
        }
    }
}

/// Paths to external CLI tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub ffmpeg_path: Option<PathBuf>,
    pub ffprobe_path: Option<PathBuf>,
    /// Longest a single transcode may run before it is killed.
    pub ffmpeg_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: None,
            ffprobe_path: None,
            ffmpeg_timeout_secs: 24 * 60 * 60,
        }
    }
}

impl ToolsConfig {
    pub fn ffmpeg_timeout(&self) -> Duration {
        Duration::from_secs(self.ffmpeg_timeout_secs)
    }
}

/// Transcode defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscodeConfig {
    /// JSON file consulted before every job for the preset to use.
    pub config_source: Option<PathBuf>,
    /// Preset used when the config source is missing or unusable.
    pub default_preset: String,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            config_source: None,
            default_preset: "720p".into(),
        }
    }
}
