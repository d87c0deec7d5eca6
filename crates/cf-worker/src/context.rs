//! Injected collaborators shared by the producer, worker loops, drain, and
//! status reader.
//!
//! Nothing here is global: each process builds one [`WorkerContext`] and
//! hands clones to whatever needs it. Tests build one from fakes.

use std::sync::Arc;

use cf_av::{FfmpegEngine, TranscodeEngine};
use cf_blob::{BlobStore, LocalBlobStore};
use cf_core::config::Config;
use cf_core::events::EventBus;
use cf_core::{Error, Result};
use cf_db::pool::DbPool;
use cf_queue::{SqliteQueue, WorkQueue};

use crate::config_source::{ConfigSource, FileConfigSource, StaticConfigSource};

/// Process-wide handles. Cheap to clone: every field is an `Arc` or a pool.
#[derive(Clone)]
pub struct WorkerContext {
    /// Job store connection pool.
    pub db: DbPool,
    /// The work queue jobs are delivered through.
    pub queue: Arc<dyn WorkQueue>,
    /// Where exhausted messages end up.
    pub dead_letters: Arc<dyn WorkQueue>,
    pub blobs: Arc<dyn BlobStore>,
    pub engine: Arc<dyn TranscodeEngine>,
    pub config_source: Arc<dyn ConfigSource>,
    pub event_bus: Arc<EventBus>,
    pub config: Arc<Config>,
}

impl WorkerContext {
    /// Wire up the production collaborators described by `config`.
    ///
    /// Opens (and migrates) the SQLite file, builds the queue pair on it,
    /// roots blob storage on disk, and discovers ffmpeg.
    pub fn open(mut config: Config) -> Result<Self> {
        for warning in config.validate() {
            tracing::warn!("Config warning: {warning}");
        }

        let db_path = config.database.path.clone();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
                tracing::info!("Created database directory {}", parent.display());
            }
        }
        let db = cf_db::pool::init_pool(&db_path.to_string_lossy())?;
        tracing::info!("Job store opened at {}", db_path.display());

        if config.storage.signing_secret.is_none() {
            config.storage.signing_secret = Some(uuid::Uuid::new_v4().simple().to_string());
        }
        std::fs::create_dir_all(&config.storage.root)?;
        let blobs = LocalBlobStore::from_config(&config.storage);

        let engine = FfmpegEngine::discover(&config.tools);
        for info in engine.tools().check_all() {
            if info.available {
                tracing::info!(
                    "Tool found: {} ({})",
                    info.name,
                    info.version.as_deref().unwrap_or("unknown version")
                );
            } else {
                tracing::debug!("Tool not found: {}", info.name);
            }
        }

        let config_source: Arc<dyn ConfigSource> = match &config.transcode.config_source {
            Some(path) => Arc::new(FileConfigSource::new(path)),
            None => Arc::new(StaticConfigSource::with_preset(&config.transcode.default_preset)),
        };

        let (work, dead) = SqliteQueue::pair_from_config(db.clone(), &config.queue);

        Ok(Self {
            db,
            queue: Arc::new(work),
            dead_letters: Arc::new(dead),
            blobs: Arc::new(blobs),
            engine: Arc::new(engine),
            config_source,
            event_bus: Arc::new(EventBus::default()),
            config: Arc::new(config),
        })
    }

    /// Pooled connection to the job store.
    pub fn conn(&self) -> Result<cf_db::pool::PooledConnection> {
        cf_db::pool::get_conn(&self.db)
    }

    /// Fail fast when the engine cannot possibly run.
    pub fn require_engine(config: &Config) -> Result<()> {
        if FfmpegEngine::discover(&config.tools).is_available() {
            Ok(())
        } else {
            Err(Error::tool("ffmpeg", "ffmpeg not found; is it installed and in PATH?"))
        }
    }
}
