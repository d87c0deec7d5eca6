//! Shared test harness for integration tests.
//!
//! Provides [`TestHarness`], which wires a full [`WorkerContext`] from an
//! in-memory job store and queue pair, a temp-dir blob store and work area,
//! and a scriptable [`FakeEngine`] standing in for ffmpeg.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::Notify;

use cf_av::{Profile, ProgressCallback, TranscodeEngine};
use cf_blob::LocalBlobStore;
use cf_core::config::Config;
use cf_core::events::EventBus;
use cf_core::{Error, JobId, Result};
use cf_db::models::Job;
use cf_db::pool::{init_memory_pool, PooledConnection};
use cf_queue::{Delivery, SqliteQueue};
use cf_worker::worker::{process_delivery, Outcome};
use cf_worker::{producer, StaticConfigSource, WorkerContext};

/// Bytes every fake transcode prefixes to its input.
pub const TRANSCODED_PREFIX: &[u8] = b"transcoded:";

/// Visibility of zero makes a withheld message redeliverable at once, so
/// retry paths can be driven step by step.
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.queue.visibility_timeout_secs = 0;
    config.queue.wait_time_secs = 0;
    config.queue.poll_interval_ms = 10;
    config.queue.max_receive_count = 3;
    config.worker.batch_size = 1;
    config.worker.work_dir = root.join("work");
    config.worker.error_backoff_secs = 0;
    config.storage.root = root.join("blobs");
    config.storage.base_url = "http://blobs.test".into();
    config.storage.signing_secret = Some("test-secret".into());
    config
}

// ---------------------------------------------------------------------------
// FakeEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Succeed,
    Fail,
    /// The first invocation parks until [`FakeEngine::release`].
    GateFirst,
    /// The first two invocations each park until released; the first then
    /// fails and the second succeeds.
    GateTwoFirstFails,
}

pub struct FakeEngine {
    mode: Mode,
    calls: AtomicUsize,
    entered: [Notify; 2],
    gates: [Notify; 2],
}

impl FakeEngine {
    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            calls: AtomicUsize::new(0),
            entered: [Notify::new(), Notify::new()],
            gates: [Notify::new(), Notify::new()],
        }
    }

    pub fn succeeding() -> Self {
        Self::with_mode(Mode::Succeed)
    }

    pub fn failing() -> Self {
        Self::with_mode(Mode::Fail)
    }

    pub fn gate_first() -> Self {
        Self::with_mode(Mode::GateFirst)
    }

    pub fn gate_two_first_fails() -> Self {
        Self::with_mode(Mode::GateTwoFirstFails)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wait until the first gated invocation is inside the engine.
    pub async fn wait_entered(&self) {
        self.wait_entered_call(0).await;
    }

    pub fn release(&self) {
        self.release_call(0);
    }

    /// Wait until invocation `n` (0 or 1) is parked inside the engine.
    pub async fn wait_entered_call(&self, n: usize) {
        self.entered[n].notified().await;
    }

    pub fn release_call(&self, n: usize) {
        self.gates[n].notify_one();
    }

    async fn park(&self, n: usize) {
        self.entered[n].notify_one();
        self.gates[n].notified().await;
    }
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    async fn invoke(
        &self,
        input: &Path,
        output: &Path,
        _profile: Profile,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(cb) = &progress {
            cb(0.5);
        }

        match self.mode {
            Mode::Fail => return Err(Error::tool("ffmpeg", "exit status 1: invalid data")),
            Mode::GateFirst if n == 0 => self.park(0).await,
            Mode::GateTwoFirstFails if n < 2 => {
                self.park(n).await;
                if n == 0 {
                    return Err(Error::tool("ffmpeg", "exit status 1: invalid data"));
                }
            }
            _ => {}
        }

        let mut data = TRANSCODED_PREFIX.to_vec();
        data.extend(tokio::fs::read(input).await?);
        tokio::fs::write(output, data).await?;
        if let Some(cb) = &progress {
            cb(1.0);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// TestHarness
// ---------------------------------------------------------------------------

pub struct TestHarness {
    pub ctx: WorkerContext,
    pub engine: Arc<FakeEngine>,
    pub blobs: Arc<LocalBlobStore>,
    pub dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_engine(FakeEngine::succeeding())
    }

    pub fn with_engine(engine: FakeEngine) -> Self {
        Self::build(engine, |_| {})
    }

    /// Build with config tweaks applied on top of [`test_config`].
    pub fn build(engine: FakeEngine, tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir");
        let mut config = test_config(dir.path());
        tweak(&mut config);
        std::fs::create_dir_all(&config.worker.work_dir).expect("failed to create work dir");

        let db = init_memory_pool().expect("failed to create in-memory pool");
        let (work, dead) = SqliteQueue::pair_from_config(db.clone(), &config.queue);
        let blobs = Arc::new(LocalBlobStore::from_config(&config.storage));
        let engine = Arc::new(engine);

        let ctx = WorkerContext {
            db,
            queue: Arc::new(work),
            dead_letters: Arc::new(dead),
            blobs: blobs.clone(),
            engine: engine.clone(),
            config_source: Arc::new(StaticConfigSource::with_preset(
                config.transcode.default_preset.clone(),
            )),
            event_bus: Arc::new(EventBus::default()),
            config: Arc::new(config),
        };

        Self {
            ctx,
            engine,
            blobs,
            dir,
        }
    }

    pub fn conn(&self) -> PooledConnection {
        self.ctx.conn().expect("failed to get connection")
    }

    pub fn job(&self, owner: &str, job_id: JobId) -> Job {
        cf_db::queries::jobs::get_job(&self.conn(), owner, job_id).expect("job should exist")
    }

    /// Upload a small fake video for `owner` and admit a job for it.
    pub async fn upload(&self, owner: &str, file_name: &str) -> JobId {
        producer::upload_and_enqueue(
            &self.ctx,
            owner,
            file_name,
            "video/mp4",
            Bytes::from_static(b"fake-video-bytes"),
        )
        .await
        .expect("upload should be admitted")
    }

    /// Lease the next work message without waiting.
    pub async fn receive_one(&self) -> Option<Delivery> {
        self.ctx
            .queue
            .receive(1, Duration::ZERO, self.ctx.config.queue.visibility_timeout())
            .await
            .expect("receive should succeed")
            .pop()
    }

    /// Receive and process the next work message, if any.
    pub async fn process_next(&self) -> Option<Outcome> {
        let delivery = self.receive_one().await?;
        Some(process_delivery(&self.ctx, &delivery).await)
    }

    /// Messages left on the work queue, leased or not.
    pub async fn work_queue_len(&self) -> u64 {
        let depth = self.ctx.queue.depth().await.expect("depth");
        depth.visible + depth.in_flight
    }

    pub async fn dead_letter_len(&self) -> u64 {
        let depth = self.ctx.dead_letters.depth().await.expect("depth");
        depth.visible + depth.in_flight
    }

    /// Entries left in the worker scratch directory.
    pub fn work_dir_entries(&self) -> usize {
        std::fs::read_dir(&self.ctx.config.worker.work_dir)
            .map(|rd| rd.count())
            .unwrap_or(0)
    }
}
