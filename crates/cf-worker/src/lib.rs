//! cf-worker: the job lifecycle on top of the queue, store, blobs, and engine.
//!
//! This crate ties the other cf-* crates together. It provides:
//!
//! - Producer: admission (record first, then enqueue) and operator actions
//! - Worker loop: lease, transcode, compare-and-set the outcome, acknowledge
//! - Dead-letter drain: record exhausted messages, optionally requeue them
//! - Status reader and operator report
//! - Graceful shutdown via signal handling

pub mod config_source;
pub mod context;
pub mod dlq;
pub mod notifier;
pub mod producer;
pub mod report;
pub mod status;
pub mod worker;

use tokio_util::sync::CancellationToken;

use cf_core::config::Config;

pub use config_source::{ConfigSource, FileConfigSource, RemoteConfig, StaticConfigSource};
pub use context::WorkerContext;
pub use dlq::{DrainMode, DrainReport};
pub use worker::Outcome;

/// Run `worker.concurrency` worker loops plus the notifier until a shutdown
/// signal arrives.
///
/// Returns once every loop has stopped. Transcodes in progress at shutdown
/// are allowed to finish.
pub async fn start(config: Config) -> cf_core::Result<()> {
    WorkerContext::require_engine(&config)?;
    let ctx = WorkerContext::open(config)?;
    let cancel = CancellationToken::new();

    let notifier_handle = tokio::spawn(notifier::run_notifier(ctx.clone(), cancel.clone()));

    let concurrency = ctx.config.worker.concurrency;
    let worker_handles: Vec<_> = (0..concurrency)
        .map(|id| tokio::spawn(worker::run_worker(ctx.clone(), id, cancel.clone())))
        .collect();
    tracing::info!(
        concurrency,
        queue = ctx.queue.name(),
        dead_letter_queue = ctx.dead_letters.name(),
        "Workers running"
    );

    shutdown_signal(cancel.clone()).await;
    tracing::info!("Shutdown requested; waiting for workers to finish");
    cancel.cancel();

    for handle in worker_handles {
        if let Err(e) = handle.await {
            tracing::error!("Worker task failed: {e}");
        }
    }
    let _ = notifier_handle.await;

    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM) or cancellation.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = cancel.cancelled() => {},
    }
}
