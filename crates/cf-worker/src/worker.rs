//! The worker loop.
//!
//! Turns one leased message into one job state write. Delivery is
//! at-least-once, so every step tolerates having run before: a `COMPLETED`
//! job is acknowledged without touching the engine, the output key is
//! deterministic, and the final write is a compare-and-set that a slower
//! duplicate simply loses. Failure writes are also fenced on the attempt
//! number, so an attempt whose lease was taken over cannot fail the job
//! under the attempt that replaced it.
//!
//! Acknowledgement policy:
//!
//! | Result                                   | Job write  | Ack           |
//! |------------------------------------------|------------|---------------|
//! | transcode + upload succeeded             | COMPLETED  | yes           |
//! | job already COMPLETED / race lost        | none       | yes           |
//! | attempt superseded by a newer one        | none       | withheld      |
//! | source blob missing                      | FAILED     | yes           |
//! | engine, storage, or store failure        | FAILED     | withheld      |
//! | malformed envelope / no such job record  | none       | dead-lettered |
//!
//! Withheld messages come back after the visibility timeout and are moved to
//! the dead-letter queue once they reach the redrive limit. Messages that can
//! never be tied to a job are sent to the dead-letter queue at once.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use cf_av::{Profile, ProgressCallback, Workspace};
use cf_core::config::Config;
use cf_core::events::EventPayload;
use cf_core::job::output_key;
use cf_core::{Error, FailureClass, JobId, JobState, QueueMessage, Result, Transition};
use cf_db::models::Job;
use cf_db::queries::jobs;
use cf_queue::{AckOutcome, Delivery, MAX_RECEIVE_BATCH};

use crate::config_source::resolve_profile;
use crate::context::WorkerContext;

/// What happened to one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The job was transcoded and marked `COMPLETED`.
    Completed { output_ref: String },
    /// The job was already `COMPLETED`; the engine was not invoked.
    AlreadyCompleted,
    /// Another worker completed the job first; this attempt's result was
    /// discarded.
    RaceLost,
    /// The attempt failed and the job is `FAILED`. `retry` is true when the
    /// acknowledgement was withheld so the queue redelivers.
    Failed { error: String, retry: bool },
    /// A newer attempt took the job over while this one was running; its
    /// failure was dropped and the message left to the newer delivery.
    Superseded,
    /// The message could not be tied to a job and was moved to the
    /// dead-letter queue.
    Rejected { reason: String },
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Outcome::Completed { .. }
                | Outcome::AlreadyCompleted
                | Outcome::RaceLost
                | Outcome::Superseded
        )
    }
}

fn batch_size(config: &Config) -> u32 {
    u32::try_from(config.worker.batch_size)
        .unwrap_or(MAX_RECEIVE_BATCH)
        .clamp(1, MAX_RECEIVE_BATCH)
}

/// Run one worker until `cancel` fires.
///
/// Cancellation stops new receives; a transcode already running is awaited
/// to completion. Leased messages left unprocessed in the current batch are
/// redelivered after their visibility timeout.
pub async fn run_worker(ctx: WorkerContext, worker_id: usize, cancel: CancellationToken) {
    let queue_cfg = &ctx.config.queue;
    let batch = batch_size(&ctx.config);

    tracing::info!(worker_id, queue = ctx.queue.name(), batch, "Worker started");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let received = tokio::select! {
            r = ctx.queue.receive(batch, queue_cfg.wait_time(), queue_cfg.visibility_timeout()) => r,
            _ = cancel.cancelled() => break,
        };

        match received {
            Ok(deliveries) => {
                let total = deliveries.len();
                for (i, delivery) in deliveries.iter().enumerate() {
                    if cancel.is_cancelled() {
                        tracing::info!(
                            worker_id,
                            left = total - i,
                            "Shutting down; leaving leased messages for redelivery"
                        );
                        break;
                    }
                    let outcome = process_delivery(&ctx, delivery).await;
                    tracing::debug!(worker_id, message_id = %delivery.message_id(), ?outcome, "Delivery processed");
                }
            }
            Err(e) => {
                tracing::error!(worker_id, "Receive failed: {e}");
                tokio::select! {
                    _ = tokio::time::sleep(ctx.config.worker.error_backoff()) => {}
                    _ = cancel.cancelled() => break,
                }
            }
        }
    }

    tracing::info!(worker_id, "Worker stopped");
}

/// Receive a single batch (waiting up to the configured long-poll time) and
/// process it.
pub async fn run_once(ctx: &WorkerContext) -> Result<Vec<Outcome>> {
    let queue_cfg = &ctx.config.queue;
    let batch = batch_size(&ctx.config);
    let deliveries = ctx
        .queue
        .receive(batch, queue_cfg.wait_time(), queue_cfg.visibility_timeout())
        .await?;

    let mut outcomes = Vec::with_capacity(deliveries.len());
    for delivery in &deliveries {
        outcomes.push(process_delivery(ctx, delivery).await);
    }
    Ok(outcomes)
}

/// Process one delivery. Never returns an error: every failure ends in a
/// job state write or a deliberate decision not to acknowledge.
pub async fn process_delivery(ctx: &WorkerContext, delivery: &Delivery) -> Outcome {
    let msg = match delivery.envelope() {
        Ok(msg) => msg,
        Err(e) => return reject(ctx, delivery, format!("unreadable message: {e}")).await,
    };
    let owner = msg.owner_id.as_str();
    let job_id = msg.job_id;

    let job = match load_job(ctx, owner, job_id) {
        Ok(Some(job)) => job,
        Ok(None) => {
            return reject(ctx, delivery, format!("job {owner}/{job_id} does not exist")).await;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, owner, "Job store unavailable: {e}");
            return Outcome::Failed {
                error: e.to_string(),
                retry: true,
            };
        }
    };

    if job.state == JobState::Completed {
        tracing::info!(job_id = %job_id, owner, "Job already completed; skipping duplicate delivery");
        acknowledge(ctx, delivery).await;
        return Outcome::AlreadyCompleted;
    }

    let profile = resolve_profile(
        ctx.config_source.as_ref(),
        &ctx.config.transcode.default_preset,
    )
    .await;

    let job = match start_attempt(ctx, &job, profile) {
        Ok(job) => job,
        Err(e) if e.is_race_lost() => {
            tracing::info!(job_id = %job_id, owner, "Job completed concurrently; skipping");
            acknowledge(ctx, delivery).await;
            return Outcome::AlreadyCompleted;
        }
        Err(e @ Error::NotFound { .. }) => return reject(ctx, delivery, e.to_string()).await,
        Err(e) => {
            tracing::error!(job_id = %job_id, owner, "Could not start job: {e}");
            return Outcome::Failed {
                error: e.to_string(),
                retry: true,
            };
        }
    };

    tracing::info!(
        job_id = %job_id,
        owner,
        attempt = job.attempt_count,
        %profile,
        "Processing job"
    );
    ctx.event_bus.broadcast(EventPayload::JobStarted {
        owner_id: owner.to_string(),
        job_id,
        attempt: job.attempt_count,
    });

    let attempt = job.attempt_count;
    match run_attempt(ctx, &job, profile).await {
        Ok(output_ref) => finish_success(ctx, delivery, &msg, attempt, output_ref).await,
        Err(e) => finish_failure(ctx, delivery, &msg, attempt, e).await,
    }
}

/// Move a message that names no job straight to the dead-letter queue. If
/// that fails the message is left for the redrive limit to catch.
async fn reject(ctx: &WorkerContext, delivery: &Delivery, reason: String) -> Outcome {
    match ctx.dead_letters.send(&delivery.body).await {
        Ok(dead_id) => {
            tracing::warn!(
                message_id = %delivery.message_id(),
                %dead_id,
                receive_count = delivery.receive_count,
                "Message cannot be processed; moved to dead-letter queue: {reason}"
            );
            acknowledge(ctx, delivery).await;
        }
        Err(e) => {
            tracing::error!(
                message_id = %delivery.message_id(),
                "Could not dead-letter message ({reason}); leaving it for redelivery: {e}"
            );
        }
    }
    Outcome::Rejected { reason }
}

fn load_job(ctx: &WorkerContext, owner: &str, job_id: JobId) -> Result<Option<Job>> {
    let conn = ctx.conn()?;
    jobs::find_job(&conn, owner, job_id)
}

/// Move the job into `PROCESSING`, taking it over if a previous lease on it
/// expired mid-flight.
fn start_attempt(ctx: &WorkerContext, job: &Job, profile: Profile) -> Result<Job> {
    let conn = ctx.conn()?;
    let start = Transition::ToProcessing {
        profile: profile.as_str().to_string(),
    };

    match jobs::transition(&conn, &job.owner_id, job.job_id, &start) {
        Err(Error::PreconditionFailed {
            current: JobState::Processing,
            ..
        }) => {
            tracing::warn!(
                job_id = %job.job_id,
                owner = %job.owner_id,
                "Job still PROCESSING from an expired lease; reclaiming"
            );
            let reclaim = Transition::Reclaim {
                profile: profile.as_str().to_string(),
            };
            jobs::transition(&conn, &job.owner_id, job.job_id, &reclaim)
        }
        other => other,
    }
}

/// Download, transcode, upload. The workspace is removed on every path.
async fn run_attempt(ctx: &WorkerContext, job: &Job, profile: Profile) -> Result<String> {
    let workspace = Workspace::new(&ctx.config.worker.work_dir, job.job_id, &job.source_ref)?;
    let result = transcode_in(ctx, &workspace, job, profile).await;
    if let Err(e) = workspace.close() {
        tracing::warn!(job_id = %job.job_id, "Workspace cleanup failed: {e}");
    }
    result
}

async fn transcode_in(
    ctx: &WorkerContext,
    workspace: &Workspace,
    job: &Job,
    profile: Profile,
) -> Result<String> {
    let input = workspace.input();
    let output = workspace.output();
    let job_id = job.job_id;

    let bytes = ctx.blobs.download_to(&job.source_ref, &input).await?;
    tracing::debug!(job_id = %job_id, source = %job.source_ref, bytes, "Source downloaded");

    let bus = Arc::clone(&ctx.event_bus);
    let progress: ProgressCallback = Arc::new(move |progress| {
        bus.broadcast(EventPayload::JobProgress { job_id, progress });
    });
    ctx.engine.invoke(&input, &output, profile, Some(progress)).await?;

    let key = output_key(job_id, profile.as_str());
    let stored = ctx.blobs.put_file(&key, &output, "video/mp4").await?;
    tracing::debug!(job_id = %job_id, key = %stored.key, size = stored.size, "Output uploaded");
    Ok(stored.key)
}

async fn finish_success(
    ctx: &WorkerContext,
    delivery: &Delivery,
    msg: &QueueMessage,
    attempt: u32,
    output_ref: String,
) -> Outcome {
    let owner = msg.owner_id.as_str();
    let job_id = msg.job_id;
    let completed = Transition::ToCompleted {
        output_ref: output_ref.clone(),
    };

    let written = ctx
        .conn()
        .and_then(|conn| jobs::transition(&conn, owner, job_id, &completed));

    match written {
        Ok(_) => {
            tracing::info!(job_id = %job_id, owner, output = %output_ref, "Job completed");
            ctx.event_bus.broadcast(EventPayload::JobCompleted {
                owner_id: owner.to_string(),
                job_id,
                output_ref: output_ref.clone(),
            });
            acknowledge(ctx, delivery).await;
            Outcome::Completed { output_ref }
        }
        Err(e) if e.is_race_lost() => {
            tracing::info!(job_id = %job_id, owner, "Another worker completed the job first; discarding result");
            acknowledge(ctx, delivery).await;
            Outcome::RaceLost
        }
        Err(e) => {
            finish_failure(
                ctx,
                delivery,
                msg,
                attempt,
                Error::Internal(format!("failed to record completion: {e}")),
            )
            .await
        }
    }
}

async fn finish_failure(
    ctx: &WorkerContext,
    delivery: &Delivery,
    msg: &QueueMessage,
    attempt: u32,
    error: Error,
) -> Outcome {
    let owner = msg.owner_id.as_str();
    let job_id = msg.job_id;
    let class = error.class();
    let message = error.to_string();

    let failed = Transition::ToFailed {
        error: message.clone(),
    };
    let written = ctx
        .conn()
        .and_then(|conn| jobs::transition_for_attempt(&conn, owner, job_id, attempt, &failed));

    match written {
        Ok(_) => {
            ctx.event_bus.broadcast(EventPayload::JobFailed {
                owner_id: owner.to_string(),
                job_id,
                error: message.clone(),
            });
        }
        Err(e) if e.is_race_lost() => {
            tracing::info!(job_id = %job_id, owner, "Job completed by another worker while this attempt failed");
            acknowledge(ctx, delivery).await;
            return Outcome::RaceLost;
        }
        Err(e) if e.is_superseded() => {
            tracing::info!(
                job_id = %job_id,
                owner,
                attempt,
                "Attempt taken over by a newer one; dropping its failure: {message}"
            );
            return Outcome::Superseded;
        }
        Err(e) => {
            tracing::error!(job_id = %job_id, owner, "Could not record failure: {e}");
        }
    }

    if class == FailureClass::NotFound {
        tracing::warn!(job_id = %job_id, owner, "Job failed permanently: {message}");
        acknowledge(ctx, delivery).await;
        return Outcome::Failed {
            error: message,
            retry: false,
        };
    }

    tracing::warn!(
        job_id = %job_id,
        owner,
        receive_count = delivery.receive_count,
        ?class,
        "Job attempt failed; leaving message for redelivery: {message}"
    );
    Outcome::Failed {
        error: message,
        retry: true,
    }
}

async fn acknowledge(ctx: &WorkerContext, delivery: &Delivery) {
    match ctx.queue.acknowledge(&delivery.token).await {
        Ok(AckOutcome::Deleted) => {}
        Ok(AckOutcome::Stale) => {
            tracing::debug!(
                message_id = %delivery.message_id(),
                "Lease was superseded; newer delivery owns the message"
            );
        }
        Err(e) => {
            tracing::warn!(
                message_id = %delivery.message_id(),
                "Acknowledge failed; message will be redelivered: {e}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_is_clamped() {
        let mut config = Config::default();
        config.worker.batch_size = 0;
        assert_eq!(batch_size(&config), 1);
        config.worker.batch_size = 4;
        assert_eq!(batch_size(&config), 4);
        config.worker.batch_size = 500;
        assert_eq!(batch_size(&config), MAX_RECEIVE_BATCH);
    }

    #[test]
    fn success_outcomes() {
        assert!(Outcome::Completed {
            output_ref: "processed/x_720p.mp4".into()
        }
        .is_success());
        assert!(Outcome::AlreadyCompleted.is_success());
        assert!(Outcome::RaceLost.is_success());
        assert!(Outcome::Superseded.is_success());
        assert!(!Outcome::Failed {
            error: "boom".into(),
            retry: true
        }
        .is_success());
        assert!(!Outcome::Rejected {
            reason: "bad".into()
        }
        .is_success());
    }
}
