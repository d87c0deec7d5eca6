//! Dead-letter drain.
//!
//! Reads the dead-letter queue, records every message in the
//! `dead_letters` table, and then either just acknowledges it or puts it
//! back on the work queue. A message whose record could not be written is
//! left on the dead-letter queue for the next drain.

use std::time::Duration;

use serde::Serialize;

use cf_core::events::EventPayload;
use cf_core::{Error, JobState, Result, Transition};
use cf_db::models::{DeadLetter, NewDeadLetter};
use cf_db::queries::{dead_letters, jobs};
use cf_queue::{AckOutcome, Delivery, MAX_RECEIVE_BATCH};

use crate::context::WorkerContext;

/// How long a drain waits for the first dead-lettered message.
const DRAIN_WAIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrainMode {
    /// Record and acknowledge.
    #[default]
    Inspect,
    /// Record, reset the job, send the body back to the work queue, and
    /// acknowledge.
    Requeue,
}

impl DrainMode {
    /// Action string persisted with each record.
    pub fn action(self) -> &'static str {
        match self {
            DrainMode::Inspect => "logged",
            DrainMode::Requeue => "requeued",
        }
    }
}

/// Tally of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub received: usize,
    pub recorded: usize,
    pub requeued: usize,
    /// Left on the dead-letter queue because a step failed.
    pub retained: usize,
}

/// Drain up to `batch_size` messages from the dead-letter queue.
pub async fn drain(ctx: &WorkerContext, batch_size: u32, mode: DrainMode) -> Result<DrainReport> {
    let batch = batch_size.clamp(1, MAX_RECEIVE_BATCH);
    let deliveries = ctx
        .dead_letters
        .receive(batch, DRAIN_WAIT, ctx.config.queue.visibility_timeout())
        .await?;

    let mut report = DrainReport {
        received: deliveries.len(),
        ..DrainReport::default()
    };

    for delivery in &deliveries {
        match drain_one(ctx, delivery, mode).await {
            Ok(requeued) => {
                report.recorded += 1;
                if requeued {
                    report.requeued += 1;
                }
            }
            Err(e) => {
                tracing::error!(
                    message_id = %delivery.message_id(),
                    "Dead-letter left in place: {e}"
                );
                report.retained += 1;
            }
        }
    }

    if report.received > 0 {
        tracing::info!(
            received = report.received,
            recorded = report.recorded,
            requeued = report.requeued,
            retained = report.retained,
            "Dead-letter drain finished"
        );
    }
    Ok(report)
}

/// Record one message and dispose of it. Returns whether it was requeued.
async fn drain_one(ctx: &WorkerContext, delivery: &Delivery, mode: DrainMode) -> Result<bool> {
    let envelope = delivery.envelope().ok();
    // Unreadable bodies would only bounce straight back; never requeue them.
    let mode = match (mode, &envelope) {
        (DrainMode::Requeue, None) => DrainMode::Inspect,
        (mode, _) => mode,
    };

    let record = NewDeadLetter {
        message_id: delivery.message_id(),
        queue: ctx.dead_letters.name().to_string(),
        source_queue: delivery.source_queue.clone(),
        owner_id: envelope.as_ref().map(|m| m.owner_id.clone()),
        job_id: envelope.as_ref().map(|m| m.job_id),
        body: delivery.body.clone(),
        receive_count: delivery.source_receive_count.unwrap_or(delivery.receive_count),
        action: mode.action().to_string(),
    };
    let stored = {
        let conn = ctx.conn()?;
        dead_letters::insert_dead_letter(&conn, &record)?
    };
    log_dead_letter(ctx, &stored);
    ctx.event_bus.broadcast(EventPayload::MessageDeadLettered {
        message_id: stored.message_id,
        job_id: stored.job_id,
    });

    if mode == DrainMode::Requeue {
        // Reset the job before the send can wake a worker.
        let reset = envelope.as_ref().map(|msg| {
            ctx.conn().and_then(|conn| {
                jobs::transition(&conn, &msg.owner_id, msg.job_id, &Transition::Requeue)
            })
        });
        ctx.queue.send(&delivery.body).await?;

        if let (Some(msg), Some(reset)) = (&envelope, reset) {
            match reset {
                Ok(_) => {
                    ctx.event_bus.broadcast(EventPayload::JobRequeued {
                        owner_id: msg.owner_id.clone(),
                        job_id: msg.job_id,
                    });
                }
                Err(Error::PreconditionFailed { current, .. }) => {
                    tracing::debug!(job_id = %msg.job_id, %current, "Job left as is on requeue");
                }
                Err(e) => {
                    tracing::warn!(job_id = %msg.job_id, "Could not reset job on requeue: {e}");
                }
            }
        }
    }

    if ctx.dead_letters.acknowledge(&delivery.token).await? == AckOutcome::Stale {
        tracing::debug!(message_id = %delivery.message_id(), "Dead-letter already acknowledged");
    }
    Ok(mode == DrainMode::Requeue)
}

fn log_dead_letter(ctx: &WorkerContext, record: &DeadLetter) {
    let state = match (&record.owner_id, record.job_id) {
        (Some(owner), Some(job_id)) => ctx
            .conn()
            .and_then(|conn| jobs::find_job(&conn, owner, job_id))
            .ok()
            .flatten()
            .map(|job| job.state),
        _ => None,
    };

    tracing::warn!(
        message_id = %record.message_id,
        job_id = ?record.job_id,
        owner = record.owner_id.as_deref().unwrap_or("-"),
        source_queue = record.source_queue.as_deref().unwrap_or("-"),
        receive_count = record.receive_count,
        job_state = state.as_ref().map(JobState::as_str).unwrap_or("unknown"),
        action = %record.action,
        "Dead-lettered message"
    );
}

/// Most recent drain records, newest first.
pub fn recent_dead_letters(ctx: &WorkerContext, limit: i64) -> Result<Vec<DeadLetter>> {
    let conn = ctx.conn()?;
    dead_letters::list_dead_letters(&conn, limit)
}
