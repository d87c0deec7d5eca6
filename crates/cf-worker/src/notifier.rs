//! Logs user-visible job outcomes from the event bus.

use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;

use cf_core::events::{Event, EventPayload};

use crate::context::WorkerContext;

/// Follow the event bus until `cancel` fires.
pub async fn run_notifier(ctx: WorkerContext, cancel: CancellationToken) {
    let mut rx = ctx.event_bus.subscribe();
    tracing::debug!("Notifier started");

    loop {
        let event = tokio::select! {
            r = rx.recv() => r,
            _ = cancel.cancelled() => break,
        };
        match event {
            Ok(event) => notify(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Notifier fell behind; events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }

    tracing::debug!("Notifier stopped");
}

fn notify(event: &Event) {
    match &event.payload {
        EventPayload::JobCompleted {
            owner_id,
            job_id,
            output_ref,
        } => {
            tracing::info!(owner = %owner_id, job_id = %job_id, output = %output_ref, "Video ready");
        }
        EventPayload::JobFailed {
            owner_id,
            job_id,
            error,
        } => {
            tracing::info!(owner = %owner_id, job_id = %job_id, "Video attempt failed: {error}");
        }
        EventPayload::MessageDeadLettered { message_id, job_id } => {
            tracing::warn!(message_id = %message_id, job_id = ?job_id, "Job gave up after repeated failures");
        }
        _ => {}
    }
}
