//! Job admission and operator actions.
//!
//! Admission creates the `QUEUED` record first and enqueues second. If the
//! enqueue fails the record is removed again, so a client never sees a job
//! that no worker will ever pick up.

use std::path::Path;

use bytes::Bytes;

use cf_core::events::EventPayload;
use cf_core::{Caller, Error, JobId, JobState, QueueMessage, Result, Transition};
use cf_db::models::{Job, NewJob};
use cf_db::queries::jobs;

use crate::context::WorkerContext;

fn validate_owner(owner: &str) -> Result<()> {
    if owner.trim().is_empty() {
        return Err(Error::Validation("owner is required".into()));
    }
    Ok(())
}

/// Create a job for an already-stored source and put it on the work queue.
pub async fn enqueue_job(ctx: &WorkerContext, owner: &str, source_ref: &str) -> Result<JobId> {
    validate_owner(owner)?;
    cf_blob::validate_key(source_ref)?;
    let job = admit(ctx, owner, JobId::new(), NewJob::new(source_ref)).await?;
    Ok(job.job_id)
}

/// Store an uploaded video at `raw/{job_id}.{ext}` and admit a job for it.
///
/// Only `video/*` content is accepted. The stored source is removed again if
/// admission fails.
pub async fn upload_and_enqueue(
    ctx: &WorkerContext,
    owner: &str,
    file_name: &str,
    content_type: &str,
    data: Bytes,
) -> Result<JobId> {
    validate_owner(owner)?;
    if !content_type.starts_with("video/") {
        return Err(Error::Validation(format!(
            "only video uploads are accepted, got {content_type}"
        )));
    }
    if data.is_empty() {
        return Err(Error::Validation("uploaded file is empty".into()));
    }

    let job_id = JobId::new();
    let source_ref = format!("raw/{job_id}.{}", upload_extension(content_type, file_name));
    ctx.blobs.put(&source_ref, data, content_type).await?;

    let new = NewJob {
        source_ref: source_ref.clone(),
        original_name: Some(file_name.to_string()).filter(|n| !n.is_empty()),
    };
    match admit(ctx, owner, job_id, new).await {
        Ok(job) => Ok(job.job_id),
        Err(e) => {
            if let Err(cleanup) = ctx.blobs.delete(&source_ref).await {
                tracing::warn!(key = %source_ref, "Failed to remove orphaned upload: {cleanup}");
            }
            Err(e)
        }
    }
}

/// Operator action: put a `FAILED` job back on the queue.
///
/// The message goes out before the record is reset, so a failed enqueue
/// leaves the job `FAILED` and the action can simply be retried. A worker
/// may pick the message up before the reset lands; `FAILED` is a valid
/// starting state for it.
pub async fn requeue_job(ctx: &WorkerContext, owner: &str, job_id: JobId) -> Result<Job> {
    let job = {
        let conn = ctx.conn()?;
        jobs::get_job(&conn, owner, job_id)?
    };
    if !Transition::Requeue.permits(job.state) {
        return Err(Error::PreconditionFailed {
            current: job.state,
            attempted: Transition::Requeue.name().to_string(),
        });
    }

    let msg = QueueMessage::new(owner, job_id, &job.source_ref);
    ctx.queue.enqueue(&msg).await.inspect_err(|e| {
        tracing::error!(job_id = %job_id, owner, "Requeue failed, job stays FAILED: {e}");
    })?;

    let conn = ctx.conn()?;
    let job = match jobs::transition(&conn, owner, job_id, &Transition::Requeue) {
        Ok(job) => job,
        Err(Error::PreconditionFailed { current, .. }) => {
            tracing::debug!(job_id = %job_id, owner, %current, "Requeued message picked up before reset");
            jobs::get_job(&conn, owner, job_id)?
        }
        Err(e) => return Err(e),
    };

    tracing::info!(job_id = %job_id, owner, "Job requeued");
    ctx.event_bus.broadcast(EventPayload::JobRequeued {
        owner_id: owner.to_string(),
        job_id,
    });
    Ok(job)
}

/// Admin action: remove a job's record and its stored blobs.
pub async fn delete_job(ctx: &WorkerContext, caller: &Caller, owner: &str, job_id: JobId) -> Result<()> {
    if !caller.is_admin() {
        return Err(Error::Forbidden("deleting jobs requires admin".into()));
    }

    let job = {
        let conn = ctx.conn()?;
        jobs::get_job(&conn, owner, job_id)?
    };
    if job.state == JobState::Processing {
        tracing::warn!(job_id = %job_id, owner, "Deleting a job that is being processed");
    }

    for key in std::iter::once(&job.source_ref).chain(job.output_ref.as_ref()) {
        if ctx.blobs.delete(key).await? {
            tracing::debug!(job_id = %job_id, key = %key, "Blob removed");
        }
    }

    let conn = ctx.conn()?;
    jobs::delete_job(&conn, owner, job_id)?;
    tracing::info!(job_id = %job_id, owner, "Job deleted by admin");
    Ok(())
}

/// Create the record, then enqueue; undo the record if the enqueue fails.
async fn admit(ctx: &WorkerContext, owner: &str, job_id: JobId, new: NewJob) -> Result<Job> {
    let job = {
        let conn = ctx.conn()?;
        jobs::create_job(&conn, owner, job_id, &new)?
    };

    let msg = QueueMessage::new(owner, job_id, &job.source_ref);
    if let Err(e) = ctx.queue.enqueue(&msg).await {
        tracing::error!(job_id = %job_id, owner, "Enqueue failed, removing job record: {e}");
        let conn = ctx.conn()?;
        jobs::delete_job(&conn, owner, job_id)?;
        return Err(e);
    }

    tracing::info!(job_id = %job_id, owner, source = %job.source_ref, "Job queued");
    ctx.event_bus.broadcast(EventPayload::JobQueued {
        owner_id: owner.to_string(),
        job_id,
    });
    Ok(job)
}

/// File extension for an upload, from its MIME type or else its file name.
fn upload_extension(content_type: &str, file_name: &str) -> String {
    let from_mime = match content_type.split(';').next().unwrap_or("").trim() {
        "video/mp4" => Some("mp4"),
        "video/quicktime" => Some("mov"),
        "video/x-matroska" => Some("mkv"),
        "video/webm" => Some("webm"),
        "video/x-msvideo" => Some("avi"),
        "video/mpeg" => Some("mpeg"),
        "video/x-flv" => Some("flv"),
        "video/3gpp" => Some("3gp"),
        _ => None,
    };
    if let Some(ext) = from_mime {
        return ext.to_string();
    }

    Path::new(file_name)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .filter(|e| !e.is_empty() && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "mp4".to_string())
}
