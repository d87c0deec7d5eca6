//! Read-side queries for polling clients and operators.
//!
//! Nothing here writes. Callers see whatever the job store holds at the
//! moment of the read.

use std::time::Duration;

use cf_blob::SignedLink;
use cf_core::{Caller, Error, JobId, JobState, Result, StatusView};
use cf_db::models::Job;
use cf_db::queries::jobs;

use crate::context::WorkerContext;

/// Status of one of the caller's jobs.
///
/// `job_id` is taken as the client sent it; an id that is not a UUID simply
/// names no job.
pub fn get_job_status(ctx: &WorkerContext, owner: &str, job_id: &str) -> Result<StatusView> {
    let id: JobId = job_id
        .parse()
        .map_err(|_| Error::not_found("job", format!("{owner}/{job_id}")))?;
    let conn = ctx.conn()?;
    Ok(jobs::get_job(&conn, owner, id)?.status_view())
}

/// The caller's jobs, oldest first.
pub fn list_jobs(ctx: &WorkerContext, owner: &str) -> Result<Vec<Job>> {
    let conn = ctx.conn()?;
    jobs::list_jobs(&conn, owner)
}

/// Every job across all owners. Admin only.
pub fn admin_list_jobs(ctx: &WorkerContext, caller: &Caller) -> Result<Vec<Job>> {
    let conn = ctx.conn()?;
    jobs::admin_list_jobs(&conn, caller)
}

/// Signed download link for a job: the output once completed, otherwise the
/// uploaded source.
pub fn download_link(
    ctx: &WorkerContext,
    owner: &str,
    job_id: JobId,
    ttl: Duration,
) -> Result<SignedLink> {
    let job = {
        let conn = ctx.conn()?;
        jobs::get_job(&conn, owner, job_id)?
    };
    let key = match (&job.state, &job.output_ref) {
        (JobState::Completed, Some(output)) => output,
        _ => &job.source_ref,
    };
    ctx.blobs.presign(key, ttl)
}
