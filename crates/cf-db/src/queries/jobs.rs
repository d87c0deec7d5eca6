//! Job store operations.
//!
//! The store is the authority on job state. Every state change goes through
//! [`transition`], a single conditional `UPDATE` that only applies when the
//! row is in one of the transition's allowed source states.

use std::collections::BTreeMap;

use rusqlite::types::ToSql;
use rusqlite::{Connection, OptionalExtension};
use cf_core::{Caller, Error, JobId, JobState, Result, Transition};

use crate::models::{Job, NewJob};
use crate::now_timestamp;

const COLS: &str = "owner_id, job_id, source_ref, output_ref, state, profile,
    original_name, attempt_count, last_error, created_at, updated_at";

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Admit a new job in `QUEUED` state.
///
/// Fails with [`Error::AlreadyExists`] if `(owner_id, job_id)` is taken.
pub fn create_job(conn: &Connection, owner_id: &str, job_id: JobId, new: &NewJob) -> Result<Job> {
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO jobs (owner_id, job_id, source_ref, original_name, state,
                           attempt_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
        rusqlite::params![
            owner_id,
            job_id.to_string(),
            new.source_ref,
            new.original_name,
            JobState::Queued.as_str(),
            &now
        ],
    )
    .map_err(|e| {
        if is_constraint_violation(&e) {
            Error::already_exists("job", format!("{owner_id}/{job_id}"))
        } else {
            Error::database(e.to_string())
        }
    })?;

    Ok(Job {
        owner_id: owner_id.to_string(),
        job_id,
        source_ref: new.source_ref.clone(),
        output_ref: None,
        state: JobState::Queued,
        profile: None,
        original_name: new.original_name.clone(),
        attempt_count: 0,
        last_error: None,
        created_at: now.clone(),
        updated_at: now,
    })
}

/// Look up a job, returning `None` when it does not exist.
pub fn find_job(conn: &Connection, owner_id: &str, job_id: JobId) -> Result<Option<Job>> {
    let q = format!("SELECT {COLS} FROM jobs WHERE owner_id = ?1 AND job_id = ?2");
    conn.query_row(&q, rusqlite::params![owner_id, job_id.to_string()], Job::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

/// Get a job or [`Error::NotFound`].
pub fn get_job(conn: &Connection, owner_id: &str, job_id: JobId) -> Result<Job> {
    find_job(conn, owner_id, job_id)?
        .ok_or_else(|| Error::not_found("job", format!("{owner_id}/{job_id}")))
}

/// Apply a transition with compare-and-set semantics.
///
/// Returns the updated job. When the row exists but is not in one of
/// `transition.allowed_from()`, returns [`Error::PreconditionFailed`] carrying
/// the state that blocked the write.
pub fn transition(
    conn: &Connection,
    owner_id: &str,
    job_id: JobId,
    transition: &Transition,
) -> Result<Job> {
    apply(conn, owner_id, job_id, transition, None)
}

/// Apply a transition on behalf of one processing attempt.
///
/// Like [`transition`], but the write only lands while the job is still on
/// `attempt`. If a newer attempt has taken the job over, returns
/// [`Error::Superseded`]; a `COMPLETED` job still reports
/// [`Error::PreconditionFailed`].
pub fn transition_for_attempt(
    conn: &Connection,
    owner_id: &str,
    job_id: JobId,
    attempt: u32,
    transition: &Transition,
) -> Result<Job> {
    apply(conn, owner_id, job_id, transition, Some(attempt))
}

fn apply(
    conn: &Connection,
    owner_id: &str,
    job_id: JobId,
    transition: &Transition,
    attempt: Option<u32>,
) -> Result<Job> {
    let now = now_timestamp();
    let target = transition.target();

    let mut params: Vec<Box<dyn ToSql>> = vec![Box::new(target.as_str()), Box::new(now)];

    let extra = match transition {
        Transition::ToProcessing { profile } | Transition::Reclaim { profile } => {
            params.push(Box::new(profile.clone()));
            ", profile = ?, last_error = NULL, attempt_count = attempt_count + 1"
        }
        Transition::ToCompleted { output_ref } => {
            params.push(Box::new(output_ref.clone()));
            ", output_ref = ?, last_error = NULL"
        }
        Transition::ToFailed { error } => {
            params.push(Box::new(error.clone()));
            ", last_error = ?"
        }
        Transition::Requeue => ", last_error = NULL",
    };

    params.push(Box::new(owner_id.to_string()));
    params.push(Box::new(job_id.to_string()));

    let allowed = transition.allowed_from();
    for state in allowed {
        params.push(Box::new(state.as_str()));
    }
    let placeholders = vec!["?"; allowed.len()].join(", ");

    let fence = match attempt {
        Some(n) => {
            params.push(Box::new(n));
            " AND attempt_count = ?"
        }
        None => "",
    };

    let q = format!(
        "UPDATE jobs SET state = ?, updated_at = ?{extra}
         WHERE owner_id = ? AND job_id = ? AND state IN ({placeholders}){fence}
         RETURNING {COLS}"
    );

    let params_refs: Vec<&dyn ToSql> = params.iter().map(|b| b.as_ref()).collect();
    let updated = conn
        .query_row(&q, params_refs.as_slice(), Job::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))?;

    match updated {
        Some(job) => Ok(job),
        None => {
            let current = get_job(conn, owner_id, job_id)?;
            match attempt {
                Some(attempt)
                    if current.state != JobState::Completed && current.attempt_count != attempt =>
                {
                    return Err(Error::Superseded {
                        attempt,
                        current: current.attempt_count,
                    });
                }
                _ => {}
            }
            Err(Error::PreconditionFailed {
                current: current.state,
                attempted: transition.name().to_string(),
            })
        }
    }
}

/// List one owner's jobs, oldest first.
pub fn list_jobs(conn: &Connection, owner_id: &str) -> Result<Vec<Job>> {
    let q = format!(
        "SELECT {COLS} FROM jobs WHERE owner_id = ?1
         ORDER BY created_at ASC, rowid ASC"
    );
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([owner_id], Job::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// List every job in the store. Admin callers only.
pub fn admin_list_jobs(conn: &Connection, caller: &Caller) -> Result<Vec<Job>> {
    if !caller.is_admin() {
        return Err(Error::Forbidden("listing all jobs requires admin".into()));
    }

    let q = format!("SELECT {COLS} FROM jobs ORDER BY created_at ASC, rowid ASC");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], Job::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

/// Remove a job record. Returns `false` if it did not exist.
pub fn delete_job(conn: &Connection, owner_id: &str, job_id: JobId) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM jobs WHERE owner_id = ?1 AND job_id = ?2",
            rusqlite::params![owner_id, job_id.to_string()],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Number of jobs per state, with every state present (zero if empty).
pub fn count_by_state(conn: &Connection) -> Result<BTreeMap<JobState, u64>> {
    let mut counts: BTreeMap<JobState, u64> = JobState::ALL.iter().map(|s| (*s, 0)).collect();

    let mut stmt = conn
        .prepare("SELECT state, COUNT(*) FROM jobs GROUP BY state")
        .map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;

    for (state, n) in rows {
        counts.insert(state.parse()?, n as u64);
    }
    Ok(counts)
}
