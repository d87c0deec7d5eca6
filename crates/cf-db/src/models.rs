//! Rust structs mapping to database tables.
//!
//! Each model implements `from_row` for constructing itself from a
//! `rusqlite::Row` selected with the owning query module's column list.

use cf_core::{DeadLetterId, JobId, JobState, MessageId, StatusView};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

fn conversion_err(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

/// Parse a UUID-based ID from a text column.
fn parse_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    let uuid = Uuid::parse_str(&s).map_err(|e| conversion_err(idx, e))?;
    Ok(T::from(uuid))
}

fn parse_opt_id<T: From<Uuid>>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    match s {
        Some(v) => {
            let uuid = Uuid::parse_str(&v).map_err(|e| conversion_err(idx, e))?;
            Ok(Some(T::from(uuid)))
        }
        None => Ok(None),
    }
}

fn parse_state(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<JobState> {
    let s: String = row.get(idx)?;
    s.parse().map_err(|e| conversion_err(idx, e))
}

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Initial fields supplied when a job is admitted.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub source_ref: String,
    pub original_name: Option<String>,
}

impl NewJob {
    pub fn new(source_ref: impl Into<String>) -> Self {
        Self {
            source_ref: source_ref.into(),
            original_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub owner_id: String,
    pub job_id: JobId,
    pub source_ref: String,
    pub output_ref: Option<String>,
    pub state: JobState,
    pub profile: Option<String>,
    pub original_name: Option<String>,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Job {
    /// Build from a row selected as all columns in table order.
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            owner_id: row.get(0)?,
            job_id: parse_id(row, 1)?,
            source_ref: row.get(2)?,
            output_ref: row.get(3)?,
            state: parse_state(row, 4)?,
            profile: row.get(5)?,
            original_name: row.get(6)?,
            attempt_count: row.get(7)?,
            last_error: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    /// Project to the client-facing status view.
    pub fn status_view(&self) -> StatusView {
        StatusView {
            job_id: self.job_id,
            state: self.state,
            output_available: self.state == JobState::Completed && self.output_ref.is_some(),
            error: match self.state {
                JobState::Failed => self.last_error.clone(),
                _ => None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// QueueRow
// ---------------------------------------------------------------------------

/// A message as stored in `queue_messages`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRow {
    pub seq: i64,
    pub message_id: MessageId,
    pub queue: String,
    pub body: String,
    pub sent_at: i64,
    pub visible_at: i64,
    pub receive_count: u32,
    pub receipt: Option<String>,
    pub first_received_at: Option<i64>,
    pub source_queue: Option<String>,
    pub source_receive_count: Option<u32>,
}

impl QueueRow {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            message_id: parse_id(row, 1)?,
            queue: row.get(2)?,
            body: row.get(3)?,
            sent_at: row.get(4)?,
            visible_at: row.get(5)?,
            receive_count: row.get(6)?,
            receipt: row.get(7)?,
            first_received_at: row.get(8)?,
            source_queue: row.get(9)?,
            source_receive_count: row.get(10)?,
        })
    }
}

// ---------------------------------------------------------------------------
// DeadLetter
// ---------------------------------------------------------------------------

/// Fields persisted when the drain inspects a dead-lettered message.
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
    pub message_id: MessageId,
    pub queue: String,
    pub source_queue: Option<String>,
    pub owner_id: Option<String>,
    pub job_id: Option<JobId>,
    pub body: String,
    pub receive_count: u32,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub message_id: MessageId,
    pub queue: String,
    pub source_queue: Option<String>,
    pub owner_id: Option<String>,
    pub job_id: Option<JobId>,
    pub body: String,
    pub receive_count: u32,
    pub action: String,
    pub recorded_at: String,
}

impl DeadLetter {
    pub fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: parse_id(row, 0)?,
            message_id: parse_id(row, 1)?,
            queue: row.get(2)?,
            source_queue: row.get(3)?,
            owner_id: row.get(4)?,
            job_id: parse_opt_id(row, 5)?,
            body: row.get(6)?,
            receive_count: row.get(7)?,
            action: row.get(8)?,
            recorded_at: row.get(9)?,
        })
    }
}
