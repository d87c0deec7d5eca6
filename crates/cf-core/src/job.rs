//! Job domain types: lifecycle states, the closed set of transitions, the
//! queue envelope, and the client-facing status projection.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ids::JobId;

// ---------------------------------------------------------------------------
// JobState
// ---------------------------------------------------------------------------

/// Lifecycle state of a transcode job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 4] = [
        JobState::Queued,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
    ];

    /// Column / wire representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Queued => "QUEUED",
            JobState::Processing => "PROCESSING",
            JobState::Completed => "COMPLETED",
            JobState::Failed => "FAILED",
        }
    }

    /// `COMPLETED` and `FAILED` are terminal from a client's point of view.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "QUEUED" => Ok(JobState::Queued),
            "PROCESSING" => Ok(JobState::Processing),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            other => Err(Error::Validation(format!("unknown job state: {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Transition
// ---------------------------------------------------------------------------

/// A conditional state change applied by the job store.
///
/// Each variant carries its own allowed-from set; the store applies it with a
/// compare-and-set and reports [`Error::PreconditionFailed`] otherwise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// A worker starts processing a fresh or previously failed job.
    ToProcessing { profile: String },
    /// A worker takes over a job whose previous lease expired mid-flight.
    Reclaim { profile: String },
    /// The transcode finished and the output was uploaded.
    ToCompleted { output_ref: String },
    /// The attempt failed; redelivery decides what happens next.
    ToFailed { error: String },
    /// Operator puts a failed job back in line.
    Requeue,
}

impl Transition {
    /// States from which this transition may be applied.
    pub fn allowed_from(&self) -> &'static [JobState] {
        match self {
            Transition::ToProcessing { .. } => &[JobState::Queued, JobState::Failed],
            Transition::Reclaim { .. } => &[JobState::Processing],
            Transition::ToCompleted { .. } => &[JobState::Processing],
            Transition::ToFailed { .. } => &[JobState::Processing],
            Transition::Requeue => &[JobState::Failed],
        }
    }

    /// State the job is in after the transition applies.
    pub fn target(&self) -> JobState {
        match self {
            Transition::ToProcessing { .. } | Transition::Reclaim { .. } => JobState::Processing,
            Transition::ToCompleted { .. } => JobState::Completed,
            Transition::ToFailed { .. } => JobState::Failed,
            Transition::Requeue => JobState::Queued,
        }
    }

    /// Short name used in logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Transition::ToProcessing { .. } => "to_processing",
            Transition::Reclaim { .. } => "reclaim",
            Transition::ToCompleted { .. } => "to_completed",
            Transition::ToFailed { .. } => "to_failed",
            Transition::Requeue => "requeue",
        }
    }

    /// Whether the transition starts a new processing attempt.
    pub fn starts_attempt(&self) -> bool {
        matches!(
            self,
            Transition::ToProcessing { .. } | Transition::Reclaim { .. }
        )
    }

    pub fn permits(&self, current: JobState) -> bool {
        self.allowed_from().contains(&current)
    }
}

// ---------------------------------------------------------------------------
// Caller
// ---------------------------------------------------------------------------

/// Identity of whoever is asking the store for data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Caller {
    /// A regular client acting on its own jobs.
    Owner(String),
    /// A privileged operator.
    Admin,
}

impl Caller {
    pub fn is_admin(&self) -> bool {
        matches!(self, Caller::Admin)
    }
}

// ---------------------------------------------------------------------------
// QueueMessage
// ---------------------------------------------------------------------------

/// Envelope placed on the work queue for every job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub owner_id: String,
    pub job_id: JobId,
    pub source_ref: String,
    pub enqueued_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(owner_id: impl Into<String>, job_id: JobId, source_ref: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            job_id,
            source_ref: source_ref.into(),
            enqueued_at: Utc::now(),
        }
    }

    /// Serialize to the queue body format.
    pub fn to_body(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::Internal(format!("failed to encode queue message: {e}")))
    }

    /// Parse a queue body, rejecting anything that is not a full envelope.
    pub fn from_body(body: &str) -> Result<Self> {
        let msg: Self = serde_json::from_str(body)
            .map_err(|e| Error::Validation(format!("malformed queue message: {e}")))?;
        if msg.owner_id.is_empty() || msg.source_ref.is_empty() {
            return Err(Error::Validation(
                "queue message is missing owner_id or source_ref".into(),
            ));
        }
        Ok(msg)
    }
}

// ---------------------------------------------------------------------------
// StatusView
// ---------------------------------------------------------------------------

/// Read-only projection of a job returned to polling clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub output_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Deterministic output key for a job rendered with a preset.
///
/// Retries write to the same key so a partially uploaded output is simply
/// overwritten.
pub fn output_key(job_id: JobId, preset: &str) -> String {
    format!("processed/{job_id}_{preset}.mp4")
}
