//! Unified error type for clipforge.
//!
//! All crates funnel their failures into [`Error`]. The worker decides what to
//! do with a failure (acknowledge, withhold, suppress) from its
//! [`FailureClass`], obtained via [`Error::class`].

use std::fmt;

use crate::job::JobState;

/// Unified error type covering all failure modes in clipforge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity could not be found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of entity (e.g. "job", "blob").
        entity: String,
        /// The identifier that was looked up.
        id: String,
    },

    /// An entity with the same key already exists.
    #[error("{entity} already exists: {id}")]
    AlreadyExists {
        /// The kind of entity.
        entity: String,
        /// The conflicting identifier.
        id: String,
    },

    /// A conditional state transition did not apply because the job was not
    /// in one of the allowed source states.
    #[error("Precondition failed: cannot apply {attempted} while job is {current}")]
    PreconditionFailed {
        /// State observed when the write was rejected.
        current: JobState,
        /// Name of the transition that was attempted.
        attempted: String,
    },

    /// A terminal write from a processing attempt that has since been taken
    /// over by a newer one.
    #[error("Attempt {attempt} superseded: job is on attempt {current}")]
    Superseded {
        /// Attempt that tried to write.
        attempt: u32,
        /// Attempt recorded on the job.
        current: u32,
    },

    /// Request data failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The caller lacks permission for the requested action.
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// A database operation failed.
    #[error("Database error: {source}")]
    Database {
        /// The underlying database error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// An I/O operation failed.
    #[error("IO error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// A work queue operation failed.
    #[error("Queue error [{queue}]: {message}")]
    Queue {
        /// Name of the queue.
        queue: String,
        /// Human-readable error description.
        message: String,
    },

    /// A blob storage operation failed.
    #[error("Storage error [{key}]: {message}")]
    Storage {
        /// Object key involved in the failure.
        key: String,
        /// Human-readable error description.
        message: String,
    },

    /// An external tool (ffmpeg) returned an error.
    #[error("Tool error [{tool}]: {message}")]
    Tool {
        /// Name of the tool that failed.
        tool: String,
        /// Human-readable error description.
        message: String,
    },

    /// Configuration could not be loaded or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// Catch-all for unexpected internal errors.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Retry classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Bad input; rejected before enqueue and never retried.
    Validation,
    /// Storage, queue, or store hiccup; retried through redelivery.
    Transient,
    /// The transcode engine reported a failure; retried until dead-lettered.
    Transcode,
    /// Another worker already completed the job; treated as success.
    RaceLost,
    /// Missing job or source; terminal.
    NotFound,
    /// A newer attempt owns the job; this attempt's result is dropped.
    Superseded,
}

impl Error {
    /// Classify this error for retry decisions.
    pub fn class(&self) -> FailureClass {
        match self {
            Error::Validation(_) | Error::Forbidden(_) | Error::AlreadyExists { .. } => {
                FailureClass::Validation
            }
            Error::NotFound { .. } => FailureClass::NotFound,
            Error::PreconditionFailed {
                current: JobState::Completed,
                ..
            } => FailureClass::RaceLost,
            Error::Superseded { .. } => FailureClass::Superseded,
            Error::Tool { .. } => FailureClass::Transcode,
            Error::PreconditionFailed { .. }
            | Error::Database { .. }
            | Error::Io { .. }
            | Error::Queue { .. }
            | Error::Storage { .. }
            | Error::Config(_)
            | Error::Internal(_) => FailureClass::Transient,
        }
    }

    /// Whether this error means another worker already finished the job.
    pub fn is_race_lost(&self) -> bool {
        self.class() == FailureClass::RaceLost
    }

    pub fn is_superseded(&self) -> bool {
        self.class() == FailureClass::Superseded
    }

    /// Convenience constructor for [`Error::NotFound`].
    pub fn not_found(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::NotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::AlreadyExists`].
    pub fn already_exists(entity: impl Into<String>, id: impl fmt::Display) -> Self {
        Error::AlreadyExists {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    /// Convenience constructor for [`Error::Database`].
    pub fn database(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Error::Database {
            source: source.into(),
        }
    }

    /// Convenience constructor for [`Error::Queue`].
    pub fn queue(queue: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Queue {
            queue: queue.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Storage`].
    pub fn storage(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Storage {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Convenience constructor for [`Error::Tool`].
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }
}

/// Result alias using the crate-level [`Error`].
pub type Result<T> = std::result::Result<T, Error>;
