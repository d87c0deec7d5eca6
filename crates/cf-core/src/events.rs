//! Job lifecycle event system.
//!
//! [`EventBus`] wraps a `tokio::sync::broadcast` channel with a bounded
//! ring-buffer of recent events so that late subscribers (the notifier, a
//! CLI tail) can catch up.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::ids::{JobId, MessageId};

/// Maximum number of events retained in the ring buffer.
const MAX_RECENT_EVENTS: usize = 100;

// ---------------------------------------------------------------------------
// EventPayload
// ---------------------------------------------------------------------------

/// Payload describing what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    JobQueued {
        owner_id: String,
        job_id: JobId,
    },
    JobStarted {
        owner_id: String,
        job_id: JobId,
        attempt: u32,
    },
    JobProgress {
        job_id: JobId,
        progress: f32,
    },
    JobCompleted {
        owner_id: String,
        job_id: JobId,
        output_ref: String,
    },
    JobFailed {
        owner_id: String,
        job_id: JobId,
        error: String,
    },
    JobRequeued {
        owner_id: String,
        job_id: JobId,
    },
    MessageDeadLettered {
        message_id: MessageId,
        job_id: Option<JobId>,
    },
}

impl EventPayload {
    /// The job this event concerns, if any.
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            EventPayload::JobQueued { job_id, .. }
            | EventPayload::JobStarted { job_id, .. }
            | EventPayload::JobProgress { job_id, .. }
            | EventPayload::JobCompleted { job_id, .. }
            | EventPayload::JobFailed { job_id, .. }
            | EventPayload::JobRequeued { job_id, .. } => Some(*job_id),
            EventPayload::MessageDeadLettered { job_id, .. } => *job_id,
        }
    }
}

/// An [`EventPayload`] stamped with an id and the time it was raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

// ---------------------------------------------------------------------------
// EventBus
// ---------------------------------------------------------------------------

/// In-process fan-out of lifecycle events.
///
/// Publishing never blocks and never fails: with no subscribers the event
/// only lands in the history ring.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: RwLock<VecDeque<Event>>,
}

impl EventBus {
    /// `capacity` bounds how far a slow subscriber may lag before it starts
    /// missing events. History is always [`MAX_RECENT_EVENTS`] deep.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            history: RwLock::new(VecDeque::with_capacity(MAX_RECENT_EVENTS)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Publish `payload` to every subscriber and record it in history.
    pub fn broadcast(&self, payload: EventPayload) {
        let event = Event::new(payload);

        {
            let mut history = self.history.write();
            history.truncate(MAX_RECENT_EVENTS - 1);
            history.push_front(event.clone());
        }

        // Err only means nobody is listening.
        let _ = self.tx.send(event);
    }

    /// Up to `n` events, newest first.
    pub fn recent_events(&self, n: usize) -> Vec<Event> {
        self.history.read().iter().take(n).cloned().collect()
    }

    /// Recorded events for one job, newest first.
    pub fn events_for_job(&self, job_id: JobId) -> Vec<Event> {
        self.history
            .read()
            .iter()
            .filter(|e| e.payload.job_id() == Some(job_id))
            .cloned()
            .collect()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
