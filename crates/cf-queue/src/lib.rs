//! cf-queue: durable at-least-once work queue.
//!
//! A received message is leased, not removed: it stays hidden for the
//! visibility timeout and comes back if nobody acknowledges it. Each receive
//! hands out a fresh [`LeaseToken`]; only the most recent token can delete
//! the message. A queue with a [`RedrivePolicy`] moves messages that have
//! been received `max_receive_count` times to its dead-letter queue.

pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use cf_core::{MessageId, QueueMessage, Result};

pub use sqlite::SqliteQueue;

/// Largest batch a single receive may return.
pub const MAX_RECEIVE_BATCH: u32 = 10;

/// Proof of a specific delivery, required to acknowledge it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    pub message_id: MessageId,
    pub receipt: String,
}

/// One delivery of a message.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub token: LeaseToken,
    pub body: String,
    /// How many times this message has been received, this delivery included.
    pub receive_count: u32,
    /// Epoch millis when the message was first sent.
    pub sent_at: i64,
    /// For dead-lettered messages, the queue they were moved from.
    pub source_queue: Option<String>,
    /// For dead-lettered messages, how often the source queue delivered them.
    pub source_receive_count: Option<u32>,
}

impl Delivery {
    pub fn message_id(&self) -> MessageId {
        self.token.message_id
    }

    /// Decode the body as a job envelope.
    pub fn envelope(&self) -> Result<QueueMessage> {
        QueueMessage::from_body(&self.body)
    }
}

/// Result of acknowledging a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The message was removed from the queue.
    Deleted,
    /// The token no longer matches: the message was already deleted or was
    /// delivered again after this lease expired. Nothing was removed.
    Stale,
}

/// Where exhausted messages go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedrivePolicy {
    pub dead_letter_queue: String,
    pub max_receive_count: u32,
}

/// Approximate number of messages in a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    /// Ready to be received.
    pub visible: u64,
    /// Leased and not yet acknowledged.
    pub in_flight: u64,
}

/// A named durable queue.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    fn name(&self) -> &str;

    /// Append a raw message body.
    async fn send(&self, body: &str) -> Result<MessageId>;

    /// Append a job envelope.
    async fn enqueue(&self, message: &QueueMessage) -> Result<MessageId> {
        let body = message.to_body()?;
        self.send(&body).await
    }

    /// Lease up to `max` visible messages, waiting up to `wait` for the
    /// first one to arrive. Returns an empty batch when the wait elapses.
    async fn receive(
        &self,
        max: u32,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Delete the message leased by `token`. Never fails for stale tokens.
    async fn acknowledge(&self, token: &LeaseToken) -> Result<AckOutcome>;

    async fn depth(&self) -> Result<QueueDepth>;
}
