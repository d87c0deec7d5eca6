//! [`WorkQueue`] backed by the `queue_messages` table.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use cf_core::config::QueueConfig;
use cf_core::{Error, MessageId, Result};
use cf_db::models::QueueRow;
use cf_db::pool::DbPool;
use cf_db::queries::messages;

use crate::{AckOutcome, Delivery, LeaseToken, QueueDepth, RedrivePolicy, WorkQueue, MAX_RECEIVE_BATCH};

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

/// SQLite-backed queue.
///
/// Several processes may share one database file; each polls the table.
/// Within a process, [`send`](WorkQueue::send) wakes a waiting receiver
/// immediately instead of at the next poll.
pub struct SqliteQueue {
    pool: DbPool,
    name: String,
    redrive: Option<RedrivePolicy>,
    retention: Option<Duration>,
    poll_interval: Duration,
    notify: Arc<Notify>,
}

impl SqliteQueue {
    pub fn new(pool: DbPool, name: impl Into<String>) -> Self {
        Self {
            pool,
            name: name.into(),
            redrive: None,
            retention: None,
            poll_interval: Duration::from_millis(250),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Build the work queue and its dead-letter queue from configuration.
    pub fn pair_from_config(pool: DbPool, config: &QueueConfig) -> (SqliteQueue, SqliteQueue) {
        let work = SqliteQueue::new(pool.clone(), &config.work_queue)
            .with_redrive(RedrivePolicy {
                dead_letter_queue: config.dead_letter_queue.clone(),
                max_receive_count: config.max_receive_count,
            })
            .with_retention(config.retention())
            .with_poll_interval(config.poll_interval());
        let dead = SqliteQueue::new(pool, &config.dead_letter_queue)
            .with_retention(config.retention())
            .with_poll_interval(config.poll_interval());
        (work, dead)
    }

    /// One non-blocking receive attempt inside a single transaction.
    fn try_receive(&self, max: u32, visibility: Duration) -> Result<Vec<Delivery>> {
        let now = cf_db::now_millis();
        let conn = cf_db::pool::get_conn(&self.pool)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::queue(&self.name, e.to_string()))?;

        if let Some(retention) = self.retention {
            let purged = messages::purge_expired(&tx, &self.name, now - millis(retention))?;
            if purged > 0 {
                tracing::warn!(queue = %self.name, purged, "Dropped messages past retention");
            }
        }

        if let Some(policy) = &self.redrive {
            let moved = messages::redrive_exhausted(
                &tx,
                &self.name,
                &policy.dead_letter_queue,
                policy.max_receive_count,
                now,
            )?;
            for row in &moved {
                tracing::warn!(
                    queue = %self.name,
                    dead_letter_queue = %policy.dead_letter_queue,
                    message_id = %row.message_id,
                    receive_count = row.source_receive_count.unwrap_or_default(),
                    "Message exhausted its deliveries, moved to dead-letter queue"
                );
            }
        }

        let rows = messages::lease_visible(&tx, &self.name, max, now, millis(visibility))?;
        tx.commit().map_err(|e| Error::queue(&self.name, e.to_string()))?;

        rows.into_iter().map(delivery_from_row).collect()
    }
}

fn delivery_from_row(row: QueueRow) -> Result<Delivery> {
    let receipt = row
        .receipt
        .ok_or_else(|| Error::queue(&row.queue, format!("leased message {} has no receipt", row.message_id)))?;
    Ok(Delivery {
        token: LeaseToken {
            message_id: row.message_id,
            receipt,
        },
        body: row.body,
        receive_count: row.receive_count,
        sent_at: row.sent_at,
        source_queue: row.source_queue,
        source_receive_count: row.source_receive_count,
    })
}

#[async_trait]
impl WorkQueue for SqliteQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, body: &str) -> Result<MessageId> {
        let conn = cf_db::pool::get_conn(&self.pool)?;
        let id = messages::insert_message(&conn, &self.name, body, cf_db::now_millis())?;
        drop(conn);
        tracing::debug!(queue = %self.name, message_id = %id, "Message sent");
        self.notify.notify_one();
        Ok(id)
    }

    async fn receive(
        &self,
        max: u32,
        wait: Duration,
        visibility: Duration,
    ) -> Result<Vec<Delivery>> {
        if max == 0 || max > MAX_RECEIVE_BATCH {
            return Err(Error::Validation(format!(
                "receive batch must be between 1 and {MAX_RECEIVE_BATCH}, got {max}"
            )));
        }

        let deadline = Instant::now() + wait;
        loop {
            let batch = self.try_receive(max, visibility)?;
            if !batch.is_empty() {
                tracing::debug!(queue = %self.name, count = batch.len(), "Received messages");
                return Ok(batch);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let nap = self.poll_interval.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn acknowledge(&self, token: &LeaseToken) -> Result<AckOutcome> {
        let conn = cf_db::pool::get_conn(&self.pool)?;
        if messages::delete_leased(&conn, token.message_id, &token.receipt)? {
            tracing::debug!(queue = %self.name, message_id = %token.message_id, "Message acknowledged");
            Ok(AckOutcome::Deleted)
        } else {
            tracing::debug!(
                queue = %self.name,
                message_id = %token.message_id,
                "Stale acknowledgement ignored"
            );
            Ok(AckOutcome::Stale)
        }
    }

    async fn depth(&self) -> Result<QueueDepth> {
        let conn = cf_db::pool::get_conn(&self.pool)?;
        let (visible, in_flight) = messages::queue_counts(&conn, &self.name, cf_db::now_millis())?;
        Ok(QueueDepth { visible, in_flight })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cf_core::{JobId, QueueMessage};
    use cf_db::pool::init_memory_pool;

    const NO_WAIT: Duration = Duration::ZERO;
    const LONG: Duration = Duration::from_secs(900);

    fn queues(max_receive_count: u32) -> (SqliteQueue, SqliteQueue) {
        let pool = init_memory_pool().unwrap();
        let config = QueueConfig {
            max_receive_count,
            poll_interval_ms: 10,
            ..QueueConfig::default()
        };
        SqliteQueue::pair_from_config(pool, &config)
    }

    #[tokio::test]
    async fn send_receive_ack() {
        let (work, _) = queues(3);
        let msg = QueueMessage::new("u1", JobId::new(), "raw/a.mp4");
        let id = work.enqueue(&msg).await.unwrap();

        let batch = work.receive(1, NO_WAIT, LONG).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id(), id);
        assert_eq!(batch[0].receive_count, 1);
        assert_eq!(batch[0].envelope().unwrap(), msg);

        assert_eq!(work.depth().await.unwrap(), QueueDepth { visible: 0, in_flight: 1 });
        assert_eq!(work.acknowledge(&batch[0].token).await.unwrap(), AckOutcome::Deleted);
        assert_eq!(work.depth().await.unwrap(), QueueDepth::default());
    }

    #[tokio::test]
    async fn unacknowledged_message_is_redelivered_with_new_token() {
        let (work, _) = queues(5);
        work.send("m").await.unwrap();

        let first = work.receive(1, NO_WAIT, Duration::ZERO).await.unwrap().remove(0);
        let second = work.receive(1, NO_WAIT, LONG).await.unwrap().remove(0);
        assert_eq!(first.message_id(), second.message_id());
        assert_eq!(second.receive_count, 2);
        assert_ne!(first.token, second.token);

        // Hidden while leased.
        assert!(work.receive(1, NO_WAIT, LONG).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn stale_token_does_not_delete() {
        let (work, _) = queues(5);
        work.send("m").await.unwrap();
        let first = work.receive(1, NO_WAIT, Duration::ZERO).await.unwrap().remove(0);
        let second = work.receive(1, NO_WAIT, LONG).await.unwrap().remove(0);

        assert_eq!(work.acknowledge(&first.token).await.unwrap(), AckOutcome::Stale);
        assert_eq!(work.depth().await.unwrap().in_flight, 1);

        assert_eq!(work.acknowledge(&second.token).await.unwrap(), AckOutcome::Deleted);
        // Repeated ack is harmless.
        assert_eq!(work.acknowledge(&second.token).await.unwrap(), AckOutcome::Stale);
    }

    #[tokio::test]
    async fn dead_letters_after_exactly_max_receives() {
        let (work, dead) = queues(3);
        let id = work.send("poison").await.unwrap();

        for n in 1..=3 {
            let batch = work.receive(1, NO_WAIT, Duration::ZERO).await.unwrap();
            assert_eq!(batch.len(), 1, "delivery {n} should happen");
            assert_eq!(batch[0].receive_count, n);
        }

        assert!(work.receive(1, NO_WAIT, LONG).await.unwrap().is_empty());

        let batch = dead.receive(10, NO_WAIT, LONG).await.unwrap();
        assert_eq!(batch.len(), 1);
        let d = &batch[0];
        assert_eq!(d.message_id(), id);
        assert_eq!(d.body, "poison");
        assert_eq!(d.receive_count, 1);
        assert_eq!(d.source_queue.as_deref(), Some("transcode"));
        assert_eq!(d.source_receive_count, Some(3));
    }

    #[tokio::test]
    async fn acknowledged_message_never_dead_letters() {
        let (work, dead) = queues(1);
        work.send("ok").await.unwrap();
        let d = work.receive(1, NO_WAIT, Duration::ZERO).await.unwrap().remove(0);
        work.acknowledge(&d.token).await.unwrap();

        assert!(work.receive(1, NO_WAIT, LONG).await.unwrap().is_empty());
        assert!(dead.receive(1, NO_WAIT, LONG).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn batch_is_bounded_and_validated() {
        let (work, _) = queues(3);
        for i in 0..12 {
            work.send(&format!("m{i}")).await.unwrap();
        }
        assert_eq!(work.receive(10, NO_WAIT, LONG).await.unwrap().len(), 10);
        assert_eq!(work.receive(10, NO_WAIT, LONG).await.unwrap().len(), 2);

        assert!(matches!(
            work.receive(0, NO_WAIT, LONG).await.unwrap_err(),
            Error::Validation(_)
        ));
        assert!(work.receive(11, NO_WAIT, LONG).await.is_err());
    }

    #[tokio::test]
    async fn long_poll_returns_when_message_arrives() {
        let (work, _) = queues(3);
        let work = Arc::new(work);

        let sender = Arc::clone(&work);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            sender.send("late").await.unwrap();
        });

        let started = std::time::Instant::now();
        let batch = work.receive(1, Duration::from_secs(5), LONG).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn long_poll_times_out_empty() {
        let (work, _) = queues(3);
        let started = std::time::Instant::now();
        let batch = work.receive(1, Duration::from_millis(60), LONG).await.unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn expired_messages_are_dropped() {
        let pool = init_memory_pool().unwrap();
        let work = SqliteQueue::new(pool, "short").with_retention(Duration::ZERO);
        work.send("gone").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(work.receive(1, NO_WAIT, LONG).await.unwrap().is_empty());
        assert_eq!(work.depth().await.unwrap(), QueueDepth::default());
    }
}
