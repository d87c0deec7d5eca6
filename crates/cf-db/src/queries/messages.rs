//! Queue message table operations.
//!
//! All named queues share `queue_messages`. A message is *visible* when
//! `visible_at <= now`; receiving it pushes `visible_at` forward by the
//! visibility timeout and rotates its receipt. All times are epoch millis.

use rusqlite::{Connection, OptionalExtension};
use cf_core::{Error, MessageId, Result};

use crate::models::QueueRow;

const COLS: &str = "seq, message_id, queue, body, sent_at, visible_at, receive_count,
    receipt, first_received_at, source_queue, source_receive_count";

fn collect_rows(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::types::ToSql],
) -> Result<Vec<QueueRow>> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::database(e.to_string()))?;
    let mut rows = stmt
        .query_map(params, QueueRow::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    // RETURNING gives no ordering guarantee.
    rows.sort_by_key(|r| r.seq);
    Ok(rows)
}

/// Append a message to `queue`, visible immediately.
pub fn insert_message(conn: &Connection, queue: &str, body: &str, now_ms: i64) -> Result<MessageId> {
    let id = MessageId::new();
    conn.execute(
        "INSERT INTO queue_messages (message_id, queue, body, sent_at, visible_at)
         VALUES (?1, ?2, ?3, ?4, ?4)",
        rusqlite::params![id.to_string(), queue, body, now_ms],
    )
    .map_err(|e| Error::database(e.to_string()))?;
    Ok(id)
}

/// Move visible messages that already used up their deliveries to the
/// dead-letter queue.
///
/// The moved message keeps its id and body, records where it came from and
/// how often it was received there, and starts over with a zero count.
pub fn redrive_exhausted(
    conn: &Connection,
    queue: &str,
    dead_letter_queue: &str,
    max_receive_count: u32,
    now_ms: i64,
) -> Result<Vec<QueueRow>> {
    let q = format!(
        "UPDATE queue_messages
         SET queue = ?1,
             source_queue = queue,
             source_receive_count = receive_count,
             receive_count = 0,
             receipt = NULL,
             first_received_at = NULL,
             visible_at = ?2
         WHERE queue = ?3 AND visible_at <= ?2 AND receive_count >= ?4
         RETURNING {COLS}"
    );
    collect_rows(
        conn,
        &q,
        rusqlite::params![dead_letter_queue, now_ms, queue, max_receive_count],
    )
}

/// Lease up to `max` visible messages from `queue`, oldest first.
///
/// Each leased message gets a fresh receipt, an incremented receive count,
/// and stays hidden until `now_ms + visibility_ms`.
pub fn lease_visible(
    conn: &Connection,
    queue: &str,
    max: u32,
    now_ms: i64,
    visibility_ms: i64,
) -> Result<Vec<QueueRow>> {
    let q = format!(
        "UPDATE queue_messages
         SET receive_count = receive_count + 1,
             receipt = lower(hex(randomblob(16))),
             visible_at = ?1 + ?2,
             first_received_at = COALESCE(first_received_at, ?1)
         WHERE seq IN (
             SELECT seq FROM queue_messages
             WHERE queue = ?3 AND visible_at <= ?1
             ORDER BY seq ASC
             LIMIT ?4
         )
         RETURNING {COLS}"
    );
    collect_rows(conn, &q, rusqlite::params![now_ms, visibility_ms, queue, max])
}

/// Delete a message if `receipt` is still its current receipt.
///
/// Returns `false` when the message is gone or was received again since.
pub fn delete_leased(conn: &Connection, message_id: MessageId, receipt: &str) -> Result<bool> {
    let n = conn
        .execute(
            "DELETE FROM queue_messages WHERE message_id = ?1 AND receipt = ?2",
            rusqlite::params![message_id.to_string(), receipt],
        )
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(n > 0)
}

/// Drop messages in `queue` sent before `cutoff_ms`. Returns the count.
pub fn purge_expired(conn: &Connection, queue: &str, cutoff_ms: i64) -> Result<usize> {
    conn.execute(
        "DELETE FROM queue_messages WHERE queue = ?1 AND sent_at < ?2",
        rusqlite::params![queue, cutoff_ms],
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Visible and in-flight message counts for `queue`.
pub fn queue_counts(conn: &Connection, queue: &str, now_ms: i64) -> Result<(u64, u64)> {
    conn.query_row(
        "SELECT
             COALESCE(SUM(CASE WHEN visible_at <= ?2 THEN 1 ELSE 0 END), 0),
             COALESCE(SUM(CASE WHEN visible_at >  ?2 THEN 1 ELSE 0 END), 0)
         FROM queue_messages WHERE queue = ?1",
        rusqlite::params![queue, now_ms],
        |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)? as u64)),
    )
    .map_err(|e| Error::database(e.to_string()))
}

/// Fetch a message by id regardless of visibility.
pub fn get_message(conn: &Connection, message_id: MessageId) -> Result<Option<QueueRow>> {
    let q = format!("SELECT {COLS} FROM queue_messages WHERE message_id = ?1");
    conn.query_row(&q, [message_id.to_string()], QueueRow::from_row)
        .optional()
        .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;

    const VIS: i64 = 1_000;

    #[test]
    fn lease_hides_until_visibility_expires() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = insert_message(&conn, "work", "a", 100).unwrap();

        let leased = lease_visible(&conn, "work", 1, 100, VIS).unwrap();
        assert_eq!(leased.len(), 1);
        assert_eq!(leased[0].message_id, id);
        assert_eq!(leased[0].receive_count, 1);
        assert_eq!(leased[0].first_received_at, Some(100));
        assert!(leased[0].receipt.is_some());

        assert!(lease_visible(&conn, "work", 1, 100 + VIS - 1, VIS).unwrap().is_empty());

        let again = lease_visible(&conn, "work", 1, 100 + VIS, VIS).unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].receive_count, 2);
        assert_eq!(again[0].first_received_at, Some(100));
        assert_ne!(again[0].receipt, leased[0].receipt);
    }

    #[test]
    fn lease_is_fifo_and_bounded() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let ids: Vec<MessageId> = (0..5)
            .map(|i| insert_message(&conn, "work", &format!("m{i}"), 0).unwrap())
            .collect();

        let first = lease_visible(&conn, "work", 3, 0, VIS).unwrap();
        let got: Vec<MessageId> = first.iter().map(|r| r.message_id).collect();
        assert_eq!(got, ids[..3]);

        let rest = lease_visible(&conn, "work", 10, 0, VIS).unwrap();
        assert_eq!(rest.len(), 2);
    }

    #[test]
    fn queues_are_separate() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_message(&conn, "work", "a", 0).unwrap();
        assert!(lease_visible(&conn, "other", 10, 0, VIS).unwrap().is_empty());
    }

    #[test]
    fn delete_requires_current_receipt() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = insert_message(&conn, "work", "a", 0).unwrap();
        let first = lease_visible(&conn, "work", 1, 0, 0).unwrap().remove(0);
        let second = lease_visible(&conn, "work", 1, 0, VIS).unwrap().remove(0);

        let stale = first.receipt.unwrap();
        let current = second.receipt.unwrap();
        assert!(!delete_leased(&conn, id, &stale).unwrap());
        assert!(get_message(&conn, id).unwrap().is_some());

        assert!(delete_leased(&conn, id, &current).unwrap());
        assert!(get_message(&conn, id).unwrap().is_none());
        // Deleting twice is a no-op.
        assert!(!delete_leased(&conn, id, &current).unwrap());
    }

    #[test]
    fn redrive_moves_only_exhausted_visible_messages() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let id = insert_message(&conn, "work", "a", 0).unwrap();
        let fresh = insert_message(&conn, "work", "b", 0).unwrap();

        // Receive `a` twice; `b` once.
        lease_visible(&conn, "work", 1, 0, 0).unwrap();
        lease_visible(&conn, "work", 2, 0, 0).unwrap();

        let moved = redrive_exhausted(&conn, "work", "dlq", 2, 10).unwrap();
        assert_eq!(moved.len(), 1);
        let row = &moved[0];
        assert_eq!(row.message_id, id);
        assert_eq!(row.queue, "dlq");
        assert_eq!(row.source_queue.as_deref(), Some("work"));
        assert_eq!(row.source_receive_count, Some(2));
        assert_eq!(row.receive_count, 0);
        assert!(row.receipt.is_none());

        assert_eq!(get_message(&conn, fresh).unwrap().unwrap().queue, "work");
    }

    #[test]
    fn redrive_skips_in_flight_messages() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_message(&conn, "work", "a", 0).unwrap();
        lease_visible(&conn, "work", 1, 0, VIS).unwrap();

        assert!(redrive_exhausted(&conn, "work", "dlq", 1, 10).unwrap().is_empty());
        assert_eq!(redrive_exhausted(&conn, "work", "dlq", 1, VIS).unwrap().len(), 1);
    }

    #[test]
    fn counts_and_purge() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        insert_message(&conn, "work", "old", 0).unwrap();
        insert_message(&conn, "work", "new", 500).unwrap();
        lease_visible(&conn, "work", 1, 600, VIS).unwrap();

        assert_eq!(queue_counts(&conn, "work", 600).unwrap(), (1, 1));
        assert_eq!(queue_counts(&conn, "empty", 600).unwrap(), (0, 0));

        assert_eq!(purge_expired(&conn, "work", 100).unwrap(), 1);
        assert_eq!(queue_counts(&conn, "work", 600).unwrap(), (1, 0));
    }
}
