//! Dead-letter inspection records.

use rusqlite::Connection;
use cf_core::{DeadLetterId, Error, Result};

use crate::models::{DeadLetter, NewDeadLetter};
use crate::now_timestamp;

const COLS: &str = "id, message_id, queue, source_queue, owner_id, job_id, body,
    receive_count, action, recorded_at";

/// Persist an inspection record for a dead-lettered message.
pub fn insert_dead_letter(conn: &Connection, new: &NewDeadLetter) -> Result<DeadLetter> {
    let id = DeadLetterId::new();
    let now = now_timestamp();

    conn.execute(
        "INSERT INTO dead_letters (id, message_id, queue, source_queue, owner_id, job_id,
                                   body, receive_count, action, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        rusqlite::params![
            id.to_string(),
            new.message_id.to_string(),
            new.queue,
            new.source_queue,
            new.owner_id,
            new.job_id.map(|j| j.to_string()),
            new.body,
            new.receive_count,
            new.action,
            &now,
        ],
    )
    .map_err(|e| Error::database(e.to_string()))?;

    Ok(DeadLetter {
        id,
        message_id: new.message_id,
        queue: new.queue.clone(),
        source_queue: new.source_queue.clone(),
        owner_id: new.owner_id.clone(),
        job_id: new.job_id,
        body: new.body.clone(),
        receive_count: new.receive_count,
        action: new.action.clone(),
        recorded_at: now,
    })
}

/// Most recent inspection records, newest first.
pub fn list_dead_letters(conn: &Connection, limit: i64) -> Result<Vec<DeadLetter>> {
    let q = format!("SELECT {COLS} FROM dead_letters ORDER BY recorded_at DESC, rowid DESC LIMIT ?1");
    let mut stmt = conn.prepare(&q).map_err(|e| Error::database(e.to_string()))?;
    let rows = stmt
        .query_map([limit], DeadLetter::from_row)
        .map_err(|e| Error::database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::database(e.to_string()))?;
    Ok(rows)
}

pub fn count_dead_letters(conn: &Connection) -> Result<i64> {
    conn.query_row("SELECT COUNT(*) FROM dead_letters", [], |row| row.get(0))
        .map_err(|e| Error::database(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::init_memory_pool;
    use cf_core::{JobId, MessageId};

    fn sample(action: &str) -> NewDeadLetter {
        NewDeadLetter {
            message_id: MessageId::new(),
            queue: "transcode-dlq".into(),
            source_queue: Some("transcode".into()),
            owner_id: Some("u1".into()),
            job_id: Some(JobId::new()),
            body: "{}".into(),
            receive_count: 3,
            action: action.into(),
        }
    }

    #[test]
    fn insert_and_list_newest_first() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let a = insert_dead_letter(&conn, &sample("logged")).unwrap();
        let b = insert_dead_letter(&conn, &sample("requeued")).unwrap();

        let listed = list_dead_letters(&conn, 10).unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, b.id);
        assert_eq!(listed[1], a);
        assert_eq!(count_dead_letters(&conn).unwrap(), 2);
        assert_eq!(list_dead_letters(&conn, 1).unwrap().len(), 1);
    }

    #[test]
    fn record_without_envelope_fields() {
        let pool = init_memory_pool().unwrap();
        let conn = pool.get().unwrap();
        let mut new = sample("logged");
        new.owner_id = None;
        new.job_id = None;
        new.body = "garbage".into();

        let rec = insert_dead_letter(&conn, &new).unwrap();
        let listed = list_dead_letters(&conn, 10).unwrap();
        assert_eq!(listed, vec![rec]);
        assert!(listed[0].job_id.is_none());
    }
}
