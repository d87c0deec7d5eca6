//! Embedded SQL migrations and runner.
//!
//! Migrations are stored as `&str` constants and executed in order.  A
//! `schema_migrations` table tracks which versions have been applied.

use rusqlite::Connection;
use cf_core::{Error, Result};

/// V1: job store.
const V1_JOBS: &str = r#"
CREATE TABLE jobs (
    owner_id      TEXT NOT NULL,
    job_id        TEXT NOT NULL,
    source_ref    TEXT NOT NULL,
    output_ref    TEXT,
    state         TEXT NOT NULL DEFAULT 'QUEUED',
    profile       TEXT,
    original_name TEXT,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error    TEXT,
    created_at    TEXT NOT NULL,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (owner_id, job_id)
);

CREATE INDEX idx_jobs_owner_created ON jobs(owner_id, created_at);
CREATE INDEX idx_jobs_state         ON jobs(state);
"#;

/// V2: queue messages shared by every named queue (work and dead-letter).
///
/// Times are epoch milliseconds so visibility arithmetic stays in SQL.
const V2_QUEUE_MESSAGES: &str = r#"
CREATE TABLE queue_messages (
    seq                  INTEGER PRIMARY KEY AUTOINCREMENT,
    message_id           TEXT NOT NULL UNIQUE,
    queue                TEXT NOT NULL,
    body                 TEXT NOT NULL,
    sent_at              INTEGER NOT NULL,
    visible_at           INTEGER NOT NULL,
    receive_count        INTEGER NOT NULL DEFAULT 0,
    receipt              TEXT,
    first_received_at    INTEGER,
    source_queue         TEXT,
    source_receive_count INTEGER
);

CREATE INDEX idx_queue_messages_visible ON queue_messages(queue, visible_at);
"#;

/// V3: dead-letter inspection records.
const V3_DEAD_LETTERS: &str = r#"
CREATE TABLE dead_letters (
    id            TEXT PRIMARY KEY,
    message_id    TEXT NOT NULL,
    queue         TEXT NOT NULL,
    source_queue  TEXT,
    owner_id      TEXT,
    job_id        TEXT,
    body          TEXT NOT NULL,
    receive_count INTEGER NOT NULL,
    action        TEXT NOT NULL,
    recorded_at   TEXT NOT NULL
);

CREATE INDEX idx_dead_letters_recorded ON dead_letters(recorded_at);
CREATE INDEX idx_dead_letters_job      ON dead_letters(owner_id, job_id);
"#;

/// Ordered list of (version, sql) pairs.
const MIGRATIONS: &[(i64, &str)] = &[
    (1, V1_JOBS),
    (2, V2_QUEUE_MESSAGES),
    (3, V3_DEAD_LETTERS),
];

/// Run all pending migrations on `conn`.
///
/// Creates the `schema_migrations` tracking table if it does not exist,
/// then applies each outstanding migration inside a transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version    INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
    )
    .map_err(|e| Error::database(format!("Failed to create schema_migrations: {e}")))?;

    for &(version, sql) in MIGRATIONS {
        let already: bool = conn
            .query_row(
                "SELECT COUNT(*) > 0 FROM schema_migrations WHERE version = ?1",
                [version],
                |row| row.get(0),
            )
            .map_err(|e| Error::database(e.to_string()))?;

        if already {
            continue;
        }

        let tx = conn
            .unchecked_transaction()
            .map_err(|e| Error::database(e.to_string()))?;

        tx.execute_batch(sql)
            .map_err(|e| Error::database(format!("Migration V{version} failed: {e}")))?;

        tx.execute(
            "INSERT INTO schema_migrations (version) VALUES (?1)",
            [version],
        )
        .map_err(|e| Error::database(e.to_string()))?;

        tx.commit().map_err(|e| Error::database(e.to_string()))?;
    }

    Ok(())
}
