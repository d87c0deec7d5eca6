//! cf-db: database access and persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, typed models, and query modules for the job store,
//! the work queue's message table, and dead-letter inspection records.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;

/// Current time as a fixed-width RFC 3339 string (microsecond precision).
///
/// Fixed width keeps lexicographic and chronological order identical, which
/// the `ORDER BY created_at` queries rely on.
pub fn now_timestamp() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
