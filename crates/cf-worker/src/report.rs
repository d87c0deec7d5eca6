//! Operator summary of the pipeline.

use std::collections::BTreeMap;

use serde::Serialize;

use cf_core::Result;
use cf_db::queries::{dead_letters, jobs};
use cf_queue::WorkQueue;

use crate::context::WorkerContext;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueSummary {
    pub name: String,
    pub visible: u64,
    pub in_flight: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Report {
    pub generated_at: String,
    pub total_jobs: u64,
    /// Every state appears, including those with no jobs.
    pub jobs_by_state: BTreeMap<String, u64>,
    pub work_queue: QueueSummary,
    pub dead_letter_queue: QueueSummary,
    /// Rows written by dead-letter drains.
    pub dead_letter_records: i64,
}

async fn summarize_queue(queue: &dyn WorkQueue) -> Result<QueueSummary> {
    let depth = queue.depth().await?;
    Ok(QueueSummary {
        name: queue.name().to_string(),
        visible: depth.visible,
        in_flight: depth.in_flight,
    })
}

pub async fn summarize(ctx: &WorkerContext) -> Result<Report> {
    let (counts, dead_letter_records) = {
        let conn = ctx.conn()?;
        (
            jobs::count_by_state(&conn)?,
            dead_letters::count_dead_letters(&conn)?,
        )
    };

    let jobs_by_state: BTreeMap<String, u64> = counts
        .into_iter()
        .map(|(state, n)| (state.as_str().to_string(), n))
        .collect();

    Ok(Report {
        generated_at: cf_db::now_timestamp(),
        total_jobs: jobs_by_state.values().sum(),
        jobs_by_state,
        work_queue: summarize_queue(ctx.queue.as_ref()).await?,
        dead_letter_queue: summarize_queue(ctx.dead_letters.as_ref()).await?,
        dead_letter_records,
    })
}
