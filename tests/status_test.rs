//! Status reads, listings, download links, and the operator report.

mod common;

use std::time::Duration;

use cf_core::{Caller, Error, JobId, JobState};
use cf_worker::{report, status};
use common::{FakeEngine, TestHarness};

#[tokio::test]
async fn unknown_job_is_not_found() {
    let h = TestHarness::new();

    let err = status::get_job_status(&h.ctx, "alice", &JobId::new().to_string()).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));

    let err = status::get_job_status(&h.ctx, "alice", "not-a-uuid").unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn status_is_scoped_to_owner() {
    let h = TestHarness::new();
    let job_id = h.upload("alice", "clip.mp4").await;

    let view = status::get_job_status(&h.ctx, "alice", &job_id.to_string()).unwrap();
    assert_eq!(view.job_id, job_id);
    assert_eq!(view.state, JobState::Queued);
    assert!(!view.output_available);
    assert!(view.error.is_none());

    let err = status::get_job_status(&h.ctx, "mallory", &job_id.to_string()).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn status_reflects_completion_and_failure() {
    let h = TestHarness::new();
    let done = h.upload("alice", "good.mp4").await;
    h.process_next().await.unwrap();

    let view = status::get_job_status(&h.ctx, "alice", &done.to_string()).unwrap();
    assert_eq!(view.state, JobState::Completed);
    assert!(view.output_available);

    let json = serde_json::to_value(&view).unwrap();
    assert_eq!(json["state"], "COMPLETED");
    assert!(json.get("error").is_none());

    let failing = TestHarness::with_engine(FakeEngine::failing());
    let bad = failing.upload("alice", "bad.mp4").await;
    failing.process_next().await.unwrap();

    let view = status::get_job_status(&failing.ctx, "alice", &bad.to_string()).unwrap();
    assert_eq!(view.state, JobState::Failed);
    assert!(!view.output_available);
    assert!(view.error.unwrap().contains("ffmpeg"));
}

#[tokio::test]
async fn list_returns_only_owner_jobs_in_creation_order() {
    let h = TestHarness::new();
    let first = h.upload("alice", "1.mp4").await;
    h.upload("bob", "other.mp4").await;
    let second = h.upload("alice", "2.mp4").await;

    let jobs = status::list_jobs(&h.ctx, "alice").unwrap();
    let ids: Vec<JobId> = jobs.iter().map(|j| j.job_id).collect();
    assert_eq!(ids, [first, second]);
    assert!(status::list_jobs(&h.ctx, "nobody").unwrap().is_empty());
}

#[tokio::test]
async fn admin_listing_requires_admin() {
    let h = TestHarness::new();
    h.upload("alice", "a.mp4").await;
    h.upload("bob", "b.mp4").await;

    let err = status::admin_list_jobs(&h.ctx, &Caller::Owner("alice".into())).unwrap_err();
    assert!(matches!(err, Error::Forbidden(_)));

    let all = status::admin_list_jobs(&h.ctx, &Caller::Admin).unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn download_link_points_at_output_once_completed() {
    let h = TestHarness::new();
    let job_id = h.upload("alice", "clip.mp4").await;
    let ttl = Duration::from_secs(300);

    let link = status::download_link(&h.ctx, "alice", job_id, ttl).unwrap();
    assert!(link
        .url
        .starts_with(&format!("http://blobs.test/raw/{job_id}.mp4?expires=")));

    h.process_next().await.unwrap();
    let link = status::download_link(&h.ctx, "alice", job_id, ttl).unwrap();
    let key = format!("processed/{job_id}_720p.mp4");
    assert!(link.url.starts_with(&format!("http://blobs.test/{key}?")));

    let query = link.url.split_once('?').unwrap().1;
    let mut expires = 0;
    let mut sig = "";
    for pair in query.split('&') {
        match pair.split_once('=').unwrap() {
            ("expires", v) => expires = v.parse().unwrap(),
            ("sig", v) => sig = v,
            _ => {}
        }
    }
    assert!(h.blobs.verify_link(&key, expires, sig));

    let err = status::download_link(&h.ctx, "bob", job_id, ttl).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn report_counts_jobs_and_queues() {
    let h = TestHarness::new();
    h.upload("alice", "a.mp4").await;
    h.upload("alice", "b.mp4").await;
    h.process_next().await.unwrap();

    let summary = report::summarize(&h.ctx).await.unwrap();
    assert_eq!(summary.total_jobs, 2);
    assert_eq!(summary.jobs_by_state["COMPLETED"], 1);
    assert_eq!(summary.jobs_by_state["QUEUED"], 1);
    assert_eq!(summary.jobs_by_state["FAILED"], 0);
    assert_eq!(summary.jobs_by_state["PROCESSING"], 0);
    assert_eq!(summary.work_queue.name, "transcode");
    assert_eq!(summary.work_queue.visible + summary.work_queue.in_flight, 1);
    assert_eq!(summary.dead_letter_queue.visible, 0);
    assert_eq!(summary.dead_letter_records, 0);
}
