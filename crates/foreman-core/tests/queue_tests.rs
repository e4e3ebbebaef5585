//! Queue controller behavior: admission cap, idempotent passes, startup
//! recovery, and cancellation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use foreman_core::queue::QueueController;
use foreman_core::types::{JobStatus, JobType};

use common::{harness, ScriptedBackend};

async fn wait_until_terminal(
    h: &common::Harness,
    job_ids: &[i64],
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let all_done = job_ids.iter().all(|id| {
            h.db.get_job(*id)
                .unwrap()
                .map(|j| j.status.is_terminal())
                .unwrap_or(false)
        });
        if all_done {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn admission_respects_cap_and_is_idempotent() {
    let h = harness(ScriptedBackend::new(vec![]).with_delay(Duration::from_millis(400)));
    let queue = QueueController::new(Arc::clone(&h.ctx));

    let jobs: Vec<i64> = (0..3)
        .map(|i| {
            h.enqueue(JobType::Code, |job| {
                job.branch_name = format!("feature/cap-{i}");
                job.title = format!("cap {i}");
                job.prompt = "do things".into();
            })
        })
        .collect();

    queue.process().await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (queued, running) = h.db.count_jobs_by_status("test-machine").unwrap();
    assert_eq!(running, 2, "cap of 2 must hold");
    assert_eq!(queued, 1);

    // A second pass while saturated must not double-dispatch.
    queue.process().await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let (_, running) = h.db.count_jobs_by_status("test-machine").unwrap();
    assert!(running <= 2);

    // Keep nudging until everything drains.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        queue.process().await;
        if wait_until_terminal(&h, &jobs, Duration::from_millis(200)).await {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not drain in time"
        );
    }

    for id in jobs {
        let job = h.db.get_job(id).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.error.as_deref(), Some("No changes were made"));
        assert!(job.started_at.is_some());
        assert!(job.completed_at.is_some());
        assert!(job.created_at <= job.started_at.unwrap());
        assert!(job.started_at.unwrap() <= job.completed_at.unwrap());
    }
}

#[tokio::test]
async fn init_requeues_orphaned_running_jobs() {
    let h = harness(ScriptedBackend::new(vec![]));
    let job_id = h.enqueue(JobType::Code, |job| {
        job.branch_name = "feature/orphan".into();
        job.title = "orphan".into();
    });
    // Simulate a crash: the row says running, but no process owns it.
    assert!(h.db.mark_job_running(job_id).unwrap());

    let queue = QueueController::new(Arc::clone(&h.ctx));
    queue.init().await.unwrap();

    assert!(
        wait_until_terminal(&h, &[job_id], Duration::from_secs(10)).await,
        "recovered job should run to completion"
    );
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
}

#[tokio::test]
async fn cancel_kills_in_flight_jobs_and_skips_terminal_ones() {
    let h = harness(ScriptedBackend::new(vec![]).with_delay(Duration::from_millis(500)));
    let queue = QueueController::new(Arc::clone(&h.ctx));

    let job_id = h.enqueue(JobType::Code, |job| {
        job.branch_name = "feature/cancel-me".into();
        job.title = "cancel me".into();
    });
    queue.process().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(queue.is_in_flight(job_id).await);

    assert!(queue.cancel(job_id).await.unwrap());
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.completed_at.is_some());

    // Cancelling again is a no-op; the worker finishing later must not
    // overwrite the terminal status.
    assert!(queue.cancel(job_id).await.unwrap());
    tokio::time::sleep(Duration::from_millis(600)).await;
    let job = h.db.get_job(job_id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);

    // Unknown ids report false.
    assert!(!queue.cancel(999).await.unwrap());
}

#[tokio::test]
async fn status_reads_from_the_store() {
    let h = harness(ScriptedBackend::new(vec![]));
    let queue = QueueController::new(Arc::clone(&h.ctx));

    h.enqueue(JobType::Code, |job| {
        job.branch_name = "feature/status".into();
    });
    let status = queue.status().await.unwrap();
    assert_eq!(status.max_concurrent, 2);
    assert_eq!(status.queued.len(), 1);
    assert!(status.running.is_empty());
}
