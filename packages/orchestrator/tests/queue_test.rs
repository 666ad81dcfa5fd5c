mod common;

use chrono::Duration;
use orchestrator_core::queue::{DurableQueue, Job, JobStatus};
use uuid::Uuid;

fn sample_job(workflow_id: Uuid) -> Job {
    Job::builder()
        .workflow_id(workflow_id)
        .workflow_definition(serde_json::json!({"steps": []}))
        .build()
}

#[tokio::test]
async fn enqueue_then_claim_transitions_pending_to_claimed() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);

    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let claimant = Uuid::new_v4();
    let claimed = queue.claim(claimant, 10).await.unwrap();
    assert_eq!(claimed.len(), 1);
    assert_eq!(claimed[0].job_id, job.job_id);
    assert_eq!(claimed[0].status, JobStatus::Claimed);
}

#[tokio::test]
async fn claim_is_exclusive_across_two_racing_claimants() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();

    let (a, b) = tokio::join!(
        queue.claim(Uuid::new_v4(), 10),
        queue.claim(Uuid::new_v4(), 10),
    );
    let total = a.unwrap().len() + b.unwrap().len();
    assert_eq!(total, 1, "exactly one claimant should win the only job");
}

#[tokio::test]
async fn dedupe_key_prevents_a_second_enqueue_of_the_same_fingerprint() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    let workflow_id = Uuid::new_v4();
    let vars = serde_json::json!({"a": 1});
    let fp = Job::fingerprint(workflow_id, &vars);

    let first = sample_job(workflow_id);
    let first = Job { variables: vars.clone(), dedupe_key: Some(fp.clone()), ..first };
    let enqueued = queue.enqueue(first, true).await.unwrap();

    let second = sample_job(workflow_id);
    let second = Job { variables: vars, dedupe_key: Some(fp), ..second };
    let result = queue.enqueue(second, true).await.unwrap();

    assert_eq!(result.job_id, enqueued.job_id, "dedupe should return the existing row");
}

#[tokio::test]
async fn fail_under_max_retries_requeues_with_backoff() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(Uuid::new_v4(), 10).await.unwrap();

    let failed = queue.fail(job.job_id, "boom", &[1, 2, 4]).await.unwrap();
    assert_eq!(failed.retry_count, 1);
    assert_eq!(failed.status, JobStatus::Pending);
    assert!(failed.visible_after > job.created_at);
}

#[tokio::test]
async fn promote_to_dlq_moves_the_job_out_of_the_active_table() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(Uuid::new_v4(), 10).await.unwrap();

    let entry = queue.promote_to_dlq(job.job_id, "retries exhausted").await.unwrap();
    assert_eq!(entry.job_id, job.job_id);
    assert!(queue.get_by_id(job.job_id).await.is_err());
}

#[tokio::test]
async fn priority_ordering_claims_the_highest_priority_job_first() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    let now = chrono::Utc::now();

    let a = Job { priority: 5, created_at: now, ..sample_job(Uuid::new_v4()) };
    let b = Job { priority: 20, created_at: now + Duration::milliseconds(1), ..sample_job(Uuid::new_v4()) };
    let c = Job { priority: 5, created_at: now + Duration::milliseconds(2), ..sample_job(Uuid::new_v4()) };

    let a = queue.enqueue(a, false).await.unwrap();
    let b = queue.enqueue(b, false).await.unwrap();
    let c = queue.enqueue(c, false).await.unwrap();

    let claimed = queue.claim(Uuid::new_v4(), 3).await.unwrap();
    let order: Vec<Uuid> = claimed.iter().map(|j| j.job_id).collect();
    assert_eq!(order, vec![b.job_id, a.job_id, c.job_id]);
}

#[tokio::test]
async fn release_makes_a_claimed_job_claimable_again_after_the_delay() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool);
    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(Uuid::new_v4(), 10).await.unwrap();

    queue.release(job.job_id, Duration::seconds(0)).await.unwrap();
    let reclaimed = queue.claim(Uuid::new_v4(), 10).await.unwrap();
    assert_eq!(reclaimed.len(), 1);
    assert_eq!(reclaimed[0].job_id, job.job_id);
}
