mod common;

use chrono::Duration;
use orchestrator_core::checkpoint::{CheckpointState, CheckpointStore};
use orchestrator_core::queue::{DurableQueue, Job, JobStatus};
use orchestrator_core::recovery::{RecoveryAction, RecoveryManager};
use orchestrator_core::robot::{RobotRegistry, RobotStatus};
use uuid::Uuid;

fn sample_job(workflow_id: Uuid) -> Job {
    Job::builder()
        .workflow_id(workflow_id)
        .workflow_definition(serde_json::json!({}))
        .build()
}

fn manager(pool: sqlx::PgPool) -> RecoveryManager {
    RecoveryManager::new(
        DurableQueue::new(pool.clone()),
        RobotRegistry::new(pool.clone()),
        CheckpointStore::new(pool),
        Duration::seconds(60),
        Duration::seconds(3600),
        Duration::seconds(10),
        5,
        vec![1, 2, 4],
        true,
        true,
    )
}

#[tokio::test]
async fn scan_marks_stale_robot_failed_and_requeues_its_jobs() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool.clone());
    let robots = RobotRegistry::new(pool.clone());

    let robot_id = Uuid::new_v4();
    robots.register(robot_id, "flaky", "prod", &[], 2, None).await.unwrap();
    sqlx::query("UPDATE robots SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE robot_id = $1")
        .bind(robot_id)
        .execute(&pool)
        .await
        .unwrap();

    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(robot_id, 10).await.unwrap();

    let recovery = manager(pool.clone());
    let results = recovery.scan().await.unwrap();

    assert!(results.iter().any(|r| r.job_id == job.job_id));
    assert_eq!(robots.get(robot_id).await.unwrap().status, RobotStatus::Failed);

    let recovered = queue.get_by_id(job.job_id).await.unwrap();
    assert_eq!(recovered.status, JobStatus::Pending);
    assert_eq!(recovered.retry_count, 1);
}

#[tokio::test]
async fn resumable_checkpoint_is_tried_before_the_retry_budget() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool.clone());
    let checkpoints = CheckpointStore::new(pool.clone());

    let robot_id = Uuid::new_v4();
    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(robot_id, 10).await.unwrap();
    checkpoints.put(job.job_id, CheckpointState::Pending, 3, &[1, 2, 3]).await.unwrap();

    let recovery = manager(pool);
    let results = recovery.manually_recover(robot_id, "test").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].action, RecoveryAction::ResumedFromCheckpoint);

    let resumed = queue.get_by_id(job.job_id).await.unwrap();
    assert_eq!(resumed.retry_count, 0, "checkpoint resume must not spend a retry");
}

#[tokio::test]
async fn job_without_a_checkpoint_falls_through_to_retry() {
    let pool = common::fresh_pool().await;
    let queue = DurableQueue::new(pool.clone());

    let robot_id = Uuid::new_v4();
    let job = queue.enqueue(sample_job(Uuid::new_v4()), false).await.unwrap();
    queue.claim(robot_id, 10).await.unwrap();

    let recovery = manager(pool);
    let results = recovery.manually_recover(robot_id, "test").await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].action, RecoveryAction::RequeuedForRetry);
    let _ = job;
}
