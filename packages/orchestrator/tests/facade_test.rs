mod common;

use orchestrator_core::queue::{Job, JobStatus};
use orchestrator_core::schedule::Frequency;
use orchestrator_core::Orchestrator;
use uuid::Uuid;

fn sample_job(workflow_id: Uuid) -> Job {
    Job::builder()
        .workflow_id(workflow_id)
        .workflow_definition(serde_json::json!({}))
        .build()
}

#[tokio::test]
async fn submit_job_then_complete_job_round_trips_through_the_facade() {
    let pool = common::fresh_pool().await;
    let orchestrator = Orchestrator::new(pool, common::test_config());

    let job = orchestrator.submit_job(sample_job(Uuid::new_v4()), false).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);

    let claimed = orchestrator.dispatcher_tick().await.unwrap();
    assert_eq!(claimed, 0, "no dispatchable robots yet registered");

    let robot_id = Uuid::new_v4();
    orchestrator
        .register_robot(robot_id, "worker-01", "prod", &[], 2, None)
        .await
        .unwrap();

    let dispatched = orchestrator.dispatcher_tick().await.unwrap();
    assert_eq!(dispatched, 1);

    orchestrator.queue.mark_running(job.job_id).await.unwrap();
    let completed = orchestrator.complete_job(job.job_id).await.unwrap();
    assert_eq!(completed.status, JobStatus::Completed);
}

#[tokio::test]
async fn fail_job_past_its_retry_budget_leaves_it_failed() {
    let pool = common::fresh_pool().await;
    let mut config = common::test_config();
    config.max_retries = 0;
    let orchestrator = Orchestrator::new(pool, config);

    let job = orchestrator.submit_job(sample_job(Uuid::new_v4()), false).await.unwrap();
    let robot_id = Uuid::new_v4();
    orchestrator.register_robot(robot_id, "worker-02", "prod", &[], 1, None).await.unwrap();
    orchestrator.dispatcher_tick().await.unwrap();
    orchestrator.queue.mark_running(job.job_id).await.unwrap();

    let failed = orchestrator.fail_job(job.job_id, "boom").await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
}

#[tokio::test]
async fn retry_job_creates_a_fresh_job_for_a_failed_one() {
    let pool = common::fresh_pool().await;
    let mut config = common::test_config();
    config.max_retries = 0;
    let orchestrator = Orchestrator::new(pool, config);

    let workflow_id = Uuid::new_v4();
    let job = orchestrator.submit_job(sample_job(workflow_id), false).await.unwrap();
    let robot_id = Uuid::new_v4();
    orchestrator.register_robot(robot_id, "worker-03", "prod", &[], 1, None).await.unwrap();
    orchestrator.dispatcher_tick().await.unwrap();
    orchestrator.queue.mark_running(job.job_id).await.unwrap();
    let failed = orchestrator.fail_job(job.job_id, "boom").await.unwrap();
    assert_eq!(failed.status, JobStatus::Failed);

    let retried = orchestrator.retry_job(job.job_id).await.unwrap();
    assert_ne!(retried.job_id, job.job_id);
    assert_eq!(retried.workflow_id, workflow_id);
    assert_eq!(retried.status, JobStatus::Pending);

    let original = orchestrator.queue.get_by_id(job.job_id).await.unwrap();
    assert_eq!(original.status, JobStatus::Failed, "original row is left untouched");
}

#[tokio::test]
async fn retry_job_rejects_a_job_that_is_still_pending() {
    let pool = common::fresh_pool().await;
    let orchestrator = Orchestrator::new(pool, common::test_config());

    let job = orchestrator.submit_job(sample_job(Uuid::new_v4()), false).await.unwrap();
    assert!(orchestrator.retry_job(job.job_id).await.is_err());
}

#[tokio::test]
async fn create_schedule_then_disable_it_removes_it_from_upcoming() {
    let pool = common::fresh_pool().await;
    let orchestrator = Orchestrator::new(pool, common::test_config());

    let schedule = orchestrator
        .create_schedule("daily-sync".into(), Uuid::new_v4(), Frequency::Daily { hour: 2, minute: 0 }, 5)
        .await
        .unwrap();

    let upcoming = orchestrator.upcoming_schedules(10).await.unwrap();
    assert!(upcoming.iter().any(|s| s.schedule_id == schedule.schedule_id));

    orchestrator.toggle_schedule(schedule.schedule_id, false).await.unwrap();
    let upcoming = orchestrator.upcoming_schedules(10).await.unwrap();
    assert!(upcoming.iter().all(|s| s.schedule_id != schedule.schedule_id));
}
