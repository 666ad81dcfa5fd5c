mod common;

use chrono::Duration;
use orchestrator_core::robot::{RobotRegistry, RobotStatus};
use uuid::Uuid;

#[tokio::test]
async fn register_then_get_round_trips() {
    let pool = common::fresh_pool().await;
    let robots = RobotRegistry::new(pool);
    let id = Uuid::new_v4();

    let robot = robots
        .register(id, "picker-01", "prod", &["scraping".into()], 3, Some("region-a"))
        .await
        .unwrap();
    assert_eq!(robot.status, RobotStatus::Online);
    assert_eq!(robot.current_job_count, 0);

    let fetched = robots.get(id).await.unwrap();
    assert_eq!(fetched.robot_id, id);
    assert_eq!(fetched.affinity_key.as_deref(), Some("region-a"));
}

#[tokio::test]
async fn increment_load_fails_once_capacity_is_exhausted() {
    let pool = common::fresh_pool().await;
    let robots = RobotRegistry::new(pool);
    let id = Uuid::new_v4();
    robots.register(id, "picker-02", "prod", &[], 1, None).await.unwrap();

    let loaded = robots.increment_load(id).await.unwrap();
    assert_eq!(loaded.current_job_count, 1);

    let result = robots.increment_load(id).await;
    assert!(result.is_err(), "capacity exceeded should be rejected");
}

#[tokio::test]
async fn list_dispatchable_excludes_offline_and_over_capacity_robots() {
    let pool = common::fresh_pool().await;
    let robots = RobotRegistry::new(pool);

    let online = Uuid::new_v4();
    robots.register(online, "available", "prod", &[], 2, None).await.unwrap();

    let offline = Uuid::new_v4();
    robots.register(offline, "down", "prod", &[], 2, None).await.unwrap();
    robots.set_status(offline, RobotStatus::Offline).await.unwrap();

    let full = Uuid::new_v4();
    robots.register(full, "saturated", "prod", &[], 1, None).await.unwrap();
    robots.increment_load(full).await.unwrap();

    let dispatchable = robots.list_dispatchable(Duration::seconds(60)).await.unwrap();
    let ids: Vec<Uuid> = dispatchable.iter().map(|r| r.robot_id).collect();

    assert!(ids.contains(&online));
    assert!(!ids.contains(&offline));
    assert!(!ids.contains(&full));
}

#[tokio::test]
async fn list_stale_finds_robots_whose_heartbeat_has_lapsed() {
    let pool = common::fresh_pool().await;
    let robots = RobotRegistry::new(pool.clone());
    let id = Uuid::new_v4();
    robots.register(id, "forgotten", "prod", &[], 1, None).await.unwrap();

    sqlx::query("UPDATE robots SET last_heartbeat = NOW() - INTERVAL '10 minutes' WHERE robot_id = $1")
        .bind(id)
        .execute(&pool)
        .await
        .unwrap();

    let stale = robots.list_stale(Duration::seconds(60)).await.unwrap();
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].robot_id, id);
}
