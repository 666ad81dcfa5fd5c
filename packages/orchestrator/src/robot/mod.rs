//! Robot Registry (C3): tracks the fleet's identity, capacity, and liveness.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{with_retry, OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum RobotStatus {
    Online,
    Busy,
    Offline,
    Failed,
    Maintenance,
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Robot {
    pub robot_id: Uuid,
    pub name: String,
    pub environment: String,
    pub tags: Vec<String>,
    pub status: RobotStatus,
    pub current_job_count: i32,
    pub max_concurrent_jobs: i32,
    pub last_heartbeat: DateTime<Utc>,
    pub affinity_key: Option<String>,
}

impl Robot {
    /// §3 Robot invariant: live, not over capacity, and heartbeating inside `t_hb`.
    pub fn is_dispatchable(&self, now: DateTime<Utc>, t_hb: Duration) -> bool {
        matches!(self.status, RobotStatus::Online | RobotStatus::Busy)
            && self.current_job_count < self.max_concurrent_jobs
            && now - self.last_heartbeat < t_hb
    }

    pub fn is_stale(&self, now: DateTime<Utc>, t_hb: Duration) -> bool {
        now - self.last_heartbeat > t_hb
    }

    pub fn available_capacity(&self) -> i32 {
        (self.max_concurrent_jobs - self.current_job_count).max(0)
    }
}

#[derive(Clone)]
pub struct RobotRegistry {
    pool: PgPool,
}

impl RobotRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn register(
        &self,
        robot_id: Uuid,
        name: &str,
        environment: &str,
        tags: &[String],
        max_concurrent_jobs: i32,
        affinity_key: Option<&str>,
    ) -> Result<Robot> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>(
                r#"
                INSERT INTO robots (robot_id, name, environment, tags, status, current_job_count, max_concurrent_jobs, last_heartbeat, affinity_key)
                VALUES ($1, $2, $3, $4, 'ONLINE', 0, $5, NOW(), $6)
                ON CONFLICT (robot_id) DO UPDATE
                SET name = EXCLUDED.name,
                    environment = EXCLUDED.environment,
                    tags = EXCLUDED.tags,
                    status = 'ONLINE',
                    max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                    last_heartbeat = NOW(),
                    affinity_key = EXCLUDED.affinity_key
                RETURNING *
                "#,
            )
            .bind(robot_id)
            .bind(name)
            .bind(environment)
            .bind(tags)
            .bind(max_concurrent_jobs)
            .bind(affinity_key)
            .fetch_one(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    /// Idempotent; no-op if the robot is absent. `last_heartbeat` is monotonic:
    /// a heartbeat never moves it backwards relative to a concurrent update,
    /// which `GREATEST` enforces even under out-of-order delivery.
    pub async fn heartbeat(&self, robot_id: Uuid) -> Result<()> {
        with_retry(|| async {
            sqlx::query(
                "UPDATE robots SET last_heartbeat = GREATEST(last_heartbeat, NOW()) WHERE robot_id = $1",
            )
            .bind(robot_id)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    pub async fn set_status(&self, robot_id: Uuid, status: RobotStatus) -> Result<Robot> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>(
                "UPDATE robots SET status = $2 WHERE robot_id = $1 RETURNING *",
            )
            .bind(robot_id)
            .bind(status)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("robot {robot_id}")))
    }

    /// Atomic `UPDATE ... WHERE current_job_count < max_concurrent_jobs`;
    /// a lost race simply fails the handoff with `CapacityExceeded`.
    pub async fn increment_load(&self, robot_id: Uuid) -> Result<Robot> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>(
                r#"
                UPDATE robots
                SET current_job_count = current_job_count + 1
                WHERE robot_id = $1 AND current_job_count < max_concurrent_jobs
                RETURNING *
                "#,
            )
            .bind(robot_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or(OrchestratorError::CapacityExceeded { robot_id })
    }

    pub async fn decrement_load(&self, robot_id: Uuid) -> Result<()> {
        with_retry(|| async {
            sqlx::query(
                "UPDATE robots SET current_job_count = GREATEST(current_job_count - 1, 0) WHERE robot_id = $1",
            )
            .bind(robot_id)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    pub async fn get(&self, robot_id: Uuid) -> Result<Robot> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>("SELECT * FROM robots WHERE robot_id = $1")
                .bind(robot_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("robot {robot_id}")))
    }

    pub async fn list_dispatchable(&self, t_hb: Duration) -> Result<Vec<Robot>> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>(
                r#"
                SELECT * FROM robots
                WHERE status IN ('ONLINE', 'BUSY')
                  AND current_job_count < max_concurrent_jobs
                  AND last_heartbeat > NOW() - ($1 || ' seconds')::interval
                "#,
            )
            .bind(t_hb.num_seconds())
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    /// Robots whose heartbeat has lapsed beyond `t_hb` and are still marked live.
    pub async fn list_stale(&self, t_hb: Duration) -> Result<Vec<Robot>> {
        with_retry(|| async {
            sqlx::query_as::<_, Robot>(
                r#"
                SELECT * FROM robots
                WHERE status IN ('ONLINE', 'BUSY')
                  AND last_heartbeat <= NOW() - ($1 || ' seconds')::interval
                "#,
            )
            .bind(t_hb.num_seconds())
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }
}
