//! Schedule Engine (C6): fires workflows on a cron/interval/calendar
//! cadence by enqueueing a job into the Durable Queue when `next_run` is due.
//!
//! Misfire policy: a tick that finds `next_run <= now` fires once and
//! advances `next_run` to the next future instant. Missed fires are never
//! replayed (§4.6).

pub mod frequency;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{error, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

pub use frequency::Frequency;

use crate::error::{with_retry, OrchestratorError, Result};
use crate::queue::{DurableQueue, Job};

#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct Schedule {
    #[builder(default = Uuid::new_v4())]
    pub schedule_id: Uuid,
    pub name: String,
    pub workflow_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub workflow_definition: Option<serde_json::Value>,
    #[builder(default, setter(strip_option))]
    pub variables: Option<serde_json::Value>,
    pub frequency: Frequency,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = true)]
    pub enabled: bool,
    #[builder(default, setter(strip_option))]
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    #[builder(default = 0)]
    pub run_count: i64,
    #[builder(default = 0)]
    pub success_count: i64,
    #[builder(default = 0)]
    pub failure_count: i64,
}

/// One row of `execution_history`: a record that a schedule fired.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ScheduleExecution {
    pub execution_id: Uuid,
    pub schedule_id: Uuid,
    pub job_id: Uuid,
    pub started_at: DateTime<Utc>,
}

pub struct ScheduleEngine {
    pool: PgPool,
    queue: DurableQueue,
    history_retention: chrono::Duration,
}

impl ScheduleEngine {
    pub fn new(pool: PgPool, queue: DurableQueue, history_retention: chrono::Duration) -> Self {
        Self { pool, queue, history_retention }
    }

    pub async fn add_schedule(&self, mut schedule: Schedule) -> Result<Schedule> {
        let frequency_json = serde_json::to_value(&schedule.frequency).map_err(OrchestratorError::classify)?;
        schedule.next_run = schedule
            .frequency
            .next_run_after(Utc::now())
            .unwrap_or(schedule.next_run);

        let row = with_retry(|| async {
            sqlx::query_as::<_, ScheduleRow>(
                r#"
                INSERT INTO schedules (
                    schedule_id, name, workflow_id, workflow_definition, variables,
                    frequency, priority, enabled, next_run, run_count, success_count, failure_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, 0, 0)
                RETURNING *
                "#,
            )
            .bind(schedule.schedule_id)
            .bind(&schedule.name)
            .bind(schedule.workflow_id)
            .bind(&schedule.workflow_definition)
            .bind(&schedule.variables)
            .bind(&frequency_json)
            .bind(schedule.priority)
            .bind(schedule.enabled)
            .bind(schedule.next_run)
            .fetch_one(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        info!(schedule_id = %row.schedule_id, next_run = %row.next_run, "schedule created");
        row.into_schedule()
    }

    pub async fn update_schedule(&self, schedule_id: Uuid, frequency: Frequency, priority: i32) -> Result<Schedule> {
        let frequency_json = serde_json::to_value(&frequency).map_err(OrchestratorError::classify)?;
        let next_run = frequency.next_run_after(Utc::now()).unwrap_or_else(Utc::now);

        let row = with_retry(|| async {
            sqlx::query_as::<_, ScheduleRow>(
                "UPDATE schedules SET frequency = $2, priority = $3, next_run = $4 WHERE schedule_id = $1 RETURNING *",
            )
            .bind(schedule_id)
            .bind(&frequency_json)
            .bind(priority)
            .bind(next_run)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {schedule_id}")))?;

        row.into_schedule()
    }

    pub async fn delete_schedule(&self, schedule_id: Uuid) -> Result<()> {
        with_retry(|| async {
            sqlx::query("DELETE FROM schedules WHERE schedule_id = $1")
                .bind(schedule_id)
                .execute(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    pub async fn enable_schedule(&self, schedule_id: Uuid, enabled: bool) -> Result<Schedule> {
        let row = with_retry(|| async {
            sqlx::query_as::<_, ScheduleRow>(
                "UPDATE schedules SET enabled = $2 WHERE schedule_id = $1 RETURNING *",
            )
            .bind(schedule_id)
            .bind(enabled)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("schedule {schedule_id}")))?;
        row.into_schedule()
    }

    pub async fn list_upcoming(&self, limit: i64) -> Result<Vec<Schedule>> {
        let rows = with_retry(|| async {
            sqlx::query_as::<_, ScheduleRow>(
                "SELECT * FROM schedules WHERE enabled = TRUE ORDER BY next_run ASC LIMIT $1",
            )
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;
        rows.into_iter().map(ScheduleRow::into_schedule).collect()
    }

    /// One tick: fires every enabled schedule whose `next_run` is due,
    /// enqueues its job, advances `next_run`, and records the fire.
    pub async fn tick(&self) -> Result<Vec<Uuid>> {
        let due = with_retry(|| async {
            sqlx::query_as::<_, ScheduleRow>(
                "SELECT * FROM schedules WHERE enabled = TRUE AND next_run <= NOW() FOR UPDATE SKIP LOCKED",
            )
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        let mut fired = Vec::with_capacity(due.len());
        for row in due {
            let schedule = row.into_schedule()?;
            match self.fire(&schedule).await {
                Ok(job) => fired.push(job.job_id),
                Err(err) => error!(schedule_id = %schedule.schedule_id, error = %err, "schedule fire failed"),
            }
        }
        Ok(fired)
    }

    async fn fire(&self, schedule: &Schedule) -> Result<Job> {
        let job = Job::builder()
            .workflow_id(schedule.workflow_id)
            .workflow_definition(schedule.workflow_definition.clone().unwrap_or(serde_json::json!({})))
            .variables(schedule.variables.clone().unwrap_or(serde_json::json!({})))
            .priority(schedule.priority)
            .build();

        let job = self.queue.enqueue(job, false).await?;

        let now = Utc::now();
        let next_run = schedule.frequency.next_run_after(now);
        let still_enabled = next_run.is_some();
        let next_run = next_run.unwrap_or(schedule.next_run);

        // success_count/failure_count are NOT touched here: §4.6(c) derives them
        // from the submitted job's terminal state, recorded asynchronously via
        // `record_job_outcome` once the job completes or fails.
        sqlx::query(
            r#"
            UPDATE schedules
            SET last_run = $2, next_run = $3, enabled = $4, run_count = run_count + 1
            WHERE schedule_id = $1
            "#,
        )
        .bind(schedule.schedule_id)
        .bind(now)
        .bind(next_run)
        .bind(still_enabled)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::classify)?;

        with_retry(|| async {
            sqlx::query(
                "INSERT INTO execution_history (execution_id, schedule_id, job_id, started_at) VALUES ($1, $2, $3, $4)",
            )
            .bind(Uuid::new_v4())
            .bind(schedule.schedule_id)
            .bind(job.job_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        self.purge_history(schedule.schedule_id).await?;

        info!(schedule_id = %schedule.schedule_id, job_id = %job.job_id, "schedule fired");
        Ok(job)
    }

    async fn purge_history(&self, schedule_id: Uuid) -> Result<()> {
        with_retry(|| async {
            sqlx::query("DELETE FROM execution_history WHERE schedule_id = $1 AND started_at < $2")
                .bind(schedule_id)
                .bind(Utc::now() - self.history_retention)
                .execute(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    /// Looks up `job_id`'s owning schedule via `execution_history` and bumps
    /// its `success_count`/`failure_count` according to the job's terminal
    /// outcome. A no-op for jobs that were not fired by a schedule. Called
    /// from the facade once a submitted job reaches COMPLETED or FAILED
    /// (§4.6(c): counters are derived from actual terminal state, not from
    /// the fact that the schedule fired).
    pub async fn record_job_outcome(&self, job_id: Uuid, success: bool) -> Result<()> {
        let column = if success { "success_count" } else { "failure_count" };
        let sql = format!(
            "UPDATE schedules SET {column} = {column} + 1 \
             WHERE schedule_id IN (SELECT schedule_id FROM execution_history WHERE job_id = $1)"
        );
        with_retry(|| async {
            sqlx::query(&sql)
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    pub async fn run(self: Arc<Self>, interval: StdDuration, cancel: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.notified() => {
                    info!("schedule engine cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(fired) if !fired.is_empty() => {
                            info!(count = fired.len(), "schedules fired");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "schedule tick failed"),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct ScheduleRow {
    schedule_id: Uuid,
    name: String,
    workflow_id: Uuid,
    workflow_definition: Option<serde_json::Value>,
    variables: Option<serde_json::Value>,
    frequency: serde_json::Value,
    priority: i32,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: DateTime<Utc>,
    run_count: i64,
    success_count: i64,
    failure_count: i64,
}

impl ScheduleRow {
    fn into_schedule(self) -> Result<Schedule> {
        let frequency: Frequency = serde_json::from_value(self.frequency).map_err(OrchestratorError::classify)?;
        Ok(Schedule {
            schedule_id: self.schedule_id,
            name: self.name,
            workflow_id: self.workflow_id,
            workflow_definition: self.workflow_definition,
            variables: self.variables,
            frequency,
            priority: self.priority,
            enabled: self.enabled,
            last_run: self.last_run,
            next_run: self.next_run,
            run_count: self.run_count,
            success_count: self.success_count,
            failure_count: self.failure_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_builder_defaults_are_sane() {
        let schedule = Schedule::builder()
            .name("nightly-report".into())
            .workflow_id(Uuid::new_v4())
            .frequency(Frequency::Daily { hour: 2, minute: 0 })
            .next_run(Utc::now())
            .build();
        assert!(schedule.enabled);
        assert_eq!(schedule.run_count, 0);
        assert_eq!(schedule.priority, 0);
    }
}
