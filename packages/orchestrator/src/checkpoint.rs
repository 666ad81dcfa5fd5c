//! Checkpoint Store (C2): per-job execution-state records used to resume a
//! job after its robot crashes, rather than restarting it from scratch.
//!
//! This is a DBOS-style durable-execution checkpoint: the store only answers
//! "where did the crashed attempt get to," it never performs the step
//! itself. Exactly-once semantics are the robot's protocol responsibility —
//! write the checkpoint *before* the step's externally visible effect, mark
//! it COMPLETED *after*.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::{with_retry, OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum CheckpointState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl CheckpointState {
    /// Only a checkpoint caught mid-step (robot wrote the checkpoint but had
    /// not yet committed the step's completion) is safe to resume.
    pub fn is_resumable(self) -> bool {
        self == CheckpointState::Pending
    }
}

#[derive(Debug, Clone, sqlx::FromRow, Serialize, Deserialize)]
pub struct Checkpoint {
    pub workflow_instance_id: Uuid,
    pub state: CheckpointState,
    pub current_step: i32,
    pub executed_nodes: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct CheckpointStore {
    pool: PgPool,
}

impl CheckpointStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent on `(job_id, current_step)`: a later `Put` with a larger
    /// `current_step` supersedes earlier ones for the same job. A stale or
    /// out-of-order write carrying a smaller `current_step` is blocked by the
    /// `WHERE` guard and treated as a no-op, returning the row already on disk.
    pub async fn put(
        &self,
        job_id: Uuid,
        state: CheckpointState,
        current_step: i32,
        executed_nodes: &[i32],
    ) -> Result<Checkpoint> {
        let executed_nodes = serde_json::to_value(executed_nodes).expect("Vec<i32> always serializes");

        let written = with_retry(|| async {
            sqlx::query_as::<_, Checkpoint>(
                r#"
                INSERT INTO checkpoints (workflow_instance_id, state, current_step, executed_nodes, updated_at)
                VALUES ($1, $2, $3, $4, NOW())
                ON CONFLICT (workflow_instance_id) DO UPDATE
                SET state = EXCLUDED.state,
                    current_step = EXCLUDED.current_step,
                    executed_nodes = EXCLUDED.executed_nodes,
                    updated_at = NOW()
                WHERE checkpoints.current_step <= EXCLUDED.current_step
                RETURNING *
                "#,
            )
            .bind(job_id)
            .bind(state)
            .bind(current_step)
            .bind(executed_nodes.clone())
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        match written {
            Some(checkpoint) => Ok(checkpoint),
            None => self
                .get(job_id)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("checkpoint for job {job_id}"))),
        }
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Checkpoint>> {
        with_retry(|| async {
            sqlx::query_as::<_, Checkpoint>(
                "SELECT * FROM checkpoints WHERE workflow_instance_id = $1",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    /// Called when the parent job reaches a terminal status.
    pub async fn delete(&self, job_id: Uuid) -> Result<()> {
        with_retry(|| async {
            sqlx::query("DELETE FROM checkpoints WHERE workflow_instance_id = $1")
                .bind(job_id)
                .execute(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }
}
