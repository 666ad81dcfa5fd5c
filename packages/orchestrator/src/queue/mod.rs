//! Durable Queue (C1): a transactional, at-most-one-claim priority queue on
//! Postgres with visibility timeout and dead-letter promotion.
//!
//! Every mutation is an `UPDATE ... WHERE status = <expected> RETURNING`
//! optimistic-concurrency predicate, or a `FOR UPDATE SKIP LOCKED` claim —
//! the row is the only authoritative state. Nothing here caches job state
//! across calls.

pub mod backoff;
pub mod job;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

pub use backoff::backoff_seconds;
pub use job::{Job, JobStatus, Scalar, Variables};

use crate::error::{with_retry, OrchestratorError, Result};

/// A reserved, non-registry robot id used for the dispatcher's own
/// provisional claim in §4.4 step 3 (see SPEC_FULL.md Open Question decisions).
pub const ORCHESTRATOR_CLAIMANT_ID: Uuid = Uuid::nil();

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DlqEntry {
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: Option<String>,
    pub workflow_definition: serde_json::Value,
    pub variables: serde_json::Value,
    pub retry_count: i32,
    pub max_retries: i32,
    pub moved_at: DateTime<Utc>,
    pub final_error: String,
    pub retry_history: serde_json::Value,
}

#[derive(Clone)]
pub struct DurableQueue {
    pool: PgPool,
}

impl DurableQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Exposes the underlying pool for components (the Dispatcher's handoff)
    /// that need to mutate a job row in a way this queue does not itself expose.
    pub fn pool_ref(&self) -> &PgPool {
        &self.pool
    }

    /// Insert a PENDING job. If `dedupe` is true and a pending/claimed job
    /// with the same `(workflow_id, variables)` fingerprint exists, returns
    /// `OrchestratorError::Conflict` instead of inserting.
    pub async fn enqueue(&self, mut job: Job, dedupe: bool) -> Result<Job> {
        if dedupe {
            job.dedupe_key = Some(Job::fingerprint(job.workflow_id, &job.variables));
            let existing = with_retry(|| async {
                sqlx::query_scalar::<_, Uuid>(
                    "SELECT job_id FROM jobs WHERE dedupe_key = $1 AND status IN ('PENDING', 'CLAIMED', 'RUNNING') LIMIT 1",
                )
                .bind(&job.dedupe_key)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
            })
            .await?;

            if existing.is_some() {
                return Err(OrchestratorError::Conflict(format!(
                    "duplicate submission for workflow {}",
                    job.workflow_id
                )));
            }
        }

        let row = with_retry(|| async {
            sqlx::query_as::<_, Job>(
                r#"
                INSERT INTO jobs (
                    job_id, workflow_id, workflow_name, workflow_definition, variables,
                    tenant_id, tags, priority, visible_after, created_at, status,
                    retry_count, max_retries, affinity_key, dedupe_key
                ) VALUES (
                    $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15
                )
                RETURNING *
                "#,
            )
            .bind(job.job_id)
            .bind(job.workflow_id)
            .bind(&job.workflow_name)
            .bind(&job.workflow_definition)
            .bind(&job.variables)
            .bind(&job.tenant_id)
            .bind(&job.tags)
            .bind(job.priority)
            .bind(job.visible_after)
            .bind(job.created_at)
            .bind(job.status)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(&job.affinity_key)
            .bind(&job.dedupe_key)
            .fetch_one(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        info!(job_id = %row.job_id, workflow_id = %row.workflow_id, "job enqueued");
        Ok(row)
    }

    /// Atomically claim up to `n` ready jobs to `claimant`, skipping rows
    /// already locked by a concurrent claimer.
    pub async fn claim(&self, claimant: Uuid, n: i64) -> Result<Vec<Job>> {
        let jobs = with_retry(|| async {
            sqlx::query_as::<_, Job>(
                r#"
                WITH next_jobs AS (
                    SELECT job_id FROM jobs
                    WHERE status = 'PENDING' AND visible_after <= NOW()
                    ORDER BY priority DESC, created_at ASC
                    LIMIT $1
                    FOR UPDATE SKIP LOCKED
                )
                UPDATE jobs
                SET status = 'CLAIMED', robot_id = $2, claimed_at = NOW()
                WHERE job_id IN (SELECT job_id FROM next_jobs)
                RETURNING *
                "#,
            )
            .bind(n)
            .bind(claimant)
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;

        if !jobs.is_empty() {
            info!(claimant = %claimant, count = jobs.len(), "jobs claimed");
        }
        Ok(jobs)
    }

    pub async fn mark_running(&self, job_id: Uuid) -> Result<Job> {
        self.transition(
            job_id,
            "CLAIMED",
            "UPDATE jobs SET status = 'RUNNING', started_at = NOW() WHERE job_id = $1 AND status = 'CLAIMED' RETURNING *",
        )
        .await
    }

    pub async fn update_progress(
        &self,
        job_id: Uuid,
        progress: i32,
        current_step: Option<&str>,
    ) -> Result<()> {
        // Idempotent, and a no-op if the job is not RUNNING (§4.8 UpdateJobProgress).
        with_retry(|| async {
            sqlx::query(
                "UPDATE jobs SET progress = $1, current_step = COALESCE($2, current_step) WHERE job_id = $3 AND status = 'RUNNING'",
            )
            .bind(progress.clamp(0, 100))
            .bind(current_step)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?;
        Ok(())
    }

    pub async fn complete(&self, job_id: Uuid) -> Result<Job> {
        let job = self
            .transition(
                job_id,
                "RUNNING",
                "UPDATE jobs SET status = 'COMPLETED', completed_at = NOW(), progress = 100 WHERE job_id = $1 AND status = 'RUNNING' RETURNING *",
            )
            .await?;
        info!(job_id = %job_id, "job completed");
        Ok(job)
    }

    /// Transition RUNNING -> FAILED if retries are exhausted, otherwise back to
    /// PENDING with the next backoff delay and `retry_count` incremented.
    pub async fn fail(&self, job_id: Uuid, error: &str, backoff_table: &[i64]) -> Result<Job> {
        let current = self.get_by_id(job_id).await?;
        if current.status != JobStatus::Running {
            return Err(OrchestratorError::PreconditionFailed {
                job_id,
                expected: "RUNNING".into(),
            });
        }

        if current.retry_count >= current.max_retries {
            let job = with_retry(|| async {
                sqlx::query_as::<_, Job>(
                    "UPDATE jobs SET status = 'FAILED', completed_at = NOW(), last_error = $2, error_message = $2 WHERE job_id = $1 AND status = 'RUNNING' RETURNING *",
                )
                .bind(job_id)
                .bind(error)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
            })
            .await?
            .ok_or(OrchestratorError::PreconditionFailed {
                job_id,
                expected: "RUNNING".into(),
            })?;
            warn!(job_id = %job_id, "job failed, retries exhausted");
            Ok(job)
        } else {
            let delay = backoff_seconds(current.retry_count, backoff_table);
            let job = with_retry(|| async {
                sqlx::query_as::<_, Job>(
                    r#"
                    UPDATE jobs
                    SET status = 'PENDING', robot_id = NULL, claimed_at = NULL, started_at = NULL,
                        retry_count = retry_count + 1, visible_after = NOW() + ($2 || ' seconds')::interval,
                        last_error = $3, error_message = $3
                    WHERE job_id = $1 AND status = 'RUNNING'
                    RETURNING *
                    "#,
                )
                .bind(job_id)
                .bind(delay)
                .bind(error)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
            })
            .await?
            .ok_or(OrchestratorError::PreconditionFailed {
                job_id,
                expected: "RUNNING".into(),
            })?;
            warn!(job_id = %job_id, retry_count = job.retry_count, delay, "job failed, requeued for retry");
            Ok(job)
        }
    }

    /// Release a CLAIMED|RUNNING job back to PENDING after `delay`, clearing
    /// the claimant. Used by Recovery Manager; does not touch `retry_count`.
    pub async fn release(&self, job_id: Uuid, delay: Duration) -> Result<Job> {
        let job = with_retry(|| async {
            sqlx::query_as::<_, Job>(
                r#"
                UPDATE jobs
                SET status = 'PENDING', robot_id = NULL, claimed_at = NULL, started_at = NULL,
                    visible_after = NOW() + ($2 || ' seconds')::interval
                WHERE job_id = $1 AND status IN ('CLAIMED', 'RUNNING')
                RETURNING *
                "#,
            )
            .bind(job_id)
            .bind(delay.num_seconds())
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or(OrchestratorError::PreconditionFailed {
            job_id,
            expected: "CLAIMED or RUNNING".into(),
        })?;
        Ok(job)
    }

    /// Release a job back to PENDING with `retry_count` incremented, used when
    /// the recovery manager decides REQUEUED_FOR_RETRY rather than a plain release.
    pub async fn release_with_retry(&self, job_id: Uuid, delay: Duration) -> Result<Job> {
        let job = with_retry(|| async {
            sqlx::query_as::<_, Job>(
                r#"
                UPDATE jobs
                SET status = 'PENDING', robot_id = NULL, claimed_at = NULL, started_at = NULL,
                    retry_count = retry_count + 1,
                    visible_after = NOW() + ($2 || ' seconds')::interval
                WHERE job_id = $1 AND status IN ('CLAIMED', 'RUNNING')
                RETURNING *
                "#,
            )
            .bind(job_id)
            .bind(delay.num_seconds())
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or(OrchestratorError::PreconditionFailed {
            job_id,
            expected: "CLAIMED or RUNNING".into(),
        })?;
        Ok(job)
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<Job> {
        let job = with_retry(|| async {
            sqlx::query_as::<_, Job>(
                "UPDATE jobs SET status = 'CANCELLED', completed_at = NOW() WHERE job_id = $1 AND status IN ('PENDING', 'CLAIMED', 'RUNNING') RETURNING *",
            )
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or(OrchestratorError::PreconditionFailed {
            job_id,
            expected: "PENDING, CLAIMED or RUNNING".into(),
        })?;
        Ok(job)
    }

    /// Copy the job into `job_dlq` and delete it from `jobs`, in one transaction.
    pub async fn promote_to_dlq(&self, job_id: Uuid, reason: &str) -> Result<DlqEntry> {
        let entry = with_retry(|| async {
            let mut tx = self.pool.begin().await.map_err(OrchestratorError::classify)?;

            let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(OrchestratorError::classify)?
                .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))?;

            let final_error = job
                .last_error
                .clone()
                .map(|prev| format!("{prev}; {reason}"))
                .unwrap_or_else(|| reason.to_string());

            let entry = sqlx::query_as::<_, DlqEntry>(
                r#"
                INSERT INTO job_dlq (
                    job_id, workflow_id, workflow_name, workflow_definition, variables,
                    retry_count, max_retries, moved_at, final_error, retry_history
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, NOW(), $8, $9)
                RETURNING *
                "#,
            )
            .bind(job.job_id)
            .bind(job.workflow_id)
            .bind(&job.workflow_name)
            .bind(&job.workflow_definition)
            .bind(&job.variables)
            .bind(job.retry_count)
            .bind(job.max_retries)
            .bind(&final_error)
            .bind(serde_json::json!([]))
            .fetch_one(&mut *tx)
            .await
            .map_err(OrchestratorError::classify)?;

            sqlx::query("DELETE FROM jobs WHERE job_id = $1")
                .bind(job_id)
                .execute(&mut *tx)
                .await
                .map_err(OrchestratorError::classify)?;

            tx.commit().await.map_err(OrchestratorError::classify)?;
            Ok(entry)
        })
        .await?;

        warn!(job_id = %job_id, reason, "job promoted to DLQ");
        Ok(entry)
    }

    pub async fn get_by_id(&self, job_id: Uuid) -> Result<Job> {
        with_retry(|| async {
            sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE job_id = $1")
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::NotFound(format!("job {job_id}")))
    }

    pub async fn list(&self, status: Option<JobStatus>, limit: i64) -> Result<Vec<Job>> {
        with_retry(|| async {
            match status {
                Some(status) => {
                    sqlx::query_as::<_, Job>(
                        "SELECT * FROM jobs WHERE status = $1 ORDER BY created_at DESC LIMIT $2",
                    )
                    .bind(status)
                    .bind(limit)
                    .fetch_all(&self.pool)
                    .await
                }
                None => {
                    sqlx::query_as::<_, Job>("SELECT * FROM jobs ORDER BY created_at DESC LIMIT $1")
                        .bind(limit)
                        .fetch_all(&self.pool)
                        .await
                }
            }
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    /// Observability read: job count per status.
    pub async fn depth(&self) -> Result<Vec<(JobStatus, i64)>> {
        let rows = with_retry(|| async {
            sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
                .fetch_all(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?;

        rows.into_iter()
            .map(|row| {
                let status: JobStatus = row.try_get("status").map_err(OrchestratorError::classify)?;
                let count: i64 = row.try_get("count").map_err(OrchestratorError::classify)?;
                Ok((status, count))
            })
            .collect()
    }

    /// RUNNING/CLAIMED jobs currently assigned to `robot_id`; used by the
    /// Recovery Manager when enumerating a stale robot's in-flight work.
    pub async fn claimed_by(&self, robot_id: Uuid) -> Result<Vec<Job>> {
        with_retry(|| async {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE robot_id = $1 AND status IN ('CLAIMED', 'RUNNING')",
            )
            .bind(robot_id)
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    /// RUNNING jobs that have exceeded their per-job execution timeout,
    /// regardless of their robot's heartbeat state (§4.5).
    pub async fn timed_out(&self, timeout: Duration) -> Result<Vec<Job>> {
        with_retry(|| async {
            sqlx::query_as::<_, Job>(
                "SELECT * FROM jobs WHERE status = 'RUNNING' AND started_at < NOW() - ($1 || ' seconds')::interval",
            )
            .bind(timeout.num_seconds())
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::classify)
        })
        .await
    }

    async fn transition(&self, job_id: Uuid, expected: &str, sql: &str) -> Result<Job> {
        with_retry(|| async {
            sqlx::query_as::<_, Job>(sql)
                .bind(job_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(OrchestratorError::classify)
        })
        .await?
        .ok_or_else(|| OrchestratorError::PreconditionFailed {
            job_id,
            expected: expected.to_string(),
        })
    }
}
