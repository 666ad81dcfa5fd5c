//! Recovery Manager (C5): detects stale/failed robots and timed-out jobs,
//! and makes their in-flight work safe again — resume from checkpoint,
//! requeue for retry, or promote to DLQ.
//!
//! Grounded in the same per-job recovery algorithm as the original
//! `robot_recovery` strategy: checkpoint first, retry budget second, DLQ last.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::error::Result;
use crate::queue::{backoff_seconds, DurableQueue};
use crate::robot::{RobotRegistry, RobotStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryAction {
    ResumedFromCheckpoint,
    RequeuedForRetry,
    MovedToDlq,
    NoActionNeeded,
    RecoveryFailed,
}

#[derive(Debug, Clone)]
pub struct RecoveryResult {
    pub job_id: Uuid,
    pub action: RecoveryAction,
    pub error: Option<String>,
}

pub struct RecoveryManager {
    queue: DurableQueue,
    robots: RobotRegistry,
    checkpoints: CheckpointStore,
    heartbeat_timeout: Duration,
    job_timeout: Duration,
    default_requeue_delay: Duration,
    max_retries: i32,
    backoff_table: Vec<i64>,
    checkpoint_recovery_enabled: bool,
    dlq_enabled: bool,
}

impl RecoveryManager {
    pub fn new(
        queue: DurableQueue,
        robots: RobotRegistry,
        checkpoints: CheckpointStore,
        heartbeat_timeout: Duration,
        job_timeout: Duration,
        default_requeue_delay: Duration,
        max_retries: i32,
        backoff_table: Vec<i64>,
        checkpoint_recovery_enabled: bool,
        dlq_enabled: bool,
    ) -> Self {
        Self {
            queue,
            robots,
            checkpoints,
            heartbeat_timeout,
            job_timeout,
            default_requeue_delay,
            max_retries,
            backoff_table,
            checkpoint_recovery_enabled,
            dlq_enabled,
        }
    }

    /// One iteration of the detection loop (§4.5). Marks stale robots FAILED and
    /// recovers their in-flight jobs, then recovers any RUNNING job that has
    /// exceeded its own execution timeout regardless of robot heartbeat.
    pub async fn scan(&self) -> Result<Vec<RecoveryResult>> {
        let mut results = Vec::new();

        let stale = self.robots.list_stale(self.heartbeat_timeout).await?;
        for robot in stale {
            self.robots.set_status(robot.robot_id, RobotStatus::Failed).await?;
            warn!(robot_id = %robot.robot_id, "robot marked FAILED, recovering its jobs");

            let jobs = self.queue.claimed_by(robot.robot_id).await?;
            for job in jobs {
                results.push(self.recover_job(job.job_id).await);
            }
        }

        let timed_out = self.queue.timed_out(self.job_timeout).await?;
        for job in timed_out {
            results.push(self.recover_job(job.job_id).await);
        }

        Ok(results)
    }

    /// Runs the per-job recovery algorithm for every job currently claimed by
    /// `robot_id`, regardless of heartbeat staleness. Safe to call repeatedly:
    /// each underlying transition has a precondition predicate, so recovering
    /// an already-recovered row is a no-op.
    pub async fn manually_recover(&self, robot_id: Uuid, reason: &str) -> Result<Vec<RecoveryResult>> {
        info!(robot_id = %robot_id, reason, "manual recovery requested");
        let jobs = self.queue.claimed_by(robot_id).await?;
        let mut results = Vec::with_capacity(jobs.len());
        for job in jobs {
            results.push(self.recover_job(job.job_id).await);
        }
        Ok(results)
    }

    /// §4.5 per-job recovery algorithm.
    async fn recover_job(&self, job_id: Uuid) -> RecoveryResult {
        match self.recover_job_inner(job_id).await {
            Ok(action) => RecoveryResult { job_id, action, error: None },
            Err(err) => {
                error!(job_id = %job_id, error = %err, "recovery failed");
                RecoveryResult {
                    job_id,
                    action: RecoveryAction::RecoveryFailed,
                    error: Some(err.to_string()),
                }
            }
        }
    }

    async fn recover_job_inner(&self, job_id: Uuid) -> Result<RecoveryAction> {
        if self.checkpoint_recovery_enabled {
            if let Some(cp) = self.checkpoints.get(job_id).await? {
                if cp.state.is_resumable() {
                    // checkpoint-based resume does NOT increment retry_count.
                    match self.queue.release(job_id, self.default_requeue_delay).await {
                        Ok(_) => {
                            info!(job_id = %job_id, "resumed from checkpoint");
                            return Ok(RecoveryAction::ResumedFromCheckpoint);
                        }
                        Err(err) if matches!(err, crate::error::OrchestratorError::PreconditionFailed { .. }) => {
                            // Already recovered by a concurrent scan: idempotent no-op.
                            return Ok(RecoveryAction::NoActionNeeded);
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }

        let job = match self.queue.get_by_id(job_id).await {
            Ok(job) => job,
            Err(crate::error::OrchestratorError::NotFound(_)) => {
                return Ok(RecoveryAction::NoActionNeeded);
            }
            Err(err) => return Err(err),
        };

        if !matches!(job.status, crate::queue::JobStatus::Claimed | crate::queue::JobStatus::Running) {
            return Ok(RecoveryAction::NoActionNeeded);
        }

        if job.retry_count < self.max_retries {
            let delay = Duration::seconds(backoff_seconds(job.retry_count, &self.backoff_table));
            match self.queue.release_with_retry(job_id, delay).await {
                Ok(j) => {
                    info!(job_id = %job_id, retry_count = j.retry_count, "requeued for retry");
                    Ok(RecoveryAction::RequeuedForRetry)
                }
                Err(crate::error::OrchestratorError::PreconditionFailed { .. }) => {
                    Ok(RecoveryAction::NoActionNeeded)
                }
                Err(err) => Err(err),
            }
        } else if self.dlq_enabled {
            self.queue
                .promote_to_dlq(job_id, "retries exhausted during recovery")
                .await?;
            Ok(RecoveryAction::MovedToDlq)
        } else {
            match self.queue.cancel(job_id).await {
                Ok(_) => Ok(RecoveryAction::MovedToDlq),
                Err(crate::error::OrchestratorError::PreconditionFailed { .. }) => {
                    Ok(RecoveryAction::NoActionNeeded)
                }
                Err(err) => Err(err),
            }
        }
    }

    pub async fn run(self: Arc<Self>, interval: StdDuration, cancel: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.notified() => {
                    info!("recovery monitor cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    match self.scan().await {
                        Ok(results) if !results.is_empty() => {
                            info!(count = results.len(), "recovery scan completed");
                        }
                        Ok(_) => {}
                        Err(err) => error!(error = %err, "recovery scan failed"),
                    }
                }
            }
        }
    }
}
