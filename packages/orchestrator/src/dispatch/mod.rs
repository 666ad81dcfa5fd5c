//! Dispatcher (C4): matches claimable jobs to eligible robots via a pluggable
//! load-balancing policy, then hands the job off from the orchestrator's
//! provisional claim to the chosen robot.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::anyhow;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::queue::{DurableQueue, Job, ORCHESTRATOR_CLAIMANT_ID};
use crate::robot::{Robot, RobotRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadBalancingPolicy {
    LeastLoaded,
    RoundRobin,
    Random,
    Affinity,
}

impl LoadBalancingPolicy {
    pub fn parse(s: &str) -> anyhow::Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "LEAST_LOADED" => Ok(Self::LeastLoaded),
            "ROUND_ROBIN" => Ok(Self::RoundRobin),
            "RANDOM" => Ok(Self::Random),
            "AFFINITY" => Ok(Self::Affinity),
            other => Err(anyhow!("unknown load balancing policy: {other}")),
        }
    }
}

/// Chooses a target robot for a job among `eligible`, given the configured
/// policy. Ties are always broken by `robot_id` lexicographic order so the
/// choice is deterministic for a given snapshot of robots.
pub struct Balancer {
    policy: LoadBalancingPolicy,
    round_robin_cursor: AtomicUsize,
}

impl Balancer {
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    pub fn choose<'a>(&self, job: &Job, eligible: &'a [Robot]) -> Option<&'a Robot> {
        if eligible.is_empty() {
            return None;
        }

        let mut sorted: Vec<&Robot> = eligible.iter().collect();
        sorted.sort_by(|a, b| a.robot_id.cmp(&b.robot_id));

        match self.policy {
            LoadBalancingPolicy::LeastLoaded => Self::least_loaded(&sorted),
            LoadBalancingPolicy::RoundRobin => {
                let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % sorted.len();
                Some(sorted[idx])
            }
            LoadBalancingPolicy::Random => {
                let idx = fastrand::usize(..sorted.len());
                Some(sorted[idx])
            }
            LoadBalancingPolicy::Affinity => job
                .affinity_key
                .as_deref()
                .and_then(|key| {
                    sorted
                        .iter()
                        .find(|r| r.affinity_key.as_deref() == Some(key))
                        .copied()
                })
                .or_else(|| Self::least_loaded(&sorted)),
        }
    }

    fn least_loaded<'a>(sorted: &[&'a Robot]) -> Option<&'a Robot> {
        sorted
            .iter()
            .min_by(|a, b| {
                let load_a = a.current_job_count as f64 / a.max_concurrent_jobs.max(1) as f64;
                let load_b = b.current_job_count as f64 / b.max_concurrent_jobs.max(1) as f64;
                load_a
                    .partial_cmp(&load_b)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .copied()
    }
}

pub struct Dispatcher {
    queue: DurableQueue,
    robots: RobotRegistry,
    balancer: Balancer,
    heartbeat_timeout: Duration,
    batch_size: i64,
}

impl Dispatcher {
    pub fn new(
        queue: DurableQueue,
        robots: RobotRegistry,
        policy: LoadBalancingPolicy,
        heartbeat_timeout: Duration,
        batch_size: i64,
    ) -> Self {
        Self {
            queue,
            robots,
            balancer: Balancer::new(policy),
            heartbeat_timeout,
            batch_size,
        }
    }

    /// One iteration of the dispatch loop (§4.4). Returns the number of jobs
    /// successfully handed off.
    pub async fn tick(&self) -> Result<usize> {
        let dispatchable = self.robots.list_dispatchable(self.heartbeat_timeout).await?;
        if dispatchable.is_empty() {
            return Ok(0);
        }

        let capacity: i64 = dispatchable
            .iter()
            .map(|r| r.available_capacity() as i64)
            .sum();
        if capacity == 0 {
            return Ok(0);
        }

        let candidates = self
            .queue
            .claim(ORCHESTRATOR_CLAIMANT_ID, capacity.min(self.batch_size))
            .await?;

        let mut handed_off = 0usize;
        let mut robots = dispatchable;

        for job in candidates {
            let Some(target) = self.balancer.choose(&job, &robots) else {
                self.queue.release(job.job_id, Duration::zero()).await.ok();
                continue;
            };
            let target_id = target.robot_id;

            match self.handoff(&job, target_id).await {
                Ok(()) => {
                    handed_off += 1;
                    if let Some(r) = robots.iter_mut().find(|r| r.robot_id == target_id) {
                        r.current_job_count += 1;
                    }
                }
                Err(err) => {
                    warn!(job_id = %job.job_id, robot_id = %target_id, error = %err, "handoff failed, releasing");
                    if let Err(release_err) = self.queue.release(job.job_id, Duration::zero()).await {
                        error!(job_id = %job.job_id, error = %release_err, "failed to release job after failed handoff");
                    }
                    robots.retain(|r| r.robot_id != target_id);
                }
            }
        }

        if handed_off > 0 {
            info!(count = handed_off, "dispatched jobs to robots");
        }
        Ok(handed_off)
    }

    /// Re-assign a job row from the orchestrator's provisional claim to
    /// `robot_id`, incrementing the robot's load counter.
    async fn handoff(&self, job: &Job, robot_id: Uuid) -> Result<()> {
        self.robots.increment_load(robot_id).await?;

        let reassigned = sqlx::query_scalar::<_, Uuid>(
            "UPDATE jobs SET robot_id = $2, claimed_at = NOW() WHERE job_id = $1 AND robot_id = $3 AND status = 'CLAIMED' RETURNING job_id",
        )
        .bind(job.job_id)
        .bind(robot_id)
        .bind(ORCHESTRATOR_CLAIMANT_ID)
        .fetch_optional(self.pool())
        .await
        .map_err(OrchestratorError::classify)?;

        if reassigned.is_none() {
            self.robots.decrement_load(robot_id).await.ok();
            return Err(OrchestratorError::PreconditionFailed {
                job_id: job.job_id,
                expected: "CLAIMED to orchestrator".into(),
            });
        }
        Ok(())
    }

    fn pool(&self) -> &sqlx::PgPool {
        self.queue.pool_ref()
    }

    /// Runs `tick` every `interval` until `cancel` is notified. Single-flighted:
    /// the next tick never starts before the previous one finishes.
    pub async fn run(self: Arc<Self>, interval: StdDuration, cancel: Arc<Notify>) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.notified() => {
                    info!("dispatcher loop cancelled");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(error = %err, "dispatcher tick failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn robot(id: Uuid, current: i32, max: i32, affinity: Option<&str>) -> Robot {
        Robot {
            robot_id: id,
            name: "r".into(),
            environment: "prod".into(),
            tags: vec![],
            status: crate::robot::RobotStatus::Online,
            current_job_count: current,
            max_concurrent_jobs: max,
            last_heartbeat: Utc::now(),
            affinity_key: affinity.map(|s| s.to_string()),
        }
    }

    fn job_with_affinity(affinity: Option<&str>) -> Job {
        Job::builder()
            .workflow_id(Uuid::new_v4())
            .workflow_definition(serde_json::json!({}))
            .affinity_key(affinity.unwrap_or_default().to_string())
            .build()
    }

    #[test]
    fn least_loaded_picks_lowest_ratio() {
        let a = robot(Uuid::from_u128(1), 1, 10, None);
        let b = robot(Uuid::from_u128(2), 1, 2, None);
        let balancer = Balancer::new(LoadBalancingPolicy::LeastLoaded);
        let job = job_with_affinity(None);
        let chosen = balancer.choose(&job, &[a.clone(), b.clone()]).unwrap();
        assert_eq!(chosen.robot_id, a.robot_id);
    }

    #[test]
    fn ties_broken_by_robot_id_order() {
        let a = robot(Uuid::from_u128(2), 0, 10, None);
        let b = robot(Uuid::from_u128(1), 0, 10, None);
        let balancer = Balancer::new(LoadBalancingPolicy::LeastLoaded);
        let job = job_with_affinity(None);
        let chosen = balancer.choose(&job, &[a, b]).unwrap();
        assert_eq!(chosen.robot_id, Uuid::from_u128(1));
    }

    #[test]
    fn affinity_prefers_matching_robot_over_less_loaded() {
        let a = robot(Uuid::from_u128(1), 0, 10, None);
        let b = robot(Uuid::from_u128(2), 5, 10, Some("zone-a"));
        let balancer = Balancer::new(LoadBalancingPolicy::Affinity);
        let job = job_with_affinity(Some("zone-a"));
        let chosen = balancer.choose(&job, &[a, b.clone()]).unwrap();
        assert_eq!(chosen.robot_id, b.robot_id);
    }

    #[test]
    fn affinity_falls_back_to_least_loaded_without_match() {
        let a = robot(Uuid::from_u128(1), 0, 10, None);
        let b = robot(Uuid::from_u128(2), 5, 10, Some("zone-b"));
        let balancer = Balancer::new(LoadBalancingPolicy::Affinity);
        let job = job_with_affinity(Some("zone-a"));
        let chosen = balancer.choose(&job, &[a.clone(), b]).unwrap();
        assert_eq!(chosen.robot_id, a.robot_id);
    }

    #[test]
    fn round_robin_cycles_through_eligible_robots() {
        let a = robot(Uuid::from_u128(1), 0, 10, None);
        let b = robot(Uuid::from_u128(2), 0, 10, None);
        let balancer = Balancer::new(LoadBalancingPolicy::RoundRobin);
        let job = job_with_affinity(None);
        let first = balancer.choose(&job, &[a.clone(), b.clone()]).unwrap().robot_id;
        let second = balancer.choose(&job, &[a.clone(), b.clone()]).unwrap().robot_id;
        assert_ne!(first, second);
    }

    #[test]
    fn empty_eligible_set_chooses_nothing() {
        let balancer = Balancer::new(LoadBalancingPolicy::LeastLoaded);
        let job = job_with_affinity(None);
        assert!(balancer.choose(&job, &[]).is_none());
    }

    #[test]
    fn parse_accepts_documented_spellings() {
        assert_eq!(
            LoadBalancingPolicy::parse("least_loaded").unwrap(),
            LoadBalancingPolicy::LeastLoaded
        );
        assert!(LoadBalancingPolicy::parse("bogus").is_err());
    }
}
