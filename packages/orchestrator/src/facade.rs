//! Orchestrator Facade (C8): the single public entry point the HTTP surface
//! and embedding applications use. Owns every background loop's lifecycle and
//! is the sole emitter on the [`EventBus`].

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::checkpoint::CheckpointStore;
use crate::config::Config;
use crate::dispatch::{Dispatcher, LoadBalancingPolicy};
use crate::error::Result;
use crate::events::{EventBus, OrchestratorEvent};
use crate::policy::{breaker_key, CircuitBreakerConfig, ErrorContext, ErrorKind, PolicyAction, PolicyEngine, RetryConfig};
use crate::queue::{DurableQueue, Job, JobStatus};
use crate::recovery::RecoveryManager;
use crate::robot::{Robot, RobotRegistry, RobotStatus};
use crate::schedule::{Frequency, Schedule, ScheduleEngine};

struct BackgroundLoop {
    cancel: Arc<Notify>,
}

impl BackgroundLoop {
    fn stop(&self) {
        self.cancel.notify_waiters();
    }
}

/// Public control-plane API. Clone is cheap: every field is a pool/registry
/// handle or an `Arc`.
#[derive(Clone)]
pub struct Orchestrator {
    pub queue: DurableQueue,
    pub robots: RobotRegistry,
    pub checkpoints: CheckpointStore,
    pub dispatcher: Arc<Dispatcher>,
    pub recovery: Arc<RecoveryManager>,
    pub schedules: Arc<ScheduleEngine>,
    pub policy: Arc<PolicyEngine>,
    pub events: EventBus,
    config: Config,
    loops: Arc<std::sync::Mutex<Vec<BackgroundLoop>>>,
}

impl Orchestrator {
    pub fn new(pool: PgPool, config: Config) -> Self {
        let queue = DurableQueue::new(pool.clone());
        let robots = RobotRegistry::new(pool.clone());
        let checkpoints = CheckpointStore::new(pool.clone());

        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            robots.clone(),
            config.load_balancing,
            Duration::seconds(config.heartbeat_timeout_seconds),
            20,
        ));

        let recovery = Arc::new(RecoveryManager::new(
            queue.clone(),
            robots.clone(),
            checkpoints.clone(),
            Duration::seconds(config.heartbeat_timeout_seconds),
            Duration::seconds(config.default_job_timeout_seconds),
            Duration::seconds(config.default_requeue_delay_seconds),
            config.max_retries,
            config.retry_backoff_seconds.clone(),
            config.checkpoint_recovery_enabled,
            config.dlq_enabled,
        ));

        let schedules = Arc::new(ScheduleEngine::new(
            pool.clone(),
            queue.clone(),
            Duration::days(config.history_retention_days),
        ));

        let policy = Arc::new(PolicyEngine::new(
            PolicyEngine::default_rules(config.max_retries),
            CircuitBreakerConfig {
                failure_threshold: config.circuit_breaker_failure_threshold,
                recovery_timeout: Duration::seconds(config.circuit_breaker_recovery_timeout_seconds),
                success_threshold: config.circuit_breaker_success_threshold,
            },
            RetryConfig::default(),
        ));

        let events = EventBus::with_capacity(1024);

        Self {
            queue,
            robots,
            checkpoints,
            dispatcher,
            recovery,
            schedules,
            policy,
            events,
            config,
            loops: Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    /// Starts the dispatcher, recovery monitor, and schedule tick loops as
    /// background tasks. Idempotent to call once per facade instance; calling
    /// it twice spawns duplicate loops.
    pub fn start(&self) {
        self.spawn_loop(
            StdDuration::from_secs(self.config.dispatch_interval_seconds),
            self.dispatcher.clone(),
            |d, interval, cancel| tokio::spawn(d.run(interval, cancel)),
        );
        self.spawn_loop(
            StdDuration::from_secs(self.config.recovery_monitor_interval_seconds),
            self.recovery.clone(),
            |r, interval, cancel| tokio::spawn(r.run(interval, cancel)),
        );
        self.spawn_loop(
            StdDuration::from_secs(1),
            self.schedules.clone(),
            |s, interval, cancel| tokio::spawn(s.run(interval, cancel)),
        );
        info!("orchestrator background loops started");
    }

    fn spawn_loop<T: Send + Sync + 'static>(
        &self,
        interval: StdDuration,
        component: Arc<T>,
        run: impl FnOnce(Arc<T>, StdDuration, Arc<Notify>) -> tokio::task::JoinHandle<()>,
    ) {
        let cancel = Arc::new(Notify::new());
        run(component, interval, cancel.clone());
        self.loops.lock().expect("loops mutex poisoned").push(BackgroundLoop { cancel });
    }

    /// Signals every background loop to stop. Does not wait for them to
    /// finish their current iteration.
    pub fn stop(&self) {
        let loops = self.loops.lock().expect("loops mutex poisoned");
        for l in loops.iter() {
            l.stop();
        }
        info!("orchestrator background loops signalled to stop");
    }

    pub async fn submit_job(&self, job: Job, dedupe: bool) -> Result<Job> {
        let job = self.queue.enqueue(job, dedupe).await?;
        self.emit_transition(job.job_id, "NONE", "PENDING");
        Ok(job)
    }

    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.queue.cancel(job_id).await?;
        self.checkpoints.delete(job_id).await.ok();
        self.emit_transition(job_id, "RUNNING", "CANCELLED");
        Ok(job)
    }

    /// Operator-triggered retry of a FAILED or CANCELLED job (§4.8 RetryJob).
    /// Does not touch the original row; creates and enqueues a fresh job with
    /// a new `job_id` carrying the same workflow payload, so the original
    /// stays in the history as-is.
    pub async fn retry_job(&self, job_id: Uuid) -> Result<Job> {
        let original = self.queue.get_by_id(job_id).await?;
        if !matches!(original.status, JobStatus::Failed | JobStatus::Cancelled) {
            return Err(crate::error::OrchestratorError::PreconditionFailed {
                job_id,
                expected: "FAILED or CANCELLED".into(),
            });
        }

        let mut fresh = Job::builder()
            .workflow_id(original.workflow_id)
            .workflow_definition(original.workflow_definition.clone())
            .variables(original.variables.clone())
            .priority(original.priority)
            .tags(original.tags.clone())
            .build();
        fresh.workflow_name = original.workflow_name.clone();
        fresh.tenant_id = original.tenant_id.clone();
        fresh.affinity_key = original.affinity_key.clone();

        let fresh = self.queue.enqueue(fresh, false).await?;
        self.emit_transition(fresh.job_id, "NONE", "PENDING");
        Ok(fresh)
    }

    pub async fn update_job_progress(&self, job_id: Uuid, progress: i32, current_step: Option<&str>) -> Result<()> {
        self.queue.update_progress(job_id, progress, current_step).await
    }

    pub async fn complete_job(&self, job_id: Uuid) -> Result<Job> {
        let job = self.queue.complete(job_id).await?;
        self.checkpoints.delete(job_id).await.ok();
        if let Some(robot_id) = job.robot_id {
            self.robots.decrement_load(robot_id).await.ok();
            self.policy.record_success(&breaker_key(&robot_id.to_string(), None, &job.workflow_id.to_string()));
        }
        self.schedules.record_job_outcome(job_id, true).await.ok();
        self.emit_transition(job_id, "RUNNING", "COMPLETED");
        Ok(job)
    }

    /// Transitions the job per the Durable Queue's own retry budget, then
    /// consults the Policy Engine (§4.8 FailJob: "trigger policy engine on
    /// failure") to classify the error, update the circuit breaker, and log
    /// the resulting action. The queue's retry-vs-fail decision is
    /// authoritative for the row; the policy engine's verdict governs the
    /// breaker and is surfaced via `OrchestratorEvent` for an ESCALATE/ABORT
    /// action so an operator or downstream consumer can react.
    pub async fn fail_job(&self, job_id: Uuid, error: &str) -> Result<Job> {
        let job = self.queue.fail(job_id, error, &self.config.retry_backoff_seconds).await?;

        let key = job
            .robot_id
            .map(|r| breaker_key(&r.to_string(), None, &job.workflow_id.to_string()))
            .unwrap_or_else(|| breaker_key("unknown", None, &job.workflow_id.to_string()));

        let action = self.policy.evaluate(
            &ErrorContext {
                node_id: job_id.to_string(),
                node_kind: None,
                error_kind: ErrorKind::Unknown,
                retry_count: job.retry_count,
                message: error.to_string(),
            },
            &key,
        );

        if job.status == JobStatus::Failed {
            self.policy.record_failure(&key);
            self.schedules.record_job_outcome(job_id, false).await.ok();
        } else {
            self.policy.record_success(&key);
        }

        match &action {
            PolicyAction::Escalate { message, .. } => {
                tracing::warn!(job_id = %job_id, %message, "policy engine escalated job failure");
            }
            PolicyAction::Abort => {
                tracing::warn!(job_id = %job_id, "policy engine aborted further handling of job failure");
            }
            _ => {}
        }

        if let Some(robot_id) = job.robot_id {
            self.robots.decrement_load(robot_id).await.ok();
        }
        let to = if job.status == JobStatus::Failed { "FAILED" } else { "PENDING" };
        self.emit_transition(job_id, "RUNNING", to);
        Ok(job)
    }

    pub async fn register_robot(
        &self,
        robot_id: Uuid,
        name: &str,
        environment: &str,
        tags: &[String],
        max_concurrent_jobs: i32,
        affinity_key: Option<&str>,
    ) -> Result<Robot> {
        self.robots
            .register(robot_id, name, environment, tags, max_concurrent_jobs, affinity_key)
            .await
    }

    pub async fn heartbeat(&self, robot_id: Uuid) -> Result<()> {
        self.robots.heartbeat(robot_id).await
    }

    pub async fn update_robot_status(&self, robot_id: Uuid, status: RobotStatus) -> Result<Robot> {
        let before = self.robots.get(robot_id).await?;
        let robot = self.robots.set_status(robot_id, status).await?;
        self.events.emit(OrchestratorEvent::RobotStatusChanged {
            robot_id,
            from: format!("{:?}", before.status).to_uppercase(),
            to: format!("{:?}", robot.status).to_uppercase(),
            at: Utc::now(),
        });
        Ok(robot)
    }

    pub async fn create_schedule(
        &self,
        name: String,
        workflow_id: Uuid,
        frequency: Frequency,
        priority: i32,
    ) -> Result<Schedule> {
        let schedule = Schedule::builder()
            .name(name)
            .workflow_id(workflow_id)
            .frequency(frequency)
            .priority(priority)
            .next_run(Utc::now())
            .build();
        self.schedules.add_schedule(schedule).await
    }

    pub async fn toggle_schedule(&self, schedule_id: Uuid, enabled: bool) -> Result<Schedule> {
        self.schedules.enable_schedule(schedule_id, enabled).await
    }

    pub async fn delete_schedule(&self, schedule_id: Uuid) -> Result<()> {
        self.schedules.delete_schedule(schedule_id).await
    }

    pub async fn upcoming_schedules(&self, limit: i64) -> Result<Vec<Schedule>> {
        self.schedules.list_upcoming(limit).await
    }

    pub async fn queue_stats(&self) -> Result<Vec<(JobStatus, i64)>> {
        self.queue.depth().await
    }

    pub async fn dispatcher_tick(&self) -> Result<usize> {
        self.dispatcher.tick().await
    }

    fn emit_transition(&self, job_id: Uuid, from: &str, to: &str) {
        let at: DateTime<Utc> = Utc::now();
        self.events.emit(OrchestratorEvent::JobTransitioned {
            job_id,
            from: from.to_string(),
            to: to.to_string(),
            at,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bus_delivers_to_a_live_subscriber() {
        let bus = EventBus::with_capacity(8);
        let mut rx = bus.subscribe();
        bus.emit(OrchestratorEvent::RobotStatusChanged {
            robot_id: Uuid::new_v4(),
            from: "ONLINE".into(),
            to: "OFFLINE".into(),
            at: Utc::now(),
        });
        let envelope = rx.try_recv().expect("event should be delivered");
        assert!(envelope.downcast_ref::<OrchestratorEvent>().is_some());
    }
}
