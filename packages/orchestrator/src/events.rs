//! Typed domain events emitted on job transitions, schedule fires, robot status
//! changes, and recovery actions.
//!
//! Delivery is best-effort: the bus is an in-process [`orchestrator_engine::EventBus`]
//! broadcast channel, so a subscriber that is slow or not yet listening simply misses
//! events. The database rows are the durable record; nothing here is replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::recovery::RecoveryAction;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum OrchestratorEvent {
    JobTransitioned {
        job_id: Uuid,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    ScheduleFired {
        schedule_id: Uuid,
        job_id: Uuid,
        at: DateTime<Utc>,
    },
    RobotStatusChanged {
        robot_id: Uuid,
        from: String,
        to: String,
        at: DateTime<Utc>,
    },
    RecoveryActionTaken {
        job_id: Uuid,
        robot_id: Uuid,
        action: RecoveryAction,
        at: DateTime<Utc>,
    },
}

pub type EventBus = orchestrator_engine::EventBus;
