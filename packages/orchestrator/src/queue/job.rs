//! The `Job` row model: a single workflow execution request.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;
use typed_builder::TypedBuilder;
use uuid::Uuid;

/// A scalar variable value passed into a workflow instance. Kept deliberately
/// narrow — the orchestrator does not interpret the workflow blob or its
/// variables, it only carries them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Scalar {
    String(String),
    Number(f64),
    Bool(bool),
    Null,
}

pub type Variables = BTreeMap<String, Scalar>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Queued,
    Claimed,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Queued => "QUEUED",
            JobStatus::Claimed => "CLAIMED",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TypedBuilder)]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub job_id: Uuid,

    pub workflow_id: Uuid,
    #[builder(default, setter(strip_option))]
    pub workflow_name: Option<String>,
    /// Opaque blob — the orchestrator never parses this.
    pub workflow_definition: serde_json::Value,
    #[builder(default)]
    pub variables: serde_json::Value,
    #[builder(default, setter(strip_option))]
    pub tenant_id: Option<String>,
    #[builder(default)]
    pub tags: Vec<String>,

    #[builder(default = 5)]
    pub priority: i32,
    #[builder(default = Utc::now())]
    pub visible_after: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = JobStatus::Pending)]
    pub status: JobStatus,
    #[builder(default, setter(strip_option))]
    pub robot_id: Option<Uuid>,
    #[builder(default, setter(strip_option))]
    pub claimed_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub completed_at: Option<DateTime<Utc>>,
    #[builder(default = 0)]
    pub progress: i32,
    #[builder(default, setter(strip_option))]
    pub current_step: Option<String>,

    #[builder(default = 0)]
    pub retry_count: i32,
    #[builder(default = 5)]
    pub max_retries: i32,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,
    #[builder(default, setter(strip_option))]
    pub error_message: Option<String>,

    /// Preference steering dispatch toward a robot with a matching
    /// `affinity_key` (§4.4 AFFINITY policy). Not a hard constraint.
    #[builder(default, setter(strip_option))]
    pub affinity_key: Option<String>,

    /// Fingerprint of `(workflow_id, canonicalized variables)`, used by
    /// `Enqueue` deduplication.
    #[builder(default, setter(strip_option))]
    pub dedupe_key: Option<String>,
}

impl Job {
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.visible_after <= now
    }

    /// SHA-256 of `(workflow_id, canonicalized variables)`, used by `Enqueue`
    /// deduplication. Persisted across process restarts, so the digest must
    /// be stable independent of `std`'s hasher implementation.
    pub fn fingerprint(workflow_id: Uuid, variables: &serde_json::Value) -> String {
        use sha2::{Digest, Sha256};

        let canonical = canonicalize(variables);
        let mut hasher = Sha256::new();
        hasher.update(workflow_id.as_bytes());
        hasher.update(canonical.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

/// Serialize with sorted object keys so semantically identical variable
/// maps hash identically regardless of insertion order.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            let inner: Vec<String> = entries
                .into_iter()
                .map(|(k, v)| format!("{k}:{}", canonicalize(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}
