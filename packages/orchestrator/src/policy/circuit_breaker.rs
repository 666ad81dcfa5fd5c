//! Circuit breaker state machine, keyed by `(robot_id, node_kind)` with a
//! fallback to a workflow-wide key when `node_kind` is absent (see
//! SPEC_FULL.md Open Question decisions).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::seconds(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            last_transition_at: Utc::now(),
        }
    }
}

/// One breaker per key, held in memory and protected by a single mutex — no
/// component in this control plane ever holds more than one lock at a time.
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, BreakerState>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Applies the OPEN -> HALF_OPEN auto-transition (on timeout elapsed) before
    /// answering, mirroring a lazily-evaluated `is_open` property.
    pub fn is_open(&self, key: &str) -> bool {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(key.to_string()).or_insert_with(BreakerState::new);
        self.maybe_half_open(entry);
        entry.state == CircuitState::Open
    }

    pub fn record_success(&self, key: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(key.to_string()).or_insert_with(BreakerState::new);
        self.maybe_half_open(entry);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.success_count += 1;
                if entry.success_count >= self.config.success_threshold {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.success_count = 0;
                    entry.last_transition_at = Utc::now();
                }
            }
            CircuitState::Closed => {
                entry.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, key: &str) {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(key.to_string()).or_insert_with(BreakerState::new);
        self.maybe_half_open(entry);

        entry.failure_count += 1;
        entry.last_failure_at = Some(Utc::now());

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.success_count = 0;
                entry.last_transition_at = Utc::now();
            }
            CircuitState::Closed => {
                if entry.failure_count >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.last_transition_at = Utc::now();
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self, key: &str) -> CircuitState {
        let mut breakers = self.breakers.lock().unwrap();
        let entry = breakers.entry(key.to_string()).or_insert_with(BreakerState::new);
        self.maybe_half_open(entry);
        entry.state
    }

    fn maybe_half_open(&self, entry: &mut BreakerState) {
        if entry.state == CircuitState::Open {
            if let Some(last_failure) = entry.last_failure_at {
                if Utc::now() - last_failure >= self.config.recovery_timeout {
                    entry.state = CircuitState::HalfOpen;
                    entry.success_count = 0;
                    entry.last_transition_at = Utc::now();
                }
            }
        }
    }
}

/// `(robot_id, node_kind)` when both are known; falls back to a workflow-wide
/// key when `node_kind` is absent from the error context.
pub fn breaker_key(robot_id: &str, node_kind: Option<&str>, workflow_id: &str) -> String {
    match node_kind {
        Some(kind) => format!("{robot_id}:{kind}"),
        None => format!("workflow:{workflow_id}"),
    }
}
