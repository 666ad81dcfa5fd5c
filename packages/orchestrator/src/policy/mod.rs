//! Per-Job Recovery Policy Engine (C7): when a job reports a failure, decides
//! the next action — retry, skip, fallback, compensate, abort, or escalate —
//! consulting circuit breakers along the way.

pub mod circuit_breaker;

use serde::{Deserialize, Serialize};

pub use circuit_breaker::{breaker_key, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Timeout,
    Validation,
    ExternalUnavailable,
    UiLocateFailure,
    Auth,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub node_id: String,
    pub node_kind: Option<String>,
    pub error_kind: ErrorKind,
    pub retry_count: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PolicyAction {
    Retry { delay_ms: i64 },
    Skip,
    Fallback { value: Option<serde_json::Value>, alt_node_id: Option<String> },
    Compensate { node_ids: Vec<String> },
    Abort,
    Escalate { message: String, wait_for_response: bool },
}

/// A single rule in the ordered policy list: applies when `error_kind` matches
/// (or the rule has no `error_kind` filter, i.e. matches anything) and
/// `retry_count` is within `max_retries` for RETRY rules.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    pub error_kind: Option<ErrorKind>,
    pub action: PolicyAction,
    pub max_retries: i32,
}

pub struct PolicyEngine {
    rules: Vec<PolicyRule>,
    breakers: CircuitBreakerRegistry,
    retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    pub exponential_base: f64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// `base_delay_ms * exponential_base.powi(retry_count)`, capped at
    /// `max_delay_ms`, jittered by `1.0 +/- jitter_factor`.
    pub fn delay_ms(&self, retry_count: i32) -> i64 {
        let raw = self.base_delay_ms as f64 * self.exponential_base.powi(retry_count.max(0));
        let capped = raw.min(self.max_delay_ms as f64);
        let jitter = 1.0 + (fastrand::f64() * 2.0 - 1.0) * self.jitter_factor;
        (capped * jitter).max(0.0) as i64
    }
}

impl PolicyEngine {
    pub fn new(rules: Vec<PolicyRule>, breaker_config: CircuitBreakerConfig, retry: RetryConfig) -> Self {
        Self {
            rules,
            breakers: CircuitBreakerRegistry::new(breaker_config),
            retry,
        }
    }

    /// Default policy list: retry transient/timeout errors, escalate auth
    /// failures, abort everything else — a sane starting point a deployment
    /// is expected to override via configuration per node kind / workflow.
    pub fn default_rules(max_retries: i32) -> Vec<PolicyRule> {
        vec![
            PolicyRule {
                error_kind: Some(ErrorKind::Transient),
                action: PolicyAction::Retry { delay_ms: 0 },
                max_retries,
            },
            PolicyRule {
                error_kind: Some(ErrorKind::Timeout),
                action: PolicyAction::Retry { delay_ms: 0 },
                max_retries,
            },
            PolicyRule {
                error_kind: Some(ErrorKind::ExternalUnavailable),
                action: PolicyAction::Retry { delay_ms: 0 },
                max_retries,
            },
            PolicyRule {
                error_kind: Some(ErrorKind::Auth),
                action: PolicyAction::Escalate {
                    message: "authentication failure requires operator attention".into(),
                    wait_for_response: true,
                },
                max_retries: 0,
            },
            PolicyRule {
                error_kind: None,
                action: PolicyAction::Abort,
                max_retries: 0,
            },
        ]
    }

    /// Evaluate the ordered rule list for `ctx`, applying the first match.
    /// A RETRY action denied by an OPEN breaker falls through to the next
    /// matching rule (typically ESCALATE or ABORT per §4.7).
    pub fn evaluate(&self, ctx: &ErrorContext, breaker_key: &str) -> PolicyAction {
        for (idx, rule) in self.rules.iter().enumerate() {
            let kind_matches = rule.error_kind.map(|k| k == ctx.error_kind).unwrap_or(true);
            if !kind_matches {
                continue;
            }

            if let PolicyAction::Retry { .. } = rule.action {
                if ctx.retry_count >= rule.max_retries {
                    continue;
                }
                if self.breakers.is_open(breaker_key) {
                    continue;
                }
                let delay_ms = self.retry.delay_ms(ctx.retry_count);
                return PolicyAction::Retry { delay_ms };
            }

            let _ = idx;
            return rule.action.clone();
        }

        PolicyAction::Abort
    }

    pub fn record_success(&self, breaker_key: &str) {
        self.breakers.record_success(breaker_key);
    }

    pub fn record_failure(&self, breaker_key: &str) {
        self.breakers.record_failure(breaker_key);
    }

    pub fn breaker_state(&self, breaker_key: &str) -> CircuitState {
        self.breakers.state(breaker_key)
    }
}
