use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::dispatch::LoadBalancingPolicy;

/// All tunables enumerated by the control plane, with the documented defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_port: u16,
    pub database_max_connections: u32,

    pub visibility_timeout_seconds: i64,
    pub heartbeat_timeout_seconds: i64,
    pub dispatch_interval_seconds: u64,
    pub recovery_monitor_interval_seconds: u64,
    pub default_job_timeout_seconds: i64,
    pub default_requeue_delay_seconds: i64,
    pub max_retries: i32,
    pub retry_backoff_seconds: Vec<i64>,
    pub max_concurrent_executions_per_schedule: i32,
    pub history_retention_days: i64,
    pub load_balancing: LoadBalancingPolicy,
    pub checkpoint_recovery_enabled: bool,
    pub dlq_enabled: bool,

    pub circuit_breaker_failure_threshold: u32,
    pub circuit_breaker_recovery_timeout_seconds: i64,
    pub circuit_breaker_success_threshold: u32,
}

impl Config {
    /// Load configuration from environment variables, failing fast on anything
    /// required but missing or malformed. `.env` is loaded first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            http_port: env_parse_or("HTTP_PORT", 8080)?,
            database_max_connections: env_parse_or("DATABASE_MAX_CONNECTIONS", 10)?,

            visibility_timeout_seconds: env_parse_or("VISIBILITY_TIMEOUT_SECONDS", 30)?,
            heartbeat_timeout_seconds: env_parse_or("HEARTBEAT_TIMEOUT_SECONDS", 60)?,
            dispatch_interval_seconds: env_parse_or("DISPATCH_INTERVAL_SECONDS", 5)?,
            recovery_monitor_interval_seconds: env_parse_or(
                "RECOVERY_MONITOR_INTERVAL_SECONDS",
                30,
            )?,
            default_job_timeout_seconds: env_parse_or("DEFAULT_JOB_TIMEOUT_SECONDS", 3600)?,
            default_requeue_delay_seconds: env_parse_or("DEFAULT_REQUEUE_DELAY_SECONDS", 10)?,
            max_retries: env_parse_or("MAX_RETRIES", 5)?,
            retry_backoff_seconds: env::var("RETRY_BACKOFF_SECONDS")
                .ok()
                .map(|s| {
                    s.split(',')
                        .map(|p| p.trim().parse::<i64>())
                        .collect::<std::result::Result<Vec<_>, _>>()
                        .context("RETRY_BACKOFF_SECONDS must be a comma-separated list of integers")
                })
                .transpose()?
                .unwrap_or_else(|| vec![10, 60, 300, 900, 3600]),
            max_concurrent_executions_per_schedule: env_parse_or(
                "MAX_CONCURRENT_EXECUTIONS_PER_SCHEDULE",
                3,
            )?,
            history_retention_days: env_parse_or("HISTORY_RETENTION_DAYS", 30)?,
            load_balancing: env::var("LOAD_BALANCING")
                .ok()
                .map(|s| LoadBalancingPolicy::parse(&s))
                .transpose()?
                .unwrap_or(LoadBalancingPolicy::LeastLoaded),
            checkpoint_recovery_enabled: env_parse_or("CHECKPOINT_RECOVERY_ENABLED", true)?,
            dlq_enabled: env_parse_or("DLQ_ENABLED", true)?,

            circuit_breaker_failure_threshold: env_parse_or("CIRCUIT_BREAKER_FAILURE_THRESHOLD", 5)?,
            circuit_breaker_recovery_timeout_seconds: env_parse_or(
                "CIRCUIT_BREAKER_RECOVERY_TIMEOUT_SECONDS",
                30,
            )?,
            circuit_breaker_success_threshold: env_parse_or(
                "CIRCUIT_BREAKER_SUCCESS_THRESHOLD",
                2,
            )?,
        })
    }
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("{key} must be valid: {e}")),
        Err(_) => Ok(default),
    }
}
