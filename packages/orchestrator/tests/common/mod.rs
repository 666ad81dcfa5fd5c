//! Shared test harness: one Postgres container for the whole integration
//! test binary, migrations run once on first use.

use anyhow::{Context, Result};
use orchestrator_core::dispatch::LoadBalancingPolicy;
use orchestrator_core::Config;
use sqlx::PgPool;
use testcontainers::core::WaitFor;
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;

struct SharedInfra {
    db_url: String,
    _postgres: ContainerAsync<GenericImage>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let postgres = GenericImage::new("postgres", "16")
            .with_wait_for(WaitFor::message_on_stderr(
                "database system is ready to accept connections",
            ))
            .with_exposed_port(testcontainers::core::ContainerPort::Tcp(5432))
            .with_env_var("POSTGRES_PASSWORD", "postgres")
            .with_env_var("POSTGRES_USER", "postgres")
            .with_env_var("POSTGRES_DB", "postgres")
            .start()
            .await
            .context("failed to start postgres container")?;

        let host = postgres.get_host().await?;
        let port = postgres.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect to postgres for migrations")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        pool.close().await;

        Ok(Self { db_url, _postgres: postgres })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async { Self::init().await.expect("shared test infra init failed") })
            .await
    }
}

/// A fresh connection pool against the shared container, truncated so each
/// test starts from an empty schema regardless of what earlier tests left
/// behind.
pub async fn fresh_pool() -> PgPool {
    let infra = SharedInfra::get().await;
    let pool = PgPool::connect(&infra.db_url)
        .await
        .expect("failed to connect to test database");
    sqlx::query(
        "TRUNCATE jobs, job_dlq, checkpoints, robots, schedules, execution_history RESTART IDENTITY CASCADE",
    )
    .execute(&pool)
    .await
    .expect("failed to truncate test tables");
    pool
}

pub fn test_config() -> Config {
    Config {
        database_url: String::new(),
        http_port: 0,
        database_max_connections: 5,
        visibility_timeout_seconds: 30,
        heartbeat_timeout_seconds: 60,
        dispatch_interval_seconds: 5,
        recovery_monitor_interval_seconds: 30,
        default_job_timeout_seconds: 3600,
        default_requeue_delay_seconds: 10,
        max_retries: 5,
        retry_backoff_seconds: vec![1, 2, 4, 8, 16],
        max_concurrent_executions_per_schedule: 1,
        history_retention_days: 30,
        load_balancing: LoadBalancingPolicy::LeastLoaded,
        checkpoint_recovery_enabled: true,
        dlq_enabled: true,
        circuit_breaker_failure_threshold: 5,
        circuit_breaker_recovery_timeout_seconds: 30,
        circuit_breaker_success_threshold: 2,
    }
}
