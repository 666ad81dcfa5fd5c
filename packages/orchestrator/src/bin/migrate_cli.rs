//! Runs pending migrations against `DATABASE_URL` and exits — used in deploy
//! pipelines separately from the long-running server process.

use anyhow::{Context, Result};
use clap::Parser;
use orchestrator_core::Config;
use sqlx::postgres::PgPoolOptions;

#[derive(Parser)]
#[command(name = "migrate_cli")]
#[command(about = "Run orchestrator database migrations")]
struct Cli {
    /// Print pending migrations without applying them.
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let config = Config::from_env().context("failed to load configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    let migrator = sqlx::migrate!("./migrations");

    if cli.dry_run {
        for migration in migrator.iter() {
            println!("{} {}", migration.version, migration.description);
        }
        return Ok(());
    }

    migrator.run(&pool).await.context("failed to run migrations")?;
    println!("migrations applied");
    Ok(())
}
