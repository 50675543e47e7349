use anyhow::{Context, Result};
use scheduler_core::scheduler::{run_enqueue_loop, EnqueueConfig};
use scheduler_core::Config;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("failed to load configuration")?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_filter.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting scheduler enqueuer");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let enqueue_config = EnqueueConfig {
        lookahead_seconds: config.lookahead_seconds,
        max_enqueued_per_task: config.max_enqueued_per_task,
    };

    run_enqueue_loop(pool, enqueue_config).await;
    Ok(())
}
