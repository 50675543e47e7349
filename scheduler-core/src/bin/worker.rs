use std::sync::Arc;

use anyhow::{Context, Result};
use scheduler_core::handler::{HandlerOutcome, HandlerRegistry};
use scheduler_core::worker::{run_worker_loop, WorkerConfig};
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

    tracing::info!("starting scheduler worker");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("failed to connect to database")?;

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .context("failed to run migrations")?;

    let mut registry = HandlerRegistry::new();
    registry.register("noop", |_ctx, _payload| async move {
        HandlerOutcome::Success(serde_json::Value::Null)
    });
    let registry = Arc::new(registry);

    let worker_config = WorkerConfig {
        claim_batch_size: config.claim_batch_size,
        lease_timeout_seconds: config.lease_timeout_seconds,
        poll_interval: std::time::Duration::from_secs(config.worker_poll_interval_seconds),
        default_retry_policy: config.default_retry_policy,
        ..WorkerConfig::default()
    };

    run_worker_loop(pool, registry, worker_config).await;
    Ok(())
}
