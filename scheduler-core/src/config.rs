use anyhow::{Context, Result};
use dotenvy::dotenv;
use std::env;

use crate::retry::{BackoffStyle, RetryPolicy};

/// Process configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub lookahead_seconds: i64,
    pub max_enqueued_per_task: i64,
    pub claim_batch_size: i64,
    pub lease_timeout_seconds: i64,
    pub default_retry_policy: RetryPolicy,
    pub worker_poll_interval_seconds: u64,
    pub log_filter: String,
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// reference defaults from the design for anything unset.
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            lookahead_seconds: env_parse("SCHEDULER_LOOKAHEAD_SECONDS", 60)?,
            max_enqueued_per_task: env_parse("SCHEDULER_MAX_ENQUEUED_PER_TASK", 100)?,
            claim_batch_size: env_parse("SCHEDULER_CLAIM_BATCH_SIZE", 10)?,
            lease_timeout_seconds: env_parse("SCHEDULER_LEASE_TIMEOUT_SECONDS", 600)?,
            default_retry_policy: default_retry_policy_from_env()?,
            worker_poll_interval_seconds: env_parse("SCHEDULER_WORKER_POLL_INTERVAL_SECONDS", 5)?,
            log_filter: env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,scheduler_core=debug,sqlx=warn".to_string()),
        })
    }
}

/// `default_retry_policy`, overridable per-field via environment variables,
/// falling back to the reference default `{max_attempts:3, backoff:exponential,
/// base_seconds:30}` (spec §6.4) for anything unset.
fn default_retry_policy_from_env() -> Result<RetryPolicy> {
    let defaults = RetryPolicy::default();
    let backoff = match env::var("SCHEDULER_DEFAULT_RETRY_BACKOFF") {
        Ok(raw) => match raw.as_str() {
            "exponential" => BackoffStyle::Exponential,
            "constant" => BackoffStyle::Constant,
            other => anyhow::bail!("SCHEDULER_DEFAULT_RETRY_BACKOFF must be exponential or constant, got {other:?}"),
        },
        Err(_) => defaults.backoff,
    };
    Ok(RetryPolicy {
        max_attempts: env_parse("SCHEDULER_DEFAULT_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
        backoff,
        base_seconds: env_parse("SCHEDULER_DEFAULT_RETRY_BASE_SECONDS", defaults.base_seconds)?,
    })
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} must be a valid number: {e}")),
        Err(_) => Ok(default),
    }
}
