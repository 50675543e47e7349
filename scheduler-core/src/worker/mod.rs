//! Worker loop: reclaims expired leases, claims a batch of ready
//! occurrences, and executes each claim in its own transaction.
//!
//! ```text
//! WorkerLoop
//!     │
//!     ├─► reclaim_expired_leases (lease recovery pass)
//!     ├─► claim_batch (SELECT ... FOR UPDATE SKIP LOCKED + UPDATE RETURNING)
//!     └─► for each claim, in its own transaction:
//!             ├─► concurrency fence check
//!             ├─► insert Execution(attempt_no, running)
//!             ├─► dispatch to Handler
//!             └─► terminal transition (executed / failed / retry)
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use futures::FutureExt;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::handler::{HandlerOutcome, HandlerRegistry, TaskContext};
use crate::ledger::{ClaimedOccurrence, Execution, Occurrence, Task};
use crate::retry::{decide, RetryDecision, RetryPolicy};

/// Tunables for the worker loop, grounded on the reference defaults.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub claim_batch_size: i64,
    pub lease_timeout_seconds: i64,
    pub poll_interval: StdDuration,
    pub default_retry_policy: RetryPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            claim_batch_size: 10,
            lease_timeout_seconds: 600,
            poll_interval: StdDuration::from_secs(5),
            default_retry_policy: RetryPolicy::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// Run one cycle: lease recovery, claim, and sequential processing of the
/// claimed batch. Returns the number of occurrences processed.
pub async fn run_cycle(
    pool: &PgPool,
    registry: &HandlerRegistry,
    config: &WorkerConfig,
) -> Result<usize, sqlx::Error> {
    let now = Utc::now();

    let reclaimed = Occurrence::reclaim_expired_leases(config.lease_timeout_seconds, now, pool).await?;
    if reclaimed > 0 {
        warn!(count = reclaimed, worker_id = %config.worker_id, "re-enqueued stale running occurrences");
    }

    let claimed = Occurrence::claim_batch(&config.worker_id, now, config.claim_batch_size, pool).await?;
    if claimed.is_empty() {
        return Ok(0);
    }
    debug!(count = claimed.len(), worker_id = %config.worker_id, "claimed occurrences");

    let mut processed = 0;
    for claim in claimed {
        processed += process_occurrence(
            pool,
            registry,
            &config.worker_id,
            &config.default_retry_policy,
            claim,
        )
        .await?;
    }
    Ok(processed)
}

/// Process a single claimed occurrence to completion. Returns 1 if the
/// occurrence was actually dispatched to a handler, 0 if it was deferred
/// (missing task, race lost, concurrency fence).
async fn process_occurrence(
    pool: &PgPool,
    registry: &HandlerRegistry,
    worker_id: &str,
    default_retry_policy: &RetryPolicy,
    claim: ClaimedOccurrence,
) -> Result<usize, sqlx::Error> {
    let Some(occurrence) = Occurrence::find(claim.id, pool).await.map_err(ledger_to_sqlx)? else {
        return Ok(0);
    };
    if occurrence.state != crate::ledger::OccurrenceState::Running {
        return Ok(0);
    }

    let Some(task) = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(claim.task_id)
        .fetch_optional(pool)
        .await?
    else {
        error!(occurrence_id = claim.id, "missing task for occurrence");
        Occurrence::mark_failed(claim.id, "task missing", pool).await.map_err(ledger_to_sqlx)?;
        return Ok(0);
    };

    if task.concurrency_limit > 0 {
        let running = Occurrence::count_running_excluding_worker(task.id, occurrence.id, worker_id, pool)
            .await
            .map_err(ledger_to_sqlx)?;
        if running >= task.concurrency_limit as i64 {
            Occurrence::defer_for_concurrency(claim.id, Utc::now() + chrono::Duration::seconds(1), pool)
                .await
                .map_err(ledger_to_sqlx)?;
            return Ok(0);
        }
    }

    let started_at = Utc::now();
    let mut tx = pool.begin().await?;
    let execution = Execution::start_next_attempt(task.id, occurrence.id, worker_id, started_at, &mut tx)
        .await
        .map_err(ledger_to_sqlx)?;
    tx.commit().await?;

    let ctx = TaskContext {
        occurrence_id: occurrence.id,
        task_id: task.id,
        name: task.name.clone(),
        scheduled_for: occurrence.scheduled_for,
        now: started_at,
    };
    let payload = task.payload.clone().unwrap_or(serde_json::Value::Null);

    let outcome = match registry.resolve(&task.handler) {
        Ok(handler) => match AssertUnwindSafe(handler.call(ctx, payload)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(&panic);
                let finished_at = Utc::now();
                Execution::complete_failed(execution.id, finished_at, "panic", &message, pool)
                    .await
                    .map_err(ledger_to_sqlx)?;
                Occurrence::mark_failed(occurrence.id, &message, pool).await.map_err(ledger_to_sqlx)?;
                Task::mark_run(task.id, "failed", finished_at, pool).await.map_err(ledger_to_sqlx)?;
                error!(task_id = task.id, occurrence_id = occurrence.id, attempt = execution.attempt_no, worker_id, error = %message, "handler panicked");
                return Ok(1);
            }
        },
        Err(e) => HandlerOutcome::Fatal(e.to_string()),
    };

    let finished_at = Utc::now();
    match outcome {
        HandlerOutcome::Success(result) => {
            Execution::complete_succeeded(execution.id, finished_at, result, pool).await.map_err(ledger_to_sqlx)?;
            Occurrence::mark_executed(occurrence.id, finished_at, pool).await.map_err(ledger_to_sqlx)?;
            Task::mark_run(task.id, "succeeded", finished_at, pool).await.map_err(ledger_to_sqlx)?;
            info!(task_id = task.id, occurrence_id = occurrence.id, attempt = execution.attempt_no, worker_id, "handler succeeded");
        }
        HandlerOutcome::Retry(message) => {
            Execution::complete_failed(execution.id, finished_at, "retryable", &message, pool).await.map_err(ledger_to_sqlx)?;
            let policy = task.retry_policy_or(default_retry_policy);
            match decide(&policy, execution.attempt_no, finished_at) {
                RetryDecision::RetryAt(at) => {
                    Occurrence::mark_enqueued_for_retry(occurrence.id, at, &message, pool).await.map_err(ledger_to_sqlx)?;
                }
                RetryDecision::Exhausted => {
                    Occurrence::mark_failed(occurrence.id, &message, pool).await.map_err(ledger_to_sqlx)?;
                }
            }
            Task::mark_run(task.id, "failed", finished_at, pool).await.map_err(ledger_to_sqlx)?;
            warn!(task_id = task.id, occurrence_id = occurrence.id, attempt = execution.attempt_no, worker_id, error = %message, "handler requested retry");
        }
        HandlerOutcome::Fatal(message) => {
            Execution::complete_failed(execution.id, finished_at, "fatal", &message, pool).await.map_err(ledger_to_sqlx)?;
            Occurrence::mark_failed(occurrence.id, &message, pool).await.map_err(ledger_to_sqlx)?;
            Task::mark_run(task.id, "failed", finished_at, pool).await.map_err(ledger_to_sqlx)?;
            error!(task_id = task.id, occurrence_id = occurrence.id, attempt = execution.attempt_no, worker_id, error = %message, "handler fatal error");
        }
    }

    Ok(1)
}

/// Extract a human-readable message from a caught panic payload, the same
/// way a panic hook would format `panic!("...")` / `panic!("{}", x)` values.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked with a non-string payload".to_string()
    }
}

fn ledger_to_sqlx(e: crate::error::LedgerError) -> sqlx::Error {
    match e {
        crate::error::LedgerError::Database(db) => db,
        other => sqlx::Error::Protocol(other.to_string()),
    }
}

/// Run the worker loop forever: poll for work, sleep when idle.
pub async fn run_worker_loop(pool: PgPool, registry: Arc<HandlerRegistry>, config: WorkerConfig) {
    info!(worker_id = %config.worker_id, batch_size = config.claim_batch_size, "worker starting");

    loop {
        match run_cycle(&pool, &registry, &config).await {
            Ok(0) => tokio::time::sleep(config.poll_interval).await,
            Ok(_) => {}
            Err(e) => {
                error!(error = %e, "worker cycle failed");
                tokio::time::sleep(StdDuration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_reference_lease_timeout() {
        let config = WorkerConfig::default();
        assert_eq!(config.lease_timeout_seconds, 600);
        assert_eq!(config.claim_batch_size, 10);
    }

    #[test]
    fn config_with_worker_id_overrides_generated_id() {
        let config = WorkerConfig::with_worker_id("w1");
        assert_eq!(config.worker_id, "w1");
    }
}
