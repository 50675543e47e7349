//! Enqueue loop: materializes due occurrences for every active/shadow task
//! within a lookahead window.

use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::{debug, error, warn};

use crate::ledger::{compute_occurrence_key, Occurrence, OccurrenceState, Task, TaskStatus};

use super::expand::{expand, next_after};

/// Tunables for one enqueue pass, grounded on the reference defaults.
#[derive(Debug, Clone, Copy)]
pub struct EnqueueConfig {
    pub lookahead_seconds: i64,
    pub max_enqueued_per_task: i64,
}

impl Default for EnqueueConfig {
    fn default() -> Self {
        Self {
            lookahead_seconds: 60,
            max_enqueued_per_task: 100,
        }
    }
}

/// Run one enqueue pass over every active/shadow task. Returns the count of
/// occurrences that were newly inserted (not merely refreshed).
pub async fn enqueue_due_occurrences(
    pool: &PgPool,
    config: EnqueueConfig,
    now: DateTime<Utc>,
) -> Result<u64, sqlx::Error> {
    let window_end = now + Duration::seconds(config.lookahead_seconds);

    let tasks = match Task::find_expandable(pool).await {
        Ok(tasks) => tasks,
        Err(e) => {
            error!(error = %e, "failed to load expandable tasks");
            return Ok(0);
        }
    };

    let mut newly_enqueued = 0u64;

    for task in tasks {
        let due_times = match expand(task.schedule_kind, &task.schedule_expr, &task.timezone, now, window_end) {
            Ok(due) => due,
            Err(e) => {
                warn!(task_id = task.id, task_name = %task.name, error = %e, "failed computing schedule");
                continue;
            }
        };

        if due_times.is_empty() {
            refresh_next_run(&task, window_end, pool).await;
            continue;
        }

        let enqueued_count = Occurrence::count_enqueued_for_task(task.id, pool).await?;
        if enqueued_count >= config.max_enqueued_per_task {
            warn!(task_id = task.id, task_name = %task.name, "backpressure: refusing to enqueue more occurrences");
            refresh_next_run(&task, window_end, pool).await;
            continue;
        }

        let due_count = due_times.len();
        for scheduled_for in due_times {
            let occurrence_key = compute_occurrence_key(
                task.id,
                schedule_kind_tag(&task),
                &task.schedule_expr,
                scheduled_for,
                task.idempotency_scope.as_deref(),
            );

            let initial_state = if task.status == TaskStatus::Active {
                OccurrenceState::Enqueued
            } else {
                OccurrenceState::Scheduled
            };
            let enqueued_at = matches!(initial_state, OccurrenceState::Enqueued).then_some(now);

            let mut tx = pool.begin().await?;
            let outcome = Occurrence::upsert(
                task.id,
                &occurrence_key,
                scheduled_for,
                initial_state,
                enqueued_at,
                &mut tx,
            )
            .await
            .map_err(|e| match e {
                crate::error::LedgerError::Database(db) => db,
                other => sqlx::Error::Protocol(other.to_string()),
            })?;

            if task.status == TaskStatus::Active {
                Occurrence::activate(outcome.id(), now, &mut tx)
                    .await
                    .map_err(|e| match e {
                        crate::error::LedgerError::Database(db) => db,
                        other => sqlx::Error::Protocol(other.to_string()),
                    })?;
            }
            if outcome.was_inserted() {
                newly_enqueued += 1;
            }
            tx.commit().await?;
        }

        debug!(task_id = task.id, task_name = %task.name, due_count, "enqueue pass complete for task");
        refresh_next_run(&task, window_end, pool).await;
    }

    Ok(newly_enqueued)
}

fn schedule_kind_tag(task: &Task) -> &'static str {
    match task.schedule_kind {
        crate::ledger::ScheduleKind::Cron => "cron",
        crate::ledger::ScheduleKind::OneShot => "one_shot",
        crate::ledger::ScheduleKind::RecurrenceRule => "recurrence_rule",
        crate::ledger::ScheduleKind::FixedInterval => "fixed_interval",
    }
}

async fn refresh_next_run(task: &Task, window_end: DateTime<Utc>, pool: &PgPool) {
    let next_run = next_after(task.schedule_kind, &task.schedule_expr, &task.timezone, window_end).ok();
    if let Err(e) = Task::touch_next_run(task.id, next_run, pool).await {
        warn!(task_id = task.id, error = %e, "failed to refresh next_run_at");
    }
}
