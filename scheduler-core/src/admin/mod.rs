//! Admin surface: register, backfill, and cutover operations over the
//! ledger. Exposed to operators via the `scheduler-cli` binary's
//! subcommands rather than a directory of standalone scripts.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

use crate::ledger::Task;
use crate::scheduler::{enqueue_due_occurrences, next_after, EnqueueConfig};

/// One task definition as accepted by `register`.
#[derive(Debug, Clone)]
pub struct TaskDefinition {
    pub name: String,
    pub handler: String,
    pub schedule_expr: String,
    pub timezone: String,
    pub payload: serde_json::Value,
    pub status: crate::ledger::TaskStatus,
}

#[derive(Debug, Serialize)]
pub struct RegisterReport {
    pub registered: Vec<String>,
    pub skipped: Vec<String>,
}

/// Insert or update task rows from a declarative definition list.
pub async fn register_tasks(
    definitions: &[TaskDefinition],
    overwrite: bool,
    now: DateTime<Utc>,
    pool: &PgPool,
) -> Result<RegisterReport, sqlx::Error> {
    let mut report = RegisterReport {
        registered: Vec::new(),
        skipped: Vec::new(),
    };

    for def in definitions {
        let existing = Task::find_by_name(&def.name, pool).await.map_err(ledger_to_sqlx)?;
        if existing.is_some() && !overwrite {
            report.skipped.push(def.name.clone());
            continue;
        }

        let task = Task::builder()
            .name(def.name.clone())
            .handler(def.handler.clone())
            .schedule_expr(def.schedule_expr.clone())
            .timezone(def.timezone.clone())
            .payload(def.payload.clone())
            .status(def.status)
            .build();

        let saved = task.upsert_by_name(overwrite, pool).await.map_err(ledger_to_sqlx)?;
        let next_run = next_after(saved.schedule_kind, &saved.schedule_expr, &saved.timezone, now).ok();
        Task::touch_next_run(saved.id, next_run, pool).await.map_err(ledger_to_sqlx)?;
        report.registered.push(def.name.clone());
    }

    Ok(report)
}

#[derive(Debug, Serialize)]
pub struct BackfillReport {
    pub shadow_task_count: usize,
    pub occurrences_created: u64,
}

/// Run one enqueue pass restricted in effect to shadow tasks: status=shadow
/// tasks upsert `scheduled` occurrences that workers never claim.
pub async fn backfill_shadow(now: DateTime<Utc>, pool: &PgPool) -> Result<BackfillReport, sqlx::Error> {
    let shadow_tasks = Task::find_by_status(crate::ledger::TaskStatus::Shadow, pool)
        .await
        .map_err(ledger_to_sqlx)?;
    if shadow_tasks.is_empty() {
        return Ok(BackfillReport {
            shadow_task_count: 0,
            occurrences_created: 0,
        });
    }

    let created = enqueue_due_occurrences(pool, EnqueueConfig::default(), now).await?;
    Ok(BackfillReport {
        shadow_task_count: shadow_tasks.len(),
        occurrences_created: created,
    })
}

#[derive(Debug, Serialize)]
pub struct CutoverReport {
    pub activated: u64,
}

/// Set one or more tasks' status to `active`. Subsequent enqueue passes
/// transition their `scheduled` occurrences to `enqueued`.
pub async fn cutover(names: &[String], pool: &PgPool) -> Result<CutoverReport, sqlx::Error> {
    let activated = Task::activate_by_names(names, pool).await.map_err(ledger_to_sqlx)?;
    Ok(CutoverReport { activated })
}

fn ledger_to_sqlx(e: crate::error::LedgerError) -> sqlx::Error {
    match e {
        crate::error::LedgerError::Database(db) => db,
        other => sqlx::Error::Protocol(other.to_string()),
    }
}
