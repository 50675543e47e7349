//! Task model: a logical recurring or one-shot job definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};
use typed_builder::TypedBuilder;

use crate::error::LedgerError;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "schedule_kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    #[default]
    Cron,
    OneShot,
    RecurrenceRule,
    FixedInterval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Shadow,
    Active,
    Paused,
    Canceled,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default)]
    pub id: i64,

    pub name: String,
    pub handler: String,

    #[builder(default, setter(strip_option))]
    pub payload: Option<serde_json::Value>,

    #[builder(default)]
    pub schedule_kind: ScheduleKind,
    pub schedule_expr: String,
    #[builder(default = "UTC".to_string())]
    pub timezone: String,

    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default = true)]
    pub is_active: bool,

    #[builder(default, setter(strip_option))]
    pub next_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_run_status: Option<String>,

    #[builder(default = 1)]
    pub concurrency_limit: i32,

    #[builder(default, setter(skip))]
    pub retry_policy: serde_json::Value,

    #[builder(default, setter(strip_option))]
    pub idempotency_scope: Option<String>,

    #[builder(default)]
    pub created_at: DateTime<Utc>,
    #[builder(default)]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Parsed view of `retry_policy`, falling back to `default` when the
    /// stored JSON is absent or incomplete (spec §6.4: `default_retry_policy`
    /// applies when a task's own retry policy is absent).
    pub fn retry_policy_or(&self, default: &RetryPolicy) -> RetryPolicy {
        serde_json::from_value(self.retry_policy.clone()).unwrap_or(*default)
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = serde_json::to_value(policy).expect("RetryPolicy always serializes");
        self
    }

    pub fn is_expandable(&self) -> bool {
        self.is_active && matches!(self.status, TaskStatus::Active | TaskStatus::Shadow)
    }

    /// Insert a new task row, or update it in place when `overwrite` and a
    /// task with the same name already exists.
    pub async fn upsert_by_name(&self, overwrite: bool, pool: &PgPool) -> Result<Task, LedgerError> {
        if let Some(existing) = Task::find_by_name(&self.name, pool).await? {
            if !overwrite {
                return Ok(existing);
            }
            return sqlx::query_as::<_, Task>(
                r#"
                UPDATE tasks
                SET handler = $2, payload = $3, schedule_kind = $4, schedule_expr = $5,
                    timezone = $6, status = $7, retry_policy = $8, idempotency_scope = $9,
                    concurrency_limit = $10, updated_at = NOW()
                WHERE id = $1
                RETURNING *
                "#,
            )
            .bind(existing.id)
            .bind(&self.handler)
            .bind(&self.payload)
            .bind(self.schedule_kind)
            .bind(&self.schedule_expr)
            .bind(&self.timezone)
            .bind(self.status)
            .bind(&self.retry_policy)
            .bind(&self.idempotency_scope)
            .bind(self.concurrency_limit)
            .fetch_one(pool)
            .await
            .map_err(LedgerError::from);
        }

        sqlx::query_as::<_, Task>(
            r#"
            INSERT INTO tasks
                (name, handler, payload, schedule_kind, schedule_expr, timezone, status,
                 is_active, concurrency_limit, retry_policy, idempotency_scope)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            RETURNING *
            "#,
        )
        .bind(&self.name)
        .bind(&self.handler)
        .bind(&self.payload)
        .bind(self.schedule_kind)
        .bind(&self.schedule_expr)
        .bind(&self.timezone)
        .bind(self.status)
        .bind(self.is_active)
        .bind(self.concurrency_limit)
        .bind(&self.retry_policy)
        .bind(&self.idempotency_scope)
        .fetch_one(pool)
        .await
        .map_err(LedgerError::from)
    }

    pub async fn find_by_name(name: &str, pool: &PgPool) -> Result<Option<Task>, LedgerError> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE name = $1")
            .bind(name)
            .fetch_optional(pool)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn find_expandable(pool: &PgPool) -> Result<Vec<Task>, LedgerError> {
        sqlx::query_as::<_, Task>(
            "SELECT * FROM tasks WHERE is_active = true AND status IN ('active', 'shadow')",
        )
        .fetch_all(pool)
        .await
        .map_err(LedgerError::from)
    }

    pub async fn find_by_status(status: TaskStatus, pool: &PgPool) -> Result<Vec<Task>, LedgerError> {
        sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE status = $1")
            .bind(status)
            .fetch_all(pool)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn activate_by_names(names: &[String], pool: &PgPool) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'active', is_active = true, updated_at = NOW() WHERE name = ANY($1)",
        )
        .bind(names)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn touch_next_run(
        id: i64,
        next_run_at: Option<DateTime<Utc>>,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query("UPDATE tasks SET next_run_at = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(next_run_at)
            .execute(pool)
            .await?;
        Ok(())
    }

    pub async fn mark_run(
        id: i64,
        status: &str,
        when: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE tasks SET last_run_status = $2, last_run_at = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(when)
        .execute(pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_task_status_is_shadow() {
        assert_eq!(TaskStatus::default(), TaskStatus::Shadow);
    }

    #[test]
    fn shadow_task_is_expandable_but_active_required_for_claim() {
        let task = Task::builder()
            .name("t")
            .handler("h")
            .schedule_expr("* * * * *")
            .build();
        assert!(task.is_expandable());
        assert_eq!(task.status, TaskStatus::Shadow);
    }

    #[test]
    fn paused_task_is_not_expandable() {
        let task = Task::builder()
            .name("t")
            .handler("h")
            .schedule_expr("* * * * *")
            .status(TaskStatus::Paused)
            .build();
        assert!(!task.is_expandable());
    }

    #[test]
    fn retry_policy_falls_back_to_given_default_when_absent() {
        let task = Task::builder()
            .name("t")
            .handler("h")
            .schedule_expr("* * * * *")
            .build();
        let default = RetryPolicy {
            max_attempts: 7,
            backoff: crate::retry::BackoffStyle::Constant,
            base_seconds: 15,
        };
        let policy = task.retry_policy_or(&default);
        assert_eq!(policy.max_attempts, 7);
    }
}
