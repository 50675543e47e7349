//! Execution model: one attempt to run a handler for an occurrence.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "trigger_type", rename_all = "snake_case")]
pub enum TriggerType {
    #[default]
    Schedule,
    Retry,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "execution_status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    #[default]
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    TimedOut,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub task_id: i64,
    pub occurrence_id: i64,
    pub attempt_no: i32,
    pub trigger_type: TriggerType,
    pub status: ExecutionStatus,
    pub worker_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<serde_json::Value>,
}

impl Execution {
    /// Determine the next attempt number for an occurrence and insert the
    /// `running` execution row for it, inside the caller's transaction.
    pub async fn start_next_attempt(
        task_id: i64,
        occurrence_id: i64,
        worker_id: &str,
        started_at: DateTime<Utc>,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<Execution, LedgerError> {
        let (max_attempt,): (Option<i32>,) = sqlx::query_as(
            "SELECT MAX(attempt_no) FROM executions WHERE occurrence_id = $1",
        )
        .bind(occurrence_id)
        .fetch_one(&mut **tx)
        .await?;
        let attempt_no = max_attempt.unwrap_or(0) + 1;
        let trigger_type = if attempt_no > 1 {
            TriggerType::Retry
        } else {
            TriggerType::Schedule
        };

        sqlx::query_as::<_, Execution>(
            r#"
            INSERT INTO executions
                (task_id, occurrence_id, attempt_no, trigger_type, status, worker_id, started_at)
            VALUES ($1, $2, $3, $4, 'running', $5, $6)
            RETURNING *
            "#,
        )
        .bind(task_id)
        .bind(occurrence_id)
        .bind(attempt_no)
        .bind(trigger_type)
        .bind(worker_id)
        .bind(started_at)
        .fetch_one(&mut **tx)
        .await
        .map_err(LedgerError::from)
    }

    pub async fn complete_succeeded(
        id: i64,
        finished_at: DateTime<Utc>,
        result: serde_json::Value,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            "UPDATE executions SET status = 'succeeded', finished_at = $2, result = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(finished_at)
        .bind(result)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn complete_failed(
        id: i64,
        finished_at: DateTime<Utc>,
        error_type: &str,
        message: &str,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        let error = serde_json::json!({ "type": error_type, "message": message });
        sqlx::query(
            "UPDATE executions SET status = 'failed', finished_at = $2, error = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(finished_at)
        .bind(error)
        .execute(pool)
        .await?;
        Ok(())
    }

}
