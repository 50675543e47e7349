//! Occurrence model: a single scheduled fire of a task, and the
//! idempotent-upsert / atomic-claim primitives the rest of the system
//! depends on.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::LedgerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "occurrence_state", rename_all = "snake_case")]
pub enum OccurrenceState {
    #[default]
    Scheduled,
    Enqueued,
    Running,
    Executed,
    Failed,
    Canceled,
    Skipped,
}

#[derive(FromRow, Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: i64,
    pub task_id: i64,
    pub occurrence_key: String,
    pub scheduled_for: DateTime<Utc>,
    pub enqueued_at: Option<DateTime<Utc>>,
    pub state: OccurrenceState,
    pub reason: Option<String>,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A row identity returned from the atomic batch claim.
#[derive(Debug, Clone, Copy)]
pub struct ClaimedOccurrence {
    pub id: i64,
    pub task_id: i64,
}

/// Distinguishes a brand-new occurrence row from one that already existed,
/// so callers can count "newly enqueued" precisely instead of relying on a
/// `created_at` proximity heuristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted(i64),
    Conflicted(i64),
}

impl UpsertOutcome {
    pub fn id(&self) -> i64 {
        match self {
            UpsertOutcome::Inserted(id) | UpsertOutcome::Conflicted(id) => *id,
        }
    }

    pub fn was_inserted(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted(_))
    }
}

/// Derive the deterministic occurrence key per the spec's hashing scheme.
pub fn compute_occurrence_key(
    task_id: i64,
    schedule_kind: &str,
    schedule_expr: &str,
    scheduled_for: DateTime<Utc>,
    idempotency_scope: Option<&str>,
) -> String {
    let scope = idempotency_scope.unwrap_or("");
    let payload = format!(
        "{task_id}|{schedule_kind}|{schedule_expr}|{}|{scope}",
        scheduled_for.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    );
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    hex::encode(hasher.finalize())
}

impl Occurrence {
    /// Idempotent upsert on `(task_id, occurrence_key)`. Never clobbers an
    /// existing row's `state`; only refreshes `updated_at` on conflict.
    pub async fn upsert(
        task_id: i64,
        occurrence_key: &str,
        scheduled_for: DateTime<Utc>,
        initial_state: OccurrenceState,
        enqueued_at: Option<DateTime<Utc>>,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<UpsertOutcome, LedgerError> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            INSERT INTO occurrences (task_id, occurrence_key, scheduled_for, state, enqueued_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (task_id, occurrence_key) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(task_id)
        .bind(occurrence_key)
        .bind(scheduled_for)
        .bind(initial_state)
        .bind(enqueued_at)
        .fetch_optional(&mut **tx)
        .await?;

        if let Some((id,)) = row {
            return Ok(UpsertOutcome::Inserted(id));
        }

        let (id,): (i64,) = sqlx::query_as(
            "SELECT id FROM occurrences WHERE task_id = $1 AND occurrence_key = $2",
        )
        .bind(task_id)
        .bind(occurrence_key)
        .fetch_one(&mut **tx)
        .await?;

        sqlx::query("UPDATE occurrences SET updated_at = NOW() WHERE id = $1")
            .bind(id)
            .execute(&mut **tx)
            .await?;

        Ok(UpsertOutcome::Conflicted(id))
    }

    pub async fn find(id: i64, pool: &PgPool) -> Result<Option<Occurrence>, LedgerError> {
        sqlx::query_as::<_, Occurrence>("SELECT * FROM occurrences WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .map_err(LedgerError::from)
    }

    pub async fn count_enqueued_for_task(task_id: i64, pool: &PgPool) -> Result<i64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM occurrences WHERE task_id = $1 AND state = 'enqueued'",
        )
        .bind(task_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    pub async fn count_running_excluding_worker(
        task_id: i64,
        occurrence_id: i64,
        worker_id: &str,
        pool: &PgPool,
    ) -> Result<i64, LedgerError> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM occurrences
            WHERE task_id = $1 AND state = 'running' AND id != $2
              AND (locked_by IS DISTINCT FROM $3)
            "#,
        )
        .bind(task_id)
        .bind(occurrence_id)
        .bind(worker_id)
        .fetch_one(pool)
        .await?;
        Ok(count)
    }

    /// Transition a `scheduled`/`failed` row to `enqueued`, or refresh
    /// `enqueued_at` on a row that is already `enqueued`. Returns whether a
    /// state transition (not merely a refresh) happened.
    pub async fn activate(
        id: i64,
        now: DateTime<Utc>,
        tx: &mut Transaction<'_, Postgres>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'enqueued', enqueued_at = $2, reason = NULL, updated_at = NOW()
            WHERE id = $1 AND state IN ('scheduled', 'failed')
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        sqlx::query(
            r#"
            UPDATE occurrences
            SET enqueued_at = $2, updated_at = NOW()
            WHERE id = $1 AND state = 'enqueued' AND (enqueued_at IS NULL OR enqueued_at <= $2)
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(false)
    }

    /// Reclaim occurrences whose lease has expired, per the worker's
    /// recovery pass. Returns the number of rows reclaimed.
    pub async fn reclaim_expired_leases(
        lease_timeout_seconds: i64,
        now: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<u64, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'enqueued', enqueued_at = $1, locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE state = 'running'
              AND locked_at IS NOT NULL
              AND locked_at <= $1 - ($2 || ' seconds')::INTERVAL
            "#,
        )
        .bind(now)
        .bind(lease_timeout_seconds)
        .execute(pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Atomic batch claim: `SELECT ... FOR UPDATE SKIP LOCKED` feeding an
    /// `UPDATE ... RETURNING`, the core concurrency primitive of the
    /// worker loop.
    pub async fn claim_batch(
        worker_id: &str,
        now: DateTime<Utc>,
        limit: i64,
        pool: &PgPool,
    ) -> Result<Vec<ClaimedOccurrence>, LedgerError> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            WITH next_occurrences AS (
                SELECT id
                FROM occurrences
                WHERE state = 'enqueued' AND (enqueued_at IS NULL OR enqueued_at <= $1)
                ORDER BY scheduled_for
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE occurrences o
            SET state = 'running', locked_by = $3, locked_at = $1, updated_at = NOW()
            FROM next_occurrences
            WHERE o.id = next_occurrences.id
            RETURNING o.id, o.task_id
            "#,
        )
        .bind(now)
        .bind(limit)
        .bind(worker_id)
        .fetch_all(pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, task_id)| ClaimedOccurrence { id, task_id })
            .collect())
    }

    pub async fn defer_for_concurrency(
        id: i64,
        enqueued_at: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'enqueued', enqueued_at = $2, reason = 'concurrency_limit',
                locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(enqueued_at)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_executed(
        id: i64,
        when: DateTime<Utc>,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'executed', executed_at = COALESCE(executed_at, $2),
                locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(when)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_failed(id: i64, reason: &str, pool: &PgPool) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'failed', reason = $2, locked_by = NULL, locked_at = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn mark_enqueued_for_retry(
        id: i64,
        enqueued_at: DateTime<Utc>,
        reason: &str,
        pool: &PgPool,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            UPDATE occurrences
            SET state = 'enqueued', reason = $2, locked_by = NULL, locked_at = NULL,
                enqueued_at = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(enqueued_at)
        .execute(pool)
        .await?;
        Ok(())
    }
}
