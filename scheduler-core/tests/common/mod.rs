//! Shared Postgres testcontainer harness, reused across all integration
//! tests in this binary. Mirrors the teacher's shared-container pattern:
//! start once, run migrations once, hand out a fresh pool per test.

use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedInfra {
    db_url: String,
    _container: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Self {
        let container = Postgres::default()
            .start()
            .await
            .expect("failed to start postgres container");
        let host = container.get_host().await.expect("container host");
        let port = container
            .get_host_port_ipv4(5432)
            .await
            .expect("container port");
        let db_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .expect("failed to connect for migrations");
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("failed to run migrations");
        pool.close().await;

        Self {
            db_url,
            _container: container,
        }
    }

    async fn get() -> &'static Self {
        SHARED_INFRA.get_or_init(Self::init).await
    }
}

/// A fresh connection pool against the shared, already-migrated database.
pub async fn test_pool() -> PgPool {
    let infra = SharedInfra::get().await;
    PgPool::connect(&infra.db_url)
        .await
        .expect("failed to connect test pool")
}

/// Demonstration handler mirroring the idempotency-marker pattern from the
/// reference implementation's example handler: retries once on a missing
/// game id, then posts exactly once per marker key regardless of how many
/// times it is subsequently invoked for the same key.
pub mod mariners_post_game_summary {
    use std::collections::HashSet;
    use std::sync::{Mutex, OnceLock};

    use scheduler_core::{HandlerOutcome, TaskContext};

    static POSTED_MARKERS: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();

    fn posted_markers() -> &'static Mutex<HashSet<String>> {
        POSTED_MARKERS.get_or_init(|| Mutex::new(HashSet::new()))
    }

    pub async fn run(_ctx: TaskContext, payload: serde_json::Value) -> HandlerOutcome {
        let team = payload
            .get("team")
            .and_then(|v| v.as_str())
            .unwrap_or("SEA")
            .to_string();
        let Some(game_id) = payload.get("game_id").and_then(|v| v.as_str()) else {
            return HandlerOutcome::Retry("no final game yet".to_string());
        };
        let marker_key = format!("{team}:{game_id}");

        if payload.get("fail_once").and_then(|v| v.as_bool()).unwrap_or(false) {
            let mut posted = posted_markers().lock().unwrap();
            if !posted.contains(&format!("{marker_key}:attempted")) {
                posted.insert(format!("{marker_key}:attempted"));
                return HandlerOutcome::Retry("box score not ready".to_string());
            }
        }

        let mut posted = posted_markers().lock().unwrap();
        if posted.contains(&marker_key) {
            return HandlerOutcome::Success(serde_json::json!({"status": "noop", "reason": "duplicate"}));
        }
        posted.insert(marker_key);
        HandlerOutcome::Success(serde_json::json!({"status": "posted"}))
    }
}
