//! Schedule expansion and the enqueue loop.
//!
//! ```text
//! EnqueueLoop (every lookahead tick)
//!     │
//!     └─► for each active/shadow task
//!             ├─► expand() cron schedule over the lookahead window
//!             ├─► backpressure check (MAX_ENQUEUED_PER_TASK)
//!             └─► upsert_occurrence() per due instant (idempotent)
//! ```

pub mod enqueue;
pub mod expand;

pub use enqueue::{enqueue_due_occurrences, EnqueueConfig};
pub use expand::{expand as expand_schedule, next_after};

use std::time::Duration as StdDuration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{error, info};

/// Run the enqueue loop forever, ticking once per `lookahead_seconds`.
pub async fn run_enqueue_loop(pool: PgPool, config: EnqueueConfig) {
    info!(
        lookahead_seconds = config.lookahead_seconds,
        max_enqueued_per_task = config.max_enqueued_per_task,
        "enqueue loop starting"
    );

    let mut interval = tokio::time::interval(StdDuration::from_secs(
        config.lookahead_seconds.max(1) as u64,
    ));

    loop {
        interval.tick().await;
        let now = Utc::now();
        match enqueue_due_occurrences(&pool, config, now).await {
            Ok(count) => {
                if count > 0 {
                    info!(newly_enqueued = count, "enqueue pass complete");
                }
            }
            Err(e) => error!(error = %e, "enqueue pass failed"),
        }
    }
}
