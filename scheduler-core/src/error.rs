//! Error taxonomy for the scheduler ledger.
//!
//! Each layer gets its own `thiserror` enum; binaries flatten these into
//! `anyhow::Result` at their outer boundary.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("schedule kind {0:?} is not supported")]
    UnsupportedSchedule(crate::ledger::task::ScheduleKind),

    #[error("invalid cron expression {expr:?}: {source}")]
    InvalidCron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("unknown timezone {0:?}")]
    UnknownTimezone(String),

    #[error("schedule has no future occurrence after the reference time")]
    Exhausted,
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("no handler registered for {0:?}")]
    Unresolved(String),
}
