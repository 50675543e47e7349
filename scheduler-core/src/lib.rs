//! Durable task scheduler: a persistent ledger of tasks, their expanded
//! occurrences, and the executions attempted against them.

pub mod admin;
pub mod config;
pub mod error;
pub mod handler;
pub mod ledger;
pub mod retry;
pub mod scheduler;
pub mod worker;

pub use config::Config;
pub use handler::{Handler, HandlerOutcome, HandlerRegistry, TaskContext};
pub use ledger::{Execution, ExecutionStatus, Occurrence, OccurrenceState, Task, TaskStatus, TriggerType};
pub use retry::RetryPolicy;
