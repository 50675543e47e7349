//! Persistent ledger: the three entities (`Task`, `Occurrence`, `Execution`)
//! and the repository functions that own every write to them.
//!
//! Modeled as plain value types with free functions rather than an ORM
//! class hierarchy: there is no shared base class, just a `created_at`/
//! `updated_at` column pair each table carries independently.

pub mod execution;
pub mod occurrence;
pub mod task;

pub use execution::{Execution, ExecutionStatus, TriggerType};
pub use occurrence::{compute_occurrence_key, ClaimedOccurrence, Occurrence, OccurrenceState, UpsertOutcome};
pub use task::{Task, TaskStatus, ScheduleKind};
