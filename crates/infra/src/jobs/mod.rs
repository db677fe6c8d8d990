//! Persistent background job queue.
//!
//! ## Design
//!
//! - Entries live in a relational queue table; failures in a dead-letter table
//! - Claims are optimistic: `trigger_at` is the row's version token
//! - Jobs run in time slices and hand back a `JobResult`
//! - No worker processes; triggers drive the queue opportunistically
//!
//! ## Components
//!
//! - `QueueStore`: persistence (in-memory or Postgres)
//! - `JobManager`: enqueue, claim, run, persist
//! - `SafetyNet`: restores a claim the process could not finish
//! - `trigger`: request epilogue, cron and run-now entry points

pub mod manager;
pub mod postgres;
pub mod safety;
pub mod store;
pub mod trigger;
pub mod types;

pub use manager::{
    DEFAULT_PRIORITY, EnqueueOptions, EnqueuedIds, EntryStatus, JobManager, ManagerConfig,
    ManagerError,
};
pub use postgres::PostgresQueueStore;
pub use safety::{ActiveClaim, ClaimGuard, SIGNAL_EXIT_CODE, SafetyNet};
pub use store::{InMemoryQueueStore, QueueStore, StoreError};
pub use trigger::{RequestOutcome, TriggerConfig};
pub use types::{FailedEntry, NewEntry, QueueEntry, QueueStats};
