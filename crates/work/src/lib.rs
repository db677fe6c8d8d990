//! `jobforge-work`
//!
//! **Responsibility:** the unit-of-work boundary of the scheduler.
//!
//! This crate is intentionally storage-agnostic:
//! - It defines what a job *is* (`Job`) and what a single run returns (`JobResult`).
//! - It never touches the queue store; the manager in `jobforge-infra` does.
//! - Job state is typed here and becomes an opaque byte blob at the registry seam.

pub mod batch;
pub mod context;
pub mod job;
pub mod rebuild;
pub mod registry;
pub mod result;
pub mod retry;
pub mod state;

pub use batch::calculate_optimal_batch;
pub use context::{RunContext, RunOnce};
pub use job::{DynJob, Job};
pub use rebuild::{BatchWork, RebuildJob, RebuildState};
pub use registry::{JobRegistry, RegistryError};
pub use result::{JobError, JobResult};
pub use retry::{BackoffStrategy, RetryPolicy, RetrySchedule, Retryable};
pub use state::StateError;
