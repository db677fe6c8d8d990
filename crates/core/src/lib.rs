//! `jobforge-core`: shared primitives for the job scheduler.
//!
//! This crate holds only plain building blocks (identifiers, time, errors);
//! it knows nothing about storage or about individual job types.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::CoreError;
pub use id::{EntryId, FailedEntryId};
