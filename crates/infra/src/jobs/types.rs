//! Queue rows and their admin views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobforge_core::{EntryId, FailedEntryId};

/// A pending unit of work as stored in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: EntryId,
    pub work_type: String,
    /// Opaque state blob owned by the job type.
    pub state: Vec<u8>,
    pub unique_key: Option<String>,
    /// Not claimable before this instant; doubles as the claim version token.
    pub trigger_at: DateTime<Utc>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub is_manual: bool,
    /// Higher runs first among ready entries.
    pub priority: i32,
    /// Reattempt cycles consumed.
    pub attempts: u32,
}

/// Insert (or unique-key upsert) request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewEntry {
    pub work_type: String,
    pub state: Vec<u8>,
    pub unique_key: Option<String>,
    pub trigger_at: DateTime<Utc>,
    pub is_manual: bool,
    pub priority: i32,
}

/// A dead-lettered entry. Never re-enqueued automatically.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    pub id: FailedEntryId,
    pub work_type: String,
    pub state: Vec<u8>,
    pub captured_error: String,
    pub failed_at: DateTime<Utc>,
}

impl FailedEntry {
    pub fn new(
        work_type: impl Into<String>,
        state: Vec<u8>,
        captured_error: impl Into<String>,
        failed_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: FailedEntryId::new(),
            work_type: work_type.into(),
            state,
            captured_error: captured_error.into(),
            failed_at,
        }
    }
}

/// Queue counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub manual_pending: u64,
    pub automatic_pending: u64,
    /// Automatic entries whose `trigger_at` has passed.
    pub automatic_runnable: u64,
    pub failed: u64,
    pub next_automatic_trigger: Option<DateTime<Utc>>,
}
