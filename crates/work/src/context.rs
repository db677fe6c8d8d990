use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};

use jobforge_core::{Clock, EntryId};

/// Keys of side effects already performed during the current queue run.
///
/// Several jobs can ask for the same expensive follow-up (for example a cache
/// rebuild); the first `claim` wins and later callers skip it. The manager
/// clears the set at the start of every `run_queue`.
#[derive(Debug, Default, Clone)]
pub struct RunOnce {
    seen: HashSet<String>,
}

impl RunOnce {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is claimed.
    pub fn claim(&mut self, key: &str) -> bool {
        if self.seen.contains(key) {
            return false;
        }
        self.seen.insert(key.to_string());
        true
    }

    pub fn contains(&self, key: &str) -> bool {
        self.seen.contains(key)
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// Everything a job can see while it runs.
pub struct RunContext<'a> {
    entry_id: EntryId,
    attempts: u32,
    max_run_time: Duration,
    started_at: DateTime<Utc>,
    clock: &'a dyn Clock,
    run_once: &'a mut RunOnce,
}

impl<'a> RunContext<'a> {
    /// Start a run now (as read from `clock`).
    pub fn new(
        entry_id: EntryId,
        attempts: u32,
        max_run_time: Duration,
        clock: &'a dyn Clock,
        run_once: &'a mut RunOnce,
    ) -> Self {
        Self {
            entry_id,
            attempts,
            max_run_time,
            started_at: clock.now(),
            clock,
            run_once,
        }
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    /// Reattempt cycles consumed before this run.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn max_run_time(&self) -> Duration {
        self.max_run_time
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn elapsed(&self) -> Duration {
        self.clock.elapsed_since(self.started_at)
    }

    pub fn remaining(&self) -> Duration {
        self.max_run_time.saturating_sub(self.elapsed())
    }

    /// Checkpoint: the job should stop and return `Resume`.
    pub fn time_exhausted(&self) -> bool {
        self.remaining().is_zero()
    }

    /// See [`RunOnce::claim`].
    pub fn run_once(&mut self, key: &str) -> bool {
        self.run_once.claim(key)
    }
}
