//! Job manager: enqueue, claim, run, persist.
//!
//! The manager is synchronous and single-threaded; overlapping invocations
//! (several requests, a cron run, an admin action) each own a manager over
//! the same store and coordinate only through the store's compare-and-swap
//! claim.

use std::any::Any;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use jobforge_core::{Clock, EntryId, FailedEntryId, SystemClock};
use jobforge_work::{JobRegistry, JobResult, RegistryError, RunContext, RunOnce, StateError};

use super::safety::{ActiveClaim, SafetyNet};
use super::store::{QueueStore, StoreError};
use super::types::{FailedEntry, NewEntry, QueueEntry, QueueStats};

pub const DEFAULT_PRIORITY: i32 = 100;

/// Manager configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long a claim is honoured before the entry becomes claimable again.
    pub claim_window: Duration,
    /// Maximum entries fetched per selection.
    pub scan_limit: usize,
    /// Revert and report job errors from automatic runs too.
    pub strict: bool,
    pub default_priority: i32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            claim_window: Duration::from_secs(15 * 60),
            scan_limit: 100,
            strict: false,
            default_priority: DEFAULT_PRIORITY,
        }
    }
}

impl ManagerConfig {
    pub fn with_claim_window(mut self, window: Duration) -> Self {
        self.claim_window = window;
        self
    }

    pub fn with_scan_limit(mut self, limit: usize) -> Self {
        self.scan_limit = limit;
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

/// How an entry is enqueued.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueueOptions {
    pub unique_key: Option<String>,
    pub manual: bool,
    /// `None` uses the configured default.
    pub priority: Option<i32>,
    /// `None` means now.
    pub run_at: Option<DateTime<Utc>>,
    /// Automatic entry the current request waits for.
    pub blocking: bool,
}

impl EnqueueOptions {
    pub fn automatic() -> Self {
        Self::default()
    }

    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::default()
        }
    }

    pub fn unique(mut self, key: impl Into<String>) -> Self {
        self.unique_key = Some(key.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }

    /// Blocking entries are always automatic.
    pub fn blocking(mut self) -> Self {
        self.blocking = true;
        self.manual = false;
        self
    }
}

/// Ids enqueued during the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnqueuedIds {
    pub manual: Vec<EntryId>,
    pub automatic: Vec<EntryId>,
    pub auto_blocking: Vec<EntryId>,
}

impl EnqueuedIds {
    pub fn is_empty(&self) -> bool {
        self.manual.is_empty() && self.automatic.is_empty() && self.auto_blocking.is_empty()
    }
}

/// An entry together with what its job reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub entry: QueueEntry,
    /// `None` when the job cannot be built (unknown type, bad state).
    pub message: Option<String>,
    pub can_cancel: bool,
    pub can_trigger_by_choice: bool,
}

/// Manager error.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("job {work_type} ({entry_id}) failed: {message}")]
    JobFailed {
        entry_id: EntryId,
        work_type: String,
        message: String,
    },

    #[error("entry {0} cannot be triggered manually")]
    NotTriggerable(EntryId),
}

#[derive(Debug)]
struct AutoRunHint {
    next: Option<DateTime<Utc>>,
    dirty: bool,
}

/// Scheduler over a [`QueueStore`].
pub struct JobManager<S: QueueStore> {
    store: Arc<S>,
    registry: JobRegistry,
    config: ManagerConfig,
    clock: Arc<dyn Clock>,
    safety: SafetyNet<S>,
    run_once: RunOnce,
    dedup: HashMap<String, EntryId>,
    enqueued: EnqueuedIds,
    hint: AutoRunHint,
}

impl<S: QueueStore> JobManager<S> {
    pub fn new(store: Arc<S>, registry: JobRegistry, config: ManagerConfig) -> Self {
        Self {
            safety: SafetyNet::new(store.clone()),
            store,
            registry,
            config,
            clock: Arc::new(SystemClock),
            run_once: RunOnce::new(),
            dedup: HashMap::new(),
            enqueued: EnqueuedIds::default(),
            hint: AutoRunHint {
                next: None,
                dirty: true,
            },
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Handle for signal/exit hooks; see [`SafetyNet::restore`].
    pub fn safety_net(&self) -> SafetyNet<S> {
        self.safety.clone()
    }

    // ---- enqueue -------------------------------------------------------

    /// Enqueue `work_type` with `params` as its initial state.
    #[instrument(skip(self, params), err)]
    pub fn enqueue_with<P: Serialize + ?Sized>(
        &mut self,
        work_type: &str,
        params: &P,
        options: EnqueueOptions,
    ) -> Result<EntryId, ManagerError> {
        if let Some(key) = &options.unique_key {
            if let Some(&id) = self.dedup.get(key) {
                debug!(entry_id = %id, unique_key = %key, "already enqueued in this request");
                return Ok(id);
            }
        }

        let state = self.registry.encode_params(work_type, params)?;
        self.insert(work_type, state, options)
    }

    /// Automatic entry, default priority, due now.
    pub fn enqueue<P: Serialize + ?Sized>(
        &mut self,
        work_type: &str,
        params: &P,
    ) -> Result<EntryId, ManagerError> {
        self.enqueue_with(work_type, params, EnqueueOptions::automatic())
    }

    /// Manual entry coalesced on `unique_key`.
    pub fn enqueue_unique<P: Serialize + ?Sized>(
        &mut self,
        unique_key: &str,
        work_type: &str,
        params: &P,
    ) -> Result<EntryId, ManagerError> {
        self.enqueue_with(work_type, params, EnqueueOptions::manual().unique(unique_key))
    }

    /// Automatic entry due at `run_at`.
    pub fn enqueue_later<P: Serialize + ?Sized>(
        &mut self,
        unique_key: Option<&str>,
        run_at: DateTime<Utc>,
        work_type: &str,
        params: &P,
    ) -> Result<EntryId, ManagerError> {
        let mut options = EnqueueOptions::automatic().run_at(run_at);
        options.unique_key = unique_key.map(str::to_string);
        self.enqueue_with(work_type, params, options)
    }

    /// Automatic entry the current request runs before it finishes.
    pub fn enqueue_auto_blocking<P: Serialize + ?Sized>(
        &mut self,
        work_type: &str,
        params: &P,
    ) -> Result<EntryId, ManagerError> {
        self.enqueue_with(work_type, params, EnqueueOptions::automatic().blocking())
    }

    fn insert(
        &mut self,
        work_type: &str,
        state: Vec<u8>,
        options: EnqueueOptions,
    ) -> Result<EntryId, ManagerError> {
        let manual = options.manual && !options.blocking;
        let priority = options.priority.unwrap_or(self.config.default_priority);

        let id = self.store.upsert(NewEntry {
            work_type: work_type.to_string(),
            state,
            unique_key: options.unique_key.clone(),
            trigger_at: options.run_at.unwrap_or_else(|| self.clock.now()),
            is_manual: manual,
            priority,
        })?;

        if let Some(key) = options.unique_key {
            self.dedup.insert(key, id);
        }

        let bucket = if manual {
            &mut self.enqueued.manual
        } else if options.blocking {
            &mut self.enqueued.auto_blocking
        } else {
            &mut self.enqueued.automatic
        };
        if !bucket.contains(&id) {
            bucket.push(id);
        }

        if !manual {
            self.hint.dirty = true;
        }

        debug!(entry_id = %id, work_type, manual, priority, "enqueued job");
        Ok(id)
    }

    /// Delete an entry outright. A run in progress finds its row gone.
    pub fn cancel(&mut self, id: EntryId) -> Result<bool, ManagerError> {
        let deleted = self.store.delete(id)?;
        self.dedup.retain(|_, cached| *cached != id);
        self.hint.dirty = true;
        if deleted {
            info!(entry_id = %id, "cancelled job");
        }
        Ok(deleted)
    }

    pub fn cancel_unique(&mut self, unique_key: &str) -> Result<bool, ManagerError> {
        let deleted = self.store.delete_by_key(unique_key)?;
        self.dedup.remove(unique_key);
        self.hint.dirty = true;
        if deleted {
            info!(unique_key, "cancelled job");
        }
        Ok(deleted)
    }

    /// Hand the per-request buckets to the caller and start a new request.
    pub fn take_enqueued(&mut self) -> EnqueuedIds {
        std::mem::take(&mut self.enqueued)
    }

    /// Forget per-request buckets and the unique-key cache.
    pub fn reset_request(&mut self) {
        self.enqueued = EnqueuedIds::default();
        self.dedup.clear();
    }

    // ---- inspection ----------------------------------------------------

    pub fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, ManagerError> {
        Ok(self.store.get(id)?)
    }

    pub fn get_unique(&self, unique_key: &str) -> Result<Option<QueueEntry>, ManagerError> {
        Ok(self.store.get_by_key(unique_key)?)
    }

    /// Entry plus its job's status message and policy flags.
    pub fn describe(&self, id: EntryId) -> Result<Option<EntryStatus>, ManagerError> {
        let Some(entry) = self.store.get(id)? else {
            return Ok(None);
        };

        let status = match self.registry.resolve(&entry.work_type, &entry.state) {
            Ok(job) => EntryStatus {
                message: Some(job.status_message()),
                can_cancel: job.can_cancel(),
                can_trigger_by_choice: job.can_trigger_by_choice(),
                entry,
            },
            Err(e) => {
                debug!(entry_id = %id, error = %e, "cannot describe entry");
                EntryStatus {
                    entry,
                    message: None,
                    can_cancel: false,
                    can_trigger_by_choice: false,
                }
            }
        };
        Ok(Some(status))
    }

    pub fn stats(&self) -> Result<QueueStats, ManagerError> {
        Ok(self.store.stats(self.clock.now())?)
    }

    /// Entries due for longer than `threshold`: nobody has been running the queue.
    pub fn overdue_entries(
        &self,
        manual: bool,
        threshold: Duration,
    ) -> Result<Vec<QueueEntry>, ManagerError> {
        let before = shift_back(self.clock.now(), threshold);
        Ok(self.store.overdue(manual, before, self.config.scan_limit)?)
    }

    // ---- next automatic run -------------------------------------------

    /// Recompute the next-automatic-run hint if something changed.
    pub fn flush(&mut self) -> Result<Option<DateTime<Utc>>, ManagerError> {
        if self.hint.dirty {
            self.hint.next = self.store.next_automatic_trigger()?;
            self.hint.dirty = false;
            debug!(next_auto_run = ?self.hint.next, "recomputed next automatic run");
        }
        Ok(self.hint.next)
    }

    /// Last computed hint; call [`flush`](Self::flush) first for a fresh value.
    pub fn next_auto_run(&self) -> Option<DateTime<Utc>> {
        self.hint.next
    }

    pub fn is_auto_run_due(&self) -> bool {
        self.hint.next.is_some_and(|at| at <= self.clock.now())
    }

    // ---- running ------------------------------------------------------

    /// Runnable entries for the manual flag, best first.
    pub fn select_runnable(&self, manual: bool) -> Result<Vec<QueueEntry>, ManagerError> {
        Ok(self
            .store
            .select_runnable(manual, self.clock.now(), self.config.scan_limit)?)
    }

    /// Claim `entry` and run it for at most `max_run_time`.
    ///
    /// Returns `Completed` without running anything if another run claimed
    /// the entry first.
    pub fn claim_and_run(
        &mut self,
        entry: &QueueEntry,
        max_run_time: Duration,
    ) -> Result<JobResult, ManagerError> {
        let strict = self.config.strict || entry.is_manual;
        self.run_entry(entry, max_run_time, strict)
    }

    /// Run due entries until `max_run_time` is spent or nothing is left.
    ///
    /// Returns the outcome of the last job run, `None` if nothing ran.
    #[instrument(skip(self), err)]
    pub fn run_queue(
        &mut self,
        manual: bool,
        max_run_time: Duration,
    ) -> Result<Option<JobResult>, ManagerError> {
        self.run_once.clear();
        let started = self.clock.now();
        let strict = manual || self.config.strict;
        let mut last = None;
        let mut ran = 0usize;

        'scan: loop {
            let entries = self.select_runnable(manual)?;
            if entries.is_empty() {
                break;
            }
            for entry in &entries {
                let remaining = max_run_time.saturating_sub(self.clock.elapsed_since(started));
                if remaining.is_zero() {
                    break 'scan;
                }
                last = Some(self.run_entry(entry, remaining, strict)?);
                ran += 1;
            }
        }

        debug!(ran, "queue run finished");
        self.flush()?;
        Ok(last)
    }

    /// Run one entry now, whatever its `trigger_at`. Errors are reported.
    ///
    /// Returns `None` if the entry is gone or currently claimed by another run.
    #[instrument(skip(self), err)]
    pub fn run_by_id(
        &mut self,
        id: EntryId,
        max_run_time: Duration,
    ) -> Result<Option<JobResult>, ManagerError> {
        let Some(entry) = self.store.get(id)? else {
            return Ok(None);
        };
        if self.is_held_by_claim(&entry) {
            debug!(entry_id = %id, "entry is running elsewhere");
            return Ok(None);
        }

        self.run_once.clear();
        let result = self.run_entry(&entry, max_run_time, true)?;
        self.flush()?;
        Ok(Some(result))
    }

    /// Run this request's blocking entries until done or out of time.
    ///
    /// Returns ids that are still pending.
    #[instrument(skip(self), err)]
    pub fn run_blocking(&mut self, max_run_time: Duration) -> Result<Vec<EntryId>, ManagerError> {
        let started = self.clock.now();
        let strict = self.config.strict;
        // the bucket is only rewritten after a full pass
        let mut pending = self.enqueued.auto_blocking.clone();

        while !pending.is_empty() {
            let mut progressed = false;
            let mut still_pending = Vec::with_capacity(pending.len());

            for &id in &pending {
                let Some(entry) = self.store.get(id)? else {
                    continue;
                };
                let remaining = max_run_time.saturating_sub(self.clock.elapsed_since(started));
                if remaining.is_zero() || entry.trigger_at > self.clock.now() {
                    still_pending.push(id);
                    continue;
                }

                self.run_entry(&entry, remaining, strict)?;
                progressed = true;
                if self.store.get(id)?.is_some() {
                    still_pending.push(id);
                }
            }

            pending = still_pending;
            self.enqueued.auto_blocking = pending.clone();
            if !progressed {
                break;
            }
        }

        self.flush()?;
        Ok(pending)
    }

    fn is_held_by_claim(&self, entry: &QueueEntry) -> bool {
        let Some(last_run_at) = entry.last_run_at else {
            return false;
        };
        entry.trigger_at > self.clock.now()
            && shift_forward(last_run_at, self.config.claim_window) == entry.trigger_at
    }

    fn run_entry(
        &mut self,
        entry: &QueueEntry,
        max_run_time: Duration,
        strict: bool,
    ) -> Result<JobResult, ManagerError> {
        let now = self.clock.now();
        let token = shift_forward(now, self.config.claim_window);

        if !self.store.claim(entry.id, entry.trigger_at, token, now)? {
            debug!(entry_id = %entry.id, work_type = %entry.work_type, "claim lost to another run");
            return Ok(JobResult::Completed);
        }
        if !entry.is_manual {
            self.hint.dirty = true;
        }

        let guard = self.safety.arm(ActiveClaim {
            entry_id: entry.id,
            work_type: entry.work_type.clone(),
            token,
            original: entry.trigger_at,
        });

        let mut job = match self.registry.resolve(&entry.work_type, &entry.state) {
            Ok(job) => job,
            Err(RegistryError::UnknownWorkType(work_type)) => {
                warn!(entry_id = %entry.id, work_type = %work_type, "no job registered for work type; dropping entry");
                self.store.complete_claimed(entry.id, token)?;
                guard.disarm();
                return Ok(JobResult::Completed);
            }
            Err(RegistryError::State(e)) => {
                let result = JobResult::failed(entry.state.clone(), e.to_string());
                self.persist(entry, token, &result)?;
                guard.disarm();
                return Ok(result);
            }
        };

        debug!(
            entry_id = %entry.id,
            work_type = %entry.work_type,
            priority = entry.priority,
            attempts = entry.attempts,
            "running job"
        );

        let outcome = {
            let mut ctx = RunContext::new(
                entry.id,
                entry.attempts,
                max_run_time,
                &*self.clock,
                &mut self.run_once,
            );
            panic::catch_unwind(AssertUnwindSafe(|| job.run(&mut ctx)))
        };

        let failure = match outcome {
            Ok(Ok(result)) => {
                self.persist(entry, token, &result)?;
                guard.disarm();
                return Ok(result);
            }
            Ok(Err(e)) => e.to_string(),
            Err(payload) => panic_message(&*payload),
        };

        if strict {
            error!(entry_id = %entry.id, work_type = %entry.work_type, error = %failure, "job failed; reverting claim");
            if let Err(e) = guard.revert() {
                error!(entry_id = %entry.id, error = %e, "failed to revert claim after job failure");
            }
            return Err(ManagerError::JobFailed {
                entry_id: entry.id,
                work_type: entry.work_type.clone(),
                message: failure,
            });
        }

        warn!(entry_id = %entry.id, work_type = %entry.work_type, error = %failure, "job failed; abandoning entry");
        self.store.complete_claimed(entry.id, token)?;
        guard.disarm();
        Ok(JobResult::Completed)
    }

    fn persist(
        &self,
        entry: &QueueEntry,
        token: DateTime<Utc>,
        result: &JobResult,
    ) -> Result<(), ManagerError> {
        let applied = match result {
            JobResult::Completed => {
                info!(entry_id = %entry.id, work_type = %entry.work_type, "job completed");
                self.store.complete_claimed(entry.id, token)?
            }
            JobResult::Resume {
                state,
                status,
                continue_at,
                ..
            } => {
                let at = continue_at.unwrap_or_else(|| self.clock.now());
                info!(entry_id = %entry.id, work_type = %entry.work_type, status = %status, "job resumes later");
                self.store.reschedule(entry.id, token, state, at, false)?
            }
            JobResult::Reattempt { state, next_try_at } => {
                info!(
                    entry_id = %entry.id,
                    work_type = %entry.work_type,
                    attempts = entry.attempts.saturating_add(1),
                    next_try_at = %next_try_at,
                    "job will be reattempted"
                );
                self.store.reschedule(entry.id, token, state, *next_try_at, true)?
            }
            JobResult::Failed { state, error } => {
                error!(entry_id = %entry.id, work_type = %entry.work_type, error = %error, "job failed; moved to dead letter");
                let failed = FailedEntry::new(&entry.work_type, state.clone(), error.clone(), self.clock.now());
                self.store.dead_letter(entry.id, token, failed)?
            }
        };

        if !applied {
            debug!(entry_id = %entry.id, outcome = result.kind(), "entry changed while running; result not applied");
        }
        Ok(())
    }

    // ---- dead letters -------------------------------------------------

    /// Most recent failures first.
    pub fn failed_entries(&self, limit: usize) -> Result<Vec<FailedEntry>, ManagerError> {
        Ok(self.store.list_failed(limit)?)
    }

    /// Re-enqueue a failed entry with its captured state and drop the failure record.
    #[instrument(skip(self), err)]
    pub fn replay_failed(
        &mut self,
        id: FailedEntryId,
        options: EnqueueOptions,
    ) -> Result<EntryId, ManagerError> {
        let failed = self
            .store
            .get_failed(id)?
            .ok_or_else(|| StoreError::NotFound(format!("failed entry {id}")))?;

        let entry_id = self.insert(&failed.work_type, failed.state, options)?;
        self.store.delete_failed(id)?;
        info!(failed_id = %id, entry_id = %entry_id, work_type = %failed.work_type, "replayed failed job");
        Ok(entry_id)
    }

    pub fn delete_failed(&self, id: FailedEntryId) -> Result<bool, ManagerError> {
        Ok(self.store.delete_failed(id)?)
    }

    /// Delete failures older than `older_than`.
    pub fn prune_failed(&self, older_than: Duration) -> Result<u64, ManagerError> {
        let before = shift_back(self.clock.now(), older_than);
        let pruned = self.store.prune_failed(before)?;
        if pruned > 0 {
            info!(pruned, "pruned failed jobs");
        }
        Ok(pruned)
    }
}

fn shift_forward(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn shift_back(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|d| at.checked_sub_signed(d))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic: unknown payload".to_string()
    }
}
