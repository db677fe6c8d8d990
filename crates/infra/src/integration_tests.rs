//! Integration tests for the full claim-run-persist cycle.
//!
//! Tests: enqueue → JobManager → QueueStore → dead-letter / reschedule
//!
//! Verifies:
//! - Unique keys coalesce into one row carrying the latest parameters
//! - Continuation state survives `Resume`
//! - Failures dead-letter, abandon or revert depending on mode
//! - Priority ordering under a tight budget
//! - A claim that never reports back is restored

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex, OnceLock};
    use std::time::Duration;

    use chrono::{DateTime, Utc};
    use jobforge_core::{Clock, EntryId, FailedEntryId, ManualClock};
    use jobforge_work::job::decode_state;
    use jobforge_work::{
        BatchWork, Job, JobError, JobRegistry, JobResult, RebuildJob, RebuildState,
        RetrySchedule, Retryable, RunContext,
    };
    use serde::{Deserialize, Serialize};

    use crate::jobs::trigger::{self, TriggerConfig};
    use crate::jobs::{
        EnqueueOptions, FailedEntry, InMemoryQueueStore, JobManager, ManagerConfig, ManagerError,
        NewEntry, QueueEntry, QueueStats, QueueStore, SafetyNet, StoreError,
    };

    type Journal = Arc<Mutex<Vec<String>>>;

    // ---- test jobs ------------------------------------------------------

    /// Counts down one step per run, each step costing a second of clock time.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    struct CountdownState {
        remaining: u32,
    }

    struct Countdown {
        state: CountdownState,
        clock: ManualClock,
    }

    impl Job for Countdown {
        const WORK_TYPE: &'static str = "test.countdown";
        type State = CountdownState;

        fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<JobResult<CountdownState>, JobError> {
            self.clock.advance(Duration::from_secs(1));
            self.state.remaining = self.state.remaining.saturating_sub(1);
            if self.state.remaining == 0 {
                return Ok(JobResult::Completed);
            }
            Ok(JobResult::resume(self.state.clone()).with_status(self.status_message()))
        }

        fn status_message(&self) -> String {
            format!("{} steps left", self.state.remaining)
        }
    }

    /// Appends its label to a shared journal.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Label(String);

    struct Record {
        label: Label,
        journal: Journal,
        clock: ManualClock,
    }

    impl Job for Record {
        const WORK_TYPE: &'static str = "test.record";
        type State = Label;

        fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<JobResult<Label>, JobError> {
            self.clock.advance(Duration::from_secs(1));
            self.journal
                .lock()
                .unwrap()
                .push(self.label.0.clone());
            Ok(JobResult::Completed)
        }

        fn status_message(&self) -> String {
            format!("Recording {}", self.label.0)
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    enum Mode {
        Fail,
        Error,
        Panic,
        Retry,
    }

    /// Misbehaves in the way its state asks it to.
    struct Faulty {
        mode: Mode,
        retry: RetrySchedule,
    }

    impl Job for Faulty {
        const WORK_TYPE: &'static str = "test.faulty";
        type State = Mode;

        fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult<Mode>, JobError> {
            match self.mode {
                Mode::Fail => Ok(JobResult::failed(Mode::Fail, "bad input")),
                Mode::Error => Err(JobError::msg("boom")),
                Mode::Panic => panic!("exploded"),
                Mode::Retry => Ok(self.retry.attempt_later_or_complete(
                    ctx.attempts(),
                    ctx.now(),
                    Mode::Retry,
                )),
            }
        }

        fn status_message(&self) -> String {
            format!("Misbehaving ({:?})", self.mode)
        }
    }

    /// Fires the termination hook mid-run, as a SIGTERM would.
    struct Crash {
        net: Arc<OnceLock<SafetyNet<InMemoryQueueStore>>>,
    }

    impl Job for Crash {
        const WORK_TYPE: &'static str = "test.crash";
        type State = ();

        fn run(&mut self, _ctx: &mut RunContext<'_>) -> Result<JobResult<()>, JobError> {
            let net = self.net.get().expect("safety net installed");
            net.on_termination();
            Ok(JobResult::Completed)
        }

        fn status_message(&self) -> String {
            "Crashing".to_string()
        }
    }

    /// Deletes its own row mid-run, then asks to resume.
    struct Cancelled {
        store: Arc<InMemoryQueueStore>,
    }

    impl Job for Cancelled {
        const WORK_TYPE: &'static str = "test.cancelled";
        type State = u32;

        fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult<u32>, JobError> {
            self.store
                .delete(ctx.entry_id())
                .map_err(|e| JobError::msg(e.to_string()))?;
            Ok(JobResult::resume(1))
        }

        fn status_message(&self) -> String {
            "Cancelling".to_string()
        }
    }

    /// In-memory store whose claim reverts always fail.
    struct BrokenRevert(InMemoryQueueStore);

    impl QueueStore for BrokenRevert {
        fn upsert(&self, entry: NewEntry) -> Result<EntryId, StoreError> {
            self.0.upsert(entry)
        }

        fn get(&self, id: EntryId) -> Result<Option<QueueEntry>, StoreError> {
            self.0.get(id)
        }

        fn get_by_key(&self, unique_key: &str) -> Result<Option<QueueEntry>, StoreError> {
            self.0.get_by_key(unique_key)
        }

        fn select_runnable(
            &self,
            manual: bool,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<QueueEntry>, StoreError> {
            self.0.select_runnable(manual, now, limit)
        }

        fn claim(
            &self,
            id: EntryId,
            observed: DateTime<Utc>,
            claimed_until: DateTime<Utc>,
            now: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            self.0.claim(id, observed, claimed_until, now)
        }

        fn revert_claim(
            &self,
            _id: EntryId,
            _token: DateTime<Utc>,
            _original: DateTime<Utc>,
        ) -> Result<bool, StoreError> {
            Err(StoreError::Unavailable("connection reset".to_string()))
        }

        fn complete_claimed(&self, id: EntryId, token: DateTime<Utc>) -> Result<bool, StoreError> {
            self.0.complete_claimed(id, token)
        }

        fn reschedule(
            &self,
            id: EntryId,
            token: DateTime<Utc>,
            state: &[u8],
            trigger_at: DateTime<Utc>,
            increment_attempts: bool,
        ) -> Result<bool, StoreError> {
            self.0.reschedule(id, token, state, trigger_at, increment_attempts)
        }

        fn dead_letter(
            &self,
            id: EntryId,
            token: DateTime<Utc>,
            failed: FailedEntry,
        ) -> Result<bool, StoreError> {
            self.0.dead_letter(id, token, failed)
        }

        fn delete(&self, id: EntryId) -> Result<bool, StoreError> {
            self.0.delete(id)
        }

        fn delete_by_key(&self, unique_key: &str) -> Result<bool, StoreError> {
            self.0.delete_by_key(unique_key)
        }

        fn list_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, StoreError> {
            self.0.list_failed(limit)
        }

        fn get_failed(&self, id: FailedEntryId) -> Result<Option<FailedEntry>, StoreError> {
            self.0.get_failed(id)
        }

        fn delete_failed(&self, id: FailedEntryId) -> Result<bool, StoreError> {
            self.0.delete_failed(id)
        }

        fn prune_failed(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
            self.0.prune_failed(before)
        }

        fn next_automatic_trigger(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.0.next_automatic_trigger()
        }

        fn stats(&self, now: DateTime<Utc>) -> Result<QueueStats, StoreError> {
            self.0.stats(now)
        }

        fn overdue(
            &self,
            manual: bool,
            before: DateTime<Utc>,
            limit: usize,
        ) -> Result<Vec<QueueEntry>, StoreError> {
            self.0.overdue(manual, before, limit)
        }
    }

    /// Ids 1..=total, each costing a second.
    struct Reindex {
        total: u64,
        clock: ManualClock,
    }

    impl BatchWork for Reindex {
        const WORK_TYPE: &'static str = "test.reindex";
        const DEFAULT_BATCH: usize = 4;

        fn next_ids(&mut self, after: Option<u64>, limit: usize) -> Result<Vec<u64>, JobError> {
            let start = after.map_or(1, |a| a + 1);
            Ok((start..=self.total).take(limit).collect())
        }

        fn process(&mut self, _id: u64, _ctx: &mut RunContext<'_>) -> Result<(), JobError> {
            self.clock.advance(Duration::from_secs(1));
            Ok(())
        }
    }

    // ---- harness --------------------------------------------------------

    struct Harness {
        manager: JobManager<InMemoryQueueStore>,
        store: Arc<InMemoryQueueStore>,
        clock: ManualClock,
        journal: Journal,
    }

    fn registry(clock: &ManualClock, journal: &Journal) -> (JobRegistry, Arc<OnceLock<SafetyNet<InMemoryQueueStore>>>) {
        let net = Arc::new(OnceLock::new());
        let mut registry = JobRegistry::new();

        let c = clock.clone();
        registry.register::<Countdown, _>(move |state| Countdown {
            state,
            clock: c.clone(),
        });
        let (c, j) = (clock.clone(), journal.clone());
        registry.register::<Record, _>(move |label| Record {
            label,
            journal: j.clone(),
            clock: c.clone(),
        });
        registry.register::<Faulty, _>(|mode| Faulty {
            mode,
            retry: RetrySchedule::new(vec![Duration::from_secs(60), Duration::from_secs(300)]),
        });
        let n = net.clone();
        registry.register::<Crash, _>(move |()| Crash { net: n.clone() });
        let c = clock.clone();
        registry.register::<RebuildJob<Reindex>, _>(move |state| {
            RebuildJob::new(
                Reindex {
                    total: 10,
                    clock: c.clone(),
                },
                state,
            )
        });

        (registry, net)
    }

    fn harness_with(config: ManagerConfig) -> Harness {
        let clock = ManualClock::starting_now();
        let journal: Journal = Arc::default();
        let store = InMemoryQueueStore::arc();
        let (registry, net) = registry(&clock, &journal);

        let manager = JobManager::new(store.clone(), registry, config)
            .with_clock(Arc::new(clock.clone()));
        let _ = net.set(manager.safety_net());

        Harness {
            manager,
            store,
            clock,
            journal,
        }
    }

    fn harness() -> Harness {
        harness_with(ManagerConfig::default())
    }

    fn label(text: &str) -> Label {
        Label(text.to_string())
    }

    fn journal(h: &Harness) -> Vec<String> {
        h.journal.lock().unwrap().clone()
    }

    // ---- enqueue --------------------------------------------------------

    #[test]
    fn unique_key_coalesces_to_latest_parameters() {
        let mut h = harness();

        let first = h
            .manager
            .enqueue_unique("digest", "test.countdown", &CountdownState { remaining: 1 })
            .unwrap();
        let cached = h
            .manager
            .enqueue_unique("digest", "test.countdown", &CountdownState { remaining: 2 })
            .unwrap();
        assert_eq!(first, cached);

        // a later request overwrites the pending entry in place
        h.manager.reset_request();
        let again = h
            .manager
            .enqueue_unique("digest", "test.countdown", &CountdownState { remaining: 3 })
            .unwrap();
        assert_eq!(first, again);

        assert_eq!(h.store.len().unwrap(), 1);
        let entry = h.manager.get_unique("digest").unwrap().unwrap();
        assert_eq!(
            decode_state::<Countdown>(&entry.state).unwrap(),
            CountdownState { remaining: 3 }
        );
        assert!(entry.is_manual);
        assert_eq!(entry.last_run_at, None);
    }

    #[test]
    fn upsert_resets_a_half_run_entry() {
        let mut h = harness();
        let id = h
            .manager
            .enqueue_with(
                "test.countdown",
                &CountdownState { remaining: 5 },
                EnqueueOptions::automatic().unique("sync"),
            )
            .unwrap();

        h.manager.run_queue(false, Duration::from_secs(2)).unwrap();
        let entry = h.manager.get(id).unwrap().unwrap();
        assert!(entry.last_run_at.is_some());

        h.manager.reset_request();
        h.manager
            .enqueue_with(
                "test.countdown",
                &CountdownState { remaining: 5 },
                EnqueueOptions::automatic().unique("sync"),
            )
            .unwrap();

        // the half-run row already sat at `now`, so the overwrite moves it back a tick
        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.last_run_at, None);
        assert_eq!(entry.trigger_at, h.clock.now() - chrono::Duration::microseconds(1));
        assert_eq!(
            decode_state::<Countdown>(&entry.state).unwrap(),
            CountdownState { remaining: 5 }
        );
    }

    // ---- running --------------------------------------------------------

    #[test]
    fn resume_carries_state_between_slices() {
        let mut h = harness();
        let id = h
            .manager
            .enqueue("test.countdown", &CountdownState { remaining: 3 })
            .unwrap();

        let result = h.manager.run_queue(false, Duration::from_secs(1)).unwrap();
        match result {
            Some(JobResult::Resume { status, .. }) => assert_eq!(status, "2 steps left"),
            other => panic!("expected resume, got {other:?}"),
        }

        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(
            decode_state::<Countdown>(&entry.state).unwrap(),
            CountdownState { remaining: 2 }
        );
        assert_eq!(entry.attempts, 0);
        assert_eq!(h.manager.describe(id).unwrap().unwrap().message.as_deref(), Some("2 steps left"));

        let result = h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        assert_eq!(result, Some(JobResult::Completed));
        assert!(h.manager.get(id).unwrap().is_none());
    }

    #[test]
    fn higher_priority_runs_first_with_one_slot() {
        let mut h = harness();
        let low = h
            .manager
            .enqueue_with("test.record", &label("low"), EnqueueOptions::automatic().priority(100))
            .unwrap();
        h.manager
            .enqueue_with("test.record", &label("high"), EnqueueOptions::automatic().priority(200))
            .unwrap();

        h.manager.run_queue(false, Duration::from_secs(1)).unwrap();

        assert_eq!(journal(&h), vec!["high".to_string()]);
        assert!(h.manager.get(low).unwrap().is_some());
    }

    #[test]
    fn manual_and_automatic_queues_are_separate() {
        let mut h = harness();
        h.manager.enqueue("test.record", &label("auto")).unwrap();
        let manual = h
            .manager
            .enqueue_unique("m", "test.record", &label("manual"))
            .unwrap();

        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        assert_eq!(journal(&h), vec!["auto".to_string()]);
        assert!(h.manager.get(manual).unwrap().is_some());

        h.manager.run_queue(true, Duration::from_secs(10)).unwrap();
        assert_eq!(journal(&h), vec!["auto".to_string(), "manual".to_string()]);
    }

    #[test]
    fn future_entries_wait_for_their_trigger() {
        let mut h = harness();
        let later = h.clock.now() + chrono::Duration::minutes(5);
        h.manager
            .enqueue_later(None, later, "test.record", &label("later"))
            .unwrap();

        assert_eq!(h.manager.run_queue(false, Duration::from_secs(10)).unwrap(), None);
        assert_eq!(h.manager.next_auto_run(), Some(later));

        h.clock.advance(Duration::from_secs(300));
        assert!(h.manager.is_auto_run_due());
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        assert_eq!(journal(&h), vec!["later".to_string()]);
        assert_eq!(h.manager.next_auto_run(), None);
    }

    #[test]
    fn losing_the_claim_race_skips_the_run() {
        let mut h = harness();
        let (registry, _) = registry(&h.clock, &h.journal);
        let mut rival = JobManager::new(h.store.clone(), registry, ManagerConfig::default())
            .with_clock(Arc::new(h.clock.clone()));

        h.manager.enqueue("test.record", &label("once")).unwrap();
        let mine = h.manager.select_runnable(false).unwrap();
        let theirs = rival.select_runnable(false).unwrap();
        assert_eq!(mine, theirs);

        let first = h.manager.claim_and_run(&mine[0], Duration::from_secs(10)).unwrap();
        let second = rival.claim_and_run(&theirs[0], Duration::from_secs(10)).unwrap();

        assert_eq!(first, JobResult::Completed);
        assert_eq!(second, JobResult::Completed);
        assert_eq!(journal(&h), vec!["once".to_string()]);
    }

    #[test]
    fn rebuild_job_walks_the_id_space_across_slices() {
        let mut h = harness();
        let id = h.manager.enqueue("test.reindex", &RebuildState::default()).unwrap();

        h.manager.run_queue(false, Duration::from_secs(3)).unwrap();
        let entry = h.manager.get(id).unwrap().unwrap();
        let state = decode_state::<RebuildJob<Reindex>>(&entry.state).unwrap();
        assert_eq!(state.processed, 3);
        assert_eq!(state.after, Some(3));

        h.manager.run_queue(false, Duration::from_secs(60)).unwrap();
        assert!(h.manager.get(id).unwrap().is_none());
    }

    // ---- failures -------------------------------------------------------

    #[test]
    fn failed_result_dead_letters_the_entry() {
        let mut h = harness();
        let id = h.manager.enqueue("test.faulty", &Mode::Fail).unwrap();
        let original = h.manager.get(id).unwrap().unwrap().state;

        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert!(h.manager.get(id).unwrap().is_none());
        let failed = h.manager.failed_entries(10).unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].work_type, "test.faulty");
        assert_eq!(failed[0].captured_error, "bad input");
        assert_eq!(failed[0].state, original);

        // never picked up again
        assert_eq!(h.manager.run_queue(false, Duration::from_secs(10)).unwrap(), None);
        assert_eq!(h.manager.stats().unwrap().failed, 1);
    }

    #[test]
    fn replayed_failure_is_enqueued_again() {
        let mut h = harness();
        h.manager.enqueue("test.faulty", &Mode::Fail).unwrap();
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        let failed = h.manager.failed_entries(10).unwrap().remove(0);

        let id = h
            .manager
            .replay_failed(failed.id, EnqueueOptions::manual())
            .unwrap();

        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.state, failed.state);
        assert!(entry.is_manual);
        assert!(h.manager.failed_entries(10).unwrap().is_empty());

        let err = h
            .manager
            .replay_failed(failed.id, EnqueueOptions::manual())
            .unwrap_err();
        assert!(matches!(err, ManagerError::Store(_)));
    }

    #[test]
    fn prune_drops_only_old_failures() {
        let mut h = harness();
        h.manager.enqueue("test.faulty", &Mode::Fail).unwrap();
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert_eq!(h.manager.prune_failed(Duration::from_secs(3600)).unwrap(), 0);
        h.clock.advance(Duration::from_secs(7200));
        assert_eq!(h.manager.prune_failed(Duration::from_secs(3600)).unwrap(), 1);
    }

    #[test]
    fn reattempts_follow_the_schedule_then_complete() {
        let mut h = harness();
        let id = h.manager.enqueue("test.faulty", &Mode::Retry).unwrap();
        let start = h.clock.now();

        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
        assert_eq!(entry.trigger_at, start + chrono::Duration::seconds(60));

        h.clock.advance(Duration::from_secs(60));
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.attempts, 2);
        assert_eq!(entry.trigger_at, start + chrono::Duration::seconds(360));

        // schedule exhausted: abandoned, not dead-lettered
        h.clock.advance(Duration::from_secs(300));
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        assert!(h.manager.get(id).unwrap().is_none());
        assert!(h.manager.failed_entries(10).unwrap().is_empty());
    }

    #[test]
    fn automatic_errors_and_panics_are_abandoned() {
        let mut h = harness();
        let errored = h.manager.enqueue("test.faulty", &Mode::Error).unwrap();
        let panicked = h.manager.enqueue("test.faulty", &Mode::Panic).unwrap();
        h.manager.enqueue("test.record", &label("after")).unwrap();

        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert!(h.manager.get(errored).unwrap().is_none());
        assert!(h.manager.get(panicked).unwrap().is_none());
        assert!(h.manager.failed_entries(10).unwrap().is_empty());
        assert_eq!(journal(&h), vec!["after".to_string()]);
        assert!(!h.manager.safety_net().is_armed());
    }

    #[test]
    fn manual_errors_revert_the_claim_and_propagate() {
        let mut h = harness();
        let id = h
            .manager
            .enqueue_with("test.faulty", &Mode::Panic, EnqueueOptions::manual())
            .unwrap();
        let original = h.manager.get(id).unwrap().unwrap().trigger_at;

        let err = h.manager.run_queue(true, Duration::from_secs(10)).unwrap_err();
        match err {
            ManagerError::JobFailed { entry_id, message, .. } => {
                assert_eq!(entry_id, id);
                assert_eq!(message, "panic: exploded");
            }
            other => panic!("unexpected error: {other}"),
        }

        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.trigger_at, original);
        assert_eq!(h.manager.select_runnable(true).unwrap().len(), 1);
    }

    #[test]
    fn strict_mode_reports_automatic_errors() {
        let mut h = harness_with(ManagerConfig::default().strict(true));
        let id = h.manager.enqueue("test.faulty", &Mode::Error).unwrap();

        let err = h.manager.run_queue(false, Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, ManagerError::JobFailed { ref message, .. } if message == "boom"));
        assert!(h.manager.get(id).unwrap().is_some());
    }

    #[test]
    fn failed_revert_still_reports_the_job_error() {
        let clock = ManualClock::starting_now();
        let journal: Journal = Arc::default();
        let (registry, _) = registry(&clock, &journal);
        let store = Arc::new(BrokenRevert(InMemoryQueueStore::new()));
        let mut manager = JobManager::new(store, registry, ManagerConfig::default().strict(true))
            .with_clock(Arc::new(clock.clone()));
        let id = manager.enqueue("test.faulty", &Mode::Error).unwrap();

        let err = manager.run_queue(false, Duration::from_secs(10)).unwrap_err();
        match err {
            ManagerError::JobFailed { entry_id, message, .. } => {
                assert_eq!(entry_id, id);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!manager.safety_net().is_armed());
    }

    #[test]
    fn failed_blocking_run_keeps_the_request_bucket() {
        let mut h = harness_with(ManagerConfig::default().strict(true));
        let id = h
            .manager
            .enqueue_auto_blocking("test.faulty", &Mode::Error)
            .unwrap();

        assert!(h.manager.run_blocking(Duration::from_secs(8)).is_err());
        // still tracked, so a second attempt sees the entry again
        assert!(h.manager.run_blocking(Duration::from_secs(8)).is_err());
        assert_eq!(h.manager.take_enqueued().auto_blocking, vec![id]);
        assert!(h.manager.get(id).unwrap().is_some());
    }

    #[test]
    fn cancel_during_run_drops_the_resume() {
        let clock = ManualClock::starting_now();
        let store = InMemoryQueueStore::arc();
        let s = store.clone();
        let registry = JobRegistry::new().with::<Cancelled, _>(move |_| Cancelled { store: s.clone() });
        let mut manager = JobManager::new(store.clone(), registry, ManagerConfig::default())
            .with_clock(Arc::new(clock.clone()));
        let id = manager.enqueue("test.cancelled", &0u32).unwrap();

        let result = manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert!(matches!(result, Some(JobResult::Resume { .. })));
        assert!(manager.get(id).unwrap().is_none());
        assert_eq!(store.len().unwrap(), 0);
        assert!(manager.failed_entries(10).unwrap().is_empty());
        assert!(!manager.safety_net().is_armed());
    }

    #[test]
    fn unknown_work_type_is_dropped() {
        let mut h = harness();
        let id = h.manager.enqueue("retired.job", &label("x")).unwrap();

        let result = h.manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert_eq!(result, Some(JobResult::Completed));
        assert!(h.manager.get(id).unwrap().is_none());
        assert!(h.manager.failed_entries(10).unwrap().is_empty());
    }

    #[test]
    fn undecodable_state_is_dead_lettered() {
        let mut h = harness();
        // a record label is not a countdown state
        let id = h.manager.enqueue("test.countdown", &label("garbage")).unwrap();

        let result = h.manager.run_queue(false, Duration::from_secs(10)).unwrap();

        assert!(matches!(result, Some(JobResult::Failed { .. })));
        assert!(h.manager.get(id).unwrap().is_none());
        assert_eq!(h.manager.failed_entries(10).unwrap().len(), 1);
    }

    // ---- crash safety ---------------------------------------------------

    #[test]
    fn restored_claim_is_runnable_again() {
        let mut h = harness();
        let id = h.manager.enqueue("test.crash", &()).unwrap();
        let original = h.manager.get(id).unwrap().unwrap().trigger_at;

        let entry = h.manager.select_runnable(false).unwrap().remove(0);
        h.manager.claim_and_run(&entry, Duration::from_secs(10)).unwrap();

        let entry = h.manager.get(id).unwrap().unwrap();
        assert_eq!(entry.trigger_at, original);
        assert_eq!(h.manager.select_runnable(false).unwrap().len(), 1);
    }

    #[test]
    fn abandoned_claim_expires_after_the_window() {
        let mut h = harness_with(ManagerConfig::default().with_claim_window(Duration::from_secs(60)));
        let id = h.manager.enqueue("test.record", &label("late")).unwrap();
        let entry = h.manager.get(id).unwrap().unwrap();

        // a process that claimed the entry and died without any exit hook
        let now = h.clock.now();
        let token = now + chrono::Duration::seconds(60);
        assert!(h.store.claim(id, entry.trigger_at, token, now).unwrap());
        assert!(h.manager.select_runnable(false).unwrap().is_empty());
        assert_eq!(h.manager.run_by_id(id, Duration::from_secs(10)).unwrap(), None);

        h.clock.advance(Duration::from_secs(60));
        h.manager.run_queue(false, Duration::from_secs(10)).unwrap();
        assert_eq!(journal(&h), vec!["late".to_string()]);
    }

    // ---- triggers -------------------------------------------------------

    #[test]
    fn blocking_entries_run_before_the_request_ends() {
        let mut h = harness();
        let quick = h
            .manager
            .enqueue_auto_blocking("test.countdown", &CountdownState { remaining: 2 })
            .unwrap();
        let slow = h
            .manager
            .enqueue_auto_blocking("test.countdown", &CountdownState { remaining: 20 })
            .unwrap();

        let pending = h.manager.run_blocking(Duration::from_secs(5)).unwrap();

        assert!(h.manager.get(quick).unwrap().is_none());
        assert_eq!(pending, vec![slow]);
        assert_eq!(h.manager.take_enqueued().auto_blocking, vec![slow]);
    }

    #[test]
    fn request_epilogue_runs_due_automatic_work() {
        let mut h = harness();
        h.manager.enqueue("test.record", &label("auto")).unwrap();
        let manual = h
            .manager
            .enqueue_unique("export", "test.record", &label("manual"))
            .unwrap();

        let outcome = trigger::after_request(&mut h.manager, &TriggerConfig::default()).unwrap();

        assert!(outcome.auto_ran);
        assert!(outcome.blocking_pending.is_empty());
        assert_eq!(outcome.manual_enqueued, vec![manual]);
        assert_eq!(journal(&h), vec!["auto".to_string()]);
        assert!(h.manager.take_enqueued().is_empty());

        // nothing due: the next request skips the slice
        let outcome = trigger::after_request(&mut h.manager, &TriggerConfig::default()).unwrap();
        assert!(!outcome.auto_ran);
    }

    #[test]
    fn run_now_respects_trigger_policy() {
        let mut h = harness();
        let automatic = h.manager.enqueue("test.record", &label("auto")).unwrap();
        let later = h.clock.now() + chrono::Duration::hours(1);
        let rebuild = h
            .manager
            .enqueue_with(
                "test.reindex",
                &RebuildState::default(),
                EnqueueOptions::automatic().run_at(later),
            )
            .unwrap();

        let err = trigger::run_now(&mut h.manager, automatic, Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ManagerError::NotTriggerable(id) if id == automatic));

        // rebuild jobs opt in, and run ahead of their trigger time
        let result = trigger::run_now(&mut h.manager, rebuild, Duration::from_secs(60)).unwrap();
        match result {
            Some(JobResult::Resume { status, cancellable, .. }) => {
                assert_eq!(status, "Running test.reindex (4)");
                assert!(cancellable);
            }
            other => panic!("expected resume, got {other:?}"),
        }
        assert_eq!(h.manager.get(rebuild).unwrap().unwrap().trigger_at, h.clock.now());
    }

    #[test]
    fn cron_drains_due_work() {
        let mut h = harness();
        for text in ["a", "b", "c"] {
            h.manager.enqueue("test.record", &label(text)).unwrap();
        }

        trigger::cron(&mut h.manager, &TriggerConfig::default()).unwrap();

        assert_eq!(journal(&h).len(), 3);
        assert_eq!(h.manager.stats().unwrap().automatic_pending, 0);
    }
}
