//! Resumable batch jobs over an id range.
//!
//! [`RebuildJob`] drives any [`BatchWork`] through an ascending id space, one
//! batch per run, persisting a cursor between runs and sizing the next batch
//! with [`calculate_optimal_batch`].

use serde::{Deserialize, Serialize};

use crate::batch::calculate_optimal_batch;
use crate::context::RunContext;
use crate::job::Job;
use crate::result::{JobError, JobResult};

/// Per-item work of a rebuild-style job.
pub trait BatchWork: Send + 'static {
    const WORK_TYPE: &'static str;

    /// Batch size of the very first run.
    const DEFAULT_BATCH: usize = 100;

    const MAX_BATCH: Option<usize> = None;

    /// Up to `limit` ids strictly greater than `after`, ascending.
    fn next_ids(&mut self, after: Option<u64>, limit: usize) -> Result<Vec<u64>, JobError>;

    fn process(&mut self, id: u64, ctx: &mut RunContext<'_>) -> Result<(), JobError>;

    /// Status prefix, e.g. "Rebuilding thread counters".
    fn label(&self) -> String {
        format!("Running {}", Self::WORK_TYPE)
    }
}

/// Cursor persisted between runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebuildState {
    /// Last processed id.
    pub after: Option<u64>,
    pub batch: usize,
    pub processed: u64,
}

pub struct RebuildJob<W> {
    work: W,
    state: RebuildState,
}

impl<W: BatchWork> RebuildJob<W> {
    pub fn new(work: W, mut state: RebuildState) -> Self {
        if state.batch == 0 {
            state.batch = W::DEFAULT_BATCH;
        }
        Self { work, state }
    }

    pub fn state(&self) -> &RebuildState {
        &self.state
    }

    pub fn work(&self) -> &W {
        &self.work
    }
}

impl<W: BatchWork> Job for RebuildJob<W> {
    const WORK_TYPE: &'static str = W::WORK_TYPE;
    type State = RebuildState;

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult<RebuildState>, JobError> {
        let batch = self.state.batch.max(1);
        let ids = self.work.next_ids(self.state.after, batch)?;
        if ids.is_empty() {
            return Ok(JobResult::Completed);
        }

        let fetched = ids.len();
        let mut done = 0;
        for id in ids {
            // always make progress, even on an exhausted budget
            if done > 0 && ctx.time_exhausted() {
                break;
            }
            self.work.process(id, ctx)?;
            self.state.after = Some(id);
            self.state.processed += 1;
            done += 1;
        }

        self.state.batch =
            calculate_optimal_batch(batch, done, ctx.elapsed(), ctx.max_run_time(), W::MAX_BATCH);

        if done == fetched && fetched < batch {
            return Ok(JobResult::Completed);
        }

        Ok(JobResult::resume(self.state.clone())
            .with_status(self.status_message())
            .cancellable(self.can_cancel()))
    }

    fn status_message(&self) -> String {
        format!("{} ({})", self.work.label(), self.state.processed)
    }

    fn can_cancel(&self) -> bool {
        true
    }

    fn can_trigger_by_choice(&self) -> bool {
        true
    }
}
