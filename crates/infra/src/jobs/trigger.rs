//! Entry points that drive the queue.
//!
//! There are no worker processes. The queue advances whenever something
//! calls one of these: the tail of a web request, a cron tick, or an
//! operator asking for a specific entry to run now.

use std::time::Duration;

use tracing::debug;

use jobforge_core::EntryId;
use jobforge_work::JobResult;

use super::manager::{JobManager, ManagerError};
use super::store::QueueStore;

/// Time budgets per entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerConfig {
    /// Automatic slice run at the end of a request.
    pub request_slice: Duration,
    pub cron_slice: Duration,
    /// Budget for a request's blocking entries.
    pub blocking_slice: Duration,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            request_slice: Duration::from_secs(2),
            cron_slice: Duration::from_secs(30),
            blocking_slice: Duration::from_secs(8),
        }
    }
}

/// What the request epilogue did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestOutcome {
    /// Blocking entries that did not finish within the budget.
    pub blocking_pending: Vec<EntryId>,
    /// Manual entries enqueued by the request, for progress display.
    pub manual_enqueued: Vec<EntryId>,
    pub auto_ran: bool,
}

/// End-of-request hook.
///
/// Runs the request's blocking entries, then a short automatic slice if the
/// next automatic run is due, and finally clears the per-request state.
pub fn after_request<S: QueueStore>(
    manager: &mut JobManager<S>,
    config: &TriggerConfig,
) -> Result<RequestOutcome, ManagerError> {
    let blocking_pending = manager.run_blocking(config.blocking_slice)?;
    let enqueued = manager.take_enqueued();

    manager.flush()?;
    let auto_ran = manager.is_auto_run_due();
    if auto_ran {
        manager.run_queue(false, config.request_slice)?;
    }
    manager.reset_request();

    debug!(
        blocking_pending = blocking_pending.len(),
        manual = enqueued.manual.len(),
        auto_ran,
        "request epilogue finished"
    );
    Ok(RequestOutcome {
        blocking_pending,
        manual_enqueued: enqueued.manual,
        auto_ran,
    })
}

/// Cron tick: a longer automatic slice.
pub fn cron<S: QueueStore>(
    manager: &mut JobManager<S>,
    config: &TriggerConfig,
) -> Result<Option<JobResult>, ManagerError> {
    manager.run_queue(false, config.cron_slice)
}

/// Operator "run now" for one entry.
///
/// Only manual entries and jobs that allow triggering by choice qualify.
pub fn run_now<S: QueueStore>(
    manager: &mut JobManager<S>,
    id: EntryId,
    max_run_time: Duration,
) -> Result<Option<JobResult>, ManagerError> {
    let Some(status) = manager.describe(id)? else {
        return Ok(None);
    };
    if !status.entry.is_manual && !status.can_trigger_by_choice {
        return Err(ManagerError::NotTriggerable(id));
    }
    manager.run_by_id(id, max_run_time)
}
