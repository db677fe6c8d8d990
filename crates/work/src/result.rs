use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::StateError;

/// Outcome of a single invocation of a job.
///
/// `S` is the job's state. Jobs produce `JobResult<Job::State>`; the registry
/// encodes it into `JobResult<Vec<u8>>` (the default) before the manager sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum JobResult<S = Vec<u8>> {
    /// Nothing left to do; the queue entry is deleted.
    Completed,
    /// More work remains. The entry keeps its attempt count.
    Resume {
        state: S,
        status: String,
        cancellable: bool,
        /// `None` means "as soon as possible".
        continue_at: Option<DateTime<Utc>>,
    },
    /// A transient failure; try again at `next_try_at`. Increments attempts.
    Reattempt {
        state: S,
        next_try_at: DateTime<Utc>,
    },
    /// A hard failure; the entry moves to the dead-letter table.
    Failed { state: S, error: String },
}

impl<S> JobResult<S> {
    pub fn completed() -> Self {
        Self::Completed
    }

    pub fn resume(state: S) -> Self {
        Self::Resume {
            state,
            status: String::new(),
            cancellable: false,
            continue_at: None,
        }
    }

    pub fn reattempt(state: S, next_try_at: DateTime<Utc>) -> Self {
        Self::Reattempt { state, next_try_at }
    }

    pub fn failed(state: S, error: impl Into<String>) -> Self {
        Self::Failed {
            state,
            error: error.into(),
        }
    }

    /// Set the status message of a `Resume`. No effect on other variants.
    pub fn with_status(mut self, message: impl Into<String>) -> Self {
        if let Self::Resume { status, .. } = &mut self {
            *status = message.into();
        }
        self
    }

    /// Mark a `Resume` as cancellable. No effect on other variants.
    pub fn cancellable(mut self, can_cancel: bool) -> Self {
        if let Self::Resume { cancellable, .. } = &mut self {
            *cancellable = can_cancel;
        }
        self
    }

    /// Defer a `Resume` until `at`. No effect on other variants.
    pub fn continue_at(mut self, at: DateTime<Utc>) -> Self {
        if let Self::Resume { continue_at, .. } = &mut self {
            *continue_at = Some(at);
        }
        self
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }

    /// Whether the entry stays in the queue after this outcome.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Resume { .. } | Self::Reattempt { .. })
    }

    pub fn state(&self) -> Option<&S> {
        match self {
            Self::Completed => None,
            Self::Resume { state, .. } | Self::Reattempt { state, .. } | Self::Failed { state, .. } => {
                Some(state)
            }
        }
    }

    /// Short outcome name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Resume { .. } => "resume",
            Self::Reattempt { .. } => "reattempt",
            Self::Failed { .. } => "failed",
        }
    }

    /// Convert the carried state, keeping every other field.
    pub fn try_map_state<T, E>(self, f: impl FnOnce(S) -> Result<T, E>) -> Result<JobResult<T>, E> {
        Ok(match self {
            Self::Completed => JobResult::Completed,
            Self::Resume {
                state,
                status,
                cancellable,
                continue_at,
            } => JobResult::Resume {
                state: f(state)?,
                status,
                cancellable,
                continue_at,
            },
            Self::Reattempt { state, next_try_at } => JobResult::Reattempt {
                state: f(state)?,
                next_try_at,
            },
            Self::Failed { state, error } => JobResult::Failed {
                state: f(state)?,
                error,
            },
        })
    }
}

/// Error returned by a job run that did not produce a `JobResult`.
///
/// The manager treats this as an unexpected failure (see `JobManager::claim_and_run`),
/// unlike `JobResult::Failed`, which is a deliberate dead-letter.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl JobError {
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }
}
