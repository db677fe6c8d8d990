use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::context::RunContext;
use crate::result::{JobError, JobResult};
use crate::state::{self, StateError};

/// A unit of work the scheduler can run in time slices.
///
/// A job is built from its decoded `State` (see `JobRegistry::register`), runs
/// until it finishes or its budget (`ctx.max_run_time()`) is spent, and reports
/// what should happen next through `JobResult`. Pausing is always a *return*:
/// a long job checks `ctx.time_exhausted()` at safe points and hands back
/// `JobResult::Resume` with the state it needs to continue.
pub trait Job: Send + 'static {
    /// Registry key stored in every queue entry of this type.
    const WORK_TYPE: &'static str;

    /// Version written into the state envelope.
    const STATE_VERSION: u32 = 1;

    type State: Serialize + DeserializeOwned + Send + 'static;

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult<Self::State>, JobError>;

    /// Human-readable progress. Not used for control flow.
    fn status_message(&self) -> String;

    fn can_cancel(&self) -> bool {
        false
    }

    fn can_trigger_by_choice(&self) -> bool {
        false
    }

    /// Migrate state written under an older `STATE_VERSION`.
    fn upgrade_state(version: u32, data: JsonValue) -> Result<Self::State, StateError> {
        let _ = data;
        Err(StateError::UnsupportedVersion {
            found: version,
            current: Self::STATE_VERSION,
        })
    }
}

/// Decode a state blob for `J`, upgrading older versions.
pub fn decode_state<J: Job>(bytes: &[u8]) -> Result<J::State, StateError> {
    let (version, data) = state::open(bytes)?;
    if version == J::STATE_VERSION {
        state::from_data(data)
    } else {
        J::upgrade_state(version, data)
    }
}

pub fn encode_state<J: Job>(value: &J::State) -> Result<Vec<u8>, StateError> {
    state::encode(J::STATE_VERSION, value)
}

/// Object-safe view of a `Job` whose state is already a blob.
pub trait DynJob: Send {
    fn work_type(&self) -> &'static str;

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult, JobError>;

    fn status_message(&self) -> String;

    fn can_cancel(&self) -> bool;

    fn can_trigger_by_choice(&self) -> bool;
}

pub(crate) struct Erased<J>(pub(crate) J);

impl<J: Job> DynJob for Erased<J> {
    fn work_type(&self) -> &'static str {
        J::WORK_TYPE
    }

    fn run(&mut self, ctx: &mut RunContext<'_>) -> Result<JobResult, JobError> {
        let result = self.0.run(ctx)?;
        Ok(result.try_map_state(|s| encode_state::<J>(&s))?)
    }

    fn status_message(&self) -> String {
        self.0.status_message()
    }

    fn can_cancel(&self) -> bool {
        self.0.can_cancel()
    }

    fn can_trigger_by_choice(&self) -> bool {
        self.0.can_trigger_by_choice()
    }
}
