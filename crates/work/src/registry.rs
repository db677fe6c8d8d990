use std::collections::HashMap;

use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::job::{DynJob, Erased, Job, decode_state};
use crate::state::{self, StateError};

type Factory = Box<dyn Fn(&[u8]) -> Result<Box<dyn DynJob>, StateError> + Send + Sync>;

struct Registration {
    state_version: u32,
    factory: Factory,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown work type: {0}")]
    UnknownWorkType(String),

    #[error(transparent)]
    State(#[from] StateError),
}

/// Maps work-type keys to job factories.
///
/// Populated once at startup; the manager resolves every claimed entry here.
#[derive(Default)]
pub struct JobRegistry {
    jobs: HashMap<String, Registration>,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("work_types", &self.work_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `J`, built from its decoded state by `factory`.
    ///
    /// Registering the same work type twice replaces the earlier factory.
    pub fn register<J, F>(&mut self, factory: F) -> &mut Self
    where
        J: Job,
        F: Fn(J::State) -> J + Send + Sync + 'static,
    {
        let build: Factory = Box::new(move |bytes| {
            let state = decode_state::<J>(bytes)?;
            Ok(Box::new(Erased(factory(state))) as Box<dyn DynJob>)
        });

        let replaced = self
            .jobs
            .insert(
                J::WORK_TYPE.to_string(),
                Registration {
                    state_version: J::STATE_VERSION,
                    factory: build,
                },
            )
            .is_some();
        debug!(work_type = J::WORK_TYPE, replaced, "registered job type");
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with<J, F>(mut self, factory: F) -> Self
    where
        J: Job,
        F: Fn(J::State) -> J + Send + Sync + 'static,
    {
        self.register::<J, F>(factory);
        self
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.jobs.contains_key(work_type)
    }

    /// Registered work types, sorted.
    pub fn work_types(&self) -> Vec<&str> {
        let mut types: Vec<_> = self.jobs.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn state_version(&self, work_type: &str) -> Option<u32> {
        self.jobs.get(work_type).map(|r| r.state_version)
    }

    /// Encode enqueue parameters as the initial state of `work_type`.
    ///
    /// Work types unknown to this process (run elsewhere) get version 1.
    pub fn encode_params<P: Serialize + ?Sized>(
        &self,
        work_type: &str,
        params: &P,
    ) -> Result<Vec<u8>, StateError> {
        state::encode(self.state_version(work_type).unwrap_or(1), &params)
    }

    /// Instantiate the job stored under `work_type` with `state`.
    pub fn resolve(&self, work_type: &str, state: &[u8]) -> Result<Box<dyn DynJob>, RegistryError> {
        let registration = self
            .jobs
            .get(work_type)
            .ok_or_else(|| RegistryError::UnknownWorkType(work_type.to_string()))?;
        Ok((registration.factory)(state)?)
    }
}
