//! Infrastructure layer: queue storage, the job manager, configuration.

pub mod config;
pub mod jobs;

mod integration_tests;
