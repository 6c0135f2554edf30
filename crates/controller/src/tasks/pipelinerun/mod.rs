//! `PipelineRun` reconciliation

pub mod controller;
pub mod handle;

pub use controller::{error_policy, reconcile_pipeline_run};
pub use handle::{KubePipelineRunStore, PipelineRunHandle, PipelineRunStore};

#[cfg(test)]
pub use handle::MockPipelineRunStore;
