//! Run environments and the Tekton executions inside them

pub mod manager;
pub mod manifests;
pub mod status;

pub use manager::{RunManager, RunRepositories, TektonRunManager, TASK_RUN_NAME};
pub use status::{Run, TektonRun};

#[cfg(test)]
pub use manager::MockRunManager;
#[cfg(test)]
pub use status::MockRun;
