pub mod pipelinerun;
pub mod taskrun;

pub use pipelinerun::*;
pub use taskrun::{TaskRun, TaskRunSpec, TaskRunStatus};
