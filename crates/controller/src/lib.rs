/*
 * 5D Labs PipelineRun Controller - Isolated Pipeline Executions on Kubernetes
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! PipelineRun controller library
//!
//! Drives `PipelineRun` resources through their lifecycle: every run gets a
//! freshly provisioned namespace holding copies of its secrets, a service
//! account and network policies, the pipeline executes there as a Tekton
//! `TaskRun`, and the namespace is torn down once the run is over.

pub mod crds;
pub mod errors;
pub mod tasks;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use crds::{PipelineRun, PipelineRunSpec, PipelineRunStatus, RunResult, State};
pub use tasks::config::ControllerConfig;
