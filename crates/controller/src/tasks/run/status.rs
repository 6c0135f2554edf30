//! Interpretation of the Tekton `TaskRun` status

use crate::crds::{RunResult, TaskRun};
use crate::crds::taskrun::{Condition, StepState};
use chrono::Utc;
use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use serde::Deserialize;

#[cfg(test)]
use mockall::automock;

/// Step executing the pipeline inside the task
pub const RUNNER_STEP_NAME: &str = "pipeline-runner";
/// Key of the pipeline result message in the step termination log
pub const TERMINATION_MESSAGE_KEY: &str = "pipeline-termination-log";

const CONDITION_SUCCEEDED: &str = "Succeeded";
const REASON_FAILED: &str = "Failed";
const REASON_TIMED_OUT: &str = "TimedOut";
const REASON_TASK_RUN_TIMEOUT: &str = "TaskRunTimeout";
const REASON_IMAGE_PULL_FAILED: &str = "TaskRunImagePullFailed";
const REASON_POD_CREATION_FAILED: &str = "PodCreationFailed";

const EXIT_CODE_ERROR_CONTENT: i32 = 2;
const EXIT_CODE_ERROR_CONFIG: i32 = 3;

/// Observed state of one pipeline execution
#[cfg_attr(test, automock)]
pub trait Run: Send + Sync {
    /// When the pipeline step started, if it has
    fn start_time(&self) -> Option<Time>;

    /// When the run completed; the current time if it has not
    fn completion_time(&self) -> Time;

    /// State of the pipeline step container
    fn container_info(&self) -> Option<ContainerState>;

    /// Whether the run is over, and with which result
    fn is_finished(&self) -> (bool, RunResult);

    /// Message describing the outcome
    fn message(&self) -> String;

    /// Whether the run failed before the pipeline got to execute and may be
    /// re-created
    fn is_restartable(&self) -> bool;

    fn is_deleted(&self) -> bool;
}

#[derive(Debug, Deserialize)]
struct TerminationEntry {
    key: String,
    #[serde(default)]
    value: String,
}

/// `Run` backed by a Tekton `TaskRun`
#[derive(Debug, Clone)]
pub struct TektonRun {
    task_run: TaskRun,
}

impl TektonRun {
    pub fn new(task_run: TaskRun) -> Self {
        Self { task_run }
    }

    fn succeeded(&self) -> Option<&Condition> {
        self.task_run
            .status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == CONDITION_SUCCEEDED)
    }

    fn failed_reason(&self) -> Option<&str> {
        self.succeeded()
            .filter(|c| c.status == "False")
            .map(|c| c.reason.as_deref().unwrap_or_default())
    }

    fn runner_step(&self) -> Option<&StepState> {
        let container = format!("step-{RUNNER_STEP_NAME}");
        self.task_run.status.as_ref()?.steps.iter().find(|step| {
            step.name == RUNNER_STEP_NAME || step.container.as_deref() == Some(container.as_str())
        })
    }

    fn condition_message(&self) -> String {
        self.succeeded()
            .and_then(|c| c.message.clone())
            .unwrap_or_default()
    }
}

impl Run for TektonRun {
    fn start_time(&self) -> Option<Time> {
        let step = self.runner_step()?;
        step.running
            .as_ref()
            .and_then(|running| running.started_at.clone())
            .or_else(|| {
                step.terminated
                    .as_ref()
                    .and_then(|terminated| terminated.started_at.clone())
            })
    }

    fn completion_time(&self) -> Time {
        self.task_run
            .status
            .as_ref()
            .and_then(|status| status.completion_time.clone())
            .or_else(|| self.succeeded().and_then(|c| c.last_transition_time.clone()))
            .unwrap_or_else(|| Time(Utc::now()))
    }

    fn container_info(&self) -> Option<ContainerState> {
        let step = self.runner_step()?;
        if step.waiting.is_none() && step.running.is_none() && step.terminated.is_none() {
            return None;
        }
        Some(ContainerState {
            waiting: step.waiting.clone(),
            running: step.running.clone(),
            terminated: step.terminated.clone(),
        })
    }

    fn is_finished(&self) -> (bool, RunResult) {
        let Some(condition) = self.succeeded() else {
            return (false, RunResult::Undefined);
        };
        match condition.status.as_str() {
            "True" => (true, RunResult::Success),
            "False" => {
                let result = match condition.reason.as_deref() {
                    Some(REASON_TIMED_OUT | REASON_TASK_RUN_TIMEOUT) => RunResult::Timeout,
                    Some(REASON_FAILED) => {
                        let exit_code = self
                            .runner_step()
                            .and_then(|step| step.terminated.as_ref())
                            .map(|terminated| terminated.exit_code);
                        match exit_code {
                            Some(EXIT_CODE_ERROR_CONTENT) => RunResult::ErrorContent,
                            Some(EXIT_CODE_ERROR_CONFIG) => RunResult::ErrorConfig,
                            _ => RunResult::ErrorInfra,
                        }
                    }
                    _ => RunResult::ErrorInfra,
                };
                (true, result)
            }
            _ => (false, RunResult::Undefined),
        }
    }

    fn message(&self) -> String {
        let payload = self
            .runner_step()
            .and_then(|step| step.terminated.as_ref())
            .and_then(|terminated| terminated.message.as_deref())
            .filter(|message| !message.trim().is_empty());

        let Some(payload) = payload else {
            return self.condition_message();
        };
        match serde_json::from_str::<Vec<TerminationEntry>>(payload) {
            Ok(entries) => entries
                .into_iter()
                .find(|entry| entry.key == TERMINATION_MESSAGE_KEY)
                .map(|entry| entry.value)
                .unwrap_or_else(|| "internal error".to_string()),
            Err(_) => self.condition_message(),
        }
    }

    fn is_restartable(&self) -> bool {
        matches!(
            self.failed_reason(),
            Some(REASON_IMAGE_PULL_FAILED | REASON_POD_CREATION_FAILED)
        )
    }

    fn is_deleted(&self) -> bool {
        self.task_run.metadata.deletion_timestamp.is_some()
    }
}
