//! `PipelineRun` Custom Resource Definition

use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// `PipelineRun` CRD describing one requested pipeline execution
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "pipelines.platform", version = "v1alpha1", kind = "PipelineRun")]
#[kube(namespaced)]
#[kube(status = "PipelineRunStatus")]
#[kube(printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Result","type":"string","jsonPath":".status.result"}"#)]
#[kube(printcolumn = r#"{"name":"Namespace","type":"string","jsonPath":".status.namespace"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunSpec {
    /// Secrets copied into the run namespace for use by the pipeline
    #[serde(default)]
    pub secrets: Vec<String>,

    /// Docker registry secrets attached to the run's service account
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// SCM credentials used to clone the pipeline repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_clone_secret: Option<String>,

    /// Where the pipeline definition lives
    pub pipeline: PipelineSource,

    /// Execution image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerSpec>,

    /// Named operator profiles selected for this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profiles: Option<Profiles>,

    /// Execution timeout override (Go duration format, e.g. "45m")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Free-form details describing what triggered the run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_details: Option<RunDetails>,

    /// Log shipping configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logging: Option<Logging>,

    /// Requested intent; `abort` tears the run down
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

/// Pipeline source repository and parameters
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSource {
    pub repo_url: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub relative_path: String,
    /// Arguments handed to the pipeline, JSON encoded into a task parameter
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunnerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_pull_policy: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Profiles {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunDetails {
    #[serde(default)]
    pub job_name: String,
    #[serde(default)]
    pub sequence_number: i32,
    #[serde(default)]
    pub cause: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Logging {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<Elasticsearch>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
pub struct Elasticsearch {
    /// Arbitrary JSON value identifying the run in the log index
    #[serde(rename = "runID", default)]
    pub run_id: serde_json::Value,

    /// Index URL overriding the task default
    #[serde(rename = "indexURL", default, skip_serializing_if = "Option::is_none")]
    pub index_url: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Intent {
    #[default]
    Run,
    Abort,
}

/// Lifecycle state of a `PipelineRun`
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum State {
    #[default]
    #[serde(rename = "")]
    Undefined,
    New,
    Preparing,
    Waiting,
    Running,
    Cleaning,
    Finished,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Undefined => "undefined",
            State::New => "new",
            State::Preparing => "preparing",
            State::Waiting => "waiting",
            State::Running => "running",
            State::Cleaning => "cleaning",
            State::Finished => "finished",
        };
        f.write_str(name)
    }
}

/// Outcome of a `PipelineRun`, also used as the error outcome class
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunResult {
    #[default]
    #[serde(rename = "")]
    Undefined,
    Success,
    ErrorInfra,
    ErrorContent,
    ErrorConfig,
    Timeout,
    Aborted,
    Deleted,
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunResult::Undefined => "undefined",
            RunResult::Success => "success",
            RunResult::ErrorInfra => "error_infra",
            RunResult::ErrorContent => "error_content",
            RunResult::ErrorConfig => "error_config",
            RunResult::Timeout => "timeout",
            RunResult::Aborted => "aborted",
            RunResult::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

/// One entry of the state history
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StateItem {
    pub state: State,
    pub started_at: Time,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<Time>,
}

/// Status of the `PipelineRun`
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRunStatus {
    /// Current lifecycle state
    #[serde(default)]
    pub state: State,

    /// Current state and the time it was entered
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_details: Option<StateItem>,

    /// Previously left states, oldest first
    #[serde(default)]
    pub state_history: Vec<StateItem>,

    /// Outcome of the run
    #[serde(default)]
    pub result: RunResult,

    /// Run namespace hosting the execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    /// Auxiliary namespace created alongside the run namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auxiliary_namespace: Option<String>,

    /// Human-readable message about the current state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Container state of the pipeline runner step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<ContainerState>,
}
