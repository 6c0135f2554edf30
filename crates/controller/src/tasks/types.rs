//! Shared controller types, errors and well-known names

use super::config::{ControllerConfig, PipelineRunsConfigSource};
use super::pipelinerun::PipelineRunStore;
use super::run::RunManager;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Finalizer guarding environment teardown
pub const PIPELINERUN_FINALIZER_NAME: &str = "pipelines.platform/pipelinerun-cleanup";

/// Label marking objects created by this controller
pub const LABEL_SYSTEM_MANAGED: &str = "pipelines.platform/system-managed";
/// Label carrying the UID of the owning PipelineRun
pub const LABEL_OWNER_UID: &str = "pipelines.platform/owner-pipelinerun-uid";
/// Annotation carrying the `namespace/name` key of the owning PipelineRun
pub const ANNOTATION_OWNER_KEY: &str = "pipelines.platform/owner-pipelinerun";
/// Annotation on the TaskRun pointing back to its PipelineRun
pub const ANNOTATION_PIPELINERUN_KEY: &str = "pipelines.platform/pipelinerun-key";

/// Identity of the PipelineRun the objects of a run environment belong to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOwner {
    /// `namespace/name` of the PipelineRun
    pub key: String,
    pub uid: String,
}

impl RunOwner {
    /// Labels carried by every object the controller creates
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_SYSTEM_MANAGED.to_string(), "true".to_string()),
            (LABEL_OWNER_UID.to_string(), self.uid.clone()),
        ])
    }

    pub fn annotations(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(ANNOTATION_OWNER_KEY.to_string(), self.key.clone())])
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Missing object key")]
    MissingObjectKey,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error(transparent)]
    Reconcile(#[from] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Reconciler dependencies, shared by all workers
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn PipelineRunStore>,
    pub run_manager: Arc<dyn RunManager>,
    pub config_source: Arc<dyn PipelineRunsConfigSource>,
    pub config: Arc<ControllerConfig>,
    /// Consecutive reconcile failures per PipelineRun key
    pub failures: Arc<DashMap<String, u32>>,
}

impl Context {
    pub fn new(
        store: Arc<dyn PipelineRunStore>,
        run_manager: Arc<dyn RunManager>,
        config_source: Arc<dyn PipelineRunsConfigSource>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            run_manager,
            config_source,
            config,
            failures: Arc::new(DashMap::new()),
        }
    }
}
