use crate::crds::{PipelineRun, TaskRun};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, Instrument};

pub mod config;
pub mod namespace;
pub mod pipelinerun;
pub mod repository;
pub mod retry;
pub mod run;
pub mod secrets;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use pipelinerun::{error_policy, reconcile_pipeline_run};
pub use types::{Context, Error, Result};

use config::ConfigMapSource;
use namespace::KubeNamespaceManager;
use pipelinerun::KubePipelineRunStore;
use repository::KubeRepository;
use run::{RunRepositories, TektonRunManager};
use secrets::KubeSecretManager;
use types::{ANNOTATION_PIPELINERUN_KEY, LABEL_SYSTEM_MANAGED};

/// Wires the Kubernetes backed implementations into a reconciler context
pub fn build_context(client: &Client, config: ControllerConfig) -> Context {
    let config = Arc::new(config);

    let namespaces = Arc::new(KubeNamespaceManager::new(
        Arc::new(KubeRepository::<Namespace>::cluster(client.clone())),
        config.run.namespace_prefix.clone(),
    ));
    let secrets = Arc::new(KubeSecretManager::new(Arc::new(
        KubeRepository::<Secret>::namespaced(client.clone()),
    )));
    let run_manager = Arc::new(TektonRunManager::new(
        RunRepositories::from_client(client),
        namespaces,
        secrets,
        config.run.clone(),
        config.features.create_aux_namespace,
    ));
    let config_source = Arc::new(ConfigMapSource::new(
        Arc::new(KubeRepository::<ConfigMap>::namespaced(client.clone())),
        &config,
    ));

    Context::new(
        Arc::new(KubePipelineRunStore::new(client.clone())),
        run_manager,
        config_source,
        config,
    )
}

/// The PipelineRun a TaskRun event belongs to
fn pipeline_run_of(task_run: TaskRun) -> Option<ObjectRef<PipelineRun>> {
    let key = task_run.annotations().get(ANNOTATION_PIPELINERUN_KEY)?;
    let (namespace, name) = key.split_once('/')?;
    if namespace.is_empty() || name.is_empty() {
        return None;
    }
    Some(ObjectRef::new(name).within(namespace))
}

/// Main entry point of the PipelineRun controller
#[instrument(skip(client, config), fields(namespace = ?config.watch_namespace))]
pub async fn run_task_controller(client: Client, config: ControllerConfig) -> Result<()> {
    config
        .validate()
        .map_err(|e| Error::ConfigError(e.to_string()))?;

    let pipeline_runs: Api<PipelineRun> = match &config.watch_namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };
    // run namespaces are generated, so TaskRuns are watched cluster wide
    let task_runs: Api<TaskRun> = Api::all(client.clone());
    let workers = config.workers;

    info!(
        workers,
        system_namespace = %config.system_namespace,
        aux_namespace = config.features.create_aux_namespace,
        "Starting PipelineRun controller"
    );
    let context = Arc::new(build_context(&client, config));
    debug!("Controller context created successfully");

    let task_run_watch =
        watcher::Config::default().labels(&format!("{LABEL_SYSTEM_MANAGED}=true"));

    Controller::new(pipeline_runs, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(workers))
        .watches(task_runs, task_run_watch, pipeline_run_of)
        .shutdown_on_signal()
        .run(reconcile_pipeline_run, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("pipelinerun_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((pipeline_run, _)) => {
                        debug!(resource = %pipeline_run, "PipelineRun reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        error!(error = %reconciliation_err, "PipelineRun reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("PipelineRun controller shutting down");
    Ok(())
}
