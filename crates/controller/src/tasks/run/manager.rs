//! Run Manager
//!
//! Provisions the isolated environment of a pipeline run and drives the
//! Tekton `TaskRun` executing it. Environment preparation is safe to repeat:
//! namespaces left behind by an earlier attempt are deleted first and an
//! existing service account is attached to rather than treated as an error.

use super::manifests::{self, DENY_ALL_NETWORK_POLICY};
use super::status::{Run, TektonRun};
use crate::crds::taskrun::{Param, PodTemplate, TaskRef};
use crate::crds::{Intent, RunResult, TaskRun, TaskRunSpec};
use crate::errors::{self, k8s, ClassifyExt};
use crate::tasks::config::{format_duration, parse_duration, PipelineRunsConfig, RunSettings};
use crate::tasks::namespace::{random_seed, NamespaceManager};
use crate::tasks::pipelinerun::PipelineRunHandle;
use crate::tasks::repository::{KubeRepository, Repository};
use crate::tasks::secrets::{CopiedSecrets, SecretManager};
use crate::tasks::types::{RunOwner, ANNOTATION_PIPELINERUN_KEY};
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    LimitRange, LocalObjectReference, ObjectReference, PodSecurityContext, ResourceQuota,
    ServiceAccount,
};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

/// Fixed name of the TaskRun in the run namespace
pub const TASK_RUN_NAME: &str = "pipeline-run";

const NAMESPACE_PURPOSE_MAIN: &str = "main";
const NAMESPACE_PURPOSE_AUX: &str = "aux";
const DEFAULT_IMAGE_PULL_POLICY: &str = "IfNotPresent";
const MAX_ATTACH_RETRIES: usize = 5;

pub const PARAM_RUN_NAMESPACE: &str = "RUN_NAMESPACE";
pub const PARAM_PIPELINE_GIT_URL: &str = "PIPELINE_GIT_URL";
pub const PARAM_PIPELINE_GIT_REVISION: &str = "PIPELINE_GIT_REVISION";
pub const PARAM_PIPELINE_FILE: &str = "PIPELINE_FILE";
pub const PARAM_PIPELINE_PARAMS_JSON: &str = "PIPELINE_PARAMS_JSON";
pub const PARAM_RUNNER_IMAGE: &str = "RUNNER_IMAGE";
pub const PARAM_RUNNER_IMAGE_PULL_POLICY: &str = "RUNNER_IMAGE_PULL_POLICY";
pub const PARAM_ES_RUN_ID_JSON: &str = "PIPELINE_LOG_ELASTICSEARCH_RUN_ID_JSON";
pub const PARAM_ES_INDEX_URL: &str = "PIPELINE_LOG_ELASTICSEARCH_INDEX_URL";
pub const PARAM_JOB_NAME: &str = "JOB_NAME";
pub const PARAM_RUN_NUMBER: &str = "RUN_NUMBER";
pub const PARAM_RUN_CAUSE: &str = "RUN_CAUSE";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait RunManager: Send + Sync {
    /// Prepares the run namespace(s) and returns `(namespace, aux_namespace)`
    async fn create_env(
        &self,
        run: &mut PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> anyhow::Result<(String, Option<String>)>;

    /// Submits the TaskRun into the prepared run namespace
    async fn create_run(
        &self,
        run: &mut PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> anyhow::Result<()>;

    /// The current run, `None` if there is none
    async fn get_run(&self, run: &PipelineRunHandle) -> anyhow::Result<Option<Box<dyn Run>>>;

    async fn delete_run(&self, run: &PipelineRunHandle) -> anyhow::Result<()>;

    /// Deletes the run namespace and the auxiliary namespace
    async fn delete_env(&self, run: &PipelineRunHandle) -> anyhow::Result<()>;
}

/// Object access needed to provision a run environment
pub struct RunRepositories {
    pub service_accounts: Arc<dyn Repository<ServiceAccount>>,
    pub role_bindings: Arc<dyn Repository<RoleBinding>>,
    pub network_policies: Arc<dyn Repository<NetworkPolicy>>,
    pub resource_quotas: Arc<dyn Repository<ResourceQuota>>,
    pub limit_ranges: Arc<dyn Repository<LimitRange>>,
    pub task_runs: Arc<dyn Repository<TaskRun>>,
}

impl RunRepositories {
    pub fn from_client(client: &Client) -> Self {
        Self {
            service_accounts: Arc::new(KubeRepository::<ServiceAccount>::namespaced(
                client.clone(),
            )),
            role_bindings: Arc::new(KubeRepository::<RoleBinding>::namespaced(client.clone())),
            network_policies: Arc::new(KubeRepository::<NetworkPolicy>::namespaced(
                client.clone(),
            )),
            resource_quotas: Arc::new(KubeRepository::<ResourceQuota>::namespaced(
                client.clone(),
            )),
            limit_ranges: Arc::new(KubeRepository::<LimitRange>::namespaced(client.clone())),
            task_runs: Arc::new(KubeRepository::<TaskRun>::namespaced(client.clone())),
        }
    }
}

/// State of one `create_env` call
struct RunContext<'a> {
    run: &'a mut PipelineRunHandle,
    config: &'a PipelineRunsConfig,
    owner: RunOwner,
    namespace: String,
    network_manifest: Option<String>,
    secrets: CopiedSecrets,
}

pub struct TektonRunManager {
    repos: RunRepositories,
    namespaces: Arc<dyn NamespaceManager>,
    secrets: Arc<dyn SecretManager>,
    settings: RunSettings,
    create_aux_namespace: bool,
}

/// Wraps retryable API failures as recoverable
fn recoverable_if_transient(err: kube::Error) -> anyhow::Error {
    let transient = k8s::is_transient(&err);
    errors::recoverable_if(err, transient)
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

impl TektonRunManager {
    pub fn new(
        repos: RunRepositories,
        namespaces: Arc<dyn NamespaceManager>,
        secrets: Arc<dyn SecretManager>,
        settings: RunSettings,
        create_aux_namespace: bool,
    ) -> Self {
        Self {
            repos,
            namespaces,
            secrets,
            settings,
            create_aux_namespace,
        }
    }

    /// Picks the network profile manifest; the pipeline's choice beats the default
    fn network_manifest(
        run: &PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> anyhow::Result<Option<String>> {
        let requested = run
            .spec()
            .profiles
            .as_ref()
            .and_then(|profiles| profiles.network.as_deref())
            .and_then(non_empty);
        let Some(name) = requested.or(config.default_network_profile.as_deref()) else {
            return Ok(None);
        };
        match config.network_profiles.get(name) {
            Some(manifest) => Ok(Some(manifest.clone())),
            None => Err(errors::classify(
                anyhow!("network profile {name:?} is not configured"),
                RunResult::ErrorConfig,
            )),
        }
    }

    async fn cleanup_previous(&self, run: &PipelineRunHandle) -> anyhow::Result<()> {
        let status = run.status();
        let previous: Vec<String> = [
            status.namespace.clone(),
            status.auxiliary_namespace.clone(),
        ]
        .into_iter()
        .flatten()
        .filter(|ns| !ns.is_empty())
        .collect();
        for namespace in previous {
            info!(
                pipelinerun = %run.key(),
                namespace = %namespace,
                "Deleting namespace of previous attempt"
            );
            self.namespaces
                .delete(&namespace)
                .await
                .context("failed to clean up namespace of previous attempt")?;
        }
        Ok(())
    }

    async fn delete_namespaces(&self, names: &[&str]) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.namespaces.delete(name).await {
                failures.push(format!("{e:#}"));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(failures.join("; ")))
        }
    }

    async fn provision(&self, ctx: &mut RunContext<'_>) -> anyhow::Result<()> {
        let (copied, result) = self.secrets.copy_all(&mut *ctx.run, &ctx.namespace).await;
        ctx.secrets = copied;
        result?;

        self.ensure_service_account(ctx).await?;
        self.bind_cluster_role(ctx).await?;
        self.apply_network_policies(ctx).await?;

        if let Some(manifest) = ctx.config.resource_quota.as_deref() {
            self.apply_manifest(
                self.repos.resource_quotas.as_ref(),
                ctx,
                manifest,
                "resource-quota-",
            )
            .await
            .context("failed to apply resource quota")?;
        }
        if let Some(manifest) = ctx.config.limit_range.as_deref() {
            let limit_ranges = self.repos.limit_ranges.as_ref();
            self.apply_manifest(limit_ranges, ctx, manifest, "limit-range-")
                .await
                .context("failed to apply limit range")?;
        }
        Ok(())
    }

    fn attach_secrets(account: &mut ServiceAccount, secrets: &CopiedSecrets) {
        if let Some(clone_secret) = &secrets.clone_secret {
            let refs = account.secrets.get_or_insert_with(Vec::new);
            if !refs
                .iter()
                .any(|r| r.name.as_deref() == Some(clone_secret.as_str()))
            {
                refs.push(ObjectReference {
                    name: Some(clone_secret.clone()),
                    ..Default::default()
                });
            }
        }
        if !secrets.image_pull_secrets.is_empty() {
            let refs = account.image_pull_secrets.get_or_insert_with(Vec::new);
            for name in &secrets.image_pull_secrets {
                if !refs.iter().any(|r| &r.name == name) {
                    refs.push(LocalObjectReference { name: name.clone() });
                }
            }
        }
    }

    async fn ensure_service_account(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let name = &self.settings.service_account;
        let mut account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(ctx.namespace.clone()),
                labels: Some(ctx.owner.labels()),
                annotations: Some(ctx.owner.annotations()),
                ..Default::default()
            },
            ..Default::default()
        };
        Self::attach_secrets(&mut account, &ctx.secrets);

        let accounts = self.repos.service_accounts.as_ref();
        match accounts.create(&ctx.namespace, &account).await {
            Ok(_) => return Ok(()),
            Err(e) if k8s::is_already_exists(&e) => {
                debug!(namespace = %ctx.namespace, "Service account exists, attaching secrets");
            }
            Err(e) => return Err(e).context("failed to create service account"),
        }

        let mut attempt = 0;
        loop {
            let mut existing = accounts
                .get(&ctx.namespace, name)
                .await
                .context("failed to get service account")?;
            Self::attach_secrets(&mut existing, &ctx.secrets);
            match accounts.update(&ctx.namespace, &existing).await {
                Ok(_) => return Ok(()),
                Err(e) if k8s::is_conflict(&e) && attempt < MAX_ATTACH_RETRIES => {
                    attempt += 1;
                    debug!(
                        namespace = %ctx.namespace,
                        attempt,
                        "Service account update conflict, retrying"
                    );
                }
                Err(e) => return Err(e).context("failed to update service account"),
            }
        }
    }

    async fn bind_cluster_role(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let namespace = ctx.namespace.as_str();
        let binding = RoleBinding {
            metadata: ObjectMeta {
                name: Some(self.settings.cluster_role.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(ctx.owner.labels()),
                annotations: Some(ctx.owner.annotations()),
                ..Default::default()
            },
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "ClusterRole".to_string(),
                name: self.settings.cluster_role.clone(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: self.settings.service_account.clone(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        };
        match self.repos.role_bindings.create(namespace, &binding).await {
            Ok(_) => Ok(()),
            Err(e) if k8s::is_already_exists(&e) => Ok(()),
            Err(e) => Err(e).context("failed to bind cluster role"),
        }
    }

    async fn apply_network_policies(&self, ctx: &RunContext<'_>) -> anyhow::Result<()> {
        let policies = self.repos.network_policies.as_ref();
        self.apply_manifest(policies, ctx, DENY_ALL_NETWORK_POLICY, "deny-all-")
            .await
            .context("failed to apply deny-all network policy")?;
        if let Some(manifest) = ctx.network_manifest.as_deref() {
            self.apply_manifest(policies, ctx, manifest, "network-policy-")
                .await
                .context("failed to apply network policy")?;
        }
        Ok(())
    }

    async fn apply_manifest<K>(
        &self,
        repo: &dyn Repository<K>,
        ctx: &RunContext<'_>,
        manifest: &str,
        generate_name: &str,
    ) -> anyhow::Result<()>
    where
        K: Resource<DynamicType = ()> + DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let object: K = manifests::decode(manifest, &ctx.namespace, generate_name, &ctx.owner)
            .classify(RunResult::ErrorConfig)?;
        repo.create(&ctx.namespace, &object).await?;
        Ok(())
    }

    fn run_namespace(run: &PipelineRunHandle) -> anyhow::Result<String> {
        run.status()
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .ok_or_else(|| anyhow!("pipeline run {} has no run namespace", run.key()))
    }

    fn timeout(run: &PipelineRunHandle, config: &PipelineRunsConfig) -> anyhow::Result<String> {
        match run.spec().timeout.as_deref().and_then(non_empty) {
            Some(raw) => parse_duration(raw)
                .map(format_duration)
                .map_err(|reason| anyhow!("invalid timeout {raw:?}: {reason}"))
                .classify(RunResult::ErrorContent),
            None => Ok(format_duration(config.timeout)),
        }
    }

    fn image_params(run: &PipelineRunHandle, config: &PipelineRunsConfig) -> Vec<Param> {
        let runner = run.spec().runner.as_ref();
        let override_image = runner
            .and_then(|runner| runner.image.as_deref())
            .and_then(non_empty);

        let (image, policy) = match override_image {
            Some(image) => (
                Some(image.to_string()),
                Some(
                    runner
                        .and_then(|runner| runner.image_pull_policy.as_deref())
                        .and_then(non_empty)
                        .unwrap_or(DEFAULT_IMAGE_PULL_POLICY)
                        .to_string(),
                ),
            ),
            None => (
                config.runner_image.clone(),
                config.runner_image_pull_policy.clone(),
            ),
        };

        let mut params = Vec::new();
        if let Some(image) = image {
            params.push(Param::new(PARAM_RUNNER_IMAGE, image));
        }
        if let Some(policy) = policy {
            params.push(Param::new(PARAM_RUNNER_IMAGE_PULL_POLICY, policy));
        }
        params
    }

    fn logging_params(run: &PipelineRunHandle) -> anyhow::Result<Vec<Param>> {
        let Some(es) = run
            .spec()
            .logging
            .as_ref()
            .and_then(|logging| logging.elasticsearch.as_ref())
        else {
            // an explicit empty URL switches off the task's default index
            return Ok(vec![Param::new(PARAM_ES_INDEX_URL, "")]);
        };

        let run_id = serde_json::to_string(&es.run_id)
            .context("failed to encode elasticsearch run ID")
            .classify(RunResult::ErrorContent)?;
        let mut params = vec![Param::new(PARAM_ES_RUN_ID_JSON, run_id)];

        if let Some(index_url) = es.index_url.as_deref().and_then(non_empty) {
            let url = Url::parse(index_url)
                .with_context(|| format!("invalid elasticsearch index URL {index_url:?}"))
                .classify(RunResult::ErrorConfig)?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(errors::classify(
                    anyhow!(
                        "elasticsearch index URL {index_url:?} has unsupported scheme {:?}",
                        url.scheme()
                    ),
                    RunResult::ErrorConfig,
                ));
            }
            params.push(Param::new(PARAM_ES_INDEX_URL, index_url));
        }
        Ok(params)
    }

    fn run_detail_params(run: &PipelineRunHandle) -> Vec<Param> {
        let Some(details) = run.spec().run_details.as_ref() else {
            return Vec::new();
        };
        let mut params = Vec::new();
        if let Some(job_name) = non_empty(&details.job_name) {
            params.push(Param::new(PARAM_JOB_NAME, job_name));
        }
        if details.sequence_number != 0 {
            params.push(Param::new(
                PARAM_RUN_NUMBER,
                details.sequence_number.to_string(),
            ));
        }
        if let Some(cause) = non_empty(&details.cause) {
            params.push(Param::new(PARAM_RUN_CAUSE, cause));
        }
        params
    }

    async fn image_pull_secrets(
        &self,
        namespace: &str,
    ) -> anyhow::Result<Vec<LocalObjectReference>> {
        match self
            .repos
            .service_accounts
            .get(namespace, &self.settings.service_account)
            .await
        {
            Ok(account) => Ok(account.image_pull_secrets.unwrap_or_default()),
            Err(e) if k8s::is_not_found(&e) => Ok(Vec::new()),
            Err(e) => Err(recoverable_if_transient(e)).context("failed to get service account"),
        }
    }

    pub(crate) fn build_task_run(
        &self,
        run: &PipelineRunHandle,
        config: &PipelineRunsConfig,
        namespace: &str,
        image_pull_secrets: Vec<LocalObjectReference>,
    ) -> anyhow::Result<TaskRun> {
        let spec = run.spec();
        let pipeline_args = serde_json::to_string(&spec.pipeline.args)
            .context("failed to encode pipeline arguments")
            .classify(RunResult::ErrorContent)?;

        let mut params = vec![
            Param::new(PARAM_RUN_NAMESPACE, namespace),
            Param::new(PARAM_PIPELINE_GIT_URL, spec.pipeline.repo_url.clone()),
            Param::new(PARAM_PIPELINE_GIT_REVISION, spec.pipeline.revision.clone()),
            Param::new(PARAM_PIPELINE_FILE, spec.pipeline.relative_path.clone()),
            Param::new(PARAM_PIPELINE_PARAMS_JSON, pipeline_args),
        ];
        params.extend(Self::image_params(run, config));
        params.extend(Self::logging_params(run)?);
        params.extend(Self::run_detail_params(run));

        let security = &config.pod_security_context;
        let pod_template = PodTemplate {
            security_context: Some(PodSecurityContext {
                run_as_user: security.run_as_user,
                run_as_group: security.run_as_group,
                fs_group: security.fs_group,
                ..Default::default()
            }),
            image_pull_secrets: (!image_pull_secrets.is_empty()).then_some(image_pull_secrets),
        };

        let mut task_run = TaskRun::new(
            TASK_RUN_NAME,
            TaskRunSpec {
                service_account_name: Some(self.settings.service_account.clone()),
                task_ref: Some(TaskRef {
                    resolver: Some("cluster".to_string()),
                    params: vec![
                        Param::new("kind", "task"),
                        Param::new("name", self.settings.task_name.clone()),
                        Param::new("namespace", self.settings.task_namespace.clone()),
                    ],
                    ..Default::default()
                }),
                params,
                timeout: Some(Self::timeout(run, config)?),
                pod_template: Some(pod_template),
            },
        );
        let owner = run.owner();
        let mut annotations = owner.annotations();
        annotations.insert(ANNOTATION_PIPELINERUN_KEY.to_string(), run.key());

        task_run.metadata.namespace = Some(namespace.to_string());
        task_run.metadata.labels = Some(owner.labels());
        task_run.metadata.annotations = Some(annotations);
        Ok(task_run)
    }
}

#[async_trait]
impl RunManager for TektonRunManager {
    #[instrument(skip_all, fields(pipelinerun = %run.key()))]
    async fn create_env(
        &self,
        run: &mut PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> anyhow::Result<(String, Option<String>)> {
        self.cleanup_previous(run).await?;
        let network_manifest = Self::network_manifest(run, config)?;

        let owner = run.owner();
        let seed = random_seed();

        let namespace = self
            .namespaces
            .create(&owner, NAMESPACE_PURPOSE_MAIN, &seed)
            .await
            .context("failed to create run namespace")?;
        run.update_run_namespace(Some(namespace.clone()));

        let aux_namespace = if self.create_aux_namespace {
            match self.namespaces.create(&owner, NAMESPACE_PURPOSE_AUX, &seed).await {
                Ok(aux) => {
                    run.update_aux_namespace(Some(aux.clone()));
                    Some(aux)
                }
                Err(e) => {
                    if let Err(cleanup) = self.delete_namespaces(&[&namespace]).await {
                        warn!(error = %cleanup, "Failed to clean up run namespace");
                    }
                    return Err(e).context("failed to create auxiliary namespace");
                }
            }
        } else {
            None
        };

        let mut ctx = RunContext {
            run,
            config,
            owner,
            namespace: namespace.clone(),
            network_manifest,
            secrets: CopiedSecrets::default(),
        };

        if let Err(e) = self.provision(&mut ctx).await {
            let mut created = vec![namespace.as_str()];
            if let Some(aux) = aux_namespace.as_deref() {
                created.push(aux);
            }
            if let Err(cleanup) = self.delete_namespaces(&created).await {
                warn!(error = %cleanup, "Failed to clean up namespaces after failed preparation");
            }
            return Err(e);
        }

        info!(
            namespace = %namespace,
            aux_namespace = ?aux_namespace,
            "Run environment prepared"
        );
        Ok((namespace, aux_namespace))
    }

    #[instrument(skip_all, fields(pipelinerun = %run.key()))]
    async fn create_run(
        &self,
        run: &mut PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> anyhow::Result<()> {
        if run.spec().intent == Some(Intent::Abort) {
            debug!("Abort requested, not creating TaskRun");
            return Ok(());
        }
        let namespace = Self::run_namespace(run).classify(RunResult::ErrorInfra)?;
        let image_pull_secrets = self.image_pull_secrets(&namespace).await?;
        let task_run = self.build_task_run(run, config, &namespace, image_pull_secrets)?;

        self.repos
            .task_runs
            .create(&namespace, &task_run)
            .await
            .map_err(recoverable_if_transient)
            .context("failed to create TaskRun")?;
        info!(namespace = %namespace, "Created TaskRun");
        Ok(())
    }

    async fn get_run(&self, run: &PipelineRunHandle) -> anyhow::Result<Option<Box<dyn Run>>> {
        let Ok(namespace) = Self::run_namespace(run) else {
            return Ok(None);
        };
        match self.repos.task_runs.get(&namespace, TASK_RUN_NAME).await {
            Ok(task_run) => Ok(Some(Box::new(TektonRun::new(task_run)))),
            Err(e) if k8s::is_not_found(&e) => Ok(None),
            Err(e) => Err(recoverable_if_transient(e)).context("failed to get TaskRun"),
        }
    }

    async fn delete_run(&self, run: &PipelineRunHandle) -> anyhow::Result<()> {
        let Ok(namespace) = Self::run_namespace(run) else {
            return Ok(());
        };
        match self.repos.task_runs.delete(&namespace, TASK_RUN_NAME).await {
            Ok(()) => Ok(()),
            Err(e) if k8s::is_not_found(&e) => Ok(()),
            Err(e) => Err(recoverable_if_transient(e)).context("failed to delete TaskRun"),
        }
    }

    async fn delete_env(&self, run: &PipelineRunHandle) -> anyhow::Result<()> {
        let status = run.status();
        let names: Vec<&str> = [
            status.namespace.as_deref(),
            status.auxiliary_namespace.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|ns| !ns.is_empty())
        .collect();
        self.delete_namespaces(&names)
            .await
            .context("failed to delete run environment")
    }
}
