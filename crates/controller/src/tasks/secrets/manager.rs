//! Secret Manager

use super::{
    docker_secret_filter, RepositorySecretProvider, SecretCopyError, SecretHelper,
    SecretTransform, ANNOTATION_SECRET_RENAME_TO, JENKINS_ANNOTATION_PREFIX,
    TEKTON_ANNOTATION_PREFIX,
};
use crate::crds::RunResult;
use crate::errors;
use crate::tasks::pipelinerun::PipelineRunHandle;
use crate::tasks::repository::Repository;
use anyhow::{anyhow, Context as _};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[cfg(test)]
use mockall::automock;

/// Annotation the Tekton credential initializer matches git servers with
pub const ANNOTATION_TEKTON_GIT: &str = "tekton.dev/git-0";

/// Names of the secret copies created in the run namespace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopiedSecrets {
    pub clone_secret: Option<String>,
    pub image_pull_secrets: Vec<String>,
    pub secrets: Vec<String>,
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretManager: Send + Sync {
    /// Copies the image pull, clone and pipeline secrets of `run` into
    /// `namespace`. The copies made before a failure are reported along with
    /// it and are not rolled back.
    async fn copy_all(
        &self,
        run: &mut PipelineRunHandle,
        namespace: &str,
    ) -> (CopiedSecrets, anyhow::Result<()>);
}

pub struct KubeSecretManager {
    secrets: Arc<dyn Repository<Secret>>,
}

impl KubeSecretManager {
    pub fn new(secrets: Arc<dyn Repository<Secret>>) -> Self {
        Self { secrets }
    }
}

/// `scheme://host[:port]` of the pipeline repository
pub fn repository_server_url(repo_url: &str) -> anyhow::Result<String> {
    let url = Url::parse(repo_url)
        .with_context(|| format!("invalid pipeline repository URL {repo_url:?}"))?;
    let host = url
        .host_str()
        .ok_or_else(|| anyhow!("pipeline repository URL {repo_url:?} has no host"))?;
    Ok(match url.port() {
        Some(port) => format!("{}://{host}:{port}", url.scheme()),
        None => format!("{}://{host}", url.scheme()),
    })
}

fn copy_failure(
    run: &mut PipelineRunHandle,
    err: SecretCopyError,
    context: &'static str,
) -> anyhow::Error {
    let class = if err.is_content_error() {
        RunResult::ErrorContent
    } else {
        RunResult::ErrorInfra
    };
    warn!(pipelinerun = %run.key(), error = %err, "{}", context);
    run.update_message(format!("{context}: {err}"));
    errors::classify(err, class).context(context)
}

#[async_trait]
impl SecretManager for KubeSecretManager {
    async fn copy_all(
        &self,
        run: &mut PipelineRunHandle,
        namespace: &str,
    ) -> (CopiedSecrets, anyhow::Result<()>) {
        let spec = run.spec().clone();
        let provider = Arc::new(RepositorySecretProvider::new(
            self.secrets.clone(),
            run.namespace(),
        ));
        let helper = SecretHelper::new(provider, self.secrets.clone(), namespace, run.owner());
        let mut copied = CopiedSecrets::default();

        let (names, result) = helper
            .copy_secrets(
                &spec.image_pull_secrets,
                Some(docker_secret_filter),
                &[
                    SecretTransform::strip_annotations(TEKTON_ANNOTATION_PREFIX),
                    SecretTransform::strip_annotations(JENKINS_ANNOTATION_PREFIX),
                    SecretTransform::UniqueName,
                ],
            )
            .await;
        copied.image_pull_secrets = names;
        if let Err(e) = result {
            let err = copy_failure(run, e, "failed to copy image pull secrets");
            return (copied, Err(err));
        }

        if let Some(clone_secret) = spec.pipeline_clone_secret.filter(|name| !name.is_empty()) {
            let server = match repository_server_url(&spec.pipeline.repo_url) {
                Ok(server) => server,
                Err(e) => {
                    run.update_message(format!("{e:#}"));
                    run.update_result(RunResult::ErrorContent);
                    let err = errors::classify(e, RunResult::ErrorContent)
                        .context("failed to copy pipeline clone secret");
                    return (copied, Err(err));
                }
            };

            let (names, result) = helper
                .copy_secrets(
                    &[clone_secret],
                    None,
                    &[
                        SecretTransform::strip_annotations(TEKTON_ANNOTATION_PREFIX),
                        SecretTransform::UniqueName,
                        SecretTransform::set_annotation(ANNOTATION_TEKTON_GIT, server),
                    ],
                )
                .await;
            copied.clone_secret = names.into_iter().next();
            if let Err(e) = result {
                let err = copy_failure(run, e, "failed to copy pipeline clone secret");
                return (copied, Err(err));
            }
        }

        let (names, result) = helper
            .copy_secrets(
                &spec.secrets,
                None,
                &[
                    SecretTransform::strip_annotations(TEKTON_ANNOTATION_PREFIX),
                    SecretTransform::RenameByAnnotation(
                        ANNOTATION_SECRET_RENAME_TO.to_string(),
                    ),
                ],
            )
            .await;
        copied.secrets = names;
        if let Err(e) = result {
            let err = copy_failure(run, e, "failed to copy pipeline secrets");
            return (copied, Err(err));
        }

        info!(
            pipelinerun = %run.key(),
            namespace = %namespace,
            image_pull_secrets = copied.image_pull_secrets.len(),
            secrets = copied.secrets.len(),
            "Copied pipeline secrets"
        );
        (copied, Ok(()))
    }
}
