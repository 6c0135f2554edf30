//! Secret copying between namespaces
//!
//! [`SecretHelper::copy_secrets`] is the primitive the [`manager`] builds its
//! three copy passes on: fetch each named secret from a [`SecretProvider`],
//! drop it if the filter rejects it, run the transforms over a clean copy and
//! create the result in the target namespace.

pub mod manager;

pub use manager::{CopiedSecrets, KubeSecretManager, SecretManager};

#[cfg(test)]
pub use manager::MockSecretManager;

use super::repository::Repository;
use super::types::RunOwner;
use crate::errors::k8s;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Annotation prefix of the Tekton credential matching
pub const TEKTON_ANNOTATION_PREFIX: &str = "tekton.dev/";
/// Annotation prefix left behind by Jenkins credential plugins
pub const JENKINS_ANNOTATION_PREFIX: &str = "jenkins.io/";
/// Annotation naming the target name of a copied pipeline secret
pub const ANNOTATION_SECRET_RENAME_TO: &str = "pipelines.platform/secret-rename-to";

pub const SECRET_TYPE_DOCKER_CONFIG_JSON: &str = "kubernetes.io/dockerconfigjson";
pub const SECRET_TYPE_DOCKER_CFG: &str = "kubernetes.io/dockercfg";

#[derive(Debug, thiserror::Error)]
pub enum SecretCopyError {
    #[error("secret {name:?} not found")]
    NotFound { name: String },

    #[error("failed to copy secret {name:?}: {source}")]
    Kube {
        name: String,
        #[source]
        source: kube::Error,
    },
}

impl SecretCopyError {
    /// Whether the failure is caused by the pipeline run's own input
    pub fn is_content_error(&self) -> bool {
        match self {
            SecretCopyError::NotFound { .. } => true,
            SecretCopyError::Kube { source, .. } => {
                k8s::is_not_found(source)
                    || k8s::is_invalid(source)
                    || k8s::is_already_exists(source)
            }
        }
    }
}

/// Source of secrets to copy
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SecretProvider: Send + Sync {
    /// Returns `None` when the secret does not exist
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, kube::Error>;
}

/// Reads secrets from one namespace through a repository
pub struct RepositorySecretProvider {
    secrets: Arc<dyn Repository<Secret>>,
    namespace: String,
}

impl RepositorySecretProvider {
    pub fn new(secrets: Arc<dyn Repository<Secret>>, namespace: impl Into<String>) -> Self {
        Self {
            secrets,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl SecretProvider for RepositorySecretProvider {
    async fn get_secret(&self, name: &str) -> Result<Option<Secret>, kube::Error> {
        match self.secrets.get(&self.namespace, name).await {
            Ok(secret) => Ok(Some(secret)),
            Err(e) if k8s::is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

pub type SecretFilter = fn(&Secret) -> bool;

/// Accepts Docker registry credentials only
pub fn docker_secret_filter(secret: &Secret) -> bool {
    matches!(
        secret.type_.as_deref(),
        Some(SECRET_TYPE_DOCKER_CONFIG_JSON | SECRET_TYPE_DOCKER_CFG)
    )
}

/// Modification applied to a secret before it is created in the target namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretTransform {
    /// Removes all annotations whose key starts with the prefix
    StripAnnotations(String),
    /// Lets the API server pick a unique name derived from the original
    UniqueName,
    SetAnnotation(String, String),
    /// Renames the secret to the value of the given annotation, if set
    RenameByAnnotation(String),
}

impl SecretTransform {
    pub fn strip_annotations(prefix: &str) -> Self {
        SecretTransform::StripAnnotations(prefix.to_string())
    }

    pub fn set_annotation(key: &str, value: impl Into<String>) -> Self {
        SecretTransform::SetAnnotation(key.to_string(), value.into())
    }

    fn apply(&self, secret: &mut Secret) {
        let meta = &mut secret.metadata;
        match self {
            SecretTransform::StripAnnotations(prefix) => {
                if let Some(annotations) = meta.annotations.as_mut() {
                    annotations.retain(|key, _| !key.starts_with(prefix.as_str()));
                }
            }
            SecretTransform::UniqueName => {
                if let Some(name) = meta.name.take() {
                    meta.generate_name = Some(format!("{name}-"));
                }
            }
            SecretTransform::SetAnnotation(key, value) => {
                meta.annotations
                    .get_or_insert_with(Default::default)
                    .insert(key.clone(), value.clone());
            }
            SecretTransform::RenameByAnnotation(key) => {
                let target = meta
                    .annotations
                    .as_ref()
                    .and_then(|annotations| annotations.get(key))
                    .map(|value| value.trim().to_string())
                    .filter(|value| !value.is_empty());
                if let Some(target) = target {
                    meta.name = Some(target);
                    meta.generate_name = None;
                }
            }
        }
    }
}

/// A copy of `source` carrying only the content, the user metadata and the
/// ownership of `owner`
fn clean_copy(source: &Secret, namespace: &str, owner: &RunOwner) -> Secret {
    let mut labels = source.metadata.labels.clone().unwrap_or_default();
    labels.extend(owner.labels());
    let mut annotations = source.metadata.annotations.clone().unwrap_or_default();
    annotations.extend(owner.annotations());

    Secret {
        metadata: ObjectMeta {
            name: source.metadata.name.clone(),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        type_: source.type_.clone(),
        data: source.data.clone(),
        string_data: source.string_data.clone(),
        immutable: source.immutable,
    }
}

/// Copies secrets from a provider into one target namespace
pub struct SecretHelper {
    provider: Arc<dyn SecretProvider>,
    target: Arc<dyn Repository<Secret>>,
    namespace: String,
    owner: RunOwner,
}

impl SecretHelper {
    pub fn new(
        provider: Arc<dyn SecretProvider>,
        target: Arc<dyn Repository<Secret>>,
        namespace: impl Into<String>,
        owner: RunOwner,
    ) -> Self {
        Self {
            provider,
            target,
            namespace: namespace.into(),
            owner,
        }
    }

    /// Copies the named secrets in order and returns the names of the created
    /// copies. Stops at the first failure; the copies created before it stay
    /// in place and their names are returned alongside the error.
    pub async fn copy_secrets(
        &self,
        names: &[String],
        filter: Option<SecretFilter>,
        transforms: &[SecretTransform],
    ) -> (Vec<String>, Result<(), SecretCopyError>) {
        let mut copied = Vec::with_capacity(names.len());
        for name in names {
            match self.copy_one(name, filter, transforms).await {
                Ok(Some(created)) => copied.push(created),
                Ok(None) => debug!(secret = %name, "Secret skipped by filter"),
                Err(e) => return (copied, Err(e)),
            }
        }
        (copied, Ok(()))
    }

    async fn copy_one(
        &self,
        name: &str,
        filter: Option<SecretFilter>,
        transforms: &[SecretTransform],
    ) -> Result<Option<String>, SecretCopyError> {
        let source = self
            .provider
            .get_secret(name)
            .await
            .map_err(|source| SecretCopyError::Kube {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| SecretCopyError::NotFound {
                name: name.to_string(),
            })?;

        if filter.is_some_and(|accept| !accept(&source)) {
            return Ok(None);
        }

        let mut copy = clean_copy(&source, &self.namespace, &self.owner);
        for transform in transforms {
            transform.apply(&mut copy);
        }

        let created = self
            .target
            .create(&self.namespace, &copy)
            .await
            .map_err(|source| SecretCopyError::Kube {
                name: name.to_string(),
                source,
            })?;
        let created_name = created.metadata.name.unwrap_or_default();
        debug!(
            secret = %name,
            copy = %created_name,
            namespace = %self.namespace,
            "Copied secret"
        );
        Ok(Some(created_name))
    }
}
