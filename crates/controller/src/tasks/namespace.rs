//! Run namespace lifecycle

use super::repository::Repository;
use super::retry::{retry_with_backoff, RetryConfig};
use super::types::RunOwner;
use crate::errors::k8s;
use anyhow::Context as _;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

/// Length of the random fragment shared by the namespaces of one run
pub const RANDOM_SEED_LENGTH: usize = 16;

const MAX_NAMESPACE_NAME_LENGTH: usize = 63;

#[cfg_attr(test, automock)]
#[async_trait]
pub trait NamespaceManager: Send + Sync {
    /// Creates `<prefix>-<seed>-<purpose>` and returns its name
    async fn create(&self, owner: &RunOwner, purpose: &str, seed: &str) -> anyhow::Result<String>;

    /// Deletes the namespace; a namespace that is already gone is not an error
    async fn delete(&self, name: &str) -> anyhow::Result<()>;
}

/// Random lowercase alphanumeric fragment for namespace names
pub fn random_seed() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RANDOM_SEED_LENGTH)
        .map(|byte| char::from(byte).to_ascii_lowercase())
        .collect()
}

fn is_retryable(err: &kube::Error) -> bool {
    k8s::is_conflict(err)
        || k8s::is_timeout(err)
        || k8s::is_server_timeout(err)
        || k8s::is_service_unavailable(err)
        || k8s::is_too_many_requests(err)
        || k8s::is_internal_error(err)
}

fn is_gone(err: &kube::Error) -> bool {
    k8s::is_not_found(err) || k8s::is_gone(err) || k8s::is_resource_expired(err)
}

pub struct KubeNamespaceManager {
    namespaces: Arc<dyn Repository<Namespace>>,
    prefix: String,
    retry: RetryConfig,
}

impl KubeNamespaceManager {
    pub fn new(namespaces: Arc<dyn Repository<Namespace>>, prefix: impl Into<String>) -> Self {
        Self {
            namespaces,
            prefix: prefix.into(),
            retry: RetryConfig::default(),
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    fn namespace_name(&self, purpose: &str, seed: &str) -> anyhow::Result<String> {
        let name = format!("{}-{}-{}", self.prefix, seed, purpose);
        if name.len() > MAX_NAMESPACE_NAME_LENGTH {
            anyhow::bail!(
                "namespace name {name:?} exceeds {MAX_NAMESPACE_NAME_LENGTH} characters"
            );
        }
        Ok(name)
    }
}

#[async_trait]
impl NamespaceManager for KubeNamespaceManager {
    async fn create(&self, owner: &RunOwner, purpose: &str, seed: &str) -> anyhow::Result<String> {
        let name = self.namespace_name(purpose, seed)?;

        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                labels: Some(owner.labels()),
                annotations: Some(owner.annotations()),
                ..Default::default()
            },
            ..Default::default()
        };

        retry_with_backoff(
            &self.retry,
            &format!("creating namespace {name}"),
            is_retryable,
            || self.namespaces.create("", &namespace),
        )
        .await
        .with_context(|| format!("failed to create namespace {name}"))?;

        info!(namespace = %name, owner = %owner.key, "Created run namespace");
        Ok(name)
    }

    async fn delete(&self, name: &str) -> anyhow::Result<()> {
        let result = retry_with_backoff(
            &self.retry,
            &format!("deleting namespace {name}"),
            is_retryable,
            || self.namespaces.delete("", name),
        )
        .await;

        match result {
            Ok(()) => {
                info!(namespace = %name, "Deleted run namespace");
                Ok(())
            }
            Err(e) if is_gone(&e) => {
                debug!(namespace = %name, "Namespace already gone");
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to delete namespace {name}")),
        }
    }
}
