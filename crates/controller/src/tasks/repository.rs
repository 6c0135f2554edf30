//! Narrow per-kind access to cluster objects
//!
//! The managers only ever need get/list/create/update/delete on a handful of
//! kinds. [`Repository`] is that surface; [`KubeRepository`] backs it with a
//! `kube::Api` and the in-memory implementation in `testing` backs it in
//! tests. Cluster scoped kinds ignore the namespace argument.

use async_trait::async_trait;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;

#[async_trait]
pub trait Repository<K>: Send + Sync
where
    K: Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, kube::Error>;

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, kube::Error>;

    async fn create(&self, namespace: &str, object: &K) -> Result<K, kube::Error>;

    /// Replaces the object; fails with a conflict when its resourceVersion is stale
    async fn update(&self, namespace: &str, object: &K) -> Result<K, kube::Error>;

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error>;
}

/// `Repository` backed by the Kubernetes API
pub struct KubeRepository<K> {
    client: Client,
    api: fn(Client, &str) -> Api<K>,
}

impl<K> KubeRepository<K>
where
    K: Resource<DynamicType = (), Scope = NamespaceResourceScope>,
{
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api: |client, namespace| Api::namespaced(client, namespace),
        }
    }
}

impl<K> KubeRepository<K>
where
    K: Resource<DynamicType = (), Scope = ClusterResourceScope>,
{
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api: |client, _| Api::all(client),
        }
    }
}

impl<K> KubeRepository<K> {
    fn api(&self, namespace: &str) -> Api<K> {
        (self.api)(self.client.clone(), namespace)
    }
}

#[async_trait]
impl<K> Repository<K> for KubeRepository<K>
where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + DeserializeOwned
        + Serialize
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, kube::Error> {
        self.api(namespace).get(name).await
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api(namespace).list(&params).await?.items)
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, kube::Error> {
        self.api(namespace)
            .create(&PostParams::default(), object)
            .await
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        self.api(namespace)
            .replace(&name, &PostParams::default(), object)
            .await
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let params = DeleteParams::background();
        self.api(namespace).delete(name, &params).await.map(|_| ())
    }
}
