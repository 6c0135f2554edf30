//! In-memory cluster fakes shared by the unit tests

use crate::crds::{PipelineRun, PipelineRunSpec, PipelineSource};
use crate::errors::k8s::{already_exists, api_error, conflict, is_not_found, not_found};
use crate::tasks::pipelinerun::PipelineRunStore;
use crate::tasks::repository::Repository;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::error::ErrorResponse;
use kube::Resource;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;

type Key = (String, String);

/// A PipelineRun `namespace/name` with a UID and a minimal pipeline source
pub fn pipeline_run(namespace: &str, name: &str) -> PipelineRun {
    let mut run = PipelineRun::new(
        name,
        PipelineRunSpec {
            pipeline: PipelineSource {
                repo_url: "https://github.com/org/pipelines".to_string(),
                revision: "main".to_string(),
                relative_path: "Jenkinsfile".to_string(),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    run.metadata.namespace = Some(namespace.to_string());
    run.metadata.uid = Some(format!("{name}-uid"));
    run
}

struct Inner<K> {
    objects: BTreeMap<Key, K>,
    revision: u64,
    generated: u64,
    fail_get: VecDeque<kube::Error>,
    fail_create: VecDeque<kube::Error>,
    fail_update: VecDeque<kube::Error>,
    fail_update_status: VecDeque<kube::Error>,
    fail_delete: VecDeque<kube::Error>,
    fail_all_creates: Option<ErrorResponse>,
    calls: Vec<String>,
}

/// `Repository` fake honouring `generateName`, resourceVersion conflicts,
/// finalizers on delete and injected failures
pub struct InMemoryRepository<K> {
    inner: Mutex<Inner<K>>,
}

impl<K> Default for InMemoryRepository<K> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner {
                objects: BTreeMap::new(),
                revision: 0,
                generated: 0,
                fail_get: VecDeque::new(),
                fail_create: VecDeque::new(),
                fail_update: VecDeque::new(),
                fail_update_status: VecDeque::new(),
                fail_delete: VecDeque::new(),
                fail_all_creates: None,
                calls: Vec::new(),
            }),
        }
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn matches_selector<K: Resource>(object: &K, selector: &str) -> bool {
    let labels = object.meta().labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|actual| actual == v),
            None => labels.contains_key(term),
        })
}

impl<K> InMemoryRepository<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    fn kind() -> String {
        K::plural(&()).to_string()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap()
    }

    /// Stores `object` as-is, assigning a resourceVersion
    pub fn insert(&self, mut object: K) {
        let mut inner = self.lock();
        inner.revision += 1;
        object.meta_mut().resource_version = Some(inner.revision.to_string());
        let namespace = object.meta().namespace.clone().unwrap_or_default();
        let name = object.meta().name.clone().unwrap_or_default();
        inner.objects.insert(key(&namespace, &name), object);
    }

    pub fn stored(&self, namespace: &str, name: &str) -> Option<K> {
        self.lock().objects.get(&key(namespace, name)).cloned()
    }

    pub fn all(&self) -> Vec<K> {
        self.lock().objects.values().cloned().collect()
    }

    pub fn in_namespace(&self, namespace: &str) -> Vec<K> {
        self.lock()
            .objects
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, object)| object.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutates a stored object the way a concurrent writer would
    pub fn modify(&self, namespace: &str, name: &str, change: impl FnOnce(&mut K)) {
        let mut inner = self.lock();
        inner.revision += 1;
        let revision = inner.revision.to_string();
        if let Some(object) = inner.objects.get_mut(&key(namespace, name)) {
            change(object);
            object.meta_mut().resource_version = Some(revision);
        }
    }

    /// Operations performed so far, e.g. `create ns/name`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn fail_next_get(&self, err: kube::Error) {
        self.lock().fail_get.push_back(err);
    }

    pub fn fail_next_create(&self, err: kube::Error) {
        self.lock().fail_create.push_back(err);
    }

    pub fn fail_next_update(&self, err: kube::Error) {
        self.lock().fail_update.push_back(err);
    }

    pub fn fail_next_update_status(&self, err: kube::Error) {
        self.lock().fail_update_status.push_back(err);
    }

    pub fn fail_next_delete(&self, err: kube::Error) {
        self.lock().fail_delete.push_back(err);
    }

    /// Makes every subsequent create fail with `response`
    pub fn fail_all_creates(&self, response: ErrorResponse) {
        self.lock().fail_all_creates = Some(response);
    }

    fn replace(
        inner: &mut Inner<K>,
        namespace: &str,
        object: &K,
        merge: impl FnOnce(&K, &K) -> K,
    ) -> Result<K, kube::Error> {
        let name = object.meta().name.clone().unwrap_or_default();
        let k = key(namespace, &name);
        let Some(current) = inner.objects.get(&k) else {
            return Err(not_found(&Self::kind(), &name));
        };
        if let Some(expected) = &object.meta().resource_version {
            if current.meta().resource_version.as_ref() != Some(expected) {
                return Err(conflict(&Self::kind(), &name));
            }
        }

        let mut updated = merge(current, object);
        inner.revision += 1;
        updated.meta_mut().resource_version = Some(inner.revision.to_string());

        let finalized = updated.meta().deletion_timestamp.is_some()
            && updated.meta().finalizers.as_ref().map_or(true, Vec::is_empty);
        if finalized {
            inner.objects.remove(&k);
        } else {
            inner.objects.insert(k, updated.clone());
        }
        Ok(updated)
    }
}

#[async_trait]
impl<K> Repository<K> for InMemoryRepository<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> Result<K, kube::Error> {
        let mut inner = self.lock();
        inner.calls.push(format!("get {namespace}/{name}"));
        if let Some(err) = inner.fail_get.pop_front() {
            return Err(err);
        }
        inner
            .objects
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| not_found(&Self::kind(), name))
    }

    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>, kube::Error> {
        let mut inner = self.lock();
        inner.calls.push(format!("list {namespace}"));
        Ok(inner
            .objects
            .iter()
            .filter(|((ns, _), object)| {
                ns == namespace && matches_selector(*object, label_selector)
            })
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, namespace: &str, object: &K) -> Result<K, kube::Error> {
        let mut inner = self.lock();
        if let Some(err) = inner.fail_create.pop_front() {
            return Err(err);
        }
        if let Some(response) = &inner.fail_all_creates {
            return Err(kube::Error::Api(response.clone()));
        }

        let mut created = object.clone();
        let name = match (&object.meta().name, &object.meta().generate_name) {
            (Some(name), _) if !name.is_empty() => name.clone(),
            (_, Some(prefix)) => {
                inner.generated += 1;
                format!("{prefix}{:05x}", inner.generated)
            }
            _ => {
                let message = "name or generateName is required";
                return Err(api_error(422, "Invalid", message));
            }
        };
        inner.calls.push(format!("create {namespace}/{name}"));

        let k = key(namespace, &name);
        if inner.objects.contains_key(&k) {
            return Err(already_exists(&Self::kind(), &name));
        }

        inner.revision += 1;
        let meta = created.meta_mut();
        meta.name = Some(name);
        if !namespace.is_empty() {
            meta.namespace = Some(namespace.to_string());
        }
        meta.uid = Some(format!("uid-{}", inner.revision));
        meta.resource_version = Some(inner.revision.to_string());
        meta.creation_timestamp = Some(Time(Utc::now()));
        inner.objects.insert(k, created.clone());
        Ok(created)
    }

    async fn update(&self, namespace: &str, object: &K) -> Result<K, kube::Error> {
        let mut inner = self.lock();
        let name = object.meta().name.clone().unwrap_or_default();
        inner.calls.push(format!("update {namespace}/{name}"));
        if let Some(err) = inner.fail_update.pop_front() {
            return Err(err);
        }
        Self::replace(&mut inner, namespace, object, |_, new| new.clone())
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), kube::Error> {
        let mut inner = self.lock();
        inner.calls.push(format!("delete {namespace}/{name}"));
        if let Some(err) = inner.fail_delete.pop_front() {
            return Err(err);
        }
        let k = key(namespace, name);
        let Some(object) = inner.objects.get(&k) else {
            return Err(not_found(&Self::kind(), name));
        };

        let has_finalizers = object
            .meta()
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            inner.revision += 1;
            let revision = inner.revision.to_string();
            if let Some(object) = inner.objects.get_mut(&k) {
                let meta = object.meta_mut();
                meta.deletion_timestamp.get_or_insert_with(|| Time(Utc::now()));
                meta.resource_version = Some(revision);
            }
        } else {
            inner.objects.remove(&k);
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineRunStore for InMemoryRepository<PipelineRun> {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>, kube::Error> {
        match Repository::get(self, namespace, name).await {
            Ok(run) => Ok(Some(run)),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn update(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error> {
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let mut inner = self.lock();
        let name = run.metadata.name.clone().unwrap_or_default();
        inner.calls.push(format!("update {namespace}/{name}"));
        if let Some(err) = inner.fail_update.pop_front() {
            return Err(err);
        }
        Self::replace(&mut inner, &namespace, run, |current, new| {
            let mut merged = new.clone();
            merged.status = current.status.clone();
            merged
        })
    }

    async fn update_status(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error> {
        let namespace = run.metadata.namespace.clone().unwrap_or_default();
        let mut inner = self.lock();
        inner.calls.push(format!(
            "update_status {namespace}/{}",
            run.metadata.name.clone().unwrap_or_default()
        ));
        if let Some(err) = inner.fail_update_status.pop_front() {
            return Err(err);
        }
        Self::replace(&mut inner, &namespace, run, |current, new| {
            let mut merged = current.clone();
            merged.status = new.status.clone();
            merged
        })
    }
}
