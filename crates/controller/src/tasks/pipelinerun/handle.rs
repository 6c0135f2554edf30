//! Mutable view of one `PipelineRun` during a reconcile
//!
//! Status mutations are applied locally right away and also recorded. When
//! the status write loses a resourceVersion race the handle re-fetches the
//! object and replays the recorded mutations on top of the fresh status.

use crate::crds::{PipelineRun, PipelineRunSpec, PipelineRunStatus, RunResult, State, StateItem};
use crate::errors::k8s;
use crate::tasks::types::{RunOwner, PIPELINERUN_FINALIZER_NAME};
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::core::v1::ContainerState;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

const MAX_CONFLICT_RETRIES: usize = 5;

/// Optional status fields left out of the serialized status when unset
const OPTIONAL_STATUS_FIELDS: [&str; 5] = [
    "stateDetails",
    "namespace",
    "auxiliaryNamespace",
    "message",
    "container",
];
const CONTAINER_STATE_FIELDS: [&str; 3] = ["running", "terminated", "waiting"];

fn null_missing(value: &mut Value, fields: &[&str]) {
    if let Value::Object(object) = value {
        for field in fields {
            object.entry(*field).or_insert(Value::Null);
        }
    }
}

/// Merge patch writing the whole status of `run`. Unset optional fields are
/// sent as null so that values cleared locally are removed on the server.
/// The resourceVersion turns the merge into a conditional write.
fn status_patch(run: &PipelineRun) -> Result<Value, kube::Error> {
    let mut status = serde_json::to_value(&run.status).map_err(kube::Error::SerdeError)?;
    null_missing(&mut status, &OPTIONAL_STATUS_FIELDS);
    if let Some(container) = status.get_mut("container") {
        null_missing(container, &CONTAINER_STATE_FIELDS);
    }
    Ok(json!({
        "apiVersion": PipelineRun::api_version(&()),
        "kind": PipelineRun::kind(&()),
        "metadata": { "resourceVersion": run.resource_version() },
        "status": status,
    }))
}

/// Authoritative access to `PipelineRun` objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipelineRunStore: Send + Sync {
    /// Reads straight from the API server; `None` when the object is gone
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>, kube::Error>;

    /// Replaces metadata and spec
    async fn update(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error>;

    /// Replaces the status subresource
    async fn update_status(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error>;
}

pub struct KubePipelineRunStore {
    client: Client,
}

impl KubePipelineRunStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PipelineRun> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl PipelineRunStore for KubePipelineRunStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Option<PipelineRun>, kube::Error> {
        self.api(namespace).get_opt(name).await
    }

    async fn update(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error> {
        let namespace = run.namespace().unwrap_or_default();
        self.api(&namespace)
            .replace(&run.name_any(), &PostParams::default(), run)
            .await
    }

    async fn update_status(&self, run: &PipelineRun) -> Result<PipelineRun, kube::Error> {
        let namespace = run.namespace().unwrap_or_default();
        let patch = status_patch(run)?;
        self.api(&namespace)
            .patch_status(
                &run.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
    }
}

type StatusChange = Box<dyn Fn(&mut PipelineRunStatus) + Send + Sync>;

static EMPTY_STATUS: PipelineRunStatus = PipelineRunStatus {
    state: State::Undefined,
    state_details: None,
    state_history: Vec::new(),
    result: RunResult::Undefined,
    namespace: None,
    auxiliary_namespace: None,
    message: None,
    container: None,
};

pub struct PipelineRunHandle {
    run: PipelineRun,
    pending: Vec<StatusChange>,
}

impl std::fmt::Debug for PipelineRunHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunHandle")
            .field("key", &self.key())
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl PipelineRunHandle {
    pub fn new(run: PipelineRun) -> Self {
        Self {
            run,
            pending: Vec::new(),
        }
    }

    pub fn spec(&self) -> &PipelineRunSpec {
        &self.run.spec
    }

    pub fn status(&self) -> &PipelineRunStatus {
        self.run.status.as_ref().unwrap_or(&EMPTY_STATUS)
    }

    pub fn name(&self) -> String {
        self.run.name_any()
    }

    pub fn namespace(&self) -> String {
        self.run.namespace().unwrap_or_default()
    }

    /// `namespace/name`
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }

    pub fn uid(&self) -> String {
        self.run.uid().unwrap_or_default()
    }

    pub fn owner(&self) -> RunOwner {
        RunOwner {
            key: self.key(),
            uid: self.uid(),
        }
    }

    pub fn state(&self) -> State {
        self.status().state
    }

    pub fn result(&self) -> RunResult {
        self.status().result
    }

    pub fn is_deleted(&self) -> bool {
        self.run.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.run.finalizers().iter().any(|f| f == PIPELINERUN_FINALIZER_NAME)
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.pending.is_empty()
    }

    fn change(&mut self, change: StatusChange) {
        change(self.run.status.get_or_insert_with(PipelineRunStatus::default));
        self.pending.push(change);
    }

    /// Moves to `state`, closing the current state in the history
    pub fn update_state(&mut self, state: State) {
        if self.state() == state && self.status().state_details.is_some() {
            return;
        }
        let now = Time(Utc::now());
        self.change(Box::new(move |status| {
            if status.state == state && status.state_details.is_some() {
                return;
            }
            if let Some(mut previous) = status.state_details.take() {
                previous.finished_at = Some(now.clone());
                status.state_history.push(previous);
            }
            status.state = state;
            status.state_details = Some(StateItem {
                state,
                started_at: now.clone(),
                finished_at: None,
            });
        }));
    }

    pub fn update_result(&mut self, result: RunResult) {
        self.change(Box::new(move |status| status.result = result));
    }

    pub fn update_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.change(Box::new(move |status| status.message = Some(message.clone())));
    }

    pub fn update_run_namespace(&mut self, namespace: Option<String>) {
        self.change(Box::new(move |status| status.namespace = namespace.clone()));
    }

    pub fn update_aux_namespace(&mut self, namespace: Option<String>) {
        self.change(Box::new(move |status| {
            status.auxiliary_namespace = namespace.clone()
        }));
    }

    pub fn update_container(&mut self, container: Option<ContainerState>) {
        if self.status().container == container {
            return;
        }
        self.change(Box::new(move |status| status.container = container.clone()));
    }

    /// Started time of the current state
    pub fn state_started_at(&self) -> Option<&Time> {
        self.status()
            .state_details
            .as_ref()
            .map(|details| &details.started_at)
    }

    /// Writes pending status changes, replaying them on conflict
    pub async fn commit_status(
        &mut self,
        store: &dyn PipelineRunStore,
    ) -> Result<(), kube::Error> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let mut attempt = 0;
        loop {
            match store.update_status(&self.run).await {
                Ok(updated) => {
                    self.run = updated;
                    self.pending.clear();
                    return Ok(());
                }
                Err(e) if k8s::is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(
                        pipelinerun = %self.key(),
                        attempt,
                        "Status update conflict, replaying changes"
                    );
                    self.refetch(store).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn add_finalizer(
        &mut self,
        store: &dyn PipelineRunStore,
    ) -> Result<(), kube::Error> {
        self.update_finalizers(store, |finalizers| {
            if finalizers.iter().any(|f| f == PIPELINERUN_FINALIZER_NAME) {
                false
            } else {
                finalizers.push(PIPELINERUN_FINALIZER_NAME.to_string());
                true
            }
        })
        .await
    }

    pub async fn remove_finalizer(
        &mut self,
        store: &dyn PipelineRunStore,
    ) -> Result<(), kube::Error> {
        self.update_finalizers(store, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != PIPELINERUN_FINALIZER_NAME);
            finalizers.len() != before
        })
        .await
    }

    async fn update_finalizers(
        &mut self,
        store: &dyn PipelineRunStore,
        mutate: impl Fn(&mut Vec<String>) -> bool,
    ) -> Result<(), kube::Error> {
        let mut attempt = 0;
        loop {
            let mut desired = self.run.clone();
            if !mutate(desired.finalizers_mut()) {
                return Ok(());
            }
            match store.update(&desired).await {
                Ok(updated) => {
                    self.adopt(updated);
                    return Ok(());
                }
                Err(e) if k8s::is_conflict(&e) && attempt < MAX_CONFLICT_RETRIES => {
                    attempt += 1;
                    debug!(
                        pipelinerun = %self.key(),
                        attempt,
                        "Finalizer update conflict, retrying"
                    );
                    self.refetch(store).await?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn refetch(&mut self, store: &dyn PipelineRunStore) -> Result<(), kube::Error> {
        let (namespace, name) = (self.namespace(), self.name());
        let fresh = store
            .get(&namespace, &name)
            .await?
            .ok_or_else(|| k8s::not_found("pipelineruns", &name))?;
        self.adopt(fresh);
        Ok(())
    }

    /// Takes `run` as the new base and re-applies the pending status changes
    fn adopt(&mut self, mut run: PipelineRun) {
        let status = run.status.get_or_insert_with(PipelineRunStatus::default);
        for change in &self.pending {
            change(status);
        }
        self.run = run;
    }
}
