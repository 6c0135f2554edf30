use super::handle::PipelineRunHandle;
use crate::crds::{Intent, PipelineRun, RunResult, State};
use crate::errors;
use crate::errors::k8s;
use crate::tasks::config::{format_duration, PipelineRunsConfig};
use crate::tasks::run::Run;
use crate::tasks::types::{Context, Error, Result};
use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};

/// Outcome of one state handler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The state changed, handle the new state in the same pass
    Continue,
    /// Nothing more to do until the next poll
    Requeue,
}

fn key_of(run: &PipelineRun) -> String {
    format!("{}/{}", run.namespace().unwrap_or_default(), run.name_any())
}

#[instrument(skip(run, ctx), fields(pipelinerun = %key_of(&run)))]
pub async fn reconcile_pipeline_run(run: Arc<PipelineRun>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = run.namespace().ok_or(Error::MissingObjectKey)?;
    let name = run.name_any();
    let key = key_of(&run);

    // the watch cache may lag behind; always act on the stored object
    let Some(fresh) = ctx.store.get(&namespace, &name).await? else {
        debug!("PipelineRun no longer exists");
        ctx.failures.remove(&key);
        return Ok(Action::await_change());
    };

    let mut handle = PipelineRunHandle::new(fresh);
    let result = Reconciler::new(&ctx).reconcile(&mut handle).await;
    if result.is_ok() {
        ctx.failures.remove(&key);
    }
    result
}

/// Bounded exponential backoff per PipelineRun
pub fn error_policy(run: Arc<PipelineRun>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = key_of(&run);
    let failures = {
        let mut count = ctx.failures.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    };
    let delay = ctx.config.backoff.delay(failures);
    error!(
        pipelinerun = %key,
        failures,
        retry_in = ?delay,
        error = %format!("{err:#}"),
        "PipelineRun reconciliation failed"
    );
    Action::requeue(delay)
}

struct Reconciler<'a> {
    ctx: &'a Context,
    /// Loaded at most once per pass
    config: Option<PipelineRunsConfig>,
}

impl<'a> Reconciler<'a> {
    fn new(ctx: &'a Context) -> Self {
        Self { ctx, config: None }
    }

    fn requeue(&self) -> Action {
        Action::requeue(Duration::from_secs(self.ctx.config.requeue_seconds))
    }

    async fn reconcile(&mut self, run: &mut PipelineRunHandle) -> Result<Action> {
        let ctx = self.ctx;
        let store = ctx.store.as_ref();

        if run.is_deleted() {
            return self.finalize(run).await;
        }

        if run.state() == State::Finished {
            if run.has_finalizer() {
                run.remove_finalizer(store).await?;
            }
            debug!("PipelineRun already finished");
            return Ok(Action::await_change());
        }

        if !run.has_finalizer() {
            run.add_finalizer(store).await?;
        }

        if run.spec().intent == Some(Intent::Abort) && run.result() == RunResult::Undefined {
            info!(state = %run.state(), "🛑 Abort requested, tearing down");
            run.update_result(RunResult::Aborted);
            run.update_state(State::Cleaning);
            run.commit_status(store).await?;
        }

        loop {
            let state = run.state();
            let step = match state {
                State::Undefined | State::New => {
                    run.update_state(State::Preparing);
                    Ok(Step::Continue)
                }
                State::Preparing => self.prepare(run).await,
                State::Waiting => self.wait(run).await,
                State::Running => self.watch(run).await,
                State::Cleaning => self.clean(run).await,
                State::Finished => {
                    run.remove_finalizer(store).await?;
                    info!(result = %run.result(), "🏁 PipelineRun finished");
                    return Ok(Action::await_change());
                }
            };

            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    // keep whatever progress was made before the failure
                    if let Err(commit) = run.commit_status(store).await {
                        warn!(error = %commit, "Failed to write status after reconcile error");
                    }
                    return Err(e);
                }
            };
            run.commit_status(store).await?;

            match step {
                Step::Continue => {
                    debug!(from = %state, to = %run.state(), "State changed");
                }
                Step::Requeue => return Ok(self.requeue()),
            }
        }
    }

    /// Records a terminal failure and moves on to cleaning
    fn fail(run: &mut PipelineRunHandle, result: RunResult, message: String) -> Step {
        warn!(result = %result, message = %message, "PipelineRun failed");
        run.update_message(message);
        run.update_result(result);
        run.update_state(State::Cleaning);
        Step::Continue
    }

    /// `None` when loading failed terminally and the run was failed instead
    async fn config(
        &mut self,
        run: &mut PipelineRunHandle,
    ) -> Result<Option<PipelineRunsConfig>> {
        if let Some(config) = &self.config {
            return Ok(Some(config.clone()));
        }
        match self.ctx.config_source.load().await {
            Ok(config) => {
                self.config = Some(config.clone());
                Ok(Some(config))
            }
            Err(e) if errors::is_recoverable(&e) => Err(e.into()),
            Err(e) => {
                Self::fail(
                    run,
                    RunResult::ErrorInfra,
                    format!("failed to load pipeline runs configuration: {e:#}"),
                );
                Ok(None)
            }
        }
    }

    /// Turns a Run Manager failure into a step; unclassified errors are retried
    fn preparation_failed(run: &mut PipelineRunHandle, err: anyhow::Error) -> Result<Step> {
        match errors::get_class(&err) {
            RunResult::Undefined => Err(err.into()),
            class => Ok(Self::fail(run, class, format!("preparing failed: {err:#}"))),
        }
    }

    async fn prepare(&mut self, run: &mut PipelineRunHandle) -> Result<Step> {
        let Some(config) = self.config(run).await? else {
            return Ok(Step::Continue);
        };
        let ctx = self.ctx;
        let manager = ctx.run_manager.as_ref();

        info!("🏗️ Preparing run environment");
        if let Err(e) = manager.create_env(run, &config).await {
            return Self::preparation_failed(run, e);
        }
        if let Err(e) = manager.create_run(run, &config).await {
            return Self::preparation_failed(run, e);
        }

        info!(namespace = ?run.status().namespace, "🚀 Run submitted");
        run.update_state(State::Waiting);
        Ok(Step::Continue)
    }

    fn waited_too_long(run: &PipelineRunHandle, limit: Duration) -> bool {
        run.state_started_at()
            .and_then(|started| (Utc::now() - started.0).to_std().ok())
            .is_some_and(|elapsed| elapsed > limit)
    }

    /// Fetch failure while waiting or running
    fn fetch_failed(run: &mut PipelineRunHandle, err: anyhow::Error) -> Result<Step> {
        if errors::is_recoverable(&err) {
            return Err(err.into());
        }
        Ok(Self::fail(
            run,
            RunResult::ErrorInfra,
            format!("failed to get run: {err:#}"),
        ))
    }

    async fn restart(
        &mut self,
        run: &mut PipelineRunHandle,
        config: &PipelineRunsConfig,
    ) -> Result<Step> {
        let ctx = self.ctx;
        let manager = ctx.run_manager.as_ref();
        info!("♻️ Run cannot start, re-creating it");
        manager.delete_run(run).await?;
        match manager.create_run(run, config).await {
            Ok(()) => Ok(Step::Requeue),
            // the previous run is still terminating
            Err(e) if k8s::is_already_exists_in(&e) => Ok(Step::Requeue),
            Err(e) => Self::preparation_failed(run, e),
        }
    }

    async fn wait(&mut self, run: &mut PipelineRunHandle) -> Result<Step> {
        let Some(config) = self.config(run).await? else {
            return Ok(Step::Continue);
        };

        let current = match self.ctx.run_manager.get_run(run).await {
            Ok(current) => current,
            Err(e) => return Self::fetch_failed(run, e),
        };

        let stuck = current
            .as_ref()
            .is_some_and(|current| current.is_deleted() || current.is_restartable());
        if let Some(current) = current.as_ref().filter(|_| !stuck) {
            if current.start_time().is_some() || current.is_finished().0 {
                info!("▶️ Run started");
                run.update_container(current.container_info());
                run.update_state(State::Running);
                return Ok(Step::Continue);
            }
        }

        // restarts never extend the wait
        if Self::waited_too_long(run, config.timeout_wait) {
            return Ok(Self::fail(
                run,
                RunResult::ErrorInfra,
                format!(
                    "run did not start within {}",
                    format_duration(config.timeout_wait)
                ),
            ));
        }
        if stuck {
            return self.restart(run, &config).await;
        }
        debug!(found = current.is_some(), "Waiting for the run to start");
        Ok(Step::Requeue)
    }

    fn observe(run: &mut PipelineRunHandle, current: &dyn Run) -> Step {
        run.update_container(current.container_info());
        let (finished, result) = current.is_finished();
        if finished {
            info!(result = %result, "✅ Run completed");
            run.update_message(current.message());
            run.update_result(result);
            run.update_state(State::Cleaning);
            return Step::Continue;
        }
        if current.is_deleted() {
            return Self::fail(run, RunResult::ErrorInfra, "run was deleted".to_string());
        }
        Step::Requeue
    }

    async fn watch(&mut self, run: &mut PipelineRunHandle) -> Result<Step> {
        match self.ctx.run_manager.get_run(run).await {
            Ok(Some(current)) => Ok(Self::observe(run, current.as_ref())),
            Ok(None) => Ok(Self::fail(
                run,
                RunResult::ErrorInfra,
                "run disappeared while running".to_string(),
            )),
            Err(e) => Self::fetch_failed(run, e),
        }
    }

    async fn cleanup(&self, run: &PipelineRunHandle) -> Result<()> {
        let manager = self.ctx.run_manager.as_ref();
        manager.delete_run(run).await?;
        manager.delete_env(run).await?;
        Ok(())
    }

    async fn clean(&mut self, run: &mut PipelineRunHandle) -> Result<Step> {
        info!("🧹 Cleaning up run environment");
        self.cleanup(run).await?;
        run.update_state(State::Finished);
        Ok(Step::Continue)
    }

    /// Deletion requested: tear everything down, then let the object go
    async fn finalize(&mut self, run: &mut PipelineRunHandle) -> Result<Action> {
        if !run.has_finalizer() {
            return Ok(Action::await_change());
        }
        let ctx = self.ctx;
        let store = ctx.store.as_ref();

        info!(state = %run.state(), "🗑️ PipelineRun deleted, cleaning up");
        self.cleanup(run).await?;

        if run.result() == RunResult::Undefined {
            run.update_result(RunResult::Deleted);
        }
        run.update_state(State::Finished);
        run.commit_status(store).await?;
        run.remove_finalizer(store).await?;
        Ok(Action::await_change())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::{PipelineRunStatus, StateItem};
    use crate::errors::k8s::api_error;
    use crate::tasks::config::{ControllerConfig, MockPipelineRunsConfigSource};
    use crate::tasks::namespace::KubeNamespaceManager;
    use crate::tasks::repository::Repository;
    use crate::tasks::retry::RetryConfig;
    use crate::tasks::run::{MockRun, MockRunManager, RunManager, RunRepositories, TektonRunManager};
    use crate::tasks::secrets::KubeSecretManager;
    use crate::tasks::types::PIPELINERUN_FINALIZER_NAME;
    use crate::testing::{pipeline_run, InMemoryRepository};
    use anyhow::anyhow;
    use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, Namespace, Secret};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const NAMESPACE: &str = "client";
    const NAME: &str = "run-1";

    fn store_with(
        configure: impl FnOnce(&mut PipelineRun),
    ) -> Arc<InMemoryRepository<PipelineRun>> {
        let mut run = pipeline_run(NAMESPACE, NAME);
        configure(&mut run);
        let store = Arc::new(InMemoryRepository::new());
        store.insert(run);
        store
    }

    fn with_state(run: &mut PipelineRun, state: State) {
        let status = run.status.get_or_insert_with(PipelineRunStatus::default);
        status.state = state;
        status.namespace = Some("run-ns".to_string());
        status.state_details = Some(StateItem {
            state,
            started_at: Time(Utc::now()),
            finished_at: None,
        });
    }

    fn with_finalizer(run: &mut PipelineRun) {
        run.metadata.finalizers = Some(vec![PIPELINERUN_FINALIZER_NAME.to_string()]);
    }

    fn context(
        store: Arc<InMemoryRepository<PipelineRun>>,
        run_manager: Arc<dyn RunManager>,
        config_source: MockPipelineRunsConfigSource,
    ) -> Arc<Context> {
        Arc::new(Context::new(
            store,
            run_manager,
            Arc::new(config_source),
            Arc::new(ControllerConfig::default()),
        ))
    }

    fn default_config() -> MockPipelineRunsConfigSource {
        let mut source = MockPipelineRunsConfigSource::new();
        source
            .expect_load()
            .returning(|| Ok(PipelineRunsConfig::default()));
        source
    }

    fn no_config() -> MockPipelineRunsConfigSource {
        let mut source = MockPipelineRunsConfigSource::new();
        source.expect_load().never();
        source
    }

    fn cleanup_ok(manager: &mut MockRunManager) {
        manager.expect_delete_run().returning(|_| Ok(()));
        manager.expect_delete_env().returning(|_| Ok(()));
    }

    fn fake_run(started: bool, finished: Option<(RunResult, &'static str)>) -> MockRun {
        let mut run = MockRun::new();
        run.expect_start_time()
            .return_const(started.then(|| Time(Utc::now())));
        run.expect_is_finished().return_const(match finished {
            Some((result, _)) => (true, result),
            None => (false, RunResult::Undefined),
        });
        run.expect_message()
            .return_const(finished.map(|(_, m)| m).unwrap_or_default().to_string());
        run.expect_container_info().return_const(started.then(|| ContainerState {
            running: Some(ContainerStateRunning { started_at: None }),
            ..Default::default()
        }));
        run.expect_is_restartable().return_const(false);
        run.expect_is_deleted().return_const(false);
        run
    }

    async fn reconcile(
        ctx: &Arc<Context>,
        store: &InMemoryRepository<PipelineRun>,
    ) -> Result<Action> {
        let observed = store.stored(NAMESPACE, NAME).unwrap();
        reconcile_pipeline_run(Arc::new(observed), ctx.clone()).await
    }

    fn stored(store: &InMemoryRepository<PipelineRun>) -> PipelineRun {
        store.stored(NAMESPACE, NAME).unwrap()
    }

    fn status(store: &InMemoryRepository<PipelineRun>) -> PipelineRunStatus {
        stored(store).status.unwrap_or_default()
    }

    fn visited(status: &PipelineRunStatus) -> Vec<State> {
        status.state_history.iter().map(|item| item.state).collect()
    }

    #[tokio::test]
    async fn new_run_is_prepared_and_waits() {
        let store = store_with(|_| {});
        let mut manager = MockRunManager::new();
        manager.expect_create_env().times(1).returning(|run, _| {
            run.update_run_namespace(Some("run-ns".to_string()));
            Ok(("run-ns".to_string(), None))
        });
        manager.expect_create_run().times(1).returning(|_, _| Ok(()));
        manager.expect_get_run().returning(|_| Ok(None));
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        let action = reconcile(&ctx, &store).await.unwrap();

        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        let run = stored(&store);
        assert!(run.finalizers().contains(&PIPELINERUN_FINALIZER_NAME.to_string()));
        let status = run.status.unwrap();
        assert_eq!(status.state, State::Waiting);
        assert_eq!(status.namespace.as_deref(), Some("run-ns"));
        assert_eq!(visited(&status), vec![State::Preparing]);
        assert!(status.state_history[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn abort_from_every_unfinished_state() {
        for state in [
            State::Undefined,
            State::New,
            State::Preparing,
            State::Waiting,
            State::Running,
            State::Cleaning,
        ] {
            let store = store_with(|run| {
                with_state(run, state);
                run.spec.intent = Some(Intent::Abort);
            });
            let mut manager = MockRunManager::new();
            cleanup_ok(&mut manager);
            manager.expect_create_env().never();
            manager.expect_get_run().never();
            let ctx = context(store.clone(), Arc::new(manager), no_config());

            reconcile(&ctx, &store).await.unwrap();

            let status = status(&store);
            assert_eq!(status.result, RunResult::Aborted, "from {state}");
            assert_eq!(status.state, State::Finished, "from {state}");
            assert!(visited(&status).contains(&State::Cleaning), "from {state}");
            assert!(stored(&store).finalizers().is_empty());
        }
    }

    #[tokio::test]
    async fn abort_keeps_existing_result() {
        let store = store_with(|run| {
            with_state(run, State::Cleaning);
            run.status.as_mut().unwrap().result = RunResult::Success;
            run.spec.intent = Some(Intent::Abort);
        });
        let mut manager = MockRunManager::new();
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        reconcile(&ctx, &store).await.unwrap();
        assert_eq!(status(&store).result, RunResult::Success);
    }

    #[tokio::test]
    async fn missing_secret_fails_preparation_with_content_error() {
        let store = store_with(|run| run.spec.secrets = vec!["secret1".to_string()]);
        let namespaces = Arc::new(InMemoryRepository::<Namespace>::new());
        let secrets = Arc::new(InMemoryRepository::<Secret>::new());
        let repos = RunRepositories {
            service_accounts: Arc::new(InMemoryRepository::new()),
            role_bindings: Arc::new(InMemoryRepository::new()),
            network_policies: Arc::new(InMemoryRepository::new()),
            resource_quotas: Arc::new(InMemoryRepository::new()),
            limit_ranges: Arc::new(InMemoryRepository::new()),
            task_runs: Arc::new(InMemoryRepository::new()),
        };
        let manager = TektonRunManager::new(
            repos,
            Arc::new(
                KubeNamespaceManager::new(namespaces.clone(), "pipelinerun")
                    .with_retry(RetryConfig::immediate(1)),
            ),
            Arc::new(KubeSecretManager::new(secrets)),
            Default::default(),
            false,
        );
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        let action = reconcile(&ctx, &store).await.unwrap();

        assert_eq!(action, Action::await_change());
        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorContent);
        assert_eq!(status.state, State::Finished);
        assert!(status
            .message
            .as_deref()
            .is_some_and(|m| m.contains("failed to copy pipeline secrets")));
        assert_eq!(visited(&status), vec![State::Preparing, State::Cleaning]);
        assert!(namespaces.is_empty());
        assert!(stored(&store).finalizers().is_empty());
    }

    #[tokio::test]
    async fn unclassified_preparation_failure_is_retried() {
        let store = store_with(|_| {});
        let mut manager = MockRunManager::new();
        manager
            .expect_create_env()
            .returning(|_, _| Err(anyhow!("connection reset")));
        manager.expect_create_run().never();
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        let err = reconcile(&ctx, &store).await.unwrap_err();

        assert!(err.to_string().contains("connection reset"));
        let status = status(&store);
        assert_eq!(status.state, State::Preparing);
        assert_eq!(status.result, RunResult::Undefined);
    }

    #[tokio::test]
    async fn classified_run_creation_failure_cleans_up() {
        let store = store_with(|_| {});
        let mut manager = MockRunManager::new();
        manager
            .expect_create_env()
            .returning(|_, _| Ok(("run-ns".to_string(), None)));
        manager.expect_create_run().returning(|_, _| {
            Err(errors::classify(
                anyhow!("invalid timeout \"soon\""),
                RunResult::ErrorContent,
            ))
        });
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        reconcile(&ctx, &store).await.unwrap();

        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorContent);
        assert_eq!(status.state, State::Finished);
        assert_eq!(
            status.message.as_deref(),
            Some("preparing failed: invalid timeout \"soon\"")
        );
    }

    #[tokio::test]
    async fn waiting_run_with_start_time_becomes_running() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
        });
        let mut manager = MockRunManager::new();
        manager
            .expect_get_run()
            .times(2)
            .returning(|_| Ok(Some(Box::new(fake_run(true, None)) as Box<dyn Run>)));
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        reconcile(&ctx, &store).await.unwrap();

        let status = status(&store);
        assert_eq!(status.state, State::Running);
        assert!(status.container.unwrap().running.is_some());
    }

    #[tokio::test]
    async fn waiting_run_not_started_stays() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
        });
        let mut manager = MockRunManager::new();
        manager
            .expect_get_run()
            .returning(|_| Ok(Some(Box::new(fake_run(false, None)) as Box<dyn Run>)));
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        let action = reconcile(&ctx, &store).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(status(&store).state, State::Waiting);
    }

    #[tokio::test]
    async fn waiting_too_long_is_infra_error() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
            run.status.as_mut().unwrap().state_details = Some(StateItem {
                state: State::Waiting,
                started_at: Time(Utc::now() - chrono::Duration::hours(1)),
                finished_at: None,
            });
        });
        let mut manager = MockRunManager::new();
        manager.expect_get_run().returning(|_| Ok(None));
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        reconcile(&ctx, &store).await.unwrap();

        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorInfra);
        assert_eq!(status.state, State::Finished);
        assert_eq!(
            status.message.as_deref(),
            Some("run did not start within 10m0s")
        );
    }

    #[tokio::test]
    async fn restartable_run_is_recreated() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
        });
        let mut manager = MockRunManager::new();
        manager.expect_get_run().returning(|_| {
            let mut run = MockRun::new();
            run.expect_is_deleted().return_const(false);
            run.expect_is_restartable().return_const(true);
            Ok(Some(Box::new(run) as Box<dyn Run>))
        });
        manager.expect_delete_run().times(1).returning(|_| Ok(()));
        manager.expect_create_run().times(1).returning(|_, _| Ok(()));
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        let action = reconcile(&ctx, &store).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(10)));
        assert_eq!(status(&store).state, State::Waiting);
    }

    #[tokio::test]
    async fn restartable_run_past_wait_timeout_fails() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
            run.status.as_mut().unwrap().state_details = Some(StateItem {
                state: State::Waiting,
                started_at: Time(Utc::now() - chrono::Duration::hours(1)),
                finished_at: None,
            });
        });
        let mut manager = MockRunManager::new();
        manager.expect_get_run().times(1).returning(|_| {
            let mut run = MockRun::new();
            run.expect_is_deleted().return_const(false);
            run.expect_is_restartable().return_const(true);
            Ok(Some(Box::new(run) as Box<dyn Run>))
        });
        manager.expect_create_run().never();
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        reconcile(&ctx, &store).await.unwrap();

        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorInfra);
        assert_eq!(status.state, State::Finished);
        assert_eq!(
            status.message.as_deref(),
            Some("run did not start within 10m0s")
        );
        assert_eq!(visited(&status), vec![State::Waiting, State::Cleaning]);
    }

    #[tokio::test]
    async fn fetch_errors_split_on_recoverability() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Running);
        });
        let mut manager = MockRunManager::new();
        let mut seq = mockall::Sequence::new();
        manager
            .expect_get_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(errors::recoverable(anyhow!("server timeout"))));
        manager
            .expect_get_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow!("forbidden")));
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        assert!(reconcile(&ctx, &store).await.is_err());
        assert_eq!(status(&store).state, State::Running);

        reconcile(&ctx, &store).await.unwrap();
        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorInfra);
        assert_eq!(status.state, State::Finished);
    }

    #[tokio::test]
    async fn finished_run_records_outcome() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Running);
        });
        let mut manager = MockRunManager::new();
        manager.expect_get_run().returning(|_| {
            let finished = fake_run(true, Some((RunResult::Timeout, "timed out")));
            Ok(Some(Box::new(finished) as Box<dyn Run>))
        });
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        reconcile(&ctx, &store).await.unwrap();

        let status = status(&store);
        assert_eq!(status.result, RunResult::Timeout);
        assert_eq!(status.message.as_deref(), Some("timed out"));
        assert_eq!(status.state, State::Finished);
        assert_eq!(visited(&status), vec![State::Running, State::Cleaning]);
    }

    #[tokio::test]
    async fn vanished_run_is_infra_error() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Running);
        });
        let mut manager = MockRunManager::new();
        manager.expect_get_run().returning(|_| Ok(None));
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        reconcile(&ctx, &store).await.unwrap();
        assert_eq!(status(&store).result, RunResult::ErrorInfra);
    }

    #[tokio::test]
    async fn failed_cleanup_keeps_cleaning() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Cleaning);
            run.status.as_mut().unwrap().result = RunResult::Success;
        });
        let mut manager = MockRunManager::new();
        manager.expect_delete_run().returning(|_| Ok(()));
        manager
            .expect_delete_env()
            .returning(|_| Err(anyhow!("namespace deletion failed")));
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        assert!(reconcile(&ctx, &store).await.is_err());
        assert_eq!(status(&store).state, State::Cleaning);
        assert!(!stored(&store).finalizers().is_empty());
    }

    #[tokio::test]
    async fn config_load_failures() {
        let store = store_with(|_| {});
        let mut source = MockPipelineRunsConfigSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(errors::recoverable(anyhow!("configmaps unavailable"))));
        source
            .expect_load()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Err(anyhow!("invalid value \"x\" for key \"timeout\"")));
        let mut manager = MockRunManager::new();
        manager.expect_create_env().never();
        cleanup_ok(&mut manager);
        let ctx = context(store.clone(), Arc::new(manager), source);

        assert!(reconcile(&ctx, &store).await.is_err());
        assert_eq!(status(&store).state, State::Preparing);

        reconcile(&ctx, &store).await.unwrap();
        let status = status(&store);
        assert_eq!(status.result, RunResult::ErrorInfra);
        assert_eq!(status.state, State::Finished);
    }

    #[tokio::test]
    async fn deletion_cleans_up_and_releases() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Running);
        });
        Repository::delete(store.as_ref(), NAMESPACE, NAME).await.unwrap();
        let mut manager = MockRunManager::new();
        manager.expect_delete_run().times(1).returning(|_| Ok(()));
        manager.expect_delete_env().times(1).returning(|_| Ok(()));
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        reconcile(&ctx, &store).await.unwrap();

        assert!(store.stored(NAMESPACE, NAME).is_none());
        assert!(store
            .calls()
            .iter()
            .any(|call| call == &format!("update_status {NAMESPACE}/{NAME}")));
    }

    #[tokio::test]
    async fn failed_deletion_cleanup_keeps_finalizer() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Waiting);
        });
        Repository::delete(store.as_ref(), NAMESPACE, NAME).await.unwrap();
        let mut manager = MockRunManager::new();
        manager
            .expect_delete_run()
            .returning(|_| Err(errors::recoverable(anyhow!("api unavailable"))));
        let ctx = context(store.clone(), Arc::new(manager), no_config());

        assert!(reconcile(&ctx, &store).await.is_err());
        let run = stored(&store);
        assert!(run.metadata.deletion_timestamp.is_some());
        assert!(!run.finalizers().is_empty());
        assert_eq!(run.status.unwrap().result, RunResult::Undefined);
    }

    #[tokio::test]
    async fn finished_run_is_skipped() {
        let store = store_with(|run| with_state(run, State::Finished));
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());

        let action = reconcile(&ctx, &store).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(store.calls(), vec![format!("get {NAMESPACE}/{NAME}")]);
    }

    #[tokio::test]
    async fn finished_run_drops_leftover_finalizer() {
        let store = store_with(|run| {
            with_finalizer(run);
            with_state(run, State::Finished);
        });
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());

        reconcile(&ctx, &store).await.unwrap();
        assert!(stored(&store).finalizers().is_empty());
    }

    #[tokio::test]
    async fn status_conflicts_are_replayed() {
        let store = store_with(|_| {});
        store.fail_next_update_status(crate::errors::k8s::conflict("pipelineruns", NAME));
        let mut manager = MockRunManager::new();
        manager
            .expect_create_env()
            .returning(|_, _| Ok(("run-ns".to_string(), None)));
        manager.expect_create_run().returning(|_, _| Ok(()));
        manager.expect_get_run().returning(|_| Ok(None));
        let ctx = context(store.clone(), Arc::new(manager), default_config());

        reconcile(&ctx, &store).await.unwrap();
        assert_eq!(status(&store).state, State::Waiting);
    }

    #[tokio::test]
    async fn gone_run_is_ignored() {
        let store: Arc<InMemoryRepository<PipelineRun>> = Arc::new(InMemoryRepository::new());
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());
        let observed = pipeline_run(NAMESPACE, NAME);

        let action = reconcile_pipeline_run(Arc::new(observed), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let store = store_with(|_| {});
        store.fail_next_get(api_error(500, "InternalError", "etcd down"));
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());

        let err = reconcile(&ctx, &store).await.unwrap_err();
        assert!(matches!(err, Error::KubeError(_)));
    }

    #[test]
    fn error_policy_backs_off_per_key() {
        let store = store_with(|_| {});
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());
        let run = Arc::new(pipeline_run(NAMESPACE, NAME));
        let err = Error::Reconcile(anyhow!("boom"));

        assert_eq!(
            error_policy(run.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        assert_eq!(
            error_policy(run.clone(), &err, ctx.clone()),
            Action::requeue(Duration::from_secs(10))
        );
        let other = Arc::new(pipeline_run(NAMESPACE, "run-2"));
        assert_eq!(
            error_policy(other, &err, ctx.clone()),
            Action::requeue(Duration::from_secs(5))
        );
        let count = ctx.failures.get(&format!("{NAMESPACE}/{NAME}")).map(|c| *c);
        assert_eq!(count, Some(2));
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let store = store_with(|run| with_state(run, State::Finished));
        let ctx = context(store.clone(), Arc::new(MockRunManager::new()), no_config());
        ctx.failures.insert(format!("{NAMESPACE}/{NAME}"), 3);

        reconcile(&ctx, &store).await.unwrap();
        assert!(ctx.failures.is_empty());
    }
}
