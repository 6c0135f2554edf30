//! Controller Configuration
//!
//! Two layers of configuration:
//!
//! - [`ControllerConfig`]: process level settings loaded once at startup from the
//!   mounted `config.yaml` (worker count, names of well-known objects, feature
//!   switches).
//! - [`PipelineRunsConfig`]: operator settings for pipeline executions, read from
//!   ConfigMaps in the system namespace on every reconcile so edits take effect
//!   without a restart.

use super::repository::Repository;
use crate::errors::{self, k8s};
use anyhow::Context as _;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Namespace holding the controller's own ConfigMaps
    pub system_namespace: String,

    /// Restrict the watch to one namespace; all namespaces when unset
    pub watch_namespace: Option<String>,

    /// Number of concurrent reconcile workers
    pub workers: u16,

    /// Poll interval while a run is waiting or running
    pub requeue_seconds: u64,

    /// Error policy backoff
    pub backoff: BackoffConfig,

    /// Names of the ConfigMaps carrying the `PipelineRunsConfig`
    pub config_maps: ConfigMapNames,

    /// Execution engine settings
    pub run: RunSettings,

    /// Feature switches, fixed for the lifetime of the process
    pub features: FeatureConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct BackoffConfig {
    pub base_seconds: u64,
    pub max_seconds: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_seconds: 5,
            max_seconds: 300,
        }
    }
}

impl BackoffConfig {
    /// Delay before the next attempt after `failures` consecutive failures
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let secs = self.base_seconds.saturating_mul(1_u64 << exponent);
        Duration::from_secs(secs.min(self.max_seconds))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigMapNames {
    pub pipeline_runs: String,
    pub network_policies: String,
}

impl Default for ConfigMapNames {
    fn default() -> Self {
        Self {
            pipeline_runs: "pipelineruns-config".to_string(),
            network_policies: "pipelineruns-network-policies".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RunSettings {
    /// Name of the Tekton task executing pipelines
    pub task_name: String,
    /// Namespace the task is resolved from
    pub task_namespace: String,
    /// Cluster role bound to the run service account
    pub cluster_role: String,
    /// Service account created in every run namespace
    pub service_account: String,
    /// Prefix of generated run namespaces
    pub namespace_prefix: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            task_name: "pipeline-runner".to_string(),
            task_namespace: "pipelinerun-system".to_string(),
            cluster_role: "pipelinerun-run".to_string(),
            service_account: "pipeline-runner".to_string(),
            namespace_prefix: "pipelinerun".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct FeatureConfig {
    /// Create an auxiliary namespace next to every run namespace
    pub create_aux_namespace: bool,
    /// Retry reconciles when the PipelineRunsConfig is invalid instead of failing the run
    pub retry_on_invalid_pipeline_runs_config: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            system_namespace: "pipelinerun-system".to_string(),
            watch_namespace: None,
            workers: 4,
            requeue_seconds: 10,
            backoff: BackoffConfig::default(),
            config_maps: ConfigMapNames::default(),
            run: RunSettings::default(),
            features: FeatureConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that configuration has required fields
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.workers == 0 {
            return Err(anyhow::anyhow!("workers must be at least 1"));
        }
        if self.system_namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("systemNamespace must not be empty"));
        }
        if self.run.task_name.trim().is_empty() || self.run.task_namespace.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "run.taskName and run.taskNamespace must both be set"
            ));
        }
        if self.run.namespace_prefix.trim().is_empty() {
            return Err(anyhow::anyhow!("run.namespacePrefix must not be empty"));
        }
        if self.backoff.base_seconds > self.backoff.max_seconds {
            return Err(anyhow::anyhow!(
                "backoff.baseSeconds must not exceed backoff.maxSeconds"
            ));
        }
        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        let config: ControllerConfig = serde_yaml::from_str(&config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))?;

        Ok(config)
    }
}

/// Pod security context applied to the execution pod
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodSecurityContextConfig {
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub fs_group: Option<i64>,
}

/// Operator supplied settings for pipeline executions
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRunsConfig {
    /// Execution timeout unless the PipelineRun overrides it
    pub timeout: Duration,
    /// How long a run may stay in `waiting` before it is failed
    pub timeout_wait: Duration,
    pub runner_image: Option<String>,
    pub runner_image_pull_policy: Option<String>,
    /// Profile applied when the PipelineRun does not choose one
    pub default_network_profile: Option<String>,
    /// Profile name to raw NetworkPolicy manifest
    pub network_profiles: BTreeMap<String, String>,
    pub limit_range: Option<String>,
    pub resource_quota: Option<String>,
    pub pod_security_context: PodSecurityContextConfig,
}

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_TIMEOUT_WAIT: Duration = Duration::from_secs(10 * 60);

/// Key of the network policies ConfigMap naming the default profile
pub const NETWORK_DEFAULT_KEY: &str = "_default";

const KEY_TIMEOUT: &str = "timeout";
const KEY_TIMEOUT_WAIT: &str = "waitTimeout";
const KEY_RUNNER_IMAGE: &str = "runner.image";
const KEY_RUNNER_IMAGE_PULL_POLICY: &str = "runner.imagePullPolicy";
const KEY_RUN_AS_USER: &str = "runner.podSecurityContext.runAsUser";
const KEY_RUN_AS_GROUP: &str = "runner.podSecurityContext.runAsGroup";
const KEY_FS_GROUP: &str = "runner.podSecurityContext.fsGroup";
const KEY_LIMIT_RANGE: &str = "limitRange";
const KEY_RESOURCE_QUOTA: &str = "resourceQuota";

impl Default for PipelineRunsConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            timeout_wait: DEFAULT_TIMEOUT_WAIT,
            runner_image: None,
            runner_image_pull_policy: None,
            default_network_profile: None,
            network_profiles: BTreeMap::new(),
            limit_range: None,
            resource_quota: None,
            pod_security_context: PodSecurityContextConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigLoadError {
    #[error("invalid value {value:?} for key {key:?}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: String,
    },

    #[error("default network profile {0:?} has no manifest")]
    UnknownDefaultNetworkProfile(String),
}

fn non_empty(data: &BTreeMap<String, String>, key: &str) -> Option<String> {
    data.get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn parse_duration_key(
    data: &BTreeMap<String, String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    match non_empty(data, key) {
        Some(raw) => parse_duration(&raw).map_err(|reason| ConfigLoadError::InvalidValue {
            key: key.to_string(),
            value: raw,
            reason,
        }),
        None => Ok(default),
    }
}

fn parse_int_key(
    data: &BTreeMap<String, String>,
    key: &str,
) -> Result<Option<i64>, ConfigLoadError> {
    non_empty(data, key)
        .map(|raw| {
            raw.parse::<i64>().map_err(|e| ConfigLoadError::InvalidValue {
                key: key.to_string(),
                value: raw.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}

impl PipelineRunsConfig {
    /// Builds the configuration from the data of the two ConfigMaps.
    /// Missing ConfigMaps yield defaults.
    pub fn from_data(
        main: Option<&BTreeMap<String, String>>,
        network: Option<&BTreeMap<String, String>>,
    ) -> Result<Self, ConfigLoadError> {
        let empty = BTreeMap::new();
        let main = main.unwrap_or(&empty);
        let network = network.unwrap_or(&empty);

        let default_network_profile = non_empty(network, NETWORK_DEFAULT_KEY);
        let network_profiles: BTreeMap<String, String> = network
            .iter()
            .filter(|(key, _)| key.as_str() != NETWORK_DEFAULT_KEY)
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        if let Some(name) = &default_network_profile {
            if !network_profiles.contains_key(name) {
                return Err(ConfigLoadError::UnknownDefaultNetworkProfile(name.clone()));
            }
        }

        Ok(Self {
            timeout: parse_duration_key(main, KEY_TIMEOUT, DEFAULT_TIMEOUT)?,
            timeout_wait: parse_duration_key(main, KEY_TIMEOUT_WAIT, DEFAULT_TIMEOUT_WAIT)?,
            runner_image: non_empty(main, KEY_RUNNER_IMAGE),
            runner_image_pull_policy: non_empty(main, KEY_RUNNER_IMAGE_PULL_POLICY),
            default_network_profile,
            network_profiles,
            limit_range: non_empty(main, KEY_LIMIT_RANGE),
            resource_quota: non_empty(main, KEY_RESOURCE_QUOTA),
            pod_security_context: PodSecurityContextConfig {
                run_as_user: parse_int_key(main, KEY_RUN_AS_USER)?,
                run_as_group: parse_int_key(main, KEY_RUN_AS_GROUP)?,
                fs_group: parse_int_key(main, KEY_FS_GROUP)?,
            },
        })
    }
}

/// Source of the current `PipelineRunsConfig`
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PipelineRunsConfigSource: Send + Sync {
    /// Loads the configuration.
    ///
    /// Failures reading from the cluster are recoverable. Invalid content is
    /// recoverable only when the controller is configured to retry on it.
    async fn load(&self) -> anyhow::Result<PipelineRunsConfig>;
}

/// Reads the `PipelineRunsConfig` from ConfigMaps in the system namespace
pub struct ConfigMapSource {
    configmaps: Arc<dyn Repository<ConfigMap>>,
    namespace: String,
    names: ConfigMapNames,
    retry_on_invalid: bool,
}

impl ConfigMapSource {
    pub fn new(configmaps: Arc<dyn Repository<ConfigMap>>, config: &ControllerConfig) -> Self {
        Self {
            configmaps,
            namespace: config.system_namespace.clone(),
            names: config.config_maps.clone(),
            retry_on_invalid: config.features.retry_on_invalid_pipeline_runs_config,
        }
    }

    async fn data(&self, name: &str) -> anyhow::Result<Option<BTreeMap<String, String>>> {
        match self.configmaps.get(&self.namespace, name).await {
            Ok(cm) => Ok(Some(cm.data.unwrap_or_default())),
            Err(e) if k8s::is_not_found(&e) => {
                debug!(
                    configmap = %name,
                    namespace = %self.namespace,
                    "ConfigMap not found, using defaults"
                );
                Ok(None)
            }
            Err(e) => Err(errors::recoverable(e)).with_context(|| {
                format!("failed to load ConfigMap {}/{}", self.namespace, name)
            }),
        }
    }
}

#[async_trait]
impl PipelineRunsConfigSource for ConfigMapSource {
    async fn load(&self) -> anyhow::Result<PipelineRunsConfig> {
        let main = self.data(&self.names.pipeline_runs).await?;
        let network = self.data(&self.names.network_policies).await?;

        PipelineRunsConfig::from_data(main.as_ref(), network.as_ref())
            .map_err(|e| errors::recoverable_if(e, self.retry_on_invalid))
            .context("invalid pipeline runs configuration")
    }
}

/// Parses a Go style duration such as `1h30m`, `15m`, `90s` or `500ms`
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw == "0" {
        return Ok(Duration::ZERO);
    }
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }

    let mut total = Duration::ZERO;
    let mut rest = raw;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| format!("missing unit in duration {raw:?}"))?;
        if digits == 0 {
            return Err(format!("invalid duration {raw:?}"));
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|e| format!("invalid duration {raw:?}: {e}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let part = match &rest[..unit_len] {
            "h" => Duration::from_secs(value * 3600),
            "m" => Duration::from_secs(value * 60),
            "s" => Duration::from_secs(value),
            "ms" => Duration::from_millis(value),
            unit => return Err(format!("unknown unit {unit:?} in duration {raw:?}")),
        };
        total += part;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Formats a duration the way Go's `time.Duration` prints whole seconds
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    if total == 0 {
        return format!("{}ms", duration.subsec_millis());
    }
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
