//! Plugin configuration for pod construction.
//!
//! The configuration is installed once at process start and read by every
//! reconciler thereafter; reads are lock-free after installation.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::api::core::v1::PodDNSConfig;
use k8s_openapi::api::core::v1::PodSecurityContext;
use k8s_openapi::api::core::v1::SecurityContext;
use k8s_openapi::api::core::v1::Toleration;
use serde::Deserialize;

/// The process-wide plugin configuration.
static CONFIG: OnceLock<PluginConfig> = OnceLock::new();

/// The default GPU resource name.
const DEFAULT_GPU_RESOURCE_NAME: &str = "nvidia.com/gpu";

/// The default node label carrying the GPU device of a node.
const DEFAULT_GPU_DEVICE_NODE_LABEL: &str = "gpu-device";

/// The default node label carrying the GPU partition size of a node.
const DEFAULT_GPU_PARTITION_SIZE_NODE_LABEL: &str = "gpu-partition-size";

/// The default grace period for container runtime errors during
/// initialization.
const DEFAULT_CONTAINER_ERROR_GRACE_PERIOD: Duration = Duration::from_secs(3 * 60);

/// Configuration for the copilot containers injected for data loading.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CopilotConfig {
    /// The name prefix for injected copilot containers.
    ///
    /// Defaults to `copilot-`.
    pub name_prefix: String,
    /// The container image to use for copilot containers.
    pub image: String,
    /// The directory inputs are downloaded to when the task does not specify
    /// one.
    ///
    /// Defaults to `/var/task/inputs`.
    pub default_input_path: String,
    /// The directory outputs are collected from when the task does not
    /// specify one.
    ///
    /// Defaults to `/var/task/outputs`.
    pub default_output_path: String,
    /// The CPU request for copilot containers.
    ///
    /// Defaults to `500m`.
    pub cpu: String,
    /// The memory request for copilot containers.
    ///
    /// Defaults to `128Mi`.
    pub memory: String,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            name_prefix: "copilot-".to_string(),
            image: "gantry-copilot:latest".to_string(),
            default_input_path: "/var/task/inputs".to_string(),
            default_output_path: "/var/task/outputs".to_string(),
            cpu: "500m".to_string(),
            memory: "128Mi".to_string(),
        }
    }
}

/// The plugin configuration consumed during pod construction and lifecycle
/// interpretation.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PluginConfig {
    /// The node selector unioned into every pod.
    pub default_node_selector: BTreeMap<String, String>,
    /// The affinity applied to pods that do not specify their own.
    pub default_affinity: Option<Affinity>,
    /// The pod security context applied to pods that do not specify their
    /// own.
    pub default_pod_security_context: Option<PodSecurityContext>,
    /// The security context applied to primary containers that do not specify
    /// their own.
    pub default_security_context: Option<SecurityContext>,
    /// The DNS configuration applied to pods that do not specify their own.
    pub default_pod_dns_config: Option<PodDNSConfig>,
    /// The scheduler assigned to pods that do not specify their own.
    pub scheduler_name: Option<String>,
    /// Whether host networking is forced on or off for constructed pods.
    ///
    /// If `None`, the pod spec is left untouched.
    pub enable_host_networking_pod: Option<bool>,
    /// The name of the pod template used as the base for every pod that does
    /// not name its own template.
    pub default_pod_template_name: Option<String>,
    /// The node selector unioned into interruptible pods.
    pub interruptible_node_selector: BTreeMap<String, String>,
    /// The node selector requirement added to interruptible pods.
    pub interruptible_node_selector_requirement: Option<NodeSelectorRequirement>,
    /// The node selector requirement added to non-interruptible pods.
    pub non_interruptible_node_selector_requirement: Option<NodeSelectorRequirement>,
    /// Tolerations added to interruptible pods.
    pub interruptible_tolerations: Vec<Toleration>,
    /// Tolerations added to every pod.
    pub default_tolerations: Vec<Toleration>,
    /// Tolerations added to pods that request the given resource.
    pub resource_tolerations: HashMap<String, Vec<Toleration>>,
    /// The name of the extended resource representing GPUs.
    ///
    /// Defaults to `nvidia.com/gpu`.
    pub gpu_resource_name: String,
    /// The node label carrying the GPU device of a node.
    ///
    /// Defaults to `gpu-device`.
    pub gpu_device_node_label: String,
    /// The node label carrying the GPU partition size of a node.
    ///
    /// Defaults to `gpu-partition-size`.
    pub gpu_partition_size_node_label: String,
    /// The node selector requirement added for tasks requiring an
    /// unpartitioned GPU.
    ///
    /// If `None`, a `DoesNotExist` requirement on the partition size label is
    /// used.
    pub gpu_unpartitioned_node_selector_requirement: Option<NodeSelectorRequirement>,
    /// The toleration added for tasks requiring an unpartitioned GPU.
    pub gpu_unpartitioned_toleration: Option<Toleration>,
    /// Extended resources for which a toleration is added when any container
    /// requests them.
    pub add_tolerations_for_extended_resources: Vec<String>,
    /// How long a pod may remain pending before the task is failed.
    ///
    /// A zero duration disables the timeout.
    #[serde(with = "humantime_serde")]
    pub pod_pending_timeout: Duration,
    /// The grace period before a `CreateContainerError` fails the task.
    ///
    /// Defaults to 3 minutes.
    #[serde(with = "humantime_serde")]
    pub create_container_error_grace_period: Duration,
    /// The grace period before a `CreateContainerConfigError` fails the task.
    ///
    /// Defaults to 3 minutes.
    #[serde(with = "humantime_serde")]
    pub create_container_config_error_grace_period: Duration,
    /// The grace period before an `ImagePullBackOff` fails the task.
    ///
    /// Defaults to 3 minutes.
    #[serde(with = "humantime_serde")]
    pub image_pull_backoff_grace_period: Duration,
    /// The configuration for injected copilot containers.
    pub copilot: CopilotConfig,
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            default_node_selector: BTreeMap::new(),
            default_affinity: None,
            default_pod_security_context: None,
            default_security_context: None,
            default_pod_dns_config: None,
            scheduler_name: None,
            enable_host_networking_pod: None,
            default_pod_template_name: None,
            interruptible_node_selector: BTreeMap::new(),
            interruptible_node_selector_requirement: None,
            non_interruptible_node_selector_requirement: None,
            interruptible_tolerations: Vec::new(),
            default_tolerations: Vec::new(),
            resource_tolerations: HashMap::new(),
            gpu_resource_name: DEFAULT_GPU_RESOURCE_NAME.to_string(),
            gpu_device_node_label: DEFAULT_GPU_DEVICE_NODE_LABEL.to_string(),
            gpu_partition_size_node_label: DEFAULT_GPU_PARTITION_SIZE_NODE_LABEL.to_string(),
            gpu_unpartitioned_node_selector_requirement: None,
            gpu_unpartitioned_toleration: None,
            add_tolerations_for_extended_resources: Vec::new(),
            pod_pending_timeout: Duration::ZERO,
            create_container_error_grace_period: DEFAULT_CONTAINER_ERROR_GRACE_PERIOD,
            create_container_config_error_grace_period: DEFAULT_CONTAINER_ERROR_GRACE_PERIOD,
            image_pull_backoff_grace_period: DEFAULT_CONTAINER_ERROR_GRACE_PERIOD,
            copilot: CopilotConfig::default(),
        }
    }
}

impl PluginConfig {
    /// Installs the process-wide configuration.
    ///
    /// Returns the given configuration back if a configuration was already
    /// installed.
    pub fn install(config: PluginConfig) -> Result<(), PluginConfig> {
        CONFIG.set(config)
    }

    /// Gets the process-wide configuration.
    ///
    /// Returns the default configuration if none was installed.
    pub fn get() -> &'static PluginConfig {
        CONFIG.get_or_init(PluginConfig::default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PluginConfig::default();
        assert_eq!(config.gpu_resource_name, "nvidia.com/gpu");
        assert_eq!(config.pod_pending_timeout, Duration::ZERO);
        assert_eq!(
            config.image_pull_backoff_grace_period,
            Duration::from_secs(180)
        );
        assert!(config.default_pod_template_name.is_none());
    }

    #[test]
    fn deserializes_durations() {
        let config: PluginConfig = serde_json::from_str(
            r#"{
                "pod_pending_timeout": "15m",
                "image_pull_backoff_grace_period": "90s",
                "gpu_resource_name": "amd.com/gpu"
            }"#,
        )
        .unwrap();

        assert_eq!(config.pod_pending_timeout, Duration::from_secs(900));
        assert_eq!(config.image_pull_backoff_grace_period, Duration::from_secs(90));
        assert_eq!(config.gpu_resource_name, "amd.com/gpu");
    }
}
