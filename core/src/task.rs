//! Task definitions submitted for execution.

use std::collections::BTreeMap;
use std::collections::HashMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

/// The task configuration key naming the container whose lifecycle determines
/// the task outcome.
pub const PRIMARY_CONTAINER_KEY: &str = "primary_container_name";

/// Represents the execution target of a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskTarget {
    /// The task runs a single user container.
    Container(ContainerSpec),
    /// The task supplies a complete pod spec of its own.
    PodSpec(EmbeddedPodSpec),
}

/// A single-container task target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// The name of the container.
    pub name: String,
    /// The container image to run.
    pub image: String,
    /// The entrypoint of the container.
    #[serde(default)]
    pub command: Vec<String>,
    /// The arguments to the entrypoint.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables for the container.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// The resources requested by the container.
    ///
    /// Resources are merged with platform defaults during construction.
    #[serde(default)]
    pub resources: Option<ResourceRequirements>,
    /// The working directory of the container.
    #[serde(default)]
    pub working_dir: Option<String>,
}

/// A task target carrying a complete embedded pod specification.
///
/// The pod spec is kept as an unparsed document; it is deserialized during raw
/// pod construction so that malformed specs surface as task specification
/// errors rather than submission-time failures.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddedPodSpec {
    /// The pod spec document.
    #[serde(default)]
    pub pod_spec: Option<Value>,
    /// Annotations to copy onto the pod metadata.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Labels to copy onto the pod metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// An inline pod template supplied as a per-execution override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodTemplateOverride {
    /// The pod spec document of the override.
    #[serde(default)]
    pub pod_spec: Option<Value>,
    /// The name of the primary container within the override.
    pub primary_container_name: String,
    /// Annotations to merge onto the pod metadata.
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Labels to merge onto the pod metadata.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// The requested partition scheme of a GPU accelerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuPartition {
    /// The task requires an unpartitioned device.
    Unpartitioned,
    /// The task requires a specific partition size (e.g. `1g.5gb`).
    Size(String),
}

/// GPU accelerator requirements of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GpuAccelerator {
    /// The accelerator device (e.g. `nvidia-tesla-a100`).
    #[serde(default)]
    pub device: Option<String>,
    /// The requested partition scheme.
    #[serde(default)]
    pub partition: Option<GpuPartition>,
}

/// A shared memory volume requested by a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedMemory {
    /// The name of the volume and its mount.
    pub mount_name: String,
    /// The path the volume is mounted at within the primary container.
    pub mount_path: String,
    /// The size limit of the volume, as a Kubernetes quantity.
    ///
    /// If `None`, the volume is unbounded.
    #[serde(default)]
    pub size_limit: Option<String>,
}

/// Extended (non-CPU/non-memory) resource requirements of a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtendedResources {
    /// The GPU accelerator requirements.
    #[serde(default)]
    pub gpu_accelerator: Option<GpuAccelerator>,
    /// The shared memory volume requirements.
    #[serde(default)]
    pub shared_memory: Option<SharedMemory>,
}

/// The data loading configuration of a task.
///
/// When present, a copilot sidecar and init container are injected to stage
/// inputs before the user container starts and to collect outputs after it
/// finishes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataLoadingConfig {
    /// Whether data loading is enabled for the task.
    pub enabled: bool,
    /// The directory inputs are downloaded to.
    ///
    /// Defaults to the configured input path.
    #[serde(default)]
    pub input_path: Option<String>,
    /// The directory outputs are collected from.
    ///
    /// Defaults to the configured output path.
    #[serde(default)]
    pub output_path: Option<String>,
}

/// An immutable description of what the user asked to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    /// The execution target.
    pub target: TaskTarget,
    /// Free-form task configuration.
    ///
    /// The [`PRIMARY_CONTAINER_KEY`] entry names the container whose lifecycle
    /// defines the task outcome; it is required for pod spec targets.
    #[serde(default)]
    pub config: HashMap<String, String>,
    /// The extended resource requirements of the task.
    #[serde(default)]
    pub extended_resources: Option<ExtendedResources>,
    /// The data loading configuration of the task.
    #[serde(default)]
    pub data_config: Option<DataLoadingConfig>,
    /// The name of the pod template to construct the pod from.
    ///
    /// If `None`, the configured default pod template (if any) is used.
    #[serde(default)]
    pub pod_template_name: Option<String>,
}

impl TaskDefinition {
    /// Gets the primary container name from the task configuration.
    pub fn primary_container_name(&self) -> Option<&str> {
        self.config.get(PRIMARY_CONTAINER_KEY).map(String::as_str)
    }
}
