//! Execution context supplied by the surrounding task reconciler.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::Result;
use crate::task::ExtendedResources;
use crate::task::PodTemplateOverride;
use crate::task::TaskDefinition;

/// Per-execution overrides supplied by the platform.
#[derive(Debug, Clone, Default)]
pub struct TaskOverrides {
    /// Resource requirements overriding those of the task definition.
    pub resources: Option<ResourceRequirements>,
    /// Extended resources overriding those of the task definition.
    ///
    /// Overrides replace whole sub-objects rather than merging into them.
    pub extended_resources: Option<ExtendedResources>,
    /// An image replacing that of the primary container.
    pub container_image: Option<String>,
    /// An inline pod template replacing the constructed pod spec.
    pub pod_template: Option<PodTemplateOverride>,
}

/// Platform-wide resource defaults and ceilings.
#[derive(Debug, Clone, Default)]
pub struct PlatformResources {
    /// Requests applied when a container does not specify its own.
    pub defaults: BTreeMap<String, Quantity>,
    /// Upper bounds that container requests and limits are clamped to.
    pub limits: BTreeMap<String, Quantity>,
}

/// Reads the task definition for the current execution.
pub trait TaskReader {
    /// Reads the task definition.
    fn read(&self) -> Result<TaskDefinition>;
}

/// Locations where task inputs are staged.
pub trait InputReader {
    /// Gets the path prefix inputs are downloaded from.
    fn input_prefix(&self) -> &str;

    /// Gets the path to the inputs document for the execution.
    fn input_path(&self) -> &str;
}

/// Locations where task outputs are written.
pub trait OutputWriter {
    /// Gets the path prefix outputs are uploaded to.
    fn output_prefix(&self) -> &str;

    /// Gets the path prefix raw output data is uploaded to.
    fn raw_output_prefix(&self) -> &str;
}

/// Metadata about the current task execution.
pub trait TaskExecutionMetadata {
    /// Gets the unique identifier of the task execution.
    fn execution_id(&self) -> &str;

    /// Gets the namespace the pod will be created in.
    fn namespace(&self) -> &str;

    /// Gets the labels to apply to the pod.
    fn labels(&self) -> &BTreeMap<String, String>;

    /// Gets the annotations to apply to the pod.
    fn annotations(&self) -> &BTreeMap<String, String>;

    /// Gets the service account the pod runs as when the pod spec does not
    /// name one.
    fn service_account(&self) -> &str;

    /// Determines whether the task may run on preemptible nodes.
    fn is_interruptible(&self) -> bool;

    /// Gets the per-execution overrides.
    fn overrides(&self) -> &TaskOverrides;

    /// Gets the platform resource defaults and ceilings.
    fn platform_resources(&self) -> &PlatformResources;
}

/// The full execution context handed to pod construction.
pub trait TaskExecutionContext {
    /// Gets the task reader for the execution.
    fn task_reader(&self) -> &dyn TaskReader;

    /// Gets the input reader for the execution.
    fn input_reader(&self) -> &dyn InputReader;

    /// Gets the output writer for the execution.
    fn output_writer(&self) -> &dyn OutputWriter;

    /// Gets the metadata for the execution.
    fn metadata(&self) -> &dyn TaskExecutionMetadata;
}
