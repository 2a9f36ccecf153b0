//! Pod construction from task definitions.
//!
//! Construction is a pipeline: the task target produces a raw pod, the raw
//! pod is customized against platform policy (resources, copilot, defaults),
//! merged with its base pod template, and finally adjusted for extended
//! resources. Every stage operates on values owned by the pipeline; the
//! execution context is never mutated.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::Error;
use gantry_core::Result;
use gantry_core::context::TaskExecutionContext;
use gantry_core::context::TaskExecutionMetadata;
use gantry_core::task::ContainerSpec;
use gantry_core::task::PodTemplateOverride;
use gantry_core::task::TaskDefinition;
use gantry_core::task::TaskTarget;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EnvVar;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PodTemplate;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::Value;
use tracing::debug;

use crate::config::PluginConfig;
use crate::copilot::add_copilot_to_container;
use crate::copilot::add_copilot_to_pod;
use crate::extended::add_tolerations_for_extended_resources;
use crate::extended::apply_container_image_override;
use crate::extended::apply_extended_resources_overrides;
use crate::extended::apply_shared_memory;
use crate::merge::merge_base_pod_spec_onto_template;
use crate::merge::merge_map_into;
use crate::merge::merge_object_meta_onto_template;
use crate::placement::apply_gpu_node_selectors;
use crate::placement::apply_interruptible_node_affinity;
use crate::placement::pod_tolerations;
use crate::resources::ResourceCustomizationMode;
use crate::resources::customize_container_resources;
use crate::resources::extract_container_resources_from_pod_template;
use crate::store::PodTemplateStore;

/// Builds a container from a single-container task target.
fn build_raw_container(spec: &ContainerSpec) -> Container {
    Container {
        name: spec.name.clone(),
        image: Some(spec.image.clone()),
        command: (!spec.command.is_empty()).then(|| spec.command.clone()),
        args: (!spec.args.is_empty()).then(|| spec.args.clone()),
        env: (!spec.env.is_empty()).then(|| {
            spec.env
                .iter()
                .map(|(name, value)| EnvVar {
                    name: name.clone(),
                    value: Some(value.clone()),
                    ..Default::default()
                })
                .collect()
        }),
        resources: spec.resources.clone(),
        working_dir: spec.working_dir.clone(),
        ..Default::default()
    }
}

/// Replaces the constructed pod spec with an inline pod template override.
fn apply_pod_template_override(
    mut object_meta: ObjectMeta,
    overlay: &PodTemplateOverride,
    pod_spec: &Value,
) -> Result<(PodSpec, ObjectMeta)> {
    merge_map_into(&overlay.annotations, object_meta.annotations.get_or_insert_default());
    merge_map_into(&overlay.labels, object_meta.labels.get_or_insert_default());

    let pod_spec = serde_json::from_value(pod_spec.clone())
        .map_err(|e| Error::bad_task_spec(format!("unable to parse pod template override: {e}")))?;

    Ok((pod_spec, object_meta))
}

/// Constructs a pod spec, object metadata, and primary container name from
/// the task definition alone.
///
/// The result does not yet carry any platform configuration.
pub fn build_raw_pod(ctx: &dyn TaskExecutionContext) -> Result<(PodSpec, ObjectMeta, String)> {
    let task = ctx.task_reader().read()?;

    let mut object_meta = ObjectMeta {
        annotations: Some(BTreeMap::new()),
        labels: Some(BTreeMap::new()),
        ..Default::default()
    };

    let (mut pod_spec, mut primary_container_name) = match &task.target {
        TaskTarget::Container(spec) => {
            let container = build_raw_container(spec);
            (
                PodSpec {
                    containers: vec![container],
                    ..Default::default()
                },
                spec.name.clone(),
            )
        }
        TaskTarget::PodSpec(embedded) => {
            let Some(value) = &embedded.pod_spec else {
                return Err(Error::bad_task_spec(
                    "pod spec tasks must supply an embedded pod spec",
                ));
            };

            let pod_spec: PodSpec = serde_json::from_value(value.clone()).map_err(|e| {
                Error::bad_task_spec(format!("unable to parse embedded pod spec: {e}"))
            })?;

            let primary = task
                .primary_container_name()
                .ok_or_else(|| {
                    Error::bad_task_spec(
                        "task configuration is missing the `primary_container_name` key",
                    )
                })?
                .to_string();

            merge_map_into(
                &embedded.annotations,
                object_meta.annotations.get_or_insert_default(),
            );
            merge_map_into(&embedded.labels, object_meta.labels.get_or_insert_default());

            (pod_spec, primary)
        }
    };

    // An inline pod template override replaces the constructed spec outright
    // and takes its own primary container name.
    if let Some(overlay) = &ctx.metadata().overrides().pod_template {
        if let Some(overlay_spec) = &overlay.pod_spec {
            let (spec, meta) = apply_pod_template_override(object_meta, overlay, overlay_spec)?;
            pod_spec = spec;
            object_meta = meta;
            primary_container_name = overlay.primary_container_name.clone();
        }
    }

    Ok((pod_spec, object_meta, primary_container_name))
}

/// Retrieves the base pod template for the task.
///
/// A template named by the task must exist; the configured default template
/// is used otherwise and may be absent.
fn base_pod_template(
    task: &TaskDefinition,
    metadata: &dyn TaskExecutionMetadata,
    templates: &PodTemplateStore,
    config: &PluginConfig,
) -> Result<Option<Arc<PodTemplate>>> {
    if let Some(name) = task.pod_template_name.as_deref().filter(|n| !n.is_empty()) {
        return templates
            .load_or_default(metadata.namespace(), name)
            .map(Some)
            .ok_or_else(|| Error::TemplateNotFound(name.to_string()));
    }

    Ok(config
        .default_pod_template_name
        .as_deref()
        .filter(|n| !n.is_empty())
        .and_then(|name| templates.load_or_default(metadata.namespace(), name)))
}

/// Applies pod-level platform defaults to the constructed pod spec.
///
/// Tolerations derived from interruptibility and requested resource kinds are
/// prepended; the restart policy, service account, scheduler, affinity,
/// security context, DNS configuration, and host networking are defaulted
/// when the pod does not specify them; node selectors are unioned with the
/// configured defaults.
pub fn update_pod(
    metadata: &dyn TaskExecutionMetadata,
    resource_requirements: &[ResourceRequirements],
    pod_spec: &mut PodSpec,
    config: &PluginConfig,
) {
    if pod_spec.restart_policy.is_none() {
        pod_spec.restart_policy = Some("Never".to_string());
    }

    let mut tolerations = pod_tolerations(metadata.is_interruptible(), resource_requirements, config);
    tolerations.extend(pod_spec.tolerations.take().into_iter().flatten());
    if !tolerations.is_empty() {
        pod_spec.tolerations = Some(tolerations);
    }

    if pod_spec
        .service_account_name
        .as_deref()
        .unwrap_or_default()
        .is_empty()
    {
        let service_account = metadata.service_account();
        if !service_account.is_empty() {
            pod_spec.service_account_name = Some(service_account.to_string());
        }
    }

    if pod_spec.scheduler_name.as_deref().unwrap_or_default().is_empty() {
        if let Some(scheduler) = config.scheduler_name.as_deref().filter(|s| !s.is_empty()) {
            pod_spec.scheduler_name = Some(scheduler.to_string());
        }
    }

    let mut node_selector = config.default_node_selector.clone();
    if let Some(existing) = pod_spec.node_selector.take() {
        merge_map_into(&existing, &mut node_selector);
    }
    if metadata.is_interruptible() {
        merge_map_into(&config.interruptible_node_selector, &mut node_selector);
    }
    if !node_selector.is_empty() {
        pod_spec.node_selector = Some(node_selector);
    }

    if pod_spec.affinity.is_none() {
        pod_spec.affinity = config.default_affinity.clone();
    }

    if pod_spec.security_context.is_none() {
        pod_spec.security_context = config.default_pod_security_context.clone();
    }

    if let Some(host_network) = config.enable_host_networking_pod {
        pod_spec.host_network = Some(host_network);
    }

    if pod_spec.dns_config.is_none() {
        pod_spec.dns_config = config.default_pod_dns_config.clone();
    }

    apply_interruptible_node_affinity(metadata.is_interruptible(), pod_spec, config);
}

/// Applies the platform configuration to a raw pod.
///
/// This customizes container resources, injects the copilot containers,
/// applies pod-level defaults, merges the base pod template, and resolves
/// extended resources.
pub fn apply_platform_configuration(
    ctx: &dyn TaskExecutionContext,
    templates: &PodTemplateStore,
    config: &PluginConfig,
    mut pod_spec: PodSpec,
    mut object_meta: ObjectMeta,
    primary_container_name: &str,
) -> Result<(PodSpec, ObjectMeta)> {
    let task = ctx.task_reader().read()?;
    let metadata = ctx.metadata();

    // The base pod template is fetched early so that template-declared
    // resources can act as a floor during resource customization.
    let base_template = base_pod_template(&task, metadata, templates, config)?;

    if let Some(init_containers) = pod_spec.init_containers.as_mut() {
        for container in init_containers.iter_mut() {
            let template_resources = base_template.as_deref().and_then(|template| {
                extract_container_resources_from_pod_template(template, &container.name, true)
            });

            customize_container_resources(
                container,
                ResourceCustomizationMode::MergeExistingResources,
                metadata.platform_resources(),
                template_resources.as_ref(),
            )?;
        }
    }

    let mut resource_requirements = Vec::with_capacity(pod_spec.containers.len());
    let mut primary_found = false;
    for container in pod_spec.containers.iter_mut() {
        let mode = if container.name == primary_container_name {
            // Per-execution resource overrides replace what the primary
            // container asked for before platform policy is applied.
            if let Some(resources) = &metadata.overrides().resources {
                container.resources = Some(resources.clone());
            }

            primary_found = true;
            ResourceCustomizationMode::MergeExistingResources
        } else {
            ResourceCustomizationMode::EnsureExistingResourcesInRange
        };

        let template_resources = base_template.as_deref().and_then(|template| {
            extract_container_resources_from_pod_template(template, &container.name, false)
        });

        customize_container_resources(
            container,
            mode,
            metadata.platform_resources(),
            template_resources.as_ref(),
        )?;

        resource_requirements.push(container.resources.clone().unwrap_or_default());
    }

    if !primary_found {
        return Err(Error::bad_task_spec(format!(
            "primary container `{primary_container_name}` is not defined"
        )));
    }

    let mut primary_init_container_name = String::new();
    if let Some(data_config) = task.data_config.as_ref().filter(|d| d.enabled) {
        if let Some(primary) = pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == primary_container_name)
        {
            add_copilot_to_container(primary, data_config, &config.copilot);
        }

        primary_init_container_name = add_copilot_to_pod(
            &mut pod_spec,
            data_config,
            ctx.input_reader(),
            ctx.output_writer(),
            &config.copilot,
        );
    }

    update_pod(metadata, &resource_requirements, &mut pod_spec, config);

    if let Some(default) = &config.default_security_context {
        if let Some(primary) = pod_spec
            .containers
            .iter_mut()
            .find(|c| c.name == primary_container_name)
        {
            if primary.security_context.is_none() {
                primary.security_context = Some(default.clone());
            }
        }
    }

    if let Some(template) = base_template.as_deref() {
        if let Some(template_spec) = template.template.as_ref().and_then(|t| t.spec.as_ref()) {
            pod_spec = merge_base_pod_spec_onto_template(
                template_spec,
                &pod_spec,
                primary_container_name,
                &primary_init_container_name,
            );
        }

        if let Some(template_meta) = template.template.as_ref().and_then(|t| t.metadata.as_ref()) {
            object_meta = merge_object_meta_onto_template(template_meta, &object_meta);
        }
    }

    let extended = apply_extended_resources_overrides(
        task.extended_resources.as_ref(),
        metadata.overrides().extended_resources.as_ref(),
    );

    if let Some(accelerator) = &extended.gpu_accelerator {
        apply_gpu_node_selectors(&mut pod_spec, accelerator, config);
    }

    if let Some(shared_memory) = &extended.shared_memory {
        apply_shared_memory(&mut pod_spec, primary_container_name, shared_memory)?;
    }

    if let Some(image) = metadata
        .overrides()
        .container_image
        .as_deref()
        .filter(|i| !i.is_empty())
    {
        apply_container_image_override(&mut pod_spec, image, primary_container_name);
    }

    Ok((pod_spec, object_meta))
}

/// Constructs the fully assembled pod spec for a task execution.
///
/// Returns the pod spec, the object metadata to create the pod with, and the
/// name of the primary container.
pub fn build_pod_spec(
    ctx: &dyn TaskExecutionContext,
    templates: &PodTemplateStore,
    config: &PluginConfig,
) -> Result<(PodSpec, ObjectMeta, String)> {
    debug!(
        "constructing pod spec for task execution `{id}`",
        id = ctx.metadata().execution_id()
    );

    let (pod_spec, object_meta, primary_container_name) = build_raw_pod(ctx)?;

    let (mut pod_spec, object_meta) = apply_platform_configuration(
        ctx,
        templates,
        config,
        pod_spec,
        object_meta,
        &primary_container_name,
    )?;

    add_tolerations_for_extended_resources(&mut pod_spec, config);

    Ok((pod_spec, object_meta, primary_container_name))
}

/// Gets the container with the given name from the pod spec.
pub fn get_container<'a>(pod_spec: &'a PodSpec, name: &str) -> Result<&'a Container> {
    pod_spec
        .containers
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::bad_task_spec(format!("container `{name}` is not defined")))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gantry_core::context::InputReader;
    use gantry_core::context::OutputWriter;
    use gantry_core::context::PlatformResources;
    use gantry_core::context::TaskOverrides;
    use gantry_core::context::TaskReader;
    use gantry_core::task::EmbeddedPodSpec;
    use gantry_core::task::ExtendedResources;
    use gantry_core::task::GpuAccelerator;
    use gantry_core::task::GpuPartition;
    use gantry_core::task::PRIMARY_CONTAINER_KEY;
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use k8s_openapi::api::core::v1::Toleration;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
    use serde_json::json;

    use super::*;

    /// A fixed execution context for construction tests.
    struct TestContext {
        task: TaskDefinition,
        overrides: TaskOverrides,
        platform: PlatformResources,
        labels: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
        interruptible: bool,
    }

    impl TestContext {
        fn new(task: TaskDefinition) -> Self {
            Self {
                task,
                overrides: TaskOverrides::default(),
                platform: PlatformResources::default(),
                labels: BTreeMap::new(),
                annotations: BTreeMap::new(),
                interruptible: false,
            }
        }
    }

    impl TaskReader for TestContext {
        fn read(&self) -> Result<TaskDefinition> {
            Ok(self.task.clone())
        }
    }

    impl InputReader for TestContext {
        fn input_prefix(&self) -> &str {
            "s3://bucket/inputs"
        }

        fn input_path(&self) -> &str {
            "s3://bucket/inputs/inputs.json"
        }
    }

    impl OutputWriter for TestContext {
        fn output_prefix(&self) -> &str {
            "s3://bucket/outputs"
        }

        fn raw_output_prefix(&self) -> &str {
            "s3://bucket/raw"
        }
    }

    impl TaskExecutionMetadata for TestContext {
        fn execution_id(&self) -> &str {
            "exec-1"
        }

        fn namespace(&self) -> &str {
            "tasks"
        }

        fn labels(&self) -> &BTreeMap<String, String> {
            &self.labels
        }

        fn annotations(&self) -> &BTreeMap<String, String> {
            &self.annotations
        }

        fn service_account(&self) -> &str {
            "task-runner"
        }

        fn is_interruptible(&self) -> bool {
            self.interruptible
        }

        fn overrides(&self) -> &TaskOverrides {
            &self.overrides
        }

        fn platform_resources(&self) -> &PlatformResources {
            &self.platform
        }
    }

    impl TaskExecutionContext for TestContext {
        fn task_reader(&self) -> &dyn TaskReader {
            self
        }

        fn input_reader(&self) -> &dyn InputReader {
            self
        }

        fn output_writer(&self) -> &dyn OutputWriter {
            self
        }

        fn metadata(&self) -> &dyn TaskExecutionMetadata {
            self
        }
    }

    fn container_task(name: &str) -> TaskDefinition {
        TaskDefinition {
            target: TaskTarget::Container(ContainerSpec {
                name: name.to_string(),
                image: "ubuntu:24.04".to_string(),
                command: vec!["echo".to_string()],
                args: vec!["hello".to_string()],
                env: BTreeMap::new(),
                resources: None,
                working_dir: None,
            }),
            config: HashMap::new(),
            extended_resources: None,
            data_config: None,
            pod_template_name: None,
        }
    }

    fn store() -> PodTemplateStore {
        PodTemplateStore::new("cluster-defaults")
    }

    #[test]
    fn constructed_pod_contains_the_primary_container() {
        let ctx = TestContext::new(container_task("main"));

        let (pod_spec, _, primary) =
            build_pod_spec(&ctx, &store(), &PluginConfig::default()).unwrap();

        assert_eq!(primary, "main");
        assert!(pod_spec.containers.iter().any(|c| c.name == primary));
        assert_eq!(pod_spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(pod_spec.service_account_name.as_deref(), Some("task-runner"));
    }

    #[test]
    fn embedded_pod_spec_requires_the_primary_container_key() {
        let mut task = TaskDefinition {
            target: TaskTarget::PodSpec(EmbeddedPodSpec {
                pod_spec: Some(json!({
                    "containers": [{"name": "main", "image": "ubuntu:24.04"}]
                })),
                annotations: BTreeMap::from([("team".to_string(), "a".to_string())]),
                labels: BTreeMap::new(),
            }),
            config: HashMap::new(),
            extended_resources: None,
            data_config: None,
            pod_template_name: None,
        };

        let ctx = TestContext::new(task.clone());
        assert!(matches!(
            build_raw_pod(&ctx),
            Err(Error::BadTaskSpecification(_))
        ));

        task.config
            .insert(PRIMARY_CONTAINER_KEY.to_string(), "main".to_string());
        let ctx = TestContext::new(task);
        let (pod_spec, meta, primary) = build_raw_pod(&ctx).unwrap();
        assert_eq!(primary, "main");
        assert_eq!(pod_spec.containers[0].name, "main");
        assert_eq!(
            meta.annotations.as_ref().unwrap().get("team").unwrap(),
            "a"
        );
    }

    #[test]
    fn embedded_pod_spec_must_be_present() {
        let task = TaskDefinition {
            target: TaskTarget::PodSpec(EmbeddedPodSpec::default()),
            config: HashMap::from([(PRIMARY_CONTAINER_KEY.to_string(), "main".to_string())]),
            extended_resources: None,
            data_config: None,
            pod_template_name: None,
        };

        let ctx = TestContext::new(task);
        assert!(matches!(
            build_raw_pod(&ctx),
            Err(Error::BadTaskSpecification(_))
        ));
    }

    #[test]
    fn inline_override_replaces_the_pod_spec_and_primary() {
        let mut ctx = TestContext::new(container_task("main"));
        ctx.overrides.pod_template = Some(PodTemplateOverride {
            pod_spec: Some(json!({
                "containers": [{"name": "replaced", "image": "other:1"}]
            })),
            primary_container_name: "replaced".to_string(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::from([("overridden".to_string(), "true".to_string())]),
        });

        let (pod_spec, meta, primary) = build_raw_pod(&ctx).unwrap();
        assert_eq!(primary, "replaced");
        assert_eq!(pod_spec.containers.len(), 1);
        assert_eq!(pod_spec.containers[0].name, "replaced");
        assert_eq!(
            meta.labels.as_ref().unwrap().get("overridden").unwrap(),
            "true"
        );
    }

    #[test]
    fn missing_named_template_fails_construction() {
        let mut task = container_task("main");
        task.pod_template_name = Some("nonexistent".to_string());
        let ctx = TestContext::new(task);

        assert!(matches!(
            build_pod_spec(&ctx, &store(), &PluginConfig::default()),
            Err(Error::TemplateNotFound(name)) if name == "nonexistent"
        ));
    }

    #[test]
    fn named_template_is_merged() {
        let templates = store();
        templates.insert(PodTemplate {
            metadata: ObjectMeta {
                namespace: Some("tasks".to_string()),
                name: Some("gpu-base".to_string()),
                ..Default::default()
            },
            template: Some(PodTemplateSpec {
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "default".to_string(),
                        termination_message_path: Some("/dev/termination".to_string()),
                        ..Default::default()
                    }],
                    priority_class_name: Some("batch".to_string()),
                    ..Default::default()
                }),
                metadata: Some(ObjectMeta {
                    labels: Some(BTreeMap::from([(
                        "template".to_string(),
                        "gpu-base".to_string(),
                    )])),
                    ..Default::default()
                }),
            }),
        });

        let mut task = container_task("main");
        task.pod_template_name = Some("gpu-base".to_string());
        let ctx = TestContext::new(task);

        let (pod_spec, meta, _) =
            build_pod_spec(&ctx, &templates, &PluginConfig::default()).unwrap();

        assert_eq!(pod_spec.priority_class_name.as_deref(), Some("batch"));
        assert_eq!(
            pod_spec.containers[0].termination_message_path.as_deref(),
            Some("/dev/termination")
        );
        assert_eq!(
            meta.labels.as_ref().unwrap().get("template").unwrap(),
            "gpu-base"
        );
    }

    #[test]
    fn gpu_placement_is_applied_end_to_end() {
        let config = PluginConfig {
            add_tolerations_for_extended_resources: vec!["nvidia.com/gpu".to_string()],
            ..Default::default()
        };

        let mut task = container_task("main");
        if let TaskTarget::Container(spec) = &mut task.target {
            spec.resources = Some(ResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "nvidia.com/gpu".to_string(),
                    Quantity("1".to_string()),
                )])),
                limits: Some(BTreeMap::from([(
                    "nvidia.com/gpu".to_string(),
                    Quantity("1".to_string()),
                )])),
                ..Default::default()
            });
        }
        task.extended_resources = Some(ExtendedResources {
            gpu_accelerator: Some(GpuAccelerator {
                device: Some("a100".to_string()),
                partition: Some(GpuPartition::Size("1g.5gb".to_string())),
            }),
            shared_memory: None,
        });

        let ctx = TestContext::new(task);
        let (pod_spec, _, _) = build_pod_spec(&ctx, &store(), &config).unwrap();

        // Device and partition requirements are AND'd within a single term.
        let terms = &pod_spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        let keys: Vec<_> = expressions.iter().map(|e| e.key.as_str()).collect();
        assert_eq!(
            keys,
            [
                config.gpu_device_node_label.as_str(),
                config.gpu_partition_size_node_label.as_str()
            ]
        );

        let tolerations = pod_spec.tolerations.as_ref().unwrap();
        let keys: Vec<_> = tolerations
            .iter()
            .map(|t| t.key.as_deref().unwrap())
            .collect();
        assert!(keys.contains(&config.gpu_device_node_label.as_str()));
        assert!(keys.contains(&config.gpu_partition_size_node_label.as_str()));
        // The extended resource toleration for the GPU resource name itself.
        assert!(keys.contains(&"nvidia.com/gpu"));
    }

    #[test]
    fn copilot_containers_are_injected_when_data_loading_is_enabled() {
        let mut task = container_task("main");
        task.data_config = Some(gantry_core::task::DataLoadingConfig {
            enabled: true,
            input_path: None,
            output_path: None,
        });

        let ctx = TestContext::new(task);
        let (pod_spec, _, _) = build_pod_spec(&ctx, &store(), &PluginConfig::default()).unwrap();

        let names: Vec<_> = pod_spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, ["main", "copilot-sidecar"]);

        let init: Vec<_> = pod_spec
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        assert_eq!(init, ["copilot-downloader"]);
    }

    #[test]
    fn interruptible_executions_get_selector_and_tolerations() {
        let config = PluginConfig {
            interruptible_node_selector: BTreeMap::from([(
                "lifecycle".to_string(),
                "spot".to_string(),
            )]),
            interruptible_tolerations: vec![Toleration {
                key: Some("spot".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let mut ctx = TestContext::new(container_task("main"));
        ctx.interruptible = true;

        let (pod_spec, _, _) = build_pod_spec(&ctx, &store(), &config).unwrap();

        assert_eq!(
            pod_spec.node_selector.as_ref().unwrap().get("lifecycle").unwrap(),
            "spot"
        );
        assert_eq!(
            pod_spec.tolerations.as_ref().unwrap()[0].key.as_deref(),
            Some("spot")
        );
    }

    #[test]
    fn platform_defaults_fill_in_primary_resources() {
        let mut ctx = TestContext::new(container_task("main"));
        ctx.platform = PlatformResources {
            defaults: BTreeMap::from([
                ("cpu".to_string(), Quantity("500m".to_string())),
                ("memory".to_string(), Quantity("256Mi".to_string())),
            ]),
            limits: BTreeMap::new(),
        };

        let (pod_spec, _, _) = build_pod_spec(&ctx, &store(), &PluginConfig::default()).unwrap();

        let resources = pod_spec.containers[0].resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "500m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "256Mi");
    }

    #[test]
    fn container_image_override_is_applied() {
        let mut ctx = TestContext::new(container_task("main"));
        ctx.overrides.container_image = Some("patched:7".to_string());

        let (pod_spec, _, _) = build_pod_spec(&ctx, &store(), &PluginConfig::default()).unwrap();
        assert_eq!(pod_spec.containers[0].image.as_deref(), Some("patched:7"));
    }

    #[test]
    fn get_container_finds_by_name() {
        let pod_spec = PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        assert!(get_container(&pod_spec, "main").is_ok());
        assert!(matches!(
            get_container(&pod_spec, "missing"),
            Err(Error::BadTaskSpecification(_))
        ));
    }
}
