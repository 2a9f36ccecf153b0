//! Node placement for constructed pods.
//!
//! Composes node affinity, node selectors, and tolerations from the plugin
//! configuration, task interruptibility, and GPU requirements.

use gantry_core::task::GpuAccelerator;
use gantry_core::task::GpuPartition;
use k8s_openapi::api::core::v1::Affinity;
use k8s_openapi::api::core::v1::NodeAffinity;
use k8s_openapi::api::core::v1::NodeSelector;
use k8s_openapi::api::core::v1::NodeSelectorRequirement;
use k8s_openapi::api::core::v1::NodeSelectorTerm;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::PreferredSchedulingTerm;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Toleration;

use crate::config::PluginConfig;

/// Appends the given requirements to every existing required node selector
/// term of the affinity.
///
/// Node selector terms are OR'd during scheduling while the requirements
/// within a single term are AND'd, so appending to every term preserves the
/// requirement under all alternatives. If no terms exist, a single term
/// containing the requirements is created.
pub fn add_required_node_selector_requirements(
    affinity: &mut Affinity,
    requirements: &[NodeSelectorRequirement],
) {
    let node_affinity = affinity.node_affinity.get_or_insert_default();
    let selector = node_affinity
        .required_during_scheduling_ignored_during_execution
        .get_or_insert_with(NodeSelector::default);

    if selector.node_selector_terms.is_empty() {
        selector.node_selector_terms.push(NodeSelectorTerm {
            match_expressions: Some(requirements.to_vec()),
            ..Default::default()
        });
    } else {
        for term in &mut selector.node_selector_terms {
            term.match_expressions
                .get_or_insert_default()
                .extend(requirements.iter().cloned());
        }
    }
}

/// Appends a preferred scheduling term with the given weight containing the
/// requirements.
pub fn add_preferred_node_selector_requirements(
    affinity: &mut Affinity,
    weight: i32,
    requirements: &[NodeSelectorRequirement],
) {
    affinity
        .node_affinity
        .get_or_insert_with(NodeAffinity::default)
        .preferred_during_scheduling_ignored_during_execution
        .get_or_insert_default()
        .push(PreferredSchedulingTerm {
            weight,
            preference: NodeSelectorTerm {
                match_expressions: Some(requirements.to_vec()),
                ..Default::default()
            },
        });
}

/// Adds the configured interruptible (or non-interruptible) node selector
/// requirement to the affinity.
pub fn apply_interruptible_node_selector_requirement(
    interruptible: bool,
    affinity: &mut Affinity,
    config: &PluginConfig,
) {
    let requirement = if interruptible {
        &config.interruptible_node_selector_requirement
    } else {
        &config.non_interruptible_node_selector_requirement
    };

    if let Some(requirement) = requirement {
        add_required_node_selector_requirements(affinity, std::slice::from_ref(requirement));
    }
}

/// Adds the configured interruptible (or non-interruptible) node affinity to
/// the pod spec.
pub fn apply_interruptible_node_affinity(
    interruptible: bool,
    pod_spec: &mut PodSpec,
    config: &PluginConfig,
) {
    apply_interruptible_node_selector_requirement(
        interruptible,
        pod_spec.affinity.get_or_insert_default(),
        config,
    );
}

/// Determines whether any container in the pod spec has a limit on the
/// configured GPU resource.
fn requires_gpus(pod_spec: &PodSpec, config: &PluginConfig) -> bool {
    pod_spec.containers.iter().any(|container| {
        container
            .resources
            .as_ref()
            .and_then(|r| r.limits.as_ref())
            .is_some_and(|limits| limits.contains_key(&config.gpu_resource_name))
    })
}

/// Applies GPU device and partition placement to the pod spec.
///
/// Short-circuits when no container has a limit on the configured GPU
/// resource. A device preference adds a required selector on the device label
/// and a matching toleration. A partition preference adds either the
/// unpartitioned selector (a `DoesNotExist` requirement on the partition size
/// label, unless overridden by configuration) or an `In` selector and
/// toleration for the concrete partition size.
pub fn apply_gpu_node_selectors(
    pod_spec: &mut PodSpec,
    accelerator: &GpuAccelerator,
    config: &PluginConfig,
) {
    if !requires_gpus(pod_spec, config) {
        return;
    }

    let affinity = pod_spec.affinity.get_or_insert_default();

    if let Some(device) = accelerator.device.as_deref().filter(|d| !d.is_empty()) {
        add_required_node_selector_requirements(
            affinity,
            &[NodeSelectorRequirement {
                key: config.gpu_device_node_label.clone(),
                operator: "In".to_string(),
                values: Some(vec![device.to_string()]),
            }],
        );

        pod_spec
            .tolerations
            .get_or_insert_default()
            .push(Toleration {
                key: Some(config.gpu_device_node_label.clone()),
                value: Some(device.to_string()),
                operator: Some("Equal".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            });
    }

    let Some(partition) = accelerator.partition.as_ref() else {
        return;
    };

    let affinity = pod_spec.affinity.get_or_insert_default();
    let (requirement, toleration) = match partition {
        GpuPartition::Unpartitioned => (
            Some(
                config
                    .gpu_unpartitioned_node_selector_requirement
                    .clone()
                    .unwrap_or_else(|| NodeSelectorRequirement {
                        key: config.gpu_partition_size_node_label.clone(),
                        operator: "DoesNotExist".to_string(),
                        values: None,
                    }),
            ),
            config.gpu_unpartitioned_toleration.clone(),
        ),
        GpuPartition::Size(size) => (
            Some(NodeSelectorRequirement {
                key: config.gpu_partition_size_node_label.clone(),
                operator: "In".to_string(),
                values: Some(vec![size.clone()]),
            }),
            Some(Toleration {
                key: Some(config.gpu_partition_size_node_label.clone()),
                value: Some(size.clone()),
                operator: Some("Equal".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            }),
        ),
    };

    if let Some(requirement) = requirement {
        add_required_node_selector_requirements(affinity, &[requirement]);
    }

    if let Some(toleration) = toleration {
        pod_spec.tolerations.get_or_insert_default().push(toleration);
    }
}

/// Derives the tolerations for a pod from its interruptibility and the
/// resources its containers request.
///
/// The result carries the configured tolerations for every requested or
/// limited resource kind, the interruptible tolerations when the task is
/// interruptible, and the default tolerations.
pub fn pod_tolerations(
    interruptible: bool,
    resource_requirements: &[ResourceRequirements],
    config: &PluginConfig,
) -> Vec<Toleration> {
    let mut tolerations = Vec::new();

    for requirements in resource_requirements {
        for resource in requirements
            .requests
            .iter()
            .chain(requirements.limits.iter())
            .flat_map(|map| map.keys())
        {
            if let Some(configured) = config.resource_tolerations.get(resource) {
                tolerations.extend(configured.iter().cloned());
            }
        }
    }

    if interruptible {
        tolerations.extend(config.interruptible_tolerations.iter().cloned());
    }

    tolerations.extend(config.default_tolerations.iter().cloned());
    tolerations
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Container;
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;

    fn gpu_pod_spec(resource: &str) -> PodSpec {
        PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                resources: Some(ResourceRequirements {
                    limits: Some(BTreeMap::from([(
                        resource.to_string(),
                        Quantity("1".to_string()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    fn required_terms(pod_spec: &PodSpec) -> &[NodeSelectorTerm] {
        pod_spec
            .affinity
            .as_ref()
            .unwrap()
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms
            .as_slice()
    }

    #[test]
    fn required_requirements_append_to_every_term() {
        let mut affinity = Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![
                        NodeSelectorTerm {
                            match_expressions: Some(vec![NodeSelectorRequirement {
                                key: "zone".to_string(),
                                operator: "In".to_string(),
                                values: Some(vec!["a".to_string()]),
                            }]),
                            ..Default::default()
                        },
                        NodeSelectorTerm::default(),
                    ],
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        add_required_node_selector_requirements(
            &mut affinity,
            &[NodeSelectorRequirement {
                key: "pool".to_string(),
                operator: "Exists".to_string(),
                values: None,
            }],
        );

        let terms = &affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0].match_expressions.as_ref().unwrap().len(), 2);
        assert_eq!(terms[1].match_expressions.as_ref().unwrap().len(), 1);
    }

    #[test]
    fn required_requirements_create_a_term_when_none_exist() {
        let mut affinity = Affinity::default();

        add_required_node_selector_requirements(
            &mut affinity,
            &[NodeSelectorRequirement {
                key: "pool".to_string(),
                operator: "Exists".to_string(),
                values: None,
            }],
        );

        let terms = &affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
        assert_eq!(
            terms[0].match_expressions.as_ref().unwrap()[0].key,
            "pool"
        );
    }

    #[test]
    fn preferred_requirements_append_a_weighted_term() {
        let mut affinity = Affinity::default();

        add_preferred_node_selector_requirements(
            &mut affinity,
            10,
            &[NodeSelectorRequirement {
                key: "pool".to_string(),
                operator: "Exists".to_string(),
                values: None,
            }],
        );

        let preferred = affinity
            .node_affinity
            .as_ref()
            .unwrap()
            .preferred_during_scheduling_ignored_during_execution
            .as_ref()
            .unwrap();
        assert_eq!(preferred.len(), 1);
        assert_eq!(preferred[0].weight, 10);
    }

    #[test]
    fn interruptible_affinity_uses_configured_requirement() {
        let config = PluginConfig {
            interruptible_node_selector_requirement: Some(NodeSelectorRequirement {
                key: "interruptible".to_string(),
                operator: "In".to_string(),
                values: Some(vec!["true".to_string()]),
            }),
            ..Default::default()
        };

        let mut pod_spec = PodSpec::default();
        apply_interruptible_node_affinity(true, &mut pod_spec, &config);

        let terms = required_terms(&pod_spec);
        assert_eq!(
            terms[0].match_expressions.as_ref().unwrap()[0].key,
            "interruptible"
        );
    }

    #[test]
    fn interruptible_affinity_without_configuration_is_a_no_op() {
        let config = PluginConfig::default();
        let mut pod_spec = PodSpec::default();

        apply_interruptible_node_affinity(false, &mut pod_spec, &config);

        // The affinity shell is created but no requirement is added.
        assert!(
            pod_spec
                .affinity
                .as_ref()
                .unwrap()
                .node_affinity
                .is_none()
        );
    }

    #[test]
    fn gpu_selectors_short_circuit_without_gpu_limits() {
        let config = PluginConfig::default();
        let mut pod_spec = gpu_pod_spec("cpu");

        apply_gpu_node_selectors(
            &mut pod_spec,
            &GpuAccelerator {
                device: Some("a100".to_string()),
                partition: None,
            },
            &config,
        );

        assert!(pod_spec.affinity.is_none());
        assert!(pod_spec.tolerations.is_none());
    }

    #[test]
    fn gpu_device_adds_one_selector_and_one_toleration() {
        let config = PluginConfig::default();
        let mut pod_spec = gpu_pod_spec(&config.gpu_resource_name);

        apply_gpu_node_selectors(
            &mut pod_spec,
            &GpuAccelerator {
                device: Some("a100".to_string()),
                partition: None,
            },
            &config,
        );

        let terms = required_terms(&pod_spec);
        assert_eq!(terms.len(), 1);
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(expressions.len(), 1);
        assert_eq!(expressions[0].key, config.gpu_device_node_label);
        assert_eq!(expressions[0].values.as_ref().unwrap(), &["a100"]);

        let tolerations = pod_spec.tolerations.as_ref().unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(
            tolerations[0].key.as_deref(),
            Some(config.gpu_device_node_label.as_str())
        );
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));
    }

    #[test]
    fn gpu_device_and_partition_share_a_term() {
        let config = PluginConfig::default();
        let mut pod_spec = gpu_pod_spec(&config.gpu_resource_name);

        apply_gpu_node_selectors(
            &mut pod_spec,
            &GpuAccelerator {
                device: Some("a100".to_string()),
                partition: Some(GpuPartition::Size("1g.5gb".to_string())),
            },
            &config,
        );

        // Both requirements are AND'd within the single term.
        let terms = required_terms(&pod_spec);
        assert_eq!(terms.len(), 1);
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(expressions.len(), 2);
        assert_eq!(expressions[0].key, config.gpu_device_node_label);
        assert_eq!(expressions[1].key, config.gpu_partition_size_node_label);
        assert_eq!(expressions[1].values.as_ref().unwrap(), &["1g.5gb"]);

        let tolerations = pod_spec.tolerations.as_ref().unwrap();
        assert_eq!(tolerations.len(), 2);
    }

    #[test]
    fn unpartitioned_gpu_adds_does_not_exist_requirement() {
        let config = PluginConfig::default();
        let mut pod_spec = gpu_pod_spec(&config.gpu_resource_name);

        apply_gpu_node_selectors(
            &mut pod_spec,
            &GpuAccelerator {
                device: None,
                partition: Some(GpuPartition::Unpartitioned),
            },
            &config,
        );

        let terms = required_terms(&pod_spec);
        let expressions = terms[0].match_expressions.as_ref().unwrap();
        assert_eq!(expressions[0].key, config.gpu_partition_size_node_label);
        assert_eq!(expressions[0].operator, "DoesNotExist");
        assert!(pod_spec.tolerations.is_none());
    }

    #[test]
    fn tolerations_derive_from_resources_and_interruptibility() {
        let config = PluginConfig {
            resource_tolerations: std::collections::HashMap::from([(
                "nvidia.com/gpu".to_string(),
                vec![Toleration {
                    key: Some("nvidia.com/gpu".to_string()),
                    operator: Some("Exists".to_string()),
                    ..Default::default()
                }],
            )]),
            interruptible_tolerations: vec![Toleration {
                key: Some("spot".to_string()),
                operator: Some("Exists".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        };

        let requirements = [ResourceRequirements {
            limits: Some(BTreeMap::from([(
                "nvidia.com/gpu".to_string(),
                Quantity("1".to_string()),
            )])),
            ..Default::default()
        }];

        let tolerations = pod_tolerations(true, &requirements, &config);
        let keys: Vec<_> = tolerations
            .iter()
            .map(|t| t.key.as_deref().unwrap())
            .collect();
        assert_eq!(keys, ["nvidia.com/gpu", "spot"]);

        let tolerations = pod_tolerations(false, &requirements, &config);
        let keys: Vec<_> = tolerations
            .iter()
            .map(|t| t.key.as_deref().unwrap())
            .collect();
        assert_eq!(keys, ["nvidia.com/gpu"]);
    }
}
