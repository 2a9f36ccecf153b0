//! Application of extended resources to constructed pods.
//!
//! Covers the shared memory volume, tolerations derived from extended
//! resource requests, the per-execution container image override, and the
//! merging of extended resource overrides.

use std::collections::BTreeSet;

use gantry_core::Error;
use gantry_core::Result;
use gantry_core::task::ExtendedResources;
use gantry_core::task::SharedMemory;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::Toleration;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::PluginConfig;
use crate::resources::parse_quantity;

/// Merges extended resource overrides onto base extended resources.
///
/// This is a field-wise replacement rather than a deep merge: an override for
/// the GPU accelerator or the shared memory volume replaces the whole
/// sub-object, so users must re-supply a complete sub-object to override one.
pub fn apply_extended_resources_overrides(
    base: Option<&ExtendedResources>,
    overrides: Option<&ExtendedResources>,
) -> ExtendedResources {
    let mut merged = base.cloned().unwrap_or_default();

    if let Some(overrides) = overrides {
        if let Some(accelerator) = &overrides.gpu_accelerator {
            merged.gpu_accelerator = Some(accelerator.clone());
        }

        if let Some(shared_memory) = &overrides.shared_memory {
            merged.shared_memory = Some(shared_memory.clone());
        }
    }

    merged
}

/// Adds the requested shared memory volume to the pod spec and mounts it in
/// the primary container.
///
/// The volume is an in-memory `EmptyDir` with the requested size limit.
pub fn apply_shared_memory(
    pod_spec: &mut PodSpec,
    primary_container_name: &str,
    shared_memory: &SharedMemory,
) -> Result<()> {
    let mount_name = shared_memory.mount_name.as_str();
    let mount_path = shared_memory.mount_path.as_str();

    if mount_name.is_empty() {
        return Err(Error::bad_task_spec("shared memory mount name is not set"));
    }

    if mount_path.is_empty() {
        return Err(Error::bad_task_spec("shared memory mount path is not set"));
    }

    let size_limit = shared_memory
        .size_limit
        .as_deref()
        .filter(|l| !l.is_empty())
        .map(|limit| match parse_quantity(limit) {
            Ok(_) => Ok(Quantity(limit.to_string())),
            Err(_) => Err(Error::bad_task_spec(format!(
                "unable to parse shared memory size limit `{limit}`"
            ))),
        })
        .transpose()?;

    if pod_spec
        .volumes
        .iter()
        .flatten()
        .any(|v| v.name == mount_name)
    {
        return Err(Error::bad_task_spec(format!(
            "a volume named `{mount_name}` already exists in the pod spec"
        )));
    }

    let primary = pod_spec
        .containers
        .iter_mut()
        .find(|c| c.name == primary_container_name)
        .ok_or_else(|| Error::bad_task_spec("unable to find primary container"))?;

    for mount in primary.volume_mounts.iter().flatten() {
        if mount.name == mount_name {
            return Err(Error::bad_task_spec(format!(
                "a volume named `{mount_name}` is already mounted in the primary container"
            )));
        }

        if mount.mount_path == mount_path {
            return Err(Error::bad_task_spec(format!(
                "`{mount_path}` is already mounted in the primary container"
            )));
        }
    }

    primary
        .volume_mounts
        .get_or_insert_default()
        .push(VolumeMount {
            name: mount_name.to_string(),
            mount_path: mount_path.to_string(),
            ..Default::default()
        });

    pod_spec.volumes.get_or_insert_default().push(Volume {
        name: mount_name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource {
            medium: Some("Memory".to_string()),
            size_limit,
        }),
        ..Default::default()
    });

    Ok(())
}

/// Determines whether two tolerations match under Kubernetes toleration
/// semantics.
fn tolerations_match(a: &Toleration, b: &Toleration) -> bool {
    a.key == b.key && a.operator == b.operator && a.value == b.value && a.effect == b.effect
}

/// Appends a toleration to the pod spec unless a matching one is already
/// present.
fn add_toleration(pod_spec: &mut PodSpec, toleration: Toleration) {
    let tolerations = pod_spec.tolerations.get_or_insert_default();
    if tolerations.iter().any(|t| tolerations_match(t, &toleration)) {
        return;
    }

    tolerations.push(toleration);
}

/// Adds a `NoSchedule` toleration for every configured extended resource that
/// some container or init container of the pod requests.
///
/// The operation is idempotent: tolerations already carried by the pod are
/// not duplicated.
pub fn add_tolerations_for_extended_resources(pod_spec: &mut PodSpec, config: &PluginConfig) {
    let mut resources = BTreeSet::new();
    for container in pod_spec
        .containers
        .iter()
        .chain(pod_spec.init_containers.iter().flatten())
    {
        let requests = container.resources.as_ref().and_then(|r| r.requests.as_ref());
        if let Some(requests) = requests {
            for resource in &config.add_tolerations_for_extended_resources {
                if requests.contains_key(resource) {
                    resources.insert(resource.clone());
                }
            }
        }
    }

    for resource in resources {
        add_toleration(
            pod_spec,
            Toleration {
                key: Some(resource),
                operator: Some("Exists".to_string()),
                effect: Some("NoSchedule".to_string()),
                ..Default::default()
            },
        );
    }
}

/// Replaces the image of the primary container.
///
/// A no-op when no container carries the primary name.
pub fn apply_container_image_override(
    pod_spec: &mut PodSpec,
    image: &str,
    primary_container_name: &str,
) {
    if let Some(primary) = pod_spec
        .containers
        .iter_mut()
        .find(|c| c.name == primary_container_name)
    {
        primary.image = Some(image.to_string());
    }
}
