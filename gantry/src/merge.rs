//! Merging of pod specs across template, base, and overlay layers.
//!
//! All merges operate on deep copies; inputs are never mutated. The field
//! contract is uniform: a present value in the merging layer replaces the
//! accumulator, slices concatenate, and maps merge key-wise with the merging
//! layer winning on conflicting keys. Absent values never overwrite.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// The template container name matching every container.
pub const DEFAULT_CONTAINER_TEMPLATE_NAME: &str = "default";

/// The template container name matching only the primary container.
pub const PRIMARY_CONTAINER_TEMPLATE_NAME: &str = "primary";

/// The template init container name matching every init container.
pub const DEFAULT_INIT_CONTAINER_TEMPLATE_NAME: &str = "default-init";

/// The template init container name matching only the primary init container.
pub const PRIMARY_INIT_CONTAINER_TEMPLATE_NAME: &str = "primary-init";

/// Replaces the destination when the source is present.
fn merge_opt<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(src) = src {
        *dst = Some(src.clone());
    }
}

/// Recursively merges the source into the destination when both are present;
/// copies the source when only it is present.
fn merge_opt_with<T: Clone>(dst: &mut Option<T>, src: &Option<T>, merge: impl Fn(&mut T, &T)) {
    if let Some(src) = src {
        match dst {
            Some(dst) => merge(dst, src),
            None => *dst = Some(src.clone()),
        }
    }
}

/// Replaces the destination when the source is non-empty.
fn merge_string(dst: &mut String, src: &str) {
    if !src.is_empty() {
        *dst = src.to_string();
    }
}

/// Appends the source elements to the destination.
fn append_opt_vec<T: Clone>(dst: &mut Option<Vec<T>>, src: &Option<Vec<T>>) {
    if let Some(src) = src {
        dst.get_or_insert_default().extend(src.iter().cloned());
    }
}

/// Merges the source map into the destination map key-wise.
fn merge_opt_map<K: Ord + Clone, V: Clone>(
    dst: &mut Option<BTreeMap<K, V>>,
    src: &Option<BTreeMap<K, V>>,
) {
    if let Some(src) = src {
        merge_map_into(src, dst.get_or_insert_default());
    }
}

/// Copies the entries of the source map into the destination map, overwriting
/// destination entries on conflicting keys.
pub fn merge_map_into<K: Ord + Clone, V: Clone>(src: &BTreeMap<K, V>, dst: &mut BTreeMap<K, V>) {
    for (key, value) in src {
        dst.insert(key.clone(), value.clone());
    }
}

/// Merges resource requirements key-wise.
fn merge_resource_requirements(dst: &mut ResourceRequirements, src: &ResourceRequirements) {
    append_opt_vec(&mut dst.claims, &src.claims);
    merge_opt_map(&mut dst.limits, &src.limits);
    merge_opt_map(&mut dst.requests, &src.requests);
}

/// Merges a container into an accumulated container.
fn merge_container(dst: &mut Container, src: &Container) {
    merge_string(&mut dst.name, &src.name);

    append_opt_vec(&mut dst.args, &src.args);
    append_opt_vec(&mut dst.command, &src.command);
    append_opt_vec(&mut dst.env, &src.env);
    append_opt_vec(&mut dst.env_from, &src.env_from);
    append_opt_vec(&mut dst.ports, &src.ports);
    append_opt_vec(&mut dst.resize_policy, &src.resize_policy);
    append_opt_vec(&mut dst.volume_devices, &src.volume_devices);
    append_opt_vec(&mut dst.volume_mounts, &src.volume_mounts);

    merge_opt_with(&mut dst.resources, &src.resources, merge_resource_requirements);

    merge_opt(&mut dst.image, &src.image);
    merge_opt(&mut dst.image_pull_policy, &src.image_pull_policy);
    merge_opt(&mut dst.lifecycle, &src.lifecycle);
    merge_opt(&mut dst.liveness_probe, &src.liveness_probe);
    merge_opt(&mut dst.readiness_probe, &src.readiness_probe);
    merge_opt(&mut dst.restart_policy, &src.restart_policy);
    merge_opt(&mut dst.security_context, &src.security_context);
    merge_opt(&mut dst.startup_probe, &src.startup_probe);
    merge_opt(&mut dst.stdin, &src.stdin);
    merge_opt(&mut dst.stdin_once, &src.stdin_once);
    merge_opt(&mut dst.termination_message_path, &src.termination_message_path);
    merge_opt(
        &mut dst.termination_message_policy,
        &src.termination_message_policy,
    );
    merge_opt(&mut dst.tty, &src.tty);
    merge_opt(&mut dst.working_dir, &src.working_dir);
}

/// Merges the non-container fields of a pod spec into an accumulated pod
/// spec.
///
/// Container lists are reconciled by name by the callers and are not touched
/// here.
fn merge_pod_spec(dst: &mut PodSpec, src: &PodSpec) {
    merge_opt(&mut dst.active_deadline_seconds, &src.active_deadline_seconds);
    merge_opt(&mut dst.affinity, &src.affinity);
    merge_opt(
        &mut dst.automount_service_account_token,
        &src.automount_service_account_token,
    );
    merge_opt(&mut dst.dns_config, &src.dns_config);
    merge_opt(&mut dst.dns_policy, &src.dns_policy);
    merge_opt(&mut dst.enable_service_links, &src.enable_service_links);
    merge_opt(&mut dst.host_ipc, &src.host_ipc);
    merge_opt(&mut dst.host_network, &src.host_network);
    merge_opt(&mut dst.host_pid, &src.host_pid);
    merge_opt(&mut dst.host_users, &src.host_users);
    merge_opt(&mut dst.hostname, &src.hostname);
    merge_opt(&mut dst.node_name, &src.node_name);
    merge_opt(&mut dst.os, &src.os);
    merge_opt(&mut dst.preemption_policy, &src.preemption_policy);
    merge_opt(&mut dst.priority, &src.priority);
    merge_opt(&mut dst.priority_class_name, &src.priority_class_name);
    merge_opt(&mut dst.restart_policy, &src.restart_policy);
    merge_opt(&mut dst.runtime_class_name, &src.runtime_class_name);
    merge_opt(&mut dst.scheduler_name, &src.scheduler_name);
    merge_opt(&mut dst.security_context, &src.security_context);
    merge_opt(&mut dst.service_account, &src.service_account);
    merge_opt(&mut dst.service_account_name, &src.service_account_name);
    merge_opt(&mut dst.set_hostname_as_fqdn, &src.set_hostname_as_fqdn);
    merge_opt(&mut dst.share_process_namespace, &src.share_process_namespace);
    merge_opt(&mut dst.subdomain, &src.subdomain);
    merge_opt(
        &mut dst.termination_grace_period_seconds,
        &src.termination_grace_period_seconds,
    );

    append_opt_vec(&mut dst.ephemeral_containers, &src.ephemeral_containers);
    append_opt_vec(&mut dst.host_aliases, &src.host_aliases);
    append_opt_vec(&mut dst.image_pull_secrets, &src.image_pull_secrets);
    append_opt_vec(&mut dst.readiness_gates, &src.readiness_gates);
    append_opt_vec(&mut dst.resource_claims, &src.resource_claims);
    append_opt_vec(&mut dst.scheduling_gates, &src.scheduling_gates);
    append_opt_vec(&mut dst.tolerations, &src.tolerations);
    append_opt_vec(
        &mut dst.topology_spread_constraints,
        &src.topology_spread_constraints,
    );
    append_opt_vec(&mut dst.volumes, &src.volumes);

    merge_opt_map(&mut dst.node_selector, &src.node_selector);
    merge_opt_map(&mut dst.overhead, &src.overhead);
}

/// Reconciles a base container against a template container list.
///
/// The accumulator is seeded with the container named `default_name` (if
/// present), the container named `primary_name` is merged in when the base
/// container is the primary, any template container sharing the base
/// container's name is merged next, and the base container is merged last so
/// that it wins on conflicts.
fn reconcile_container(
    template_containers: &[Container],
    container: &Container,
    default_name: &str,
    primary_name: &str,
    primary_container_name: &str,
) -> Container {
    let mut merged: Option<Container> = template_containers
        .iter()
        .find(|c| c.name == default_name)
        .cloned();

    if container.name == primary_container_name {
        if let Some(primary) = template_containers.iter().find(|c| c.name == primary_name) {
            match &mut merged {
                Some(merged) => merge_container(merged, primary),
                None => merged = Some(primary.clone()),
            }
        }
    }

    for template in template_containers.iter().filter(|c| c.name == container.name) {
        match &mut merged {
            Some(merged) => merge_container(merged, template),
            None => merged = Some(template.clone()),
        }
    }

    match merged {
        Some(mut merged) => {
            merge_container(&mut merged, container);
            merged
        }
        None => container.clone(),
    }
}

/// Merges a base pod spec onto a template pod spec.
///
/// The template may use the reserved container names [`DEFAULT_CONTAINER_TEMPLATE_NAME`]
/// and [`PRIMARY_CONTAINER_TEMPLATE_NAME`] (and their `-init` counterparts) to
/// target every container or only the primary (init) container. Template
/// containers that do not match any base container are discarded; the base
/// defines the container set.
pub fn merge_base_pod_spec_onto_template(
    template: &PodSpec,
    base: &PodSpec,
    primary_container_name: &str,
    primary_init_container_name: &str,
) -> PodSpec {
    let mut merged = template.clone();
    merge_pod_spec(&mut merged, base);

    merged.containers = base
        .containers
        .iter()
        .map(|container| {
            reconcile_container(
                &template.containers,
                container,
                DEFAULT_CONTAINER_TEMPLATE_NAME,
                PRIMARY_CONTAINER_TEMPLATE_NAME,
                primary_container_name,
            )
        })
        .collect();

    merged.init_containers = base.init_containers.as_ref().map(|init_containers| {
        let template_init_containers = template.init_containers.as_deref().unwrap_or_default();
        init_containers
            .iter()
            .map(|container| {
                reconcile_container(
                    template_init_containers,
                    container,
                    DEFAULT_INIT_CONTAINER_TEMPLATE_NAME,
                    PRIMARY_INIT_CONTAINER_TEMPLATE_NAME,
                    primary_init_container_name,
                )
            })
            .collect()
    });

    merged
}

/// Merges an overlay pod spec onto a base pod spec.
///
/// Containers are merged into the base container with the matching name;
/// overlay containers without a matching base container are discarded.
pub fn merge_overlay_pod_spec_onto_base(base: &PodSpec, overlay: &PodSpec) -> PodSpec {
    let mut merged = base.clone();
    merge_pod_spec(&mut merged, overlay);

    merged.containers = base
        .containers
        .iter()
        .map(|container| {
            let mut merged = container.clone();
            for overlay in overlay.containers.iter().filter(|c| c.name == container.name) {
                merge_container(&mut merged, overlay);
            }
            merged
        })
        .collect();

    merged.init_containers = base.init_containers.as_ref().map(|init_containers| {
        let overlay_init_containers = overlay.init_containers.as_deref().unwrap_or_default();
        init_containers
            .iter()
            .map(|container| {
                let mut merged = container.clone();
                for overlay in overlay_init_containers
                    .iter()
                    .filter(|c| c.name == container.name)
                {
                    merge_container(&mut merged, overlay);
                }
                merged
            })
            .collect()
    });

    merged
}

/// Merges base object metadata onto template object metadata.
///
/// Labels and annotations merge key-wise; finalizers and owner references
/// append; scalar fields follow the usual override-when-present rule.
pub fn merge_object_meta_onto_template(template: &ObjectMeta, base: &ObjectMeta) -> ObjectMeta {
    let mut merged = template.clone();

    merge_opt_map(&mut merged.annotations, &base.annotations);
    merge_opt_map(&mut merged.labels, &base.labels);
    append_opt_vec(&mut merged.finalizers, &base.finalizers);
    append_opt_vec(&mut merged.owner_references, &base.owner_references);
    merge_opt(&mut merged.generate_name, &base.generate_name);
    merge_opt(&mut merged.name, &base.name);
    merge_opt(&mut merged.namespace, &base.namespace);

    merged
}
