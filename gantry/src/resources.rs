//! Container resource customization against platform policy.
//!
//! Containers constructed from a task definition carry whatever resources the
//! user specified. Before submission they are reconciled against the
//! platform's defaults and ceilings: the primary container (and init
//! containers) merge missing entries in from the defaults, while secondary
//! containers only have their existing entries clamped into the allowed
//! range.

use std::collections::BTreeMap;

use gantry_core::Error;
use gantry_core::Result;
use gantry_core::context::PlatformResources;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::PodTemplate;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::merge::DEFAULT_CONTAINER_TEMPLATE_NAME;
use crate::merge::DEFAULT_INIT_CONTAINER_TEMPLATE_NAME;

/// The CPU resource name.
pub const RESOURCE_CPU: &str = "cpu";

/// The memory resource name.
pub const RESOURCE_MEMORY: &str = "memory";

/// How a container's resources are reconciled against platform policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceCustomizationMode {
    /// Merge the container's resources with the platform defaults and clamp
    /// the result into the platform-allowed range.
    ///
    /// Used for primary and init containers, whose resources the platform
    /// owns.
    MergeExistingResources,
    /// Clamp the container's existing resources into the platform-allowed
    /// range without introducing new resource kinds.
    ///
    /// Used for secondary containers, whose resources the user owns.
    EnsureExistingResourcesInRange,
}

/// Parses a Kubernetes quantity into its value in base units.
///
/// Supports the plain, binary-suffixed (`Ki`, `Mi`, ...), SI-suffixed (`n`,
/// `u`, `m`, `k`, `M`, ...), and scientific (`1e3`) forms of the quantity
/// grammar.
pub fn parse_quantity(quantity: &str) -> Result<f64> {
    let s = quantity.trim();
    if s.is_empty() {
        return Err(Error::bad_task_spec("quantity is empty"));
    }

    let split = s
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+'))
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| Error::bad_task_spec(format!("unable to parse quantity `{quantity}`")))?;

    let multiplier = match suffix {
        "" => 1.0,
        "n" => 1e-9,
        "u" => 1e-6,
        "m" => 1e-3,
        "k" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "Ki" => (1u64 << 10) as f64,
        "Mi" => (1u64 << 20) as f64,
        "Gi" => (1u64 << 30) as f64,
        "Ti" => (1u64 << 40) as f64,
        "Pi" => (1u64 << 50) as f64,
        "Ei" => (1u64 << 60) as f64,
        _ => {
            // Scientific notation, e.g. `12e6`.
            if let Some(exponent) = suffix
                .strip_prefix(['e', 'E'])
                .and_then(|e| e.parse::<i32>().ok())
            {
                10f64.powi(exponent)
            } else {
                return Err(Error::bad_task_spec(format!(
                    "unable to parse quantity `{quantity}`: invalid suffix `{suffix}`"
                )));
            }
        }
    };

    Ok(value * multiplier)
}

/// Returns the smaller of two quantities.
fn min_quantity(a: &Quantity, b: &Quantity) -> Result<Quantity> {
    if parse_quantity(&a.0)? <= parse_quantity(&b.0)? {
        Ok(a.clone())
    } else {
        Ok(b.clone())
    }
}

/// Clamps every entry of the map to the platform limit for its resource kind.
fn clamp_to_platform_limits(
    entries: &mut BTreeMap<String, Quantity>,
    platform: &PlatformResources,
) -> Result<()> {
    for (resource, value) in entries.iter_mut() {
        if let Some(limit) = platform.limits.get(resource) {
            *value = min_quantity(value, limit)?;
        }
    }

    Ok(())
}

/// Ensures no request exceeds the limit of the same resource kind.
fn cap_requests_at_limits(
    requests: &mut BTreeMap<String, Quantity>,
    limits: &BTreeMap<String, Quantity>,
) -> Result<()> {
    for (resource, request) in requests.iter_mut() {
        if let Some(limit) = limits.get(resource) {
            *request = min_quantity(request, limit)?;
        }
    }

    Ok(())
}

/// Reconciles a container's resources against platform policy.
///
/// In merge mode, the optional template resources act as a floor under the
/// container's own entries, missing CPU and memory requests fall back to the
/// platform defaults, and missing limits fall back to the requests. In both
/// modes the result is clamped into the platform-allowed range.
pub fn customize_container_resources(
    container: &mut Container,
    mode: ResourceCustomizationMode,
    platform: &PlatformResources,
    template_resources: Option<&ResourceRequirements>,
) -> Result<()> {
    let mut resources = container.resources.clone().unwrap_or_default();
    let requests = resources.requests.get_or_insert_default();
    let limits = resources.limits.get_or_insert_default();

    if mode == ResourceCustomizationMode::MergeExistingResources {
        // Template-derived resources sit under the container's own entries.
        if let Some(template) = template_resources {
            for (resource, value) in template.requests.iter().flatten() {
                requests.entry(resource.clone()).or_insert_with(|| value.clone());
            }

            for (resource, value) in template.limits.iter().flatten() {
                limits.entry(resource.clone()).or_insert_with(|| value.clone());
            }
        }

        // Platform defaults fill in missing cpu and memory requests.
        for resource in [RESOURCE_CPU, RESOURCE_MEMORY] {
            if let Some(default) = platform.defaults.get(resource) {
                requests
                    .entry(resource.to_string())
                    .or_insert_with(|| default.clone());
            }
        }

        // A request without a limit is limited to the request.
        for (resource, request) in requests.iter() {
            limits
                .entry(resource.clone())
                .or_insert_with(|| request.clone());
        }
    }

    clamp_to_platform_limits(requests, platform)?;
    clamp_to_platform_limits(limits, platform)?;
    cap_requests_at_limits(requests, limits)?;

    if requests.is_empty() {
        resources.requests = None;
    }

    if limits.is_empty() {
        resources.limits = None;
    }

    container.resources = Some(resources);
    Ok(())
}

/// Extracts the resources a pod template declares for the named container.
///
/// Falls back to the `default` (or `default-init`) template container when no
/// template container shares the given name.
pub fn extract_container_resources_from_pod_template(
    template: &PodTemplate,
    container_name: &str,
    init: bool,
) -> Option<ResourceRequirements> {
    let spec = template.template.as_ref()?.spec.as_ref()?;

    let (containers, default_name): (&[Container], _) = if init {
        (
            spec.init_containers.as_deref().unwrap_or_default(),
            DEFAULT_INIT_CONTAINER_TEMPLATE_NAME,
        )
    } else {
        (&spec.containers, DEFAULT_CONTAINER_TEMPLATE_NAME)
    };

    containers
        .iter()
        .find(|c| c.name == container_name)
        .or_else(|| containers.iter().find(|c| c.name == default_name))
        .and_then(|c| c.resources.clone())
}
