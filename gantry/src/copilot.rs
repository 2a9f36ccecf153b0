//! Injection of the copilot data containers.
//!
//! Tasks with a data loading configuration get two helper containers: an init
//! container that downloads inputs before the user container starts and a
//! sidecar that uploads outputs as the user container produces them. Both
//! share in-memory volumes with the primary container.

use std::collections::BTreeMap;

use gantry_core::context::InputReader;
use gantry_core::context::OutputWriter;
use gantry_core::task::DataLoadingConfig;
use k8s_openapi::api::core::v1::Container;
use k8s_openapi::api::core::v1::EmptyDirVolumeSource;
use k8s_openapi::api::core::v1::PodSpec;
use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::api::core::v1::VolumeMount;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::config::CopilotConfig;
use crate::resources::RESOURCE_CPU;
use crate::resources::RESOURCE_MEMORY;

/// The name of the volume inputs are downloaded to.
const INPUTS_VOLUME_NAME: &str = "data-inputs";

/// The name of the volume outputs are collected from.
const OUTPUTS_VOLUME_NAME: &str = "data-outputs";

/// The name suffix of the copilot downloader init container.
const DOWNLOADER_SUFFIX: &str = "downloader";

/// The name suffix of the copilot uploader sidecar.
const SIDECAR_SUFFIX: &str = "sidecar";

/// Gets the directory inputs are staged in for the task.
fn input_path<'a>(data_config: &'a DataLoadingConfig, config: &'a CopilotConfig) -> &'a str {
    data_config
        .input_path
        .as_deref()
        .unwrap_or(&config.default_input_path)
}

/// Gets the directory outputs are collected from for the task.
fn output_path<'a>(data_config: &'a DataLoadingConfig, config: &'a CopilotConfig) -> &'a str {
    data_config
        .output_path
        .as_deref()
        .unwrap_or(&config.default_output_path)
}

/// Gets the resource requests for a copilot container.
fn copilot_resources(config: &CopilotConfig) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            (RESOURCE_CPU.to_string(), Quantity(config.cpu.clone())),
            (RESOURCE_MEMORY.to_string(), Quantity(config.memory.clone())),
        ])),
        ..Default::default()
    }
}

/// Mounts the copilot data volumes into the primary container.
///
/// Inputs are mounted read-only; outputs are writable.
pub fn add_copilot_to_container(
    container: &mut Container,
    data_config: &DataLoadingConfig,
    config: &CopilotConfig,
) {
    let mounts = container.volume_mounts.get_or_insert_default();
    mounts.push(VolumeMount {
        name: INPUTS_VOLUME_NAME.to_string(),
        mount_path: input_path(data_config, config).to_string(),
        read_only: Some(true),
        ..Default::default()
    });
    mounts.push(VolumeMount {
        name: OUTPUTS_VOLUME_NAME.to_string(),
        mount_path: output_path(data_config, config).to_string(),
        ..Default::default()
    });
}

/// Injects the copilot volumes, downloader init container, and uploader
/// sidecar into the pod spec.
///
/// Returns the name of the downloader init container; the template merge
/// treats it as the primary init container.
pub fn add_copilot_to_pod(
    pod_spec: &mut PodSpec,
    data_config: &DataLoadingConfig,
    inputs: &dyn InputReader,
    outputs: &dyn OutputWriter,
    config: &CopilotConfig,
) -> String {
    let volumes = pod_spec.volumes.get_or_insert_default();
    volumes.push(Volume {
        name: INPUTS_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    volumes.push(Volume {
        name: OUTPUTS_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });

    let downloader_name = format!("{prefix}{DOWNLOADER_SUFFIX}", prefix = config.name_prefix);
    pod_spec
        .init_containers
        .get_or_insert_default()
        .push(Container {
            name: downloader_name.clone(),
            image: Some(config.image.clone()),
            args: Some(vec![
                "--mode".to_string(),
                "download".to_string(),
                "--from".to_string(),
                inputs.input_prefix().to_string(),
                "--to".to_string(),
                input_path(data_config, config).to_string(),
            ]),
            volume_mounts: Some(vec![VolumeMount {
                name: INPUTS_VOLUME_NAME.to_string(),
                mount_path: input_path(data_config, config).to_string(),
                ..Default::default()
            }]),
            resources: Some(copilot_resources(config)),
            ..Default::default()
        });

    pod_spec.containers.push(Container {
        name: format!("{prefix}{SIDECAR_SUFFIX}", prefix = config.name_prefix),
        image: Some(config.image.clone()),
        args: Some(vec![
            "--mode".to_string(),
            "upload".to_string(),
            "--from".to_string(),
            output_path(data_config, config).to_string(),
            "--to".to_string(),
            outputs.output_prefix().to_string(),
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: OUTPUTS_VOLUME_NAME.to_string(),
            mount_path: output_path(data_config, config).to_string(),
            ..Default::default()
        }]),
        resources: Some(copilot_resources(config)),
        ..Default::default()
    });

    downloader_name
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestIo;

    impl InputReader for TestIo {
        fn input_prefix(&self) -> &str {
            "s3://bucket/inputs"
        }

        fn input_path(&self) -> &str {
            "s3://bucket/inputs/inputs.json"
        }
    }

    impl OutputWriter for TestIo {
        fn output_prefix(&self) -> &str {
            "s3://bucket/outputs"
        }

        fn raw_output_prefix(&self) -> &str {
            "s3://bucket/raw"
        }
    }

    #[test]
    fn copilot_containers_are_injected() {
        let config = CopilotConfig::default();
        let data_config = DataLoadingConfig {
            enabled: true,
            input_path: Some("/data/in".to_string()),
            output_path: None,
        };

        let mut pod_spec = PodSpec {
            containers: vec![Container {
                name: "main".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let primary_init =
            add_copilot_to_pod(&mut pod_spec, &data_config, &TestIo, &TestIo, &config);
        assert_eq!(primary_init, "copilot-downloader");

        let volumes = pod_spec.volumes.as_ref().unwrap();
        assert_eq!(volumes.len(), 2);

        let init = pod_spec.init_containers.as_ref().unwrap();
        assert_eq!(init.len(), 1);
        assert_eq!(init[0].name, "copilot-downloader");
        let args = init[0].args.as_ref().unwrap();
        assert!(args.contains(&"s3://bucket/inputs".to_string()));
        assert!(args.contains(&"/data/in".to_string()));

        assert_eq!(pod_spec.containers.len(), 2);
        let sidecar = &pod_spec.containers[1];
        assert_eq!(sidecar.name, "copilot-sidecar");
        let args = sidecar.args.as_ref().unwrap();
        assert!(args.contains(&"s3://bucket/outputs".to_string()));
        assert!(args.contains(&config.default_output_path));
    }

    #[test]
    fn primary_container_mounts_both_volumes() {
        let config = CopilotConfig::default();
        let data_config = DataLoadingConfig {
            enabled: true,
            input_path: None,
            output_path: None,
        };

        let mut container = Container {
            name: "main".to_string(),
            ..Default::default()
        };

        add_copilot_to_container(&mut container, &data_config, &config);

        let mounts = container.volume_mounts.as_ref().unwrap();
        assert_eq!(mounts.len(), 2);
        assert_eq!(mounts[0].name, INPUTS_VOLUME_NAME);
        assert_eq!(mounts[0].mount_path, config.default_input_path);
        assert_eq!(mounts[0].read_only, Some(true));
        assert_eq!(mounts[1].name, OUTPUTS_VOLUME_NAME);
        assert_eq!(mounts[1].mount_path, config.default_output_path);
    }
}
