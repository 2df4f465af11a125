//! The install init container
//!
//! Runs the install script from the injection config secret before the
//! application containers start. Its environment tells the script which
//! capabilities to set up and which containers to write agent config for.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, ObjectFieldSelector, Pod, VolumeMount,
};

use beacon_common::crd::WorkloadConfig;

use crate::container::{env, find_env, has_one_agent, WORKLOAD_KIND_ENV, WORKLOAD_NAME_ENV};
use crate::features::{Capability, InjectionInfo};
use crate::owner::WorkloadIdentity;
use crate::request::PodSettings;
use crate::volumes::{
    DATA_INGEST_VOLUME, INJECTION_CONFIG_VOLUME, ONEAGENT_BIN_VOLUME, ONEAGENT_SHARE_VOLUME,
};

/// Name of the install init container
pub const INSTALL_CONTAINER_NAME: &str = "install-beacon";

/// Number of application containers the script configures
pub const CONTAINERS_COUNT_ENV: &str = "CONTAINERS_COUNT";
/// Runtime failure policy of the script
pub const FAILURE_POLICY_ENV: &str = "FAILURE_POLICY";
/// Whether the agent is set up
pub const ONEAGENT_INJECTED_ENV: &str = "ONEAGENT_INJECTED";
/// Whether enrichment is set up
pub const DATA_INGEST_INJECTED_ENV: &str = "DATA_INGEST_INJECTED";

const POD_NAME_ENV: &str = "K8S_PODNAME";
const POD_UID_ENV: &str = "K8S_PODUID";
const BASE_POD_NAME_ENV: &str = "K8S_BASEPODNAME";
const NAMESPACE_ENV: &str = "K8S_NAMESPACE";
const NODE_NAME_ENV: &str = "K8S_NODE_NAME";

const FLAVOR_ENV: &str = "FLAVOR";
const TECHNOLOGIES_ENV: &str = "TECHNOLOGIES";
const INSTALL_PATH_ENV: &str = "INSTALLPATH";
const INSTALLER_URL_ENV: &str = "INSTALLER_URL";
const MODE_ENV: &str = "MODE";

const FLAVOR_MULTIDISTRO: &str = "multidistro";

const COMMAND: &str = "/usr/bin/env";
const ARGS: [&str; 2] = ["bash", "/mnt/config/init.sh"];

const CONFIG_MOUNT_PATH: &str = "/mnt/config";
const BIN_MOUNT_PATH: &str = "/mnt/bin";
const SHARE_MOUNT_PATH: &str = "/mnt/share";
const ENRICHMENT_MOUNT_PATH: &str = "/mnt/enrichment";

/// Build the install init container for a fresh injection.
///
/// Per-container entries are appended separately with
/// [`add_container_entry`].
pub fn build_install_container(
    pod: &Pod,
    settings: &PodSettings,
    config: &WorkloadConfig,
    info: &InjectionInfo,
    workload: Option<&WorkloadIdentity>,
) -> Container {
    let containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    let mut env_vars = vec![
        env(CONTAINERS_COUNT_ENV, containers.len().to_string()),
        env(FAILURE_POLICY_ENV, settings.failure_policy.clone()),
        field_env(POD_NAME_ENV, "metadata.name"),
        field_env(POD_UID_ENV, "metadata.uid"),
        env(BASE_POD_NAME_ENV, base_pod_name(pod)),
        field_env(NAMESPACE_ENV, "metadata.namespace"),
        field_env(NODE_NAME_ENV, "spec.nodeName"),
    ];
    let mut mounts = vec![mount(INJECTION_CONFIG_VOLUME, CONFIG_MOUNT_PATH)];

    if info.is_enabled(Capability::OneAgent) {
        env_vars.extend([
            env(FLAVOR_ENV, FLAVOR_MULTIDISTRO),
            env(TECHNOLOGIES_ENV, settings.technologies.clone()),
            env(INSTALL_PATH_ENV, settings.install_path.clone()),
            env(INSTALLER_URL_ENV, settings.installer_url.clone()),
            env(MODE_ENV, config.install_mode().as_str()),
            env(ONEAGENT_INJECTED_ENV, "true"),
        ]);
        mounts.extend([
            mount(ONEAGENT_BIN_VOLUME, BIN_MOUNT_PATH),
            mount(ONEAGENT_SHARE_VOLUME, SHARE_MOUNT_PATH),
        ]);
    } else {
        env_vars.push(env(ONEAGENT_INJECTED_ENV, "false"));
    }

    match workload.filter(|_| info.is_enabled(Capability::DataIngest)) {
        Some(workload) => {
            env_vars.extend([
                env(WORKLOAD_KIND_ENV, workload.kind.clone()),
                env(WORKLOAD_NAME_ENV, workload.name.clone()),
                env(DATA_INGEST_INJECTED_ENV, "true"),
            ]);
            mounts.push(mount(DATA_INGEST_VOLUME, ENRICHMENT_MOUNT_PATH));
        }
        None => env_vars.push(env(DATA_INGEST_INJECTED_ENV, "false")),
    }

    Container {
        name: INSTALL_CONTAINER_NAME.to_string(),
        image: Some(settings.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![COMMAND.to_string()]),
        args: Some(ARGS.iter().map(|a| a.to_string()).collect()),
        env: Some(env_vars),
        volume_mounts: Some(mounts),
        security_context: containers.first().and_then(|c| c.security_context.clone()),
        resources: config.init_resources(),
        ..Default::default()
    }
}

/// Append the name/image pair for the application container at one-based
/// position `index`
pub fn add_container_entry(install: &mut Container, index: usize, container: &Container) {
    install.env.get_or_insert_with(Vec::new).extend([
        env(&format!("CONTAINER_{index}_NAME"), container.name.clone()),
        env(
            &format!("CONTAINER_{index}_IMAGE"),
            container.image.clone().unwrap_or_default(),
        ),
    ]);
}

/// Set `CONTAINERS_COUNT` to `count`
pub fn set_containers_count(install: &mut Container, count: usize) {
    let vars = install.env.get_or_insert_with(Vec::new);
    let value = count.to_string();
    match vars.iter_mut().find(|e| e.name == CONTAINERS_COUNT_ENV) {
        Some(var) => var.value = Some(value),
        None => vars.push(env(CONTAINERS_COUNT_ENV, value)),
    }
}

/// Rewrite the `CONTAINER_<i>_*` entries and `CONTAINERS_COUNT` to match
/// `containers` in their current order.
///
/// Every container carrying the agent gets an entry at its one-based
/// position. Returns whether the install container changed.
pub fn sync_container_entries(install: &mut Container, containers: &[Container]) -> bool {
    let before = install.env.clone();
    if let Some(vars) = install.env.as_mut() {
        vars.retain(|e| !is_container_entry(&e.name));
    }
    for (idx, container) in containers.iter().enumerate() {
        if has_one_agent(container) {
            add_container_entry(install, idx + 1, container);
        }
    }
    set_containers_count(install, containers.len());
    install.env != before
}

fn is_container_entry(name: &str) -> bool {
    name.strip_prefix("CONTAINER_")
        .and_then(|rest| {
            rest.strip_suffix("_NAME")
                .or_else(|| rest.strip_suffix("_IMAGE"))
        })
        .is_some_and(|idx| !idx.is_empty() && idx.bytes().all(|b| b.is_ascii_digit()))
}

/// The install init container of an already injected Pod
pub fn find_install_container(pod: &mut Pod) -> Option<&mut Container> {
    pod.spec
        .as_mut()?
        .init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == INSTALL_CONTAINER_NAME)
}

/// Workload identity recorded in the install init container
pub fn recorded_workload(install: &Container) -> Option<WorkloadIdentity> {
    let value = |name| {
        find_env(install, name)
            .and_then(|e| e.value.clone())
            .unwrap_or_default()
    };
    find_env(install, WORKLOAD_NAME_ENV)?;
    Some(WorkloadIdentity {
        kind: value(WORKLOAD_KIND_ENV),
        name: value(WORKLOAD_NAME_ENV),
    })
}

/// The Pod's generateName up to its last `-`, or its name if unset
pub fn base_pod_name(pod: &Pod) -> String {
    match pod.metadata.generate_name.as_deref().filter(|g| !g.is_empty()) {
        Some(generate_name) => match generate_name.rfind('-') {
            Some(idx) => generate_name[..idx].to_string(),
            None => generate_name.to_string(),
        },
        None => pod.metadata.name.clone().unwrap_or_default(),
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}
