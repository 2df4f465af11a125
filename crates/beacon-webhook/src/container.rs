//! Per-container instrumentation
//!
//! Every application container goes through the same ordered pipeline of
//! pure steps: deployment metadata, then the agent, then data-ingest
//! enrichment. A step whose capability is not planned for the container
//! returns it untouched.

use k8s_openapi::api::core::v1::{
    Container, EnvVar, EnvVarSource, SecretKeySelector, VolumeMount,
};

use beacon_common::crd::WorkloadConfig;
use beacon_common::{INGEST_TOKEN_FIELD, INGEST_URL_FIELD, INIT_SECRET_NAME};

use crate::owner::WorkloadIdentity;
use crate::secrets::DataIngestFields;
use crate::volumes::{
    DATA_INGEST_ENDPOINT_VOLUME, DATA_INGEST_VOLUME, ONEAGENT_BIN_VOLUME, ONEAGENT_SHARE_VOLUME,
};

/// Deployment metadata env, written once per container
pub const DEPLOYMENT_METADATA_ENV: &str = "BEACON_DEPLOYMENT_METADATA";

/// Preload env; its presence marks a container as carrying the agent
pub const LD_PRELOAD_ENV: &str = "LD_PRELOAD";

/// Proxy env, sourced from the injection config secret
pub const PROXY_ENV: &str = "BEACON_PROXY";

/// Network zone env
pub const NETWORK_ZONE_ENV: &str = "BEACON_NETWORK_ZONE";

/// Kind of the workload owning the Pod
pub const WORKLOAD_KIND_ENV: &str = "BEACON_WORKLOAD_KIND";

/// Name of the workload owning the Pod
pub const WORKLOAD_NAME_ENV: &str = "BEACON_WORKLOAD_NAME";

/// Key of the proxy URL in the injection config secret
pub const PROXY_SECRET_KEY: &str = "proxy";

const LD_SO_PRELOAD_PATH: &str = "/etc/ld.so.preload";
const CONTAINER_CONF_PATH: &str = "/var/lib/beacon/oneagent/agent/config/container.conf";
const CUSTOM_PEM_PATH: &str = "/var/lib/beacon/oneagent/agent/customkeys/custom.pem";
const PRELOAD_LIBRARY: &str = "agent/lib64/liboneagentproc.so";

/// Where enrichment files are written
pub const ENRICHMENT_PATH: &str = "/var/lib/beacon/enrichment";
const ENRICHMENT_ENDPOINT_PATH: &str = "/var/lib/beacon/enrichment/endpoint";

/// Identifies how the agent was deployed, for the backend's bookkeeping
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeploymentMetadata {
    orchestration_tech: &'static str,
    cluster_id: String,
}

impl DeploymentMetadata {
    /// Metadata for Pods bound to `config` in the cluster `cluster_id`
    pub fn for_config(config: &WorkloadConfig, cluster_id: &str) -> Self {
        let orchestration_tech = if config.cloud_native_full_stack_mode() {
            "Operator-cloud_native_fullstack"
        } else {
            "Operator-application_monitoring"
        };
        Self {
            orchestration_tech,
            cluster_id: cluster_id.to_string(),
        }
    }

    /// Value of [`DEPLOYMENT_METADATA_ENV`]
    pub fn render(&self) -> String {
        format!(
            "orchestration_tech={};script_version={};orchestrator_id={}",
            self.orchestration_tech,
            env!("CARGO_PKG_VERSION"),
            self.cluster_id
        )
    }
}

/// Agent inputs for one container
#[derive(Clone, Copy, Debug)]
pub struct AgentPlan<'a> {
    /// Bound WorkloadConfig (proxy, network zone, TLS)
    pub config: &'a WorkloadConfig,
    /// Agent install path inside the container
    pub install_path: &'a str,
}

/// Enrichment inputs for one container
#[derive(Clone, Copy, Debug)]
pub struct IngestPlan<'a> {
    /// Workload owning the Pod
    pub workload: &'a WorkloadIdentity,
    /// Ensured endpoint fields
    pub fields: &'a DataIngestFields,
}

/// What to apply to a container
#[derive(Clone, Copy, Debug)]
pub struct ContainerPlan<'a> {
    /// Rendered deployment metadata
    pub deployment_metadata: &'a str,
    /// Agent inputs, `None` if the agent is not applied
    pub one_agent: Option<AgentPlan<'a>>,
    /// Enrichment inputs, `None` if enrichment is not applied
    pub data_ingest: Option<IngestPlan<'a>>,
}

impl<'a> ContainerPlan<'a> {
    /// Narrow the plan to the capabilities a container is missing
    pub fn restricted(&self, one_agent: bool, data_ingest: bool) -> ContainerPlan<'a> {
        ContainerPlan {
            deployment_metadata: self.deployment_metadata,
            one_agent: self.one_agent.filter(|_| one_agent),
            data_ingest: self.data_ingest.filter(|_| data_ingest),
        }
    }

    /// Nothing would be applied
    pub fn is_empty(&self) -> bool {
        self.one_agent.is_none() && self.data_ingest.is_none()
    }
}

type Step = fn(Container, &ContainerPlan<'_>) -> Container;

const PIPELINE: [Step; 3] = [with_deployment_metadata, with_one_agent, with_data_ingest];

/// Run a container through the full pipeline
pub fn instrument(container: Container, plan: &ContainerPlan<'_>) -> Container {
    PIPELINE.iter().fold(container, |c, step| step(c, plan))
}

/// Container carries the agent
pub fn has_one_agent(container: &Container) -> bool {
    has_env(container, LD_PRELOAD_ENV)
}

/// Container carries data-ingest enrichment
pub fn has_data_ingest(container: &Container) -> bool {
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|m| m.name == DATA_INGEST_ENDPOINT_VOLUME)
}

/// Find an env var by name
pub fn find_env<'c>(container: &'c Container, name: &str) -> Option<&'c EnvVar> {
    container.env.iter().flatten().find(|e| e.name == name)
}

fn has_env(container: &Container, name: &str) -> bool {
    find_env(container, name).is_some()
}

/// Plain env var
pub fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn mount(volume: &str, path: &str, sub_path: Option<String>) -> VolumeMount {
    VolumeMount {
        name: volume.to_string(),
        mount_path: path.to_string(),
        sub_path,
        ..Default::default()
    }
}

fn push_env(container: &mut Container, vars: impl IntoIterator<Item = EnvVar>) {
    container.env.get_or_insert_with(Vec::new).extend(vars);
}

fn push_mounts(container: &mut Container, mounts: impl IntoIterator<Item = VolumeMount>) {
    container
        .volume_mounts
        .get_or_insert_with(Vec::new)
        .extend(mounts);
}

fn with_deployment_metadata(mut container: Container, plan: &ContainerPlan<'_>) -> Container {
    if plan.is_empty() || has_env(&container, DEPLOYMENT_METADATA_ENV) {
        return container;
    }
    push_env(
        &mut container,
        [env(DEPLOYMENT_METADATA_ENV, plan.deployment_metadata)],
    );
    container
}

fn with_one_agent(mut container: Container, plan: &ContainerPlan<'_>) -> Container {
    let Some(agent) = plan.one_agent else {
        return container;
    };

    let mut mounts = vec![
        mount(
            ONEAGENT_SHARE_VOLUME,
            LD_SO_PRELOAD_PATH,
            Some("ld.so.preload".to_string()),
        ),
        mount(ONEAGENT_BIN_VOLUME, agent.install_path, None),
        mount(
            ONEAGENT_SHARE_VOLUME,
            CONTAINER_CONF_PATH,
            Some(format!("container_{}.conf", container.name)),
        ),
    ];
    if agent.config.has_active_gate_tls() {
        mounts.push(mount(
            ONEAGENT_SHARE_VOLUME,
            CUSTOM_PEM_PATH,
            Some("custom.pem".to_string()),
        ));
    }
    push_mounts(&mut container, mounts);

    let mut vars = vec![env(
        LD_PRELOAD_ENV,
        format!("{}/{}", agent.install_path, PRELOAD_LIBRARY),
    )];
    if agent.config.has_proxy() {
        vars.push(EnvVar {
            name: PROXY_ENV.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: INIT_SECRET_NAME.to_string(),
                    key: PROXY_SECRET_KEY.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        });
    }
    if let Some(zone) = agent.config.network_zone() {
        vars.push(env(NETWORK_ZONE_ENV, zone));
    }
    push_env(&mut container, vars);
    container
}

fn with_data_ingest(mut container: Container, plan: &ContainerPlan<'_>) -> Container {
    let Some(ingest) = plan.data_ingest else {
        return container;
    };

    push_mounts(
        &mut container,
        [
            mount(DATA_INGEST_VOLUME, ENRICHMENT_PATH, None),
            mount(DATA_INGEST_ENDPOINT_VOLUME, ENRICHMENT_ENDPOINT_PATH, None),
        ],
    );

    let field = |key: &str| ingest.fields.get(key).cloned().unwrap_or_default();
    push_env(
        &mut container,
        [
            env(WORKLOAD_KIND_ENV, ingest.workload.kind.clone()),
            env(WORKLOAD_NAME_ENV, ingest.workload.name.clone()),
            env(INGEST_URL_FIELD, field(INGEST_URL_FIELD)),
            env(INGEST_TOKEN_FIELD, field(INGEST_TOKEN_FIELD)),
        ],
    );
    container
}

#[cfg(test)]
mod tests {
    use super::*;
    use beacon_common::crd::{
        ActiveGateSpec, AppInjectionSpec, ProxySpec, WorkloadConfigSpec,
    };
    use std::collections::BTreeMap;

    fn app(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: Some(format!("{name}:1.0")),
            ..Default::default()
        }
    }

    fn fields() -> DataIngestFields {
        BTreeMap::from([
            (INGEST_URL_FIELD.to_string(), "https://tenant/api/v2/metrics/ingest".to_string()),
            (INGEST_TOKEN_FIELD.to_string(), "t0ken".to_string()),
        ])
    }

    fn env_value<'c>(c: &'c Container, name: &str) -> Option<&'c str> {
        find_env(c, name).and_then(|e| e.value.as_deref())
    }

    fn mount_paths(c: &Container) -> Vec<&str> {
        c.volume_mounts
            .iter()
            .flatten()
            .map(|m| m.mount_path.as_str())
            .collect()
    }

    #[test]
    fn deployment_metadata_names_mode_and_cluster() {
        let mut config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        config.spec.one_agent.cloud_native_full_stack = Some(AppInjectionSpec::default());
        let rendered = DeploymentMetadata::for_config(&config, "cluster-uid").render();
        assert!(rendered.starts_with("orchestration_tech=Operator-cloud_native_fullstack;"));
        assert!(rendered.contains(&format!("script_version={}", env!("CARGO_PKG_VERSION"))));
        assert!(rendered.ends_with(";orchestrator_id=cluster-uid"));

        let plain = WorkloadConfig::new("plain", WorkloadConfigSpec::default());
        assert!(DeploymentMetadata::for_config(&plain, "c")
            .render()
            .starts_with("orchestration_tech=Operator-application_monitoring;"));
    }

    #[test]
    fn agent_step_adds_preload_and_mounts() {
        let config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        let plan = ContainerPlan {
            deployment_metadata: "meta",
            one_agent: Some(AgentPlan {
                config: &config,
                install_path: "/opt/beacon/oneagent-paas",
            }),
            data_ingest: None,
        };

        let c = instrument(app("web"), &plan);

        assert_eq!(
            env_value(&c, LD_PRELOAD_ENV),
            Some("/opt/beacon/oneagent-paas/agent/lib64/liboneagentproc.so")
        );
        assert_eq!(env_value(&c, DEPLOYMENT_METADATA_ENV), Some("meta"));
        assert!(find_env(&c, PROXY_ENV).is_none());
        assert!(find_env(&c, NETWORK_ZONE_ENV).is_none());
        assert_eq!(
            mount_paths(&c),
            vec![
                "/etc/ld.so.preload",
                "/opt/beacon/oneagent-paas",
                "/var/lib/beacon/oneagent/agent/config/container.conf",
            ]
        );
        let conf = &c.volume_mounts.as_ref().unwrap()[2];
        assert_eq!(conf.sub_path.as_deref(), Some("container_web.conf"));
        assert!(has_one_agent(&c));
        assert!(!has_data_ingest(&c));
    }

    #[test]
    fn agent_step_honours_proxy_zone_and_tls() {
        let mut config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        config.spec.proxy = Some(ProxySpec {
            value: Some("http://proxy:3128".to_string()),
            value_from: None,
        });
        config.spec.network_zone = Some("eu-west".to_string());
        config.spec.active_gate = Some(ActiveGateSpec {
            tls_secret_name: Some("ag-tls".to_string()),
        });
        let plan = ContainerPlan {
            deployment_metadata: "meta",
            one_agent: Some(AgentPlan {
                config: &config,
                install_path: "/opt/agent",
            }),
            data_ingest: None,
        };

        let c = instrument(app("web"), &plan);

        let proxy = find_env(&c, PROXY_ENV).expect("proxy env");
        let selector = proxy
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
            .expect("secret ref");
        assert_eq!(selector.name, INIT_SECRET_NAME);
        assert_eq!(selector.key, PROXY_SECRET_KEY);
        assert_eq!(env_value(&c, NETWORK_ZONE_ENV), Some("eu-west"));
        assert!(mount_paths(&c).contains(&CUSTOM_PEM_PATH));
    }

    #[test]
    fn ingest_step_adds_identity_and_endpoint() {
        let workload = WorkloadIdentity {
            kind: "Deployment".to_string(),
            name: "checkout".to_string(),
        };
        let fields = fields();
        let plan = ContainerPlan {
            deployment_metadata: "meta",
            one_agent: None,
            data_ingest: Some(IngestPlan {
                workload: &workload,
                fields: &fields,
            }),
        };

        let c = instrument(app("web"), &plan);

        assert_eq!(env_value(&c, WORKLOAD_KIND_ENV), Some("Deployment"));
        assert_eq!(env_value(&c, WORKLOAD_NAME_ENV), Some("checkout"));
        assert_eq!(
            env_value(&c, INGEST_URL_FIELD),
            Some("https://tenant/api/v2/metrics/ingest")
        );
        assert_eq!(env_value(&c, INGEST_TOKEN_FIELD), Some("t0ken"));
        assert_eq!(
            mount_paths(&c),
            vec![ENRICHMENT_PATH, "/var/lib/beacon/enrichment/endpoint"]
        );
        assert!(has_data_ingest(&c));
        assert!(!has_one_agent(&c));
    }

    #[test]
    fn existing_deployment_metadata_is_kept() {
        let mut container = app("web");
        container.env = Some(vec![env(DEPLOYMENT_METADATA_ENV, "from-user")]);
        let config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        let plan = ContainerPlan {
            deployment_metadata: "meta",
            one_agent: Some(AgentPlan {
                config: &config,
                install_path: "/opt/agent",
            }),
            data_ingest: None,
        };

        let c = instrument(container, &plan);

        let count = c
            .env
            .iter()
            .flatten()
            .filter(|e| e.name == DEPLOYMENT_METADATA_ENV)
            .count();
        assert_eq!(count, 1);
        assert_eq!(env_value(&c, DEPLOYMENT_METADATA_ENV), Some("from-user"));
    }

    #[test]
    fn empty_plan_leaves_container_untouched() {
        let config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        let plan = ContainerPlan {
            deployment_metadata: "meta",
            one_agent: Some(AgentPlan {
                config: &config,
                install_path: "/opt/agent",
            }),
            data_ingest: None,
        }
        .restricted(false, true);

        assert!(plan.is_empty());
        assert_eq!(instrument(app("web"), &plan), app("web"));
    }
}
