//! First-time injection of a Pod
//!
//! [`Injection`] gathers everything one admission call resolved and turns
//! an untouched Pod into the injected one in a single pass. The same plan is
//! reused by the reinvocation path to repair containers added later.

use k8s_openapi::api::core::v1::{Pod, Volume};

use beacon_common::crd::WorkloadConfig;

use crate::container::{instrument, AgentPlan, ContainerPlan, IngestPlan};
use crate::features::{Capability, InjectionInfo};
use crate::init_container::{add_container_entry, build_install_container};
use crate::owner::WorkloadIdentity;
use crate::request::PodSettings;
use crate::secrets::DataIngestFields;
use crate::volumes::{config_volume, data_ingest_volumes, one_agent_volumes, VolumeProvider};

/// Resolved inputs of one injection
#[derive(Clone, Copy, Debug)]
pub struct Injection<'a> {
    /// Bound WorkloadConfig
    pub config: &'a WorkloadConfig,
    /// Enabled capabilities
    pub info: &'a InjectionInfo,
    /// Annotation-derived install settings
    pub settings: &'a PodSettings,
    /// Source of the agent binary volume
    pub volumes: &'a VolumeProvider,
    /// Rendered deployment metadata
    pub deployment_metadata: &'a str,
    /// Workload owning the Pod, required for enrichment
    pub workload: Option<&'a WorkloadIdentity>,
    /// Ensured endpoint fields, required for enrichment
    pub ingest_fields: Option<&'a DataIngestFields>,
}

impl<'a> Injection<'a> {
    /// Per-container plan covering every enabled capability.
    ///
    /// Enrichment is only planned when both the workload and the endpoint
    /// fields are known.
    pub fn plan(&self) -> ContainerPlan<'a> {
        let one_agent = self
            .info
            .is_enabled(Capability::OneAgent)
            .then_some(AgentPlan {
                config: self.config,
                install_path: &self.settings.install_path,
            });
        let data_ingest = match (self.workload, self.ingest_fields) {
            (Some(workload), Some(fields)) if self.info.is_enabled(Capability::DataIngest) => {
                Some(IngestPlan { workload, fields })
            }
            _ => None,
        };
        ContainerPlan {
            deployment_metadata: self.deployment_metadata,
            one_agent,
            data_ingest,
        }
    }

    fn pod_volumes(&self, plan: &ContainerPlan<'_>) -> Vec<Volume> {
        let mut volumes = vec![config_volume()];
        if plan.one_agent.is_some() {
            volumes.extend(one_agent_volumes(self.volumes, self.config));
        }
        if plan.data_ingest.is_some() {
            volumes.extend(data_ingest_volumes());
        }
        volumes
    }

    /// Inject a Pod that carries no marker yet
    pub fn apply(&self, mut pod: Pod) -> Pod {
        let plan = self.plan();
        let workload = plan.data_ingest.map(|ingest| ingest.workload);
        let mut install =
            build_install_container(&pod, self.settings, self.config, self.info, workload);

        let spec = pod.spec.get_or_insert_with(Default::default);
        spec.volumes
            .get_or_insert_with(Vec::new)
            .extend(self.pod_volumes(&plan));

        spec.containers = std::mem::take(&mut spec.containers)
            .into_iter()
            .enumerate()
            .map(|(idx, container)| {
                if plan.one_agent.is_some() {
                    add_container_entry(&mut install, idx + 1, &container);
                }
                instrument(container, &plan)
            })
            .collect();
        spec.init_containers
            .get_or_insert_with(Vec::new)
            .push(install);

        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend(self.info.injected_annotations());
        pod
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotations;
    use crate::container::{find_env, has_data_ingest, has_one_agent};
    use crate::init_container::{CONTAINERS_COUNT_ENV, INSTALL_CONTAINER_NAME};
    use crate::volumes::{DATA_INGEST_ENDPOINT_VOLUME, DATA_INGEST_VOLUME, INJECTION_CONFIG_VOLUME};
    use beacon_common::crd::{ApplicationMonitoringSpec, WorkloadConfigSpec};
    use beacon_common::{INGEST_TOKEN_FIELD, INGEST_URL_FIELD};
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(containers: &[&str]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("checkout-abcde".to_string()),
                annotations: Some(BTreeMap::from([(
                    annotations::ONEAGENT_INJECT.to_string(),
                    "true".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: containers
                    .iter()
                    .map(|name| Container {
                        name: name.to_string(),
                        image: Some(format!("{name}:1")),
                        ..Default::default()
                    })
                    .collect(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn config() -> WorkloadConfig {
        let mut config = WorkloadConfig::new("prod", WorkloadConfigSpec::default());
        config.spec.one_agent.application_monitoring = Some(ApplicationMonitoringSpec {
            use_csi_driver: true,
            ..Default::default()
        });
        config
    }

    fn volume_names(pod: &Pod) -> Vec<String> {
        pod.spec
            .iter()
            .flat_map(|s| s.volumes.iter().flatten())
            .map(|v| v.name.clone())
            .collect()
    }

    fn install(pod: &Pod) -> &Container {
        pod.spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .and_then(|ics| ics.iter().find(|c| c.name == INSTALL_CONTAINER_NAME))
            .expect("install container")
    }

    /// Story: agent-only injection with enrichment disabled by the config
    #[test]
    fn story_agent_only_injection() {
        let config = config();
        let info = InjectionInfo::from_annotations(None).without(Capability::DataIngest);
        let settings = PodSettings::from_pod(&Pod::default(), "beacon:1.0");
        let provider = VolumeProvider::default();
        let injection = Injection {
            config: &config,
            info: &info,
            settings: &settings,
            volumes: &provider,
            deployment_metadata: "meta",
            workload: None,
            ingest_fields: None,
        };

        let injected = injection.apply(pod(&["web", "sidecar", "proxy"]));

        let marker = injected
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::INJECTED))
            .cloned();
        assert_eq!(marker.as_deref(), Some("oneagent"));

        let names = volume_names(&injected);
        assert!(names.contains(&INJECTION_CONFIG_VOLUME.to_string()));
        assert!(!names.contains(&DATA_INGEST_VOLUME.to_string()));
        assert!(!names.contains(&DATA_INGEST_ENDPOINT_VOLUME.to_string()));

        let ic = install(&injected);
        assert_eq!(
            find_env(ic, CONTAINERS_COUNT_ENV).and_then(|e| e.value.as_deref()),
            Some("3")
        );
        assert_eq!(
            find_env(ic, "CONTAINER_3_NAME").and_then(|e| e.value.as_deref()),
            Some("proxy")
        );

        let containers = &injected.spec.as_ref().unwrap().containers;
        assert!(containers.iter().all(has_one_agent));
        assert!(!containers.iter().any(has_data_ingest));
    }

    #[test]
    fn enrichment_only_skips_agent_entries() {
        let config = config();
        let info = InjectionInfo::new([(Capability::OneAgent, false), (Capability::DataIngest, true)]);
        let settings = PodSettings::from_pod(&Pod::default(), "beacon:1.0");
        let provider = VolumeProvider::default();
        let workload = WorkloadIdentity {
            kind: "Deployment".to_string(),
            name: "checkout".to_string(),
        };
        let fields = BTreeMap::from([
            (INGEST_URL_FIELD.to_string(), "https://t/api/v2/metrics/ingest".to_string()),
            (INGEST_TOKEN_FIELD.to_string(), "tok".to_string()),
        ]);
        let injection = Injection {
            config: &config,
            info: &info,
            settings: &settings,
            volumes: &provider,
            deployment_metadata: "meta",
            workload: Some(&workload),
            ingest_fields: Some(&fields),
        };

        let injected = injection.apply(pod(&["web"]));

        let ic = install(&injected);
        assert!(find_env(ic, "CONTAINER_1_NAME").is_none());
        assert_eq!(
            volume_names(&injected),
            vec![
                INJECTION_CONFIG_VOLUME.to_string(),
                DATA_INGEST_VOLUME.to_string(),
                DATA_INGEST_ENDPOINT_VOLUME.to_string(),
            ]
        );
        let web = &injected.spec.as_ref().unwrap().containers[0];
        assert!(has_data_ingest(web));
        assert!(!has_one_agent(web));
    }

    #[test]
    fn existing_init_containers_run_first() {
        let config = config();
        let info = InjectionInfo::new([(Capability::OneAgent, true)]);
        let settings = PodSettings::from_pod(&Pod::default(), "beacon:1.0");
        let provider = VolumeProvider::default();
        let injection = Injection {
            config: &config,
            info: &info,
            settings: &settings,
            volumes: &provider,
            deployment_metadata: "meta",
            workload: None,
            ingest_fields: None,
        };
        let mut p = pod(&["web"]);
        if let Some(spec) = p.spec.as_mut() {
            spec.init_containers = Some(vec![Container {
                name: "migrate".to_string(),
                ..Default::default()
            }]);
        }

        let injected = injection.apply(p);

        let init_names: Vec<_> = injected
            .spec
            .as_ref()
            .and_then(|s| s.init_containers.as_ref())
            .map(|ics| ics.iter().map(|c| c.name.as_str()).collect())
            .unwrap_or_default();
        assert_eq!(init_names, vec!["migrate", INSTALL_CONTAINER_NAME]);
    }
}
