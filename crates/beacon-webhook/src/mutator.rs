//! Admission decision for one Pod
//!
//! [`PodMutator`] ties the pieces together: resolve the bound
//! WorkloadConfig, decide which capabilities apply, make sure the supporting
//! secrets exist, then either inject a fresh Pod or repair an already
//! injected one. All cluster access goes through the injected collaborators.

use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::EventType;
use kube::Resource;
use tracing::{debug, info, instrument};

use beacon_common::crd::WorkloadConfig;
use beacon_common::events::{actions, reasons, EventPublisher};
use beacon_common::{Error, INGEST_TOKEN_FIELD, INGEST_URL_FIELD};

use crate::annotations;
use crate::client::ClusterReader;
use crate::container::DeploymentMetadata;
use crate::error::InjectionError;
use crate::features::{Capability, InjectionInfo};
use crate::injector::Injection;
use crate::owner::{resolve_workload, DEFAULT_MAX_OWNER_DEPTH};
use crate::reinvocation::retrofit;
use crate::request::{resolve_config, InjectionRequest, PodSettings};
use crate::secrets::{DataIngestFields, SecretEnsurer};
use crate::volumes::VolumeProvider;

/// Note returned when the bound config has no application injection mode
pub const APP_INJECTION_DISABLED: &str = "app injection is disabled";

/// Note returned when every capability is switched off
pub const NO_FEATURES_ENABLED: &str = "no features are enabled, skipping injection";

/// Process-wide settings of the mutator
#[derive(Clone, Debug)]
pub struct MutatorSettings {
    /// Image of the webhook itself, the default install init container image
    pub webhook_image: String,
    /// Cluster identifier written into deployment metadata
    pub cluster_id: String,
    /// Owner objects fetched before giving up
    pub max_owner_depth: usize,
}

impl MutatorSettings {
    /// Settings with the default owner depth
    pub fn new(webhook_image: impl Into<String>, cluster_id: impl Into<String>) -> Self {
        Self {
            webhook_image: webhook_image.into(),
            cluster_id: cluster_id.into(),
            max_owner_depth: DEFAULT_MAX_OWNER_DEPTH,
        }
    }
}

/// Result of a successful admission decision
#[derive(Clone, Debug, PartialEq)]
pub enum MutationOutcome {
    /// Allow the Pod as is
    Unchanged {
        /// Optional explanation for the response
        note: Option<String>,
    },
    /// Allow the mutated Pod
    Patched {
        /// The mutated Pod
        pod: Box<Pod>,
        /// Warnings attached to the response
        warnings: Vec<String>,
    },
}

impl MutationOutcome {
    fn unchanged(note: &str) -> Self {
        Self::Unchanged {
            note: Some(note.to_string()),
        }
    }
}

/// Decides and performs the mutation of admitted Pods
pub struct PodMutator {
    reader: Arc<dyn ClusterReader>,
    secrets: Arc<dyn SecretEnsurer>,
    events: Arc<dyn EventPublisher>,
    volumes: VolumeProvider,
    settings: MutatorSettings,
}

impl PodMutator {
    /// Create a mutator from its collaborators
    pub fn new(
        reader: Arc<dyn ClusterReader>,
        secrets: Arc<dyn SecretEnsurer>,
        events: Arc<dyn EventPublisher>,
        volumes: VolumeProvider,
        settings: MutatorSettings,
    ) -> Self {
        Self {
            reader,
            secrets,
            events,
            volumes,
            settings,
        }
    }

    /// Decide what to do with `pod` admitted into `namespace`
    #[instrument(skip(self, pod), fields(pod = %pod_label(&pod)))]
    pub async fn mutate(&self, namespace: &str, pod: Pod) -> Result<MutationOutcome, InjectionError> {
        let (ns, config) = resolve_config(self.reader.as_ref(), namespace).await?;

        let mut info = InjectionInfo::from_annotations(pod.metadata.annotations.as_ref());
        if config.metadata_enrichment_disabled() {
            info = info.without(Capability::DataIngest);
        }
        if !config.need_app_injection() {
            debug!(workload_config = %config.name(), "{APP_INJECTION_DISABLED}");
            return Ok(MutationOutcome::unchanged(APP_INJECTION_DISABLED));
        }
        if !info.any_enabled() {
            debug!(workload_config = %config.name(), "{NO_FEATURES_ENABLED}");
            return Ok(MutationOutcome::unchanged(NO_FEATURES_ENABLED));
        }

        let image = config
            .init_image()
            .unwrap_or(self.settings.webhook_image.as_str())
            .to_string();
        let settings = PodSettings::from_pod(&pod, &image);
        let request = InjectionRequest {
            pod,
            namespace: ns,
            config,
            info,
            settings,
        };

        let ingest_fields = self.ensure_secrets(&request).await?;

        if is_injected(&request.pod) {
            self.reinvoke(request, ingest_fields.as_ref()).await
        } else {
            self.inject(request, ingest_fields.as_ref()).await
        }
    }

    async fn ensure_secrets(
        &self,
        request: &InjectionRequest,
    ) -> Result<Option<DataIngestFields>, InjectionError> {
        let namespace = request.namespace_name();
        let provisioning = |source| InjectionError::SecretProvisioning {
            namespace: namespace.to_string(),
            source,
        };

        self.secrets
            .ensure_init_secret(&request.config, namespace)
            .await
            .map_err(provisioning)?;

        if !request.info.is_enabled(Capability::DataIngest) {
            return Ok(None);
        }
        let fields = self
            .secrets
            .ensure_endpoint_secret(&request.config, namespace)
            .await
            .map_err(provisioning)?;
        for key in [INGEST_URL_FIELD, INGEST_TOKEN_FIELD] {
            if !fields.get(key).is_some_and(|v| !v.is_empty()) {
                return Err(provisioning(Error::validation_for_field(
                    key,
                    "data-ingest endpoint field is missing",
                )));
            }
        }
        Ok(Some(fields))
    }

    async fn reinvoke(
        &self,
        request: InjectionRequest,
        ingest_fields: Option<&DataIngestFields>,
    ) -> Result<MutationOutcome, InjectionError> {
        if !request.config.reinvocation_policy_enabled() {
            debug!("pod already injected and reinvocation policy is disabled");
            return Ok(MutationOutcome::Unchanged { note: None });
        }

        let metadata = DeploymentMetadata::for_config(&request.config, &self.settings.cluster_id)
            .render();
        let injection = Injection {
            config: &request.config,
            info: &request.info,
            settings: &request.settings,
            volumes: &self.volumes,
            deployment_metadata: &metadata,
            workload: None,
            ingest_fields,
        };

        let mut pod = request.pod.clone();
        if !retrofit(&mut pod, &injection) {
            debug!("injected pod is fully covered");
            return Ok(MutationOutcome::Unchanged { note: None });
        }

        info!(namespace = %request.namespace_name(), "updated injected pod");
        self.publish(
            &request.config,
            reasons::UPDATE_POD,
            format!(
                "Updating pod {} in namespace {} with missing containers",
                pod_label(&request.pod),
                request.namespace_name()
            ),
        )
        .await;
        Ok(MutationOutcome::Patched {
            pod: Box::new(pod),
            warnings: request.config.preview_warnings(),
        })
    }

    async fn inject(
        &self,
        request: InjectionRequest,
        ingest_fields: Option<&DataIngestFields>,
    ) -> Result<MutationOutcome, InjectionError> {
        let namespace = request.namespace_name();
        let workload = if request.info.is_enabled(Capability::DataIngest) {
            let identity = resolve_workload(
                self.reader.as_ref(),
                &request.pod,
                namespace,
                self.settings.max_owner_depth,
            )
            .await
            .map_err(|source| InjectionError::OwnerResolution {
                pod: pod_label(&request.pod),
                source,
            })?;
            Some(identity)
        } else {
            None
        };

        let metadata = DeploymentMetadata::for_config(&request.config, &self.settings.cluster_id)
            .render();
        let injection = Injection {
            config: &request.config,
            info: &request.info,
            settings: &request.settings,
            volumes: &self.volumes,
            deployment_metadata: &metadata,
            workload: workload.as_ref(),
            ingest_fields,
        };
        let pod = injection.apply(request.pod.clone());

        info!(
            namespace,
            workload_config = %request.config.name(),
            injected = %request.info.render(),
            "injected pod"
        );
        self.publish(
            &request.config,
            reasons::INJECT,
            format!(
                "Injecting the necessary info into pod {} in namespace {}",
                pod_label(&request.pod),
                namespace
            ),
        )
        .await;
        Ok(MutationOutcome::Patched {
            pod: Box::new(pod),
            warnings: request.config.preview_warnings(),
        })
    }

    async fn publish(&self, config: &WorkloadConfig, reason: &str, note: String) {
        self.events
            .publish(
                &config.object_ref(&()),
                EventType::Normal,
                reason,
                actions::ADMIT,
                Some(note),
            )
            .await;
    }
}

fn is_injected(pod: &Pod) -> bool {
    pod.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(annotations::INJECTED))
        .is_some_and(|v| !v.is_empty())
}

/// Pod name, or its generateName while the name is still unassigned
fn pod_label(pod: &Pod) -> String {
    pod.metadata
        .name
        .clone()
        .or_else(|| pod.metadata.generate_name.clone())
        .unwrap_or_default()
}
