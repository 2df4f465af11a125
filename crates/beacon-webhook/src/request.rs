//! Per-call injection request: resolved namespace, bound WorkloadConfig and
//! the Pod-level settings read from annotations.

use k8s_openapi::api::core::v1::{Namespace, Pod};
use tracing::{debug, warn};

use beacon_common::crd::WorkloadConfig;
use beacon_common::kube_utils::get_field;
use beacon_common::INSTANCE_LABEL;

use crate::annotations;
use crate::client::ClusterReader;
use crate::error::InjectionError;
use crate::features::InjectionInfo;

/// Install settings a Pod can override through annotations
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PodSettings {
    /// Technologies to instrument, query-escaped
    pub technologies: String,
    /// Agent install path inside application containers
    pub install_path: String,
    /// Explicit installer download URL, empty for the default
    pub installer_url: String,
    /// Runtime failure policy of the install init container
    pub failure_policy: String,
    /// Image of the install init container
    pub image: String,
}

impl PodSettings {
    /// Read settings from the Pod, using `image` for the init container
    pub fn from_pod(pod: &Pod, image: &str) -> Self {
        let fields = pod.metadata.annotations.as_ref();
        let technologies = get_field(
            fields,
            annotations::TECHNOLOGIES,
            annotations::DEFAULT_TECHNOLOGIES,
        );
        Self {
            technologies: url::form_urlencoded::byte_serialize(technologies.as_bytes()).collect(),
            install_path: get_field(
                fields,
                annotations::INSTALL_PATH,
                annotations::DEFAULT_INSTALL_PATH,
            ),
            installer_url: get_field(
                fields,
                annotations::INSTALLER_URL,
                annotations::DEFAULT_INSTALLER_URL,
            ),
            failure_policy: get_field(
                fields,
                annotations::FAILURE_POLICY,
                annotations::DEFAULT_FAILURE_POLICY,
            ),
            image: image.to_string(),
        }
    }
}

/// Everything one admission call works with
#[derive(Clone, Debug)]
pub struct InjectionRequest {
    /// The admitted Pod as received
    pub pod: Pod,
    /// Namespace of the admitted Pod
    pub namespace: Namespace,
    /// WorkloadConfig bound to the namespace
    pub config: WorkloadConfig,
    /// Capabilities requested by the Pod
    pub info: InjectionInfo,
    /// Annotation-derived install settings
    pub settings: PodSettings,
}

impl InjectionRequest {
    /// Name of the request namespace
    pub fn namespace_name(&self) -> &str {
        self.namespace.metadata.name.as_deref().unwrap_or_default()
    }
}

/// Find the namespace and the WorkloadConfig it is bound to.
///
/// One lookup each, no retries.
pub async fn resolve_config(
    reader: &dyn ClusterReader,
    namespace: &str,
) -> Result<(Namespace, WorkloadConfig), InjectionError> {
    let ns = reader
        .get_namespace(namespace)
        .await
        .map_err(|source| InjectionError::NamespaceLookup {
            namespace: namespace.to_string(),
            source,
        })?;

    let Some(config_name) = ns
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get(INSTANCE_LABEL))
        .cloned()
    else {
        debug!(namespace, "namespace is not bound to a WorkloadConfig");
        return Err(InjectionError::BindingMissing {
            namespace: namespace.to_string(),
        });
    };

    match reader.get_workload_config(&config_name).await {
        Ok(Some(config)) => Ok((ns, config)),
        Ok(None) => {
            warn!(
                namespace,
                workload_config = %config_name,
                "namespace is bound to a WorkloadConfig that does not exist"
            );
            Err(InjectionError::TargetMissing {
                config: config_name,
                namespace: namespace.to_string(),
            })
        }
        Err(source) if source.is_not_found() => Err(InjectionError::TargetMissing {
            config: config_name,
            namespace: namespace.to_string(),
        }),
        Err(source) => Err(InjectionError::ConfigLookup {
            config: config_name,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockClusterReader;
    use beacon_common::crd::WorkloadConfigSpec;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn namespace(name: &str, bound_to: Option<&str>) -> Namespace {
        Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: bound_to.map(|config| {
                    BTreeMap::from([(INSTANCE_LABEL.to_string(), config.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn pod_with(annotations: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn settings_default_when_unannotated() {
        let settings = PodSettings::from_pod(&Pod::default(), "beacon:1.0");
        assert_eq!(settings.technologies, "all");
        assert_eq!(settings.install_path, "/opt/beacon/oneagent-paas");
        assert_eq!(settings.installer_url, "");
        assert_eq!(settings.failure_policy, "silent");
        assert_eq!(settings.image, "beacon:1.0");
    }

    #[test]
    fn technologies_are_query_escaped() {
        let pod = pod_with(&[
            (annotations::TECHNOLOGIES, "java,nodejs"),
            (annotations::FAILURE_POLICY, "fail"),
        ]);
        let settings = PodSettings::from_pod(&pod, "img");
        assert_eq!(settings.technologies, "java%2Cnodejs");
        assert_eq!(settings.failure_policy, "fail");
    }

    #[tokio::test]
    async fn resolves_bound_config() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_namespace()
            .returning(|name| Ok(namespace(name, Some("prod"))));
        reader
            .expect_get_workload_config()
            .returning(|name| Ok(Some(WorkloadConfig::new(name, WorkloadConfigSpec::default()))));

        let (ns, config) = resolve_config(&reader, "payments").await.unwrap();
        assert_eq!(ns.metadata.name.as_deref(), Some("payments"));
        assert_eq!(config.name(), "prod");
    }

    /// Story: an unbound namespace is denied without ever looking for a config
    #[tokio::test]
    async fn story_unbound_namespace_is_denied() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_namespace()
            .returning(|name| Ok(namespace(name, None)));
        reader.expect_get_workload_config().never();

        let err = resolve_config(&reader, "payments").await.unwrap_err();
        assert!(matches!(err, InjectionError::BindingMissing { ref namespace } if namespace == "payments"));
        assert_eq!(err.status_code(), 400);
    }

    #[tokio::test]
    async fn missing_config_is_denied() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_namespace()
            .returning(|name| Ok(namespace(name, Some("gone"))));
        reader.expect_get_workload_config().returning(|_| Ok(None));

        let err = resolve_config(&reader, "payments").await.unwrap_err();
        assert!(matches!(err, InjectionError::TargetMissing { .. }));
        assert!(err.to_string().contains("'gone'"));
        assert!(err.to_string().contains("'payments'"));
    }

    #[tokio::test]
    async fn namespace_lookup_failure_is_internal() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_namespace()
            .returning(|name| Err(beacon_common::Error::not_found("Namespace", name)));

        let err = resolve_config(&reader, "payments").await.unwrap_err();
        assert!(matches!(err, InjectionError::NamespaceLookup { .. }));
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn config_lookup_failure_is_internal() {
        let mut reader = MockClusterReader::new();
        reader
            .expect_get_namespace()
            .returning(|name| Ok(namespace(name, Some("prod"))));
        reader
            .expect_get_workload_config()
            .returning(|_| Err(beacon_common::Error::internal("connection refused")));

        let err = resolve_config(&reader, "payments").await.unwrap_err();
        assert!(matches!(err, InjectionError::ConfigLookup { .. }));
        assert_eq!(err.status_code(), 500);
    }
}
