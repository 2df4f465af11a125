//! WorkloadConfig Custom Resource Definition
//!
//! A WorkloadConfig describes how application Pods in bound namespaces are
//! instrumented: which agent mode is active, where the agent reports to, and
//! which optional enrichment features are switched on. Namespaces opt in by
//! carrying the `beacon.dev/instance=<name>` label.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ResourceRequirements;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// WorkloadConfig binds agent injection settings to namespaces.
///
/// Example:
/// ```yaml
/// apiVersion: beacon.dev/v1alpha1
/// kind: WorkloadConfig
/// metadata:
///   name: production
/// spec:
///   apiUrl: https://tenant.example.com/api
///   networkZone: eu-west
///   oneAgent:
///     applicationMonitoring:
///       useCSIDriver: true
///   features:
///     enableWebhookReinvocationPolicy: true
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "beacon.dev",
    version = "v1alpha1",
    kind = "WorkloadConfig",
    plural = "workloadconfigs",
    shortname = "wlc",
    printcolumn = r#"{"name":"ApiUrl","type":"string","jsonPath":".spec.apiUrl"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadConfigSpec {
    /// Tenant API endpoint the agents report to
    pub api_url: String,

    /// Name of the secret (in the operator namespace) holding API tokens.
    /// Defaults to the WorkloadConfig name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<String>,

    /// Proxy used by the agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxy: Option<ProxySpec>,

    /// Network zone the agents connect through
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_zone: Option<String>,

    /// Agent deployment mode
    #[serde(default)]
    pub one_agent: OneAgentSpec,

    /// ActiveGate settings relevant to injected agents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_gate: Option<ActiveGateSpec>,

    /// Feature switches
    #[serde(default)]
    pub features: FeatureFlags,
}

/// Proxy settings, either inline or read from a secret
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProxySpec {
    /// Proxy URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Name of a secret holding the proxy URL under the `proxy` key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// Agent deployment mode. At most one section is expected to be set.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OneAgentSpec {
    /// Host agent on every node, no application injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classic_full_stack: Option<HostInjectSpec>,

    /// Host agent plus application injection backed by the CSI driver
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_native_full_stack: Option<AppInjectionSpec>,

    /// Application injection only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub application_monitoring: Option<ApplicationMonitoringSpec>,

    /// Host monitoring only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_monitoring: Option<HostInjectSpec>,
}

/// Host-only agent settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HostInjectSpec {
    /// Extra arguments passed to the host agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
}

/// Settings for the install init container used by application injection
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AppInjectionSpec {
    /// Resources for the install init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<InitResources>,

    /// Image for the install init container. Defaults to the webhook image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_image: Option<String>,
}

/// Application-only monitoring settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationMonitoringSpec {
    /// Serve agent binaries through the CSI driver instead of downloading them
    #[serde(default, rename = "useCSIDriver")]
    pub use_csi_driver: bool,

    /// Resources for the install init container
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_resources: Option<InitResources>,

    /// Image for the install init container. Defaults to the webhook image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub init_image: Option<String>,
}

/// Resource requests and limits as plain quantity strings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitResources {
    /// Resource requests (e.g. `cpu: 30m`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, String>,
    /// Resource limits (e.g. `memory: 60Mi`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub limits: BTreeMap<String, String>,
}

impl InitResources {
    /// Convert to Kubernetes resource requirements
    pub fn to_requirements(&self) -> ResourceRequirements {
        let quantities = |m: &BTreeMap<String, String>| {
            (!m.is_empty()).then(|| {
                m.iter()
                    .map(|(k, v)| (k.clone(), Quantity(v.clone())))
                    .collect::<BTreeMap<_, _>>()
            })
        };
        ResourceRequirements {
            requests: quantities(&self.requests),
            limits: quantities(&self.limits),
            ..Default::default()
        }
    }
}

/// ActiveGate settings that injected agents need to know about
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActiveGateSpec {
    /// Secret with the ActiveGate TLS certificate; agents must trust it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

/// Feature switches evaluated by the admission webhook
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlags {
    /// Force data-ingest enrichment off for every Pod bound to this config
    #[serde(default)]
    pub disable_metadata_enrichment: bool,

    /// Repair containers added after the first injection on reinvocation
    #[serde(default)]
    pub enable_webhook_reinvocation_policy: bool,
}

/// Injection mode reported to the install init container
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InstallMode {
    /// Binaries are published into the Pod by the CSI driver
    Provisioned,
    /// Binaries are downloaded by the init container
    Installer,
}

impl InstallMode {
    /// Value written into the `MODE` env var
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioned => "provisioned",
            Self::Installer => "installer",
        }
    }
}

impl WorkloadConfig {
    /// Name of the WorkloadConfig
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Cloud-native fullstack mode is active
    pub fn cloud_native_full_stack_mode(&self) -> bool {
        self.spec.one_agent.cloud_native_full_stack.is_some()
    }

    /// Application-only monitoring mode is active
    pub fn application_monitoring_mode(&self) -> bool {
        self.spec.one_agent.application_monitoring.is_some()
    }

    /// Pods bound to this config receive application injection
    pub fn need_app_injection(&self) -> bool {
        self.cloud_native_full_stack_mode() || self.application_monitoring_mode()
    }

    /// Agent binaries come from the CSI driver
    pub fn needs_csi_driver(&self) -> bool {
        self.cloud_native_full_stack_mode()
            || self
                .spec
                .one_agent
                .application_monitoring
                .as_ref()
                .is_some_and(|am| am.use_csi_driver)
    }

    /// Install mode matching the volume source of the agent binaries
    pub fn install_mode(&self) -> InstallMode {
        if self.needs_csi_driver() {
            InstallMode::Provisioned
        } else {
            InstallMode::Installer
        }
    }

    /// Data-ingest enrichment is disabled for all bound Pods
    pub fn metadata_enrichment_disabled(&self) -> bool {
        self.spec.features.disable_metadata_enrichment
    }

    /// Reinvocation repairs are enabled
    pub fn reinvocation_policy_enabled(&self) -> bool {
        self.spec.features.enable_webhook_reinvocation_policy
    }

    /// Agents must trust a custom ActiveGate certificate
    pub fn has_active_gate_tls(&self) -> bool {
        self.spec
            .active_gate
            .as_ref()
            .and_then(|ag| ag.tls_secret_name.as_deref())
            .is_some_and(|name| !name.is_empty())
    }

    /// A proxy is configured, inline or through a secret
    pub fn has_proxy(&self) -> bool {
        self.spec.proxy.as_ref().is_some_and(|p| {
            p.value.as_deref().is_some_and(|v| !v.is_empty())
                || p.value_from.as_deref().is_some_and(|v| !v.is_empty())
        })
    }

    /// Network zone, if one is set and non-empty
    pub fn network_zone(&self) -> Option<&str> {
        self.spec.network_zone.as_deref().filter(|z| !z.is_empty())
    }

    /// Name of the secret holding the API tokens
    pub fn tokens_secret_name(&self) -> &str {
        self.spec.tokens.as_deref().unwrap_or_else(|| self.name())
    }

    /// Resources for the install init container
    pub fn init_resources(&self) -> Option<ResourceRequirements> {
        let one_agent = &self.spec.one_agent;
        one_agent
            .cloud_native_full_stack
            .as_ref()
            .and_then(|s| s.init_resources.as_ref())
            .or_else(|| {
                one_agent
                    .application_monitoring
                    .as_ref()
                    .and_then(|s| s.init_resources.as_ref())
            })
            .map(InitResources::to_requirements)
    }

    /// Image override for the install init container
    pub fn init_image(&self) -> Option<&str> {
        let one_agent = &self.spec.one_agent;
        one_agent
            .cloud_native_full_stack
            .as_ref()
            .and_then(|s| s.init_image.as_deref())
            .or_else(|| {
                one_agent
                    .application_monitoring
                    .as_ref()
                    .and_then(|s| s.init_image.as_deref())
            })
            .filter(|image| !image.is_empty())
    }

    /// Warnings to attach to admission responses for preview modes
    pub fn preview_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.cloud_native_full_stack_mode() {
            warnings.push(preview_warning("cloudNativeFullStack"));
        } else if self.application_monitoring_mode() && self.needs_csi_driver() {
            warnings.push(preview_warning("applicationMonitoring"));
        }
        warnings
    }
}

fn preview_warning(feature: &str) -> String {
    format!("{feature} feature is in PREVIEW.")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> WorkloadConfig {
        serde_yaml::from_str(yaml).expect("parse")
    }

    #[test]
    fn application_monitoring_with_csi_yaml() {
        let config = parse(
            r#"
apiVersion: beacon.dev/v1alpha1
kind: WorkloadConfig
metadata:
  name: production
spec:
  apiUrl: https://tenant.example.com/api
  oneAgent:
    applicationMonitoring:
      useCSIDriver: true
      initResources:
        requests:
          cpu: 30m
"#,
        );
        assert_eq!(config.name(), "production");
        assert!(config.need_app_injection());
        assert!(config.needs_csi_driver());
        assert_eq!(config.install_mode(), InstallMode::Provisioned);
        let resources = config.init_resources().expect("resources");
        assert_eq!(
            resources.requests.unwrap().get("cpu"),
            Some(&Quantity("30m".to_string()))
        );
        assert_eq!(
            config.preview_warnings(),
            vec!["applicationMonitoring feature is in PREVIEW.".to_string()]
        );
    }

    /// Story: host-only modes never trigger application injection
    #[test]
    fn story_host_modes_do_not_inject_apps() {
        let config = parse(
            r#"
apiVersion: beacon.dev/v1alpha1
kind: WorkloadConfig
metadata:
  name: hosts
spec:
  apiUrl: https://tenant.example.com/api
  oneAgent:
    classicFullStack: {}
"#,
        );
        assert!(!config.need_app_injection());
        assert!(!config.needs_csi_driver());
        assert_eq!(config.install_mode(), InstallMode::Installer);
        assert!(config.preview_warnings().is_empty());
    }

    #[test]
    fn cloud_native_implies_csi_and_preview() {
        let config = parse(
            r#"
apiVersion: beacon.dev/v1alpha1
kind: WorkloadConfig
metadata:
  name: cn
spec:
  apiUrl: https://tenant.example.com/api
  oneAgent:
    cloudNativeFullStack:
      initImage: registry.example.com/beacon:1.2
"#,
        );
        assert!(config.cloud_native_full_stack_mode());
        assert!(config.needs_csi_driver());
        assert_eq!(config.init_image(), Some("registry.example.com/beacon:1.2"));
        assert_eq!(
            config.preview_warnings(),
            vec!["cloudNativeFullStack feature is in PREVIEW.".to_string()]
        );
    }

    #[test]
    fn feature_flags_default_off() {
        let config = parse(
            r#"
apiVersion: beacon.dev/v1alpha1
kind: WorkloadConfig
metadata:
  name: defaults
spec:
  apiUrl: https://tenant.example.com/api
"#,
        );
        assert!(!config.metadata_enrichment_disabled());
        assert!(!config.reinvocation_policy_enabled());
        assert!(!config.has_proxy());
        assert!(!config.has_active_gate_tls());
        assert_eq!(config.network_zone(), None);
        assert_eq!(config.tokens_secret_name(), "defaults");
    }

    #[test]
    fn empty_proxy_values_are_not_a_proxy() {
        let mut config = WorkloadConfig::new("p", WorkloadConfigSpec::default());
        config.spec.proxy = Some(ProxySpec {
            value: Some(String::new()),
            value_from: None,
        });
        assert!(!config.has_proxy());

        config.spec.proxy = Some(ProxySpec {
            value: None,
            value_from: Some("proxy-secret".to_string()),
        });
        assert!(config.has_proxy());
    }

    #[test]
    fn tls_secret_enables_trust_material() {
        let mut config = WorkloadConfig::new("tls", WorkloadConfigSpec::default());
        config.spec.active_gate = Some(ActiveGateSpec {
            tls_secret_name: Some("ag-tls".to_string()),
        });
        assert!(config.has_active_gate_tls());
    }
}
