//! Volumes added to injected Pods
//!
//! Volume names are reserved: they are used both to build the injection and
//! to detect it on reinvocation.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{CSIVolumeSource, EmptyDirVolumeSource, SecretVolumeSource, Volume};

use beacon_common::crd::WorkloadConfig;
use beacon_common::{DEFAULT_CSI_DRIVER_NAME, ENDPOINT_SECRET_NAME, INIT_SECRET_NAME};

/// Secret-backed volume carrying the install script and its configuration
pub const INJECTION_CONFIG_VOLUME: &str = "injection-config";

/// Agent binaries
pub const ONEAGENT_BIN_VOLUME: &str = "oneagent-bin";

/// Per-Pod agent runtime state shared between the init and app containers
pub const ONEAGENT_SHARE_VOLUME: &str = "oneagent-share";

/// Scratch volume the init container writes enrichment files into
pub const DATA_INGEST_VOLUME: &str = "data-ingest-enrichment";

/// Secret-backed volume with the data-ingest endpoint
pub const DATA_INGEST_ENDPOINT_VOLUME: &str = "data-ingest-endpoint";

/// Supplies the source of the agent binary volume.
///
/// When the WorkloadConfig needs the CSI driver the binaries are published by
/// the node-level driver; otherwise the init container downloads them into an
/// emptyDir.
#[derive(Clone, Debug)]
pub struct VolumeProvider {
    driver_name: String,
}

impl Default for VolumeProvider {
    fn default() -> Self {
        Self::new(DEFAULT_CSI_DRIVER_NAME)
    }
}

impl VolumeProvider {
    /// Create a provider for the named CSI driver
    pub fn new(driver_name: impl Into<String>) -> Self {
        Self {
            driver_name: driver_name.into(),
        }
    }

    /// Name of the CSI driver
    pub fn driver_name(&self) -> &str {
        &self.driver_name
    }

    /// The agent binary volume for the given config
    pub fn agent_binaries(&self, config: &WorkloadConfig) -> Volume {
        if !config.needs_csi_driver() {
            return empty_dir(ONEAGENT_BIN_VOLUME);
        }
        let attributes = BTreeMap::from([
            ("mode".to_string(), "app".to_string()),
            ("workloadConfig".to_string(), config.name().to_string()),
        ]);
        Volume {
            name: ONEAGENT_BIN_VOLUME.to_string(),
            csi: Some(CSIVolumeSource {
                driver: self.driver_name.clone(),
                volume_attributes: Some(attributes),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn empty_dir(name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    }
}

fn secret(name: &str, secret_name: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// The injection config volume, always added
pub fn config_volume() -> Volume {
    secret(INJECTION_CONFIG_VOLUME, INIT_SECRET_NAME)
}

/// Agent binary and share volumes
pub fn one_agent_volumes(provider: &VolumeProvider, config: &WorkloadConfig) -> [Volume; 2] {
    [
        provider.agent_binaries(config),
        empty_dir(ONEAGENT_SHARE_VOLUME),
    ]
}

/// Enrichment scratch and endpoint volumes
pub fn data_ingest_volumes() -> [Volume; 2] {
    [
        empty_dir(DATA_INGEST_VOLUME),
        secret(DATA_INGEST_ENDPOINT_VOLUME, ENDPOINT_SECRET_NAME),
    ]
}
