//! Common types for Beacon: the WorkloadConfig CRD, errors, events and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod telemetry;

pub use error::Error;

/// Namespace label binding a namespace to exactly one WorkloadConfig
pub const INSTANCE_LABEL: &str = "beacon.dev/instance";

/// Field manager / reporting component name used for API writes and Events
pub const WEBHOOK_COMPONENT: &str = "beacon-webhook";

/// Name of the secret carrying the injection configuration in each namespace
pub const INIT_SECRET_NAME: &str = "beacon-injection-config";

/// Name of the secret carrying the data-ingest endpoint in each namespace
pub const ENDPOINT_SECRET_NAME: &str = "beacon-data-ingest-endpoint";

/// Secret field holding the data-ingest endpoint URL
pub const INGEST_URL_FIELD: &str = "BEACON_METRICS_INGEST_URL";

/// Secret field holding the data-ingest API token
pub const INGEST_TOKEN_FIELD: &str = "BEACON_METRICS_INGEST_API_TOKEN";

/// Key in the token secret that holds the data-ingest token
pub const DATA_INGEST_TOKEN_KEY: &str = "dataIngestToken";

/// Key in the token secret that holds the PaaS (installer download) token
pub const PAAS_TOKEN_KEY: &str = "paasToken";

/// Default name of the node-level volume driver that publishes agent binaries
pub const DEFAULT_CSI_DRIVER_NAME: &str = "csi.beacon.dev";
