//! Pod annotations read and written by the webhook, with their defaults

/// Global inject switch; default for the per-capability switches
pub const INJECT: &str = "beacon.dev/inject";

/// Marker recording the capabilities applied at first injection
pub const INJECTED: &str = "beacon.dev/injected";

/// Agent inject switch
pub const ONEAGENT_INJECT: &str = "oneagent.beacon.dev/inject";

/// Written after injection: whether the agent was injected
pub const ONEAGENT_INJECTED: &str = "oneagent.beacon.dev/injected";

/// Data-ingest inject switch
pub const DATA_INGEST_INJECT: &str = "data-ingest.beacon.dev/inject";

/// Written after injection: whether data-ingest enrichment was injected
pub const DATA_INGEST_INJECTED: &str = "data-ingest.beacon.dev/injected";

/// Technologies the agent instruments
pub const TECHNOLOGIES: &str = "oneagent.beacon.dev/technologies";

/// Agent install path inside application containers
pub const INSTALL_PATH: &str = "oneagent.beacon.dev/install-path";

/// Explicit installer download URL
pub const INSTALLER_URL: &str = "oneagent.beacon.dev/installer-url";

/// Runtime failure policy of the install init container
pub const FAILURE_POLICY: &str = "oneagent.beacon.dev/failure-policy";

/// Default for [`TECHNOLOGIES`]
pub const DEFAULT_TECHNOLOGIES: &str = "all";

/// Default for [`INSTALL_PATH`]
pub const DEFAULT_INSTALL_PATH: &str = "/opt/beacon/oneagent-paas";

/// Default for [`INSTALLER_URL`]
pub const DEFAULT_INSTALLER_URL: &str = "";

/// Default for [`FAILURE_POLICY`]
pub const DEFAULT_FAILURE_POLICY: &str = "silent";
