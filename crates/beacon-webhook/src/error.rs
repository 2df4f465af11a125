//! Errors that abort an admission call
//!
//! Every variant maps to an HTTP-style status code carried in the denied
//! admission response. Request-level problems the user can fix (an unbound
//! namespace, a missing WorkloadConfig, unusable secrets) are 400; cluster or
//! internal failures are 500.

use std::time::Duration;

use thiserror::Error;

/// Error raised by the injection pipeline
#[derive(Debug, Error)]
pub enum InjectionError {
    /// The admission request did not carry a decodable Pod
    #[error("failed to decode pod: {0}")]
    Decode(String),

    /// The request namespace could not be read
    #[error("failed to query namespace '{namespace}': {source}")]
    NamespaceLookup {
        /// Namespace of the admitted Pod
        namespace: String,
        /// Underlying lookup failure
        #[source]
        source: beacon_common::Error,
    },

    /// The namespace carries no WorkloadConfig binding label
    #[error("namespace '{namespace}' has no WorkloadConfig label")]
    BindingMissing {
        /// Namespace of the admitted Pod
        namespace: String,
    },

    /// The bound WorkloadConfig does not exist
    #[error(
        "WorkloadConfig '{config}' is assigned to namespace '{namespace}', but WorkloadConfig '{config}' does not exist"
    )]
    TargetMissing {
        /// Name from the binding label
        config: String,
        /// Namespace of the admitted Pod
        namespace: String,
    },

    /// The bound WorkloadConfig could not be read
    #[error("failed to query WorkloadConfig '{config}': {source}")]
    ConfigLookup {
        /// Name from the binding label
        config: String,
        /// Underlying lookup failure
        #[source]
        source: beacon_common::Error,
    },

    /// Supporting secrets could not be ensured or are incomplete
    #[error("failed to provision injection secrets in namespace '{namespace}': {source}")]
    SecretProvisioning {
        /// Namespace the secrets live in
        namespace: String,
        /// Underlying failure
        #[source]
        source: beacon_common::Error,
    },

    /// The workload owning the Pod could not be determined
    #[error("failed to resolve workload of pod '{pod}': {source}")]
    OwnerResolution {
        /// Pod name (or generateName prefix)
        pod: String,
        /// Underlying failure
        #[source]
        source: beacon_common::Error,
    },

    /// The mutated Pod could not be turned into a patch
    #[error("failed to build patch: {0}")]
    PatchSerialization(String),

    /// The admission call ran out of time
    #[error("admission deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
}

impl InjectionError {
    /// HTTP-style status code reported in the denied response
    pub fn status_code(&self) -> u16 {
        if self.is_denial() {
            400
        } else {
            500
        }
    }

    /// Whether the failure is caused by user-fixable request state
    pub fn is_denial(&self) -> bool {
        matches!(
            self,
            Self::BindingMissing { .. } | Self::TargetMissing { .. } | Self::SecretProvisioning { .. }
        )
    }
}

impl From<serde_json::Error> for InjectionError {
    fn from(e: serde_json::Error) -> Self {
        Self::PatchSerialization(e.to_string())
    }
}
