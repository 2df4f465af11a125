//! Pod injection admission webhook
//!
//! Decides per admitted Pod whether to attach the monitoring agent and/or
//! data-ingest enrichment, and produces the mutated Pod that the HTTP layer
//! turns into a JSON patch.

#![deny(missing_docs)]

pub mod annotations;
pub mod client;
pub mod container;
pub mod error;
pub mod features;
pub mod init_container;
pub mod injector;
pub mod mutator;
pub mod owner;
pub mod reinvocation;
pub mod request;
pub mod secrets;
pub mod volumes;
pub mod webhook;

pub use client::{ClusterReader, KubeClusterReader};
pub use error::InjectionError;
pub use features::{Capability, InjectionInfo};
pub use mutator::{MutationOutcome, MutatorSettings, PodMutator};
pub use secrets::{KubeSecretEnsurer, SecretEnsurer};
pub use volumes::VolumeProvider;
pub use webhook::{webhook_router, WebhookState};
