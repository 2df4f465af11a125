//! Owner-chain resolution
//!
//! Walks controller owner references from a Pod up to the workload that
//! manages it, so enrichment data can be labelled with the workload identity.
//! Owner references are untrusted input, so the walk is iterative, remembers
//! every object it fetched, and gives up past a fixed depth.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use tracing::{debug, warn};

use beacon_common::Error;

use crate::client::ClusterReader;

/// Default number of owner objects fetched before giving up
pub const DEFAULT_MAX_OWNER_DEPTH: usize = 10;

/// (apiVersion, kind) of controllers the walk continues through
const RECOGNIZED_WORKLOADS: &[(&str, &str)] = &[
    ("apps/v1", "ReplicaSet"),
    ("apps/v1", "Deployment"),
    ("v1", "ReplicationController"),
    ("apps/v1", "StatefulSet"),
    ("apps/v1", "DaemonSet"),
    ("batch/v1", "Job"),
    ("batch/v1", "CronJob"),
    ("apps.openshift.io/v1", "DeploymentConfig"),
];

/// Workload a Pod belongs to
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkloadIdentity {
    /// Workload kind, empty for a bare Pod
    pub kind: String,
    /// Workload name
    pub name: String,
}

fn is_recognized(owner: &OwnerReference) -> bool {
    RECOGNIZED_WORKLOADS
        .iter()
        .any(|(api_version, kind)| owner.api_version == *api_version && owner.kind == *kind)
}

fn controller_of(owners: Option<&Vec<OwnerReference>>) -> Option<&OwnerReference> {
    owners?.iter().find(|o| o.controller == Some(true))
}

/// Resolve the workload owning `pod` in `namespace`.
///
/// A Pod without a controller owner is its own workload, reported with an
/// empty kind. An unrecognized controller owner is reported as-is. A fetched
/// owner without a controller of its own ends the walk.
pub async fn resolve_workload(
    reader: &dyn ClusterReader,
    pod: &Pod,
    namespace: &str,
    max_depth: usize,
) -> Result<WorkloadIdentity, Error> {
    let mut current = WorkloadIdentity {
        kind: String::new(),
        name: pod.metadata.name.clone().unwrap_or_default(),
    };
    let mut owners = pod.metadata.owner_references.clone();
    let mut visited: HashSet<(String, String, String)> = HashSet::new();

    loop {
        let Some(owner) = controller_of(owners.as_ref()) else {
            return Ok(current);
        };

        if !is_recognized(owner) {
            debug!(
                kind = %owner.kind,
                name = %owner.name,
                "stopping owner walk at unrecognized controller"
            );
            return Ok(WorkloadIdentity {
                kind: owner.kind.clone(),
                name: owner.name.clone(),
            });
        }

        if visited.len() >= max_depth {
            warn!(namespace, max_depth, "owner chain exceeds depth ceiling");
            return Err(Error::internal_with_context(
                "owner",
                format!("owner chain deeper than {max_depth} objects"),
            ));
        }

        let key = (
            owner.kind.clone(),
            owner.name.clone(),
            namespace.to_string(),
        );
        if !visited.insert(key) {
            warn!(namespace, kind = %owner.kind, name = %owner.name, "owner chain contains a cycle");
            return Err(Error::internal_with_context(
                "owner",
                format!("owner cycle through {} '{}'", owner.kind, owner.name),
            ));
        }

        let meta = reader.get_owner_metadata(owner, namespace).await?;
        current = WorkloadIdentity {
            kind: owner.kind.clone(),
            name: meta.name.clone().unwrap_or_else(|| owner.name.clone()),
        };
        owners = meta.owner_references;
    }
}
