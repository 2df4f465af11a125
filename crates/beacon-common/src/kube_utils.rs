//! Shared Kubernetes utilities using kube-rs
//!
//! Small helpers for building dynamic API resources, reading annotation
//! fields with defaults, and idempotent object creation.

use std::collections::BTreeMap;
use std::fmt::Debug;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::Error;

/// Plurals that simple suffix rules get wrong, or that are on the hot path
const KIND_PLURALS: &[(&str, &str)] = &[
    ("replicaset", "replicasets"),
    ("deployment", "deployments"),
    ("replicationcontroller", "replicationcontrollers"),
    ("statefulset", "statefulsets"),
    ("daemonset", "daemonsets"),
    ("job", "jobs"),
    ("cronjob", "cronjobs"),
    ("deploymentconfig", "deploymentconfigs"),
    ("workloadconfig", "workloadconfigs"),
];

/// Split an apiVersion into (group, version). Core resources have an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Build an ApiResource from a known apiVersion and kind.
///
/// Used for owner references, where apiVersion and kind come from the
/// referencing object and the type is not known at compile time.
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Read a string field from a label/annotation map, falling back to `default`
pub fn get_field(fields: Option<&BTreeMap<String, String>>, key: &str, default: &str) -> String {
    fields
        .and_then(|m| m.get(key))
        .cloned()
        .unwrap_or_else(|| default.to_string())
}

/// Read a boolean field, falling back to `default` when absent or unparsable.
///
/// Accepts `1 t T TRUE true True` and `0 f F FALSE false False`.
pub fn get_field_bool(fields: Option<&BTreeMap<String, String>>, key: &str, default: bool) -> bool {
    fields
        .and_then(|m| m.get(key))
        .and_then(|v| parse_bool(v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

/// Create an object unless it already exists.
///
/// Concurrent callers racing on the same name all succeed: an
/// `AlreadyExists` (409) answer from the API server counts as success.
/// Returns `true` when this call created the object.
pub async fn create_if_absent<K>(api: &Api<K>, obj: &K) -> Result<bool, Error>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(e)) if e.code == 409 => {
            debug!(name = %obj.name_any(), "object already exists, treating as success");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

/// UID of the `kube-system` namespace, used as a stable cluster identifier
pub async fn cluster_uid(client: &Client) -> Result<String, Error> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    let ns = namespaces.get("kube-system").await?;
    ns.metadata
        .uid
        .ok_or_else(|| Error::internal_with_context("cluster_uid", "kube-system has no uid"))
}
