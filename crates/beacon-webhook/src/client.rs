//! Read-only cluster queries used on the admission path
//!
//! [`ClusterReader`] is the seam between the pipeline and the API server so
//! the decision logic can be exercised against mocks.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DynamicObject};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tracing::debug;

use beacon_common::crd::WorkloadConfig;
use beacon_common::kube_utils::build_api_resource;
use beacon_common::Error;

/// Cluster lookups performed while admitting a Pod
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReader: Send + Sync {
    /// Get a Namespace by name
    async fn get_namespace(&self, name: &str) -> Result<Namespace, Error>;

    /// Get a WorkloadConfig by name, `None` if it does not exist
    async fn get_workload_config(&self, name: &str) -> Result<Option<WorkloadConfig>, Error>;

    /// Get the metadata of the object an owner reference points at
    ///
    /// # Arguments
    ///
    /// * `owner` - Reference taken from a Pod or an intermediate owner
    /// * `namespace` - Namespace of the admitted Pod
    async fn get_owner_metadata(
        &self,
        owner: &OwnerReference,
        namespace: &str,
    ) -> Result<ObjectMeta, Error>;
}

/// [`ClusterReader`] backed by the API server
pub struct KubeClusterReader {
    client: Client,
}

impl KubeClusterReader {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterReader for KubeClusterReader {
    async fn get_namespace(&self, name: &str) -> Result<Namespace, Error> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn get_workload_config(&self, name: &str) -> Result<Option<WorkloadConfig>, Error> {
        let api: Api<WorkloadConfig> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_owner_metadata(
        &self,
        owner: &OwnerReference,
        namespace: &str,
    ) -> Result<ObjectMeta, Error> {
        debug!(
            api_version = %owner.api_version,
            kind = %owner.kind,
            name = %owner.name,
            namespace,
            "fetching owner metadata"
        );
        let ar = build_api_resource(&owner.api_version, &owner.kind);
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let partial = api.get_metadata(&owner.name).await?;
        Ok(partial.metadata)
    }
}
