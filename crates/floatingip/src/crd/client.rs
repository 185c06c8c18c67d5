//! FloatingIP API access, abstracted for mocking.

use crate::error::IpamError;
use async_trait::async_trait;
use crds::FloatingIP;
use kube::api::{DeleteParams, ListParams, PostParams};
use kube::{Api, Client, ResourceExt};

/// Operations the CRD backend needs from the API server.
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait]
pub trait FloatingIpClient: Send + Sync {
    /// Lists objects matching a `k=v[,k=v]` label selector.
    async fn list(&self, label_selector: &str) -> Result<Vec<FloatingIP>, IpamError>;

    /// Creates an object. Fails if the name is taken.
    async fn create(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError>;

    /// Replaces an object. Fails unless the `resourceVersion` it carries is current.
    async fn replace(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError>;

    /// Deletes an object by name.
    async fn delete(&self, name: &str) -> Result<(), IpamError>;
}

/// [`FloatingIpClient`] over the cluster-scoped FloatingIP API.
#[derive(Clone)]
pub struct KubeFloatingIpClient {
    api: Api<FloatingIP>,
}

impl KubeFloatingIpClient {
    /// Creates a client from a Kubernetes client.
    pub fn new(client: Client) -> Self {
        Self { api: Api::all(client) }
    }
}

#[async_trait]
impl FloatingIpClient for KubeFloatingIpClient {
    async fn list(&self, label_selector: &str) -> Result<Vec<FloatingIP>, IpamError> {
        let params = ListParams::default().labels(label_selector);
        Ok(self.api.list(&params).await?.items)
    }

    async fn create(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError> {
        Ok(self.api.create(&PostParams::default(), fip).await?)
    }

    async fn replace(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError> {
        Ok(self.api.replace(&fip.name_any(), &PostParams::default(), fip).await?)
    }

    async fn delete(&self, name: &str) -> Result<(), IpamError> {
        self.api.delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
