//! FloatingIP object helpers for the CRD backend.

use super::CrdIpam;
use crate::error::IpamError;
use crate::ipam::{FloatingIp, ReleasePolicy};
use chrono::Utc;
use crds::{FloatingIP, FloatingIPSpec, IP_TYPE_LABEL};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use tracing::debug;

pub(crate) fn spec_of(fip: &FloatingIp) -> FloatingIPSpec {
    FloatingIPSpec {
        key: fip.key.clone(),
        attribute: fip.attr.clone(),
        policy: fip.policy.code(),
        subnet: fip.subnet.clone(),
        update_time: Some(fip.updated_at),
    }
}

/// Cache record of an object. `subnet` comes from the current pool config.
pub(crate) fn record_of(ip: Ipv4Addr, spec: &FloatingIPSpec, subnet: String) -> FloatingIp {
    FloatingIp {
        ip,
        key: spec.key.clone(),
        subnet,
        policy: ReleasePolicy::from_code(spec.policy),
        attr: spec.attribute.clone(),
        updated_at: spec.update_time.unwrap_or_else(Utc::now),
    }
}

/// Address encoded in the object name.
pub(crate) fn ip_of(obj: &FloatingIP) -> Result<Ipv4Addr, IpamError> {
    let name = obj.name_any();
    name.parse()
        .map_err(|e| IpamError::Corrupt(format!("FloatingIP name {name:?} is not an ip: {e}")))
}

impl CrdIpam {
    pub(crate) fn label_selector(&self) -> String {
        format!("{}={}", IP_TYPE_LABEL, self.ip_type.as_str())
    }

    pub(crate) async fn list_floating_ips(&self) -> Result<Vec<FloatingIP>, IpamError> {
        self.client.list(&self.label_selector()).await
    }

    fn object_of(&self, fip: &FloatingIp) -> FloatingIP {
        let mut obj = FloatingIP::new(&fip.ip.to_string(), spec_of(fip));
        obj.metadata.labels = Some(BTreeMap::from([(
            IP_TYPE_LABEL.to_string(),
            self.ip_type.as_str().to_string(),
        )]));
        obj
    }

    /// Creates the object of `fip`. Returns the resourceVersion it was stored at.
    pub(crate) async fn create_floating_ip(&self, fip: &FloatingIp) -> Result<Option<String>, IpamError> {
        let created = self.client.create(&self.object_of(fip)).await?;
        debug!("Created FloatingIP {} for {}", fip.ip, fip.key);
        Ok(created.metadata.resource_version)
    }

    /// Rewrites the object of `fip` conditionally on `version`, the
    /// resourceVersion this instance last saw. The API server rejects the
    /// write if someone else changed the object since.
    pub(crate) async fn update_floating_ip(
        &self,
        fip: &FloatingIp,
        version: Option<String>,
    ) -> Result<Option<String>, IpamError> {
        let mut obj = self.object_of(fip);
        obj.metadata.resource_version = version;
        let replaced = self.client.replace(&obj).await?;
        debug!("Updated FloatingIP {} for {}", fip.ip, fip.key);
        Ok(replaced.metadata.resource_version)
    }

    pub(crate) async fn delete_floating_ip(&self, ip: Ipv4Addr) -> Result<(), IpamError> {
        self.client.delete(&ip.to_string()).await?;
        debug!("Deleted FloatingIP {}", ip);
        Ok(())
    }
}
