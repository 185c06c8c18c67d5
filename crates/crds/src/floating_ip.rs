//! FloatingIP CRD
//!
//! One object per allocated floating IP. The object name is the dotted-quad
//! address; free addresses have no object.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Label carrying the address family of the pool the IP belongs to.
pub const IP_TYPE_LABEL: &str = "ipType";

/// Label value for IPs handed out to pods on the cluster network.
pub const INTERNAL_IP_TYPE: &str = "internalIP";

/// Label value for IPs exposed outside the cluster.
pub const EXTERNAL_IP_TYPE: &str = "externalIP";

/// Objects carrying this label were reserved manually by an administrator
/// and are never handed out to pods.
pub const RESERVED_LABEL: &str = "reserved";

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq)]
#[kube(
    group = "galaxy.k8s.io",
    version = "v1alpha1",
    kind = "FloatingIP",
    plural = "floatingips",
    shortname = "fip"
)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIPSpec {
    /// Owner key, e.g. `pod_default_web-0_`
    pub key: String,

    /// Opaque attribute string, JSON encoded node name and pod uid
    #[serde(default)]
    pub attribute: String,

    /// Release policy code: 0 pod-delete, 1 immutable, 2 never
    #[serde(default)]
    pub policy: u16,

    /// Routable subnet the IP was allocated from, in CIDR form
    #[serde(default)]
    pub subnet: String,

    /// Last allocate/update timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

impl FloatingIP {
    /// Returns true if the object carries the reserved label.
    pub fn is_reserved(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|labels| labels.contains_key(RESERVED_LABEL))
    }

    /// Returns the value of the `ipType` label, if any.
    pub fn ip_type(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(IP_TYPE_LABEL))
            .map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::CustomResourceExt;
    use std::collections::BTreeMap;

    #[test]
    fn test_crd_is_cluster_scoped() {
        let crd = FloatingIP::crd();
        assert_eq!(crd.spec.group, "galaxy.k8s.io");
        assert_eq!(crd.spec.names.plural, "floatingips");
        assert_eq!(crd.spec.scope, "Cluster");
    }

    #[test]
    fn test_spec_uses_camel_case() {
        let spec = FloatingIPSpec {
            key: "pod_default_web-0_".to_string(),
            attribute: String::new(),
            policy: 1,
            subnet: "10.173.13.0/24".to_string(),
            update_time: None,
        };
        let value = serde_json::to_value(&spec).unwrap();
        assert_eq!(value["key"], "pod_default_web-0_");
        assert_eq!(value["policy"], 1);
        assert!(value.get("updateTime").is_none());

        let parsed: FloatingIPSpec = serde_json::from_str(
            r#"{"key":"k","subnet":"10.0.0.0/24","updateTime":"2024-01-02T03:04:05Z"}"#,
        )
        .unwrap();
        assert_eq!(parsed.policy, 0);
        assert!(parsed.update_time.is_some());
    }

    #[test]
    fn test_labels() {
        let mut fip = FloatingIP::new("10.0.0.5", FloatingIPSpec::default());
        assert!(!fip.is_reserved());
        assert_eq!(fip.ip_type(), None);

        fip.metadata = ObjectMeta {
            name: Some("10.0.0.5".to_string()),
            labels: Some(BTreeMap::from([
                (RESERVED_LABEL.to_string(), String::new()),
                (IP_TYPE_LABEL.to_string(), INTERNAL_IP_TYPE.to_string()),
            ])),
            ..Default::default()
        };
        assert!(fip.is_reserved());
        assert_eq!(fip.ip_type(), Some(INTERNAL_IP_TYPE));
    }
}
