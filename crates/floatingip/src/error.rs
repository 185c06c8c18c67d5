//! IPAM errors

use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur when configuring pools or allocating floating IPs
#[derive(Debug, Error)]
pub enum IpamError {
    /// No free IP left in the requested pool, or the IP was taken
    #[error("no enough available ips left")]
    NoEnoughIp,

    /// No pool is configured for the requested routable subnet
    #[error("no available ip for subnet {0}")]
    NoFipForSubnet(String),

    /// A conditional write matched zero rows
    #[error("not updated")]
    NotUpdated,

    /// Record not found
    #[error("not found: {0}")]
    NotFound(String),

    /// The IP is owned by another key
    #[error("ip {ip} belongs to key {actual}, not {expected}")]
    KeyMismatch {
        /// Address being modified
        ip: Ipv4Addr,
        /// Key supplied by the caller
        expected: String,
        /// Key currently holding the address
        actual: String,
    },

    /// The IP is not in any configured pool
    #[error("unknown ip {0}")]
    UnknownIp(Ipv4Addr),

    /// Invalid pool configuration or parameter
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Stored record cannot be decoded
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// SQL backend error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// CRD store error that is not a Kubernetes API error
    #[error("store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A bulk release stopped on a write error. The maps tell what was done.
    #[error("released {} ips, {} left unreleased: {source}", .released.len(), .unreleased.len())]
    PartialRelease {
        /// IPs freed before the failure, with the key they had
        released: HashMap<Ipv4Addr, String>,
        /// IPs not freed, with their current owner when known, else the requested key
        unreleased: HashMap<Ipv4Addr, String>,
        /// The write error
        source: Box<IpamError>,
    },
}

impl IpamError {
    /// Maps the internal "zero rows" signal to the public taxonomy.
    pub(crate) fn into_public(self) -> Self {
        match self {
            Self::NotUpdated => Self::NoEnoughIp,
            other => other,
        }
    }
}
