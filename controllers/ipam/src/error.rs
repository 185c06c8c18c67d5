//! Controller-specific error types.
//!
//! This module defines error types specific to the IPAM controller
//! that are not covered by upstream library errors.

use floatingip::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the IPAM controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// IPAM engine error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Reading the pool config failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metric registration or encoding failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),
}
