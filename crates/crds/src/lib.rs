//! Floating IP CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the floating IP allocator.

pub mod floating_ip;

pub use floating_ip::*;
