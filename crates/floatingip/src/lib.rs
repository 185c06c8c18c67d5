//! Floating IP IPAM
//!
//! Allocation engine for pod IPs that float between nodes. Pools are sparse
//! subnets, each reachable from one routable node subnet; every usable
//! address is persisted as one record whose key names its owner.
//!
//! # Example
//!
//! ```no_run
//! use floatingip::{DbIpam, Ipam, ReleasePolicy, parse_pools};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let ipam = DbIpam::connect("sqlite://ipam.db?mode=rwc", "ip_pool", 10).await?;
//! ipam.configure_pool(parse_pools(r#"[{"routableSubnet":"10.49.27.0/24",
//!     "ips":["10.49.27.205","10.49.27.216~10.49.27.218"],
//!     "subnet":"10.49.27.0/24","gateway":"10.49.27.1","vlan":2}]"#)?).await?;
//!
//! let ip = ipam
//!     .allocate_in_subnet("pod_default_web-0_", &"10.49.27.0/24".parse()?, ReleasePolicy::Immutable, "")
//!     .await?;
//! ipam.release("pod_default_web-0_", ip).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Backends
//!
//! - **`DbIpam`**: SQLite table, allocation by conditional `UPDATE`
//! - **`CrdIpam`**: FloatingIP custom resources mirrored in an in-process cache

pub mod crd;
pub mod db;
pub mod error;
pub mod ipam;
pub mod nets;
pub mod pool;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
#[cfg(test)]
pub(crate) mod test_utils;

pub use crd::{CrdIpam, FloatingIpClient, IpType, KubeFloatingIpClient};
pub use db::{DEFAULT_TABLE_NAME, DbIpam};
pub use error::IpamError;
pub use ipam::{Attr, FloatingIp, FloatingIpInfo, IpInfo, Ipam, PoolStats, ReleasePolicy, ReleaseResult};
#[cfg(any(test, feature = "test-util"))]
pub use mock::MockFloatingIpClient;
pub use nets::{IpRange, SparseSubnet};
pub use pool::{FloatingIpPool, FloatingIpPoolConf, fip_check, parse_pools};
