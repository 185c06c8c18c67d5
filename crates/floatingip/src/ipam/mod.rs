//! IPAM contract shared by the SQL and CRD backends.
//!
//! An [`Ipam`] owns one set of [`FloatingIpPool`]s and one record per usable
//! address. A record with an empty key is free; allocation sets the key,
//! release clears it.

#[cfg(test)]
pub(crate) mod conformance;

use crate::error::IpamError;
use crate::nets::IpRange;
use crate::pool::FloatingIpPool;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::net::Ipv4Addr;
use tracing::{debug, warn};

/// When an allocated IP goes back to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ReleasePolicy {
    /// Release as soon as the owning pod is deleted
    #[default]
    PodDelete,
    /// Keep across pod churn of the same owner, e.g. a StatefulSet ordinal
    Immutable,
    /// Keep until released explicitly
    Never,
}

impl ReleasePolicy {
    /// Persisted integer code.
    pub fn code(self) -> u16 {
        match self {
            Self::PodDelete => 0,
            Self::Immutable => 1,
            Self::Never => 2,
        }
    }

    /// Decodes a persisted code. Unknown codes fall back to `PodDelete`.
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => Self::Immutable,
            2 => Self::Never,
            _ => Self::PodDelete,
        }
    }

    /// Parses the pod annotation value. Anything but `immutable` or `never`
    /// is `PodDelete`.
    pub fn from_annotation(value: &str) -> Self {
        match value {
            "immutable" => Self::Immutable,
            "never" => Self::Never,
            _ => Self::PodDelete,
        }
    }
}

impl fmt::Display for ReleasePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PodDelete => "podDelete",
            Self::Immutable => "immutable",
            Self::Never => "never",
        })
    }
}

/// Attribute payload written by the scheduler plugin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attr {
    /// Node the pod was scheduled on
    #[serde(rename = "NodeName", default)]
    pub node_name: String,
    /// Pod uid
    #[serde(rename = "Uid", default)]
    pub uid: String,
}

impl Attr {
    /// JSON form stored in the record's attribute column.
    pub fn encode(&self) -> Result<String, IpamError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// One persisted address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIp {
    /// The address
    pub ip: Ipv4Addr,
    /// Owner key, empty when free
    pub key: String,
    /// Routable subnet of the pool, in CIDR form
    pub subnet: String,
    /// Release policy
    pub policy: ReleasePolicy,
    /// Opaque attribute string
    pub attr: String,
    /// Last allocate/update/release time
    pub updated_at: DateTime<Utc>,
}

impl FloatingIp {
    /// A free record for `ip` in the pool of `subnet`.
    pub fn unallocated(ip: Ipv4Addr, subnet: String) -> Self {
        Self {
            ip,
            key: String::new(),
            subnet,
            policy: ReleasePolicy::PodDelete,
            attr: String::new(),
            updated_at: Utc::now(),
        }
    }

    /// Returns true if the record has an owner.
    pub fn is_allocated(&self) -> bool {
        !self.key.is_empty()
    }

    /// Decodes the attribute string, `None` when empty or not JSON.
    pub fn decoded_attr(&self) -> Option<Attr> {
        if self.attr.is_empty() {
            return None;
        }
        serde_json::from_str(&self.attr)
            .map_err(|e| debug!("Ignoring malformed attribute of {}: {}", self.ip, e))
            .ok()
    }
}

/// Network settings a container needs to use an allocated IP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpInfo {
    /// Address with the pool prefix length
    pub ip: Ipv4Net,
    /// VLAN id
    pub vlan: u16,
    /// Gateway
    pub gateway: Ipv4Addr,
    /// Routable subnet of the pool
    #[serde(rename = "routableSubnet")]
    pub routable_subnet: Ipv4Net,
}

/// A record together with its pool's network settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FloatingIpInfo {
    /// Network settings
    pub ip_info: IpInfo,
    /// The record
    pub fip: FloatingIp,
}

/// Usage summary of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    /// Routable subnet of the pool
    pub routable_subnet: Ipv4Net,
    /// Pool subnet
    pub subnet: Ipv4Net,
    /// Lowest usable address
    pub first_ip: Option<Ipv4Addr>,
    /// Usable addresses
    pub total: u64,
    /// Addresses with an owner
    pub allocated: u64,
}

/// Result of a bulk release: `(released, unreleased)` keyed by IP.
///
/// `unreleased` carries the current owner of each IP that was not released,
/// empty for free or unknown IPs.
pub type ReleaseResult = (HashMap<Ipv4Addr, String>, HashMap<Ipv4Addr, String>);

/// Floating IP allocation engine.
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait Ipam: Send + Sync {
    /// Replaces the active pool set and reconciles persisted records with it.
    /// Calling it twice with the same pools is a no-op.
    async fn configure_pool(&self, pools: Vec<FloatingIpPool>) -> Result<(), IpamError>;

    /// Claims exactly `ip` for `key`. Succeeds without change if `key` already owns it.
    async fn allocate_specific_ip(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError>;

    /// Claims the lowest free IP of the pool serving `routable_subnet`.
    async fn allocate_in_subnet(
        &self,
        key: &str,
        routable_subnet: &Ipv4Net,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Ipv4Addr, IpamError>;

    /// Claims one IP per range set in the pool serving `routable_subnet`, the
    /// lowest free IP inside the set. An empty set matches any IP and an empty
    /// list claims one IP. Either every set gets an IP or nothing is claimed.
    async fn allocate_in_subnets_and_ip_range(
        &self,
        key: &str,
        routable_subnet: &Ipv4Net,
        ip_ranges: &[Vec<IpRange>],
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Vec<Ipv4Addr>, IpamError>;

    /// Re-keys the most recently updated record of `old_key` in `subnet` to `new_key`.
    async fn allocate_in_subnet_with_key(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError>;

    /// Re-keys the most recently updated record of `old_key` to `new_key`,
    /// keeping subnet and policy.
    async fn reserve_ip(&self, old_key: &str, new_key: &str, attr: &str) -> Result<(), IpamError>;

    /// Updates policy and attribute of `ip`, which must be owned by `key`.
    async fn update_policy(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError>;

    /// Frees `ip` if it is owned by `key`.
    async fn release(&self, key: &str, ip: Ipv4Addr) -> Result<(), IpamError>;

    /// Frees every IP of the map that is still owned by the given key.
    async fn release_ips(&self, ip_to_key: HashMap<Ipv4Addr, String>) -> Result<ReleaseResult, IpamError>;

    /// Frees every IP whose key starts with `prefix`.
    async fn release_by_prefix(&self, prefix: &str) -> Result<(), IpamError>;

    /// Lowest IP owned by `key`, if any.
    async fn first(&self, key: &str) -> Result<Option<FloatingIpInfo>, IpamError>;

    /// Record of `ip`, if it belongs to a pool.
    async fn by_ip(&self, ip: Ipv4Addr) -> Result<Option<FloatingIp>, IpamError>;

    /// Records whose key starts with `prefix`, ordered by IP.
    async fn by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIp>, IpamError>;

    /// Records whose key contains `keyword`, ordered by IP.
    async fn by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIp>, IpamError>;

    /// One entry per range set: the lowest IP of `key` inside the set that no
    /// earlier set took. An empty list returns every IP of `key`, ordered by IP.
    async fn by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<Option<FloatingIpInfo>>, IpamError>;

    /// Routable subnets holding a record of `key` inside every range set,
    /// sorted. For an empty key, free records count. An empty list is the
    /// same as [`Ipam::query_routable_subnet_by_key`].
    async fn node_subnets_by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<String>, IpamError>;

    /// Routable subnet containing `node_ip`, if a pool serves it.
    async fn routable_subnet(&self, node_ip: Ipv4Addr) -> Option<Ipv4Net>;

    /// Sorted distinct routable subnets holding a record of `key`. For an empty
    /// key, the subnets that still have a free IP.
    async fn query_routable_subnet_by_key(&self, key: &str) -> Result<Vec<String>, IpamError>;

    /// Per-pool usage.
    async fn pool_stats(&self) -> Result<Vec<PoolStats>, IpamError>;

    /// Releases backend resources.
    async fn shutdown(&self);

    /// Backend name, used in logs.
    fn name(&self) -> &str;
}

pub(crate) fn require_key(key: &str) -> Result<(), IpamError> {
    if key.is_empty() {
        Err(IpamError::InvalidConfig("empty key".to_string()))
    } else {
        Ok(())
    }
}

fn in_ranges(ranges: &[IpRange], ip: Ipv4Addr) -> bool {
    ranges.is_empty() || ranges.iter().any(|range| range.contains(ip))
}

/// Picks for each range set the lowest record inside it not picked by an
/// earlier set. `records` must be sorted by IP.
pub(crate) fn pick_per_range_set<'a>(
    records: &[&'a FloatingIp],
    ip_ranges: &[Vec<IpRange>],
) -> Vec<Option<&'a FloatingIp>> {
    let mut taken = HashSet::new();
    ip_ranges
        .iter()
        .map(|ranges| {
            let fip = records
                .iter()
                .copied()
                .find(|fip| !taken.contains(&fip.ip) && in_ranges(ranges, fip.ip))?;
            taken.insert(fip.ip);
            Some(fip)
        })
        .collect()
}

/// Routable subnets that have a record inside every range set.
pub(crate) fn subnets_in_all_range_sets(records: &[&FloatingIp], ip_ranges: &[Vec<IpRange>]) -> Vec<String> {
    let subnets_of = |ranges: &[IpRange]| -> BTreeSet<String> {
        records
            .iter()
            .filter(|fip| in_ranges(ranges, fip.ip))
            .map(|fip| fip.subnet.clone())
            .collect()
    };
    let mut sets = ip_ranges.iter().map(|ranges| subnets_of(ranges.as_slice()));
    let first = sets.next().unwrap_or_else(|| subnets_of(&[]));
    sets.fold(first, |acc, set| acc.intersection(&set).cloned().collect())
        .into_iter()
        .collect()
}

/// Pools sorted by routable subnet, at most one pool per routable subnet.
#[derive(Debug, Default)]
pub(crate) struct PoolSet {
    pools: Vec<FloatingIpPool>,
}

impl PoolSet {
    /// Drops pools whose routable subnet was already seen. The first one wins.
    pub(crate) fn new(pools: Vec<FloatingIpPool>) -> Self {
        let mut seen = HashSet::new();
        let mut kept = Vec::with_capacity(pools.len());
        for pool in pools {
            if !seen.insert(pool.routable_subnet) {
                warn!(
                    "Dropping pool {} with duplicate routable subnet {}",
                    pool.key(),
                    pool.routable_subnet
                );
                continue;
            }
            kept.push(pool);
        }
        kept.sort_by_key(|pool| (pool.routable_subnet.network(), pool.routable_subnet.prefix_len()));
        Self { pools: kept }
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &FloatingIpPool> {
        self.pools.iter()
    }

    pub(crate) fn len(&self) -> usize {
        self.pools.len()
    }

    /// Binary search for the pool whose routable subnet contains `node_ip`.
    pub(crate) fn routable_subnet(&self, node_ip: Ipv4Addr) -> Option<Ipv4Net> {
        let idx = self
            .pools
            .partition_point(|pool| pool.routable_subnet.network() <= node_ip);
        let pool = self.pools.get(idx.checked_sub(1)?)?;
        pool.routable_subnet
            .contains(&node_ip)
            .then_some(pool.routable_subnet)
    }

    pub(crate) fn by_routable_subnet(&self, subnet: &Ipv4Net) -> Option<&FloatingIpPool> {
        let subnet = subnet.trunc();
        self.pools.iter().find(|pool| pool.routable_subnet == subnet)
    }

    /// Pool whose usable ranges contain `ip`.
    pub(crate) fn pool_of(&self, ip: Ipv4Addr) -> Option<&FloatingIpPool> {
        self.pools.iter().find(|pool| pool.contains(ip))
    }

    pub(crate) fn ip_info(&self, ip: Ipv4Addr) -> Option<IpInfo> {
        let pool = self.pool_of(ip)?;
        Some(IpInfo {
            ip: Ipv4Net::new(ip, pool.sparse.prefix_len).ok()?,
            vlan: pool.sparse.vlan,
            gateway: pool.sparse.gateway,
            routable_subnet: pool.routable_subnet,
        })
    }

    pub(crate) fn info(&self, fip: FloatingIp) -> Result<FloatingIpInfo, IpamError> {
        let ip_info = self
            .ip_info(fip.ip)
            .ok_or_else(|| IpamError::NotFound(format!("no pool config for ip {}", fip.ip)))?;
        Ok(FloatingIpInfo { ip_info, fip })
    }

    /// Usage per pool given the allocated record count per routable subnet.
    pub(crate) fn stats(&self, allocated: &HashMap<String, u64>) -> Vec<PoolStats> {
        self.pools
            .iter()
            .map(|pool| PoolStats {
                routable_subnet: pool.routable_subnet,
                subnet: pool.sparse.ip_net(),
                first_ip: pool.sparse.ip_ranges.first().map(|range| range.first),
                total: pool.size(),
                allocated: allocated
                    .get(&pool.routable_subnet.to_string())
                    .copied()
                    .unwrap_or_default(),
            })
            .collect()
    }
}
