//! Floating IP pools and their JSON configuration form.

use crate::error::IpamError;
use crate::nets::{IpRange, SparseSubnet};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// A sparse subnet reachable from the nodes of one routable subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FloatingIpPoolConf", into = "FloatingIpPoolConf")]
pub struct FloatingIpPool {
    /// Subnet of the nodes eligible to use this pool
    pub routable_subnet: Ipv4Net,
    /// Usable addresses
    pub sparse: SparseSubnet,
}

/// Wire form of a pool.
///
/// ```json
/// {"routableSubnet": "10.49.27.0/24",
///  "ips": ["10.49.27.205", "10.49.27.216~10.49.27.218"],
///  "subnet": "10.49.27.0/24", "gateway": "10.49.27.1", "vlan": 2}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FloatingIpPoolConf {
    /// Node subnet, host bits are masked off on parse
    pub routable_subnet: Ipv4Net,
    /// Single addresses or `first~last` ranges
    pub ips: Vec<String>,
    /// Pool subnet; only its prefix length is used, the network comes from the gateway
    pub subnet: Ipv4Net,
    /// Gateway address
    pub gateway: Ipv4Addr,
    /// VLAN id
    #[serde(default)]
    pub vlan: u16,
}

impl FloatingIpPool {
    /// Pool identity, the CIDR of the pool subnet.
    pub fn key(&self) -> String {
        self.sparse.ip_net().to_string()
    }

    /// Returns true if `ip` is a usable address of this pool.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.sparse.contains(ip)
    }

    /// Number of usable addresses.
    pub fn size(&self) -> u64 {
        self.sparse.size()
    }

    /// Adds `ip` to the pool, merging ranges as needed.
    pub fn insert_ip(&mut self, ip: Ipv4Addr) -> bool {
        self.sparse.insert_ip(ip)
    }

    /// Removes `ip` from the pool, splitting ranges as needed.
    pub fn remove_ip(&mut self, ip: Ipv4Addr) -> bool {
        self.sparse.remove_ip(ip)
    }

    /// Iterates every usable address in ascending order.
    pub fn iter_ips(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.sparse.iter()
    }
}

impl TryFrom<FloatingIpPoolConf> for FloatingIpPool {
    type Error = IpamError;

    fn try_from(conf: FloatingIpPoolConf) -> Result<Self, Self::Error> {
        let mut sparse = SparseSubnet::new(conf.gateway, conf.subnet.prefix_len(), conf.vlan)?;
        sparse.ip_ranges = conf
            .ips
            .iter()
            .map(|s| s.parse::<IpRange>())
            .collect::<Result<_, _>>()?;
        fip_check(&sparse)?;
        Ok(Self {
            routable_subnet: conf.routable_subnet.trunc(),
            sparse,
        })
    }
}

impl From<FloatingIpPool> for FloatingIpPoolConf {
    fn from(pool: FloatingIpPool) -> Self {
        Self {
            routable_subnet: pool.routable_subnet,
            ips: pool.sparse.ip_ranges.iter().map(ToString::to_string).collect(),
            subnet: pool.sparse.ip_net(),
            gateway: pool.sparse.gateway,
            vlan: pool.sparse.vlan,
        }
    }
}

/// Rejects ranges outside the subnet and ranges that are out of order,
/// overlapping or adjacent. Such configs must be pre-merged by the author.
pub fn fip_check(sparse: &SparseSubnet) -> Result<(), IpamError> {
    let net = sparse.ip_net();
    for (i, range) in sparse.ip_ranges.iter().enumerate() {
        if !net.contains(&range.first) || !net.contains(&range.last) {
            return Err(IpamError::InvalidConfig(format!("ip range {range} not in subnet {net}")));
        }
        if i > 0 {
            let prev = sparse.ip_ranges[i - 1];
            if u64::from(u32::from(range.first)) <= u64::from(u32::from(prev.last)) + 1 {
                return Err(IpamError::InvalidConfig(format!(
                    "ip range {prev} and {range} can be merged into one or have wrong order"
                )));
            }
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct PoolDocument {
    floatingips: Vec<FloatingIpPool>,
}

/// Parses a pool config document: either a bare JSON array of pools or an
/// object with a `floatingips` array.
pub fn parse_pools(json: &str) -> Result<Vec<FloatingIpPool>, IpamError> {
    let json = json.trim();
    if json.is_empty() {
        return Ok(Vec::new());
    }
    let parsed = if json.starts_with('[') {
        serde_json::from_str(json)
    } else {
        serde_json::from_str::<PoolDocument>(json).map(|doc| doc.floatingips)
    };
    parsed.map_err(|e| IpamError::InvalidConfig(format!("invalid floating ip config: {e}")))
}
