//! IPv4 range algebra.
//!
//! A [`SparseSubnet`] is a CIDR subnet of which only some addresses are
//! usable, expressed as a sorted list of inclusive [`IpRange`]s. The list is
//! kept sorted, non-overlapping and maximally merged by [`SparseSubnet::insert_ip`]
//! and [`SparseSubnet::remove_ip`], the only range mutators.

use crate::error::IpamError;
use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Separator between the first and last address of a range in config strings.
pub const IP_RANGE_SEPARATOR: char = '~';

/// An inclusive range of IPv4 addresses. `first <= last` always holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IpRange {
    /// First address, inclusive
    pub first: Ipv4Addr,
    /// Last address, inclusive
    pub last: Ipv4Addr,
}

impl IpRange {
    /// Creates a range, returning `None` when `first > last`.
    pub fn new(first: Ipv4Addr, last: Ipv4Addr) -> Option<Self> {
        (first <= last).then_some(Self { first, last })
    }

    /// Creates a range holding a single address.
    pub fn single(ip: Ipv4Addr) -> Self {
        Self { first: ip, last: ip }
    }

    /// Number of addresses in the range.
    pub fn size(&self) -> u64 {
        u64::from(u32::from(self.last)) - u64::from(u32::from(self.first)) + 1
    }

    /// Integer-range membership test.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.first <= ip && ip <= self.last
    }

    /// Iterates the addresses of the range in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + use<> {
        (u32::from(self.first)..=u32::from(self.last)).map(Ipv4Addr::from)
    }
}

impl fmt::Display for IpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}{}{}", self.first, IP_RANGE_SEPARATOR, self.last)
        }
    }
}

impl FromStr for IpRange {
    type Err = IpamError;

    /// Parses `a.b.c.d` or `first~last`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse = |part: &str| {
            part.trim()
                .parse::<Ipv4Addr>()
                .map_err(|e| IpamError::InvalidConfig(format!("invalid ip range {s}: {e}")))
        };
        match s.split_once(IP_RANGE_SEPARATOR) {
            None => Ok(Self::single(parse(s)?)),
            Some((first, last)) => Self::new(parse(first)?, parse(last)?).ok_or_else(|| {
                IpamError::InvalidConfig(format!("invalid ip range {s}: first ip is larger than last"))
            }),
        }
    }
}

impl Serialize for IpRange {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IpRange {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A subnet of which only the addresses in `ip_ranges` are usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseSubnet {
    /// Sorted, non-overlapping, maximally merged ranges
    pub ip_ranges: Vec<IpRange>,
    /// Gateway of the subnet
    pub gateway: Ipv4Addr,
    /// Prefix length of the subnet mask
    pub prefix_len: u8,
    /// VLAN id, 0 when untagged
    pub vlan: u16,
}

impl SparseSubnet {
    /// Creates an empty sparse subnet.
    pub fn new(gateway: Ipv4Addr, prefix_len: u8, vlan: u16) -> Result<Self, IpamError> {
        if prefix_len > 32 {
            return Err(IpamError::InvalidConfig(format!("invalid prefix length {prefix_len}")));
        }
        Ok(Self {
            ip_ranges: Vec::new(),
            gateway,
            prefix_len,
            vlan,
        })
    }

    /// The CIDR of the subnet, gateway masked by the prefix.
    pub fn ip_net(&self) -> Ipv4Net {
        // prefix_len is validated on construction
        Ipv4Net::new(self.gateway, self.prefix_len.min(32))
            .map(|net| net.trunc())
            .unwrap_or_default()
    }

    /// Subnet mask in dotted form.
    pub fn mask(&self) -> Ipv4Addr {
        self.ip_net().netmask()
    }

    /// Returns true if `ip` is in one of the usable ranges.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.ip_ranges.iter().any(|r| r.contains(ip))
    }

    /// Number of usable addresses.
    pub fn size(&self) -> u64 {
        self.ip_ranges.iter().map(IpRange::size).sum()
    }

    /// Iterates every usable address in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        self.ip_ranges.iter().flat_map(IpRange::iter)
    }

    /// Adds `ip` to the usable ranges. Returns false if it was already present
    /// or lies outside the subnet.
    pub fn insert_ip(&mut self, ip: Ipv4Addr) -> bool {
        if !self.ip_net().contains(&ip) {
            return false;
        }
        let n = u32::from(ip);
        for i in 0..self.ip_ranges.len() {
            let range = self.ip_ranges[i];
            if range.contains(ip) {
                return false;
            }
            let first = u32::from(range.first);
            if first > n {
                if first - n == 1 {
                    self.ip_ranges[i].first = ip;
                    if i > 0 {
                        self.try_merge(i - 1);
                    }
                } else {
                    self.ip_ranges.insert(i, IpRange::single(ip));
                }
                return true;
            }
            // range.last < ip here
            if u32::from(range.last) + 1 == n {
                self.ip_ranges[i].last = ip;
                self.try_merge(i);
                return true;
            }
        }
        self.ip_ranges.push(IpRange::single(ip));
        true
    }

    /// Removes `ip` from the usable ranges. Returns false if it was absent.
    pub fn remove_ip(&mut self, ip: Ipv4Addr) -> bool {
        let Some(i) = self.ip_ranges.iter().position(|r| r.contains(ip)) else {
            return false;
        };
        let range = self.ip_ranges[i];
        let n = u32::from(ip);
        if range.first == range.last {
            self.ip_ranges.remove(i);
        } else if range.first == ip {
            self.ip_ranges[i].first = Ipv4Addr::from(n + 1);
        } else if range.last == ip {
            self.ip_ranges[i].last = Ipv4Addr::from(n - 1);
        } else {
            self.ip_ranges[i].last = Ipv4Addr::from(n - 1);
            self.ip_ranges.insert(
                i + 1,
                IpRange {
                    first: Ipv4Addr::from(n + 1),
                    last: range.last,
                },
            );
        }
        true
    }

    /// Merges range `i` with range `i + 1` if they are adjacent.
    fn try_merge(&mut self, i: usize) {
        if i + 1 >= self.ip_ranges.len() {
            return;
        }
        let next = self.ip_ranges[i + 1];
        if u32::from(self.ip_ranges[i].last).checked_add(1) == Some(u32::from(next.first)) {
            self.ip_ranges[i].last = next.last;
            self.ip_ranges.remove(i + 1);
        }
    }
}
