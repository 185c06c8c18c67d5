//! CRD-backed IPAM.
//!
//! Allocated addresses are FloatingIP objects named by IP. The backend keeps
//! two ordered maps, allocated and unallocated, under one async lock. Every
//! mutating call holds the write lock across its API round trip, so a single
//! active instance decides which address to hand out.
//!
//! The cache remembers the `resourceVersion` of every object it saw in a
//! list, create or replace response. Updates are sent with that version and
//! never re-read the object, so an instance holding a stale view gets a
//! conflict from the API server instead of overwriting a newer owner.
//! Creation fails on a taken name. Deletes are unconditional.

mod client;
mod store;

pub use client::{FloatingIpClient, KubeFloatingIpClient};

use crate::error::IpamError;
use crate::ipam::{
    FloatingIp, FloatingIpInfo, Ipam, PoolSet, PoolStats, ReleasePolicy, ReleaseResult, pick_per_range_set,
    require_key, subnets_in_all_range_sets,
};
use crate::nets::IpRange;
use crate::pool::FloatingIpPool;
use async_trait::async_trait;
use chrono::Utc;
use crds::{EXTERNAL_IP_TYPE, FloatingIP, INTERNAL_IP_TYPE};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Which FloatingIP objects an instance manages, by `ipType` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpType {
    /// Pod IPs on the cluster network
    #[default]
    Internal,
    /// IPs exposed outside the cluster
    External,
}

impl IpType {
    /// Label value.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Internal => INTERNAL_IP_TYPE,
            Self::External => EXTERNAL_IP_TYPE,
        }
    }
}

impl FromStr for IpType {
    type Err = IpamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            INTERNAL_IP_TYPE => Ok(Self::Internal),
            EXTERNAL_IP_TYPE => Ok(Self::External),
            other => Err(IpamError::InvalidConfig(format!(
                "ip type must be {INTERNAL_IP_TYPE} or {EXTERNAL_IP_TYPE}, got {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Default)]
struct Cache {
    pools: Arc<PoolSet>,
    allocated: BTreeMap<Ipv4Addr, FloatingIp>,
    unallocated: BTreeMap<Ipv4Addr, FloatingIp>,
    // last seen resourceVersion of each allocated IP's object
    versions: HashMap<Ipv4Addr, String>,
}

impl Cache {
    fn sync_after_create(&mut self, fip: FloatingIp, version: Option<String>) {
        self.unallocated.remove(&fip.ip);
        self.sync_after_update(fip, version);
    }

    fn sync_after_update(&mut self, fip: FloatingIp, version: Option<String>) {
        match version {
            Some(version) => self.versions.insert(fip.ip, version),
            None => self.versions.remove(&fip.ip),
        };
        self.allocated.insert(fip.ip, fip);
    }

    fn version_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.versions.get(&ip).cloned()
    }

    fn sync_after_delete(&mut self, ip: Ipv4Addr) {
        self.versions.remove(&ip);
        if let Some(fip) = self.allocated.remove(&ip) {
            self.unallocated.insert(ip, FloatingIp::unallocated(ip, fip.subnet));
        }
    }

    /// Most recently updated record of `key`, ties broken by the higher IP.
    fn latest_of(&self, key: &str, subnet: Option<&str>) -> Option<&FloatingIp> {
        self.allocated
            .values()
            .filter(|fip| fip.key == key && subnet.is_none_or(|s| fip.subnet == s))
            .max_by_key(|fip| (fip.updated_at, fip.ip))
    }

    fn owner_of(&self, ip: Ipv4Addr) -> Option<String> {
        self.allocated.get(&ip).map(|fip| fip.key.clone())
    }

    fn check_owner(&self, key: &str, ip: Ipv4Addr) -> Result<&FloatingIp, IpamError> {
        let fip = self
            .allocated
            .get(&ip)
            .ok_or_else(|| IpamError::NotFound(format!("ip {ip} is not allocated")))?;
        if fip.key != key {
            return Err(IpamError::KeyMismatch {
                ip,
                expected: key.to_string(),
                actual: fip.key.clone(),
            });
        }
        Ok(fip)
    }

    fn allocated_to(&self, key: &str) -> Vec<&FloatingIp> {
        self.allocated.values().filter(|fip| fip.key == key).collect()
    }

    fn records(&self, matches: impl Fn(&FloatingIp) -> bool) -> Vec<FloatingIp> {
        let mut out: Vec<_> = self
            .allocated
            .values()
            .chain(self.unallocated.values())
            .filter(|fip| matches(*fip))
            .cloned()
            .collect();
        out.sort_by_key(|fip| fip.ip);
        out
    }
}

/// IPAM over FloatingIP custom resources.
pub struct CrdIpam {
    client: Box<dyn FloatingIpClient>,
    ip_type: IpType,
    cache: RwLock<Cache>,
}

impl fmt::Debug for CrdIpam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrdIpam")
            .field("ip_type", &self.ip_type)
            .finish_non_exhaustive()
    }
}

impl CrdIpam {
    /// Creates an IPAM with no pools. Call [`Ipam::configure_pool`] before allocating.
    pub fn new(client: impl FloatingIpClient + 'static, ip_type: IpType) -> Self {
        Self {
            client: Box::new(client),
            ip_type,
            cache: RwLock::new(Cache::default()),
        }
    }

    /// Takes an IP out of circulation for a manually created object carrying
    /// the reserved label. Returns false if the object is not reserved or is
    /// already accounted for.
    pub async fn handle_reserved_apply(&self, obj: &FloatingIP) -> Result<bool, IpamError> {
        if !obj.is_reserved() {
            return Ok(false);
        }
        let ip = store::ip_of(obj)?;
        let mut cache = self.cache.write().await;
        if let Some(owner) = cache.owner_of(ip) {
            if owner == obj.spec.key {
                return Ok(false);
            }
            return Err(IpamError::KeyMismatch {
                ip,
                expected: obj.spec.key.clone(),
                actual: owner,
            });
        }
        let Some(free) = cache.unallocated.get(&ip) else {
            return Err(IpamError::UnknownIp(ip));
        };
        let fip = store::record_of(ip, &obj.spec, free.subnet.clone());
        cache.sync_after_create(fip, obj.metadata.resource_version.clone());
        info!("Reserved {} for {}", ip, obj.spec.key);
        Ok(true)
    }

    /// Returns an IP to the pool after its reserved object was deleted.
    /// Returns false if the object is not reserved or the IP was not held by it.
    pub async fn handle_reserved_delete(&self, obj: &FloatingIP) -> Result<bool, IpamError> {
        if !obj.is_reserved() {
            return Ok(false);
        }
        let ip = store::ip_of(obj)?;
        let mut cache = self.cache.write().await;
        if cache.owner_of(ip).is_some_and(|owner| owner == obj.spec.key) {
            cache.sync_after_delete(ip);
            info!("Unreserved {}", ip);
            return Ok(true);
        }
        Ok(false)
    }
}

#[async_trait]
impl Ipam for CrdIpam {
    async fn configure_pool(&self, pools: Vec<FloatingIpPool>) -> Result<(), IpamError> {
        let pools = PoolSet::new(pools);
        let mut cache = self.cache.write().await;
        let objects = self.list_floating_ips().await?;

        let mut allocated = BTreeMap::new();
        let mut versions = HashMap::new();
        let mut unscoped = Vec::new();
        for obj in &objects {
            let ip = match store::ip_of(obj) {
                Ok(ip) => ip,
                Err(e) => {
                    warn!("Ignoring FloatingIP: {}", e);
                    continue;
                }
            };
            match pools.pool_of(ip) {
                Some(pool) => {
                    allocated.insert(ip, store::record_of(ip, &obj.spec, pool.routable_subnet.to_string()));
                    if let Some(version) = &obj.metadata.resource_version {
                        versions.insert(ip, version.clone());
                    }
                }
                None => unscoped.push(ip),
            }
        }
        for ip in unscoped {
            match self.delete_floating_ip(ip).await {
                Ok(()) => info!("Deleted FloatingIP {} which is no longer in any pool", ip),
                Err(e) => error!("Failed to delete FloatingIP {}: {}", ip, e),
            }
        }

        let mut unallocated = BTreeMap::new();
        for pool in pools.iter() {
            let subnet = pool.routable_subnet.to_string();
            for ip in pool.iter_ips().filter(|ip| !allocated.contains_key(ip)) {
                let fip = cache
                    .unallocated
                    .remove(&ip)
                    .filter(|fip| fip.subnet == subnet)
                    .unwrap_or_else(|| FloatingIp::unallocated(ip, subnet.clone()));
                unallocated.insert(ip, fip);
            }
        }

        info!(
            "configure pool done: {} pools, {} unallocated, {} allocated",
            pools.len(),
            unallocated.len(),
            allocated.len()
        );
        *cache = Cache {
            pools: Arc::new(pools),
            allocated,
            unallocated,
            versions,
        };
        Ok(())
    }

    async fn allocate_specific_ip(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        require_key(key)?;
        let mut cache = self.cache.write().await;
        if let Some(owner) = cache.owner_of(ip) {
            return if owner == key { Ok(()) } else { Err(IpamError::NoEnoughIp) };
        }
        let free = cache.unallocated.get(&ip).ok_or(IpamError::UnknownIp(ip))?;
        let fip = FloatingIp {
            key: key.to_string(),
            policy,
            attr: attr.to_string(),
            updated_at: Utc::now(),
            ..free.clone()
        };
        let version = self.create_floating_ip(&fip).await?;
        cache.sync_after_create(fip, version);
        info!("Allocated {} for {}", ip, key);
        Ok(())
    }

    async fn allocate_in_subnet(
        &self,
        key: &str,
        routable_subnet: &Ipv4Net,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Ipv4Addr, IpamError> {
        require_key(key)?;
        let mut cache = self.cache.write().await;
        let subnet = cache
            .pools
            .by_routable_subnet(routable_subnet)
            .map(|pool| pool.routable_subnet.to_string())
            .ok_or_else(|| IpamError::NoFipForSubnet(routable_subnet.to_string()))?;
        let free = cache
            .unallocated
            .values()
            .find(|fip| fip.subnet == subnet)
            .ok_or(IpamError::NoEnoughIp)?;
        let fip = FloatingIp {
            key: key.to_string(),
            policy,
            attr: attr.to_string(),
            updated_at: Utc::now(),
            ..free.clone()
        };
        let version = self.create_floating_ip(&fip).await?;
        let ip = fip.ip;
        cache.sync_after_create(fip, version);
        info!("Allocated {} in {} for {}", ip, subnet, key);
        Ok(ip)
    }

    async fn allocate_in_subnets_and_ip_range(
        &self,
        key: &str,
        routable_subnet: &Ipv4Net,
        ip_ranges: &[Vec<IpRange>],
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Vec<Ipv4Addr>, IpamError> {
        require_key(key)?;
        let any = [Vec::new()];
        let ip_ranges = if ip_ranges.is_empty() { &any[..] } else { ip_ranges };
        let mut cache = self.cache.write().await;
        let subnet = cache
            .pools
            .by_routable_subnet(routable_subnet)
            .map(|pool| pool.routable_subnet.to_string())
            .ok_or_else(|| IpamError::NoFipForSubnet(routable_subnet.to_string()))?;
        let free: Vec<_> = cache.unallocated.values().filter(|fip| fip.subnet == subnet).collect();
        let now = Utc::now();
        let claims = pick_per_range_set(&free, ip_ranges)
            .into_iter()
            .map(|fip| {
                fip.map(|fip| FloatingIp {
                    key: key.to_string(),
                    policy,
                    attr: attr.to_string(),
                    updated_at: now,
                    ..fip.clone()
                })
            })
            .collect::<Option<Vec<_>>>()
            .ok_or(IpamError::NoEnoughIp)?;

        let mut created = Vec::with_capacity(claims.len());
        for fip in claims {
            match self.create_floating_ip(&fip).await {
                Ok(version) => created.push((fip, version)),
                Err(e) => {
                    for (fip, version) in created {
                        if let Err(undo) = self.delete_floating_ip(fip.ip).await {
                            error!("Failed to roll back FloatingIP {}: {}", fip.ip, undo);
                            cache.sync_after_create(fip, version);
                        }
                    }
                    return Err(e);
                }
            }
        }
        let ips: Vec<_> = created.iter().map(|(fip, _)| fip.ip).collect();
        for (fip, version) in created {
            cache.sync_after_create(fip, version);
        }
        info!("Allocated {:?} in {} for {}", ips, subnet, key);
        Ok(ips)
    }

    async fn allocate_in_subnet_with_key(
        &self,
        old_key: &str,
        new_key: &str,
        subnet: &str,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        require_key(old_key)?;
        require_key(new_key)?;
        let mut cache = self.cache.write().await;
        let latest = cache
            .latest_of(old_key, Some(subnet))
            .ok_or_else(|| IpamError::NotFound(format!("no ip of {old_key} in subnet {subnet}")))?;
        let fip = FloatingIp {
            key: new_key.to_string(),
            policy,
            attr: attr.to_string(),
            updated_at: Utc::now(),
            ..latest.clone()
        };
        let version = self.update_floating_ip(&fip, cache.version_of(fip.ip)).await?;
        cache.sync_after_update(fip, version);
        Ok(())
    }

    async fn reserve_ip(&self, old_key: &str, new_key: &str, attr: &str) -> Result<(), IpamError> {
        require_key(old_key)?;
        require_key(new_key)?;
        let mut cache = self.cache.write().await;
        let latest = cache
            .latest_of(old_key, None)
            .ok_or_else(|| IpamError::NotFound(format!("no ip of {old_key}")))?;
        let fip = FloatingIp {
            key: new_key.to_string(),
            attr: attr.to_string(),
            updated_at: Utc::now(),
            ..latest.clone()
        };
        let version = self.update_floating_ip(&fip, cache.version_of(fip.ip)).await?;
        info!("Reserved {} of {} for {}", fip.ip, old_key, new_key);
        cache.sync_after_update(fip, version);
        Ok(())
    }

    async fn update_policy(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        let mut cache = self.cache.write().await;
        let fip = FloatingIp {
            policy,
            attr: attr.to_string(),
            updated_at: Utc::now(),
            ..cache.check_owner(key, ip)?.clone()
        };
        let version = self.update_floating_ip(&fip, cache.version_of(ip)).await?;
        cache.sync_after_update(fip, version);
        Ok(())
    }

    async fn release(&self, key: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        let mut cache = self.cache.write().await;
        cache.check_owner(key, ip)?;
        self.delete_floating_ip(ip).await?;
        cache.sync_after_delete(ip);
        info!("Released {} of {}", ip, key);
        Ok(())
    }

    async fn release_ips(&self, ip_to_key: HashMap<Ipv4Addr, String>) -> Result<ReleaseResult, IpamError> {
        let mut cache = self.cache.write().await;
        let mut released = HashMap::new();
        let mut unreleased = HashMap::new();
        let mut pending = ip_to_key.into_iter();
        while let Some((ip, key)) = pending.next() {
            match cache.owner_of(ip) {
                Some(owner) if owner == key => {
                    if let Err(e) = self.delete_floating_ip(ip).await {
                        unreleased.insert(ip, owner);
                        for (ip, _) in pending {
                            unreleased.insert(ip, cache.owner_of(ip).unwrap_or_default());
                        }
                        error!(
                            "Release stopped at {} after {} ips: {}",
                            ip,
                            released.len(),
                            e
                        );
                        return Err(IpamError::PartialRelease {
                            released,
                            unreleased,
                            source: Box::new(e),
                        });
                    }
                    cache.sync_after_delete(ip);
                    released.insert(ip, key);
                }
                owner => {
                    unreleased.insert(ip, owner.unwrap_or_default());
                }
            }
        }
        if !released.is_empty() {
            info!("Released {} ips", released.len());
        }
        Ok((released, unreleased))
    }

    async fn release_by_prefix(&self, prefix: &str) -> Result<(), IpamError> {
        let mut cache = self.cache.write().await;
        let ips: Vec<_> = cache
            .allocated
            .values()
            .filter(|fip| fip.key.starts_with(prefix))
            .map(|fip| fip.ip)
            .collect();
        for ip in &ips {
            self.delete_floating_ip(*ip).await?;
            cache.sync_after_delete(*ip);
        }
        info!("Released {} ips with key prefix {}", ips.len(), prefix);
        Ok(())
    }

    async fn first(&self, key: &str) -> Result<Option<FloatingIpInfo>, IpamError> {
        if key.is_empty() {
            return Ok(None);
        }
        let cache = self.cache.read().await;
        let Some(fip) = cache.allocated.values().find(|fip| fip.key == key) else {
            return Ok(None);
        };
        cache.pools.info(fip.clone()).map(Some)
    }

    async fn by_ip(&self, ip: Ipv4Addr) -> Result<Option<FloatingIp>, IpamError> {
        let cache = self.cache.read().await;
        Ok(cache
            .allocated
            .get(&ip)
            .or_else(|| cache.unallocated.get(&ip))
            .cloned())
    }

    async fn by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIp>, IpamError> {
        Ok(self.cache.read().await.records(|fip| fip.key.starts_with(prefix)))
    }

    async fn by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIp>, IpamError> {
        Ok(self.cache.read().await.records(|fip| fip.key.contains(keyword)))
    }

    async fn by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<Option<FloatingIpInfo>>, IpamError> {
        if key.is_empty() {
            return Ok(vec![None; ip_ranges.len()]);
        }
        let cache = self.cache.read().await;
        let owned = cache.allocated_to(key);
        let picked = if ip_ranges.is_empty() {
            owned.into_iter().map(Some).collect()
        } else {
            pick_per_range_set(&owned, ip_ranges)
        };
        picked
            .into_iter()
            .map(|fip| fip.map(|fip| cache.pools.info(fip.clone())).transpose())
            .collect()
    }

    async fn node_subnets_by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<String>, IpamError> {
        let cache = self.cache.read().await;
        let records: Vec<_> = if key.is_empty() {
            cache.unallocated.values().collect()
        } else {
            cache.allocated_to(key)
        };
        Ok(subnets_in_all_range_sets(&records, ip_ranges))
    }

    async fn routable_subnet(&self, node_ip: Ipv4Addr) -> Option<Ipv4Net> {
        self.cache.read().await.pools.routable_subnet(node_ip)
    }

    async fn query_routable_subnet_by_key(&self, key: &str) -> Result<Vec<String>, IpamError> {
        let cache = self.cache.read().await;
        let records = if key.is_empty() {
            &cache.unallocated
        } else {
            &cache.allocated
        };
        let subnets: BTreeSet<_> = records
            .values()
            .filter(|fip| fip.key == key)
            .map(|fip| fip.subnet.clone())
            .collect();
        Ok(subnets.into_iter().collect())
    }

    async fn pool_stats(&self) -> Result<Vec<PoolStats>, IpamError> {
        let cache = self.cache.read().await;
        let mut allocated: HashMap<String, u64> = HashMap::new();
        for fip in cache.allocated.values() {
            *allocated.entry(fip.subnet.clone()).or_default() += 1;
        }
        Ok(cache.pools.stats(&allocated))
    }

    async fn shutdown(&self) {
        debug!("Shutting down {} ipam", self.ip_type.as_str());
    }

    fn name(&self) -> &str {
        self.ip_type.as_str()
    }
}
