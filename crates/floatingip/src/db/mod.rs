//! SQL-backed IPAM.
//!
//! One row per usable address. Allocation is a single conditional `UPDATE`,
//! so no in-process lock is held across I/O and several processes may share
//! one table.

mod store;

use crate::error::IpamError;
use crate::ipam::{
    FloatingIp, FloatingIpInfo, Ipam, PoolSet, PoolStats, ReleasePolicy, ReleaseResult, pick_per_range_set,
    require_key, subnets_in_all_range_sets,
};
use crate::nets::IpRange;
use crate::pool::FloatingIpPool;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Default allocation table.
pub const DEFAULT_TABLE_NAME: &str = "ip_pool";

/// IPAM over one SQLite table.
#[derive(Debug)]
pub struct DbIpam {
    db: SqlitePool,
    table: String,
    pools: RwLock<Arc<PoolSet>>,
}

impl DbIpam {
    /// Creates the table if needed. Several instances may share `db` with
    /// distinct table names.
    pub async fn new(db: SqlitePool, table: impl Into<String>) -> Result<Self, IpamError> {
        let table = table.into();
        validate_table_name(&table)?;
        let ipam = Self {
            db,
            table,
            pools: RwLock::new(Arc::new(PoolSet::default())),
        };
        ipam.create_table().await?;
        info!("Using allocation table {}", ipam.table);
        Ok(ipam)
    }

    /// Opens a connection pool to `url`, creating the database file if missing.
    pub async fn connect(url: &str, table: &str, max_connections: u32) -> Result<Self, IpamError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let db = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        Self::new(db, table).await
    }

    async fn pools(&self) -> Arc<PoolSet> {
        Arc::clone(&*self.pools.read().await)
    }
}

fn validate_table_name(name: &str) -> Result<(), IpamError> {
    let valid = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(IpamError::InvalidConfig(format!("invalid table name {name:?}")))
    }
}

#[async_trait]
impl Ipam for DbIpam {
    async fn configure_pool(&self, pools: Vec<FloatingIpPool>) -> Result<(), IpamError> {
        let pools = PoolSet::new(pools);
        let records = self.find_all().await?;

        let mut existing = HashSet::new();
        let mut unscoped = Vec::new();
        let mut moved: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
        let mut allocated = 0;
        for fip in &records {
            let Some(pool) = pools.pool_of(fip.ip) else {
                if fip.is_allocated() {
                    warn!("Deleting ip {} of {} which is no longer in any pool", fip.ip, fip.key);
                }
                unscoped.push(fip.ip);
                continue;
            };
            existing.insert(fip.ip);
            if fip.is_allocated() {
                allocated += 1;
            }
            let subnet = pool.routable_subnet.to_string();
            if fip.subnet != subnet {
                moved.entry(subnet).or_default().push(fip.ip);
            }
        }

        if !unscoped.is_empty() {
            let deleted = self.delete_unscoped(&unscoped).await?;
            info!("Deleted {} ips no longer in any pool", deleted);
        }
        for (subnet, ips) in &moved {
            let updated = self.update_subnet(ips, subnet).await?;
            info!("Moved {} ips to routable subnet {}", updated, subnet);
        }

        let mut missing = Vec::new();
        for pool in pools.iter() {
            let subnet = pool.routable_subnet.to_string();
            missing.extend(
                pool.iter_ips()
                    .filter(|ip| !existing.contains(ip))
                    .map(|ip| FloatingIp::unallocated(ip, subnet.clone())),
            );
        }
        if !missing.is_empty() {
            let inserted = self.create(&missing).await?;
            debug!("Inserted {} of {} new ips", inserted, missing.len());
        }

        let total = existing.len() + missing.len();
        let pool_count = pools.len();
        *self.pools.write().await = Arc::new(pools);
        info!(
            "configure pool done: {} pools, {} unallocated, {} allocated",
            pool_count,
            total - allocated,
            allocated
        );
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
        match self.allocate_specific(ip, key, policy, attr).await {
            Ok(()) => {
                info!("Allocated {} for {}", ip, key);
                Ok(())
            }
            Err(IpamError::NotUpdated) => match self.find_by_ip(ip).await? {
                None => Err(IpamError::UnknownIp(ip)),
                Some(fip) if fip.key == key => Ok(()),
                Some(_) => Err(IpamError::NoEnoughIp),
            },
            Err(e) => Err(e),
        }
    }

    async fn allocate_in_subnet(
        &self,
        key: &str,
        routable_subnet: &Ipv4Net,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<Ipv4Addr, IpamError> {
        require_key(key)?;
        let subnet = self
            .pools()
            .await
            .by_routable_subnet(routable_subnet)
            .map(|pool| pool.routable_subnet.to_string())
            .ok_or_else(|| IpamError::NoFipForSubnet(routable_subnet.to_string()))?;
        let ip = self
            .allocate_one_in_subnet(key, &subnet, policy, attr)
            .await
            .map_err(IpamError::into_public)?;
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
        let subnet = self
            .pools()
            .await
            .by_routable_subnet(routable_subnet)
            .map(|pool| pool.routable_subnet.to_string())
            .ok_or_else(|| IpamError::NoFipForSubnet(routable_subnet.to_string()))?;
        let any = [Vec::new()];
        let ip_ranges = if ip_ranges.is_empty() { &any[..] } else { ip_ranges };
        let ips = self
            .allocate_in_ranges(key, &subnet, ip_ranges, policy, attr)
            .await
            .map_err(IpamError::into_public)?;
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
        match self.update_one_in_subnet(old_key, new_key, subnet, policy, attr).await {
            Err(IpamError::NotUpdated) => Err(IpamError::NotFound(format!(
                "no ip of {old_key} in subnet {subnet}"
            ))),
            other => other,
        }
    }

    async fn reserve_ip(&self, old_key: &str, new_key: &str, attr: &str) -> Result<(), IpamError> {
        require_key(old_key)?;
        require_key(new_key)?;
        match self.update_key(old_key, new_key, attr).await {
            Ok(()) => {
                info!("Reserved ip of {} for {}", old_key, new_key);
                Ok(())
            }
            Err(IpamError::NotUpdated) => Err(IpamError::NotFound(format!("no ip of {old_key}"))),
            Err(e) => Err(e),
        }
    }

    async fn update_policy(
        &self,
        key: &str,
        ip: Ipv4Addr,
        policy: ReleasePolicy,
        attr: &str,
    ) -> Result<(), IpamError> {
        require_key(key)?;
        match self.update_policy_of(ip, key, policy, attr).await {
            Err(IpamError::NotUpdated) => match self.find_by_ip(ip).await? {
                None => Err(IpamError::UnknownIp(ip)),
                Some(fip) => Err(IpamError::KeyMismatch {
                    ip,
                    expected: key.to_string(),
                    actual: fip.key,
                }),
            },
            other => other,
        }
    }

    async fn release(&self, key: &str, ip: Ipv4Addr) -> Result<(), IpamError> {
        if self.release_ip(ip, key).await? == 0 {
            debug!("Ip {} is not owned by {}, treating as released", ip, key);
        } else {
            info!("Released {} of {}", ip, key);
        }
        Ok(())
    }

    async fn release_ips(&self, ip_to_key: HashMap<Ipv4Addr, String>) -> Result<ReleaseResult, IpamError> {
        let mut released = HashMap::new();
        let mut unreleased = HashMap::new();
        let mut pending = ip_to_key.into_iter();
        while let Some((ip, key)) = pending.next() {
            let outcome = match self.release_ip(ip, &key).await {
                Ok(1) => Ok(None),
                Ok(_) => self.find_by_ip(ip).await.map(|fip| Some(fip.map(|fip| fip.key).unwrap_or_default())),
                Err(e) => Err(e),
            };
            match outcome {
                Ok(None) => {
                    released.insert(ip, key);
                }
                Ok(Some(current)) => {
                    unreleased.insert(ip, current);
                }
                Err(e) => {
                    error!("Release stopped at {} after {} ips: {}", ip, released.len(), e);
                    unreleased.insert(ip, key);
                    unreleased.extend(pending);
                    return Err(IpamError::PartialRelease {
                        released,
                        unreleased,
                        source: Box::new(e),
                    });
                }
            }
        }
        if !released.is_empty() {
            info!("Released {} ips", released.len());
        }
        Ok((released, unreleased))
    }

    async fn release_by_prefix(&self, prefix: &str) -> Result<(), IpamError> {
        let released = self.release_by_prefix_rows(prefix).await?;
        info!("Released {} ips with key prefix {}", released, prefix);
        Ok(())
    }

    async fn first(&self, key: &str) -> Result<Option<FloatingIpInfo>, IpamError> {
        if key.is_empty() {
            return Ok(None);
        }
        let Some(fip) = self.find_by_key(key).await?.into_iter().next() else {
            return Ok(None);
        };
        self.pools().await.info(fip).map(Some)
    }

    async fn by_ip(&self, ip: Ipv4Addr) -> Result<Option<FloatingIp>, IpamError> {
        self.find_by_ip(ip).await
    }

    async fn by_prefix(&self, prefix: &str) -> Result<Vec<FloatingIp>, IpamError> {
        self.find_by_prefix(prefix).await
    }

    async fn by_keyword(&self, keyword: &str) -> Result<Vec<FloatingIp>, IpamError> {
        self.find_by_keyword(keyword).await
    }

    async fn by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<Option<FloatingIpInfo>>, IpamError> {
        if key.is_empty() {
            return Ok(vec![None; ip_ranges.len()]);
        }
        let records = self.find_by_key(key).await?;
        let owned: Vec<_> = records.iter().collect();
        let picked = if ip_ranges.is_empty() {
            owned.into_iter().map(Some).collect()
        } else {
            pick_per_range_set(&owned, ip_ranges)
        };
        let pools = self.pools().await;
        picked
            .into_iter()
            .map(|fip| fip.map(|fip| pools.info(fip.clone())).transpose())
            .collect()
    }

    async fn node_subnets_by_key_and_ip_ranges(
        &self,
        key: &str,
        ip_ranges: &[Vec<IpRange>],
    ) -> Result<Vec<String>, IpamError> {
        let records = self.find_by_key(key).await?;
        let records: Vec<_> = records.iter().collect();
        Ok(subnets_in_all_range_sets(&records, ip_ranges))
    }

    async fn routable_subnet(&self, node_ip: Ipv4Addr) -> Option<Ipv4Net> {
        self.pools().await.routable_subnet(node_ip)
    }

    async fn query_routable_subnet_by_key(&self, key: &str) -> Result<Vec<String>, IpamError> {
        self.query_by_key_group_by_subnet(key).await
    }

    async fn pool_stats(&self) -> Result<Vec<PoolStats>, IpamError> {
        let allocated = self.count_allocated_by_subnet().await?;
        Ok(self.pools().await.stats(&allocated))
    }

    async fn shutdown(&self) {
        self.db.close().await;
    }

    fn name(&self) -> &str {
        &self.table
    }
}
