//! Pool config reconciliation.
//!
//! Reads the floating IP pool JSON from a file or ConfigMap and pushes it
//! into the IPAM whenever it changes. A config that fails to parse or
//! validate is rejected and the previously applied pools stay in force.
//! Every refresh also updates the pool usage gauges.

use crate::backoff::FibonacciBackoff;
use crate::config::PoolSource;
use crate::error::ControllerError;
use crate::metrics::PoolMetrics;
use floatingip::{Ipam, parse_pools};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Api;
use std::sync::Arc;
use std::time::Duration;
use tracing::{Level, debug, enabled, error, info};

/// Minimum retry delay after a failed refresh
const MIN_RETRY_SECS: u64 = 5;

/// Keeps the IPAM's pool set in line with its config source.
pub struct Reconciler {
    ipam: Arc<dyn Ipam>,
    source: PoolSource,
    configmaps: Option<Api<ConfigMap>>,
    resync_interval: Duration,
    last_applied: Option<String>,
    metrics: PoolMetrics,
}

impl Reconciler {
    /// Creates a reconciler. `configmaps` is required for a ConfigMap source.
    pub fn new(
        ipam: Arc<dyn Ipam>,
        source: PoolSource,
        configmaps: Option<Api<ConfigMap>>,
        resync_interval: Duration,
        metrics: PoolMetrics,
    ) -> Result<Self, ControllerError> {
        if matches!(source, PoolSource::ConfigMap { .. }) && configmaps.is_none() {
            return Err(ControllerError::InvalidConfig(
                "a ConfigMap pool source needs a Kubernetes client".to_string(),
            ));
        }
        Ok(Self {
            ipam,
            source,
            configmaps,
            resync_interval,
            last_applied: None,
            metrics,
        })
    }

    /// Reads the raw pool JSON from the configured source.
    async fn load(&self) -> Result<String, ControllerError> {
        match &self.source {
            PoolSource::File(path) => Ok(tokio::fs::read_to_string(path).await?),
            PoolSource::ConfigMap { name, key, .. } => {
                let api = self.configmaps.as_ref().ok_or_else(|| {
                    ControllerError::InvalidConfig("no ConfigMap client".to_string())
                })?;
                let cm = api.get(name).await?;
                cm.data
                    .and_then(|mut data| data.remove(key))
                    .ok_or_else(|| {
                        ControllerError::InvalidConfig(format!("ConfigMap {name} has no key {key}"))
                    })
            }
        }
    }

    /// Applies `raw` unless it is identical to the last applied config.
    /// Returns whether the pools were reconfigured.
    pub async fn apply(&mut self, raw: String) -> Result<bool, ControllerError> {
        if self.last_applied.as_deref() == Some(raw.as_str()) {
            debug!("Pool config unchanged, skipping");
            return Ok(false);
        }
        let pools = parse_pools(&raw)?;
        let count = pools.len();
        self.ipam.configure_pool(pools).await?;
        self.last_applied = Some(raw);
        info!("Applied pool config from {} ({} pools)", self.source, count);
        self.refresh_stats(true).await;
        Ok(true)
    }

    /// One refresh: load the source and apply it.
    pub async fn reconcile(&mut self) -> Result<bool, ControllerError> {
        let raw = self.load().await?;
        let changed = self.apply(raw).await?;
        if !changed {
            self.refresh_stats(false).await;
        }
        Ok(changed)
    }

    /// Updates the gauges from the current pool usage, logging each pool if `log`.
    async fn refresh_stats(&self, log: bool) {
        let stats = match self.ipam.pool_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Failed to collect pool stats: {}", e);
                return;
            }
        };
        self.metrics.observe(&stats);
        if log {
            for s in &stats {
                info!(
                    "  pool {} subnet {} first {} allocated {}/{}",
                    s.routable_subnet,
                    s.subnet,
                    s.first_ip.map_or_else(|| "-".to_string(), |ip| ip.to_string()),
                    s.allocated,
                    s.total
                );
            }
        }
        if enabled!(Level::DEBUG) {
            match self.metrics.encode() {
                Ok(text) => debug!("Pool metrics:\n{}", text),
                Err(e) => debug!("Failed to encode pool metrics: {}", e),
            }
        }
    }

    /// Refreshes forever, retrying failures with Fibonacci backoff.
    pub async fn run(mut self) -> Result<(), ControllerError> {
        info!(
            "Starting pool refresh every {}s from {}",
            self.resync_interval.as_secs(),
            self.source
        );
        let mut backoff = FibonacciBackoff::new(MIN_RETRY_SECS, self.resync_interval.as_secs());
        loop {
            let delay = match self.reconcile().await {
                Ok(_) => {
                    backoff.reset();
                    self.resync_interval
                }
                Err(e) => {
                    let delay = backoff.next_backoff();
                    error!("Pool refresh failed, retrying in {}s: {}", delay.as_secs(), e);
                    delay
                }
            };
            tokio::time::sleep(delay).await;
        }
    }
}
