//! Pool usage gauges.
//!
//! One gauge family, labelled by `type` (`allocated` or `total`), pool
//! `subnet` and the pool's `first_ip`. Several pools may share a subnet, the
//! first IP tells them apart.

use crate::error::ControllerError;
use floatingip::PoolStats;
use prometheus::{Encoder, IntGaugeVec, Opts, Registry, TextEncoder};

/// Name of the gauge family.
pub const IP_COUNTER: &str = "floatingip_ip_counter";

/// Gauges fed from [`floatingip::Ipam::pool_stats`].
#[derive(Clone)]
pub struct PoolMetrics {
    registry: Registry,
    ip_counter: IntGaugeVec,
}

impl PoolMetrics {
    /// Creates the gauges in a fresh registry.
    pub fn new() -> Result<Self, ControllerError> {
        let registry = Registry::new();
        let ip_counter = IntGaugeVec::new(
            Opts::new(IP_COUNTER, "Floating ip counter"),
            &["type", "subnet", "first_ip"],
        )?;
        registry.register(Box::new(ip_counter.clone()))?;
        Ok(Self { registry, ip_counter })
    }

    /// Replaces all series with `stats`. Pools no longer configured disappear.
    pub fn observe(&self, stats: &[PoolStats]) {
        self.ip_counter.reset();
        for pool in stats {
            let subnet = pool.subnet.to_string();
            let first_ip = pool.first_ip.map(|ip| ip.to_string()).unwrap_or_default();
            for (kind, value) in [("allocated", pool.allocated), ("total", pool.total)] {
                self.ip_counter
                    .with_label_values(&[kind, subnet.as_str(), first_ip.as_str()])
                    .set(i64::try_from(value).unwrap_or(i64::MAX));
            }
        }
    }

    /// Text exposition format of every registered metric.
    pub fn encode(&self) -> Result<String, ControllerError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        String::from_utf8(buf).map_err(|e| ControllerError::InvalidConfig(format!("metrics are not utf-8: {e}")))
    }
}
