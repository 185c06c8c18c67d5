//! Watcher for manually reserved FloatingIP objects.
//!
//! Operators take an IP out of circulation by creating a FloatingIP named
//! after it with the `reserved` label. The CRD backend only learns about
//! such objects through this watch.

use crate::error::ControllerError;
use crds::{FloatingIP, IP_TYPE_LABEL, RESERVED_LABEL};
use floatingip::CrdIpam;
use futures::TryStreamExt;
use kube::{Api, ResourceExt};
use kube_runtime::{WatchStreamExt, watcher};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Label selector for reserved objects of one ip type.
pub fn reserved_selector(ip_type: &str) -> String {
    format!("{IP_TYPE_LABEL}={ip_type},{RESERVED_LABEL}")
}

/// Feeds reserved FloatingIP events into the CRD backend.
pub struct Watcher {
    ipam: Arc<CrdIpam>,
    api: Api<FloatingIP>,
    selector: String,
}

impl Watcher {
    pub fn new(ipam: Arc<CrdIpam>, api: Api<FloatingIP>, ip_type: &str) -> Self {
        Self {
            ipam,
            api,
            selector: reserved_selector(ip_type),
        }
    }

    async fn apply(&self, fip: &FloatingIP) {
        match self.ipam.handle_reserved_apply(fip).await {
            Ok(true) => info!("FloatingIP {} reserved for {}", fip.name_any(), fip.spec.key),
            Ok(false) => debug!("FloatingIP {} already accounted for", fip.name_any()),
            Err(e) => warn!("Failed to reserve FloatingIP {}: {}", fip.name_any(), e),
        }
    }

    async fn delete(&self, fip: &FloatingIP) {
        match self.ipam.handle_reserved_delete(fip).await {
            Ok(true) => info!("FloatingIP {} released from reservation", fip.name_any()),
            Ok(false) => debug!("FloatingIP {} was not held by its reservation", fip.name_any()),
            Err(e) => warn!("Failed to release reserved FloatingIP {}: {}", fip.name_any(), e),
        }
    }

    /// Starts watching reserved FloatingIP resources.
    pub async fn watch_reserved(&self) -> Result<(), ControllerError> {
        info!("Starting reserved FloatingIP watcher ({})", self.selector);

        let config = watcher::Config::default().labels(&self.selector);
        let mut stream = Box::pin(watcher(self.api.clone(), config).default_backoff());

        while let Some(event) = stream
            .try_next()
            .await
            .map_err(|e| ControllerError::Watch(format!("Watcher stream error: {}", e)))?
        {
            match event {
                watcher::Event::Apply(fip) => self.apply(&fip).await,
                watcher::Event::Delete(fip) => self.delete(&fip).await,
                watcher::Event::Init => {
                    debug!("Reserved FloatingIP watcher initialized");
                }
                watcher::Event::InitApply(fip) => self.apply(&fip).await,
                watcher::Event::InitDone => {
                    info!("Reserved FloatingIP watcher initialization complete");
                }
            }
        }

        Ok(())
    }
}
