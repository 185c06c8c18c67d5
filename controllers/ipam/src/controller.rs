//! Main controller implementation.
//!
//! This module contains the `Controller` struct that builds the IPAM backend,
//! applies the initial pool config, and runs the background tasks:
//! - Pool refresh: re-reads the pool config every resync interval
//! - Reserved FloatingIP watcher (CRD backend only)

use crate::config::{Backend, IpamConfig, PoolSource};
use crate::error::ControllerError;
use crate::metrics::PoolMetrics;
use crate::reconciler::Reconciler;
use crate::watcher::Watcher;
use crds::FloatingIP;
use floatingip::{CrdIpam, DbIpam, Ipam, KubeFloatingIpClient};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Main controller for floating IP pools.
pub struct Controller {
    ipam: Arc<dyn Ipam>,
    pool_refresher: JoinHandle<Result<(), ControllerError>>,
    reserved_watcher: Option<JoinHandle<Result<(), ControllerError>>>,
}

impl Controller {
    /// Creates a new controller instance.
    pub async fn new(config: IpamConfig) -> Result<Self, ControllerError> {
        info!("Initializing IPAM Controller");

        let needs_kube = config.backend == Backend::Crd
            || matches!(config.pool_source, PoolSource::ConfigMap { .. });
        let kube_client = if needs_kube {
            Some(Client::try_default().await?)
        } else {
            None
        };

        let (ipam, crd_ipam): (Arc<dyn Ipam>, Option<Arc<CrdIpam>>) = match config.backend {
            Backend::Db => {
                let db = DbIpam::connect(&config.database_url, &config.table, config.max_connections).await?;
                info!("Using database table {}", config.table);
                (Arc::new(db) as Arc<dyn Ipam>, None)
            }
            Backend::Crd => {
                let client = kube_client.clone().ok_or_else(|| {
                    ControllerError::InvalidConfig("CRD backend needs a Kubernetes client".to_string())
                })?;
                let crd = Arc::new(CrdIpam::new(KubeFloatingIpClient::new(client), config.ip_type));
                info!("Using FloatingIP objects labelled {}", config.ip_type.as_str());
                (crd.clone() as Arc<dyn Ipam>, Some(crd))
            }
        };

        let configmaps = match (&config.pool_source, &kube_client) {
            (PoolSource::ConfigMap { namespace, .. }, Some(client)) => {
                Some(Api::<ConfigMap>::namespaced(client.clone(), namespace))
            }
            _ => None,
        };
        let mut reconciler = Reconciler::new(
            ipam.clone(),
            config.pool_source.clone(),
            configmaps,
            config.resync_interval,
            PoolMetrics::new()?,
        )?;

        // Pools must be known before reserved objects can be matched to them
        info!("Applying initial pool config...");
        if let Err(e) = reconciler.reconcile().await {
            warn!("Initial pool config failed (will retry): {}", e);
        }

        let pool_refresher = tokio::spawn(reconciler.run());

        let reserved_watcher = match (crd_ipam, kube_client) {
            (Some(crd), Some(client)) => {
                let api: Api<FloatingIP> = Api::all(client);
                let watcher = Watcher::new(crd, api, config.ip_type.as_str());
                Some(tokio::spawn(async move { watcher.watch_reserved().await }))
            }
            _ => None,
        };

        info!("IPAM Controller initialized");

        Ok(Self {
            ipam,
            pool_refresher,
            reserved_watcher,
        })
    }

    /// Runs until a background task exits or the process is interrupted.
    pub async fn run(self) -> Result<(), ControllerError> {
        let Self {
            ipam,
            mut pool_refresher,
            mut reserved_watcher,
        } = self;
        info!("IPAM Controller running ({})", ipam.name());

        let reserved = async {
            match reserved_watcher.as_mut() {
                Some(handle) => handle.await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            result = &mut pool_refresher => {
                error!("Pool refresher exited: {:?}", result);
                flatten(result)
            }
            result = reserved => {
                error!("Reserved FloatingIP watcher exited: {:?}", result);
                flatten(result)
            }
            signal = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                signal.map_err(ControllerError::Io)
            }
        };

        pool_refresher.abort();
        if let Some(handle) = &reserved_watcher {
            handle.abort();
        }
        ipam.shutdown().await;
        info!("IPAM Controller stopped");
        result
    }
}

fn flatten(
    result: Result<Result<(), ControllerError>, tokio::task::JoinError>,
) -> Result<(), ControllerError> {
    result.map_err(|e| ControllerError::Watch(format!("task failed: {e}")))?
}
