//! Mock FloatingIP client for unit testing
//!
//! Stores objects in memory so the CRD backend can be tested without an API server.

use crate::crd::FloatingIpClient;
use crate::error::IpamError;
use async_trait::async_trait;
use crds::FloatingIP;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// In-memory [`FloatingIpClient`].
///
/// Clones share storage, so a test can keep a handle after giving one to the IPAM.
#[derive(Clone, Default)]
pub struct MockFloatingIpClient {
    objects: Arc<Mutex<BTreeMap<String, FloatingIP>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MockFloatingIpClient {
    /// Create an empty mock client
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, FloatingIP>> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an object to the mock store (for test setup). Objects without a
    /// resourceVersion get one, as the API server would assign.
    pub fn insert(&self, mut fip: FloatingIP) {
        if fip.metadata.resource_version.is_none() {
            bump_version(&mut fip, None);
        }
        self.objects().insert(fip.name_any(), fip);
    }

    /// Get a stored object by name
    pub fn get_object(&self, name: &str) -> Option<FloatingIP> {
        self.objects().get(name).cloned()
    }

    /// Remove an object behind the client's back
    pub fn remove(&self, name: &str) -> Option<FloatingIP> {
        self.objects().remove(name)
    }

    /// Names of all stored objects, sorted
    pub fn names(&self) -> Vec<String> {
        self.objects().keys().cloned().collect()
    }

    /// Make create, replace and delete fail until reset
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), IpamError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            Err(IpamError::Store("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }
}

fn matches_selector(fip: &FloatingIP, label_selector: &str) -> bool {
    let labels = fip.labels();
    label_selector
        .split(',')
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((k, v)) => labels.get(k).is_some_and(|value| value == v),
            None => labels.contains_key(term),
        })
}

fn bump_version(fip: &mut FloatingIP, current: Option<&str>) {
    let next = current
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(1, |v| v + 1);
    fip.metadata.resource_version = Some(next.to_string());
}

#[async_trait]
impl FloatingIpClient for MockFloatingIpClient {
    async fn list(&self, label_selector: &str) -> Result<Vec<FloatingIP>, IpamError> {
        Ok(self
            .objects()
            .values()
            .filter(|fip| matches_selector(fip, label_selector))
            .cloned()
            .collect())
    }

    async fn create(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError> {
        tokio::task::yield_now().await;
        self.check_writable()?;
        let name = fip.name_any();
        let mut objects = self.objects();
        if objects.contains_key(&name) {
            return Err(IpamError::Store(format!("floatingips {name:?} already exists")));
        }
        let mut created = fip.clone();
        bump_version(&mut created, None);
        objects.insert(name, created.clone());
        Ok(created)
    }

    async fn replace(&self, fip: &FloatingIP) -> Result<FloatingIP, IpamError> {
        tokio::task::yield_now().await;
        self.check_writable()?;
        let name = fip.name_any();
        let mut objects = self.objects();
        let Some(current) = objects.get(&name) else {
            return Err(IpamError::Store(format!("floatingips {name:?} not found")));
        };
        let current_version = current.metadata.resource_version.clone();
        if fip.metadata.resource_version.is_none() {
            return Err(IpamError::Store(format!(
                "floatingips {name:?}: resourceVersion must be specified for an update"
            )));
        }
        if fip.metadata.resource_version != current_version {
            return Err(IpamError::Store(format!(
                "operation cannot be fulfilled on floatingips {name:?}: the object has been modified"
            )));
        }
        let mut replaced = fip.clone();
        bump_version(&mut replaced, current_version.as_deref());
        objects.insert(name, replaced.clone());
        Ok(replaced)
    }

    async fn delete(&self, name: &str) -> Result<(), IpamError> {
        tokio::task::yield_now().await;
        self.check_writable()?;
        self.objects()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| IpamError::Store(format!("floatingips {name:?} not found")))
    }
}
