//! Controller configuration from environment variables.

use crate::error::ControllerError;
use floatingip::{DEFAULT_TABLE_NAME, IpType};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite://ipam.db?mode=rwc";
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_CONFIGMAP: &str = "floatingip-config";
const DEFAULT_CONFIGMAP_NAMESPACE: &str = "kube-system";
const DEFAULT_CONFIGMAP_KEY: &str = "floatingips";
const DEFAULT_RESYNC_SECS: u64 = 60;

/// Storage backend for allocation records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Db,
    Crd,
}

/// Where the pool JSON is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolSource {
    File(PathBuf),
    ConfigMap {
        namespace: String,
        name: String,
        key: String,
    },
}

impl std::fmt::Display for PoolSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolSource::File(path) => write!(f, "file {}", path.display()),
            PoolSource::ConfigMap { namespace, name, key } => {
                write!(f, "configmap {namespace}/{name} key {key}")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct IpamConfig {
    pub backend: Backend,
    pub database_url: String,
    pub table: String,
    pub max_connections: u32,
    pub ip_type: IpType,
    pub pool_source: PoolSource,
    pub resync_interval: Duration,
}

impl IpamConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, ControllerError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, treating empty values as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ControllerError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let backend = match var("IPAM_BACKEND").as_deref() {
            None | Some("crd") => Backend::Crd,
            Some("db") => Backend::Db,
            Some(other) => {
                return Err(ControllerError::InvalidConfig(format!(
                    "IPAM_BACKEND must be \"db\" or \"crd\", got {other:?}"
                )));
            }
        };

        let ip_type = match var("IPAM_IP_TYPE") {
            Some(v) => v
                .parse::<IpType>()
                .map_err(|e| ControllerError::InvalidConfig(format!("IPAM_IP_TYPE: {e}")))?,
            None => IpType::Internal,
        };

        let max_connections = parse_number(&var, "DATABASE_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            return Err(ControllerError::InvalidConfig(
                "DATABASE_MAX_CONNECTIONS must be at least 1".to_string(),
            ));
        }
        let resync_secs = parse_number(&var, "POOL_RESYNC_INTERVAL_SECS", DEFAULT_RESYNC_SECS)?;
        if resync_secs == 0 {
            return Err(ControllerError::InvalidConfig(
                "POOL_RESYNC_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        let pool_source = match var("FLOATING_IP_CONFIG") {
            Some(path) => PoolSource::File(PathBuf::from(path)),
            None => PoolSource::ConfigMap {
                namespace: var("FLOATING_IP_CONFIGMAP_NAMESPACE")
                    .unwrap_or_else(|| DEFAULT_CONFIGMAP_NAMESPACE.to_string()),
                name: var("FLOATING_IP_CONFIGMAP").unwrap_or_else(|| DEFAULT_CONFIGMAP.to_string()),
                key: var("FLOATING_IP_CONFIGMAP_KEY").unwrap_or_else(|| DEFAULT_CONFIGMAP_KEY.to_string()),
            },
        };

        Ok(Self {
            backend,
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            table: var("IPAM_TABLE").unwrap_or_else(|| DEFAULT_TABLE_NAME.to_string()),
            max_connections,
            ip_type,
            pool_source,
            resync_interval: Duration::from_secs(resync_secs),
        })
    }

    pub fn log(&self) {
        info!("Configuration:");
        match self.backend {
            Backend::Db => {
                info!("  Backend: db");
                info!("  Database URL: {}", self.database_url);
                info!("  Table: {}", self.table);
                info!("  Max connections: {}", self.max_connections);
            }
            Backend::Crd => {
                info!("  Backend: crd");
                info!("  IP type: {}", self.ip_type.as_str());
            }
        }
        info!("  Pool source: {}", self.pool_source);
        info!("  Resync interval: {}s", self.resync_interval.as_secs());
    }
}

fn parse_number<T, F>(var: &F, name: &str, default: T) -> Result<T, ControllerError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e| ControllerError::InvalidConfig(format!("{name}={v:?}: {e}"))),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<IpamConfig, ControllerError> {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        IpamConfig::from_lookup(|name| env.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.backend, Backend::Crd);
        assert_eq!(config.database_url, DEFAULT_DATABASE_URL);
        assert_eq!(config.table, "ip_pool");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.ip_type, IpType::Internal);
        assert_eq!(config.resync_interval, Duration::from_secs(60));
        assert_eq!(
            config.pool_source,
            PoolSource::ConfigMap {
                namespace: "kube-system".to_string(),
                name: "floatingip-config".to_string(),
                key: "floatingips".to_string(),
            }
        );
    }

    #[test]
    fn test_db_backend_with_file_source() {
        let config = load(&[
            ("IPAM_BACKEND", "db"),
            ("DATABASE_URL", "sqlite::memory:"),
            ("IPAM_TABLE", "second_pool"),
            ("DATABASE_MAX_CONNECTIONS", "4"),
            ("FLOATING_IP_CONFIG", "/etc/galaxy/floatingip.json"),
            ("POOL_RESYNC_INTERVAL_SECS", "15"),
        ])
        .unwrap();
        assert_eq!(config.backend, Backend::Db);
        assert_eq!(config.database_url, "sqlite::memory:");
        assert_eq!(config.table, "second_pool");
        assert_eq!(config.max_connections, 4);
        assert_eq!(
            config.pool_source,
            PoolSource::File(PathBuf::from("/etc/galaxy/floatingip.json"))
        );
        assert_eq!(config.resync_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_external_ip_type() {
        let config = load(&[("IPAM_IP_TYPE", "externalIP")]).unwrap();
        assert_eq!(config.ip_type, IpType::External);
    }

    #[test]
    fn test_empty_values_fall_back_to_defaults() {
        let config = load(&[("IPAM_BACKEND", ""), ("FLOATING_IP_CONFIG", "  ")]).unwrap();
        assert_eq!(config.backend, Backend::Crd);
        assert!(matches!(config.pool_source, PoolSource::ConfigMap { .. }));
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            load(&[("IPAM_BACKEND", "etcd")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("IPAM_IP_TYPE", "publicIP")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("DATABASE_MAX_CONNECTIONS", "many")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("DATABASE_MAX_CONNECTIONS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
        assert!(matches!(
            load(&[("POOL_RESYNC_INTERVAL_SECS", "0")]),
            Err(ControllerError::InvalidConfig(_))
        ));
    }
}
