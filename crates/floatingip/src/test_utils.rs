//! Shared fixtures for unit tests.

use crate::pool::{FloatingIpPool, parse_pools};

/// Four pools, fourteen addresses.
pub const TEST_CONFIG: &str = r#"[
  {"routableSubnet":"10.49.27.0/24","ips":["10.49.27.205","10.49.27.216~10.49.27.218"],"subnet":"10.49.27.0/24","gateway":"10.49.27.1","vlan":2},
  {"routableSubnet":"10.173.13.0/24","ips":["10.173.13.2","10.173.13.10~10.173.13.13","10.173.13.15"],"subnet":"10.173.13.0/24","gateway":"10.173.13.1","vlan":2},
  {"routableSubnet":"10.180.1.2/32","ips":["10.180.154.2~10.180.154.3"],"subnet":"10.180.154.0/24","gateway":"10.180.154.1","vlan":3},
  {"routableSubnet":"10.180.1.3/32","ips":["10.180.154.7~10.180.154.8"],"subnet":"10.180.154.0/24","gateway":"10.180.154.1","vlan":3}
]"#;

/// Total addresses in [`TEST_CONFIG`].
pub const TEST_POOL_SIZE: usize = 14;

/// Parsed [`TEST_CONFIG`].
pub fn test_pools() -> Vec<FloatingIpPool> {
    parse_pools(TEST_CONFIG).unwrap()
}
