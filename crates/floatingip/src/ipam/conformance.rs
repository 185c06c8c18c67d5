//! Behaviour every [`Ipam`] backend must share.
//!
//! Each check expects an IPAM freshly configured with
//! [`test_pools`](crate::test_utils::test_pools).

use super::{FloatingIpInfo, Ipam, ReleasePolicy};
use crate::error::IpamError;
use crate::nets::IpRange;
use crate::test_utils::{TEST_POOL_SIZE, test_pools};
use ipnet::Ipv4Net;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Barrier;

fn ip(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

fn net(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

async fn alloc(ipam: &dyn Ipam, key: &str, subnet: &str) -> Result<Ipv4Addr, IpamError> {
    ipam.allocate_in_subnet(key, &net(subnet), ReleasePolicy::PodDelete, "").await
}

fn range_sets(sets: &[&[&str]]) -> Vec<Vec<IpRange>> {
    sets.iter()
        .map(|set| set.iter().map(|range| range.parse().unwrap()).collect())
        .collect()
}

async fn keys_of(ipam: &dyn Ipam, prefix: &str) -> Vec<(Ipv4Addr, String)> {
    ipam.by_prefix(prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|fip| (fip.ip, fip.key))
        .collect()
}

pub(crate) async fn allocates_in_order_and_reuses_released(ipam: &dyn Ipam) {
    let subnet = "10.49.27.0/24";
    for (key, expected) in [("pod1", "10.49.27.205"), ("pod2", "10.49.27.216"), ("pod3", "10.49.27.217")] {
        assert_eq!(alloc(ipam, key, subnet).await.unwrap(), ip(expected), "{key}");
    }
    ipam.release("pod2", ip("10.49.27.216")).await.unwrap();
    assert_eq!(alloc(ipam, "pod4", subnet).await.unwrap(), ip("10.49.27.216"));
    assert_eq!(alloc(ipam, "pod5", subnet).await.unwrap(), ip("10.49.27.218"));
    assert!(matches!(alloc(ipam, "pod6", subnet).await, Err(IpamError::NoEnoughIp)));
}

pub(crate) async fn allocate_in_subnet(ipam: &dyn Ipam) {
    assert_eq!(alloc(ipam, "pod1", "10.173.13.0/24").await.unwrap(), ip("10.173.13.2"));
    assert_eq!(alloc(ipam, "pod2", "10.180.1.3/32").await.unwrap(), ip("10.180.154.7"));
    // host bits of the requested subnet are ignored
    assert_eq!(alloc(ipam, "pod3", "10.173.13.9/24").await.unwrap(), ip("10.173.13.10"));
    assert!(matches!(
        alloc(ipam, "pod4", "10.173.14.0/24").await,
        Err(IpamError::NoFipForSubnet(_))
    ));
    assert!(matches!(
        alloc(ipam, "", "10.173.13.0/24").await,
        Err(IpamError::InvalidConfig(_))
    ));

    let fip = ipam.by_ip(ip("10.173.13.2")).await.unwrap().unwrap();
    assert_eq!(fip.key, "pod1");
    assert_eq!(fip.subnet, "10.173.13.0/24");
    assert_eq!(fip.policy, ReleasePolicy::PodDelete);
}

pub(crate) async fn exhaustion(ipam: &dyn Ipam) {
    let a = alloc(ipam, "pod1", "10.180.1.2/32").await.unwrap();
    let b = alloc(ipam, "pod2", "10.180.1.2/32").await.unwrap();
    assert_ne!(a, b);
    assert!(matches!(
        alloc(ipam, "pod3", "10.180.1.2/32").await,
        Err(IpamError::NoEnoughIp)
    ));
    assert_eq!(alloc(ipam, "pod3", "10.180.1.3/32").await.unwrap(), ip("10.180.154.7"));
}

pub(crate) async fn allocate_specific_ip(ipam: &dyn Ipam) {
    let target = ip("10.173.13.11");
    let attr = r#"{"NodeName":"node1","Uid":"u1"}"#;
    ipam.allocate_specific_ip("pod1", target, ReleasePolicy::Immutable, attr)
        .await
        .unwrap();
    // same owner again is a no-op
    ipam.allocate_specific_ip("pod1", target, ReleasePolicy::Immutable, "")
        .await
        .unwrap();
    assert!(matches!(
        ipam.allocate_specific_ip("pod2", target, ReleasePolicy::PodDelete, "").await,
        Err(IpamError::NoEnoughIp)
    ));
    assert!(matches!(
        ipam.allocate_specific_ip("pod2", ip("10.173.13.3"), ReleasePolicy::PodDelete, "").await,
        Err(IpamError::UnknownIp(_))
    ));

    let fip = ipam.by_ip(target).await.unwrap().unwrap();
    assert_eq!(fip.key, "pod1");
    assert_eq!(fip.policy, ReleasePolicy::Immutable);
    assert_eq!(fip.decoded_attr().unwrap().node_name, "node1");

    // subnet allocation skips the taken address
    let mut got = Vec::new();
    for key in ["pod3", "pod4", "pod5"] {
        got.push(alloc(ipam, key, "10.173.13.0/24").await.unwrap());
    }
    assert_eq!(got, vec![ip("10.173.13.2"), ip("10.173.13.10"), ip("10.173.13.12")]);
}

pub(crate) async fn allocate_in_subnet_with_key(ipam: &dyn Ipam) {
    let subnet = "10.173.13.0/24";
    assert_eq!(alloc(ipam, "pod2", subnet).await.unwrap(), ip("10.173.13.2"));
    ipam.allocate_in_subnet_with_key("pod2", "pod3", subnet, ReleasePolicy::Immutable, "")
        .await
        .unwrap();
    assert!(ipam.first("pod2").await.unwrap().is_none());
    let info = ipam.first("pod3").await.unwrap().unwrap();
    assert_eq!(info.ip_info.ip.to_string(), "10.173.13.2/24");
    assert_eq!(info.fip.policy, ReleasePolicy::Immutable);

    assert!(ipam
        .allocate_in_subnet_with_key("pod2", "pod4", subnet, ReleasePolicy::PodDelete, "")
        .await
        .is_err());
    assert!(ipam
        .allocate_in_subnet_with_key("pod3", "pod4", "10.49.27.0/24", ReleasePolicy::PodDelete, "")
        .await
        .is_err());

    // the most recently updated record of the old key is picked
    assert_eq!(alloc(ipam, "pool", subnet).await.unwrap(), ip("10.173.13.10"));
    assert_eq!(alloc(ipam, "pool", subnet).await.unwrap(), ip("10.173.13.11"));
    ipam.allocate_in_subnet_with_key("pool", "pod5", subnet, ReleasePolicy::Never, "")
        .await
        .unwrap();
    assert_eq!(ipam.first("pod5").await.unwrap().unwrap().fip.ip, ip("10.173.13.11"));
    assert_eq!(ipam.first("pool").await.unwrap().unwrap().fip.ip, ip("10.173.13.10"));
}

pub(crate) async fn reserve_ip(ipam: &dyn Ipam) {
    let allocated = ipam
        .allocate_in_subnet("pod1", &net("10.49.27.0/24"), ReleasePolicy::Never, "")
        .await
        .unwrap();
    ipam.reserve_ip("pod1", "pod1-next", r#"{"NodeName":"node2","Uid":""}"#)
        .await
        .unwrap();

    let fip = ipam.by_ip(allocated).await.unwrap().unwrap();
    assert_eq!(fip.key, "pod1-next");
    assert_eq!(fip.policy, ReleasePolicy::Never);
    assert_eq!(fip.subnet, "10.49.27.0/24");
    assert_eq!(fip.decoded_attr().unwrap().node_name, "node2");

    assert!(ipam.first("pod1").await.unwrap().is_none());
    assert!(ipam.reserve_ip("pod1", "pod2", "").await.is_err());
}

pub(crate) async fn update_policy(ipam: &dyn Ipam) {
    let allocated = alloc(ipam, "pod1", "10.180.1.2/32").await.unwrap();
    ipam.update_policy("pod1", allocated, ReleasePolicy::Never, "attr")
        .await
        .unwrap();
    let fip = ipam.by_ip(allocated).await.unwrap().unwrap();
    assert_eq!(fip.policy, ReleasePolicy::Never);
    assert_eq!(fip.attr, "attr");
    assert_eq!(fip.key, "pod1");

    assert!(matches!(
        ipam.update_policy("pod2", allocated, ReleasePolicy::PodDelete, "").await,
        Err(IpamError::KeyMismatch { .. })
    ));
}

pub(crate) async fn release_ips(ipam: &dyn Ipam) {
    let a = alloc(ipam, "a", "10.49.27.0/24").await.unwrap();
    let b = alloc(ipam, "b", "10.49.27.0/24").await.unwrap();
    let input = HashMap::from([
        (a, "a".to_string()),
        (b, "wrong".to_string()),
        (ip("10.173.13.2"), "c".to_string()),
        (ip("1.2.3.4"), "d".to_string()),
    ]);
    let (released, unreleased) = ipam.release_ips(input).await.unwrap();
    assert_eq!(released, HashMap::from([(a, "a".to_string())]));
    assert_eq!(
        unreleased,
        HashMap::from([
            (b, "b".to_string()),
            (ip("10.173.13.2"), String::new()),
            (ip("1.2.3.4"), String::new()),
        ])
    );
    assert!(!ipam.by_ip(a).await.unwrap().unwrap().is_allocated());
    assert_eq!(ipam.by_ip(b).await.unwrap().unwrap().key, "b");
}

async fn allocate_namespaced(ipam: &dyn Ipam) {
    assert_eq!(alloc(ipam, "pod_ns1_a_", "10.173.13.0/24").await.unwrap(), ip("10.173.13.2"));
    assert_eq!(alloc(ipam, "pod_ns1_b_", "10.173.13.0/24").await.unwrap(), ip("10.173.13.10"));
    assert_eq!(alloc(ipam, "pod_ns2_c_", "10.49.27.0/24").await.unwrap(), ip("10.49.27.205"));
}

pub(crate) async fn query_by_prefix_and_keyword(ipam: &dyn Ipam) {
    allocate_namespaced(ipam).await;

    assert_eq!(
        keys_of(ipam, "pod_ns1_").await,
        vec![
            (ip("10.173.13.2"), "pod_ns1_a_".to_string()),
            (ip("10.173.13.10"), "pod_ns1_b_".to_string()),
        ]
    );
    let ns2 = ipam.by_keyword("ns2").await.unwrap();
    assert_eq!(ns2.len(), 1);
    assert_eq!(ns2[0].ip, ip("10.49.27.205"));
    assert_eq!(ipam.by_keyword("_b_").await.unwrap().len(), 1);
    assert!(ipam.by_prefix("nobody").await.unwrap().is_empty());

    let all = ipam.by_prefix("").await.unwrap();
    assert_eq!(all.len(), TEST_POOL_SIZE);
    assert!(all.windows(2).all(|pair| pair[0].ip < pair[1].ip));
    assert_eq!(all.iter().filter(|fip| fip.is_allocated()).count(), 3);
    assert_eq!(ipam.by_keyword("").await.unwrap().len(), TEST_POOL_SIZE);
}

pub(crate) async fn release_by_prefix(ipam: &dyn Ipam) {
    allocate_namespaced(ipam).await;
    ipam.release_by_prefix("pod_ns1_").await.unwrap();
    assert!(ipam.by_prefix("pod_ns1_").await.unwrap().is_empty());
    assert_eq!(ipam.by_prefix("pod_ns2_").await.unwrap().len(), 1);
    assert_eq!(alloc(ipam, "pod_ns3_d_", "10.173.13.0/24").await.unwrap(), ip("10.173.13.2"));
}

pub(crate) async fn query_routable_subnet_by_key(ipam: &dyn Ipam) {
    assert_eq!(
        ipam.query_routable_subnet_by_key("").await.unwrap(),
        vec!["10.173.13.0/24", "10.180.1.2/32", "10.180.1.3/32", "10.49.27.0/24"]
    );
    alloc(ipam, "k", "10.180.1.2/32").await.unwrap();
    alloc(ipam, "k", "10.180.1.2/32").await.unwrap();
    assert_eq!(
        ipam.query_routable_subnet_by_key("").await.unwrap(),
        vec!["10.173.13.0/24", "10.180.1.3/32", "10.49.27.0/24"]
    );
    assert_eq!(ipam.query_routable_subnet_by_key("k").await.unwrap(), vec!["10.180.1.2/32"]);
    assert!(ipam.query_routable_subnet_by_key("nobody").await.unwrap().is_empty());
}

pub(crate) async fn routable_subnet(ipam: &dyn Ipam) {
    for (node, expected) in [
        ("10.173.13.3", Some("10.173.13.0/24")),
        ("10.173.13.254", Some("10.173.13.0/24")),
        ("10.173.14.1", None),
        ("10.49.26.254", None),
        ("10.49.27.1", Some("10.49.27.0/24")),
        ("10.180.1.2", Some("10.180.1.2/32")),
    ] {
        assert_eq!(
            ipam.routable_subnet(ip(node)).await.map(|n| n.to_string()).as_deref(),
            expected,
            "{node}"
        );
    }
}

pub(crate) async fn first(ipam: &dyn Ipam) {
    assert!(ipam.first("pod1").await.unwrap().is_none());
    ipam.allocate_specific_ip("pod1", ip("10.180.154.8"), ReleasePolicy::PodDelete, "")
        .await
        .unwrap();
    let info = ipam.first("pod1").await.unwrap().unwrap();
    assert_eq!(info.ip_info.ip.to_string(), "10.180.154.8/24");
    assert_eq!(info.ip_info.vlan, 3);
    assert_eq!(info.ip_info.gateway, ip("10.180.154.1"));
    assert_eq!(info.ip_info.routable_subnet.to_string(), "10.180.1.3/32");
    assert_eq!(info.fip.key, "pod1");
}

pub(crate) async fn pool_stats(ipam: &dyn Ipam) {
    alloc(ipam, "pod1", "10.49.27.0/24").await.unwrap();
    alloc(ipam, "pod2", "10.49.27.0/24").await.unwrap();
    let stats = ipam.pool_stats().await.unwrap();
    assert_eq!(stats.len(), 4);
    assert_eq!(stats.iter().map(|s| s.total).sum::<u64>(), TEST_POOL_SIZE as u64);
    let pool = stats
        .iter()
        .find(|s| s.routable_subnet == net("10.49.27.0/24"))
        .unwrap();
    assert_eq!(pool.total, 4);
    assert_eq!(pool.allocated, 2);
    assert_eq!(pool.first_ip, Some(ip("10.49.27.205")));
    assert_eq!(pool.subnet, net("10.49.27.0/24"));
    assert_eq!(stats.iter().map(|s| s.allocated).sum::<u64>(), 2);
}

pub(crate) async fn configure_pool_is_idempotent_and_shrinks(ipam: &dyn Ipam) {
    let target = ip("10.173.13.10");
    ipam.allocate_specific_ip("pod1", target, ReleasePolicy::Never, "")
        .await
        .unwrap();

    ipam.configure_pool(test_pools()).await.unwrap();
    assert_eq!(ipam.by_ip(target).await.unwrap().unwrap().key, "pod1");
    assert_eq!(ipam.by_prefix("").await.unwrap().len(), TEST_POOL_SIZE);

    // shrink 10.173.13.0/24 to its first address
    let mut pools = test_pools();
    pools[1].sparse.ip_ranges.truncate(1);
    ipam.configure_pool(pools).await.unwrap();
    assert!(ipam.by_ip(target).await.unwrap().is_none());
    assert!(ipam.first("pod1").await.unwrap().is_none());
    assert_eq!(ipam.by_prefix("").await.unwrap().len(), TEST_POOL_SIZE - 5);

    ipam.configure_pool(Vec::new()).await.unwrap();
    assert!(ipam.by_prefix("").await.unwrap().is_empty());
    assert!(ipam.routable_subnet(ip("10.173.13.3")).await.is_none());

    ipam.configure_pool(test_pools()).await.unwrap();
    let fip = ipam.by_ip(target).await.unwrap().unwrap();
    assert!(!fip.is_allocated());
    assert_eq!(ipam.by_prefix("").await.unwrap().len(), TEST_POOL_SIZE);
}

pub(crate) async fn allocate_in_subnets_and_ip_range(ipam: &dyn Ipam) {
    let subnet = net("10.173.13.0/24");
    let allocate = |key: &'static str, sets: Vec<Vec<IpRange>>| async move {
        ipam.allocate_in_subnets_and_ip_range(key, &subnet, &sets, ReleasePolicy::Immutable, "a")
            .await
    };

    let got = allocate("pod1", range_sets(&[&["10.173.13.10~10.173.13.11"], &["10.173.13.12~10.173.13.15"]]))
        .await
        .unwrap();
    assert_eq!(got, vec![ip("10.173.13.10"), ip("10.173.13.12")]);
    let fip = ipam.by_ip(ip("10.173.13.12")).await.unwrap().unwrap();
    assert_eq!(fip.key, "pod1");
    assert_eq!(fip.policy, ReleasePolicy::Immutable);

    // .11 fits the first set but nothing is left for the second, so nothing is kept
    assert!(matches!(
        allocate("pod2", range_sets(&[&["10.173.13.10~10.173.13.11"], &["10.173.13.10~10.173.13.11"]])).await,
        Err(IpamError::NoEnoughIp)
    ));
    assert!(!ipam.by_ip(ip("10.173.13.11")).await.unwrap().unwrap().is_allocated());

    // an empty set matches anything, an empty list claims one ip
    let got = allocate("pod3", range_sets(&[&["10.173.13.2", "10.173.13.15"], &[]])).await.unwrap();
    assert_eq!(got, vec![ip("10.173.13.2"), ip("10.173.13.11")]);
    assert_eq!(allocate("pod4", Vec::new()).await.unwrap(), vec![ip("10.173.13.13")]);

    assert!(matches!(
        allocate("pod5", range_sets(&[&["10.49.27.205"]])).await,
        Err(IpamError::NoEnoughIp)
    ));
    assert!(matches!(
        ipam.allocate_in_subnets_and_ip_range("pod5", &net("10.173.14.0/24"), &[], ReleasePolicy::PodDelete, "")
            .await,
        Err(IpamError::NoFipForSubnet(_))
    ));
    assert!(matches!(allocate("", Vec::new()).await, Err(IpamError::InvalidConfig(_))));
}

pub(crate) async fn by_key_and_ip_ranges(ipam: &dyn Ipam) {
    ipam.allocate_in_subnets_and_ip_range(
        "pod1",
        &net("10.173.13.0/24"),
        &range_sets(&[&["10.173.13.10"], &["10.173.13.12"]]),
        ReleasePolicy::PodDelete,
        "",
    )
    .await
    .unwrap();
    let ips_of = |infos: Vec<Option<FloatingIpInfo>>| -> Vec<Option<Ipv4Addr>> {
        infos.into_iter().map(|info| info.map(|info| info.fip.ip)).collect()
    };

    let all = ipam.by_key_and_ip_ranges("pod1", &[]).await.unwrap();
    assert_eq!(ips_of(all.clone()), vec![Some(ip("10.173.13.10")), Some(ip("10.173.13.12"))]);
    let info = all[0].as_ref().unwrap();
    assert_eq!(info.ip_info.ip.to_string(), "10.173.13.10/24");
    assert_eq!(info.ip_info.gateway, ip("10.173.13.1"));
    assert_eq!(info.ip_info.routable_subnet, net("10.173.13.0/24"));

    let found = ipam
        .by_key_and_ip_ranges(
            "pod1",
            &range_sets(&[&["10.173.13.11~10.173.13.15"], &["10.173.13.10"], &["10.173.13.2"]]),
        )
        .await
        .unwrap();
    assert_eq!(ips_of(found), vec![Some(ip("10.173.13.12")), Some(ip("10.173.13.10")), None]);

    // one ip serves one set only
    let found = ipam
        .by_key_and_ip_ranges("pod1", &range_sets(&[&["10.173.13.12"], &["10.173.13.12"]]))
        .await
        .unwrap();
    assert_eq!(ips_of(found), vec![Some(ip("10.173.13.12")), None]);

    assert!(ipam.by_key_and_ip_ranges("pod2", &[]).await.unwrap().is_empty());
    assert_eq!(
        ips_of(ipam.by_key_and_ip_ranges("", &range_sets(&[&[]])).await.unwrap()),
        vec![None]
    );
}

pub(crate) async fn node_subnets_by_key_and_ip_ranges(ipam: &dyn Ipam) {
    alloc(ipam, "pod1", "10.173.13.0/24").await.unwrap();
    ipam.allocate_specific_ip("pod1", ip("10.49.27.216"), ReleasePolicy::PodDelete, "")
        .await
        .unwrap();

    let subnets = |key: &'static str, sets: Vec<Vec<IpRange>>| async move {
        ipam.node_subnets_by_key_and_ip_ranges(key, &sets).await.unwrap()
    };
    assert_eq!(subnets("pod1", Vec::new()).await, vec!["10.173.13.0/24", "10.49.27.0/24"]);
    assert_eq!(
        subnets("pod1", range_sets(&[&["10.173.13.0~10.173.13.255"]])).await,
        vec!["10.173.13.0/24"]
    );
    assert!(
        subnets("pod1", range_sets(&[&["10.173.13.2"], &["10.49.27.216"]]))
            .await
            .is_empty()
    );
    assert!(subnets("pod2", Vec::new()).await.is_empty());

    // free ips for an empty key
    assert_eq!(
        subnets("", range_sets(&[&["10.180.154.2~10.180.154.8"]])).await,
        vec!["10.180.1.2/32", "10.180.1.3/32"]
    );
    assert_eq!(
        subnets("", range_sets(&[&["10.180.154.2~10.180.154.8"], &["10.180.154.7~10.180.154.8"]])).await,
        vec!["10.180.1.3/32"]
    );
    assert!(subnets("", range_sets(&[&["10.173.13.2"]])).await.is_empty());
}

/// Must run on a multi-threaded runtime so the tasks really race.
pub(crate) async fn concurrent_allocation(ipam: Arc<dyn Ipam>) {
    const TASKS: usize = 40;
    let start = Arc::new(Barrier::new(TASKS));
    let handles: Vec<_> = (0..TASKS)
        .map(|i| {
            let ipam = Arc::clone(&ipam);
            let start = Arc::clone(&start);
            tokio::spawn(async move {
                start.wait().await;
                let key = format!("pod{i}");
                let result = ipam
                    .allocate_in_subnet(&key, &net("10.173.13.0/24"), ReleasePolicy::PodDelete, "")
                    .await;
                (key, result)
            })
        })
        .collect();

    let mut allocated = HashMap::new();
    let mut exhausted = 0;
    let mut other = Vec::new();
    for joined in futures::future::join_all(handles).await {
        let (key, result) = joined.unwrap();
        match result {
            Ok(ip) => {
                assert!(allocated.insert(ip, key).is_none(), "{ip} handed out twice");
            }
            Err(IpamError::NoEnoughIp) => exhausted += 1,
            Err(e) => other.push(e.to_string()),
        }
    }
    assert!(other.is_empty(), "unexpected errors: {other:?}");
    assert_eq!(allocated.len(), 6);
    assert_eq!(exhausted, TASKS - 6);
    let stored: HashMap<_, _> = keys_of(ipam.as_ref(), "pod").await.into_iter().collect();
    assert_eq!(stored, allocated);
}
