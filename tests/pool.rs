//! Peer-pool selection, health, and bookkeeping scenarios.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::pooled_peer;
use plex::pool::{CallDescriptor, PoolMembership};
use plex::{
    CallOptions, FramedDuplex, Peer, PeerMeta, PeerPool, PlexError, Policy, PoolConfig, PoolEvent,
    RpcSettings, ScanQuery,
};

fn settings() -> RpcSettings {
    RpcSettings::default()
}

fn wan_meta() -> PeerMeta {
    PeerMeta {
        source: None,
        locality: Some(plex::pool::Locality::Wan),
    }
}

/// Completed-call peer ids, in completion order.
fn completions(rx: &mut tokio::sync::mpsc::UnboundedReceiver<PoolEvent>) -> Vec<u64> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let PoolEvent::Complete { peer, .. } = event {
            out.push(peer);
        }
    }
    out
}

#[tokio::test]
async fn test_weighted_bias_follows_static_weights() {
    let pool = PeerPool::new(
        PoolConfig::new(common::STORE_ID)
            .policy(Policy::Weighted {
                prefer_local: false,
            })
            .settings(settings()),
    );
    let mut guards = Vec::new();
    let mut ports = Vec::new();
    for weight in [1u32, 5, 1] {
        let (peer, _store, port) = pooled_peer(settings()).await;
        guards.push(pool.add(peer, weight, wan_meta()));
        ports.push(port);
    }
    let mut events = pool.subscribe();

    for i in 0..60u32 {
        let env = pool
            .put(format!("k{}", i), "v", CallOptions::default())
            .await
            .unwrap();
        assert!(env.is_ok());
    }

    let peers = completions(&mut events);
    assert_eq!(peers.len(), 60);
    let count = |pid: u64| peers.iter().filter(|p| **p == pid).count();
    let (first, mid, last) = (count(1), count(2), count(3));
    assert!(
        mid > first && mid > last,
        "expected the weight-5 peer to dominate: {}/{}/{}",
        first,
        mid,
        last
    );
}

#[tokio::test]
async fn test_sticky_keys_pin_to_one_peer() {
    let key_fn: plex::pool::StickyKeyFn = Arc::new(|desc: &CallDescriptor<'_>| {
        desc.key.map(Bytes::copy_from_slice).unwrap_or_default()
    });
    let pool = PeerPool::new(
        PoolConfig::new(common::STORE_ID)
            .policy(Policy::Sticky(key_fn))
            .settings(settings()),
    );
    let mut ports = Vec::new();
    for _ in 0..2 {
        let (peer, _store, port) = pooled_peer(settings()).await;
        pool.add(peer, 1, PeerMeta::default());
        ports.push(port);
    }
    let mut events = pool.subscribe();

    for _ in 0..5 {
        pool.get("key-a", CallOptions::default()).await.unwrap();
    }
    for _ in 0..5 {
        pool.get("key-b", CallOptions::default()).await.unwrap();
    }

    let peers = completions(&mut events);
    assert_eq!(peers.len(), 10);
    let (a_calls, b_calls) = peers.split_at(5);
    assert!(a_calls.iter().all(|p| *p == a_calls[0]), "key-a moved peers");
    assert!(b_calls.iter().all(|p| *p == b_calls[0]), "key-b moved peers");
}

#[tokio::test]
async fn test_round_robin_advances_once_per_call() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));
    let mut ports = Vec::new();
    for _ in 0..2 {
        let (peer, _store, port) = pooled_peer(settings()).await;
        pool.add(peer, 1, PeerMeta::default());
        ports.push(port);
    }
    let mut events = pool.subscribe();

    for i in 0..4u32 {
        pool.get(format!("k{}", i), CallOptions::default())
            .await
            .unwrap();
    }

    let peers = completions(&mut events);
    assert_eq!(peers.len(), 4);
    assert_ne!(peers[0], peers[1]);
    assert_eq!(peers[0], peers[2]);
    assert_eq!(peers[1], peers[3]);
}

#[tokio::test]
async fn test_failed_peer_enters_cooldown() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));

    let (healthy, _store, _port) = pooled_peer(settings()).await;
    pool.add(healthy, 1, PeerMeta::default());

    // A peer whose remote side is gone: any call through it throws.
    let (alive_side, dead_side) = FramedDuplex::pair();
    drop(dead_side);
    pool.add(Peer::new(alive_side), 1, PeerMeta::default());

    let mut failures = 0;
    let mut successes = 0;
    for i in 0..4u32 {
        match pool.get(format!("k{}", i), CallOptions::default()).await {
            Ok(_) => successes += 1,
            Err(_) => failures += 1,
        }
    }
    assert_eq!(failures, 1, "the dead peer should fail exactly once");
    assert_eq!(successes, 3);

    // While the cooldown holds, only the healthy peer is selected.
    for i in 0..6u32 {
        pool.get(format!("again{}", i), CallOptions::default())
            .await
            .unwrap();
    }

    let stats = pool.stats();
    let dead = stats.iter().find(|s| s.failures > 0).unwrap();
    assert!(dead.cooldown_ms.is_some(), "failed peer is cooling down");
    let healthy = stats.iter().find(|s| s.failures == 0).unwrap();
    assert!(healthy.successes >= 9);
}

#[tokio::test]
async fn test_empty_pool_throws_and_emits_no_peer() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));
    let mut events = pool.subscribe();

    let err = pool.get("k", CallOptions::default()).await.unwrap_err();
    assert!(matches!(err, PlexError::NoPeers));
    assert_eq!(err.to_string(), "PeerPool: no peers available");

    match events.try_recv().unwrap() {
        PoolEvent::NoPeer { method } => assert_eq!(method, "get"),
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn test_pool_scan_settles_bookkeeping() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));
    let (peer, _store, _port) = pooled_peer(settings()).await;
    pool.add(peer, 1, PeerMeta::default());

    for i in 0..4u8 {
        pool.put(format!("s/{}", i), "v", CallOptions::default())
            .await
            .unwrap();
    }

    let mut scan = pool
        .scan(
            ScanQuery {
                prefix: Some(Bytes::from_static(b"s/")),
                ..ScanQuery::default()
            },
            CallOptions::default(),
        )
        .await
        .unwrap();
    let mut rows = 0;
    while scan.next().await.unwrap().is_some() {
        rows += 1;
    }
    assert_eq!(rows, 4);

    let stats = pool.stats();
    assert_eq!(stats.len(), 1);
    // 4 puts + 1 settled scan.
    assert_eq!(stats[0].successes, 5);
    assert_eq!(stats[0].in_flight, 0);
}

#[tokio::test]
async fn test_membership_removal_detaches_peer() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));
    let (peer, _store, _port) = pooled_peer(settings()).await;
    let membership: PoolMembership = pool.add(peer, 1, PeerMeta::default());

    pool.put("k", "v", CallOptions::default()).await.unwrap();
    membership.remove().await;

    let err = pool.get("k", CallOptions::default()).await.unwrap_err();
    assert!(matches!(err, PlexError::NoPeers));
    assert!(pool.stats().is_empty());
}

#[tokio::test]
async fn test_stats_track_latency_and_counts() {
    let pool = PeerPool::new(PoolConfig::new(common::STORE_ID).settings(settings()));
    let (peer, store, _port) = pooled_peer(settings()).await;
    store.set_unary_delay(Duration::from_millis(5));
    pool.add(peer, 3, wan_meta());

    for i in 0..5u32 {
        pool.put(format!("k{}", i), "v", CallOptions::default())
            .await
            .unwrap();
    }

    let stats = pool.stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].weight, 3);
    assert_eq!(stats[0].successes, 5);
    assert_eq!(stats[0].failures, 0);
    assert!(stats[0].latency_ms > 0.0);
    assert!(stats[0].cooldown_ms.is_none());
}
