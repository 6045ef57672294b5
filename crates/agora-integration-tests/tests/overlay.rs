use std::time::Duration;

use agora_fact::Context;
use agora_integration_tests::{eventually, link, spawn_peer, wait_for, TestPeer};
use agora_node::{ChannelHub, Intervals, NodeConfig, NodeEvent, Topic};
use agora_topology::{CongestionConfig, TopologyConfig};
use serde_json::json;

/// Maintenance ticks far enough out that only the congestion window runs
/// during a test.
fn quiet() -> Intervals {
    let hour = Duration::from_secs(3600);
    Intervals {
        adaptation: hour,
        health_check: hour,
        route_cleanup: hour,
        expiry_sweep: hour,
        congestion_window: Duration::from_secs(1),
        link_state_ttl: hour,
    }
}

fn quiet_config() -> NodeConfig {
    NodeConfig::default().with_intervals(quiet())
}

fn singleton_clusters() -> TopologyConfig {
    TopologyConfig::default().with_base_cluster_size(1)
}

#[tokio::test]
async fn routes_cross_cluster_boundaries() {
    let hub = ChannelHub::new();
    let config = quiet_config().with_topology(TopologyConfig::default().with_base_cluster_size(2));
    let peers: Vec<TestPeer> = (1..=7)
        .map(|seed| spawn_peer(&hub, seed, config.clone()))
        .collect();
    for pair in peers.windows(2) {
        link(&pair[0].node, &pair[1].node).await;
    }

    let origin = &peers[0].node;
    assert!(eventually(|| async move { origin.stats().await.unwrap().known_peers == 7 }).await);
    assert!(origin.stats().await.unwrap().clusters > 1);

    for (distance, target) in peers.iter().enumerate().skip(2) {
        let mut events = target.node.subscribe();
        let hops = origin
            .send_to(target.node.peer_id().clone(), Topic::Has, json!({"distance": distance}))
            .await
            .unwrap();
        assert_eq!(hops, distance);

        let event = wait_for(&mut events, |e| matches!(e, NodeEvent::Delivered { .. })).await;
        let NodeEvent::Delivered { origin: from, data, .. } = event else {
            unreachable!()
        };
        assert_eq!(from, *origin.peer_id());
        assert_eq!(data["distance"], distance);
    }
    for relay in &peers[1..6] {
        let stats = relay.node.stats().await.unwrap();
        assert_eq!(stats.router.failures, 0);
    }
}

#[tokio::test]
async fn busy_relay_opens_temporary_capacity() {
    let hub = ChannelHub::new();
    // Past normal capacity from the start, so its sends carry open_n.
    let source = quiet_config().with_congestion(CongestionConfig::default().with_capacity(0, 0));
    let busy = quiet_config().with_congestion(
        CongestionConfig::default()
            .with_capacity(0, 8)
            .with_expansion(4, 4),
    );
    let a = spawn_peer(&hub, 1, quiet_config());
    let b = spawn_peer(&hub, 2, busy);
    let c = spawn_peer(&hub, 3, source);
    link(&a.node, &b.node).await;
    link(&b.node, &c.node).await;

    let fact = c
        .node
        .submit(c.facts.has("depot", "blankets", Context::new()).unwrap())
        .await
        .unwrap();

    let far = &a.node;
    let id = fact.id.clone();
    assert!(
        eventually(|| {
            let id = id.clone();
            async move { far.fact(id).await.unwrap().is_some() }
        })
        .await
    );
    let congestion = b.node.stats().await.unwrap().congestion;
    assert!(congestion.expansions >= 1);
    assert!(congestion.forwarded >= 1);
}

#[tokio::test]
async fn saturated_relay_queues_then_drops() {
    let hub = ChannelHub::new();
    let saturated = NodeConfig::default()
        .with_congestion(
            CongestionConfig::default()
                .with_capacity(0, 0)
                .with_retries(1, Duration::from_millis(10)),
        )
        .with_intervals(Intervals {
            congestion_window: Duration::from_millis(50),
            ..quiet()
        });
    let a = spawn_peer(&hub, 1, quiet_config());
    let b = spawn_peer(&hub, 2, saturated);
    let c = spawn_peer(&hub, 3, quiet_config());
    let d = spawn_peer(&hub, 4, quiet_config());
    let (a, b, c, d) = (&a.node, &b.node, &c.node, &d.node);

    // b relays nothing, so a learns of c through d.
    link(a, b).await;
    link(b, c).await;
    link(a, d).await;
    link(d, c).await;
    assert!(eventually(|| async move { a.stats().await.unwrap().known_peers == 4 }).await);

    a.disconnect(d.peer_id().clone()).await.unwrap();
    assert!(eventually(|| async move { a.stats().await.unwrap().connected_peers == 1 }).await);

    let mut b_events = b.subscribe();
    let hops = a
        .send_to(c.peer_id().clone(), Topic::Has, json!({"probe": 1}))
        .await
        .unwrap();
    assert_eq!(hops, 2);

    let target = c.peer_id().clone();
    let event = wait_for(&mut b_events, |e| {
        matches!(e, NodeEvent::RoutingFailed { destination, .. } if *destination == target)
    })
    .await;
    let NodeEvent::RoutingFailed { reason, .. } = event else {
        unreachable!()
    };
    assert!(reason.contains("congestion"));

    let congestion = b.stats().await.unwrap().congestion;
    assert!(congestion.queued >= 1);
    assert!(congestion.dropped >= 1);
    assert_eq!(c.stats().await.unwrap().router.delivered, 0);
}

#[tokio::test]
async fn health_check_relinks_isolated_cluster() {
    let hub = ChannelHub::new();
    let cramped = NodeConfig::default()
        .with_topology(
            singleton_clusters()
                .with_max_connections(1)
                .with_redundancy_factor(1),
        )
        .with_intervals(Intervals {
            health_check: Duration::from_millis(100),
            ..quiet()
        });
    let a = spawn_peer(&hub, 1, cramped);
    let b = spawn_peer(&hub, 2, quiet_config());
    let d = spawn_peer(&hub, 3, quiet_config());
    let (a, b, d) = (&a.node, &b.node, &d.node);

    link(a, b).await;
    link(a, d).await;
    // d's cluster found no partner with room
    let stats = a.stats().await.unwrap();
    assert_eq!((stats.clusters, stats.cluster_links), (3, 1));

    a.disconnect(b.peer_id().clone()).await.unwrap();
    assert!(
        eventually(|| async move {
            let stats = a.stats().await.unwrap();
            stats.repaired_clusters >= 1 && stats.cluster_links == 1
        })
        .await
    );
    assert_eq!(a.stats().await.unwrap().clusters, 2);
}

#[tokio::test]
async fn health_check_links_neighboring_centers() {
    let hub = ChannelHub::new();
    let config = NodeConfig::default()
        .with_topology(singleton_clusters())
        .with_intervals(Intervals {
            health_check: Duration::from_millis(100),
            ..quiet()
        });
    let a = spawn_peer(&hub, 1, config);
    let b = spawn_peer(&hub, 2, quiet_config());
    let c = spawn_peer(&hub, 3, quiet_config());
    let (a, b, c) = (&a.node, &b.node, &c.node);

    let mut a_events = a.subscribe();
    link(a, b).await;
    link(b, c).await;

    // c's cluster is linked to a's as soon as a hears of it; the health
    // check then backs that link with a connection.
    let far = c.peer_id().clone();
    wait_for(&mut a_events, |e| matches!(e, NodeEvent::PeerConnected(p) if *p == far)).await;
    assert_eq!(a.stats().await.unwrap().connected_peers, 2);

    let hops = a
        .send_to(c.peer_id().clone(), Topic::Has, json!({}))
        .await
        .unwrap();
    assert_eq!(hops, 1);
}
