//! Helpers for multi-node scenarios over an in-process hub.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agora_fact::{FactFactory, Keypair, Signer};
use agora_node::{ChannelHub, Node, NodeConfig, NodeEvent, NodeHandle};
use tokio::sync::broadcast;

/// How long scenarios wait for the mesh to settle.
pub const SETTLE: Duration = Duration::from_secs(5);

/// A node plus a fact factory bound to its identity.
pub struct TestPeer {
    pub node: NodeHandle,
    pub facts: FactFactory,
}

pub fn spawn_peer(hub: &ChannelHub, seed: u8, config: NodeConfig) -> TestPeer {
    let identity = Keypair::from_seed([seed; 32]);
    let facts = FactFactory::new(identity.peer_id().clone());
    let (transport, inbound) = hub
        .join(&identity)
        .expect("hub accepts new members");
    TestPeer {
        node: Node::spawn(config, identity, Arc::new(transport), inbound),
        facts,
    }
}

/// Connect two nodes and wait until both actors have seen the link.
pub async fn link(a: &NodeHandle, b: &NodeHandle) {
    let mut a_events = a.subscribe();
    let mut b_events = b.subscribe();
    a.connect(b.peer_id().clone()).await.expect("connect");
    let (pa, pb) = (a.peer_id().clone(), b.peer_id().clone());
    wait_for(&mut a_events, |e| matches!(e, NodeEvent::PeerConnected(p) if *p == pb)).await;
    wait_for(&mut b_events, |e| matches!(e, NodeEvent::PeerConnected(p) if *p == pa)).await;
}

/// Next event matching `matches`, panicking after [`SETTLE`].
pub async fn wait_for<F>(events: &mut broadcast::Receiver<NodeEvent>, mut matches: F) -> NodeEvent
where
    F: FnMut(&NodeEvent) -> bool,
{
    tokio::time::timeout(SETTLE, async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

/// Poll `check` until it holds or [`SETTLE`] passes.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + SETTLE;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
