//! Agora simulator
//!
//! Runs a small in-process mesh through the water exchange: a clinic needs
//! water, a depot has bottles, the clinic proposes an agreement and the
//! other peers vote on it.

use std::sync::Arc;
use std::time::Duration;

use agora_fact::{now_millis, Context, FactFactory, FactId, Keypair, Signer, Urgency};
use agora_node::{ChannelHub, Node, NodeConfig, NodeEvent, NodeHandle};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PEERS: usize = 4;
const AGREEMENT_VALIDITY_MS: u64 = 24 * 60 * 60 * 1000;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora=info,agora_node=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = NodeConfig::from_env()?;
    tracing::info!(peers = PEERS, "Starting Agora simulation");

    let hub = ChannelHub::new();
    let mut nodes = Vec::with_capacity(PEERS);
    let mut factories = Vec::with_capacity(PEERS);
    for _ in 0..PEERS {
        let identity = Keypair::generate();
        factories.push(FactFactory::new(identity.peer_id().clone()));
        let (transport, inbound) = hub.join(&identity)?;
        nodes.push(Node::spawn(config.clone(), identity, Arc::new(transport), inbound));
    }

    // Full mesh.
    for (i, node) in nodes.iter().enumerate() {
        for other in &nodes[i + 1..] {
            node.connect(other.peer_id().clone()).await?;
        }
    }
    for node in &nodes {
        wait_until_connected(node, PEERS - 1).await?;
    }

    let (clinic, depot) = (&nodes[0], &nodes[1]);
    let mut clinic_events = clinic.subscribe();

    let need = clinic
        .submit(factories[0].needs(
            "clinic",
            "water",
            Context::new().with_urgency(Urgency::High),
        )?)
        .await?;
    let offer = depot
        .submit(factories[1].has("depot", "water bottles", Context::new())?)
        .await?;
    tracing::info!(need = %need.id, offer = %offer.id, "offer and request published");
    wait_for_fact(&mut clinic_events, &offer.id).await?;

    let agreement = clinic
        .submit(factories[0].committed(
            vec!["clinic".into(), "depot".into()],
            serde_json::json!({"water bottles": 200}),
            now_millis() + AGREEMENT_VALIDITY_MS,
            &[need.id.clone(), offer.id.clone()],
            Context::new(),
        )?)
        .await?;

    // Voters must have seen the agreement before they are asked.
    for node in &nodes[1..] {
        let mut waited = 0;
        while node.fact(agreement.id.clone()).await?.is_none() && waited < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
    }

    let decision = clinic.request_consensus(agreement.id.clone()).await?;
    tracing::info!(
        fact_id = %agreement.id,
        outcome = %decision.outcome,
        positive = decision.positive,
        total = decision.total,
        "agreement decided"
    );

    for node in &nodes {
        let stats = node.stats().await?;
        tracing::info!(
            peer = %stats.peer_id,
            facts = stats.facts,
            validated = stats.validation.validated,
            peers = stats.connected_peers,
            state = %stats.topology_state,
            "node summary"
        );
    }

    for node in &nodes {
        node.shutdown().await?;
    }
    Ok(())
}

async fn wait_until_connected(node: &NodeHandle, peers: usize) -> agora_node::Result<()> {
    for _ in 0..100 {
        if node.stats().await?.connected_peers >= peers {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    tracing::warn!(peer = %node.peer_id(), "mesh not fully connected");
    Ok(())
}

async fn wait_for_fact(
    events: &mut broadcast::Receiver<NodeEvent>,
    fact: &FactId,
) -> Result<(), Box<dyn std::error::Error>> {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(NodeEvent::FactAccepted { fact_id, .. }) if fact_id == *fact => return Ok(()),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait).await??;
    Ok(())
}
