//! Agora mesh simulation
//!
//! Spawns `AGORA_SIM_PEERS` peers on an in-process transport, lets each of
//! them join through the first one, waits for the mesh to close and then
//! runs one decision across it.

use std::sync::Arc;
use std::time::Duration;

use agora_mesh::{Decision, Identity, MeshConfig, MeshEvent, MeshHandle, MeshService};
use agora_transport::MemoryNetwork;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Rename {
    name: String,
}

fn rename_decision() -> Decision<Rename> {
    Decision::new("rename", |r: Rename| async move {
        !r.name.is_empty() && r.name.len() <= 32
    })
    .on_accept(|r: Rename| async move {
        info!("Mesh renamed to {}", r.name);
    })
    .on_decline(|attempt| async move {
        warn!("Rename {} was declined", attempt);
    })
    .on_foreign_accept(|r: Rename, source| async move {
        info!("{} renamed the mesh to {}", source, r.name);
    })
}

async fn wait_for_closure(peers: &[MeshHandle], limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        let mut closed = true;
        for peer in peers {
            match peer.peers().await {
                Ok(known) if known.len() == peers.len() - 1 => {}
                _ => {
                    closed = false;
                    break;
                }
            }
        }
        if closed {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agora_sim=info,agora_mesh=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let count: usize = match std::env::var("AGORA_SIM_PEERS") {
        Ok(value) => value.parse()?,
        Err(_) => 4,
    };
    if count < 2 {
        return Err("AGORA_SIM_PEERS must be at least 2".into());
    }
    let config = MeshConfig::from_env()?;
    let net = Arc::new(MemoryNetwork::new());

    info!("Starting {} peers", count);
    let mut peers = Vec::with_capacity(count);
    for _ in 0..count {
        let peer = MeshService::spawn(Identity::generate(), config.clone(), net.clone())?;
        peer.register_decision(rename_decision())?;
        peers.push(peer);
    }

    // Everyone bootstraps through the first peer only
    for peer in &peers[1..] {
        peer.connect(&peers[0]).await?;
    }

    if !wait_for_closure(&peers, Duration::from_secs(10)).await {
        return Err("mesh did not close".into());
    }
    info!("Mesh closed with {} peers", count);

    let proposer = &peers[count - 1];
    let mut events = proposer.subscribe();
    let attempt = proposer
        .propose(
            "rename",
            &Rename {
                name: "agora".to_string(),
            },
        )
        .await?;

    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(event @ MeshEvent::DecisionAccepted { .. })
                | Ok(event @ MeshEvent::DecisionDeclined { .. }) => return Some(event),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
    })
    .await;

    match outcome {
        Ok(Some(event)) => info!("Attempt {} finished: {:?}", attempt, event),
        _ => warn!("Attempt {} did not finish", attempt),
    }

    // Let the other peers apply the action before stopping
    tokio::time::sleep(Duration::from_millis(200)).await;
    for peer in &peers {
        peer.shutdown();
    }
    Ok(())
}
