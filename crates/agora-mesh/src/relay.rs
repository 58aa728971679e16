//! Mesh growth through already-connected peers.
//!
//! When a peer is promoted, every other established peer hears about it
//! (NEW_PEER) and starts connecting to it, using the announcer as a
//! signaling relay: SESSION and ICE_CANDIDATE packets travel inside
//! CONN_PACKET control messages routed through the announcer. One bootstrap
//! connection is enough for a newcomer to end up connected to everyone.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::identity::{ConnectionId, NodeId};
use crate::management::{ManagementMessage, ManagementPayload, RelayVia};
use crate::network::{ConnectionPacket, MessageTransport, Network};

/// Queues a control message for sending from the owning task.
pub type Forwarder = Arc<dyn Fn(ManagementMessage) + Send + Sync>;

pub struct ConnectionRelay {
    forward: Forwarder,
    /// Newcomers we are already connecting to, by connection attempt
    introductions: HashMap<NodeId, ConnectionId>,
}

impl ConnectionRelay {
    pub fn new(forward: Forwarder) -> Self {
        Self {
            forward,
            introductions: HashMap::new(),
        }
    }

    /// Announce a newly promoted peer to everyone else.
    pub fn on_peer_promoted(&mut self, network: &mut Network, peer: &NodeId) {
        self.introductions.remove(peer);
        debug!("Announcing new peer {}", peer);
        network.broadcast(ManagementPayload::NewPeer(peer.clone()), Some(peer));
    }

    /// Forget introductions whose connection attempt is gone.
    pub fn prune(&mut self, network: &Network) {
        self.introductions.retain(|peer, conn| {
            let live = network.has_connection(conn);
            if !live {
                debug!("Introduction to {} ({}) went stale", peer, conn);
            }
            live
        });
    }

    /// Handle relay payloads; returns false for anything else.
    pub async fn handle_message(&mut self, network: &mut Network, msg: &ManagementMessage) -> bool {
        match &msg.payload {
            ManagementPayload::NewPeer(peer) => {
                self.on_new_peer(network, &msg.source, peer);
                true
            }
            ManagementPayload::ConnPacket(packet) => {
                self.on_conn_packet(network, msg, packet.clone()).await;
                true
            }
            _ => false,
        }
    }

    fn on_new_peer(&mut self, network: &mut Network, announcer: &NodeId, peer: &NodeId) {
        if peer == network.local().id() || network.is_known(peer) {
            return;
        }
        self.prune(network);
        if let Some(conn) = self.introductions.get(peer) {
            debug!("Already connecting to {} ({})", peer, conn);
            return;
        }
        if !network.is_established(announcer) {
            warn!("Unknown relay peer {}", announcer);
            return;
        }

        let local = network.local().id().clone();
        let transport = self.transport(local, announcer.clone(), peer.clone());
        match network.add_foreign_peer(transport) {
            Ok(conn) => {
                info!("Connecting to {} via {}", peer, announcer);
                self.introductions.insert(peer.clone(), conn);
            }
            Err(e) => warn!("Failed to connect to {} via {}: {}", peer, announcer, e),
        }
    }

    async fn on_conn_packet(
        &mut self,
        network: &mut Network,
        msg: &ManagementMessage,
        packet: ConnectionPacket,
    ) {
        // Without a relay hop the packet came straight from its source
        let relay = match &msg.relay_via {
            RelayVia::Via(id) => id.clone(),
            RelayVia::Direct => msg.source.clone(),
        };
        if !network.is_established(&relay) {
            warn!("Connection packet from {} via unknown relay {}", msg.source, relay);
            return;
        }

        let transport = self.transport(network.local().id().clone(), relay, msg.source.clone());
        network.handle_incoming_packet(packet, transport).await;
    }

    /// Transport that wraps packets for `target` in CONN_PACKETs sent via `relay`.
    fn transport(&self, local: NodeId, relay: NodeId, target: NodeId) -> MessageTransport {
        let forward = Arc::clone(&self.forward);
        let relay_via = if relay == target {
            RelayVia::Direct
        } else {
            RelayVia::Via(relay)
        };
        Arc::new(move |packet| {
            forward(ManagementMessage {
                source: local.clone(),
                target: target.clone(),
                relay_via: relay_via.clone(),
                payload: ManagementPayload::ConnPacket(packet),
            });
        })
    }
}
