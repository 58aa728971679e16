//! Mesh membership and connection setup.
//!
//! A [`Network`] owns the local identity, the established peers (`nodes`,
//! keyed by node id) and the connections still being set up (`connecting`,
//! keyed by connection-attempt id). Signaling packets delivered from outside
//! drive connection setup; once a connection is up, its management channel
//! is open and the peer's public key has been imported, the peer is promoted
//! into `nodes` and becomes addressable.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use agora_transport::{
    IceCandidate, SessionConfig, SessionDescription, SessionEvent, SessionFactory,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::MeshConfig;
use crate::connection::{Connection, Signal, SignalHandler};
use crate::error::{Error, Result};
use crate::identity::{ConnectionId, Identity, NodeId, PeerId, PeerInfo};
use crate::management::{route, ManagementChannel, ManagementMessage, ManagementPayload, Route};

/// Signaling carried by a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PacketBody {
    Session(SessionDescription),
    IceCandidate(IceCandidate),
}

/// Signaling envelope exchanged between two peers setting up a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionPacket {
    pub source_node: NodeId,
    pub connection_id: ConnectionId,
    #[serde(flatten)]
    pub body: PacketBody,
}

/// Delivers signaling packets to the remote side of a connection.
pub type MessageTransport = Arc<dyn Fn(ConnectionPacket) + Send + Sync>;

/// Receives every transport session event, tagged with its connection.
pub type SessionEventSink = Arc<dyn Fn(ConnectionId, SessionEvent) + Send + Sync>;

/// Membership changes and messages surfaced to the layers above.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    Promoted(NodeId),
    Message(ManagementMessage),
    Lost(NodeId),
}

struct NetworkNode {
    conn_id: ConnectionId,
    peer: PeerId,
    identity: Option<Identity>,
    connection: Connection,
    management: ManagementChannel,
    info_sent: bool,
    /// Messages received before promotion, replayed right after it
    early: Vec<ManagementMessage>,
}

impl NetworkNode {
    fn ready(&self) -> bool {
        self.connection.is_open() && self.management.is_open() && self.identity.is_some()
    }
}

pub struct Network {
    local: Identity,
    session_config: SessionConfig,
    channel_label: String,
    factory: Arc<dyn SessionFactory>,
    sink: SessionEventSink,
    nodes: HashMap<NodeId, NetworkNode>,
    connecting: HashMap<ConnectionId, NetworkNode>,
    /// Connection id of every established node
    routes: HashMap<ConnectionId, NodeId>,
    /// Peers whose channel closed while another connection to them was
    /// still being set up
    handover: HashSet<NodeId>,
}

impl Network {
    pub fn new(
        local: Identity,
        config: &MeshConfig,
        factory: Arc<dyn SessionFactory>,
        sink: SessionEventSink,
    ) -> Self {
        info!("Node id: {}", local.id());
        Self {
            local,
            session_config: config.session.clone(),
            channel_label: config.channel_label.clone(),
            factory,
            sink,
            nodes: HashMap::new(),
            connecting: HashMap::new(),
            routes: HashMap::new(),
            handover: HashSet::new(),
        }
    }

    pub fn local(&self) -> &Identity {
        &self.local
    }

    /// Established peers, sorted by id.
    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<_> = self.nodes.keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn is_established(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    /// Established, or connecting under a confirmed id.
    pub fn is_known(&self, id: &NodeId) -> bool {
        self.is_established(id) || self.is_connecting_to(id)
    }

    fn is_connecting_to(&self, id: &NodeId) -> bool {
        self.connecting
            .values()
            .any(|node| node.peer.confirmed() == Some(id))
    }

    pub fn has_connection(&self, conn: &ConnectionId) -> bool {
        self.connecting.contains_key(conn) || self.routes.contains_key(conn)
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.len()
    }

    /// Identity with a verifiable key for `id`: ours, or an established peer's.
    pub fn resolve(&self, id: &NodeId) -> Option<&Identity> {
        if id == self.local.id() {
            return Some(&self.local);
        }
        self.nodes.get(id).and_then(|node| node.identity.as_ref())
    }

    /// Start connecting to a peer reachable through `transport`.
    ///
    /// This side creates the management channel and therefore initiates
    /// negotiation. The peer is known by the returned connection id until
    /// its answer names it.
    pub fn add_foreign_peer(&mut self, transport: MessageTransport) -> Result<ConnectionId> {
        let conn = ConnectionId::generate();
        self.create_node(conn.clone(), PeerId::Provisional(conn.clone()), transport)?;

        let opened = self
            .connecting
            .get_mut(&conn)
            .map(|node| node.management.open())
            .unwrap_or(Ok(()));
        if let Err(e) = opened {
            if let Some(node) = self.connecting.remove(&conn) {
                node.connection.close();
            }
            return Err(e);
        }

        info!("Connecting to foreign peer ({})", conn);
        Ok(conn)
    }

    /// Apply a signaling packet delivered from outside or through a relay.
    pub async fn handle_incoming_packet(
        &mut self,
        packet: ConnectionPacket,
        transport: MessageTransport,
    ) {
        let ConnectionPacket {
            source_node,
            connection_id,
            body,
        } = packet;

        if source_node == *self.local.id() {
            warn!("Ignoring signaling from ourselves ({})", connection_id);
            return;
        }

        match body {
            PacketBody::Session(desc) => {
                self.handle_session_desc(source_node, connection_id, desc, transport)
                    .await
            }
            PacketBody::IceCandidate(candidate) => {
                let Some(node) = self.node_by_conn_mut(&connection_id) else {
                    warn!(
                        "Attempt to add candidate without an active connection ({})",
                        connection_id
                    );
                    return;
                };
                node.connection.add_ice_candidate(candidate).await;
            }
        }
    }

    async fn handle_session_desc(
        &mut self,
        source: NodeId,
        conn: ConnectionId,
        desc: SessionDescription,
        transport: MessageTransport,
    ) {
        if !self.has_connection(&conn) {
            if !desc.is_offer() {
                warn!("Attempt to handle an answer without an active connection ({})", conn);
                return;
            }
            // Responder path: the offer names its sender
            let peer = PeerId::Confirmed(source.clone());
            if let Err(e) = self.create_node(conn.clone(), peer, transport) {
                warn!("Failed to create connection {} for {}: {}", conn, source, e);
                return;
            }
            info!("Incoming connection {} from {}", conn, source);
        }

        let Some(node) = self.node_by_conn_mut(&conn) else {
            return;
        };

        match node.peer.confirmed().cloned() {
            Some(id) if id != source => {
                warn!("Signaling for {} on connection {} came from {}", id, conn, source);
                return;
            }
            Some(_) => {}
            None if !desc.is_offer() => {
                // Only the answer corrects a provisional id
                if let Err(e) = node.peer.confirm(source.clone()) {
                    warn!("Failed to confirm peer on {}: {}", conn, e);
                    return;
                }
                node.management.bind_peer(source.clone());
                debug!("Connection {} answered by {}", conn, source);
            }
            None => {}
        }

        if let Err(e) = node.connection.handle_session_description(desc).await {
            warn!("Failed to apply session description on {}: {}", conn, e);
            return;
        }
        self.send_peer_info(&conn);
    }

    /// Process one transport session event.
    pub async fn handle_session_event(
        &mut self,
        conn: ConnectionId,
        event: SessionEvent,
    ) -> Vec<NetworkEvent> {
        let mut out = Vec::new();
        let Some(node) = self.node_by_conn_mut(&conn) else {
            trace!("Event for unknown connection {}: {:?}", conn, event);
            return out;
        };

        match event {
            SessionEvent::NegotiationNeeded => node.connection.on_negotiation_needed().await,
            SessionEvent::LocalCandidate(candidate) => {
                node.connection.on_local_candidate(candidate)
            }
            SessionEvent::IceStateChanged(state) => node.connection.on_ice_state(state),
            SessionEvent::StateChanged(state) => {
                if let Some(state) = node.connection.on_connection_state(state) {
                    debug!("Connection {} is {}", conn, state);
                    node.management.on_connection_state(state);
                }
                self.try_promote(&conn, &mut out);
            }
            SessionEvent::IncomingChannel { label } => {
                node.management.on_incoming_channel(&label);
            }
            SessionEvent::ChannelOpen { label } => match node.management.on_open(&label) {
                Ok(true) => {
                    self.send_peer_info(&conn);
                    self.try_promote(&conn, &mut out);
                }
                Ok(false) => {}
                Err(e) => warn!("Failed to flush management channel on {}: {}", conn, e),
            },
            SessionEvent::ChannelMessage { label, data } => {
                if let Some(msg) = node.management.on_message(&label, &data) {
                    self.on_message(&conn, msg, &mut out);
                }
            }
            SessionEvent::ChannelClosed { label } => {
                if node.management.on_closed(&label) {
                    self.on_channel_closed(&conn, &mut out);
                }
            }
        }
        out
    }

    /// Send a message on the channel of its next hop.
    pub fn send(&mut self, msg: ManagementMessage) -> Result<()> {
        let hop = msg.next_hop().clone();
        let node = self.nodes.get_mut(&hop).ok_or(Error::UnknownPeer(hop))?;
        node.management.send(msg)
    }

    /// Send `payload` directly to every established peer except `except`.
    pub fn broadcast(&mut self, payload: ManagementPayload, except: Option<&NodeId>) {
        let local = self.local.id();
        for (id, node) in self.nodes.iter_mut() {
            if except == Some(id) {
                continue;
            }
            let msg = ManagementMessage::direct(local.clone(), id.clone(), payload.clone());
            if let Err(e) = node.management.send(msg) {
                warn!("Failed to send {} to {}: {}", payload.kind(), id, e);
            }
        }
    }

    /// Close every connection.
    pub fn close(&mut self) {
        for node in self.nodes.values().chain(self.connecting.values()) {
            node.connection.close();
        }
        self.nodes.clear();
        self.connecting.clear();
        self.routes.clear();
        self.handover.clear();
    }

    fn create_node(
        &mut self,
        conn: ConnectionId,
        peer: PeerId,
        transport: MessageTransport,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = self.factory.create(&self.session_config, tx)?;

        let sink = Arc::clone(&self.sink);
        let tag = conn.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink(tag.clone(), event);
            }
        });

        let source = self.local.id().clone();
        let packet_conn = conn.clone();
        let signal: SignalHandler = Arc::new(move |signal| {
            let body = match signal {
                Signal::Session(desc) => PacketBody::Session(desc),
                Signal::Candidate(candidate) => PacketBody::IceCandidate(candidate),
            };
            transport(ConnectionPacket {
                source_node: source.clone(),
                connection_id: packet_conn.clone(),
                body,
            });
        });

        let mut management =
            ManagementChannel::new(self.channel_label.clone(), Arc::clone(&session));
        if let Some(id) = peer.confirmed() {
            management.bind_peer(id.clone());
        }

        self.connecting.insert(
            conn.clone(),
            NetworkNode {
                conn_id: conn,
                peer,
                identity: None,
                connection: Connection::new(session, signal),
                management,
                info_sent: false,
                early: Vec::new(),
            },
        );
        Ok(())
    }

    fn node_by_conn_mut(&mut self, conn: &ConnectionId) -> Option<&mut NetworkNode> {
        if self.connecting.contains_key(conn) {
            return self.connecting.get_mut(conn);
        }
        let id = self.routes.get(conn)?;
        self.nodes.get_mut(id)
    }

    /// Export our key once the channel is open and the peer is identified.
    fn send_peer_info(&mut self, conn: &ConnectionId) {
        let local = self.local.id().clone();
        let info = self.local.export_peer_info();
        let Some(node) = self.node_by_conn_mut(conn) else {
            return;
        };
        if node.info_sent || !node.management.is_open() {
            return;
        }
        let Some(peer) = node.peer.confirmed().cloned() else {
            return;
        };

        let info = match info {
            Ok(info) => info,
            Err(e) => {
                warn!("Cannot export local peer info: {}", e);
                return;
            }
        };
        let msg = ManagementMessage::direct(local, peer.clone(), ManagementPayload::PeerInfo(info));
        match node.management.send(msg) {
            Ok(()) => {
                node.info_sent = true;
                debug!("Sent peer info to {}", peer);
            }
            Err(e) => warn!("Failed to send peer info to {}: {}", peer, e),
        }
    }

    fn on_message(
        &mut self,
        conn: &ConnectionId,
        msg: ManagementMessage,
        out: &mut Vec<NetworkEvent>,
    ) {
        if let ManagementPayload::PeerInfo(info) = &msg.payload {
            self.on_peer_info(conn, &msg.source, info, out);
            return;
        }

        if !self.routes.contains_key(conn) {
            if let Some(node) = self.connecting.get_mut(conn) {
                debug!("Buffering {} from connecting node ({})", msg.payload.kind(), conn);
                node.early.push(msg);
            }
            return;
        }
        self.dispatch(msg, out);
    }

    fn dispatch(&mut self, msg: ManagementMessage, out: &mut Vec<NetworkEvent>) {
        match route(&msg, self.local.id()) {
            Route::Deliver => out.push(NetworkEvent::Message(msg)),
            Route::Forward => {
                let target = msg.target.clone();
                let kind = msg.payload.kind();
                match self.nodes.get_mut(&target) {
                    Some(node) => {
                        trace!("Forwarding {} from {} to {}", kind, msg.source, target);
                        if let Err(e) = node.management.send(msg) {
                            warn!("Failed to forward {} to {}: {}", kind, target, e);
                        }
                    }
                    None => warn!("Cannot forward {} to unknown node {}", kind, target),
                }
            }
            Route::Stray => warn!(
                "Dropping stray {} from {} (target {}, relay {})",
                msg.payload.kind(),
                msg.source,
                msg.target,
                msg.relay_via
            ),
        }
    }

    fn on_peer_info(
        &mut self,
        conn: &ConnectionId,
        source: &NodeId,
        info: &PeerInfo,
        out: &mut Vec<NetworkEvent>,
    ) {
        let Some(node) = self.node_by_conn_mut(conn) else {
            return;
        };
        if node.identity.is_some() {
            debug!("Duplicate peer info from {}", source);
            return;
        }
        let Some(id) = node.peer.confirmed().cloned() else {
            warn!("Peer info from {} on unidentified connection {}", source, conn);
            return;
        };
        if *source != id {
            warn!("Peer info from {} on connection to {}", source, id);
            return;
        }

        let mut identity = Identity::remote(id.clone());
        if let Err(e) = identity.import_peer_info(info) {
            warn!("Rejecting peer {}: {}", id, e);
            self.abandon(conn, out);
            return;
        }
        debug!("Imported public key of {}", id);
        node.identity = Some(identity);
        self.try_promote(conn, out);
    }

    fn try_promote(&mut self, conn: &ConnectionId, out: &mut Vec<NetworkEvent>) {
        if !self.connecting.get(conn).is_some_and(NetworkNode::ready) {
            return;
        }
        let Some(mut node) = self.connecting.remove(conn) else {
            return;
        };
        let Some(id) = node.peer.confirmed().cloned() else {
            return;
        };

        // Two connections to the same peer: both sides keep the lower id.
        let mut replaced = self.handover.remove(&id);
        if let Some(existing) = self.nodes.get(&id) {
            if existing.conn_id.as_str() <= conn.as_str() {
                info!("Closing duplicate connection {} to {}", conn, id);
                node.connection.close();
                return;
            }
            if let Some(old) = self.nodes.remove(&id) {
                info!("Connection {} to {} replaces {}", conn, id, old.conn_id);
                self.routes.remove(&old.conn_id);
                old.connection.close();
                replaced = true;
            }
        }

        let early = std::mem::take(&mut node.early);
        self.routes.insert(conn.clone(), id.clone());
        self.nodes.insert(id.clone(), node);

        if !replaced {
            info!("Peer {} connected ({} peers)", id, self.nodes.len());
            out.push(NetworkEvent::Promoted(id));
        }
        for msg in early {
            self.dispatch(msg, out);
        }
    }

    fn on_channel_closed(&mut self, conn: &ConnectionId, out: &mut Vec<NetworkEvent>) {
        let Some(id) = self.routes.remove(conn) else {
            debug!("Connection {} closed before promotion", conn);
            self.abandon(conn, out);
            return;
        };
        if let Some(node) = self.nodes.remove(&id) {
            node.connection.close();
        }
        // The other side kept a lower connection that is still coming up here
        if self.is_connecting_to(&id) {
            info!("Connection {} to {} closed, waiting for its replacement", conn, id);
            self.handover.insert(id);
            return;
        }
        info!("Peer {} disconnected", id);
        out.push(NetworkEvent::Lost(id));
    }

    /// Drop a connection that never got promoted.
    fn abandon(&mut self, conn: &ConnectionId, out: &mut Vec<NetworkEvent>) {
        let Some(node) = self.connecting.remove(conn) else {
            return;
        };
        node.connection.close();
        let Some(id) = node.peer.confirmed() else {
            return;
        };
        if self.handover.contains(id) && !self.is_connecting_to(id) {
            self.handover.remove(id);
            info!("Peer {} disconnected", id);
            out.push(NetworkEvent::Lost(id.clone()));
        }
    }
}
