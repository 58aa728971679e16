//! The per-peer task that owns the mesh state.
//!
//! Everything that touches a peer's [`Network`], [`ConnectionRelay`] and
//! [`DecisionManager`] happens on one tokio task, fed by one event queue:
//! API commands from [`MeshHandle`]s, transport session events, relay
//! forwards and decision wakeups. Handlers therefore never race each other
//! and signaling order per connection is the order the queue saw it in.

use std::sync::Arc;

use agora_transport::{SessionEvent, SessionFactory};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::decision::{AttemptId, Decision, DecisionManager, ErasedDecision, Wakeup, WakeupSink};
use crate::error::{Error, Result};
use crate::event::MeshEvent;
use crate::identity::{ConnectionId, Identity, NodeId};
use crate::management::ManagementMessage;
use crate::network::{ConnectionPacket, MessageTransport, Network, NetworkEvent, SessionEventSink};
use crate::relay::{ConnectionRelay, Forwarder};

enum Command {
    AddForeignPeer {
        transport: MessageTransport,
        reply: oneshot::Sender<Result<ConnectionId>>,
    },
    IncomingPacket {
        packet: ConnectionPacket,
        transport: MessageTransport,
    },
    Register(Arc<dyn ErasedDecision>),
    Propose {
        key: String,
        data: Value,
        reply: oneshot::Sender<Result<AttemptId>>,
    },
    Peers(oneshot::Sender<Vec<NodeId>>),
    Shutdown,
}

enum Event {
    Command(Command),
    Session(ConnectionId, SessionEvent),
    Forward(ManagementMessage),
    Decision(Wakeup),
}

/// Cloneable handle to a running mesh peer.
///
/// The peer stops once every handle is dropped or [`MeshHandle::shutdown`]
/// is called.
#[derive(Clone)]
pub struct MeshHandle {
    id: NodeId,
    tx: mpsc::UnboundedSender<Event>,
    events: broadcast::Sender<MeshEvent>,
}

impl MeshHandle {
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Start connecting to a peer reachable through `transport`.
    pub async fn add_foreign_peer(&self, transport: MessageTransport) -> Result<ConnectionId> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::AddForeignPeer { transport, reply })?;
        rx.await.map_err(|_| Error::ServiceStopped)?
    }

    /// Deliver a signaling packet; replies go out through `transport`.
    pub fn handle_incoming_packet(
        &self,
        packet: ConnectionPacket,
        transport: MessageTransport,
    ) -> Result<()> {
        self.command(Command::IncomingPacket { packet, transport })
    }

    pub fn register_decision<T>(&self, decision: Decision<T>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
    {
        self.command(Command::Register(Arc::new(decision)))
    }

    /// Propose `data` to every current peer under a registered decision key.
    pub async fn propose<T: Serialize>(&self, key: &str, data: &T) -> Result<AttemptId> {
        let data = serde_json::to_value(data)?;
        let (reply, rx) = oneshot::channel();
        self.command(Command::Propose {
            key: key.to_string(),
            data,
            reply,
        })?;
        rx.await.map_err(|_| Error::ServiceStopped)?
    }

    /// Established peers, sorted by id.
    pub async fn peers(&self) -> Result<Vec<NodeId>> {
        let (reply, rx) = oneshot::channel();
        self.command(Command::Peers(reply))?;
        rx.await.map_err(|_| Error::ServiceStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.events.subscribe()
    }

    /// Close every connection and stop the peer.
    pub fn shutdown(&self) {
        let _ = self.command(Command::Shutdown);
    }

    /// Connect to `other` directly, with no relay in between.
    pub async fn connect(&self, other: &MeshHandle) -> Result<ConnectionId> {
        self.add_foreign_peer(link(self, other)).await
    }

    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(Event::Command(command))
            .map_err(|_| Error::ServiceStopped)
    }
}

/// In-process signaling path from `from` to `to`.
///
/// Packets are delivered straight into `to`; its replies travel back
/// through a link built the other way round.
pub fn link(from: &MeshHandle, to: &MeshHandle) -> MessageTransport {
    let from = from.clone();
    let to = to.clone();
    Arc::new(move |packet| {
        if let Err(e) = to.handle_incoming_packet(packet, link(&to, &from)) {
            warn!("Cannot deliver signaling from {} to {}: {}", from.id(), to.id(), e);
        }
    })
}

pub struct MeshService {
    network: Network,
    relay: ConnectionRelay,
    decisions: DecisionManager,
    events: broadcast::Sender<MeshEvent>,
    rx: mpsc::UnboundedReceiver<Event>,
}

impl MeshService {
    /// Spawn a mesh peer onto the current tokio runtime.
    pub fn spawn(
        identity: Identity,
        config: MeshConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<MeshHandle> {
        config.validate()?;
        if !identity.has_private_key() {
            return Err(Error::Config("local identity has no private key".to_string()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_capacity);

        // Internal producers must not keep the peer alive on their own
        let weak = tx.downgrade();
        let sink: SessionEventSink = Arc::new(move |conn, event| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Event::Session(conn, event));
            }
        });
        let weak = tx.downgrade();
        let forward: Forwarder = Arc::new(move |msg| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Event::Forward(msg));
            }
        });
        let weak = tx.downgrade();
        let wake: WakeupSink = Arc::new(move |wakeup| {
            if let Some(tx) = weak.upgrade() {
                let _ = tx.send(Event::Decision(wakeup));
            }
        });

        let id = identity.id().clone();
        let service = Self {
            network: Network::new(identity, &config, factory, sink),
            relay: ConnectionRelay::new(forward),
            decisions: DecisionManager::new(&config, wake, events.clone()),
            events: events.clone(),
            rx,
        };
        tokio::spawn(service.run());

        Ok(MeshHandle { id, tx, events })
    }

    async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            match event {
                Event::Command(Command::Shutdown) => break,
                Event::Command(command) => self.on_command(command).await,
                Event::Session(conn, event) => {
                    let out = self.network.handle_session_event(conn, event).await;
                    self.on_network_events(out).await;
                }
                Event::Forward(msg) => {
                    let (target, kind) = (msg.target.clone(), msg.payload.kind());
                    if let Err(e) = self.network.send(msg) {
                        warn!("Failed to forward {} to {}: {}", kind, target, e);
                    }
                }
                Event::Decision(wakeup) => self.decisions.on_wakeup(&mut self.network, wakeup),
            }
        }
        self.network.close();
        info!("Mesh peer {} stopped", self.network.local().id());
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::AddForeignPeer { transport, reply } => {
                let _ = reply.send(self.network.add_foreign_peer(transport));
            }
            Command::IncomingPacket { packet, transport } => {
                self.network.handle_incoming_packet(packet, transport).await;
            }
            Command::Register(decision) => {
                debug!("Registering decision {}", decision.key());
                self.decisions.register(decision);
            }
            Command::Propose { key, data, reply } => {
                let _ = reply.send(self.decisions.propose(&mut self.network, &key, data));
            }
            Command::Peers(reply) => {
                let _ = reply.send(self.network.peers());
            }
            Command::Shutdown => {}
        }
    }

    async fn on_network_events(&mut self, events: Vec<NetworkEvent>) {
        for event in events {
            match event {
                NetworkEvent::Promoted(peer) => {
                    self.relay.on_peer_promoted(&mut self.network, &peer);
                    self.emit(MeshEvent::PeerJoined(peer));
                }
                NetworkEvent::Lost(peer) => {
                    info!("Lost peer {}", peer);
                    self.relay.prune(&self.network);
                    self.emit(MeshEvent::PeerLeft(peer));
                }
                NetworkEvent::Message(msg) => self.on_message(msg).await,
            }
        }
    }

    async fn on_message(&mut self, msg: ManagementMessage) {
        if self.relay.handle_message(&mut self.network, &msg).await {
            return;
        }
        if self.decisions.handle_message(&mut self.network, &msg) {
            return;
        }
        warn!("Unhandled {} message from {}", msg.payload.kind(), msg.source);
    }

    fn emit(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_transport::MemoryNetwork;
    use std::time::Duration;

    fn spawn(net: &MemoryNetwork) -> MeshHandle {
        MeshService::spawn(
            Identity::generate(),
            MeshConfig::default(),
            Arc::new(net.clone()),
        )
        .unwrap()
    }

    async fn joined(rx: &mut broadcast::Receiver<MeshEvent>) -> NodeId {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            if let MeshEvent::PeerJoined(id) = event {
                return id;
            }
        }
    }

    #[tokio::test]
    async fn test_direct_connection_promotes_both_sides() {
        let net = MemoryNetwork::new();
        let a = spawn(&net);
        let b = spawn(&net);
        let (mut a_events, mut b_events) = (a.subscribe(), b.subscribe());

        a.connect(&b).await.unwrap();

        assert_eq!(&joined(&mut a_events).await, b.id());
        assert_eq!(&joined(&mut b_events).await, a.id());
        assert_eq!(a.peers().await.unwrap(), vec![b.id().clone()]);
        assert_eq!(b.peers().await.unwrap(), vec![a.id().clone()]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_service() {
        let net = MemoryNetwork::new();
        let a = spawn(&net);
        a.shutdown();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(matches!(a.peers().await, Err(Error::ServiceStopped)));
    }

    #[tokio::test]
    async fn test_propose_unknown_key_fails() {
        let net = MemoryNetwork::new();
        let a = spawn(&net);
        let err = a.propose("missing", &1u32).await.unwrap_err();
        assert!(matches!(err, Error::UnknownDecision(_)));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let net = MemoryNetwork::new();
        let config = MeshConfig::default().with_target_consensus(2.0);
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        assert!(matches!(
            MeshService::spawn(Identity::generate(), config, Arc::new(net)),
            Err(Error::Config(_))
        ));
    }
}
