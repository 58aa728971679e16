//! Addressed control messages and the byte-channel that carries them.
//!
//! Every control message names its origin, its ultimate target and an
//! optional relay hop. A channel only ever writes to its own wire; whoever
//! sends picks the channel of the next hop (the relay if there is one,
//! otherwise the target).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use agora_transport::Session;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::connection::ConnectionState;
use crate::decision::{DecisionAction, DecisionAttempt, DecisionResponse};
use crate::error::{Error, Result};
use crate::identity::{NodeId, PeerInfo};
use crate::network::ConnectionPacket;

/// Relay hop of a control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<NodeId>", into = "Option<NodeId>")]
pub enum RelayVia {
    Direct,
    Via(NodeId),
}

impl From<Option<NodeId>> for RelayVia {
    fn from(value: Option<NodeId>) -> Self {
        value.map_or(Self::Direct, Self::Via)
    }
}

impl From<RelayVia> for Option<NodeId> {
    fn from(value: RelayVia) -> Self {
        match value {
            RelayVia::Direct => None,
            RelayVia::Via(id) => Some(id),
        }
    }
}

impl RelayVia {
    pub fn is(&self, id: &NodeId) -> bool {
        matches!(self, Self::Via(via) if via == id)
    }
}

impl fmt::Display for RelayVia {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Via(id) => write!(f, "{}", id),
        }
    }
}

/// Control message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementPayload {
    /// Announces a newly promoted peer
    NewPeer(NodeId),
    /// Signaling relayed between two peers that are not connected yet
    ConnPacket(ConnectionPacket),
    /// Post-connect identity exchange
    PeerInfo(PeerInfo),
    DecisionAttempt(DecisionAttempt),
    DecisionResponse(DecisionResponse),
    DecisionAction(DecisionAction),
}

impl ManagementPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NewPeer(_) => "NEW_PEER",
            Self::ConnPacket(_) => "CONN_PACKET",
            Self::PeerInfo(_) => "PEER_INFO",
            Self::DecisionAttempt(_) => "DECISION_ATTEMPT",
            Self::DecisionResponse(_) => "DECISION_RESPONSE",
            Self::DecisionAction(_) => "DECISION_ACTION",
        }
    }
}

/// An addressed control message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagementMessage {
    pub source: NodeId,
    pub target: NodeId,
    pub relay_via: RelayVia,
    #[serde(flatten)]
    pub payload: ManagementPayload,
}

impl ManagementMessage {
    /// A message sent straight to its target.
    pub fn direct(source: NodeId, target: NodeId, payload: ManagementPayload) -> Self {
        Self {
            source,
            target,
            relay_via: RelayVia::Direct,
            payload,
        }
    }

    /// Peer whose channel carries this message next.
    pub fn next_hop(&self) -> &NodeId {
        match &self.relay_via {
            RelayVia::Via(id) => id,
            RelayVia::Direct => &self.target,
        }
    }
}

/// What to do with a received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Addressed to us
    Deliver,
    /// We are the relay hop; pass it on to the target
    Forward,
    /// Neither; drop it
    Stray,
}

pub fn route(msg: &ManagementMessage, local: &NodeId) -> Route {
    if msg.target == *local {
        Route::Deliver
    } else if msg.relay_via.is(local) {
        Route::Forward
    } else {
        Route::Stray
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    New,
    Connecting,
    Open,
    Broken,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelState::New => write!(f, "NEW"),
            ChannelState::Connecting => write!(f, "CONNECTING"),
            ChannelState::Open => write!(f, "OPEN"),
            ChannelState::Broken => write!(f, "BROKEN"),
        }
    }
}

/// Control channel bound to one connection.
///
/// Exactly one side calls [`ManagementChannel::open`]; the other side binds
/// when the transport reports the incoming byte-channel. Messages sent before
/// the channel opens are queued and flushed on open.
pub struct ManagementChannel {
    label: String,
    session: Arc<dyn Session>,
    state: ChannelState,
    bound: bool,
    peer: Option<NodeId>,
    outbox: VecDeque<ManagementMessage>,
}

impl ManagementChannel {
    pub fn new(label: impl Into<String>, session: Arc<dyn Session>) -> Self {
        Self {
            label: label.into(),
            session,
            state: ChannelState::New,
            bound: false,
            peer: None,
            outbox: VecDeque::new(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ChannelState::Open
    }

    pub fn peer(&self) -> Option<&NodeId> {
        self.peer.as_ref()
    }

    /// Set the peer this channel talks to.
    pub fn bind_peer(&mut self, peer: NodeId) {
        self.peer = Some(peer);
    }

    /// Create the byte-channel. Only the initiating side calls this.
    pub fn open(&mut self) -> Result<()> {
        if self.bound {
            return Err(Error::Channel(format!(
                "management channel {} already opened",
                self.label
            )));
        }
        self.session.create_channel(&self.label)?;
        self.bound = true;
        self.advance(ChannelState::Connecting);
        Ok(())
    }

    /// Mirror connection progress while the byte-channel is not open yet.
    pub fn on_connection_state(&mut self, state: ConnectionState) {
        if state == ConnectionState::Connecting && self.state == ChannelState::New {
            self.advance(ChannelState::Connecting);
        }
    }

    /// The remote side created a byte-channel.
    pub fn on_incoming_channel(&mut self, label: &str) -> bool {
        if label != self.label {
            return false;
        }
        if self.bound {
            debug!("Incoming channel {} already bound", label);
        }
        self.bound = true;
        true
    }

    /// The byte-channel opened; flush queued messages.
    pub fn on_open(&mut self, label: &str) -> Result<bool> {
        if label != self.label || self.state == ChannelState::Broken {
            return Ok(false);
        }
        self.advance(ChannelState::Open);
        while let Some(msg) = self.outbox.pop_front() {
            self.write(&msg)?;
        }
        Ok(true)
    }

    /// Decode a byte-channel message. Undecodable data is dropped.
    pub fn on_message(&self, label: &str, data: &[u8]) -> Option<ManagementMessage> {
        if label != self.label {
            return None;
        }
        match serde_json::from_slice(data) {
            Ok(msg) => Some(msg),
            Err(e) => {
                warn!("Received invalid management data on {}: {}", label, e);
                None
            }
        }
    }

    /// The byte-channel closed. Returns true if this broke the channel.
    pub fn on_closed(&mut self, label: &str) -> bool {
        if label != self.label || self.state == ChannelState::Broken {
            return false;
        }
        self.advance(ChannelState::Broken);
        self.outbox.clear();
        true
    }

    /// Send a message along this channel's wire.
    pub fn send(&mut self, msg: ManagementMessage) -> Result<()> {
        let Some(peer) = &self.peer else {
            return Err(Error::Channel(format!(
                "management channel {} has no bound peer",
                self.label
            )));
        };
        if msg.target != *peer && !msg.relay_via.is(peer) {
            return Err(Error::Misaddressed {
                target: msg.target,
                relay_via: msg.relay_via.to_string(),
                peer: peer.to_string(),
            });
        }

        match self.state {
            ChannelState::Open => self.write(&msg),
            ChannelState::New | ChannelState::Connecting => {
                self.outbox.push_back(msg);
                Ok(())
            }
            ChannelState::Broken => Err(Error::Channel(format!(
                "management channel {} is broken",
                self.label
            ))),
        }
    }

    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    fn write(&self, msg: &ManagementMessage) -> Result<()> {
        let data = serde_json::to_vec(msg)?;
        self.session.send(&self.label, &data)?;
        Ok(())
    }

    fn advance(&mut self, next: ChannelState) {
        if self.state != next {
            debug!("Management channel {}: {} -> {}", self.label, self.state, next);
            self.state = next;
        }
    }
}
