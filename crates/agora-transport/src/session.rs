//! The transport session primitive.
//!
//! A [`Session`] is one negotiated point-to-point transport to a remote peer:
//! it produces and consumes session descriptions, consumes connectivity
//! candidates, and carries any number of labelled, reliable, ordered
//! byte-channels. Everything the session wants to tell its owner arrives as a
//! [`SessionEvent`] on the channel handed to [`SessionFactory::create`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// Kind of a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// A local or remote session description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpType::Offer
    }
}

/// A connectivity candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

/// Offer/answer negotiation state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Aggregate connectivity state reported by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// State of the connectivity-check machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

/// Notifications emitted by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The session needs a new offer/answer round.
    NegotiationNeeded,
    /// A local candidate is ready to be sent to the remote side.
    LocalCandidate(IceCandidate),
    IceStateChanged(IceConnectionState),
    StateChanged(PeerConnectionState),
    /// The remote side created a byte-channel with this label.
    IncomingChannel { label: String },
    ChannelOpen { label: String },
    ChannelMessage { label: String, data: Vec<u8> },
    ChannelClosed { label: String },
}

/// Sink for session events.
pub type SessionEvents = mpsc::UnboundedSender<SessionEvent>;

/// A relay/reflection server entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }
}

/// Configuration passed to every new session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub ice_servers: Vec<IceServer>,
}

/// One transport session to a remote peer.
#[async_trait]
pub trait Session: Send + Sync {
    /// Create and apply a local description.
    ///
    /// Produces an offer in the stable state and an answer after a remote
    /// offer has been applied.
    async fn set_local_description(&self) -> Result<SessionDescription>;

    /// Apply a remote description. A remote offer received while a local
    /// offer is outstanding rolls the local offer back.
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    /// Apply a remote connectivity candidate.
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    fn local_description(&self) -> Option<SessionDescription>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    /// Start a new connectivity round; emits [`SessionEvent::NegotiationNeeded`].
    fn restart_ice(&self);

    /// Create a labelled byte-channel. Open/close are reported as events.
    fn create_channel(&self, label: &str) -> Result<()>;

    /// Send bytes on an open byte-channel.
    fn send(&self, label: &str, data: &[u8]) -> Result<()>;

    fn close(&self);
}

/// Creates sessions for a peer.
pub trait SessionFactory: Send + Sync {
    fn create(&self, config: &SessionConfig, events: SessionEvents) -> Result<Arc<dyn Session>>;
}
