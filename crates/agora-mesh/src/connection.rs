//! Connection negotiation over one transport session.
//!
//! Both sides run the same state machine ("perfect negotiation"). A side is
//! impolite while it is producing an offer, and an incoming offer that
//! collides with a local one is dropped by the impolite side. When both
//! offers are already outstanding, the tie is broken by comparing the two
//! descriptions, so exactly one side applies the other's offer whatever the
//! arrival order.

use std::fmt;
use std::sync::Arc;

use agora_transport::{
    IceCandidate, IceConnectionState, PeerConnectionState, Session, SessionDescription,
    SignalingState,
};
use tokio::sync::watch;
use tracing::{debug, error, warn};

use crate::error::Result;

/// Observable connection state, derived from the session's connectivity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Broken,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::New => write!(f, "NEW"),
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Broken => write!(f, "BROKEN"),
        }
    }
}

impl ConnectionState {
    /// Map a transport connectivity state; `None` leaves the state unchanged.
    pub fn from_transport(state: PeerConnectionState) -> Option<Self> {
        match state {
            PeerConnectionState::New => None,
            PeerConnectionState::Connecting => Some(Self::Connecting),
            PeerConnectionState::Connected => Some(Self::Connected),
            PeerConnectionState::Failed
            | PeerConnectionState::Disconnected
            | PeerConnectionState::Closed => Some(Self::Broken),
        }
    }
}

/// Outgoing signaling produced by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Session(SessionDescription),
    Candidate(IceCandidate),
}

/// Delivers signaling to the remote side by whatever path is available.
pub type SignalHandler = Arc<dyn Fn(Signal) + Send + Sync>;

/// Whether an incoming description must be discarded as a lost glare.
pub fn should_ignore_offer(
    making_offer: bool,
    signaling: SignalingState,
    local: Option<&SessionDescription>,
    incoming: &SessionDescription,
) -> bool {
    let collision = incoming.is_offer() && (making_offer || signaling != SignalingState::Stable);
    if !collision {
        return false;
    }
    if making_offer {
        return true;
    }
    match (signaling, local) {
        // Both offers are out; the greater description wins.
        (SignalingState::HaveLocalOffer, Some(local)) if local.is_offer() => {
            local.sdp > incoming.sdp
        }
        _ => false,
    }
}

/// One negotiated transport session to one remote peer.
pub struct Connection {
    session: Arc<dyn Session>,
    signal: SignalHandler,
    making_offer: bool,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    pub fn new(session: Arc<dyn Session>, signal: SignalHandler) -> Self {
        let (state, _) = watch::channel(ConnectionState::New);
        Self {
            session,
            signal,
            making_offer: false,
            state,
        }
    }

    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Produce and send a local offer.
    pub async fn on_negotiation_needed(&mut self) {
        self.making_offer = true;
        match self.session.set_local_description().await {
            Ok(desc) => (self.signal)(Signal::Session(desc)),
            Err(e) => error!("Failed to create local offer: {}", e),
        }
        self.making_offer = false;
    }

    pub fn on_local_candidate(&self, candidate: IceCandidate) {
        (self.signal)(Signal::Candidate(candidate));
    }

    pub fn on_ice_state(&self, state: IceConnectionState) {
        if state == IceConnectionState::Failed {
            debug!("ICE failed, restarting");
            self.session.restart_ice();
        }
    }

    /// Apply a transport state change. Returns the new state if it changed.
    pub fn on_connection_state(&mut self, state: PeerConnectionState) -> Option<ConnectionState> {
        let next = ConnectionState::from_transport(state)?;
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        changed.then_some(next)
    }

    /// Handle a remote description; answers an applied offer.
    pub async fn handle_session_description(&mut self, desc: SessionDescription) -> Result<()> {
        let local = self.session.local_description();
        if should_ignore_offer(
            self.making_offer,
            self.session.signaling_state(),
            local.as_ref(),
            &desc,
        ) {
            debug!("Ignoring colliding offer (local offer wins)");
            return Ok(());
        }

        let is_offer = desc.is_offer();
        self.session.set_remote_description(desc).await?;

        if is_offer {
            let answer = self.session.set_local_description().await?;
            (self.signal)(Signal::Session(answer));
        }
        Ok(())
    }

    /// Apply a remote candidate; failures are logged and swallowed.
    pub async fn add_ice_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.session.add_ice_candidate(candidate).await {
            warn!("Error adding received ICE candidate: {}", e);
        }
    }

    pub fn close(&self) {
        self.session.close();
    }
}
