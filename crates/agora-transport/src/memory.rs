//! In-process simulation of the transport session primitive.
//!
//! [`MemoryNetwork`] is a switchboard: every session it creates registers
//! under a numeric uid, and session descriptions and candidates carry that uid
//! so the two ends of a negotiation can find each other. Two sessions are
//! linked (CONNECTED, channels open) once both sides are stable with local and
//! remote descriptions applied and each has accepted a candidate from the
//! other.
//!
//! The simulator follows the same rules a browser stack enforces: an answer
//! is only accepted with a local offer outstanding, candidates need a remote
//! description first, and a remote offer during an outstanding local offer
//! rolls the local offer back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::session::{
    IceCandidate, IceConnectionState, PeerConnectionState, SdpType, Session, SessionConfig,
    SessionDescription, SessionEvent, SessionEvents, SessionFactory, SignalingState,
};

/// Shared switchboard for in-process sessions.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Switchboard>,
}

#[derive(Default)]
struct Switchboard {
    next_uid: AtomicU64,
    sessions: Mutex<HashMap<u64, Weak<MemorySession>>>,
    /// Serializes linking so a pair is never linked twice.
    link: Mutex<()>,
}

impl Switchboard {
    fn session(&self, uid: u64) -> Option<Arc<MemorySession>> {
        lock(&self.sessions).get(&uid).and_then(Weak::upgrade)
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session directly, bypassing the [`SessionFactory`] trait object.
    pub fn open_session(&self, events: SessionEvents) -> Arc<MemorySession> {
        let uid = self.inner.next_uid.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Arc::new(MemorySession {
            uid,
            board: Arc::clone(&self.inner),
            events,
            state: Mutex::new(SessionState::default()),
        });
        lock(&self.inner.sessions).insert(uid, Arc::downgrade(&session));
        trace!(uid, "memory session created");
        session
    }

    /// All sessions that are still alive.
    pub fn sessions(&self) -> Vec<Arc<MemorySession>> {
        let mut sessions: Vec<_> = lock(&self.inner.sessions)
            .values()
            .filter_map(Weak::upgrade)
            .collect();
        sessions.sort_by_key(|s| s.uid);
        sessions
    }
}

impl SessionFactory for MemoryNetwork {
    fn create(&self, config: &SessionConfig, events: SessionEvents) -> Result<Arc<dyn Session>> {
        trace!(ice_servers = config.ice_servers.len(), "creating memory session");
        Ok(self.open_session(events))
    }
}

#[derive(Debug)]
struct Channel {
    label: String,
    open: bool,
    local: bool,
}

#[derive(Debug)]
struct SessionState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_uid: Option<u64>,
    remote_candidate: bool,
    peer: Option<Weak<MemorySession>>,
    channels: Vec<Channel>,
    negotiation_pending: bool,
    generation: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: PeerConnectionState::New,
            local: None,
            remote: None,
            remote_uid: None,
            remote_candidate: false,
            peer: None,
            channels: Vec::new(),
            negotiation_pending: false,
            generation: 0,
        }
    }
}

/// One simulated transport session.
pub struct MemorySession {
    uid: u64,
    board: Arc<Switchboard>,
    events: SessionEvents,
    state: Mutex<SessionState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn describe(uid: u64, generation: u64) -> String {
    format!("v=0\r\no=agora {uid} {generation} IN MEM\r\ns=-\r\n")
}

fn description_uid(sdp: &str) -> Result<u64> {
    sdp.lines()
        .find_map(|line| line.strip_prefix("o=agora "))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
        .ok_or_else(|| Error::MalformedDescription(sdp.to_string()))
}

fn candidate_uid(candidate: &str) -> Result<u64> {
    candidate
        .strip_prefix("candidate:")
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
        .ok_or_else(|| Error::UnknownCandidate(candidate.to_string()))
}

impl MemorySession {
    pub fn uid(&self) -> u64 {
        self.uid
    }

    /// Simulate a connectivity failure on this session and its peer.
    pub fn inject_failure(&self) {
        let peer = {
            let mut st = lock(&self.state);
            if st.connection != PeerConnectionState::Connected {
                return;
            }
            st.connection = PeerConnectionState::Failed;
            st.peer.as_ref().and_then(Weak::upgrade)
        };
        debug!(uid = self.uid, "injecting connectivity failure");
        self.emit_failure();
        if let Some(peer) = peer {
            lock(&peer.state).connection = PeerConnectionState::Failed;
            peer.emit_failure();
        }
    }

    fn emit(&self, event: SessionEvent) {
        // The owner may already be gone; nothing left to notify then.
        let _ = self.events.send(event);
    }

    fn emit_failure(&self) {
        self.emit(SessionEvent::IceStateChanged(IceConnectionState::Failed));
        self.emit(SessionEvent::StateChanged(PeerConnectionState::Failed));
    }

    fn candidate(&self, generation: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{} 1 udp 2130706431 memory {}", self.uid, generation),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        }
    }

    /// Remote uid if this side is ready to be linked.
    fn ready(&self) -> Option<u64> {
        let st = lock(&self.state);
        let ready = st.signaling == SignalingState::Stable
            && st.local.is_some()
            && st.remote.is_some()
            && st.remote_candidate;
        if ready {
            st.remote_uid
        } else {
            None
        }
    }

    fn try_connect(&self) {
        let _link = lock(&self.board.link);

        let Some(peer_uid) = self.ready() else {
            return;
        };
        if lock(&self.state).connection == PeerConnectionState::Connected {
            return;
        }
        let (Some(this), Some(peer)) = (self.board.session(self.uid), self.board.session(peer_uid))
        else {
            return;
        };
        if peer.ready() != Some(self.uid) {
            return;
        }

        debug!(local = self.uid, remote = peer_uid, "linking memory sessions");
        let ours = this.mark_connected(&peer);
        let theirs = peer.mark_connected(&this);
        this.emit_connected();
        peer.emit_connected();
        for label in ours {
            this.emit(SessionEvent::ChannelOpen { label: label.clone() });
            peer.accept_channel(label);
        }
        for label in theirs {
            peer.emit(SessionEvent::ChannelOpen { label: label.clone() });
            this.accept_channel(label);
        }
    }

    /// Record the link and return local channels that open with it.
    fn mark_connected(&self, peer: &Arc<MemorySession>) -> Vec<String> {
        let mut st = lock(&self.state);
        st.peer = Some(Arc::downgrade(peer));
        st.connection = PeerConnectionState::Connected;
        st.channels
            .iter_mut()
            .filter(|c| c.local && !c.open)
            .map(|c| {
                c.open = true;
                c.label.clone()
            })
            .collect()
    }

    fn emit_connected(&self) {
        self.emit(SessionEvent::StateChanged(PeerConnectionState::Connecting));
        self.emit(SessionEvent::IceStateChanged(IceConnectionState::Checking));
        self.emit(SessionEvent::IceStateChanged(IceConnectionState::Connected));
        self.emit(SessionEvent::StateChanged(PeerConnectionState::Connected));
    }

    fn accept_channel(&self, label: String) {
        {
            let mut st = lock(&self.state);
            if st.channels.iter().any(|c| c.label == label) {
                return;
            }
            st.channels.push(Channel {
                label: label.clone(),
                open: true,
                local: false,
            });
        }
        self.emit(SessionEvent::IncomingChannel {
            label: label.clone(),
        });
        self.emit(SessionEvent::ChannelOpen { label });
    }

    fn deliver(&self, label: &str, data: &[u8]) -> Result<()> {
        let open = lock(&self.state)
            .channels
            .iter()
            .any(|c| c.label == label && c.open);
        if !open {
            return Err(Error::ChannelNotOpen(label.to_string()));
        }
        self.emit(SessionEvent::ChannelMessage {
            label: label.to_string(),
            data: data.to_vec(),
        });
        Ok(())
    }

    fn remote_closed(&self) {
        let labels = {
            let mut st = lock(&self.state);
            st.peer = None;
            st.connection = PeerConnectionState::Disconnected;
            close_channels(&mut st)
        };
        for label in labels {
            self.emit(SessionEvent::ChannelClosed { label });
        }
        self.emit(SessionEvent::StateChanged(PeerConnectionState::Disconnected));
    }
}

fn close_channels(st: &mut SessionState) -> Vec<String> {
    st.channels
        .iter_mut()
        .filter(|c| c.open)
        .map(|c| {
            c.open = false;
            c.label.clone()
        })
        .collect()
}

#[async_trait]
impl Session for MemorySession {
    async fn set_local_description(&self) -> Result<SessionDescription> {
        let (desc, generation) = {
            let mut st = lock(&self.state);
            let kind = match st.signaling {
                SignalingState::Closed => return Err(Error::Closed),
                SignalingState::HaveLocalOffer => {
                    return st
                        .local
                        .clone()
                        .ok_or_else(|| Error::InvalidState("local offer missing".to_string()));
                }
                SignalingState::Stable => SdpType::Offer,
                SignalingState::HaveRemoteOffer => SdpType::Answer,
            };
            st.generation += 1;
            let desc = SessionDescription {
                kind,
                sdp: describe(self.uid, st.generation),
            };
            st.local = Some(desc.clone());
            st.signaling = match kind {
                SdpType::Offer => SignalingState::HaveLocalOffer,
                SdpType::Answer => SignalingState::Stable,
            };
            st.negotiation_pending = false;
            (desc, st.generation)
        };

        self.emit(SessionEvent::LocalCandidate(self.candidate(generation)));
        if desc.kind == SdpType::Answer {
            self.try_connect();
        }
        Ok(desc)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let uid = description_uid(&desc.sdp)?;
        let answered = {
            let mut st = lock(&self.state);
            match (desc.kind, st.signaling) {
                (_, SignalingState::Closed) => return Err(Error::Closed),
                (SdpType::Offer, SignalingState::HaveLocalOffer) => {
                    debug!(uid = self.uid, "remote offer rolls back local offer");
                    st.local = None;
                }
                (SdpType::Offer, _) => {}
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {}
                (SdpType::Answer, state) => {
                    return Err(Error::InvalidState(format!("answer received in {state:?}")));
                }
            }
            if st.remote_uid != Some(uid) {
                st.remote_candidate = false;
            }
            st.remote_uid = Some(uid);
            st.remote = Some(desc.clone());
            st.signaling = match desc.kind {
                SdpType::Offer => SignalingState::HaveRemoteOffer,
                SdpType::Answer => SignalingState::Stable,
            };
            desc.kind == SdpType::Answer
        };

        if answered {
            self.try_connect();
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let uid = candidate_uid(&candidate.candidate)?;
        {
            let mut st = lock(&self.state);
            if st.signaling == SignalingState::Closed {
                return Err(Error::Closed);
            }
            if st.remote.is_none() {
                return Err(Error::NoRemoteDescription);
            }
            if st.remote_uid != Some(uid) {
                return Err(Error::UnknownCandidate(candidate.candidate));
            }
            st.remote_candidate = true;
        }
        self.try_connect();
        Ok(())
    }

    fn local_description(&self) -> Option<SessionDescription> {
        lock(&self.state).local.clone()
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).connection
    }

    fn restart_ice(&self) {
        {
            let mut st = lock(&self.state);
            if st.signaling == SignalingState::Closed {
                return;
            }
            st.negotiation_pending = true;
        }
        debug!(uid = self.uid, "ice restart requested");
        self.emit(SessionEvent::NegotiationNeeded);
    }

    fn create_channel(&self, label: &str) -> Result<()> {
        let (peer, negotiate) = {
            let mut st = lock(&self.state);
            if st.signaling == SignalingState::Closed {
                return Err(Error::Closed);
            }
            if st.channels.iter().any(|c| c.label == label) {
                return Err(Error::InvalidState(format!("channel {label:?} already exists")));
            }
            let peer = match st.connection {
                PeerConnectionState::Connected => st.peer.as_ref().and_then(Weak::upgrade),
                _ => None,
            };
            st.channels.push(Channel {
                label: label.to_string(),
                open: peer.is_some(),
                local: true,
            });
            let negotiate = peer.is_none()
                && st.local.is_none()
                && st.remote.is_none()
                && !st.negotiation_pending;
            if negotiate {
                st.negotiation_pending = true;
            }
            (peer, negotiate)
        };

        if let Some(peer) = peer {
            self.emit(SessionEvent::ChannelOpen {
                label: label.to_string(),
            });
            peer.accept_channel(label.to_string());
        } else if negotiate {
            self.emit(SessionEvent::NegotiationNeeded);
        }
        Ok(())
    }

    fn send(&self, label: &str, data: &[u8]) -> Result<()> {
        let peer = {
            let st = lock(&self.state);
            if st.signaling == SignalingState::Closed {
                return Err(Error::Closed);
            }
            if !st.channels.iter().any(|c| c.label == label && c.open) {
                return Err(Error::ChannelNotOpen(label.to_string()));
            }
            st.peer.as_ref().and_then(Weak::upgrade).ok_or(Error::Closed)?
        };
        peer.deliver(label, data)
    }

    fn close(&self) {
        let (peer, labels) = {
            let mut st = lock(&self.state);
            if st.signaling == SignalingState::Closed {
                return;
            }
            st.signaling = SignalingState::Closed;
            st.connection = PeerConnectionState::Closed;
            let labels = close_channels(&mut st);
            (st.peer.take().and_then(|p| p.upgrade()), labels)
        };

        debug!(uid = self.uid, "memory session closed");
        for label in labels {
            self.emit(SessionEvent::ChannelClosed { label });
        }
        self.emit(SessionEvent::StateChanged(PeerConnectionState::Closed));
        if let Some(peer) = peer {
            peer.remote_closed();
        }
        lock(&self.board.sessions).remove(&self.uid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(net: &MemoryNetwork) -> (Arc<MemorySession>, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (net.open_session(tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn candidates(events: &[SessionEvent]) -> Vec<IceCandidate> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::LocalCandidate(c) => Some(c.clone()),
                _ => None,
            })
            .collect()
    }

    /// Full offer/answer/candidate exchange between `a` (offerer) and `b`.
    async fn negotiate(
        a: &MemorySession,
        a_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
        b: &MemorySession,
        b_rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let offer = a.set_local_description().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.set_local_description().await.unwrap();
        a.set_remote_description(answer).await.unwrap();

        for c in candidates(&drain(a_rx)) {
            b.add_ice_candidate(c).await.unwrap();
        }
        for c in candidates(&drain(b_rx)) {
            a.add_ice_candidate(c).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_channel_creation_requests_negotiation() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = session(&net);

        a.create_channel("ctl").unwrap();
        assert_eq!(drain(&mut a_rx), vec![SessionEvent::NegotiationNeeded]);

        // A second channel before negotiation does not request another round
        a.create_channel("data").unwrap();
        assert!(drain(&mut a_rx).is_empty());
        assert!(a.create_channel("ctl").is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_links_sessions() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = session(&net);
        let (b, mut b_rx) = session(&net);

        a.create_channel("ctl").unwrap();
        drain(&mut a_rx);
        negotiate(&a, &mut a_rx, &b, &mut b_rx).await;

        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);
        assert_eq!(a.signaling_state(), SignalingState::Stable);

        let a_events = drain(&mut a_rx);
        let b_events = drain(&mut b_rx);
        assert!(a_events.contains(&SessionEvent::ChannelOpen { label: "ctl".into() }));
        assert!(b_events.contains(&SessionEvent::IncomingChannel { label: "ctl".into() }));
        assert!(b_events.contains(&SessionEvent::ChannelOpen { label: "ctl".into() }));

        a.send("ctl", b"hello").unwrap();
        assert_eq!(
            drain(&mut b_rx),
            vec![SessionEvent::ChannelMessage {
                label: "ctl".into(),
                data: b"hello".to_vec()
            }]
        );
        b.send("ctl", b"back").unwrap();
        assert_eq!(drain(&mut a_rx).len(), 1);
    }

    #[tokio::test]
    async fn test_answer_without_offer_rejected() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = session(&net);
        let (b, _b_rx) = session(&net);

        let offer = a.set_local_description().await.unwrap();
        b.set_remote_description(offer).await.unwrap();
        let answer = b.set_local_description().await.unwrap();

        let err = b.set_remote_description(answer).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_candidate_requires_remote_description() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = session(&net);
        let (b, _b_rx) = session(&net);

        a.set_local_description().await.unwrap();
        let c = candidates(&drain(&mut a_rx)).remove(0);
        assert_eq!(b.add_ice_candidate(c).await, Err(Error::NoRemoteDescription));
    }

    #[tokio::test]
    async fn test_foreign_candidate_rejected() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = session(&net);
        let (b, _b_rx) = session(&net);
        let (c, mut c_rx) = session(&net);

        let offer = a.set_local_description().await.unwrap();
        b.set_remote_description(offer).await.unwrap();

        c.set_local_description().await.unwrap();
        let stray = candidates(&drain(&mut c_rx)).remove(0);
        assert!(matches!(
            b.add_ice_candidate(stray).await,
            Err(Error::UnknownCandidate(_))
        ));
    }

    #[tokio::test]
    async fn test_remote_offer_rolls_back_local_offer() {
        let net = MemoryNetwork::new();
        let (a, _a_rx) = session(&net);
        let (b, _b_rx) = session(&net);

        a.set_local_description().await.unwrap();
        let offer = b.set_local_description().await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveLocalOffer);

        a.set_remote_description(offer).await.unwrap();
        assert_eq!(a.signaling_state(), SignalingState::HaveRemoteOffer);
        assert!(a.local_description().is_none());
    }

    #[tokio::test]
    async fn test_failure_and_restart_reconnects() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = session(&net);
        let (b, mut b_rx) = session(&net);

        a.create_channel("ctl").unwrap();
        negotiate(&a, &mut a_rx, &b, &mut b_rx).await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        a.inject_failure();
        assert_eq!(b.connection_state(), PeerConnectionState::Failed);
        assert!(drain(&mut b_rx)
            .contains(&SessionEvent::StateChanged(PeerConnectionState::Failed)));

        a.restart_ice();
        assert!(drain(&mut a_rx).contains(&SessionEvent::NegotiationNeeded));
        negotiate(&a, &mut a_rx, &b, &mut b_rx).await;
        assert_eq!(a.connection_state(), PeerConnectionState::Connected);
        assert_eq!(b.connection_state(), PeerConnectionState::Connected);

        // Channels survive the restart
        a.send("ctl", b"still here").unwrap();
    }

    #[tokio::test]
    async fn test_close_propagates_to_peer() {
        let net = MemoryNetwork::new();
        let (a, mut a_rx) = session(&net);
        let (b, mut b_rx) = session(&net);

        a.create_channel("ctl").unwrap();
        negotiate(&a, &mut a_rx, &b, &mut b_rx).await;
        drain(&mut b_rx);

        a.close();
        let events = drain(&mut b_rx);
        assert!(events.contains(&SessionEvent::ChannelClosed { label: "ctl".into() }));
        assert_eq!(b.connection_state(), PeerConnectionState::Disconnected);
        assert_eq!(a.send("ctl", b"x"), Err(Error::Closed));
        assert_eq!(net.sessions().len(), 1);
    }

    #[test]
    fn test_description_parsing() {
        assert_eq!(description_uid(&describe(42, 3)).unwrap(), 42);
        assert!(description_uid("v=0\r\n").is_err());
        assert_eq!(candidate_uid("candidate:7 1 udp").unwrap(), 7);
        assert!(candidate_uid("garbage").is_err());
    }
}
