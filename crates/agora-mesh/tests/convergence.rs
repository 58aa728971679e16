//! Whole-mesh behaviour over the in-process transport.
//!
//! Peers join through a single introducer and must end up fully connected;
//! decisions proposed on the closed mesh must reach quorum (or not) the same
//! way on every peer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora_mesh::{
    DeclineReason, Decision, Identity, MeshConfig, MeshEvent, MeshHandle, MeshService, NodeId,
};
use agora_transport::MemoryNetwork;
use tokio::sync::broadcast::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(10);

struct Peer {
    handle: MeshHandle,
    events: broadcast::Receiver<MeshEvent>,
    log: mpsc::UnboundedReceiver<String>,
}

impl Peer {
    fn id(&self) -> &NodeId {
        self.handle.id()
    }

    async fn next_event<F>(&mut self, mut f: F) -> MeshEvent
    where
        F: FnMut(&MeshEvent) -> bool,
    {
        timeout(WAIT, async {
            loop {
                let event = self.events.recv().await.unwrap();
                if f(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for mesh event")
    }

    async fn next_log(&mut self) -> String {
        timeout(WAIT, self.log.recv())
            .await
            .expect("timed out waiting for handler")
            .unwrap()
    }
}

/// A peer voting `vote` on every "motion" attempt.
fn spawn_peer(net: &MemoryNetwork, vote: bool) -> Peer {
    let handle = MeshService::spawn(
        Identity::generate(),
        MeshConfig::default(),
        Arc::new(net.clone()),
    )
    .unwrap();
    let events = handle.subscribe();

    let (tx, log) = mpsc::unbounded_channel();
    let (accepted, declined, foreign) = (tx.clone(), tx.clone(), tx);
    handle
        .register_decision(
            Decision::new("motion", move |_: String| async move { vote })
                .on_accept(move |m: String| {
                    let tx = accepted.clone();
                    async move {
                        let _ = tx.send(format!("accept {}", m));
                    }
                })
                .on_decline(move |_| {
                    let tx = declined.clone();
                    async move {
                        let _ = tx.send("decline".to_string());
                    }
                })
                .on_foreign_accept(move |m: String, source| {
                    let tx = foreign.clone();
                    async move {
                        let _ = tx.send(format!("foreign {} from {}", m, source));
                    }
                }),
        )
        .unwrap();

    Peer {
        handle,
        events,
        log,
    }
}

async fn wait_for_full_mesh(peers: &[&MeshHandle]) {
    let ok = timeout(WAIT, async {
        loop {
            let mut complete = true;
            for peer in peers {
                let mut expected: Vec<NodeId> = peers
                    .iter()
                    .filter(|p| p.id() != peer.id())
                    .map(|p| p.id().clone())
                    .collect();
                expected.sort();
                if peer.peers().await.unwrap() != expected {
                    complete = false;
                    break;
                }
            }
            if complete {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(ok.is_ok(), "mesh did not close");
}

/// Everyone joins through `votes[0]`'s peer, one at a time.
async fn mesh(net: &MemoryNetwork, votes: &[bool]) -> Vec<Peer> {
    let mut peers: Vec<Peer> = Vec::new();
    for &vote in votes {
        let peer = spawn_peer(net, vote);
        if let Some(introducer) = peers.first() {
            peer.handle.connect(&introducer.handle).await.unwrap();
        }
        peers.push(peer);
        let handles: Vec<&MeshHandle> = peers.iter().map(|p| &p.handle).collect();
        wait_for_full_mesh(&handles).await;
    }
    peers
}

#[tokio::test]
async fn test_newcomer_reaches_everyone_through_one_peer() {
    let net = MemoryNetwork::new();
    let mut peers = mesh(&net, &[true, true, true, true]).await;

    // Q only knows the introducer
    let q = spawn_peer(&net, true);
    q.handle.connect(&peers[0].handle).await.unwrap();

    let mut handles: Vec<&MeshHandle> = peers.iter().map(|p| &p.handle).collect();
    handles.push(&q.handle);
    wait_for_full_mesh(&handles).await;

    for peer in peers.iter_mut().skip(1) {
        let joined = peer
            .next_event(|e| matches!(e, MeshEvent::PeerJoined(id) if id == q.id()))
            .await;
        assert_eq!(joined, MeshEvent::PeerJoined(q.id().clone()));
    }
}

#[tokio::test]
async fn test_two_of_three_applies_everywhere() {
    let net = MemoryNetwork::new();
    let mut peers = mesh(&net, &[true, true, true, false]).await;
    let proposer = peers[0].id().clone();

    let attempt = peers[0].handle.propose("motion", &"lights".to_string()).await.unwrap();

    let accepted = peers[0]
        .next_event(|e| matches!(e, MeshEvent::DecisionAccepted { .. }))
        .await;
    assert_eq!(
        accepted,
        MeshEvent::DecisionAccepted {
            attempt: attempt.clone(),
            key: "motion".to_string()
        }
    );
    assert_eq!(peers[0].next_log().await, "accept lights");

    for peer in peers.iter_mut().skip(1) {
        let applied = peer
            .next_event(|e| matches!(e, MeshEvent::ActionApplied { .. }))
            .await;
        assert_eq!(
            applied,
            MeshEvent::ActionApplied {
                attempt: attempt.clone(),
                key: "motion".to_string(),
                source: proposer.clone()
            }
        );
        assert_eq!(
            peer.next_log().await,
            format!("foreign lights from {}", proposer)
        );
    }
}

#[tokio::test]
async fn test_one_of_three_declines_without_action() {
    let net = MemoryNetwork::new();
    let mut peers = mesh(&net, &[true, true, false, false]).await;

    let attempt = peers[0].handle.propose("motion", &"heating".to_string()).await.unwrap();

    let declined = peers[0]
        .next_event(|e| matches!(e, MeshEvent::DecisionDeclined { .. }))
        .await;
    let MeshEvent::DecisionDeclined { attempt: id, reason, .. } = declined else {
        unreachable!();
    };
    assert_eq!(id, attempt);
    assert!(matches!(reason, DeclineReason::BelowThreshold { .. }));
    assert_eq!(peers[0].next_log().await, "decline");

    tokio::time::sleep(Duration::from_millis(100)).await;
    for peer in peers.iter_mut().skip(1) {
        assert!(peer.log.try_recv().is_err(), "no action may be applied");
    }
}

#[tokio::test]
async fn test_lone_peer_declines() {
    let net = MemoryNetwork::new();
    let mut peer = spawn_peer(&net, true);
    peer.handle.propose("motion", &"x".to_string()).await.unwrap();
    let declined = peer
        .next_event(|e| matches!(e, MeshEvent::DecisionDeclined { .. }))
        .await;
    assert!(matches!(
        declined,
        MeshEvent::DecisionDeclined {
            reason: DeclineReason::NoMembers,
            ..
        }
    ));
}

#[tokio::test]
async fn test_attempts_validated_in_arrival_order() {
    let net = MemoryNetwork::new();
    let proposer = spawn_peer(&net, true);

    let order = Arc::new(Mutex::new(Vec::new()));
    let voter = MeshService::spawn(
        Identity::generate(),
        MeshConfig::default(),
        Arc::new(net.clone()),
    )
    .unwrap();
    let record = Arc::clone(&order);
    voter
        .register_decision(Decision::new("motion", move |m: String| {
            let order = Arc::clone(&record);
            async move {
                order.lock().unwrap().push(format!("start {}", m));
                if m == "slow" {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                order.lock().unwrap().push(format!("end {}", m));
                true
            }
        }))
        .unwrap();

    voter.connect(&proposer.handle).await.unwrap();
    wait_for_full_mesh(&[&proposer.handle, &voter]).await;

    let mut events = proposer.handle.subscribe();
    proposer.handle.propose("motion", &"slow".to_string()).await.unwrap();
    proposer.handle.propose("motion", &"fast".to_string()).await.unwrap();

    let mut accepted = 0;
    timeout(WAIT, async {
        while accepted < 2 {
            if let MeshEvent::DecisionAccepted { .. } = events.recv().await.unwrap() {
                accepted += 1;
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(
        *order.lock().unwrap(),
        vec!["start slow", "end slow", "start fast", "end fast"]
    );
}

#[tokio::test]
async fn test_departed_peer_is_dropped() {
    let net = MemoryNetwork::new();
    let mut peers = mesh(&net, &[true, true, true]).await;
    let gone = peers.pop().unwrap();
    gone.handle.shutdown();

    for peer in peers.iter_mut() {
        let left = peer
            .next_event(|e| matches!(e, MeshEvent::PeerLeft(_)))
            .await;
        assert_eq!(left, MeshEvent::PeerLeft(gone.id().clone()));
    }
    let handles: Vec<&MeshHandle> = peers.iter().map(|p| &p.handle).collect();
    wait_for_full_mesh(&handles).await;
}

#[tokio::test]
async fn test_concurrent_joins_settle_without_churn() {
    let net = MemoryNetwork::new();
    let mut peers: Vec<Peer> = (0..6).map(|_| spawn_peer(&net, true)).collect();

    // Everyone joins the first peer at once
    let introducer = peers[0].handle.clone();
    let joins = peers[1..].iter().map(|p| p.handle.connect(&introducer));
    for joined in futures::future::join_all(joins).await {
        joined.unwrap();
    }
    let handles: Vec<&MeshHandle> = peers.iter().map(|p| &p.handle).collect();
    wait_for_full_mesh(&handles).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    let ids: Vec<NodeId> = peers.iter().map(|p| p.id().clone()).collect();
    for peer in peers.iter_mut() {
        let mut joined: HashMap<NodeId, usize> = HashMap::new();
        loop {
            match peer.events.try_recv() {
                Ok(MeshEvent::PeerJoined(id)) => *joined.entry(id).or_default() += 1,
                Ok(MeshEvent::PeerLeft(id)) => panic!("{} saw {} leave", peer.id(), id),
                Ok(_) => {}
                Err(TryRecvError::Empty) => break,
                Err(e) => panic!("event stream broke: {}", e),
            }
        }
        for id in ids.iter().filter(|id| *id != peer.id()) {
            assert_eq!(joined.get(id), Some(&1), "{} must see {} join once", peer.id(), id);
        }
        assert_eq!(joined.len(), ids.len() - 1);
    }
}
