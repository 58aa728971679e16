//! Propose / vote / act group decisions.
//!
//! A proposer broadcasts an attempt to every member and collects one
//! response per member. When all expected responses are in, it either
//! declines (too few yes votes) or broadcasts an action bundling the attempt
//! with every response, and accepts locally. Voters validate incoming
//! attempts one at a time in arrival order and sign their yes votes. Every
//! peer re-verifies a received action before applying it.

mod action;
mod attempt;
mod definition;
mod queue;
mod response;
mod threshold;

pub use action::{DecisionAction, InvalidAction};
pub use attempt::{AttemptId, DecisionAttempt};
pub use definition::{Decision, ErasedDecision};
pub use queue::DecisionQueue;
pub use response::DecisionResponse;
pub use threshold::{consensus_ratio, meets_consensus, votes_needed, DEFAULT_TARGET_CONSENSUS};

use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{Error, Result};
use crate::event::{DeclineReason, MeshEvent};
use crate::identity::{Identity, NodeId};
use crate::management::{ManagementMessage, ManagementPayload};
use crate::network::Network;

/// What the decision manager needs from the mesh.
pub trait Membership {
    fn local(&self) -> &Identity;

    /// Peers expected to vote.
    fn members(&self) -> Vec<NodeId>;

    /// Identity able to verify `id`'s signatures.
    fn resolve(&self, id: &NodeId) -> Option<&Identity>;

    fn send(&mut self, msg: ManagementMessage) -> Result<()>;

    fn broadcast(&mut self, payload: ManagementPayload);
}

impl Membership for Network {
    fn local(&self) -> &Identity {
        Network::local(self)
    }

    fn members(&self) -> Vec<NodeId> {
        self.peers()
    }

    fn resolve(&self, id: &NodeId) -> Option<&Identity> {
        Network::resolve(self, id)
    }

    fn send(&mut self, msg: ManagementMessage) -> Result<()> {
        Network::send(self, msg)
    }

    fn broadcast(&mut self, payload: ManagementPayload) {
        Network::broadcast(self, payload, None)
    }
}

/// Completion of work the manager started off the event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Validated { attempt: AttemptId, accepted: bool },
    TimedOut(AttemptId),
}

/// Posts a [`Wakeup`] back to the task that owns the manager.
pub type WakeupSink = Arc<dyn Fn(Wakeup) + Send + Sync>;

/// Applied attempts kept for replay protection.
const APPLIED_HISTORY: usize = 4096;

/// Recently applied attempt ids, oldest evicted first.
struct AppliedLog {
    order: VecDeque<AttemptId>,
    seen: HashSet<AttemptId>,
    limit: usize,
}

impl AppliedLog {
    fn new(limit: usize) -> Self {
        Self {
            order: VecDeque::new(),
            seen: HashSet::new(),
            limit,
        }
    }

    fn contains(&self, id: &AttemptId) -> bool {
        self.seen.contains(id)
    }

    fn insert(&mut self, id: AttemptId) {
        if !self.seen.insert(id.clone()) {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > self.limit {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

struct Proposal {
    attempt: DecisionAttempt,
    expected: HashSet<NodeId>,
    responses: Vec<DecisionResponse>,
}

pub struct DecisionManager {
    target_consensus: f64,
    default_timeout: Option<Duration>,
    decisions: HashMap<String, Arc<dyn ErasedDecision>>,
    /// Our own attempts still collecting responses
    proposals: HashMap<AttemptId, Proposal>,
    queue: DecisionQueue,
    applied: AppliedLog,
    wake: WakeupSink,
    events: broadcast::Sender<MeshEvent>,
}

impl DecisionManager {
    pub fn new(
        config: &MeshConfig,
        wake: WakeupSink,
        events: broadcast::Sender<MeshEvent>,
    ) -> Self {
        Self {
            target_consensus: config.target_consensus,
            default_timeout: config.decision_timeout,
            decisions: HashMap::new(),
            proposals: HashMap::new(),
            queue: DecisionQueue::new(),
            applied: AppliedLog::new(APPLIED_HISTORY),
            wake,
            events,
        }
    }

    pub fn target_consensus(&self) -> f64 {
        self.target_consensus
    }

    pub fn register(&mut self, decision: Arc<dyn ErasedDecision>) {
        let key = decision.key().to_string();
        if self.decisions.insert(key.clone(), decision).is_some() {
            warn!("Decision {} registered twice, replacing", key);
        }
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.decisions.contains_key(key)
    }

    /// Attempts of ours still waiting for responses.
    pub fn pending(&self) -> usize {
        self.proposals.len()
    }

    /// Actions remembered for replay protection.
    pub fn applied(&self) -> usize {
        self.applied.len()
    }

    /// Propose `data` under `key` to every current member.
    pub fn propose<M: Membership>(
        &mut self,
        mesh: &mut M,
        key: &str,
        data: Value,
    ) -> Result<AttemptId> {
        let decision = self
            .decisions
            .get(key)
            .cloned()
            .ok_or_else(|| Error::UnknownDecision(key.to_string()))?;

        let attempt = DecisionAttempt::new(key, mesh.local().id().clone(), data);
        let id = attempt.id.clone();
        let members = mesh.members();

        if members.is_empty() {
            info!("Decision {} ({}) has nobody to vote, declining", key, id);
            tokio::spawn(decision.decline(id.clone()));
            self.emit(MeshEvent::DecisionDeclined {
                attempt: id.clone(),
                key: key.to_string(),
                reason: DeclineReason::NoMembers,
            });
            return Ok(id);
        }

        if let Some(timeout) = decision.timeout().or(self.default_timeout) {
            let wake = Arc::clone(&self.wake);
            let timer = id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                wake(Wakeup::TimedOut(timer));
            });
        }

        info!("Proposing {} ({}) to {} members", key, id, members.len());
        self.proposals.insert(
            id.clone(),
            Proposal {
                attempt: attempt.clone(),
                expected: members.into_iter().collect(),
                responses: Vec::new(),
            },
        );
        mesh.broadcast(ManagementPayload::DecisionAttempt(attempt));
        Ok(id)
    }

    /// Handle decision payloads; returns false for anything else.
    pub fn handle_message<M: Membership>(&mut self, mesh: &mut M, msg: &ManagementMessage) -> bool {
        match &msg.payload {
            ManagementPayload::DecisionAttempt(attempt) => {
                self.on_attempt(&msg.source, attempt.clone())
            }
            ManagementPayload::DecisionResponse(response) => {
                self.on_response(mesh, &msg.source, response.clone())
            }
            ManagementPayload::DecisionAction(action) => self.on_action(mesh, action),
            _ => return false,
        }
        true
    }

    pub fn on_wakeup<M: Membership>(&mut self, mesh: &mut M, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Validated { attempt, accepted } => self.on_validated(mesh, attempt, accepted),
            Wakeup::TimedOut(attempt) => self.on_timeout(attempt),
        }
    }

    fn on_attempt(&mut self, source: &NodeId, attempt: DecisionAttempt) {
        if attempt.source_node != *source {
            warn!(
                "Attempt {} claims source {} but came from {}",
                attempt.id, attempt.source_node, source
            );
            return;
        }
        debug!("Queueing attempt {} ({}) from {}", attempt.id, attempt.key, source);
        let next = self.queue.enqueue(attempt);
        self.start_validation(next);
    }

    /// Start validating `next`, skipping attempts with unknown keys.
    fn start_validation(&mut self, mut next: Option<DecisionAttempt>) {
        while let Some(attempt) = next {
            let Some(decision) = self.decisions.get(&attempt.key) else {
                warn!("Invalid decision attempt key ({})", attempt.key);
                next = self.queue.finish(&attempt.id);
                continue;
            };

            let decision = Arc::clone(decision);
            let wake = Arc::clone(&self.wake);
            let DecisionAttempt { id, data, .. } = attempt;
            tokio::spawn(async move {
                // A predicate that panics votes no; the queue must still advance
                let validation = async { decision.validate(&data).await };
                let accepted = match AssertUnwindSafe(validation).catch_unwind().await {
                    Ok(accepted) => accepted,
                    Err(_) => {
                        warn!("Validity check for {} ({}) panicked", id, decision.key());
                        false
                    }
                };
                wake(Wakeup::Validated {
                    attempt: id,
                    accepted,
                });
            });
            return;
        }
    }

    fn on_validated<M: Membership>(&mut self, mesh: &mut M, id: AttemptId, accepted: bool) {
        let Some(attempt) = self.queue.active().filter(|a| a.id == id).cloned() else {
            warn!("Validation finished for inactive attempt {}", id);
            return;
        };

        let response = DecisionResponse::vote(mesh.local(), &attempt, accepted);
        debug!(
            "Voting {} on {} ({})",
            if response.accepted { "yes" } else { "no" },
            attempt.id,
            attempt.key
        );
        let msg = ManagementMessage::direct(
            mesh.local().id().clone(),
            attempt.source_node.clone(),
            ManagementPayload::DecisionResponse(response),
        );
        if let Err(e) = mesh.send(msg) {
            warn!("Cannot answer attempt {} from {}: {}", id, attempt.source_node, e);
        }

        let next = self.queue.finish(&id);
        self.start_validation(next);
    }

    fn on_response<M: Membership>(
        &mut self,
        mesh: &mut M,
        source: &NodeId,
        response: DecisionResponse,
    ) {
        let id = response.attempt_id.clone();
        let Some(proposal) = self.proposals.get_mut(&id) else {
            warn!("Response for unknown or finished attempt {} from {}", id, source);
            return;
        };
        if response.source_node != *source {
            warn!("Response claims {} but came from {}", response.source_node, source);
            return;
        }
        if response.key != proposal.attempt.key {
            warn!("Response from {} names key {} for {}", source, response.key, id);
            return;
        }
        if !proposal.expected.contains(source) {
            warn!("Unexpected response from {} for {}", source, id);
            return;
        }
        if proposal.responses.iter().any(|r| r.source_node == *source) {
            warn!("Duplicate response from {} for {}", source, id);
            return;
        }

        proposal.responses.push(response);
        if proposal.responses.len() < proposal.expected.len() {
            return;
        }
        if let Some(proposal) = self.proposals.remove(&id) {
            self.conclude(mesh, proposal);
        }
    }

    fn conclude<M: Membership>(&mut self, mesh: &mut M, proposal: Proposal) {
        let id = proposal.attempt.id.clone();
        let key = proposal.attempt.key.clone();
        let Some(decision) = self.decisions.get(&key).cloned() else {
            warn!("Invalid decision key when handling decision responses ({})", key);
            return;
        };

        let expected = proposal.expected.len();
        let affirmative = proposal.responses.iter().filter(|r| r.accepted).count();
        let consensus = consensus_ratio(affirmative, expected);

        if !meets_consensus(affirmative, expected, self.target_consensus) {
            info!(
                "Decision {} ({}) declined: {}/{} in favour",
                key, id, affirmative, expected
            );
            tokio::spawn(decision.decline(id.clone()));
            self.emit(MeshEvent::DecisionDeclined {
                attempt: id,
                key,
                reason: DeclineReason::BelowThreshold { consensus },
            });
            return;
        }

        info!(
            "Decision {} ({}) accepted: {}/{} in favour",
            key, id, affirmative, expected
        );
        let accept = decision.accept(&proposal.attempt.data);
        let action = DecisionAction::new(proposal.attempt, proposal.responses);
        mesh.broadcast(ManagementPayload::DecisionAction(action));
        tokio::spawn(accept);
        self.emit(MeshEvent::DecisionAccepted { attempt: id, key });
    }

    fn on_timeout(&mut self, id: AttemptId) {
        let Some(proposal) = self.proposals.remove(&id) else {
            return;
        };
        let key = proposal.attempt.key;
        warn!(
            "Decision {} ({}) timed out with {}/{} responses",
            key,
            id,
            proposal.responses.len(),
            proposal.expected.len()
        );
        if let Some(decision) = self.decisions.get(&key) {
            tokio::spawn(decision.decline(id.clone()));
        }
        self.emit(MeshEvent::DecisionDeclined {
            attempt: id,
            key,
            reason: DeclineReason::TimedOut,
        });
    }

    fn on_action<M: Membership>(&mut self, mesh: &M, action: &DecisionAction) {
        let id = action.attempt.id.clone();
        let key = action.key.clone();
        let source = action.source_node.clone();

        let Some(decision) = self.decisions.get(&key).cloned() else {
            warn!("Invalid decision key when handling action! ({})", key);
            return;
        };
        if self.applied.contains(&id) {
            warn!("Ignoring replayed action {} from {}", id, source);
            return;
        }

        match action.verify(self.target_consensus, move |node| mesh.resolve(node)) {
            Ok(consensus) => {
                info!(
                    "Applying {} ({}) from {} at consensus {:.3}",
                    key, id, source, consensus
                );
                self.applied.insert(id.clone());
                tokio::spawn(decision.foreign_accept(&action.attempt.data, source.clone()));
                self.emit(MeshEvent::ActionApplied {
                    attempt: id,
                    key,
                    source,
                });
            }
            Err(reason) => {
                warn!("Action {} from {} invalid: {}", id, source, reason);
                self.emit(MeshEvent::ActionRejected {
                    attempt: id,
                    key,
                    source,
                    reason: reason.to_string(),
                });
            }
        }
    }

    fn emit(&self, event: MeshEvent) {
        // Nobody listening is fine
        let _ = self.events.send(event);
    }
}
