//! Actions: an attempt bundled with every response it collected.
//!
//! Receivers re-verify each bundled vote against the voter's identity and
//! recompute the consensus before applying anything.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::attempt::DecisionAttempt;
use super::response::DecisionResponse;
use super::threshold::{consensus_ratio, meets_consensus};
use crate::identity::{Identity, NodeId};

/// Why an action failed re-verification.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum InvalidAction {
    #[error("action key {action} does not match attempt key {attempt}")]
    KeyMismatch { action: String, attempt: String },

    #[error("action source {action} does not match attempt source {attempt}")]
    SourceMismatch { action: NodeId, attempt: NodeId },

    #[error("action carries no responses")]
    NoResponses,

    #[error("consensus {consensus:.3} below target {target:.3}")]
    BelowThreshold { consensus: f64, target: f64 },
}

/// An attempt plus every response collected for it: the proof that a
/// decision passed, re-verifiable by any peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionAction {
    pub key: String,
    pub source_node: NodeId,
    pub attempt: DecisionAttempt,
    pub responses: Vec<DecisionResponse>,
}

impl DecisionAction {
    pub fn new(attempt: DecisionAttempt, responses: Vec<DecisionResponse>) -> Self {
        Self {
            key: attempt.key.clone(),
            source_node: attempt.source_node.clone(),
            attempt,
            responses,
        }
    }

    /// Re-verify the action from its contents alone.
    ///
    /// Recomputes the attempt hash and discards every response whose
    /// signer cannot be resolved or whose signature does not verify. The
    /// affirmative surviving votes, over all bundled responses, must still
    /// reach `target`.
    pub fn verify<'a, F>(&self, target: f64, resolve: F) -> Result<f64, InvalidAction>
    where
        F: Fn(&NodeId) -> Option<&'a Identity>,
    {
        if self.key != self.attempt.key {
            return Err(InvalidAction::KeyMismatch {
                action: self.key.clone(),
                attempt: self.attempt.key.clone(),
            });
        }
        if self.source_node != self.attempt.source_node {
            return Err(InvalidAction::SourceMismatch {
                action: self.source_node.clone(),
                attempt: self.attempt.source_node.clone(),
            });
        }
        if self.responses.is_empty() {
            return Err(InvalidAction::NoResponses);
        }

        let hash = self.attempt.hash();
        let mut voted = HashSet::new();
        let affirmative = self
            .responses
            .iter()
            .filter(|r| self.response_counts(r, &hash, &resolve, &mut voted))
            .filter(|r| r.accepted)
            .count();

        let consensus = consensus_ratio(affirmative, self.responses.len());
        if !meets_consensus(affirmative, self.responses.len(), target) {
            return Err(InvalidAction::BelowThreshold { consensus, target });
        }
        Ok(consensus)
    }

    fn response_counts<'a, F>(
        &self,
        response: &DecisionResponse,
        hash: &str,
        resolve: &F,
        voted: &mut HashSet<NodeId>,
    ) -> bool
    where
        F: Fn(&NodeId) -> Option<&'a Identity>,
    {
        if response.attempt_id != self.attempt.id || response.key != self.attempt.key {
            warn!("Response from {} is for another attempt", response.source_node);
            return false;
        }
        if !voted.insert(response.source_node.clone()) {
            warn!("Duplicate response from {}", response.source_node);
            return false;
        }
        let Some(signer) = resolve(&response.source_node) else {
            warn!("Invalid decision response node ID ({})", response.source_node);
            return false;
        };
        let valid = response.is_valid(signer, hash) == Some(true);
        if !valid {
            warn!("Response from {} failed verification", response.source_node);
        }
        valid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::DEFAULT_TARGET_CONSENSUS;
    use serde_json::json;
    use std::collections::HashMap;

    struct Fixture {
        proposer: Identity,
        voters: Vec<Identity>,
        attempt: DecisionAttempt,
    }

    impl Fixture {
        fn new(voters: usize) -> Self {
            let proposer = Identity::generate();
            let attempt =
                DecisionAttempt::new("kick", proposer.id().clone(), json!({ "who": "x" }));
            Self {
                proposer,
                voters: (0..voters).map(|_| Identity::generate()).collect(),
                attempt,
            }
        }

        fn votes(&self, yes: usize) -> Vec<DecisionResponse> {
            self.voters
                .iter()
                .enumerate()
                .map(|(i, v)| DecisionResponse::vote(v, &self.attempt, i < yes))
                .collect()
        }

        /// Public-key-only view of everyone, as a remote peer would hold it.
        fn directory(&self) -> HashMap<NodeId, Identity> {
            std::iter::once(&self.proposer)
                .chain(&self.voters)
                .map(|local| {
                    let mut remote = Identity::remote(local.id().clone());
                    remote
                        .set_public_key(&local.export_public_key().unwrap())
                        .unwrap();
                    (local.id().clone(), remote)
                })
                .collect()
        }
    }

    #[test]
    fn quorum_action_verifies() {
        let f = Fixture::new(3);
        let dir = f.directory();
        let action = DecisionAction::new(f.attempt.clone(), f.votes(2));
        let consensus = action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)).unwrap();
        assert!((consensus - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn under_quorum_action_rejected_even_if_signatures_valid() {
        let f = Fixture::new(3);
        let dir = f.directory();
        let action = DecisionAction::new(f.attempt.clone(), f.votes(1));
        assert!(matches!(
            action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)),
            Err(InvalidAction::BelowThreshold { .. })
        ));
    }

    #[test]
    fn forged_votes_do_not_count() {
        let f = Fixture::new(3);
        let dir = f.directory();
        let mut responses = f.votes(1);
        // Flip two honest no votes into unsigned yes votes
        responses[1].accepted = true;
        responses[2].accepted = true;
        let action = DecisionAction::new(f.attempt.clone(), responses);
        assert!(action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)).is_err());
    }

    #[test]
    fn tampered_payload_invalidates_signatures() {
        let f = Fixture::new(3);
        let dir = f.directory();
        let mut action = DecisionAction::new(f.attempt.clone(), f.votes(3));
        action.attempt.data = json!({ "who": "y" });
        assert!(action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)).is_err());
    }

    #[test]
    fn unknown_signers_do_not_count() {
        let f = Fixture::new(3);
        let mut dir = f.directory();
        dir.remove(f.voters[0].id());
        dir.remove(f.voters[1].id());
        let action = DecisionAction::new(f.attempt.clone(), f.votes(3));
        assert!(action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)).is_err());
    }

    #[test]
    fn duplicated_votes_count_once() {
        let f = Fixture::new(3);
        let dir = f.directory();
        let mut responses = f.votes(1);
        responses.truncate(1);
        responses.push(responses[0].clone());
        responses.push(responses[0].clone());
        let action = DecisionAction::new(f.attempt.clone(), responses);
        assert!(action.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)).is_err());
    }

    #[test]
    fn empty_and_inconsistent_actions_rejected() {
        let f = Fixture::new(3);
        let dir = f.directory();

        let empty = DecisionAction::new(f.attempt.clone(), Vec::new());
        assert_eq!(
            empty.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)),
            Err(InvalidAction::NoResponses)
        );

        let mut rekeyed = DecisionAction::new(f.attempt.clone(), f.votes(3));
        rekeyed.key = "other".to_string();
        assert!(matches!(
            rekeyed.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)),
            Err(InvalidAction::KeyMismatch { .. })
        ));

        let mut resourced = DecisionAction::new(f.attempt.clone(), f.votes(3));
        resourced.source_node = f.voters[0].id().clone();
        assert!(matches!(
            resourced.verify(DEFAULT_TARGET_CONSENSUS, |id| dir.get(id)),
            Err(InvalidAction::SourceMismatch { .. })
        ));
    }

    #[test]
    fn wire_format_round_trips() {
        let f = Fixture::new(2);
        let action = DecisionAction::new(f.attempt.clone(), f.votes(2));
        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["key"], "kick");
        assert_eq!(json["responses"][0]["attemptId"], json!(f.attempt.id));
        let back: DecisionAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }
}
