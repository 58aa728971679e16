//! Votes on an attempt. Yes votes are signed.

use serde::{Deserialize, Serialize};

use super::attempt::{AttemptId, DecisionAttempt};
use crate::identity::{Identity, NodeId};

/// One peer's vote on an attempt.
///
/// A yes vote carries the voter's signature over the attempt hash; a no vote
/// attests nothing and carries none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub attempt_id: AttemptId,
    pub key: String,
    pub source_node: NodeId,
    pub accepted: bool,
    #[serde(default)]
    pub signature: Option<String>,
}

impl DecisionResponse {
    /// Vote on `attempt` as `local`, signing affirmative votes.
    pub fn vote(local: &Identity, attempt: &DecisionAttempt, accepted: bool) -> Self {
        let signature = if accepted {
            local.sign(attempt.hash().as_bytes())
        } else {
            None
        };
        Self {
            attempt_id: attempt.id.clone(),
            key: attempt.key.clone(),
            source_node: local.id().clone(),
            // A yes we could not sign would not survive verification
            accepted: accepted && signature.is_some(),
            signature,
        }
    }

    /// Check the vote against its signer's key.
    ///
    /// Unsigned no votes are trivially valid and unsigned yes votes are not.
    /// `None` when the signature cannot be checked at all.
    pub fn is_valid(&self, signer: &Identity, attempt_hash: &str) -> Option<bool> {
        match (&self.signature, self.accepted) {
            (None, false) => Some(true),
            (None, true) => Some(false),
            (Some(signature), _) => signer.verify(signature, attempt_hash.as_bytes()),
        }
    }
}
