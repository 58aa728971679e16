//! Notifications published by a running mesh peer.

use std::fmt;

use crate::decision::AttemptId;
use crate::identity::NodeId;

/// Why one of our own attempts was declined.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclineReason {
    /// There was nobody to vote
    NoMembers,
    /// The affirmative fraction missed the target
    BelowThreshold { consensus: f64 },
    /// Not every expected vote arrived in time
    TimedOut,
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeclineReason::NoMembers => write!(f, "no members"),
            DeclineReason::BelowThreshold { consensus } => {
                write!(f, "consensus {:.3} below target", consensus)
            }
            DeclineReason::TimedOut => write!(f, "timed out"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    PeerJoined(NodeId),
    PeerLeft(NodeId),
    /// Our attempt passed; its action was broadcast
    DecisionAccepted { attempt: AttemptId, key: String },
    DecisionDeclined {
        attempt: AttemptId,
        key: String,
        reason: DeclineReason,
    },
    /// A verified action from another peer was applied
    ActionApplied {
        attempt: AttemptId,
        key: String,
        source: NodeId,
    },
    ActionRejected {
        attempt: AttemptId,
        key: String,
        source: NodeId,
        reason: String,
    },
}
