//! Decision attempts and their ids.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::hash;
use crate::identity::NodeId;

/// Globally unique id of a decision attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttemptId(String);

impl AttemptId {
    /// Random 128-bit id in UUID layout.
    pub fn generate() -> Self {
        let mut b = [0u8; 16];
        OsRng.fill_bytes(&mut b);
        b[6] = (b[6] & 0x0f) | 0x40;
        b[8] = (b[8] & 0x3f) | 0x80;
        let h = hex::encode(b);
        Self(format!(
            "{}-{}-{}-{}-{}",
            &h[0..8],
            &h[8..12],
            &h[12..16],
            &h[16..20],
            &h[20..32]
        ))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One concrete proposal of a registered decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionAttempt {
    pub id: AttemptId,
    pub key: String,
    pub source_node: NodeId,
    pub data: Value,
}

impl DecisionAttempt {
    pub fn new(key: impl Into<String>, source_node: NodeId, data: Value) -> Self {
        Self {
            id: AttemptId::generate(),
            key: key.into(),
            source_node,
            data,
        }
    }

    /// Canonical serialization: compact JSON with sorted keys.
    pub fn canonical(&self) -> String {
        serde_json::json!({
            "id": self.id,
            "key": self.key,
            "sourceNode": self.source_node,
            "data": self.data,
        })
        .to_string()
    }

    /// Fingerprint of the canonical form; votes sign this.
    pub fn hash(&self) -> String {
        hash::fingerprint(&self.canonical())
    }
}
