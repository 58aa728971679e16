//! Node identity: stable ids and the keys behind them.
//!
//! The local identity owns an ed25519 keypair and derives its id from the
//! public key (double BLAKE3, `b3b3/<hex>`). Remote identities start with an
//! id only and receive their public key once, during the identity exchange
//! that follows connection setup. Because ids are derived from keys, the
//! exchange also proves that a peer owns the id it announced.

use std::fmt;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Stable identifier of a mesh participant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id owned by `key`: hash₁ = BLAKE3(pubkey), hash₂ = BLAKE3(hash₁).
    pub fn from_public_key(key: &VerifyingKey) -> Self {
        let hash1 = blake3::hash(key.as_bytes());
        let hash2 = blake3::hash(hash1.as_bytes());
        Self(format!("b3b3/{}", hex::encode(hash2.as_bytes())))
    }

    /// Whether this id was derived from `key`.
    pub fn is_owned_by(&self, key: &VerifyingKey) -> bool {
        *self == Self::from_public_key(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Locally generated id of one connection attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Id of a peer that is still being connected.
///
/// The initiating side does not know who answers its offer, so the peer is
/// known by the connection attempt until the answer names it. The transition
/// happens once and never goes back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerId {
    Provisional(ConnectionId),
    Confirmed(NodeId),
}

impl PeerId {
    pub fn confirmed(&self) -> Option<&NodeId> {
        match self {
            Self::Confirmed(id) => Some(id),
            Self::Provisional(_) => None,
        }
    }

    /// Replace a provisional id with the peer's declared identity.
    pub fn confirm(&mut self, id: NodeId) -> Result<(), IdentityError> {
        match self {
            Self::Provisional(_) => {
                *self = Self::Confirmed(id);
                Ok(())
            }
            Self::Confirmed(current) if *current == id => Ok(()),
            Self::Confirmed(current) => Err(IdentityError::AlreadyConfirmed(current.clone())),
        }
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisional(conn) => write!(f, "provisional:{conn}"),
            Self::Confirmed(id) => write!(f, "{id}"),
        }
    }
}

/// Identity and key errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("public key already set")]
    PublicKeyAlreadySet,

    #[error("no public key available")]
    MissingPublicKey,

    #[error("peer id {claimed} is not derived from its public key ({derived})")]
    IdMismatch { claimed: NodeId, derived: NodeId },

    #[error("peer id already confirmed as {0}")]
    AlreadyConfirmed(NodeId),
}

/// Payload of the post-connect identity exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    /// Hex-encoded ed25519 public key
    pub pubkey: String,
}

enum Keys {
    None,
    Public(VerifyingKey),
    Pair(SigningKey),
}

/// A node id plus whatever key material is known for it.
pub struct Identity {
    id: NodeId,
    keys: Keys,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = match self.keys {
            Keys::None => "none",
            Keys::Public(_) => "public",
            Keys::Pair(_) => "keypair",
        };
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("keys", &keys)
            .finish()
    }
}

impl Identity {
    /// Generate a fresh local identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        Self {
            id: NodeId::from_public_key(&key.verifying_key()),
            keys: Keys::Pair(key),
        }
    }

    /// A remote identity whose key is not known yet.
    pub fn remote(id: NodeId) -> Self {
        Self {
            id,
            keys: Keys::None,
        }
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn has_private_key(&self) -> bool {
        matches!(self.keys, Keys::Pair(_))
    }

    pub fn public_key(&self) -> Option<VerifyingKey> {
        match &self.keys {
            Keys::None => None,
            Keys::Public(key) => Some(*key),
            Keys::Pair(key) => Some(key.verifying_key()),
        }
    }

    /// Sign `data`, returning a hex signature. `None` without a private key.
    pub fn sign(&self, data: &[u8]) -> Option<String> {
        let Keys::Pair(key) = &self.keys else {
            warn!(id = %self.id, "attempt to sign without a private key");
            return None;
        };
        Some(hex::encode(key.sign(data).to_bytes()))
    }

    /// Verify a hex signature over `data`.
    ///
    /// `None` when no public key is known or the signature is structurally
    /// invalid; otherwise whether the signature checks out.
    pub fn verify(&self, signature: &str, data: &[u8]) -> Option<bool> {
        let Some(key) = self.public_key() else {
            warn!(id = %self.id, "attempt to verify without a public key");
            return None;
        };

        let signature = hex::decode(signature)
            .ok()
            .and_then(|bytes| Signature::from_slice(&bytes).ok());
        let Some(signature) = signature else {
            warn!(id = %self.id, "attempt to verify a malformed signature");
            return None;
        };

        Some(key.verify(data, &signature).is_ok())
    }

    /// Hex encoding of the public key.
    pub fn export_public_key(&self) -> Option<String> {
        self.public_key().map(|key| hex::encode(key.as_bytes()))
    }

    /// Import a hex public key. Only allowed once, and never on a local identity.
    pub fn set_public_key(&mut self, key: &str) -> Result<(), IdentityError> {
        if !matches!(self.keys, Keys::None) {
            return Err(IdentityError::PublicKeyAlreadySet);
        }
        self.keys = Keys::Public(parse_public_key(key)?);
        Ok(())
    }

    pub fn export_peer_info(&self) -> Result<PeerInfo, IdentityError> {
        self.export_public_key()
            .map(|pubkey| PeerInfo { pubkey })
            .ok_or(IdentityError::MissingPublicKey)
    }

    /// Import a peer's identity-exchange payload, checking it owns our id for it.
    pub fn import_peer_info(&mut self, info: &PeerInfo) -> Result<(), IdentityError> {
        let key = parse_public_key(&info.pubkey)?;
        if !self.id.is_owned_by(&key) {
            return Err(IdentityError::IdMismatch {
                claimed: self.id.clone(),
                derived: NodeId::from_public_key(&key),
            });
        }
        self.set_public_key(&info.pubkey)
    }
}

fn parse_public_key(key: &str) -> Result<VerifyingKey, IdentityError> {
    let invalid = || IdentityError::InvalidPublicKey(key.to_string());
    let bytes: [u8; 32] = hex::decode(key)
        .map_err(|_| invalid())?
        .try_into()
        .map_err(|_| invalid())?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| invalid())
}
