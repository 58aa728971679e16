//! Error types for agora-mesh.

use thiserror::Error;

use crate::identity::{IdentityError, NodeId};

/// Result type for mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in mesh operations.
#[derive(Debug, Error)]
pub enum Error {
    /// The transport session rejected an operation.
    #[error("Transport error: {0}")]
    Transport(#[from] agora_transport::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Key material missing or malformed
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    /// No decision is registered under this key
    #[error("Unknown decision: {0}")]
    UnknownDecision(String),

    /// No established peer has this id
    #[error("Unknown peer: {0}")]
    UnknownPeer(NodeId),

    /// A message was handed to a channel that is not its next hop
    #[error("Message for {target} (via {relay_via}) cannot be sent to {peer}")]
    Misaddressed {
        target: NodeId,
        relay_via: String,
        peer: String,
    },

    /// The management channel is in the wrong state for the operation
    #[error("Channel error: {0}")]
    Channel(String),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The mesh service task has stopped
    #[error("Mesh service stopped")]
    ServiceStopped,
}
