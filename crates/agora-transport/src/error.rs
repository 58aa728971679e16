//! Error types for agora-transport.

use thiserror::Error;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by a transport session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// The operation is not valid in the current signaling state.
    #[error("invalid signaling state: {0}")]
    InvalidState(String),

    /// A candidate was supplied before any remote description.
    #[error("no remote description has been applied")]
    NoRemoteDescription,

    /// A candidate does not belong to the remote endpoint.
    #[error("candidate does not match the remote endpoint: {0}")]
    UnknownCandidate(String),

    /// A session description could not be parsed.
    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    /// The named byte-channel does not exist or is not open.
    #[error("channel {0:?} is not open")]
    ChannelNotOpen(String),

    /// The session has been closed.
    #[error("session closed")]
    Closed,
}
