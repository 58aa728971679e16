//! Agora Transport - the session primitive peers negotiate over.
//!
//! The mesh core never touches a concrete networking stack. It drives
//! sessions through the [`Session`] trait and receives their notifications as
//! [`SessionEvent`]s, so any stack that can produce offers/answers, consume
//! connectivity candidates and carry labelled reliable byte-channels can host
//! a mesh.
//!
//! # Overview
//!
//! - [`session`]: description, candidate and state types plus the
//!   [`Session`] / [`SessionFactory`] traits
//! - [`memory`]: [`MemoryNetwork`], an in-process switchboard that simulates
//!   the primitive for tests and local simulations
//!
//! # Example
//!
//! ```rust,ignore
//! use agora_transport::{MemoryNetwork, SessionConfig, SessionFactory};
//!
//! let network = MemoryNetwork::new();
//! let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//! let session = network.create(&SessionConfig::default(), tx)?;
//! session.create_channel("control")?;
//! // rx yields SessionEvent::NegotiationNeeded
//! ```

pub mod error;
pub mod memory;
pub mod session;

pub use error::{Error, Result};
pub use memory::{MemoryNetwork, MemorySession};
pub use session::{
    IceCandidate, IceConnectionState, IceServer, PeerConnectionState, SdpType, Session,
    SessionConfig, SessionDescription, SessionEvent, SessionEvents, SessionFactory, SignalingState,
};
