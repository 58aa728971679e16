//! Agora Mesh - self-assembling peer mesh with signed group decisions
//!
//! Peers connect over a negotiated transport session (see
//! `agora-transport`). A newcomer needs a single bootstrap connection: the
//! peer it reaches announces it to everyone else and relays their signaling,
//! so the mesh closes into a full graph. On top of the mesh, peers propose
//! decisions, vote with signed responses and apply actions only after
//! re-verifying the bundled votes.
//!
//! # Architecture
//!
//! - **Identity**: ed25519 keys, content-derived node ids
//! - **Connection**: perfect negotiation over one transport session
//! - **Management**: addressed, optionally relayed control messages
//! - **Network**: connection setup, identity exchange and promotion
//! - **Relay**: NEW_PEER announcements and relayed signaling
//! - **Decision**: propose / vote / act with a 2/3 default quorum
//! - **Service**: the per-peer task tying them together
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use agora_mesh::{Decision, Identity, MeshConfig, MeshService};
//! use agora_transport::MemoryNetwork;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let net = Arc::new(MemoryNetwork::new());
//!     let a = MeshService::spawn(Identity::generate(), MeshConfig::default(), net.clone())?;
//!     let b = MeshService::spawn(Identity::generate(), MeshConfig::default(), net)?;
//!
//!     let even = || Decision::new("even", |n: u32| async move { n % 2 == 0 });
//!     a.register_decision(even())?;
//!     b.register_decision(even())?;
//!
//!     a.connect(&b).await?;
//!     let attempt = a.propose("even", &4u32).await?;
//!     println!("proposed {}", attempt);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connection;
pub mod decision;
pub mod error;
pub mod event;
pub mod hash;
pub mod identity;
pub mod management;
pub mod network;
pub mod relay;
pub mod service;

pub use config::MeshConfig;
pub use connection::{Connection, ConnectionState};
pub use decision::{Decision, DecisionAction, DecisionAttempt, DecisionResponse};
pub use error::{Error, Result};
pub use event::{DeclineReason, MeshEvent};
pub use identity::{ConnectionId, Identity, NodeId, PeerInfo};
pub use management::{ManagementMessage, ManagementPayload, RelayVia};
pub use network::{ConnectionPacket, MessageTransport, Network, PacketBody};
pub use service::{link, MeshHandle, MeshService};
