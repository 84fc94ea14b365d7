// src/client/mod.rs
//
// Client side of the relay: the connection manager shared by both roles,
// the per-link driver, the studio / remote controllers built on it, and
// the runner that wires a controller to a live relay connection.
//
// ────────────────────────────────────────────────────────────────────────────

pub mod manager;
pub mod peer;
pub mod remote;
pub mod renegotiation;
pub mod runner;
pub mod studio;

use crate::link::LinkError;
use crate::protocol::{Envelope, RemoteId};
use crate::transport::TransportError;

pub use manager::{ClientEvent, RelayHandle, RelayManager};
pub use peer::PeerDriver;
pub use remote::RemoteController;
pub use runner::{ClientRunner, Controller};
pub use studio::StudioController;

/// Where a controller's outgoing envelopes go.  The live implementation is
/// `RelayHandle`; tests capture into a vector.
pub trait Outbox: Send + Sync {
    /// Returns `false` if the envelope could not be queued.
    fn send(&self, envelope: Envelope) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("relay connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("no link for remote '{0}'")]
    NoSuchLink(RemoteId),

    #[error("not yet assigned an id by the relay")]
    Unassigned,

    #[error("invalid media setting: {0}")]
    InvalidSetting(String),
}

/// One chat line received from the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatLine {
    pub from: Option<String>,
    pub text: String,
}
