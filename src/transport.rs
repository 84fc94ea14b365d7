// src/transport.rs
//
// The seam between the coordination core and the media transport.
//
// The core never looks inside descriptions or candidates.  It asks a
// `MediaSession` for a local description, hands it the peer's description
// and candidates, and listens for `TransportEvent`s (locally gathered
// candidates, connection-state changes) on a channel the session was given
// at creation time.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::protocol::RemoteId;

// ─── Errors ─────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("description rejected: {0}")]
    Description(String),

    #[error("candidate rejected: {0}")]
    Candidate(String),

    #[error("media reconfiguration failed: {0}")]
    Reconfigure(String),

    #[error("transport session closed")]
    Closed,

    #[error("transport error: {0}")]
    Other(String),
}

// ─── Connection state ───────────────────────────────────────────────────────

/// Connection state as reported by the transport.  Logged and propagated;
/// only `Connected` moves a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// What a session reports back to its driver.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A locally gathered candidate that must reach the peer.
    LocalCandidate { remote: RemoteId, candidate: Value },
    StateChanged { remote: RemoteId, state: ConnectionState },
}

pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

// ─── Media configuration ────────────────────────────────────────────────────

/// Local media parameters a studio can change mid-call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConfig {
    pub channels: u8,
    pub bitrate_kbps: u32,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            channels: 1,
            bitrate_kbps: 64,
        }
    }
}

// ─── Collaborator traits ────────────────────────────────────────────────────

/// One negotiation session with one peer.
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Produce (and apply locally) an offer, or an answer when a remote
    /// offer is pending.
    async fn produce_local_description(&self) -> Result<Value, TransportError>;

    async fn apply_remote_description(&self, description: Value) -> Result<(), TransportError>;

    async fn apply_remote_candidate(&self, candidate: Value) -> Result<(), TransportError>;

    /// Suppress or resume the outgoing audio leg.
    async fn set_outgoing_muted(&self, muted: bool) -> Result<(), TransportError>;

    /// Stop feeding the current outgoing leg and rebuild it with `config`.
    async fn reconfigure(&self, config: MediaConfig) -> Result<(), TransportError>;

    /// Discard the session.  Must tolerate repeated calls.
    async fn close(&self);
}

/// Creates one `MediaSession` per peer link.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn create(
        &self,
        remote: &RemoteId,
        config: MediaConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaSession>, TransportError>;
}
