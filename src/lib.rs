//! Signaling relay that pairs studio consoles with remote contributors.
//!
//! The relay side (`relay`, `router`, `registry`) forwards envelopes between
//! parties. The client side (`client`) drives peer links and talks to a
//! `MediaSession` through the `transport` seam.

pub mod candidates;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod link;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod router;
pub mod sse;
pub mod transport;
pub mod webrtc_transport;

pub use config::{ClientConfig, RelayConfig};
pub use protocol::{Envelope, RemoteId, Role};
pub use relay::{build_app, AppState};
