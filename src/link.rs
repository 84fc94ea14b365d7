// src/link.rs
//
// Negotiation lifecycle of one remote <-> studio relationship.
//
//   Idle ──begin──> Ready ──offer──> OfferSent ──answer──> Answered ──up──> Connected
//                     ^                 ^                     │               │
//                     └──── begin ──────┴──── offer ──────────┴───────────────┘
//                                 (renegotiation re-enters here)
//
//   any ──close──> Closed   (Closed is terminal; closing twice is a no-op)
//
// `transition` is a pure function over (state, event).  `PeerLink` wraps it
// with the per-link bookkeeping: descriptions for the current round, the
// candidate buffer, and the two mute flags.  No I/O happens here; the relay
// registry and the client-side drivers call into it and perform the side
// effects themselves.
//
// ────────────────────────────────────────────────────────────────────────────

use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;

use crate::candidates::CandidateBuffer;
use crate::protocol::RemoteId;

// ─── States and events ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum LinkState {
    Idle,
    Ready,
    OfferSent,
    Answered,
    Connected,
    Closed,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Ready => "ready",
            Self::OfferSent => "offer-sent",
            Self::Answered => "answered",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    /// Studio asked the remote to (re)start negotiation.
    BeginNegotiation,
    /// The remote's offer left the remote / reached the studio.
    OfferSent,
    /// The studio's answer was produced and routed back.
    Answered,
    /// Transport reported connectivity.
    Connected,
    /// Kick, transport close, or replacement.
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkError {
    #[error("link is closed")]
    Closed,

    #[error("illegal transition {event:?} from {from}")]
    IllegalTransition { from: LinkState, event: LinkEvent },

    #[error("remote description already applied this negotiation round")]
    RemoteDescriptionAlreadySet,
}

/// The transition table.
pub fn transition(state: LinkState, event: LinkEvent) -> Result<LinkState, LinkError> {
    use LinkState::*;

    match (state, event) {
        (Closed, LinkEvent::Close) => Ok(Closed),
        (Closed, _) => Err(LinkError::Closed),
        (_, LinkEvent::Close) => Ok(Closed),

        // A repeated directive restarts a stuck round.
        (Idle | Ready | OfferSent | Answered | Connected, LinkEvent::BeginNegotiation) => Ok(Ready),

        // The studio side may see an offer without having sent the
        // directive itself (another studio did), and must accept a second
        // offer on an established link.
        (Idle | Ready | OfferSent | Answered | Connected, LinkEvent::OfferSent) => Ok(OfferSent),

        (OfferSent, LinkEvent::Answered) => Ok(Answered),

        (Answered | Connected, LinkEvent::Connected) => Ok(Connected),

        (from, event) => Err(LinkError::IllegalTransition { from, event }),
    }
}

// ─── Mute flags ─────────────────────────────────────────────────────────────

/// Two independent mute sources.  Either one suppresses the remote's
/// outgoing audio leg.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuteFlags {
    pub self_muted: bool,
    pub imposed_muted: bool,
}

impl MuteFlags {
    pub fn suppressed(&self) -> bool {
        self.self_muted || self.imposed_muted
    }
}

// ─── PeerLink ───────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct PeerLink {
    remote_id: RemoteId,
    state: LinkState,
    local_description: Option<Value>,
    remote_description: Option<Value>,
    candidates: CandidateBuffer,
    mute: MuteFlags,
    transport_up: bool,
    last_activity: Instant,
}

impl PeerLink {
    pub fn new(remote_id: RemoteId) -> Self {
        Self {
            remote_id,
            state: LinkState::Idle,
            local_description: None,
            remote_description: None,
            candidates: CandidateBuffer::new(),
            mute: MuteFlags::default(),
            transport_up: false,
            last_activity: Instant::now(),
        }
    }

    pub fn remote_id(&self) -> &RemoteId {
        &self.remote_id
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    pub fn mute(&self) -> MuteFlags {
        self.mute
    }

    pub fn local_description(&self) -> Option<&Value> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&Value> {
        self.remote_description.as_ref()
    }

    /// Feed an event through the transition table.
    ///
    /// Entering `Ready`, or entering `OfferSent` from anywhere but `Ready`,
    /// opens a new negotiation round and forgets the previous round's
    /// descriptions.  The candidate buffer and mute flags carry over.
    pub fn apply(&mut self, event: LinkEvent) -> Result<LinkState, LinkError> {
        let from = self.state;
        let to = transition(from, event)?;

        let new_round = match event {
            LinkEvent::BeginNegotiation => true,
            LinkEvent::OfferSent => from != LinkState::Ready,
            _ => false,
        };
        if new_round {
            self.local_description = None;
            self.remote_description = None;
        }

        // Connectivity persists across renegotiation; finishing the round
        // on an already-connected transport lands straight in Connected.
        let to = if to == LinkState::Answered && self.transport_up {
            LinkState::Connected
        } else {
            to
        };

        if to == LinkState::Closed && from != LinkState::Closed {
            self.candidates.release();
            self.local_description = None;
            self.remote_description = None;
            self.transport_up = false;
        }

        self.state = to;
        self.touch();
        Ok(to)
    }

    /// Idempotent close.  Returns `true` if this call did the closing.
    pub fn close(&mut self) -> bool {
        if self.is_closed() {
            return false;
        }
        // Close is legal from every non-closed state.
        let _ = self.apply(LinkEvent::Close);
        true
    }

    pub fn record_local_description(&mut self, description: Value) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.local_description = Some(description);
        Ok(())
    }

    /// Store the peer's description for this round.  Set exactly once per
    /// round; a second one is refused.
    pub fn record_remote_description(&mut self, description: Value) -> Result<(), LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        if self.remote_description.is_some() {
            return Err(LinkError::RemoteDescriptionAlreadySet);
        }
        self.remote_description = Some(description);
        Ok(())
    }

    /// Queue a remote candidate.  `Ok(Some(c))` means "apply `c` now".
    pub fn enqueue_candidate(&mut self, candidate: Value) -> Result<Option<Value>, LinkError> {
        if self.is_closed() {
            return Err(LinkError::Closed);
        }
        self.touch();
        Ok(self.candidates.enqueue(candidate))
    }

    /// One-shot drain, only once a remote description is known.
    pub fn flush_candidates(&mut self) -> Vec<Value> {
        if self.is_closed() || self.remote_description.is_none() {
            return Vec::new();
        }
        self.candidates.drain_once()
    }

    pub fn candidates_flushed(&self) -> bool {
        self.candidates.is_flushed()
    }

    pub fn buffered_candidates(&self) -> usize {
        self.candidates.len()
    }

    pub fn set_self_muted(&mut self, muted: bool) -> MuteFlags {
        self.mute.self_muted = muted;
        self.touch();
        self.mute
    }

    pub fn set_imposed_muted(&mut self, muted: bool) -> MuteFlags {
        self.mute.imposed_muted = muted;
        self.touch();
        self.mute
    }

    /// Record a transport connectivity report.  Returns the new state if the
    /// report moved the link.
    pub fn transport_connected(&mut self) -> Option<LinkState> {
        if self.is_closed() {
            return None;
        }
        self.transport_up = true;
        match self.state {
            LinkState::Answered => self.apply(LinkEvent::Connected).ok(),
            _ => None,
        }
    }

    pub fn transport_lost(&mut self) {
        self.transport_up = false;
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
