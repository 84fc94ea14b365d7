// src/client/peer.rs
//
// Client-side driver of one PeerLink.
//
// Pairs the pure `PeerLink` record with the `MediaSession` that performs the
// actual negotiation I/O.  Each method checks the link first, then talks to
// the session, then commits the transition, so a refused message leaves
// both untouched.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::ClientError;
use crate::link::{transition, LinkError, LinkEvent, LinkState, MuteFlags, PeerLink};
use crate::protocol::RemoteId;
use crate::transport::{ConnectionState, MediaSession};

pub struct PeerDriver {
    link: PeerLink,
    session: Arc<dyn MediaSession>,
}

impl PeerDriver {
    pub fn new(remote_id: RemoteId, session: Arc<dyn MediaSession>) -> Self {
        Self {
            link: PeerLink::new(remote_id),
            session,
        }
    }

    pub fn link(&self) -> &PeerLink {
        &self.link
    }

    pub fn state(&self) -> LinkState {
        self.link.state()
    }

    pub fn remote_id(&self) -> &RemoteId {
        self.link.remote_id()
    }

    pub fn session(&self) -> &Arc<dyn MediaSession> {
        &self.session
    }

    /// Enter `Ready`.
    pub fn begin_negotiation(&mut self) -> Result<LinkState, ClientError> {
        Ok(self.link.apply(LinkEvent::BeginNegotiation)?)
    }

    /// Remote side: produce an offer and enter `OfferSent`.  On an
    /// established link this opens a renegotiation round.
    pub async fn create_offer(&mut self) -> Result<Value, ClientError> {
        self.ensure_open()?;
        transition(self.state(), LinkEvent::OfferSent)?;
        let offer = self.session.produce_local_description().await?;
        self.link.apply(LinkEvent::OfferSent)?;
        self.link.record_local_description(offer.clone())?;
        Ok(offer)
    }

    /// Studio side: take the remote's offer, flush buffered candidates, and
    /// produce the answer.  Works on a fresh link and on an established one
    /// (renegotiation).
    pub async fn accept_offer(&mut self, offer: Value) -> Result<Value, ClientError> {
        self.ensure_open()?;
        transition(self.state(), LinkEvent::OfferSent)?;

        self.session.apply_remote_description(offer.clone()).await?;
        let answer = self.session.produce_local_description().await?;

        self.link.apply(LinkEvent::OfferSent)?;
        self.link.record_remote_description(offer)?;
        self.flush_candidates().await;
        self.link.record_local_description(answer.clone())?;
        self.link.apply(LinkEvent::Answered)?;
        Ok(answer)
    }

    /// Remote side: take the studio's answer and flush buffered candidates.
    /// A second answer in the same round is refused.
    pub async fn accept_answer(&mut self, answer: Value) -> Result<LinkState, ClientError> {
        let from = self.link.state();
        if from != LinkState::OfferSent {
            if from.is_closed() {
                return Err(LinkError::Closed.into());
            }
            return Err(LinkError::IllegalTransition {
                from,
                event: LinkEvent::Answered,
            }
            .into());
        }
        if self.link.remote_description().is_some() {
            return Err(LinkError::RemoteDescriptionAlreadySet.into());
        }
        self.session.apply_remote_description(answer.clone()).await?;
        self.link.record_remote_description(answer)?;
        self.flush_candidates().await;
        Ok(self.link.apply(LinkEvent::Answered)?)
    }

    /// Queue or apply a remote candidate.  Returns `true` if it went to the
    /// transport right away.
    pub async fn add_remote_candidate(&mut self, candidate: Value) -> Result<bool, ClientError> {
        match self.link.enqueue_candidate(candidate)? {
            Some(candidate) => {
                if let Err(e) = self.session.apply_remote_candidate(candidate).await {
                    warn!(remote_id = %self.remote_id(), "candidate rejected: {e}");
                }
                Ok(true)
            }
            None => {
                debug!(
                    remote_id = %self.remote_id(),
                    buffered = self.link.buffered_candidates(),
                    "candidate buffered"
                );
                Ok(false)
            }
        }
    }

    /// Feed a transport state report.  Returns the new link state if it moved.
    pub fn transport_state(&mut self, state: ConnectionState) -> Option<LinkState> {
        match state {
            ConnectionState::Connected => {
                let moved = self.link.transport_connected();
                if let Some(s) = moved {
                    info!(remote_id = %self.remote_id(), state = %s, "media connected");
                }
                moved
            }
            ConnectionState::Disconnected | ConnectionState::Failed => {
                warn!(remote_id = %self.remote_id(), ?state, "media transport lost");
                self.link.transport_lost();
                None
            }
            _ => {
                debug!(remote_id = %self.remote_id(), ?state, "transport state");
                None
            }
        }
    }

    pub fn set_self_muted(&mut self, muted: bool) -> MuteFlags {
        self.link.set_self_muted(muted)
    }

    pub fn set_imposed_muted(&mut self, muted: bool) -> MuteFlags {
        self.link.set_imposed_muted(muted)
    }

    /// Push the combined mute flags to the outgoing leg.
    pub async fn sync_mute(&self) -> Result<bool, ClientError> {
        let suppressed = self.link.mute().suppressed();
        self.session.set_outgoing_muted(suppressed).await?;
        Ok(suppressed)
    }

    /// Idempotent.  Releases buffered candidates and discards the session.
    pub async fn close(&mut self) {
        if self.link.close() {
            self.session.close().await;
            info!(remote_id = %self.remote_id(), "link closed");
        }
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.link.is_closed() {
            return Err(LinkError::Closed.into());
        }
        Ok(())
    }

    async fn flush_candidates(&mut self) {
        for candidate in self.link.flush_candidates() {
            // Each candidate stands alone; one bad one does not stop the rest.
            if let Err(e) = self.session.apply_remote_candidate(candidate).await {
                warn!(remote_id = %self.remote_id(), "buffered candidate rejected: {e}");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
