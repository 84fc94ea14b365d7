// src/client/remote.rs
//
// Remote-side controller: at most one PeerDriver, toward the studio side.
//
// `start-call` opens a fresh link and sends an offer; the studio's answer
// and candidates complete it.  Mode and bitrate directives go through the
// renegotiation path on the same link.  Mute has two sources: the remote's
// own toggle and the studio's imposed mute; either one silences the
// outgoing leg.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use tracing::{debug, info, warn};

use super::peer::PeerDriver;
use super::renegotiation::{self, MediaChange};
use super::{ChatLine, ClientError, Outbox};
use crate::link::{LinkState, MuteFlags};
use crate::protocol::{Envelope, RemoteId};
use crate::transport::{MediaConfig, SessionFactory, TransportEvent, TransportEventSender};

pub struct RemoteController {
    outbox: Arc<dyn Outbox>,
    factory: Arc<dyn SessionFactory>,
    transport_tx: TransportEventSender,
    media: MediaConfig,
    id: Option<RemoteId>,
    link: Option<PeerDriver>,
    /// Survives link teardown so a new call starts with the same flags.
    mute: MuteFlags,
    kicked: bool,
    chat: Vec<ChatLine>,
}

impl RemoteController {
    pub fn new(
        outbox: Arc<dyn Outbox>,
        factory: Arc<dyn SessionFactory>,
        transport_tx: TransportEventSender,
        media: MediaConfig,
    ) -> Self {
        Self {
            outbox,
            factory,
            transport_tx,
            media,
            id: None,
            link: None,
            mute: MuteFlags::default(),
            kicked: false,
            chat: Vec::new(),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn id(&self) -> Option<&RemoteId> {
        self.id.as_ref()
    }

    pub fn link_state(&self) -> Option<LinkState> {
        self.link.as_ref().map(|d| d.state())
    }

    pub fn mute(&self) -> MuteFlags {
        self.mute
    }

    pub fn media(&self) -> MediaConfig {
        self.media
    }

    pub fn is_kicked(&self) -> bool {
        self.kicked
    }

    pub fn take_chat(&mut self) -> Vec<ChatLine> {
        std::mem::take(&mut self.chat)
    }

    // ── Relay input ─────────────────────────────────────────────────────

    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        match envelope {
            Envelope::Welcome { id: Some(id), .. } => {
                info!(remote_id = %id, "remote joined relay");
                self.id = Some(id);
                Ok(())
            }

            Envelope::StartCall => self.start_call().await,

            Envelope::Answer { sdp, .. } => {
                let Some(driver) = self.link.as_mut() else {
                    warn!("answer without a link dropped");
                    return Ok(());
                };
                let state = driver.accept_answer(sdp).await?;
                info!(%state, "answer applied");
                Ok(())
            }

            Envelope::Candidate { candidate, .. } => {
                let Some(driver) = self.link.as_mut() else {
                    warn!("candidate without a link dropped");
                    return Ok(());
                };
                driver.add_remote_candidate(candidate).await?;
                Ok(())
            }

            Envelope::MuteUpdate { muted, .. } => {
                info!(muted, "studio mute changed");
                self.mute.imposed_muted = muted;
                self.sync_mute().await
            }

            Envelope::ModeUpdate { value, .. } => {
                let change = MediaChange::from_mode(&value)?;
                self.apply_media_change(change).await
            }

            Envelope::BitrateUpdate { value, .. } => {
                let change = MediaChange::from_bitrate(&value)?;
                self.apply_media_change(change).await
            }

            Envelope::Kick { reason } => {
                warn!(reason = ?reason, "kicked");
                self.kicked = true;
                self.close_link().await;
                Ok(())
            }

            Envelope::Chat { from, text, .. } => {
                info!(from = ?from, "chat: {text}");
                self.chat.push(ChatLine { from, text });
                Ok(())
            }

            other => {
                debug!(envelope_type = other.kind(), "remote ignores envelope");
                Ok(())
            }
        }
    }

    pub fn handle_transport(&mut self, event: TransportEvent) {
        let Some(driver) = self.link.as_mut() else {
            return;
        };
        match event {
            TransportEvent::LocalCandidate { remote, candidate } => {
                if &remote != driver.remote_id() {
                    return;
                }
                self.outbox.send(Envelope::Candidate {
                    from: Some(remote),
                    target: None,
                    candidate,
                });
            }
            TransportEvent::StateChanged { remote, state } => {
                if &remote == driver.remote_id() {
                    driver.transport_state(state);
                }
            }
        }
    }

    /// Relay gone: the studio side is unreachable, so the link goes too.
    /// The studio asks for a new offer after we rejoin.
    pub async fn relay_lost(&mut self) {
        if self.link.is_some() {
            warn!("relay lost, closing link");
        }
        self.close_link().await;
    }

    // ── Local commands ──────────────────────────────────────────────────

    /// Toggle self-mute and tell the studios.
    pub async fn set_self_muted(&mut self, muted: bool) -> Result<(), ClientError> {
        self.mute.self_muted = muted;
        self.sync_mute().await?;
        if let Some(id) = &self.id {
            self.outbox.send(Envelope::MuteUpdate {
                target: None,
                from: Some(id.clone()),
                muted,
            });
        }
        Ok(())
    }

    /// Local change of media settings (same path as a studio directive).
    pub async fn apply_media_change(&mut self, change: MediaChange) -> Result<(), ClientError> {
        let Some(id) = self.id.clone() else {
            self.media = change.applied_to(self.media);
            return Ok(());
        };
        renegotiation::renegotiate(
            self.link.as_mut(),
            &mut self.media,
            change,
            &id,
            self.outbox.as_ref(),
        )
        .await?;
        Ok(())
    }

    pub fn chat(&self, text: impl Into<String>) -> bool {
        self.outbox.send(Envelope::Chat {
            from: self.id.as_ref().map(|id| id.to_string()),
            target: None,
            text: text.into(),
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    async fn start_call(&mut self) -> Result<(), ClientError> {
        let id = self.id.clone().ok_or(ClientError::Unassigned)?;

        // A repeated directive restarts the call on a fresh session.
        self.close_link().await;

        let session = self
            .factory
            .create(&id, self.media, self.transport_tx.clone())
            .await?;
        let mut driver = PeerDriver::new(id.clone(), session);
        driver.set_self_muted(self.mute.self_muted);
        driver.set_imposed_muted(self.mute.imposed_muted);
        driver.sync_mute().await?;
        driver.begin_negotiation()?;

        let offer = driver.create_offer().await?;
        self.link = Some(driver);
        self.outbox.send(Envelope::Offer {
            from: id.clone(),
            sdp: offer,
        });
        info!(remote_id = %id, "offer sent");
        Ok(())
    }

    async fn sync_mute(&mut self) -> Result<(), ClientError> {
        let Some(driver) = self.link.as_mut() else {
            return Ok(());
        };
        driver.set_self_muted(self.mute.self_muted);
        driver.set_imposed_muted(self.mute.imposed_muted);
        driver.sync_mute().await?;
        Ok(())
    }

    async fn close_link(&mut self) {
        if let Some(mut driver) = self.link.take() {
            driver.close().await;
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
