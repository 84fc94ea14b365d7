// src/client/studio.rs
//
// Studio-side controller: one PeerDriver per announced remote.
//
// On `new-remote` the studio creates a link and asks that remote to start
// negotiating; every `offer` is answered on the matching link (creating one
// if another studio started the round); candidates are buffered until the
// offer has been applied.  Losing the relay closes every link.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::peer::PeerDriver;
use super::{ChatLine, ClientError, Outbox};
use crate::link::LinkState;
use crate::protocol::{Envelope, RemoteId};
use crate::transport::{MediaConfig, SessionFactory, TransportEvent, TransportEventSender};

struct RemoteSlot {
    name: Option<String>,
    driver: PeerDriver,
}

pub struct StudioController {
    outbox: Arc<dyn Outbox>,
    factory: Arc<dyn SessionFactory>,
    transport_tx: TransportEventSender,
    media: MediaConfig,
    remotes: BTreeMap<RemoteId, RemoteSlot>,
    chat: Vec<ChatLine>,
}

impl StudioController {
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
            remotes: BTreeMap::new(),
            chat: Vec::new(),
        }
    }

    // ── Queries ─────────────────────────────────────────────────────────

    pub fn remotes(&self) -> Vec<RemoteId> {
        self.remotes.keys().cloned().collect()
    }

    pub fn remote_name(&self, id: &RemoteId) -> Option<&str> {
        self.remotes.get(id).and_then(|s| s.name.as_deref())
    }

    pub fn link_state(&self, id: &RemoteId) -> Option<LinkState> {
        self.remotes.get(id).map(|s| s.driver.state())
    }

    pub fn driver(&self, id: &RemoteId) -> Option<&PeerDriver> {
        self.remotes.get(id).map(|s| &s.driver)
    }

    /// Chat lines received since the last call.
    pub fn take_chat(&mut self) -> Vec<ChatLine> {
        std::mem::take(&mut self.chat)
    }

    // ── Relay input ─────────────────────────────────────────────────────

    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        match envelope {
            Envelope::Welcome { .. } => {
                info!("studio joined relay");
                Ok(())
            }

            Envelope::NewRemote { id, name } => {
                info!(remote_id = %id, name = ?name, "remote announced");
                self.open_link(&id, name).await?;
                if let Some(slot) = self.remotes.get_mut(&id) {
                    slot.driver.begin_negotiation()?;
                }
                self.outbox.send(Envelope::ReadyForOffer { target: id });
                Ok(())
            }

            Envelope::RemoteDisconnected { id, .. } => {
                if let Some(mut slot) = self.remotes.remove(&id) {
                    slot.driver.close().await;
                    info!(remote_id = %id, "remote left");
                }
                Ok(())
            }

            Envelope::Offer { from, sdp } => self.answer_offer(from, sdp).await,

            Envelope::Candidate {
                from: Some(from),
                candidate,
                ..
            } => {
                let Some(slot) = self.remotes.get_mut(&from) else {
                    warn!(remote_id = %from, "candidate for unknown link dropped");
                    return Ok(());
                };
                slot.driver.add_remote_candidate(candidate).await?;
                Ok(())
            }

            Envelope::MuteUpdate {
                from: Some(from),
                muted,
                ..
            } => {
                if let Some(slot) = self.remotes.get_mut(&from) {
                    slot.driver.set_self_muted(muted);
                    info!(remote_id = %from, muted, "remote self-mute changed");
                }
                Ok(())
            }

            Envelope::Chat { from, text, .. } => {
                info!(from = ?from, "chat: {text}");
                self.chat.push(ChatLine { from, text });
                Ok(())
            }

            other => {
                debug!(envelope_type = other.kind(), "studio ignores envelope");
                Ok(())
            }
        }
    }

    /// React to the media transport of one of our links.
    pub fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::LocalCandidate { remote, candidate } => {
                if self.remotes.contains_key(&remote) {
                    self.outbox.send(Envelope::Candidate {
                        from: None,
                        target: Some(remote),
                        candidate,
                    });
                }
            }
            TransportEvent::StateChanged { remote, state } => {
                if let Some(slot) = self.remotes.get_mut(&remote) {
                    slot.driver.transport_state(state);
                }
            }
        }
    }

    /// The relay connection dropped: every link goes with it.  The relay
    /// replays the remote list once we are back.
    pub async fn relay_lost(&mut self) {
        let count = self.remotes.len();
        for (_, mut slot) in std::mem::take(&mut self.remotes) {
            slot.driver.close().await;
        }
        if count > 0 {
            warn!(links = count, "relay lost, all links closed");
        }
    }

    // ── Operator commands ───────────────────────────────────────────────

    /// Impose (or lift) a mute on one remote.
    pub fn mute(&mut self, target: &RemoteId, muted: bool) -> bool {
        let Some(slot) = self.remotes.get_mut(target) else {
            return false;
        };
        slot.driver.set_imposed_muted(muted);
        self.outbox.send(Envelope::MuteUpdate {
            target: Some(target.clone()),
            from: None,
            muted,
        })
    }

    pub fn kick(&self, target: &RemoteId) -> bool {
        self.remotes.contains_key(target)
            && self.outbox.send(Envelope::KickRemote {
                target: target.clone(),
            })
    }

    /// Ask a remote to switch channel mode (`"mono"` / `"stereo"`).
    pub fn set_mode(&self, target: &RemoteId, mode: impl Into<Value>) -> bool {
        self.remotes.contains_key(target)
            && self.outbox.send(Envelope::ModeUpdate {
                target: target.clone(),
                value: mode.into(),
            })
    }

    pub fn set_bitrate(&self, target: &RemoteId, kbps: u32) -> bool {
        self.remotes.contains_key(target)
            && self.outbox.send(Envelope::BitrateUpdate {
                target: target.clone(),
                value: Value::from(kbps),
            })
    }

    /// `target = None` reaches every remote.
    pub fn chat(&self, target: Option<RemoteId>, text: impl Into<String>) -> bool {
        self.outbox.send(Envelope::Chat {
            from: None,
            target,
            text: text.into(),
        })
    }

    // ── Internals ───────────────────────────────────────────────────────

    /// Create a fresh link for `id`, closing any previous one first.
    async fn open_link(&mut self, id: &RemoteId, name: Option<String>) -> Result<(), ClientError> {
        if let Some(mut old) = self.remotes.remove(id) {
            old.driver.close().await;
        }
        let session = self
            .factory
            .create(id, self.media, self.transport_tx.clone())
            .await?;
        self.remotes.insert(
            id.clone(),
            RemoteSlot {
                name,
                driver: PeerDriver::new(id.clone(), session),
            },
        );
        Ok(())
    }

    async fn answer_offer(&mut self, from: RemoteId, sdp: Value) -> Result<(), ClientError> {
        if !self.remotes.contains_key(&from) {
            // Another studio started this round.
            debug!(remote_id = %from, "offer for a link we did not open");
            self.open_link(&from, None).await?;
        }
        let Some(slot) = self.remotes.get_mut(&from) else {
            return Err(ClientError::NoSuchLink(from));
        };

        let answer = slot.driver.accept_offer(sdp).await?;
        let state = slot.driver.state();
        self.outbox.send(Envelope::Answer {
            target: from.clone(),
            sdp: answer,
        });
        info!(remote_id = %from, %state, "answer sent");
        Ok(())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{CaptureOutbox, FakeFactory};
    use crate::transport::ConnectionState;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn studio() -> (StudioController, Arc<CaptureOutbox>, Arc<FakeFactory>) {
        let outbox = Arc::new(CaptureOutbox::default());
        let factory = Arc::new(FakeFactory::default());
        let (tx, _rx) = mpsc::unbounded_channel();
        let controller =
            StudioController::new(outbox.clone(), factory.clone(), tx, MediaConfig::default());
        (controller, outbox, factory)
    }

    fn offer(sdp: &str) -> Envelope {
        Envelope::Offer {
            from: "r1".into(),
            sdp: json!({"type": "offer", "sdp": sdp}),
        }
    }

    #[tokio::test]
    async fn new_remote_requests_offer_and_answers_it() {
        let (mut studio, outbox, factory) = studio();
        let r1 = RemoteId::from("r1");

        studio
            .handle_envelope(Envelope::NewRemote {
                id: r1.clone(),
                name: Some("A".into()),
            })
            .await
            .unwrap();
        assert_eq!(studio.link_state(&r1), Some(LinkState::Ready));
        assert_eq!(studio.remote_name(&r1), Some("A"));
        assert_eq!(outbox.take(), vec![Envelope::ReadyForOffer { target: r1.clone() }]);

        studio.handle_envelope(offer("o1")).await.unwrap();
        assert_eq!(studio.link_state(&r1), Some(LinkState::Answered));
        let sent = outbox.take();
        assert!(matches!(&sent[..], [Envelope::Answer { target, .. }] if *target == r1));
        assert_eq!(factory.count(), 1);

        studio.handle_transport(TransportEvent::StateChanged {
            remote: r1.clone(),
            state: ConnectionState::Connected,
        });
        assert_eq!(studio.link_state(&r1), Some(LinkState::Connected));
    }

    #[tokio::test]
    async fn second_offer_on_connected_link_keeps_the_link() {
        let (mut studio, outbox, factory) = studio();
        let r1 = RemoteId::from("r1");
        studio
            .handle_envelope(Envelope::NewRemote { id: r1.clone(), name: None })
            .await
            .unwrap();
        studio.handle_envelope(offer("o1")).await.unwrap();
        studio.handle_transport(TransportEvent::StateChanged {
            remote: r1.clone(),
            state: ConnectionState::Connected,
        });
        studio.handle_envelope(Envelope::MuteUpdate {
            target: None,
            from: Some(r1.clone()),
            muted: true,
        })
        .await
        .unwrap();
        assert!(studio.mute(&r1, true));
        outbox.take();

        studio.handle_envelope(offer("o2")).await.unwrap();

        assert_eq!(factory.count(), 1);
        assert_eq!(studio.link_state(&r1), Some(LinkState::Connected));
        let mute = studio.driver(&r1).unwrap().link().mute();
        assert!(mute.self_muted && mute.imposed_muted);
        assert!(matches!(&outbox.take()[..], [Envelope::Answer { .. }]));
    }

    #[tokio::test]
    async fn early_candidates_wait_for_the_offer() {
        let (mut studio, _outbox, factory) = studio();
        let r1 = RemoteId::from("r1");
        studio
            .handle_envelope(Envelope::NewRemote { id: r1.clone(), name: None })
            .await
            .unwrap();

        for c in ["c1", "c2", "c3"] {
            studio
                .handle_envelope(Envelope::Candidate {
                    from: Some(r1.clone()),
                    target: None,
                    candidate: json!(c),
                })
                .await
                .unwrap();
        }
        let session = factory.last();
        assert!(session.applied_candidates.lock().is_empty());

        studio.handle_envelope(offer("o1")).await.unwrap();
        assert_eq!(
            *session.applied_candidates.lock(),
            vec![json!("c1"), json!("c2"), json!("c3")]
        );
    }

    #[tokio::test]
    async fn offer_without_announcement_opens_a_link() {
        let (mut studio, outbox, _factory) = studio();
        studio.handle_envelope(offer("o1")).await.unwrap();
        assert_eq!(studio.link_state(&"r1".into()), Some(LinkState::Answered));
        assert!(matches!(&outbox.take()[..], [Envelope::Answer { .. }]));
    }

    #[tokio::test]
    async fn disconnect_and_relay_loss_close_links() {
        let (mut studio, _outbox, factory) = studio();
        for id in ["r1", "r2"] {
            studio
                .handle_envelope(Envelope::NewRemote { id: id.into(), name: None })
                .await
                .unwrap();
        }

        studio
            .handle_envelope(Envelope::RemoteDisconnected {
                id: "r1".into(),
                name: None,
            })
            .await
            .unwrap();
        assert_eq!(studio.remotes(), vec![RemoteId::from("r2")]);

        // Late candidate for the departed remote is dropped quietly.
        studio
            .handle_envelope(Envelope::Candidate {
                from: Some("r1".into()),
                target: None,
                candidate: json!("late"),
            })
            .await
            .unwrap();

        studio.relay_lost().await;
        assert!(studio.remotes().is_empty());
        let closed = factory
            .sessions
            .lock()
            .iter()
            .filter(|(_, s)| s.calls.lock().contains(&"close".to_string()))
            .count();
        assert_eq!(closed, 2);
    }

    #[tokio::test]
    async fn local_candidates_are_addressed_to_the_remote() {
        let (mut studio, outbox, _factory) = studio();
        let r1 = RemoteId::from("r1");
        studio
            .handle_envelope(Envelope::NewRemote { id: r1.clone(), name: None })
            .await
            .unwrap();
        outbox.take();

        studio.handle_transport(TransportEvent::LocalCandidate {
            remote: r1.clone(),
            candidate: json!({"candidate": "host"}),
        });
        assert_eq!(
            outbox.take(),
            vec![Envelope::Candidate {
                from: None,
                target: Some(r1),
                candidate: json!({"candidate": "host"})
            }]
        );
    }

    #[tokio::test]
    async fn commands_only_target_known_remotes() {
        let (mut studio, outbox, _factory) = studio();
        let r1 = RemoteId::from("r1");
        assert!(!studio.kick(&r1));
        assert!(!studio.set_bitrate(&r1, 96));

        studio
            .handle_envelope(Envelope::NewRemote { id: r1.clone(), name: None })
            .await
            .unwrap();
        outbox.take();

        assert!(studio.set_mode(&r1, "stereo"));
        assert!(studio.set_bitrate(&r1, 96));
        assert!(studio.kick(&r1));
        assert_eq!(
            outbox.take(),
            vec![
                Envelope::ModeUpdate {
                    target: r1.clone(),
                    value: json!("stereo")
                },
                Envelope::BitrateUpdate {
                    target: r1.clone(),
                    value: json!(96)
                },
                Envelope::KickRemote { target: r1 },
            ]
        );
    }
}
