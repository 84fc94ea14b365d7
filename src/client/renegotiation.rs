// src/client/renegotiation.rs
//
// Mid-call media changes on the remote side.
//
// A `mode-update` or `bitrate-update` rebuilds the outgoing audio leg and
// runs a fresh offer/answer round over the same link:
//
//   reconfigure leg -> new offer -> OfferSent -> (answer) -> Answered
//
// Only the addressed link is touched and the relay connection is never
// involved beyond sending the new offer.  A failure leaves the link as it
// was and is reported to the caller.
//
// ────────────────────────────────────────────────────────────────────────────

use serde_json::Value;
use tracing::{debug, info, warn};

use super::peer::PeerDriver;
use super::{ClientError, Outbox};
use crate::protocol::{Envelope, RemoteId};
use crate::transport::MediaConfig;

const MIN_BITRATE_KBPS: u32 = 6;
const MAX_BITRATE_KBPS: u32 = 510;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaChange {
    Channels(u8),
    Bitrate(u32),
}

impl MediaChange {
    /// Interpret a `mode-update` value: `"mono"`, `"stereo"`, or a channel
    /// count (number or numeric string).
    pub fn from_mode(value: &Value) -> Result<Self, ClientError> {
        let channels = match value {
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "mono" => 1,
                "stereo" => 2,
                other => other
                    .parse::<u8>()
                    .map_err(|_| ClientError::InvalidSetting(format!("mode '{s}'")))?,
            },
            Value::Number(n) => n
                .as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| ClientError::InvalidSetting(format!("mode {n}")))?,
            other => return Err(ClientError::InvalidSetting(format!("mode {other}"))),
        };
        if !(1..=2).contains(&channels) {
            return Err(ClientError::InvalidSetting(format!(
                "{channels} channels (expected 1 or 2)"
            )));
        }
        Ok(Self::Channels(channels))
    }

    /// Interpret a `bitrate-update` value in kbps (number or numeric string).
    pub fn from_bitrate(value: &Value) -> Result<Self, ClientError> {
        let kbps = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().trim_end_matches("kbps").trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|k| k.is_finite() && *k > 0.0)
        .ok_or_else(|| ClientError::InvalidSetting(format!("bitrate {value}")))?;

        let kbps = (kbps.round() as u32).clamp(MIN_BITRATE_KBPS, MAX_BITRATE_KBPS);
        Ok(Self::Bitrate(kbps))
    }

    pub fn applied_to(self, config: MediaConfig) -> MediaConfig {
        match self {
            Self::Channels(channels) => MediaConfig { channels, ..config },
            Self::Bitrate(bitrate_kbps) => MediaConfig {
                bitrate_kbps,
                ..config
            },
        }
    }
}

/// Apply `change` and, if there is a live link, renegotiate it.
///
/// `config` is the remote's current media configuration; it is updated
/// once the transport accepted the change, so a link created later starts
/// from the new settings even when no call is up.
pub async fn renegotiate(
    driver: Option<&mut PeerDriver>,
    config: &mut MediaConfig,
    change: MediaChange,
    self_id: &RemoteId,
    outbox: &dyn Outbox,
) -> Result<bool, ClientError> {
    let next = change.applied_to(*config);

    let Some(driver) = driver.filter(|d| !d.link().is_closed()) else {
        debug!(?change, "no live link, media change stored for the next call");
        *config = next;
        return Ok(false);
    };

    if next == *config {
        debug!(?change, "media configuration unchanged");
        return Ok(false);
    }

    driver.session().reconfigure(next).await?;

    // The round only opens once the offer exists.
    let offer = match driver.create_offer().await {
        Ok(offer) => offer,
        Err(e) => {
            if let Err(restore) = driver.session().reconfigure(*config).await {
                warn!(remote_id = %self_id, "could not restore previous media settings: {restore}");
            }
            return Err(e);
        }
    };
    *config = next;

    outbox.send(Envelope::Offer {
        from: self_id.clone(),
        sdp: offer,
    });

    info!(
        remote_id = %self_id,
        channels = next.channels,
        bitrate_kbps = next.bitrate_kbps,
        "renegotiating with new media settings"
    );
    Ok(true)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::testing::{CaptureOutbox, FakeSession};
    use crate::link::LinkState;
    use crate::transport::ConnectionState;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn mode_values() {
        assert_eq!(MediaChange::from_mode(&json!("mono")).unwrap(), MediaChange::Channels(1));
        assert_eq!(MediaChange::from_mode(&json!("Stereo")).unwrap(), MediaChange::Channels(2));
        assert_eq!(MediaChange::from_mode(&json!(2)).unwrap(), MediaChange::Channels(2));
        assert_eq!(MediaChange::from_mode(&json!("1")).unwrap(), MediaChange::Channels(1));
        assert!(MediaChange::from_mode(&json!("surround")).is_err());
        assert!(MediaChange::from_mode(&json!(6)).is_err());
        assert!(MediaChange::from_mode(&json!(true)).is_err());
    }

    #[test]
    fn bitrate_values() {
        assert_eq!(MediaChange::from_bitrate(&json!(96)).unwrap(), MediaChange::Bitrate(96));
        assert_eq!(MediaChange::from_bitrate(&json!("128")).unwrap(), MediaChange::Bitrate(128));
        assert_eq!(MediaChange::from_bitrate(&json!("32 kbps")).unwrap(), MediaChange::Bitrate(32));
        assert_eq!(MediaChange::from_bitrate(&json!(9000)).unwrap(), MediaChange::Bitrate(510));
        assert!(MediaChange::from_bitrate(&json!(0)).is_err());
        assert!(MediaChange::from_bitrate(&json!("fast")).is_err());
    }

    async fn connected_driver() -> (PeerDriver, Arc<FakeSession>) {
        let session = Arc::new(FakeSession::default());
        let mut d = PeerDriver::new(RemoteId::from("r1"), session.clone());
        d.begin_negotiation().unwrap();
        d.create_offer().await.unwrap();
        d.accept_answer(json!({"type": "answer", "sdp": "a"})).await.unwrap();
        d.transport_state(ConnectionState::Connected);
        d.set_imposed_muted(true);
        (d, session)
    }

    #[tokio::test]
    async fn bitrate_change_sends_new_offer_on_same_link() {
        let (mut d, session) = connected_driver().await;
        let outbox = CaptureOutbox::default();
        let mut config = MediaConfig::default();

        let renegotiated = renegotiate(
            Some(&mut d),
            &mut config,
            MediaChange::Bitrate(128),
            &RemoteId::from("r1"),
            &outbox,
        )
        .await
        .unwrap();

        assert!(renegotiated);
        assert_eq!(config.bitrate_kbps, 128);
        assert_eq!(session.config.lock().unwrap().bitrate_kbps, 128);
        assert_eq!(d.state(), LinkState::OfferSent);
        assert!(d.link().mute().imposed_muted);

        let sent = outbox.take();
        assert_eq!(sent.len(), 1);
        assert!(matches!(&sent[0], Envelope::Offer { from, .. } if from.as_str() == "r1"));

        // The studio's answer brings the still-up transport back to Connected.
        assert_eq!(
            d.accept_answer(json!({"type": "answer", "sdp": "a2"})).await.unwrap(),
            LinkState::Connected
        );
    }

    #[tokio::test]
    async fn failed_reconfigure_leaves_link_alone() {
        let session = Arc::new(FakeSession::failing_reconfigure());
        let mut d = PeerDriver::new(RemoteId::from("r1"), session);
        d.begin_negotiation().unwrap();
        d.create_offer().await.unwrap();
        d.accept_answer(json!({"type": "answer"})).await.unwrap();

        let outbox = CaptureOutbox::default();
        let mut config = MediaConfig::default();
        let err = renegotiate(
            Some(&mut d),
            &mut config,
            MediaChange::Channels(2),
            &RemoteId::from("r1"),
            &outbox,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(d.state(), LinkState::Answered);
        assert_eq!(config, MediaConfig::default());
        assert!(outbox.take().is_empty());
    }

    #[tokio::test]
    async fn failed_offer_restores_media_and_link() {
        let (mut d, session) = connected_driver().await;
        session.fail_produce.store(true, std::sync::atomic::Ordering::Relaxed);
        let before = d.state();

        let outbox = CaptureOutbox::default();
        let mut config = MediaConfig::default();
        let err = renegotiate(
            Some(&mut d),
            &mut config,
            MediaChange::Channels(2),
            &RemoteId::from("r1"),
            &outbox,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ClientError::Transport(_)));
        assert_eq!(d.state(), before);
        assert_eq!(config, MediaConfig::default());
        assert_eq!(*session.config.lock(), Some(MediaConfig::default()));
        assert!(outbox.take().is_empty());
    }

    #[tokio::test]
    async fn change_without_link_is_stored() {
        let outbox = CaptureOutbox::default();
        let mut config = MediaConfig::default();
        let renegotiated = renegotiate(
            None,
            &mut config,
            MediaChange::Channels(2),
            &RemoteId::from("r1"),
            &outbox,
        )
        .await
        .unwrap();
        assert!(!renegotiated);
        assert_eq!(config.channels, 2);
        assert!(outbox.take().is_empty());
    }
}
