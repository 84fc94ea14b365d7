// src/webrtc_transport.rs
//
// `MediaSession` backed by a webrtc-rs `RTCPeerConnection`.
//
// One peer connection per link, one audio leg:
//   - remote side: a local Opus track the audio feeder writes samples into;
//   - studio side: a receive-only audio transceiver.
//
// Descriptions travel as `{"type": "offer"|"answer", "sdp": "..."}` and
// candidates as `RTCIceCandidateInit` JSON.  Candidates are trickled: every
// locally gathered one is pushed to the driver as a `TransportEvent`.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::protocol::{RemoteId, Role};
use crate::transport::{
    ConnectionState, MediaConfig, MediaSession, SessionFactory, TransportError, TransportEvent,
    TransportEventSender,
};

// ─── PeerConnection factory ─────────────────────────────────────────────────

async fn create_peer_connection(
    stun_urls: &[String],
) -> Result<Arc<RTCPeerConnection>, webrtc::Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let ice_servers = stun_urls
        .iter()
        .map(|url| RTCIceServer {
            urls: vec![url.clone()],
            ..Default::default()
        })
        .collect();

    let config = RTCConfiguration {
        ice_servers,
        ..Default::default()
    };

    Ok(Arc::new(api.new_peer_connection(config).await?))
}

fn opus_capability(config: MediaConfig) -> RTCRtpCodecCapability {
    let stereo = u8::from(config.channels > 1);
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_OPUS.to_string(),
        clock_rate: 48_000,
        channels: u16::from(config.channels),
        sdp_fmtp_line: format!(
            "minptime=10;useinbandfec=1;stereo={stereo};sprop-stereo={stereo};maxaveragebitrate={}",
            config.bitrate_kbps * 1000
        ),
        rtcp_feedback: vec![],
    }
}

fn new_audio_track(config: MediaConfig) -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        opus_capability(config),
        "audio".to_string(),
        "studio-relay".to_string(),
    ))
}

fn map_state(state: RTCPeerConnectionState) -> ConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => ConnectionState::Connecting,
        RTCPeerConnectionState::Connected => ConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => ConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => ConnectionState::Failed,
        RTCPeerConnectionState::Closed => ConnectionState::Closed,
        _ => ConnectionState::New,
    }
}

fn parse_description(value: Value) -> Result<RTCSessionDescription, TransportError> {
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Description("missing 'type'".into()))?;
    let sdp = value
        .get("sdp")
        .and_then(Value::as_str)
        .ok_or_else(|| TransportError::Description("missing 'sdp'".into()))?
        .to_string();

    let parsed = match kind {
        "offer" => RTCSessionDescription::offer(sdp),
        "answer" => RTCSessionDescription::answer(sdp),
        "pranswer" => RTCSessionDescription::pranswer(sdp),
        other => return Err(TransportError::Description(format!("type '{other}'"))),
    };
    parsed.map_err(|e| TransportError::Description(e.to_string()))
}

fn parse_candidate(value: Value) -> Result<RTCIceCandidateInit, TransportError> {
    match value {
        Value::String(candidate) => Ok(RTCIceCandidateInit {
            candidate,
            ..Default::default()
        }),
        other => serde_json::from_value(other).map_err(|e| TransportError::Candidate(e.to_string())),
    }
}

// ─── Session ────────────────────────────────────────────────────────────────

pub struct WebRtcSession {
    remote: RemoteId,
    pc: Arc<RTCPeerConnection>,
    /// Outgoing leg (remote side only).
    sender: Option<Arc<RTCRtpSender>>,
    track: Mutex<Option<Arc<TrackLocalStaticSample>>>,
    config: Mutex<MediaConfig>,
    muted: AtomicBool,
}

impl WebRtcSession {
    pub async fn new(
        role: Role,
        remote: RemoteId,
        config: MediaConfig,
        stun_urls: &[String],
        events: TransportEventSender,
    ) -> Result<Self, TransportError> {
        let pc = create_peer_connection(stun_urls)
            .await
            .map_err(|e| TransportError::Other(format!("peer connection: {e}")))?;

        let (sender, track) = match role {
            Role::Remote => {
                let track = new_audio_track(config);
                let sender = pc
                    .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                    .await
                    .map_err(|e| TransportError::Other(format!("add_track(audio): {e}")))?;
                (Some(sender), Some(track))
            }
            Role::Studio => {
                pc.add_transceiver_from_kind(
                    RTPCodecType::Audio,
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Recvonly,
                        send_encodings: vec![],
                    }),
                )
                .await
                .map_err(|e| TransportError::Other(format!("add_transceiver(audio): {e}")))?;
                (None, None)
            }
        };

        {
            let events = events.clone();
            let remote = remote.clone();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json().map(|init| serde_json::to_value(init)) {
                        Ok(Ok(candidate)) => {
                            let _ = events.send(TransportEvent::LocalCandidate { remote, candidate });
                        }
                        Ok(Err(e)) => warn!(remote_id = %remote, "candidate encode failed: {e}"),
                        Err(e) => warn!(remote_id = %remote, "candidate to_json failed: {e}"),
                    }
                })
            }));
        }

        {
            let remote = remote.clone();
            pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                let remote = remote.clone();
                Box::pin(async move {
                    debug!(remote_id = %remote, %state, "peer connection state");
                    let _ = events.send(TransportEvent::StateChanged {
                        remote,
                        state: map_state(state),
                    });
                })
            }));
        }

        info!(remote_id = %remote, %role, "media session created");

        Ok(Self {
            remote,
            pc,
            sender,
            track: Mutex::new(track),
            config: Mutex::new(config),
            muted: AtomicBool::new(false),
        })
    }

    /// Track the audio feeder writes Opus samples into (remote side).
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.track.lock().clone()
    }

    pub fn media_config(&self) -> MediaConfig {
        *self.config.lock()
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    async fn attach_track(&self, track: Option<Arc<TrackLocalStaticSample>>) -> Result<(), TransportError> {
        let Some(sender) = &self.sender else {
            return Ok(());
        };
        let track = track.map(|t| t as Arc<dyn TrackLocal + Send + Sync>);
        sender
            .replace_track(track)
            .await
            .map_err(|e| TransportError::Other(format!("replace_track: {e}")))
    }
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn produce_local_description(&self) -> Result<Value, TransportError> {
        let description = if self.pc.signaling_state() == RTCSignalingState::HaveRemoteOffer {
            self.pc.create_answer(None).await
        } else {
            self.pc.create_offer(None).await
        }
        .map_err(|e| TransportError::Description(e.to_string()))?;

        self.pc
            .set_local_description(description.clone())
            .await
            .map_err(|e| TransportError::Description(e.to_string()))?;

        Ok(json!({
            "type": description.sdp_type.to_string(),
            "sdp": description.sdp,
        }))
    }

    async fn apply_remote_description(&self, description: Value) -> Result<(), TransportError> {
        let description = parse_description(description)?;
        self.pc
            .set_remote_description(description)
            .await
            .map_err(|e| TransportError::Description(e.to_string()))
    }

    async fn apply_remote_candidate(&self, candidate: Value) -> Result<(), TransportError> {
        let candidate = parse_candidate(candidate)?;
        self.pc
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| TransportError::Candidate(e.to_string()))
    }

    async fn set_outgoing_muted(&self, muted: bool) -> Result<(), TransportError> {
        if self.muted.swap(muted, Ordering::Relaxed) == muted {
            return Ok(());
        }
        let track = if muted { None } else { self.audio_track() };
        self.attach_track(track).await?;
        debug!(remote_id = %self.remote, muted, "outgoing leg muted");
        Ok(())
    }

    async fn reconfigure(&self, config: MediaConfig) -> Result<(), TransportError> {
        if self.sender.is_none() {
            *self.config.lock() = config;
            return Ok(());
        }

        // Detach the old leg before the new one exists.
        self.attach_track(None)
            .await
            .map_err(|e| TransportError::Reconfigure(e.to_string()))?;

        let track = new_audio_track(config);
        *self.track.lock() = Some(track.clone());
        *self.config.lock() = config;

        if !self.is_muted() {
            self.attach_track(Some(track))
                .await
                .map_err(|e| TransportError::Reconfigure(e.to_string()))?;
        }
        info!(
            remote_id = %self.remote,
            channels = config.channels,
            bitrate_kbps = config.bitrate_kbps,
            "outgoing leg rebuilt"
        );
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            warn!(remote_id = %self.remote, "peer connection close failed: {e}");
        }
    }
}

// ─── Factory ────────────────────────────────────────────────────────────────

/// Builds a `WebRtcSession` per link for one client role.
pub struct WebRtcSessionFactory {
    role: Role,
    stun_urls: Vec<String>,
}

impl WebRtcSessionFactory {
    pub fn new(role: Role, stun_urls: Vec<String>) -> Self {
        Self { role, stun_urls }
    }
}

#[async_trait]
impl SessionFactory for WebRtcSessionFactory {
    async fn create(
        &self,
        remote: &RemoteId,
        config: MediaConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn MediaSession>, TransportError> {
        let session =
            WebRtcSession::new(self.role, remote.clone(), config, &self.stun_urls, events).await?;
        Ok(Arc::new(session))
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
