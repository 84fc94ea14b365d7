// src/protocol.rs
//
// Wire contract between studios, remotes, and the relay.
//
// Every message is a JSON object carrying a `type` tag plus type-specific
// fields.  Negotiation payloads (`sdp`, `candidate`) are opaque
// `serde_json::Value`s: the relay routes them by type and addressing only.
//
// Decoding is a two-step affair so that unknown tags can be told apart from
// broken envelopes:
//
//   1. parse into a `Value` (malformed JSON -> `ProtocolError::Malformed`)
//   2. check the tag against `KNOWN_TYPES` (-> `ProtocolError::UnknownType`)
//   3. deserialize the typed `Envelope` (-> `ProtocolError::Invalid`)
//
// ────────────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── Identity types ─────────────────────────────────────────────────────────

/// Which side of the session a party is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Studio,
    Remote,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Studio => "studio",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable identifier of a remote.  Survives reconnects when the client
/// resubmits it in `join`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteId(String);

impl RemoteId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RemoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemoteId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ─── Envelope ───────────────────────────────────────────────────────────────

/// One relay message.
///
/// ```json
/// { "type": "answer", "target": "r1", "sdp": { "type": "answer", "sdp": "v=0..." } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Envelope {
    /// client -> relay: announce role (and, for a remote, a held id).
    Join {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RemoteId>,
    },
    /// relay -> client: `join` accepted.  `id` is set for remotes.
    Welcome {
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<RemoteId>,
    },
    /// relay -> studio
    NewRemote {
        id: RemoteId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// relay -> studio
    RemoteDisconnected {
        id: RemoteId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// studio -> relay: ask `target` to begin negotiation.
    ReadyForOffer { target: RemoteId },
    /// relay -> remote: begin negotiation.
    StartCall,
    /// remote -> relay -> every studio
    Offer { from: RemoteId, sdp: Value },
    /// studio -> relay -> `target`
    Answer { target: RemoteId, sdp: Value },
    /// remote -> studios carries `from`; studio -> remote carries `target`.
    Candidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<RemoteId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<RemoteId>,
        candidate: Value,
    },
    /// studio -> remote: channel mode (`"mono"`, `"stereo"`, or a count).
    ModeUpdate { target: RemoteId, value: Value },
    /// studio -> remote: target bitrate in kbps.
    BitrateUpdate { target: RemoteId, value: Value },
    /// studio -> remote carries `target` (imposed mute);
    /// remote -> studios carries `from` (self mute).
    MuteUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<RemoteId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<RemoteId>,
        muted: bool,
    },
    /// studio -> relay
    KickRemote { target: RemoteId },
    /// relay -> remote, right before the relay closes its connection.
    Kick {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Chat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<RemoteId>,
        text: String,
    },
    /// client -> relay liveness ping.  Never answered.
    Keepalive,
}

/// Every tag the protocol understands.  Anything else is logged and ignored.
pub const KNOWN_TYPES: &[&str] = &[
    "join",
    "welcome",
    "new-remote",
    "remote-disconnected",
    "ready-for-offer",
    "start-call",
    "offer",
    "answer",
    "candidate",
    "mode-update",
    "bitrate-update",
    "mute-update",
    "kick-remote",
    "kick",
    "chat",
    "keepalive",
];

impl Envelope {
    /// The wire tag of this envelope.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Welcome { .. } => "welcome",
            Self::NewRemote { .. } => "new-remote",
            Self::RemoteDisconnected { .. } => "remote-disconnected",
            Self::ReadyForOffer { .. } => "ready-for-offer",
            Self::StartCall => "start-call",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
            Self::ModeUpdate { .. } => "mode-update",
            Self::BitrateUpdate { .. } => "bitrate-update",
            Self::MuteUpdate { .. } => "mute-update",
            Self::KickRemote { .. } => "kick-remote",
            Self::Kick { .. } => "kick",
            Self::Chat { .. } => "chat",
            Self::Keepalive => "keepalive",
        }
    }

    /// Envelopes only the relay may emit.
    pub fn is_relay_only(&self) -> bool {
        matches!(
            self,
            Self::Welcome { .. }
                | Self::NewRemote { .. }
                | Self::RemoteDisconnected { .. }
                | Self::StartCall
                | Self::Kick { .. }
        )
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Presence check for the opaque payloads: `null` counts as missing.
    fn validate(self) -> Result<Self, ProtocolError> {
        let missing = match &self {
            Self::Offer { sdp, .. } | Self::Answer { sdp, .. } if sdp.is_null() => Some("sdp"),
            Self::Candidate { candidate, .. } if candidate.is_null() => Some("candidate"),
            Self::ModeUpdate { value, .. } | Self::BitrateUpdate { value, .. } if value.is_null() => {
                Some("value")
            }
            _ => None,
        };
        match missing {
            Some(field) => Err(ProtocolError::MissingField {
                kind: self.kind(),
                field,
            }),
            None => Ok(self),
        }
    }
}

// ─── Decoding ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed JSON: {0}")]
    Malformed(#[source] serde_json::Error),

    #[error("envelope has no string `type` tag")]
    MissingType,

    #[error("unknown envelope type '{0}'")]
    UnknownType(String),

    #[error("invalid '{kind}' envelope: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("'{kind}' envelope is missing '{field}'")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },
}

impl ProtocolError {
    /// Unknown types are the forward-compatibility path, not a fault.
    pub fn is_unknown_type(&self) -> bool {
        matches!(self, Self::UnknownType(_))
    }
}

/// Decode one text frame into an `Envelope`.
pub fn decode(text: &str) -> Result<Envelope, ProtocolError> {
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !KNOWN_TYPES.contains(&tag.as_str()) {
        return Err(ProtocolError::UnknownType(tag));
    }

    let envelope: Envelope = serde_json::from_value(value)
        .map_err(|source| ProtocolError::Invalid { kind: tag, source })?;

    envelope.validate()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_without_optional_fields() {
        let env = decode(r#"{"type":"join","role":"remote"}"#).unwrap();
        assert_eq!(
            env,
            Envelope::Join {
                role: Role::Remote,
                name: None,
                id: None
            }
        );
    }

    #[test]
    fn offer_keeps_sdp_opaque() {
        let sdp = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 0.0.0.0\r\n"});
        let text = json!({"type": "offer", "from": "r1", "sdp": sdp}).to_string();

        match decode(&text).unwrap() {
            Envelope::Offer { from, sdp: got } => {
                assert_eq!(from, RemoteId::from("r1"));
                assert_eq!(got, sdp);
            }
            other => panic!("unexpected envelope {other:?}"),
        }
    }

    #[test]
    fn serialization_uses_kebab_case_tags() {
        let json = Envelope::ReadyForOffer {
            target: "r1".into(),
        }
        .to_text()
        .unwrap();
        assert_eq!(json, r#"{"type":"ready-for-offer","target":"r1"}"#);

        let json = Envelope::StartCall.to_text().unwrap();
        assert_eq!(json, r#"{"type":"start-call"}"#);

        let json = Envelope::NewRemote {
            id: "r1".into(),
            name: Some("A".into()),
        }
        .to_text()
        .unwrap();
        assert_eq!(json, r#"{"type":"new-remote","id":"r1","name":"A"}"#);
    }

    #[test]
    fn unknown_type_is_distinguished() {
        let err = decode(r#"{"type":"vu-meter","level":3}"#).unwrap_err();
        assert!(err.is_unknown_type());
        assert!(err.to_string().contains("vu-meter"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        let err = decode("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        assert!(!err.is_unknown_type());
    }

    #[test]
    fn missing_type_tag() {
        let err = decode(r#"{"target":"r1"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn missing_required_field_is_invalid() {
        let err = decode(r#"{"type":"answer","sdp":"x"}"#).unwrap_err();
        match err {
            ProtocolError::Invalid { kind, .. } => assert_eq!(kind, "answer"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn null_payload_counts_as_missing() {
        let err = decode(r#"{"type":"candidate","from":"r1","candidate":null}"#).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::MissingField {
                kind: "candidate",
                field: "candidate"
            }
        ));
    }

    #[test]
    fn keepalive_ignores_extra_fields() {
        let env = decode(r#"{"type":"keepalive","ts":12345}"#).unwrap();
        assert_eq!(env, Envelope::Keepalive);
    }

    #[test]
    fn every_known_type_matches_kind() {
        let samples = vec![
            Envelope::Join { role: Role::Studio, name: None, id: None },
            Envelope::Welcome { role: Role::Studio, id: None },
            Envelope::NewRemote { id: "r".into(), name: None },
            Envelope::RemoteDisconnected { id: "r".into(), name: None },
            Envelope::ReadyForOffer { target: "r".into() },
            Envelope::StartCall,
            Envelope::Offer { from: "r".into(), sdp: json!("o") },
            Envelope::Answer { target: "r".into(), sdp: json!("a") },
            Envelope::Candidate { from: None, target: Some("r".into()), candidate: json!("c") },
            Envelope::ModeUpdate { target: "r".into(), value: json!("mono") },
            Envelope::BitrateUpdate { target: "r".into(), value: json!(64) },
            Envelope::MuteUpdate { target: None, from: Some("r".into()), muted: true },
            Envelope::KickRemote { target: "r".into() },
            Envelope::Kick { reason: None },
            Envelope::Chat { from: None, target: None, text: "hi".into() },
            Envelope::Keepalive,
        ];
        assert_eq!(samples.len(), KNOWN_TYPES.len());
        for env in samples {
            assert!(KNOWN_TYPES.contains(&env.kind()));
            let text = env.to_text().unwrap();
            assert_eq!(decode(&text).unwrap(), env);
        }
    }

    #[test]
    fn relay_only_envelopes() {
        assert!(Envelope::StartCall.is_relay_only());
        assert!(Envelope::Kick { reason: None }.is_relay_only());
        assert!(!Envelope::Keepalive.is_relay_only());
        assert!(!Envelope::Offer { from: "r".into(), sdp: json!("o") }.is_relay_only());
    }
}
