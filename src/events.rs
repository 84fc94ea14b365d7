// src/events.rs
//
// Relay event bus.
//
// Every registry mutation worth watching (parties joining and leaving, link
// state changes, replacements, kicks) is represented as a `RelayEvent`.  A
// single `EventBus` backed by a `tokio::sync::broadcast` channel fans each
// event out to every consumer; today that is the SSE stream at `/v1/events`
// and the test harnesses.
//
// ────────────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::link::LinkState;
use crate::protocol::{RemoteId, Role};

// ─── Event types ────────────────────────────────────────────────────────────

/// Canonical event type string, used in JSON payloads and SSE filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "party.joined")]
    PartyJoined,
    #[serde(rename = "party.left")]
    PartyLeft,
    #[serde(rename = "link.state_changed")]
    LinkStateChanged,
    #[serde(rename = "remote.replaced")]
    RemoteReplaced,
    #[serde(rename = "remote.kicked")]
    RemoteKicked,
}

impl EventType {
    /// Stable string representation used in SSE `event:` fields and filter
    /// expressions.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PartyJoined => "party.joined",
            Self::PartyLeft => "party.left",
            Self::LinkStateChanged => "link.state_changed",
            Self::RemoteReplaced => "remote.replaced",
            Self::RemoteKicked => "remote.kicked",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Event payloads ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct PartyPayload {
    pub conn_id: u64,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<RemoteId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkPayload {
    pub remote_id: RemoteId,
    pub from: LinkState,
    pub to: LinkState,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Party(PartyPayload),
    Link(LinkPayload),
}

// ─── The event envelope ─────────────────────────────────────────────────────

/// ```json
/// {
///   "id":         "evt_a1b2c3d4-...",
///   "type":       "link.state_changed",
///   "created_at": "2026-06-15T14:22:33.123Z",
///   "data": { "remote_id": "r1", "from": "ready", "to": "offer-sent" }
/// }
/// ```
#[derive(Debug, Clone, Serialize)]
pub struct RelayEvent {
    /// Format: `evt_<uuid-v4>`.
    pub id: String,

    #[serde(rename = "type")]
    pub event_type: EventType,

    pub created_at: DateTime<Utc>,

    pub data: EventPayload,
}

impl RelayEvent {
    pub fn party_joined(
        conn_id: u64,
        role: Role,
        remote_id: Option<&RemoteId>,
        name: Option<&str>,
    ) -> Self {
        Self::party(EventType::PartyJoined, conn_id, role, remote_id, name)
    }

    pub fn party_left(
        conn_id: u64,
        role: Role,
        remote_id: Option<&RemoteId>,
        name: Option<&str>,
    ) -> Self {
        Self::party(EventType::PartyLeft, conn_id, role, remote_id, name)
    }

    pub fn remote_replaced(conn_id: u64, remote_id: &RemoteId, name: Option<&str>) -> Self {
        Self::party(
            EventType::RemoteReplaced,
            conn_id,
            Role::Remote,
            Some(remote_id),
            name,
        )
    }

    pub fn remote_kicked(conn_id: u64, remote_id: &RemoteId, name: Option<&str>) -> Self {
        Self::party(
            EventType::RemoteKicked,
            conn_id,
            Role::Remote,
            Some(remote_id),
            name,
        )
    }

    pub fn link_state_changed(remote_id: &RemoteId, from: LinkState, to: LinkState) -> Self {
        Self::new(
            EventType::LinkStateChanged,
            EventPayload::Link(LinkPayload {
                remote_id: remote_id.clone(),
                from,
                to,
            }),
        )
    }

    /// The remote this event concerns, if any.
    pub fn remote_id(&self) -> Option<&RemoteId> {
        match &self.data {
            EventPayload::Party(p) => p.remote_id.as_ref(),
            EventPayload::Link(p) => Some(&p.remote_id),
        }
    }

    // ── Private ─────────────────────────────────────────────────────────

    fn party(
        event_type: EventType,
        conn_id: u64,
        role: Role,
        remote_id: Option<&RemoteId>,
        name: Option<&str>,
    ) -> Self {
        Self::new(
            event_type,
            EventPayload::Party(PartyPayload {
                conn_id,
                role,
                remote_id: remote_id.cloned(),
                name: name.map(str::to_string),
            }),
        )
    }

    fn new(event_type: EventType, data: EventPayload) -> Self {
        Self {
            id: format!("evt_{}", uuid::Uuid::new_v4()),
            event_type,
            created_at: Utc::now(),
            data,
        }
    }
}

// ─── EventBus ───────────────────────────────────────────────────────────────

/// Broadcast-based fan-out channel for `RelayEvent`.
///
/// Subscribers lagging more than the capacity skip events.  Cheap to clone.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RelayEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(cap: usize) -> Self {
        let (tx, _) = broadcast::channel(cap);
        Self { tx }
    }

    /// Publish an event.  Returns the number of receivers; zero is normal.
    pub fn emit(&self, event: RelayEvent) -> usize {
        debug!(event_type = %event.event_type, event_id = %event.id, "event emitted");
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
