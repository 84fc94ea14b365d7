// src/sse.rs
//
// Server-Sent Events view of the relay event bus.
//
// ─ Usage ────────────────────────────────────────────────────────────────────
//
//   GET /v1/events?types=party.joined,party.left&remote_id=r1
//
//   Optional query parameters:
//     types      -- comma-separated event types to receive.
//     remote_id  -- only events concerning this remote.
//
//   Each SSE message has:
//     event: <event_type>       (e.g. "link.state_changed")
//     id:    <event_id>         (e.g. "evt_a1b2c3d4")
//     data:  <json payload>
//
// ────────────────────────────────────────────────────────────────────────────

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Query, State},
    response::sse::{Event as SseEvent, KeepAlive, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::events::{EventType, RelayEvent};
use crate::relay::AppState;

// ─── Query parameters ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SseQuery {
    pub types: Option<String>,
    pub remote_id: Option<String>,
}

/// Parsed, validated form of `SseQuery`.
#[derive(Debug, Default)]
pub struct EventFilter {
    types: Vec<EventType>,
    remote_id: Option<String>,
}

impl EventFilter {
    pub fn parse(query: &SseQuery) -> Result<Self, ApiError> {
        let mut types = Vec::new();
        if let Some(raw) = &query.types {
            for t in raw.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                let parsed = serde_json::from_value::<EventType>(serde_json::Value::from(t))
                    .map_err(|_| ApiError::bad_request(format!("Unknown event type '{t}'.")))?;
                types.push(parsed);
            }
        }
        Ok(Self {
            types,
            remote_id: query.remote_id.clone().filter(|r| !r.is_empty()),
        })
    }

    pub fn matches(&self, event: &RelayEvent) -> bool {
        if !self.types.is_empty() && !self.types.contains(&event.event_type) {
            return false;
        }
        match &self.remote_id {
            Some(want) => event.remote_id().is_some_and(|id| id.as_str() == want),
            None => true,
        }
    }
}

// ─── SSE handler ────────────────────────────────────────────────────────────

/// `GET /v1/events`.  Heartbeat comment every 15 seconds.
pub async fn sse_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SseQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    let filter = EventFilter::parse(&query)?;
    let mut rx = state.registry.events().subscribe();

    info!(
        types = query.types.as_deref().unwrap_or("*"),
        remote_id = query.remote_id.as_deref().unwrap_or("*"),
        "SSE client connected"
    );

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if !filter.matches(&event) {
                        continue;
                    }

                    let json = match serde_json::to_string(&event) {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("SSE: failed to serialize event: {e}");
                            continue;
                        }
                    };

                    yield Ok(SseEvent::default()
                        .event(event.event_type.as_str())
                        .id(event.id.clone())
                        .data(json));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("SSE client lagged, skipped {n} events");
                    yield Ok(SseEvent::default()
                        .event("_warning")
                        .data(format!("{{\"message\":\"lagged, skipped {n} events\"}}")));
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    info!("SSE: event bus closed, ending stream");
                    break;
                }
            }
        }
    };

    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

// ─── Tests ──────────────────────────────────────────────────────────────────
