// src/relay.rs
//
// HTTP surface of the relay.
//
//   GET /ws         -- relay socket (WebSocket upgrade, origin-checked)
//   GET /health     -- liveness plus party counts
//   GET /v1/events  -- SSE stream of registry events (see sse.rs)
//
// Each socket gets two tasks: a writer draining the connection's outbound
// queue into the socket, and the reader loop below feeding text frames to
// the `MessageRouter`.  Whichever side finishes first ends the connection,
// and the reader always unregisters the party on the way out.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Request, State,
    },
    http::{header, HeaderMap, HeaderName, HeaderValue, Method},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::ApiError;
use crate::events::EventBus;
use crate::registry::{Outbound, PartyHandle, SessionRegistry};
use crate::router::{ConnContext, MessageRouter};

// ─── AppState ───────────────────────────────────────────────────────────────

pub struct AppState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub router: MessageRouter,
    next_conn_id: AtomicU64,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new(EventBus::new()));
        Self {
            config,
            router: MessageRouter::new(registry.clone()),
            registry,
            next_conn_id: AtomicU64::new(1),
        }
    }

    fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ─── Router ─────────────────────────────────────────────────────────────────

pub fn build_app(state: Arc<AppState>) -> Router {
    let cors = build_cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/v1/events", get(crate::sse::sse_events))
        .layer(middleware::from_fn(version_header_middleware))
        .layer(cors)
        .with_state(state)
}

// ─── Health endpoint ────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "studios": state.registry.studio_count(),
        "remotes": state.registry.remote_count(),
        "tls_enabled": state.config.tls_enabled,
    }))
}

// ─── Version header middleware ──────────────────────────────────────────────

async fn version_header_middleware(request: Request, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        HeaderName::from_static("x-studio-relay-version"),
        HeaderValue::from_static(env!("CARGO_PKG_VERSION")),
    );
    response
}

// ─── CORS configuration ────────────────────────────────────────────────────

fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    if allowed_origins.iter().any(|o| o == "*") {
        CorsLayer::permissive()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|s| match s.parse::<HeaderValue>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(origin = %s, "CORS: skipping invalid origin");
                    None
                }
            })
            .collect();

        info!("CORS: restricted to {} origin(s)", origins.len());

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods([Method::GET])
            .allow_headers([HeaderName::from_static("content-type")])
    }
}

// ─── Relay socket ───────────────────────────────────────────────────────────

/// `GET /ws`.  Disallowed origins are refused before the upgrade.
async fn ws_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    if !state.config.origin_allowed(origin.as_deref()) {
        return Err(ApiError::origin_not_allowed(origin.as_deref().unwrap_or("")));
    }

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state)))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let conn_id = state.next_conn_id();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let closed = CancellationToken::new();

    let mut ctx = ConnContext::new(PartyHandle::new(conn_id, tx));
    debug!(conn_id, "relay socket opened");

    // ── Egress ──────────────────────────────────────────────────────────
    let writer_closed = closed.clone();
    let writer = tokio::spawn(async move {
        while let Some(out) = rx.recv().await {
            match out {
                Outbound::Envelope(envelope) => {
                    let text = match envelope.to_text() {
                        Ok(t) => t,
                        Err(e) => {
                            warn!(conn_id, "failed to encode envelope: {e}");
                            continue;
                        }
                    };
                    if ws_tx.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Outbound::Close => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        writer_closed.cancel();
    });

    // ── Ingress ─────────────────────────────────────────────────────────
    let idle_timeout = state.config.idle_timeout;
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = tokio::time::timeout(idle_timeout, ws_rx.next()) => frame,
        };

        let msg = match frame {
            Err(_) => {
                info!(conn_id, ?idle_timeout, "relay socket idle, dropping");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                state.router.handle_text(&mut ctx, &text);
            }
            Message::Close(_) => break,
            // Pings are answered by axum; any frame counts as activity.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Binary(_) => {
                warn!(conn_id, "binary frame ignored");
            }
        }
    }

    state.router.disconnect(&mut ctx);
    drop(ctx);
    closed.cancel();
    writer.abort();
    debug!(conn_id, "relay socket closed");
}
