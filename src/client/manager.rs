// src/client/manager.rs
//
// Reconnection & keepalive manager.
//
// Owns the relay socket for one client process.  Controllers talk to it
// through a `RelayHandle` (outgoing) and a `ClientEvent` receiver
// (incoming); they never see the socket itself.
//
//   connect ──join──> welcome ──> [ envelopes / keepalive every N s ] ──> lost
//      ^                                                                   │
//      └───────────────────── sleep(reconnect_delay) <─────────────────────┘
//
// A remote's assigned id is captured from `welcome` and resubmitted on every
// later `join`, so the relay replaces the stale session instead of minting a
// second party.  A `kick` or `shutdown()` ends the loop for good.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{ClientError, Outbox};
use crate::config::ClientConfig;
use crate::protocol::{self, Envelope, RemoteId, Role};

// ─── Public surface ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    /// `join` acknowledged.  `id` is set for remotes.
    Connected { id: Option<RemoteId> },
    Envelope(Envelope),
    /// The relay connection is gone; a reconnect may follow.
    Disconnected,
    /// The manager has stopped for good (kicked or shut down).
    Stopped,
}

/// Cloneable sender for outgoing envelopes.  Envelopes queued while the
/// relay is unreachable are discarded on the next connect.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl Outbox for RelayHandle {
    fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(envelope).is_ok()
    }
}

pub struct RelayManager {
    cancel: CancellationToken,
    held_id: Arc<Mutex<Option<RemoteId>>>,
    task: JoinHandle<()>,
}

impl RelayManager {
    /// Start the connection loop in the background.
    pub fn spawn(
        config: ClientConfig,
        role: Role,
    ) -> (Self, RelayHandle, mpsc::UnboundedReceiver<ClientEvent>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let held_id = Arc::new(Mutex::new(match role {
            Role::Remote => config.remote_id.clone().map(RemoteId::new),
            Role::Studio => None,
        }));

        let task = tokio::spawn(run(
            config,
            role,
            held_id.clone(),
            out_rx,
            event_tx,
            cancel.clone(),
        ));

        let manager = Self {
            cancel,
            held_id,
            task,
        };
        (manager, RelayHandle { tx: out_tx }, event_rx)
    }

    /// The id the relay last assigned (remotes only).
    pub fn held_id(&self) -> Option<RemoteId> {
        self.held_id.lock().clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the loop to finish.
    pub async fn join(self) {
        let _ = self.task.await;
    }
}

// ─── Connection loop ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Lost,
    Kicked,
    Shutdown,
}

async fn run(
    config: ClientConfig,
    role: Role,
    held_id: Arc<Mutex<Option<RemoteId>>>,
    mut out_rx: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<ClientEvent>,
    cancel: CancellationToken,
) {
    loop {
        let mut stale = 0usize;
        while out_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!(stale, "discarding envelopes queued while disconnected");
        }

        info!(url = %config.relay_url, %role, "connecting to relay");
        match connect_once(&config, role, &held_id, &mut out_rx, &events, &cancel).await {
            Ok(SessionEnd::Kicked) => {
                warn!("kicked by the studio, not reconnecting");
                break;
            }
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Lost) => warn!("relay connection lost"),
            Err(e) => warn!("relay connection failed: {e}"),
        }

        info!(
            "reconnecting in {} seconds",
            config.reconnect_delay.as_secs_f32()
        );
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.reconnect_delay) => {}
        }
    }

    let _ = events.send(ClientEvent::Stopped);
    debug!("relay manager stopped");
}

async fn connect_once(
    config: &ClientConfig,
    role: Role,
    held_id: &Mutex<Option<RemoteId>>,
    out_rx: &mut mpsc::UnboundedReceiver<Envelope>,
    events: &mpsc::UnboundedSender<ClientEvent>,
    cancel: &CancellationToken,
) -> Result<SessionEnd, ClientError> {
    let (ws, _) = tokio::select! {
        _ = cancel.cancelled() => return Ok(SessionEnd::Shutdown),
        r = tokio_tungstenite::connect_async(config.relay_url.as_str()) => r?,
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    let join = Envelope::Join {
        role,
        name: config.name.clone(),
        id: held_id.lock().clone(),
    };
    ws_tx.send(Message::Text(join.to_text()?)).await?;

    let period = config.keepalive_interval;
    let mut keepalive = tokio::time::interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut welcomed = false;

    let end = loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break SessionEnd::Shutdown;
            }

            _ = keepalive.tick() => {
                trace!("keepalive");
                if ws_tx.send(Message::Text(Envelope::Keepalive.to_text()?)).await.is_err() {
                    break SessionEnd::Lost;
                }
            }

            out = out_rx.recv() => {
                let Some(envelope) = out else {
                    // Every handle dropped: nobody left to talk for.
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break SessionEnd::Shutdown;
                };
                if ws_tx.send(Message::Text(envelope.to_text()?)).await.is_err() {
                    break SessionEnd::Lost;
                }
            }

            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => match protocol::decode(&text) {
                    Ok(Envelope::Welcome { id, .. }) => {
                        if role == Role::Remote {
                            if let Some(id) = &id {
                                *held_id.lock() = Some(id.clone());
                            }
                        }
                        info!(id = ?id, "joined relay");
                        welcomed = true;
                        let _ = events.send(ClientEvent::Connected { id });
                    }
                    Ok(Envelope::Kick { reason }) => {
                        let _ = events.send(ClientEvent::Envelope(Envelope::Kick { reason }));
                        break SessionEnd::Kicked;
                    }
                    Ok(envelope) => {
                        let _ = events.send(ClientEvent::Envelope(envelope));
                    }
                    Err(e) if e.is_unknown_type() => debug!("ignoring relay message: {e}"),
                    Err(e) => warn!("dropping relay message: {e}"),
                },
                Some(Ok(Message::Close(_))) | None => break SessionEnd::Lost,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!("relay socket error: {e}");
                    break SessionEnd::Lost;
                }
            },
        }
    };

    if welcomed {
        let _ = events.send(ClientEvent::Disconnected);
    }
    Ok(end)
}

// ─── Tests ──────────────────────────────────────────────────────────────────
