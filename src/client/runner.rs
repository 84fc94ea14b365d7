// src/client/runner.rs
//
// Glue between the relay connection and a role controller.
//
// One task owns the event loop:
//
//   RelayManager ──ClientEvent──┐
//                               ├──> controller (behind an async mutex)
//   MediaSessions ─Transport────┘
//
// `Connected` is handed to the controller as a `welcome`, relay envelopes
// go to `handle_envelope`, transport reports to `handle_transport`, and a
// lost or stopped relay connection tears every link down through
// `relay_lost`.  Operator commands lock the controller from outside.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::manager::{ClientEvent, RelayHandle, RelayManager};
use super::remote::RemoteController;
use super::studio::StudioController;
use super::{ClientError, Outbox};
use crate::config::ClientConfig;
use crate::protocol::{Envelope, RemoteId, Role};
use crate::transport::{MediaConfig, SessionFactory, TransportEvent, TransportEventSender};
use crate::webrtc_transport::WebRtcSessionFactory;

/// What the runner needs from a role controller.
#[async_trait]
pub trait Controller: Send + 'static {
    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError>;
    fn handle_transport(&mut self, event: TransportEvent);
    async fn relay_lost(&mut self);
}

#[async_trait]
impl Controller for StudioController {
    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        StudioController::handle_envelope(self, envelope).await
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        StudioController::handle_transport(self, event)
    }

    async fn relay_lost(&mut self) {
        StudioController::relay_lost(self).await
    }
}

#[async_trait]
impl Controller for RemoteController {
    async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), ClientError> {
        RemoteController::handle_envelope(self, envelope).await
    }

    fn handle_transport(&mut self, event: TransportEvent) {
        RemoteController::handle_transport(self, event)
    }

    async fn relay_lost(&mut self) {
        RemoteController::relay_lost(self).await
    }
}

fn media_config(config: &ClientConfig) -> MediaConfig {
    MediaConfig {
        channels: config.channels,
        bitrate_kbps: config.bitrate_kbps,
    }
}

// ─── Runner ─────────────────────────────────────────────────────────────────

pub struct ClientRunner<C> {
    controller: Arc<Mutex<C>>,
    manager: RelayManager,
    relay: RelayHandle,
    task: JoinHandle<()>,
}

impl ClientRunner<StudioController> {
    /// Studio console with webrtc-rs media sessions.
    pub fn studio(config: ClientConfig) -> Self {
        let factory = Arc::new(WebRtcSessionFactory::new(
            Role::Studio,
            config.stun_urls.clone(),
        ));
        Self::studio_with(config, factory)
    }

    pub fn studio_with(config: ClientConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let media = media_config(&config);
        Self::spawn(config, Role::Studio, move |outbox, transport_tx| {
            StudioController::new(outbox, factory, transport_tx, media)
        })
    }
}

impl ClientRunner<RemoteController> {
    /// Remote contributor with webrtc-rs media sessions.
    pub fn remote(config: ClientConfig) -> Self {
        let factory = Arc::new(WebRtcSessionFactory::new(
            Role::Remote,
            config.stun_urls.clone(),
        ));
        Self::remote_with(config, factory)
    }

    pub fn remote_with(config: ClientConfig, factory: Arc<dyn SessionFactory>) -> Self {
        let media = media_config(&config);
        Self::spawn(config, Role::Remote, move |outbox, transport_tx| {
            RemoteController::new(outbox, factory, transport_tx, media)
        })
    }
}

impl<C: Controller> ClientRunner<C> {
    fn spawn<F>(config: ClientConfig, role: Role, build: F) -> Self
    where
        F: FnOnce(Arc<dyn Outbox>, TransportEventSender) -> C,
    {
        let (manager, relay, events) = RelayManager::spawn(config, role);
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let outbox: Arc<dyn Outbox> = Arc::new(relay.clone());
        let controller = Arc::new(Mutex::new(build(outbox, transport_tx)));
        let task = tokio::spawn(drive(controller.clone(), role, events, transport_rx));

        Self {
            controller,
            manager,
            relay,
            task,
        }
    }

    /// Lock the controller to issue commands or inspect links.
    pub async fn controller(&self) -> MutexGuard<'_, C> {
        self.controller.lock().await
    }

    pub fn relay(&self) -> &RelayHandle {
        &self.relay
    }

    pub fn held_id(&self) -> Option<RemoteId> {
        self.manager.held_id()
    }

    pub fn shutdown(&self) {
        self.manager.shutdown();
    }

    /// Wait until the relay connection has stopped for good and every link
    /// is torn down.
    pub async fn join(self) {
        self.manager.join().await;
        let _ = self.task.await;
    }
}

async fn drive<C: Controller>(
    controller: Arc<Mutex<C>>,
    role: Role,
    mut events: mpsc::UnboundedReceiver<ClientEvent>,
    mut transport: mpsc::UnboundedReceiver<TransportEvent>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                let mut c = controller.lock().await;
                match event {
                    ClientEvent::Connected { id } => {
                        info!(%role, id = ?id, "relay session up");
                        if let Err(e) = c.handle_envelope(Envelope::Welcome { role, id }).await {
                            warn!("welcome not applied: {e}");
                        }
                    }
                    ClientEvent::Envelope(envelope) => {
                        let kind = envelope.kind();
                        if let Err(e) = c.handle_envelope(envelope).await {
                            warn!(envelope_type = kind, "envelope not applied: {e}");
                        }
                    }
                    ClientEvent::Disconnected => c.relay_lost().await,
                    ClientEvent::Stopped => {
                        c.relay_lost().await;
                        break;
                    }
                }
            }

            Some(event) = transport.recv() => {
                controller.lock().await.handle_transport(event);
            }
        }
    }
    debug!(%role, "client runner stopped");
}
