// src/registry.rs
//
// Session Registry: the relay's authoritative record of who is connected.
//
// One map of studio connections, one map of remote id -> remote record.
// Each remote record owns the connection handle and the relay's view of
// that remote's PeerLink.  The registry is the single mutator of party and
// link existence.
//
// All state sits behind one mutex and every public operation runs to
// completion under it, so register/remove for the same remote id can never
// interleave (no join-during-teardown window).  Nothing here awaits: outbound
// envelopes are pushed onto unbounded per-connection queues.
//
// ────────────────────────────────────────────────────────────────────────────

use std::collections::BTreeMap;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::events::{EventBus, RelayEvent};
use crate::link::{LinkError, LinkEvent, LinkState, MuteFlags, PeerLink};
use crate::protocol::{Envelope, RemoteId, Role};

pub type ConnId = u64;

// ─── Party handle ───────────────────────────────────────────────────────────

/// What the connection writer task receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Envelope(Envelope),
    /// Close the socket after flushing what is queued.
    Close,
}

/// Write side of one relay connection.
#[derive(Debug, Clone)]
pub struct PartyHandle {
    conn_id: ConnId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl PartyHandle {
    pub fn new(conn_id: ConnId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { conn_id, tx }
    }

    pub fn conn_id(&self) -> ConnId {
        self.conn_id
    }

    /// Queue an envelope.  Returns `false` if the connection is already gone.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(Outbound::Envelope(envelope)).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Outbound::Close);
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

struct StudioEntry {
    handle: PartyHandle,
    name: Option<String>,
}

struct RemoteEntry {
    handle: PartyHandle,
    name: Option<String>,
    link: PeerLink,
}

/// Snapshot returned by `lookup_remote`.
#[derive(Debug, Clone)]
pub struct RemoteParty {
    pub id: RemoteId,
    pub handle: PartyHandle,
    pub name: Option<String>,
    pub link_state: LinkState,
    pub mute: MuteFlags,
}

/// Outcome of `register_remote`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: RemoteId,
    /// A live party held this id and was torn down first.
    pub replaced: bool,
}

/// Outcome of `remove_party` / `kick`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Removed {
    Studio {
        conn_id: ConnId,
    },
    Remote {
        id: RemoteId,
        /// State of the discarded link (always `Closed`).
        link_state: LinkState,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LinkOpError {
    #[error("no live remote '{0}'")]
    UnknownRemote(RemoteId),

    #[error(transparent)]
    Link(#[from] LinkError),
}

// ─── Registry ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Inner {
    studios: BTreeMap<ConnId, StudioEntry>,
    remotes: BTreeMap<RemoteId, RemoteEntry>,
    next_remote_seq: u64,
}

impl Inner {
    fn mint_id(&mut self) -> RemoteId {
        loop {
            self.next_remote_seq += 1;
            let id = RemoteId::new(format!("r{}", self.next_remote_seq));
            if !self.remotes.contains_key(&id) {
                return id;
            }
        }
    }

    fn broadcast_to_studios(&self, envelope: &Envelope) -> usize {
        self.studios
            .values()
            .filter(|s| s.handle.send(envelope.clone()))
            .count()
    }

    /// Discard a remote record: close its link, optionally close its socket,
    /// tell every studio.
    fn take_remote(&mut self, id: &RemoteId, close_socket: bool) -> Option<RemoteEntry> {
        let mut entry = self.remotes.remove(id)?;
        entry.link.close();
        if close_socket {
            entry.handle.close();
        }
        self.broadcast_to_studios(&Envelope::RemoteDisconnected {
            id: id.clone(),
            name: entry.name.clone(),
        });
        Some(entry)
    }
}

pub struct SessionRegistry {
    inner: Mutex<Inner>,
    events: EventBus,
}

impl SessionRegistry {
    pub fn new(events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Add a studio and replay the current remote list to it alone.
    /// Returns how many `new-remote` notices were replayed.
    pub fn register_studio(&self, handle: PartyHandle, name: Option<String>) -> usize {
        let mut inner = self.inner.lock();
        let conn_id = handle.conn_id();

        handle.send(Envelope::Welcome {
            role: Role::Studio,
            id: None,
        });

        let mut replayed = 0;
        for (id, remote) in &inner.remotes {
            if handle.send(Envelope::NewRemote {
                id: id.clone(),
                name: remote.name.clone(),
            }) {
                replayed += 1;
            }
        }

        inner.studios.insert(
            conn_id,
            StudioEntry {
                handle,
                name: name.clone(),
            },
        );

        info!(conn_id, replayed, studios = inner.studios.len(), "studio registered");
        self.events
            .emit(RelayEvent::party_joined(conn_id, Role::Studio, None, name.as_deref()));
        replayed
    }

    /// Add a remote.  A requested id that is currently live replaces the
    /// old party (its link is closed and its socket dropped first); a free
    /// requested id is honoured; otherwise a fresh id is minted.
    pub fn register_remote(
        &self,
        handle: PartyHandle,
        name: Option<String>,
        requested: Option<RemoteId>,
    ) -> Registration {
        let mut inner = self.inner.lock();
        let conn_id = handle.conn_id();

        let requested = requested.filter(|id| !id.as_str().trim().is_empty());
        let mut replaced = false;
        let id = match requested {
            Some(id) => {
                if let Some(old) = inner.take_remote(&id, true) {
                    replaced = true;
                    warn!(
                        remote_id = %id,
                        old_conn = old.handle.conn_id(),
                        new_conn = conn_id,
                        "stale session replaced"
                    );
                    self.events.emit(RelayEvent::remote_replaced(
                        old.handle.conn_id(),
                        &id,
                        old.name.as_deref(),
                    ));
                }
                id
            }
            None => inner.mint_id(),
        };

        handle.send(Envelope::Welcome {
            role: Role::Remote,
            id: Some(id.clone()),
        });

        inner.remotes.insert(
            id.clone(),
            RemoteEntry {
                handle,
                name: name.clone(),
                link: PeerLink::new(id.clone()),
            },
        );

        let notified = inner.broadcast_to_studios(&Envelope::NewRemote {
            id: id.clone(),
            name: name.clone(),
        });

        info!(remote_id = %id, conn_id, replaced, notified, "remote registered");
        self.events.emit(RelayEvent::party_joined(
            conn_id,
            Role::Remote,
            Some(&id),
            name.as_deref(),
        ));

        Registration { id, replaced }
    }

    pub fn lookup_remote(&self, id: &RemoteId) -> Option<RemoteParty> {
        let inner = self.inner.lock();
        inner.remotes.get(id).map(|r| RemoteParty {
            id: id.clone(),
            handle: r.handle.clone(),
            name: r.name.clone(),
            link_state: r.link.state(),
            mute: r.link.mute(),
        })
    }

    /// Connection currently registered under `id`.
    pub fn owner_of(&self, id: &RemoteId) -> Option<ConnId> {
        self.inner.lock().remotes.get(id).map(|r| r.handle.conn_id())
    }

    /// Studio handles in connection order.
    pub fn all_studios(&self) -> Vec<PartyHandle> {
        let inner = self.inner.lock();
        inner.studios.values().map(|s| s.handle.clone()).collect()
    }

    pub fn studio_name(&self, conn_id: ConnId) -> Option<String> {
        let inner = self.inner.lock();
        inner.studios.get(&conn_id).and_then(|s| s.name.clone())
    }

    pub fn remote_ids(&self) -> Vec<RemoteId> {
        let inner = self.inner.lock();
        inner.remotes.keys().cloned().collect()
    }

    pub fn studio_count(&self) -> usize {
        self.inner.lock().studios.len()
    }

    pub fn remote_count(&self) -> usize {
        self.inner.lock().remotes.len()
    }

    /// Drop whatever party owns `conn_id`.
    ///
    /// A remote's removal is broadcast to every studio.  A connection that
    /// was already superseded by a replacement registration finds nothing to
    /// remove, so the replacement stays intact.
    pub fn remove_party(&self, conn_id: ConnId) -> Option<Removed> {
        let mut inner = self.inner.lock();

        if let Some(studio) = inner.studios.remove(&conn_id) {
            info!(conn_id, studios = inner.studios.len(), "studio removed");
            if inner.studios.is_empty() {
                // Nobody is left on the studio side of any link.
                for (id, remote) in inner.remotes.iter_mut() {
                    if remote.link.state() != LinkState::Idle {
                        let from = remote.link.state();
                        let mute = remote.link.mute();
                        remote.link.close();
                        remote.link = PeerLink::new(id.clone());
                        remote.link.set_self_muted(mute.self_muted);
                        self.events.emit(RelayEvent::link_state_changed(
                            id,
                            from,
                            LinkState::Idle,
                        ));
                    }
                }
            }
            self.events.emit(RelayEvent::party_left(
                conn_id,
                Role::Studio,
                None,
                studio.name.as_deref(),
            ));
            return Some(Removed::Studio { conn_id });
        }

        let id = inner
            .remotes
            .iter()
            .find(|(_, r)| r.handle.conn_id() == conn_id)
            .map(|(id, _)| id.clone());

        let Some(id) = id else {
            debug!(conn_id, "remove_party: connection holds no registration");
            return None;
        };

        let entry = inner.take_remote(&id, false)?;
        info!(remote_id = %id, conn_id, "remote removed");
        self.events.emit(RelayEvent::party_left(
            conn_id,
            Role::Remote,
            Some(&id),
            entry.name.as_deref(),
        ));
        Some(Removed::Remote {
            id,
            link_state: entry.link.state(),
        })
    }

    /// Kick a remote: send it `kick`, close its socket, close its link,
    /// notify studios.
    pub fn kick(&self, id: &RemoteId, reason: Option<String>) -> Option<Removed> {
        let mut inner = self.inner.lock();

        let handle = inner.remotes.get(id)?.handle.clone();
        handle.send(Envelope::Kick { reason });

        let entry = inner.take_remote(id, true)?;
        info!(remote_id = %id, conn_id = handle.conn_id(), "remote kicked");
        self.events.emit(RelayEvent::remote_kicked(
            handle.conn_id(),
            id,
            entry.name.as_deref(),
        ));
        Some(Removed::Remote {
            id: id.clone(),
            link_state: entry.link.state(),
        })
    }

    /// Advance the relay-side link of `id`.
    pub fn advance_link(&self, id: &RemoteId, event: LinkEvent) -> Result<LinkState, LinkOpError> {
        let mut inner = self.inner.lock();
        let remote = inner
            .remotes
            .get_mut(id)
            .ok_or_else(|| LinkOpError::UnknownRemote(id.clone()))?;

        let from = remote.link.state();
        let to = remote.link.apply(event)?;
        if from != to {
            debug!(remote_id = %id, %from, %to, "link advanced");
            self.events.emit(RelayEvent::link_state_changed(id, from, to));
        }
        Ok(to)
    }

    /// Current link state of a live remote.
    pub fn link_state(&self, id: &RemoteId) -> Option<LinkState> {
        self.inner.lock().remotes.get(id).map(|r| r.link.state())
    }

    pub fn set_self_muted(&self, id: &RemoteId, muted: bool) -> Option<MuteFlags> {
        let mut inner = self.inner.lock();
        inner.remotes.get_mut(id).map(|r| r.link.set_self_muted(muted))
    }

    pub fn set_imposed_muted(&self, id: &RemoteId, muted: bool) -> Option<MuteFlags> {
        let mut inner = self.inner.lock();
        inner
            .remotes
            .get_mut(id)
            .map(|r| r.link.set_imposed_muted(muted))
    }

    /// Refresh a remote's last-activity stamp.
    pub fn touch_remote(&self, id: &RemoteId) {
        if let Some(r) = self.inner.lock().remotes.get_mut(id) {
            r.link.touch();
        }
    }

    pub fn send_to_remote(&self, id: &RemoteId, envelope: Envelope) -> bool {
        let inner = self.inner.lock();
        inner
            .remotes
            .get(id)
            .map(|r| r.handle.send(envelope))
            .unwrap_or(false)
    }

    pub fn broadcast_to_studios(&self, envelope: &Envelope) -> usize {
        self.inner.lock().broadcast_to_studios(envelope)
    }

    pub fn broadcast_to_remotes(&self, envelope: &Envelope) -> usize {
        let inner = self.inner.lock();
        inner
            .remotes
            .values()
            .filter(|r| r.handle.send(envelope.clone()))
            .count()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
