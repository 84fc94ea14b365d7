// src/router.rs
//
// Per-connection message dispatch for the relay.
//
// A connection starts unjoined.  `join` binds it to a role; from then on
// every envelope is checked against that role and routed by type and
// addressing.  Anything that cannot be routed is dropped with a reason and
// the connection stays open; one bad message never costs a party its
// session.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::link::{LinkError, LinkEvent, LinkState};
use crate::protocol::{self, Envelope, ProtocolError, RemoteId, Role};
use crate::registry::{ConnId, LinkOpError, PartyHandle, Removed, SessionRegistry};

// ─── Connection context ─────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Joined {
    Studio,
    Remote(RemoteId),
}

impl Joined {
    pub fn role(&self) -> Role {
        match self {
            Self::Studio => Role::Studio,
            Self::Remote(_) => Role::Remote,
        }
    }
}

/// Router-side view of one relay connection.
#[derive(Debug)]
pub struct ConnContext {
    handle: PartyHandle,
    joined: Option<Joined>,
}

impl ConnContext {
    pub fn new(handle: PartyHandle) -> Self {
        Self {
            handle,
            joined: None,
        }
    }

    pub fn conn_id(&self) -> ConnId {
        self.handle.conn_id()
    }

    pub fn joined(&self) -> Option<&Joined> {
        self.joined.as_ref()
    }
}

// ─── Dispatch outcome ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Undecodable or structurally invalid frame.
    Protocol(String),
    /// Type tag this relay does not know.  Not an error.
    UnknownType(String),
    NotJoined(&'static str),
    AlreadyJoined,
    RelayOnly(&'static str),
    WrongRole { kind: &'static str, role: Role },
    MissingTarget(&'static str),
    UnknownRemote(RemoteId),
    Link { remote: RemoteId, error: LinkError },
}

impl std::fmt::Display for DropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Protocol(e) => write!(f, "protocol error: {e}"),
            Self::UnknownType(t) => write!(f, "unknown type '{t}'"),
            Self::NotJoined(kind) => write!(f, "'{kind}' before join"),
            Self::AlreadyJoined => f.write_str("second join on one connection"),
            Self::RelayOnly(kind) => write!(f, "'{kind}' may only be sent by the relay"),
            Self::WrongRole { kind, role } => write!(f, "'{kind}' not allowed for a {role}"),
            Self::MissingTarget(kind) => write!(f, "'{kind}' needs a target"),
            Self::UnknownRemote(id) => write!(f, "no live remote '{id}'"),
            Self::Link { remote, error } => write!(f, "link {remote}: {error}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Join accepted.
    Registered(Joined),
    /// Routed to this many recipients (possibly zero).
    Delivered(usize),
    /// Consumed by the relay itself.
    Absorbed,
    Dropped(DropReason),
}

fn link_drop(remote: &RemoteId, err: LinkOpError) -> Dispatch {
    Dispatch::Dropped(match err {
        LinkOpError::UnknownRemote(id) => DropReason::UnknownRemote(id),
        LinkOpError::Link(error) => DropReason::Link {
            remote: remote.clone(),
            error,
        },
    })
}

// ─── Router ─────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct MessageRouter {
    registry: Arc<SessionRegistry>,
}

impl MessageRouter {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Decode and dispatch one text frame, logging anything dropped.
    pub fn handle_text(&self, ctx: &mut ConnContext, text: &str) -> Dispatch {
        let outcome = match protocol::decode(text) {
            Ok(envelope) => self.dispatch(ctx, envelope),
            Err(ProtocolError::UnknownType(t)) => Dispatch::Dropped(DropReason::UnknownType(t)),
            Err(e) => Dispatch::Dropped(DropReason::Protocol(e.to_string())),
        };

        match &outcome {
            Dispatch::Dropped(DropReason::UnknownType(t)) => {
                debug!(conn_id = ctx.conn_id(), envelope_type = %t, "ignoring unknown envelope type");
            }
            Dispatch::Dropped(reason) => {
                warn!(conn_id = ctx.conn_id(), %reason, "envelope dropped");
            }
            _ => {}
        }
        outcome
    }

    /// Route one decoded envelope.
    pub fn dispatch(&self, ctx: &mut ConnContext, envelope: Envelope) -> Dispatch {
        if let Envelope::Keepalive = envelope {
            trace!(conn_id = ctx.conn_id(), "keepalive");
            if let Some(Joined::Remote(id)) = &ctx.joined {
                if self.registry.owner_of(id) == Some(ctx.conn_id()) {
                    self.registry.touch_remote(id);
                }
            }
            return Dispatch::Absorbed;
        }

        if let Envelope::Join { role, name, id } = envelope {
            return self.join(ctx, role, name, id);
        }

        if envelope.is_relay_only() {
            return Dispatch::Dropped(DropReason::RelayOnly(envelope.kind()));
        }

        let Some(joined) = ctx.joined.clone() else {
            return Dispatch::Dropped(DropReason::NotJoined(envelope.kind()));
        };

        match joined {
            Joined::Studio => self.from_studio(ctx.conn_id(), envelope),
            Joined::Remote(id) => {
                // A connection superseded by a rejoin no longer speaks for its id.
                if self.registry.owner_of(&id) != Some(ctx.conn_id()) {
                    debug!(conn_id = ctx.conn_id(), remote_id = %id, "connection superseded");
                    ctx.joined = None;
                    return Dispatch::Dropped(DropReason::UnknownRemote(id));
                }
                self.from_remote(&id, envelope)
            }
        }
    }

    /// Unregister whatever this connection held.
    pub fn disconnect(&self, ctx: &mut ConnContext) -> Option<Removed> {
        let removed = self.registry.remove_party(ctx.conn_id());
        ctx.joined = None;
        removed
    }

    // ── Join ────────────────────────────────────────────────────────────

    fn join(
        &self,
        ctx: &mut ConnContext,
        role: Role,
        name: Option<String>,
        id: Option<RemoteId>,
    ) -> Dispatch {
        if ctx.joined.is_some() {
            return Dispatch::Dropped(DropReason::AlreadyJoined);
        }

        let joined = match role {
            Role::Studio => {
                self.registry.register_studio(ctx.handle.clone(), name);
                Joined::Studio
            }
            Role::Remote => {
                let reg = self.registry.register_remote(ctx.handle.clone(), name, id);
                Joined::Remote(reg.id)
            }
        };

        info!(conn_id = ctx.conn_id(), role = %joined.role(), "joined");
        ctx.joined = Some(joined.clone());
        Dispatch::Registered(joined)
    }

    // ── Studio-originated ───────────────────────────────────────────────

    fn from_studio(&self, conn_id: ConnId, envelope: Envelope) -> Dispatch {
        let kind = envelope.kind();
        match envelope {
            Envelope::ReadyForOffer { target } => {
                if let Err(e) = self.registry.advance_link(&target, LinkEvent::BeginNegotiation) {
                    return link_drop(&target, e);
                }
                self.deliver(&target, Envelope::StartCall)
            }

            Envelope::Answer { target, sdp } => {
                if let Err(e) = self.registry.advance_link(&target, LinkEvent::Answered) {
                    return link_drop(&target, e);
                }
                let env = Envelope::Answer {
                    target: target.clone(),
                    sdp,
                };
                self.deliver(&target, env)
            }

            Envelope::Candidate {
                target, candidate, ..
            } => {
                let Some(target) = target else {
                    return Dispatch::Dropped(DropReason::MissingTarget(kind));
                };
                if let Some(d) = self.require_open_link(&target) {
                    return d;
                }
                let env = Envelope::Candidate {
                    from: None,
                    target: Some(target.clone()),
                    candidate,
                };
                self.deliver(&target, env)
            }

            Envelope::ModeUpdate { target, value } => {
                if let Some(d) = self.require_open_link(&target) {
                    return d;
                }
                let env = Envelope::ModeUpdate {
                    target: target.clone(),
                    value,
                };
                self.deliver(&target, env)
            }

            Envelope::BitrateUpdate { target, value } => {
                if let Some(d) = self.require_open_link(&target) {
                    return d;
                }
                let env = Envelope::BitrateUpdate {
                    target: target.clone(),
                    value,
                };
                self.deliver(&target, env)
            }

            Envelope::MuteUpdate { target, muted, .. } => {
                let Some(target) = target else {
                    return Dispatch::Dropped(DropReason::MissingTarget(kind));
                };
                if self.registry.set_imposed_muted(&target, muted).is_none() {
                    return Dispatch::Dropped(DropReason::UnknownRemote(target));
                }
                let env = Envelope::MuteUpdate {
                    target: Some(target.clone()),
                    from: None,
                    muted,
                };
                self.deliver(&target, env)
            }

            Envelope::KickRemote { target } => match self.registry.kick(&target, None) {
                Some(_) => Dispatch::Delivered(1),
                None => Dispatch::Dropped(DropReason::UnknownRemote(target)),
            },

            Envelope::Chat { target, text, .. } => {
                let from = self
                    .registry
                    .studio_name(conn_id)
                    .unwrap_or_else(|| Role::Studio.as_str().to_string());
                match target {
                    Some(target) => {
                        let env = Envelope::Chat {
                            from: Some(from),
                            target: Some(target.clone()),
                            text,
                        };
                        self.deliver(&target, env)
                    }
                    None => {
                        let env = Envelope::Chat {
                            from: Some(from),
                            target: None,
                            text,
                        };
                        Dispatch::Delivered(self.registry.broadcast_to_remotes(&env))
                    }
                }
            }

            _ => Dispatch::Dropped(DropReason::WrongRole {
                kind,
                role: Role::Studio,
            }),
        }
    }

    // ── Remote-originated ───────────────────────────────────────────────

    fn from_remote(&self, id: &RemoteId, envelope: Envelope) -> Dispatch {
        let kind = envelope.kind();
        match envelope {
            Envelope::Offer { sdp, .. } => {
                if let Err(e) = self.registry.advance_link(id, LinkEvent::OfferSent) {
                    return link_drop(id, e);
                }
                // `from` is always the sender's registered id.
                let env = Envelope::Offer {
                    from: id.clone(),
                    sdp,
                };
                Dispatch::Delivered(self.registry.broadcast_to_studios(&env))
            }

            Envelope::Candidate { candidate, .. } => {
                if let Some(d) = self.require_open_link(id) {
                    return d;
                }
                let env = Envelope::Candidate {
                    from: Some(id.clone()),
                    target: None,
                    candidate,
                };
                Dispatch::Delivered(self.registry.broadcast_to_studios(&env))
            }

            Envelope::MuteUpdate { muted, .. } => {
                self.registry.set_self_muted(id, muted);
                let env = Envelope::MuteUpdate {
                    target: None,
                    from: Some(id.clone()),
                    muted,
                };
                Dispatch::Delivered(self.registry.broadcast_to_studios(&env))
            }

            Envelope::Chat { text, .. } => {
                let env = Envelope::Chat {
                    from: Some(id.to_string()),
                    target: None,
                    text,
                };
                Dispatch::Delivered(self.registry.broadcast_to_studios(&env))
            }

            _ => Dispatch::Dropped(DropReason::WrongRole {
                kind,
                role: Role::Remote,
            }),
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn require_open_link(&self, id: &RemoteId) -> Option<Dispatch> {
        match self.registry.link_state(id) {
            None => Some(Dispatch::Dropped(DropReason::UnknownRemote(id.clone()))),
            Some(LinkState::Closed) => Some(Dispatch::Dropped(DropReason::Link {
                remote: id.clone(),
                error: LinkError::Closed,
            })),
            Some(_) => None,
        }
    }

    fn deliver(&self, target: &RemoteId, envelope: Envelope) -> Dispatch {
        if self.registry.send_to_remote(target, envelope) {
            Dispatch::Delivered(1)
        } else {
            Dispatch::Dropped(DropReason::UnknownRemote(target.clone()))
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::registry::Outbound;
    use serde_json::json;
    use tokio::sync::mpsc;

    struct Conn {
        ctx: ConnContext,
        rx: mpsc::UnboundedReceiver<Outbound>,
    }

    impl Conn {
        fn new(conn_id: ConnId) -> Self {
            let (tx, rx) = mpsc::unbounded_channel();
            Self {
                ctx: ConnContext::new(PartyHandle::new(conn_id, tx)),
                rx,
            }
        }

        fn received(&mut self) -> Vec<Envelope> {
            let mut out = Vec::new();
            while let Ok(o) = self.rx.try_recv() {
                if let Outbound::Envelope(e) = o {
                    out.push(e);
                }
            }
            out
        }
    }

    fn router() -> MessageRouter {
        MessageRouter::new(Arc::new(SessionRegistry::new(EventBus::new())))
    }

    fn join_studio(router: &MessageRouter, conn: &mut Conn) {
        router.handle_text(&mut conn.ctx, r#"{"type":"join","role":"studio"}"#);
        conn.received();
    }

    fn join_remote(router: &MessageRouter, conn: &mut Conn, name: &str) -> RemoteId {
        let text = json!({"type": "join", "role": "remote", "name": name}).to_string();
        let Dispatch::Registered(Joined::Remote(id)) = router.handle_text(&mut conn.ctx, &text)
        else {
            panic!("remote join refused");
        };
        conn.received();
        id
    }

    #[test]
    fn full_negotiation_is_routed() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");
        assert_eq!(
            studio.received(),
            vec![Envelope::NewRemote {
                id: id.clone(),
                name: Some("A".into())
            }]
        );

        let out = router.dispatch(&mut studio.ctx, Envelope::ReadyForOffer { target: id.clone() });
        assert_eq!(out, Dispatch::Delivered(1));
        assert_eq!(remote.received(), vec![Envelope::StartCall]);

        // A forged `from` is overwritten with the registered id.
        let out = router.dispatch(
            &mut remote.ctx,
            Envelope::Offer {
                from: "someone-else".into(),
                sdp: json!("offer"),
            },
        );
        assert_eq!(out, Dispatch::Delivered(1));
        assert_eq!(
            studio.received(),
            vec![Envelope::Offer {
                from: id.clone(),
                sdp: json!("offer")
            }]
        );

        let out = router.dispatch(
            &mut studio.ctx,
            Envelope::Answer {
                target: id.clone(),
                sdp: json!("answer"),
            },
        );
        assert_eq!(out, Dispatch::Delivered(1));
        assert_eq!(
            remote.received(),
            vec![Envelope::Answer {
                target: id.clone(),
                sdp: json!("answer")
            }]
        );
        assert_eq!(router.registry().link_state(&id), Some(LinkState::Answered));
    }

    #[test]
    fn candidates_are_addressed_both_ways() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");
        studio.received();

        router.dispatch(
            &mut remote.ctx,
            Envelope::Candidate {
                from: None,
                target: None,
                candidate: json!({"candidate": "c1"}),
            },
        );
        assert_eq!(
            studio.received(),
            vec![Envelope::Candidate {
                from: Some(id.clone()),
                target: None,
                candidate: json!({"candidate": "c1"})
            }]
        );

        let out = router.dispatch(
            &mut studio.ctx,
            Envelope::Candidate {
                from: None,
                target: None,
                candidate: json!("c2"),
            },
        );
        assert_eq!(out, Dispatch::Dropped(DropReason::MissingTarget("candidate")));

        router.dispatch(
            &mut studio.ctx,
            Envelope::Candidate {
                from: None,
                target: Some(id.clone()),
                candidate: json!("c3"),
            },
        );
        assert_eq!(
            remote.received(),
            vec![Envelope::Candidate {
                from: None,
                target: Some(id),
                candidate: json!("c3")
            }]
        );
    }

    #[test]
    fn messages_before_join_are_dropped() {
        let router = router();
        let mut conn = Conn::new(1);
        let out = router.handle_text(&mut conn.ctx, r#"{"type":"chat","text":"hi"}"#);
        assert_eq!(out, Dispatch::Dropped(DropReason::NotJoined("chat")));

        // Keepalive is fine at any time.
        let out = router.handle_text(&mut conn.ctx, r#"{"type":"keepalive"}"#);
        assert_eq!(out, Dispatch::Absorbed);
    }

    #[test]
    fn superseded_connection_cannot_speak_for_its_id() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut old = Conn::new(2);
        let mut fresh = Conn::new(3);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut old, "A");

        let text = json!({"type": "join", "role": "remote", "name": "A", "id": id}).to_string();
        assert_eq!(
            router.handle_text(&mut fresh.ctx, &text),
            Dispatch::Registered(Joined::Remote(id.clone()))
        );
        studio.received();

        let out = router.dispatch(
            &mut old.ctx,
            Envelope::Offer {
                from: id.clone(),
                sdp: json!("stale"),
            },
        );
        assert_eq!(out, Dispatch::Dropped(DropReason::UnknownRemote(id.clone())));
        assert_eq!(old.ctx.joined(), None);
        assert!(studio.received().is_empty());
        assert_eq!(router.registry().link_state(&id), Some(LinkState::Idle));
        assert_eq!(router.registry().owner_of(&id), Some(3));

        // Teardown of the old socket leaves the fresh session registered.
        assert_eq!(router.disconnect(&mut old.ctx), None);
        assert_eq!(router.registry().remote_count(), 1);
    }

    #[test]
    fn second_join_is_dropped() {
        let router = router();
        let mut conn = Conn::new(1);
        join_studio(&router, &mut conn);
        let out = router.handle_text(&mut conn.ctx, r#"{"type":"join","role":"remote"}"#);
        assert_eq!(out, Dispatch::Dropped(DropReason::AlreadyJoined));
        assert_eq!(router.registry().remote_count(), 0);
    }

    #[test]
    fn role_is_enforced() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");

        let out = router.dispatch(&mut remote.ctx, Envelope::KickRemote { target: id.clone() });
        assert_eq!(
            out,
            Dispatch::Dropped(DropReason::WrongRole {
                kind: "kick-remote",
                role: Role::Remote
            })
        );
        assert_eq!(router.registry().remote_count(), 1);

        let out = router.dispatch(
            &mut studio.ctx,
            Envelope::Offer {
                from: id,
                sdp: json!("o"),
            },
        );
        assert!(matches!(out, Dispatch::Dropped(DropReason::WrongRole { .. })));
    }

    #[test]
    fn relay_only_types_from_clients_are_dropped() {
        let router = router();
        let mut studio = Conn::new(1);
        join_studio(&router, &mut studio);
        let out = router.handle_text(&mut studio.ctx, r#"{"type":"start-call"}"#);
        assert_eq!(out, Dispatch::Dropped(DropReason::RelayOnly("start-call")));
    }

    #[test]
    fn garbage_does_not_unjoin() {
        let router = router();
        let mut studio = Conn::new(1);
        join_studio(&router, &mut studio);

        assert!(matches!(
            router.handle_text(&mut studio.ctx, "{{{"),
            Dispatch::Dropped(DropReason::Protocol(_))
        ));
        assert!(matches!(
            router.handle_text(&mut studio.ctx, r#"{"type":"vu-meter"}"#),
            Dispatch::Dropped(DropReason::UnknownType(_))
        ));
        assert_eq!(studio.ctx.joined(), Some(&Joined::Studio));
        assert_eq!(router.registry().studio_count(), 1);
    }

    #[test]
    fn unknown_target_is_dropped() {
        let router = router();
        let mut studio = Conn::new(1);
        join_studio(&router, &mut studio);
        let out = router.dispatch(&mut studio.ctx, Envelope::ReadyForOffer { target: "r9".into() });
        assert_eq!(out, Dispatch::Dropped(DropReason::UnknownRemote("r9".into())));
    }

    #[test]
    fn second_answer_is_dropped() {
        let router = router();
        let mut s1 = Conn::new(1);
        let mut s2 = Conn::new(2);
        let mut remote = Conn::new(3);
        join_studio(&router, &mut s1);
        join_studio(&router, &mut s2);
        let id = join_remote(&router, &mut remote, "A");

        router.dispatch(&mut s1.ctx, Envelope::ReadyForOffer { target: id.clone() });
        let out = router.dispatch(
            &mut remote.ctx,
            Envelope::Offer {
                from: id.clone(),
                sdp: json!("o"),
            },
        );
        // Every studio sees the offer.
        assert_eq!(out, Dispatch::Delivered(2));

        let answer = |sdp: &str| Envelope::Answer {
            target: id.clone(),
            sdp: json!(sdp),
        };
        assert_eq!(router.dispatch(&mut s1.ctx, answer("a1")), Dispatch::Delivered(1));
        assert!(matches!(
            router.dispatch(&mut s2.ctx, answer("a2")),
            Dispatch::Dropped(DropReason::Link { .. })
        ));
    }

    #[test]
    fn kick_removes_remote_and_notifies_studios() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");
        studio.received();

        let out = router.dispatch(&mut studio.ctx, Envelope::KickRemote { target: id.clone() });
        assert_eq!(out, Dispatch::Delivered(1));
        assert_eq!(remote.received(), vec![Envelope::Kick { reason: None }]);
        assert_eq!(
            studio.received(),
            vec![Envelope::RemoteDisconnected {
                id: id.clone(),
                name: Some("A".into())
            }]
        );
        assert!(router.registry().lookup_remote(&id).is_none());
    }

    #[test]
    fn mute_updates_flow_and_are_recorded() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");
        studio.received();

        router.dispatch(
            &mut studio.ctx,
            Envelope::MuteUpdate {
                target: Some(id.clone()),
                from: None,
                muted: true,
            },
        );
        assert_eq!(
            remote.received(),
            vec![Envelope::MuteUpdate {
                target: Some(id.clone()),
                from: None,
                muted: true
            }]
        );

        router.dispatch(
            &mut remote.ctx,
            Envelope::MuteUpdate {
                target: None,
                from: None,
                muted: true,
            },
        );
        assert_eq!(
            studio.received(),
            vec![Envelope::MuteUpdate {
                target: None,
                from: Some(id.clone()),
                muted: true
            }]
        );

        let mute = router.registry().lookup_remote(&id).unwrap().mute;
        assert!(mute.self_muted && mute.imposed_muted);
    }

    #[test]
    fn studio_chat_without_target_reaches_every_remote() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut a = Conn::new(2);
        let mut b = Conn::new(3);
        router.handle_text(&mut studio.ctx, r#"{"type":"join","role":"studio","name":"desk"}"#);
        join_remote(&router, &mut a, "A");
        join_remote(&router, &mut b, "B");

        let out = router.handle_text(&mut studio.ctx, r#"{"type":"chat","text":"stand by"}"#);
        assert_eq!(out, Dispatch::Delivered(2));
        let expected = vec![Envelope::Chat {
            from: Some("desk".into()),
            target: None,
            text: "stand by".into(),
        }];
        assert_eq!(a.received(), expected);
        assert_eq!(b.received(), expected);
    }

    #[test]
    fn disconnect_unregisters() {
        let router = router();
        let mut studio = Conn::new(1);
        let mut remote = Conn::new(2);
        join_studio(&router, &mut studio);
        let id = join_remote(&router, &mut remote, "A");

        let removed = router.disconnect(&mut remote.ctx);
        assert!(matches!(removed, Some(Removed::Remote { id: r, .. }) if r == id));
        assert!(remote.ctx.joined().is_none());
        assert!(router.disconnect(&mut remote.ctx).is_none());
    }
}
