// ABOUTME: The routing state machine - one inbound frame in, a set of addressed emissions out
// ABOUTME: Owns the roster and the idle-eviction clock; never panics, never blocks

use crate::codec::{FrameType, RawFrame, Reply};
use crate::config::EvictionConfig;
use crate::roster::{Registration, Roster};
use crate::transport::HandleId;
use crate::username::UserName;
use bytes::Bytes;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One instruction the router hands back to the hub.
#[derive(Debug)]
pub enum Emission {
    /// Enqueue `reply` on the destination's write queue.
    Deliver { to: HandleId, reply: Reply },
    /// The delivery handle is no longer needed; tear down its writer.
    Release(HandleId),
}

/// The single-writer router.
///
/// All roster mutation happens inside [`Router::step`], [`Router::tick`] and
/// the failure hooks, which the hub drives from one task. Emissions for a
/// step are produced in declaration order; the hub preserves that order per
/// destination.
pub struct Router {
    roster: Roster,
    eviction: EvictionConfig,
    /// Write-failure departures waiting to be announced on the next step.
    deferred: Vec<(UserName, HandleId)>,
}

impl Router {
    pub fn new(capacity: usize, eviction: EvictionConfig) -> Self {
        Router {
            roster: Roster::new(capacity),
            eviction,
            deferred: Vec::new(),
        }
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Process one inbound frame from `endpoint`.
    pub fn step(&mut self, endpoint: HandleId, frame: RawFrame<'_>, now: Instant) -> Vec<Emission> {
        let mut out = Vec::new();
        self.drain_deferred(&mut out);

        let bound = self.roster.name_of(endpoint).cloned();

        // Anti-spoofing: a claimed source that does not match the endpoint's
        // registered name never reaches a handler.
        if let Some(name) = &bound {
            if !frame.source.is_empty() && frame.source != name.as_bytes() {
                warn!(
                    %endpoint,
                    bound = %name,
                    claimed = %String::from_utf8_lossy(frame.source),
                    "dropping spoofed frame"
                );
                return out;
            }
        }

        if frame.frame_type == FrameType::Join {
            self.handle_join(endpoint, frame.source, now, &mut out);
            return out;
        }

        let Some(name) = bound else {
            debug!(%endpoint, frame_type = frame.frame_type.as_str(), "frame from unregistered endpoint");
            out.push(error_to(endpoint, frame.source, "not registered"));
            return out;
        };

        match frame.frame_type {
            FrameType::Leave => self.handle_leave(&name, now, &mut out),
            FrameType::List => self.handle_list(endpoint, &name, now, &mut out),
            FrameType::Msg => self.handle_msg(&name, frame.content, now, &mut out),
            FrameType::Priv => {
                self.handle_priv(endpoint, &name, frame.dest, frame.content, now, &mut out)
            }
            FrameType::System | FrameType::Error => {
                warn!(%endpoint, "client attempted to originate a SYSTEM frame");
                out.push(error_to(
                    endpoint,
                    frame.source,
                    "clients may not originate SYSTEM frames",
                ));
            }
            // Handled before the match.
            FrameType::Join => {}
        }
        out
    }

    /// One eviction sweep. Call at a fixed cadence.
    pub fn tick(&mut self, now: Instant) -> Vec<Emission> {
        let mut out = Vec::new();
        self.drain_deferred(&mut out);

        let evicted = self
            .roster
            .evict_idle(now, self.eviction.idle_after, self.eviction.interval);
        for (name, handle) in evicted {
            info!(user = %name, "evicting idle user");
            let text = format!("User {name} disconnected (timeout)");
            self.announce_leave(&name, &text, &mut out);
            out.push(Emission::Release(handle));
        }
        out
    }

    /// A writer reported a failed or timed-out delivery.
    ///
    /// The destination goes INACTIVE immediately, but its departure is
    /// announced on the *next* step so a cascade of failures cannot recurse.
    pub fn on_write_failure(&mut self, endpoint: HandleId, now: Instant) {
        if let Some(name) = self.roster.name_of(endpoint).cloned() {
            warn!(user = %name, %endpoint, "write failure, deactivating destination");
            self.roster.deregister(name.as_str(), now);
            self.deferred.push((name, endpoint));
        }
    }

    /// A transport endpoint closed (EOF or unrecoverable read error).
    /// Treated as an implicit LEAVE.
    pub fn on_disconnect(&mut self, endpoint: HandleId, now: Instant) -> Vec<Emission> {
        let mut out = Vec::new();
        self.drain_deferred(&mut out);
        if let Some(name) = self.roster.name_of(endpoint).cloned() {
            self.handle_leave(&name, now, &mut out);
        }
        out
    }

    /// Final emissions before the hub exits: tell every remaining client the
    /// broker is going away and release every handle.
    pub fn shutdown(&mut self) -> Vec<Emission> {
        let mut out = Vec::new();
        for (name, handle) in self.roster.active_handles() {
            out.push(Emission::Deliver {
                to: handle,
                reply: Reply::system(FrameType::Leave, name.as_str(), "Server shutting down"),
            });
            out.push(Emission::Release(handle));
        }
        for (_, handle) in std::mem::take(&mut self.deferred) {
            out.push(Emission::Release(handle));
        }
        self.roster.clear();
        out
    }

    fn drain_deferred(&mut self, out: &mut Vec<Emission>) {
        for (name, handle) in std::mem::take(&mut self.deferred) {
            let text = format!("User {name} left the chat");
            self.announce_leave(&name, &text, out);
            out.push(Emission::Release(handle));
        }
    }

    /// SYSTEM/LEAVE for `name` to every remaining ACTIVE entry.
    fn announce_leave(&self, name: &UserName, text: &str, out: &mut Vec<Emission>) {
        for (_, handle) in self.roster.active_handles() {
            out.push(Emission::Deliver {
                to: handle,
                reply: Reply::system(FrameType::Leave, name.as_str(), text.to_owned()),
            });
        }
    }

    fn handle_join(
        &mut self,
        endpoint: HandleId,
        source: &[u8],
        now: Instant,
        out: &mut Vec<Emission>,
    ) {
        let name = match UserName::parse(source) {
            Ok(name) => name,
            Err(err) => {
                info!(
                    claimed = %String::from_utf8_lossy(source),
                    %err,
                    "rejected join: invalid name"
                );
                out.push(error_to(endpoint, source, err.to_string()));
                return;
            }
        };

        match self.roster.register(&name, endpoint, now) {
            Registration::Added | Registration::Reactivated => {
                info!(user = %name, %endpoint, "user joined");
                out.push(Emission::Deliver {
                    to: endpoint,
                    reply: Reply::system(
                        FrameType::Join,
                        name.as_str(),
                        format!("Welcome to the chat, {name}"),
                    ),
                });
                let text = format!("User {name} joined the chat");
                for (other, handle) in self.roster.active_handles() {
                    if other != name {
                        out.push(Emission::Deliver {
                            to: handle,
                            reply: Reply::system(FrameType::Join, name.as_str(), text.clone()),
                        });
                    }
                }
                self.roster.touch(name.as_str(), now);
            }
            Registration::Rejected(reason) => {
                info!(user = %name, %reason, "rejected join");
                out.push(error_to(endpoint, source, reason.to_string()));
            }
        }
    }

    fn handle_leave(&mut self, name: &UserName, now: Instant, out: &mut Vec<Emission>) {
        if let Some(handle) = self.roster.deregister(name.as_str(), now) {
            info!(user = %name, "user left");
            let text = format!("User {name} left the chat");
            self.announce_leave(name, &text, out);
            out.push(Emission::Release(handle));
        }
    }

    fn handle_list(
        &mut self,
        endpoint: HandleId,
        name: &UserName,
        now: Instant,
        out: &mut Vec<Emission>,
    ) {
        let listing = self
            .roster
            .snapshot_active()
            .iter()
            .map(|n| n.as_str().to_owned())
            .collect::<Vec<_>>()
            .join(",");
        out.push(Emission::Deliver {
            to: endpoint,
            reply: Reply::system(FrameType::List, name.as_str(), listing),
        });
        self.roster.touch(name.as_str(), now);
    }

    fn handle_msg(
        &mut self,
        name: &UserName,
        content: &[u8],
        now: Instant,
        out: &mut Vec<Emission>,
    ) {
        debug!(user = %name, len = content.len(), "broadcast");
        for (other, handle) in self.roster.active_handles() {
            if other != *name {
                out.push(Emission::Deliver {
                    to: handle,
                    reply: Reply::from_user(
                        name.as_str(),
                        FrameType::Msg,
                        "",
                        Bytes::copy_from_slice(content),
                    ),
                });
            }
        }
        self.roster.touch(name.as_str(), now);
    }

    fn handle_priv(
        &mut self,
        endpoint: HandleId,
        name: &UserName,
        dest: &[u8],
        content: &[u8],
        now: Instant,
        out: &mut Vec<Emission>,
    ) {
        if dest.is_empty() {
            out.push(error_to(
                endpoint,
                name.as_bytes(),
                "private message needs a destination",
            ));
            return;
        }
        if dest == name.as_bytes() {
            out.push(error_to(
                endpoint,
                name.as_bytes(),
                "cannot send a private message to yourself",
            ));
            return;
        }

        let recipient = match std::str::from_utf8(dest)
            .ok()
            .and_then(|d| self.roster.lookup(d))
            .filter(|entry| entry.is_active())
        {
            Some(entry) => (entry.name.clone(), entry.handle),
            None => {
                out.push(error_to(
                    endpoint,
                    name.as_bytes(),
                    format!("user {} is not online", String::from_utf8_lossy(dest)),
                ));
                return;
            }
        };

        debug!(user = %name, to = %recipient.0, len = content.len(), "private message");
        let frame = Reply::from_user(
            name.as_str(),
            FrameType::Priv,
            recipient.0.as_str(),
            Bytes::copy_from_slice(content),
        );
        out.push(Emission::Deliver {
            to: recipient.1,
            reply: frame.clone(),
        });
        // Echo back so the sender's UI shows the delivered message.
        out.push(Emission::Deliver {
            to: endpoint,
            reply: frame,
        });
        self.roster.touch(name.as_str(), now);
    }
}

/// A SYSTEM/ERROR reply addressed back at the offending endpoint.
fn error_to(endpoint: HandleId, claimed: &[u8], message: impl Into<String>) -> Emission {
    // The claimed source may be arbitrary bytes; keep the reply encodable.
    let dest = String::from_utf8_lossy(claimed).replace('\n', " ");
    Emission::Deliver {
        to: endpoint,
        reply: Reply::system(FrameType::Error, dest, message.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decode_request;

    fn router() -> Router {
        Router::new(50, EvictionConfig::default())
    }

    fn handle(n: u64) -> HandleId {
        HandleId::from_raw(n)
    }

    fn step(r: &mut Router, h: u64, wire: &[u8], now: Instant) -> Vec<Emission> {
        let frame = decode_request(wire).unwrap();
        r.step(handle(h), frame, now)
    }

    fn join(r: &mut Router, h: u64, name: &str, now: Instant) -> Vec<Emission> {
        let wire = format!("JOIN|{name}||");
        step(r, h, wire.as_bytes(), now)
    }

    fn deliveries(emissions: &[Emission]) -> Vec<(&HandleId, &Reply)> {
        emissions
            .iter()
            .filter_map(|e| match e {
                Emission::Deliver { to, reply } => Some((to, reply)),
                Emission::Release(_) => None,
            })
            .collect()
    }

    #[test]
    fn join_welcomes_and_notifies() {
        let mut r = router();
        let now = Instant::now();

        let out = join(&mut r, 1, "alice", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(1));
        assert_eq!(d[0].1.kind, FrameType::Join);
        assert_eq!(d[0].1.dest, "alice");

        let out = join(&mut r, 2, "bob", now);
        let d = deliveries(&out);
        // Welcome to bob plus one notification to alice.
        assert_eq!(d.len(), 2);
        assert_eq!(*d[0].0, handle(2));
        assert_eq!(*d[1].0, handle(1));
        assert_eq!(d[1].1.dest, "bob");
    }

    #[test]
    fn duplicate_join_rejected_without_disturbing_roster() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = join(&mut r, 3, "alice", now);
        let d = deliveries(&out);
        // Exactly one SYSTEM/ERROR, to the impostor; alice hears nothing.
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(3));
        assert_eq!(d[0].1.kind, FrameType::Error);
        assert_eq!(d[0].1.dest, "alice");

        let names: Vec<String> = r
            .roster()
            .snapshot_active()
            .iter()
            .map(|n| n.as_str().to_owned())
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(r.roster().lookup("alice").unwrap().handle, handle(1));
    }

    #[test]
    fn reserved_and_invalid_joins_are_rejected() {
        let mut r = router();
        let now = Instant::now();
        for bad in ["SYSTEM", "ALL", "ab", "1abc"] {
            let wire = format!("JOIN|{bad}||");
            let out = step(&mut r, 9, wire.as_bytes(), now);
            let d = deliveries(&out);
            assert_eq!(d.len(), 1, "join as {bad:?}");
            assert_eq!(d[0].1.kind, FrameType::Error);
        }
        assert!(r.roster().is_empty());
    }

    #[test]
    fn msg_fans_out_to_everyone_else() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);
        join(&mut r, 3, "carol", now);

        let out = step(&mut r, 1, b"MSG|alice||hello", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 2);
        let mut targets: Vec<HandleId> = d.iter().map(|(h, _)| **h).collect();
        targets.sort();
        assert_eq!(targets, vec![handle(2), handle(3)]);
        for (_, reply) in &d {
            assert_eq!(reply.source, "alice");
            assert_eq!(reply.kind, FrameType::Msg);
            assert_eq!(reply.dest, "");
            assert_eq!(&reply.content[..], b"hello");
        }
    }

    #[test]
    fn unregistered_sender_gets_not_registered() {
        let mut r = router();
        let now = Instant::now();
        let out = step(&mut r, 5, b"MSG|ghost||boo", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(5));
        assert_eq!(d[0].1.kind, FrameType::Error);
        assert_eq!(&d[0].1.content[..], b"not registered");
    }

    #[test]
    fn spoofed_source_is_dropped() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        // bob claims to be alice: silently dropped.
        let out = step(&mut r, 2, b"MSG|alice||fake", now);
        assert!(deliveries(&out).is_empty());
    }

    #[test]
    fn priv_delivers_and_echoes() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = step(&mut r, 1, b"PRIV|alice|bob|hi", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 2);
        assert_eq!(*d[0].0, handle(2));
        assert_eq!(*d[1].0, handle(1));
        for (_, reply) in &d {
            assert_eq!(reply.source, "alice");
            assert_eq!(reply.kind, FrameType::Priv);
            assert_eq!(reply.dest, "bob");
            assert_eq!(&reply.content[..], b"hi");
        }
    }

    #[test]
    fn priv_to_missing_user_is_one_error_and_no_roster_change() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        let before = r.roster().snapshot_active().len();

        for wire in [&b"PRIV|alice|carol|?"[..], b"PRIV|alice||x", b"PRIV|alice|alice|x"] {
            let out = step(&mut r, 1, wire, now);
            let d = deliveries(&out);
            assert_eq!(d.len(), 1, "wire {wire:?}");
            assert_eq!(*d[0].0, handle(1));
            assert_eq!(d[0].1.kind, FrameType::Error);
            assert_eq!(d[0].1.dest, "alice");
        }
        assert_eq!(r.roster().snapshot_active().len(), before);
    }

    #[test]
    fn list_reports_active_names_in_order() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = step(&mut r, 1, b"LIST|alice||", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].1.kind, FrameType::List);
        assert_eq!(&d[0].1.content[..], b"alice,bob");
    }

    #[test]
    fn client_system_frames_are_refused() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        let out = step(&mut r, 1, b"SYSTEM|alice||pwn", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(d[0].1.kind, FrameType::Error);
        // Nothing was routed to anyone else.
        assert_eq!(*d[0].0, handle(1));
    }

    #[test]
    fn leave_announces_to_survivors() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = step(&mut r, 1, b"LEAVE|alice||", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(2));
        assert_eq!(d[0].1.kind, FrameType::Leave);
        assert_eq!(d[0].1.dest, "alice");
        assert!(
            out.iter()
                .any(|e| matches!(e, Emission::Release(h) if *h == handle(1)))
        );
    }

    #[test]
    fn write_failure_defers_announcement_to_next_step() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        r.on_write_failure(handle(2), now);
        // bob is gone from the active roster immediately...
        assert_eq!(r.roster().active_count(), 1);

        // ...but the LEAVE announcement rides the next step, before that
        // step's own emissions.
        let out = step(&mut r, 1, b"MSG|alice||ping", now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(1));
        assert_eq!(d[0].1.kind, FrameType::Leave);
        assert_eq!(d[0].1.dest, "bob");
        // alice's broadcast found no other active users, which is not an
        // error for alice.
        assert!(
            out.iter()
                .any(|e| matches!(e, Emission::Release(h) if *h == handle(2)))
        );
    }

    #[test]
    fn eviction_with_no_survivors_emits_only_release() {
        let mut r = Router::new(50, EvictionConfig::default());
        let start = Instant::now();
        join(&mut r, 1, "alice", start);

        let later = start + std::time::Duration::from_secs(31);
        let out = r.tick(later);
        assert!(deliveries(&out).is_empty());
        assert!(
            out.iter()
                .any(|e| matches!(e, Emission::Release(h) if *h == handle(1)))
        );
        assert_eq!(r.roster().active_count(), 0);
    }

    #[test]
    fn eviction_announces_to_survivors() {
        let mut r = router();
        let start = Instant::now();
        join(&mut r, 1, "alice", start);
        let later = start + std::time::Duration::from_secs(20);
        join(&mut r, 2, "bob", later);

        let out = r.tick(start + std::time::Duration::from_secs(31));
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(2));
        assert_eq!(d[0].1.kind, FrameType::Leave);
        assert_eq!(d[0].1.dest, "alice");
    }

    #[test]
    fn no_duplicate_actives_across_arbitrary_joins() {
        let mut r = router();
        let now = Instant::now();
        let names = ["alice", "bob", "carol", "dave"];
        for round in 0..3 {
            for (i, n) in names.iter().enumerate() {
                // Varying endpoints: later rounds simulate reconnects.
                let _ = join(&mut r, (round * 10 + i) as u64 + 1, n, now);
            }
        }
        let snapshot = r.roster().snapshot_active();
        let mut seen = std::collections::HashSet::new();
        for name in &snapshot {
            assert!(seen.insert(name.as_str().to_owned()), "duplicate {name}");
        }
    }

    #[test]
    fn disconnect_is_an_implicit_leave() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = r.on_disconnect(handle(2), now);
        let d = deliveries(&out);
        assert_eq!(d.len(), 1);
        assert_eq!(*d[0].0, handle(1));
        assert_eq!(d[0].1.kind, FrameType::Leave);
        assert_eq!(d[0].1.dest, "bob");
    }

    #[test]
    fn shutdown_notifies_every_active_user() {
        let mut r = router();
        let now = Instant::now();
        join(&mut r, 1, "alice", now);
        join(&mut r, 2, "bob", now);

        let out = r.shutdown();
        let d = deliveries(&out);
        assert_eq!(d.len(), 2);
        for (_, reply) in &d {
            assert_eq!(reply.kind, FrameType::Leave);
        }
        assert!(r.roster().is_empty());
    }
}
