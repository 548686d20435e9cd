// ABOUTME: Authoritative in-memory table of known users and their delivery handles
// ABOUTME: Single-writer by design; only the router task ever mutates it

use crate::transport::HandleId;
use crate::username::{NameError, UserName};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Liveness of a roster entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Active,
    Inactive,
}

/// One registered user.
#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub name: UserName,
    pub handle: HandleId,
    pub state: EntryState,
    pub last_active: Instant,
    /// Set when the entry went INACTIVE; cleared on reactivation.
    inactive_since: Option<Instant>,
}

impl RosterEntry {
    pub fn is_active(&self) -> bool {
        self.state == EntryState::Active
    }
}

/// Outcome of a registration attempt.
#[derive(Debug)]
pub enum Registration {
    /// A brand-new entry was created.
    Added,
    /// An existing entry was flipped INACTIVE -> ACTIVE (reconnect), or the
    /// same endpoint re-sent JOIN for the name it already holds.
    Reactivated,
    Rejected(RegistrationError),
}

/// Why a registration was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    #[error("name already in use")]
    NameInUse,

    #[error("invalid name: {0}")]
    InvalidName(NameError),

    #[error("name is reserved")]
    ReservedName,

    #[error("server is full")]
    ServerFull,
}

impl From<NameError> for RegistrationError {
    fn from(err: NameError) -> Self {
        match err {
            NameError::Reserved { .. } => RegistrationError::ReservedName,
            other => RegistrationError::InvalidName(other),
        }
    }
}

/// The user table: name -> entry, plus a handle -> name reverse index used to
/// resolve inbound frames and report write failures.
///
/// Insertion order is preserved so LIST responses are stable. Entries survive
/// the ACTIVE -> INACTIVE transition (a reconnect under the same name reuses
/// the slot); they are removed only by the eviction sweep.
pub struct Roster {
    entries: Vec<RosterEntry>,
    by_name: HashMap<String, usize>,
    by_handle: HashMap<HandleId, usize>,
    capacity: usize,
}

impl Roster {
    pub fn new(capacity: usize) -> Self {
        Roster {
            entries: Vec::new(),
            by_name: HashMap::new(),
            by_handle: HashMap::new(),
            capacity,
        }
    }

    /// Register `name` for the endpoint `handle`.
    pub fn register(&mut self, name: &UserName, handle: HandleId, now: Instant) -> Registration {
        if let Some(&idx) = self.by_name.get(name.as_str()) {
            let entry = &mut self.entries[idx];
            if entry.is_active() && entry.handle != handle {
                return Registration::Rejected(RegistrationError::NameInUse);
            }
            // Reconnect (or an idempotent re-JOIN from the same endpoint):
            // reuse the slot with the fresh handle.
            self.by_handle.remove(&entry.handle);
            entry.handle = handle;
            entry.state = EntryState::Active;
            entry.last_active = now;
            entry.inactive_since = None;
            self.by_handle.insert(handle, idx);
            return Registration::Reactivated;
        }

        if self.entries.len() >= self.capacity {
            return Registration::Rejected(RegistrationError::ServerFull);
        }

        let idx = self.entries.len();
        self.entries.push(RosterEntry {
            name: name.clone(),
            handle,
            state: EntryState::Active,
            last_active: now,
            inactive_since: None,
        });
        self.by_name.insert(name.as_str().to_owned(), idx);
        self.by_handle.insert(handle, idx);
        Registration::Added
    }

    /// Transition ACTIVE -> INACTIVE. Idempotent on INACTIVE or absent names.
    ///
    /// Returns the delivery handle of a newly-deactivated entry so the caller
    /// can release it.
    pub fn deregister(&mut self, name: &str, now: Instant) -> Option<HandleId> {
        let idx = *self.by_name.get(name)?;
        let entry = &mut self.entries[idx];
        if !entry.is_active() {
            return None;
        }
        entry.state = EntryState::Inactive;
        entry.inactive_since = Some(now);
        Some(entry.handle)
    }

    /// Record activity for `name`.
    pub fn touch(&mut self, name: &str, now: Instant) {
        if let Some(&idx) = self.by_name.get(name) {
            self.entries[idx].last_active = now;
        }
    }

    pub fn lookup(&self, name: &str) -> Option<&RosterEntry> {
        self.by_name.get(name).map(|&idx| &self.entries[idx])
    }

    /// Resolve an endpoint to the name it is registered under.
    ///
    /// Only ACTIVE bindings resolve; an endpoint whose entry has gone
    /// INACTIVE counts as unregistered until it re-JOINs.
    pub fn name_of(&self, handle: HandleId) -> Option<&UserName> {
        let &idx = self.by_handle.get(&handle)?;
        let entry = &self.entries[idx];
        entry.is_active().then_some(&entry.name)
    }

    /// Insertion-ordered names of all ACTIVE entries.
    pub fn snapshot_active(&self) -> Vec<UserName> {
        self.entries
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.name.clone())
            .collect()
    }

    /// ACTIVE entries as (name, handle) pairs, for fan-out.
    pub fn active_handles(&self) -> Vec<(UserName, HandleId)> {
        self.entries
            .iter()
            .filter(|e| e.is_active())
            .map(|e| (e.name.clone(), e.handle))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_active()).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One eviction sweep.
    ///
    /// ACTIVE entries idle for longer than `idle_after` transition to
    /// INACTIVE and are returned so the router can announce them. Entries
    /// that have already sat INACTIVE for `expire_after` are removed
    /// outright, which is why an evicted name shows up in at most one sweep
    /// result before disappearing.
    pub fn evict_idle(
        &mut self,
        now: Instant,
        idle_after: Duration,
        expire_after: Duration,
    ) -> Vec<(UserName, HandleId)> {
        let mut evicted = Vec::new();
        for entry in &mut self.entries {
            if entry.is_active() && now.duration_since(entry.last_active) >= idle_after {
                entry.state = EntryState::Inactive;
                entry.inactive_since = Some(now);
                evicted.push((entry.name.clone(), entry.handle));
            }
        }

        let expired: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| {
                e.inactive_since
                    .is_some_and(|t| now.duration_since(t) >= expire_after)
            })
            .map(|(idx, _)| idx)
            .collect();
        if !expired.is_empty() {
            let mut idx = 0;
            self.entries.retain(|_| {
                let keep = !expired.contains(&idx);
                idx += 1;
                keep
            });
            self.reindex();
        }

        evicted
    }

    /// Drop every entry. Used during hub shutdown.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_name.clear();
        self.by_handle.clear();
    }

    fn reindex(&mut self) {
        self.by_name.clear();
        self.by_handle.clear();
        for (idx, entry) in self.entries.iter().enumerate() {
            self.by_name.insert(entry.name.as_str().to_owned(), idx);
            self.by_handle.insert(entry.handle, idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> UserName {
        UserName::parse_str(s).unwrap()
    }

    fn handle(n: u64) -> HandleId {
        HandleId::from_raw(n)
    }

    #[test]
    fn register_and_lookup() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        assert!(matches!(
            roster.register(&name("alice"), handle(1), now),
            Registration::Added
        ));
        let entry = roster.lookup("alice").unwrap();
        assert!(entry.is_active());
        assert_eq!(entry.handle, handle(1));
        assert_eq!(roster.name_of(handle(1)).unwrap(), "alice");
    }

    #[test]
    fn duplicate_active_name_is_rejected() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        roster.register(&name("alice"), handle(1), now);
        assert!(matches!(
            roster.register(&name("alice"), handle(2), now),
            Registration::Rejected(RegistrationError::NameInUse)
        ));
        // The original binding is untouched.
        assert_eq!(roster.lookup("alice").unwrap().handle, handle(1));
    }

    #[test]
    fn rejoin_from_same_endpoint_is_reactivation() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        roster.register(&name("alice"), handle(1), now);
        assert!(matches!(
            roster.register(&name("alice"), handle(1), now),
            Registration::Reactivated
        ));
    }

    #[test]
    fn reconnect_reuses_inactive_slot() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        roster.register(&name("alice"), handle(1), now);
        roster.register(&name("bob"), handle(2), now);
        assert_eq!(roster.deregister("alice", now), Some(handle(1)));
        assert_eq!(roster.name_of(handle(1)), None);

        assert!(matches!(
            roster.register(&name("alice"), handle(7), now),
            Registration::Reactivated
        ));
        assert_eq!(roster.lookup("alice").unwrap().handle, handle(7));
        // Insertion order survives the round trip.
        let names: Vec<String> = roster
            .snapshot_active()
            .iter()
            .map(|n| n.as_str().to_owned())
            .collect();
        assert_eq!(names, vec!["alice", "bob"]);
    }

    #[test]
    fn deregister_is_idempotent() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        roster.register(&name("alice"), handle(1), now);
        assert!(roster.deregister("alice", now).is_some());
        assert!(roster.deregister("alice", now).is_none());
        assert!(roster.deregister("nobody", now).is_none());
    }

    #[test]
    fn capacity_is_enforced() {
        let mut roster = Roster::new(2);
        let now = Instant::now();
        roster.register(&name("alice"), handle(1), now);
        roster.register(&name("bob"), handle(2), now);
        assert!(matches!(
            roster.register(&name("carol"), handle(3), now),
            Registration::Rejected(RegistrationError::ServerFull)
        ));
    }

    #[test]
    fn snapshot_preserves_insertion_order() {
        let mut roster = Roster::new(10);
        let now = Instant::now();
        for (i, n) in ["carol", "alice", "bob"].iter().enumerate() {
            roster.register(&name(n), handle(i as u64), now);
        }
        let names: Vec<String> = roster
            .snapshot_active()
            .iter()
            .map(|n| n.as_str().to_owned())
            .collect();
        assert_eq!(names, vec!["carol", "alice", "bob"]);
    }

    #[test]
    fn idle_entries_are_evicted_once_then_removed() {
        let mut roster = Roster::new(10);
        let start = Instant::now();
        let idle = Duration::from_secs(30);
        let expire = Duration::from_secs(1);

        roster.register(&name("alice"), handle(1), start);

        // Not yet idle.
        let evicted = roster.evict_idle(start + Duration::from_secs(29), idle, expire);
        assert!(evicted.is_empty());

        // Crosses the threshold: reported exactly once.
        let evicted = roster.evict_idle(start + Duration::from_secs(30), idle, expire);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, "alice");
        assert!(!roster.lookup("alice").unwrap().is_active());

        // Next sweep does not report it again and removes the entry.
        let evicted = roster.evict_idle(start + Duration::from_secs(31), idle, expire);
        assert!(evicted.is_empty());
        assert!(roster.lookup("alice").is_none());
        assert!(roster.is_empty());
    }

    #[test]
    fn touch_defers_eviction() {
        let mut roster = Roster::new(10);
        let start = Instant::now();
        let idle = Duration::from_secs(30);

        roster.register(&name("alice"), handle(1), start);
        roster.touch("alice", start + Duration::from_secs(20));

        let evicted = roster.evict_idle(start + Duration::from_secs(40), idle, Duration::from_secs(1));
        assert!(evicted.is_empty());

        let evicted = roster.evict_idle(start + Duration::from_secs(50), idle, Duration::from_secs(1));
        assert_eq!(evicted.len(), 1);
    }

    #[test]
    fn expiry_rebuilds_indices() {
        let mut roster = Roster::new(10);
        let start = Instant::now();
        roster.register(&name("alice"), handle(1), start);
        roster.register(&name("bob"), handle(2), start);
        roster.deregister("alice", start);

        // alice expires; bob's index entries must still resolve.
        roster.evict_idle(
            start + Duration::from_secs(2),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );
        assert!(roster.lookup("alice").is_none());
        assert_eq!(roster.name_of(handle(2)).unwrap(), "bob");
        assert_eq!(roster.len(), 1);
    }
}
