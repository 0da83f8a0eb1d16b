//! Membership registry with fixed-slot admission control.
//!
//! The registry is the authoritative table of connected users. It owns a
//! small pool of routing slots; every live connection (still handshaking
//! or fully registered) holds exactly one slot, and a connection that finds
//! no free slot is refused.
//!
//! # Lifecycle
//!
//! ```text
//! accept ──reserve()──► Connecting (slot held, no record)
//!                          │ identity frame
//!                          ▼
//!                      register() ──► Active (ConnectionRecord)
//!                          │ close / error / shutdown
//!                          ▼
//!                      unregister() ──► slot freed
//! ```
//!
//! The registry is owned by the relay loop task and is never shared across
//! threads, so it needs no locking.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

use super::connection::ConnectionId;

/// Length of the generated identity token.
const TOKEN_LEN: usize = 8;

/// One routing slot, numbered from 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slot(usize);

impl Slot {
    /// Build a slot from its 1-based number.
    pub fn new(number: usize) -> Self {
        Self(number)
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Every slot is held by another connection.
    #[error("no free routing slot")]
    SlotsExhausted,

    /// The connection already completed registration.
    #[error("{0} is already registered")]
    AlreadyRegistered(ConnectionId),
}

/// Identity and routing metadata for one registered connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRecord {
    /// Connection identity.
    pub id: ConnectionId,
    /// Display name declared at handshake.
    pub name: String,
    /// Short random token that disambiguates duplicate names.
    pub token: String,
    /// Routing slot held by this connection.
    pub slot: Slot,
}

impl ConnectionRecord {
    /// `"name#token"` label used in presence lists and notifications.
    pub fn label(&self) -> String {
        format!("{}#{}", self.name, self.token)
    }
}

/// Slot pool plus the records of registered connections.
#[derive(Debug)]
pub struct Registry {
    /// Slot holders; index `i` is slot `i + 1`.
    slots: Vec<Option<ConnectionId>>,
    /// Registered connections in registration order.
    records: Vec<ConnectionRecord>,
}

impl Registry {
    /// Create an empty registry with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            records: Vec::with_capacity(capacity),
        }
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots not held by any connection.
    pub fn free_slots(&self) -> usize {
        self.slots.iter().filter(|holder| holder.is_none()).count()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True if nobody is registered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Slot currently held by `id`, whether reserved or registered.
    pub fn slot_of(&self, id: ConnectionId) -> Option<Slot> {
        self.slots
            .iter()
            .position(|holder| *holder == Some(id))
            .map(|index| Slot(index + 1))
    }

    /// Reserve the lowest free slot for a connection that is still
    /// handshaking.
    ///
    /// Reserving again for the same connection returns the slot it holds.
    pub fn reserve(&mut self, id: ConnectionId) -> Result<Slot, RegistryError> {
        if let Some(slot) = self.slot_of(id) {
            return Ok(slot);
        }
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .ok_or(RegistryError::SlotsExhausted)?;
        self.slots[index] = Some(id);
        Ok(Slot(index + 1))
    }

    /// Free a reservation whose handshake never completed.
    ///
    /// Returns `false` if `id` holds no slot or is already registered
    /// (registered connections leave through [`Registry::unregister`]).
    pub fn release(&mut self, id: ConnectionId) -> bool {
        if self.record_for(id).is_some() {
            return false;
        }
        match self.slot_of(id) {
            Some(slot) => {
                self.slots[slot.0 - 1] = None;
                true
            }
            None => false,
        }
    }

    /// Register a connection under `display_name`.
    ///
    /// Uses the slot reserved for `id` if there is one, otherwise the lowest
    /// free slot. Invalid UTF-8 in the name is replaced lossily.
    pub fn register(
        &mut self,
        id: ConnectionId,
        display_name: &[u8],
    ) -> Result<ConnectionRecord, RegistryError> {
        if self.record_for(id).is_some() {
            return Err(RegistryError::AlreadyRegistered(id));
        }
        let slot = self.reserve(id)?;
        let record = ConnectionRecord {
            id,
            name: String::from_utf8_lossy(display_name).into_owned(),
            token: generate_token(),
            slot,
        };
        self.records.push(record.clone());
        Ok(record)
    }

    /// Remove a connection and free its slot.
    ///
    /// Also drops a pending reservation. Returns the record if the
    /// connection was registered; `None` is a normal outcome for
    /// connections that never finished the handshake or were already
    /// removed.
    pub fn unregister(&mut self, id: ConnectionId) -> Option<ConnectionRecord> {
        if let Some(slot) = self.slot_of(id) {
            self.slots[slot.0 - 1] = None;
        }
        let index = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(index))
    }

    /// Record for a registered connection.
    pub fn record_for(&self, id: ConnectionId) -> Option<&ConnectionRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Iterate registered connections in registration order.
    pub fn all_connections(&self) -> impl Iterator<Item = &ConnectionRecord> {
        self.records.iter()
    }

    /// `"name#token"` for every registered connection, in registration order.
    ///
    /// Recomputed on every call.
    pub fn snapshot_presence(&self) -> Vec<String> {
        self.records.iter().map(ConnectionRecord::label).collect()
    }
}

/// Generate a short identity token from a random v4 UUID.
fn generate_token() -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.truncate(TOKEN_LEN);
    token
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ConnectionId> {
        (0..n).map(|_| ConnectionId::next()).collect()
    }

    #[test]
    fn test_register_assigns_lowest_free_slot() {
        let mut registry = Registry::new(2);
        let (a, b) = (ConnectionId::next(), ConnectionId::next());

        let alice = registry.register(a, b"alice").unwrap();
        let bob = registry.register(b, b"bob").unwrap();

        assert_eq!(alice.slot, Slot::new(1));
        assert_eq!(bob.slot, Slot::new(2));
        assert_eq!(registry.free_slots(), 0);
    }

    #[test]
    fn test_slots_exhausted() {
        let mut registry = Registry::new(2);
        let conns = ids(3);
        registry.register(conns[0], b"alice").unwrap();
        registry.register(conns[1], b"bob").unwrap();

        assert_eq!(
            registry.register(conns[2], b"carol"),
            Err(RegistryError::SlotsExhausted)
        );
        assert_eq!(registry.reserve(conns[2]), Err(RegistryError::SlotsExhausted));
        assert_eq!(registry.len(), 2);
        assert!(registry.record_for(conns[2]).is_none());
    }

    #[test]
    fn test_freed_slot_is_reused_exactly_once() {
        let mut registry = Registry::new(2);
        let conns = ids(4);
        registry.register(conns[0], b"alice").unwrap();
        let bob = registry.register(conns[1], b"bob").unwrap();

        registry.unregister(conns[1]).unwrap();

        let carol = registry.register(conns[2], b"carol").unwrap();
        assert_eq!(carol.slot, bob.slot);
        assert_eq!(
            registry.register(conns[3], b"dave"),
            Err(RegistryError::SlotsExhausted)
        );
    }

    #[test]
    fn test_reservation_counts_as_occupied() {
        let mut registry = Registry::new(1);
        let (a, b) = (ConnectionId::next(), ConnectionId::next());

        assert_eq!(registry.reserve(a), Ok(Slot::new(1)));
        assert_eq!(registry.reserve(a), Ok(Slot::new(1)));
        assert_eq!(registry.reserve(b), Err(RegistryError::SlotsExhausted));
        assert!(registry.is_empty());

        let record = registry.register(a, b"alice").unwrap();
        assert_eq!(record.slot, Slot::new(1));
        assert_eq!(registry.register(a, b"again"), Err(RegistryError::AlreadyRegistered(a)));
    }

    #[test]
    fn test_release_frees_only_pending_reservations() {
        let mut registry = Registry::new(2);
        let (a, b) = (ConnectionId::next(), ConnectionId::next());

        registry.reserve(a).unwrap();
        registry.register(b, b"bob").unwrap();

        assert!(registry.release(a));
        assert!(!registry.release(a));
        assert!(!registry.release(b), "registered connections are not released");
        assert_eq!(registry.free_slots(), 1);
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = Registry::new(2);
        let a = ConnectionId::next();
        registry.register(a, b"alice").unwrap();

        let removed = registry.unregister(a).unwrap();
        assert_eq!(removed.name, "alice");
        assert!(registry.unregister(a).is_none());
        assert!(registry.unregister(ConnectionId::next()).is_none());
        assert_eq!(registry.free_slots(), 2);
    }

    #[test]
    fn test_unregister_drops_pending_reservation() {
        let mut registry = Registry::new(1);
        let a = ConnectionId::next();
        registry.reserve(a).unwrap();

        assert!(registry.unregister(a).is_none());
        assert_eq!(registry.free_slots(), 1);
    }

    #[test]
    fn test_presence_matches_active_records() {
        let mut registry = Registry::new(3);
        let conns = ids(5);

        registry.register(conns[0], b"alice").unwrap();
        registry.register(conns[1], b"bob").unwrap();
        registry.unregister(conns[0]);
        registry.register(conns[2], b"carol").unwrap();
        registry.register(conns[3], b"bob").unwrap();
        registry.unregister(conns[4]);

        let presence = registry.snapshot_presence();
        assert_eq!(presence.len(), registry.len());
        for (label, record) in presence.iter().zip(registry.all_connections()) {
            assert_eq!(*label, format!("{}#{}", record.name, record.token));
        }
        let names: Vec<&str> = registry.all_connections().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["bob", "carol", "bob"]);
    }

    #[test]
    fn test_duplicate_names_get_distinct_tokens() {
        let mut registry = Registry::new(2);
        let (a, b) = (ConnectionId::next(), ConnectionId::next());
        let first = registry.register(a, b"sam").unwrap();
        let second = registry.register(b, b"sam").unwrap();
        assert_ne!(first.label(), second.label());
    }

    #[test]
    fn test_token_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_invalid_utf8_name_is_lossy() {
        let mut registry = Registry::new(1);
        let record = registry.register(ConnectionId::next(), b"bad\xffname").unwrap();
        assert_eq!(record.name, "bad\u{fffd}name");
    }

    #[test]
    fn test_zero_capacity_refuses_everyone() {
        let mut registry = Registry::new(0);
        assert_eq!(registry.capacity(), 0);
        assert_eq!(
            registry.reserve(ConnectionId::next()),
            Err(RegistryError::SlotsExhausted)
        );
    }
}
