//! Room registry
//!
//! The registry exclusively owns room lifetime. Callers get clones of
//! rooms, never references into the table, and every mutation goes
//! through one of the operations below.
//!
//! [`MemoryRegistry`] is backed by a `DashMap`: each operation on a code
//! runs under that code's shard lock, so two operations on the same code
//! never interleave while different codes proceed independently.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use ferry_core::{normalize_code, validate_code, Role, SenderDescriptor, ROOM_MAX_AGE_SECS};
use tracing::{debug, info};

use crate::room::{ConnectionId, Room, RoomError, RoomState, Signal};

/// Result of a successful state-machine step
#[derive(Clone, Debug)]
pub struct Transition {
    /// Room as it was left by the step. When `room.state()` is
    /// `Closed`, the entry has already been removed from the registry.
    pub room: Room,
    /// State before the step
    pub from: RoomState,
    /// Role of the caller that drove the step
    pub caller: Role,
}

impl Transition {
    pub fn is_closed(&self) -> bool {
        self.room.state() == RoomState::Closed
    }

    /// Connection on the other side of the caller, if attached
    pub fn counterpart(&self) -> Option<&ConnectionId> {
        self.room.participant(self.caller.other())
    }
}

/// Narrow interface over room storage
pub trait RoomRegistry: Send + Sync {
    /// Whether a live room holds this code
    fn has(&self, code: &str, now: Instant) -> bool;

    /// Open a new room. Fails with `AlreadyExists` if the code is live.
    ///
    /// An expired room still holding the code is replaced and returned,
    /// closed, alongside the new room so its participants can be told.
    fn create(
        &self,
        code: &str,
        sender: ConnectionId,
        descriptor: SenderDescriptor,
        now: Instant,
    ) -> Result<(Room, Option<Room>), RoomError>;

    /// Attach a receiver. Exactly one of any number of concurrent joins
    /// on the same code succeeds.
    fn join(&self, code: &str, conn: ConnectionId, now: Instant) -> Result<Room, RoomError>;

    /// Look up a live room
    fn get(&self, code: &str, now: Instant) -> Result<Room, RoomError>;

    /// Run one state-machine step for `caller` as a single atomic action.
    /// A step that closes the room also removes it.
    fn apply(
        &self,
        code: &str,
        caller: &ConnectionId,
        signal: Signal,
        now: Instant,
    ) -> Result<Transition, RoomError>;

    /// Remove a room. Removing an absent code is a no-op.
    fn remove(&self, code: &str) -> Option<Room>;

    /// Remove every room older than `max_age` and return them, closed
    fn sweep_expired(&self, now: Instant, max_age: Duration) -> Vec<Room>;

    /// Number of rooms held, live or awaiting sweep
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-memory registry
pub struct MemoryRegistry {
    rooms: DashMap<String, Room>,
    max_age: Duration,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::with_max_age(Duration::from_secs(ROOM_MAX_AGE_SECS))
    }

    /// Create with a custom room lifetime
    pub fn with_max_age(max_age: Duration) -> Self {
        Self {
            rooms: DashMap::new(),
            max_age,
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn key(code: &str) -> Result<String, RoomError> {
        let code = normalize_code(code);
        if validate_code(&code) {
            Ok(code)
        } else {
            Err(RoomError::InvalidCode)
        }
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry for MemoryRegistry {
    fn has(&self, code: &str, now: Instant) -> bool {
        self.get(code, now).is_ok()
    }

    fn create(
        &self,
        code: &str,
        sender: ConnectionId,
        descriptor: SenderDescriptor,
        now: Instant,
    ) -> Result<(Room, Option<Room>), RoomError> {
        let code = Self::key(code)?;
        let room = Room::new(code.clone(), sender, descriptor, now);

        let displaced = match self.rooms.entry(code) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired(now, self.max_age) {
                    return Err(RoomError::AlreadyExists);
                }
                // The old room is past its lifetime but not yet swept
                debug!("Reusing expired code {}", room.code);
                let mut old = entry.insert(room.clone());
                old.expire();
                Some(old)
            }
            Entry::Vacant(entry) => {
                entry.insert(room.clone());
                None
            }
        };

        Ok((room, displaced))
    }

    fn join(&self, code: &str, conn: ConnectionId, now: Instant) -> Result<Room, RoomError> {
        let code = Self::key(code)?;
        let mut room = self.rooms.get_mut(&code).ok_or(RoomError::NotFound)?;
        if room.is_expired(now, self.max_age) {
            return Err(RoomError::NotFound);
        }

        room.attach_receiver(conn)?;
        Ok(room.value().clone())
    }

    fn get(&self, code: &str, now: Instant) -> Result<Room, RoomError> {
        let code = Self::key(code)?;
        match self.rooms.get(&code) {
            Some(room) if !room.is_expired(now, self.max_age) => Ok(room.value().clone()),
            _ => Err(RoomError::NotFound),
        }
    }

    fn apply(
        &self,
        code: &str,
        caller: &ConnectionId,
        signal: Signal,
        now: Instant,
    ) -> Result<Transition, RoomError> {
        let code = Self::key(code)?;
        let Entry::Occupied(mut entry) = self.rooms.entry(code) else {
            return Err(RoomError::NotFound);
        };

        let room = entry.get_mut();
        if signal != Signal::Disconnect && room.is_expired(now, self.max_age) {
            return Err(RoomError::NotFound);
        }

        let from = room.state();
        let caller = room.apply(caller, signal)?;

        let room = if room.state() == RoomState::Closed {
            let room = entry.remove();
            info!("Room {} closed by {} ({})", room.code, caller, signal);
            room
        } else {
            room.clone()
        };

        Ok(Transition { room, from, caller })
    }

    fn remove(&self, code: &str) -> Option<Room> {
        let code = normalize_code(code);
        self.rooms.remove(&code).map(|(_, room)| room)
    }

    fn sweep_expired(&self, now: Instant, max_age: Duration) -> Vec<Room> {
        let candidates: Vec<String> = self
            .rooms
            .iter()
            .filter(|r| r.is_expired(now, max_age))
            .map(|r| r.key().clone())
            .collect();

        // Re-check under the lock; a room may have been replaced since
        let mut removed = Vec::with_capacity(candidates.len());
        for code in candidates {
            if let Some((_, mut room)) = self.rooms.remove_if(&code, |_, r| r.is_expired(now, max_age)) {
                room.expire();
                info!("Room {} removed (expired)", code);
                removed.push(room);
            }
        }

        removed
    }

    fn len(&self) -> usize {
        self.rooms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};

    fn conn(id: &str) -> ConnectionId {
        ConnectionId::from(id)
    }

    fn open_room(registry: &MemoryRegistry, code: &str, now: Instant) -> Room {
        registry
            .create(code, conn("sender"), SenderDescriptor::default(), now)
            .unwrap()
            .0
    }

    #[test]
    fn test_create_twice_is_rejected() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();

        open_room(&registry, "AB12C3", now);
        let second = registry.create("AB12C3", conn("other"), SenderDescriptor::default(), now);
        assert_eq!(second.unwrap_err(), RoomError::AlreadyExists);
        assert_eq!(registry.get("AB12C3", now).unwrap().sender(), &conn("sender"));
    }

    #[test]
    fn test_codes_are_case_insensitive() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();

        open_room(&registry, "ab12c3", now);
        assert!(registry.has("AB12C3", now));
        assert_eq!(registry.get("ab-12c3", now).unwrap().code, "AB12C3");
    }

    #[test]
    fn test_invalid_code() {
        let registry = MemoryRegistry::new();
        let result = registry.create("nope", conn("s"), SenderDescriptor::default(), Instant::now());
        assert_eq!(result.unwrap_err(), RoomError::InvalidCode);
    }

    #[test]
    fn test_join() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();
        assert_eq!(
            registry.join("AB12C3", conn("receiver"), now).unwrap_err(),
            RoomError::NotFound
        );

        open_room(&registry, "AB12C3", now);
        let room = registry.join("AB12C3", conn("receiver"), now).unwrap();
        assert_eq!(room.receiver(), Some(&conn("receiver")));
        assert_eq!(room.state(), RoomState::Paired);

        assert_eq!(
            registry.join("AB12C3", conn("late"), now).unwrap_err(),
            RoomError::Full
        );
        assert_eq!(registry.get("AB12C3", now).unwrap().receiver(), Some(&conn("receiver")));
    }

    #[test]
    fn test_concurrent_join_exactly_one_wins() {
        for _ in 0..50 {
            let registry = Arc::new(MemoryRegistry::new());
            let now = Instant::now();
            open_room(&registry, "AB12C3", now);

            let barrier = Arc::new(Barrier::new(2));
            let handles: Vec<_> = ["r1", "r2"]
                .into_iter()
                .map(|id| {
                    let registry = registry.clone();
                    let barrier = barrier.clone();
                    std::thread::spawn(move || {
                        barrier.wait();
                        registry.join("AB12C3", conn(id), now)
                    })
                })
                .collect();

            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
            let wins = results.iter().filter(|r| r.is_ok()).count();
            let full = results
                .iter()
                .filter(|r| matches!(r, Err(RoomError::Full)))
                .count();
            assert_eq!((wins, full), (1, 1));

            let room = registry.get("AB12C3", now).unwrap();
            let receiver = room.receiver().unwrap();
            assert!(receiver == &conn("r1") || receiver == &conn("r2"));
        }
    }

    #[test]
    fn test_sweep_expired() {
        let registry = MemoryRegistry::new();
        let created = Instant::now();
        open_room(&registry, "AB12C3", created);
        open_room(&registry, "ZZ99ZZ", created + Duration::from_secs(20 * 60));

        let now = created + Duration::from_secs(31 * 60);
        let removed = registry.sweep_expired(now, Duration::from_secs(30 * 60));

        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].code, "AB12C3");
        assert_eq!(removed[0].state(), RoomState::Closed);
        assert_eq!(registry.get("AB12C3", now).unwrap_err(), RoomError::NotFound);
        assert!(registry.get("ZZ99ZZ", now).is_ok());
    }

    #[test]
    fn test_expired_room_is_invisible_before_sweep() {
        let registry = MemoryRegistry::with_max_age(Duration::from_secs(60));
        let created = Instant::now();
        open_room(&registry, "AB12C3", created);

        let later = created + Duration::from_secs(61);
        assert!(!registry.has("AB12C3", later));
        assert_eq!(
            registry.join("AB12C3", conn("receiver"), later).unwrap_err(),
            RoomError::NotFound
        );

        // The stale entry does not block a fresh room under the same code,
        // and comes back closed so its participants can be told
        let (room, displaced) = registry
            .create("AB12C3", conn("new-sender"), SenderDescriptor::default(), later)
            .unwrap();
        assert_eq!(room.sender(), &conn("new-sender"));
        let displaced = displaced.unwrap();
        assert_eq!(displaced.sender(), &conn("sender"));
        assert_eq!(displaced.state(), RoomState::Closed);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_apply_closing_step_removes_room() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();
        open_room(&registry, "AB12C3", now);
        registry.join("AB12C3", conn("receiver"), now).unwrap();

        let t = registry
            .apply("AB12C3", &conn("sender"), Signal::Offer, now)
            .unwrap();
        assert_eq!(t.from, RoomState::Paired);
        assert_eq!(t.room.state(), RoomState::Negotiating);
        assert_eq!(t.counterpart(), Some(&conn("receiver")));
        assert!(!t.is_closed());

        let t = registry
            .apply("AB12C3", &conn("sender"), Signal::Stop, now)
            .unwrap();
        assert!(t.is_closed());
        assert_eq!(t.caller, Role::Sender);
        assert_eq!(t.counterpart(), Some(&conn("receiver")));
        assert_eq!(registry.get("AB12C3", now).unwrap_err(), RoomError::NotFound);
    }

    #[test]
    fn test_rejected_step_leaves_room_untouched() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();
        open_room(&registry, "AB12C3", now);

        let err = registry
            .apply("AB12C3", &conn("sender"), Signal::Offer, now)
            .unwrap_err();
        assert!(matches!(err, RoomError::InvalidTransition { from: RoomState::Open, .. }));
        assert_eq!(registry.get("AB12C3", now).unwrap().state(), RoomState::Open);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = MemoryRegistry::new();
        let now = Instant::now();
        open_room(&registry, "AB12C3", now);

        assert!(registry.remove("AB12C3").is_some());
        assert!(registry.remove("AB12C3").is_none());
        assert!(registry.remove("AB12C3").is_none());
        assert!(registry.is_empty());
    }
}
