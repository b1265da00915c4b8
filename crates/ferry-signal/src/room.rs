//! Room model and the room state machine
//!
//! A room pairs exactly one sender with at most one receiver. Every
//! inbound message is mapped to a [`Signal`] and checked against
//! [`RoomState::next`] before anything is forwarded.

use std::time::{Duration, Instant};

use ferry_core::{ErrorCode, Role, SenderDescriptor};
use serde::{Deserialize, Serialize};

/// Opaque identifier of a signaling connection
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a random connection id (8 bytes, hex encoded)
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 8];
        getrandom::fill(&mut bytes)?;
        Ok(Self(hex::encode(bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Room lifecycle as seen by the relay
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoomState {
    /// Sender only
    Open,
    /// Receiver attached, no offer relayed yet
    Paired,
    /// Offer relayed, waiting for the answer
    Negotiating,
    /// Answer relayed; candidates and control signals may still flow
    Established,
    /// Torn down (terminal)
    Closed,
}

/// Inputs that drive the room state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Signal {
    Join,
    Offer,
    Answer,
    Candidate,
    Cancel,
    Stop,
    Pause,
    Resume,
    Disconnect,
    Expire,
}

impl Signal {
    /// Role the caller must hold in the room, if restricted to one side.
    ///
    /// `Join` comes from a connection that is not in the room yet, and
    /// `Expire` comes from the relay itself; both are handled separately.
    pub fn required_role(self) -> Option<Role> {
        match self {
            Signal::Offer | Signal::Cancel => Some(Role::Sender),
            Signal::Answer => Some(Role::Receiver),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Signal::Join => "join-room",
            Signal::Offer => "offer",
            Signal::Answer => "answer",
            Signal::Candidate => "ice-candidate",
            Signal::Cancel => "cancel",
            Signal::Stop => "stop",
            Signal::Pause => "pause",
            Signal::Resume => "resume",
            Signal::Disconnect => "disconnect",
            Signal::Expire => "expire",
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RoomState {
    /// Transition table. Anything not listed is rejected.
    ///
    /// | from                          | signal                 | to          |
    /// |-------------------------------|------------------------|-------------|
    /// | Open                          | Join                   | Paired      |
    /// | Paired, Negotiating, Established | Offer               | Negotiating |
    /// | Negotiating                   | Answer                 | Established |
    /// | Paired, Negotiating, Established | Candidate           | unchanged   |
    /// | Open, Paired                  | Cancel                 | Closed      |
    /// | Paired, Negotiating, Established | Stop                | Closed      |
    /// | any live                      | Pause, Resume          | unchanged   |
    /// | any live                      | Disconnect, Expire     | Closed      |
    pub fn next(self, signal: Signal) -> Result<RoomState, RoomError> {
        use RoomState::*;
        use Signal::*;

        let next = match (self, signal) {
            (Closed, _) => None,

            (Open, Join) => Some(Paired),
            (Paired | Negotiating | Established, Join) => return Err(RoomError::Full),

            (Paired | Negotiating | Established, Offer) => Some(Negotiating),
            (Negotiating, Answer) => Some(Established),
            (s @ (Paired | Negotiating | Established), Candidate) => Some(s),

            (Open | Paired, Cancel) => Some(Closed),
            (Paired | Negotiating | Established, Stop) => Some(Closed),

            (s, Pause | Resume) => Some(s),
            (_, Disconnect | Expire) => Some(Closed),

            _ => None,
        };

        next.ok_or(RoomError::InvalidTransition { from: self, signal })
    }

    /// Whether a receiver is attached in this state
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            RoomState::Paired | RoomState::Negotiating | RoomState::Established
        )
    }
}

/// A rendezvous room keyed by its code
#[derive(Clone, Debug)]
pub struct Room {
    /// Code for this room
    pub code: String,

    /// Connection that created the room
    sender: ConnectionId,

    /// Connection that joined the room
    receiver: Option<ConnectionId>,

    /// Sender-declared metadata, for display only
    pub descriptor: SenderDescriptor,

    /// Current lifecycle state
    state: RoomState,

    /// When the room was created
    created_at: Instant,
}

impl Room {
    /// Create a new room in the `Open` state
    pub fn new(
        code: String,
        sender: ConnectionId,
        descriptor: SenderDescriptor,
        created_at: Instant,
    ) -> Self {
        Self {
            code,
            sender,
            receiver: None,
            descriptor,
            state: RoomState::Open,
            created_at,
        }
    }

    pub fn sender(&self) -> &ConnectionId {
        &self.sender
    }

    pub fn receiver(&self) -> Option<&ConnectionId> {
        self.receiver.as_ref()
    }

    pub fn state(&self) -> RoomState {
        self.state
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Role of a connection in this room
    pub fn role_of(&self, conn: &ConnectionId) -> Option<Role> {
        if &self.sender == conn {
            Some(Role::Sender)
        } else if self.receiver.as_ref() == Some(conn) {
            Some(Role::Receiver)
        } else {
            None
        }
    }

    /// Connection holding the given role
    pub fn participant(&self, role: Role) -> Option<&ConnectionId> {
        match role {
            Role::Sender => Some(&self.sender),
            Role::Receiver => self.receiver.as_ref(),
        }
    }

    /// All attached connections
    pub fn participants(&self) -> impl Iterator<Item = &ConnectionId> {
        std::iter::once(&self.sender).chain(self.receiver.as_ref())
    }

    /// Age of the room at `now`
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    /// Check if the room has outlived `max_age`
    pub fn is_expired(&self, now: Instant, max_age: Duration) -> bool {
        self.age(now) > max_age
    }

    /// Attach the receiver. The only way `receiver` is ever set.
    pub fn attach_receiver(&mut self, conn: ConnectionId) -> Result<(), RoomError> {
        if self.role_of(&conn).is_some() {
            return Err(RoomError::AlreadyParticipant);
        }
        if self.receiver.is_some() {
            return Err(RoomError::Full);
        }
        self.state = self.state.next(Signal::Join)?;
        self.receiver = Some(conn);
        Ok(())
    }

    /// Apply a signal from `caller`, checking the role and the transition
    /// table. Returns the caller's role on success.
    pub fn apply(&mut self, caller: &ConnectionId, signal: Signal) -> Result<Role, RoomError> {
        let role = self.role_of(caller).ok_or(RoomError::NotParticipant)?;
        if let Some(required) = signal.required_role() {
            if role != required {
                return Err(RoomError::WrongRole { required, signal });
            }
        }
        self.state = self.state.next(signal)?;
        Ok(role)
    }

    /// Close the room regardless of caller (expiry)
    pub fn expire(&mut self) {
        self.state = RoomState::Closed;
    }
}

/// Room errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoomError {
    #[error("room not found")]
    NotFound,

    #[error("code is already in use")]
    AlreadyExists,

    #[error("room is full")]
    Full,

    #[error("invalid room code")]
    InvalidCode,

    #[error("not a participant of this room")]
    NotParticipant,

    #[error("already a participant of this room")]
    AlreadyParticipant,

    #[error("{signal} is only allowed from the {required}")]
    WrongRole { required: Role, signal: Signal },

    #[error("{signal} not allowed in state {from:?}")]
    InvalidTransition { from: RoomState, signal: Signal },

    #[error("no free room code available")]
    CodeSpaceExhausted,
}

impl From<&RoomError> for ErrorCode {
    fn from(e: &RoomError) -> Self {
        match e {
            RoomError::NotFound => ErrorCode::NotFound,
            RoomError::AlreadyExists => ErrorCode::AlreadyExists,
            RoomError::Full => ErrorCode::Full,
            RoomError::InvalidCode => ErrorCode::InvalidCode,
            RoomError::NotParticipant
            | RoomError::AlreadyParticipant
            | RoomError::WrongRole { .. } => ErrorCode::NotParticipant,
            RoomError::InvalidTransition { .. } => ErrorCode::InvalidTransition,
            RoomError::CodeSpaceExhausted => ErrorCode::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_room() -> Room {
        Room::new(
            "AB12C3".into(),
            "sender".into(),
            SenderDescriptor::default(),
            Instant::now(),
        )
    }

    #[test]
    fn test_room_creation() {
        let room = make_room();
        assert_eq!(room.code, "AB12C3");
        assert_eq!(room.state(), RoomState::Open);
        assert!(room.receiver().is_none());
        assert_eq!(room.participants().count(), 1);
    }

    #[test]
    fn test_attach_receiver() {
        let mut room = make_room();
        room.attach_receiver("receiver".into()).unwrap();

        assert_eq!(room.state(), RoomState::Paired);
        assert_eq!(room.role_of(&"receiver".into()), Some(Role::Receiver));
        assert_eq!(room.participant(Role::Receiver).unwrap().as_str(), "receiver");
        assert_eq!(room.participants().count(), 2);

        // Second receiver is rejected without changing anything
        assert_eq!(room.attach_receiver("other".into()), Err(RoomError::Full));
        assert_eq!(room.role_of(&"other".into()), None);
        assert_eq!(room.state(), RoomState::Paired);
    }

    #[test]
    fn test_sender_cannot_join_own_room() {
        let mut room = make_room();
        assert_eq!(
            room.attach_receiver("sender".into()),
            Err(RoomError::AlreadyParticipant)
        );
        assert_eq!(room.state(), RoomState::Open);
    }

    #[test]
    fn test_full_handshake() {
        let mut room = make_room();
        let sender = ConnectionId::from("sender");
        let receiver = ConnectionId::from("receiver");
        room.attach_receiver(receiver.clone()).unwrap();

        assert_eq!(room.apply(&sender, Signal::Offer), Ok(Role::Sender));
        assert_eq!(room.state(), RoomState::Negotiating);

        assert_eq!(room.apply(&receiver, Signal::Candidate), Ok(Role::Receiver));
        assert_eq!(room.state(), RoomState::Negotiating);

        assert_eq!(room.apply(&receiver, Signal::Answer), Ok(Role::Receiver));
        assert_eq!(room.state(), RoomState::Established);

        assert_eq!(room.apply(&sender, Signal::Candidate), Ok(Role::Sender));
        assert_eq!(room.apply(&receiver, Signal::Pause), Ok(Role::Receiver));
        assert_eq!(room.state(), RoomState::Established);

        assert_eq!(room.apply(&receiver, Signal::Stop), Ok(Role::Receiver));
        assert_eq!(room.state(), RoomState::Closed);
    }

    #[test]
    fn test_role_enforcement() {
        let mut room = make_room();
        let receiver = ConnectionId::from("receiver");
        room.attach_receiver(receiver.clone()).unwrap();

        assert!(matches!(
            room.apply(&receiver, Signal::Offer),
            Err(RoomError::WrongRole { required: Role::Sender, .. })
        ));
        assert!(matches!(
            room.apply(&receiver, Signal::Cancel),
            Err(RoomError::WrongRole { .. })
        ));
        assert_eq!(
            room.apply(&"stranger".into(), Signal::Candidate),
            Err(RoomError::NotParticipant)
        );
        assert_eq!(room.state(), RoomState::Paired);
    }

    #[test]
    fn test_rejected_transitions() {
        use RoomState::*;

        assert!(Open.next(Signal::Offer).is_err());
        assert!(Open.next(Signal::Candidate).is_err());
        assert!(Open.next(Signal::Stop).is_err());
        assert!(Paired.next(Signal::Answer).is_err());
        assert!(Established.next(Signal::Answer).is_err());
        assert!(Negotiating.next(Signal::Cancel).is_err());
        assert_eq!(Paired.next(Signal::Join), Err(RoomError::Full));

        for signal in [Signal::Join, Signal::Offer, Signal::Pause, Signal::Disconnect] {
            assert!(Closed.next(signal).is_err());
        }
    }

    #[test]
    fn test_accepted_transitions() {
        use RoomState::*;

        assert_eq!(Open.next(Signal::Cancel), Ok(Closed));
        assert_eq!(Paired.next(Signal::Cancel), Ok(Closed));
        assert_eq!(Established.next(Signal::Offer), Ok(Negotiating));
        assert_eq!(Open.next(Signal::Pause), Ok(Open));
        assert_eq!(Open.next(Signal::Disconnect), Ok(Closed));
        assert_eq!(Negotiating.next(Signal::Expire), Ok(Closed));
    }

    #[test]
    fn test_expiry() {
        let room = make_room();
        let max_age = Duration::from_secs(30 * 60);
        let created = room.created_at();

        assert!(!room.is_expired(created + Duration::from_secs(29 * 60), max_age));
        assert!(room.is_expired(created + Duration::from_secs(31 * 60), max_age));
        // A clock reading before creation never counts as expired
        assert!(!room.is_expired(created, max_age));
    }

    #[test]
    fn test_connection_id_generation() {
        let id1 = ConnectionId::generate().unwrap();
        let id2 = ConnectionId::generate().unwrap();

        assert_eq!(id1.as_str().len(), 16); // 8 bytes = 16 hex chars
        assert_ne!(id1, id2);
    }
}
