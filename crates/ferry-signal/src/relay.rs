//! Signaling relay
//!
//! Routes room-lifecycle and handshake messages between the two
//! participants of a room. The relay is synchronous and transport-free:
//! each inbound message produces zero or more [`Outbound`] messages and
//! the caller delivers them. Offer, answer and candidate payloads are
//! forwarded untouched.
//!
//! Teardown always builds the notification for the remaining participant
//! from the room record inside the same registry step that deletes it,
//! so a closing room can always tell its peer before it disappears.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ferry_core::{generate_unique_code, ErrorCode, Role, SenderDescriptor};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::messages::{ClientMessage, ServerMessage};
use crate::registry::{RoomRegistry, Transition};
use crate::room::{ConnectionId, Room, RoomError, Signal};

/// A message addressed to one connection
#[derive(Clone, Debug, PartialEq)]
pub struct Outbound {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

impl Outbound {
    pub fn new(to: ConnectionId, message: ServerMessage) -> Self {
        Self { to, message }
    }
}

/// Signaling relay over a room registry
pub struct Relay {
    registry: Arc<dyn RoomRegistry>,
    /// Codes of the rooms each connection takes part in
    memberships: DashMap<ConnectionId, HashSet<String>>,
}

impl Relay {
    pub fn new(registry: Arc<dyn RoomRegistry>) -> Self {
        Self {
            registry,
            memberships: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<dyn RoomRegistry> {
        &self.registry
    }

    /// Number of connections currently attached to at least one room
    pub fn member_count(&self) -> usize {
        self.memberships.len()
    }

    /// Handle one inbound message from `from`
    pub fn handle(&self, from: &ConnectionId, msg: ClientMessage) -> Vec<Outbound> {
        self.handle_at(from, msg, Instant::now())
    }

    /// Handle one inbound message as of `now`
    pub fn handle_at(&self, from: &ConnectionId, msg: ClientMessage, now: Instant) -> Vec<Outbound> {
        match msg {
            ClientMessage::CreateRoom {
                code,
                sender_descriptor,
            } => self.create_room(from, code, sender_descriptor, now),

            ClientMessage::JoinRoom { code, is_receiver } => {
                self.join_room(from, code, is_receiver, now)
            }

            ClientMessage::Offer { code, sdp } => {
                self.step(from, &code, Signal::Offer, now, |t| {
                    let to = t.room.participant(Role::Receiver)?.clone();
                    Some(Outbound::new(to, ServerMessage::Offer { code: t.room.code.clone(), sdp }))
                })
            }

            ClientMessage::Answer { code, sdp } => {
                self.step(from, &code, Signal::Answer, now, |t| {
                    let to = t.room.sender().clone();
                    Some(Outbound::new(to, ServerMessage::Answer { code: t.room.code.clone(), sdp }))
                })
            }

            ClientMessage::IceCandidate { code, candidate } => {
                self.step(from, &code, Signal::Candidate, now, |t| {
                    forward_candidate(t, candidate)
                })
            }

            ClientMessage::Cancel { code } => self.step(from, &code, Signal::Cancel, now, |t| {
                let to = t.counterpart()?.clone();
                Some(Outbound::new(
                    to,
                    ServerMessage::TransferCancelled {
                        code: t.room.code.clone(),
                    },
                ))
            }),

            ClientMessage::Stop {
                code,
                reason,
                transfer_type,
            } => self.step(from, &code, Signal::Stop, now, |t| {
                let to = t.counterpart()?.clone();
                Some(Outbound::new(
                    to,
                    ServerMessage::TransferStopped {
                        code: t.room.code.clone(),
                        reason,
                        stopped_by: t.caller,
                        transfer_type: transfer_type.unwrap_or_else(|| "unknown".into()),
                    },
                ))
            }),

            ClientMessage::Pause { code } => self.step(from, &code, Signal::Pause, now, |t| {
                let to = t.counterpart()?.clone();
                Some(Outbound::new(
                    to,
                    ServerMessage::TransferPaused {
                        code: t.room.code.clone(),
                    },
                ))
            }),

            ClientMessage::Resume { code } => self.step(from, &code, Signal::Resume, now, |t| {
                let to = t.counterpart()?.clone();
                Some(Outbound::new(
                    to,
                    ServerMessage::TransferResumed {
                        code: t.room.code.clone(),
                    },
                ))
            }),

            ClientMessage::Ping { timestamp } => {
                vec![Outbound::new(from.clone(), ServerMessage::Pong { timestamp })]
            }
        }
    }

    /// Transport-level disconnect: every room the connection was part of
    /// is closed and the other participant is told `peer-left`.
    pub fn disconnect(&self, conn: &ConnectionId) -> Vec<Outbound> {
        self.disconnect_at(conn, Instant::now())
    }

    pub fn disconnect_at(&self, conn: &ConnectionId, now: Instant) -> Vec<Outbound> {
        let Some((_, codes)) = self.memberships.remove(conn) else {
            return Vec::new();
        };

        let mut out = Vec::new();
        for code in codes {
            match self.registry.apply(&code, conn, Signal::Disconnect, now) {
                Ok(t) => {
                    info!("Room {} closed: {} disconnected", code, t.caller);
                    self.forget(&t.room);
                    if let Some(peer) = t.counterpart() {
                        out.push(Outbound::new(peer.clone(), ServerMessage::PeerLeft { code }));
                    }
                }
                // Already closed by stop/cancel/sweep, or the code now
                // belongs to someone else's room
                Err(e) => debug!("Disconnect of {} skipped room {}: {}", conn, code, e),
            }
        }
        out
    }

    /// Close every room older than `max_age`, telling all participants
    pub fn sweep(&self, now: Instant, max_age: Duration) -> Vec<Outbound> {
        let mut out = Vec::new();
        for room in self.registry.sweep_expired(now, max_age) {
            self.forget(&room);
            out.extend(expiry_notices(&room, None));
        }
        if !out.is_empty() {
            debug!("Sweep produced {} expiry notices", out.len());
        }
        out
    }

    fn create_room(
        &self,
        from: &ConnectionId,
        code: Option<String>,
        descriptor: SenderDescriptor,
        now: Instant,
    ) -> Vec<Outbound> {
        let code = match code {
            Some(code) => code,
            None => match generate_unique_code(|c| self.registry.has(c, now)) {
                Ok(code) => code,
                Err(e) => {
                    warn!("Could not allocate a room code for {}: {}", from, e);
                    let msg = rejection("", &RoomError::CodeSpaceExhausted);
                    return vec![Outbound::new(from.clone(), msg)];
                }
            },
        };

        match self.registry.create(&code, from.clone(), descriptor, now) {
            Ok((room, displaced)) => {
                // An unswept expired room gave up the code: close it out
                // before the new room takes its place
                let mut out = Vec::new();
                if let Some(old) = displaced {
                    info!("Room {} removed (expired, code reused)", old.code);
                    self.forget(&old);
                    out.extend(expiry_notices(&old, Some(from)));
                }

                info!(
                    "Room created: {} by {} ({})",
                    room.code, from, room.descriptor.kind
                );
                self.remember(from, &room.code);
                out.push(Outbound::new(
                    from.clone(),
                    ServerMessage::RoomCreated { code: room.code },
                ));
                out
            }
            Err(e) => {
                warn!("create-room {} from {} rejected: {}", code, from, e);
                vec![Outbound::new(from.clone(), rejection(&code, &e))]
            }
        }
    }

    fn join_room(
        &self,
        from: &ConnectionId,
        code: String,
        is_receiver: bool,
        now: Instant,
    ) -> Vec<Outbound> {
        if !is_receiver {
            return self.reject(from, &code, Signal::Join, RoomError::Full);
        }

        match self.registry.join(&code, from.clone(), now) {
            Ok(room) => {
                self.remember(from, &room.code);

                // The sender may have left between the join and recording
                // the membership; its disconnect could not see us then
                let still_joined = self
                    .registry
                    .get(&room.code, now)
                    .map(|live| live.receiver() == Some(from))
                    .unwrap_or(false);
                if !still_joined {
                    self.forget_code(from, &room.code);
                    return self.reject(from, &code, Signal::Join, RoomError::NotFound);
                }

                info!("Receiver {} joined room {}", from, room.code);
                vec![
                    Outbound::new(
                        from.clone(),
                        ServerMessage::RoomJoined {
                            code: room.code.clone(),
                            sender_descriptor: room.descriptor.clone(),
                        },
                    ),
                    Outbound::new(
                        room.sender().clone(),
                        ServerMessage::ReceiverJoined { code: room.code },
                    ),
                ]
            }
            Err(e) => self.reject(from, &code, Signal::Join, e),
        }
    }

    /// Run one state-machine step and build the forwarded message from
    /// the resulting transition.
    fn step<F>(
        &self,
        from: &ConnectionId,
        code: &str,
        signal: Signal,
        now: Instant,
        forward: F,
    ) -> Vec<Outbound>
    where
        F: FnOnce(&Transition) -> Option<Outbound>,
    {
        match self.registry.apply(code, from, signal, now) {
            Ok(t) => {
                if t.from != t.room.state() {
                    debug!(
                        "Room {}: {:?} -> {:?} on {} from {}",
                        t.room.code,
                        t.from,
                        t.room.state(),
                        signal,
                        t.caller
                    );
                }
                if t.is_closed() {
                    self.forget(&t.room);
                }
                forward(&t).into_iter().collect()
            }
            Err(e) => self.reject(from, code, signal, e),
        }
    }

    /// Answer a rejected message to the caller only. A malformed code
    /// cannot name a room, so it is reported like any unknown code.
    fn reject(&self, from: &ConnectionId, code: &str, signal: Signal, e: RoomError) -> Vec<Outbound> {
        warn!("{} on room {} from {} rejected: {}", signal, code, from, e);
        let e = match e {
            RoomError::InvalidCode => RoomError::NotFound,
            other => other,
        };
        vec![Outbound::new(from.clone(), rejection(code, &e))]
    }

    fn remember(&self, conn: &ConnectionId, code: &str) {
        self.memberships
            .entry(conn.clone())
            .or_default()
            .insert(code.to_string());
    }

    /// Drop a closed room from its participants' membership sets
    fn forget(&self, room: &Room) {
        for conn in room.participants() {
            self.forget_code(conn, &room.code);
        }
    }

    fn forget_code(&self, conn: &ConnectionId, code: &str) {
        let now_empty = match self.memberships.get_mut(conn) {
            Some(mut codes) => {
                codes.remove(code);
                codes.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.memberships.remove_if(conn, |_, codes| codes.is_empty());
        }
    }
}

/// `room-expired` for every participant of a closed room, except `skip`
fn expiry_notices(room: &Room, skip: Option<&ConnectionId>) -> Vec<Outbound> {
    room.participants()
        .filter(|conn| Some(*conn) != skip)
        .map(|conn| {
            Outbound::new(
                conn.clone(),
                ServerMessage::RoomExpired {
                    code: room.code.clone(),
                },
            )
        })
        .collect()
}

/// Candidates go to whoever is on the other side of the caller
fn forward_candidate(t: &Transition, candidate: Value) -> Option<Outbound> {
    let to = t.counterpart()?.clone();
    Some(Outbound::new(
        to,
        ServerMessage::IceCandidate {
            code: t.room.code.clone(),
            candidate,
        },
    ))
}

/// Map a room error onto the message the caller sees
fn rejection(code: &str, e: &RoomError) -> ServerMessage {
    let code = code.to_string();
    match e {
        RoomError::NotFound => ServerMessage::RoomNotFound { code },
        RoomError::Full => ServerMessage::RoomFull { code },
        RoomError::AlreadyExists => ServerMessage::RoomExists { code },
        other => ServerMessage::error(ErrorCode::from(other), other.to_string()),
    }
}
