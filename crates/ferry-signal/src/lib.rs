//! Ferry Signal Relay
//!
//! Pairs a sender and a receiver under a short room code and relays the
//! messages they need to set up a direct peer connection.
//!
//! # Protocol
//!
//! 1. Sender creates a room (optionally choosing the code)
//! 2. Receiver joins the room using the code
//! 3. Relay forwards offer, answer and candidates to the other side
//! 4. Either side stops, or disconnects, and the room is torn down
//!
//! Rooms older than the configured maximum age are swept and both
//! participants receive a `room-expired` notice.

pub mod client;
pub mod messages;
pub mod registry;
pub mod relay;
pub mod room;
pub mod server;

pub use client::{ClientError, PeerConnection, PeerEvent, SignalClient};
pub use messages::{ClientMessage, ServerMessage};
pub use registry::{MemoryRegistry, RoomRegistry, Transition};
pub use relay::{Outbound, Relay};
pub use room::{ConnectionId, Room, RoomError, RoomState, Signal};
pub use server::SignalServer;
