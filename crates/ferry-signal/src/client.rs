//! Connection-establishment client
//!
//! Drives a local peer connection through the relay:
//! - sender: create room, wait for the receiver, send the offer, apply the answer
//! - receiver: join by code, apply the offer, send the answer
//!
//! Candidates are exchanged in both directions until the local peer
//! connection reports that it is connected. Establishment, including
//! that final wait, is bounded by a timeout; when it runs out the client
//! stops the transfer, tears down local peer state and reports
//! [`ClientError::Timeout`].

use std::time::Duration;

use async_trait::async_trait;
use ferry_core::{ClientConfig, ErrorCode, Role, SenderDescriptor, ESTABLISH_TIMEOUT_SECS};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::messages::{ClientMessage, ServerMessage};

/// Timeout for connecting to the signal server
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Something the local peer connection has to report
#[derive(Clone, Debug, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered candidate for the other side
    LocalCandidate(Value),
    /// The connection to the other side is up
    Connected,
    /// The connection cannot be established
    Failed(String),
}

/// The local side of a peer connection (session descriptions and
/// candidates are opaque JSON values to the relay)
#[async_trait]
pub trait PeerConnection: Send {
    /// Generate a local offer and install it as the local description
    async fn create_offer(&mut self) -> Result<Value, ClientError>;

    /// Install a remote offer and produce the local answer
    async fn accept_offer(&mut self, offer: Value) -> Result<Value, ClientError>;

    /// Install the remote answer
    async fn accept_answer(&mut self, answer: Value) -> Result<(), ClientError>;

    /// Add a candidate received from the other side
    async fn add_remote_candidate(&mut self, candidate: Value) -> Result<(), ClientError>;

    /// Wait for the next local event. Must be cancel safe: the client
    /// drops the future whenever a relay message arrives first.
    async fn next_event(&mut self) -> Result<PeerEvent, ClientError>;

    /// Tear down local state after a failed establishment
    async fn close(&mut self);
}

/// Client errors
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("timed out waiting for the peer")]
    Timeout,

    #[error("connection closed")]
    TransportClosed,

    #[error("transfer stopped by the {stopped_by}: {reason}")]
    Stopped { stopped_by: Role, reason: String },

    #[error("transfer cancelled by the sender")]
    Cancelled,

    #[error("room expired")]
    Expired,

    #[error("request rejected: {0}")]
    Rejected(ErrorCode),

    #[error("not in a room")]
    NoRoom,

    #[error("peer connection failed: {0}")]
    Peer(String),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<&ClientError> for ErrorCode {
    fn from(e: &ClientError) -> Self {
        match e {
            ClientError::Timeout => ErrorCode::Timeout,
            ClientError::TransportClosed
            | ClientError::ConnectionFailed(_)
            | ClientError::WebSocket(_) => ErrorCode::TransportClosed,
            ClientError::Expired => ErrorCode::NotFound,
            ClientError::Rejected(code) => *code,
            ClientError::NoRoom => ErrorCode::NotFound,
            ClientError::Stopped { .. } | ClientError::Cancelled => ErrorCode::TransportClosed,
            ClientError::Peer(_) => ErrorCode::Internal,
            ClientError::Json(_) => ErrorCode::BadRequest,
        }
    }
}

/// Signaling connection of one participant
pub struct SignalClient {
    ws: WsStream,
    code: Option<String>,
    role: Option<Role>,
    establish_timeout: Duration,
}

impl SignalClient {
    /// Connect to the signal server
    pub async fn connect(url: &str) -> Result<Self, ClientError> {
        debug!("Connecting to signal server: {}", url);

        match timeout(CONNECT_TIMEOUT, connect_async(url)).await {
            Ok(Ok((ws, _response))) => {
                info!("Connected to signal server");
                Ok(Self {
                    ws,
                    code: None,
                    role: None,
                    establish_timeout: Duration::from_secs(ESTABLISH_TIMEOUT_SECS),
                })
            }
            Ok(Err(e)) => Err(ClientError::ConnectionFailed(e.to_string())),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Connect to the signal server named in the client configuration
    pub async fn connect_with(config: &ClientConfig) -> Result<Self, ClientError> {
        let mut client = Self::connect(&config.signal_url).await?;
        client.establish_timeout = config.establish_timeout();
        Ok(client)
    }

    /// Time allowed for establishing the peer connection
    pub fn establish_timeout(&self) -> Duration {
        self.establish_timeout
    }

    /// Code of the room this client created or joined
    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }

    pub fn role(&self) -> Option<Role> {
        self.role
    }

    /// Send a message on the WebSocket
    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), ClientError> {
        let json = msg.to_json()?;
        self.ws
            .send(Message::Text(json))
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    /// Receive the next relay message
    pub async fn recv(&mut self) -> Result<ServerMessage, ClientError> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Ok(ServerMessage::from_json(&text)?),
                Some(Ok(Message::Close(_))) | None => return Err(ClientError::TransportClosed),
                Some(Err(e)) => return Err(ClientError::WebSocket(e.to_string())),
                // Ignore non-text messages (ping/pong/binary)
                Some(Ok(_)) => continue,
            }
        }
    }

    /// Receive the next relay message, giving up after `limit`
    pub async fn recv_timeout(&mut self, limit: Duration) -> Result<ServerMessage, ClientError> {
        timeout(limit, self.recv()).await.map_err(|_| ClientError::Timeout)?
    }

    /// Open a room as sender. Returns the room code.
    pub async fn host(
        &mut self,
        code: Option<String>,
        descriptor: SenderDescriptor,
    ) -> Result<String, ClientError> {
        self.send(&ClientMessage::CreateRoom {
            code,
            sender_descriptor: descriptor,
        })
        .await?;

        loop {
            match self.recv().await? {
                ServerMessage::RoomCreated { code } => {
                    info!("Room created with code: {}", code);
                    self.code = Some(code.clone());
                    self.role = Some(Role::Sender);
                    return Ok(code);
                }
                ServerMessage::RoomExists { .. } => {
                    return Err(ClientError::Rejected(ErrorCode::AlreadyExists))
                }
                ServerMessage::Error { code, .. } => return Err(ClientError::Rejected(code)),
                other => debug!("Ignoring message while creating room: {:?}", other),
            }
        }
    }

    /// Wait until a receiver joins the room this client created
    pub async fn wait_for_receiver(&mut self) -> Result<(), ClientError> {
        loop {
            let msg = self.recv().await?;
            if let Some(err) = terminal(&msg) {
                return Err(err);
            }
            match msg {
                ServerMessage::ReceiverJoined { code } => {
                    info!("Receiver joined room {}", code);
                    return Ok(());
                }
                other => debug!("Ignoring message while waiting for receiver: {:?}", other),
            }
        }
    }

    /// Join a room as receiver. Returns what the sender declared.
    pub async fn join(&mut self, code: &str) -> Result<SenderDescriptor, ClientError> {
        self.send(&ClientMessage::JoinRoom {
            code: code.to_string(),
            is_receiver: true,
        })
        .await?;

        loop {
            match self.recv().await? {
                ServerMessage::RoomJoined {
                    code,
                    sender_descriptor,
                } => {
                    info!("Joined room {}", code);
                    self.code = Some(code);
                    self.role = Some(Role::Receiver);
                    return Ok(sender_descriptor);
                }
                ServerMessage::RoomNotFound { .. } => {
                    return Err(ClientError::Rejected(ErrorCode::NotFound))
                }
                ServerMessage::RoomFull { .. } => return Err(ClientError::Rejected(ErrorCode::Full)),
                ServerMessage::Error { code, .. } => return Err(ClientError::Rejected(code)),
                other => debug!("Ignoring message while joining: {:?}", other),
            }
        }
    }

    /// Run the sender half of the handshake within the configured timeout
    pub async fn establish_as_sender<P: PeerConnection>(
        &mut self,
        peer: &mut P,
    ) -> Result<(), ClientError> {
        self.establish_as_sender_within(peer, self.establish_timeout).await
    }

    /// Run the sender half of the handshake within `limit`
    pub async fn establish_as_sender_within<P: PeerConnection>(
        &mut self,
        peer: &mut P,
        limit: Duration,
    ) -> Result<(), ClientError> {
        let result = timeout(limit, self.negotiate(peer, Role::Sender)).await;
        self.finish_establish(peer, result, "sending").await
    }

    /// Run the receiver half of the handshake within the configured timeout
    pub async fn establish_as_receiver<P: PeerConnection>(
        &mut self,
        peer: &mut P,
    ) -> Result<(), ClientError> {
        self.establish_as_receiver_within(peer, self.establish_timeout).await
    }

    /// Run the receiver half of the handshake within `limit`
    pub async fn establish_as_receiver_within<P: PeerConnection>(
        &mut self,
        peer: &mut P,
        limit: Duration,
    ) -> Result<(), ClientError> {
        let result = timeout(limit, self.negotiate(peer, Role::Receiver)).await;
        self.finish_establish(peer, result, "receiving").await
    }

    /// Forward a locally gathered candidate
    pub async fn send_candidate(&mut self, candidate: Value) -> Result<(), ClientError> {
        let code = self.room_code()?;
        self.send(&ClientMessage::IceCandidate { code, candidate }).await
    }

    /// Stop the transfer
    pub async fn stop(&mut self, reason: &str, transfer_type: &str) -> Result<(), ClientError> {
        let code = self.room_code()?;
        self.send(&ClientMessage::Stop {
            code,
            reason: reason.to_string(),
            transfer_type: Some(transfer_type.to_string()),
        })
        .await
    }

    /// Cancel a room that has not started negotiating
    pub async fn cancel(&mut self) -> Result<(), ClientError> {
        let code = self.room_code()?;
        self.send(&ClientMessage::Cancel { code }).await
    }

    pub async fn pause(&mut self) -> Result<(), ClientError> {
        let code = self.room_code()?;
        self.send(&ClientMessage::Pause { code }).await
    }

    pub async fn resume(&mut self) -> Result<(), ClientError> {
        let code = self.room_code()?;
        self.send(&ClientMessage::Resume { code }).await
    }

    /// Close the signaling connection
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| ClientError::WebSocket(e.to_string()))
    }

    fn room_code(&self) -> Result<String, ClientError> {
        self.code.clone().ok_or(ClientError::NoRoom)
    }

    /// Exchange descriptions and candidates until the peer connection is up.
    /// The sender offers; the receiver answers the offer it is sent.
    async fn negotiate<P: PeerConnection>(
        &mut self,
        peer: &mut P,
        role: Role,
    ) -> Result<(), ClientError> {
        let code = self.room_code()?;

        if role == Role::Sender {
            let sdp = peer.create_offer().await?;
            self.send(&ClientMessage::Offer {
                code: code.clone(),
                sdp,
            })
            .await?;
        }

        // Remote candidates can only be applied once the remote description is set
        let mut described = false;
        let mut early_candidates = Vec::new();

        loop {
            tokio::select! {
                event = peer.next_event() => match event? {
                    PeerEvent::LocalCandidate(candidate) => self.send_candidate(candidate).await?,
                    PeerEvent::Connected => {
                        info!("Peer connection established for room {}", code);
                        return Ok(());
                    }
                    PeerEvent::Failed(reason) => return Err(ClientError::Peer(reason)),
                },
                msg = self.recv() => {
                    let msg = msg?;
                    if let Some(err) = terminal(&msg) {
                        return Err(err);
                    }
                    match msg {
                        ServerMessage::IceCandidate { candidate, .. } if described => {
                            peer.add_remote_candidate(candidate).await?;
                        }
                        ServerMessage::IceCandidate { candidate, .. } => early_candidates.push(candidate),
                        ServerMessage::Offer { sdp, .. } if role == Role::Receiver && !described => {
                            let answer = peer.accept_offer(sdp).await?;
                            self.send(&ClientMessage::Answer {
                                code: code.clone(),
                                sdp: answer,
                            })
                            .await?;
                            described = true;
                        }
                        ServerMessage::Answer { sdp, .. } if role == Role::Sender && !described => {
                            peer.accept_answer(sdp).await?;
                            described = true;
                        }
                        ServerMessage::Error { code, message } => {
                            warn!("Relay rejected handshake message: {}", message);
                            return Err(ClientError::Rejected(code));
                        }
                        other => debug!("Ignoring message during negotiation: {:?}", other),
                    }

                    if described {
                        for candidate in early_candidates.drain(..) {
                            peer.add_remote_candidate(candidate).await?;
                        }
                    }
                }
            }
        }
    }

    async fn finish_establish<P: PeerConnection>(
        &mut self,
        peer: &mut P,
        result: Result<Result<(), ClientError>, tokio::time::error::Elapsed>,
        transfer_type: &str,
    ) -> Result<(), ClientError> {
        let err = match result {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e,
            Err(_) => {
                warn!("Peer connection not established in time, stopping");
                if let Err(e) = self.stop("timeout", transfer_type).await {
                    debug!("Could not notify peer of timeout: {}", e);
                }
                ClientError::Timeout
            }
        };
        peer.close().await;
        Err(err)
    }
}

/// Map relay teardown notices to the error they end a handshake with
fn terminal(msg: &ServerMessage) -> Option<ClientError> {
    match msg {
        ServerMessage::PeerLeft { .. } => Some(ClientError::TransportClosed),
        ServerMessage::TransferStopped {
            stopped_by, reason, ..
        } => Some(ClientError::Stopped {
            stopped_by: *stopped_by,
            reason: reason.clone(),
        }),
        ServerMessage::TransferCancelled { .. } => Some(ClientError::Cancelled),
        ServerMessage::RoomExpired { .. } => Some(ClientError::Expired),
        ServerMessage::RoomNotFound { .. } => Some(ClientError::Rejected(ErrorCode::NotFound)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_messages() {
        assert!(matches!(
            terminal(&ServerMessage::PeerLeft { code: "AB12C3".into() }),
            Some(ClientError::TransportClosed)
        ));
        assert!(matches!(
            terminal(&ServerMessage::TransferStopped {
                code: "AB12C3".into(),
                reason: "user".into(),
                stopped_by: Role::Receiver,
                transfer_type: "receiving".into(),
            }),
            Some(ClientError::Stopped { stopped_by: Role::Receiver, .. })
        ));
        assert!(terminal(&ServerMessage::ReceiverJoined { code: "AB12C3".into() }).is_none());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ErrorCode::from(&ClientError::Timeout), ErrorCode::Timeout);
        assert_eq!(
            ErrorCode::from(&ClientError::TransportClosed),
            ErrorCode::TransportClosed
        );
        assert_eq!(
            ErrorCode::from(&ClientError::Rejected(ErrorCode::Full)),
            ErrorCode::Full
        );
    }
}
