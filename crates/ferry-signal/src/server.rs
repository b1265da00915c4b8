//! WebSocket signal server implementation
//!
//! One reader loop per connection feeds the relay; everything the relay
//! returns is pushed onto the recipients' outbound queues, which a writer
//! task per connection drains into the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use ferry_core::{ErrorCode, RoomConfig};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::messages::{ClientMessage, ServerMessage};
use crate::relay::{Outbound, Relay};
use crate::room::ConnectionId;

/// Largest request head inspected before the handshake
const HEAD_LIMIT: usize = 4096;
/// How long a client may take to send its request head
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

type Outboxes = DashMap<ConnectionId, mpsc::UnboundedSender<Message>>;

/// Signal server state
#[derive(Clone)]
pub struct SignalServer {
    relay: Arc<Relay>,
    /// Outbound queue of every open connection
    outboxes: Arc<Outboxes>,
    max_age: Duration,
    sweep_interval: Duration,
}

impl SignalServer {
    pub fn new(relay: Arc<Relay>, rooms: &RoomConfig) -> Self {
        Self {
            relay,
            outboxes: Arc::new(DashMap::new()),
            max_age: rooms.max_age(),
            sweep_interval: rooms.sweep_interval(),
        }
    }

    pub fn relay(&self) -> &Arc<Relay> {
        &self.relay
    }

    /// Bind and start the signal server
    pub async fn serve(&self, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!("Signal server listening on {}", addr);
        self.run(listener).await
    }

    /// Accept connections on an already bound listener
    pub async fn run(&self, listener: TcpListener) -> Result<(), std::io::Error> {
        // Start room sweeper task
        let sweeper = self.clone();
        tokio::spawn(async move { sweeper.run_sweeper().await });

        loop {
            let (stream, peer_addr) = listener.accept().await?;
            let server = self.clone();

            tokio::spawn(async move {
                if let Err(e) = server.handle_connection(stream, peer_addr).await {
                    debug!("Connection error from {}: {:?}", peer_addr, e);
                }
            });
        }
    }

    /// Periodically close rooms past their maximum age
    pub async fn run_sweeper(&self) {
        let mut tick = tokio::time::interval(self.sweep_interval);
        // The first tick completes immediately
        tick.tick().await;

        loop {
            tick.tick().await;
            let closed = self.sweep_at(Instant::now());
            if closed > 0 {
                info!("Room sweep notified {} participants", closed);
            }
        }
    }

    /// Run one sweep and deliver the expiry notices. Returns the number
    /// of notices sent.
    pub fn sweep_at(&self, now: Instant) -> usize {
        let out = self.relay.sweep(now, self.max_age);
        let count = out.len();
        deliver(&self.outboxes, out);
        count
    }

    /// Get room count (for monitoring)
    pub fn room_count(&self) -> usize {
        self.relay.registry().len()
    }

    /// Get open connection count (for monitoring)
    pub fn connection_count(&self) -> usize {
        self.outboxes.len()
    }

    /// Handle a single connection (HTTP or WebSocket)
    async fn handle_connection(
        &self,
        mut stream: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Peek at the request head to tell plain HTTP from a WebSocket upgrade
        let mut peek_buf = [0u8; HEAD_LIMIT];
        let n = peek_head(&stream, &mut peek_buf).await?;
        if is_plain_http(&peek_buf[..n]) {
            return self.handle_http_request(&mut stream).await;
        }

        let ws_stream = accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let conn = ConnectionId::generate().map_err(|e| format!("RNG failed: {}", e))?;
        debug!("New connection from {} as {}", peer_addr, conn);

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        self.outboxes.insert(conn.clone(), tx.clone());

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_sender.send(msg).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(msg) = ws_receiver.next().await {
            let text = match msg {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(data)) => {
                    let _ = tx.send(Message::Pong(data));
                    continue;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("WebSocket error from {}: {:?}", conn, e);
                    break;
                }
            };

            match ClientMessage::from_json(&text) {
                Ok(request) => {
                    debug!("{} -> room {}", conn, request.code().unwrap_or("-"));
                    let out = self.relay.handle(&conn, request);
                    deliver(&self.outboxes, out);
                }
                Err(e) => {
                    warn!("Malformed message from {}: {}", conn, e);
                    let error = ServerMessage::error(ErrorCode::BadRequest, format!("Invalid message: {}", e));
                    deliver(&self.outboxes, vec![Outbound::new(conn.clone(), error)]);
                }
            }
        }

        // Cleanup on disconnect: tell the peers first, then drop our queue
        let out = self.relay.disconnect(&conn);
        deliver(&self.outboxes, out);
        self.outboxes.remove(&conn);
        drop(tx);
        let _ = writer.await;

        debug!("Connection closed: {}", conn);
        Ok(())
    }

    /// Handle an HTTP request (for health checks)
    async fn handle_http_request(
        &self,
        stream: &mut TcpStream,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        // Read the HTTP request
        let mut buf = vec![0u8; 1024];
        let n = stream.read(&mut buf).await?;
        let request = String::from_utf8_lossy(&buf[..n]);

        // Parse the request path
        let path = request
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().nth(1))
            .unwrap_or("/");

        let rooms = self.room_count();
        let connections = self.connection_count();
        let (status, body) = match path {
            "/health" => (
                "200 OK",
                serde_json::json!({"status": "healthy", "rooms": rooms, "connections": connections}),
            ),
            "/stats" => (
                "200 OK",
                serde_json::json!({
                    "rooms": rooms,
                    "connections": connections,
                    "members": self.relay.member_count(),
                }),
            ),
            _ => ("404 Not Found", serde_json::json!({"error": "not found"})),
        };
        let body = body.to_string();

        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );

        stream.write_all(response.as_bytes()).await?;
        Ok(())
    }
}

/// Push relay output onto the recipients' queues. Recipients that have
/// already gone away are skipped.
fn deliver(outboxes: &Outboxes, out: Vec<Outbound>) {
    for Outbound { to, message } in out {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode message for {}: {}", to, e);
                continue;
            }
        };

        match outboxes.get(&to) {
            Some(tx) => {
                if tx.send(Message::Text(json)).is_err() {
                    debug!("Outbound queue of {} closed", to);
                }
            }
            None => debug!("Dropping message for departed connection {}", to),
        }
    }
}

/// Peek until the request head is complete, the buffer is full, the peer
/// stops sending or [`HEAD_TIMEOUT`] passes. Returns the bytes available.
async fn peek_head(stream: &TcpStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let deadline = Instant::now() + HEAD_TIMEOUT;
    let mut seen = 0;
    loop {
        let n = stream.peek(buf).await?;
        if n == 0 || n == buf.len() || head_complete(&buf[..n]) || Instant::now() >= deadline {
            return Ok(n);
        }
        // peek returns at once while data is buffered; wait for more
        if n == seen {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        seen = n;
    }
}

fn head_complete(head: &[u8]) -> bool {
    head.windows(4).any(|w| w == b"\r\n\r\n")
}

/// A GET request that does not ask for a WebSocket upgrade
fn is_plain_http(head: &[u8]) -> bool {
    if !head.starts_with(b"GET ") {
        return false;
    }
    let head = String::from_utf8_lossy(head).to_ascii_lowercase();
    !head.contains("upgrade: websocket")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    fn make_server() -> SignalServer {
        let relay = Arc::new(Relay::new(Arc::new(MemoryRegistry::new())));
        SignalServer::new(relay, &RoomConfig::default())
    }

    #[test]
    fn test_server_creation() {
        let server = make_server();
        assert_eq!(server.room_count(), 0);
        assert_eq!(server.connection_count(), 0);
    }

    #[test]
    fn test_plain_http_detection() {
        assert!(is_plain_http(b"GET /health HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(!is_plain_http(
            b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
        ));
        assert!(!is_plain_http(b"POST /api HTTP/1.1\r\n\r\n"));
    }

    #[test]
    fn test_head_complete() {
        assert!(head_complete(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n"));
        assert!(!head_complete(b"GET / HTTP/1.1\r\nHost: x\r\n"));
        assert!(!head_complete(b""));
    }

    #[tokio::test]
    async fn test_peek_head_waits_for_full_head() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.set_nodelay(true).unwrap();
            stream.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            stream
                .write_all(b"Upgrade: websocket\r\n\r\n")
                .await
                .unwrap();
            stream
        });

        let (stream, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; HEAD_LIMIT];
        let n = peek_head(&stream, &mut buf).await.unwrap();
        assert!(head_complete(&buf[..n]));
        assert!(!is_plain_http(&buf[..n]));

        drop(client.await.unwrap());
    }

    #[test]
    fn test_deliver_skips_departed() {
        let outboxes: Outboxes = DashMap::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        outboxes.insert(ConnectionId::from("here"), tx);

        deliver(
            &outboxes,
            vec![
                Outbound::new("gone".into(), ServerMessage::PeerLeft { code: "AB12C3".into() }),
                Outbound::new("here".into(), ServerMessage::Pong { timestamp: 1 }),
            ],
        );

        match rx.try_recv().unwrap() {
            Message::Text(text) => assert!(text.contains("pong")),
            other => panic!("unexpected frame {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
