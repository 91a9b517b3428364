//! Feed transports
//!
//! [`WsTransport`] talks to the exchange over tokio-tungstenite. With the
//! `test-util` feature, `ChannelTransport` is an in-process stand-in driven
//! through `ChannelPeer` handles.

#[cfg(any(test, feature = "test-util"))]
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
#[cfg(any(test, feature = "test-util"))]
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
#[cfg(any(test, feature = "test-util"))]
use tracing::debug;
use tracing::{info, trace};
use url::Url;

use crate::error::RecorderError;

/// What a session hands to the receive loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Application frame for the codec.
    Text(String),
    /// Transport-level ping or pong, already answered. Proves the link is alive.
    Keepalive,
}

/// Opens feed sessions. One call per connection attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, RecorderError>;
}

/// A single open session with the feed.
#[async_trait]
pub trait FeedSession: Send {
    async fn send(&mut self, text: String) -> Result<(), RecorderError>;

    /// Next inbound frame. `None` once the peer has closed the session.
    ///
    /// Must be cancel safe: it is raced against timers in the receive loop.
    async fn recv(&mut self) -> Option<Result<Inbound, RecorderError>>;

    async fn close(&mut self) -> Result<(), RecorderError>;
}

pub struct WsTransport {
    url: Url,
}

impl WsTransport {
    pub fn new(url: &str) -> Result<Self, RecorderError> {
        let url = Url::parse(url).map_err(|e| RecorderError::Config(format!("feed.url: {}", e)))?;
        Ok(Self { url })
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, RecorderError> {
        info!(url = %self.url, "Connecting to feed");
        let (ws, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RecorderError::Connect(e.to_string()))?;
        info!(status = ?response.status(), "Feed WebSocket connected");
        Ok(Box::new(WsSession { ws }))
    }
}

struct WsSession {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedSession for WsSession {
    async fn send(&mut self, text: String) -> Result<(), RecorderError> {
        self.ws
            .send(Message::Text(text))
            .await
            .map_err(|e| RecorderError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, RecorderError>> {
        loop {
            match self.ws.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(Inbound::Text(text))),
                Ok(Message::Binary(data)) => {
                    return Some(Ok(Inbound::Text(String::from_utf8_lossy(&data).into_owned())))
                }
                Ok(Message::Ping(data)) => {
                    trace!("Received WS ping, sending pong");
                    if let Err(e) = self.ws.send(Message::Pong(data)).await {
                        return Some(Err(RecorderError::Transport(e.to_string())));
                    }
                    return Some(Ok(Inbound::Keepalive));
                }
                Ok(Message::Pong(_)) => return Some(Ok(Inbound::Keepalive)),
                Ok(Message::Close(frame)) => {
                    info!(frame = ?frame, "Feed WebSocket closed by peer");
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(RecorderError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> Result<(), RecorderError> {
        self.ws
            .close(None)
            .await
            .map_err(|e| RecorderError::Transport(e.to_string()))
    }
}

/// In-process transport. Every successful `connect` hands a fresh
/// [`ChannelPeer`] to whoever holds the receiver returned by [`ChannelTransport::new`].
#[cfg(any(test, feature = "test-util"))]
pub struct ChannelTransport {
    peers: mpsc::UnboundedSender<ChannelPeer>,
    refuse: AtomicU32,
    attempts: AtomicU32,
}

#[cfg(any(test, feature = "test-util"))]
impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ChannelPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let transport = Self {
            peers,
            refuse: AtomicU32::new(0),
            attempts: AtomicU32::new(0),
        };
        (transport, rx)
    }

    /// Fail the next `n` connect attempts with a connect error.
    pub fn refuse_next(&self, n: u32) {
        self.refuse.store(n, Ordering::SeqCst);
    }

    /// Connect attempts so far, refused ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<Box<dyn FeedSession>, RecorderError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RecorderError::Connect("connection refused".into()));
        }

        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.peers
            .send(ChannelPeer {
                to_client,
                from_client,
            })
            .map_err(|_| RecorderError::Connect("no peer listening".into()))?;
        debug!("In-process feed session opened");
        Ok(Box::new(ChannelSession { inbound, outbound }))
    }
}

/// Server side of a [`ChannelTransport`] session. Dropping it closes the session.
#[cfg(any(test, feature = "test-util"))]
pub struct ChannelPeer {
    to_client: mpsc::UnboundedSender<Inbound>,
    from_client: mpsc::UnboundedReceiver<String>,
}

#[cfg(any(test, feature = "test-util"))]
impl ChannelPeer {
    /// Deliver a frame to the client. Returns false once the client is gone.
    pub fn push(&self, frame: impl Into<String>) -> bool {
        self.to_client.send(Inbound::Text(frame.into())).is_ok()
    }

    /// Deliver a transport-level ping, as a WebSocket server would.
    pub fn push_keepalive(&self) -> bool {
        self.to_client.send(Inbound::Keepalive).is_ok()
    }

    /// Next frame the client sent, waiting for it.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.from_client.recv().await
    }

    /// Next frame the client sent, if one is already queued.
    pub fn try_next_sent(&mut self) -> Option<String> {
        self.from_client.try_recv().ok()
    }
}

#[cfg(any(test, feature = "test-util"))]
struct ChannelSession {
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<String>,
}

#[cfg(any(test, feature = "test-util"))]
#[async_trait]
impl FeedSession for ChannelSession {
    async fn send(&mut self, text: String) -> Result<(), RecorderError> {
        self.outbound
            .send(text)
            .map_err(|_| RecorderError::Transport("peer closed".into()))
    }

    async fn recv(&mut self) -> Option<Result<Inbound, RecorderError>> {
        self.inbound.recv().await.map(Ok)
    }

    async fn close(&mut self) -> Result<(), RecorderError> {
        self.inbound.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ws_transport_rejects_bad_url() {
        let err = WsTransport::new("not a url").err().unwrap();
        assert!(matches!(err, RecorderError::Config(_)));
        assert!(WsTransport::new("wss://api.hyperliquid.xyz/ws").is_ok());
    }

    #[tokio::test]
    async fn test_channel_session_round_trip() {
        let (transport, mut peers) = ChannelTransport::new();
        let mut session = transport.connect().await.unwrap();
        let mut peer = peers.recv().await.unwrap();

        session.send("hello".to_string()).await.unwrap();
        assert_eq!(peer.next_sent().await.as_deref(), Some("hello"));

        assert!(peer.push("frame"));
        assert_eq!(
            session.recv().await.unwrap().unwrap(),
            Inbound::Text("frame".to_string())
        );
        assert!(peer.push_keepalive());
        assert_eq!(session.recv().await.unwrap().unwrap(), Inbound::Keepalive);

        drop(peer);
        assert!(session.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_connects_are_counted() {
        let (transport, _peers) = ChannelTransport::new();
        transport.refuse_next(2);

        assert!(matches!(
            transport.connect().await.err().unwrap(),
            RecorderError::Connect(_)
        ));
        assert!(transport.connect().await.is_err());
        assert!(transport.connect().await.is_ok());
        assert_eq!(transport.attempts(), 3);
    }

    #[tokio::test]
    async fn test_ws_ping_is_answered_and_reported() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            ws.send(Message::Ping(vec![7])).await.unwrap();
            let reply = ws.next().await.unwrap().unwrap();
            ws.send(Message::Text("frame".to_string())).await.unwrap();
            reply
        });

        let transport = WsTransport::new(&format!("ws://{}", addr)).unwrap();
        let mut session = transport.connect().await.unwrap();
        assert_eq!(session.recv().await.unwrap().unwrap(), Inbound::Keepalive);
        assert_eq!(
            session.recv().await.unwrap().unwrap(),
            Inbound::Text("frame".to_string())
        );
        assert!(matches!(server.await.unwrap(), Message::Pong(_)));
    }
}
