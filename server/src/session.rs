//! Session abstraction: one datagram contract over several transports.
//!
//! The room core never sees a socket; it sees a [`Session`] that can send
//! and receive opaque datagrams. Three transports implement the contract:
//!
//! - `Quic`: native unreliable datagrams on a QUIC connection. Lost packets
//!   stay lost; the tick engine's redundancy window recovers them.
//! - `Ws`: WebSocket binary frames used as pseudo-datagrams. Delivery is
//!   reliable and ordered, which makes the redundancy window harmlessly
//!   wasteful but still correct. Writes are serialised under a mutex.
//! - `Local`: an in-process loopback pair. Integration tests and bots drive
//!   rooms through it without touching the network.
//!
//! Sessions are cheap to clone; clones share the underlying connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::debug;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_rustls::server::TlsStream;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::error::ServerError;

type WsStream = WebSocketStream<TlsStream<TcpStream>>;

/// A datagram-capable client session.
#[derive(Clone)]
pub enum Session {
    Quic(QuicSession),
    Ws(WsSession),
    Local(LocalSession),
}

impl Session {
    pub fn from_quic(conn: quinn::Connection) -> Session {
        Session::Quic(QuicSession { conn })
    }

    pub fn from_ws(stream: WsStream, peer: SocketAddr) -> Session {
        let (write, read) = stream.split();
        Session::Ws(WsSession {
            write: Arc::new(Mutex::new(write)),
            read: Arc::new(Mutex::new(read)),
            connected: Arc::new(AtomicBool::new(true)),
            peer,
        })
    }

    /// Creates a connected loopback pair. Closing either end disconnects
    /// both.
    pub fn local_pair() -> (Session, Session) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());

        let a = LocalSession {
            tx: a_tx,
            rx: Arc::new(Mutex::new(a_rx)),
            closed: Arc::clone(&closed),
            notify: Arc::clone(&notify),
        };
        let b = LocalSession {
            tx: b_tx,
            rx: Arc::new(Mutex::new(b_rx)),
            closed,
            notify,
        };
        (Session::Local(a), Session::Local(b))
    }

    pub async fn send_datagram(&self, data: Vec<u8>) -> Result<(), ServerError> {
        match self {
            Session::Quic(s) => s.send(data),
            Session::Ws(s) => s.send(data).await,
            Session::Local(s) => s.send(data),
        }
    }

    /// Blocks until the next datagram arrives or the session dies.
    pub async fn recv_datagram(&self) -> Result<Vec<u8>, ServerError> {
        match self {
            Session::Quic(s) => s.recv().await,
            Session::Ws(s) => s.recv().await,
            Session::Local(s) => s.recv().await,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Session::Quic(s) => s.conn.close_reason().is_none(),
            Session::Ws(s) => s.connected.load(Ordering::Acquire),
            Session::Local(s) => !s.closed.load(Ordering::Acquire),
        }
    }

    pub async fn close(&self) {
        self.close_with_error(0, "session closed").await;
    }

    pub async fn close_with_error(&self, code: u32, reason: &str) {
        match self {
            Session::Quic(s) => {
                s.conn
                    .close(quinn::VarInt::from_u32(code), reason.as_bytes());
            }
            Session::Ws(s) => s.close(code, reason).await,
            Session::Local(s) => s.close(),
        }
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        match self {
            Session::Quic(s) => Some(s.conn.remote_address()),
            Session::Ws(s) => Some(s.peer),
            Session::Local(_) => None,
        }
    }
}

#[derive(Clone)]
pub struct QuicSession {
    conn: quinn::Connection,
}

impl QuicSession {
    fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        self.conn
            .send_datagram(bytes::Bytes::from(data))
            .map_err(|e| ServerError::Transport(format!("quic send: {}", e)))
    }

    async fn recv(&self) -> Result<Vec<u8>, ServerError> {
        self.conn
            .read_datagram()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| ServerError::Transport(format!("quic recv: {}", e)))
    }
}

#[derive(Clone)]
pub struct WsSession {
    write: Arc<Mutex<SplitSink<WsStream, Message>>>,
    read: Arc<Mutex<SplitStream<WsStream>>>,
    connected: Arc<AtomicBool>,
    peer: SocketAddr,
}

impl WsSession {
    async fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(ServerError::Transport("websocket closed".into()));
        }
        let mut write = self.write.lock().await;
        write.send(Message::Binary(data)).await.map_err(|e| {
            self.connected.store(false, Ordering::Release);
            ServerError::Transport(format!("websocket send: {}", e))
        })
    }

    async fn recv(&self) -> Result<Vec<u8>, ServerError> {
        let mut read = self.read.lock().await;
        loop {
            match read.next().await {
                Some(Ok(Message::Binary(data))) => return Ok(data),
                // Control frames are not datagrams; keep reading.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Text(_))) => continue,
                Some(Ok(Message::Close(_))) | None => {
                    self.connected.store(false, Ordering::Release);
                    return Err(ServerError::Transport("websocket closed by peer".into()));
                }
                Some(Ok(other)) => {
                    debug!("ignoring unexpected websocket frame: {:?}", other);
                }
                Some(Err(e)) => {
                    self.connected.store(false, Ordering::Release);
                    return Err(ServerError::Transport(format!("websocket recv: {}", e)));
                }
            }
        }
    }

    async fn close(&self, code: u32, reason: &str) {
        if !self.connected.swap(false, Ordering::AcqRel) {
            return;
        }
        let frame = CloseFrame {
            code: CloseCode::from(code.min(u16::MAX as u32) as u16),
            reason: reason.to_string().into(),
        };
        let mut write = self.write.lock().await;
        let _ = write.send(Message::Close(Some(frame))).await;
        let _ = write.close().await;
    }
}

#[derive(Clone)]
pub struct LocalSession {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    rx: Arc<Mutex<mpsc::UnboundedReceiver<Vec<u8>>>>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl LocalSession {
    fn send(&self, data: Vec<u8>) -> Result<(), ServerError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Transport("loopback closed".into()));
        }
        self.tx
            .send(data)
            .map_err(|_| ServerError::Transport("loopback peer gone".into()))
    }

    async fn recv(&self) -> Result<Vec<u8>, ServerError> {
        let mut rx = self.rx.lock().await;
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.closed.load(Ordering::Acquire) {
            return Err(ServerError::Transport("loopback closed".into()));
        }
        tokio::select! {
            msg = rx.recv() => {
                msg.ok_or_else(|| ServerError::Transport("loopback peer gone".into()))
            }
            _ = &mut notified => Err(ServerError::Transport("loopback closed".into())),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }
}
