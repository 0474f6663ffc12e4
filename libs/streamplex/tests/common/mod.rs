//! Common test utilities for streamplex integration tests
//!
//! Connections run over in-memory duplex pipes instead of sockets. Every
//! successful connect hands the server half of the pipe to the test, which
//! drives it with a [`FakeServer`].

#![allow(dead_code)]

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use streamplex::core::frame::{self, Decode, Frame, OpCode};
use streamplex::traits::{CloseReason, Connector, Endpoint, Result, StreamError, StreamHandler};
use streamplex::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

/// Macro for verbose test output (controlled by TEST_VERBOSE env var)
macro_rules! verbose_println {
    ($($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            println!($($arg)*);
        }
    };
}

pub const TEST_URL: &str = "wss://stream.test:9443/ws";

const PIPE_CAPACITY: usize = 64 * 1024;

/// Connector over `tokio::io::duplex` pipes
///
/// The first `refuse` connect attempts fail with a transport error.
pub struct MemoryConnector {
    accepted: mpsc::UnboundedSender<DuplexStream>,
    refuse: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        Self::refusing(0)
    }

    pub fn refusing(refuse: usize) -> (Self, mpsc::UnboundedReceiver<DuplexStream>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connector = Self {
            accepted: tx,
            refuse: AtomicUsize::new(refuse),
            attempts: Arc::new(AtomicUsize::new(0)),
        };
        (connector, rx)
    }

    /// Shared counter of connect calls, readable after the connector moves
    pub fn attempts(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.attempts)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    type Tcp = DuplexStream;
    type Stream = DuplexStream;

    async fn resolve(&self, endpoint: &Endpoint) -> Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], endpoint.port())))
    }

    async fn connect(&self, addr: SocketAddr) -> Result<DuplexStream> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(StreamError::Transport(format!("Connect to {} refused", addr)));
        }

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        self.accepted
            .send(server)
            .map_err(|_| StreamError::Transport("Test server is gone".to_string()))?;
        Ok(client)
    }

    async fn secure(&self, _endpoint: &Endpoint, tcp: DuplexStream) -> Result<DuplexStream> {
        Ok(tcp)
    }
}

/// Callback record kept by [`RecordingHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Opened(String),
    Message(String, Message),
    Closed(String, CloseReason),
}

/// Handler that forwards callbacks to a tokio channel the test can await
pub struct RecordingHandler {
    tx: mpsc::UnboundedSender<Event>,
}

impl RecordingHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl StreamHandler for RecordingHandler {
    fn on_open(&mut self, topic: &str) {
        let _ = self.tx.send(Event::Opened(topic.to_string()));
    }

    fn on_message(&mut self, topic: &str, payload: &[u8], is_text: bool) {
        let message = if is_text {
            Message::text(String::from_utf8_lossy(payload).into_owned())
        } else {
            Message::binary(payload.to_vec())
        };
        let _ = self.tx.send(Event::Message(topic.to_string(), message));
    }

    fn on_closed(&mut self, topic: &str, reason: &CloseReason) {
        let _ = self.tx.send(Event::Closed(topic.to_string(), reason.clone()));
    }
}

/// Server side of one connection
pub struct FakeServer {
    stream: DuplexStream,
    buffer: Vec<u8>,
    /// The client's Upgrade request head
    pub request: String,
}

impl FakeServer {
    /// Read the Upgrade request and answer `101 Switching Protocols`
    pub async fn accept(stream: DuplexStream) -> Self {
        Self::accept_with_trailing(stream, &[]).await
    }

    /// Like [`FakeServer::accept`], with `trailing` bytes written in the same
    /// write as the response head
    pub async fn accept_with_trailing(mut stream: DuplexStream, trailing: &[u8]) -> Self {
        let mut buffer = Vec::new();
        let mut chunk = [0u8; 1024];

        let head_end = loop {
            if let Some(pos) = buffer.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
            let n = stream.read(&mut chunk).await.unwrap();
            assert!(n > 0, "client hung up during the handshake");
            buffer.extend_from_slice(&chunk[..n]);
        };

        let request = String::from_utf8(buffer[..head_end].to_vec()).unwrap();
        buffer.drain(..head_end);

        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.trim()
                    .eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .expect("request carries Sec-WebSocket-Key");

        let mut response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\
             \r\n",
            derive_accept_key(key.as_bytes())
        )
        .into_bytes();
        response.extend_from_slice(trailing);
        stream.write_all(&response).await.unwrap();

        Self {
            stream,
            buffer,
            request,
        }
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    pub async fn send(&mut self, opcode: OpCode, payload: &[u8], fin: bool) {
        let bytes = frame::encode_unmasked(opcode, payload, fin).unwrap();
        self.send_raw(&bytes).await;
    }

    /// Like [`FakeServer::send`], returning false once the client is gone
    pub async fn try_send(&mut self, opcode: OpCode, payload: &[u8], fin: bool) -> bool {
        let bytes = frame::encode_unmasked(opcode, payload, fin).unwrap();
        self.stream.write_all(&bytes).await.is_ok()
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send(OpCode::Text, text.as_bytes(), true).await;
    }

    pub async fn send_close(&mut self, code: u16, reason: &str) {
        self.send(OpCode::Close, &frame::close_payload(code, reason), true)
            .await;
    }

    /// Next client frame, unmasked
    ///
    /// Panics if the client hangs up first.
    pub async fn recv_frame(&mut self) -> Frame {
        self.try_recv_frame()
            .await
            .expect("client hung up before sending a frame")
    }

    /// Next client frame, or None once the client has hung up
    pub async fn try_recv_frame(&mut self) -> Option<Frame> {
        loop {
            match frame::decode_client_frame(&self.buffer) {
                Ok(Decode::Frame(frame, used)) => {
                    self.buffer.drain(..used);
                    return Some(frame);
                }
                Ok(Decode::NeedMoreData) => {}
                Err(e) => panic!("client sent an invalid frame: {}", e),
            }

            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
            }
            self.buffer.extend_from_slice(&chunk[..n]);
        }
    }

    /// Next client frame with the given opcode, skipping others
    pub async fn recv_opcode(&mut self, opcode: OpCode) -> Frame {
        loop {
            let frame = self.recv_frame().await;
            if frame.opcode == opcode {
                return frame;
            }
            verbose_println!("  skipping client {:?} frame", frame.opcode);
        }
    }

    /// Drain frames until the client hangs up, returning what was received
    pub async fn recv_until_hangup(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Some(frame) = self.try_recv_frame().await {
            frames.push(frame);
        }
        frames
    }
}

/// Next recorded event, skipping nothing
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    events.recv().await.expect("engine dropped its handler")
}
