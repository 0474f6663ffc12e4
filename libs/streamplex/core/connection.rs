//! One open WebSocket connection
//!
//! A [`Connection`] owns the write half of its transport, the receive buffer,
//! the fragment reassembler and the liveness markers for one topic. Reads are
//! driven by the event loop, which hands every chunk to [`Connection::ingest`]
//! and acts on the returned [`Dispatch`] list.

use crate::core::frame::{self, Decode, Frame, FrameError, OpCode};
use crate::core::liveness::Liveness;
use crate::core::reassembler::{Assembly, Reassembler};
use crate::traits::{Message, MessageKind, Result, StreamError};
use futures::future::AbortHandle;
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Opaque per-transport identifier, never reused within an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Lifecycle of a subscription's connection
///
/// ```text
/// Resolving -> Connecting -> TlsHandshake -> WsHandshake -> Open -> Closing -> Closed
///     \____________\_____________\______________\__________________________> Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Resolving,
    Connecting,
    TlsHandshake,
    WsHandshake,
    Open,
    Closing,
    Closed,
    Failed,
}

impl ConnectionStatus {
    /// Still working towards `Open`
    pub fn is_establishing(self) -> bool {
        matches!(
            self,
            ConnectionStatus::Resolving
                | ConnectionStatus::Connecting
                | ConnectionStatus::TlsHandshake
                | ConnectionStatus::WsHandshake
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStatus::Resolving => "resolving",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::TlsHandshake => "tls-handshake",
            ConnectionStatus::WsHandshake => "ws-handshake",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Closing => "closing",
            ConnectionStatus::Closed => "closed",
            ConnectionStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Work the event loop must do after [`Connection::ingest`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dispatch {
    /// Hand a complete message to the application
    Deliver(Message),
    /// Write these encoded frame bytes back to the peer
    Reply(Vec<u8>),
    /// A Pong arrived
    PongReceived,
    /// The peer sent Close; the connection is now `Closing`
    Closed { code: Option<u16>, reason: String },
    /// Something the peer sent broke the protocol; the connection stays up
    Violation(String),
    /// The receive buffer passed its ceiling and was discarded
    Overflow { discarded: usize },
}

pub struct Connection<W> {
    id: ConnectionId,
    topic: String,
    writer: W,
    reader: AbortHandle,
    receive_buffer: Vec<u8>,
    reassembler: Reassembler,
    status: ConnectionStatus,
    liveness: Liveness,
    write_timeout: Duration,
}

/// Bound on a single frame write unless overridden
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

impl<W> Connection<W> {
    /// Wrap a transport that just completed the WebSocket handshake
    ///
    /// # Arguments
    /// * `writer` - Write half of the transport
    /// * `reader` - Aborts the stream feeding this connection's reads
    /// * `leftover` - Bytes the handshake read past the response head
    pub fn open(
        id: ConnectionId,
        topic: impl Into<String>,
        writer: W,
        reader: AbortHandle,
        leftover: Vec<u8>,
        now: Instant,
        dead_peer_timeout: Duration,
    ) -> Self {
        Self {
            id,
            topic: topic.into(),
            writer,
            reader,
            receive_buffer: leftover,
            reassembler: Reassembler::new(),
            status: ConnectionStatus::Open,
            liveness: Liveness::new(now, dead_peer_timeout),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Limit how long one frame write may wait on a peer that is not reading
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn is_open(&self) -> bool {
        self.status == ConnectionStatus::Open
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    pub fn buffered(&self) -> usize {
        self.receive_buffer.len()
    }

    /// Append bytes from one read and decode every complete frame
    ///
    /// Bytes are ignored unless the connection is `Open`. A Close frame stops
    /// decoding and discards whatever followed it.
    pub fn ingest(&mut self, data: &[u8], now: Instant, ceiling: usize) -> Vec<Dispatch> {
        if self.status != ConnectionStatus::Open {
            debug!(
                "[{} {}] Ignoring {} bytes while {}",
                self.topic,
                self.id,
                data.len(),
                self.status
            );
            return Vec::new();
        }

        self.liveness.record_activity(now);
        self.receive_buffer.extend_from_slice(data);

        let mut out = Vec::new();
        let mut processed = 0;

        while processed < self.receive_buffer.len() {
            match frame::decode(&self.receive_buffer[processed..]) {
                Ok(Decode::NeedMoreData) => break,
                Ok(Decode::Frame(frame, used)) => {
                    processed += used;
                    if self.handle_frame(frame, now, &mut out) {
                        // Close received: nothing after it is processed
                        self.receive_buffer.clear();
                        return out;
                    }
                }
                Err(FrameError::MaskedServerFrame { skip }) => {
                    warn!(
                        "[{} {}] Server sent a masked frame, skipping {} header bytes",
                        self.topic, self.id, skip
                    );
                    processed += skip;
                    out.push(Dispatch::Violation(
                        FrameError::MaskedServerFrame { skip }.to_string(),
                    ));
                }
                Err(err) => {
                    warn!("[{} {}] Undecodable data, dropping buffer: {}", self.topic, self.id, err);
                    processed = self.receive_buffer.len();
                    out.push(Dispatch::Violation(err.to_string()));
                }
            }
        }

        self.receive_buffer.drain(..processed);

        if self.receive_buffer.len() > ceiling {
            let discarded = self.receive_buffer.len();
            warn!(
                "[{} {}] Receive buffer of {} bytes exceeds {} byte ceiling, discarding",
                self.topic, self.id, discarded, ceiling
            );
            self.receive_buffer.clear();
            self.reassembler.reset();
            out.push(Dispatch::Overflow { discarded });
        }

        out
    }

    /// Returns true when the frame was a Close
    fn handle_frame(&mut self, frame: Frame, now: Instant, out: &mut Vec<Dispatch>) -> bool {
        let control = match self.reassembler.push(frame) {
            Assembly::Complete(message) => {
                out.push(Dispatch::Deliver(message));
                return false;
            }
            Assembly::Partial => return false,
            Assembly::Orphaned => {
                out.push(Dispatch::Violation(
                    "continuation frame without a message in progress".to_string(),
                ));
                return false;
            }
            Assembly::Restarted => {
                out.push(Dispatch::Violation(
                    "new fragmented message before the previous one finished".to_string(),
                ));
                return false;
            }
            Assembly::Control(frame) => frame,
        };

        if control.opcode.is_control() && !control.fin {
            out.push(Dispatch::Violation(FrameError::FragmentedControlFrame.to_string()));
            return false;
        }

        match control.opcode {
            OpCode::Ping => match frame::encode(OpCode::Pong, &control.payload, true) {
                Ok(pong) => out.push(Dispatch::Reply(pong)),
                Err(err) => out.push(Dispatch::Violation(err.to_string())),
            },
            OpCode::Pong => {
                self.liveness.record_pong_received(now);
                out.push(Dispatch::PongReceived);
            }
            OpCode::Close => {
                let (code, reason) = frame::parse_close_payload(&control.payload);
                debug!(
                    "[{} {}] Close frame received (code: {:?}, reason: '{}')",
                    self.topic, self.id, code, reason
                );
                self.status = ConnectionStatus::Closing;
                out.push(Dispatch::Closed { code, reason });
                return true;
            }
            other => {
                warn!("[{} {}] Ignoring frame with opcode {:?}", self.topic, self.id, other);
                out.push(Dispatch::Violation(format!("unexpected opcode {:?}", other)));
            }
        }

        false
    }

    /// Stop reading and mark the connection closed
    pub fn release(&mut self) {
        self.reader.abort();
        self.receive_buffer.clear();
        self.reassembler.reset();
        self.status = ConnectionStatus::Closed;
    }
}

impl<W> Connection<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Write already-encoded frame bytes
    ///
    /// Fails with [`StreamError::Timeout`] if the peer does not take the bytes
    /// within the write timeout. The frame may then be partly written, so the
    /// connection must not be used again.
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let writer = &mut self.writer;
        let write = async move {
            writer.write_all(bytes).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.write_timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StreamError::Timeout(format!(
                "write of {} bytes stalled for {:?}",
                bytes.len(),
                self.write_timeout
            ))),
        }
    }

    /// Encode and send a complete application message
    pub async fn send_message(&mut self, message: &Message) -> Result<()> {
        let opcode = match message.kind {
            MessageKind::Text => OpCode::Text,
            MessageKind::Binary => OpCode::Binary,
        };
        let bytes = frame::encode(opcode, &message.payload, true).map_err(StreamError::from)?;
        self.send_raw(&bytes).await
    }

    /// Send an empty Ping and start waiting for its Pong
    pub async fn send_ping(&mut self, now: Instant) -> Result<()> {
        let bytes = frame::encode(OpCode::Ping, &[], true).map_err(StreamError::from)?;
        self.send_raw(&bytes).await?;
        self.liveness.record_ping_sent(now);
        Ok(())
    }

    /// Best-effort Close frame, then shut the write side down
    pub async fn close(&mut self, code: Option<u16>, reason: &str) {
        let payload = code
            .map(|code| frame::close_payload(code, reason))
            .unwrap_or_default();

        match frame::encode(OpCode::Close, &payload, true) {
            Ok(bytes) => {
                if let Err(e) = self.send_raw(&bytes).await {
                    debug!("[{} {}] Close frame not delivered: {}", self.topic, self.id, e);
                }
            }
            Err(e) => debug!("[{} {}] Could not encode Close frame: {}", self.topic, self.id, e),
        }

        let _ = self.writer.shutdown().await;
        self.release();
    }
}

impl<W> Drop for Connection<W> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
