//! Application callback layer
//!
//! The engine calls a [`StreamHandler`] from inside its event loop. Every
//! callback blocks the loop for all connections of that engine, so handlers
//! must stay short. For heavier work, use [`ChannelHandler`] and consume
//! [`StreamEvent`]s on a dedicated thread:
//!
//! ```text
//! Engine loop ──on_message──> ChannelHandler ──> crossbeam channel ──> consumer thread
//! ```

use crate::traits::{Message, MessageKind};
use crossbeam_channel::Sender;
use std::fmt;
use tracing::debug;

/// Why a subscription's connection went away
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Server sent a Close frame
    PeerClosed { code: Option<u16>, reason: String },
    /// Transport reported end of stream or a hangup
    Hangup,
    /// Read or write failed
    Transport(String),
    /// No Pong arrived within the dead-peer timeout
    DeadPeer,
    /// Application asked to unsubscribe
    Unsubscribed,
    /// Engine is shutting down
    Shutdown,
    /// Supervisor gave up; the topic will not be retried again
    RetryExhausted { attempts: usize, last_error: String },
}

impl CloseReason {
    /// Whether the supervisor should schedule a reconnect after this reason
    pub fn should_reconnect(&self) -> bool {
        matches!(
            self,
            CloseReason::PeerClosed { .. }
                | CloseReason::Hangup
                | CloseReason::Transport(_)
                | CloseReason::DeadPeer
        )
    }

    /// Whether no further events will follow for this topic
    pub fn is_terminal(&self) -> bool {
        !self.should_reconnect()
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed { code: Some(code), reason } if !reason.is_empty() => {
                write!(f, "peer closed ({}: {})", code, reason)
            }
            CloseReason::PeerClosed { code: Some(code), .. } => write!(f, "peer closed ({})", code),
            CloseReason::PeerClosed { code: None, .. } => write!(f, "peer closed"),
            CloseReason::Hangup => write!(f, "hangup"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
            CloseReason::DeadPeer => write!(f, "dead peer"),
            CloseReason::Unsubscribed => write!(f, "unsubscribed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::RetryExhausted {
                attempts,
                last_error,
            } => write!(f, "retry exhausted after {} attempts: {}", attempts, last_error),
        }
    }
}

/// Outbound application contract
///
/// Implemented by the application to receive messages and lifecycle changes
/// for each subscribed topic.
pub trait StreamHandler: Send + 'static {
    /// Connection for `topic` reached `Open` and the subscription was sent
    fn on_open(&mut self, _topic: &str) {}

    /// A complete (possibly reassembled) data message arrived
    fn on_message(&mut self, topic: &str, payload: &[u8], is_text: bool);

    /// The connection for `topic` was closed
    ///
    /// Terminal reasons ([`CloseReason::is_terminal`]) are reported once and
    /// nothing else follows for the topic.
    fn on_closed(&mut self, topic: &str, reason: &CloseReason);
}

/// Event forwarded by [`ChannelHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened { topic: String },
    Message { topic: String, message: Message },
    Closed { topic: String, reason: CloseReason },
}

impl StreamEvent {
    pub fn topic(&self) -> &str {
        match self {
            StreamEvent::Opened { topic }
            | StreamEvent::Message { topic, .. }
            | StreamEvent::Closed { topic, .. } => topic,
        }
    }
}

/// Handler that forwards every callback to an unbounded crossbeam channel
///
/// Sending never blocks the engine loop. If the receiving side is gone the
/// event is dropped. Clones share the same channel.
#[derive(Clone)]
pub struct ChannelHandler {
    tx: Sender<StreamEvent>,
}

impl ChannelHandler {
    pub fn new(tx: Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    /// Create a handler together with the receiving end of its channel
    pub fn unbounded() -> (Self, crossbeam_channel::Receiver<StreamEvent>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (Self::new(tx), rx)
    }

    fn forward(&self, event: StreamEvent) {
        if self.tx.send(event).is_err() {
            debug!("Event receiver dropped, discarding event");
        }
    }
}

impl StreamHandler for ChannelHandler {
    fn on_open(&mut self, topic: &str) {
        self.forward(StreamEvent::Opened {
            topic: topic.to_string(),
        });
    }

    fn on_message(&mut self, topic: &str, payload: &[u8], is_text: bool) {
        let kind = if is_text {
            MessageKind::Text
        } else {
            MessageKind::Binary
        };
        self.forward(StreamEvent::Message {
            topic: topic.to_string(),
            message: Message::new(kind, payload.to_vec()),
        });
    }

    fn on_closed(&mut self, topic: &str, reason: &CloseReason) {
        self.forward(StreamEvent::Closed {
            topic: topic.to_string(),
            reason: reason.clone(),
        });
    }
}
