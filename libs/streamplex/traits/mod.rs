//! # Streamplex Traits
//!
//! Seams between the engine and the outside world:
//!
//! - **Connector**: Resolve, connect and secure a byte stream to the endpoint
//! - **StreamHandler**: Receive messages and close notifications per topic
//! - **SubscriptionFormatter**: Build subscribe/unsubscribe messages for a topic
//! - **ReconnectionStrategy**: Control delays and the attempt bound when reconnecting
//!
//! ## Example
//!
//! ```rust,ignore
//! use streamplex::traits::*;
//!
//! struct PrintHandler;
//!
//! impl StreamHandler for PrintHandler {
//!     fn on_message(&mut self, topic: &str, payload: &[u8], is_text: bool) {
//!         if is_text {
//!             println!("[{}] < {}", topic, String::from_utf8_lossy(payload));
//!         }
//!     }
//!
//!     fn on_closed(&mut self, topic: &str, reason: &CloseReason) {
//!         println!("[{}] closed: {}", topic, reason);
//!     }
//! }
//! ```

pub mod connector;
pub mod error;
pub mod handler;
pub mod message;
pub mod reconnect;
pub mod subscription;

// Re-export commonly used types
pub use connector::{Connector, Endpoint};
pub use error::{Result, StreamError};
pub use handler::{ChannelHandler, CloseReason, StreamEvent, StreamHandler};
pub use message::{Message, MessageKind};
pub use reconnect::{
    BackoffKind, ExponentialBackoff, FixedDelay, LinearBackoff, NeverReconnect,
    ReconnectionStrategy,
};
pub use subscription::{JsonMethodSubscription, NoSubscription, SubscriptionFormatter};
