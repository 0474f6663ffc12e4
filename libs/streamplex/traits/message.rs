/// Kind of a complete data message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Binary,
}

/// A complete application message
///
/// Produced by the reassembler once the final fragment arrives, and used for
/// outbound subscription messages. Text payloads are kept as raw bytes; use
/// [`Message::as_text`] to view them as UTF-8.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageKind, payload: Vec<u8>) -> Self {
        Self { kind, payload }
    }

    /// Create a text message
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(MessageKind::Text, text.into().into_bytes())
    }

    /// Create a binary message
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self::new(MessageKind::Binary, data.into())
    }

    /// Get the message as text, if it is a text message with valid UTF-8
    pub fn as_text(&self) -> Option<&str> {
        match self.kind {
            MessageKind::Text => std::str::from_utf8(&self.payload).ok(),
            MessageKind::Binary => None,
        }
    }

    /// Check if message is text
    pub fn is_text(&self) -> bool {
        self.kind == MessageKind::Text
    }

    /// Check if message is binary
    pub fn is_binary(&self) -> bool {
        self.kind == MessageKind::Binary
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}
