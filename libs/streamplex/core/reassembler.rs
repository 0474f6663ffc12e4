//! Fragment reassembly
//!
//! Stitches a Text/Binary frame with `fin = false` and the Continuation frames
//! that follow it into one [`Message`]. Control frames may be interleaved
//! between fragments and pass straight through.

use crate::core::frame::{Frame, OpCode};
use crate::traits::{Message, MessageKind};
use tracing::{debug, warn};

/// Result of pushing one frame into the reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Assembly {
    /// A whole application message is ready
    Complete(Message),
    /// Fragment stored, message not finished yet
    Partial,
    /// Control or reserved frame, handed back untouched
    Control(Frame),
    /// Continuation frame with no message in progress, dropped
    Orphaned,
    /// A new fragmented message started before the previous one finished;
    /// the previous partial payload was dropped
    Restarted,
}

/// Per-connection fragment state
#[derive(Debug, Default)]
pub struct Reassembler {
    in_progress: bool,
    first_opcode: Option<MessageKind>,
    accumulated: Vec<u8>,
}

fn kind_of(opcode: OpCode) -> Option<MessageKind> {
    match opcode {
        OpCode::Text => Some(MessageKind::Text),
        OpCode::Binary => Some(MessageKind::Binary),
        _ => None,
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }

    /// Bytes buffered for the message in progress
    pub fn pending_len(&self) -> usize {
        self.accumulated.len()
    }

    pub fn push(&mut self, frame: Frame) -> Assembly {
        if let Some(kind) = kind_of(frame.opcode) {
            if frame.fin {
                // Unfragmented messages never disturb a message in progress
                return Assembly::Complete(Message::new(kind, frame.payload));
            }

            let restarted = self.in_progress;
            if restarted {
                warn!(
                    "New {:?} message started before the previous one finished, dropping {} buffered bytes",
                    kind,
                    self.accumulated.len()
                );
            }

            self.in_progress = true;
            self.first_opcode = Some(kind);
            self.accumulated = frame.payload;

            return if restarted {
                Assembly::Restarted
            } else {
                Assembly::Partial
            };
        }

        if frame.opcode != OpCode::Continuation {
            return Assembly::Control(frame);
        }

        let Some(kind) = self.first_opcode.filter(|_| self.in_progress) else {
            debug!("Dropping continuation frame with no message in progress");
            return Assembly::Orphaned;
        };

        self.accumulated.extend_from_slice(&frame.payload);
        if !frame.fin {
            return Assembly::Partial;
        }

        let payload = std::mem::take(&mut self.accumulated);
        self.reset();
        Assembly::Complete(Message::new(kind, payload))
    }

    /// Forget any message in progress
    pub fn reset(&mut self) {
        self.in_progress = false;
        self.first_opcode = None;
        self.accumulated.clear();
    }
}
