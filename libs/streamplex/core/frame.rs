//! WebSocket frame codec (RFC 6455)
//!
//! Pure functions, no I/O. The decoder works on whatever prefix of the
//! receive buffer is available and reports [`Decode::NeedMoreData`] until a
//! whole frame is present, so frames may arrive split across any number of
//! reads.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |            Masking key (client -> server frames only)         |
//! +---------------------------------------------------------------+
//! |                          Payload data                         |
//! +---------------------------------------------------------------+
//! ```

use crate::traits::StreamError;
use thiserror::Error;

/// Maximum payload size for Ping, Pong and Close frames
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Frame opcode
///
/// Unknown values are kept in `Reserved` so the caller can log and skip them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
    Reserved(u8),
}

impl OpCode {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(value) => value & 0x0F,
        }
    }

    /// Close, Ping, Pong and the reserved control range 0xB-0xF
    pub fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }

    /// Text or Binary (the opcodes that may start a message)
    pub fn is_data(self) -> bool {
        matches!(self, OpCode::Text | OpCode::Binary)
    }
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: OpCode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn payload_length(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Successful decoder outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decode {
    /// A complete frame and the number of buffer bytes it occupied
    Frame(Frame, usize),
    /// The buffer holds only part of a frame
    NeedMoreData,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Servers must never mask. `skip` is the header length to advance past.
    #[error("server frame has the mask bit set ({skip} header bytes skipped)")]
    MaskedServerFrame { skip: usize },

    /// Clients must always mask. `skip` is the header length to advance past.
    #[error("client frame is missing the mask bit ({skip} header bytes skipped)")]
    UnmaskedClientFrame { skip: usize },

    #[error("control frame payload of {0} bytes exceeds {MAX_CONTROL_PAYLOAD}")]
    ControlPayloadTooLarge(usize),

    #[error("control frames cannot be fragmented")]
    FragmentedControlFrame,
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        StreamError::ProtocolViolation(err.to_string())
    }
}

struct Header {
    fin: bool,
    opcode: OpCode,
    mask_key: Option<[u8; 4]>,
    payload_len: u64,
    header_len: usize,
}

/// Parse the header at the start of `buf`, or `None` if it is incomplete
fn parse_header(buf: &[u8]) -> Option<Header> {
    if buf.len() < 2 {
        return None;
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = OpCode::from_u8(buf[0]);
    let masked = buf[1] & 0x80 != 0;

    // 126 and 127 are escapes for the extended length fields, never lengths
    let (payload_len, mut header_len) = match buf[1] & 0x7F {
        126 => {
            if buf.len() < 4 {
                return None;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        127 => {
            if buf.len() < 10 {
                return None;
            }
            let mut len = [0u8; 8];
            len.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(len), 10)
        }
        inline => (inline as u64, 2),
    };

    let mask_key = if masked {
        if buf.len() < header_len + 4 {
            return None;
        }
        let mut key = [0u8; 4];
        key.copy_from_slice(&buf[header_len..header_len + 4]);
        header_len += 4;
        Some(key)
    } else {
        None
    };

    Some(Header {
        fin,
        opcode,
        mask_key,
        payload_len,
        header_len,
    })
}

fn take_payload(buf: &[u8], header: Header) -> Decode {
    let total = (header.header_len as u64).saturating_add(header.payload_len);
    if (buf.len() as u64) < total {
        return Decode::NeedMoreData;
    }

    let end = total as usize;
    let mut payload = buf[header.header_len..end].to_vec();
    if let Some(key) = header.mask_key {
        apply_mask(&mut payload, key);
    }

    Decode::Frame(
        Frame {
            fin: header.fin,
            opcode: header.opcode,
            masked: header.mask_key.is_some(),
            payload,
        },
        end,
    )
}

/// Decode one server-originated frame from the head of `buf`
///
/// A masked frame yields [`FrameError::MaskedServerFrame`]; the caller skips
/// its header and carries on with the connection.
pub fn decode(buf: &[u8]) -> Result<Decode, FrameError> {
    let Some(header) = parse_header(buf) else {
        return Ok(Decode::NeedMoreData);
    };

    if header.mask_key.is_some() {
        return Err(FrameError::MaskedServerFrame {
            skip: header.header_len,
        });
    }

    Ok(take_payload(buf, header))
}

/// Decode one client-originated (masked) frame and unmask its payload
pub fn decode_client_frame(buf: &[u8]) -> Result<Decode, FrameError> {
    let Some(header) = parse_header(buf) else {
        return Ok(Decode::NeedMoreData);
    };

    if header.mask_key.is_none() {
        return Err(FrameError::UnmaskedClientFrame {
            skip: header.header_len,
        });
    }

    Ok(take_payload(buf, header))
}

/// XOR `data` with the 4-byte masking key (`data[i] ^= key[i % 4]`)
#[inline]
pub fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i & 3];
    }
}

fn write_frame(
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask_key: Option<[u8; 4]>,
) -> Result<Vec<u8>, FrameError> {
    if opcode.is_control() {
        if payload.len() > MAX_CONTROL_PAYLOAD {
            return Err(FrameError::ControlPayloadTooLarge(payload.len()));
        }
        if !fin {
            return Err(FrameError::FragmentedControlFrame);
        }
    }

    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(if fin { 0x80 } else { 0x00 } | opcode.as_u8());

    let mask_bit = if mask_key.is_some() { 0x80 } else { 0x00 };
    let len = payload.len();
    if len < 126 {
        out.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match mask_key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }

    Ok(out)
}

/// Encode a client-to-server frame, masked with a fresh random key
pub fn encode(opcode: OpCode, payload: &[u8], fin: bool) -> Result<Vec<u8>, FrameError> {
    write_frame(opcode, payload, fin, Some(rand::random::<[u8; 4]>()))
}

/// Encode a client-to-server frame with a caller-supplied masking key
pub fn encode_with_key(
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    key: [u8; 4],
) -> Result<Vec<u8>, FrameError> {
    write_frame(opcode, payload, fin, Some(key))
}

/// Encode a server-to-client (unmasked) frame
pub fn encode_unmasked(opcode: OpCode, payload: &[u8], fin: bool) -> Result<Vec<u8>, FrameError> {
    write_frame(opcode, payload, fin, None)
}

/// Build a Close payload: 2-byte status code followed by a UTF-8 reason
///
/// The reason is truncated at a character boundary to keep the payload
/// within the control frame limit.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut cut = reason.len().min(MAX_CONTROL_PAYLOAD - 2);
    while !reason.is_char_boundary(cut) {
        cut -= 1;
    }

    let mut payload = Vec::with_capacity(2 + cut);
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(&reason.as_bytes()[..cut]);
    payload
}

/// Split a Close payload into status code and reason
pub fn parse_close_payload(payload: &[u8]) -> (Option<u16>, String) {
    if payload.len() < 2 {
        return (None, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    let reason = String::from_utf8_lossy(&payload[2..]).into_owned();
    (Some(code), reason)
}
