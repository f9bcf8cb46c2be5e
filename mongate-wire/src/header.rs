//! Message header and flag words.
//!
//! Every message starts with a fixed 16-byte header, all fields little-endian:
//!
//! ```text
//! +---------------+-----------+------------+---------+
//! | messageLength | requestID | responseTo | opCode  |
//! |    4 bytes    |  4 bytes  |  4 bytes   | 4 bytes |
//! +---------------+-----------+------------+---------+
//! | body: messageLength - 16 bytes                    |
//! +---------------------------------------------------+
//! ```
//!
//! `messageLength` is the only framing signal on the stream. It is computed
//! from the encoded body on the way out and bounds every read on the way in.

use crate::error::WireError;
use crate::{HEADER_LEN, MAX_MESSAGE_SIZE};
use bytes::{Buf, BufMut};
use std::fmt;

/// Opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    Reply,
    Query,
    GetMore,
    KillCursors,
    Compressed,
    Msg,
}

impl OpCode {
    pub const REPLY: i32 = 1;
    pub const QUERY: i32 = 2004;
    pub const GET_MORE: i32 = 2005;
    pub const KILL_CURSORS: i32 = 2007;
    pub const COMPRESSED: i32 = 2012;
    pub const MSG: i32 = 2013;

    /// Returns the numeric opcode.
    pub fn code(&self) -> i32 {
        match self {
            OpCode::Reply => Self::REPLY,
            OpCode::Query => Self::QUERY,
            OpCode::GetMore => Self::GET_MORE,
            OpCode::KillCursors => Self::KILL_CURSORS,
            OpCode::Compressed => Self::COMPRESSED,
            OpCode::Msg => Self::MSG,
        }
    }

    /// Parses a numeric opcode.
    pub fn from_code(code: i32) -> Result<Self, WireError> {
        match code {
            Self::REPLY => Ok(OpCode::Reply),
            Self::QUERY => Ok(OpCode::Query),
            Self::GET_MORE => Ok(OpCode::GetMore),
            Self::KILL_CURSORS => Ok(OpCode::KillCursors),
            Self::COMPRESSED => Ok(OpCode::Compressed),
            Self::MSG => Ok(OpCode::Msg),
            other => Err(WireError::UnknownOpCode(other)),
        }
    }

    /// Returns the conventional upper-case opcode name used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            OpCode::Reply => "OP_REPLY",
            OpCode::Query => "OP_QUERY",
            OpCode::GetMore => "OP_GET_MORE",
            OpCode::KillCursors => "OP_KILL_CURSORS",
            OpCode::Compressed => "OP_COMPRESSED",
            OpCode::Msg => "OP_MSG",
        }
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The raw 16-byte header as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl RawHeader {
    /// Reads a header from the first 16 bytes of `buf` without consuming it.
    ///
    /// Returns `Ok(None)` if fewer than 16 bytes are available.
    pub fn peek(buf: &[u8]) -> Result<Option<Self>, WireError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let mut cursor = &buf[..HEADER_LEN];
        let header = Self {
            message_length: cursor.get_i32_le(),
            request_id: cursor.get_i32_le(),
            response_to: cursor.get_i32_le(),
            op_code: cursor.get_i32_le(),
        };
        header.validate_length()?;
        Ok(Some(header))
    }

    /// Rejects lengths that cannot frame a message.
    pub fn validate_length(&self) -> Result<(), WireError> {
        if self.message_length < HEADER_LEN as i32 || self.message_length as usize > MAX_MESSAGE_SIZE
        {
            return Err(WireError::InvalidMessageLength(self.message_length));
        }
        Ok(())
    }

    /// Returns the body length announced by the header.
    pub fn body_len(&self) -> usize {
        self.message_length as usize - HEADER_LEN
    }

    pub fn write_to(&self, buf: &mut impl BufMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code);
    }
}

/// Request correlation carried in every header.
///
/// The length and opcode are deliberately absent: both are derived from the
/// message body when encoding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageHeader {
    pub request_id: i32,
    pub response_to: i32,
}

impl MessageHeader {
    pub fn new(request_id: i32, response_to: i32) -> Self {
        Self {
            request_id,
            response_to,
        }
    }
}

impl From<RawHeader> for MessageHeader {
    fn from(raw: RawHeader) -> Self {
        Self {
            request_id: raw.request_id,
            response_to: raw.response_to,
        }
    }
}

fn has_bit(bits: i32, pos: u32) -> bool {
    bits & (1 << pos) != 0
}

/// OP_QUERY flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryFlags(i32);

impl QueryFlags {
    pub const TAILABLE_CURSOR: i32 = 1 << 1;
    pub const SLAVE_OK: i32 = 1 << 2;
    pub const OPLOG_REPLAY: i32 = 1 << 3;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;
    pub const AWAIT_DATA: i32 = 1 << 5;
    pub const EXHAUST: i32 = 1 << 6;
    pub const PARTIAL: i32 = 1 << 7;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: i32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> i32 {
        self.0
    }

    pub fn with(mut self, bit: i32) -> Self {
        self.0 |= bit;
        self
    }

    pub fn tailable_cursor(&self) -> bool {
        has_bit(self.0, 1)
    }

    pub fn slave_ok(&self) -> bool {
        has_bit(self.0, 2)
    }

    pub fn oplog_replay(&self) -> bool {
        has_bit(self.0, 3)
    }

    pub fn no_cursor_timeout(&self) -> bool {
        has_bit(self.0, 4)
    }

    pub fn await_data(&self) -> bool {
        has_bit(self.0, 5)
    }

    pub fn exhaust(&self) -> bool {
        has_bit(self.0, 6)
    }

    pub fn partial(&self) -> bool {
        has_bit(self.0, 7)
    }
}

/// OP_MSG flag bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(u32);

impl MsgFlags {
    pub const CHECKSUM_PRESENT: u32 = 1 << 0;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn with_checksum(mut self) -> Self {
        self.0 |= Self::CHECKSUM_PRESENT;
        self
    }

    pub fn with_more_to_come(mut self) -> Self {
        self.0 |= Self::MORE_TO_COME;
        self
    }

    pub fn checksum_present(&self) -> bool {
        self.0 & Self::CHECKSUM_PRESENT != 0
    }

    pub fn more_to_come(&self) -> bool {
        self.0 & Self::MORE_TO_COME != 0
    }
}
