//! # mongate-wire
//!
//! MongoDB wire protocol codec for the mongate gateway.
//!
//! This crate provides:
//! - The 16-byte message header and opcode table
//! - Strict, length-bounded decoding of OP_QUERY, OP_GET_MORE,
//!   OP_KILL_CURSORS, OP_REPLY, OP_MSG and OP_COMPRESSED
//! - CRC32-C checksums on OP_MSG
//! - snappy, zlib and zstd compression envelopes
//! - Server error codes and inline error documents

pub mod codec;
pub mod compression;
pub mod error;
pub mod header;
pub mod message;

pub use codec::{decode_message, encode_message, Decoder, Encoder};
pub use compression::Compressor;
pub use error::{ErrorCode, WireError};
pub use header::{MessageHeader, MsgFlags, OpCode, QueryFlags, RawHeader};
pub use message::{
    Message, MsgSection, OpCompressed, OpGetMore, OpKillCursors, OpMsg, OpQuery, OpReply,
    WireMessage,
};

/// Size of the fixed message header.
pub const HEADER_LEN: usize = 16;

/// Largest message accepted or produced, header included.
pub const MAX_MESSAGE_SIZE: usize = 48_000_000;

/// Largest single BSON document a server will accept.
pub const MAX_BSON_OBJECT_SIZE: usize = 16 * 1024 * 1024;

/// Largest number of writes a server accepts in one batch.
pub const MAX_WRITE_BATCH_SIZE: i32 = 100_000;
