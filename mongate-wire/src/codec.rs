//! Encoder and decoder for wire messages.
//!
//! Decoding is strict: every read is bounded by the header's
//! `messageLength`, and any short read, bad length, unknown section kind or
//! checksum mismatch aborts with an error. Encoding never trusts a
//! caller-supplied length; `messageLength` is always patched in from the
//! serialized body.

use crate::compression::Compressor;
use crate::error::WireError;
use crate::header::{MessageHeader, MsgFlags, OpCode, QueryFlags, RawHeader};
use crate::message::{
    Message, MsgSection, OpCompressed, OpGetMore, OpKillCursors, OpMsg, OpQuery, OpReply,
    WireMessage,
};
use crate::{HEADER_LEN, MAX_MESSAGE_SIZE};
use bson::Document;
use bytes::{Buf, BufMut, BytesMut};

/// Size of the OP_COMPRESSED prefix: original opcode, uncompressed size, compressor id.
const COMPRESSED_PREFIX_LEN: usize = 4 + 4 + 1;

/// Encodes wire messages.
pub struct Encoder;

impl Encoder {
    /// Encodes a complete message, header included.
    pub fn encode(message: &WireMessage) -> Result<BytesMut, WireError> {
        encode_message(message.header, &message.body)
    }
}

/// Incremental stream decoder.
///
/// Bytes read from the socket are appended with [`Decoder::extend`]; each call
/// to [`Decoder::decode`] yields at most one message once all of its
/// `messageLength` bytes are buffered.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(16 * 1024),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Returns `Ok(None)` if more data is needed.
    pub fn decode(&mut self) -> Result<Option<WireMessage>, WireError> {
        let Some(header) = RawHeader::peek(&self.buffer)? else {
            return Ok(None);
        };
        let len = header.message_length as usize;
        if self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
            return Ok(None);
        }
        let frame = self.buffer.split_to(len);
        decode_message(&frame).map(Some)
    }

    /// Returns whether a partially received message is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buffer.is_empty()
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decodes exactly one complete message from `bytes`.
pub fn decode_message(bytes: &[u8]) -> Result<WireMessage, WireError> {
    let header = RawHeader::peek(bytes)?.ok_or_else(|| WireError::Truncated {
        what: "header",
        needed: HEADER_LEN - bytes.len(),
    })?;
    let len = header.message_length as usize;
    if bytes.len() < len {
        return Err(WireError::Truncated {
            what: "message body",
            needed: len - bytes.len(),
        });
    }
    if bytes.len() > len {
        return Err(WireError::TrailingBytes {
            what: "message",
            remaining: bytes.len() - len,
        });
    }

    let op_code = OpCode::from_code(header.op_code)?;
    let body = &bytes[HEADER_LEN..len];
    let message = match op_code {
        OpCode::Query => Message::Query(decode_query(body)?),
        OpCode::GetMore => Message::GetMore(decode_get_more(body)?),
        OpCode::KillCursors => Message::KillCursors(decode_kill_cursors(body)?),
        OpCode::Reply => Message::Reply(decode_reply(body)?),
        OpCode::Msg => Message::Msg(decode_msg(bytes)?),
        OpCode::Compressed => Message::Compressed(decode_compressed(&header, body)?),
    };

    Ok(WireMessage {
        header: header.into(),
        body: message,
    })
}

fn decode_query(body: &[u8]) -> Result<OpQuery, WireError> {
    let mut r = BodyReader::new(body);
    let flags = QueryFlags::from_bits(r.read_i32("query flags")?);
    let full_collection_name = r.read_cstring()?;
    let number_to_skip = r.read_i32("numberToSkip")?;
    let number_to_return = r.read_i32("numberToReturn")?;
    let query = r.read_document()?;
    let return_fields_selector = if r.is_empty() {
        None
    } else {
        Some(r.read_document()?)
    };
    r.finish("OP_QUERY")?;

    Ok(OpQuery {
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
        return_fields_selector,
    })
}

fn decode_get_more(body: &[u8]) -> Result<OpGetMore, WireError> {
    let mut r = BodyReader::new(body);
    let flags = r.read_i32("getMore flags")?;
    let full_collection_name = r.read_cstring()?;
    let number_to_return = r.read_i32("numberToReturn")?;
    let cursor_id = r.read_i64("cursorID")?;
    r.finish("OP_GET_MORE")?;

    Ok(OpGetMore {
        flags,
        full_collection_name,
        number_to_return,
        cursor_id,
    })
}

fn decode_kill_cursors(body: &[u8]) -> Result<OpKillCursors, WireError> {
    let mut r = BodyReader::new(body);
    let _zero = r.read_i32("reserved zero")?;
    let count = r.read_i32("numberOfCursorIDs")?;
    if count < 0 || count as usize > r.remaining() / 8 {
        return Err(WireError::InvalidCursorCount(count));
    }
    let cursor_ids = (0..count)
        .map(|_| r.read_i64("cursorIDs"))
        .collect::<Result<Vec<_>, _>>()?;
    r.finish("OP_KILL_CURSORS")?;

    Ok(OpKillCursors { cursor_ids })
}

fn decode_reply(body: &[u8]) -> Result<OpReply, WireError> {
    let mut r = BodyReader::new(body);
    let flags = r.read_i32("reply flags")?;
    let cursor_id = r.read_i64("cursorID")?;
    let starting_from = r.read_i32("startingFrom")?;
    let number_returned = r.read_i32("numberReturned")?;
    let mut documents = Vec::with_capacity(number_returned.clamp(0, 1024) as usize);
    while !r.is_empty() {
        documents.push(r.read_document()?);
    }

    Ok(OpReply {
        flags,
        cursor_id,
        starting_from,
        documents,
    })
}

/// Decodes an OP_MSG. Takes the whole message because the checksum covers
/// the header as well as the body.
fn decode_msg(message: &[u8]) -> Result<OpMsg, WireError> {
    let body = &message[HEADER_LEN..];
    let mut r = BodyReader::new(body);
    let flags = MsgFlags::from_bits(r.read_u32("message flags")?);

    let sections_end = if flags.checksum_present() {
        if body.len() < 4 + 4 {
            return Err(WireError::Truncated {
                what: "checksum",
                needed: 8 - body.len(),
            });
        }
        let split = message.len() - 4;
        let expected = (&message[split..]).get_u32_le();
        let actual = crc32c::crc32c(&message[..split]);
        if expected != actual {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }
        body.len() - 4
    } else {
        body.len()
    };

    let mut r = BodyReader::new(&body[4..sections_end]);
    let mut sections = Vec::new();
    while !r.is_empty() {
        let kind = r.read_u8("section kind")?;
        match kind {
            0 => sections.push(MsgSection::Body(r.read_document()?)),
            1 => {
                let size = r.read_i32("section size")?;
                if size < 4 || (size - 4) as usize > r.remaining() {
                    return Err(WireError::InvalidSectionSize(size));
                }
                let mut seq = BodyReader::new(r.take((size - 4) as usize)?);
                let identifier = seq.read_cstring()?;
                let mut documents = Vec::new();
                while !seq.is_empty() {
                    documents.push(seq.read_document()?);
                }
                sections.push(MsgSection::DocumentSequence {
                    identifier,
                    documents,
                });
            }
            other => return Err(WireError::UnknownSectionKind(other)),
        }
    }

    Ok(OpMsg { flags, sections })
}

fn decode_compressed(header: &RawHeader, body: &[u8]) -> Result<OpCompressed, WireError> {
    let mut r = BodyReader::new(body);
    let original_opcode = r.read_i32("originalOpcode")?;
    let uncompressed_size = r.read_i32("uncompressedSize")?;
    let compressor = Compressor::from_id(r.read_u8("compressorId")?)?;
    let payload = r.rest();

    let decompressed = compressor.decompress(payload, uncompressed_size)?;

    // Re-frame the payload under a synthetic header and decode it as a full message.
    let inner_header = RawHeader {
        message_length: (decompressed.len() + HEADER_LEN) as i32,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_opcode,
    };
    inner_header.validate_length()?;
    let mut framed = BytesMut::with_capacity(decompressed.len() + HEADER_LEN);
    inner_header.write_to(&mut framed);
    framed.put_slice(&decompressed);

    let inner = decode_message(&framed)?;
    Ok(OpCompressed {
        compressor,
        inner: Box::new(inner.body),
    })
}

/// Encodes a header and body, patching `messageLength` from the result.
pub fn encode_message(header: MessageHeader, body: &Message) -> Result<BytesMut, WireError> {
    let mut buf = BytesMut::with_capacity(256);
    RawHeader {
        message_length: 0,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: body.op_code().code(),
    }
    .write_to(&mut buf);

    let mut checksum = false;
    match body {
        Message::Query(m) => encode_query(m, &mut buf)?,
        Message::GetMore(m) => encode_get_more(m, &mut buf),
        Message::KillCursors(m) => encode_kill_cursors(m, &mut buf),
        Message::Reply(m) => encode_reply(m, &mut buf)?,
        Message::Msg(m) => {
            encode_msg(m, &mut buf)?;
            checksum = m.flags.checksum_present();
        }
        Message::Compressed(m) => encode_compressed(header, m, &mut buf)?,
    }

    let total = buf.len() + if checksum { 4 } else { 0 };
    if total > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge {
            size: total,
            max: MAX_MESSAGE_SIZE,
        });
    }
    buf[0..4].copy_from_slice(&(total as i32).to_le_bytes());

    if checksum {
        let crc = crc32c::crc32c(&buf);
        buf.put_u32_le(crc);
    }

    Ok(buf)
}

fn encode_query(m: &OpQuery, buf: &mut BytesMut) -> Result<(), WireError> {
    buf.put_i32_le(m.flags.bits());
    put_cstring(buf, &m.full_collection_name);
    buf.put_i32_le(m.number_to_skip);
    buf.put_i32_le(m.number_to_return);
    put_document(buf, &m.query)?;
    if let Some(selector) = &m.return_fields_selector {
        put_document(buf, selector)?;
    }
    Ok(())
}

fn encode_get_more(m: &OpGetMore, buf: &mut BytesMut) {
    buf.put_i32_le(m.flags);
    put_cstring(buf, &m.full_collection_name);
    buf.put_i32_le(m.number_to_return);
    buf.put_i64_le(m.cursor_id);
}

fn encode_kill_cursors(m: &OpKillCursors, buf: &mut BytesMut) {
    buf.put_i32_le(0);
    buf.put_i32_le(m.cursor_ids.len() as i32);
    for id in &m.cursor_ids {
        buf.put_i64_le(*id);
    }
}

fn encode_reply(m: &OpReply, buf: &mut BytesMut) -> Result<(), WireError> {
    buf.put_i32_le(m.flags);
    buf.put_i64_le(m.cursor_id);
    buf.put_i32_le(m.starting_from);
    buf.put_i32_le(m.documents.len() as i32);
    for doc in &m.documents {
        put_document(buf, doc)?;
    }
    Ok(())
}

fn encode_msg(m: &OpMsg, buf: &mut BytesMut) -> Result<(), WireError> {
    buf.put_u32_le(m.flags.bits());
    for section in &m.sections {
        match section {
            MsgSection::Body(doc) => {
                buf.put_u8(0);
                put_document(buf, doc)?;
            }
            MsgSection::DocumentSequence {
                identifier,
                documents,
            } => {
                buf.put_u8(1);
                let size_at = buf.len();
                buf.put_i32_le(0);
                put_cstring(buf, identifier);
                for doc in documents {
                    put_document(buf, doc)?;
                }
                let size = (buf.len() - size_at) as i32;
                buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
            }
        }
    }
    Ok(())
}

fn encode_compressed(
    header: MessageHeader,
    m: &OpCompressed,
    buf: &mut BytesMut,
) -> Result<(), WireError> {
    let inner = encode_message(header, &m.inner)?;
    let uncompressed = &inner[HEADER_LEN..];
    let compressed = m.compressor.compress(uncompressed)?;

    buf.reserve(COMPRESSED_PREFIX_LEN + compressed.len());
    buf.put_i32_le(m.inner.op_code().code());
    buf.put_i32_le(uncompressed.len() as i32);
    buf.put_u8(m.compressor.id());
    buf.put_slice(&compressed);
    Ok(())
}

fn put_cstring(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

fn put_document(buf: &mut BytesMut, doc: &Document) -> Result<(), WireError> {
    let mut writer = buf.writer();
    doc.to_writer(&mut writer)?;
    Ok(())
}

/// Bounded little-endian reader over one message body.
struct BodyReader<'a> {
    buf: &'a [u8],
}

impl<'a> BodyReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn ensure(&self, n: usize, what: &'static str) -> Result<(), WireError> {
        if self.buf.len() < n {
            return Err(WireError::Truncated {
                what,
                needed: n - self.buf.len(),
            });
        }
        Ok(())
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        self.ensure(n, "section")?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn rest(&mut self) -> &'a [u8] {
        std::mem::take(&mut self.buf)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, WireError> {
        self.ensure(1, what)?;
        Ok(self.buf.get_u8())
    }

    fn read_i32(&mut self, what: &'static str) -> Result<i32, WireError> {
        self.ensure(4, what)?;
        Ok(self.buf.get_i32_le())
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, WireError> {
        self.ensure(4, what)?;
        Ok(self.buf.get_u32_le())
    }

    fn read_i64(&mut self, what: &'static str) -> Result<i64, WireError> {
        self.ensure(8, what)?;
        Ok(self.buf.get_i64_le())
    }

    fn read_cstring(&mut self) -> Result<String, WireError> {
        let nul = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or(WireError::UnterminatedCString)?;
        let s = std::str::from_utf8(&self.buf[..nul]).map_err(|_| WireError::InvalidUtf8)?;
        let s = s.to_string();
        self.buf = &self.buf[nul + 1..];
        Ok(s)
    }

    /// Reads one length-prefixed document.
    fn read_document(&mut self) -> Result<Document, WireError> {
        self.ensure(4, "document length")?;
        let len = (&self.buf[..4]).get_i32_le();
        // Smallest document is the empty one: length prefix plus terminator.
        if len < 5 {
            return Err(WireError::InvalidDocumentLength(len));
        }
        self.ensure(len as usize, "document")?;
        let (raw, tail) = self.buf.split_at(len as usize);
        let doc = Document::from_reader(raw)?;
        self.buf = tail;
        Ok(doc)
    }

    fn finish(&self, what: &'static str) -> Result<(), WireError> {
        if !self.buf.is_empty() {
            return Err(WireError::TrailingBytes {
                what,
                remaining: self.buf.len(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn header() -> MessageHeader {
        MessageHeader::new(42, 0)
    }

    fn roundtrip(body: impl Into<Message>) -> WireMessage {
        let message = WireMessage::new(header(), body);
        let encoded = Encoder::encode(&message).unwrap();
        let len = i32::from_le_bytes(encoded[0..4].try_into().unwrap());
        assert_eq!(len as usize, encoded.len());
        let decoded = decode_message(&encoded).unwrap();
        assert_eq!(decoded, message);
        decoded
    }

    fn sample_query() -> OpQuery {
        OpQuery {
            flags: QueryFlags::new().with(QueryFlags::SLAVE_OK),
            full_collection_name: "test.users".to_string(),
            number_to_skip: 3,
            number_to_return: -5,
            query: doc! {"name": "ada"},
            return_fields_selector: Some(doc! {"_id": 0}),
        }
    }

    #[test]
    fn test_query_roundtrip() {
        roundtrip(sample_query());
        let mut no_selector = sample_query();
        no_selector.return_fields_selector = None;
        no_selector.query = doc! {};
        roundtrip(no_selector);
    }

    #[test]
    fn test_get_more_roundtrip() {
        for cursor_id in [i64::MIN, -1, 0, 1, i64::MAX] {
            roundtrip(OpGetMore {
                flags: 0,
                full_collection_name: "test.users".to_string(),
                number_to_return: 10,
                cursor_id,
            });
        }
    }

    #[test]
    fn test_kill_cursors_roundtrip() {
        roundtrip(OpKillCursors { cursor_ids: vec![] });
        roundtrip(OpKillCursors {
            cursor_ids: vec![i64::MIN, 42, i64::MAX],
        });
    }

    #[test]
    fn test_reply_roundtrip() {
        roundtrip(OpReply::default());
        roundtrip(OpReply {
            flags: OpReply::AWAIT_CAPABLE,
            cursor_id: i64::MAX,
            starting_from: 100,
            documents: vec![doc! {"a": 1}, doc! {}, doc! {"b": {"c": [1, 2]}}],
        });
    }

    #[test]
    fn test_msg_roundtrip() {
        roundtrip(OpMsg::reply(doc! {"ok": 1}));
        roundtrip(OpMsg {
            flags: MsgFlags::new().with_checksum(),
            sections: vec![
                MsgSection::Body(doc! {"insert": "users", "$db": "test"}),
                MsgSection::DocumentSequence {
                    identifier: "documents".to_string(),
                    documents: vec![doc! {"_id": 1}, doc! {"_id": 2}],
                },
                MsgSection::DocumentSequence {
                    identifier: "empty".to_string(),
                    documents: vec![],
                },
            ],
        });
    }

    #[test]
    fn test_compressed_roundtrip() {
        for compressor in Compressor::ALL {
            roundtrip(OpCompressed::new(
                compressor,
                OpMsg {
                    flags: MsgFlags::new().with_checksum(),
                    sections: vec![MsgSection::Body(doc! {"ping": 1, "$db": "admin"})],
                },
            ));
            roundtrip(OpCompressed::new(compressor, sample_query()));
        }
    }

    #[test]
    fn test_nested_compressed_roundtrip() {
        let inner = OpCompressed::new(Compressor::Snappy, OpMsg::reply(doc! {"ok": 1}));
        roundtrip(OpCompressed::new(Compressor::Zlib, inner));
    }

    #[test]
    fn test_checksum_enforced() {
        let message = WireMessage::new(
            header(),
            OpMsg {
                flags: MsgFlags::new().with_checksum(),
                sections: vec![MsgSection::Body(doc! {"find": "users", "$db": "test"})],
            },
        );
        let mut encoded = Encoder::encode(&message).unwrap();
        assert!(decode_message(&encoded).is_ok());

        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_checksum_covers_header() {
        let message = WireMessage::new(
            header(),
            OpMsg {
                flags: MsgFlags::new().with_checksum(),
                sections: vec![MsgSection::Body(doc! {"ping": 1})],
            },
        );
        let mut encoded = Encoder::encode(&message).unwrap();
        // Flip a bit in requestID.
        encoded[4] ^= 0x01;
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_unknown_section_kind() {
        let mut encoded =
            Encoder::encode(&WireMessage::new(header(), OpMsg::reply(doc! {"a": 1}))).unwrap();
        encoded[HEADER_LEN + 4] = 7;
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::UnknownSectionKind(7))
        ));
    }

    #[test]
    fn test_bad_document_length() {
        let mut encoded =
            Encoder::encode(&WireMessage::new(header(), OpMsg::reply(doc! {"a": 1}))).unwrap();
        // Document length prefix directly after flags and kind byte.
        let at = HEADER_LEN + 5;
        encoded[at..at + 4].copy_from_slice(&1000i32.to_le_bytes());
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::Truncated { .. })
        ));

        encoded[at..at + 4].copy_from_slice(&2i32.to_le_bytes());
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::InvalidDocumentLength(2))
        ));
    }

    #[test]
    fn test_unknown_opcode_rejected() {
        let mut encoded =
            Encoder::encode(&WireMessage::new(header(), OpKillCursors::default())).unwrap();
        encoded[12..16].copy_from_slice(&2002i32.to_le_bytes());
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::UnknownOpCode(2002))
        ));
    }

    #[test]
    fn test_kill_cursors_count_overflow() {
        let mut encoded = Encoder::encode(&WireMessage::new(
            header(),
            OpKillCursors {
                cursor_ids: vec![1],
            },
        ))
        .unwrap();
        encoded[HEADER_LEN + 4..HEADER_LEN + 8].copy_from_slice(&5i32.to_le_bytes());
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::InvalidCursorCount(5))
        ));
    }

    #[test]
    fn test_unknown_compressor() {
        let mut encoded = Encoder::encode(&WireMessage::new(
            header(),
            OpCompressed::new(Compressor::Noop, OpMsg::reply(doc! {"ok": 1})),
        ))
        .unwrap();
        encoded[HEADER_LEN + 8] = 42;
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::UnknownCompressor(42))
        ));
    }

    #[test]
    fn test_stream_decoder_partial() {
        let first = Encoder::encode(&WireMessage::new(
            MessageHeader::new(1, 0),
            OpMsg::reply(doc! {"ping": 1}),
        ))
        .unwrap();
        let second = Encoder::encode(&WireMessage::new(
            MessageHeader::new(2, 0),
            OpKillCursors {
                cursor_ids: vec![9],
            },
        ))
        .unwrap();

        let mut decoder = Decoder::new();
        decoder.extend(&first[..10]);
        assert!(decoder.decode().unwrap().is_none());
        decoder.extend(&first[10..]);
        decoder.extend(&second[..20]);

        let m1 = decoder.decode().unwrap().unwrap();
        assert_eq!(m1.header.request_id, 1);
        assert!(decoder.decode().unwrap().is_none());
        assert!(decoder.has_partial());

        decoder.extend(&second[20..]);
        let m2 = decoder.decode().unwrap().unwrap();
        assert_eq!(m2.op_code(), OpCode::KillCursors);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_trailing_bytes_in_body() {
        let mut encoded = Encoder::encode(&WireMessage::new(
            header(),
            OpGetMore {
                flags: 0,
                full_collection_name: "a.b".to_string(),
                number_to_return: 0,
                cursor_id: 1,
            },
        ))
        .unwrap();
        encoded.put_u8(0);
        let len = encoded.len() as i32;
        encoded[0..4].copy_from_slice(&len.to_le_bytes());
        assert!(matches!(
            decode_message(&encoded),
            Err(WireError::TrailingBytes { .. })
        ));
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        fn arb_doc() -> impl Strategy<Value = Document> {
            proptest::collection::vec(("[a-z]{1,6}", any::<i64>()), 0..6).prop_map(|pairs| {
                let mut d = Document::new();
                for (k, v) in pairs {
                    d.insert(k, v);
                }
                d
            })
        }

        proptest! {
            #[test]
            fn prop_msg_length_matches_header(
                request_id in any::<i32>(),
                body in arb_doc(),
                seq in proptest::collection::vec(arb_doc(), 0..4),
                checksum in any::<bool>(),
            ) {
                let mut flags = MsgFlags::new();
                if checksum {
                    flags = flags.with_checksum();
                }
                let message = WireMessage::new(
                    MessageHeader::new(request_id, 0),
                    OpMsg {
                        flags,
                        sections: vec![
                            MsgSection::Body(body),
                            MsgSection::DocumentSequence {
                                identifier: "documents".to_string(),
                                documents: seq,
                            },
                        ],
                    },
                );
                let encoded = Encoder::encode(&message).unwrap();
                let len = i32::from_le_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]);
                prop_assert_eq!(len as usize, encoded.len());
                prop_assert_eq!(decode_message(&encoded).unwrap(), message);
            }

            #[test]
            fn prop_query_roundtrip(
                flags in any::<i32>(),
                skip in any::<i32>(),
                ret in any::<i32>(),
                ns in "[a-z]{1,8}\\.[a-z$]{1,8}",
                query in arb_doc(),
            ) {
                let message = WireMessage::new(
                    MessageHeader::new(1, 0),
                    OpQuery {
                        flags: QueryFlags::from_bits(flags),
                        full_collection_name: ns,
                        number_to_skip: skip,
                        number_to_return: ret,
                        query,
                        return_fields_selector: None,
                    },
                );
                let encoded = Encoder::encode(&message).unwrap();
                prop_assert_eq!(decode_message(&encoded).unwrap(), message);
            }

            #[test]
            fn prop_decoder_rejects_garbage_without_panicking(
                data in proptest::collection::vec(any::<u8>(), 0..512)
            ) {
                let mut decoder = Decoder::new();
                decoder.extend(&data);
                let _ = decoder.decode();
            }
        }
    }
}
