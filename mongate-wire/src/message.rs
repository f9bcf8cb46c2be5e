//! Message bodies for every supported opcode.

use crate::compression::Compressor;
use crate::header::{MessageHeader, MsgFlags, OpCode, QueryFlags};
use bson::Document;

/// A complete wire message: correlation header plus one body variant.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub header: MessageHeader,
    pub body: Message,
}

impl WireMessage {
    pub fn new(header: MessageHeader, body: impl Into<Message>) -> Self {
        Self {
            header,
            body: body.into(),
        }
    }

    pub fn op_code(&self) -> OpCode {
        self.body.op_code()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Query(OpQuery),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    Reply(OpReply),
    Msg(OpMsg),
    Compressed(OpCompressed),
}

impl Message {
    pub fn op_code(&self) -> OpCode {
        match self {
            Message::Query(_) => OpCode::Query,
            Message::GetMore(_) => OpCode::GetMore,
            Message::KillCursors(_) => OpCode::KillCursors,
            Message::Reply(_) => OpCode::Reply,
            Message::Msg(_) => OpCode::Msg,
            Message::Compressed(_) => OpCode::Compressed,
        }
    }
}

/// Legacy query (`OP_QUERY`).
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub flags: QueryFlags,
    /// `db.collection`, or `db.$cmd` for commands.
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    /// Splits the namespace at the first dot into `(db, collection)`.
    pub fn namespace(&self) -> (&str, &str) {
        split_namespace(&self.full_collection_name)
    }
}

/// Legacy cursor continuation (`OP_GET_MORE`).
#[derive(Debug, Clone, PartialEq)]
pub struct OpGetMore {
    /// Reserved; always zero from conforming clients.
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

impl OpGetMore {
    pub fn namespace(&self) -> (&str, &str) {
        split_namespace(&self.full_collection_name)
    }
}

/// Legacy cursor kill (`OP_KILL_CURSORS`). The cursor count is derived from
/// `cursor_ids` when encoding.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpKillCursors {
    pub cursor_ids: Vec<i64>,
}

/// Legacy reply (`OP_REPLY`). `numberReturned` is derived from `documents`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpReply {
    pub flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    /// Reply flag: the requested cursor id was not found.
    pub const CURSOR_NOT_FOUND: i32 = 1 << 0;
    /// Reply flag: the query failed and the single document is `{$err}`.
    pub const QUERY_FAILURE: i32 = 1 << 1;
    /// Reply flag: the server supports the AwaitData query option.
    pub const AWAIT_CAPABLE: i32 = 1 << 3;

    pub fn single(document: Document) -> Self {
        Self {
            documents: vec![document],
            ..Default::default()
        }
    }
}

/// Modern command message (`OP_MSG`). The checksum is not stored: it is
/// verified on decode and recomputed on encode when the flag is set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OpMsg {
    pub flags: MsgFlags,
    pub sections: Vec<MsgSection>,
}

impl OpMsg {
    /// Builds a reply carrying a single body document.
    pub fn reply(document: Document) -> Self {
        Self {
            flags: MsgFlags::new(),
            sections: vec![MsgSection::Body(document)],
        }
    }

    /// Returns the body section's document, if any.
    pub fn body(&self) -> Option<&Document> {
        self.sections.iter().find_map(|s| match s {
            MsgSection::Body(doc) => Some(doc),
            MsgSection::DocumentSequence { .. } => None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MsgSection {
    /// Kind 0: exactly one document.
    Body(Document),
    /// Kind 1: a named sequence merged into the command under `identifier`.
    DocumentSequence {
        identifier: String,
        documents: Vec<Document>,
    },
}

/// Compression envelope (`OP_COMPRESSED`).
///
/// The wrapped message shares the envelope's request id and response-to;
/// its opcode and uncompressed size are derived from `inner` when encoding.
#[derive(Debug, Clone, PartialEq)]
pub struct OpCompressed {
    pub compressor: Compressor,
    pub inner: Box<Message>,
}

impl OpCompressed {
    pub fn new(compressor: Compressor, inner: impl Into<Message>) -> Self {
        Self {
            compressor,
            inner: Box::new(inner.into()),
        }
    }
}

fn split_namespace(ns: &str) -> (&str, &str) {
    match ns.split_once('.') {
        Some((db, coll)) => (db, coll),
        None => (ns, ""),
    }
}

impl From<OpQuery> for Message {
    fn from(m: OpQuery) -> Self {
        Message::Query(m)
    }
}

impl From<OpGetMore> for Message {
    fn from(m: OpGetMore) -> Self {
        Message::GetMore(m)
    }
}

impl From<OpKillCursors> for Message {
    fn from(m: OpKillCursors) -> Self {
        Message::KillCursors(m)
    }
}

impl From<OpReply> for Message {
    fn from(m: OpReply) -> Self {
        Message::Reply(m)
    }
}

impl From<OpMsg> for Message {
    fn from(m: OpMsg) -> Self {
        Message::Msg(m)
    }
}

impl From<OpCompressed> for Message {
    fn from(m: OpCompressed) -> Self {
        Message::Compressed(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_namespace_split() {
        let q = OpQuery {
            flags: QueryFlags::new(),
            full_collection_name: "test.foo.bar".to_string(),
            number_to_skip: 0,
            number_to_return: 0,
            query: doc! {},
            return_fields_selector: None,
        };
        assert_eq!(q.namespace(), ("test", "foo.bar"));

        let gm = OpGetMore {
            flags: 0,
            full_collection_name: "admin".to_string(),
            number_to_return: 0,
            cursor_id: 1,
        };
        assert_eq!(gm.namespace(), ("admin", ""));
    }

    #[test]
    fn test_msg_body() {
        let msg = OpMsg {
            flags: MsgFlags::new(),
            sections: vec![
                MsgSection::DocumentSequence {
                    identifier: "documents".to_string(),
                    documents: vec![doc! {"a": 1}],
                },
                MsgSection::Body(doc! {"insert": "c"}),
            ],
        };
        assert_eq!(msg.body(), Some(&doc! {"insert": "c"}));
        assert_eq!(OpMsg::default().body(), None);
    }

    #[test]
    fn test_opcode_of_body() {
        let m = WireMessage::new(MessageHeader::new(1, 0), OpMsg::reply(doc! {"ok": 1}));
        assert_eq!(m.op_code(), OpCode::Msg);
        let c = Message::from(OpCompressed::new(Compressor::Zlib, OpReply::default()));
        assert_eq!(c.op_code(), OpCode::Compressed);
    }
}
