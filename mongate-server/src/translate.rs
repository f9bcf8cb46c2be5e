//! Legacy query translation.
//!
//! `OP_QUERY`, `OP_GET_MORE` and `OP_KILL_CURSORS` are rewritten into
//! canonical command documents so every request takes the same dispatch
//! path; canonical cursor responses are rewritten back into `OP_REPLY`.
//! `OP_MSG` section merging lives here too.

use crate::command::{as_i64, is_ok};
use crate::cursor::{CursorCache, CursorHandle, EXHAUSTED_CURSOR_ID};
use crate::error::{Result, ServerError};
use bson::{doc, Bson, Document};
use mongate_wire::{ErrorCode, MsgSection, OpGetMore, OpKillCursors, OpMsg, OpQuery, OpReply};

/// Collection name that marks a legacy query as a command.
pub const COMMAND_COLLECTION: &str = "$cmd";

/// Database named in translated `killCursors` commands. The legacy message
/// does not carry one.
pub const KILL_CURSORS_DATABASE: &str = "admin";

/// Top-level keys that switch a legacy query document into modifier form
/// (`{$query: ..., $orderby: ...}`).
const QUERY_MODIFIERS: &[&str] = &[
    "$query",
    "$orderby",
    "$maxTimeMS",
    "$hint",
    "$snapshot",
    "$comment",
    "$collation",
    "$readPreference",
    "$explain",
];

/// How a translated query's response must be shaped for the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyShape {
    /// `db.$cmd` query: the response is returned as one document.
    /// `unwrap_aggregate` is set for an `aggregate` sent without a cursor
    /// request, whose first batch is returned as `{ok: 1, result: [...]}`.
    Command { unwrap_aggregate: bool },
    /// Find query: the first batch becomes the reply's documents.
    Find,
    /// Find query with `$explain`: the explain output is returned as is.
    Explain,
}

/// A legacy query rewritten as a command.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryTranslation {
    pub command: Document,
    pub shape: ReplyShape,
}

fn split_namespace(ns: &str) -> Result<(&str, &str)> {
    match ns.split_once('.') {
        Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok((db, coll)),
        _ => Err(ServerError::command(
            ErrorCode::InvalidNamespace,
            format!("invalid namespace '{}'", ns),
        )),
    }
}

/// Translates an `OP_QUERY`.
///
/// Errors are command errors meant to be answered inline.
pub fn translate_query(query: &OpQuery) -> Result<QueryTranslation> {
    let (db, coll) = split_namespace(&query.full_collection_name)?;

    if coll == COMMAND_COLLECTION {
        return translate_command_query(query, db);
    }
    // Pseudo-commands such as `admin.$cmd.sys.inprog`.
    if coll.starts_with(COMMAND_COLLECTION) {
        return Err(ServerError::command(
            ErrorCode::CommandNotFound,
            "no such command",
        ));
    }

    translate_find_query(query, db, coll)
}

fn translate_command_query(query: &OpQuery, db: &str) -> Result<QueryTranslation> {
    let mut iter = query.query.iter();
    let Some((first_key, first_value)) = iter.next() else {
        return Err(ServerError::command(
            ErrorCode::FailedToParse,
            "empty command document",
        ));
    };

    // `{$query: {count: "c"}, $readPreference: ...}` wraps the command.
    let mut command = if first_key.starts_with('$') {
        let Bson::Document(inner) = first_value else {
            return Err(ServerError::command(
                ErrorCode::FailedToParse,
                format!("field '{}' must be of type document", first_key),
            ));
        };
        let mut command = inner.clone();
        for (k, v) in iter {
            command.insert(k.clone(), v.clone());
        }
        command
    } else {
        query.query.clone()
    };

    command.insert("$db", db);
    if query.number_to_skip > 0 {
        command.insert("skip", query.number_to_skip);
    }
    // numberToReturn bounds the reply's document count, which is always one
    // for a command.
    if let Some(projection) = non_empty(&query.return_fields_selector) {
        command.insert("projection", projection.clone());
    }

    let name = command.keys().next().cloned().unwrap_or_default();
    if query.flags.slave_ok() && matches!(name.as_str(), "count" | "distinct") {
        command.insert("readPreference", secondary_preferred());
    }

    let unwrap_aggregate = name == "aggregate"
        && !command.contains_key("cursor")
        && !command.contains_key("useCursor");

    Ok(QueryTranslation {
        command,
        shape: ReplyShape::Command { unwrap_aggregate },
    })
}

fn translate_find_query(query: &OpQuery, db: &str, coll: &str) -> Result<QueryTranslation> {
    if query.flags.exhaust() {
        return Err(ServerError::command(
            ErrorCode::CommandNotSupported,
            "exhaust queries are not supported",
        ));
    }

    let mut command = doc! { "find": coll, "$db": db };
    let mut explain = false;

    let modifier_form = query
        .query
        .keys()
        .next()
        .is_some_and(|k| QUERY_MODIFIERS.contains(&k.as_str()));

    if modifier_form {
        let mut filter = Document::new();
        let mut extra = Document::new();
        for (key, value) in &query.query {
            match key.as_str() {
                "$query" | "query" => match value {
                    Bson::Document(d) => filter = d.clone(),
                    _ => {
                        return Err(ServerError::command(
                            ErrorCode::FailedToParse,
                            "field '$query' must be of type document",
                        ))
                    }
                },
                "$orderby" | "orderby" => {
                    extra.insert("sort", value.clone());
                }
                "$maxTimeMS" | "$hint" | "$snapshot" | "$comment" | "$collation" => {
                    extra.insert(&key[1..], value.clone());
                }
                "hint" | "snapshot" | "$readPreference" | "readPreference" | "comment"
                | "collation" => {
                    extra.insert(key.clone(), value.clone());
                }
                "$explain" => explain = truthy(value),
                other => {
                    return Err(ServerError::command(
                        ErrorCode::FailedToParse,
                        format!("unsupported query modifier '{}'", other),
                    ))
                }
            }
        }
        if let Some(Bson::Boolean(true)) = filter.remove("$explain") {
            explain = true;
        }
        command.insert("filter", filter);
        for (key, value) in extra {
            command.insert(key, value);
        }
    } else {
        let mut filter = query.query.clone();
        if let Some(Bson::Boolean(true)) = filter.remove("$explain") {
            explain = true;
        }
        command.insert("filter", filter);
    }

    if query.number_to_skip > 0 {
        command.insert("skip", query.number_to_skip);
    }
    match query.number_to_return {
        n if n > 0 => {
            command.insert("batchSize", n);
        }
        n if n < 0 => {
            command.insert("batchSize", n.saturating_neg());
            command.insert("singleBatch", true);
        }
        _ => {}
    }
    if let Some(projection) = non_empty(&query.return_fields_selector) {
        command.insert("projection", projection.clone());
    }

    let flags = query.flags;
    if flags.tailable_cursor() {
        command.insert("tailable", true);
    }
    if flags.slave_ok() {
        command.insert("readPreference", secondary_preferred());
    }
    if flags.oplog_replay() {
        command.insert("oplogReplay", true);
    }
    if flags.no_cursor_timeout() {
        command.insert("noCursorTimeout", true);
    }
    if flags.await_data() {
        command.insert("awaitData", true);
    }
    if flags.partial() {
        command.insert("allowPartialResults", true);
    }

    if explain {
        return Ok(QueryTranslation {
            command: doc! { "explain": command, "$db": db },
            shape: ReplyShape::Explain,
        });
    }

    Ok(QueryTranslation {
        command,
        shape: ReplyShape::Find,
    })
}

/// Translates an `OP_GET_MORE`.
pub fn translate_get_more(get_more: &OpGetMore) -> Result<Document> {
    let (db, coll) = split_namespace(&get_more.full_collection_name)?;
    Ok(doc! {
        "getMore": get_more.cursor_id,
        "batchSize": get_more.number_to_return,
        "$db": db,
        "collection": coll,
    })
}

/// Translates an `OP_KILL_CURSORS`.
pub fn translate_kill_cursors(kill: &OpKillCursors) -> Document {
    doc! {
        "killCursors": KILL_CURSORS_DATABASE,
        "cursors": kill.cursor_ids.clone(),
    }
}

/// Merges `OP_MSG` sections into one command document: the body first, then
/// each document sequence as an array under its identifier.
pub fn merge_sections(msg: &OpMsg) -> Result<Document> {
    let mut command = msg.body().cloned().unwrap_or_default();
    for section in &msg.sections {
        if let MsgSection::DocumentSequence {
            identifier,
            documents,
        } = section
        {
            if identifier.contains('.') {
                return Err(ServerError::command(
                    ErrorCode::CommandNotSupported,
                    format!("nested document sequence identifier '{}'", identifier),
                ));
            }
            let items: Vec<Bson> = documents.iter().cloned().map(Bson::Document).collect();
            command.insert(identifier.clone(), items);
        }
    }
    if command.is_empty() {
        return Err(ServerError::command(
            ErrorCode::FailedToParse,
            "OP_MSG carries no command document",
        ));
    }
    Ok(command)
}

/// Shapes the response to a translated query as an `OP_REPLY`.
///
/// Documents returned in a first batch are added to the cursor's `consumed`
/// count.
pub fn query_reply(
    shape: ReplyShape,
    response: Document,
    cursors: &dyn CursorCache,
) -> Result<OpReply> {
    if !is_ok(&response) {
        return Ok(OpReply::single(response));
    }

    match shape {
        ReplyShape::Explain => Ok(OpReply::single(response)),
        ReplyShape::Command { unwrap_aggregate } => {
            let Some(cursor) = cursor_document(&response)? else {
                return Ok(OpReply::single(response));
            };
            let batch = batch(cursor, "firstBatch")?;
            if let Some(count) = batch.map(|b| b.len()) {
                record_consumed(cursors, cursor_id(cursor), count);
            }
            if unwrap_aggregate {
                let Some(batch) = batch else {
                    return Err(ServerError::Internal(
                        "missing firstBatch in cursor response".to_string(),
                    ));
                };
                return Ok(OpReply::single(doc! { "ok": 1, "result": batch.to_vec() }));
            }
            Ok(OpReply::single(response))
        }
        ReplyShape::Find => {
            let mut reply = OpReply::default();
            if let Some(cursor) = cursor_document(&response)? {
                reply.cursor_id = cursor_id(cursor);
                if let Some(batch) = batch(cursor, "firstBatch")? {
                    reply.documents = documents(batch)?;
                    record_consumed(cursors, reply.cursor_id, reply.documents.len());
                }
            }
            Ok(reply)
        }
    }
}

/// Shapes a `getMore` response as an `OP_REPLY`.
///
/// `entry` is the cursor's cache entry, taken before the command ran so the
/// count survives the entry being closed by an exhausted response.
pub fn get_more_reply(response: Document, entry: &CursorHandle) -> Result<OpReply> {
    if !is_ok(&response) {
        return Ok(OpReply::single(response));
    }

    let mut reply = OpReply::default();
    if let Some(cursor) = cursor_document(&response)? {
        reply.cursor_id = cursor_id(cursor);
        if let Some(batch) = batch(cursor, "nextBatch")? {
            reply.documents = documents(batch)?;
        }
    }

    let mut entry = entry.lock();
    reply.starting_from = i32::try_from(entry.consumed).unwrap_or(i32::MAX);
    entry.consumed += reply.documents.len();
    Ok(reply)
}

fn record_consumed(cursors: &dyn CursorCache, id: i64, count: usize) {
    if id != EXHAUSTED_CURSOR_ID {
        cursors.get(id).lock().consumed += count;
    }
}

fn cursor_document(response: &Document) -> Result<Option<&Document>> {
    match response.get("cursor") {
        None => Ok(None),
        Some(Bson::Document(cursor)) => Ok(Some(cursor)),
        Some(_) => Err(ServerError::Internal("wrong type for cursor".to_string())),
    }
}

/// Returns `cursor.id`, or 0 when absent.
pub fn cursor_id(cursor: &Document) -> i64 {
    cursor.get("id").and_then(as_i64).unwrap_or(EXHAUSTED_CURSOR_ID)
}

fn batch<'a>(cursor: &'a Document, key: &str) -> Result<Option<&'a [Bson]>> {
    match cursor.get(key) {
        None => Ok(None),
        Some(Bson::Array(items)) => Ok(Some(items.as_slice())),
        Some(_) => Err(ServerError::Internal(format!("wrong type for cursor.{}", key))),
    }
}

fn documents(batch: &[Bson]) -> Result<Vec<Document>> {
    batch
        .iter()
        .map(|item| match item {
            Bson::Document(d) => Ok(d.clone()),
            _ => Err(ServerError::Internal(
                "cursor batch holds a non-document".to_string(),
            )),
        })
        .collect()
}

fn non_empty(doc: &Option<Document>) -> Option<&Document> {
    doc.as_ref().filter(|d| !d.is_empty())
}

fn secondary_preferred() -> Document {
    doc! { "mode": "secondaryPreferred" }
}

fn truthy(value: &Bson) -> bool {
    match value {
        Bson::Boolean(b) => *b,
        other => as_i64(other).is_some_and(|n| n != 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::TtlCursorCache;
    use mongate_wire::QueryFlags;
    use std::time::Duration;

    fn op_query(ns: &str, query: Document) -> OpQuery {
        OpQuery {
            flags: QueryFlags::new(),
            full_collection_name: ns.to_string(),
            number_to_skip: 0,
            number_to_return: 0,
            query,
            return_fields_selector: None,
        }
    }

    fn cache() -> TtlCursorCache {
        TtlCursorCache::new(Duration::from_secs(60))
    }

    #[test]
    fn test_plain_find() {
        let t = translate_query(&op_query("test.users", doc! {"age": {"$gt": 3}})).unwrap();
        assert_eq!(t.shape, ReplyShape::Find);
        assert_eq!(
            t.command,
            doc! {"find": "users", "$db": "test", "filter": {"age": {"$gt": 3}}}
        );
    }

    #[test]
    fn test_batch_size_translation() {
        let mut q = op_query("test.users", doc! {});
        q.number_to_return = -5;
        let t = translate_query(&q).unwrap();
        assert_eq!(t.command.get_i32("batchSize").unwrap(), 5);
        assert!(t.command.get_bool("singleBatch").unwrap());

        q.number_to_return = 0;
        let t = translate_query(&q).unwrap();
        assert!(!t.command.contains_key("batchSize"));
        assert!(!t.command.contains_key("singleBatch"));

        q.number_to_return = 7;
        q.number_to_skip = 3;
        let t = translate_query(&q).unwrap();
        assert_eq!(t.command.get_i32("batchSize").unwrap(), 7);
        assert_eq!(t.command.get_i32("skip").unwrap(), 3);
        assert!(!t.command.contains_key("singleBatch"));
    }

    #[test]
    fn test_modifier_form() {
        let q = op_query(
            "test.users",
            doc! {
                "$query": {"a": 1},
                "$orderby": {"b": -1},
                "$maxTimeMS": 500,
                "$hint": "a_1",
                "comment": "hello",
            },
        );
        let t = translate_query(&q).unwrap();
        assert_eq!(
            t.command,
            doc! {
                "find": "users",
                "$db": "test",
                "filter": {"a": 1},
                "sort": {"b": -1},
                "maxTimeMS": 500,
                "hint": "a_1",
                "comment": "hello",
            }
        );
    }

    #[test]
    fn test_filter_operators_are_not_modifiers() {
        let q = op_query("test.users", doc! {"$or": [{"a": 1}, {"b": 2}]});
        let t = translate_query(&q).unwrap();
        assert_eq!(
            t.command.get_document("filter").unwrap(),
            &doc! {"$or": [{"a": 1}, {"b": 2}]}
        );
    }

    #[test]
    fn test_unknown_modifier() {
        let q = op_query("test.users", doc! {"$query": {}, "$frob": 1});
        let err = translate_query(&q).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedToParse);
    }

    #[test]
    fn test_explain() {
        let q = op_query("test.users", doc! {"a": 1, "$explain": true});
        let t = translate_query(&q).unwrap();
        assert_eq!(t.shape, ReplyShape::Explain);
        assert_eq!(
            t.command,
            doc! {
                "explain": {"find": "users", "$db": "test", "filter": {"a": 1}},
                "$db": "test",
            }
        );

        let q = op_query("test.users", doc! {"$query": {"a": 1}, "$explain": true});
        assert_eq!(translate_query(&q).unwrap().shape, ReplyShape::Explain);
    }

    #[test]
    fn test_flags() {
        let mut q = op_query("test.users", doc! {});
        q.flags = QueryFlags::new()
            .with(QueryFlags::TAILABLE_CURSOR)
            .with(QueryFlags::SLAVE_OK)
            .with(QueryFlags::OPLOG_REPLAY)
            .with(QueryFlags::NO_CURSOR_TIMEOUT)
            .with(QueryFlags::AWAIT_DATA)
            .with(QueryFlags::PARTIAL);
        let c = translate_query(&q).unwrap().command;
        assert!(c.get_bool("tailable").unwrap());
        assert_eq!(
            c.get_document("readPreference").unwrap(),
            &doc! {"mode": "secondaryPreferred"}
        );
        assert!(c.get_bool("oplogReplay").unwrap());
        assert!(c.get_bool("noCursorTimeout").unwrap());
        assert!(c.get_bool("awaitData").unwrap());
        assert!(c.get_bool("allowPartialResults").unwrap());
    }

    #[test]
    fn test_exhaust_rejected() {
        let mut q = op_query("test.users", doc! {});
        q.flags = QueryFlags::new().with(QueryFlags::EXHAUST);
        let err = translate_query(&q).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CommandNotSupported);
    }

    #[test]
    fn test_projection() {
        let mut q = op_query("test.users", doc! {});
        q.return_fields_selector = Some(doc! {});
        assert!(!translate_query(&q).unwrap().command.contains_key("projection"));

        q.return_fields_selector = Some(doc! {"name": 1});
        let c = translate_query(&q).unwrap().command;
        assert_eq!(c.get_document("projection").unwrap(), &doc! {"name": 1});
    }

    #[test]
    fn test_command_query() {
        let mut q = op_query("admin.$cmd", doc! {"isMaster": 1});
        q.number_to_return = -1;
        let t = translate_query(&q).unwrap();
        assert_eq!(t.command, doc! {"isMaster": 1, "$db": "admin"});
        assert_eq!(
            t.shape,
            ReplyShape::Command {
                unwrap_aggregate: false
            }
        );
    }

    #[test]
    fn test_wrapped_command_query() {
        let mut q = op_query(
            "test.$cmd",
            doc! {"$query": {"count": "users"}, "$readPreference": {"mode": "secondary"}},
        );
        q.flags = QueryFlags::new().with(QueryFlags::SLAVE_OK);
        let c = translate_query(&q).unwrap().command;
        assert_eq!(
            c,
            doc! {
                "count": "users",
                "$readPreference": {"mode": "secondary"},
                "$db": "test",
                "readPreference": {"mode": "secondaryPreferred"},
            }
        );
    }

    #[test]
    fn test_aggregate_without_cursor() {
        let q = op_query("test.$cmd", doc! {"aggregate": "users", "pipeline": []});
        let t = translate_query(&q).unwrap();
        assert_eq!(
            t.shape,
            ReplyShape::Command {
                unwrap_aggregate: true
            }
        );

        let cursors = cache();
        let response = doc! {
            "cursor": {"id": 9i64, "ns": "test.users", "firstBatch": [{"a": 1}, {"a": 2}]},
            "ok": 1,
        };
        let reply = query_reply(t.shape, response, &cursors).unwrap();
        assert_eq!(
            reply.documents,
            vec![doc! {"ok": 1, "result": [{"a": 1}, {"a": 2}]}]
        );
        assert_eq!(reply.cursor_id, 0);
        assert_eq!(cursors.get(9).lock().consumed, 2);

        let q = op_query(
            "test.$cmd",
            doc! {"aggregate": "users", "pipeline": [], "cursor": {}},
        );
        assert_eq!(
            translate_query(&q).unwrap().shape,
            ReplyShape::Command {
                unwrap_aggregate: false
            }
        );
    }

    #[test]
    fn test_bad_namespaces() {
        let err = translate_query(&op_query("nodot", doc! {})).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidNamespace);

        let err = translate_query(&op_query("admin.$cmd.sys.inprog", doc! {})).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CommandNotFound);

        // Collection names may themselves contain dots.
        let t = translate_query(&op_query("test.system.indexes", doc! {})).unwrap();
        assert_eq!(t.command.get_str("find").unwrap(), "system.indexes");
    }

    #[test]
    fn test_find_reply() {
        let cursors = cache();
        let response = doc! {
            "cursor": {"id": 42i64, "ns": "test.users", "firstBatch": [{"a": 1}, {"a": 2}, {"a": 3}]},
            "ok": 1,
        };
        let reply = query_reply(ReplyShape::Find, response, &cursors).unwrap();
        assert_eq!(reply.cursor_id, 42);
        assert_eq!(reply.starting_from, 0);
        assert_eq!(reply.documents.len(), 3);
        assert_eq!(cursors.get(42).lock().consumed, 3);
    }

    #[test]
    fn test_error_reply_passes_through() {
        let cursors = cache();
        let response = ErrorCode::Unauthorized.error_document("denied");
        let reply = query_reply(ReplyShape::Find, response.clone(), &cursors).unwrap();
        assert_eq!(reply.documents, vec![response]);
        assert!(cursors.is_empty());
    }

    #[test]
    fn test_get_more() {
        let get_more = OpGetMore {
            flags: 0,
            full_collection_name: "test.users".to_string(),
            number_to_return: 10,
            cursor_id: 42,
        };
        assert_eq!(
            translate_get_more(&get_more).unwrap(),
            doc! {"getMore": 42i64, "batchSize": 10, "$db": "test", "collection": "users"}
        );

        let cursors = cache();
        let entry = cursors.get(42);
        entry.lock().consumed = 3;

        let response = doc! {
            "cursor": {"id": 42i64, "ns": "test.users", "nextBatch": [{"a": 4}, {"a": 5}]},
            "ok": 1,
        };
        let reply = get_more_reply(response, &entry).unwrap();
        assert_eq!(reply.starting_from, 3);
        assert_eq!(reply.cursor_id, 42);
        assert_eq!(reply.documents.len(), 2);
        assert_eq!(entry.lock().consumed, 5);

        let response = doc! {
            "cursor": {"id": 0i64, "ns": "test.users", "nextBatch": [{"a": 6}]},
            "ok": 1,
        };
        let reply = get_more_reply(response, &entry).unwrap();
        assert_eq!(reply.starting_from, 5);
        assert_eq!(reply.cursor_id, 0);
    }

    #[test]
    fn test_kill_cursors() {
        let kill = OpKillCursors {
            cursor_ids: vec![1, 2],
        };
        assert_eq!(
            translate_kill_cursors(&kill),
            doc! {"killCursors": "admin", "cursors": [1i64, 2i64]}
        );
    }

    #[test]
    fn test_merge_sections() {
        let msg = OpMsg {
            flags: Default::default(),
            sections: vec![
                MsgSection::DocumentSequence {
                    identifier: "documents".to_string(),
                    documents: vec![doc! {"_id": 1}, doc! {"_id": 2}],
                },
                MsgSection::Body(doc! {"insert": "users", "$db": "test"}),
            ],
        };
        let merged = merge_sections(&msg).unwrap();
        assert_eq!(
            merged,
            doc! {
                "insert": "users",
                "$db": "test",
                "documents": [{"_id": 1}, {"_id": 2}],
            }
        );
        assert_eq!(merged.keys().next().unwrap(), "insert");
    }

    #[test]
    fn test_merge_rejects_dotted_identifier() {
        let msg = OpMsg {
            flags: Default::default(),
            sections: vec![
                MsgSection::Body(doc! {"update": "users"}),
                MsgSection::DocumentSequence {
                    identifier: "a.b".to_string(),
                    documents: vec![],
                },
            ],
        };
        assert!(merge_sections(&msg).is_err());
        assert!(merge_sections(&OpMsg::default()).is_err());
    }
}
