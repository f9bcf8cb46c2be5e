//! Command abstraction.
//!
//! A canonical command document names its command with its first key. The
//! gateway parses it into a closed [`Command`] enum: commands the gateway
//! itself has to understand get their own variant, everything else that is
//! registered travels as [`Command::Passthrough`] for backend stages.

use crate::error::{Result, ServerError};
use bson::{Bson, Document};
use mongate_wire::ErrorCode;
use std::collections::HashSet;

/// Database used when a command carries no `$db`.
pub const DEFAULT_DATABASE: &str = "admin";

/// A parsed command.
///
/// Every variant keeps the full command document so stages can mutate it
/// uniformly through [`Command::document_mut`].
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Find(Document),
    Aggregate(Document),
    /// Ids are validated at parse time and read back through
    /// [`Command::cursor_id`] so document rewrites are honoured.
    GetMore(Document),
    KillCursors(Document),
    Explain(Document),
    Ping(Document),
    /// `isMaster`, `ismaster` or `hello`.
    IsMaster {
        compression: Vec<String>,
        document: Document,
    },
    BuildInfo(Document),
    HostInfo(Document),
    ServerStatus(Document),
    IsDbGrid(Document),
    ConnectionStatus(Document),
    Logout(Document),
    WhatsMyUri(Document),
    Passthrough {
        name: String,
        document: Document,
    },
}

impl Command {
    /// Parses a command document by its first key.
    pub fn from_document(document: Document) -> Result<Self> {
        let name = match document.keys().next() {
            Some(name) => name.clone(),
            None => {
                return Err(ServerError::command(
                    ErrorCode::FailedToParse,
                    "empty command document",
                ))
            }
        };

        Ok(match name.as_str() {
            "find" => Command::Find(document),
            "aggregate" => Command::Aggregate(document),
            "getMore" => {
                integer(&document, "getMore")?;
                Command::GetMore(document)
            }
            "killCursors" => {
                cursor_list(&document)?;
                Command::KillCursors(document)
            }
            "explain" => {
                if !matches!(document.get("explain"), Some(Bson::Document(_))) {
                    return Err(parse_error("explain", "document"));
                }
                Command::Explain(document)
            }
            "ping" => Command::Ping(document),
            "isMaster" | "ismaster" | "hello" => {
                let compression = match document.get("compression") {
                    Some(Bson::Array(items)) => items
                        .iter()
                        .map(|c| {
                            c.as_str()
                                .map(str::to_string)
                                .ok_or_else(|| parse_error("compression", "string array"))
                        })
                        .collect::<Result<Vec<_>>>()?,
                    None => Vec::new(),
                    Some(_) => return Err(parse_error("compression", "array")),
                };
                Command::IsMaster {
                    compression,
                    document,
                }
            }
            "buildInfo" | "buildinfo" => Command::BuildInfo(document),
            "hostInfo" => Command::HostInfo(document),
            "serverStatus" => Command::ServerStatus(document),
            "isdbgrid" => Command::IsDbGrid(document),
            "connectionStatus" => Command::ConnectionStatus(document),
            "logout" => Command::Logout(document),
            "whatsmyuri" => Command::WhatsMyUri(document),
            _ => Command::Passthrough { name, document },
        })
    }

    /// Returns the command name (the document's first key).
    pub fn name(&self) -> &str {
        self.document()
            .keys()
            .next()
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn document(&self) -> &Document {
        match self {
            Command::Find(d)
            | Command::Aggregate(d)
            | Command::Explain(d)
            | Command::Ping(d)
            | Command::BuildInfo(d)
            | Command::HostInfo(d)
            | Command::ServerStatus(d)
            | Command::IsDbGrid(d)
            | Command::ConnectionStatus(d)
            | Command::Logout(d)
            | Command::WhatsMyUri(d)
            | Command::GetMore(d)
            | Command::KillCursors(d) => d,
            Command::IsMaster { document, .. }
            | Command::Passthrough { document, .. } => document,
        }
    }

    pub fn document_mut(&mut self) -> &mut Document {
        match self {
            Command::Find(d)
            | Command::Aggregate(d)
            | Command::Explain(d)
            | Command::Ping(d)
            | Command::BuildInfo(d)
            | Command::HostInfo(d)
            | Command::ServerStatus(d)
            | Command::IsDbGrid(d)
            | Command::ConnectionStatus(d)
            | Command::Logout(d)
            | Command::WhatsMyUri(d)
            | Command::GetMore(d)
            | Command::KillCursors(d) => d,
            Command::IsMaster { document, .. }
            | Command::Passthrough { document, .. } => document,
        }
    }

    /// Returns `$db`, or `admin` when unset.
    pub fn target_database(&self) -> &str {
        self.document()
            .get_str("$db")
            .unwrap_or(DEFAULT_DATABASE)
    }

    /// Returns the collection the command operates on, if it names one.
    pub fn target_collection(&self) -> Option<&str> {
        match self {
            Command::GetMore(d) => d.get_str("collection").ok(),
            Command::Explain(d) => d
                .get_document("explain")
                .ok()
                .and_then(|inner| inner.values().next())
                .and_then(Bson::as_str),
            _ => self.document().values().next().and_then(Bson::as_str),
        }
    }

    /// Returns the cursor a `getMore` continues.
    pub fn cursor_id(&self) -> Option<i64> {
        match self {
            Command::GetMore(d) => d.get("getMore").and_then(as_i64),
            _ => None,
        }
    }

    /// Returns the cursors a `killCursors` names. Empty for other commands.
    pub fn cursor_ids(&self) -> Vec<i64> {
        match self {
            Command::KillCursors(d) => cursor_list(d).unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Returns the read preference mode, if one was requested.
    pub fn read_preference_mode(&self) -> Option<&str> {
        let doc = self.document();
        doc.get_document("$readPreference")
            .or_else(|_| doc.get_document("readPreference"))
            .ok()
            .and_then(|rp| rp.get_str("mode").ok())
    }
}

pub(crate) fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int64(v) => Some(*v),
        Bson::Int32(v) => Some(*v as i64),
        Bson::Double(v) if v.fract() == 0.0 => Some(*v as i64),
        _ => None,
    }
}

/// Returns whether a response document reports success.
pub fn is_ok(response: &Document) -> bool {
    match response.get("ok") {
        Some(Bson::Boolean(b)) => *b,
        Some(Bson::Int32(n)) => *n != 0,
        Some(Bson::Int64(n)) => *n != 0,
        Some(Bson::Double(n)) => *n != 0.0,
        _ => false,
    }
}

fn integer(doc: &Document, key: &str) -> Result<i64> {
    doc.get(key)
        .and_then(as_i64)
        .ok_or_else(|| parse_error(key, "integer"))
}

fn cursor_list(doc: &Document) -> Result<Vec<i64>> {
    match doc.get("cursors") {
        Some(Bson::Array(ids)) => ids
            .iter()
            .map(|id| as_i64(id).ok_or_else(|| parse_error("cursors", "integer array")))
            .collect(),
        _ => Err(parse_error("cursors", "array")),
    }
}

fn parse_error(field: &str, expected: &str) -> ServerError {
    ServerError::command(
        ErrorCode::FailedToParse,
        format!("field '{}' must be of type {}", field, expected),
    )
}

/// Names the gateway accepts as commands.
///
/// Built at startup and passed to the gateway; an unregistered first key is
/// answered with `CommandNotFound`.
#[derive(Debug, Clone)]
pub struct CommandRegistry {
    names: HashSet<String>,
}

impl CommandRegistry {
    /// Command names known to the default registry.
    pub const DEFAULT_COMMANDS: &'static [&'static str] = &[
        "aggregate",
        "buildInfo",
        "buildinfo",
        "collStats",
        "connectionStatus",
        "count",
        "create",
        "createIndexes",
        "currentOp",
        "dbStats",
        "dbstats",
        "delete",
        "deleteIndexes",
        "distinct",
        "drop",
        "dropDatabase",
        "dropIndexes",
        "endSessions",
        "explain",
        "find",
        "findAndModify",
        "findandmodify",
        "getMore",
        "getnonce",
        "hello",
        "hostInfo",
        "insert",
        "isMaster",
        "ismaster",
        "isdbgrid",
        "killAllSessions",
        "killCursors",
        "killOp",
        "listCollections",
        "listDatabases",
        "listIndexes",
        "logout",
        "mapReduce",
        "mapreduce",
        "ping",
        "saslStart",
        "serverStatus",
        "shardCollection",
        "update",
        "validate",
        "whatsmyuri",
    ];

    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            names: HashSet::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>) {
        self.names.insert(name.into());
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Parses `document`, rejecting unregistered command names.
    pub fn parse(&self, document: Document) -> Result<Command> {
        match document.keys().next() {
            Some(name) if !self.contains(name) => Err(ServerError::command(
                ErrorCode::CommandNotFound,
                format!("no such command: '{}'", name),
            )),
            _ => Command::from_document(document),
        }
    }
}

impl Default for CommandRegistry {
    fn default() -> Self {
        let mut registry = Self::new();
        for name in Self::DEFAULT_COMMANDS {
            registry.register(*name);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_parse_typed_variants() {
        let cmd = Command::from_document(doc! {"find": "users", "$db": "test"}).unwrap();
        assert!(matches!(cmd, Command::Find(_)));
        assert_eq!(cmd.name(), "find");
        assert_eq!(cmd.target_database(), "test");
        assert_eq!(cmd.target_collection(), Some("users"));

        let cmd = Command::from_document(doc! {"getMore": 42i64, "collection": "users"}).unwrap();
        assert!(matches!(cmd, Command::GetMore(_)));
        assert_eq!(cmd.cursor_id(), Some(42));
        assert_eq!(cmd.target_collection(), Some("users"));
        assert_eq!(cmd.target_database(), "admin");

        let cmd =
            Command::from_document(doc! {"killCursors": "admin", "cursors": [1i64, 2i32]}).unwrap();
        assert!(matches!(cmd, Command::KillCursors(_)));
        assert_eq!(cmd.cursor_ids(), vec![1, 2]);
        assert_eq!(cmd.cursor_id(), None);
    }

    #[test]
    fn test_is_master_aliases() {
        for name in ["isMaster", "ismaster", "hello"] {
            let mut d = Document::new();
            d.insert(name, 1);
            d.insert("compression", vec!["zstd", "snappy"]);
            match Command::from_document(d).unwrap() {
                Command::IsMaster { compression, .. } => {
                    assert_eq!(compression, vec!["zstd".to_string(), "snappy".to_string()])
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_passthrough() {
        let cmd = Command::from_document(doc! {"insert": "users", "documents": []}).unwrap();
        match &cmd {
            Command::Passthrough { name, .. } => assert_eq!(name, "insert"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(cmd.target_collection(), Some("users"));
    }

    #[test]
    fn test_shape_errors() {
        let err = Command::from_document(doc! {"getMore": "abc"}).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedToParse);

        let err = Command::from_document(doc! {"killCursors": "c", "cursors": 5}).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedToParse);

        let err = Command::from_document(doc! {}).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::FailedToParse);
    }

    #[test]
    fn test_registry_rejects_unknown() {
        let registry = CommandRegistry::default();
        let err = registry.parse(doc! {"frobnicate": 1}).unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::CommandNotFound);
        assert!(err.to_string().contains("no such command: 'frobnicate'"));

        assert!(registry.parse(doc! {"ping": 1}).is_ok());
        assert!(CommandRegistry::new().parse(doc! {"ping": 1}).is_err());
    }

    #[test]
    fn test_document_mut_and_read_preference() {
        let mut cmd = Command::from_document(doc! {
            "find": "c",
            "hint": {"a": 1},
            "$readPreference": {"mode": "secondary"},
        })
        .unwrap();
        assert_eq!(cmd.read_preference_mode(), Some("secondary"));
        cmd.document_mut().remove("hint");
        assert!(!cmd.document().contains_key("hint"));
    }

    #[test]
    fn test_is_ok() {
        assert!(is_ok(&doc! {"ok": 1}));
        assert!(is_ok(&doc! {"ok": 1.0}));
        assert!(is_ok(&doc! {"ok": true}));
        assert!(!is_ok(&doc! {"ok": 0}));
        assert!(!is_ok(&doc! {"n": 1}));
    }

    #[test]
    fn test_explain_target() {
        let cmd = Command::from_document(doc! {
            "explain": {"find": "users", "filter": {}},
            "$db": "test",
        })
        .unwrap();
        assert!(matches!(cmd, Command::Explain(_)));
        assert_eq!(cmd.target_collection(), Some("users"));
    }
}
