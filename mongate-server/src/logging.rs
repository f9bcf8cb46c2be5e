//! Length-limited rendering of documents for logs.

use bson::{Bson, Document};
use std::fmt;

/// Default bound on rendered document length, in bytes.
pub const DEFAULT_REQUEST_LENGTH_LIMIT: usize = 1024;

const ELLIPSIS: &str = "...";

/// Displays a document as relaxed extended JSON, truncated to `limit` bytes.
///
/// Rendering happens lazily, so a disabled log level costs nothing.
pub struct Limited<'a> {
    document: &'a Document,
    limit: usize,
}

impl<'a> Limited<'a> {
    pub fn new(document: &'a Document, limit: usize) -> Self {
        Self { document, limit }
    }
}

impl fmt::Display for Limited<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&render(self.document, self.limit))
    }
}

/// Renders `document` as relaxed extended JSON of at most `limit` bytes
/// plus a trailing ellipsis when truncated. A limit of 0 disables truncation.
pub fn render(document: &Document, limit: usize) -> String {
    let json = Bson::Document(document.clone())
        .into_relaxed_extjson()
        .to_string();
    truncate(json, limit)
}

fn truncate(mut s: String, limit: usize) -> String {
    if limit == 0 || s.len() <= limit {
        return s;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
    s.push_str(ELLIPSIS);
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_short_document_untouched() {
        let d = doc! {"find": "users", "filter": {"a": 1}};
        let out = render(&d, 1024);
        assert_eq!(out, r#"{"find":"users","filter":{"a":1}}"#);
        assert_eq!(Limited::new(&d, 1024).to_string(), out);
    }

    #[test]
    fn test_truncated() {
        let d = doc! {"insert": "c", "documents": [{"payload": "x".repeat(500)}]};
        let out = render(&d, 32);
        assert!(out.ends_with(ELLIPSIS));
        assert_eq!(out.len(), 32 + ELLIPSIS.len());
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let out = truncate("aé".to_string(), 2);
        assert_eq!(out, "a...");
    }

    #[test]
    fn test_zero_limit_disables() {
        let d = doc! {"a": "x".repeat(100)};
        assert!(!render(&d, 0).ends_with(ELLIPSIS));
    }
}
