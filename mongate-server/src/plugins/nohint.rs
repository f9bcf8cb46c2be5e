//! Strips index hints from commands.

use super::{Context, Next, Plugin, Request};
use crate::error::Result;
use async_trait::async_trait;
use bson::{Bson, Document};

pub const NAME: &str = "nohint";

/// Removes `hint` from reads and writes so the backend planner decides.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHintPlugin;

/// Removes `hint` from `document` and from each statement under `statements`.
fn strip(document: &mut Document, statements: Option<&str>) {
    document.remove("hint");
    let Some(key) = statements else {
        return;
    };
    if let Ok(items) = document.get_array_mut(key) {
        for item in items.iter_mut() {
            if let Bson::Document(statement) = item {
                statement.remove("hint");
            }
        }
    }
}

/// Applies the hint stripping rules for `command_name`.
pub fn strip_hints(command_name: &str, document: &mut Document) {
    match command_name {
        "find" | "aggregate" | "count" => strip(document, None),
        "delete" => strip(document, Some("deletes")),
        "update" => strip(document, Some("updates")),
        _ => {}
    }
}

#[async_trait]
impl Plugin for NoHintPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, _config: &Document) -> Result<()> {
        Ok(())
    }

    async fn process(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Document> {
        strip_hints(&request.command_name, request.command.document_mut());
        next.run(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_strip_find() {
        let mut d = doc! {"find": "c", "filter": {}, "hint": {"a": 1}};
        strip_hints("find", &mut d);
        assert_eq!(d, doc! {"find": "c", "filter": {}});
    }

    #[test]
    fn test_strip_update_statements() {
        let mut d = doc! {
            "update": "c",
            "updates": [
                {"q": {}, "u": {"$set": {"x": 1}}, "hint": "x_1"},
                {"q": {}, "u": {"$set": {"y": 1}}},
            ],
        };
        strip_hints("update", &mut d);
        for u in d.get_array("updates").unwrap() {
            assert!(!u.as_document().unwrap().contains_key("hint"));
        }
    }

    #[test]
    fn test_other_commands_untouched() {
        let mut d = doc! {"insert": "c", "hint": 1};
        strip_hints("insert", &mut d);
        assert!(d.contains_key("hint"));
    }
}
