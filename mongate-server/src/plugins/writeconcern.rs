//! Rewrites named write concerns (`writeConcern.w` strings) on writes.

use super::{Context, Next, Plugin, Request};
use crate::error::Result;
use async_trait::async_trait;
use bson::{Bson, Document};
use serde::Deserialize;
use std::collections::HashMap;

pub const NAME: &str = "writeconcernoverride";

const WRITE_COMMANDS: &[&str] = &["delete", "findAndModify", "insert", "update"];

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WriteConcernConfig {
    /// Applies to `update` and wins over `write_override`.
    update_override: HashMap<String, Bson>,
    write_override: HashMap<String, Bson>,
}

/// Maps client-requested `w` modes (`"majority"`, tag sets) to replacements.
#[derive(Debug, Default)]
pub struct WriteConcernPlugin {
    update_override: HashMap<String, Bson>,
    write_override: HashMap<String, Bson>,
}

impl WriteConcernPlugin {
    /// Returns the replacement for `w` on `command_name`, if any.
    pub fn replacement(&self, command_name: &str, w: &str) -> Option<&Bson> {
        if !WRITE_COMMANDS.contains(&command_name) {
            return None;
        }
        if command_name == "update" {
            if let Some(value) = self.update_override.get(w) {
                return Some(value);
            }
        }
        self.write_override.get(w)
    }

    /// Rewrites `writeConcern.w` in place. Numeric `w` values are left alone.
    pub fn apply(&self, command_name: &str, document: &mut Document) {
        let Ok(write_concern) = document.get_document_mut("writeConcern") else {
            return;
        };
        let Ok(w) = write_concern.get_str("w") else {
            return;
        };
        if let Some(value) = self.replacement(command_name, w).cloned() {
            tracing::debug!("Rewriting writeConcern.w {} to {}", w, value);
            write_concern.insert("w", value);
        }
    }
}

#[async_trait]
impl Plugin for WriteConcernPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &Document) -> Result<()> {
        let config: WriteConcernConfig = bson::from_document(config.clone())?;
        self.update_override = config.update_override;
        self.write_override = config.write_override;
        Ok(())
    }

    async fn process(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Document> {
        self.apply(&request.command_name, request.command.document_mut());
        next.run(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Command;
    use crate::cursor::TtlCursorCache;
    use crate::plugins::{ClientConnection, Handler, Pipeline};
    use bson::doc;
    use std::sync::Arc;
    use std::time::Duration;

    /// Answers with the `w` the backend would have seen.
    struct Echo;

    #[async_trait]
    impl Handler for Echo {
        async fn handle(&self, _ctx: &Context, request: &mut Request) -> Result<Document> {
            let w = request
                .command
                .document()
                .get_document("writeConcern")
                .ok()
                .and_then(|wc| wc.get("w"))
                .cloned()
                .unwrap_or(Bson::Null);
            Ok(doc! {"w": w, "ok": 1})
        }
    }

    fn configured() -> WriteConcernPlugin {
        let mut plugin = WriteConcernPlugin::default();
        plugin
            .configure(&doc! {
                "update_override": {"majority": 1i64, "2": 1i64},
                "write_override": {"majority": "primaryAck"},
            })
            .unwrap();
        plugin
    }

    #[tokio::test]
    async fn test_update_override_through_pipeline() {
        let pipeline = Pipeline::new(vec![Box::new(configured())], Arc::new(Echo));
        let mut request = Request::new(
            Arc::new(ClientConnection::new(None)),
            Arc::new(TtlCursorCache::new(Duration::from_secs(60))),
            Command::from_document(doc! {
                "update": "foo",
                "updates": [],
                "writeConcern": {"w": "majority"},
            })
            .unwrap(),
        );
        let response = pipeline
            .execute(&Context::default(), &mut request)
            .await
            .unwrap();
        assert_eq!(response.get_i64("w").unwrap(), 1);
    }

    #[test]
    fn test_write_override_for_other_writes() {
        let plugin = configured();
        let mut d = doc! {"insert": "c", "documents": [], "writeConcern": {"w": "majority", "j": true}};
        plugin.apply("insert", &mut d);
        let wc = d.get_document("writeConcern").unwrap();
        assert_eq!(wc.get_str("w").unwrap(), "primaryAck");
        assert!(wc.get_bool("j").unwrap());
    }

    #[test]
    fn test_numeric_and_unmapped_untouched() {
        let plugin = configured();
        let mut d = doc! {"update": "c", "writeConcern": {"w": 2}};
        plugin.apply("update", &mut d);
        assert_eq!(d.get_document("writeConcern").unwrap().get_i32("w").unwrap(), 2);

        let mut d = doc! {"delete": "c", "writeConcern": {"w": "dc1"}};
        plugin.apply("delete", &mut d);
        assert_eq!(d.get_document("writeConcern").unwrap().get_str("w").unwrap(), "dc1");

        let mut d = doc! {"delete": "c"};
        plugin.apply("delete", &mut d);
        assert!(!d.contains_key("writeConcern"));
    }

    #[test]
    fn test_reads_untouched() {
        let plugin = configured();
        assert_eq!(plugin.replacement("find", "majority"), None);
        assert_eq!(plugin.replacement("update", "2"), Some(&Bson::Int64(1)));
        assert_eq!(plugin.replacement("insert", "2"), None);
    }

    #[test]
    fn test_bad_config() {
        let mut plugin = WriteConcernPlugin::default();
        assert!(plugin.configure(&doc! {"updateOverride": {}}).is_err());
    }
}
