//! Fills in `readConcern` and `maxTimeMS` on reads that left them unset.

use super::{Context, Next, Plugin, Request};
use crate::error::Result;
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use serde::Deserialize;

pub const NAME: &str = "defaults";

/// Commands that take both defaults.
const READ_COMMANDS: &[&str] = &["aggregate", "count", "distinct", "find"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct ReadConcern {
    level: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DefaultsConfig {
    default_read_concern: Option<ReadConcern>,
    default_max_time_ms: Option<i64>,
}

#[derive(Debug, Default)]
pub struct DefaultsPlugin {
    read_concern: Option<Document>,
    max_time_ms: Option<i64>,
}

impl DefaultsPlugin {
    /// Applies the configured defaults to `document`.
    ///
    /// `findAndModify` only receives `maxTimeMS`; it rejects a read concern
    /// outside a transaction.
    pub fn apply(&self, command_name: &str, document: &mut Document) {
        let reads = READ_COMMANDS.contains(&command_name);
        if !reads && command_name != "findAndModify" {
            return;
        }
        if reads {
            if let Some(ref read_concern) = self.read_concern {
                set_if_unset(document, "readConcern", Bson::Document(read_concern.clone()));
            }
        }
        if let Some(max_time_ms) = self.max_time_ms {
            set_if_unset(document, "maxTimeMS", Bson::Int64(max_time_ms));
        }
    }
}

/// A key present with a null value counts as unset.
fn set_if_unset(document: &mut Document, key: &str, value: Bson) {
    match document.get(key) {
        None | Some(Bson::Null) => {
            document.insert(key, value);
        }
        Some(_) => {}
    }
}

#[async_trait]
impl Plugin for DefaultsPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &Document) -> Result<()> {
        let config: DefaultsConfig = bson::from_document(config.clone())?;
        self.read_concern = config
            .default_read_concern
            .map(|rc| doc! {"level": rc.level});
        self.max_time_ms = config.default_max_time_ms;
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
