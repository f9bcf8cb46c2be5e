//! Answers selected commands with `CommandNotFound` instead of running them.

use super::{Context, Next, Plugin, Request};
use crate::error::Result;
use async_trait::async_trait;
use bson::Document;
use mongate_wire::ErrorCode;
use serde::Deserialize;
use std::collections::HashSet;

pub const NAME: &str = "filtercommand";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilterCommandConfig {
    filter_commands: Vec<String>,
}

/// Hides commands from clients.
#[derive(Debug, Default)]
pub struct FilterCommandPlugin {
    filtered: HashSet<String>,
}

impl FilterCommandPlugin {
    pub fn is_filtered(&self, command: &str) -> bool {
        self.filtered.contains(command)
    }
}

#[async_trait]
impl Plugin for FilterCommandPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &Document) -> Result<()> {
        let config: FilterCommandConfig = bson::from_document(config.clone())?;
        self.filtered = config.filter_commands.into_iter().collect();
        Ok(())
    }

    async fn process(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Document> {
        if self.is_filtered(&request.command_name) {
            tracing::debug!("Filtered command {}", request.command_name);
            return Ok(ErrorCode::CommandNotFound
                .error_document(format!("no such command: '{}'", request.command_name)));
        }
        next.run(ctx, request).await
    }
}
