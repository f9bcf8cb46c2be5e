//! Rejects query filters whose `$in` or `$nin` lists exceed a limit.

use super::{Context, Next, Plugin, Request};
use crate::error::{Result, ServerError};
use async_trait::async_trait;
use bson::{Bson, Document};
use mongate_wire::ErrorCode;
use serde::Deserialize;

pub const NAME: &str = "inlimit";

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct InLimitConfig {
    /// Zero disables the check.
    in_limit: usize,
}

#[derive(Debug, Default)]
pub struct InLimitPlugin {
    limit: usize,
}

impl InLimitPlugin {
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Checks every filter `command_name` carries in `document`.
    pub fn check(&self, command_name: &str, document: &Document) -> Result<()> {
        if self.limit == 0 {
            return Ok(());
        }
        match command_name {
            "find" => check_optional(document, "filter", self.limit),
            "findAndModify" => check_optional(document, "query", self.limit),
            "update" | "delete" => {
                let key = if command_name == "update" { "updates" } else { "deletes" };
                let Ok(statements) = document.get_array(key) else {
                    return Ok(());
                };
                for statement in statements {
                    if let Bson::Document(statement) = statement {
                        check_optional(statement, "q", self.limit)?;
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

fn check_optional(document: &Document, key: &str, limit: usize) -> Result<()> {
    match document.get_document(key) {
        Ok(filter) => check_filter(filter, limit),
        Err(_) => Ok(()),
    }
}

/// Walks field predicates and the clause lists of `$and`, `$or` and `$nor`.
fn check_filter(filter: &Document, limit: usize) -> Result<()> {
    for value in filter.values() {
        match value {
            Bson::Document(predicate) => check_predicate(predicate, limit)?,
            Bson::Array(clauses) => {
                for clause in clauses {
                    if let Bson::Document(clause) = clause {
                        check_filter(clause, limit)?;
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn check_predicate(predicate: &Document, limit: usize) -> Result<()> {
    for (operator, value) in predicate {
        if operator != "$in" && operator != "$nin" {
            continue;
        }
        let Bson::Array(items) = value else {
            return Err(ServerError::command(
                ErrorCode::BadValue,
                format!("{} needs an array", operator),
            ));
        };
        if items.len() > limit {
            return Err(ServerError::command(
                ErrorCode::IllegalOperation,
                format!(
                    "{} clause of {} elements is longer than limit of {}",
                    operator,
                    items.len(),
                    limit
                ),
            ));
        }
    }
    Ok(())
}

#[async_trait]
impl Plugin for InLimitPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &Document) -> Result<()> {
        let config: InLimitConfig = bson::from_document(config.clone())?;
        self.limit = config.in_limit;
        Ok(())
    }

    async fn process(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Document> {
        if let Err(e) = self.check(&request.command_name, request.command.document()) {
            tracing::debug!("Rejected {}: {}", request.command_name, e);
            return Ok(e.to_document());
        }
        next.run(ctx, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn limited(limit: i64) -> InLimitPlugin {
        let mut plugin = InLimitPlugin::default();
        plugin.configure(&doc! {"in_limit": limit}).unwrap();
        plugin
    }

    fn code(result: Result<()>) -> Option<i32> {
        result.err().map(|e| e.error_code().code())
    }

    #[test]
    fn test_find_filter() {
        let plugin = limited(3);
        assert_eq!(plugin.limit(), 3);
        let ok = doc! {"find": "c", "filter": {"a": {"$in": [1, 2, 3]}}};
        assert!(plugin.check("find", &ok).is_ok());

        let long = doc! {"find": "c", "filter": {"a": {"$nin": [1, 2, 3, 4]}}};
        assert_eq!(
            code(plugin.check("find", &long)),
            Some(ErrorCode::IllegalOperation.code())
        );
    }

    #[test]
    fn test_nested_clauses() {
        let plugin = limited(2);
        let d = doc! {
            "findAndModify": "c",
            "query": {"$or": [{"a": 1}, {"b": {"$in": ["x", "y", "z"]}}]},
            "remove": true,
        };
        assert!(plugin.check("findAndModify", &d).is_err());

        let d = doc! {
            "update": "c",
            "updates": [{"q": {"a": {"$in": [1, 2, 3]}}, "u": {"$set": {"b": 1}}}],
        };
        assert!(plugin.check("update", &d).is_err());
    }

    #[test]
    fn test_non_array_rejected() {
        let plugin = limited(5);
        let d = doc! {"find": "c", "filter": {"a": {"$in": 1}}};
        assert_eq!(code(plugin.check("find", &d)), Some(ErrorCode::BadValue.code()));
    }

    #[test]
    fn test_zero_disables() {
        let plugin = limited(0);
        let d = doc! {"find": "c", "filter": {"a": {"$in": [1, 2, 3, 4, 5]}}};
        assert!(plugin.check("find", &d).is_ok());
    }

    #[test]
    fn test_other_commands_unchecked() {
        let plugin = limited(1);
        let d = doc! {"aggregate": "c", "pipeline": [{"$match": {"a": {"$in": [1, 2]}}}]};
        assert!(plugin.check("aggregate", &d).is_ok());
    }

    #[test]
    fn test_bad_config() {
        let mut plugin = InLimitPlugin::default();
        assert!(plugin.configure(&doc! {"inlimit": 5}).is_err());
        assert!(plugin.configure(&doc! {"in_limit": -1}).is_err());
    }
}
