//! Logs commands whose downstream handling exceeds a threshold.

use super::{Context, Next, Plugin, Request};
use crate::error::Result;
use crate::logging::{Limited, DEFAULT_REQUEST_LENGTH_LIMIT};
use async_trait::async_trait;
use bson::Document;
use serde::Deserialize;
use std::time::{Duration, Instant};

pub const NAME: &str = "slowlog";

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SlowlogConfig {
    threshold_ms: u64,
    request_length_limit: usize,
}

impl Default for SlowlogConfig {
    fn default() -> Self {
        Self {
            threshold_ms: 100,
            request_length_limit: DEFAULT_REQUEST_LENGTH_LIMIT,
        }
    }
}

#[derive(Debug)]
pub struct SlowlogPlugin {
    threshold: Duration,
    request_length_limit: usize,
}

impl Default for SlowlogPlugin {
    fn default() -> Self {
        let config = SlowlogConfig::default();
        Self {
            threshold: Duration::from_millis(config.threshold_ms),
            request_length_limit: config.request_length_limit,
        }
    }
}

impl SlowlogPlugin {
    pub fn threshold(&self) -> Duration {
        self.threshold
    }

    pub fn is_slow(&self, took: Duration) -> bool {
        took > self.threshold
    }
}

#[async_trait]
impl Plugin for SlowlogPlugin {
    fn name(&self) -> &str {
        NAME
    }

    fn configure(&mut self, config: &Document) -> Result<()> {
        let config: SlowlogConfig = bson::from_document(config.clone())?;
        self.threshold = Duration::from_millis(config.threshold_ms);
        self.request_length_limit = config.request_length_limit;
        Ok(())
    }

    async fn process(
        &self,
        ctx: &Context,
        request: &mut Request,
        next: Next<'_>,
    ) -> Result<Document> {
        let start = Instant::now();
        let result = next.run(ctx, request).await;
        let took = start.elapsed();
        if self.is_slow(took) {
            let command = &request.command;
            tracing::info!(
                took_ms = took.as_millis() as u64,
                db = command.target_database(),
                collection = command.target_collection().unwrap_or_default(),
                command = request.command_name.as_str(),
                readpref = command.read_preference_mode().unwrap_or_default(),
                "Slowlog: request={}",
                Limited::new(command.document(), self.request_length_limit)
            );
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_defaults() {
        let plugin = SlowlogPlugin::default();
        assert_eq!(plugin.threshold(), Duration::from_millis(100));
        assert_eq!(plugin.request_length_limit, DEFAULT_REQUEST_LENGTH_LIMIT);
    }

    #[test]
    fn test_configure() {
        let mut plugin = SlowlogPlugin::default();
        plugin
            .configure(&doc! {"threshold_ms": 250i64, "request_length_limit": 64i32})
            .unwrap();
        assert_eq!(plugin.threshold(), Duration::from_millis(250));
        assert_eq!(plugin.request_length_limit, 64);
        assert!(!plugin.is_slow(Duration::from_millis(250)));
        assert!(plugin.is_slow(Duration::from_millis(251)));
    }

    #[test]
    fn test_bad_config() {
        let mut plugin = SlowlogPlugin::default();
        assert!(plugin.configure(&doc! {"threshold_ms": "fast"}).is_err());
    }
}
