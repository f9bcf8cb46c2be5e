//! Stage composition.
//!
//! `stage[0] ∘ stage[1] ∘ ... ∘ stage[n-1] ∘ terminal`: a request enters the
//! first stage, each stage decides whether to call [`Next::run`], and the
//! terminal [`Handler`] runs last. Every stage invocation is timed into the
//! `mongate_plugins_duration_seconds` histogram under its position and name.

use super::{Plugin, Request};
use crate::error::{Result, ServerError};
use crate::metrics::Metrics;
use async_trait::async_trait;
use bson::Document;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-request execution context.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: CancellationToken,
}

impl Context {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Returns the request's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the request is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Returns `Err(Cancelled)` if the request has been cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ServerError::Cancelled);
        }
        Ok(())
    }
}

/// The innermost layer of the pipeline.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, ctx: &Context, request: &mut Request) -> Result<Document>;
}

struct Stage {
    position: String,
    plugin: Box<dyn Plugin>,
}

/// The remainder of the pipeline after the current stage.
pub struct Next<'a> {
    stages: &'a [Stage],
    terminal: &'a dyn Handler,
    metrics: Option<&'a Metrics>,
}

impl<'a> Next<'a> {
    /// Runs the remaining stages and the terminal handler.
    pub async fn run(self, ctx: &Context, request: &mut Request) -> Result<Document> {
        ctx.check()?;

        let Some((stage, rest)) = self.stages.split_first() else {
            return self.terminal.handle(ctx, request).await;
        };

        let next = Next {
            stages: rest,
            terminal: self.terminal,
            metrics: self.metrics,
        };

        let start = Instant::now();
        let result = stage.plugin.process(ctx, request, next).await;

        if let Some(metrics) = self.metrics {
            let status = if result.is_ok() { "success" } else { "error" };
            metrics
                .stage_duration
                .with_label_values(&[stage.position.as_str(), stage.plugin.name(), status])
                .observe(start.elapsed().as_secs_f64());
        }

        result
    }
}

/// An ordered list of stages around a terminal handler.
pub struct Pipeline {
    stages: Vec<Stage>,
    terminal: Arc<dyn Handler>,
    metrics: Option<Arc<Metrics>>,
}

impl Pipeline {
    pub fn new(plugins: Vec<Box<dyn Plugin>>, terminal: Arc<dyn Handler>) -> Self {
        let stages = plugins
            .into_iter()
            .enumerate()
            .map(|(i, plugin)| Stage {
                position: i.to_string(),
                plugin,
            })
            .collect();
        Self {
            stages,
            terminal,
            metrics: None,
        }
    }

    /// Sets the metrics instance used for stage timing.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Runs `request` through every stage.
    pub async fn execute(&self, ctx: &Context, request: &mut Request) -> Result<Document> {
        Next {
            stages: &self.stages,
            terminal: self.terminal.as_ref(),
            metrics: self.metrics.as_deref(),
        }
        .run(ctx, request)
        .await
    }

    /// Returns the stage names in execution order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.plugin.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
