//! # mongate-server
//!
//! Gateway server for mongate.
//!
//! This crate provides:
//! - TCP connection handling with a graceful, state-aware drain
//! - Translation of legacy opcodes into modern commands and back
//! - The staged command pipeline and its built-in stages
//! - A sliding-TTL cursor cache with expiry-driven `killCursors`
//! - YAML configuration and Prometheus metrics

pub mod command;
pub mod config;
pub mod connection;
pub mod cursor;
pub mod error;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod plugins;
pub mod server;
pub mod translate;

pub use command::{Command, CommandRegistry};
pub use config::{Config, ConfigError, GatewaySettings, MetricsConfig, NetworkConfig, PluginSpec, ShutdownConfig};
pub use connection::{ConnHandle, ConnectionState};
pub use cursor::{CursorCache, CursorCacheEntry, CursorHandle, TtlCursorCache};
pub use error::{Result, ServerError};
pub use handler::{GatewayHandler, ServerInfo};
pub use metrics::{Health, Metrics};
pub use plugins::{ClientConnection, Context, Handler, Identity, Next, Pipeline, Plugin, PluginRegistry, Request};
pub use server::{Gateway, GatewayConfig};
