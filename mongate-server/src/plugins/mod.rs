//! Pipeline stages.
//!
//! A stage ([`Plugin`]) sees every command on its way to the terminal
//! handler. Stages run in declaration order on the way in and regain control
//! in reverse order on the way out; see [`pipeline`] for the composition.
//!
//! Stages are instantiated by name from an explicit [`PluginRegistry`] built
//! at startup.

pub mod defaults;
pub mod filtercommand;
pub mod inlimit;
pub mod nohint;
pub mod pipeline;
pub mod slowlog;
pub mod writeconcern;

pub use pipeline::{Context, Handler, Next, Pipeline};

use crate::command::Command;
use crate::cursor::CursorCache;
use crate::error::{Result, ServerError};
use async_trait::async_trait;
use bson::Document;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// A pipeline stage.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Name used in configuration and metrics.
    fn name(&self) -> &str;

    /// Applies the stage's configuration document.
    fn configure(&mut self, config: &Document) -> Result<()>;

    /// Handles one request.
    ///
    /// A stage may pass the request on with `next.run(ctx, request)`,
    /// post-process the result, or return without calling `next`.
    async fn process(&self, ctx: &Context, request: &mut Request, next: Next<'_>)
        -> Result<Document>;
}

/// Type-keyed free-form storage for stage state.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<String, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn insert<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
        self.map.insert(key.into(), Box::new(value));
    }

    /// Returns the value under `key` if it exists and has type `T`.
    pub fn get<T: Any>(&self, key: &str) -> Option<&T> {
        self.map.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn get_mut<T: Any>(&mut self, key: &str) -> Option<&mut T> {
        self.map.get_mut(key).and_then(|v| v.downcast_mut())
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.map.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.map.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.map.keys()).finish()
    }
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    /// Where the identity came from (e.g. `x509`, `internal`).
    #[serde(default = "Identity::default_kind")]
    pub kind: String,
    pub user: String,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Identity {
    pub fn new(kind: impl Into<String>, user: impl Into<String>, roles: Vec<String>) -> Self {
        Self {
            kind: kind.into(),
            user: user.into(),
            roles,
        }
    }

    fn default_kind() -> String {
        "static".to_string()
    }
}

/// State of one client socket, shared by all requests on it.
pub struct ClientConnection {
    addr: Option<SocketAddr>,
    identities: RwLock<Vec<Identity>>,
    /// Persists across requests on the same socket.
    extensions: Mutex<Extensions>,
}

impl ClientConnection {
    pub fn new(addr: Option<SocketAddr>) -> Self {
        Self {
            addr,
            identities: RwLock::new(Vec::new()),
            extensions: Mutex::new(Extensions::new()),
        }
    }

    /// Creates a connection that acts as `identities`, used for gateway-issued
    /// commands.
    pub fn internal(identities: Vec<Identity>) -> Self {
        Self {
            addr: None,
            identities: RwLock::new(identities),
            extensions: Mutex::new(Extensions::new()),
        }
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Returns the peer address for logs, or an empty string.
    pub fn addr_string(&self) -> String {
        self.addr.map(|a| a.to_string()).unwrap_or_default()
    }

    pub fn identities(&self) -> Vec<Identity> {
        self.identities.read().clone()
    }

    pub fn add_identity(&self, identity: Identity) {
        self.identities.write().push(identity);
    }

    pub fn clear_identities(&self) {
        self.identities.write().clear();
    }

    /// Locks the connection-level extensions.
    pub fn extensions(&self) -> parking_lot::MutexGuard<'_, Extensions> {
        self.extensions.lock()
    }
}

impl fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConnection")
            .field("addr", &self.addr)
            .field("identities", &self.identities.read().len())
            .finish()
    }
}

/// One command travelling through the pipeline.
pub struct Request {
    pub client: Arc<ClientConnection>,
    pub cursors: Arc<dyn CursorCache>,
    pub command_name: String,
    pub command: Command,
    /// Per-call stage state; starts empty for every request.
    pub extensions: Extensions,
}

impl Request {
    pub fn new(client: Arc<ClientConnection>, cursors: Arc<dyn CursorCache>, command: Command) -> Self {
        Self {
            client,
            cursors,
            command_name: command.name().to_string(),
            command,
            extensions: Extensions::new(),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("client", &self.client)
            .field("command_name", &self.command_name)
            .field("extensions", &self.extensions)
            .finish()
    }
}

/// Creates a fresh, unconfigured stage.
pub type PluginFactory = Arc<dyn Fn() -> Box<dyn Plugin> + Send + Sync>;

/// Stage constructors by name.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, PluginFactory>,
}

impl PluginRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry holding the built-in stages.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(|| Box::new(defaults::DefaultsPlugin::default()));
        registry.register_builtin(|| Box::new(filtercommand::FilterCommandPlugin::default()));
        registry.register_builtin(|| Box::new(inlimit::InLimitPlugin::default()));
        registry.register_builtin(|| Box::new(nohint::NoHintPlugin));
        registry.register_builtin(|| Box::new(slowlog::SlowlogPlugin::default()));
        registry.register_builtin(|| Box::new(writeconcern::WriteConcernPlugin::default()));
        registry
    }

    fn register_builtin(&mut self, f: fn() -> Box<dyn Plugin>) {
        self.register(f).expect("built-in stage names are unique");
    }

    /// Registers a stage under the name its instances report.
    pub fn register<F>(&mut self, factory: F) -> Result<()>
    where
        F: Fn() -> Box<dyn Plugin> + Send + Sync + 'static,
    {
        let name = factory().name().to_string();
        if self.factories.contains_key(&name) {
            return Err(ServerError::Config(format!(
                "plugin named {} already registered",
                name
            )));
        }
        self.factories.insert(name, Arc::new(factory));
        Ok(())
    }

    /// Instantiates an unconfigured stage.
    pub fn create(&self, name: &str) -> Option<Box<dyn Plugin>> {
        self.factories.get(name).map(|f| f())
    }

    /// Instantiates and configures stages in order.
    pub fn build(&self, specs: &[(String, Document)]) -> Result<Vec<Box<dyn Plugin>>> {
        specs
            .iter()
            .map(|(name, config)| {
                let mut plugin = self
                    .create(name)
                    .ok_or_else(|| ServerError::Config(format!("unknown plugin: {}", name)))?;
                plugin.configure(config).map_err(|e| {
                    ServerError::Config(format!("failed to configure plugin {}: {}", name, e))
                })?;
                Ok(plugin)
            })
            .collect()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_extensions() {
        let mut ext = Extensions::new();
        ext.insert("count", 3usize);
        ext.insert("name", "alpha".to_string());
        assert_eq!(ext.get::<usize>("count"), Some(&3));
        assert_eq!(ext.get::<u32>("count"), None);
        *ext.get_mut::<usize>("count").unwrap() += 1;
        assert_eq!(ext.get::<usize>("count"), Some(&4));

        assert!(ext.remove("name"));
        assert!(!ext.contains("name"));
        assert_eq!(ext.len(), 1);
    }

    #[test]
    fn test_client_identities() {
        let cc = ClientConnection::new(Some("127.0.0.1:5000".parse().unwrap()));
        assert!(cc.identities().is_empty());
        cc.add_identity(Identity::new("x509", "alice", vec!["read".to_string()]));
        assert_eq!(cc.identities()[0].user, "alice");
        cc.clear_identities();
        assert!(cc.identities().is_empty());
        assert_eq!(cc.addr_string(), "127.0.0.1:5000");

        cc.extensions().insert("bucket", 10u32);
        assert_eq!(cc.extensions().get::<u32>("bucket"), Some(&10));
    }

    #[test]
    fn test_registry_builds_in_order() {
        let registry = PluginRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec![
                "defaults",
                "filtercommand",
                "inlimit",
                "nohint",
                "slowlog",
                "writeconcernoverride"
            ]
        );

        let plugins = registry
            .build(&[
                ("nohint".to_string(), Document::new()),
                (
                    "filtercommand".to_string(),
                    doc! {"filter_commands": ["shutdown"]},
                ),
            ])
            .unwrap();
        let names: Vec<&str> = plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["nohint", "filtercommand"]);
    }

    #[test]
    fn test_registry_errors() {
        let mut registry = PluginRegistry::with_builtins();
        assert!(registry
            .build(&[("nosuch".to_string(), Document::new())])
            .is_err());
        assert!(registry
            .register(|| Box::new(nohint::NoHintPlugin))
            .is_err());
    }
}
