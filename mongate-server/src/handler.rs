//! Terminal handler.
//!
//! Answers the commands a mongos-compatible gateway replies to itself. Every
//! other command must be handled by a stage before it reaches this point.

use crate::command::{Command, DEFAULT_DATABASE};
use crate::error::{Result, ServerError};
use crate::plugins::{Context, Handler, Request};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongate_wire::{Compressor, ErrorCode, MAX_BSON_OBJECT_SIZE, MAX_MESSAGE_SIZE, MAX_WRITE_BATCH_SIZE};
use std::collections::HashSet;

/// Highest wire version advertised in the handshake.
pub const MAX_WIRE_VERSION: i32 = 8;

/// Identity the gateway reports to clients.
#[derive(Debug, Clone)]
pub struct ServerInfo {
    /// Server version reported by `buildInfo` and `serverStatus`.
    pub version: String,
    pub hostname: String,
    pub logical_session_timeout_minutes: i32,
}

impl Default for ServerInfo {
    fn default() -> Self {
        Self {
            version: "4.3.1".to_string(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            logical_session_timeout_minutes: 30,
        }
    }
}

/// The gateway's built-in command handler.
#[derive(Debug, Clone, Default)]
pub struct GatewayHandler {
    info: ServerInfo,
    /// Compressors offered during handshake negotiation.
    compressors: Vec<Compressor>,
}

impl GatewayHandler {
    pub fn new(info: ServerInfo, compressors: Vec<Compressor>) -> Self {
        Self { info, compressors }
    }

    pub fn info(&self) -> &ServerInfo {
        &self.info
    }

    /// Returns the client's compressors that the gateway also supports, in
    /// the client's order of preference.
    pub fn negotiate_compression(&self, requested: &[String]) -> Vec<String> {
        requested
            .iter()
            .filter(|name| {
                name.parse::<Compressor>()
                    .is_ok_and(|c| self.compressors.contains(&c))
            })
            .cloned()
            .collect()
    }

    fn handle_is_master(&self, compression: &[String]) -> Document {
        let mut reply = doc! {
            "ismaster": true,
            "localTime": bson::DateTime::now(),
            "logicalSessionTimeoutMinutes": self.info.logical_session_timeout_minutes,
            "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE as i32,
            "maxMessageSizeBytes": MAX_MESSAGE_SIZE as i32,
            "maxWireVersion": MAX_WIRE_VERSION,
            "maxWriteBatchSize": MAX_WRITE_BATCH_SIZE,
            "minWireVersion": 0,
            "msg": "isdbgrid",
            "ok": 1,
        };
        if !self.compressors.is_empty() && !compression.is_empty() {
            reply.insert("compression", self.negotiate_compression(compression));
        }
        reply
    }

    fn handle_build_info(&self) -> Document {
        doc! {
            "bits": 64,
            "debug": false,
            "version": self.info.version.as_str(),
            "maxBsonObjectSize": MAX_BSON_OBJECT_SIZE as i32,
            "ok": 1,
        }
    }

    fn handle_host_info(&self) -> Document {
        doc! {
            "system": {
                "hostname": self.info.hostname.as_str(),
                "cpuAddrSize": 64,
            },
            "os": {},
            "extra": {},
            "ok": 1,
        }
    }

    fn handle_connection_status(request: &Request) -> Document {
        let mut users = Vec::new();
        let mut roles = Vec::new();
        let mut seen_users = HashSet::new();
        let mut seen_roles = HashSet::new();

        for identity in request.client.identities() {
            if seen_users.insert(identity.user.clone()) {
                users.push(Bson::Document(doc! {
                    "user": identity.user.as_str(),
                    "db": DEFAULT_DATABASE,
                }));
            }
            for role in identity.roles {
                if seen_roles.insert(role.clone()) {
                    roles.push(Bson::Document(doc! {
                        "role": role,
                        "db": DEFAULT_DATABASE,
                    }));
                }
            }
        }

        doc! {
            "ok": 1,
            "authenticatedUsers": users,
            "authenticatedUserRoles": roles,
        }
    }
}

#[async_trait]
impl Handler for GatewayHandler {
    async fn handle(&self, _ctx: &Context, request: &mut Request) -> Result<Document> {
        let reply = match &request.command {
            Command::Ping(_) => doc! { "ok": 1 },
            Command::IsMaster { compression, .. } => self.handle_is_master(compression),
            Command::BuildInfo(_) => self.handle_build_info(),
            Command::HostInfo(_) => self.handle_host_info(),
            Command::ServerStatus(_) => doc! {
                "version": self.info.version.as_str(),
                "ok": 1,
            },
            Command::IsDbGrid(_) => doc! {
                "isdbgrid": 1,
                "hostname": self.info.hostname.as_str(),
                "ok": 1,
            },
            Command::ConnectionStatus(_) => Self::handle_connection_status(request),
            Command::Logout(_) => {
                request.client.clear_identities();
                doc! { "ok": 1 }
            }
            Command::WhatsMyUri(_) => doc! {
                "you": request.client.addr_string(),
                "ok": 1,
            },
            other => {
                return Err(ServerError::command(
                    ErrorCode::CommandNotSupported,
                    format!("no backend stage handled command '{}'", other.name()),
                ))
            }
        };
        Ok(reply)
    }
}
