//! TCP gateway: accept loop, per-connection workers, and graceful drain.

use crate::command::CommandRegistry;
use crate::connection::{ConnHandle, ConnectionState};
use crate::cursor::{run_reaper, track_response, CursorCache, TtlCursorCache};
use crate::error::{Result, ServerError};
use crate::logging::{Limited, DEFAULT_REQUEST_LENGTH_LIMIT};
use crate::metrics::{Health, Metrics};
use crate::plugins::{ClientConnection, Context, Identity, Pipeline, Request};
use crate::translate::{
    get_more_reply, merge_sections, query_reply, translate_get_more, translate_kill_cursors,
    translate_query,
};
use bson::Document;
use dashmap::DashMap;
use mongate_wire::{
    Decoder, Encoder, Message, MessageHeader, MsgFlags, OpCode, OpCompressed, OpGetMore, OpKillCursors,
    OpMsg, OpQuery, OpReply, WireMessage,
};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

const READ_BUFFER_SIZE: usize = 16 * 1024;
const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Gateway configuration.
#[derive(Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    /// Maximum concurrent client connections.
    pub max_connections: usize,
    /// Sliding TTL for idle cursors.
    pub cursor_timeout: Duration,
    pub cursor_reap_interval: Duration,
    /// Limit applied to command documents in debug logs.
    pub request_length_limit: usize,
    /// Identity attached to gateway-originated requests such as the
    /// `killCursors` issued for expired cursors.
    pub internal_identity: Identity,
    /// How often the drain re-checks connection states.
    pub poll_interval: Duration,
    /// How long a connection must have been idle before the drain closes it.
    pub idle_grace: Duration,
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("bind_addr", &self.bind_addr)
            .field("max_connections", &self.max_connections)
            .field("cursor_timeout", &self.cursor_timeout)
            .field("cursor_reap_interval", &self.cursor_reap_interval)
            .field("request_length_limit", &self.request_length_limit)
            .field("internal_user", &self.internal_identity.user)
            .field("poll_interval", &self.poll_interval)
            .field("idle_grace", &self.idle_grace)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 27016)),
            max_connections: 10_000,
            cursor_timeout: Duration::from_secs(30 * 60),
            cursor_reap_interval: Duration::from_secs(1),
            request_length_limit: DEFAULT_REQUEST_LENGTH_LIMIT,
            internal_identity: Identity::new(
                "internal",
                "mongate-internal",
                vec!["root".to_string()],
            ),
            poll_interval: Duration::from_millis(200),
            idle_grace: Duration::from_secs(5),
            metrics: None,
        }
    }
}

impl GatewayConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    /// Builds the gateway settings from a loaded configuration file.
    pub fn from_config(config: &crate::config::Config) -> Self {
        Self {
            bind_addr: config.network.bind_addr,
            max_connections: config.network.max_connections,
            cursor_timeout: config.gateway.idle_cursor_timeout(),
            cursor_reap_interval: config.gateway.cursor_reap_interval(),
            request_length_limit: config.gateway.request_length_limit,
            internal_identity: config.gateway.internal_identity.clone(),
            poll_interval: config.shutdown.poll_interval(),
            idle_grace: config.shutdown.idle_grace(),
            metrics: None,
        }
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_cursor_timeout(mut self, timeout: Duration) -> Self {
        self.cursor_timeout = timeout;
        self
    }

    pub fn with_cursor_reap_interval(mut self, interval: Duration) -> Self {
        self.cursor_reap_interval = interval;
        self
    }

    pub fn with_drain(mut self, poll_interval: Duration, idle_grace: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.idle_grace = idle_grace;
        self
    }
}

/// State shared by the accept loop, every connection worker and the reaper.
struct Shared {
    registry: CommandRegistry,
    pipeline: Pipeline,
    cursors: Arc<TtlCursorCache>,
    connections: DashMap<u64, Arc<ConnHandle>>,
    next_conn_id: AtomicU64,
    next_request_id: AtomicI32,
    metrics: Option<Arc<Metrics>>,
    request_length_limit: usize,
    internal_client: Arc<ClientConnection>,
    /// Hard stop for in-flight requests, fired only when the drain deadline
    /// passes.
    requests: CancellationToken,
}

/// The gateway server.
pub struct Gateway {
    config: GatewayConfig,
    shared: Arc<Shared>,
    health: Health,
    /// Stops the accept loop.
    listener_shutdown: CancellationToken,
    /// Stops background tasks once the drain has finished.
    stopped: CancellationToken,
}

impl Gateway {
    /// Creates a gateway that runs every command through `pipeline`.
    pub fn new(config: GatewayConfig, pipeline: Pipeline) -> Self {
        Self::with_registry(config, pipeline, CommandRegistry::default())
    }

    pub fn with_registry(
        config: GatewayConfig,
        pipeline: Pipeline,
        registry: CommandRegistry,
    ) -> Self {
        let shared = Shared {
            registry,
            pipeline,
            cursors: Arc::new(TtlCursorCache::new(config.cursor_timeout)),
            connections: DashMap::new(),
            next_conn_id: AtomicU64::new(1),
            next_request_id: AtomicI32::new(1),
            metrics: config.metrics.clone(),
            request_length_limit: config.request_length_limit,
            internal_client: Arc::new(ClientConnection::internal(vec![config
                .internal_identity
                .clone()])),
            requests: CancellationToken::new(),
        };
        Self {
            config,
            shared: Arc::new(shared),
            health: Health::new(),
            listener_shutdown: CancellationToken::new(),
            stopped: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Readiness flag, set while the gateway accepts connections.
    pub fn health(&self) -> Health {
        self.health.clone()
    }

    pub fn cursors(&self) -> Arc<TtlCursorCache> {
        self.shared.cursors.clone()
    }

    /// Number of tracked client connections.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> Result<TcpListener> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Binds the configured address and serves until shut down.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until [`Gateway::shutdown`] is
    /// called or the listener fails permanently.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let local_addr = listener.local_addr()?;
        tracing::info!("Gateway listening on {}", local_addr);

        self.spawn_reaper();
        self.health.set_ready(true);

        let mut backoff = Duration::ZERO;
        let result = loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            backoff = Duration::ZERO;
                            self.accept(stream, addr);
                        }
                        Err(e) if is_transient(&e) => {
                            backoff = next_backoff(backoff);
                            tracing::warn!("Accept error: {}; retrying in {:?}", e, backoff);
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = self.listener_shutdown.cancelled() => break Ok(()),
                            }
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                            break Err(e.into());
                        }
                    }
                }
                _ = self.listener_shutdown.cancelled() => {
                    tracing::info!("Gateway stopped accepting connections");
                    break Ok(());
                }
            }
        };

        self.health.set_ready(false);
        result
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr) {
        let shared = &self.shared;
        if shared.connections.len() >= self.config.max_connections {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            return;
        }
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", addr, e);
        }

        let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnHandle::new(id, addr));
        shared.connections.insert(id, handle.clone());
        if let Some(ref metrics) = shared.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        tracing::info!("Client connected: {}", addr);

        let shared = shared.clone();
        tokio::spawn(async move {
            let worker = tokio::spawn(serve_connection(shared.clone(), stream, handle.clone()));
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::debug!("Connection {} error: {}", addr, e),
                Err(e) if e.is_panic() => {
                    tracing::error!("[{}] Connection worker panicked: {}", addr, panic_message(e))
                }
                Err(_) => tracing::debug!("[{}] Connection worker cancelled", addr),
            }

            handle.state.set(ConnectionState::Closed);
            shared.connections.remove(&id);
            if let Some(ref metrics) = shared.metrics {
                metrics.connections_active.dec();
            }
            tracing::info!("Client disconnected: {}", addr);
        });
    }

    fn spawn_reaper(&self) {
        let shared = self.shared.clone();
        tokio::spawn(run_reaper(
            self.shared.cursors.clone(),
            self.config.cursor_reap_interval,
            self.stopped.clone(),
            move |ids| {
                let shared = shared.clone();
                async move { shared.kill_expired(ids).await }
            },
        ));
    }

    /// Drains the gateway, waiting at most `deadline` (forever if `None`).
    ///
    /// Returns `true` if every connection closed on its own.
    pub async fn shutdown(&self, deadline: Option<Duration>) -> bool {
        match deadline {
            Some(deadline) => self.drain(tokio::time::sleep(deadline)).await,
            None => self.drain(std::future::pending()).await,
        }
    }

    /// Stops accepting, then closes connections as they become idle until
    /// none remain or `stop` resolves. On `stop`, every remaining connection
    /// is closed and in-flight requests are cancelled without a reply.
    pub async fn drain<F>(&self, stop: F) -> bool
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Gateway draining");
        self.health.set_ready(false);
        self.listener_shutdown.cancel();

        tokio::pin!(stop);
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let drained = loop {
            for conn in self.shared.connections.iter() {
                if !conn.close_requested() && conn.is_idle_past(self.config.idle_grace) {
                    tracing::debug!("[{}] Closing idle connection", conn.addr);
                    conn.close();
                }
            }
            if self.shared.connections.is_empty() {
                break true;
            }
            tokio::select! {
                _ = ticker.tick() => {}
                _ = &mut stop => break false,
            }
        };

        if !drained {
            tracing::warn!(
                "Drain deadline reached, closing {} connections",
                self.shared.connections.len()
            );
            for conn in self.shared.connections.iter() {
                conn.close();
            }
            self.shared.requests.cancel();
        }

        self.stopped.cancel();
        tracing::info!("Gateway shut down");
        drained
    }
}

impl Shared {
    fn next_request_id(&self) -> i32 {
        self.next_request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Renders `err` as an inline reply and counts it.
    fn error_reply(&self, err: &ServerError) -> Document {
        if let Some(ref metrics) = self.metrics {
            metrics
                .errors_total
                .with_label_values(&[err.error_code().name()])
                .inc();
        }
        err.to_document()
    }

    /// Runs one command through the pipeline and tracks any cursor it opens
    /// or closes.
    ///
    /// Failures are returned as inline error documents; only cancellation is
    /// returned as an error, and it means no reply must be written.
    async fn dispatch(&self, client: &Arc<ClientConnection>, document: Document) -> Result<Document> {
        let command = match self.registry.parse(document) {
            Ok(command) => command,
            Err(e) => return Ok(self.error_reply(&e)),
        };
        if let Some(ref metrics) = self.metrics {
            metrics
                .commands_total
                .with_label_values(&[command.name()])
                .inc();
        }
        tracing::debug!(
            "[{}] Command: {}",
            client.addr_string(),
            Limited::new(command.document(), self.request_length_limit)
        );

        let cursors: Arc<dyn CursorCache> = self.cursors.clone();
        let mut request = Request::new(client.clone(), cursors, command);
        let ctx = Context::new(self.requests.child_token());

        let result = tokio::select! {
            result = self.pipeline.execute(&ctx, &mut request) => result,
            _ = ctx.cancelled() => Err(ServerError::Cancelled),
        };

        let response = match result {
            Ok(response) => response,
            Err(ServerError::Cancelled) => return Err(ServerError::Cancelled),
            Err(e) => {
                tracing::debug!("[{}] Command {} failed: {}", client.addr_string(), request.command_name, e);
                return Ok(self.error_reply(&e));
            }
        };

        if track_response(self.cursors.as_ref(), &request.command, &response).is_some() {
            if let Some(ref metrics) = self.metrics {
                metrics.cursors_opened_total.inc();
            }
        }
        tracing::debug!(
            "[{}] Response: {}",
            client.addr_string(),
            Limited::new(&response, self.request_length_limit)
        );
        Ok(response)
    }

    /// Issues one internal `killCursors` per expired cursor.
    async fn kill_expired(&self, ids: Vec<i64>) {
        for id in ids {
            if let Some(ref metrics) = self.metrics {
                metrics.cursors_expired_total.inc();
            }
            tracing::debug!("Killing expired cursor {}", id);
            let command = translate_kill_cursors(&OpKillCursors {
                cursor_ids: vec![id],
            });
            match self.dispatch(&self.internal_client, command).await {
                Ok(response) if !crate::command::is_ok(&response) => {
                    tracing::warn!("killCursors for expired cursor {} failed: {}", id, response)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("killCursors for expired cursor {} failed: {}", id, e),
            }
            // Stages may have looked the id up again while handling the kill.
            self.cursors.close(id);
        }
    }

    /// Handles one decoded message, returning the reply to write, if any.
    async fn handle_message(
        self: &Arc<Self>,
        client: &Arc<ClientConnection>,
        message: WireMessage,
    ) -> Result<Option<WireMessage>> {
        if let Some(ref metrics) = self.metrics {
            metrics
                .messages_total
                .with_label_values(&[message.op_code().as_str()])
                .inc();
        }
        let request_id = message.header.request_id;

        let mut compressors = Vec::new();
        let mut body = message.body;
        while let Message::Compressed(compressed) = body {
            compressors.push(compressed.compressor);
            body = *compressed.inner;
        }

        let op_code = body.op_code();
        let result: Result<Option<Message>> = match body {
            Message::Msg(msg) => self.handle_op_msg(client, msg).await.map(|r| r.map(Into::into)),
            Message::Query(query) => self.handle_op_query(client, query).await.map(|r| Some(r.into())),
            Message::GetMore(get_more) => self
                .handle_op_get_more(client, get_more)
                .await
                .map(|r| Some(r.into())),
            Message::KillCursors(kill) => self
                .dispatch(client, translate_kill_cursors(&kill))
                .await
                .map(|_| None),
            other @ (Message::Reply(_) | Message::Compressed(_)) => Err(ServerError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected {} from client", other.op_code().as_str()),
            ))),
        };

        // Stream errors and cancellation close the connection; anything else
        // is answered inline in the shape the request expects.
        let reply = match result {
            Ok(reply) => reply,
            Err(e) if e.is_fatal() || matches!(e, ServerError::Cancelled) => return Err(e),
            Err(e) => {
                tracing::debug!("[{}] {} failed: {}", client.addr_string(), op_code.as_str(), e);
                let response = self.error_reply(&e);
                match op_code {
                    OpCode::Msg => Some(OpMsg::reply(response).into()),
                    OpCode::Query | OpCode::GetMore => Some(OpReply::single(response).into()),
                    _ => None,
                }
            }
        };

        Ok(reply.map(|reply| {
            let reply = compressors
                .into_iter()
                .rev()
                .fold(reply, |inner, compressor| {
                    OpCompressed::new(compressor, inner).into()
                });
            WireMessage::new(MessageHeader::new(self.next_request_id(), request_id), reply)
        }))
    }

    async fn handle_op_msg(
        self: &Arc<Self>,
        client: &Arc<ClientConnection>,
        msg: OpMsg,
    ) -> Result<Option<OpMsg>> {
        let command = merge_sections(&msg);

        if msg.flags.more_to_come() {
            // The client expects no reply, so the command runs detached and
            // is not ordered with later messages on this connection.
            match command {
                Ok(command) => {
                    let shared = self.clone();
                    let client = client.clone();
                    tokio::spawn(async move {
                        if let Err(e) = shared.dispatch(&client, command).await {
                            tracing::debug!("[{}] Unacknowledged command failed: {}", client.addr_string(), e);
                        }
                    });
                }
                Err(e) => {
                    tracing::debug!("[{}] Dropping unacknowledged message: {}", client.addr_string(), e);
                }
            }
            return Ok(None);
        }

        let response = match command {
            Ok(command) => self.dispatch(client, command).await?,
            Err(e) => self.error_reply(&e),
        };
        let mut reply = OpMsg::reply(response);
        if msg.flags.checksum_present() {
            reply.flags = MsgFlags::new().with_checksum();
        }
        Ok(Some(reply))
    }

    async fn handle_op_query(
        &self,
        client: &Arc<ClientConnection>,
        query: OpQuery,
    ) -> Result<OpReply> {
        let translation = translate_query(&query)?;
        let response = self.dispatch(client, translation.command).await?;
        query_reply(translation.shape, response, self.cursors.as_ref())
    }

    async fn handle_op_get_more(
        &self,
        client: &Arc<ClientConnection>,
        get_more: OpGetMore,
    ) -> Result<OpReply> {
        let command = translate_get_more(&get_more)?;
        // Taken before dispatch: an exhausting batch closes the entry.
        let entry = self.cursors.get(get_more.cursor_id);
        let response = self.dispatch(client, command).await?;
        get_more_reply(response, &entry)
    }
}

/// Reads, handles and answers messages until the client disconnects, the
/// stream breaks, or the drain closes the connection between messages.
async fn serve_connection(
    shared: Arc<Shared>,
    mut stream: TcpStream,
    handle: Arc<ConnHandle>,
) -> Result<()> {
    let addr = handle.addr;
    let client = Arc::new(ClientConnection::new(Some(addr)));
    let mut decoder = Decoder::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        handle.state.set(ConnectionState::Idle);
        let message = loop {
            if let Some(message) = decoder.decode()? {
                break message;
            }
            tokio::select! {
                biased;
                _ = handle.closed() => {
                    tracing::debug!("[{}] Closed by drain", addr);
                    return Ok(());
                }
                result = stream.read(&mut buf) => {
                    let n = result?;
                    if n == 0 {
                        if decoder.has_partial() {
                            tracing::debug!("[{}] Connection closed mid-message", addr);
                        }
                        return Ok(());
                    }
                    decoder.extend(&buf[..n]);
                }
            }
        };
        handle.state.set(ConnectionState::Active);

        let reply = match shared.handle_message(&client, message).await {
            Ok(reply) => reply,
            Err(ServerError::Cancelled) => {
                tracing::debug!("[{}] Request cancelled, closing", addr);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        if let Some(reply) = reply {
            let bytes = Encoder::encode(&reply)?;
            stream.write_all(&bytes).await?;
        }
    }
}

fn is_transient(err: &io::Error) -> bool {
    // EMFILE / ENFILE: out of descriptors, which clears as connections close.
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    ) || matches!(err.raw_os_error(), Some(23) | Some(24))
}

fn next_backoff(current: Duration) -> Duration {
    if current.is_zero() {
        ACCEPT_BACKOFF_MIN
    } else {
        (current * 2).min(ACCEPT_BACKOFF_MAX)
    }
}

fn panic_message(err: JoinError) -> String {
    let payload = err.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
