//! TCP server implementation.

use crate::allocator::ConnectionIdAllocator;
use crate::config::Config;
use crate::error::ServerError;
use crate::handler::CommandHandler;
use crate::metrics::Metrics;
use crate::script::panic_message;
use crate::supervisor::{Supervisor, SupervisorEvent};
use futures::FutureExt;
use nestdb_core::ConnectionId;
use nestdb_protocol::{encode_line, EventNotification, LineDecoder, Request};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to bind to. 0 picks a free port.
    pub port: u16,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Capacity of each connection's outbound event queue.
    pub outbound_capacity: usize,
    /// Metrics instance (if metrics are enabled).
    pub metrics: Option<Arc<Metrics>>,
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("max_connections", &self.max_connections)
            .field("outbound_capacity", &self.outbound_capacity)
            .field("metrics_enabled", &self.metrics.is_some())
            .finish()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: nestdb_protocol::DEFAULT_HOST.to_string(),
            port: 0,
            max_connections: 1000,
            outbound_capacity: 256,
            metrics: None,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Takes the network section of a loaded configuration.
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.network.host.clone(),
            port: config.network.port,
            max_connections: config.network.max_connections,
            outbound_capacity: config.network.outbound_capacity,
            metrics: None,
        }
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Returns whether metrics are enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics.is_some()
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub requests_total: AtomicU64,
    pub errors_total: AtomicU64,
}

/// TCP server for nestdb.
pub struct Server {
    config: ServerConfig,
    handler: Arc<CommandHandler>,
    allocator: ConnectionIdAllocator,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    supervisor: Supervisor,
}

impl Server {
    /// Creates a new server around `handler`.
    pub fn new(config: ServerConfig, handler: CommandHandler) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let handler = match config.metrics {
            Some(ref metrics) if handler.metrics().is_none() => {
                handler.with_metrics(metrics.clone())
            }
            _ => handler,
        };
        Self {
            config,
            handler: Arc::new(handler),
            allocator: ConnectionIdAllocator::new(),
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            supervisor: Supervisor::detached(),
        }
    }

    /// Reports lifecycle events to `supervisor`.
    pub fn with_supervisor(mut self, supervisor: Supervisor) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn handler(&self) -> &Arc<CommandHandler> {
        &self.handler
    }

    /// Binds the configured host and port.
    pub async fn bind(&self) -> Result<TcpListener, ServerError> {
        let listener = TcpListener::bind((self.config.host.as_str(), self.config.port)).await?;
        Ok(listener)
    }

    /// Binds and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accepts connections on `listener` until shutdown, then waits for every
    /// connection to go through its close path.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown.subscribe();
        let local_addr = listener.local_addr()?;
        self.running.store(true, Ordering::SeqCst);
        tracing::info!("Server listening on {}", local_addr);
        self.supervisor.report(SupervisorEvent::Listening);

        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => self.accept(stream, addr, &mut connections),
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        drop(listener);
        while connections.join_next().await.is_some() {}

        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn accept(&self, stream: TcpStream, addr: SocketAddr, connections: &mut JoinSet<()>) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats
                .connections_rejected
                .fetch_add(1, Ordering::Relaxed);
            if let Some(ref metrics) = self.config.metrics {
                metrics.connections_rejected_total.inc();
            }
            return;
        }

        let conn = self
            .allocator
            .allocate_unused(|id| self.handler.connections().contains(id));
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity.max(1));
        self.handler.on_connect(conn, outbound_tx);

        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);
        if let Some(ref metrics) = self.config.metrics {
            metrics.connections_total.inc();
            metrics.connections_active.inc();
        }
        tracing::info!("Client connected: {} (connection {})", addr, conn);

        let handler = self.handler.clone();
        let stats = self.stats.clone();
        let metrics = self.config.metrics.clone();
        let supervisor = self.supervisor.clone();
        let conn_shutdown = self.shutdown.subscribe();

        connections.spawn(async move {
            let session = Self::handle_connection(
                stream,
                conn,
                handler.clone(),
                stats.clone(),
                outbound_rx,
                conn_shutdown,
            );
            match AssertUnwindSafe(session).catch_unwind().await {
                Ok(Ok(())) | Ok(Err(ServerError::ShuttingDown)) => {}
                Ok(Err(e)) => {
                    tracing::debug!("[{}] Connection error: {}", conn, e);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::error!("[{}] Connection task panicked: {}", conn, message);
                    stats.errors_total.fetch_add(1, Ordering::Relaxed);
                    supervisor.report(SupervisorEvent::panic(message));
                }
            }

            handler.on_disconnect(conn);

            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
            if let Some(ref metrics) = metrics {
                metrics.connections_active.dec();
            }
            tracing::info!("Client disconnected: {} (connection {})", addr, conn);
        });
    }

    async fn handle_connection(
        mut stream: TcpStream,
        conn: ConnectionId,
        handler: Arc<CommandHandler>,
        stats: Arc<ServerStats>,
        mut outbound: mpsc::Receiver<EventNotification>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), ServerError> {
        let mut decoder = LineDecoder::new();
        let mut buf = [0u8; 8192];

        loop {
            tokio::select! {
                biased;

                Some(note) = outbound.recv() => {
                    let bytes = encode_line(&note)?;
                    stream.write_all(&bytes).await?;
                }

                result = stream.read(&mut buf) => {
                    match result {
                        Ok(0) => {
                            tracing::debug!("[{}] Connection closed by client", conn);
                            return Ok(());
                        }
                        Ok(n) => {
                            tracing::trace!("[{}] Received {} bytes", conn, n);
                            decoder.extend(&buf[..n]);
                        }
                        Err(e) => {
                            tracing::debug!("[{}] Read error: {}", conn, e);
                            return Err(ServerError::Io(e));
                        }
                    }
                }

                _ = shutdown.recv() => {
                    tracing::debug!("[{}] Shutdown signal received", conn);
                    return Err(ServerError::ShuttingDown);
                }
            }

            loop {
                let request = match decoder.decode::<Request>() {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!("[{}] Dropping malformed record: {}", conn, e);
                        continue;
                    }
                };

                stats.requests_total.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "[{}] Request: {} (id={:?})",
                    conn,
                    request.action,
                    request.id
                );

                if let Some(response) = handler.handle(conn, &request) {
                    let bytes = encode_line(&response)?;
                    stream.write_all(&bytes).await?;
                }
            }
        }
    }

    /// Signals the accept loop and every connection to stop.
    pub fn shutdown(&self) {
        if self.shutdown.send(()).is_err() {
            tracing::debug!("Shutdown requested with no listeners");
        }
    }

    /// Returns whether the server is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns server statistics.
    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SecretValidator;
    use nestdb_core::Database;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct TestClient {
        reader: BufReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (reader, writer) = stream.into_split();
            Self {
                reader: BufReader::new(reader),
                writer,
            }
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, record: Value) {
            self.send_raw(&record.to_string()).await;
        }

        async fn recv(&mut self) -> Value {
            let mut line = String::new();
            let n = tokio::time::timeout(TIMEOUT, self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a record")
                .unwrap();
            assert!(n > 0, "connection closed");
            serde_json::from_str(&line).unwrap()
        }

        async fn call(&mut self, record: Value) -> Value {
            self.send(record).await;
            self.recv().await
        }

        async fn is_closed(&mut self) -> bool {
            let mut line = String::new();
            matches!(
                tokio::time::timeout(TIMEOUT, self.reader.read_line(&mut line)).await,
                Ok(Ok(0)) | Ok(Err(_))
            )
        }
    }

    async fn start(config: ServerConfig, handler: CommandHandler) -> (Arc<Server>, SocketAddr) {
        let server = Arc::new(Server::new(config, handler));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let serving = server.clone();
        tokio::spawn(async move { serving.serve(listener).await });
        (server, addr)
    }

    fn new_handler() -> CommandHandler {
        CommandHandler::new(Arc::new(Mutex::new(Database::new())))
    }

    async fn start_default() -> (Arc<Server>, SocketAddr) {
        start(ServerConfig::new("127.0.0.1", 0), new_handler()).await
    }

    #[tokio::test]
    async fn test_set_and_get_without_secret() {
        let (_server, addr) = start_default().await;
        let mut client = TestClient::connect(addr).await;

        let response = client
            .call(json!({"id": 1, "action": "set", "key": "a.b", "value": 5}))
            .await;
        assert_eq!(
            response,
            json!({"id": 1, "type": "response", "action": "set"})
        );

        let response = client.call(json!({"id": 2, "action": "get", "key": "a"})).await;
        assert_eq!(response["value"], json!({"b": 5}));
    }

    #[tokio::test]
    async fn test_auth_handshake() {
        let handler = new_handler().with_validator(SecretValidator::new(Some("s3cret")));
        let (_server, addr) = start(ServerConfig::new("127.0.0.1", 0), handler).await;
        let mut client = TestClient::connect(addr).await;

        let response = client.call(json!({"id": 1, "action": "get", "key": "a"})).await;
        assert_eq!(
            response["error"],
            "cannot process command before init handshake"
        );

        let response = client
            .call(json!({"id": 2, "action": "init", "secretKey": "wrong"}))
            .await;
        assert_eq!(response["error"], "invalid secret supplied to init");

        let response = client
            .call(json!({"id": 5, "action": "set", "key": "a", "value": 1}))
            .await;
        assert_eq!(
            response["error"],
            "cannot process command before init handshake"
        );

        let response = client
            .call(json!({"id": 3, "action": "init", "secretKey": "s3cret"}))
            .await;
        assert_eq!(response, json!({"id": 3, "type": "response", "action": "init"}));

        let response = client.call(json!({"id": 4, "action": "hasKey", "key": "a"})).await;
        assert_eq!(response["value"], false);

        let response = client.call(json!({"id": 6, "action": "getAll"})).await;
        assert_eq!(response["value"], json!({}));
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_records_are_skipped() {
        let (_server, addr) = start_default().await;
        let mut client = TestClient::connect(addr).await;

        client.send_raw("{not json").await;
        client.send(json!({"id": 1, "action": "flushAll"})).await;
        client
            .send(json!({"id": 2, "action": "set", "key": "xs", "value": [1, 2]}))
            .await;
        client
            .send(json!({"id": 3, "action": "pop", "key": "xs", "noAck": true}))
            .await;

        let response = client.recv().await;
        assert_eq!(response["id"], 2);

        let response = client.call(json!({"id": 4, "action": "get", "key": "xs"})).await;
        assert_eq!(response["id"], 4);
        assert_eq!(response["value"], json!([1]));
    }

    #[tokio::test]
    async fn test_watch_exclusive_and_broadcast() {
        let (_server, addr) = start_default().await;
        let mut leader = TestClient::connect(addr).await;
        let mut follower = TestClient::connect(addr).await;

        let response = leader
            .call(json!({"id": 1, "action": "watchExclusive", "event": "jobs"}))
            .await;
        assert_eq!(response["value"], false);
        assert_eq!(response["event"], "jobs");

        let response = follower
            .call(json!({"id": 1, "action": "watchExclusive", "event": "jobs"}))
            .await;
        assert_eq!(response["value"], true);

        let response = follower
            .call(json!({"id": 2, "action": "broadcast", "event": "jobs", "value": {"n": 1}}))
            .await;
        assert_eq!(response["action"], "broadcast");
        assert_eq!(response["value"], json!({"n": 1}));

        let note = leader.recv().await;
        assert_eq!(note, json!({"type": "event", "event": "jobs", "value": {"n": 1}}));
    }

    #[tokio::test]
    async fn test_disconnect_runs_death_query_and_purges() {
        let (server, addr) = start_default().await;
        let mut observer = TestClient::connect(addr).await;

        {
            let mut client = TestClient::connect(addr).await;
            client
                .call(json!({"id": 1, "action": "set", "key": "online.alice", "value": true}))
                .await;
            client
                .call(json!({"id": 2, "action": "watch", "event": "presence"}))
                .await;
            let response = client
                .call(json!({
                    "id": 3,
                    "action": "registerDeathQuery",
                    "value": "store.remove('online.alice');"
                }))
                .await;
            assert!(response.get("error").is_none());
        }

        let mut gone = false;
        for _ in 0..100 {
            let response = observer
                .call(json!({"id": 9, "action": "hasKey", "key": "online.alice"}))
                .await;
            if response["value"] == false {
                gone = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(gone);

        let db = server.handler().database().lock();
        assert!(!db.events.any_subscribed(&nestdb_core::KeyPath::parse("presence")));
        drop(db);
        assert_eq!(server.handler().connections().len(), 1);
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let (server, addr) = start(
            ServerConfig::new("127.0.0.1", 0).with_max_connections(1),
            new_handler(),
        )
        .await;

        let mut first = TestClient::connect(addr).await;
        first.call(json!({"id": 1, "action": "getAll"})).await;

        let mut second = TestClient::connect(addr).await;
        assert!(second.is_closed().await);
        assert_eq!(server.stats().connections_rejected.load(Ordering::Relaxed), 1);

        let response = first.call(json!({"id": 2, "action": "count", "key": "x"})).await;
        assert_eq!(response["value"], 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let (server, addr) = start_default().await;
        let mut client = TestClient::connect(addr).await;
        client
            .call(json!({"id": 1, "action": "registerDeathQuery", "value": "store.set('down', true);"}))
            .await;
        assert!(server.is_running());

        server.shutdown();
        assert!(client.is_closed().await);

        for _ in 0..500 {
            if !server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!server.is_running());

        let db = server.handler().database().lock();
        assert_eq!(
            db.store.get(&nestdb_core::KeyPath::parse("down")),
            Some(json!(true))
        );
    }

    #[tokio::test]
    async fn test_listening_reported() {
        let (supervisor, mut events) = Supervisor::channel();
        let server = Arc::new(
            Server::new(ServerConfig::new("127.0.0.1", 0), new_handler()).with_supervisor(supervisor),
        );
        let listener = server.bind().await.unwrap();
        let serving = server.clone();
        let task = tokio::spawn(async move { serving.serve(listener).await });

        assert_eq!(events.recv().await, Some(SupervisorEvent::Listening));

        server.shutdown();
        tokio::time::timeout(TIMEOUT, task).await.unwrap().unwrap().unwrap();
        assert!(!server.is_running());
    }
}
