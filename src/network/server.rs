//! WebSocket Game Server
//!
//! Accept loop and per-connection tasks. Each connection gets a writer task
//! draining its outbound channel, and a reader loop that authenticates the
//! client and hands its messages to the [`Lobby`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::{accept_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, instrument, warn};

use crate::network::auth::{authenticate, AuthConfig, AuthError};
use crate::network::broadcast::EventBroadcaster;
use crate::network::lobby::Lobby;
use crate::network::matchmaking::MatchmakingConfig;
use crate::network::protocol::{
    AuthResult, ClientMessage, ErrorCode, ProtocolError, ServerMessage,
};
use crate::network::registry::{ConnectionHandle, ConnectionRegistry};
use crate::network::session::{SessionConfig, SessionManager};
use crate::persistence::{Identity, PersistenceGateway};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close a connection after this long without a client message.
    pub idle_timeout: Duration,
    /// Per-connection outbound channel capacity.
    pub outbound_buffer: usize,
    /// Optional JSON file of users to seed the store with.
    pub users_file: Option<PathBuf>,
    pub version: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            max_connections: 1000,
            idle_timeout: Duration::from_secs(300),
            outbound_buffer: 256,
            users_file: None,
            version: crate::VERSION.to_string(),
        }
    }
}

impl ServerConfig {
    /// Load from environment, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_parse("GRIS_BIND_ADDR").unwrap_or(defaults.bind_addr),
            max_connections: env_parse("GRIS_MAX_CONNECTIONS").unwrap_or(defaults.max_connections),
            idle_timeout: env_parse("GRIS_IDLE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_timeout),
            outbound_buffer: env_parse("GRIS_OUTBOUND_BUFFER")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.outbound_buffer),
            users_file: std::env::var("GRIS_USERS_FILE").ok().map(PathBuf::from),
            version: defaults.version,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Game server errors.
#[derive(Debug, thiserror::Error)]
pub enum GameServerError {
    #[error("Failed to bind: {0}")]
    BindFailed(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Why a connection's reader loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    ClientClosed,
    IdleTimeout,
    Superseded,
    Shutdown,
}

/// The game server.
pub struct GameServer {
    config: ServerConfig,
    auth: AuthConfig,
    gateway: Arc<dyn PersistenceGateway>,
    lobby: Arc<Lobby>,
    connections: AtomicUsize,
    shutdown_tx: broadcast::Sender<()>,
}

impl GameServer {
    pub fn new(
        config: ServerConfig,
        auth: AuthConfig,
        session_config: SessionConfig,
        matchmaking_config: MatchmakingConfig,
        gateway: Arc<dyn PersistenceGateway>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = EventBroadcaster::new();
        let sessions = Arc::new(SessionManager::new(
            session_config,
            Arc::clone(&registry),
            Arc::clone(&gateway),
            broadcaster.clone(),
        ));
        let lobby = Arc::new(Lobby::new(matchmaking_config, registry, sessions, broadcaster));

        if !auth.is_configured() {
            warn!("No AUTH_SECRET or AUTH_PUBLIC_KEY_PEM set, tokens are taken as usernames");
        }

        Self {
            config,
            auth,
            gateway,
            lobby,
            connections: AtomicUsize::new(0),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn lobby(&self) -> &Arc<Lobby> {
        &self.lobby
    }

    /// Bind the configured address and serve until shutdown.
    #[instrument(skip(self), fields(addr = %self.config.bind_addr))]
    pub async fn run(self: &Arc<Self>) -> Result<(), GameServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.run_with_listener(listener).await
    }

    /// Serve on an already bound listener until shutdown.
    pub async fn run_with_listener(self: &Arc<Self>, listener: TcpListener) -> Result<(), GameServerError> {
        info!("Game server listening on {}", listener.local_addr()?);

        let sweep = self.lobby.spawn_sweep(self.shutdown_tx.subscribe());
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.load(Ordering::Relaxed) >= self.config.max_connections {
                                warn!("Connection limit reached, rejecting {}", addr);
                                continue;
                            }
                            debug!("New connection from {}", addr);
                            self.handle_connection(stream, addr);
                        }
                        Err(e) => error!("Accept error: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        self.lobby.sessions().shutdown_all().await;
        if let Err(e) = sweep.await {
            warn!("Matchmaking sweep ended abnormally: {}", e);
        }
        Ok(())
    }

    fn handle_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let server = Arc::clone(self);
        server.connections.fetch_add(1, Ordering::Relaxed);

        tokio::spawn(async move {
            if let Err(e) = server.serve_connection(stream, addr).await {
                debug!("Connection {} ended with error: {}", addr, e);
            }
            server.connections.fetch_sub(1, Ordering::Relaxed);
        });
    }

    async fn serve_connection(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), GameServerError> {
        let ws_stream = accept_async(stream).await?;
        let (ws_sender, mut ws_receiver) = ws_stream.split();
        let (msg_tx, msg_rx) = mpsc::channel::<ServerMessage>(self.config.outbound_buffer);
        let (close_tx, close_rx) = oneshot::channel();
        let writer = spawn_writer(ws_sender, msg_rx, close_rx);

        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let identity = tokio::select! {
            identity = self.authenticate(addr, &mut ws_receiver, &msg_tx) => identity,
            _ = shutdown_rx.recv() => None,
        };

        if let Some(identity) = identity {
            let registration = self.lobby.connect(identity, msg_tx.clone()).await;
            let handle = registration.handle;
            info!("{} authenticated as {} ({})", addr, handle.identity().username, handle.player_id());

            let reason = self
                .read_loop(&handle, &mut ws_receiver, registration.kicked, &mut shutdown_rx)
                .await;
            if reason == CloseReason::Shutdown {
                let _ = msg_tx.try_send(ServerMessage::Shutdown {
                    reason: "Server shutting down".to_string(),
                });
            }

            self.lobby.disconnect(&handle).await;
            info!("{} ({}) disconnected: {:?}", handle.conn_id(), handle.player_id(), reason);
        }

        let _ = close_tx.send(());
        if let Err(e) = writer.await {
            warn!("Writer for {} ended abnormally: {}", addr, e);
        }
        Ok(())
    }

    /// Wait for a valid `auth` message. `None` if the client left first.
    async fn authenticate(
        &self,
        addr: SocketAddr,
        ws_receiver: &mut WsSource,
        msg_tx: &mpsc::Sender<ServerMessage>,
    ) -> Option<Identity> {
        loop {
            let frame = match tokio::time::timeout(self.config.idle_timeout, ws_receiver.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(e))) => {
                    debug!("WebSocket error from {} before auth: {}", addr, e);
                    return None;
                }
                Ok(None) => return None,
                Err(_) => {
                    debug!("{} never authenticated", addr);
                    return None;
                }
            };

            let message = match decode_frame(frame) {
                Decoded::Message(message) => message,
                Decoded::Invalid(e) => {
                    reply(msg_tx, ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()));
                    continue;
                }
                Decoded::Control => continue,
                Decoded::Closed => return None,
            };

            let token = match message {
                ClientMessage::Auth { token } => token,
                ClientMessage::Ping { timestamp } => {
                    reply(msg_tx, pong(timestamp));
                    continue;
                }
                _ => {
                    reply(msg_tx, ServerMessage::error(ErrorCode::NotAuthenticated, "Must authenticate first"));
                    continue;
                }
            };

            match self.resolve_identity(&token).await {
                Ok(identity) => {
                    reply(msg_tx, self.auth_result(Some(identity.clone()), None));
                    return Some(identity);
                }
                Err((code, message)) => {
                    debug!("{} failed auth: {}", addr, message);
                    reply(msg_tx, self.auth_result(None, Some(message.clone())));
                    reply(msg_tx, ServerMessage::error(code, message));
                }
            }
        }
    }

    async fn resolve_identity(&self, token: &str) -> Result<Identity, (ErrorCode, String)> {
        let username = authenticate(token, &self.auth).map_err(|e| {
            let code = match e {
                AuthError::Expired => ErrorCode::TokenExpired,
                AuthError::EmptyToken => ErrorCode::AuthFailed,
                _ => ErrorCode::InvalidToken,
            };
            (code, e.to_string())
        })?;

        match self.gateway.get_user_identity(&username).await {
            Ok(Some(identity)) => Ok(identity),
            Ok(None) => Err((ErrorCode::UnknownUser, format!("unknown user {}", username))),
            Err(e) => {
                warn!("Identity lookup for {} failed: {}", username, e);
                Err((ErrorCode::InternalError, "identity lookup failed".to_string()))
            }
        }
    }

    fn auth_result(&self, identity: Option<Identity>, error: Option<String>) -> ServerMessage {
        ServerMessage::AuthResult(AuthResult {
            success: identity.is_some(),
            identity,
            error,
            server_version: self.config.version.clone(),
        })
    }

    async fn read_loop(
        &self,
        handle: &ConnectionHandle,
        ws_receiver: &mut WsSource,
        mut kicked: oneshot::Receiver<()>,
        shutdown_rx: &mut broadcast::Receiver<()>,
    ) -> CloseReason {
        let idle = tokio::time::sleep(self.config.idle_timeout);
        tokio::pin!(idle);

        loop {
            tokio::select! {
                frame = ws_receiver.next() => {
                    let frame = match frame {
                        Some(Ok(frame)) => frame,
                        Some(Err(e)) => {
                            debug!("WebSocket error on {}: {}", handle.conn_id(), e);
                            return CloseReason::ClientClosed;
                        }
                        None => return CloseReason::ClientClosed,
                    };
                    idle.as_mut().reset(Instant::now() + self.config.idle_timeout);

                    match decode_frame(frame) {
                        Decoded::Message(message) => self.handle_message(handle, message).await,
                        Decoded::Invalid(e) => {
                            debug!("Invalid message from {}: {}", handle.conn_id(), e);
                            reply(handle.sender(), ServerMessage::error(ErrorCode::InvalidMessage, e.to_string()));
                        }
                        Decoded::Control => {}
                        Decoded::Closed => return CloseReason::ClientClosed,
                    }
                }
                _ = &mut kicked => return CloseReason::Superseded,
                _ = shutdown_rx.recv() => return CloseReason::Shutdown,
                _ = &mut idle => return CloseReason::IdleTimeout,
            }
        }
    }

    async fn handle_message(&self, handle: &ConnectionHandle, message: ClientMessage) {
        let sender = handle.sender();
        match message {
            ClientMessage::Auth { .. } => {
                reply(sender, ServerMessage::error(ErrorCode::InvalidMessage, "Already authenticated"));
            }
            ClientMessage::JoinQueue { difficulty } => {
                if let Err(e) = self.lobby.join_queue(handle, difficulty).await {
                    reply(sender, ServerMessage::error(e.code(), e.to_string()));
                }
            }
            ClientMessage::CancelQueue => match self.lobby.cancel_queue(handle).await {
                Ok(true) => {}
                Ok(false) => debug!("{} cancelled with no queue entry", handle.conn_id()),
                Err(e) => reply(sender, ServerMessage::error(e.code(), e.to_string())),
            },
            ClientMessage::Input { direction } => {
                if let Err(e) = self.lobby.submit_input(handle, direction).await {
                    debug!("Input from {} dropped: {}", handle.conn_id(), e);
                }
            }
            ClientMessage::Leave => {
                if let Err(e) = self.lobby.leave(handle).await {
                    reply(sender, ServerMessage::error(e.code(), e.to_string()));
                }
            }
            ClientMessage::Ping { timestamp } => reply(sender, pong(timestamp)),
        }
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Open WebSocket connections, authenticated or not.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn session_count(&self) -> usize {
        self.lobby.sessions().session_count().await
    }

    pub async fn queue_size(&self) -> usize {
        self.lobby.queue_len().await
    }
}

enum Decoded {
    Message(ClientMessage),
    Invalid(ProtocolError),
    Control,
    Closed,
}

fn decode_frame(frame: Message) -> Decoded {
    match frame {
        Message::Text(text) => match ClientMessage::from_json(&text) {
            Ok(message) => Decoded::Message(message),
            Err(e) => Decoded::Invalid(e),
        },
        Message::Binary(_) => Decoded::Invalid(ProtocolError::BinaryFrame),
        Message::Close(_) => Decoded::Closed,
        _ => Decoded::Control,
    }
}

fn pong(timestamp: u64) -> ServerMessage {
    ServerMessage::Pong {
        timestamp,
        server_time: chrono::Utc::now().timestamp_millis() as u64,
    }
}

fn reply(sender: &mpsc::Sender<ServerMessage>, message: ServerMessage) {
    if sender.try_send(message).is_err() {
        debug!("Reply dropped, outbound buffer full or closed");
    }
}

/// Forward outbound messages to the socket until `close` fires, then flush
/// what is already queued and send a close frame.
fn spawn_writer(
    mut ws_sender: WsSink,
    mut msg_rx: mpsc::Receiver<ServerMessage>,
    mut close: oneshot::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = msg_rx.recv() => match msg {
                    Some(msg) => {
                        if write_message(&mut ws_sender, &msg).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = &mut close => {
                    while let Ok(msg) = msg_rx.try_recv() {
                        if write_message(&mut ws_sender, &msg).await.is_err() {
                            return;
                        }
                    }
                    break;
                }
            }
        }
        let _ = ws_sender.close().await;
    })
}

async fn write_message(
    ws_sender: &mut WsSink,
    msg: &ServerMessage,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    match msg.to_json() {
        Ok(text) => ws_sender.send(Message::Text(text)).await,
        Err(e) => {
            error!("Failed to serialize message: {}", e);
            Ok(())
        }
    }
}
