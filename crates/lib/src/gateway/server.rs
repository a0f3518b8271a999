//! Gateway HTTP + WebSocket server (single port).

use crate::channels::{
    build_error_envelope, Broadcaster, CallFrame, CallTrace, ChannelHandler, ChannelRegistry,
    ChatChannel, ConnectionCtx,
};
use crate::config::{self, Config, Environment};
use crate::envelope::Envelope;
use crate::gateway::protocol::{
    canonical_identifier, parse_identifier, ClientCommand, ServerFrame, COMMAND_MESSAGE, COMMAND_SUBSCRIBE,
    COMMAND_UNSUBSCRIBE, PROTOCOL_VERSION,
};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const SHUTDOWN_FRAME_JSON: &str = r#"{"type":"disconnect","reason":"server_restart","reconnect":true}"#;

const PING_INTERVAL: Duration = Duration::from_secs(3);

const ANONYMOUS_USER: &str = "anonymous";

/// Frames queued per connection before forwarded broadcasts start being dropped.
const OUTBOUND_CAPACITY: usize = 64;

/// When auth mode is token and a token is configured, returns it for connection validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Shared state for the gateway (config, channels, topic fan-out).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// When Some, the cable upgrade must carry `?token=` matching this.
    pub required_token: Option<String>,
    /// Decides whether error envelopes carry the real message.
    pub environment: Environment,
    /// Broadcasts raw frames to every connection (e.g. the shutdown disconnect).
    pub event_tx: broadcast::Sender<String>,
    pub channels: Arc<ChannelRegistry>,
    pub broadcaster: Arc<Broadcaster>,
}

impl GatewayState {
    /// State with the built-in channels registered.
    pub async fn new(config: Config) -> Self {
        let required_token = require_connect_token(&config);
        let environment = config::resolve_environment(&config);
        let (event_tx, _) = broadcast::channel(64);
        let broadcaster = Arc::new(Broadcaster::new());
        let channels = Arc::new(ChannelRegistry::new());
        channels
            .register(Arc::new(ChatChannel::new(broadcaster.clone())))
            .await;
        Self {
            config: Arc::new(config),
            required_token,
            environment,
            event_tx,
            channels,
            broadcaster,
        }
    }
}

/// Routes: `GET /` health, `GET /cable` WebSocket upgrade.
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/cable", get(cable_handler))
        .with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or PARLOR_GATEWAY_TOKEN)",
                bind
            );
        }
    }

    let port = config.gateway.port;
    let state = GatewayState::new(config).await;
    log::info!(
        "gateway environment: {} (channels: {})",
        state.environment.as_str(),
        state.channels.names().await.join(", ")
    );
    let event_tx = state.event_tx.clone();
    let app = router(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Tells every cable connection to disconnect and reconnect later.
async fn shutdown_signal(event_tx: broadcast::Sender<String>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("installing Ctrl+C handler failed: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                log::error!("installing SIGTERM handler failed: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, disconnecting cable clients");

    let _ = event_tx.send(SHUTDOWN_FRAME_JSON.to_string());
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<GatewayState>) -> Json<Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct CableQuery {
    user: Option<String>,
    token: Option<String>,
}

/// GET /cable upgrades to WebSocket after checking the token (when required).
async fn cable_handler(
    State(state): State<GatewayState>,
    Query(query): Query<CableQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(ref required) = state.required_token {
        let provided = query.token.as_deref().unwrap_or("").trim();
        if provided != required {
            log::debug!("cable upgrade refused: gateway token missing or mismatched");
            return (StatusCode::UNAUTHORIZED, "unauthorized: gateway token mismatch").into_response();
        }
    }
    let user = query
        .user
        .map(|u| u.trim().to_string())
        .filter(|u| !u.is_empty())
        .unwrap_or_else(|| ANONYMOUS_USER.to_string());
    ws.on_upgrade(move |socket| handle_socket(socket, state, ConnectionCtx::new(user)))
}

/// One accepted subscription on a connection.
struct ConnSubscription {
    /// Identifier exactly as the client sent it; frames for this subscription carry it.
    identifier: String,
    channel: Arc<dyn ChannelHandler>,
    params: Map<String, Value>,
    /// One forwarder per streamed topic.
    forwarders: Vec<(String, JoinHandle<()>)>,
}

impl ConnSubscription {
    /// Stop forwarding, release topics nobody else streams, then tell the channel.
    async fn close(self, conn: &ConnectionCtx, broadcaster: &Broadcaster) {
        for (topic, forwarder) in self.forwarders {
            forwarder.abort();
            // Awaiting the aborted task drops its receiver before the release check.
            let _ = forwarder.await;
            broadcaster.release(&topic).await;
        }
        self.channel.unsubscribed(conn, &self.params).await;
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState, conn: ConnectionCtx) {
    log::debug!("cable connection {} opened for {}", conn.id, conn.user);
    let mut event_rx = state.event_tx.subscribe();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let mut subscriptions: HashMap<String, ConnSubscription> = HashMap::new();
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + PING_INTERVAL, PING_INTERVAL);

    if socket
        .send(Message::Text(ServerFrame::welcome().to_text()))
        .await
        .is_err()
    {
        return;
    }

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_FRAME_JSON;
                        let _ = socket.send(Message::Text(text)).await;
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("cable client lagged {} broadcast frames", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            Some(text) = out_rx.recv() => {
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                let frame = ServerFrame::ping(chrono::Utc::now().timestamp());
                if socket.send(Message::Text(frame.to_text())).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let cmd: ClientCommand = match serde_json::from_str(&text) {
                    Ok(c) => c,
                    Err(e) => {
                        log::warn!("cable connection {}: ignoring malformed command: {}", conn.id, e);
                        continue;
                    }
                };
                if let Some(reply) = handle_command(&state, &conn, &mut subscriptions, &out_tx, cmd).await {
                    if socket.send(Message::Text(reply.to_text())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    for (_, sub) in subscriptions.drain() {
        sub.close(&conn, &state.broadcaster).await;
    }
    log::debug!("cable connection {} closed", conn.id);
}

/// Apply one client command and return the frame to send straight back, if any.
/// Commands on a connection run in arrival order. Subscriptions are keyed by
/// `canonical_identifier`, so key order inside the identifier does not matter.
async fn handle_command(
    state: &GatewayState,
    conn: &ConnectionCtx,
    subscriptions: &mut HashMap<String, ConnSubscription>,
    out_tx: &mpsc::Sender<String>,
    cmd: ClientCommand,
) -> Option<ServerFrame> {
    match cmd.command.as_str() {
        COMMAND_SUBSCRIBE => {
            let Some(key) = canonical_identifier(&cmd.identifier) else {
                log::warn!("cable connection {}: invalid identifier {}", conn.id, cmd.identifier);
                return Some(ServerFrame::reject(cmd.identifier));
            };
            if subscriptions.contains_key(&key) {
                log::debug!("cable connection {}: already subscribed to {}", conn.id, key);
                return None;
            }
            let Some((channel_name, params)) = parse_identifier(&cmd.identifier) else {
                return Some(ServerFrame::reject(cmd.identifier));
            };
            let Some(channel) = state.channels.get(&channel_name).await else {
                log::warn!("cable connection {}: unknown channel {}", conn.id, channel_name);
                return Some(ServerFrame::reject(cmd.identifier));
            };
            let topics = match channel.subscribed(conn, &params).await {
                Ok(t) => t,
                Err(e) => {
                    log::info!("cable connection {}: {} rejected subscription: {}", conn.id, channel_name, e);
                    return Some(ServerFrame::reject(cmd.identifier));
                }
            };
            let mut forwarders = Vec::with_capacity(topics.len());
            for topic in topics {
                let rx = state.broadcaster.subscribe(&topic).await;
                let forwarder = spawn_forwarder(rx, cmd.identifier.clone(), out_tx.clone());
                forwarders.push((topic, forwarder));
            }
            log::debug!("cable connection {}: subscribed to {}", conn.id, key);
            subscriptions.insert(
                key,
                ConnSubscription {
                    identifier: cmd.identifier.clone(),
                    channel,
                    params,
                    forwarders,
                },
            );
            Some(ServerFrame::confirm(cmd.identifier))
        }
        COMMAND_UNSUBSCRIBE => {
            let removed = canonical_identifier(&cmd.identifier).and_then(|key| subscriptions.remove(&key));
            match removed {
                Some(sub) => {
                    sub.close(conn, &state.broadcaster).await;
                    log::debug!("cable connection {}: unsubscribed from {}", conn.id, cmd.identifier);
                }
                None => {
                    log::debug!("cable connection {}: unsubscribe for unknown {}", conn.id, cmd.identifier);
                }
            }
            None
        }
        COMMAND_MESSAGE => {
            let sub = canonical_identifier(&cmd.identifier).and_then(|key| subscriptions.get(&key));
            let Some(sub) = sub else {
                log::warn!("cable connection {}: message for unknown subscription {}", conn.id, cmd.identifier);
                return None;
            };
            let Some((action, data)) = cmd.action() else {
                log::warn!("cable connection {}: message without an action on {}", conn.id, cmd.identifier);
                return None;
            };
            let mut trace = CallTrace::new();
            trace.push(CallFrame::framework("receive"));
            trace.push(CallFrame::channel("dispatch_action"));
            let Err(e) = sub
                .channel
                .perform(conn, &sub.params, &action, &data, &mut trace)
                .await
            else {
                return None;
            };
            let envelope = build_error_envelope(&e, sub.channel.name(), &trace, state.environment);
            log::warn!(
                "{}#{} failed for {}: {}",
                sub.channel.name(),
                envelope.get_str("action").unwrap_or_default(),
                conn.user,
                e
            );
            Some(ServerFrame::message(sub.identifier.clone(), envelope.to_value()))
        }
        other => {
            log::warn!("cable connection {}: unknown command {}", conn.id, other);
            None
        }
    }
}

/// Forward a topic's broadcasts to one connection as message frames under `identifier`.
/// When the connection's queue is full the frame is dropped; the forwarder stops once
/// the connection is gone.
fn spawn_forwarder(
    mut rx: broadcast::Receiver<Envelope>,
    identifier: String,
    out_tx: mpsc::Sender<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    let frame = ServerFrame::message(identifier.clone(), envelope.to_value());
                    match out_tx.try_send(frame.to_text()) {
                        Ok(()) => {}
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            log::debug!("subscription {}: connection queue full, dropping frame", identifier);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => break,
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::debug!("subscription {} lagged {} broadcasts", identifier, n);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
