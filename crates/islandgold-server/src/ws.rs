use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use islandgold_core::net::messages::{ClientMessage, JoinRejectedMsg, ServerMessage};
use islandgold_core::net::protocol::{
    MAX_MESSAGE_SIZE, PROTOCOL_VERSION, decode_client_message, decode_message_type,
    encode_server_message,
};
use islandgold_core::player::ConnectionId;

use crate::error::AppError;
use crate::match_loop::{MatchCommand, MatchHandle};
use crate::state::{AppState, ConnectionGuard};

/// How long a fresh socket may wait before sending its `Join`.
const JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// `GET /ws`: join the default match.
pub async fn ws_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let match_id = state.config.matches.default_match.clone();
    upgrade(state, match_id, ws).await
}

/// `GET /ws/{match_id}`: join a named match, creating it if needed.
pub async fn ws_match_handler(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    upgrade(state, match_id, ws).await
}

async fn upgrade(
    state: AppState,
    match_id: String,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let max_ws = state.config.limits.max_ws_connections;
    let Some(guard) = ConnectionGuard::try_acquire(&state.ws_connection_count, max_ws) else {
        tracing::warn!(max = max_ws, "WS connection limit reached");
        return Err(AppError::Unavailable("connection limit reached".into()));
    };
    let handle = state.matches.write().await.get_or_create(&match_id)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, handle, guard)))
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    handle: MatchHandle,
    _guard: ConnectionGuard,
) {
    let conn = state.alloc_connection_id();
    let match_id = handle.match_id().to_string();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // The first frame must be a Join.
    let join = match tokio::time::timeout(JOIN_TIMEOUT, ws_receiver.next()).await {
        Ok(Some(Ok(Message::Binary(data)))) => match decode_client_message(&data) {
            Ok(ClientMessage::Join(join)) => join,
            Ok(other) => {
                tracing::debug!(conn_id = conn, msg_type = ?other.message_type(), "First frame was not a join");
                close(&mut ws_sender).await;
                return;
            },
            Err(e) => {
                tracing::debug!(conn_id = conn, error = %e, "Undecodable first frame");
                close(&mut ws_sender).await;
                return;
            },
        },
        Ok(Some(Ok(other))) => {
            tracing::debug!(conn_id = conn, frame = ?other, "First frame was not binary");
            close(&mut ws_sender).await;
            return;
        },
        Ok(Some(Err(e))) => {
            tracing::debug!(conn_id = conn, error = %e, "Socket error before join");
            close(&mut ws_sender).await;
            return;
        },
        Ok(None) => {
            tracing::debug!(conn_id = conn, "Socket closed before join");
            return;
        },
        Err(_) => {
            tracing::debug!(conn_id = conn, "No join before timeout");
            close(&mut ws_sender).await;
            return;
        },
    };

    if join.protocol_version != PROTOCOL_VERSION {
        let reason = format!(
            "protocol version mismatch: client={}, server={}",
            join.protocol_version, PROTOCOL_VERSION
        );
        reject_join(&mut ws_sender, &reason).await;
        return;
    }

    let (tx, rx) = mpsc::channel::<Bytes>(state.config.limits.player_message_buffer);
    state.matches.write().await.connection_opened(&match_id);
    let player_id = match handle.join(conn, join.display_name, tx).await {
        Some(Ok(id)) => id,
        Some(Err(e)) => {
            reject_join(&mut ws_sender, &e.to_string()).await;
            state.matches.write().await.connection_closed(&match_id);
            return;
        },
        None => {
            reject_join(&mut ws_sender, "match is not available").await;
            state.matches.write().await.connection_closed(&match_id);
            return;
        },
    };
    tracing::info!(conn_id = conn, player_id, match_id = %match_id, "Player connected");

    spawn_writer(ws_sender, rx);
    read_loop(&mut ws_receiver, &state, &handle, conn).await;

    // The actor drops our sender on Leave, which ends the writer.
    handle.send(MatchCommand::Leave { conn });
    state.matches.write().await.connection_closed(&match_id);
    tracing::info!(conn_id = conn, player_id, match_id = %match_id, "Player disconnected");
}

async fn close(ws_sender: &mut SplitSink<WebSocket, Message>) {
    let _ = ws_sender.send(Message::Close(None)).await;
}

async fn reject_join(ws_sender: &mut SplitSink<WebSocket, Message>, reason: &str) {
    tracing::info!(reason, "Join rejected");
    let msg = ServerMessage::JoinRejected(JoinRejectedMsg {
        reason: reason.to_string(),
    });
    match encode_server_message(&msg) {
        Ok(data) => {
            if let Err(e) = ws_sender.send(Message::Binary(data.into())).await {
                tracing::warn!(error = %e, "Failed to send join rejection");
            }
        },
        Err(e) => tracing::error!(error = %e, "Failed to encode join rejection"),
    }
    close(ws_sender).await;
}

fn spawn_writer(mut ws_sender: SplitSink<WebSocket, Message>, mut rx: mpsc::Receiver<Bytes>) {
    tokio::spawn(async move {
        while let Some(data) = rx.recv().await {
            if ws_sender.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
        close(&mut ws_sender).await;
    });
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the frame is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    handle: &MatchHandle,
    conn: ConnectionId,
) {
    let rate = state.config.limits.ws_rate_limit_per_sec;
    let mut rate_limiter = RateLimiter::new(rate, rate);

    while let Some(Ok(msg)) = ws_receiver.next().await {
        let data = match msg {
            Message::Binary(d) => d,
            Message::Close(_) => break,
            _ => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(conn_id = conn, "Rate limited");
            continue;
        }

        let Some(cmd) = command_for(conn, &data) else {
            continue;
        };
        if !handle.send(cmd) {
            tracing::warn!(conn_id = conn, "Match actor gone, closing connection");
            break;
        }
    }
}

/// Turn one inbound frame into a match command, or `None` if the frame
/// must be dropped.
fn command_for(conn: ConnectionId, data: &[u8]) -> Option<MatchCommand> {
    if data.is_empty() {
        return None;
    }
    if data.len() > MAX_MESSAGE_SIZE {
        tracing::warn!(conn_id = conn, len = data.len(), "Dropped oversized frame");
        return None;
    }
    let msg_type = match decode_message_type(data) {
        Ok(t) => t,
        Err(e) => {
            tracing::debug!(conn_id = conn, error = %e, "Dropped frame with bad type byte");
            return None;
        },
    };
    if msg_type.is_server_only() {
        tracing::warn!(conn_id = conn, ?msg_type, "Rejected server-only message from client");
        return None;
    }
    let msg = match decode_client_message(data) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(conn_id = conn, ?msg_type, error = %e, "Dropped undecodable frame");
            return None;
        },
    };

    match msg {
        ClientMessage::Join(_) => {
            tracing::debug!(conn_id = conn, "Repeated join ignored");
            None
        },
        ClientMessage::Move(m) => match m.validate() {
            Ok(pose) => Some(MatchCommand::Move { conn, pose }),
            Err(e) => {
                tracing::debug!(conn_id = conn, error = %e, "Dropped invalid move");
                None
            },
        },
        ClientMessage::Collect(c) => match c.validate() {
            Ok(()) => Some(MatchCommand::Collect {
                conn,
                treasure_id: c.treasure_id,
                generation: c.generation,
            }),
            Err(e) => {
                tracing::debug!(conn_id = conn, error = %e, "Dropped invalid collect");
                None
            },
        },
        ClientMessage::Ready(_) => Some(MatchCommand::Ready { conn }),
    }
}
