use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use islandgold_core::net::messages::{ClientMessage, JoinMsg, ServerMessage, SnapshotMsg};
use islandgold_core::net::protocol::{
    PROTOCOL_VERSION, decode_server_message, encode_client_message,
};

use islandgold_server::{build_app, spawn_idle_reaper};
use islandgold_server::config::ServerConfig;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct TestServer {
    pub addr: SocketAddr,
    _shutdown: tokio::task::JoinHandle<()>,
}

/// Small matches whose clock effectively never ticks.
pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.game.treasure_count = 5;
    config.matches.tick_interval_ms = 3_600_000;
    config
}

impl TestServer {
    pub async fn new() -> Self {
        Self::from_config(test_config()).await
    }

    /// Admin endpoints require `token`.
    pub async fn with_admin_token(token: &str) -> Self {
        let config = ServerConfig {
            admin_token: Some(token.to_string()),
            ..test_config()
        };
        Self::from_config(config).await
    }

    /// Matches last `duration_secs` ticks of `tick_ms` each and reset
    /// one tick after ending.
    pub async fn with_fast_clock(duration_secs: u32, tick_ms: u64) -> Self {
        let mut config = test_config();
        config.game.duration_secs = duration_secs;
        config.game.auto_reset_secs = Some(1);
        config.matches.tick_interval_ms = tick_ms;
        Self::from_config(config).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config);
        spawn_idle_reaper(state);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _shutdown: handle,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn match_url(&self, match_id: &str) -> String {
        format!("ws://{}/ws/{match_id}", self.addr)
    }
}

/// Connect a WebSocket client to the given URL.
pub async fn ws_connect(url: &str) -> WsStream {
    let (stream, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    stream
}

/// Send a ClientMessage from a WS stream.
pub async fn ws_send_client_msg(stream: &mut WsStream, msg: &ClientMessage) {
    let encoded = encode_client_message(msg).unwrap();
    stream.send(Message::Binary(encoded.into())).await.unwrap();
}

pub fn join_msg(name: &str) -> ClientMessage {
    ClientMessage::Join(JoinMsg {
        display_name: name.to_string(),
        protocol_version: PROTOCOL_VERSION,
    })
}

/// Join and return the snapshot, which is always the joiner's first frame.
pub async fn ws_join(stream: &mut WsStream, name: &str) -> SnapshotMsg {
    ws_send_client_msg(stream, &join_msg(name)).await;
    match ws_read_server_msg(stream).await {
        ServerMessage::Snapshot(s) => *s,
        other => panic!("Expected Snapshot, got: {other:?}"),
    }
}

/// Connect to `url` and join.
pub async fn ws_connect_and_join(url: &str, name: &str) -> (WsStream, SnapshotMsg) {
    let mut stream = ws_connect(url).await;
    let snapshot = ws_join(&mut stream, name).await;
    (stream, snapshot)
}

/// Read raw binary data from a WebSocket stream (5s timeout).
pub async fn ws_read_raw(stream: &mut WsStream) -> Vec<u8> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) => panic!("WebSocket closed unexpectedly"),
                Some(Err(e)) => panic!("WebSocket error: {e}"),
                None => panic!("WebSocket stream ended"),
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for WebSocket message")
}

/// Try to read raw binary data, returning None on timeout.
pub async fn ws_try_read_raw(stream: &mut WsStream, timeout_ms: u64) -> Option<Vec<u8>> {
    let deadline = Duration::from_millis(timeout_ms);
    tokio::time::timeout(deadline, async {
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => return data.to_vec(),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    panic!("WebSocket error or closed")
                },
                _ => continue,
            }
        }
    })
    .await
    .ok()
}

/// Read the next ServerMessage from a WebSocket stream (5s timeout).
pub async fn ws_read_server_msg(stream: &mut WsStream) -> ServerMessage {
    let data = ws_read_raw(stream).await;
    decode_server_message(&data).unwrap()
}

/// Skip messages until one satisfies `pred`.
pub async fn ws_read_until(
    stream: &mut WsStream,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    loop {
        let msg = ws_read_server_msg(stream).await;
        if pred(&msg) {
            return msg;
        }
    }
}

/// Wait for the server to close the socket. Returns the binary frames
/// received before the close.
pub async fn ws_expect_closed(stream: &mut WsStream) -> Vec<ServerMessage> {
    let deadline = Duration::from_secs(5);
    tokio::time::timeout(deadline, async {
        let mut seen = Vec::new();
        loop {
            match stream.next().await {
                Some(Ok(Message::Binary(data))) => {
                    seen.push(decode_server_message(&data).unwrap());
                },
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return seen,
                _ => continue,
            }
        }
    })
    .await
    .expect("Timed out waiting for the server to close")
}
