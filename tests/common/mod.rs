// Each integration test file is a separate binary; helpers not used in every
// binary would otherwise trigger dead_code warnings from clippy.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use stranger_relay::config::Config;
use stranger_relay::state::AppState;
use stranger_relay::store::InMemoryStore;
use stranger_relay::websocket::websocket_handler;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// How long a single `recv_frame` call waits before giving up — long enough
/// for the background tickers under test (queue status, heartbeat) to fire,
/// short enough that a genuinely missing frame doesn't hang the suite.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a fresh app on an ephemeral port, backed by its own `InMemoryStore`.
/// Returns the `ws://` base URL for `/ws`. The server task is never joined;
/// it is dropped when the test process exits.
pub async fn spawn_app() -> String {
    spawn_app_with_config(test_config()).await
}

pub async fn spawn_app_with_config(config: Config) -> String {
    let store: Arc<dyn stranger_relay::store::Store> = Arc::new(InMemoryStore::new());
    let state = AppState::new(store, config);

    state.matcher.clone().spawn_queue_ticker(state.config.queue_tick);

    let app: Router = Router::new()
        .route("/ws", get(websocket_handler))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .unwrap();
    });

    format!("ws://{addr}/ws")
}

/// Config tuned for fast tests: a 1-second queue tick instead of the 10s
/// production default, so `queue_status` assertions don't need to wait.
pub fn test_config() -> Config {
    Config {
        server_host: "127.0.0.1".into(),
        server_port: 0,
        max_ws_per_ip: 100,
        max_connections: 1000,
        rate_limit_per_15min: 1000,
        cors_origins: vec![],
        is_dev: true,
        heartbeat_interval: Duration::from_secs(30),
        heartbeat_timeout: Duration::from_secs(60),
        queue_tick: Duration::from_secs(1),
        session_retention: Duration::from_secs(60),
    }
}

pub type WsClient = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub async fn connect(url: &str) -> WsClient {
    let (stream, _) = connect_async(url).await.expect("failed to connect");
    stream
}

pub async fn send_frame(client: &mut WsClient, frame: Value) {
    client
        .send(WsMessage::Text(frame.to_string()))
        .await
        .expect("failed to send frame");
}

/// Receive and decode the next text frame, skipping anything that isn't text
/// (pings, etc.), or panic if none arrives within `RECV_TIMEOUT`.
pub async fn recv_frame(client: &mut WsClient) -> Value {
    timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("websocket error: {e}"),
                None => panic!("connection closed before a frame arrived"),
            }
        }
    })
    .await
    .expect("timed out waiting for a frame")
}

/// Receive frames until one with the given `type` shows up, or panic after
/// `RECV_TIMEOUT`. Used when a ticker frame (e.g. `queue_status`) can race
/// with the frame under test.
pub async fn recv_frame_of_type(client: &mut WsClient, frame_type: &str) -> Value {
    timeout(RECV_TIMEOUT, async {
        loop {
            let frame = recv_frame(client).await;
            if frame["type"] == frame_type {
                return frame;
            }
        }
    })
    .await
    .expect("timed out waiting for frame of expected type")
}

/// Read frames until a `Close` frame arrives and return its code, skipping
/// any text frames (e.g. a trailing `error`) sent before it.
pub async fn recv_close_code(client: &mut WsClient) -> u16 {
    timeout(RECV_TIMEOUT, async {
        loop {
            match client.next().await {
                Some(Ok(WsMessage::Close(Some(frame)))) => return frame.code.into(),
                Some(Ok(WsMessage::Close(None))) => panic!("close frame carried no code"),
                Some(Ok(_)) => continue,
                Some(Err(e)) => panic!("websocket error: {e}"),
                None => panic!("connection closed without a close frame"),
            }
        }
    })
    .await
    .expect("timed out waiting for a close frame")
}

pub async fn join(client: &mut WsClient, interests: &[&str]) -> String {
    send_frame(
        client,
        serde_json::json!({ "type": "join", "interests": interests }),
    )
    .await;
    let frame = recv_frame_of_type(client, "user_joined").await;
    frame["userId"].as_str().unwrap().to_string()
}
