use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_governor::GovernorLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use stranger_relay::admission::{cors_layer, governor_config, hsts_layer, security_header_layers};
use stranger_relay::config::Config;
use stranger_relay::handlers;
use stranger_relay::state::AppState;
use stranger_relay::store::InMemoryStore;
use stranger_relay::websocket::websocket_handler;

#[tokio::main]
async fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "stranger_relay=info,tower_http=info".parse().unwrap());

    if std::env::var("APP_ENV").as_deref() == Ok("production") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("stranger-relay starting up");

    let config = Config::from_env();
    let addr = config.server_addr();

    let store: Arc<dyn stranger_relay::store::Store> = Arc::new(InMemoryStore::new());
    let state = AppState::new(store, config);

    // Background tickers: queue-status updates and session GC, each a
    // single shared task rather than per-user/per-session timers (§9).
    state.matcher.clone().spawn_queue_ticker(state.config.queue_tick);
    state
        .sessions
        .clone()
        .spawn_session_gc(state.config.session_retention, state.config.queue_tick);
    spawn_heartbeat_sweep(state.clone());

    // Exempt paths (§4.7) are registered outside the rate-limited sub-router.
    let exempt_routes = Router::new()
        .route("/api/stats", get(handlers::stats))
        .route("/api/health", get(handlers::health))
        .route("/api/interests/suggestions", get(handlers::interest_suggestions))
        .route("/api/analytics", get(handlers::analytics))
        .route("/api/poll", post(handlers::accept_and_acknowledge));

    let governor_conf = governor_config(&state.config);
    let limited_routes = Router::new()
        .route("/api/feedback", post(handlers::accept_and_acknowledge))
        .route("/api/report", post(handlers::accept_and_acknowledge))
        .route("/api/messages", post(handlers::accept_and_acknowledge))
        .layer(GovernorLayer { config: governor_conf });

    let mut app = Router::new()
        .route("/ws", get(websocket_handler))
        .merge(exempt_routes)
        .merge(limited_routes);

    for layer in security_header_layers() {
        app = app.layer(layer);
    }
    if !state.config.is_dev {
        app = app.layer(hsts_layer());
    }
    app = app.layer(cors_layer(&state.config)).with_state(state);

    info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind to address");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .expect("server failed to start");
}

/// Single background task that walks every live connection every
/// `heartbeat_interval`: it pings everything still within budget and closes
/// (code `1000`) anything that has not produced a frame (including a
/// `ping`/`heartbeat`) within `heartbeat_timeout` (§4.2/§5).
fn spawn_heartbeat_sweep(state: AppState) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(state.config.heartbeat_interval);
        loop {
            ticker.tick().await;
            let timeout_millis = state.config.heartbeat_timeout.as_millis() as i64;
            let now = chrono::Utc::now().timestamp_millis();
            for (user_id, handle) in state.connections.all_connections() {
                if now - handle.last_seen_millis() >= timeout_millis {
                    tracing::debug!(%user_id, "heartbeat timeout; closing connection");
                    state.connections.close_and_release(user_id, 1000);
                    state.sessions.on_connection_close(user_id).await;
                } else {
                    handle.ping();
                }
            }
        }
    });
}
