use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::matcher::Matcher;
use crate::registry::ConnectionRegistry;
use crate::relay::Relay;
use crate::session::SessionController;
use crate::store::Store;

/// Shared application state passed to all handlers and extractors.
///
/// Every field is cheaply cloneable (`Arc`-backed), so cloning `AppState` per
/// request or per connection is inexpensive.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub connections: ConnectionRegistry,
    pub matcher: Matcher,
    pub relay: Relay,
    pub sessions: SessionController,
    pub config: Arc<Config>,
    pub started_at: DateTime<Utc>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let config = Arc::new(config);
        let connections = ConnectionRegistry::new();
        let matcher = Matcher::new(store.clone(), connections.clone());
        let relay = Relay::new(store.clone(), connections.clone());
        let sessions = SessionController::new(store.clone(), connections.clone(), matcher.clone());

        AppState {
            store,
            connections,
            matcher,
            relay,
            sessions,
            config,
            started_at: Utc::now(),
        }
    }

    pub fn uptime_secs(&self) -> i64 {
        Utc::now().signed_duration_since(self.started_at).num_seconds().max(0)
    }
}
