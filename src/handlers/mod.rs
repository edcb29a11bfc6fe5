use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use crate::models::ChatType;
use crate::state::AppState;

/// `GET /api/stats` — aggregate counters derived from current Store state.
/// Exempt from the HTTP rate limiter (§4.7).
pub async fn stats(State(state): State<AppState>) -> Json<Value> {
    let users = state.store.get_all_online_users().await;
    let text_users = users.iter().filter(|u| u.chat_type == Some(ChatType::Text)).count();
    let video_users = users.iter().filter(|u| u.chat_type == Some(ChatType::Video)).count();

    Json(json!({
        "activeUsers": users.len(),
        "chatsToday": 0,
        "countries": Vec::<String>::new(),
        "textUsers": text_users,
        "videoUsers": video_users,
        "avgWaitTime": 15,
        "serverUptime": state.uptime_secs(),
        "lastUpdated": chrono::Utc::now(),
    }))
}

/// `GET /api/health` — exempt from the HTTP rate limiter (§4.7).
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime": state.uptime_secs(),
        "connections": state.connections.connection_count(),
    }))
}

/// `GET /api/interests/suggestions` — exempt from the HTTP rate limiter.
/// The in-memory Store does not track interest popularity over time, so
/// this returns a fixed starter set; a durable backend could replace this
/// with real trending data without changing the response shape.
pub async fn interest_suggestions() -> Json<Value> {
    Json(json!({
        "trending": ["music", "gaming", "movies"],
        "popular": ["music", "gaming", "movies", "books", "sports", "travel"],
    }))
}

/// `GET /api/analytics` — exempt from the HTTP rate limiter.
pub async fn analytics(State(state): State<AppState>) -> Json<Value> {
    let users = state.store.get_all_online_users().await;
    let top_interests = most_common_interests(&users, 10);

    Json(json!({
        "topInterests": top_interests,
        "hourlyBuckets": Vec::<u32>::new(),
        "activeUsers": users.len(),
    }))
}

fn most_common_interests(users: &[crate::models::OnlineUser], limit: usize) -> Vec<(String, usize)> {
    use std::collections::HashMap;
    let mut counts: HashMap<String, usize> = HashMap::new();
    for user in users {
        for interest in &user.interests {
            *counts.entry(interest.clone()).or_insert(0) += 1;
        }
    }
    let mut pairs: Vec<(String, usize)> = counts.into_iter().collect();
    pairs.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    pairs.truncate(limit);
    pairs
}

/// `POST /api/feedback`, `/api/report`, `/api/poll`, `/api/messages` — all
/// accepted and acknowledged, not part of the core matchmaking semantics
/// (§6.2). `/api/poll` is additionally exempt from the rate limiter.
pub async fn accept_and_acknowledge(body: Option<Json<Value>>) -> (StatusCode, Json<Value>) {
    let _ = body;
    (StatusCode::ACCEPTED, Json(json!({ "acknowledged": true })))
}
