mod common;

use common::*;
use serde_json::json;

/// S1 — a male caller interested in music/gaming and a female responder
/// interested in music are paired with a high-quality, cross-gender match.
#[tokio::test]
async fn cross_gender_interest_match_is_high_quality() {
    let url = spawn_app().await;
    let mut a = connect(&url).await;
    let mut b = connect(&url).await;

    join(&mut a, &["music", "gaming"]).await;
    join(&mut b, &["music"]).await;

    send_frame(
        &mut a,
        json!({"type": "find_match", "chatType": "text", "interests": ["music", "gaming"], "gender": "male"}),
    )
    .await;
    let waiting = recv_frame_of_type(&mut a, "waiting_for_match").await;
    assert_eq!(waiting["queuePosition"], 1);

    send_frame(
        &mut b,
        json!({"type": "find_match", "chatType": "text", "interests": ["music"], "gender": "female"}),
    )
    .await;

    let match_a = recv_frame_of_type(&mut a, "match_found").await;
    let match_b = recv_frame_of_type(&mut b, "match_found").await;

    assert_eq!(match_a["sessionId"], match_b["sessionId"]);
    assert_eq!(match_a["sharedInterests"], json!(["music"]));
    assert_eq!(match_a["matchQuality"], "high");
    assert_eq!(match_b["matchQuality"], "high");
}

/// S2 — with no other waiting users, the caller sits in the pool and
/// eventually hears back from the queue-status ticker.
#[tokio::test]
async fn empty_pool_falls_back_to_waiting_then_queue_status() {
    let url = spawn_app().await;
    let mut a = connect(&url).await;
    join(&mut a, &[]).await;

    send_frame(
        &mut a,
        json!({"type": "find_match", "chatType": "video", "interests": [], "gender": "female"}),
    )
    .await;

    let waiting = recv_frame_of_type(&mut a, "waiting_for_match").await;
    assert_eq!(waiting["queuePosition"], 1);
    assert_eq!(waiting["estimatedWaitTime"], 15);

    let status = recv_frame_of_type(&mut a, "queue_status").await;
    assert_eq!(status["position"], 1);
    assert_eq!(status["totalWaiting"], 1);
    assert_eq!(status["chatType"], "video");
}
