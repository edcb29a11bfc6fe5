use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use futures::{FutureExt, SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::frames::{decode_client_frame, ClientFrame, FrameDecodeError, ServerFrame};
use crate::models::{Gender, OnlineUser};
use crate::registry::{close_sentinel, is_ping_sentinel, parse_close_sentinel};
use crate::state::AppState;

/// Identity assigned to this connection once `join` is processed. Shared
/// between the recv task (which sets it) and the teardown path (which reads
/// it to release the right registry entry) — everything else about a
/// connection lives on the recv task's stack.
#[derive(Default)]
struct ConnIdentity {
    user_id: Option<Uuid>,
    conn_id: Option<Uuid>,
}

/// Inbound frame size cap (§4.6). Oversize frames get `error{code=too_large}`
/// without closing the connection.
const MAX_FRAME_BYTES: usize = 100_000;

/// `GET /ws` — upgrade to a WebSocket connection.
///
/// The per-IP connection cap (§4.7) is checked before the upgrade, but an
/// over-cap caller still completes the handshake and is closed with code
/// `1008` (§6.1) rather than being bounced at the HTTP layer — the close
/// code is the only way the client observes *why* the connection ended.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    let ip = addr.ip();
    let admitted = state.connections.accept(ip, state.config.max_ws_per_ip).is_ok();

    ws.max_message_size(MAX_FRAME_BYTES).on_upgrade(move |socket| async move {
        if admitted {
            handle_socket(socket, ip, state).await;
        } else {
            tracing::debug!(%ip, "refusing connection: per-IP limit exceeded");
            reject_over_capacity(socket).await;
        }
    })
}

/// Closes a just-upgraded socket with code `1008` (policy violation) without
/// ever registering it in the connection registry — the per-IP slot this
/// caller would have consumed was never reserved, so there is nothing to
/// release on the way out.
async fn reject_over_capacity(mut socket: WebSocket) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: "connection limit exceeded".into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, ip: std::net::IpAddr, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let identity = Arc::new(Mutex::new(ConnIdentity::default()));

    // Forward outbound frames from the mpsc queue to the socket. This is the
    // single serialized writer (§4.6) — every producer (Matcher, Relay,
    // SessionController, this handler) only ever enqueues onto `tx`. A close
    // or ping sentinel (see `crate::registry`) is the only way another task
    // can reach into this socket; everything else is forwarded verbatim.
    let mut send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Some(code) = parse_close_sentinel(&msg) {
                let _ = ws_sender
                    .send(Message::Close(Some(CloseFrame { code, reason: "".into() })))
                    .await;
                break;
            }
            if is_ping_sentinel(&msg) {
                if ws_sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                continue;
            }
            if ws_sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });

    let recv_state = state.clone();
    let recv_tx = tx.clone();
    let recv_identity = identity.clone();
    let recv_ip = ip;
    let mut recv_task = tokio::spawn(async move {
        loop {
            match ws_receiver.next().await {
                Some(Ok(Message::Text(text))) => {
                    if text.len() > MAX_FRAME_BYTES {
                        send_error(&recv_tx, "too_large", "frame exceeds maximum size");
                        continue;
                    }
                    // A panic here must not take the whole process down with
                    // it (§5): catch it, close this connection with `1011`,
                    // and let every other connection's tasks keep running.
                    let dispatched = std::panic::AssertUnwindSafe(dispatch_frame(
                        &recv_state,
                        &recv_identity,
                        &recv_tx,
                        recv_ip,
                        &text,
                    ))
                    .catch_unwind()
                    .await;
                    if dispatched.is_err() {
                        tracing::error!("panic while dispatching frame; closing connection");
                        let _ = recv_tx.send(close_sentinel(1011));
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = ?e, "websocket receive error; closing connection");
                    break;
                }
                None => break,
            }
        }
    });

    // Whichever task finishes first (client closed the socket, or the write
    // side broke) tears down the other.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    let (user_id, conn_id) = {
        let guard = identity.lock().unwrap();
        (guard.user_id, guard.conn_id.unwrap_or_else(Uuid::new_v4))
    };
    if let Some(uid) = user_id {
        state.sessions.on_connection_close(uid).await;
    }
    state.connections.release(ip, user_id, conn_id);
}

fn send_error(tx: &mpsc::UnboundedSender<String>, code: &'static str, message: &str) {
    if let Some(json) = ServerFrame::error(code, message).to_json() {
        let _ = tx.send(json);
    }
}

/// Decode one inbound frame and dispatch it to the matching component. Each
/// wire-level decode failure gets its own error code (§7) rather than
/// silently dropping the frame or closing the connection (§9).
async fn dispatch_frame(
    state: &AppState,
    identity: &Arc<Mutex<ConnIdentity>>,
    tx: &mpsc::UnboundedSender<String>,
    ip: std::net::IpAddr,
    text: &str,
) {
    let frame: ClientFrame = match decode_client_frame(text) {
        Ok(f) => f,
        Err(FrameDecodeError::UnknownType) => {
            send_error(tx, "unknown_type", "unrecognized frame type");
            return;
        }
        Err(FrameDecodeError::InvalidGender) => {
            send_error(tx, "invalid_gender", "unrecognized gender value");
            return;
        }
        Err(FrameDecodeError::InvalidChatType) => {
            send_error(tx, "invalid_chat_type", "unrecognized chatType value");
            return;
        }
        Err(FrameDecodeError::Malformed) => {
            send_error(tx, "bad_frame", "could not parse frame");
            return;
        }
    };

    let user_id = identity.lock().unwrap().user_id;
    if let Some(uid) = user_id {
        if let Some(handle) = state.connections.lookup(uid) {
            handle.touch();
        }
    }

    match frame {
        ClientFrame::Join { interests } => {
            let new_id = Uuid::new_v4();
            let online = OnlineUser::new(new_id, crate::models::normalize_interests(&interests));
            if state.store.add_online_user(online).await.is_err() {
                send_error(tx, "internal_error", "could not register user");
                return;
            }
            let handle = state.connections.bind(new_id, ip, tx.clone());
            {
                let mut guard = identity.lock().unwrap();
                guard.user_id = Some(new_id);
                guard.conn_id = Some(handle.conn_id);
            }

            if let Some(json) = ServerFrame::UserJoined { user_id: new_id }.to_json() {
                let _ = tx.send(json);
            }
        }
        ClientFrame::FindMatch { chat_type, interests, gender } => {
            require_user(user_id, tx, |uid| async move {
                let _ = state.matcher.request_match(uid, chat_type, &interests, gender).await;
            })
            .await;
        }
        ClientFrame::SendMessage { session_id, content, attachments, has_emoji } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.send_message(uid, session_id, content, attachments, has_emoji).await;
            })
            .await;
        }
        ClientFrame::Typing { session_id, is_typing } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.typing(uid, session_id, is_typing).await;
            })
            .await;
        }
        ClientFrame::WebrtcOffer { session_id, payload } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.webrtc_offer(uid, session_id, payload).await;
            })
            .await;
        }
        ClientFrame::WebrtcAnswer { session_id, payload } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.webrtc_answer(uid, session_id, payload).await;
            })
            .await;
        }
        ClientFrame::WebrtcIceCandidate { session_id, payload } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.webrtc_ice_candidate(uid, session_id, payload).await;
            })
            .await;
        }
        ClientFrame::EndChat { session_id } => {
            require_user(user_id, tx, |uid| async move {
                state.sessions.end_chat(session_id, uid).await;
            })
            .await;
        }
        ClientFrame::NextStranger { session_id, chat_type, interests, gender } => {
            require_user(user_id, tx, |uid| async move {
                let _ = state
                    .sessions
                    .next_stranger(session_id, uid, chat_type, &interests, gender)
                    .await;
            })
            .await;
        }
        ClientFrame::GetSessionRecovery { session_id, user_id: recovering_id } => {
            // Recovery runs on a fresh connection that has not `join`ed under
            // `recovering_id` — rebind identity to it first (orphaning
            // whatever connection was previously bound, same as a duplicate
            // `join`) so the rest of the dispatch table works on this
            // connection afterwards.
            let handle = state.connections.bind(recovering_id, ip, tx.clone());
            {
                let mut guard = identity.lock().unwrap();
                guard.user_id = Some(recovering_id);
                guard.conn_id = Some(handle.conn_id);
            }
            state.sessions.recover_session(session_id, recovering_id).await;
        }
        ClientFrame::UpdateGender { gender, session_id } => {
            require_user(user_id, tx, |uid| async move {
                update_gender(state, uid, gender, session_id).await;
            })
            .await;
        }
        ClientFrame::GetQueueStatus { chat_type, .. } => {
            require_user(user_id, tx, |uid| async move {
                state.matcher.queue_status(uid, chat_type).await;
            })
            .await;
        }
        ClientFrame::MessageRead { session_id, message_id } => {
            require_user(user_id, tx, |uid| async move {
                state.relay.message_read(uid, session_id, message_id).await;
            })
            .await;
        }
        ClientFrame::Heartbeat { timestamp } => {
            if let Some(json) = ServerFrame::HeartbeatAck { timestamp }.to_json() {
                let _ = tx.send(json);
            }
        }
        ClientFrame::Ping {} => {
            if let Some(json) = ServerFrame::Pong {}.to_json() {
                let _ = tx.send(json);
            }
        }
    }
}

async fn require_user<F, Fut>(user_id: Option<Uuid>, tx: &mpsc::UnboundedSender<String>, f: F)
where
    F: FnOnce(Uuid) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    match user_id {
        Some(uid) => f(uid).await,
        None => send_error(tx, "no_session", "join before sending this frame"),
    }
}

async fn update_gender(state: &AppState, user_id: Uuid, gender: Gender, session_id: Option<Uuid>) {
    let patch = crate::models::OnlineUserPatch {
        gender: Some(gender),
        ..Default::default()
    };
    if state.store.update_online_user(user_id, patch).await.is_err() {
        return;
    }
    if let Some(json) = ServerFrame::GenderUpdated { gender }.to_json() {
        state.connections.send_to_user(user_id, json);
    }
    if let Some(session_id) = session_id {
        if let Some(session) = state.store.get_chat_session(session_id).await {
            if let Some(partner) = session.partner_of(user_id) {
                if let Some(json) = ServerFrame::PartnerGenderUpdated { gender }.to_json() {
                    state.connections.send_to_user(partner, json);
                }
            }
        }
    }
}
