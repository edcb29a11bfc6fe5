use std::sync::Arc;

use crate::models::{Attachment, Message, MessageId, SessionId, SessionStatus, UserId};
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use crate::websocket::frames::{DeliveryStatus, MessageDto, ServerFrame};

/// Minimal deny-list per §4.4. Intentionally small — moderation beyond this
/// is an explicit non-goal.
const BANNED_TOKENS: [&str; 3] = ["spam", "bot", "scam"];

const MAX_CONTENT_CHARS: usize = 5000;
const REPETITION_THRESHOLD: usize = 51;

/// Strip NUL and C0/C1 control codes except HT (0x09) and LF (0x0A), then
/// trim leading/trailing whitespace.
pub fn sanitize_content(raw: &str) -> String {
    let filtered: String = raw
        .chars()
        .filter(|&c| {
            let code = c as u32;
            c == '\t' || c == '\n' || !(code < 0x20 || (0x7f..=0x9f).contains(&code))
        })
        .collect();
    filtered.trim().to_string()
}

/// True if any single character repeats `REPETITION_THRESHOLD` or more times
/// consecutively.
pub fn has_excessive_repetition(content: &str) -> bool {
    let mut run_char = None;
    let mut run_len = 0usize;
    for c in content.chars() {
        if Some(c) == run_char {
            run_len += 1;
        } else {
            run_char = Some(c);
            run_len = 1;
        }
        if run_len >= REPETITION_THRESHOLD {
            return true;
        }
    }
    false
}

pub fn contains_banned_token(content: &str) -> bool {
    let lower = content.to_lowercase();
    BANNED_TOKENS.iter().any(|t| lower.contains(t))
}

/// Outcome of validating a `send_message` frame before persistence.
pub enum Validation {
    Ok(String),
    Error(&'static str),
}

/// Validate and sanitize message content per §4.4's rule order: empty check
/// first (content AND attachments both empty), then length, then
/// repetition, then banned tokens.
pub fn validate_message(content: &str, attachments: &[Attachment]) -> Validation {
    let sanitized = sanitize_content(content);
    if sanitized.is_empty() && attachments.is_empty() {
        return Validation::Error("empty");
    }
    if sanitized.len() > MAX_CONTENT_CHARS {
        return Validation::Error("too_long");
    }
    if has_excessive_repetition(&sanitized) {
        return Validation::Error("spam_repetition");
    }
    if contains_banned_token(&sanitized) {
        return Validation::Error("inappropriate");
    }
    Validation::Ok(sanitized)
}

/// Per-session message routing: chat, typing, receipts, and WebRTC
/// signaling forwarding. Every operation first resolves the session and
/// confirms the sender participates in it (§4.4 steps 1-2).
#[derive(Clone)]
pub struct Relay {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
}

impl Relay {
    pub fn new(store: Arc<dyn Store>, registry: ConnectionRegistry) -> Self {
        Relay { store, registry }
    }

    fn send(&self, user_id: UserId, frame: ServerFrame) {
        if let Some(json) = frame.to_json() {
            self.registry.send_to_user(user_id, json);
        }
    }

    /// Resolve the session and partner id for `sender`, replying with the
    /// appropriate error frame and returning `None` if it cannot route.
    async fn resolve(&self, sender: UserId, session_id: SessionId) -> Option<UserId> {
        let session = match self.store.get_chat_session(session_id).await {
            Some(s) if s.status == SessionStatus::Connected => s,
            _ => {
                self.send(sender, ServerFrame::error("no_session", "session not found or ended"));
                return None;
            }
        };
        match session.partner_of(sender) {
            Some(partner) => Some(partner),
            None => {
                self.send(sender, ServerFrame::error("not_participant", "not a participant of this session"));
                None
            }
        }
    }

    pub async fn send_message(
        &self,
        sender: UserId,
        session_id: SessionId,
        content: String,
        attachments: Vec<Attachment>,
        has_emoji: bool,
    ) {
        let Some(partner) = self.resolve(sender, session_id).await else { return };

        let sanitized = match validate_message(&content, &attachments) {
            Validation::Ok(s) => s,
            Validation::Error(code) => {
                self.send(sender, ServerFrame::error(code, validation_message(code)));
                return;
            }
        };

        let message = Message {
            id: MessageId::new_v4(),
            session_id,
            sender_id: sender,
            content: sanitized,
            attachments,
            has_emoji,
            timestamp: chrono::Utc::now(),
        };
        if self.store.create_message(message.clone()).await.is_err() {
            self.send(sender, ServerFrame::error("internal_retry", "storage unavailable"));
            return;
        }

        let partner_online = self.registry.is_connected(partner);
        let status = if partner_online {
            DeliveryStatus::Delivered
        } else {
            DeliveryStatus::Sent
        };

        self.send(
            sender,
            ServerFrame::MessageSent {
                message: MessageDto::from(&message),
                status,
            },
        );
        if partner_online {
            self.send(
                partner,
                ServerFrame::MessageReceived {
                    message: MessageDto::from(&message),
                    sender_id: sender,
                },
            );
        }
    }

    pub async fn typing(&self, sender: UserId, session_id: SessionId, is_typing: bool) {
        let Some(partner) = self.resolve(sender, session_id).await else { return };
        self.send(partner, ServerFrame::PartnerTyping { is_typing });
    }

    pub async fn message_read(&self, sender: UserId, session_id: SessionId, message_id: MessageId) {
        let Some(partner) = self.resolve(sender, session_id).await else { return };
        self.send(
            partner,
            ServerFrame::MessageReadReceipt {
                message_id,
                timestamp: chrono::Utc::now(),
            },
        );
    }

    pub async fn webrtc_offer(&self, sender: UserId, session_id: SessionId, payload: serde_json::Value) {
        self.forward_webrtc(sender, session_id, payload, |session_id, from_user_id, payload| {
            ServerFrame::WebrtcOffer { session_id, from_user_id, payload }
        })
        .await;
    }

    pub async fn webrtc_answer(&self, sender: UserId, session_id: SessionId, payload: serde_json::Value) {
        self.forward_webrtc(sender, session_id, payload, |session_id, from_user_id, payload| {
            ServerFrame::WebrtcAnswer { session_id, from_user_id, payload }
        })
        .await;
    }

    pub async fn webrtc_ice_candidate(&self, sender: UserId, session_id: SessionId, payload: serde_json::Value) {
        self.forward_webrtc(sender, session_id, payload, |session_id, from_user_id, payload| {
            ServerFrame::WebrtcIceCandidate { session_id, from_user_id, payload }
        })
        .await;
    }

    async fn forward_webrtc(
        &self,
        sender: UserId,
        session_id: SessionId,
        payload: serde_json::Value,
        build: impl FnOnce(SessionId, UserId, serde_json::Value) -> ServerFrame,
    ) {
        let Some(partner) = self.resolve(sender, session_id).await else { return };
        self.send(partner, build(session_id, sender, payload));
    }

    /// Used by `Matcher`/`SessionController` style callers that need the
    /// session's historical log (e.g. a future session-recovery replay);
    /// exposed here since `Relay` owns message persistence semantics.
    pub async fn history(&self, session_id: SessionId) -> Vec<Message> {
        self.store.get_messages_by_session(session_id).await
    }
}

fn validation_message(code: &str) -> &'static str {
    match code {
        "empty" => "message has no content or attachments",
        "too_long" => "message content exceeds 5000 characters",
        "spam_repetition" => "message contains excessive character repetition",
        "inappropriate" => "message contains disallowed content",
        _ => "message rejected",
    }
}
