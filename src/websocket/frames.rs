use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Attachment, ChatType, Gender, MatchQuality, Message, MessageId, SessionId, UserId};

/// Inbound envelope. `#[serde(tag = "type")]` decodes the `type` discriminator
/// once at the edge and hands the caller an already-typed variant. Callers
/// should go through `decode_client_frame` rather than deserializing this
/// enum directly, so an unrecognized `type` or an out-of-range `gender`/
/// `chatType` value reports its own error code instead of a generic parse
/// failure.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Join {
        #[serde(default)]
        interests: Vec<String>,
    },
    FindMatch {
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        #[serde(default)]
        interests: Vec<String>,
        #[serde(default)]
        gender: Gender,
    },
    SendMessage {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        content: String,
        #[serde(default)]
        attachments: Vec<Attachment>,
        #[serde(default, rename = "hasEmoji")]
        has_emoji: bool,
    },
    Typing {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    WebrtcOffer {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(flatten)]
        payload: Value,
    },
    WebrtcAnswer {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(flatten)]
        payload: Value,
    },
    WebrtcIceCandidate {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(flatten)]
        payload: Value,
    },
    EndChat {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    NextStranger {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        #[serde(default)]
        interests: Vec<String>,
        #[serde(default)]
        gender: Gender,
    },
    GetSessionRecovery {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        /// The `userId` the caller held on its previous connection (from its
        /// earlier `user_joined`). Recovery happens on a fresh connection
        /// that has not `join`ed under that id, so this frame carries it
        /// explicitly rather than relying on already-bound identity.
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    UpdateGender {
        gender: Gender,
        #[serde(rename = "sessionId")]
        session_id: Option<SessionId>,
    },
    GetQueueStatus {
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        #[serde(default)]
        interests: Vec<String>,
    },
    MessageRead {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "messageId")]
        message_id: MessageId,
    },
    Heartbeat {
        timestamp: Option<i64>,
    },
    Ping {},
}

/// Wire-level decode failure, distinguishing the distinct `error` codes the
/// gateway reports (§7) instead of collapsing them all into `bad_frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDecodeError {
    UnknownType,
    InvalidGender,
    InvalidChatType,
    Malformed,
}

const KNOWN_FRAME_TYPES: &[&str] = &[
    "join",
    "find_match",
    "send_message",
    "typing",
    "webrtc_offer",
    "webrtc_answer",
    "webrtc_ice_candidate",
    "end_chat",
    "next_stranger",
    "get_session_recovery",
    "update_gender",
    "get_queue_status",
    "message_read",
    "heartbeat",
    "ping",
];

const VALID_GENDERS: &[&str] = &["male", "female", "other", "unset"];
const VALID_CHAT_TYPES: &[&str] = &["text", "video"];

/// Decode one inbound frame. Checks the `type` tag and the `gender`/
/// `chatType` fields explicitly before handing off to serde, so an
/// unrecognized tag or an out-of-range enum value reports its own error code
/// instead of falling through to the generic `bad_frame`.
pub fn decode_client_frame(text: &str) -> Result<ClientFrame, FrameDecodeError> {
    let value: Value = serde_json::from_str(text).map_err(|_| FrameDecodeError::Malformed)?;

    let tag = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameDecodeError::Malformed)?;
    if !KNOWN_FRAME_TYPES.contains(&tag) {
        return Err(FrameDecodeError::UnknownType);
    }

    if let Some(gender) = value.get("gender").and_then(Value::as_str) {
        if !VALID_GENDERS.contains(&gender) {
            return Err(FrameDecodeError::InvalidGender);
        }
    }
    if let Some(chat_type) = value.get("chatType").and_then(Value::as_str) {
        if !VALID_CHAT_TYPES.contains(&chat_type) {
            return Err(FrameDecodeError::InvalidChatType);
        }
    }

    serde_json::from_value(value).map_err(|_| FrameDecodeError::Malformed)
}

/// Delivery status of a sent message, reported back to the sender only.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Sent,
}

#[derive(Debug, Serialize)]
pub struct MessageDto {
    pub id: MessageId,
    #[serde(rename = "sessionId")]
    pub session_id: SessionId,
    #[serde(rename = "senderId")]
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    #[serde(rename = "hasEmoji")]
    pub has_emoji: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for MessageDto {
    fn from(m: &Message) -> Self {
        MessageDto {
            id: m.id,
            session_id: m.session_id,
            sender_id: m.sender_id,
            content: m.content.clone(),
            attachments: m.attachments.clone(),
            has_emoji: m.has_emoji,
            timestamp: m.timestamp,
        }
    }
}

/// Outbound frame kinds, tagged by `type` on the wire exactly like the
/// inbound side. One enum covers every server→client frame so the writer
/// task has a single serialization point.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    UserJoined {
        #[serde(rename = "userId")]
        user_id: UserId,
    },
    WaitingForMatch {
        #[serde(rename = "queuePosition")]
        queue_position: usize,
        #[serde(rename = "estimatedWaitTime")]
        estimated_wait_time: u64,
    },
    MatchFound {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "partnerId")]
        partner_id: UserId,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
        #[serde(rename = "sharedInterests")]
        shared_interests: Vec<String>,
        #[serde(rename = "matchQuality")]
        match_quality: MatchQuality,
    },
    MessageSent {
        message: MessageDto,
        status: DeliveryStatus,
    },
    MessageReceived {
        message: MessageDto,
        #[serde(rename = "senderId")]
        sender_id: UserId,
    },
    MessageReadReceipt {
        #[serde(rename = "messageId")]
        message_id: MessageId,
        timestamp: DateTime<Utc>,
    },
    PartnerTyping {
        #[serde(rename = "isTyping")]
        is_typing: bool,
    },
    WebrtcOffer {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "fromUserId")]
        from_user_id: UserId,
        #[serde(flatten)]
        payload: Value,
    },
    WebrtcAnswer {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "fromUserId")]
        from_user_id: UserId,
        #[serde(flatten)]
        payload: Value,
    },
    WebrtcIceCandidate {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "fromUserId")]
        from_user_id: UserId,
        #[serde(flatten)]
        payload: Value,
    },
    ChatEnded {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
    },
    SessionRecovered {
        #[serde(rename = "sessionId")]
        session_id: SessionId,
        #[serde(rename = "partnerId")]
        partner_id: UserId,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
    },
    SessionRecoveryFailed {
        reason: String,
    },
    PartnerReconnected {
        #[serde(rename = "partnerId")]
        partner_id: UserId,
    },
    PartnerGenderUpdated {
        gender: Gender,
    },
    GenderUpdated {
        gender: Gender,
    },
    QueueStatus {
        position: usize,
        #[serde(rename = "totalWaiting")]
        total_waiting: usize,
        #[serde(rename = "estimatedWaitTime")]
        estimated_wait_time: u64,
        #[serde(rename = "chatType")]
        chat_type: ChatType,
    },
    HeartbeatAck {
        timestamp: Option<i64>,
    },
    Pong {},
    Error {
        code: &'static str,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the JSON string enqueued on a `ConnectionHandle`.
    /// Serialization of this enum cannot fail in practice (no non-finite
    /// floats, no non-string map keys), so a failure here is logged and the
    /// frame dropped rather than propagated — matching how the reference
    /// gateway treats its own serialization step as infallible-in-practice.
    pub fn to_json(&self) -> Option<String> {
        match serde_json::to_string(self) {
            Ok(s) => Some(s),
            Err(e) => {
                tracing::error!(error = ?e, "failed to serialize outbound frame");
                None
            }
        }
    }
}
