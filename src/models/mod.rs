use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type UserId = Uuid;
pub type SessionId = Uuid;
pub type MessageId = Uuid;

/// Chat modality a user is looking for (or currently in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Text,
    Video,
}

impl ChatType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChatType::Text => "text",
            ChatType::Video => "video",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Other,
    #[default]
    Unset,
}

/// Normalize a raw interest tag: lowercase, trimmed, capped at 32 chars.
/// Callers are expected to additionally cap the *number* of tags.
pub fn normalize_interest(raw: &str) -> String {
    let trimmed = raw.trim().to_lowercase();
    trimmed.chars().take(32).collect()
}

pub fn normalize_interests(raw: &[String]) -> HashSet<String> {
    raw.iter()
        .map(|s| normalize_interest(s))
        .filter(|s| !s.is_empty())
        .take(32)
        .collect()
}

/// A connected (or recently-connected) anonymous participant.
#[derive(Debug, Clone)]
pub struct OnlineUser {
    pub id: UserId,
    pub interests: HashSet<String>,
    pub gender: Gender,
    pub chat_type: Option<ChatType>,
    pub is_waiting: bool,
    /// When this user entered the waiting pool; used for queue-position
    /// ordering and the wait-time scoring bonus. `None` while not waiting.
    pub waiting_since: Option<DateTime<Utc>>,
    pub last_seen: DateTime<Utc>,
}

impl OnlineUser {
    pub fn new(id: UserId, interests: HashSet<String>) -> Self {
        let now = Utc::now();
        OnlineUser {
            id,
            interests,
            gender: Gender::Unset,
            chat_type: None,
            is_waiting: false,
            waiting_since: None,
            last_seen: now,
        }
    }
}

/// Partial update applied atomically by `Store::update_online_user`.
#[derive(Debug, Default, Clone)]
pub struct OnlineUserPatch {
    pub interests: Option<HashSet<String>>,
    pub gender: Option<Gender>,
    pub chat_type: Option<Option<ChatType>>,
    pub is_waiting: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Connected,
    Ended,
}

#[derive(Debug, Clone)]
pub struct ChatSession {
    pub id: SessionId,
    pub user1_id: UserId,
    pub user2_id: UserId,
    pub chat_type: ChatType,
    pub interests: HashSet<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl ChatSession {
    /// The other participant of `user`, or `None` if `user` is not a
    /// participant of this session.
    pub fn partner_of(&self, user: UserId) -> Option<UserId> {
        if user == self.user1_id {
            Some(self.user2_id)
        } else if user == self.user2_id {
            Some(self.user1_id)
        } else {
            None
        }
    }

    pub fn has_participant(&self, user: UserId) -> bool {
        user == self.user1_id || user == self.user2_id
    }
}

#[derive(Debug, Default, Clone)]
pub struct ChatSessionPatch {
    pub status: Option<SessionStatus>,
    pub ended_at: Option<Option<DateTime<Utc>>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub url: String,
    pub filename: String,
    pub size: u64,
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: MessageId,
    pub session_id: SessionId,
    pub sender_id: UserId,
    pub content: String,
    pub attachments: Vec<Attachment>,
    pub has_emoji: bool,
    pub timestamp: DateTime<Utc>,
}

/// Server-computed categorical label derived from the matching score;
/// informational only, never used in further matching logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchQuality {
    High,
    Medium,
    Random,
}
