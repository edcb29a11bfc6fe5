pub mod memory;

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::AppResult;
use crate::models::{
    ChatSession, ChatSessionPatch, ChatType, Message, OnlineUser, OnlineUserPatch, SessionId,
    UserId,
};

pub use memory::InMemoryStore;

/// The authoritative in-process data plane: online users, sessions, the
/// per-session message log.
///
/// Expressed as a trait so a future durable backend can be dropped in
/// without touching `Matcher`/`Relay`/`SessionController` — all of which
/// hold a `dyn Store` (or generic `S: Store`) rather than a concrete type.
/// Every operation must be safe under concurrent callers and complete in
/// bounded time; none may block on network I/O.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new online user. Fails with `Conflict` if the id is already
    /// present.
    async fn add_online_user(&self, user: OnlineUser) -> AppResult<()>;

    /// Remove a user. Idempotent — removing an absent id is not an error.
    /// Implicitly removes the user from whatever waiting pool they were in.
    async fn remove_online_user(&self, id: UserId);

    /// Atomically merge `patch` into the stored user, refreshing `last_seen`.
    /// If `is_waiting` transitions, pool membership is kept consistent with
    /// it in the same operation. Fails with `NotFound` if `id` is absent.
    async fn update_online_user(&self, id: UserId, patch: OnlineUserPatch) -> AppResult<OnlineUser>;

    async fn get_online_user(&self, id: UserId) -> Option<OnlineUser>;

    async fn get_all_online_users(&self) -> Vec<OnlineUser>;

    /// All waiting users of `chat_type` (the caller excludes itself and
    /// re-scores; this is a hint ordering only), ordered by descending
    /// interest overlap with `asker_interests`, ties broken by ascending
    /// enqueue time.
    async fn get_waiting_users(
        &self,
        chat_type: ChatType,
        asker_interests: &HashSet<String>,
    ) -> Vec<OnlineUser>;

    /// Total number of users currently waiting for `chat_type`.
    async fn count_waiting(&self, chat_type: ChatType) -> usize;

    /// 1-based rank of `user` within its chat-type pool by enqueue time, or
    /// `None` if the user is not currently waiting.
    async fn queue_position(&self, chat_type: ChatType, user: UserId) -> Option<usize>;

    /// Create a new session. Fails with `Conflict` if the id already exists.
    async fn create_chat_session(&self, session: ChatSession) -> AppResult<()>;

    async fn get_chat_session(&self, id: SessionId) -> Option<ChatSession>;

    /// The `connected` session `user` currently participates in, if any.
    /// Used on connection close, where the caller has a user id but not
    /// the session id.
    async fn find_connected_session_for(&self, user: UserId) -> Option<ChatSession>;

    /// Fails with `NotFound` if the session does not exist.
    async fn update_chat_session(
        &self,
        id: SessionId,
        patch: ChatSessionPatch,
    ) -> AppResult<ChatSession>;

    async fn delete_chat_session(&self, id: SessionId);

    /// Remove every `ended` session whose `ended_at` is older than
    /// `retention`, along with their message logs. Returns the purged ids.
    async fn purge_expired_sessions(&self, retention: Duration) -> Vec<SessionId>;

    async fn create_message(&self, message: Message) -> AppResult<()>;

    /// Chronological order.
    async fn get_messages_by_session(&self, id: SessionId) -> Vec<Message>;
}
