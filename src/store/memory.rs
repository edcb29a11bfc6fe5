use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use crate::error::{AppError, AppResult};
use crate::models::{
    ChatSession, ChatSessionPatch, ChatType, Message, OnlineUser, OnlineUserPatch, SessionId,
    SessionStatus, UserId,
};

use super::Store;

/// Default, in-process implementation of [`Store`].
///
/// Backed by `dashmap::DashMap` for lock-free-ish concurrent access, the same
/// approach the wider ecosystem reaches for when a `tokio::sync::Mutex<HashMap<..>>`
/// would otherwise serialize every caller. The waiting pool is a secondary
/// index (`DashMap<ChatType, DashMap<UserId, ()>>`) kept in lockstep with
/// `OnlineUser.is_waiting` inside `update_online_user` — the only place that
/// index is ever written, so the two can never drift.
#[derive(Default)]
pub struct InMemoryStore {
    users: DashMap<UserId, OnlineUser>,
    waiting_pools: DashMap<ChatType, DashMap<UserId, ()>>,
    sessions: DashMap<SessionId, ChatSession>,
    messages: DashMap<SessionId, Vec<Message>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self, chat_type: ChatType) -> dashmap::mapref::one::RefMut<'_, ChatType, DashMap<UserId, ()>> {
        self.waiting_pools.entry(chat_type).or_default()
    }

    fn reconcile_pool_membership(
        &self,
        id: UserId,
        before: (bool, Option<ChatType>),
        after: (bool, Option<ChatType>),
    ) {
        let (was_waiting, prev_chat_type) = before;
        let (is_waiting, chat_type) = after;

        if was_waiting && (!is_waiting || prev_chat_type != chat_type) {
            if let Some(ct) = prev_chat_type {
                self.pool(ct).remove(&id);
            }
        }
        if is_waiting {
            if let Some(ct) = chat_type {
                self.pool(ct).insert(id, ());
            }
        }
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn add_online_user(&self, user: OnlineUser) -> AppResult<()> {
        if self.users.contains_key(&user.id) {
            return Err(AppError::Conflict(format!("user {} already online", user.id)));
        }
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn remove_online_user(&self, id: UserId) {
        if let Some((_, user)) = self.users.remove(&id) {
            if user.is_waiting {
                if let Some(ct) = user.chat_type {
                    self.pool(ct).remove(&id);
                }
            }
        }
    }

    async fn update_online_user(&self, id: UserId, patch: OnlineUserPatch) -> AppResult<OnlineUser> {
        let mut entry = self
            .users
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("user {id} not online")))?;

        let before = (entry.is_waiting, entry.chat_type);

        if let Some(interests) = patch.interests {
            entry.interests = interests;
        }
        if let Some(gender) = patch.gender {
            entry.gender = gender;
        }
        if let Some(chat_type) = patch.chat_type {
            entry.chat_type = chat_type;
        }
        if let Some(is_waiting) = patch.is_waiting {
            if is_waiting && !entry.is_waiting {
                entry.waiting_since = Some(Utc::now());
            }
            if !is_waiting {
                entry.waiting_since = None;
            }
            entry.is_waiting = is_waiting;
        }
        entry.last_seen = Utc::now();

        let after = (entry.is_waiting, entry.chat_type);
        let snapshot = entry.clone();
        drop(entry);

        self.reconcile_pool_membership(id, before, after);
        Ok(snapshot)
    }

    async fn get_online_user(&self, id: UserId) -> Option<OnlineUser> {
        self.users.get(&id).map(|u| u.clone())
    }

    async fn get_all_online_users(&self) -> Vec<OnlineUser> {
        self.users.iter().map(|u| u.clone()).collect()
    }

    async fn get_waiting_users(
        &self,
        chat_type: ChatType,
        asker_interests: &HashSet<String>,
    ) -> Vec<OnlineUser> {
        let mut waiting: Vec<OnlineUser> = {
            let pool = self.pool(chat_type);
            pool.iter()
                .filter_map(|entry| self.users.get(entry.key()).map(|u| u.clone()))
                .collect()
        };

        waiting.sort_by(|a, b| {
            let overlap_a = a.interests.intersection(asker_interests).count();
            let overlap_b = b.interests.intersection(asker_interests).count();
            overlap_b
                .cmp(&overlap_a)
                .then_with(|| a.waiting_since.cmp(&b.waiting_since))
        });

        waiting
    }

    async fn count_waiting(&self, chat_type: ChatType) -> usize {
        self.pool(chat_type).len()
    }

    async fn queue_position(&self, chat_type: ChatType, user: UserId) -> Option<usize> {
        let mut waiting: Vec<(UserId, chrono::DateTime<Utc>)> = {
            let pool = self.pool(chat_type);
            pool.iter()
                .filter_map(|entry| {
                    self.users
                        .get(entry.key())
                        .and_then(|u| u.waiting_since.map(|ws| (*entry.key(), ws)))
                })
                .collect()
        };
        waiting.sort_by_key(|(_, ws)| *ws);
        waiting.iter().position(|(id, _)| *id == user).map(|i| i + 1)
    }

    async fn create_chat_session(&self, session: ChatSession) -> AppResult<()> {
        if self.sessions.contains_key(&session.id) {
            return Err(AppError::Conflict(format!("session {} already exists", session.id)));
        }
        self.sessions.insert(session.id, session);
        Ok(())
    }

    async fn get_chat_session(&self, id: SessionId) -> Option<ChatSession> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    async fn find_connected_session_for(&self, user: UserId) -> Option<ChatSession> {
        self.sessions
            .iter()
            .find(|s| s.status == SessionStatus::Connected && s.has_participant(user))
            .map(|s| s.clone())
    }

    async fn update_chat_session(
        &self,
        id: SessionId,
        patch: ChatSessionPatch,
    ) -> AppResult<ChatSession> {
        let mut entry = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("session {id} not found")))?;

        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(ended_at) = patch.ended_at {
            entry.ended_at = ended_at;
        }
        Ok(entry.clone())
    }

    async fn delete_chat_session(&self, id: SessionId) {
        self.sessions.remove(&id);
        self.messages.remove(&id);
    }

    async fn purge_expired_sessions(&self, retention: Duration) -> Vec<SessionId> {
        let now = Utc::now();
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| {
                s.status == SessionStatus::Ended
                    && s.ended_at
                        .map(|ended| {
                            now.signed_duration_since(ended)
                                .to_std()
                                .map(|age| age >= retention)
                                .unwrap_or(true)
                        })
                        .unwrap_or(false)
            })
            .map(|s| s.id)
            .collect();

        for id in &expired {
            self.sessions.remove(id);
            self.messages.remove(id);
        }
        expired
    }

    async fn create_message(&self, message: Message) -> AppResult<()> {
        self.messages.entry(message.session_id).or_default().push(message);
        Ok(())
    }

    async fn get_messages_by_session(&self, id: SessionId) -> Vec<Message> {
        self.messages.get(&id).map(|m| m.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Gender;

    fn user(id: UserId) -> OnlineUser {
        OnlineUser::new(id, HashSet::new())
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();
        let fetched = store.get_online_user(id).await.unwrap();
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn add_duplicate_id_conflicts() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();
        let err = store.add_online_user(user(id)).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn update_missing_user_not_found() {
        let store = InMemoryStore::new();
        let err = store
            .update_online_user(UserId::new_v4(), OnlineUserPatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn setting_is_waiting_adds_to_pool() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();

        store
            .update_online_user(
                id,
                OnlineUserPatch {
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.count_waiting(ChatType::Text).await, 1);
        let waiting = store.get_waiting_users(ChatType::Text, &HashSet::new()).await;
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].id, id);
    }

    #[tokio::test]
    async fn clearing_is_waiting_removes_from_pool() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();
        store
            .update_online_user(
                id,
                OnlineUserPatch {
                    chat_type: Some(Some(ChatType::Video)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_online_user(
                id,
                OnlineUserPatch {
                    is_waiting: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.count_waiting(ChatType::Video).await, 0);
    }

    #[tokio::test]
    async fn remove_online_user_clears_pool_membership() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();
        store
            .update_online_user(
                id,
                OnlineUserPatch {
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        store.remove_online_user(id).await;
        assert_eq!(store.count_waiting(ChatType::Text).await, 0);
        assert!(store.get_online_user(id).await.is_none());
    }

    #[tokio::test]
    async fn get_waiting_users_orders_by_interest_overlap_then_enqueue_time() {
        let store = InMemoryStore::new();
        let asker_interests: HashSet<String> = ["music", "gaming"].iter().map(|s| s.to_string()).collect();

        let low = UserId::new_v4();
        let high = UserId::new_v4();
        store.add_online_user(user(low)).await.unwrap();
        store.add_online_user(user(high)).await.unwrap();

        store
            .update_online_user(
                low,
                OnlineUserPatch {
                    interests: Some(HashSet::new()),
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_online_user(
                high,
                OnlineUserPatch {
                    interests: Some(["music"].iter().map(|s| s.to_string()).collect()),
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let waiting = store.get_waiting_users(ChatType::Text, &asker_interests).await;
        assert_eq!(waiting[0].id, high);
        assert_eq!(waiting[1].id, low);
    }

    #[tokio::test]
    async fn queue_position_is_one_based_by_enqueue_order() {
        let store = InMemoryStore::new();
        let first = UserId::new_v4();
        let second = UserId::new_v4();
        store.add_online_user(user(first)).await.unwrap();
        store.add_online_user(user(second)).await.unwrap();

        store
            .update_online_user(
                first,
                OnlineUserPatch {
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        store
            .update_online_user(
                second,
                OnlineUserPatch {
                    chat_type: Some(Some(ChatType::Text)),
                    is_waiting: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(store.queue_position(ChatType::Text, first).await, Some(1));
        assert_eq!(store.queue_position(ChatType::Text, second).await, Some(2));
    }

    #[tokio::test]
    async fn session_lifecycle_create_update_delete() {
        let store = InMemoryStore::new();
        let session = ChatSession {
            id: SessionId::new_v4(),
            user1_id: UserId::new_v4(),
            user2_id: UserId::new_v4(),
            chat_type: ChatType::Text,
            interests: HashSet::new(),
            status: SessionStatus::Connected,
            created_at: Utc::now(),
            ended_at: None,
        };
        let id = session.id;
        store.create_chat_session(session).await.unwrap();

        let updated = store
            .update_chat_session(
                id,
                ChatSessionPatch {
                    status: Some(SessionStatus::Ended),
                    ended_at: Some(Some(Utc::now())),
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, SessionStatus::Ended);

        store.delete_chat_session(id).await;
        assert!(store.get_chat_session(id).await.is_none());
    }

    #[tokio::test]
    async fn purge_expired_sessions_removes_only_old_ended_sessions() {
        let store = InMemoryStore::new();
        let fresh = ChatSession {
            id: SessionId::new_v4(),
            user1_id: UserId::new_v4(),
            user2_id: UserId::new_v4(),
            chat_type: ChatType::Text,
            interests: HashSet::new(),
            status: SessionStatus::Ended,
            created_at: Utc::now(),
            ended_at: Some(Utc::now()),
        };
        let old = ChatSession {
            id: SessionId::new_v4(),
            user1_id: UserId::new_v4(),
            user2_id: UserId::new_v4(),
            chat_type: ChatType::Text,
            interests: HashSet::new(),
            status: SessionStatus::Ended,
            created_at: Utc::now(),
            ended_at: Some(Utc::now() - chrono::Duration::seconds(120)),
        };
        let fresh_id = fresh.id;
        let old_id = old.id;
        store.create_chat_session(fresh).await.unwrap();
        store.create_chat_session(old).await.unwrap();

        let purged = store.purge_expired_sessions(Duration::from_secs(60)).await;
        assert_eq!(purged, vec![old_id]);
        assert!(store.get_chat_session(fresh_id).await.is_some());
        assert!(store.get_chat_session(old_id).await.is_none());
    }

    #[tokio::test]
    async fn messages_are_chronological_per_session() {
        let store = InMemoryStore::new();
        let session_id = SessionId::new_v4();
        let sender = UserId::new_v4();

        for i in 0..3 {
            store
                .create_message(Message {
                    id: crate::models::MessageId::new_v4(),
                    session_id,
                    sender_id: sender,
                    content: format!("msg {i}"),
                    attachments: vec![],
                    has_emoji: false,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }

        let messages = store.get_messages_by_session(session_id).await;
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].content, "msg 0");
        assert_eq!(messages[2].content, "msg 2");
    }

    #[tokio::test]
    async fn find_connected_session_for_matches_either_participant() {
        let store = InMemoryStore::new();
        let u1 = UserId::new_v4();
        let u2 = UserId::new_v4();
        let session = ChatSession {
            id: SessionId::new_v4(),
            user1_id: u1,
            user2_id: u2,
            chat_type: ChatType::Text,
            interests: HashSet::new(),
            status: SessionStatus::Connected,
            created_at: Utc::now(),
            ended_at: None,
        };
        let session_id = session.id;
        store.create_chat_session(session).await.unwrap();

        let found = store.find_connected_session_for(u2).await.unwrap();
        assert_eq!(found.id, session_id);
        assert!(store.find_connected_session_for(UserId::new_v4()).await.is_none());
    }

    #[tokio::test]
    async fn gender_patch_updates_field() {
        let store = InMemoryStore::new();
        let id = UserId::new_v4();
        store.add_online_user(user(id)).await.unwrap();
        let updated = store
            .update_online_user(
                id,
                OnlineUserPatch {
                    gender: Some(Gender::Female),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.gender, Gender::Female);
    }
}
