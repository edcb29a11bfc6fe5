use std::sync::Arc;
use std::time::Duration;

use crate::error::AppResult;
use crate::matcher::Matcher;
use crate::models::{ChatSessionPatch, ChatType, Gender, OnlineUserPatch, SessionId, SessionStatus, UserId};
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use crate::websocket::frames::ServerFrame;

/// Owns session end-of-life transitions: `end_chat`, `next_stranger`,
/// recovery, and the one-sided-exit cleanup on connection close. See §4.5 —
/// the only valid transition is `connected → ended`; recovery is a view
/// operation that never resurrects an `ended` session.
#[derive(Clone)]
pub struct SessionController {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
    matcher: Matcher,
}

impl SessionController {
    pub fn new(store: Arc<dyn Store>, registry: ConnectionRegistry, matcher: Matcher) -> Self {
        SessionController { store, registry, matcher }
    }

    fn send(&self, user_id: UserId, frame: ServerFrame) {
        if let Some(json) = frame.to_json() {
            self.registry.send_to_user(user_id, json);
        }
    }

    /// Marks `session_id` ended and clears the initiator's waiting state.
    /// Returns the partner id if the session existed and was connected.
    async fn end(&self, session_id: SessionId, initiator: UserId) -> Option<UserId> {
        let session = self.store.get_chat_session(session_id).await?;
        if session.status != SessionStatus::Connected {
            return None;
        }
        let partner = session.partner_of(initiator)?;

        let _ = self
            .store
            .update_chat_session(
                session_id,
                ChatSessionPatch {
                    status: Some(SessionStatus::Ended),
                    ended_at: Some(Some(chrono::Utc::now())),
                },
            )
            .await;
        let _ = self
            .store
            .update_online_user(
                initiator,
                OnlineUserPatch {
                    is_waiting: Some(false),
                    chat_type: Some(None),
                    ..Default::default()
                },
            )
            .await;
        Some(partner)
    }

    pub async fn end_chat(&self, session_id: SessionId, initiator: UserId) {
        if let Some(partner) = self.end(session_id, initiator).await {
            if self.registry.is_connected(partner) {
                self.send(partner, ServerFrame::ChatEnded { session_id });
            }
            self.send(initiator, ServerFrame::ChatEnded { session_id });
        }
    }

    /// Ends the session without notifying the initiator (the client treats
    /// "next" as one action), then immediately requests a new match.
    pub async fn next_stranger(
        &self,
        session_id: SessionId,
        initiator: UserId,
        new_chat_type: ChatType,
        new_interests: &[String],
        new_gender: Gender,
    ) -> AppResult<()> {
        if let Some(partner) = self.end(session_id, initiator).await {
            if self.registry.is_connected(partner) {
                self.send(partner, ServerFrame::ChatEnded { session_id });
            }
        }
        self.matcher
            .request_match(initiator, new_chat_type, new_interests, new_gender)
            .await
    }

    /// `get_session_recovery`: succeeds only if the session is still
    /// `connected`, both participants are online, and `user_id` participates
    /// in it. Fails unconditionally if the session ended during the caller's
    /// absence, regardless of how recently.
    pub async fn recover_session(&self, session_id: SessionId, user_id: UserId) {
        let session = match self.store.get_chat_session(session_id).await {
            Some(s) => s,
            None => {
                self.send(
                    user_id,
                    ServerFrame::SessionRecoveryFailed { reason: "session not found".into() },
                );
                return;
            }
        };
        if session.status != SessionStatus::Connected {
            self.send(
                user_id,
                ServerFrame::SessionRecoveryFailed { reason: "session already ended".into() },
            );
            return;
        }
        let Some(partner) = session.partner_of(user_id) else {
            self.send(
                user_id,
                ServerFrame::SessionRecoveryFailed { reason: "not a participant".into() },
            );
            return;
        };
        if !self.registry.is_connected(user_id) || !self.registry.is_connected(partner) {
            self.send(
                user_id,
                ServerFrame::SessionRecoveryFailed { reason: "partner not online".into() },
            );
            return;
        }

        self.send(
            user_id,
            ServerFrame::SessionRecovered { session_id, partner_id: partner, chat_type: session.chat_type },
        );
        self.send(partner, ServerFrame::PartnerReconnected { partner_id: user_id });
    }

    /// `onConnectionClose`: if the user was in a connected session, end it
    /// and notify the partner; then drop the user entirely from the Store
    /// (which also removes them from any waiting pool).
    pub async fn on_connection_close(&self, user_id: UserId) {
        if let Some(session) = self.store.find_connected_session_for(user_id).await {
            if let Some(partner) = self.end(session.id, user_id).await {
                if self.registry.is_connected(partner) {
                    self.send(partner, ServerFrame::ChatEnded { session_id: session.id });
                }
            }
        }
        self.store.remove_online_user(user_id).await;
    }

    /// Background sweep purging `ended` sessions older than `retention`
    /// (§5's Session GC). A single shared task, not per-session timers.
    pub fn spawn_session_gc(self, retention: Duration, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let purged = self.store.purge_expired_sessions(retention).await;
                if !purged.is_empty() {
                    tracing::debug!(count = purged.len(), "purged expired sessions");
                }
            }
        })
    }
}
