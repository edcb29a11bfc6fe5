use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

use crate::error::AppResult;
use crate::models::{
    normalize_interests, ChatSession, ChatType, Gender, MatchQuality, OnlineUser,
    OnlineUserPatch, SessionId, SessionStatus, UserId,
};
use crate::registry::ConnectionRegistry;
use crate::store::Store;
use crate::websocket::frames::ServerFrame;

const MAX_INTERESTS: usize = 32;

/// Candidate score breakdown, kept only long enough to pick a winner and
/// derive `MatchQuality`.
#[derive(Debug, Clone, Copy)]
struct Scored {
    candidate: UserId,
    score: u32,
    gender_cross_match: bool,
    enqueue_order: std::cmp::Reverse<i64>,
}

/// Accepts match requests, scores the waiting pool, and pairs callers
/// atomically. Holds one `tokio::sync::Mutex` per `ChatType` so the
/// "enumerate candidates → score → pick winner → clear both `is_waiting`"
/// sequence runs as a single critical section per pool, released before any
/// socket write — see the per-pool locking note this mirrors from the
/// reference gateway's connection-state guard.
#[derive(Clone)]
pub struct Matcher {
    store: Arc<dyn Store>,
    registry: ConnectionRegistry,
    pool_locks: Arc<DashMap<ChatType, Arc<Mutex<()>>>>,
}

impl Matcher {
    pub fn new(store: Arc<dyn Store>, registry: ConnectionRegistry) -> Self {
        Matcher {
            store,
            registry,
            pool_locks: Arc::new(DashMap::new()),
        }
    }

    fn lock_for(&self, chat_type: ChatType) -> Arc<Mutex<()>> {
        self.pool_locks
            .entry(chat_type)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// `requestMatch` from §4.3. Marks the caller waiting, scores the pool,
    /// and either pairs immediately or leaves the caller queued — in which
    /// case the queue ticker (see `spawn_queue_ticker`) picks them up on the
    /// next tick.
    pub async fn request_match(
        &self,
        user_id: UserId,
        chat_type: ChatType,
        interests: &[String],
        gender: Gender,
    ) -> AppResult<()> {
        let interests = normalize_interests(interests);

        self.store
            .update_online_user(
                user_id,
                OnlineUserPatch {
                    interests: Some(interests.clone()),
                    gender: Some(gender),
                    chat_type: Some(Some(chat_type)),
                    is_waiting: Some(true),
                },
            )
            .await?;

        let lock = self.lock_for(chat_type);
        let winner = {
            let _guard = lock.lock().await;

            let candidates = self.store.get_waiting_users(chat_type, &interests).await;
            let caller = match self.store.get_online_user(user_id).await {
                Some(u) => u,
                None => return Ok(()), // disconnected between the patch above and here
            };
            let winner = self.pick_winner(&caller, &candidates);

            if let Some(won) = &winner {
                self.store
                    .update_online_user(
                        user_id,
                        OnlineUserPatch {
                            is_waiting: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.store
                    .update_online_user(
                        won.candidate,
                        OnlineUserPatch {
                            is_waiting: Some(false),
                            ..Default::default()
                        },
                    )
                    .await?;
            }
            winner
            // lock released here, before any session creation or socket I/O
        };

        match winner {
            Some(won) => self.complete_pairing(user_id, won, chat_type, &interests).await,
            None => self.notify_waiting(user_id, chat_type).await,
        }
    }

    fn pick_winner(&self, caller: &OnlineUser, candidates: &[OnlineUser]) -> Option<Scored> {
        let now = chrono::Utc::now();
        let mut scored: Vec<Scored> = candidates
            .iter()
            .filter(|c| c.id != caller.id)
            .map(|c| {
                let (score, gender_cross_match) = score_pair(caller, c, now);
                Scored {
                    candidate: c.id,
                    score,
                    gender_cross_match,
                    enqueue_order: std::cmp::Reverse(
                        c.waiting_since.map(|t| t.timestamp_millis()).unwrap_or(i64::MAX),
                    ),
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.enqueue_order.cmp(&b.enqueue_order))
                .then_with(|| a.candidate.cmp(&b.candidate))
        });

        scored.into_iter().next()
    }

    async fn complete_pairing(
        &self,
        caller: UserId,
        winner: Scored,
        chat_type: ChatType,
        caller_interests: &HashSet<String>,
    ) -> AppResult<()> {
        let partner = winner.candidate;
        let partner_user = self.store.get_online_user(partner).await;
        let partner_interests = partner_user
            .as_ref()
            .map(|u| u.interests.clone())
            .unwrap_or_default();

        let shared: Vec<String> = caller_interests.intersection(&partner_interests).cloned().collect();
        let quality = match_quality(winner.score, winner.gender_cross_match);

        let session = ChatSession {
            id: SessionId::new_v4(),
            user1_id: caller,
            user2_id: partner,
            chat_type,
            interests: caller_interests.clone(),
            status: SessionStatus::Connected,
            created_at: chrono::Utc::now(),
            ended_at: None,
        };
        let session_id = session.id;
        self.store.create_chat_session(session).await?;

        self.send(
            caller,
            ServerFrame::MatchFound {
                session_id,
                partner_id: partner,
                chat_type,
                shared_interests: shared.clone(),
                match_quality: quality,
            },
        );
        self.send(
            partner,
            ServerFrame::MatchFound {
                session_id,
                partner_id: caller,
                chat_type,
                shared_interests: shared,
                match_quality: quality,
            },
        );
        Ok(())
    }

    async fn notify_waiting(&self, user_id: UserId, chat_type: ChatType) -> AppResult<()> {
        let position = self
            .store
            .queue_position(chat_type, user_id)
            .await
            .unwrap_or(1);
        let total_waiting = self.store.count_waiting(chat_type).await;
        let estimated_wait_time = estimated_wait_time_secs(total_waiting);

        self.send(
            user_id,
            ServerFrame::WaitingForMatch {
                queue_position: position,
                estimated_wait_time,
            },
        );
        Ok(())
    }

    fn send(&self, user_id: UserId, frame: ServerFrame) {
        if let Some(json) = frame.to_json() {
            self.registry.send_to_user(user_id, json);
        }
    }

    /// Answers `get_queue_status` on demand (§6.1).
    pub async fn queue_status(&self, user_id: UserId, chat_type: ChatType) {
        let position = self
            .store
            .queue_position(chat_type, user_id)
            .await
            .unwrap_or(0);
        let total_waiting = self.store.count_waiting(chat_type).await;
        self.send(
            user_id,
            ServerFrame::QueueStatus {
                position,
                total_waiting,
                estimated_wait_time: estimated_wait_time_secs(total_waiting),
                chat_type,
            },
        );
    }

    /// Single background task emitting `queue_status` to every still-waiting
    /// user every `tick` — not a per-user timer, per the design note against
    /// O(N) timer churn.
    pub fn spawn_queue_ticker(self, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(tick);
            loop {
                ticker.tick().await;
                let users = self.store.get_all_online_users().await;
                for user in users.into_iter().filter(|u| u.is_waiting) {
                    if let Some(chat_type) = user.chat_type {
                        self.queue_status(user.id, chat_type).await;
                    }
                }
            }
        })
    }
}

fn estimated_wait_time_secs(total_waiting_same_type: usize) -> u64 {
    if total_waiting_same_type < 5 {
        15
    } else {
        (10 * total_waiting_same_type as u64).min(120)
    }
}

fn is_gender_cross_match(a: Gender, b: Gender) -> bool {
    matches!(
        (a, b),
        (Gender::Male, Gender::Female) | (Gender::Female, Gender::Male)
    )
}

fn gender_points(a: Gender, b: Gender) -> u32 {
    if is_gender_cross_match(a, b) {
        40
    } else if a == Gender::Other || b == Gender::Other {
        20
    } else if a == Gender::Unset || b == Gender::Unset {
        15
    } else {
        5
    }
}

/// Scoring table from §4.3. Returns `(score, gender_cross_match)`.
fn score_pair(caller: &OnlineUser, candidate: &OnlineUser, now: chrono::DateTime<chrono::Utc>) -> (u32, bool) {
    let overlap = caller.interests.intersection(&candidate.interests).count() as u32;
    let denom = caller.interests.len().max(1) as u32;
    let interest_points = (40 * overlap / denom).min(40);

    let gender_cross_match = is_gender_cross_match(caller.gender, candidate.gender);
    let gender_pts = gender_points(caller.gender, candidate.gender);

    let minutes_waiting = candidate
        .waiting_since
        .map(|since| now.signed_duration_since(since).num_minutes().max(0) as u32)
        .unwrap_or(0);
    let wait_points = (3 * minutes_waiting).min(15);

    let jitter: u32 = rand::thread_rng().gen_range(0..=5);

    (interest_points + gender_pts + wait_points + jitter, gender_cross_match)
}

fn match_quality(score: u32, gender_cross_match: bool) -> MatchQuality {
    if score > 60 || (score > 40 && gender_cross_match) {
        MatchQuality::High
    } else if score > 30 || gender_cross_match {
        MatchQuality::Medium
    } else {
        MatchQuality::Random
    }
}
