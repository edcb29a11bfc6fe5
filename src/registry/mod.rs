use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::models::UserId;

/// A frame queued for delivery to one WebSocket connection, already
/// serialized to a JSON string by the producer.
pub type OutgoingFrame = String;

/// `\0` can never open a legitimate JSON text frame, so it marks a sentinel
/// the writer task interprets as a transport-level instruction rather than
/// a frame to forward verbatim.
const CLOSE_SENTINEL_PREFIX: &str = "\u{0}close:";
const PING_SENTINEL: &str = "\u{0}ping";

/// Encode a request for the writer task to close the socket with `code`.
pub fn close_sentinel(code: u16) -> OutgoingFrame {
    format!("{CLOSE_SENTINEL_PREFIX}{code}")
}

/// Decode a close-sentinel frame back into its close code, if `frame` is one.
pub fn parse_close_sentinel(frame: &str) -> Option<u16> {
    frame.strip_prefix(CLOSE_SENTINEL_PREFIX)?.parse().ok()
}

/// Encode a request for the writer task to emit a transport-level `Ping`.
pub fn ping_sentinel() -> OutgoingFrame {
    PING_SENTINEL.to_string()
}

pub fn is_ping_sentinel(frame: &str) -> bool {
    frame == PING_SENTINEL
}

/// Handle to a single live connection's outbound writer.
///
/// Cloning is cheap — the sender half of an unbounded mpsc channel plus an
/// `Arc<AtomicI64>` liveness timestamp. Producers (Matcher, Relay,
/// SessionController) enqueue frames here and return immediately; the
/// connection's dedicated writer task drains the channel onto the socket, so
/// no caller ever blocks on network I/O.
#[derive(Clone)]
pub struct ConnectionHandle {
    /// Distinguishes connections across a rebind (see `bind`'s docs) so a
    /// stale writer task can tell it has been orphaned.
    pub conn_id: Uuid,
    ip: IpAddr,
    sender: mpsc::UnboundedSender<OutgoingFrame>,
    last_seen_millis: Arc<AtomicI64>,
}

impl ConnectionHandle {
    /// Enqueue a frame. Silently drops it if the connection has already
    /// closed — a failed send is never fatal to the caller.
    pub fn send(&self, frame: OutgoingFrame) {
        let _ = self.sender.send(frame);
    }

    /// Ask the writer task to close the socket with `code` and stop. This is
    /// the only way to actually terminate a connection from outside its own
    /// tasks — dropping this handle's sender clone does not close anything,
    /// since the recv task and the registry each hold their own clone.
    pub fn close(&self, code: u16) {
        let _ = self.sender.send(close_sentinel(code));
    }

    /// Ask the writer task to emit a transport-level `Ping` (§4.2).
    pub fn ping(&self) {
        let _ = self.sender.send(ping_sentinel());
    }

    pub fn touch(&self) {
        self.last_seen_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn last_seen_millis(&self) -> i64 {
        self.last_seen_millis.load(Ordering::Relaxed)
    }
}

/// Tracks live WebSocket connections keyed by user id, enforces per-IP
/// connection caps, and drives heartbeat liveness.
///
/// Cheaply cloneable — all clones share the same underlying maps via `Arc`.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<UserId, ConnectionHandle>>,
    per_ip: Arc<DashMap<IpAddr, usize>>,
}

/// Returned by `accept` when a connection is refused for exceeding the
/// per-IP cap.
pub struct RejectIpLimit;

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new socket from `ip`, or refuse it if `ip` is already at
    /// `max_per_ip` open connections. On success the IP's counter is
    /// incremented; callers must call `release` exactly once for every
    /// successful `accept` (the teardown path does this even if `bind` was
    /// never called).
    pub fn accept(&self, ip: IpAddr, max_per_ip: usize) -> Result<(), RejectIpLimit> {
        let mut count = self.per_ip.entry(ip).or_insert(0);
        if *count >= max_per_ip {
            return Err(RejectIpLimit);
        }
        *count += 1;
        Ok(())
    }

    /// Register the connection's outbound sender under `user_id`, creating a
    /// fresh `ConnectionHandle`. Any prior connection bound to the same
    /// `user_id` (e.g. a duplicate `join`, see the Duplicate-join open
    /// question) is orphaned: its entry is overwritten here, so it stops
    /// receiving routed frames, but its socket keeps running until its own
    /// read loop notices the close.
    pub fn bind(&self, user_id: UserId, ip: IpAddr, sender: mpsc::UnboundedSender<OutgoingFrame>) -> ConnectionHandle {
        let handle = ConnectionHandle {
            conn_id: Uuid::new_v4(),
            ip,
            sender,
            last_seen_millis: Arc::new(AtomicI64::new(Utc::now().timestamp_millis())),
        };
        self.connections.insert(user_id, handle.clone());
        handle
    }

    pub fn lookup(&self, user_id: UserId) -> Option<ConnectionHandle> {
        self.connections.get(&user_id).map(|h| h.clone())
    }

    pub fn send_to_user(&self, user_id: UserId, frame: OutgoingFrame) {
        if let Some(handle) = self.lookup(user_id) {
            handle.send(frame);
        }
    }

    /// Release resources for a closing connection. `conn_id` must be the
    /// same one returned by `bind`, so a stale (already-rebound) connection
    /// releasing late does not unbind the newer one.
    pub fn release(&self, ip: IpAddr, user_id: Option<UserId>, conn_id: Uuid) {
        if let Some(user_id) = user_id {
            if let Some(entry) = self.connections.get(&user_id) {
                if entry.conn_id == conn_id {
                    drop(entry);
                    self.connections.remove(&user_id);
                }
            }
        }
        if let Some(mut count) = self.per_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                drop(count);
                self.per_ip.remove(&ip);
            }
        }
    }

    pub fn is_connected(&self, user_id: UserId) -> bool {
        self.connections.contains_key(&user_id)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of every currently-registered `(user_id, handle)` pair, used
    /// by the heartbeat sweep task.
    pub fn all_connections(&self) -> Vec<(UserId, ConnectionHandle)> {
        self.connections
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    /// Force-close a connection the owner never asked to end (used by the
    /// heartbeat sweep on a stale connection, or admission on a policy
    /// violation): asks the writer task to close the socket, then releases
    /// the per-IP slot and registry entry the same way the connection's own
    /// teardown path would. A no-op if `user_id` isn't currently bound.
    pub fn close_and_release(&self, user_id: UserId, code: u16) {
        let Some(entry) = self.connections.get(&user_id) else {
            return;
        };
        let ip = entry.ip;
        let conn_id = entry.conn_id;
        entry.close(code);
        drop(entry);
        self.release(ip, Some(user_id), conn_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> (mpsc::UnboundedSender<OutgoingFrame>, mpsc::UnboundedReceiver<OutgoingFrame>) {
        mpsc::unbounded_channel()
    }

    fn test_ip() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[test]
    fn accept_allows_up_to_max_then_rejects() {
        let reg = ConnectionRegistry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        assert!(reg.accept(ip, 2).is_ok());
        assert!(reg.accept(ip, 2).is_ok());
        assert!(reg.accept(ip, 2).is_err());
    }

    #[test]
    fn release_decrements_and_allows_new_accept() {
        let reg = ConnectionRegistry::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        reg.accept(ip, 1).unwrap();
        assert!(reg.accept(ip, 1).is_err());

        reg.release(ip, None, Uuid::new_v4());
        assert!(reg.accept(ip, 1).is_ok());
    }

    #[test]
    fn bind_and_lookup_round_trip() {
        let reg = ConnectionRegistry::new();
        let user = UserId::new_v4();
        let (tx, _rx) = channel();
        reg.bind(user, test_ip(), tx);
        assert!(reg.is_connected(user));
        assert!(reg.lookup(user).is_some());
    }

    #[test]
    fn rebind_orphans_prior_connection() {
        let reg = ConnectionRegistry::new();
        let user = UserId::new_v4();
        let (tx1, _rx1) = channel();
        let (tx2, mut rx2) = channel();

        let first = reg.bind(user, test_ip(), tx1);
        let second = reg.bind(user, test_ip(), tx2);
        assert_ne!(first.conn_id, second.conn_id);

        reg.send_to_user(user, "hello".into());
        assert_eq!(rx2.try_recv().unwrap(), "hello");
    }

    #[test]
    fn release_with_stale_conn_id_does_not_unbind_newer_connection() {
        let reg = ConnectionRegistry::new();
        let user = UserId::new_v4();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        reg.accept(ip, 5).unwrap();
        let (tx1, _rx1) = channel();
        let (tx2, _rx2) = channel();

        let stale = reg.bind(user, ip, tx1);
        reg.bind(user, ip, tx2);

        reg.release(ip, Some(user), stale.conn_id);
        assert!(reg.is_connected(user), "newer binding must survive a stale release");
    }

    #[test]
    fn send_to_disconnected_user_is_noop() {
        let reg = ConnectionRegistry::new();
        reg.send_to_user(UserId::new_v4(), "dropped".into());
    }

    #[test]
    fn connection_count_tracks_binds() {
        let reg = ConnectionRegistry::new();
        assert_eq!(reg.connection_count(), 0);
        let (tx, _rx) = channel();
        reg.bind(UserId::new_v4(), test_ip(), tx);
        assert_eq!(reg.connection_count(), 1);
    }

    #[test]
    fn close_and_release_sends_close_sentinel_and_frees_ip_slot() {
        let reg = ConnectionRegistry::new();
        let ip = test_ip();
        let user = UserId::new_v4();
        reg.accept(ip, 1).unwrap();
        let (tx, mut rx) = channel();
        reg.bind(user, ip, tx);

        reg.close_and_release(user, 1008);

        assert_eq!(parse_close_sentinel(&rx.try_recv().unwrap()), Some(1008));
        assert!(!reg.is_connected(user));
        assert!(reg.accept(ip, 1).is_ok(), "per-IP slot must be freed");
    }

    #[test]
    fn close_and_release_on_unbound_user_is_noop() {
        let reg = ConnectionRegistry::new();
        reg.close_and_release(UserId::new_v4(), 1008);
    }

    #[test]
    fn ping_sentinel_round_trips() {
        let sentinel = ping_sentinel();
        assert!(is_ping_sentinel(&sentinel));
        assert!(!is_ping_sentinel("not a sentinel"));
    }
}
