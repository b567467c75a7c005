//! User registry (§4.3): the single-session directory mapping screenname to
//! live connection, plus the chat-tag allocator.

use crate::session::Platform;
use common::time::timestamp_millis;
use hashbrown::HashMap;
use protocol::frame::OutboundFrame;
use protocol::pacer::PacerHandle;
use slog::{info, warn, Logger};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

pub const DISCONNECT_MESSAGE: &str = "You've been signed on from another location";

#[derive(Debug)]
pub enum DisconnectRequest {
    Graceful { message: String },
    Force,
}

pub type DisconnectHandle = mpsc::UnboundedSender<DisconnectRequest>;

/// A chat frame queued against a connection while its DOD transfer is in
/// progress (§3 DeferredBroadcast); flushed when exclusivity clears.
pub struct DeferredBroadcast {
    pub frame: OutboundFrame,
    pub label: &'static str,
    pub enqueued_at_ms: u64,
}

struct UserConnectionInner {
    screenname: String,
    pacer: PacerHandle,
    platform: Platform,
    active: AtomicBool,
    dod_exclusivity_active: AtomicBool,
    in_chat: AtomicBool,
    chat_join_timestamp_nanos: AtomicU64,
    deferred: Mutex<VecDeque<DeferredBroadcast>>,
    disconnect: DisconnectHandle,
    /// Bumped every CJ/ME and every CO, so a stale 10s confirmation timer
    /// (§4.4) can tell it no longer applies without cancelling a JoinHandle.
    co_generation: AtomicU64,
    joined_unconfirmed: AtomicBool,
}

/// The registry's view of a session (§3). Cheap to clone; every clone
/// shares the same underlying state.
#[derive(Clone)]
pub struct UserConnection(Arc<UserConnectionInner>);

impl UserConnection {
    pub fn new(screenname: String, pacer: PacerHandle, platform: Platform, disconnect: DisconnectHandle) -> Self {
        UserConnection(Arc::new(UserConnectionInner {
            screenname,
            pacer,
            platform,
            active: AtomicBool::new(true),
            dod_exclusivity_active: AtomicBool::new(false),
            in_chat: AtomicBool::new(false),
            chat_join_timestamp_nanos: AtomicU64::new(0),
            deferred: Mutex::new(VecDeque::new()),
            disconnect,
            co_generation: AtomicU64::new(0),
            joined_unconfirmed: AtomicBool::new(false),
        }))
    }

    pub fn screenname(&self) -> &str {
        &self.0.screenname
    }

    pub fn pacer(&self) -> &PacerHandle {
        &self.0.pacer
    }

    pub fn platform(&self) -> Platform {
        self.0.platform
    }

    pub fn is_active(&self) -> bool {
        self.0.active.load(Ordering::SeqCst)
    }

    pub fn mark_inactive(&self) {
        self.0.active.store(false, Ordering::SeqCst);
    }

    pub fn dod_exclusivity_active(&self) -> bool {
        self.0.dod_exclusivity_active.load(Ordering::SeqCst)
    }

    pub fn set_dod_exclusivity_active(&self, active: bool) {
        self.0.dod_exclusivity_active.store(active, Ordering::SeqCst);
    }

    pub fn in_chat(&self) -> bool {
        self.0.in_chat.load(Ordering::SeqCst)
    }

    /// Sets `inChat`, capturing/clearing `chatJoinTimestamp` to uphold the
    /// invariant `chatJoinTimestamp > 0 <=> inChat` (§3, §8 property 1).
    pub fn set_in_chat(&self, in_chat: bool) {
        self.0.in_chat.store(in_chat, Ordering::SeqCst);
        if in_chat {
            self.0.chat_join_timestamp_nanos.store(monotonic_nanos(), Ordering::SeqCst);
        } else {
            self.0.chat_join_timestamp_nanos.store(0, Ordering::SeqCst);
        }
    }

    pub fn chat_join_timestamp_nanos(&self) -> u64 {
        self.0.chat_join_timestamp_nanos.load(Ordering::SeqCst)
    }

    pub fn push_deferred(&self, broadcast: DeferredBroadcast) {
        self.0.deferred.lock().expect("deferred queue mutex poisoned").push_back(broadcast);
    }

    pub fn drain_deferred(&self) -> Vec<DeferredBroadcast> {
        self.0.deferred.lock().expect("deferred queue mutex poisoned").drain(..).collect()
    }

    pub fn clear_deferred(&self) {
        self.0.deferred.lock().expect("deferred queue mutex poisoned").clear();
    }

    /// Marks chat entry as pending confirmation and returns the generation
    /// token a timeout task should present back to `co_confirmed_since`.
    pub fn begin_chat_join(&self) -> u64 {
        self.0.joined_unconfirmed.store(true, Ordering::SeqCst);
        self.0.co_generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// True if `generation` is still the current one and the join was never
    /// confirmed by CO (so a timeout firing for it is not stale).
    pub fn chat_join_still_pending(&self, generation: u64) -> bool {
        self.0.joined_unconfirmed.load(Ordering::SeqCst)
            && self.0.co_generation.load(Ordering::SeqCst) == generation
    }

    /// Confirms the join (CO received), invalidating any outstanding timer.
    pub fn confirm_chat_join(&self) {
        self.0.joined_unconfirmed.store(false, Ordering::SeqCst);
        self.0.co_generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn clear_chat_join_pending(&self) {
        self.0.joined_unconfirmed.store(false, Ordering::SeqCst);
    }

    pub fn request_disconnect(&self, message: impl Into<String>) -> Result<(), ()> {
        self.0
            .disconnect
            .send(DisconnectRequest::Graceful { message: message.into() })
            .map_err(|_| ())
    }
}

fn monotonic_nanos() -> u64 {
    use std::time::Instant;
    thread_local! {
        static EPOCH: Instant = Instant::now();
    }
    EPOCH.with(|epoch| epoch.elapsed().as_nanos() as u64)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub broadcast: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub excluded: usize,
    pub not_in_chat: usize,
}

struct TagState {
    forward: HashMap<String, u8>,
    inverse: HashMap<u8, String>,
    free_pool: VecDeque<u8>,
    last_used: HashMap<String, u8>,
    counter: u16,
}

impl TagState {
    fn new() -> Self {
        TagState {
            forward: HashMap::new(),
            inverse: HashMap::new(),
            free_pool: VecDeque::new(),
            last_used: HashMap::new(),
            counter: 2,
        }
    }
}

struct RegistryState {
    connections: HashMap<String, UserConnection>,
    tags: TagState,
}

pub struct UserRegistry {
    logger: Logger,
    state: Mutex<RegistryState>,
}

impl UserRegistry {
    pub fn new(logger: Logger) -> Self {
        UserRegistry {
            logger,
            state: Mutex::new(RegistryState {
                connections: HashMap::new(),
                tags: TagState::new(),
            }),
        }
    }

    /// Registers `conn` under `screenname`'s lowercase key, atomically
    /// displacing any prior occupant (§4.3). The displaced connection is
    /// scheduled for graceful disconnect and returned to the caller.
    pub fn register(&self, screenname: &str, conn: UserConnection) -> Option<UserConnection> {
        let key = screenname.to_lowercase();
        let mut state = self.state.lock().expect("registry mutex poisoned");
        let old = state.connections.insert(key, conn);

        if let Some(old_conn) = &old {
            old_conn.mark_inactive();
            if old_conn.request_disconnect(DISCONNECT_MESSAGE).is_err() {
                warn!(self.logger, "duplicate-login disconnect handler missing or dead"; "user" => old_conn.screenname());
            }
            info!(self.logger, "displaced prior connection on register"; "user" => screenname);
        }

        old
    }

    pub fn unregister(&self, screenname: &str) -> Option<UserConnection> {
        let key = screenname.to_lowercase();
        let mut state = self.state.lock().expect("registry mutex poisoned");
        let removed = state.connections.remove(&key);
        if removed.is_some() {
            info!(self.logger, "unregistered connection"; "user" => screenname);
        }
        removed
    }

    pub fn is_online(&self, screenname: &str) -> bool {
        let key = screenname.to_lowercase();
        self.state.lock().expect("registry mutex poisoned").connections.contains_key(&key)
    }

    pub fn get_connection(&self, screenname: &str) -> Option<UserConnection> {
        let key = screenname.to_lowercase();
        self.state.lock().expect("registry mutex poisoned").connections.get(&key).cloned()
    }

    pub fn get_all_connections(&self) -> Vec<UserConnection> {
        self.state.lock().expect("registry mutex poisoned").connections.values().cloned().collect()
    }

    pub fn get_ordered_chat_members(&self) -> Vec<UserConnection> {
        let state = self.state.lock().expect("registry mutex poisoned");
        let mut members: Vec<UserConnection> =
            state.connections.values().filter(|c| c.in_chat()).cloned().collect();
        members.sort_by_key(|c| c.chat_join_timestamp_nanos());
        members
    }

    /// Chat tag allocation priority per §4.3: reuse existing assignment,
    /// then the user's last tag if free, then the free pool, then the
    /// counter, then an emergency scan. Returns -1 on exhaustion.
    pub fn assign_global_chat_tag(&self, screenname: &str) -> i32 {
        let key = screenname.to_lowercase();
        let mut state = self.state.lock().expect("registry mutex poisoned");
        let tags = &mut state.tags;

        if let Some(&tag) = tags.forward.get(&key) {
            return tag as i32;
        }

        if let Some(&last) = tags.last_used.get(&key) {
            if !tags.inverse.contains_key(&last) {
                tags.free_pool.retain(|&t| t != last);
                tags.forward.insert(key.clone(), last);
                tags.inverse.insert(last, key.clone());
                return last as i32;
            }
        }

        if let Some(tag) = tags.free_pool.pop_front() {
            tags.forward.insert(key.clone(), tag);
            tags.inverse.insert(tag, key.clone());
            tags.last_used.insert(key, tag);
            return tag as i32;
        }

        if tags.counter <= 255 {
            let tag = tags.counter as u8;
            tags.counter += 1;
            tags.forward.insert(key.clone(), tag);
            tags.inverse.insert(tag, key.clone());
            tags.last_used.insert(key, tag);
            return tag as i32;
        }

        // Emergency scan: the counter path is exhausted but a released tag
        // might still be free (§9.3 notes this best-effort reclaim can skip
        // tags under heavy contention without error — acceptable).
        for tag in 2u8..=255 {
            if !tags.inverse.contains_key(&tag) {
                tags.forward.insert(key.clone(), tag);
                tags.inverse.insert(tag, key.clone());
                tags.last_used.insert(key, tag);
                return tag as i32;
            }
        }

        -1
    }

    pub fn current_chat_tag(&self, screenname: &str) -> Option<u8> {
        let key = screenname.to_lowercase();
        let state = self.state.lock().expect("registry mutex poisoned");
        state.tags.forward.get(&key).copied()
    }

    /// Releases `screenname`'s tag back to the free pool; `lastTag` memory
    /// is kept so a returning user gets their old tag back (§4.3).
    pub fn release_tag(&self, screenname: &str) {
        let key = screenname.to_lowercase();
        let mut state = self.state.lock().expect("registry mutex poisoned");
        if let Some(tag) = state.tags.forward.remove(&key) {
            state.tags.inverse.remove(&tag);
            state.tags.free_pool.push_back(tag);
        }
    }

    /// Broadcasts `frame` to every chat member except `exclude` (if any).
    /// Deferred recipients (DOD exclusivity active) get the frame queued
    /// instead of delivered immediately (§4.3, §4.4).
    pub fn broadcast_to_chat(
        &self,
        frame: &OutboundFrame,
        label: &'static str,
        exclude: Option<&str>,
        burst: usize,
    ) -> BroadcastReport {
        let exclude_key = exclude.map(str::to_lowercase);
        let state = self.state.lock().expect("registry mutex poisoned");
        let mut report = BroadcastReport::default();

        for (key, conn) in state.connections.iter() {
            if !conn.is_active() {
                report.skipped += 1;
                continue;
            }
            if Some(key.as_str()) == exclude_key.as_deref() {
                report.excluded += 1;
                continue;
            }
            if !conn.in_chat() {
                report.not_in_chat += 1;
                continue;
            }

            if conn.dod_exclusivity_active() {
                conn.push_deferred(DeferredBroadcast {
                    frame: frame.clone(),
                    label,
                    enqueued_at_ms: timestamp_millis(),
                });
                report.deferred += 1;
            } else {
                conn.pacer().enqueue_and_drain(frame.clone(), label, burst);
                report.broadcast += 1;
            }
        }

        info!(self.logger, "chat broadcast";
            "sent" => report.broadcast, "deferred" => report.deferred,
            "skipped" => report.skipped, "excluded" => report.excluded,
            "not_in_chat" => report.not_in_chat);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Platform;
    use slog::Discard;

    fn test_logger() -> Logger {
        Logger::root(Discard, slog::o!())
    }

    fn make_connection(name: &str) -> (UserConnection, mpsc::UnboundedReceiver<DisconnectRequest>) {
        let (pacer, _pacer_rx) = PacerHandle::new();
        let (tx, rx) = mpsc::unbounded_channel();
        (UserConnection::new(name.into(), pacer, Platform::Unknown, tx), rx)
    }

    #[test]
    fn register_displaces_prior_connection_case_insensitively() {
        let registry = UserRegistry::new(test_logger());
        let (conn_a, mut rx_a) = make_connection("Bobby");
        let (conn_b, _rx_b) = make_connection("BOBBY");

        assert!(registry.register("Bobby", conn_a).is_none());
        let replaced = registry.register("BOBBY", conn_b).expect("should replace conn_a");
        assert_eq!(replaced.screenname(), "Bobby");
        assert!(!replaced.is_active());

        match rx_a.try_recv().unwrap() {
            DisconnectRequest::Graceful { message } => assert_eq!(message, DISCONNECT_MESSAGE),
            _ => panic!("expected graceful disconnect"),
        }

        assert!(registry.is_online("bobby"));
        assert_eq!(registry.get_all_connections().len(), 1);
    }

    #[test]
    fn tag_allocation_reuses_last_tag_once_free() {
        let registry = UserRegistry::new(test_logger());
        let tag = registry.assign_global_chat_tag("alice");
        assert_eq!(tag, 2);
        registry.release_tag("alice");

        let tag2 = registry.assign_global_chat_tag("bob");
        assert_eq!(tag2, 2);
        registry.release_tag("bob");

        // Alice's last tag (2) is free again; she should reclaim it over
        // the counter advancing to 3.
        let tag3 = registry.assign_global_chat_tag("alice");
        assert_eq!(tag3, 2);
    }

    #[test]
    fn chat_join_ordering_s2() {
        let registry = UserRegistry::new(test_logger());
        let (alice, _) = make_connection("Alice");
        let (carol, _) = make_connection("Carol");
        let (bob, _) = make_connection("Bob");

        registry.register("Alice", alice.clone());
        registry.register("Carol", carol.clone());
        registry.register("Bob", bob.clone());

        assert_eq!(registry.assign_global_chat_tag("alice"), 2);
        alice.set_in_chat(true);
        std::thread::sleep(std::time::Duration::from_millis(1));

        assert_eq!(registry.assign_global_chat_tag("carol"), 3);
        carol.set_in_chat(true);
        std::thread::sleep(std::time::Duration::from_millis(1));

        assert_eq!(registry.assign_global_chat_tag("bob"), 4);
        bob.set_in_chat(true);

        let ordered = registry.get_ordered_chat_members();
        let names: Vec<&str> = ordered.iter().map(|c| c.screenname()).collect();
        assert_eq!(names, vec!["Alice", "Carol", "Bob"]);
    }
}
