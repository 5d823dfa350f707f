//! In-memory session store with per-session locking and TTL eviction.
//!
//! The index is a plain map guarded by a `std::sync::Mutex`; each entry
//! holds an `Arc<tokio::sync::Mutex<Session>>` so the gate-check /
//! process / increment sequence for one session is exclusive while
//! different sessions never contend. Transports hold the session lock
//! across the whole request: same-session requests serialize, requests
//! for other sessions proceed concurrently.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::session::Session;

pub type SessionHandle = Arc<Mutex<Session>>;

pub struct SessionStore {
    sessions: StdMutex<HashMap<String, SessionHandle>>,
    ttl_secs: u64,
}

impl SessionStore {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            ttl_secs,
        }
    }

    /// Generate a fresh session id for clients that did not supply one.
    pub fn new_session_id() -> String {
        format!("session_{}", Uuid::new_v4())
    }

    /// Fetch the session for `id`, creating it lazily on first contact.
    pub fn get_or_create(&self, id: &str) -> SessionHandle {
        let mut map = self.sessions.lock().expect("session index poisoned");
        map.entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Session::new(id))))
            .clone()
    }

    /// Fetch an existing session without creating one. Email/skip
    /// submissions for unknown session ids must fail, not spawn state.
    pub fn get(&self, id: &str) -> Option<SessionHandle> {
        let map = self.sessions.lock().expect("session index poisoned");
        map.get(id).cloned()
    }

    /// Drop all state for a session id. Returns whether it existed.
    pub fn clear(&self, id: &str) -> bool {
        let mut map = self.sessions.lock().expect("session index poisoned");
        map.remove(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("session index poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove sessions idle past the TTL. Returns the eviction count.
    ///
    /// Entries whose lock is currently held (a request in flight) are
    /// skipped this sweep; `last_seen` will be fresh by the next one.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut map = self.sessions.lock().expect("session index poisoned");
        let before = map.len();
        map.retain(|_, handle| match handle.try_lock() {
            Ok(session) => !session.is_expired(now, self.ttl_secs),
            Err(_) => true,
        });
        before - map.len()
    }
}
