//! Per-app temporary unlock cache.
//!
//! A session stays alive while its app keeps coming back to the
//! foreground; once `timeout` passes without a foreground observation it
//! is expired and behaves as absent, whether or not the sweep has removed
//! it yet.
//!
//! The store is plain owned state. All access goes through `&mut self` on
//! the engine's single event loop, so a sweep can never interleave with a
//! refresh.

use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// One unlocked app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnlockSession {
    pub unlocked_at_ms: u64,
    pub last_foreground_at_ms: u64,
}

impl UnlockSession {
    fn is_expired(&self, now_ms: u64, timeout_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_foreground_at_ms) >= timeout_ms
    }
}

#[derive(Debug)]
pub struct UnlockSessionStore {
    timeout_ms: u64,
    sessions: HashMap<String, UnlockSession>,
}

impl UnlockSessionStore {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout_ms: timeout.as_millis() as u64,
            sessions: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Applies to live sessions too; expiry is computed on every read.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout_ms = timeout.as_millis() as u64;
    }

    /// Insert or overwrite the session for `app_id`.
    pub fn grant(&mut self, app_id: &str, now_ms: u64) {
        self.sessions.insert(
            app_id.to_string(),
            UnlockSession {
                unlocked_at_ms: now_ms,
                last_foreground_at_ms: now_ms,
            },
        );
        debug!("Unlock session granted for {}", app_id);
    }

    /// True iff a live session exists. A live session is refreshed; an
    /// expired one is removed.
    pub fn is_unlocked(&mut self, app_id: &str, now_ms: u64) -> bool {
        let Some(session) = self.sessions.get_mut(app_id) else {
            return false;
        };

        if session.is_expired(now_ms, self.timeout_ms) {
            self.sessions.remove(app_id);
            debug!("Unlock session for {} expired on read", app_id);
            return false;
        }

        session.last_foreground_at_ms = now_ms;
        true
    }

    /// Refresh an existing live session. Never creates one.
    pub fn touch_foreground(&mut self, app_id: &str, now_ms: u64) {
        let timeout_ms = self.timeout_ms;
        if let Some(session) = self.sessions.get_mut(app_id) {
            if session.is_expired(now_ms, timeout_ms) {
                self.sessions.remove(app_id);
            } else {
                session.last_foreground_at_ms = now_ms;
            }
        }
    }

    pub fn revoke(&mut self, app_id: &str) -> bool {
        self.sessions.remove(app_id).is_some()
    }

    pub fn clear_all(&mut self) -> usize {
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let timeout_ms = self.timeout_ms;
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.is_expired(now_ms, timeout_ms));
        before - self.sessions.len()
    }

    /// Keep only sessions whose app passes `keep`. Returns how many were
    /// dropped.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let before = self.sessions.len();
        self.sessions.retain(|app, _| keep(app));
        before - self.sessions.len()
    }

    /// Physically present sessions, expired or not.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn get(&self, app_id: &str) -> Option<&UnlockSession> {
        self.sessions.get(app_id)
    }
}
