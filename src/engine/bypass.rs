//! Global bypass window and capability activation latch.
//!
//! After a successful high-friction challenge the user gets a time-boxed
//! exemption from every tamper block. The window is a pure function of two
//! timestamps; reading it once expired clears the stored timestamp, so
//! repeated reads stay `false` until the next completion.
//!
//! The latch answers "is this capability actually active, not merely
//! requested". While the OS has not confirmed a grant, settings navigation
//! for that capability is legitimate setup and must not trigger.

use std::time::Duration;
use tracing::{debug, info, warn};

use super::events::Capability;
use super::host::CapabilityProbe;
use super::state::StateFile;

/// Result of a window check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    /// No completion recorded.
    Inactive,
    Active { remaining_ms: u64 },
    /// Was active, found expired on this read and cleared.
    JustExpired,
}

#[derive(Debug)]
pub struct BypassTracker {
    store: StateFile,
    duration_ms: u64,
    protection_enabled: bool,
}

impl BypassTracker {
    pub fn new(store: StateFile, duration: Duration, protection_enabled: bool) -> Self {
        Self {
            store,
            duration_ms: duration.as_millis() as u64,
            protection_enabled,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// Only the stored completion time is persisted, so an open window is
    /// re-measured against the new length.
    pub fn set_duration(&mut self, duration: Duration) {
        self.duration_ms = duration.as_millis() as u64;
    }

    pub fn record_completion(&mut self, now_ms: u64) {
        self.store
            .update(|s| s.last_challenge_completion_ms = Some(now_ms));
        info!(
            "Bypass window opened for {}s",
            self.duration_ms / 1000
        );
    }

    /// Check the window, clearing it if it has run out.
    pub fn poll(&mut self, now_ms: u64) -> WindowState {
        let Some(last) = self.store.state().last_challenge_completion_ms else {
            return WindowState::Inactive;
        };

        let elapsed = now_ms.saturating_sub(last);
        // Closed at exactly `duration`, so `remaining_ms > 0` iff active.
        if elapsed < self.duration_ms {
            return WindowState::Active {
                remaining_ms: self.duration_ms - elapsed,
            };
        }

        self.store.update(|s| s.last_challenge_completion_ms = None);
        info!("Bypass window expired");
        WindowState::JustExpired
    }

    /// Remaining time without clearing an expired window. Safe for readers
    /// that share the state file with a running engine.
    pub fn peek_remaining_ms(&self, now_ms: u64) -> u64 {
        self.store
            .state()
            .last_challenge_completion_ms
            .map_or(0, |last| {
                self.duration_ms
                    .saturating_sub(now_ms.saturating_sub(last))
            })
    }

    pub fn is_within_window(&mut self, now_ms: u64) -> bool {
        matches!(self.poll(now_ms), WindowState::Active { .. })
    }

    /// Milliseconds left for display. Zero exactly when the window is not
    /// active.
    pub fn remaining_ms(&mut self, now_ms: u64) -> u64 {
        match self.poll(now_ms) {
            WindowState::Active { remaining_ms } => remaining_ms,
            _ => 0,
        }
    }

    pub fn clear(&mut self) -> bool {
        let had_window = self.store.state().last_challenge_completion_ms.is_some();
        if had_window {
            self.store.update(|s| s.last_challenge_completion_ms = None);
            info!("Bypass window cleared");
        }
        had_window
    }

    pub fn protection_enabled(&self) -> bool {
        self.protection_enabled
    }

    pub fn set_protection_enabled(&mut self, enabled: bool) {
        self.protection_enabled = enabled;
        if !enabled {
            // Nothing left to bypass.
            self.clear();
        }
    }

    /// The single gate every tamper path consults before acting.
    pub fn should_trigger_protection(&mut self, now_ms: u64) -> bool {
        if self.is_within_window(now_ms) {
            debug!("Tamper protection suppressed: bypass window active");
            return false;
        }
        self.protection_enabled
    }

    /// Reconcile the cached activation state against the OS and return the
    /// authoritative value. A failed query counts as not active.
    pub fn is_privilege_actually_active(
        &mut self,
        capability: Capability,
        probe: &dyn CapabilityProbe,
    ) -> bool {
        let active = match probe.is_capability_active(capability) {
            Ok(active) => active,
            Err(e) => {
                warn!(
                    "Capability query for {} failed ({:#}), treating as inactive",
                    capability, e
                );
                false
            }
        };

        let cached = self.store.state().capability_cache.get(&capability).copied();
        if cached != Some(active) {
            info!(
                "Capability {} is now {}",
                capability,
                if active { "active" } else { "inactive" }
            );
            self.store.update(|s| {
                s.capability_cache.insert(capability, active);
            });
        }

        active
    }

    pub fn cached_capability(&self, capability: Capability) -> Option<bool> {
        self.store.state().capability_cache.get(&capability).copied()
    }
}
