//! Protection coordination engine.
//!
//! One [`ProtectionEngine`] owns every piece of protection state: unlock
//! sessions, the bypass window, tamper category states and keyword
//! challenges. It is driven from a single sequential context (see
//! [`runtime`]), so none of that state needs locking.
//!
//! ```text
//!  OS signals ──▶ EngineHandle ──▶ channel ──▶ ProtectionEngine ──▶ Surface
//!  timers ───────────────────────────┘            │
//!                                                 ├─ UnlockSessionStore
//!                                                 ├─ BypassTracker ── StateFile
//!                                                 ├─ TamperDetector
//!                                                 └─ KeywordGuard
//! ```

pub mod bypass;
pub mod events;
pub mod host;
pub mod keyword;
pub mod runtime;
pub mod scheduler;
pub mod session;
pub mod state;
pub mod tamper;
#[cfg(test)]
pub(crate) mod testing;

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::{Config, parse_duration};
use crate::security::{AuditAction, AuditLog};

pub use bypass::{BypassTracker, WindowState};
pub use events::{
    Capability, NavigationReason, OverlayKind, SettingsNavigation, SignalSource, TamperCategory,
    TamperEvent, TimerEvent,
};
pub use host::{
    CapabilityProbe, ContentProbe, PackageMatchClassifier, Scheduler, Surface, TargetClassifier,
    Targeting, TimerId,
};
pub use keyword::{ChallengeState, KeywordGuard, KeywordMatcher, ViolationOutcome};
pub use runtime::{EngineHandle, EngineRuntime};
pub use scheduler::TokioScheduler;
pub use session::UnlockSessionStore;
pub use state::StateFile;
pub use tamper::{CategoryState, ClassificationPolicy, TamperDecision, TamperDetector};

/// Errors surfaced through the async handle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("protection engine has stopped")]
    Stopped,

    #[error("invalid engine configuration: {0}")]
    Config(String),
}

/// Resolved policy values the engine runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    pub app_lock_enabled: bool,
    pub protected_apps: BTreeSet<String>,
    pub session_timeout: Duration,
    pub sweep_interval: Duration,
    pub relock_on_screen_off: bool,

    pub tamper_enabled: bool,
    pub bypass_duration: Duration,
    pub fail_closed: BTreeSet<TamperCategory>,
    pub clear_recents: bool,

    pub keyword_enabled: bool,
    pub keywords: Vec<String>,
    pub countdown_secs: u32,
    pub grace_period: Duration,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            app_lock_enabled: true,
            protected_apps: BTreeSet::new(),
            session_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(60),
            relock_on_screen_off: true,
            tamper_enabled: true,
            bypass_duration: Duration::from_secs(300),
            fail_closed: TamperCategory::ALL.into_iter().collect(),
            clear_recents: true,
            keyword_enabled: true,
            keywords: Vec::new(),
            countdown_secs: 15,
            grace_period: Duration::from_secs(15),
        }
    }
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Result<Self> {
        let duration = |field: &str, value: &str| {
            parse_duration(value).map_err(|e| EngineError::Config(format!("{}: {}", field, e)))
        };

        Ok(Self {
            app_lock_enabled: config.lock.enabled,
            protected_apps: config.lock.protected_apps.iter().cloned().collect(),
            session_timeout: duration("lock.session_timeout", &config.lock.session_timeout)?,
            sweep_interval: duration("lock.sweep_interval", &config.lock.sweep_interval)?,
            relock_on_screen_off: config.lock.relock_on_screen_off,
            tamper_enabled: config.tamper.enabled,
            bypass_duration: duration("tamper.bypass_duration", &config.tamper.bypass_duration)?,
            fail_closed: config.tamper.fail_closed.iter().copied().collect(),
            clear_recents: config.tamper.clear_recents,
            keyword_enabled: config.keyword.enabled,
            keywords: config.keyword.keywords.clone(),
            countdown_secs: config.keyword.countdown_secs,
            grace_period: duration("keyword.grace_period", &config.keyword.grace_period)?,
        })
    }
}

/// Everything the engine needs from the platform.
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub surface: Box<dyn Surface>,
    pub capabilities: Box<dyn CapabilityProbe>,
    pub content: Box<dyn ContentProbe>,
    pub classifier: Box<dyn TargetClassifier>,
    pub scheduler: Box<dyn Scheduler>,
}

/// Outcome of a foreground change for app lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LockDecision {
    /// Protected, and a live unlock session exists.
    Allow,
    /// Protected and locked; the PIN prompt was shown.
    Block,
    NotProtected,
    /// Background transition, app lock disabled, or engine stopped.
    Ignored,
}

/// Point-in-time summary for status queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub app_lock_enabled: bool,
    pub tamper_enabled: bool,
    pub keyword_enabled: bool,
    pub protected_apps: Vec<String>,
    pub unlock_sessions: usize,
    pub bypass_remaining_ms: u64,
    pub triggered_categories: Vec<TamperCategory>,
    pub keyword_challenges: usize,
}

pub struct ProtectionEngine {
    clock: Arc<dyn Clock>,
    surface: Box<dyn Surface>,
    capabilities: Box<dyn CapabilityProbe>,
    content: Box<dyn ContentProbe>,
    classifier: Box<dyn TargetClassifier>,
    scheduler: Box<dyn Scheduler>,

    sessions: UnlockSessionStore,
    bypass: BypassTracker,
    tamper: TamperDetector,
    keywords: KeywordGuard,
    matcher: KeywordMatcher,

    protected_apps: BTreeSet<String>,
    app_lock_enabled: bool,
    keyword_enabled: bool,
    relock_on_screen_off: bool,
    clear_recents: bool,
    sweep_interval: Duration,
    /// App whose PIN prompt the engine is currently showing.
    pending_lock: Option<String>,

    audit: Option<AuditLog>,
    shut_down: bool,
}

impl ProtectionEngine {
    pub fn new(
        settings: EngineSettings,
        state: StateFile,
        collaborators: Collaborators,
    ) -> Result<Self> {
        let matcher = KeywordMatcher::new(&settings.keywords).context("Invalid keyword list")?;

        Ok(Self {
            clock: collaborators.clock,
            surface: collaborators.surface,
            capabilities: collaborators.capabilities,
            content: collaborators.content,
            classifier: collaborators.classifier,
            scheduler: collaborators.scheduler,
            sessions: UnlockSessionStore::new(settings.session_timeout),
            bypass: BypassTracker::new(state, settings.bypass_duration, settings.tamper_enabled),
            tamper: TamperDetector::new(ClassificationPolicy::new(settings.fail_closed)),
            keywords: KeywordGuard::new(settings.countdown_secs, settings.grace_period),
            matcher,
            protected_apps: settings.protected_apps,
            app_lock_enabled: settings.app_lock_enabled,
            keyword_enabled: settings.keyword_enabled,
            relock_on_screen_off: settings.relock_on_screen_off,
            clear_recents: settings.clear_recents,
            sweep_interval: settings.sweep_interval,
            pending_lock: None,
            audit: None,
            shut_down: false,
        })
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = Some(audit);
        self
    }

    fn now(&self) -> u64 {
        self.clock.now_ms()
    }

    fn audit(&self, action: AuditAction, subject: &str, detail: Option<&str>) {
        if let Some(ref audit) = self.audit {
            audit.record(action, subject, detail);
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // ── App lock ────────────────────────────────────────────────────

    pub fn is_protected(&self, app_id: &str) -> bool {
        self.protected_apps.contains(app_id)
    }

    pub fn protect_app(&mut self, app_id: &str) {
        if self.protected_apps.insert(app_id.to_string()) {
            info!("Now protecting {}", app_id);
        }
    }

    pub fn unprotect_app(&mut self, app_id: &str) {
        if self.protected_apps.remove(app_id) {
            self.sessions.revoke(app_id);
            info!("No longer protecting {}", app_id);
        }
    }

    pub fn set_protected_apps(&mut self, apps: impl IntoIterator<Item = String>) {
        self.protected_apps = apps.into_iter().collect();
        let protected = &self.protected_apps;
        let revoked = self.sessions.retain(|app| protected.contains(app));
        if revoked > 0 {
            debug!("Revoked {} session(s) for apps no longer protected", revoked);
        }
    }

    pub fn set_app_lock(&mut self, enabled: bool) {
        self.app_lock_enabled = enabled;
        if !enabled {
            self.sessions.clear_all();
            if let Some(app_id) = self.pending_lock.take() {
                self.surface.hide_overlay(&OverlayKind::AppLock { app_id });
            }
        }
        info!("App lock {}", if enabled { "enabled" } else { "disabled" });
    }

    /// Decide whether `app_id` coming to the foreground must be blocked.
    pub fn on_foreground(&mut self, app_id: &str, foregrounded: bool) -> LockDecision {
        if self.shut_down || !self.app_lock_enabled {
            return LockDecision::Ignored;
        }
        if !foregrounded {
            return LockDecision::Ignored;
        }
        if !self.is_protected(app_id) {
            return LockDecision::NotProtected;
        }

        let now = self.now();
        if self.sessions.is_unlocked(app_id, now) {
            debug!("{} unlocked, allowing", app_id);
            return LockDecision::Allow;
        }

        info!("{} is locked, showing PIN prompt", app_id);
        self.pending_lock = Some(app_id.to_string());
        self.surface.show_blocking_overlay(
            OverlayKind::AppLock {
                app_id: app_id.to_string(),
            },
            "Enter your PIN to open this app.",
        );
        LockDecision::Block
    }

    /// Keep-alive from a polling source that still sees `app_id` in front.
    pub fn touch_foreground(&mut self, app_id: &str) {
        if self.shut_down {
            return;
        }
        let now = self.now();
        self.sessions.touch_foreground(app_id, now);
    }

    /// Called by the PIN collaborator after a correct PIN.
    pub fn grant_unlock(&mut self, app_id: &str) {
        if self.shut_down {
            return;
        }
        let now = self.now();
        self.sessions.grant(app_id, now);
        if self.pending_lock.as_deref() == Some(app_id) {
            self.pending_lock = None;
            self.surface.hide_overlay(&OverlayKind::AppLock {
                app_id: app_id.to_string(),
            });
        }
    }

    pub fn is_unlocked(&mut self, app_id: &str) -> bool {
        let now = self.now();
        self.sessions.is_unlocked(app_id, now)
    }

    pub fn revoke_unlock(&mut self, app_id: &str) -> bool {
        self.sessions.revoke(app_id)
    }

    /// Screen off or device lock: every unlock session ends.
    pub fn on_screen_off(&mut self) {
        if !self.relock_on_screen_off {
            return;
        }
        let cleared = self.sessions.clear_all();
        if cleared > 0 {
            info!("Screen off, relocked {} app(s)", cleared);
        }
    }

    pub fn sweep(&mut self) -> usize {
        let now = self.now();
        let removed = self.sessions.sweep(now);
        if removed > 0 {
            debug!("Swept {} expired unlock session(s)", removed);
        }
        removed
    }

    // ── Bypass window ───────────────────────────────────────────────

    pub fn record_challenge_completion(&mut self) {
        let now = self.now();
        self.bypass.record_completion(now);
        self.audit(AuditAction::BypassGranted, "", None);
    }

    fn poll_bypass(&mut self) -> WindowState {
        let now = self.now();
        let state = self.bypass.poll(now);
        if state == WindowState::JustExpired {
            self.audit(AuditAction::BypassExpired, "", None);
        }
        state
    }

    pub fn is_within_bypass_window(&mut self) -> bool {
        matches!(self.poll_bypass(), WindowState::Active { .. })
    }

    pub fn remaining_bypass_ms(&mut self) -> u64 {
        match self.poll_bypass() {
            WindowState::Active { remaining_ms } => remaining_ms,
            _ => 0,
        }
    }

    /// Admin action: close the bypass window early.
    pub fn clear_bypass(&mut self) {
        if self.bypass.clear() {
            self.audit(AuditAction::BypassCleared, "", Some("admin"));
        }
    }

    pub fn should_trigger_protection(&mut self) -> bool {
        let _ = self.poll_bypass();
        let now = self.now();
        self.bypass.should_trigger_protection(now)
    }

    pub fn is_privilege_actually_active(&mut self, capability: Capability) -> bool {
        self.bypass
            .is_privilege_actually_active(capability, self.capabilities.as_ref())
    }

    // ── Tamper detection ────────────────────────────────────────────

    pub fn set_tamper_protection(&mut self, enabled: bool) {
        let was_enabled = self.bypass.protection_enabled();
        self.bypass.set_protection_enabled(enabled);
        if !enabled {
            self.tamper.reset();
            if was_enabled {
                self.audit(AuditAction::ProtectionDisabled, "tamper", None);
            }
        }
        info!(
            "Tamper protection {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn tamper_state(&self, category: TamperCategory) -> CategoryState {
        self.tamper.state(category)
    }

    pub fn on_settings_navigation(&mut self, navigation: &SettingsNavigation) -> TamperDecision {
        if self.shut_down {
            return TamperDecision::Ignored;
        }

        // Surface bypass expiry in the audit trail before the gate runs.
        let _ = self.poll_bypass();

        let now = self.now();
        let decision = self.tamper.on_navigation(
            navigation,
            now,
            self.classifier.as_ref(),
            &mut self.bypass,
            self.capabilities.as_ref(),
        );

        if let TamperDecision::Trigger(ref event) = decision {
            self.block_tamper(navigation, event);
        }
        decision
    }

    fn block_tamper(&mut self, navigation: &SettingsNavigation, event: &TamperEvent) {
        let category = event.category;
        self.surface.show_blocking_overlay(
            OverlayKind::Tamper { category },
            category.blocking_message(),
        );
        self.surface
            .navigate_to_neutral_surface(NavigationReason::Tamper { category });
        if self.clear_recents {
            self.surface.clear_from_recents(navigation);
        }

        let source = format!("{:?}", navigation.source);
        self.audit(
            AuditAction::TamperBlocked,
            &category.to_string(),
            Some(&source),
        );
    }

    // ── Keyword protection ──────────────────────────────────────────

    pub fn set_keyword_protection(&mut self, enabled: bool) {
        self.keyword_enabled = enabled;
        if !enabled {
            self.keywords
                .cancel_all(self.scheduler.as_mut(), self.surface.as_mut());
        }
        info!(
            "Keyword protection {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn set_keywords<S: AsRef<str>>(&mut self, keywords: &[S]) -> Result<()> {
        self.matcher = KeywordMatcher::new(keywords).context("Invalid keyword list")?;
        Ok(())
    }

    pub fn keyword_challenge(&self, app_id: &str) -> Option<ChallengeState> {
        self.keywords.challenge(app_id).map(|c| c.state)
    }

    /// Banned-content signal. Returns `None` when keyword protection is off
    /// or the text contains no banned keyword.
    pub fn on_content_violation(&mut self, app_id: &str, text: &str) -> Option<ViolationOutcome> {
        if self.shut_down || !self.keyword_enabled {
            return None;
        }

        let Some(keyword) = self.matcher.find(text) else {
            debug!("Content from {} has no banned keyword", app_id);
            return None;
        };
        debug!("Banned keyword {:?} in {}", keyword, app_id);

        Some(
            self.keywords
                .on_violation(app_id, self.scheduler.as_mut(), self.surface.as_mut()),
        )
    }

    /// "Fix it now": hide the countdown and open the grace period.
    pub fn defer_keyword_challenge(&mut self, app_id: &str) -> bool {
        if self.shut_down {
            return false;
        }
        let deferred = self
            .keywords
            .defer(app_id, self.scheduler.as_mut(), self.surface.as_mut());
        if deferred {
            self.audit(AuditAction::GraceGranted, app_id, None);
        }
        deferred
    }

    /// Deliver a scheduled timer. Late deliveries after shutdown, or for a
    /// challenge that has moved on, are dropped.
    pub fn on_timer(&mut self, event: TimerEvent) {
        if self.shut_down {
            debug!("Dropping timer after shutdown: {:?}", event);
            return;
        }

        match event {
            TimerEvent::CountdownTick { app_id, generation } => {
                let outcome = self.keywords.on_tick(
                    &app_id,
                    generation,
                    self.scheduler.as_mut(),
                    self.surface.as_mut(),
                );
                if outcome == keyword::TickOutcome::Expired {
                    self.audit(AuditAction::CountdownExpired, &app_id, None);
                }
            }
            TimerEvent::GraceElapsed { app_id, generation } => {
                let content = &self.content;
                let matcher = &self.matcher;
                // A probe that cannot read the screen counts as resolved.
                let still_violating = |app: &str| {
                    content
                        .current_text(app)
                        .is_some_and(|text| matcher.find(&text).is_some())
                };
                self.keywords.on_grace_elapsed(
                    &app_id,
                    generation,
                    still_violating,
                    self.scheduler.as_mut(),
                    self.surface.as_mut(),
                );
            }
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Re-apply settings from a reloaded config. Everything but the sweep
    /// interval takes effect immediately; a countdown already running keeps
    /// its length.
    pub fn reload(&mut self, settings: &EngineSettings) -> Result<()> {
        self.set_keywords(&settings.keywords)?;
        self.set_protected_apps(settings.protected_apps.iter().cloned());
        self.relock_on_screen_off = settings.relock_on_screen_off;
        self.clear_recents = settings.clear_recents;

        self.sessions.set_timeout(settings.session_timeout);
        self.bypass.set_duration(settings.bypass_duration);
        self.tamper.set_policy(ClassificationPolicy::new(
            settings.fail_closed.iter().copied(),
        ));
        self.keywords
            .set_timing(settings.countdown_secs, settings.grace_period);
        if settings.sweep_interval != self.sweep_interval {
            warn!(
                "lock.sweep_interval changed to {:?}; restart to apply (still {:?})",
                settings.sweep_interval, self.sweep_interval
            );
        }

        if settings.app_lock_enabled != self.app_lock_enabled {
            self.set_app_lock(settings.app_lock_enabled);
        }
        if settings.tamper_enabled != self.bypass.protection_enabled() {
            self.set_tamper_protection(settings.tamper_enabled);
        }
        if settings.keyword_enabled != self.keyword_enabled {
            self.set_keyword_protection(settings.keyword_enabled);
        }
        info!("Engine settings reloaded");
        Ok(())
    }

    pub fn status(&mut self) -> EngineStatus {
        let bypass_remaining_ms = self.remaining_bypass_ms();
        let triggered_categories = TamperCategory::ALL
            .into_iter()
            .filter(|c| self.tamper.state(*c) == CategoryState::Triggered)
            .collect();

        EngineStatus {
            app_lock_enabled: self.app_lock_enabled,
            tamper_enabled: self.bypass.protection_enabled(),
            keyword_enabled: self.keyword_enabled,
            protected_apps: self.protected_apps.iter().cloned().collect(),
            unlock_sessions: self.sessions.len(),
            bypass_remaining_ms,
            triggered_categories,
            keyword_challenges: self.keywords.active_count(),
        }
    }

    /// Cancel every timer and drop ephemeral state. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.keywords
            .cancel_all(self.scheduler.as_mut(), self.surface.as_mut());
        self.scheduler.cancel_all();
        self.sessions.clear_all();
        self.tamper.reset();
        self.shut_down = true;
        info!("Protection engine shut down");
    }

    /// Capability cache as last reconciled, for diagnostics.
    pub fn capability_cache(&self) -> BTreeMap<Capability, bool> {
        Capability::ALL
            .into_iter()
            .filter_map(|c| self.bypass.cached_capability(c).map(|v| (c, v)))
            .collect()
    }
}
