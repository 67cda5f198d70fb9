//! Tamper-detection state machine.
//!
//! Each [`TamperCategory`] is either `Idle` or `Triggered`. Foreground
//! presence of the hostile surface is the debounce key: a category stays
//! `Triggered` until its surface is reported backgrounded, so repeated
//! polls and duplicate reports from redundant sources collapse into one
//! block.
//!
//! ```text
//!            foregrounded ∧ targeted ∧ capability active ∧ gate open
//!   Idle ───────────────────────────────────────────────────────────▶ Triggered
//!    ▲                                                                   │
//!    └──────────────────────── backgrounded ─────────────────────────────┘
//! ```

use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};

use super::bypass::BypassTracker;
use super::events::{SettingsNavigation, TamperCategory, TamperEvent};
use super::host::{CapabilityProbe, TargetClassifier, Targeting};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CategoryState {
    #[default]
    Idle,
    Triggered,
}

/// Why a foregrounded hostile surface did not trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Suppression {
    NotTargeted,
    /// The guarded capability is requested but not yet confirmed active.
    CapabilityInactive,
    /// Bypass window open or tamper protection disabled.
    GateClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TamperDecision {
    Trigger(TamperEvent),
    /// Already triggered for this category; nothing to do.
    Debounced,
    Suppressed(Suppression),
    /// Surface left the foreground; category back to idle.
    Released,
    /// Backgrounded while idle.
    Ignored,
}

/// How to resolve a classifier that cannot tell whether an access targets
/// the protected app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassificationPolicy {
    fail_closed: BTreeSet<TamperCategory>,
}

impl ClassificationPolicy {
    pub fn new(fail_closed: impl IntoIterator<Item = TamperCategory>) -> Self {
        Self {
            fail_closed: fail_closed.into_iter().collect(),
        }
    }

    pub fn is_fail_closed(&self, category: TamperCategory) -> bool {
        self.fail_closed.contains(&category)
    }

    pub fn resolve(&self, category: TamperCategory, targeting: Targeting) -> bool {
        match targeting {
            Targeting::Targeted => true,
            Targeting::NotTargeted => false,
            Targeting::Unknown => self.is_fail_closed(category),
        }
    }
}

impl Default for ClassificationPolicy {
    /// Every category fails closed. Only an explicit `NotTargeted` from the
    /// classifier lets an access through.
    fn default() -> Self {
        Self::new(TamperCategory::ALL)
    }
}

#[derive(Debug, Default)]
pub struct TamperDetector {
    states: HashMap<TamperCategory, CategoryState>,
    policy: ClassificationPolicy,
}

impl TamperDetector {
    pub fn new(policy: ClassificationPolicy) -> Self {
        Self {
            states: HashMap::new(),
            policy,
        }
    }

    pub fn state(&self, category: TamperCategory) -> CategoryState {
        self.states.get(&category).copied().unwrap_or_default()
    }

    pub fn policy(&self) -> &ClassificationPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: ClassificationPolicy) {
        self.policy = policy;
    }

    /// Run one navigation signal through the state machine.
    pub fn on_navigation(
        &mut self,
        navigation: &SettingsNavigation,
        now_ms: u64,
        classifier: &dyn TargetClassifier,
        gate: &mut BypassTracker,
        probe: &dyn CapabilityProbe,
    ) -> TamperDecision {
        let category = navigation.category;

        if !navigation.foregrounded {
            return match self.states.insert(category, CategoryState::Idle) {
                Some(CategoryState::Triggered) => {
                    debug!("{} left the foreground, re-arming", category);
                    TamperDecision::Released
                }
                _ => TamperDecision::Ignored,
            };
        }

        if self.state(category) == CategoryState::Triggered {
            debug!(
                "{} already triggered, ignoring {:?} signal",
                category, navigation.source
            );
            return TamperDecision::Debounced;
        }

        let targeting = classifier.classify(navigation);
        let targeted = self.policy.resolve(category, targeting);
        if !targeted {
            debug!("{} access does not target us ({:?})", category, targeting);
            return TamperDecision::Suppressed(Suppression::NotTargeted);
        }

        if let Some(capability) = category.guarded_capability()
            && !gate.is_privilege_actually_active(capability, probe)
        {
            debug!(
                "{} not yet active, treating {} access as setup",
                capability, category
            );
            return TamperDecision::Suppressed(Suppression::CapabilityInactive);
        }

        if !gate.should_trigger_protection(now_ms) {
            return TamperDecision::Suppressed(Suppression::GateClosed);
        }

        self.states.insert(category, CategoryState::Triggered);
        info!(
            "Tamper attempt via {} (source: {:?}, classification: {:?})",
            category, navigation.source, targeting
        );

        TamperDecision::Trigger(TamperEvent {
            category,
            targets_protected_app: true,
            timestamp_ms: now_ms,
        })
    }

    /// Return every category to idle.
    pub fn reset(&mut self) {
        self.states.clear();
    }
}
