//! Ports the engine drives or queries. The OS integration layer implements
//! these; the engine never talks to the platform directly.

use anyhow::Result;
use std::time::Duration;

use super::events::{Capability, NavigationReason, OverlayKind, SettingsNavigation, TimerEvent};

/// Blocking surface and navigation actions.
///
/// Several overlays can be up at once (a PIN prompt and two countdowns,
/// say). Each call names its overlay, matched with
/// [`OverlayKind::same_overlay`], and leaves the others alone.
pub trait Surface: Send {
    /// Show `kind` in front, replacing the same overlay if already shown.
    fn show_blocking_overlay(&mut self, kind: OverlayKind, message: &str);

    /// Re-render an overlay already on screen (countdown ticks).
    fn update_overlay(&mut self, kind: OverlayKind) {
        let _ = kind;
    }

    fn hide_overlay(&mut self, kind: &OverlayKind);

    fn navigate_to_neutral_surface(&mut self, reason: NavigationReason);

    /// Drop a hostile settings surface from recent-task history. Platforms
    /// that cannot do this keep the default no-op.
    fn clear_from_recents(&mut self, navigation: &SettingsNavigation) {
        let _ = navigation;
    }
}

/// Authoritative OS state for guarded capabilities.
#[cfg_attr(test, mockall::automock)]
pub trait CapabilityProbe: Send {
    fn is_capability_active(&self, capability: Capability) -> Result<bool>;
}

/// Current on-screen text for an app, used to re-check after a grace
/// period.
#[cfg_attr(test, mockall::automock)]
pub trait ContentProbe: Send {
    fn current_text(&self, app_id: &str) -> Option<String>;
}

/// Outcome of asking whether a settings access targets the protected app.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Targeting {
    Targeted,
    NotTargeted,
    /// The platform did not expose enough detail to decide.
    Unknown,
}

/// Best-effort "does this settings access target the protected app".
pub trait TargetClassifier: Send {
    fn classify(&self, navigation: &SettingsNavigation) -> Targeting;
}

/// Classifier that trusts an explicit package when one is attached and
/// matches it against the protected package name.
#[derive(Debug, Clone)]
pub struct PackageMatchClassifier {
    protected_package: String,
}

impl PackageMatchClassifier {
    pub fn new(protected_package: impl Into<String>) -> Self {
        Self {
            protected_package: protected_package.into(),
        }
    }
}

impl TargetClassifier for PackageMatchClassifier {
    fn classify(&self, navigation: &SettingsNavigation) -> Targeting {
        if let Some(ref package) = navigation.target_package {
            return if package == &self.protected_package {
                Targeting::Targeted
            } else {
                Targeting::NotTargeted
            };
        }

        match navigation.detail {
            Some(ref detail) if detail.contains(&self.protected_package) => Targeting::Targeted,
            _ => Targeting::Unknown,
        }
    }
}

/// Opaque handle for a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

/// Fire-and-forget delayed delivery of a [`TimerEvent`] back into the
/// engine's event loop.
pub trait Scheduler: Send {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerId;

    fn cancel(&mut self, id: TimerId);

    fn cancel_all(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::events::{SignalSource, TamperCategory};

    #[test]
    fn explicit_package_decides() {
        let classifier = PackageMatchClassifier::new("org.browser");
        let nav = SettingsNavigation::foregrounded(
            TamperCategory::AccessibilitySettings,
            SignalSource::AccessibilityEvents,
        );

        assert_eq!(
            classifier.classify(&nav.clone().with_target("org.browser")),
            Targeting::Targeted
        );
        assert_eq!(
            classifier.classify(&nav.clone().with_target("com.other")),
            Targeting::NotTargeted
        );
        assert_eq!(classifier.classify(&nav), Targeting::Unknown);
    }

    #[test]
    fn detail_mention_counts_as_targeted() {
        let classifier = PackageMatchClassifier::new("org.browser");
        let mut nav =
            SettingsNavigation::foregrounded(TamperCategory::AppInfo, SignalSource::UsageHistory);
        nav.detail = Some("App info: org.browser".to_string());
        assert_eq!(classifier.classify(&nav), Targeting::Targeted);
    }
}
