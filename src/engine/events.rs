//! Signals flowing into the engine and the vocabulary shared with the host.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A system capability whose revocation would weaken enforcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Accessibility service used to observe foreground changes.
    Accessibility,
    /// Device administrator, which blocks uninstallation.
    DeviceAdmin,
    /// Permission to draw blocking surfaces over other apps.
    Overlay,
}

impl Capability {
    pub const ALL: [Capability; 3] = [
        Capability::Accessibility,
        Capability::DeviceAdmin,
        Capability::Overlay,
    ];
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::Accessibility => "accessibility",
            Capability::DeviceAdmin => "device_admin",
            Capability::Overlay => "overlay",
        };
        f.write_str(name)
    }
}

/// The settings surface a tamper attempt goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TamperCategory {
    AccessibilitySettings,
    DeviceAdminSettings,
    /// App info page, which hosts force-stop and uninstall.
    AppInfo,
    OverlayPermission,
}

impl TamperCategory {
    pub const ALL: [TamperCategory; 4] = [
        TamperCategory::AccessibilitySettings,
        TamperCategory::DeviceAdminSettings,
        TamperCategory::AppInfo,
        TamperCategory::OverlayPermission,
    ];

    /// Capability this surface can revoke, if any.
    ///
    /// A category whose capability is not yet active cannot be abused, so
    /// its checks short-circuit while the user is still granting it.
    pub fn guarded_capability(self) -> Option<Capability> {
        match self {
            TamperCategory::AccessibilitySettings => Some(Capability::Accessibility),
            TamperCategory::DeviceAdminSettings => Some(Capability::DeviceAdmin),
            TamperCategory::OverlayPermission => Some(Capability::Overlay),
            TamperCategory::AppInfo => None,
        }
    }

    pub fn blocking_message(self) -> &'static str {
        match self {
            TamperCategory::AccessibilitySettings => {
                "Accessibility settings are locked while app protection is on."
            }
            TamperCategory::DeviceAdminSettings => {
                "Device admin settings are locked while app protection is on."
            }
            TamperCategory::AppInfo => {
                "This app cannot be stopped or uninstalled while protection is on."
            }
            TamperCategory::OverlayPermission => {
                "Overlay permission cannot be changed while app protection is on."
            }
        }
    }
}

impl fmt::Display for TamperCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TamperCategory::AccessibilitySettings => "accessibility_settings",
            TamperCategory::DeviceAdminSettings => "device_admin_settings",
            TamperCategory::AppInfo => "app_info",
            TamperCategory::OverlayPermission => "overlay_permission",
        };
        f.write_str(name)
    }
}

/// Which observer produced a navigation signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalSource {
    /// Periodic poll of usage history.
    UsageHistory,
    /// Live accessibility event stream.
    AccessibilityEvents,
    /// Intent or deep link into a settings page.
    Intent,
}

/// A settings surface entering or leaving the foreground.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsNavigation {
    pub category: TamperCategory,
    pub foregrounded: bool,
    pub source: SignalSource,
    /// Package the surface is acting on, when the platform exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_package: Option<String>,
    /// Window title or activity name, fed to the target classifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SettingsNavigation {
    pub fn foregrounded(category: TamperCategory, source: SignalSource) -> Self {
        Self {
            category,
            foregrounded: true,
            source,
            target_package: None,
            detail: None,
        }
    }

    pub fn backgrounded(category: TamperCategory, source: SignalSource) -> Self {
        Self {
            foregrounded: false,
            ..Self::foregrounded(category, source)
        }
    }

    pub fn with_target(mut self, package: impl Into<String>) -> Self {
        self.target_package = Some(package.into());
        self
    }
}

/// A classified tamper attempt, consumed within one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TamperEvent {
    pub category: TamperCategory,
    pub targets_protected_app: bool,
    pub timestamp_ms: u64,
}

/// What a blocking surface is shown for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverlayKind {
    /// PIN prompt in front of a protected app.
    AppLock { app_id: String },
    /// Tamper block for a settings surface.
    Tamper { category: TamperCategory },
    /// Keyword countdown for an app showing banned content.
    Keyword { app_id: String, remaining_secs: u32 },
}

impl OverlayKind {
    /// Whether both name the same on-screen overlay. A countdown keeps its
    /// identity as its remaining seconds change.
    pub fn same_overlay(&self, other: &OverlayKind) -> bool {
        match (self, other) {
            (OverlayKind::AppLock { app_id: a }, OverlayKind::AppLock { app_id: b }) => a == b,
            (OverlayKind::Tamper { category: a }, OverlayKind::Tamper { category: b }) => a == b,
            (OverlayKind::Keyword { app_id: a, .. }, OverlayKind::Keyword { app_id: b, .. }) => {
                a == b
            }
            _ => false,
        }
    }
}

/// Why the engine sent the user home.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum NavigationReason {
    Tamper { category: TamperCategory },
    CountdownExpired { app_id: String },
}

/// Scheduled callbacks delivered back into the engine's event loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    CountdownTick { app_id: String, generation: u64 },
    GraceElapsed { app_id: String, generation: u64 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_info_guards_no_capability() {
        assert_eq!(TamperCategory::AppInfo.guarded_capability(), None);
        assert_eq!(
            TamperCategory::OverlayPermission.guarded_capability(),
            Some(Capability::Overlay)
        );
    }

    #[test]
    fn settings_navigation_parses_without_optional_fields() {
        let json = r#"{"category":"app_info","foregrounded":true,"source":"intent"}"#;
        let nav: SettingsNavigation = serde_json::from_str(json).unwrap();
        assert_eq!(nav.category, TamperCategory::AppInfo);
        assert!(nav.target_package.is_none());
    }

    #[test]
    fn countdown_keeps_identity_across_ticks() {
        let at = |remaining_secs| OverlayKind::Keyword {
            app_id: "app.video".to_string(),
            remaining_secs,
        };
        assert!(at(15).same_overlay(&at(3)));
        assert!(!at(15).same_overlay(&OverlayKind::Keyword {
            app_id: "app.music".to_string(),
            remaining_secs: 15,
        }));
        assert!(!at(15).same_overlay(&OverlayKind::AppLock {
            app_id: "app.video".to_string(),
        }));
    }

    #[test]
    fn overlay_kind_is_tagged() {
        let json = serde_json::to_string(&OverlayKind::Tamper {
            category: TamperCategory::DeviceAdminSettings,
        })
        .unwrap();
        assert_eq!(json, r#"{"kind":"tamper","category":"device_admin_settings"}"#);
    }
}
