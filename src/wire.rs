//! JSON-lines protocol between `pinguard run` and the platform shim.
//!
//! The shim writes one [`Request`] per line on stdin and reads one
//! [`Outbound`] per line from stdout.
//!
//! ```text
//! → {"type":"foreground","app_id":"com.example.mail","id":1}
//! ← {"type":"show_overlay","overlay":{"kind":"app_lock","app_id":"com.example.mail"},"message":"..."}
//! ← {"type":"reply","id":1,"result":"block"}
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::engine::{
    Capability, CapabilityProbe, ContentProbe, EngineError, EngineHandle, NavigationReason,
    OverlayKind, SettingsNavigation, SignalSource, Surface, TamperCategory, TamperDecision,
};

fn default_true() -> bool {
    true
}

/// One inbound line. `id`, when present, asks for a `reply`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Option<u64>,

    #[serde(flatten)]
    pub message: Inbound,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Foreground {
        app_id: String,
        #[serde(default = "default_true")]
        foregrounded: bool,
    },
    Settings {
        category: TamperCategory,
        source: SignalSource,
        #[serde(default = "default_true")]
        foregrounded: bool,
        #[serde(default)]
        target_package: Option<String>,
        #[serde(default)]
        detail: Option<String>,
    },
    Content {
        app_id: String,
        text: String,
    },
    /// Authoritative capability state, pushed whenever it changes.
    Capability {
        capability: Capability,
        active: bool,
    },
    /// Keep-alive from a poller that still sees `app_id` in front.
    Touch {
        app_id: String,
    },
    ScreenOff,
    Unlock {
        app_id: String,
    },
    IsUnlocked {
        app_id: String,
    },
    ChallengeCompleted,
    BypassWindow,
    Defer {
        app_id: String,
    },
    Query,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    ShowOverlay {
        overlay: OverlayKind,
        message: String,
    },
    UpdateOverlay {
        overlay: OverlayKind,
    },
    HideOverlay {
        overlay: OverlayKind,
    },
    NavigateHome {
        reason: NavigationReason,
    },
    ClearRecents {
        category: TamperCategory,
    },
    Reply {
        id: u64,
        result: serde_json::Value,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<u64>,
        message: String,
    },
}

/// Surface that turns engine actions into outbound lines.
#[derive(Debug, Clone)]
pub struct StdioSurface {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl StdioSurface {
    pub fn new(tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { tx }
    }

    fn emit(&self, message: Outbound) {
        if self.tx.send(message).is_err() {
            warn!("Output closed, dropping surface action");
        }
    }
}

impl Surface for StdioSurface {
    fn show_blocking_overlay(&mut self, kind: OverlayKind, message: &str) {
        self.emit(Outbound::ShowOverlay {
            overlay: kind,
            message: message.to_string(),
        });
    }

    fn update_overlay(&mut self, kind: OverlayKind) {
        self.emit(Outbound::UpdateOverlay { overlay: kind });
    }

    fn hide_overlay(&mut self, kind: &OverlayKind) {
        self.emit(Outbound::HideOverlay {
            overlay: kind.clone(),
        });
    }

    fn navigate_to_neutral_surface(&mut self, reason: NavigationReason) {
        self.emit(Outbound::NavigateHome { reason });
    }

    fn clear_from_recents(&mut self, navigation: &SettingsNavigation) {
        self.emit(Outbound::ClearRecents {
            category: navigation.category,
        });
    }
}

/// Capability table fed by `capability` lines.
#[derive(Debug, Clone, Default)]
pub struct HostCapabilities {
    table: Arc<Mutex<BTreeMap<Capability, bool>>>,
}

impl HostCapabilities {
    pub fn set(&self, capability: Capability, active: bool) {
        if let Ok(mut table) = self.table.lock() {
            table.insert(capability, active);
        }
    }
}

impl CapabilityProbe for HostCapabilities {
    fn is_capability_active(&self, capability: Capability) -> Result<bool> {
        let table = self
            .table
            .lock()
            .map_err(|_| anyhow::anyhow!("capability table poisoned"))?;
        table
            .get(&capability)
            .copied()
            .ok_or_else(|| anyhow::anyhow!("host has not reported {}", capability))
    }
}

/// Last reported on-screen text per app.
#[derive(Debug, Clone, Default)]
pub struct HostContent {
    texts: Arc<Mutex<HashMap<String, String>>>,
}

impl HostContent {
    pub fn set(&self, app_id: &str, text: &str) {
        if let Ok(mut texts) = self.texts.lock() {
            texts.insert(app_id.to_string(), text.to_string());
        }
    }
}

impl ContentProbe for HostContent {
    fn current_text(&self, app_id: &str) -> Option<String> {
        self.texts.lock().ok()?.get(app_id).cloned()
    }
}

fn decision_label(decision: &TamperDecision) -> &'static str {
    match decision {
        TamperDecision::Trigger(_) => "trigger",
        TamperDecision::Debounced => "debounced",
        TamperDecision::Suppressed(_) => "suppressed",
        TamperDecision::Released => "released",
        TamperDecision::Ignored => "ignored",
    }
}

/// Routes parsed lines to the engine.
#[derive(Debug, Clone)]
pub struct Dispatcher {
    handle: EngineHandle,
    capabilities: HostCapabilities,
    content: HostContent,
    out: mpsc::UnboundedSender<Outbound>,
}

/// Whether the input loop should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

impl Dispatcher {
    pub fn new(
        handle: EngineHandle,
        capabilities: HostCapabilities,
        content: HostContent,
        out: mpsc::UnboundedSender<Outbound>,
    ) -> Self {
        Self {
            handle,
            capabilities,
            content,
            out,
        }
    }

    /// Handle one raw line. Malformed input is reported back, never fatal.
    pub async fn handle_line(&self, line: &str) -> Result<Flow, EngineError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Flow::Continue);
        }

        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                debug!("Rejected input line: {}", e);
                self.send(Outbound::Error {
                    id: None,
                    message: format!("invalid request: {}", e),
                });
                Ok(Flow::Continue)
            }
        }
    }

    pub async fn dispatch(&self, request: Request) -> Result<Flow, EngineError> {
        let Request { id, message } = request;

        let result = match message {
            Inbound::Foreground {
                app_id,
                foregrounded,
            } => {
                let decision = self.handle.on_foreground(app_id, foregrounded).await?;
                serde_json::to_value(decision).unwrap_or_default()
            }
            Inbound::Settings {
                category,
                source,
                foregrounded,
                target_package,
                detail,
            } => {
                let navigation = SettingsNavigation {
                    category,
                    foregrounded,
                    source,
                    target_package,
                    detail,
                };
                let decision = self.handle.on_settings_navigation(navigation).await?;
                decision_label(&decision).into()
            }
            Inbound::Content { app_id, text } => {
                self.content.set(&app_id, &text);
                let outcome = self.handle.on_content_violation(app_id, text).await?;
                outcome.is_some().into()
            }
            Inbound::Capability { capability, active } => {
                self.capabilities.set(capability, active);
                let active = self
                    .handle
                    .call(move |e| e.is_privilege_actually_active(capability))
                    .await?;
                active.into()
            }
            Inbound::Touch { app_id } => {
                self.handle.touch_foreground(app_id).await?;
                serde_json::Value::Null
            }
            Inbound::ScreenOff => {
                self.handle.on_screen_off().await?;
                serde_json::Value::Null
            }
            Inbound::Unlock { app_id } => {
                self.handle.grant_unlock(app_id).await?;
                serde_json::Value::Null
            }
            Inbound::IsUnlocked { app_id } => self.handle.is_unlocked(app_id).await?.into(),
            Inbound::BypassWindow => {
                let (active, remaining_ms) = self
                    .handle
                    .call(|e| (e.is_within_bypass_window(), e.remaining_bypass_ms()))
                    .await?;
                serde_json::json!({ "active": active, "remaining_ms": remaining_ms })
            }
            Inbound::ChallengeCompleted => {
                self.handle.record_challenge_completion().await?;
                self.handle.remaining_bypass_ms().await?.into()
            }
            Inbound::Defer { app_id } => self.handle.defer_keyword_challenge(app_id).await?.into(),
            Inbound::Query => {
                let status = self.handle.status().await?;
                serde_json::to_value(status).unwrap_or_default()
            }
            Inbound::Shutdown => {
                self.handle.shutdown().await?;
                if let Some(id) = id {
                    self.send(Outbound::Reply {
                        id,
                        result: serde_json::Value::Null,
                    });
                }
                return Ok(Flow::Stop);
            }
        };

        if let Some(id) = id {
            self.send(Outbound::Reply { id, result });
        }
        Ok(Flow::Continue)
    }

    fn send(&self, message: Outbound) {
        if self.out.send(message).is_err() {
            warn!("Output closed, dropping reply");
        }
    }
}

/// Drain outbound messages as JSON lines until every sender is gone.
pub async fn write_outbound<W>(mut rx: mpsc::UnboundedReceiver<Outbound>, mut writer: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = serde_json::to_string(&message)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::{
        Collaborators, EngineRuntime, EngineSettings, PackageMatchClassifier, ProtectionEngine,
        StateFile,
    };
    use std::time::Duration;

    struct Harness {
        dispatcher: Dispatcher,
        out_rx: mpsc::UnboundedReceiver<Outbound>,
        clock: ManualClock,
    }

    impl Harness {
        /// Send one line and return the reply result.
        async fn ask(&mut self, line: &str) -> serde_json::Value {
            self.dispatcher.handle_line(line).await.unwrap();
            self.drain()
                .into_iter()
                .find_map(|m| match m {
                    Outbound::Reply { result, .. } => Some(result),
                    _ => None,
                })
                .unwrap()
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut messages = Vec::new();
            while let Ok(message) = self.out_rx.try_recv() {
                messages.push(message);
            }
            messages
        }
    }

    fn harness() -> Harness {
        let runtime = EngineRuntime::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let capabilities = HostCapabilities::default();
        let content = HostContent::default();
        let clock = ManualClock::new(0);

        let settings = EngineSettings {
            protected_apps: ["app.mail".to_string()].into_iter().collect(),
            keywords: vec!["casino".to_string()],
            ..EngineSettings::default()
        };
        let engine = ProtectionEngine::new(
            settings,
            StateFile::in_memory(),
            Collaborators {
                clock: Arc::new(clock.clone()),
                surface: Box::new(StdioSurface::new(out_tx.clone())),
                capabilities: Box::new(capabilities.clone()),
                content: Box::new(content.clone()),
                classifier: Box::new(PackageMatchClassifier::new("org.pinguard.app")),
                scheduler: Box::new(runtime.scheduler()),
            },
        )
        .unwrap();

        let dispatcher = Dispatcher::new(runtime.handle(), capabilities, content, out_tx);
        runtime.spawn(engine);
        Harness {
            dispatcher,
            out_rx,
            clock,
        }
    }

    #[test]
    fn parses_requests_with_defaults() {
        let request: Request =
            serde_json::from_str(r#"{"type":"settings","category":"app_info","source":"intent"}"#)
                .unwrap();
        assert_eq!(request.id, None);
        assert_eq!(
            request.message,
            Inbound::Settings {
                category: TamperCategory::AppInfo,
                source: SignalSource::Intent,
                foregrounded: true,
                target_package: None,
                detail: None,
            }
        );

        let request: Request =
            serde_json::from_str(r#"{"id":7,"type":"screen_off"}"#).unwrap();
        assert_eq!(request.id, Some(7));
        assert_eq!(request.message, Inbound::ScreenOff);
    }

    #[test]
    fn outbound_shape() {
        let line = serde_json::to_string(&Outbound::ShowOverlay {
            overlay: OverlayKind::AppLock {
                app_id: "app.mail".to_string(),
            },
            message: "locked".to_string(),
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"type":"show_overlay","overlay":{"kind":"app_lock","app_id":"app.mail"},"message":"locked"}"#
        );
    }

    #[test]
    fn unreported_capability_is_an_error() {
        let capabilities = HostCapabilities::default();
        assert!(capabilities.is_capability_active(Capability::Overlay).is_err());
        capabilities.set(Capability::Overlay, true);
        assert!(capabilities.is_capability_active(Capability::Overlay).unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn lock_flow_over_the_wire() {
        let mut h = harness();

        h.dispatcher
            .handle_line(r#"{"id":1,"type":"foreground","app_id":"app.mail"}"#)
            .await
            .unwrap();
        let messages = h.drain();
        assert!(matches!(messages[0], Outbound::ShowOverlay { .. }));
        assert_eq!(
            messages[1],
            Outbound::Reply {
                id: 1,
                result: "block".into()
            }
        );

        h.dispatcher
            .handle_line(r#"{"type":"unlock","app_id":"app.mail"}"#)
            .await
            .unwrap();
        assert_eq!(
            h.drain(),
            vec![Outbound::HideOverlay {
                overlay: OverlayKind::AppLock {
                    app_id: "app.mail".to_string()
                }
            }]
        );

        h.dispatcher
            .handle_line(r#"{"id":2,"type":"foreground","app_id":"app.mail"}"#)
            .await
            .unwrap();
        assert_eq!(
            h.drain(),
            vec![Outbound::Reply {
                id: 2,
                result: "allow".into()
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn touch_keeps_session_alive() {
        let mut h = harness();
        h.dispatcher
            .handle_line(r#"{"type":"unlock","app_id":"app.mail"}"#)
            .await
            .unwrap();

        h.clock.set(20_000);
        let touched = h
            .ask(r#"{"id":1,"type":"touch","app_id":"app.mail"}"#)
            .await;
        assert_eq!(touched, serde_json::Value::Null);

        h.clock.set(45_000);
        let unlocked = h
            .ask(r#"{"id":2,"type":"is_unlocked","app_id":"app.mail"}"#)
            .await;
        assert_eq!(unlocked, true);
    }

    #[tokio::test(start_paused = true)]
    async fn is_unlocked_reports_expiry() {
        let mut h = harness();
        let before = h
            .ask(r#"{"id":1,"type":"is_unlocked","app_id":"app.mail"}"#)
            .await;
        assert_eq!(before, false);

        h.dispatcher
            .handle_line(r#"{"type":"unlock","app_id":"app.mail"}"#)
            .await
            .unwrap();
        h.clock.set(30_000);
        let after = h
            .ask(r#"{"id":2,"type":"is_unlocked","app_id":"app.mail"}"#)
            .await;
        assert_eq!(after, false);
    }

    #[tokio::test(start_paused = true)]
    async fn bypass_window_query() {
        let mut h = harness();
        assert_eq!(
            h.ask(r#"{"id":1,"type":"bypass_window"}"#).await,
            serde_json::json!({ "active": false, "remaining_ms": 0 })
        );

        h.ask(r#"{"id":2,"type":"challenge_completed"}"#).await;
        h.clock.set(100_000);
        assert_eq!(
            h.ask(r#"{"id":3,"type":"bypass_window"}"#).await,
            serde_json::json!({ "active": true, "remaining_ms": 200_000 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn tamper_flow_over_the_wire() {
        let mut h = harness();

        h.dispatcher
            .handle_line(r#"{"id":1,"type":"settings","category":"app_info","source":"usage_history"}"#)
            .await
            .unwrap();
        let messages = h.drain();
        assert!(matches!(messages[0], Outbound::ShowOverlay { .. }));
        assert!(matches!(messages[1], Outbound::NavigateHome { .. }));
        assert_eq!(
            messages[2],
            Outbound::ClearRecents {
                category: TamperCategory::AppInfo
            }
        );
        assert_eq!(
            messages[3],
            Outbound::Reply {
                id: 1,
                result: "trigger".into()
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn keyword_grace_uses_latest_content() {
        let mut h = harness();

        h.dispatcher
            .handle_line(r#"{"type":"content","app_id":"app.video","text":"casino"}"#)
            .await
            .unwrap();
        h.dispatcher
            .handle_line(r#"{"id":3,"type":"defer","app_id":"app.video"}"#)
            .await
            .unwrap();
        // The user scrolled away before the grace period ended.
        h.dispatcher
            .handle_line(r#"{"type":"content","app_id":"app.video","text":"weather"}"#)
            .await
            .unwrap();
        h.drain();

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert!(
            !h.drain()
                .iter()
                .any(|m| matches!(m, Outbound::NavigateHome { .. }))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_lines_are_reported() {
        let mut h = harness();
        let flow = h.dispatcher.handle_line("{not json").await.unwrap();
        assert_eq!(flow, Flow::Continue);
        assert!(matches!(h.drain()[0], Outbound::Error { id: None, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_stops_input_loop() {
        let mut h = harness();
        let flow = h
            .dispatcher
            .handle_line(r#"{"id":9,"type":"shutdown"}"#)
            .await
            .unwrap();
        assert_eq!(flow, Flow::Stop);
        assert_eq!(
            h.drain(),
            vec![Outbound::Reply {
                id: 9,
                result: serde_json::Value::Null
            }]
        );
    }

    #[tokio::test]
    async fn writer_emits_one_line_per_message() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(Outbound::HideOverlay {
            overlay: OverlayKind::Tamper {
                category: TamperCategory::AppInfo,
            },
        })
        .unwrap();
        tx.send(Outbound::Reply {
            id: 1,
            result: true.into(),
        })
        .unwrap();
        drop(tx);

        let mut buffer = Vec::new();
        write_outbound(rx, &mut buffer).await.unwrap();
        assert_eq!(
            String::from_utf8(buffer).unwrap(),
            concat!(
                r#"{"type":"hide_overlay","overlay":{"kind":"tamper","category":"app_info"}}"#,
                "\n",
                r#"{"type":"reply","id":1,"result":true}"#,
                "\n"
            )
        );
    }
}
