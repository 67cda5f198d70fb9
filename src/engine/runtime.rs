//! Single-consumer event loop around a [`ProtectionEngine`].
//!
//! Every input (OS callbacks, collaborator calls, timer expiries) is a
//! message on one unbounded channel. One task drains it and also drives
//! the periodic session sweep, so the engine is only ever touched from one
//! place at a time.

use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::events::{SettingsNavigation, TimerEvent};
use super::keyword::ViolationOutcome;
use super::scheduler::TokioScheduler;
use super::tamper::TamperDecision;
use super::{EngineError, EngineSettings, EngineStatus, LockDecision, ProtectionEngine};

type Job = Box<dyn FnOnce(&mut ProtectionEngine) + Send>;

pub(crate) enum Command {
    Call(Job),
    Timer(TimerEvent),
    Shutdown(oneshot::Sender<()>),
}

/// Owns the channel until the engine is spawned.
pub struct EngineRuntime {
    tx: mpsc::UnboundedSender<Command>,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Default for EngineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineRuntime {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Scheduler whose timers feed back into this runtime's channel.
    pub fn scheduler(&self) -> TokioScheduler {
        TokioScheduler::new(self.tx.downgrade())
    }

    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            tx: self.tx.clone(),
        }
    }

    /// Start the event loop. The task ends on [`EngineHandle::shutdown`] or
    /// when every handle is dropped, and yields the engine back.
    pub fn spawn(self, engine: ProtectionEngine) -> JoinHandle<ProtectionEngine> {
        tokio::spawn(self.run(engine))
    }

    async fn run(self, mut engine: ProtectionEngine) -> ProtectionEngine {
        let Self { tx, mut rx } = self;
        // Only handles keep the loop alive.
        drop(tx);

        let mut sweep = tokio::time::interval(engine.sweep_interval().max(Duration::from_millis(1)));
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        info!(
            "Protection engine running (sweep every {:?})",
            engine.sweep_interval()
        );

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(Command::Call(job)) => job(&mut engine),
                    Some(Command::Timer(event)) => engine.on_timer(event),
                    Some(Command::Shutdown(ack)) => {
                        engine.shutdown();
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        debug!("All engine handles dropped");
                        engine.shutdown();
                        break;
                    }
                },
                _ = sweep.tick() => {
                    engine.sweep();
                }
            }
        }

        engine
    }
}

/// Cloneable front door to a running engine.
#[derive(Debug, Clone)]
pub struct EngineHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl EngineHandle {
    /// Run `f` on the engine and wait for its result.
    pub async fn call<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ProtectionEngine) -> T + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cast(move |engine| {
            let _ = reply_tx.send(f(engine));
        })?;
        reply_rx.await.map_err(|_| EngineError::Stopped)
    }

    /// Run `f` on the engine without waiting. Usable from sync callbacks.
    pub fn cast<F>(&self, f: F) -> Result<(), EngineError>
    where
        F: FnOnce(&mut ProtectionEngine) + Send + 'static,
    {
        self.tx
            .send(Command::Call(Box::new(f)))
            .map_err(|_| EngineError::Stopped)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn on_foreground(
        &self,
        app_id: impl Into<String>,
        foregrounded: bool,
    ) -> Result<LockDecision, EngineError> {
        let app_id = app_id.into();
        self.call(move |e| e.on_foreground(&app_id, foregrounded))
            .await
    }

    pub async fn on_settings_navigation(
        &self,
        navigation: SettingsNavigation,
    ) -> Result<TamperDecision, EngineError> {
        self.call(move |e| e.on_settings_navigation(&navigation))
            .await
    }

    pub async fn on_content_violation(
        &self,
        app_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<Option<ViolationOutcome>, EngineError> {
        let (app_id, text) = (app_id.into(), text.into());
        self.call(move |e| e.on_content_violation(&app_id, &text))
            .await
    }

    pub async fn defer_keyword_challenge(
        &self,
        app_id: impl Into<String>,
    ) -> Result<bool, EngineError> {
        let app_id = app_id.into();
        self.call(move |e| e.defer_keyword_challenge(&app_id)).await
    }

    pub async fn grant_unlock(&self, app_id: impl Into<String>) -> Result<(), EngineError> {
        let app_id = app_id.into();
        self.call(move |e| e.grant_unlock(&app_id)).await
    }

    pub async fn touch_foreground(&self, app_id: impl Into<String>) -> Result<(), EngineError> {
        let app_id = app_id.into();
        self.call(move |e| e.touch_foreground(&app_id)).await
    }

    pub async fn is_unlocked(&self, app_id: impl Into<String>) -> Result<bool, EngineError> {
        let app_id = app_id.into();
        self.call(move |e| e.is_unlocked(&app_id)).await
    }

    pub async fn on_screen_off(&self) -> Result<(), EngineError> {
        self.call(|e| e.on_screen_off()).await
    }

    pub async fn record_challenge_completion(&self) -> Result<(), EngineError> {
        self.call(|e| e.record_challenge_completion()).await
    }

    pub async fn clear_bypass(&self) -> Result<(), EngineError> {
        self.call(|e| e.clear_bypass()).await
    }

    pub async fn is_within_bypass_window(&self) -> Result<bool, EngineError> {
        self.call(|e| e.is_within_bypass_window()).await
    }

    pub async fn remaining_bypass_ms(&self) -> Result<u64, EngineError> {
        self.call(|e| e.remaining_bypass_ms()).await
    }

    /// Apply a reloaded configuration. Errors (bad keyword list) are logged
    /// inside the engine and leave the previous settings in place.
    pub fn reload(&self, settings: EngineSettings) -> Result<(), EngineError> {
        self.cast(move |e| {
            if let Err(err) = e.reload(&settings) {
                tracing::warn!("Config reload rejected: {:#}", err);
            }
        })
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.call(|e| e.status()).await
    }

    /// Cancel every timer and stop the loop. Waits for the engine to
    /// acknowledge.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Command::Shutdown(ack_tx))
            .map_err(|_| EngineError::Stopped)?;
        ack_rx.await.map_err(|_| EngineError::Stopped)
    }
}
