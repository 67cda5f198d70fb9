//! Deterministic fakes for engine tests.
//!
//! Clones share their recordings, so a test can hand one copy to the
//! engine and inspect the other.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::events::{NavigationReason, OverlayKind, SettingsNavigation, TimerEvent};
use super::host::{Scheduler, Surface, TimerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceAction {
    Show(OverlayKind),
    Update(OverlayKind),
    Hide(OverlayKind),
    Navigate(NavigationReason),
    ClearRecents,
}

#[derive(Debug, Default)]
struct SurfaceState {
    actions: Vec<SurfaceAction>,
    /// Overlays on screen, front last.
    visible: Vec<OverlayKind>,
}

/// Records every action and keeps a layered view of what is on screen.
/// Updates only re-render an overlay that is actually showing.
#[derive(Debug, Clone, Default)]
pub struct RecordingSurface {
    state: Arc<Mutex<SurfaceState>>,
}

impl RecordingSurface {
    pub fn actions(&self) -> Vec<SurfaceAction> {
        self.state.lock().unwrap().actions.clone()
    }

    pub fn count(&self, pred: impl Fn(&SurfaceAction) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .actions
            .iter()
            .filter(|a| pred(a))
            .count()
    }

    pub fn shows(&self) -> usize {
        self.count(|a| matches!(a, SurfaceAction::Show(_)))
    }

    pub fn navigations(&self) -> usize {
        self.count(|a| matches!(a, SurfaceAction::Navigate(_)))
    }

    pub fn visible(&self) -> Vec<OverlayKind> {
        self.state.lock().unwrap().visible.clone()
    }

    /// The overlay in front, if any.
    pub fn front(&self) -> Option<OverlayKind> {
        self.state.lock().unwrap().visible.last().cloned()
    }

    fn push(&self, action: SurfaceAction) {
        self.state.lock().unwrap().actions.push(action);
    }
}

impl Surface for RecordingSurface {
    fn show_blocking_overlay(&mut self, kind: OverlayKind, _message: &str) {
        let mut state = self.state.lock().unwrap();
        state.visible.retain(|v| !v.same_overlay(&kind));
        state.visible.push(kind.clone());
        state.actions.push(SurfaceAction::Show(kind));
    }

    fn update_overlay(&mut self, kind: OverlayKind) {
        let mut state = self.state.lock().unwrap();
        if let Some(slot) = state.visible.iter_mut().find(|v| v.same_overlay(&kind)) {
            *slot = kind.clone();
        }
        state.actions.push(SurfaceAction::Update(kind));
    }

    fn hide_overlay(&mut self, kind: &OverlayKind) {
        let mut state = self.state.lock().unwrap();
        state.visible.retain(|v| !v.same_overlay(kind));
        state.actions.push(SurfaceAction::Hide(kind.clone()));
    }

    fn navigate_to_neutral_surface(&mut self, reason: NavigationReason) {
        self.push(SurfaceAction::Navigate(reason));
    }

    fn clear_from_recents(&mut self, _navigation: &SettingsNavigation) {
        self.push(SurfaceAction::ClearRecents);
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    next_id: u64,
    pending: BTreeMap<TimerId, (Duration, TimerEvent)>,
    cancelled: usize,
}

/// Scheduler that only records; tests fire timers by hand.
#[derive(Debug, Clone, Default)]
pub struct ManualScheduler {
    state: Arc<Mutex<SchedulerState>>,
}

impl ManualScheduler {
    /// Remove and return the oldest pending timer.
    pub fn pop_next(&self) -> Option<(TimerId, TimerEvent)> {
        let mut state = self.state.lock().unwrap();
        let id = *state.pending.keys().next()?;
        state.pending.remove(&id).map(|(_, event)| (id, event))
    }

    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    pub fn pending_events(&self) -> Vec<TimerEvent> {
        self.state
            .lock()
            .unwrap()
            .pending
            .values()
            .map(|(_, e)| e.clone())
            .collect()
    }

    pub fn cancelled(&self) -> usize {
        self.state.lock().unwrap().cancelled
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&mut self, delay: Duration, event: TimerEvent) -> TimerId {
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = TimerId(state.next_id);
        state.pending.insert(id, (delay, event));
        id
    }

    fn cancel(&mut self, id: TimerId) {
        let mut state = self.state.lock().unwrap();
        if state.pending.remove(&id).is_some() {
            state.cancelled += 1;
        }
    }

    fn cancel_all(&mut self) {
        let mut state = self.state.lock().unwrap();
        state.cancelled += state.pending.len();
        state.pending.clear();
    }
}
