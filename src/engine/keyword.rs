//! Keyword protection: countdown overlay with a single "fix it" deferral.
//!
//! ```text
//!   Idle ──violation──▶ Counting(N) ──tick×N──▶ Expired ──▶ Idle (sent home)
//!                          │    ▲
//!                        defer  │ still violating
//!                          ▼    │
//!                       GracePeriod ──resolved──▶ Idle
//! ```
//!
//! At most one challenge exists per app. While an app is counting or in
//! its grace period, further violation signals for it are absorbed.
//! Each countdown owns its own overlay; when one leaves the screen the most
//! urgent remaining countdown is brought back to the front.

use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use super::events::{NavigationReason, OverlayKind, TimerEvent};
use super::host::{Scheduler, Surface, TimerId};

const TICK: Duration = Duration::from_secs(1);
const COUNTDOWN_MESSAGE: &str = "Restricted content detected. Close it before the timer runs out.";

fn countdown_overlay(app_id: &str, remaining_secs: u32) -> OverlayKind {
    OverlayKind::Keyword {
        app_id: app_id.to_string(),
        remaining_secs,
    }
}

/// Case-insensitive, whole-word match against a banned keyword list.
#[derive(Debug, Clone)]
pub struct KeywordMatcher {
    regex: Option<Regex>,
}

impl KeywordMatcher {
    pub fn new<S: AsRef<str>>(keywords: &[S]) -> Result<Self, regex::Error> {
        let alternatives: Vec<String> = keywords
            .iter()
            .map(|k| k.as_ref().trim())
            .filter(|k| !k.is_empty())
            .map(regex::escape)
            .collect();

        if alternatives.is_empty() {
            return Ok(Self { regex: None });
        }

        let pattern = format!(r"\b(?:{})\b", alternatives.join("|"));
        let regex = RegexBuilder::new(&pattern).case_insensitive(true).build()?;
        Ok(Self { regex: Some(regex) })
    }

    pub fn is_empty(&self) -> bool {
        self.regex.is_none()
    }

    /// First banned keyword found in `text`, as it appears there.
    pub fn find<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.regex
            .as_ref()
            .and_then(|r| r.find(text))
            .map(|m| m.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeState {
    Counting { remaining_secs: u32 },
    GracePeriod,
}

#[derive(Debug, Clone)]
pub struct KeywordChallenge {
    pub app_id: String,
    pub state: ChallengeState,
    /// The one deferral has been spent.
    pub deferred: bool,
    generation: u64,
    timer: Option<TimerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationOutcome {
    Started,
    /// A challenge for this app is already counting or in grace.
    AlreadyActive(ChallengeState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    Ticked { remaining_secs: u32 },
    Expired,
    /// Late timer for a challenge that moved on or no longer exists.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraceOutcome {
    Resumed,
    Resolved,
    Stale,
}

#[derive(Debug)]
pub struct KeywordGuard {
    countdown_secs: u32,
    grace: Duration,
    challenges: HashMap<String, KeywordChallenge>,
    next_generation: u64,
}

impl KeywordGuard {
    pub fn new(countdown_secs: u32, grace: Duration) -> Self {
        Self {
            countdown_secs: countdown_secs.max(1),
            grace,
            challenges: HashMap::new(),
            next_generation: 0,
        }
    }

    /// New lengths apply to countdowns and grace periods started from now
    /// on. Timers already scheduled keep theirs.
    pub fn set_timing(&mut self, countdown_secs: u32, grace: Duration) {
        self.countdown_secs = countdown_secs.max(1);
        self.grace = grace;
    }

    pub fn challenge(&self, app_id: &str) -> Option<&KeywordChallenge> {
        self.challenges.get(app_id)
    }

    pub fn active_count(&self) -> usize {
        self.challenges.len()
    }

    fn generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    /// A banned-content signal for `app_id`.
    pub fn on_violation(
        &mut self,
        app_id: &str,
        scheduler: &mut dyn Scheduler,
        surface: &mut dyn Surface,
    ) -> ViolationOutcome {
        if let Some(existing) = self.challenges.get(app_id) {
            debug!(
                "Keyword challenge for {} already active ({:?})",
                app_id, existing.state
            );
            return ViolationOutcome::AlreadyActive(existing.state);
        }

        let challenge = KeywordChallenge {
            app_id: app_id.to_string(),
            state: ChallengeState::Counting {
                remaining_secs: self.countdown_secs,
            },
            deferred: false,
            generation: 0,
            timer: None,
        };
        self.challenges.insert(app_id.to_string(), challenge);
        self.start_counting(app_id, scheduler, surface);
        ViolationOutcome::Started
    }

    fn start_counting(
        &mut self,
        app_id: &str,
        scheduler: &mut dyn Scheduler,
        surface: &mut dyn Surface,
    ) {
        let generation = self.generation();
        let remaining_secs = self.countdown_secs;
        let Some(challenge) = self.challenges.get_mut(app_id) else {
            return;
        };

        challenge.state = ChallengeState::Counting { remaining_secs };
        challenge.generation = generation;
        challenge.timer = Some(scheduler.schedule(
            TICK,
            TimerEvent::CountdownTick {
                app_id: app_id.to_string(),
                generation,
            },
        ));

        info!(
            "Keyword countdown started for {} ({}s)",
            app_id, remaining_secs
        );
        surface.show_blocking_overlay(
            countdown_overlay(app_id, remaining_secs),
            COUNTDOWN_MESSAGE,
        );
    }

    /// Re-show the countdown closest to expiry, if any is still running.
    fn reshow_next(&self, surface: &mut dyn Surface) {
        let next = self
            .challenges
            .values()
            .filter_map(|c| match c.state {
                ChallengeState::Counting { remaining_secs } => {
                    Some((remaining_secs, c.app_id.as_str()))
                }
                ChallengeState::GracePeriod => None,
            })
            .min();

        if let Some((remaining_secs, app_id)) = next {
            debug!("Bringing countdown for {} back to front", app_id);
            surface.show_blocking_overlay(
                countdown_overlay(app_id, remaining_secs),
                COUNTDOWN_MESSAGE,
            );
        }
    }

    pub fn on_tick(
        &mut self,
        app_id: &str,
        generation: u64,
        scheduler: &mut dyn Scheduler,
        surface: &mut dyn Surface,
    ) -> TickOutcome {
        let Some(challenge) = self.challenges.get_mut(app_id) else {
            return TickOutcome::Stale;
        };
        let ChallengeState::Counting { remaining_secs } = challenge.state else {
            return TickOutcome::Stale;
        };
        if challenge.generation != generation {
            return TickOutcome::Stale;
        }

        let remaining_secs = remaining_secs.saturating_sub(1);
        if remaining_secs == 0 {
            self.challenges.remove(app_id);
            info!("Keyword countdown for {} ran out, sending user home", app_id);
            surface.navigate_to_neutral_surface(NavigationReason::CountdownExpired {
                app_id: app_id.to_string(),
            });
            surface.hide_overlay(&countdown_overlay(app_id, 0));
            self.reshow_next(surface);
            return TickOutcome::Expired;
        }

        challenge.state = ChallengeState::Counting { remaining_secs };
        challenge.timer = Some(scheduler.schedule(
            TICK,
            TimerEvent::CountdownTick {
                app_id: app_id.to_string(),
                generation,
            },
        ));
        surface.update_overlay(countdown_overlay(app_id, remaining_secs));
        TickOutcome::Ticked { remaining_secs }
    }

    /// The user chose to fix it themselves. Only valid once per challenge,
    /// and only while counting.
    pub fn defer(
        &mut self,
        app_id: &str,
        scheduler: &mut dyn Scheduler,
        surface: &mut dyn Surface,
    ) -> bool {
        let generation = self.generation();
        let grace = self.grace;
        let Some(challenge) = self.challenges.get_mut(app_id) else {
            return false;
        };
        if challenge.deferred || !matches!(challenge.state, ChallengeState::Counting { .. }) {
            debug!("Deferral for {} refused", app_id);
            return false;
        }

        if let Some(timer) = challenge.timer.take() {
            scheduler.cancel(timer);
        }
        challenge.state = ChallengeState::GracePeriod;
        challenge.deferred = true;
        challenge.generation = generation;
        challenge.timer = Some(scheduler.schedule(
            grace,
            TimerEvent::GraceElapsed {
                app_id: app_id.to_string(),
                generation,
            },
        ));

        surface.hide_overlay(&countdown_overlay(app_id, 0));
        self.reshow_next(surface);
        info!("Keyword grace period for {} ({:?})", app_id, grace);
        true
    }

    /// Grace period over. `still_violating` re-runs the content check and
    /// is only consulted for a live challenge.
    pub fn on_grace_elapsed<F>(
        &mut self,
        app_id: &str,
        generation: u64,
        still_violating: F,
        scheduler: &mut dyn Scheduler,
        surface: &mut dyn Surface,
    ) -> GraceOutcome
    where
        F: FnOnce(&str) -> bool,
    {
        match self.challenges.get(app_id) {
            Some(c) if c.state == ChallengeState::GracePeriod && c.generation == generation => {}
            _ => return GraceOutcome::Stale,
        }

        if still_violating(app_id) {
            info!("{} still shows restricted content after grace", app_id);
            self.start_counting(app_id, scheduler, surface);
            GraceOutcome::Resumed
        } else {
            self.challenges.remove(app_id);
            debug!("{} resolved during grace period", app_id);
            GraceOutcome::Resolved
        }
    }

    /// Cancel every countdown and grace timer. Used on shutdown and when
    /// keyword protection is switched off.
    pub fn cancel_all(&mut self, scheduler: &mut dyn Scheduler, surface: &mut dyn Surface) {
        for (app_id, mut challenge) in self.challenges.drain() {
            if let Some(timer) = challenge.timer.take() {
                scheduler.cancel(timer);
            }
            if let ChallengeState::Counting { remaining_secs } = challenge.state {
                surface.hide_overlay(&countdown_overlay(&app_id, remaining_secs));
            }
        }
    }
}
