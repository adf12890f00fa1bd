//! Round-synchronization state machine.
//!
//! Owns the [`Round`] and the [`Pool`] and advances them from channel events
//! (ticks, crashes, round updates), snapshot fetch results, and a local
//! clock. The machine performs no I/O itself: methods return [`Action`]s for
//! the engine loop to execute, so tick application stays synchronous with
//! arrival and never waits behind network calls.

use crate::channel::types::{PriceTick, RoundUpdate};
use crate::pricing::Pool;
use crate::server::RoundSnapshot;
use rust_decimal::Decimal;
use std::time::{Duration, Instant};

/// A tick arriving during Countdown with a sequence number at or below this
/// means the server already started the round; the machine promotes itself
/// to Active instead of letting the local countdown outlive the real start.
pub const EARLY_TICK_PROMOTION: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    Loading,
    Countdown,
    Active,
    Ended,
    Crashed,
    Error,
}

impl RoundStatus {
    /// Unrecognized statuses are protocol anomalies and map to `None`;
    /// callers drop them rather than letting garbage change state.
    pub fn from_wire(s: &str) -> Option<RoundStatus> {
        match s {
            "countdown" | "pending" => Some(RoundStatus::Countdown),
            "active" | "live" => Some(RoundStatus::Active),
            "crashed" => Some(RoundStatus::Crashed),
            "ended" | "settled" | "closed" => Some(RoundStatus::Ended),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoundStatus::Loading => "loading",
            RoundStatus::Countdown => "countdown",
            RoundStatus::Active => "active",
            RoundStatus::Ended => "ended",
            RoundStatus::Crashed => "crashed",
            RoundStatus::Error => "error",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Round {
    pub id: String,
    pub status: RoundStatus,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_seconds: u64,
    pub price_multiplier: Decimal,
    pub tick_count: u64,
}

impl Round {
    fn loading() -> Self {
        Self {
            id: String::new(),
            status: RoundStatus::Loading,
            started_at: None,
            duration_seconds: 0,
            price_multiplier: Decimal::ONE,
            tick_count: 0,
        }
    }
}

/// Side effects the engine loop must perform on the machine's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Fetch an authoritative snapshot (countdown expiry, error retry,
    /// reconnect). At most one fetch is requested while one is in flight.
    FetchSnapshot,
    /// Clear the player's position (round changed, crashed, or ended).
    ResetPosition,
}

#[derive(Debug, Clone, Copy)]
pub struct RoundTiming {
    pub countdown: Duration,
    pub crash_display: Duration,
    pub error_retry: Duration,
}

pub struct RoundStateMachine {
    round: Round,
    pool: Pool,
    timing: RoundTiming,
    countdown_deadline: Option<Instant>,
    crash_clear_at: Option<Instant>,
    error_retry_at: Option<Instant>,
    error_message: Option<String>,
    last_crash_multiplier: Option<Decimal>,
    snapshot_in_flight: bool,
}

impl RoundStateMachine {
    pub fn new(timing: RoundTiming) -> Self {
        Self {
            round: Round::loading(),
            pool: Pool::default(),
            timing,
            countdown_deadline: None,
            crash_clear_at: None,
            error_retry_at: None,
            error_message: None,
            last_crash_multiplier: None,
            snapshot_in_flight: false,
        }
    }

    pub fn round(&self) -> &Round {
        &self.round
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Replace the pool (post-trade state from a quote, or a rollback after
    /// a rejected trade). The machine clears it on round boundaries.
    pub fn set_pool(&mut self, pool: Pool) {
        self.pool = pool;
    }

    pub fn status(&self) -> RoundStatus {
        self.round.status
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Final multiplier of the last crash, retained for display even if the
    /// follow-up snapshot fetch fails.
    pub fn last_crash_multiplier(&self) -> Option<Decimal> {
        self.last_crash_multiplier
    }

    pub fn remaining_seconds(&self, now: Instant) -> u64 {
        self.countdown_deadline
            .map(|d| d.saturating_duration_since(now).as_secs())
            .unwrap_or(0)
    }

    /// Returns true when a snapshot fetch should actually go out; false when
    /// one is already in flight (spurious reconnects, repeated clock hits).
    pub fn begin_snapshot_refresh(&mut self) -> bool {
        if self.snapshot_in_flight {
            return false;
        }
        self.snapshot_in_flight = true;
        true
    }

    /// Apply an authoritative snapshot. Supersedes any speculative local
    /// state such as an expired local countdown or a stale multiplier.
    /// A crash display in progress is the exception: Active is never
    /// entered straight from Crashed, so the snapshot is dropped and the
    /// gap countdown refetches once the display clears.
    pub fn apply_snapshot(&mut self, snap: &RoundSnapshot, now: Instant) -> Vec<Action> {
        self.snapshot_in_flight = false;
        self.error_retry_at = None;
        self.error_message = None;

        if self.round.status == RoundStatus::Crashed {
            tracing::debug!(id = %snap.id, "snapshot deferred until the crash display clears");
            return Vec::new();
        }

        let Some(status) = RoundStatus::from_wire(&snap.status) else {
            // The authority answered with a status this client does not
            // know; retry rather than guess a transition.
            self.snapshot_failed(format!("unknown round status: {}", snap.status), now);
            return Vec::new();
        };

        let mut actions = Vec::new();
        let id_changed = !self.round.id.is_empty() && self.round.id != snap.id;
        if id_changed {
            actions.push(Action::ResetPosition);
            self.pool = Pool::default();
        }

        match status {
            RoundStatus::Countdown => {
                let remaining = snap
                    .countdown_seconds
                    .unwrap_or(self.timing.countdown.as_secs());
                self.countdown_deadline = Some(now + Duration::from_secs(remaining));
                self.crash_clear_at = None;
                self.round = Round {
                    id: snap.id.clone(),
                    status: RoundStatus::Countdown,
                    started_at: None,
                    duration_seconds: remaining,
                    price_multiplier: Decimal::ONE,
                    tick_count: 0,
                };
            }
            RoundStatus::Active => {
                self.countdown_deadline = None;
                self.crash_clear_at = None;
                let multiplier = snap.multiplier_decimal();
                // A fresh snapshot restarts tick ordering for the round: the
                // next tick's count only needs to exceed what we saw, and a
                // new id starts from zero again.
                let tick_count = if id_changed || self.round.id != snap.id {
                    0
                } else {
                    self.round.tick_count
                };
                self.round = Round {
                    id: snap.id.clone(),
                    status: RoundStatus::Active,
                    started_at: Some(chrono::Utc::now()),
                    duration_seconds: self.round.duration_seconds,
                    price_multiplier: multiplier,
                    tick_count,
                };
            }
            _ => {
                // Ended / crashed server-side: wait out the countdown gap
                // locally, then refresh again.
                tracing::debug!(id = %snap.id, status = %snap.status, "snapshot reports closed round");
                self.enter_gap_countdown(now);
                self.round.id = snap.id.clone();
                actions.push(Action::ResetPosition);
            }
        }
        actions
    }

    /// A snapshot fetch failed: degrade to Error and schedule a retry. A
    /// crash display in progress is not interrupted; the final multiplier
    /// stays visible regardless.
    pub fn snapshot_failed(&mut self, message: String, now: Instant) {
        self.snapshot_in_flight = false;
        tracing::warn!(error = %message, "snapshot fetch failed, retrying on interval");
        self.error_message = Some(message);
        self.error_retry_at = Some(now + self.timing.error_retry);
        if self.round.status != RoundStatus::Crashed {
            self.round.status = RoundStatus::Error;
        }
    }

    /// Apply a price tick. Stale and duplicate ticks (`tick_count` at or
    /// below the last seen) are silently dropped; ticks for other rounds are
    /// ignored. During Countdown, an early tick promotes the round to Active
    /// (the server evidently started without us).
    pub fn apply_tick(&mut self, tick: &PriceTick) -> bool {
        match self.round.status {
            RoundStatus::Active => {
                if tick.round_id != self.round.id && !self.round.id.is_empty() {
                    tracing::trace!(round = %tick.round_id, "tick for another round dropped");
                    return false;
                }
                if tick.tick_count <= self.round.tick_count {
                    tracing::trace!(
                        tick = tick.tick_count,
                        seen = self.round.tick_count,
                        "stale tick dropped"
                    );
                    return false;
                }
                self.round.price_multiplier = tick.multiplier;
                self.round.tick_count = tick.tick_count;
                true
            }
            RoundStatus::Countdown if tick.tick_count <= EARLY_TICK_PROMOTION => {
                tracing::debug!(
                    round = %tick.round_id,
                    tick = tick.tick_count,
                    "early tick during countdown, promoting to active"
                );
                self.countdown_deadline = None;
                self.round = Round {
                    id: tick.round_id.clone(),
                    status: RoundStatus::Active,
                    started_at: Some(chrono::Utc::now()),
                    duration_seconds: self.round.duration_seconds,
                    price_multiplier: tick.multiplier,
                    tick_count: tick.tick_count,
                };
                true
            }
            _ => false,
        }
    }

    /// Terminal crash event for the active round. Ignored in any other
    /// phase: Crashed is only enterable from Active.
    pub fn apply_crash(&mut self, final_multiplier: Decimal, now: Instant) -> Vec<Action> {
        if self.round.status != RoundStatus::Active {
            tracing::debug!(status = self.round.status.as_str(), "crash event ignored");
            return Vec::new();
        }
        self.round.status = RoundStatus::Crashed;
        self.round.price_multiplier = final_multiplier;
        self.last_crash_multiplier = Some(final_multiplier);
        self.crash_clear_at = Some(now + self.timing.crash_display);
        self.countdown_deadline = None;
        vec![Action::ResetPosition]
    }

    /// Round-lifecycle event from the channel.
    pub fn apply_round_update(&mut self, update: &RoundUpdate, now: Instant) -> Vec<Action> {
        match update.status {
            RoundStatus::Active if self.round.status == RoundStatus::Active => {
                // In-round refresh of the authoritative multiplier.
                if update.id == self.round.id {
                    self.round.price_multiplier = update.multiplier;
                }
                Vec::new()
            }
            RoundStatus::Ended | RoundStatus::Crashed if self.round.status == RoundStatus::Active => {
                tracing::debug!(id = %update.id, "round reported closed");
                self.round.status = RoundStatus::Ended;
                self.enter_gap_countdown(now);
                vec![Action::ResetPosition]
            }
            _ => Vec::new(),
        }
    }

    /// Advance local timers. Called on a fixed cadence by the engine loop.
    pub fn on_clock(&mut self, now: Instant) -> Vec<Action> {
        let mut actions = Vec::new();

        match self.round.status {
            RoundStatus::Countdown => {
                if let Some(deadline) = self.countdown_deadline {
                    if now >= deadline {
                        // The local clock never declares the round started;
                        // it asks the authority once and waits.
                        self.countdown_deadline = None;
                        if self.begin_snapshot_refresh() {
                            actions.push(Action::FetchSnapshot);
                        }
                    }
                }
            }
            RoundStatus::Crashed => {
                if let Some(clear_at) = self.crash_clear_at {
                    if now >= clear_at {
                        self.crash_clear_at = None;
                        self.pool = Pool::default();
                        self.enter_gap_countdown(now);
                        actions.push(Action::ResetPosition);
                    }
                }
            }
            RoundStatus::Error => {
                if let Some(retry_at) = self.error_retry_at {
                    if now >= retry_at {
                        self.error_retry_at = None;
                        self.round.status = RoundStatus::Loading;
                        if self.begin_snapshot_refresh() {
                            actions.push(Action::FetchSnapshot);
                        }
                    }
                }
            }
            RoundStatus::Ended => {
                if let Some(deadline) = self.countdown_deadline {
                    if now >= deadline {
                        self.countdown_deadline = None;
                        if self.begin_snapshot_refresh() {
                            actions.push(Action::FetchSnapshot);
                        }
                    }
                }
            }
            _ => {}
        }

        actions
    }

    /// Fixed-length countdown toward the next round. The id stays until a
    /// snapshot validates the transition into the new round.
    fn enter_gap_countdown(&mut self, now: Instant) {
        self.countdown_deadline = Some(now + self.timing.countdown);
        self.round.status = if self.round.status == RoundStatus::Ended {
            RoundStatus::Ended
        } else {
            RoundStatus::Countdown
        };
        if self.round.status == RoundStatus::Countdown {
            self.round.price_multiplier = Decimal::ONE;
            self.round.tick_count = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn timing() -> RoundTiming {
        RoundTiming {
            countdown: Duration::from_secs(10),
            crash_display: Duration::from_millis(100),
            error_retry: Duration::from_millis(100),
        }
    }

    fn active_machine() -> RoundStateMachine {
        let mut m = RoundStateMachine::new(timing());
        m.apply_snapshot(
            &RoundSnapshot {
                id: "r1".to_string(),
                status: "active".to_string(),
                multiplier: 1.0,
                countdown_seconds: None,
                price_history: None,
            },
            Instant::now(),
        );
        m
    }

    fn tick(round_id: &str, count: u64, mult: Decimal) -> PriceTick {
        PriceTick {
            round_id: round_id.to_string(),
            multiplier: mult,
            tick_count: count,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn test_tick_ordering_drops_stale() {
        let mut m = active_machine();
        assert!(m.apply_tick(&tick("r1", 5, dec!(1.5))));
        assert!(!m.apply_tick(&tick("r1", 3, dec!(1.2))));
        assert!(m.apply_tick(&tick("r1", 7, dec!(1.9))));
        assert_eq!(m.round().tick_count, 7);
        assert_eq!(m.round().price_multiplier, dec!(1.9));
    }

    #[test]
    fn test_duplicate_tick_is_idempotent() {
        let mut m = active_machine();
        assert!(m.apply_tick(&tick("r1", 5, dec!(1.5))));
        assert!(!m.apply_tick(&tick("r1", 5, dec!(1.5))));
        assert_eq!(m.round().tick_count, 5);
    }

    #[test]
    fn test_tick_for_other_round_dropped() {
        let mut m = active_machine();
        assert!(!m.apply_tick(&tick("r2", 1, dec!(1.1))));
        assert_eq!(m.round().tick_count, 0);
    }

    #[test]
    fn test_early_tick_promotes_countdown_to_active() {
        let mut m = RoundStateMachine::new(timing());
        m.apply_snapshot(
            &RoundSnapshot {
                id: "r1".to_string(),
                status: "countdown".to_string(),
                multiplier: 1.0,
                countdown_seconds: Some(30),
                price_history: None,
            },
            Instant::now(),
        );
        assert_eq!(m.status(), RoundStatus::Countdown);

        assert!(m.apply_tick(&tick("r2", 3, dec!(1.05))));
        assert_eq!(m.status(), RoundStatus::Active);
        assert_eq!(m.round().id, "r2");
        assert_eq!(m.round().tick_count, 3);
    }

    #[test]
    fn test_late_tick_does_not_promote_countdown() {
        let mut m = RoundStateMachine::new(timing());
        m.apply_snapshot(
            &RoundSnapshot {
                id: "r1".to_string(),
                status: "countdown".to_string(),
                multiplier: 1.0,
                countdown_seconds: Some(30),
                price_history: None,
            },
            Instant::now(),
        );
        // a mid-round tick (count far along) is not a start signal
        assert!(!m.apply_tick(&tick("r2", 500, dec!(4.2))));
        assert_eq!(m.status(), RoundStatus::Countdown);
    }

    #[test]
    fn test_crash_only_from_active() {
        let mut m = RoundStateMachine::new(timing());
        assert!(m.apply_crash(dec!(2.5), Instant::now()).is_empty());
        assert_eq!(m.status(), RoundStatus::Loading);

        let mut m = active_machine();
        let actions = m.apply_crash(dec!(2.5), Instant::now());
        assert_eq!(actions, vec![Action::ResetPosition]);
        assert_eq!(m.status(), RoundStatus::Crashed);
        assert_eq!(m.round().price_multiplier, dec!(2.5));
    }

    #[test]
    fn test_crashed_never_goes_directly_active() {
        let mut m = active_machine();
        m.apply_crash(dec!(2.5), Instant::now());

        // no event can re-activate a crashed round without a countdown
        assert!(!m.apply_tick(&tick("r1", 8, dec!(1.1))));
        assert_eq!(m.status(), RoundStatus::Crashed);

        let update = RoundUpdate {
            id: "r1".to_string(),
            status: RoundStatus::Active,
            multiplier: dec!(1.0),
        };
        m.apply_round_update(&update, Instant::now());
        assert_eq!(m.status(), RoundStatus::Crashed);

        // the display timer moves it to Countdown, from which Active is legal
        let later = Instant::now() + Duration::from_millis(150);
        let actions = m.on_clock(later);
        assert_eq!(m.status(), RoundStatus::Countdown);
        assert!(actions.contains(&Action::ResetPosition));
        assert!(m.apply_tick(&tick("r2", 1, dec!(1.0))));
        assert_eq!(m.status(), RoundStatus::Active);
    }

    #[test]
    fn test_snapshot_during_crash_display_is_deferred() {
        let mut m = active_machine();
        let start = Instant::now();
        m.apply_crash(dec!(2.5), start);

        // reconnect-triggered snapshot lands while the crash is on display
        m.begin_snapshot_refresh();
        let actions = m.apply_snapshot(
            &RoundSnapshot {
                id: "r2".to_string(),
                status: "active".to_string(),
                multiplier: 1.0,
                countdown_seconds: None,
                price_history: None,
            },
            start,
        );
        assert!(actions.is_empty());
        assert_eq!(m.status(), RoundStatus::Crashed);
        assert_eq!(m.round().price_multiplier, dec!(2.5));

        // the display timer still moves it into Countdown, from which a
        // fresh snapshot (or early tick) starts the next round
        let later = start + Duration::from_millis(150);
        m.on_clock(later);
        assert_eq!(m.status(), RoundStatus::Countdown);
        // the deferred fetch finished, so a new refresh is allowed
        assert!(m.begin_snapshot_refresh());
    }

    #[test]
    fn test_snapshot_with_unknown_status_schedules_retry() {
        let mut m = active_machine();
        m.begin_snapshot_refresh();
        let actions = m.apply_snapshot(
            &RoundSnapshot {
                id: "r2".to_string(),
                status: "maintenance".to_string(),
                multiplier: 1.0,
                countdown_seconds: None,
                price_history: None,
            },
            Instant::now(),
        );
        // an unrecognized status mutates nothing, not even the round id
        assert!(actions.is_empty());
        assert_eq!(m.status(), RoundStatus::Error);
        assert_eq!(m.round().id, "r1");
    }

    #[test]
    fn test_crash_retains_final_multiplier_through_fetch_failure() {
        let mut m = active_machine();
        m.apply_crash(dec!(7.31), Instant::now());
        m.snapshot_failed("connection refused".to_string(), Instant::now());
        assert_eq!(m.status(), RoundStatus::Crashed);
        assert_eq!(m.last_crash_multiplier(), Some(dec!(7.31)));
        assert_eq!(m.round().price_multiplier, dec!(7.31));
    }

    #[test]
    fn test_countdown_expiry_requests_one_snapshot() {
        let mut m = RoundStateMachine::new(timing());
        let start = Instant::now();
        m.apply_snapshot(
            &RoundSnapshot {
                id: "r1".to_string(),
                status: "countdown".to_string(),
                multiplier: 1.0,
                countdown_seconds: Some(1),
                price_history: None,
            },
            start,
        );

        let expired = start + Duration::from_secs(2);
        assert_eq!(m.on_clock(expired), vec![Action::FetchSnapshot]);
        // further clock hits while the fetch is in flight request nothing
        assert!(m.on_clock(expired + Duration::from_secs(1)).is_empty());
    }

    #[test]
    fn test_error_retries_through_loading() {
        let mut m = RoundStateMachine::new(timing());
        m.begin_snapshot_refresh();
        let start = Instant::now();
        m.snapshot_failed("boom".to_string(), start);
        assert_eq!(m.status(), RoundStatus::Error);
        assert_eq!(m.error_message(), Some("boom"));

        let retry = start + Duration::from_millis(150);
        assert_eq!(m.on_clock(retry), vec![Action::FetchSnapshot]);
        assert_eq!(m.status(), RoundStatus::Loading);

        // recovery clears the error
        m.apply_snapshot(
            &RoundSnapshot {
                id: "r1".to_string(),
                status: "active".to_string(),
                multiplier: 1.4,
                countdown_seconds: None,
                price_history: None,
            },
            retry,
        );
        assert_eq!(m.status(), RoundStatus::Active);
        assert!(m.error_message().is_none());
    }

    #[test]
    fn test_snapshot_with_new_round_id_resets_position() {
        let mut m = active_machine();
        let actions = m.apply_snapshot(
            &RoundSnapshot {
                id: "r2".to_string(),
                status: "active".to_string(),
                multiplier: 1.0,
                countdown_seconds: None,
                price_history: None,
            },
            Instant::now(),
        );
        assert!(actions.contains(&Action::ResetPosition));
        assert_eq!(m.round().id, "r2");
        assert_eq!(m.round().tick_count, 0);
    }

    #[test]
    fn test_round_update_ends_active_round() {
        let mut m = active_machine();
        let update = RoundUpdate {
            id: "r1".to_string(),
            status: RoundStatus::Ended,
            multiplier: dec!(1.8),
        };
        let actions = m.apply_round_update(&update, Instant::now());
        assert_eq!(actions, vec![Action::ResetPosition]);
        assert_eq!(m.status(), RoundStatus::Ended);
    }

    #[test]
    fn test_tick_count_monotonic_within_round() {
        let mut m = active_machine();
        let mut last = 0;
        for count in [2, 1, 2, 9, 4] {
            m.apply_tick(&tick("r1", count, dec!(1.1)));
            assert!(m.round().tick_count >= last);
            last = m.round().tick_count;
        }
        assert_eq!(m.round().tick_count, 9);
    }
}
