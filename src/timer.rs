//! Session Timer & Timeout Guard
//!
//! A pure countdown state machine (`SessionClock`) driven by a spawned
//! 1-second tick task. The clock is owned by the timer; other components
//! read remaining time through the handle but never mutate it.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Default consultation time budget
pub const SESSION_BUDGET_SECS: u64 = 30 * 60;
/// Remaining time at which the warning phase begins
pub const WARNING_THRESHOLD_SECS: u64 = 5 * 60;

/// Countdown phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    Running,
    Warning,
    Expired,
}

impl TimerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerPhase::Running => "running",
            TimerPhase::Warning => "warning",
            TimerPhase::Expired => "expired",
        }
    }
}

/// Phase change produced by a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickTransition {
    EnteredWarning,
    Expired,
}

/// Event sent to the session when the countdown crosses a threshold
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEvent {
    WarningReached { remaining_secs: u64 },
    Expired,
}

/// Pure countdown state machine: running → warning → expired.
///
/// Remaining time only decreases on ticks; `extend` is the single
/// user-facing reset back to the full budget.
#[derive(Debug, Clone)]
pub struct SessionClock {
    budget_secs: u64,
    warning_threshold_secs: u64,
    remaining_secs: u64,
    phase: TimerPhase,
}

impl SessionClock {
    pub fn new(budget_secs: u64, warning_threshold_secs: u64) -> Self {
        let phase = if budget_secs == 0 {
            TimerPhase::Expired
        } else if budget_secs <= warning_threshold_secs {
            TimerPhase::Warning
        } else {
            TimerPhase::Running
        };
        Self {
            budget_secs,
            warning_threshold_secs,
            remaining_secs: budget_secs,
            phase,
        }
    }

    pub fn remaining_secs(&self) -> u64 {
        self.remaining_secs
    }

    pub fn phase(&self) -> TimerPhase {
        self.phase
    }

    pub fn is_expired(&self) -> bool {
        self.phase == TimerPhase::Expired
    }

    /// Advance the countdown by one second.
    ///
    /// Returns the phase transition this tick caused, if any. Ticking an
    /// expired clock is a no-op.
    pub fn tick(&mut self) -> Option<TickTransition> {
        if self.phase == TimerPhase::Expired {
            return None;
        }
        self.remaining_secs = self.remaining_secs.saturating_sub(1);
        if self.remaining_secs == 0 {
            self.phase = TimerPhase::Expired;
            return Some(TickTransition::Expired);
        }
        if self.phase == TimerPhase::Running
            && self.remaining_secs <= self.warning_threshold_secs
        {
            self.phase = TimerPhase::Warning;
            return Some(TickTransition::EnteredWarning);
        }
        None
    }

    /// Reset the countdown to the full budget.
    ///
    /// Valid while running or in warning; an expired clock stays expired.
    /// Returns the remaining time after the call.
    pub fn extend(&mut self) -> u64 {
        if self.phase == TimerPhase::Expired {
            return self.remaining_secs;
        }
        self.remaining_secs = self.budget_secs;
        self.phase = if self.budget_secs <= self.warning_threshold_secs {
            TimerPhase::Warning
        } else {
            TimerPhase::Running
        };
        self.remaining_secs
    }
}

/// Handle to a running session timer task.
///
/// Cancellation is idempotent: the first `cancel` aborts the tick task,
/// later calls are no-ops.
pub struct SessionTimerHandle {
    clock: Arc<Mutex<SessionClock>>,
    cancelled: Arc<AtomicBool>,
    task: tokio::task::JoinHandle<()>,
}

impl SessionTimerHandle {
    pub fn remaining_secs(&self) -> u64 {
        self.clock
            .lock()
            .map(|clock| clock.remaining_secs())
            .unwrap_or(0)
    }

    pub fn phase(&self) -> TimerPhase {
        self.clock
            .lock()
            .map(|clock| clock.phase())
            .unwrap_or(TimerPhase::Expired)
    }

    /// Reset the countdown to the full budget; returns the new remaining time
    pub fn extend(&self) -> u64 {
        let remaining = self
            .clock
            .lock()
            .map(|mut clock| clock.extend())
            .unwrap_or(0);
        info!("Session timer extended, {}s remaining", remaining);
        remaining
    }

    /// Stop the tick task. Safe to call more than once.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::SeqCst) {
            self.task.abort();
            info!("Session timer cancelled");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Spawn the 1-second tick loop for a clock.
///
/// Threshold crossings are reported on `events`; the task stops on expiry,
/// on cancellation, or when the receiver is dropped.
pub fn start_session_timer(
    clock: SessionClock,
    events: mpsc::UnboundedSender<TimerEvent>,
) -> SessionTimerHandle {
    let clock = Arc::new(Mutex::new(clock));
    let cancelled = Arc::new(AtomicBool::new(false));

    let tick_clock = clock.clone();
    let task = tokio::spawn(async move {
        let start = tick_clock
            .lock()
            .map(|c| (c.phase(), c.remaining_secs()))
            .unwrap_or((TimerPhase::Expired, 0));
        match start {
            // A clock created with no budget left expires without ticking
            (TimerPhase::Expired, _) => {
                warn!("Session time budget exhausted");
                let _ = events.send(TimerEvent::Expired);
                return;
            }
            // A budget at or under the threshold starts inside the warning
            // phase; the tick loop would never report the crossing
            (TimerPhase::Warning, remaining) => {
                info!("Session starting in warning phase, {}s remaining", remaining);
                if events
                    .send(TimerEvent::WarningReached {
                        remaining_secs: remaining,
                    })
                    .is_err()
                {
                    return;
                }
            }
            (TimerPhase::Running, _) => {}
        }
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;

            let (transition, remaining) = match tick_clock.lock() {
                Ok(mut clock) => {
                    let transition = clock.tick();
                    (transition, clock.remaining_secs())
                }
                Err(_) => break,
            };

            match transition {
                Some(TickTransition::EnteredWarning) => {
                    info!("Session entering warning phase, {}s remaining", remaining);
                    if events
                        .send(TimerEvent::WarningReached {
                            remaining_secs: remaining,
                        })
                        .is_err()
                    {
                        break;
                    }
                }
                Some(TickTransition::Expired) => {
                    warn!("Session time budget exhausted");
                    let _ = events.send(TimerEvent::Expired);
                    break;
                }
                None => {}
            }
        }
    });

    SessionTimerHandle {
        clock,
        cancelled,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_budget_countdown_reaches_warning_at_threshold() {
        let mut clock = SessionClock::new(SESSION_BUDGET_SECS, WARNING_THRESHOLD_SECS);
        assert_eq!(clock.phase(), TimerPhase::Running);

        // 1499 ticks leave 301s remaining, still running
        for _ in 0..1499 {
            assert_eq!(clock.tick(), None);
        }
        assert_eq!(clock.remaining_secs(), 301);
        assert_eq!(clock.phase(), TimerPhase::Running);

        // The 1500th tick lands exactly on the threshold
        assert_eq!(clock.tick(), Some(TickTransition::EnteredWarning));
        assert_eq!(clock.remaining_secs(), 300);
        assert_eq!(clock.phase(), TimerPhase::Warning);
    }

    #[test]
    fn test_countdown_expires_at_zero() {
        let mut clock = SessionClock::new(5, 3);
        assert_eq!(clock.tick(), None); // 4
        assert_eq!(clock.tick(), Some(TickTransition::EnteredWarning)); // 3
        assert_eq!(clock.tick(), None); // 2
        assert_eq!(clock.tick(), None); // 1
        assert_eq!(clock.tick(), Some(TickTransition::Expired)); // 0
        assert_eq!(clock.remaining_secs(), 0);
        assert!(clock.is_expired());
    }

    #[test]
    fn test_warning_fires_only_once() {
        let mut clock = SessionClock::new(10, 8);
        assert_eq!(clock.tick(), None); // 9
        assert_eq!(clock.tick(), Some(TickTransition::EnteredWarning)); // 8
        assert_eq!(clock.tick(), None); // 7, already warning
        assert_eq!(clock.phase(), TimerPhase::Warning);
    }

    #[test]
    fn test_tick_after_expiry_is_noop() {
        let mut clock = SessionClock::new(1, 0);
        assert_eq!(clock.tick(), Some(TickTransition::Expired));
        assert_eq!(clock.tick(), None);
        assert_eq!(clock.remaining_secs(), 0);
    }

    #[test]
    fn test_extend_resets_to_full_budget() {
        let mut clock = SessionClock::new(SESSION_BUDGET_SECS, WARNING_THRESHOLD_SECS);
        for _ in 0..1500 {
            clock.tick();
        }
        assert_eq!(clock.phase(), TimerPhase::Warning);

        let remaining = clock.extend();
        assert_eq!(remaining, SESSION_BUDGET_SECS);
        assert_eq!(clock.phase(), TimerPhase::Running);
    }

    #[test]
    fn test_extend_while_running_also_resets() {
        let mut clock = SessionClock::new(100, 10);
        clock.tick();
        clock.tick();
        assert_eq!(clock.extend(), 100);
        assert_eq!(clock.remaining_secs(), 100);
    }

    #[test]
    fn test_extend_after_expiry_is_noop() {
        let mut clock = SessionClock::new(1, 0);
        clock.tick();
        assert_eq!(clock.extend(), 0);
        assert!(clock.is_expired());
    }

    #[test]
    fn test_remaining_never_increases_between_extends() {
        let mut clock = SessionClock::new(50, 10);
        let mut previous = clock.remaining_secs();
        for _ in 0..60 {
            clock.tick();
            assert!(clock.remaining_secs() <= previous);
            previous = clock.remaining_secs();
        }
    }

    #[test]
    fn test_zero_budget_starts_expired() {
        let clock = SessionClock::new(0, 0);
        assert!(clock.is_expired());
    }

    #[test]
    fn test_budget_at_threshold_starts_in_warning() {
        let clock = SessionClock::new(300, 300);
        assert_eq!(clock.phase(), TimerPhase::Warning);
        assert_eq!(clock.remaining_secs(), 300);
    }

    #[test]
    fn test_phase_serialization() {
        let json = serde_json::to_string(&TimerPhase::Warning).unwrap();
        assert_eq!(json, "\"warning\"");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_task_emits_warning_then_expiry() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(5, 3), tx);

        assert_eq!(
            rx.recv().await,
            Some(TimerEvent::WarningReached { remaining_secs: 3 })
        );
        assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
        // Task stops after expiry, dropping its sender
        assert_eq!(rx.recv().await, None);
        assert_eq!(handle.phase(), TimerPhase::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extend_from_warning_restarts_countdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(5, 3), tx);

        assert_eq!(
            rx.recv().await,
            Some(TimerEvent::WarningReached { remaining_secs: 3 })
        );
        assert_eq!(handle.extend(), 5);
        assert_eq!(handle.phase(), TimerPhase::Running);

        // A second full countdown follows
        assert_eq!(
            rx.recv().await,
            Some(TimerEvent::WarningReached { remaining_secs: 3 })
        );
        assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_ticks_and_is_idempotent() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(600, 300), tx);

        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        // The aborted task dropped its sender without emitting anything
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_visible_through_handle() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(10, 2), tx);

        // Let the spawned loop register its first sleep before advancing,
        // otherwise the first tick slips
        tokio::task::yield_now().await;

        // Step one tick at a time so the sleep loop re-registers each timer
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.remaining_secs(), 6);

        handle.cancel();
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_budget_expires_without_ticking() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(0, 300), tx);

        assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
        assert_eq!(rx.recv().await, None);
        assert_eq!(handle.phase(), TimerPhase::Expired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_under_threshold_warns_before_first_tick() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = start_session_timer(SessionClock::new(3, 300), tx);

        assert_eq!(
            rx.recv().await,
            Some(TimerEvent::WarningReached { remaining_secs: 3 })
        );
        assert_eq!(handle.phase(), TimerPhase::Warning);

        // The countdown still runs to expiry afterwards
        assert_eq!(rx.recv().await, Some(TimerEvent::Expired));
        assert_eq!(rx.recv().await, None);
    }
}
