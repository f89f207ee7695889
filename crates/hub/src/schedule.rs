//! Time-of-day helpers and the per-slot pump state machine.
//!
//! ```text
//! Idle ──[time-of-day in [start, start + grace), not yet run today]──▶ Running
//!  ▲                                                                     │
//!  └──────────────────────────[now >= active_until]──────────────────────┘
//! ```
//!
//! Each slot owns its own `active_until`; two slots never share or
//! overwrite each other's window.

use std::time::Duration as StdDuration;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};
use tracing::warn;

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Source of the current local date-time.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock at a fixed UTC offset (resolved once at startup).
pub struct SystemClock {
    offset: UtcOffset,
}

impl SystemClock {
    pub fn new(offset: UtcOffset) -> Self {
        Self { offset }
    }
}

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc().to_offset(self.offset)
    }
}

// ---------------------------------------------------------------------------
// Daily window
// ---------------------------------------------------------------------------

/// A daily time-of-day window, inclusive at both ends. A window whose start
/// is after its stop wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DailyWindow {
    pub start: Time,
    pub stop: Time,
}

impl DailyWindow {
    pub fn new(start: Time, stop: Time) -> Self {
        Self { start, stop }
    }

    pub fn contains(&self, t: Time) -> bool {
        if self.start <= self.stop {
            self.start <= t && t <= self.stop
        } else {
            t >= self.start || t <= self.stop
        }
    }
}

// ---------------------------------------------------------------------------
// Pump slot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Running { active_until: OffsetDateTime },
}

/// What a slot did during one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotTransition {
    /// Stayed idle.
    Idle,
    /// Idle → Running on this tick.
    Started { active_until: OffsetDateTime },
    /// Still inside its window.
    Running,
    /// Running → Idle on this tick.
    Expired,
}

/// One daily pump run: starts at `start`, runs for `duration`.
#[derive(Debug, Clone)]
pub struct PumpSlot {
    start: Time,
    duration: Duration,
    grace: Duration,
    state: SlotState,
    /// Date of the scheduled occurrence that last fired, so one occurrence
    /// never fires twice.
    last_started: Option<Date>,
}

impl PumpSlot {
    pub fn new(start: Time, duration: StdDuration, grace: StdDuration) -> Self {
        Self {
            start,
            duration: to_time_duration(duration),
            grace: to_time_duration(grace),
            state: SlotState::Idle,
            last_started: None,
        }
    }

    pub fn start(&self) -> Time {
        self.start
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, SlotState::Idle)
    }

    /// Advance the slot to `now` and report the transition taken.
    pub fn evaluate(&mut self, now: OffsetDateTime) -> SlotTransition {
        match self.state {
            SlotState::Running { active_until } if now >= active_until => {
                self.state = SlotState::Idle;
                SlotTransition::Expired
            }
            SlotState::Running { .. } => SlotTransition::Running,
            SlotState::Idle => match self.due_occurrence(now) {
                Some(occurrence) => {
                    let Some(active_until) = now.checked_add(self.duration) else {
                        warn!(slot = %self.start, "pump slot duration out of range, not starting");
                        return SlotTransition::Idle;
                    };
                    self.state = SlotState::Running { active_until };
                    self.last_started = Some(occurrence);
                    SlotTransition::Started { active_until }
                }
                None => SlotTransition::Idle,
            },
        }
    }

    /// The date of the occurrence `now` falls in, if `now` is inside the
    /// half-open trigger window `[start, start + grace)` and that
    /// occurrence has not fired yet.
    fn due_occurrence(&self, now: OffsetDateTime) -> Option<Date> {
        let t = now.time();
        let mut since_start = t - self.start;
        let occurrence = if since_start.is_negative() {
            // Trigger window may run past midnight.
            since_start += Duration::DAY;
            now.date().previous_day()?
        } else {
            now.date()
        };

        if since_start >= self.grace {
            return None;
        }
        if self.last_started == Some(occurrence) {
            return None;
        }
        Some(occurrence)
    }
}

fn to_time_duration(d: StdDuration) -> Duration {
    Duration::try_from(d).unwrap_or(Duration::MAX)
}

// ===========================================================================
// Tests
// ===========================================================================
