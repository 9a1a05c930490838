//! Rain-delay hold: a timestamped deadline that suppresses new program
//! launches while leaving in-flight runs alone.

use chrono::{DateTime, Utc};

/// 24 hours minus one minute, so a hold re-armed by the same daily
/// detection minute never lands exactly on a scheduler evaluation.
pub const RAIN_DELAY_INTERVAL_SEC: i64 = 86_340;

#[derive(Debug, Default, Clone)]
pub struct RainDelay {
    deadline: Option<DateTime<Utc>>,
}

impl RainDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push the deadline out to `now + RAIN_DELAY_INTERVAL_SEC`. The
    /// deadline only ever moves forward; repeated detections while a hold
    /// is already armed extend it, never shorten it.
    pub fn extend(&mut self, now: DateTime<Utc>) {
        let candidate = now + chrono::Duration::seconds(RAIN_DELAY_INTERVAL_SEC);
        self.deadline = Some(match self.deadline {
            Some(current) if current > candidate => current,
            _ => candidate,
        });
    }

    pub fn clear(&mut self) {
        self.deadline = None;
    }

    /// Whether the scheduler must hold off launching programs.
    pub fn active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.deadline, Some(d) if d > now)
    }

    /// Seconds until the hold lifts; `None` once the deadline has passed.
    pub fn remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        let d = self.deadline?;
        let secs = (d - now).num_seconds();
        (secs > 0).then_some(secs)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
