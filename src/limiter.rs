//! Jitter suppression for noisy readings.

use std::time::{Duration, Instant, SystemTime};

/// Smallest temperature change that is reported immediately
pub const DEFAULT_TEMPERATURE_DELTA: f32 = 1.0;

/// Interval after which any temperature change is reported
pub const DEFAULT_TEMPERATURE_TIME: Duration = Duration::from_secs(15);

/// Smallest end-time shift that is reported
pub const DEFAULT_END_TIME_DELTA: Duration = Duration::from_secs(5);

/// Limits how often a temperature reading may change
///
/// A reading is accepted if it moved by at least `min_delta`, or if `min_time`
/// has passed since the last accepted reading. An identical reading is also
/// accepted, which restarts the timer so that elapsed time alone does not
/// push through a later flicker.
#[derive(Debug, Clone)]
pub struct TemperatureLimiter {
    /// Change that bypasses the time limit
    pub min_delta: f32,
    /// Time after which any change is accepted
    pub min_time: Duration,
    accepted: Option<(f32, Instant)>,
}

impl Default for TemperatureLimiter {
    fn default() -> Self {
        Self {
            min_delta: DEFAULT_TEMPERATURE_DELTA,
            min_time: DEFAULT_TEMPERATURE_TIME,
            accepted: None,
        }
    }
}

impl TemperatureLimiter {
    /// Feed a reading taken at `now` and return the value to report
    pub fn update(&mut self, value: f32, now: Instant) -> f32 {
        if let Some((current, last_updated)) = self.accepted {
            #[allow(clippy::float_cmp)]
            let unchanged = current == value;
            let moved = (value - current).abs() >= self.min_delta;
            let expired = now.saturating_duration_since(last_updated) >= self.min_time;

            if !(unchanged || moved || expired) {
                return current;
            }
        }

        self.accepted = Some((value, now));
        value
    }

    /// Last accepted value
    #[must_use]
    pub fn value(&self) -> Option<f32> {
        self.accepted.map(|(value, _)| value)
    }
}

/// Stabilizes a wall-clock end time derived from a remaining duration
#[derive(Debug, Clone)]
pub struct EndTimeLimiter {
    /// Shift required before a new end time is reported
    pub min_delta: Duration,
    end_time: Option<SystemTime>,
}

impl Default for EndTimeLimiter {
    fn default() -> Self {
        Self {
            min_delta: DEFAULT_END_TIME_DELTA,
            end_time: None,
        }
    }
}

fn distance(a: SystemTime, b: SystemTime) -> Duration {
    a.duration_since(b)
        .or_else(|_| b.duration_since(a))
        .unwrap_or_default()
}

impl EndTimeLimiter {
    /// Feed the remaining time observed at `now` and return the end time
    ///
    /// When nothing is running and no timer was running before, the previous
    /// value is returned untouched: `None`, or an end time already in the past.
    pub fn update(&mut self, remaining: Duration, now: SystemTime) -> Option<SystemTime> {
        let expired = self.end_time.is_none_or(|end| end <= now);
        if remaining.is_zero() && expired {
            return self.end_time;
        }

        let candidate = now + remaining;
        let accept = match self.end_time {
            None => true,
            Some(previous) => {
                (previous <= now && !remaining.is_zero())
                    || distance(candidate, previous) >= self.min_delta
            }
        };

        if accept {
            self.end_time = Some(candidate);
        }
        self.end_time
    }

    /// Current stabilized end time
    #[must_use]
    pub const fn end_time(&self) -> Option<SystemTime> {
        self.end_time
    }
}
