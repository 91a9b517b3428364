//! Local receipt clock
//!
//! Wall clock is read once at construction; after that time advances with the
//! monotonic TSC clock so an NTP step can never move `local_time` backwards.

use quanta::{Clock, Instant};

pub struct LocalClock {
    clock: Clock,
    anchor: Instant,
    anchor_micros: i64,
    last: i64,
}

impl LocalClock {
    pub fn new() -> Self {
        Self::with_clock(Clock::new(), chrono::Utc::now().timestamp_micros())
    }

    /// Build on an explicit clock source, anchored at `anchor_micros` since the epoch.
    pub fn with_clock(clock: Clock, anchor_micros: i64) -> Self {
        let anchor = clock.now();
        Self {
            clock,
            anchor,
            anchor_micros,
            last: i64::MIN,
        }
    }

    /// Microseconds since the Unix epoch. Strictly increasing across calls.
    pub fn now_micros(&mut self) -> i64 {
        let elapsed = self.clock.now().duration_since(self.anchor);
        let candidate = self
            .anchor_micros
            .saturating_add(i64::try_from(elapsed.as_micros()).unwrap_or(i64::MAX));
        let now = if candidate > self.last {
            candidate
        } else {
            self.last + 1
        };
        self.last = now;
        now
    }
}

impl Default for LocalClock {
    fn default() -> Self {
        Self::new()
    }
}
