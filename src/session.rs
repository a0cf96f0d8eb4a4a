// Copyright 2024, F. Stan
//
// Licensed under the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>,
// This file may not be copied, modified, or distributed
// except according to those terms.

use std::time::{Duration, Instant};

/// Time source for the conditioning run
pub trait Clock {
    fn now(&self) -> Instant;
}

/// Monotonic system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Tracks how long the gas sensor has been conditioning.
///
/// `complete` turns true the first time `elapsed` exceeds `threshold` and
/// stays true from then on.
#[derive(Debug, Clone, Copy)]
pub struct ConditioningSession {
    pub start_time: Instant,
    pub elapsed: Duration,
    pub threshold: Duration,
    pub complete: bool,
}

impl ConditioningSession {
    pub fn start(start_time: Instant, threshold: Duration) -> ConditioningSession {
        ConditioningSession {
            start_time,
            elapsed: Duration::ZERO,
            threshold,
            complete: false,
        }
    }

    /// Recomputes `elapsed` from `now` and returns `complete`
    pub fn update(&mut self, now: Instant) -> bool {
        self.elapsed = now.saturating_duration_since(self.start_time);
        if self.elapsed > self.threshold {
            self.complete = true;
        }
        self.complete
    }

    /// Time left until the threshold, zero once complete
    pub fn remaining(&self) -> Duration {
        self.threshold.saturating_sub(self.elapsed)
    }
}
