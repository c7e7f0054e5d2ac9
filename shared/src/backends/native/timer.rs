use std::time::{Duration, Instant};

/// A Timer with a given duration after which it will enter into a "Ringing"
/// state. The Timer can be reset at an given time.
#[derive(Clone, Debug)]
pub struct Timer {
    duration: Duration,
    last: Instant,
}

impl Timer {
    /// Creates a new Timer with a given Duration, started at `now`
    pub fn new_at(duration: Duration, now: Instant) -> Self {
        Self {
            duration,
            last: now,
        }
    }

    /// Reset the Timer to stop ringing and wait till 'Duration' has elapsed
    /// again
    pub fn reset_at(&mut self, now: Instant) {
        self.last = now;
    }

    /// Gets whether or not the Timer is "Ringing" (i.e. the given Duration has
    /// elapsed since the last "reset")
    pub fn ringing_at(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last) >= self.duration
    }
}
