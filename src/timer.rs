use std::time;

/// Source of integer millisecond timestamps, relative to its creation.
pub struct Epoch {
    time_base: time::Instant,
}

impl Epoch {
    pub fn new() -> Self {
        Self {
            time_base: time::Instant::now(),
        }
    }

    pub fn time_now_ms(&self) -> u64 {
        self.time_base.elapsed().as_millis() as u64
    }
}

/// A fixed-interval timer. Expirations are scheduled relative to the previous deadline rather
/// than the time the previous expiration was handled, so a late tick does not delay later ones.
#[derive(Debug)]
pub struct PeriodicTimer {
    interval_ms: u64,
    deadline_ms: u64,
}

impl PeriodicTimer {
    /// Creates a timer whose first expiration is one interval after `now_ms`.
    pub fn new(interval_ms: u64, now_ms: u64) -> Self {
        debug_assert!(interval_ms > 0);

        Self {
            interval_ms,
            deadline_ms: now_ms.saturating_add(interval_ms),
        }
    }

    /// Returns true and schedules the next expiration if the timer has expired at `now_ms`.
    /// At most one expiration is reported per call; a timer which has fallen several intervals
    /// behind will report again on the following calls.
    pub fn poll(&mut self, now_ms: u64) -> bool {
        if now_ms >= self.deadline_ms {
            self.deadline_ms = self.deadline_ms.saturating_add(self.interval_ms);
            return true;
        }

        return false;
    }

    pub fn deadline_ms(&self) -> u64 {
        self.deadline_ms
    }
}

/// Returns the time remaining until the earliest of `timers` expires, or zero if one already has.
pub fn next_timeout<'a, I>(timers: I, now_ms: u64) -> Option<time::Duration>
where
    I: IntoIterator<Item = &'a PeriodicTimer>,
{
    timers
        .into_iter()
        .map(|timer| timer.deadline_ms())
        .min()
        .map(|deadline_ms| time::Duration::from_millis(deadline_ms.saturating_sub(now_ms)))
}
