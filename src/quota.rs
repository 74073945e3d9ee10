use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Event {
    when: Instant,
    amount: usize,
}

#[derive(Debug, Clone, Default)]
struct Window {
    events: VecDeque<Event>,
    // sum of `amount` over `events`
    total: usize,
}

impl Window {
    fn prune(&mut self, now: Instant, duration: Duration) {
        while let Some(oldest) = self.events.front() {
            if now.saturating_duration_since(oldest.when) <= duration {
                break;
            }
            self.total = self.total.saturating_sub(oldest.amount);
            self.events.pop_front();
        }
    }
}

/// Admission control over a sliding time window.
///
/// A tracker admits an amount if, counting only the events recorded in the
/// last `duration`, the running total plus that amount stays within `max`.
/// [`check`](QuotaTracker::check) only asks; [`add`](QuotaTracker::add)
/// records consumption unconditionally. Callers that need a check and an
/// add to be atomic must serialize them externally.
pub struct QuotaTracker {
    max: usize,
    duration: Duration,
    window: Mutex<Window>,
}

impl QuotaTracker {
    pub fn new(max: usize, duration: Duration) -> QuotaTracker {
        QuotaTracker { max, duration, window: Mutex::new(Window::default()) }
    }

    /// Prunes events that have aged out of the window, then returns whether
    /// `amount` more would still be within the quota.
    pub fn check(&self, amount: usize) -> bool {
        let mut window = self.window.lock();
        window.prune(Instant::now(), self.duration);

        window
            .total
            .checked_add(amount)
            .map_or(false, |total| total <= self.max)
    }

    /// Records `amount` as consumed now.
    pub fn add(&self, amount: usize) {
        let mut window = self.window.lock();
        let now = Instant::now();
        window.prune(now, self.duration);

        window.total = window.total.saturating_add(amount);
        window.events.push_back(Event { when: now, amount });
    }

    pub fn max(&self) -> usize {
        self.max
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// The amount consumed by events still inside the window.
    pub fn used(&self) -> usize {
        let mut window = self.window.lock();
        window.prune(Instant::now(), self.duration);
        window.total
    }
}

impl Clone for QuotaTracker {
    /// Copies the limits and the current event history into a tracker with
    /// its own independent lock.
    fn clone(&self) -> QuotaTracker {
        let window = self.window.lock().clone();
        QuotaTracker {
            max: self.max,
            duration: self.duration,
            window: Mutex::new(window),
        }
    }
}

impl fmt::Debug for QuotaTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QuotaTracker")
            .field("max", &self.max)
            .field("duration", &self.duration)
            .field("used", &self.window.lock().total)
            .finish()
    }
}
