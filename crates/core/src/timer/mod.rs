use std::time::{Duration, Instant};

/// Periodic timer driven by polling from the owning thread's loop.
#[derive(Debug, Default, Clone)]
pub struct RepaintTimer {
    interval: Duration,
    next_due: Option<Instant>,
}

impl RepaintTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)starts the timer; the first tick is due one interval from now.
    pub fn start(&mut self, interval: Duration) {
        self.start_at(Instant::now(), interval);
    }

    pub fn start_at(&mut self, now: Instant, interval: Duration) {
        self.interval = interval;
        self.next_due = Some(now + interval);
    }

    pub fn stop(&mut self) {
        self.next_due = None;
    }

    pub fn is_running(&self) -> bool {
        self.next_due.is_some()
    }

    /// Returns `true` at most once per call when a tick is due. Missed ticks
    /// are not replayed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.next_due {
            Some(due) if now >= due => {
                self.next_due = Some(now + self.interval);
                true
            }
            _ => false,
        }
    }
}
