//! Heartbeat liveness monitor.
//!
//! The counter has three increment sources (synchronous heartbeat send
//! failures, transport-error events reported by the engine, and transport
//! errors observed during poll) and two clear sources: any received
//! response, and an explicit reset on reconnect. Crossing the threshold
//! fires the disconnect hook exactly once per arming.

use std::time::{Duration, Instant};

use tracing::warn;

/// Default heartbeat interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(2000);
/// Consecutive failures tolerated before declaring the link dead.
pub const MAX_HEARTBEAT_RETRIES: u32 = 3;

/// Result of one heartbeat attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatOutcome {
    /// TesterPresent was queued.
    Sent,
    /// A transaction is in flight; the timer was not re-armed.
    Busy,
    /// The send failed synchronously; the failure counter was bumped.
    SendFailed,
}

/// The heartbeat state machine.
pub struct Monitor {
    interval: Duration,
    threshold: u32,
    fail_count: u32,
    last_beat: Instant,
    disconnected: bool,
    on_disconnect: Option<Box<dyn FnMut()>>,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL, MAX_HEARTBEAT_RETRIES)
    }
}

impl Monitor {
    /// Build a monitor with an explicit interval and failure threshold.
    pub fn new(interval: Duration, threshold: u32) -> Self {
        Self {
            interval,
            threshold,
            fail_count: 0,
            last_beat: Instant::now(),
            disconnected: false,
            on_disconnect: None,
        }
    }

    /// Register the hook fired when the failure threshold is crossed.
    pub fn set_disconnect_hook(&mut self, hook: impl FnMut() + 'static) {
        self.on_disconnect = Some(Box::new(hook));
    }

    /// True once the heartbeat interval has elapsed.
    pub fn due(&self, now: Instant) -> bool {
        now.duration_since(self.last_beat) > self.interval
    }

    /// Restart the interval timer.
    pub fn rearm(&mut self, now: Instant) {
        self.last_beat = now;
    }

    /// Record one link failure; fires the disconnect hook at the threshold.
    pub fn note_failure(&mut self) {
        self.fail_count += 1;
        if self.fail_count >= self.threshold && !self.disconnected {
            warn!(
                failures = self.fail_count,
                "heartbeat threshold crossed, declaring link dead"
            );
            self.disconnected = true;
            if let Some(hook) = self.on_disconnect.as_mut() {
                hook();
            }
        }
    }

    /// A response arrived: the link is alive, clear the failure counter.
    pub fn note_link_ok(&mut self) {
        self.fail_count = 0;
    }

    /// Consecutive failures recorded so far.
    pub fn fail_count(&self) -> u32 {
        self.fail_count
    }

    /// True once the disconnect hook has fired.
    pub fn disconnected(&self) -> bool {
        self.disconnected
    }

    /// Full reset, used when re-establishing a connection.
    pub fn reset(&mut self) {
        self.fail_count = 0;
        self.disconnected = false;
        self.last_beat = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn hook_fires_exactly_once_at_threshold() {
        let fired = Rc::new(Cell::new(0u32));
        let hook_fired = fired.clone();

        let mut monitor = Monitor::new(Duration::from_millis(10), 3);
        monitor.set_disconnect_hook(move || hook_fired.set(hook_fired.get() + 1));

        monitor.note_failure();
        monitor.note_failure();
        assert_eq!(fired.get(), 0);
        monitor.note_failure();
        assert_eq!(fired.get(), 1);
        monitor.note_failure();
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn success_between_failures_resets_the_counter() {
        let mut monitor = Monitor::new(Duration::from_millis(10), 3);
        monitor.note_failure();
        monitor.note_failure();
        monitor.note_link_ok();
        monitor.note_failure();
        assert!(!monitor.disconnected());
        assert_eq!(monitor.fail_count(), 1);
    }

    #[test]
    fn reset_rearms_the_hook() {
        let fired = Rc::new(Cell::new(0u32));
        let hook_fired = fired.clone();

        let mut monitor = Monitor::new(Duration::from_millis(10), 1);
        monitor.set_disconnect_hook(move || hook_fired.set(hook_fired.get() + 1));

        monitor.note_failure();
        assert_eq!(fired.get(), 1);
        monitor.reset();
        monitor.note_failure();
        assert_eq!(fired.get(), 2);
    }
}
