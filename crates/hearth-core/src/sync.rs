//! Blocking signal used by the synchronous wait APIs.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// A latched, auto-resetting wake-up flag.
///
/// `raise` sets the flag and wakes one waiter; `wait` consumes it. A raise that
/// happens before anybody waits is not lost.
#[derive(Debug, Default)]
pub struct Signal {
    raised: Mutex<bool>,
    cond: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag and wake a waiter.
    pub fn raise(&self) {
        let mut raised = self.raised.lock().expect("signal lock poisoned");
        *raised = true;
        self.cond.notify_all();
    }

    /// Block until the flag is raised or `timeout` elapses (`None` waits forever).
    ///
    /// Returns `true` if the flag was raised; it is reset before returning.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut raised = self.raised.lock().expect("signal lock poisoned");

        while !*raised {
            match deadline {
                None => {
                    raised = self.cond.wait(raised).expect("signal lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    let (guard, _) = self
                        .cond
                        .wait_timeout(raised, deadline - now)
                        .expect("signal lock poisoned");
                    raised = guard;
                }
            }
        }

        *raised = false;
        true
    }

    /// Clear the flag without waiting.
    pub fn reset(&self) {
        *self.raised.lock().expect("signal lock poisoned") = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_raise_before_wait_is_latched() {
        let signal = Signal::new();
        signal.raise();
        assert!(signal.wait(Some(Duration::from_millis(1))));
        // Consumed by the first wait.
        assert!(!signal.wait(Some(Duration::from_millis(1))));
    }

    #[test]
    fn test_wait_times_out_no_earlier_than_requested() {
        let signal = Signal::new();
        let start = Instant::now();
        assert!(!signal.wait(Some(Duration::from_millis(30))));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_raise_from_other_thread_wakes_waiter() {
        let signal = Arc::new(Signal::new());
        let raiser = signal.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            raiser.raise();
        });

        assert!(signal.wait(None));
        handle.join().unwrap();
    }

    #[test]
    fn test_reset_clears_flag() {
        let signal = Signal::new();
        signal.raise();
        signal.reset();
        assert!(!signal.wait(Some(Duration::ZERO)));
    }
}
