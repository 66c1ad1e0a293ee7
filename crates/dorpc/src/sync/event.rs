// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Single-slot auto-reset wake event.

use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Single-slot wake event: `set` wakes exactly one waiter and auto-clears.
///
/// A `set` with no waiter present is latched, so the next `wait_one` returns
/// immediately. Used to turn async completions into blocking calls without a
/// second code path.
pub struct AutoResetEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl AutoResetEvent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Wake exactly one waiter; the signal auto-clears when consumed.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_one();
    }

    /// Wait for a signal. `None` waits forever. Returns `false` on timeout
    /// without throwing.
    pub fn wait_one(&self, timeout: Option<Duration>) -> bool {
        let mut signaled = self.signaled.lock();
        match timeout {
            None => {
                while !*signaled {
                    self.cond.wait(&mut signaled);
                }
                *signaled = false;
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*signaled {
                    if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                let woken = *signaled;
                *signaled = false;
                woken
            }
        }
    }
}

impl Default for AutoResetEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn latched_set_wakes_immediately() {
        let ev = AutoResetEvent::new();
        ev.set();
        assert!(ev.wait_one(Some(Duration::from_millis(1))));
        // signal consumed: second wait times out
        assert!(!ev.wait_one(Some(Duration::from_millis(1))));
    }

    #[test]
    fn timeout_returns_false() {
        let ev = AutoResetEvent::new();
        let start = Instant::now();
        assert!(!ev.wait_one(Some(Duration::from_millis(20))));
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn set_wakes_blocked_waiter() {
        let ev = Arc::new(AutoResetEvent::new());
        let ev2 = Arc::clone(&ev);

        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            ev2.set();
        });

        assert!(ev.wait_one(Some(Duration::from_secs(5))));
        handle.join().expect("setter thread");
    }

    #[test]
    fn set_wakes_exactly_one_waiter() {
        let ev = Arc::new(AutoResetEvent::new());
        let mut handles = Vec::new();
        for _ in 0..2 {
            let ev = Arc::clone(&ev);
            handles.push(thread::spawn(move || {
                ev.wait_one(Some(Duration::from_millis(100)))
            }));
        }

        thread::sleep(Duration::from_millis(20));
        ev.set();

        let woken: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().expect("waiter thread")))
            .sum();
        assert_eq!(woken, 1, "one set wakes exactly one of two waiters");
    }
}
