// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Deadline-ordered timer queue.
//!
//! One background thread drains a deadline-ordered schedule. Callbacks run on
//! that thread outside the queue lock, so they must be short; request-timeout
//! callbacks only flip the outstanding record and post the real completion to
//! the worker pool.

use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

type TimerCallback = Box<dyn FnMut() + Send + 'static>;

struct TimerTask {
    callback: TimerCallback,
    period: Option<Duration>,
}

struct TimerState {
    /// Deadline-ordered schedule; the id disambiguates equal deadlines.
    schedule: BTreeMap<(Instant, u64), ()>,
    /// Registered tasks. A `None` slot marks a task whose callback is
    /// currently running; cancelling removes the slot either way.
    tasks: HashMap<u64, Option<TimerTask>>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cond: Condvar,
}

/// Timer queue servicing one-shot and periodic timers.
pub struct TimerQueue {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<thread::JoinHandle<()>>>,
}

impl TimerQueue {
    /// Create the queue and spawn its worker thread.
    #[must_use]
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                schedule: BTreeMap::new(),
                tasks: HashMap::new(),
                next_id: 1,
                shutdown: false,
            }),
            cond: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("dorpc-timer".to_string())
            .spawn(move || run_timer_loop(&worker_shared))
            .expect("spawn timer thread");

        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Arm a one-shot timer.
    pub fn schedule_once<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let mut slot = Some(callback);
        self.insert(
            delay,
            None,
            Box::new(move || {
                if let Some(f) = slot.take() {
                    f();
                }
            }),
        )
    }

    /// Arm a periodic timer; first fire after one full period.
    pub fn schedule_periodic<F>(&self, period: Duration, callback: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        self.insert(period, Some(period), Box::new(callback))
    }

    fn insert(
        &self,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> TimerHandle {
        let deadline = Instant::now() + delay;
        let id = {
            let mut state = self.shared.state.lock();
            let id = state.next_id;
            state.next_id += 1;
            state.schedule.insert((deadline, id), ());
            state.tasks.insert(id, Some(TimerTask { callback, period }));
            id
        };
        self.shared.cond.notify_all();
        TimerHandle {
            id,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Stop the worker thread. Timers that have not fired are dropped.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            state.schedule.clear();
            state.tasks.clear();
        }
        self.shared.cond.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Default for TimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_timer_loop(shared: &Arc<TimerShared>) {
    loop {
        // Collect the due task under the lock, run it outside.
        let mut due: Option<(u64, TimerTask)> = None;
        {
            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }

            match state.schedule.keys().next().copied() {
                None => {
                    shared.cond.wait(&mut state);
                }
                Some((deadline, id)) => {
                    let now = Instant::now();
                    if deadline > now {
                        let _ = shared.cond.wait_until(&mut state, deadline);
                    } else {
                        state.schedule.remove(&(deadline, id));
                        // Cancelled timers leave a schedule key with no task.
                        if let Some(slot) = state.tasks.get_mut(&id) {
                            due = slot.take().map(|task| (id, task));
                        }
                    }
                }
            }
        }

        if let Some((id, mut task)) = due {
            (task.callback)();

            let mut state = shared.state.lock();
            if state.shutdown {
                return;
            }
            match task.period {
                // One-shot: drop the in-flight marker.
                None => {
                    state.tasks.remove(&id);
                }
                // Periodic: rearm unless cancelled while running.
                Some(period) => {
                    if state.tasks.contains_key(&id) {
                        state.schedule.insert((Instant::now() + period, id), ());
                        state.tasks.insert(id, Some(task));
                    }
                }
            }
        }
    }
}

/// Handle to an armed timer; dropping it does not cancel the timer.
pub struct TimerHandle {
    id: u64,
    shared: Weak<TimerShared>,
}

impl TimerHandle {
    /// Cancel the timer. Returns `true` when a pending fire was suppressed
    /// (for periodic timers: stops all future fires).
    pub fn cancel(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let mut state = shared.state.lock();
        state.tasks.remove(&self.id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn one_shot_fires_once() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        queue.schedule_once(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        queue.shutdown();
    }

    #[test]
    fn cancel_before_fire_suppresses_callback() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let handle = queue.schedule_once(Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(handle.cancel());

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        // already cancelled
        assert!(!handle.cancel());
        queue.shutdown();
    }

    #[test]
    fn periodic_fires_repeatedly_until_cancelled() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let handle = queue.schedule_periodic(Duration::from_millis(10), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(120));
        let fired = count.load(Ordering::SeqCst);
        assert!(fired >= 3, "expected several periodic fires, got {}", fired);

        handle.cancel();
        thread::sleep(Duration::from_millis(40));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(40));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        queue.shutdown();
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let queue = TimerQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for (delay_ms, tag) in [(60u64, 3u32), (20, 1), (40, 2)] {
            let order = Arc::clone(&order);
            queue.schedule_once(Duration::from_millis(delay_ms), move || {
                order.lock().push(tag);
            });
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        queue.shutdown();
    }

    #[test]
    fn shutdown_drops_pending_timers() {
        let queue = TimerQueue::new();
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        queue.schedule_once(Duration::from_millis(50), move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        queue.shutdown();

        thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
