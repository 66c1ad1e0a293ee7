// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 dorpc developers

//! Worker pool executing asynchronous completion handlers.
//!
//! Every async completion in the stack is posted here as a closure, never
//! invoked from inside a lock or a transport I/O callback stack. A handler
//! that panics is caught at the pool boundary and routed to the node's
//! exception handler; it never unwinds into transport or timer internals.

use crate::error::{Error, Result};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;

pub(crate) type PoolTask = Box<dyn FnOnce() + Send + 'static>;

/// Callback receiving errors raised by tasks that escaped into the pool
/// boundary (panicking handlers).
pub type PanicSink = Arc<dyn Fn(&Error) + Send + Sync>;

/// Fixed-size worker pool draining one shared task queue.
pub struct WorkerPool {
    sender: Mutex<Option<Sender<PoolTask>>>,
    workers: Mutex<Vec<thread::JoinHandle<()>>>,
    thread_count: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers (clamped to a minimum of 1).
    #[must_use]
    pub fn new(threads: usize, panic_sink: PanicSink) -> Self {
        let threads = threads.max(1);
        let (sender, receiver) = channel::unbounded::<PoolTask>();

        let mut workers = Vec::with_capacity(threads);
        for i in 0..threads {
            let receiver: Receiver<PoolTask> = receiver.clone();
            let sink = Arc::clone(&panic_sink);
            let handle = thread::Builder::new()
                .name(format!("dorpc-worker-{}", i))
                .spawn(move || {
                    for task in receiver.iter() {
                        if catch_unwind(AssertUnwindSafe(task)).is_err() {
                            sink(&Error::InternalError(
                                "completion handler panicked".to_string(),
                            ));
                        }
                    }
                })
                .expect("spawn worker thread");
            workers.push(handle);
        }

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            thread_count: threads,
        }
    }

    /// Queue a closure for execution on a worker thread.
    pub fn post<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => tx
                .send(Box::new(task))
                .map_err(|_| Error::InvalidOperation("thread pool shut down".to_string())),
            None => Err(Error::InvalidOperation(
                "thread pool shut down".to_string(),
            )),
        }
    }

    /// Like [`WorkerPool::post`], but hands the task back instead of
    /// dropping it when the pool is unavailable, so callers can run it
    /// inline and completion handlers are never lost.
    pub(crate) fn post_or_return(&self, task: PoolTask) -> Option<PoolTask> {
        let sender = self.sender.lock();
        match sender.as_ref() {
            Some(tx) => match tx.send(task) {
                Ok(()) => None,
                Err(rejected) => Some(rejected.0),
            },
            None => Some(task),
        }
    }

    /// Number of worker threads.
    #[must_use]
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Close the queue and join the workers. Tasks already queued still run.
    pub fn shutdown(&self) {
        // Dropping the sender disconnects the channel once queued tasks drain.
        self.sender.lock().take();

        let workers = std::mem::take(&mut *self.workers.lock());
        let current = thread::current().id();
        for handle in workers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}
