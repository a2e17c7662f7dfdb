//! Background task scheduling
//!
//! Long-running work is expressed as a task whose `run()` returns
//! periodically; re-entry state lives in the task object. Each task gets a
//! dedicated worker thread that snoozes between runs and can be woken or
//! cancelled from outside. Cancellation is a sticky flag checked at every
//! run boundary.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// What the runner should do after a task run completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunDirective {
    /// Run again immediately (the task yielded mid-work).
    Reschedule,
    /// Sleep for the duration, or until woken.
    Snooze(Duration),
    /// Sleep until explicitly woken.
    SnoozeForever,
    /// Stop the task permanently.
    Stop,
}

/// A cooperatively scheduled background task.
pub trait BackgroundTask: Send + Sync + 'static {
    /// Name used for the worker thread and logging.
    fn label(&self) -> &'static str;

    /// Perform one bounded chunk of work.
    fn run(&self) -> RunDirective;
}

struct Shared {
    cancelled: AtomicBool,
    woken: Mutex<bool>,
    condvar: Condvar,
}

impl Shared {
    /// Sleep until woken, cancelled, or (when given) the timeout elapses.
    fn snooze(&self, timeout: Option<Duration>) {
        let mut woken = self.woken.lock();
        if !*woken && !self.cancelled.load(Ordering::Acquire) {
            match timeout {
                Some(t) => {
                    self.condvar.wait_for(&mut woken, t);
                }
                None => self.condvar.wait(&mut woken),
            }
        }
        *woken = false;
    }
}

/// Handle to a spawned background task.
///
/// Dropping the handle cancels the task and joins its worker thread.
pub struct TaskHandle {
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskHandle {
    /// Spawn a worker thread driving `task`.
    pub fn spawn(task: Arc<dyn BackgroundTask>) -> TaskHandle {
        let shared = Arc::new(Shared {
            cancelled: AtomicBool::new(false),
            woken: Mutex::new(false),
            condvar: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let label = task.label();
        let worker = thread::Builder::new()
            .name(label.to_string())
            .spawn(move || worker_loop(task, worker_shared))
            .expect("spawn background task thread");
        debug!(task = label, "background task started");
        TaskHandle {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Wake the task if it is snoozing.
    pub fn wake(&self) {
        let mut woken = self.shared.woken.lock();
        *woken = true;
        self.shared.condvar.notify_one();
    }

    /// Cancel the task and join its worker thread.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.wake();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }

    /// True once the task has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::Acquire)
    }
}

impl Drop for TaskHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn worker_loop(task: Arc<dyn BackgroundTask>, shared: Arc<Shared>) {
    loop {
        if shared.cancelled.load(Ordering::Acquire) {
            break;
        }
        match task.run() {
            RunDirective::Reschedule => continue,
            RunDirective::Snooze(duration) => shared.snooze(Some(duration)),
            RunDirective::SnoozeForever => shared.snooze(None),
            RunDirective::Stop => break,
        }
    }
    debug!(task = task.label(), "background task stopped");
}
