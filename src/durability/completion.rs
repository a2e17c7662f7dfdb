//! Engine-wide completion of resolved sync writes.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::bucket::VBucketMap;
use crate::task::{BackgroundTask, RunDirective};
use crate::Vbid;

/// Maximum wall-clock time a single run may spend before yielding.
const MAX_CHUNK_DURATION: Duration = Duration::from_millis(25);

/// Drains resolved sync writes per vbucket, fairly rotating.
///
/// One flag per vbucket records outstanding work; notification wakes the
/// worker at most once (guarded by `wake_up_scheduled`) to avoid wake
/// storms. Each run resumes the rotation where the previous one left off
/// and yields after ~25 ms.
pub struct DurabilityCompletionTask {
    map: Arc<VBucketMap>,
    pending_vbs: Vec<AtomicBool>,
    wake_up_scheduled: AtomicBool,
    next_vbid: AtomicUsize,
}

impl DurabilityCompletionTask {
    /// Create a completion task over the given vbucket map.
    pub fn new(map: Arc<VBucketMap>) -> Arc<Self> {
        let capacity = map.capacity();
        Arc::new(DurabilityCompletionTask {
            map,
            pending_vbs: (0..capacity).map(|_| AtomicBool::new(false)).collect(),
            wake_up_scheduled: AtomicBool::new(false),
            next_vbid: AtomicUsize::new(0),
        })
    }

    /// Flag a vbucket as having resolved sync writes to complete.
    ///
    /// Returns `true` when the caller should wake the worker: the vbucket's
    /// flag flipped false→true and no wake-up is already scheduled.
    pub fn notify_sync_writes_to_complete(&self, vbid: Vbid) -> bool {
        let slot = match self.pending_vbs.get(usize::from(vbid.0)) {
            Some(slot) => slot,
            None => return false,
        };
        if slot
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.wake_up_scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// True when a wake-up is pending delivery.
    pub fn wake_up_scheduled(&self) -> bool {
        self.wake_up_scheduled.load(Ordering::Acquire)
    }

    /// Process pending vbuckets for up to the chunk budget.
    ///
    /// Returns `true` when the budget elapsed mid-iteration and the task
    /// should re-run immediately.
    pub fn process_pending(&self) -> bool {
        let start = Instant::now();
        let capacity = self.pending_vbs.len();
        let mut vbid = self.next_vbid.load(Ordering::Relaxed) % capacity.max(1);

        for _ in 0..capacity {
            if self.pending_vbs[vbid].swap(false, Ordering::AcqRel) {
                if let Some(vb) = self.map.get(Vbid(vbid as u16)) {
                    vb.process_resolved_sync_writes();
                }
            }
            vbid = (vbid + 1) % capacity;
            if start.elapsed() > MAX_CHUNK_DURATION {
                self.next_vbid.store(vbid, Ordering::Relaxed);
                return true;
            }
        }
        self.next_vbid.store(vbid, Ordering::Relaxed);
        false
    }
}

impl BackgroundTask for DurabilityCompletionTask {
    fn label(&self) -> &'static str {
        "durability-completion"
    }

    fn run(&self) -> RunDirective {
        // Allow notifications arriving during this run to schedule the next
        // wake-up.
        self.wake_up_scheduled.store(false, Ordering::Release);
        if self.process_pending() {
            RunDirective::Reschedule
        } else {
            RunDirective::SnoozeForever
        }
    }
}

/// Periodic sweep aborting prepares whose deadline has elapsed.
///
/// Aborted prepares land in their monitor's resolved queue; the sweep flags
/// the vbucket for the completion task and wakes it.
pub struct SyncWriteTimeoutTask {
    map: Arc<VBucketMap>,
    completion: Arc<DurabilityCompletionTask>,
    completion_wake: Arc<crate::task::TaskHandle>,
    period: Duration,
}

impl SyncWriteTimeoutTask {
    /// Create a timeout sweep feeding the given completion task.
    pub fn new(
        map: Arc<VBucketMap>,
        completion: Arc<DurabilityCompletionTask>,
        completion_wake: Arc<crate::task::TaskHandle>,
    ) -> Arc<Self> {
        Arc::new(SyncWriteTimeoutTask {
            map,
            completion,
            completion_wake,
            period: Duration::from_millis(25),
        })
    }

    /// Sweep every vbucket once. Returns how many vbuckets had timeouts.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut timed_out = 0;
        for vb in self.map.snapshot() {
            if vb.process_timeouts(now) {
                timed_out += 1;
                if self.completion.notify_sync_writes_to_complete(vb.id()) {
                    self.completion_wake.wake();
                }
            }
        }
        timed_out
    }
}

impl BackgroundTask for SyncWriteTimeoutTask {
    fn label(&self) -> &'static str {
        "sync-write-timeout"
    }

    fn run(&self) -> RunDirective {
        self.sweep();
        RunDirective::Snooze(self.period)
    }
}
