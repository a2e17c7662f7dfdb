//! Durability monitor: tracks prepared sync writes until resolution.
//!
//! Prepares move through `queued → tracked → resolved → completed`. The
//! monitor owns the tracked list and the resolved queue; completion (queueing
//! the commit/abort into the checkpoint manager) happens outside the
//! monitor's lock, via [`DurabilityMonitor::drain_resolved`]. The lock order
//! is always monitor → checkpoint manager, never the reverse.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::durability::topology::ReplicationTopology;
use crate::item::{DurabilityLevel, QueueOp, QueuedItem};
use crate::stats::EngineStats;
use crate::status::Status;
use crate::Vbid;

/// Client handle awaiting the outcome of a sync write.
///
/// The first notification wins; later ones are suppressed via the
/// `notified` bit.
#[derive(Debug)]
pub struct SyncWriteCookie {
    id: Uuid,
    notified: AtomicBool,
    outcome: Mutex<Option<Status>>,
}

impl SyncWriteCookie {
    /// Create a fresh cookie.
    pub fn new() -> Arc<Self> {
        Arc::new(SyncWriteCookie {
            id: Uuid::new_v4(),
            notified: AtomicBool::new(false),
            outcome: Mutex::new(None),
        })
    }

    /// Cookie id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver the final outcome. Returns `false` when the client was
    /// already notified (the duplicate is suppressed).
    pub fn notify(&self, status: Status) -> bool {
        if self
            .notified
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.outcome.lock() = Some(status);
        true
    }

    /// True once the client has been notified.
    pub fn was_notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    /// The delivered outcome, if any.
    pub fn outcome(&self) -> Option<Status> {
        *self.outcome.lock()
    }
}

/// How a prepare was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Requirements met; a commit must be queued.
    Commit,
    /// Timed out or explicitly aborted; an abort must be queued.
    Abort,
}

/// A prepare whose fate has been decided, awaiting completion.
///
/// Ownership of the prepare transfers out of the tracked list when this is
/// produced; the tracked entry is gone.
#[derive(Debug)]
pub struct ResolvedSyncWrite {
    /// The original prepare item.
    pub prepare: QueuedItem,
    /// Commit or abort.
    pub resolution: Resolution,
    /// Waiting client, if any.
    pub cookie: Option<Arc<SyncWriteCookie>>,
}

#[derive(Debug)]
struct TrackedWrite {
    prepare: QueuedItem,
    level: DurabilityLevel,
    deadline: Option<Instant>,
    acked_by: Vec<String>,
    cookie: Option<Arc<SyncWriteCookie>>,
}

impl TrackedWrite {
    fn seqno(&self) -> i64 {
        self.prepare.by_seqno()
    }
}

#[derive(Debug, Default)]
struct MonitorInner {
    topology: ReplicationTopology,
    tracked: VecDeque<TrackedWrite>,
    /// Highest seqno acknowledged per replica; acks are monotonic.
    replica_acks: HashMap<String, u64>,
    /// Highest seqno the local flusher has persisted.
    high_persisted_seqno: u64,
    /// Highest prepare seqno ever tracked.
    high_prepared_seqno: u64,
    resolved: VecDeque<ResolvedSyncWrite>,
}

/// Per-vbucket tracker of prepared sync writes.
#[derive(Debug)]
pub struct DurabilityMonitor {
    vbid: Vbid,
    stats: Arc<EngineStats>,
    /// Whether the bucket persists to disk; persist-levels are rejected
    /// otherwise.
    supports_persist_levels: bool,
    /// Timeout applied to prepares that do not carry their own.
    default_timeout: Option<std::time::Duration>,
    inner: Mutex<MonitorInner>,
}

impl DurabilityMonitor {
    /// Create a monitor with the given topology.
    pub fn new(
        vbid: Vbid,
        stats: Arc<EngineStats>,
        topology: ReplicationTopology,
        supports_persist_levels: bool,
    ) -> Self {
        DurabilityMonitor {
            vbid,
            stats,
            supports_persist_levels,
            default_timeout: None,
            inner: Mutex::new(MonitorInner {
                topology,
                ..MonitorInner::default()
            }),
        }
    }

    /// Apply a default timeout to prepares that do not carry one.
    pub fn with_default_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Validate durability requirements against the bucket type and the
    /// current topology, without tracking anything.
    ///
    /// Called before the prepare is queued so an impossible sync write is
    /// rejected synchronously.
    pub fn validate_requirements(&self, level: DurabilityLevel) -> Result<(), Status> {
        if level.requires_local_persistence() && !self.supports_persist_levels {
            return Err(Status::DurabilityInvalidLevel);
        }
        let inner = self.inner.lock();
        if !inner.topology.can_satisfy(level) {
            return Err(Status::DurabilityImpossible);
        }
        Ok(())
    }

    /// Track a prepare that has been queued into the checkpoint manager.
    ///
    /// The item must carry durability requirements and an assigned seqno.
    pub fn add_prepare(
        &self,
        prepare: QueuedItem,
        cookie: Option<Arc<SyncWriteCookie>>,
    ) -> Result<(), Status> {
        debug_assert_eq!(prepare.op(), QueueOp::PendingSyncWrite);
        let requirements = match prepare.durability() {
            Some(reqs) => reqs,
            None => return Err(Status::InvalidArgument),
        };
        self.validate_requirements(requirements.level)?;

        let mut inner = self.inner.lock();
        let seqno = prepare.by_seqno();
        if seqno <= 0 || (seqno as u64) <= inner.high_prepared_seqno {
            return Err(Status::InvalidArgument);
        }
        inner.high_prepared_seqno = seqno as u64;
        inner.tracked.push_back(TrackedWrite {
            prepare,
            level: requirements.level,
            deadline: requirements
                .timeout
                .or(self.default_timeout)
                .map(|t| Instant::now() + t),
            acked_by: Vec::new(),
            cookie,
        });
        self.stats
            .sync_writes_accepted
            .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Record a replica's acknowledgement of every prepare up to `seqno`.
    ///
    /// Acks are monotonic per replica; a lower ack than previously seen is
    /// ignored. Returns `true` when new prepares became resolved.
    pub fn seqno_acknowledged(&self, replica: &str, seqno: u64) -> bool {
        let mut inner = self.inner.lock();
        if !inner.topology.is_replica(replica) {
            debug!(
                vbid = %self.vbid,
                replica,
                "ack from node outside the replication chain, ignored"
            );
            return false;
        }
        let prev = inner.replica_acks.get(replica).copied().unwrap_or(0);
        if seqno <= prev {
            return false;
        }
        inner.replica_acks.insert(replica.to_string(), seqno);

        for write in inner.tracked.iter_mut() {
            if write.seqno() as u64 <= seqno && !write.acked_by.iter().any(|n| n == replica) {
                write.acked_by.push(replica.to_string());
            }
        }
        self.resolve_in_order(&mut inner)
    }

    /// Record that the local flusher has persisted up to `seqno`.
    ///
    /// Returns `true` when new prepares became resolved.
    pub fn notify_local_persistence(&self, seqno: u64) -> bool {
        let mut inner = self.inner.lock();
        if seqno <= inner.high_persisted_seqno {
            return false;
        }
        inner.high_persisted_seqno = seqno;
        self.resolve_in_order(&mut inner)
    }

    /// Install a new replication topology and re-evaluate every tracked
    /// prepare against the new acker set.
    ///
    /// Prepares whose durability has become impossible remain tracked, but
    /// their waiting clients learn `DurabilityImpossible` immediately.
    pub fn set_topology(&self, topology: ReplicationTopology) {
        let mut inner = self.inner.lock();
        debug!(vbid = %self.vbid, chain = topology.chain_size(), "topology change");

        // Forget acks from nodes no longer in the chain.
        let retained: Vec<String> = inner
            .replica_acks
            .keys()
            .filter(|n| topology.is_replica(n))
            .cloned()
            .collect();
        inner
            .replica_acks
            .retain(|node, _| retained.iter().any(|n| n == node));
        for write in inner.tracked.iter_mut() {
            write.acked_by.retain(|node| topology.is_replica(node));
        }
        inner.topology = topology;

        for write in inner.tracked.iter() {
            if !inner.topology.can_satisfy(write.level) {
                if let Some(cookie) = &write.cookie {
                    cookie.notify(Status::DurabilityImpossible);
                }
            }
        }
        self.resolve_in_order(&mut inner);
    }

    /// Abort every tracked prepare whose deadline has elapsed.
    ///
    /// Returns `true` when prepares were aborted (and hence the resolved
    /// queue needs draining).
    pub fn process_timeouts(&self, now: Instant) -> bool {
        let mut inner = self.inner.lock();
        let mut aborted = false;
        let mut idx = 0;
        while idx < inner.tracked.len() {
            let expired = inner.tracked[idx]
                .deadline
                .is_some_and(|deadline| deadline <= now);
            if expired {
                let write = inner.tracked.remove(idx).expect("index in bounds");
                warn!(
                    vbid = %self.vbid,
                    seqno = write.seqno(),
                    "sync write timed out, aborting"
                );
                self.stats
                    .sync_writes_aborted
                    .fetch_add(1, Ordering::Relaxed);
                inner.resolved.push_back(ResolvedSyncWrite {
                    prepare: write.prepare,
                    resolution: Resolution::Abort,
                    cookie: write.cookie,
                });
                aborted = true;
            } else {
                idx += 1;
            }
        }
        aborted
    }

    /// Remove the tracked prepare for `key` and resolve it as an abort.
    ///
    /// Used when an explicit abort arrives (e.g. from the active's stream).
    pub fn abort_prepare(&self, key: &crate::item::DocKey) -> Result<QueuedItem, Status> {
        let mut inner = self.inner.lock();
        let idx = inner
            .tracked
            .iter()
            .position(|w| w.prepare.key() == key)
            .ok_or(Status::KeyNotFound)?;
        let write = inner.tracked.remove(idx).expect("index in bounds");
        self.stats
            .sync_writes_aborted
            .fetch_add(1, Ordering::Relaxed);
        if let Some(cookie) = &write.cookie {
            cookie.notify(Status::SyncWriteAmbiguous);
        }
        Ok(write.prepare)
    }

    /// Notify every waiting client once with `SyncWriteAmbiguous` and drop
    /// the cookies. The tracked list itself is preserved for the next active
    /// to reconcile.
    pub fn abort_all_client_waits(&self) {
        let mut inner = self.inner.lock();
        for write in inner.tracked.iter_mut() {
            if let Some(cookie) = write.cookie.take() {
                cookie.notify(Status::SyncWriteAmbiguous);
            }
        }
    }

    /// Move the resolved queue out and hand each entry to `sink`.
    ///
    /// The monitor lock is released before `sink` runs, so the sink is free
    /// to call into the checkpoint manager.
    pub fn drain_resolved(&self, mut sink: impl FnMut(ResolvedSyncWrite)) -> usize {
        let resolved = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.resolved)
        };
        let count = resolved.len();
        for write in resolved {
            sink(write);
        }
        count
    }

    /// Number of prepares currently tracked.
    pub fn num_tracked(&self) -> usize {
        self.inner.lock().tracked.len()
    }

    /// Number of resolved prepares awaiting completion.
    pub fn num_resolved(&self) -> usize {
        self.inner.lock().resolved.len()
    }

    /// Highest prepare seqno ever tracked.
    pub fn high_prepared_seqno(&self) -> u64 {
        self.inner.lock().high_prepared_seqno
    }

    /// Highest locally persisted seqno the monitor has been told about.
    pub fn high_persisted_seqno(&self) -> u64 {
        self.inner.lock().high_persisted_seqno
    }

    /// Vbucket this monitor belongs to.
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Resolve satisfied prepares strictly in seqno order.
    ///
    /// Stops at the first unsatisfied prepare so commit order always equals
    /// prepare order. Returns `true` when at least one prepare resolved.
    fn resolve_in_order(&self, inner: &mut MonitorInner) -> bool {
        let mut any = false;
        while let Some(front) = inner.tracked.front() {
            if !Self::is_satisfied(inner, front) {
                break;
            }
            let write = inner.tracked.pop_front().expect("front exists");
            self.stats
                .sync_writes_committed
                .fetch_add(1, Ordering::Relaxed);
            inner.resolved.push_back(ResolvedSyncWrite {
                prepare: write.prepare,
                resolution: Resolution::Commit,
                cookie: write.cookie,
            });
            any = true;
        }
        any
    }

    fn is_satisfied(inner: &MonitorInner, write: &TrackedWrite) -> bool {
        let topology = &inner.topology;
        if !topology.can_satisfy(write.level) {
            return false;
        }
        let seqno = write.seqno() as u64;
        let locally_persisted = inner.high_persisted_seqno >= seqno;

        // The active's own acknowledgement: immediate for in-memory levels,
        // gated on the flusher for PersistToMajority.
        let active_acked = match write.level {
            DurabilityLevel::Majority | DurabilityLevel::MajorityAndPersistOnMaster => true,
            DurabilityLevel::PersistToMajority => locally_persisted,
        };

        let acks = usize::from(active_acked)
            + write
                .acked_by
                .iter()
                .filter(|n| topology.is_replica(n))
                .count();
        if acks < topology.majority() {
            return false;
        }
        match write.level {
            DurabilityLevel::MajorityAndPersistOnMaster => locally_persisted,
            _ => true,
        }
    }
}
