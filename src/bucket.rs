//! The bucket: engine-level registry of vbuckets and shared context.

use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::durability::{DurabilityCompletionTask, ReplicationTopology, SyncWriteTimeoutTask};
use crate::paging::{ItemFreqDecayerTask, ItemPagerTask};
use crate::recovery::{CheckpointMemRecoveryTask, StreamNotifier};
use crate::stats::EngineStats;
use crate::task::TaskHandle;
use crate::vbucket::{VBucket, VBucketState};
use crate::Vbid;

/// Fixed-capacity registry of vbuckets.
#[derive(Debug)]
pub struct VBucketMap {
    slots: Vec<RwLock<Option<Arc<VBucket>>>>,
}

impl VBucketMap {
    /// Create a map with `capacity` vbucket slots.
    pub fn new(capacity: usize) -> Self {
        VBucketMap {
            slots: (0..capacity).map(|_| RwLock::new(None)).collect(),
        }
    }

    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Look up a vbucket.
    pub fn get(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.slots.get(usize::from(vbid.0))?.read().clone()
    }

    /// Install a vbucket.
    pub fn set(&self, vbid: Vbid, vb: Arc<VBucket>) {
        if let Some(slot) = self.slots.get(usize::from(vbid.0)) {
            *slot.write() = Some(vb);
        }
    }

    /// Remove a vbucket, returning it.
    pub fn remove(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.slots.get(usize::from(vbid.0))?.write().take()
    }

    /// Snapshot of every present vbucket.
    pub fn snapshot(&self) -> Vec<Arc<VBucket>> {
        self.slots
            .iter()
            .filter_map(|slot| slot.read().clone())
            .collect()
    }

    /// Total memory held by all vbuckets' checkpoints.
    pub fn total_checkpoint_memory(&self) -> usize {
        self.snapshot()
            .iter()
            .map(|vb| vb.checkpoint_manager().memory_usage())
            .sum()
    }

    /// Vbuckets ordered by checkpoint memory usage, largest first.
    pub fn by_checkpoint_memory_desc(&self) -> Vec<Arc<VBucket>> {
        let mut vbs = self.snapshot();
        vbs.sort_by_key(|vb| std::cmp::Reverse(vb.checkpoint_manager().memory_usage()));
        vbs
    }
}

/// An engine instance: configuration, statistics, vbuckets and the
/// durability completion task.
pub struct Bucket {
    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    map: Arc<VBucketMap>,
    persistent: bool,
    completion: Arc<DurabilityCompletionTask>,
    completion_handle: Arc<TaskHandle>,
}

impl Bucket {
    /// Create a bucket; `persistent` selects whether persist-level sync
    /// writes are supported (false for ephemeral buckets).
    pub fn new(config: EngineConfig, persistent: bool) -> Arc<Self> {
        let config = Arc::new(config);
        let stats = Arc::new(EngineStats::new());
        let map = Arc::new(VBucketMap::new(config.max_vbuckets));
        let completion = DurabilityCompletionTask::new(Arc::clone(&map));
        let completion_handle = Arc::new(TaskHandle::spawn(Arc::clone(&completion) as _));
        Arc::new(Bucket {
            config,
            stats,
            map,
            persistent,
            completion,
            completion_handle,
        })
    }

    /// Start the periodic checkpoint memory recovery task.
    pub fn start_memory_recovery(&self, notifier: Arc<dyn StreamNotifier>) -> TaskHandle {
        let task = CheckpointMemRecoveryTask::new(
            Arc::clone(&self.map),
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            notifier,
        );
        TaskHandle::spawn(task)
    }

    /// Start the periodic item pager task.
    pub fn start_item_pager(&self) -> TaskHandle {
        let task = ItemPagerTask::new(
            Arc::clone(&self.map),
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            !self.persistent,
        );
        TaskHandle::spawn(task)
    }

    /// Start the periodic frequency-counter decayer.
    pub fn start_freq_decayer(&self) -> TaskHandle {
        let task = ItemFreqDecayerTask::new(Arc::clone(&self.map), Arc::clone(&self.config));
        TaskHandle::spawn(task)
    }

    /// Start the periodic sync-write timeout sweep.
    pub fn start_timeout_sweep(&self) -> TaskHandle {
        let task = SyncWriteTimeoutTask::new(
            Arc::clone(&self.map),
            Arc::clone(&self.completion),
            Arc::clone(&self.completion_handle),
        );
        TaskHandle::spawn(task)
    }

    /// Create a vbucket and install it in the map.
    pub fn create_vbucket(
        &self,
        vbid: Vbid,
        state: VBucketState,
        topology: ReplicationTopology,
    ) -> Arc<VBucket> {
        let vb = VBucket::new(
            vbid,
            state,
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            topology,
            self.persistent,
        );
        self.map.set(vbid, Arc::clone(&vb));
        vb
    }

    /// Look up a vbucket.
    pub fn vbucket(&self, vbid: Vbid) -> Option<Arc<VBucket>> {
        self.map.get(vbid)
    }

    /// Route a replica's durability acknowledgement and kick completion.
    pub fn seqno_acknowledged(&self, vbid: Vbid, replica: &str, seqno: u64) {
        if let Some(vb) = self.map.get(vbid) {
            if vb.seqno_acknowledged(replica, seqno) {
                self.notify_sync_writes_to_complete(vbid);
            }
        }
    }

    /// Route local-persistence progress and kick completion.
    pub fn notify_local_persistence(&self, vbid: Vbid, seqno: u64) {
        if let Some(vb) = self.map.get(vbid) {
            if vb.notify_local_persistence(seqno) {
                self.notify_sync_writes_to_complete(vbid);
            }
        }
    }

    /// Flag a vbucket for the completion task, waking it at most once.
    pub fn notify_sync_writes_to_complete(&self, vbid: Vbid) {
        if self.completion.notify_sync_writes_to_complete(vbid) {
            self.completion_handle.wake();
        }
    }

    /// Shared configuration.
    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    /// Shared statistics.
    pub fn stats(&self) -> &Arc<EngineStats> {
        &self.stats
    }

    /// The vbucket registry.
    pub fn map(&self) -> &Arc<VBucketMap> {
        &self.map
    }

    /// Whether the bucket persists to disk.
    pub fn is_persistent(&self) -> bool {
        self.persistent
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        self.completion_handle.cancel();
    }
}
