//! The paging visitor: frequency+age driven item eviction.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::bucket::VBucketMap;
use crate::config::EngineConfig;
use crate::hash_table::StoredValue;
use crate::item::{DocKey, Item, CAS_LOGICAL_BITS};
use crate::paging::item_eviction::{ItemEviction, LEARNING_POPULATION};
use crate::stats::EngineStats;
use crate::task::{BackgroundTask, RunDirective};
use crate::vbucket::{VBucket, VBucketState};
use crate::checkpoint::{GenerateBySeqno, GenerateCas};

/// Persistence backlog beyond which the pager yields to the flusher.
pub const MAX_PERSISTENCE_QUEUE_SIZE: u64 = 1_000_000;

/// Which vbucket states the current pager pass targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PagerPhase {
    /// Evict from replica (and dead) vbuckets.
    ReplicaOnly = 0,
    /// Evict from active and pending vbuckets.
    ActiveAndPendingOnly = 1,
}

/// Pager phase shared between passes.
#[derive(Debug)]
pub struct SharedPagerPhase(AtomicU8);

impl SharedPagerPhase {
    /// Start in the given phase.
    pub fn new(phase: PagerPhase) -> Arc<Self> {
        Arc::new(SharedPagerPhase(AtomicU8::new(phase as u8)))
    }

    /// Current phase.
    pub fn get(&self) -> PagerPhase {
        match self.0.load(Ordering::Acquire) {
            0 => PagerPhase::ReplicaOnly,
            _ => PagerPhase::ActiveAndPendingOnly,
        }
    }

    /// Switch phase.
    pub fn set(&self, phase: PagerPhase) {
        self.0.store(phase as u8, Ordering::Release);
    }
}

/// Visits hash tables and evicts cold items.
///
/// Eviction is decided per item from its frequency counter and its age
/// (derived from the CAS clock): an item is evicted when its frequency is at
/// or below the learned threshold and it is either rarely used or old
/// enough. Items too hot to evict are decayed by one so repeated passes can
/// eventually reclaim them.
pub struct PagingVisitor {
    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    phase: Arc<SharedPagerPhase>,
    is_ephemeral: bool,
    item_eviction: ItemEviction,
    percent: f64,
    active_bias: f64,
    freq_threshold: u8,
    age_threshold: u64,
    active_resident_ratio: f64,
    replica_resident_ratio: f64,
    collect_expired: bool,
    expired: Vec<DocKey>,
    ejected: usize,
    num_expired: usize,
    below_low_wat: bool,
    max_cas: u64,
    start_time_secs: u32,
}

impl PagingVisitor {
    /// Create a visitor for one pager pass.
    pub fn new(
        config: Arc<EngineConfig>,
        stats: Arc<EngineStats>,
        phase: Arc<SharedPagerPhase>,
        is_ephemeral: bool,
    ) -> Self {
        let active_bias = config.active_bias();
        let start_time_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        PagingVisitor {
            config,
            stats,
            phase,
            is_ephemeral,
            item_eviction: ItemEviction::new(),
            percent: 0.0,
            active_bias,
            freq_threshold: 0,
            age_threshold: 0,
            active_resident_ratio: 1.0,
            replica_resident_ratio: 1.0,
            collect_expired: false,
            expired: Vec::new(),
            ejected: 0,
            num_expired: 0,
            below_low_wat: false,
            max_cas: 0,
            start_time_secs,
        }
    }

    /// Provide the bucket-wide resident ratios used to skip active vbuckets
    /// that are already less resident than the replicas.
    pub fn set_resident_ratios(&mut self, active: f64, replica: f64) {
        self.active_resident_ratio = active;
        self.replica_resident_ratio = replica;
    }

    /// True when the pager should yield for the flusher to catch up.
    pub fn pause_needed(&self) -> bool {
        self.stats.disk_queue_size() >= MAX_PERSISTENCE_QUEUE_SIZE
    }

    /// Values ejected so far in this pass.
    pub fn num_ejected(&self) -> usize {
        self.ejected
    }

    /// Expired items removed so far in this pass.
    pub fn num_expired(&self) -> usize {
        self.num_expired
    }

    /// Visit one vbucket's hash table.
    pub fn visit_vbucket(&mut self, vb: &VBucket) {
        vb.checkpoint_manager()
            .remove_closed_unref_checkpoints(usize::MAX);

        let state = vb.state();
        let in_phase = match self.phase.get() {
            PagerPhase::ReplicaOnly => {
                matches!(state, VBucketState::Replica | VBucketState::Dead)
            }
            PagerPhase::ActiveAndPendingOnly => {
                matches!(state, VBucketState::Active | VBucketState::Pending)
            }
        };
        if !in_phase {
            return;
        }

        let current = self.stats.mem_used() as f64;
        let lower = self.config.mem_low_wat_bytes() as f64;
        let high = self.config.mem_high_wat_bytes() as f64;

        // Active vbuckets are spared while they are already less resident
        // than the replicas, unless memory is critical.
        if state == VBucketState::Active
            && current < high
            && self.active_resident_ratio < self.replica_resident_ratio
        {
            return;
        }

        if current <= lower {
            self.below_low_wat = true;
            return;
        }

        let probability = (current - lower) / current;
        self.adjust_percent(probability, state);

        self.max_cas = vb.max_cas();
        self.item_eviction.reset();
        self.freq_threshold = 0;
        self.age_threshold = 0;
        // Recompute thresholds every 0.1% of the table, with a floor of the
        // learning population.
        let num_items = vb.hash_table().num_items() as f64;
        let interval = ((num_items * 0.001).ceil() as u64).max(LEARNING_POPULATION);
        self.item_eviction.set_update_interval(interval);
        self.collect_expired = state == VBucketState::Active;

        vb.hash_table().visit(|key, sv| {
            self.visit_stored_value(key, sv);
            true
        });

        self.delete_expired(vb);
        vb.checkpoint_manager()
            .remove_closed_unref_checkpoints(usize::MAX);
    }

    /// Finish the pass: rotate the phase for the next one.
    ///
    /// Ephemeral buckets stay in `ReplicaOnly`; there is no active eviction
    /// for in-memory-only buckets.
    pub fn complete(&mut self) {
        if self.ejected > 0 || self.num_expired > 0 {
            debug!(
                ejected = self.ejected,
                expired = self.num_expired,
                "pager pass complete"
            );
        }
        if self.below_low_wat {
            return;
        }
        match self.phase.get() {
            PagerPhase::ReplicaOnly => {
                if !self.is_ephemeral {
                    self.phase.set(PagerPhase::ActiveAndPendingOnly);
                }
            }
            PagerPhase::ActiveAndPendingOnly => self.phase.set(PagerPhase::ReplicaOnly),
        }
    }

    fn visit_stored_value(&mut self, key: &DocKey, sv: &mut StoredValue) {
        // The pager never touches a prepare, completed or not; those are
        // purged by the tombstone purger.
        if sv.is_pending() || sv.is_completed() {
            return;
        }

        if self.collect_expired && sv.is_expired(self.start_time_secs) {
            self.expired.push(key.clone());
            return;
        }

        if self.percent <= 0.0 {
            return;
        }

        let mut observed_freq = sv.freq_counter();
        // The top 48 bits of the CAS are wall-clock; the shift discards the
        // logical bits, leaving the age in seconds.
        let age = self.max_cas.saturating_sub(sv.cas()) >> CAS_LOGICAL_BITS;

        let eligible = observed_freq <= self.freq_threshold
            && (observed_freq < self.config.item_eviction_freq_counter_age_threshold
                || age >= self.age_threshold);

        if eligible {
            if sv.is_resident() && !sv.is_deleted() {
                sv.page_out();
                self.ejected += 1;
                self.stats
                    .num_value_ejects
                    .fetch_add(1, Ordering::Relaxed);
            } else {
                // Not evictable; weight the histogram so the threshold still
                // removes the right share of evictable items.
                observed_freq = u8::MAX;
            }
        } else if sv.is_resident() && !sv.is_deleted() {
            // Too hot this time: decay so repeated visits can evict it.
            if observed_freq > 0 {
                sv.set_freq_counter(observed_freq - 1);
            }
        } else {
            observed_freq = u8::MAX;
        }

        self.item_eviction.add(observed_freq, age);

        if self.item_eviction.is_learning() || self.item_eviction.should_update() {
            let (freq, age) = self.item_eviction.thresholds(
                self.percent * 100.0,
                self.config.item_eviction_age_percentage,
            );
            self.freq_threshold = freq;
            self.age_threshold = age;
        }
    }

    fn adjust_percent(&mut self, probability: f64, state: VBucketState) {
        if matches!(state, VBucketState::Replica | VBucketState::Dead) {
            // Replica items carry a higher eviction probability.
            self.percent = (probability * (2.0 - self.active_bias)).min(0.9);
        } else {
            self.percent = probability * self.active_bias;
        }
    }

    fn delete_expired(&mut self, vb: &VBucket) {
        let expired = std::mem::take(&mut self.expired);
        if expired.is_empty() {
            return;
        }
        debug!(vbid = %vb.id(), count = expired.len(), "purging expired items");
        for key in expired {
            vb.checkpoint_manager().queue(
                Item::new_deletion(key.clone()),
                GenerateBySeqno::Yes,
                GenerateCas::Yes,
            );
            vb.hash_table().remove(&key);
            self.num_expired += 1;
            self.stats
                .num_expired_by_pager
                .fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Periodic task driving pager passes while memory is over the high
/// watermark.
pub struct ItemPagerTask {
    map: Arc<VBucketMap>,
    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    phase: Arc<SharedPagerPhase>,
    is_ephemeral: bool,
    period: Duration,
}

impl ItemPagerTask {
    /// Create a pager task.
    pub fn new(
        map: Arc<VBucketMap>,
        config: Arc<EngineConfig>,
        stats: Arc<EngineStats>,
        is_ephemeral: bool,
    ) -> Arc<Self> {
        Arc::new(ItemPagerTask {
            map,
            config,
            stats,
            phase: SharedPagerPhase::new(PagerPhase::ReplicaOnly),
            is_ephemeral,
            period: Duration::from_secs(1),
        })
    }

    /// The phase holder shared across passes.
    pub fn phase(&self) -> &Arc<SharedPagerPhase> {
        &self.phase
    }

    /// Run one pager pass over every vbucket. Returns values ejected.
    pub fn run_pass(&self) -> usize {
        let mut visitor = PagingVisitor::new(
            Arc::clone(&self.config),
            Arc::clone(&self.stats),
            Arc::clone(&self.phase),
            self.is_ephemeral,
        );
        let (active_ratio, replica_ratio) = self.resident_ratios();
        visitor.set_resident_ratios(active_ratio, replica_ratio);

        for vb in self.map.snapshot() {
            if visitor.pause_needed() {
                break;
            }
            visitor.visit_vbucket(&vb);
        }
        visitor.complete();
        visitor.num_ejected()
    }

    fn resident_ratios(&self) -> (f64, f64) {
        let mut active = (0.0, 0usize);
        let mut replica = (0.0, 0usize);
        for vb in self.map.snapshot() {
            let ratio = vb.hash_table().resident_ratio();
            match vb.state() {
                VBucketState::Active | VBucketState::Pending => {
                    active.0 += ratio;
                    active.1 += 1;
                }
                VBucketState::Replica => {
                    replica.0 += ratio;
                    replica.1 += 1;
                }
                VBucketState::Dead => {}
            }
        }
        let avg = |(sum, count): (f64, usize)| if count == 0 { 1.0 } else { sum / count as f64 };
        (avg(active), avg(replica))
    }
}

impl BackgroundTask for ItemPagerTask {
    fn label(&self) -> &'static str {
        "item-pager"
    }

    fn run(&self) -> RunDirective {
        if self.stats.mem_used() > self.config.mem_high_wat_bytes() {
            self.run_pass();
        }
        RunDirective::Snooze(self.period)
    }
}
