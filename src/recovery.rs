//! Memory recovery: expel checkpoint items and drop slow cursors when the
//! bucket breaches its memory watermarks.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bucket::VBucketMap;
use crate::config::EngineConfig;
use crate::stats::EngineStats;
use crate::task::{BackgroundTask, RunDirective};
use crate::Vbid;

/// Wall-clock budget for one recovery pass; leftover work is picked up by
/// the next run.
const MAX_PASS_DURATION: Duration = Duration::from_millis(50);

/// Replication-layer hook used when a cursor is about to be dropped.
pub trait StreamNotifier: Send + Sync {
    /// Ask the stream feeding from `cursor` to switch to disk backfill.
    /// Returns `true` when the transition was accepted and the cursor may
    /// be removed.
    fn handle_slow_stream(&self, vbid: Vbid, cursor: &str) -> bool;

    /// Called after a pass that recovered memory, so paused backfills can
    /// resume.
    fn memory_recovered(&self) {}
}

/// Accepts every slow-stream request; used when no replication layer is
/// attached.
#[derive(Debug, Default)]
pub struct NullStreamNotifier;

impl StreamNotifier for NullStreamNotifier {
    fn handle_slow_stream(&self, _vbid: Vbid, _cursor: &str) -> bool {
        true
    }
}

/// Why recovery was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    CheckpointMemory,
    TotalMemory,
}

/// Periodic task that recovers checkpoint memory.
///
/// Each pass evaluates the watermarks, then applies two strategies in order:
/// expelling cursor-passed items (when enabled), and dropping the slowest
/// non-persistence cursors so their checkpoints become reclaimable.
pub struct CheckpointMemRecoveryTask {
    map: Arc<VBucketMap>,
    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    notifier: Arc<dyn StreamNotifier>,
    period: Duration,
}

impl CheckpointMemRecoveryTask {
    /// Create a recovery task.
    pub fn new(
        map: Arc<VBucketMap>,
        config: Arc<EngineConfig>,
        stats: Arc<EngineStats>,
        notifier: Arc<dyn StreamNotifier>,
    ) -> Arc<Self> {
        Arc::new(CheckpointMemRecoveryTask {
            map,
            config,
            stats,
            notifier,
            period: Duration::from_secs(1),
        })
    }

    /// Decide whether recovery is needed and how many bytes to clear.
    fn reduction_needed(&self) -> Option<(Trigger, u64)> {
        let mem_used = self.stats.mem_used();
        let checkpoint_mem = self.map.total_checkpoint_memory() as u64;
        let to_mb = |bytes: u64| bytes / (1024 * 1024);

        let above_low_wat = mem_used >= self.config.mem_low_wat_bytes();
        let hit_checkpoint_mark =
            above_low_wat && checkpoint_mem >= self.config.checkpoint_mem_upper_bytes();
        let hit_upper_mark = mem_used > self.config.cursor_dropping_upper_bytes();

        if hit_checkpoint_mark {
            let amount = mem_used.saturating_sub(self.config.checkpoint_mem_lower_bytes());
            info!(
                checkpoint_mem_mb = to_mb(checkpoint_mem),
                upper_mark = self.config.cursor_dropping_checkpoint_mem_upper_mark,
                target_mb = to_mb(amount),
                "triggering memory recovery: checkpoint memory over mark"
            );
            return Some((Trigger::CheckpointMemory, amount));
        }
        if hit_upper_mark {
            let amount = mem_used.saturating_sub(self.config.cursor_dropping_lower_bytes());
            info!(
                mem_used_mb = to_mb(mem_used),
                upper_mark = self.config.cursor_dropping_upper_mark,
                target_mb = to_mb(amount),
                "triggering memory recovery: mem_used over cursor-dropping mark"
            );
            return Some((Trigger::TotalMemory, amount));
        }
        None
    }

    fn attempt_expel(&self, target: u64, deadline: Instant) -> u64 {
        let mut cleared = 0u64;
        for vb in self.map.by_checkpoint_memory_desc() {
            if cleared >= target || Instant::now() >= deadline {
                break;
            }
            let result = vb.checkpoint_manager().expel_unreferenced_items();
            if result.count > 0 {
                debug!(
                    vbid = %vb.id(),
                    count = result.count,
                    bytes = result.estimated_bytes,
                    "expelled unreferenced checkpoint items"
                );
            }
            cleared += result.estimated_bytes as u64;
        }
        cleared
    }

    fn attempt_cursor_drop(&self, target: u64, deadline: Instant) -> u64 {
        let mut cleared = 0u64;
        'vbuckets: for vb in self.map.by_checkpoint_memory_desc() {
            if Instant::now() >= deadline {
                break;
            }
            let manager = vb.checkpoint_manager();
            for cursor in manager.cursors_eligible_for_drop() {
                if cleared >= target {
                    break 'vbuckets;
                }
                if !self.notifier.handle_slow_stream(vb.id(), &cursor) {
                    continue;
                }
                if manager.remove_cursor(&cursor) {
                    let freed = manager.unref_checkpoint_memory() as u64;
                    self.stats.record_cursor_dropped(freed);
                    cleared += freed;
                    info!(vbid = %vb.id(), cursor, freed, "dropped slow cursor");
                }
            }
            // Reclaim whatever the dropped cursors were pinning.
            manager.remove_closed_unref_checkpoints(usize::MAX);
        }
        cleared
    }

    /// Run one bounded recovery pass. Returns the bytes recovered.
    pub fn run_once(&self) -> u64 {
        let (_trigger, target) = match self.reduction_needed() {
            Some(decision) => decision,
            None => return 0,
        };
        let deadline = Instant::now() + MAX_PASS_DURATION;

        let mut recovered = 0u64;
        if self.config.chk_expel_enabled {
            recovered = self.attempt_expel(target, deadline);
        }
        if recovered < target {
            recovered += self.attempt_cursor_drop(target - recovered, deadline);
        }

        // Closed-unreferenced reclaim runs even when the strategies above
        // already met the target: it is what actually frees the memory the
        // dropped cursors were holding open.
        for vb in self.map.snapshot() {
            if Instant::now() >= deadline {
                break;
            }
            vb.checkpoint_manager()
                .remove_closed_unref_checkpoints(usize::MAX);
        }

        if recovered > 0 {
            self.notifier.memory_recovered();
        }
        recovered
    }
}

impl BackgroundTask for CheckpointMemRecoveryTask {
    fn label(&self) -> &'static str {
        "checkpoint-mem-recovery"
    }

    fn run(&self) -> RunDirective {
        self.run_once();
        RunDirective::Snooze(self.period)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::PERSISTENCE_CURSOR_NAME;
    use crate::durability::ReplicationTopology;
    use crate::item::Item;
    use crate::vbucket::{VBucket, VBucketState};
    use parking_lot::Mutex;

    struct RecordingNotifier {
        slow_streams: Mutex<Vec<(Vbid, String)>>,
    }

    impl RecordingNotifier {
        fn new() -> Arc<Self> {
            Arc::new(RecordingNotifier {
                slow_streams: Mutex::new(Vec::new()),
            })
        }
    }

    impl StreamNotifier for RecordingNotifier {
        fn handle_slow_stream(&self, vbid: Vbid, cursor: &str) -> bool {
            self.slow_streams.lock().push((vbid, cursor.to_string()));
            true
        }
    }

    fn small_quota_config() -> EngineConfig {
        EngineConfig {
            // Tiny quota so a handful of items breaches the marks.
            max_size: 4096,
            chk_max_items: 4,
            ..EngineConfig::default()
        }
    }

    fn setup() -> (Arc<VBucketMap>, Arc<VBucket>, Arc<EngineConfig>, Arc<EngineStats>) {
        let config = Arc::new(small_quota_config());
        let stats = Arc::new(EngineStats::new());
        let vb = VBucket::new(
            Vbid(0),
            VBucketState::Active,
            Arc::clone(&config),
            Arc::clone(&stats),
            ReplicationTopology::new(["active", "replica"]),
            true,
        );
        let map = Arc::new(VBucketMap::new(4));
        map.set(Vbid(0), Arc::clone(&vb));
        (map, vb, config, stats)
    }

    #[test]
    fn test_no_recovery_below_watermarks() {
        let (map, vb, config, stats) = setup();
        vb.set(Item::new_mutation("k", b"v".to_vec()));
        let task =
            CheckpointMemRecoveryTask::new(map, config, stats, Arc::new(NullStreamNotifier));
        assert_eq!(task.run_once(), 0);
    }

    #[test]
    fn test_recovery_drops_lagging_cursor_not_persistence() {
        let (map, vb, config, stats) = setup();
        let manager = vb.checkpoint_manager();
        manager.register_cursor("replication:slow", 0).unwrap();

        // Fill several checkpoints; drain persistence but leave the
        // replication cursor at the front.
        for i in 0..12 {
            vb.set(Item::new_mutation(
                format!("key-{i}").as_str(),
                vec![0u8; 256],
            ));
        }
        let _ = manager
            .items_for_cursor(PERSISTENCE_CURSOR_NAME, usize::MAX)
            .unwrap();
        assert!(stats.mem_used() > config.cursor_dropping_upper_bytes());

        let notifier = RecordingNotifier::new();
        let task = CheckpointMemRecoveryTask::new(
            map,
            config,
            stats,
            Arc::clone(&notifier) as Arc<dyn StreamNotifier>,
        );
        let recovered = task.run_once();
        assert!(recovered > 0);

        // The lagging cursor was dropped and its stream notified.
        let notified = notifier.slow_streams.lock();
        assert_eq!(notified.len(), 1);
        assert_eq!(notified[0].1, "replication:slow");
        assert!(!manager.has_cursor("replication:slow"));
        assert!(manager.has_cursor(PERSISTENCE_CURSOR_NAME));

        // The checkpoints the cursor pinned are gone.
        assert_eq!(manager.num_checkpoints(), 1);
    }

    #[test]
    fn test_expel_runs_before_cursor_drop() {
        let (map, vb, config, stats) = setup();
        let manager = vb.checkpoint_manager();
        // All cursors at the tail: expelling alone can recover memory.
        for i in 0..12 {
            vb.set(Item::new_mutation(
                format!("key-{i}").as_str(),
                vec![0u8; 256],
            ));
        }
        let _ = manager
            .items_for_cursor(PERSISTENCE_CURSOR_NAME, usize::MAX)
            .unwrap();

        let notifier = RecordingNotifier::new();
        let task = CheckpointMemRecoveryTask::new(
            map,
            config,
            stats,
            Arc::clone(&notifier) as Arc<dyn StreamNotifier>,
        );
        let recovered = task.run_once();
        assert!(recovered > 0);
        // No cursor had to be dropped.
        assert!(notifier.slow_streams.lock().is_empty());
    }

    #[test]
    fn test_expel_disabled_falls_through_to_cursor_drop() {
        let (map, vb, _config, stats) = setup();
        let config = Arc::new(EngineConfig {
            chk_expel_enabled: false,
            ..small_quota_config()
        });
        let manager = vb.checkpoint_manager();
        manager.register_cursor("replication:slow", 0).unwrap();
        for i in 0..12 {
            vb.set(Item::new_mutation(
                format!("key-{i}").as_str(),
                vec![0u8; 256],
            ));
        }
        let _ = manager
            .items_for_cursor(PERSISTENCE_CURSOR_NAME, usize::MAX)
            .unwrap();

        let notifier = RecordingNotifier::new();
        let task = CheckpointMemRecoveryTask::new(
            map,
            config,
            stats,
            Arc::clone(&notifier) as Arc<dyn StreamNotifier>,
        );
        task.run_once();
        assert_eq!(notifier.slow_streams.lock().len(), 1);
    }
}
