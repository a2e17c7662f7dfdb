//! Background decay of saturated frequency counters.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::bucket::VBucketMap;
use crate::config::EngineConfig;
use crate::task::{BackgroundTask, RunDirective};

/// Scales frequency counters down once any counter saturates.
///
/// Without decay every long-lived item eventually pins its counter at the
/// ceiling and the pager loses the ability to tell hot from cold.
pub struct ItemFreqDecayerTask {
    map: Arc<VBucketMap>,
    config: Arc<EngineConfig>,
    period: Duration,
}

impl ItemFreqDecayerTask {
    /// Create a decayer task.
    pub fn new(map: Arc<VBucketMap>, config: Arc<EngineConfig>) -> Arc<Self> {
        Arc::new(ItemFreqDecayerTask {
            map,
            config,
            period: Duration::from_secs(10),
        })
    }

    /// Decay every vbucket whose table holds a saturated counter.
    ///
    /// Returns the number of vbuckets decayed.
    pub fn run_once(&self) -> usize {
        let percent = self.config.item_freq_decayer_percent;
        let mut decayed = 0;
        for vb in self.map.snapshot() {
            let table = vb.hash_table();
            if table.has_saturated_freq_counter() {
                let touched = table.decay_freq_counters(percent);
                debug!(vbid = %vb.id(), touched, percent, "decayed frequency counters");
                decayed += 1;
            }
        }
        decayed
    }
}

impl BackgroundTask for ItemFreqDecayerTask {
    fn label(&self) -> &'static str {
        "item-freq-decayer"
    }

    fn run(&self) -> RunDirective {
        self.run_once();
        RunDirective::Snooze(self.period)
    }
}
