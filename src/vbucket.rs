//! A vbucket: one partition of the keyspace.
//!
//! Ties together the checkpoint manager, the durability monitor and the
//! hash table, and routes client writes to them.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::checkpoint::{CheckpointManager, GenerateBySeqno, GenerateCas};
use crate::config::EngineConfig;
use crate::durability::{DurabilityMonitor, Resolution, ReplicationTopology, SyncWriteCookie};
use crate::hash_table::HashTable;
use crate::item::{DocKey, HybridClock, Item, QueueOp, QueuedItem};
use crate::stats::EngineStats;
use crate::status::Status;
use crate::Vbid;

/// Replication state of a vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VBucketState {
    /// Owns the keyspace partition; accepts client writes.
    Active,
    /// Receives a replication stream from the active.
    Replica,
    /// Transitioning towards active (takeover).
    Pending,
    /// Not in use.
    Dead,
}

/// One partition of the keyspace.
#[derive(Debug)]
pub struct VBucket {
    id: Vbid,
    state: RwLock<VBucketState>,
    checkpoint_manager: CheckpointManager,
    durability_monitor: DurabilityMonitor,
    hash_table: HashTable,
    clock: Arc<HybridClock>,
}

impl VBucket {
    /// Create a vbucket in the given state.
    pub fn new(
        id: Vbid,
        state: VBucketState,
        config: Arc<EngineConfig>,
        stats: Arc<EngineStats>,
        topology: ReplicationTopology,
        persistent: bool,
    ) -> Arc<Self> {
        let clock = Arc::new(HybridClock::new());
        let checkpoint_manager = CheckpointManager::new(
            id,
            Arc::clone(&config),
            Arc::clone(&stats),
            Arc::clone(&clock),
            0,
            0,
            0,
        );
        let durability_monitor =
            DurabilityMonitor::new(id, Arc::clone(&stats), topology, persistent)
                .with_default_timeout(config.sync_write_timeout);
        Arc::new(VBucket {
            id,
            state: RwLock::new(state),
            checkpoint_manager,
            durability_monitor,
            hash_table: HashTable::new(stats),
            clock,
        })
    }

    /// Vbucket id.
    pub fn id(&self) -> Vbid {
        self.id
    }

    /// Current replication state.
    pub fn state(&self) -> VBucketState {
        *self.state.read()
    }

    /// Change the replication state.
    ///
    /// Leaving `Active` notifies every waiting sync-write client once with
    /// `SyncWriteAmbiguous`; the tracked prepares stay for the next active
    /// to reconcile. The state change itself is queued for persistence.
    pub fn set_state(&self, new_state: VBucketState) {
        let old_state = {
            let mut state = self.state.write();
            let old = *state;
            *state = new_state;
            old
        };
        if old_state == new_state {
            return;
        }
        info!(vbid = %self.id, ?old_state, ?new_state, "vbucket state change");
        if old_state == VBucketState::Active {
            self.durability_monitor.abort_all_client_waits();
        }
        self.checkpoint_manager.queue_set_vbucket_state();
    }

    /// Apply a client write.
    ///
    /// Plain mutations and deletions return `Success`; prepares return
    /// `WouldBlock` and complete asynchronously via the cookie.
    pub fn set(&self, item: QueuedItem) -> Status {
        self.set_with_cookie(item, None)
    }

    /// Apply a client write with a cookie for async sync-write notification.
    pub fn set_with_cookie(
        &self,
        item: QueuedItem,
        cookie: Option<Arc<SyncWriteCookie>>,
    ) -> Status {
        if self.state() != VBucketState::Active {
            return Status::NotMyVbucket;
        }
        if self.checkpoint_manager.is_poisoned() {
            return Status::Internal;
        }
        match item.op() {
            QueueOp::Mutation | QueueOp::Deletion => {
                self.checkpoint_manager
                    .queue(item.clone(), GenerateBySeqno::Yes, GenerateCas::Yes);
                self.hash_table.upsert_committed(&item);
                Status::Success
            }
            QueueOp::PendingSyncWrite => self.sync_write(item, cookie),
            _ => Status::InvalidArgument,
        }
    }

    fn sync_write(&self, item: QueuedItem, cookie: Option<Arc<SyncWriteCookie>>) -> Status {
        let level = match item.durability() {
            Some(reqs) => reqs.level,
            None => return Status::InvalidArgument,
        };
        // Reject impossible requirements before anything is queued.
        if let Err(status) = self.durability_monitor.validate_requirements(level) {
            return status;
        }
        self.checkpoint_manager
            .queue(item.clone(), GenerateBySeqno::Yes, GenerateCas::Yes);
        if let Err(status) = self.durability_monitor.add_prepare(item.clone(), cookie) {
            return status;
        }
        self.hash_table.upsert_pending(&item);
        Status::WouldBlock
    }

    /// Explicitly abort the in-flight prepare for `key`.
    pub fn abort(&self, key: &DocKey) -> Status {
        match self.durability_monitor.abort_prepare(key) {
            Ok(_prepare) => {
                let abort = Item::new_abort(key.clone());
                self.checkpoint_manager
                    .queue(abort, GenerateBySeqno::Yes, GenerateCas::Yes);
                self.hash_table.abort(key);
                Status::Success
            }
            Err(status) => status,
        }
    }

    /// Record a replica's durability acknowledgement.
    ///
    /// Returns `true` when prepares became resolved and the completion task
    /// should be notified.
    pub fn seqno_acknowledged(&self, replica: &str, seqno: u64) -> bool {
        self.durability_monitor.seqno_acknowledged(replica, seqno)
    }

    /// Record local persistence progress from the flusher.
    pub fn notify_local_persistence(&self, seqno: u64) -> bool {
        self.durability_monitor.notify_local_persistence(seqno)
    }

    /// Install a new replication topology.
    pub fn set_topology(&self, topology: ReplicationTopology) {
        self.durability_monitor.set_topology(topology);
    }

    /// Sweep timed-out prepares. Returns `true` when any were aborted.
    pub fn process_timeouts(&self, now: std::time::Instant) -> bool {
        self.durability_monitor.process_timeouts(now)
    }

    /// Drain resolved sync writes into the checkpoint manager.
    ///
    /// Commits and aborts are queued as items, the hash table is updated,
    /// and waiting clients are notified with the final outcome. Returns the
    /// number of sync writes completed.
    pub fn process_resolved_sync_writes(&self) -> usize {
        self.durability_monitor.drain_resolved(|resolved| {
            let key = resolved.prepare.key().clone();
            match resolved.resolution {
                Resolution::Commit => {
                    let commit = Item::new_commit(
                        key,
                        resolved.prepare.value().to_vec(),
                        resolved.prepare.is_deleted(),
                    );
                    self.checkpoint_manager.queue(
                        commit.clone(),
                        GenerateBySeqno::Yes,
                        GenerateCas::Yes,
                    );
                    self.hash_table.commit(&commit);
                    if let Some(cookie) = &resolved.cookie {
                        cookie.notify(Status::Success);
                    }
                }
                Resolution::Abort => {
                    let abort = Item::new_abort(key.clone());
                    self.checkpoint_manager
                        .queue(abort, GenerateBySeqno::Yes, GenerateCas::Yes);
                    self.hash_table.abort(&key);
                    if let Some(cookie) = &resolved.cookie {
                        cookie.notify(Status::SyncWriteAmbiguous);
                    }
                }
            }
        })
    }

    /// The vbucket's checkpoint manager.
    pub fn checkpoint_manager(&self) -> &CheckpointManager {
        &self.checkpoint_manager
    }

    /// The vbucket's durability monitor.
    pub fn durability_monitor(&self) -> &DurabilityMonitor {
        &self.durability_monitor
    }

    /// The vbucket's hash table.
    pub fn hash_table(&self) -> &HashTable {
        &self.hash_table
    }

    /// Highest CAS issued in this vbucket.
    pub fn max_cas(&self) -> u64 {
        self.clock.max_cas()
    }
}
