//! Flushing: draining the persistence cursor into a storage back-end.
//!
//! The flusher de-duplicates each batch on disk-level keys before applying
//! it: prepares and aborts share a disk key (distinguished from committed
//! documents by a prepared-namespace flag), so a prepare followed by its
//! abort within one batch leaves only the abort, and multiple prepares leave
//! only the latest.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::checkpoint::PERSISTENCE_CURSOR_NAME;
use crate::item::{DocKey, KeyNamespace, QueueOp, QueuedItem};
use crate::stats::EngineStats;
use crate::status::Status;
use crate::vbucket::{VBucket, VBucketState};
use crate::Vbid;

/// Default item budget for one flush batch.
const FLUSH_BATCH_LIMIT: usize = 10_000;

/// Disk-level key: the document key plus the namespace flag that keeps
/// prepares separate from committed documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DiskDocKey {
    /// Document key.
    pub key: DocKey,
    /// True for prepare/abort entries.
    pub prepared: bool,
}

impl DiskDocKey {
    fn for_item(item: &QueuedItem) -> Option<Self> {
        let prepared = match item.op().namespace()? {
            KeyNamespace::Prepared => true,
            KeyNamespace::Committed => false,
        };
        Some(DiskDocKey {
            key: item.key().clone(),
            prepared,
        })
    }
}

/// Kind of a persisted document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistedKind {
    /// A committed document (mutation, deletion or commit).
    Committed,
    /// A prepare awaiting resolution.
    Prepare,
    /// An abort tombstone.
    Abort,
}

/// A document as written to the store.
#[derive(Debug, Clone)]
pub struct PersistedDoc {
    /// Value bytes.
    pub value: Vec<u8>,
    /// Sequence number.
    pub by_seqno: i64,
    /// CAS stamp.
    pub cas: u64,
    /// Deletion flag (always set for aborts).
    pub deleted: bool,
    /// What this entry is.
    pub kind: PersistedKind,
}

impl PersistedDoc {
    fn from_item(item: &QueuedItem) -> Self {
        let kind = match item.op() {
            QueueOp::PendingSyncWrite => PersistedKind::Prepare,
            QueueOp::AbortSyncWrite => PersistedKind::Abort,
            _ => PersistedKind::Committed,
        };
        PersistedDoc {
            value: item.value().to_vec(),
            by_seqno: item.by_seqno(),
            cas: item.cas(),
            deleted: item.is_deleted(),
            kind,
        }
    }

    /// True for prepare entries.
    pub fn is_prepare(&self) -> bool {
        self.kind == PersistedKind::Prepare
    }

    /// True for abort tombstones.
    pub fn is_abort(&self) -> bool {
        self.kind == PersistedKind::Abort
    }
}

/// Capability interface over storage back-ends.
pub trait KVStore: Send + Sync {
    /// Write (or replace) a document.
    fn set(&self, vbid: Vbid, key: DiskDocKey, doc: PersistedDoc);

    /// Read a document back.
    fn get(&self, vbid: Vbid, key: &DiskDocKey) -> Option<PersistedDoc>;

    /// Persist the vbucket state.
    fn set_vbucket_state(&self, vbid: Vbid, state: VBucketState);

    /// Number of documents stored for a vbucket.
    fn num_docs(&self, vbid: Vbid) -> usize;
}

/// In-memory store used for testing and ephemeral setups.
#[derive(Default)]
pub struct MemoryKVStore {
    docs: Mutex<HashMap<(u16, DiskDocKey), PersistedDoc>>,
    states: Mutex<HashMap<u16, VBucketState>>,
}

impl MemoryKVStore {
    /// Create an empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryKVStore::default())
    }

    /// Last persisted state for a vbucket.
    pub fn vbucket_state(&self, vbid: Vbid) -> Option<VBucketState> {
        self.states.lock().get(&vbid.0).copied()
    }
}

impl KVStore for MemoryKVStore {
    fn set(&self, vbid: Vbid, key: DiskDocKey, doc: PersistedDoc) {
        self.docs.lock().insert((vbid.0, key), doc);
    }

    fn get(&self, vbid: Vbid, key: &DiskDocKey) -> Option<PersistedDoc> {
        self.docs.lock().get(&(vbid.0, key.clone())).cloned()
    }

    fn set_vbucket_state(&self, vbid: Vbid, state: VBucketState) {
        self.states.lock().insert(vbid.0, state);
    }

    fn num_docs(&self, vbid: Vbid) -> usize {
        self.docs.lock().keys().filter(|(v, _)| *v == vbid.0).count()
    }
}

/// Result of flushing one vbucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlushResult {
    /// Items drained from the persistence cursor (before disk dedup).
    pub items_flushed: usize,
    /// True when the cursor has more items waiting.
    pub more_available: bool,
    /// True when the persistence notification resolved sync writes.
    pub resolved_sync_writes: bool,
}

/// Drains persistence cursors into a [`KVStore`].
pub struct Flusher {
    store: Arc<dyn KVStore>,
    stats: Arc<EngineStats>,
}

impl Flusher {
    /// Create a flusher over the given store.
    pub fn new(store: Arc<dyn KVStore>, stats: Arc<EngineStats>) -> Self {
        Flusher { store, stats }
    }

    /// Flush one batch of a vbucket's persistence backlog.
    pub fn flush_vbucket(&self, vb: &VBucket) -> Result<FlushResult, Status> {
        let manager = vb.checkpoint_manager();
        let batch = manager.items_for_cursor(PERSISTENCE_CURSOR_NAME, FLUSH_BATCH_LIMIT)?;

        let mut dedup: HashMap<DiskDocKey, QueuedItem> = HashMap::new();
        let mut drained = 0usize;
        let mut high_seqno = 0i64;

        for item in &batch.items {
            match item.op() {
                // Checkpoint markers borrow the next seqno; they must not
                // advance the persistence notification.
                QueueOp::CheckpointStart | QueueOp::CheckpointEnd => {}
                QueueOp::SetVbucketState => {
                    self.store.set_vbucket_state(vb.id(), vb.state());
                    high_seqno = high_seqno.max(item.by_seqno());
                    drained += 1;
                }
                _ => {
                    high_seqno = high_seqno.max(item.by_seqno());
                    drained += 1;
                    let key = match DiskDocKey::for_item(item) {
                        Some(key) => key,
                        None => continue,
                    };
                    // Highest seqno for a disk key wins the batch.
                    match dedup.get(&key) {
                        Some(existing) if existing.by_seqno() >= item.by_seqno() => {}
                        _ => {
                            dedup.insert(key, Arc::clone(item));
                        }
                    }
                }
            }
        }

        for (key, item) in dedup {
            self.store.set(vb.id(), key, PersistedDoc::from_item(&item));
        }

        if drained > 0 {
            self.stats.disk_queue_drained(drained as u64);
            debug!(vbid = %vb.id(), drained, high_seqno, "flushed vbucket batch");
        }

        let resolved = if high_seqno > 0 {
            vb.notify_local_persistence(high_seqno as u64)
        } else {
            false
        };

        Ok(FlushResult {
            items_flushed: drained,
            more_available: batch.more_available,
            resolved_sync_writes: resolved,
        })
    }

    /// Flush a vbucket until its persistence backlog is empty.
    pub fn flush_vbucket_to_empty(&self, vb: &VBucket) -> Result<FlushResult, Status> {
        let mut total = FlushResult::default();
        loop {
            let result = self.flush_vbucket(vb)?;
            total.items_flushed += result.items_flushed;
            total.resolved_sync_writes |= result.resolved_sync_writes;
            if !result.more_available {
                total.more_available = false;
                return Ok(total);
            }
        }
    }
}
