//! Items queued into checkpoints
//!
//! An [`Item`] is a single entry in a vbucket's in-memory write log: a
//! mutation, a phase of a durable (sync) write, or a checkpoint meta marker.
//! Items are handed around as [`QueuedItem`] (`Arc<Item>`) so that consumers
//! streaming a batch can keep them alive after the checkpoint that owned them
//! has been expelled or reclaimed.

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Shared handle to a queued item.
pub type QueuedItem = Arc<Item>;

/// Number of low CAS bits that carry logical (non wall-clock) state.
///
/// The top 48 bits of a CAS encode wall-clock seconds; shifting an age
/// difference right by this amount yields seconds.
pub const CAS_LOGICAL_BITS: u32 = 16;

/// Document key.
///
/// Keys compare and hash by raw bytes. Meta items (checkpoint markers) use
/// synthetic keys outside the client keyspace.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocKey(Box<[u8]>);

impl DocKey {
    /// Create a key from raw bytes.
    pub fn new(bytes: impl Into<Box<[u8]>>) -> Self {
        DocKey(bytes.into())
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Key length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if the key is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn meta(name: &str) -> Self {
        let mut bytes = Vec::with_capacity(name.len() + 1);
        // NUL prefix keeps meta keys disjoint from any client key.
        bytes.push(0u8);
        bytes.extend_from_slice(name.as_bytes());
        DocKey(bytes.into_boxed_slice())
    }
}

impl From<&str> for DocKey {
    fn from(s: &str) -> Self {
        DocKey::new(s.as_bytes().to_vec())
    }
}

impl fmt::Debug for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocKey({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for DocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// Kind of operation an item represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueOp {
    /// A committed write.
    Mutation,
    /// A committed delete.
    Deletion,
    /// The prepare phase of a sync write.
    PendingSyncWrite,
    /// The commit of a previously prepared sync write.
    CommitSyncWrite,
    /// The abort of a previously prepared sync write.
    AbortSyncWrite,
    /// Meta item marking the start of a checkpoint.
    CheckpointStart,
    /// Meta item marking the end of a checkpoint.
    CheckpointEnd,
    /// Meta item recording a vbucket state change.
    SetVbucketState,
}

impl QueueOp {
    /// True for checkpoint/state marker items that carry no document.
    #[inline]
    pub const fn is_meta(&self) -> bool {
        matches!(
            self,
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVbucketState
        )
    }

    /// True for any phase of a sync write.
    #[inline]
    pub const fn is_sync_write_phase(&self) -> bool {
        matches!(
            self,
            QueueOp::PendingSyncWrite | QueueOp::CommitSyncWrite | QueueOp::AbortSyncWrite
        )
    }

    /// The de-duplication namespace this operation lives in, if any.
    ///
    /// Prepares and aborts share a namespace (and a disk key); commits live
    /// with plain mutations. Meta items are never de-duplicated.
    pub const fn namespace(&self) -> Option<KeyNamespace> {
        match self {
            QueueOp::Mutation | QueueOp::Deletion | QueueOp::CommitSyncWrite => {
                Some(KeyNamespace::Committed)
            }
            QueueOp::PendingSyncWrite | QueueOp::AbortSyncWrite => Some(KeyNamespace::Prepared),
            QueueOp::CheckpointStart | QueueOp::CheckpointEnd | QueueOp::SetVbucketState => None,
        }
    }
}

/// De-duplication namespace for keys within a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyNamespace {
    /// Mutations, deletions and commits.
    Committed,
    /// Prepares and aborts.
    Prepared,
}

/// Durability level of a sync write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityLevel {
    /// A majority of the replication chain must hold the prepare in memory.
    Majority,
    /// Majority, and the active node must also have persisted the prepare.
    MajorityAndPersistOnMaster,
    /// A majority of the replication chain must have persisted the prepare.
    PersistToMajority,
}

impl DurabilityLevel {
    /// Whether this level requires the active node to persist locally.
    #[inline]
    pub const fn requires_local_persistence(&self) -> bool {
        matches!(
            self,
            DurabilityLevel::MajorityAndPersistOnMaster | DurabilityLevel::PersistToMajority
        )
    }
}

/// Durability requirements attached to a prepare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DurabilityRequirements {
    /// Required level.
    pub level: DurabilityLevel,
    /// Optional timeout after which the prepare is aborted as ambiguous.
    pub timeout: Option<Duration>,
}

impl DurabilityRequirements {
    /// Requirements at the given level with no timeout.
    pub const fn new(level: DurabilityLevel) -> Self {
        DurabilityRequirements {
            level,
            timeout: None,
        }
    }

    /// Requirements at the given level with a timeout.
    pub const fn with_timeout(level: DurabilityLevel, timeout: Duration) -> Self {
        DurabilityRequirements {
            level,
            timeout: Some(timeout),
        }
    }
}

/// A single entry in the in-memory write log.
///
/// `by_seqno` and `cas` are atomic because the checkpoint manager assigns
/// them at queue time, after the item has been wrapped in an `Arc`.
#[derive(Debug)]
pub struct Item {
    key: DocKey,
    value: Vec<u8>,
    cas: AtomicU64,
    by_seqno: AtomicI64,
    rev_seqno: u64,
    deleted: bool,
    datatype: u8,
    op: QueueOp,
    durability: Option<DurabilityRequirements>,
    freq_counter: u8,
}

/// Fixed per-item overhead used for checkpoint byte accounting.
const ITEM_OVERHEAD_BYTES: usize = 96;

impl Item {
    fn base(key: DocKey, value: Vec<u8>, op: QueueOp) -> Self {
        Item {
            key,
            value,
            cas: AtomicU64::new(0),
            by_seqno: AtomicI64::new(0),
            rev_seqno: 1,
            deleted: false,
            datatype: 0,
            op,
            durability: None,
            freq_counter: 0,
        }
    }

    /// Create a committed mutation.
    pub fn new_mutation(key: impl Into<DocKey>, value: impl Into<Vec<u8>>) -> QueuedItem {
        Arc::new(Item::base(key.into(), value.into(), QueueOp::Mutation))
    }

    /// Create a committed deletion.
    pub fn new_deletion(key: impl Into<DocKey>) -> QueuedItem {
        let mut item = Item::base(key.into(), Vec::new(), QueueOp::Deletion);
        item.deleted = true;
        Arc::new(item)
    }

    /// Create the prepare phase of a sync write.
    pub fn new_pending(
        key: impl Into<DocKey>,
        value: impl Into<Vec<u8>>,
        requirements: DurabilityRequirements,
    ) -> QueuedItem {
        let mut item = Item::base(key.into(), value.into(), QueueOp::PendingSyncWrite);
        item.durability = Some(requirements);
        Arc::new(item)
    }

    /// Create a commit item for a resolved prepare, carrying its value.
    pub fn new_commit(key: DocKey, value: Vec<u8>, deleted: bool) -> QueuedItem {
        let mut item = Item::base(key, value, QueueOp::CommitSyncWrite);
        item.deleted = deleted;
        Arc::new(item)
    }

    /// Create an abort item for a resolved prepare.
    pub fn new_abort(key: DocKey) -> QueuedItem {
        let mut item = Item::base(key, Vec::new(), QueueOp::AbortSyncWrite);
        item.deleted = true;
        Arc::new(item)
    }

    /// Create a checkpoint meta item.
    pub fn new_checkpoint_meta(op: QueueOp, checkpoint_id: u64, seqno: i64) -> QueuedItem {
        debug_assert!(op.is_meta());
        let name = match op {
            QueueOp::CheckpointStart => "checkpoint_start",
            QueueOp::CheckpointEnd => "checkpoint_end",
            QueueOp::SetVbucketState => "set_vbucket_state",
            _ => unreachable!("not a meta op"),
        };
        let item = Item::base(DocKey::meta(name), Vec::new(), op);
        item.by_seqno.store(seqno, Ordering::Relaxed);
        item.cas.store(checkpoint_id, Ordering::Relaxed);
        Arc::new(item)
    }

    /// Document key.
    pub fn key(&self) -> &DocKey {
        &self.key
    }

    /// Value bytes.
    pub fn value(&self) -> &[u8] {
        &self.value
    }

    /// CAS value.
    pub fn cas(&self) -> u64 {
        self.cas.load(Ordering::Acquire)
    }

    /// Set the CAS value (assigned at queue time).
    pub fn set_cas(&self, cas: u64) {
        self.cas.store(cas, Ordering::Release);
    }

    /// Sequence number, strictly increasing within a vbucket.
    pub fn by_seqno(&self) -> i64 {
        self.by_seqno.load(Ordering::Acquire)
    }

    /// Set the sequence number (assigned at queue time).
    pub fn set_by_seqno(&self, seqno: i64) {
        self.by_seqno.store(seqno, Ordering::Release);
    }

    /// Revision sequence number.
    pub fn rev_seqno(&self) -> u64 {
        self.rev_seqno
    }

    /// True if this item is a delete (explicit, or an abort tombstone).
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Datatype bits.
    pub fn datatype(&self) -> u8 {
        self.datatype
    }

    /// Operation kind.
    pub fn op(&self) -> QueueOp {
        self.op
    }

    /// True for checkpoint/state marker items.
    pub fn is_meta(&self) -> bool {
        self.op.is_meta()
    }

    /// Durability requirements, present on prepares.
    pub fn durability(&self) -> Option<DurabilityRequirements> {
        self.durability
    }

    /// Frequency counter snapshot taken when the item was created.
    pub fn freq_counter(&self) -> u8 {
        self.freq_counter
    }

    /// Approximate memory footprint, used for checkpoint accounting.
    pub fn size_in_bytes(&self) -> usize {
        ITEM_OVERHEAD_BYTES + self.key.len() + self.value.len()
    }
}

/// Hybrid logical clock for CAS generation.
///
/// The top 48 bits carry wall-clock seconds; the low 16 bits are a logical
/// counter that keeps the CAS strictly monotonic when several writes land in
/// the same second.
#[derive(Debug, Default)]
pub struct HybridClock {
    last: AtomicU64,
}

impl HybridClock {
    /// Create a clock starting from zero.
    pub fn new() -> Self {
        HybridClock::default()
    }

    /// Produce the next CAS, strictly greater than all previous ones.
    pub fn next_cas(&self) -> u64 {
        let wall = wall_clock_cas();
        let prev = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if wall > last { wall } else { last + 1 })
            })
            .unwrap_or_else(|observed| observed);
        if wall > prev {
            wall
        } else {
            prev + 1
        }
    }

    /// Highest CAS issued or observed so far.
    pub fn max_cas(&self) -> u64 {
        self.last.load(Ordering::Acquire)
    }

    /// Fold an externally observed CAS into the clock.
    pub fn observe(&self, cas: u64) {
        self.last.fetch_max(cas, Ordering::AcqRel);
    }
}

fn wall_clock_cas() -> u64 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs << CAS_LOGICAL_BITS
}
