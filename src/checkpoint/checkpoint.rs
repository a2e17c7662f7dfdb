//! A single checkpoint: one bounded segment of the in-memory write log.

use std::collections::HashMap;
use std::time::Instant;

use crate::item::{DocKey, KeyNamespace, QueuedItem};

/// Lifecycle state of a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointState {
    /// Accepting new items; only the last checkpoint in the list is open.
    Open,
    /// Sealed; will be reclaimed once no cursor references it.
    Closed,
}

/// Origin of a checkpoint's snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckpointKind {
    /// Built from in-memory mutations.
    #[default]
    Memory,
    /// Received by a replica as a disk snapshot.
    Disk,
}

/// An ordered segment of queued items with an intra-checkpoint key index.
///
/// Items live in a slot vector; de-duplication and expelling tombstone slots
/// (`None`) instead of shifting, so cursor offsets into the checkpoint stay
/// valid for its whole lifetime.
#[derive(Debug)]
pub struct Checkpoint {
    id: u64,
    state: CheckpointState,
    kind: CheckpointKind,
    snap_start: u64,
    snap_end: u64,
    high_completed_seqno: Option<u64>,
    created_at: Instant,
    slots: Vec<Option<QueuedItem>>,
    key_index: HashMap<(KeyNamespace, DocKey), usize>,
    num_non_meta_items: usize,
    mem_bytes: usize,
    max_deleted_rev_seqno: Option<u64>,
}

impl Checkpoint {
    /// Create a new open checkpoint.
    pub fn new(
        id: u64,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        kind: CheckpointKind,
    ) -> Self {
        Checkpoint {
            id,
            state: CheckpointState::Open,
            kind,
            snap_start,
            snap_end,
            high_completed_seqno,
            created_at: Instant::now(),
            slots: Vec::new(),
            key_index: HashMap::new(),
            num_non_meta_items: 0,
            mem_bytes: 0,
            max_deleted_rev_seqno: None,
        }
    }

    /// Checkpoint id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> CheckpointState {
        self.state
    }

    /// True while the checkpoint accepts new items.
    pub fn is_open(&self) -> bool {
        self.state == CheckpointState::Open
    }

    /// Seal the checkpoint.
    pub fn close(&mut self) {
        self.state = CheckpointState::Closed;
    }

    /// Memory/Disk origin.
    pub fn kind(&self) -> CheckpointKind {
        self.kind
    }

    /// Snapshot start seqno.
    pub fn snap_start(&self) -> u64 {
        self.snap_start
    }

    /// Snapshot end seqno.
    pub fn snap_end(&self) -> u64 {
        self.snap_end
    }

    /// High completed seqno carried by Disk checkpoints.
    pub fn high_completed_seqno(&self) -> Option<u64> {
        self.high_completed_seqno
    }

    /// Replace the snapshot boundaries (empty open checkpoint reuse).
    pub fn reset_snapshot(
        &mut self,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        kind: CheckpointKind,
    ) {
        self.snap_start = snap_start;
        self.snap_end = snap_end;
        self.high_completed_seqno = high_completed_seqno;
        self.kind = kind;
    }

    /// Extend the snapshot end to cover a newly queued seqno.
    pub fn extend_snapshot(&mut self, seqno: u64) {
        if seqno > self.snap_end {
            self.snap_end = seqno;
        }
    }

    /// Overwrite the snapshot end (replica snapshot-marker update).
    pub fn set_snap_end(&mut self, snap_end: u64) {
        self.snap_end = snap_end;
    }

    /// Age of the checkpoint since creation.
    pub fn age(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }

    /// Number of slots, including tombstoned ones.
    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    /// Number of live non-meta items.
    pub fn num_non_meta_items(&self) -> usize {
        self.num_non_meta_items
    }

    /// Number of live items including meta items.
    pub fn num_live_items(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Approximate memory held by live items.
    pub fn mem_bytes(&self) -> usize {
        self.mem_bytes
    }

    /// Highest `rev_seqno` seen on a deleted item in this checkpoint.
    pub fn max_deleted_rev_seqno(&self) -> Option<u64> {
        self.max_deleted_rev_seqno
    }

    /// Item at a slot, if still live.
    pub fn get(&self, slot: usize) -> Option<&QueuedItem> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    /// First live slot at or after `from`.
    pub fn next_occupied(&self, from: usize) -> Option<usize> {
        (from..self.slots.len()).find(|&i| self.slots[i].is_some())
    }

    /// Slot holding the live item for `(namespace, key)`, if any.
    pub fn lookup(&self, namespace: KeyNamespace, key: &DocKey) -> Option<usize> {
        self.key_index.get(&(namespace, key.clone())).copied()
    }

    /// Append an item, indexing it when it belongs to a dedup namespace.
    ///
    /// Returns the slot the item landed in.
    pub fn push(&mut self, item: QueuedItem) -> usize {
        let slot = self.slots.len();
        self.account_add(&item);
        if let Some(ns) = item.op().namespace() {
            self.key_index.insert((ns, item.key().clone()), slot);
        }
        self.slots.push(Some(item));
        slot
    }

    /// Replace a previously queued item with a new write for the same key.
    ///
    /// The old slot is tombstoned and the new item appended at the tail, so
    /// cursors that already passed the old slot pick the new item up later
    /// and cursors before it skip the tombstone.
    pub fn replace(&mut self, old_slot: usize, item: QueuedItem) -> usize {
        if let Some(old) = self.slots.get_mut(old_slot).and_then(Option::take) {
            self.account_remove(&old);
        }
        self.push(item)
    }

    /// Tombstone every live slot strictly before `before_slot`, keeping
    /// slot 0 (the checkpoint-start marker).
    ///
    /// Returns `(live items removed, estimated bytes freed)`.
    pub fn expel_before(&mut self, before_slot: usize) -> (usize, usize) {
        let mut removed = 0;
        let mut bytes = 0;
        let end = before_slot.min(self.slots.len());
        for slot in 1..end {
            if let Some(item) = self.slots[slot].take() {
                bytes += item.size_in_bytes();
                if let Some(ns) = item.op().namespace() {
                    self.key_index.remove(&(ns, item.key().clone()));
                }
                self.account_remove_counts(&item);
                removed += 1;
            }
        }
        self.mem_bytes = self.mem_bytes.saturating_sub(bytes);
        (removed, bytes)
    }

    fn account_add(&mut self, item: &QueuedItem) {
        self.mem_bytes += item.size_in_bytes();
        if !item.is_meta() {
            self.num_non_meta_items += 1;
        }
        if item.is_deleted() {
            let rev = item.rev_seqno();
            self.max_deleted_rev_seqno = Some(self.max_deleted_rev_seqno.map_or(rev, |m| m.max(rev)));
        }
    }

    fn account_remove(&mut self, item: &QueuedItem) {
        self.mem_bytes = self.mem_bytes.saturating_sub(item.size_in_bytes());
        self.account_remove_counts(item);
    }

    fn account_remove_counts(&mut self, item: &QueuedItem) {
        if !item.is_meta() {
            self.num_non_meta_items = self.num_non_meta_items.saturating_sub(1);
        }
    }
}
