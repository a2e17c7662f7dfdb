//! The checkpoint manager: owns the checkpoint list for one vbucket.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::checkpoint::checkpoint::{Checkpoint, CheckpointKind};
use crate::checkpoint::cursor::{
    CheckpointCursor, CheckpointSnapshotRange, CursorRegResult, ExpelResult, ItemsForCursor,
    RemovalResult, PERSISTENCE_CURSOR_NAME,
};
use crate::checkpoint::{GenerateBySeqno, GenerateCas};
use crate::config::EngineConfig;
use crate::item::{HybridClock, Item, KeyNamespace, QueueOp, QueuedItem};
use crate::stats::EngineStats;
use crate::status::Status;
use crate::Vbid;

/// Snapshot boundaries of the open checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Open snapshot start seqno.
    pub start: u64,
    /// Open snapshot end seqno.
    pub end: u64,
    /// Highest seqno assigned by this vbucket.
    pub high_seqno: i64,
}

#[derive(Debug)]
struct Inner {
    checkpoints: VecDeque<Checkpoint>,
    cursors: HashMap<String, CheckpointCursor>,
    last_by_seqno: i64,
    /// Set on a seqno-ordering violation; the vbucket is unusable after.
    poisoned: bool,
}

impl Inner {
    fn open(&self) -> &Checkpoint {
        self.checkpoints.back().expect("checkpoint list never empty")
    }

    fn open_mut(&mut self) -> &mut Checkpoint {
        self.checkpoints
            .back_mut()
            .expect("checkpoint list never empty")
    }

    fn index_of(&self, checkpoint_id: u64) -> Option<usize> {
        self.checkpoints.iter().position(|c| c.id() == checkpoint_id)
    }

    fn has_cursor_in(&self, checkpoint_id: u64) -> bool {
        self.cursors
            .values()
            .any(|c| c.checkpoint_id == checkpoint_id)
    }
}

/// Maintains the list of checkpoints for a given vbucket.
///
/// A single mutex guards the queue, the checkpoint list, the cursor index
/// and the counters. Readers take a bounded batch under the lock and release
/// it before doing I/O; mutators hold it for the full critical section.
#[derive(Debug)]
pub struct CheckpointManager {
    vbid: Vbid,
    config: Arc<EngineConfig>,
    stats: Arc<EngineStats>,
    clock: Arc<HybridClock>,
    inner: Mutex<Inner>,
}

impl CheckpointManager {
    /// Create a manager with one open checkpoint and the persistence cursor.
    pub fn new(
        vbid: Vbid,
        config: Arc<EngineConfig>,
        stats: Arc<EngineStats>,
        clock: Arc<HybridClock>,
        last_seqno: i64,
        snap_start: u64,
        snap_end: u64,
    ) -> Self {
        let mut first = Checkpoint::new(1, snap_start, snap_end, None, CheckpointKind::Memory);
        first.push(Item::new_checkpoint_meta(
            QueueOp::CheckpointStart,
            1,
            last_seqno + 1,
        ));

        let mut cursors = HashMap::new();
        cursors.insert(
            PERSISTENCE_CURSOR_NAME.to_string(),
            CheckpointCursor::new(PERSISTENCE_CURSOR_NAME, 1, 0),
        );

        let mut checkpoints = VecDeque::new();
        checkpoints.push_back(first);

        CheckpointManager {
            vbid,
            config,
            stats,
            clock,
            inner: Mutex::new(Inner {
                checkpoints,
                cursors,
                last_by_seqno: last_seqno,
                poisoned: false,
            }),
        }
    }

    /// Vbucket this manager belongs to.
    pub fn vbid(&self) -> Vbid {
        self.vbid
    }

    /// Queue an item into the open checkpoint.
    ///
    /// Returns `true` iff the write increased the persistence backlog by
    /// exactly one, i.e. it was not de-duplicated against an item the
    /// persistence cursor had not yet read.
    pub fn queue(
        &self,
        item: QueuedItem,
        generate_seqno: GenerateBySeqno,
        generate_cas: GenerateCas,
    ) -> bool {
        let ns = match item.op().namespace() {
            Some(ns) => ns,
            None => {
                debug_assert!(false, "meta items are queued internally");
                return false;
            }
        };

        let mut inner = self.inner.lock();
        if inner.poisoned {
            return false;
        }

        self.maybe_rollover_for_limits(&mut inner);

        // Prepares and aborts never de-duplicate in memory: a key collision
        // in the prepared namespace forces the completion (or re-prepare)
        // into a fresh checkpoint.
        if ns == KeyNamespace::Prepared && inner.open().lookup(ns, item.key()).is_some() {
            self.add_new_checkpoint(&mut inner, None);
            debug!(
                vbid = %self.vbid,
                key = %item.key(),
                "prepared-namespace collision, opened checkpoint {}",
                inner.open().id()
            );
        }

        let seqno = match generate_seqno {
            GenerateBySeqno::Yes => inner.last_by_seqno + 1,
            GenerateBySeqno::No => item.by_seqno(),
        };
        if seqno <= inner.last_by_seqno {
            error!(
                vbid = %self.vbid,
                seqno,
                last = inner.last_by_seqno,
                "seqno regression, poisoning vbucket"
            );
            inner.poisoned = true;
            return false;
        }
        item.set_by_seqno(seqno);
        inner.last_by_seqno = seqno;

        match generate_cas {
            GenerateCas::Yes => item.set_cas(self.clock.next_cas()),
            GenerateCas::No => self.clock.observe(item.cas()),
        }

        let persistence_pos = inner
            .cursors
            .get(PERSISTENCE_CURSOR_NAME)
            .map(|c| c.position());

        let open = inner.open_mut();
        open.extend_snapshot(seqno as u64);
        let open_id = open.id();

        let grew = match open.lookup(ns, item.key()) {
            Some(old_slot) => {
                let old_size = open.get(old_slot).map_or(0, |i| i.size_in_bytes());
                // The backlog only grows when persistence had already read
                // the item being replaced.
                let persistence_passed_old =
                    persistence_pos.is_some_and(|pos| pos > (open_id, old_slot));
                open.replace(old_slot, item.clone());
                self.stats.sub_mem_used(old_size as u64);
                persistence_passed_old
            }
            None => {
                open.push(item.clone());
                true
            }
        };

        self.stats.add_mem_used(item.size_in_bytes() as u64);
        if grew {
            self.stats.disk_queue_grew();
        }
        grew
    }

    /// Queue a `set_vbucket_state` meta item for persistence.
    pub fn queue_set_vbucket_state(&self) {
        let mut inner = self.inner.lock();
        let seqno = inner.last_by_seqno + 1;
        inner.last_by_seqno = seqno;
        let open_id = inner.open().id();
        let item = Item::new_checkpoint_meta(QueueOp::SetVbucketState, open_id, seqno);
        self.stats.add_mem_used(item.size_in_bytes() as u64);
        let open = inner.open_mut();
        open.extend_snapshot(seqno as u64);
        open.push(item);
        self.stats.disk_queue_grew();
    }

    /// Create a new open checkpoint by force.
    ///
    /// Returns the id of the open checkpoint (unchanged when the current one
    /// is still empty).
    pub fn create_new_checkpoint(&self) -> u64 {
        let mut inner = self.inner.lock();
        if inner.open().num_non_meta_items() == 0 {
            return inner.open().id();
        }
        self.add_new_checkpoint(&mut inner, None);
        inner.open().id()
    }

    /// Open a checkpoint for an incoming snapshot.
    ///
    /// Reuses the open checkpoint if it is still empty, otherwise closes it
    /// and opens a new one with the given boundaries.
    pub fn create_snapshot(
        &self,
        snap_start: u64,
        snap_end: u64,
        high_completed_seqno: Option<u64>,
        kind: CheckpointKind,
    ) {
        let mut inner = self.inner.lock();
        if inner.open().num_non_meta_items() == 0 {
            inner
                .open_mut()
                .reset_snapshot(snap_start, snap_end, high_completed_seqno, kind);
            return;
        }
        self.add_new_checkpoint(
            &mut inner,
            Some((snap_start, snap_end, high_completed_seqno, kind)),
        );
    }

    /// Extend the open snapshot end (replica receiving a larger marker).
    pub fn update_current_snapshot(&self, snap_end: u64, kind: CheckpointKind) {
        let mut inner = self.inner.lock();
        let open = inner.open_mut();
        if open.num_non_meta_items() == 0 {
            let start = open.snap_start();
            let hcs = open.high_completed_seqno();
            open.reset_snapshot(start, snap_end, hcs, kind);
        } else {
            open.set_snap_end(snap_end);
        }
    }

    /// Register a new cursor at the given start seqno.
    ///
    /// The cursor lands in the earliest checkpoint whose snapshot range
    /// covers the seqno, positioned at the first item at or after it.
    pub fn register_cursor(
        &self,
        name: &str,
        start_seqno: u64,
    ) -> Result<CursorRegResult, Status> {
        let mut inner = self.inner.lock();
        if inner.cursors.contains_key(name) {
            return Err(Status::CursorNameInUse);
        }

        let (checkpoint_id, slot, seqno, on_boundary) = Self::locate_seqno(&inner, start_seqno);
        inner.cursors.insert(
            name.to_string(),
            CheckpointCursor::new(name, checkpoint_id, slot),
        );
        Ok(CursorRegResult {
            seqno,
            on_checkpoint_boundary: on_boundary,
        })
    }

    /// Remove a cursor by name. The persistence cursor cannot be removed.
    pub fn remove_cursor(&self, name: &str) -> bool {
        if name == PERSISTENCE_CURSOR_NAME {
            return false;
        }
        self.inner.lock().cursors.remove(name).is_some()
    }

    /// True if a cursor with this name is registered.
    pub fn has_cursor(&self, name: &str) -> bool {
        self.inner.lock().cursors.contains_key(name)
    }

    /// Fetch the next batch of items for a cursor and advance it.
    ///
    /// Whole checkpoints are batched until `approx_limit` items have been
    /// collected; the open checkpoint is read up to its current end. A batch
    /// never spans checkpoints of different kinds (Memory vs Disk).
    pub fn items_for_cursor(
        &self,
        name: &str,
        approx_limit: usize,
    ) -> Result<ItemsForCursor, Status> {
        let mut inner = self.inner.lock();
        let cursor = match inner.cursors.get(name) {
            Some(c) => c.clone(),
            None => return Err(Status::InvalidArgument),
        };

        let mut idx = match inner.index_of(cursor.checkpoint_id) {
            Some(idx) => idx,
            None => {
                error!(vbid = %self.vbid, cursor = name, "cursor points at missing checkpoint");
                return Err(Status::Internal);
            }
        };

        let batch_kind = inner.checkpoints[idx].kind();
        let mut result = ItemsForCursor {
            checkpoint_kind: batch_kind,
            ..ItemsForCursor::default()
        };

        let mut checkpoint_id = cursor.checkpoint_id;
        let mut slot = cursor.slot;

        loop {
            let c = &inner.checkpoints[idx];
            let mut emitted = false;
            while let Some(s) = c.next_occupied(slot) {
                let item = c.get(s).expect("occupied slot").clone();
                slot = s + 1;
                result.items.push(item);
                emitted = true;
            }
            if emitted {
                result.ranges.push(CheckpointSnapshotRange {
                    start: c.snap_start(),
                    end: c.snap_end(),
                    high_completed_seqno: c.high_completed_seqno(),
                });
                result.max_deleted_rev_seqno = match (
                    result.max_deleted_rev_seqno,
                    c.max_deleted_rev_seqno(),
                ) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            }

            if idx + 1 >= inner.checkpoints.len() {
                // Open checkpoint fully drained.
                break;
            }

            // Advance into the next checkpoint.
            let next_kind = inner.checkpoints[idx + 1].kind();
            idx += 1;
            checkpoint_id = inner.checkpoints[idx].id();
            slot = 0;

            if next_kind != batch_kind {
                result.more_available = true;
                break;
            }
            if result.items.len() >= approx_limit {
                result.more_available =
                    Self::items_remain(&inner.checkpoints, idx, slot);
                break;
            }
        }

        if let Some(c) = inner.cursors.get_mut(name) {
            c.crossed_boundary = c.checkpoint_id != checkpoint_id;
            c.checkpoint_id = checkpoint_id;
            c.slot = slot;
        }
        Ok(result)
    }

    /// Count of non-meta items the cursor has yet to process.
    pub fn num_items_for_cursor(&self, name: &str) -> usize {
        let inner = self.inner.lock();
        let cursor = match inner.cursors.get(name) {
            Some(c) => c,
            None => return 0,
        };
        let idx = match inner.index_of(cursor.checkpoint_id) {
            Some(idx) => idx,
            None => return 0,
        };
        let mut count = 0;
        let mut slot = cursor.slot;
        for i in idx..inner.checkpoints.len() {
            let c = &inner.checkpoints[i];
            let mut s = slot;
            while let Some(next) = c.next_occupied(s) {
                if let Some(item) = c.get(next) {
                    if !item.is_meta() {
                        count += 1;
                    }
                }
                s = next + 1;
            }
            slot = 0;
        }
        count
    }

    /// Count of non-meta items awaiting the persistence cursor.
    pub fn num_items_for_persistence(&self) -> usize {
        self.num_items_for_cursor(PERSISTENCE_CURSOR_NAME)
    }

    /// Expel items already read by every cursor from the oldest referenced
    /// checkpoint.
    pub fn expel_unreferenced_items(&self) -> ExpelResult {
        let mut inner = self.inner.lock();
        let earliest = match inner.cursors.values().map(|c| c.position()).min() {
            Some(pos) => pos,
            None => return ExpelResult::default(),
        };
        let (checkpoint_id, slot) = earliest;
        let idx = match inner.index_of(checkpoint_id) {
            Some(idx) => idx,
            None => return ExpelResult::default(),
        };
        let (count, bytes) = inner.checkpoints[idx].expel_before(slot);
        if count > 0 {
            self.stats.record_expel(count as u64, bytes as u64);
            self.stats.sub_mem_used(bytes as u64);
            debug!(
                vbid = %self.vbid,
                count,
                bytes,
                "expelled unreferenced checkpoint items"
            );
        }
        ExpelResult {
            count,
            estimated_bytes: bytes,
        }
    }

    /// Remove closed checkpoints that no cursor references, oldest first.
    pub fn remove_closed_unref_checkpoints(&self, limit: usize) -> RemovalResult {
        let mut inner = self.inner.lock();
        let mut items_removed = 0;
        let mut removed = 0;

        while removed < limit && inner.checkpoints.len() > 1 {
            let front = &inner.checkpoints[0];
            if front.is_open() || inner.has_cursor_in(front.id()) {
                break;
            }
            let front = inner.checkpoints.pop_front().expect("front exists");
            items_removed += front.num_live_items();
            self.stats.sub_mem_used(front.mem_bytes() as u64);
            removed += 1;
        }

        let mut new_open_created = false;
        if removed > 0 {
            self.stats
                .items_removed_from_checkpoints
                .fetch_add(items_removed as u64, std::sync::atomic::Ordering::Relaxed);
            // With only the open checkpoint left, roll it over when it has
            // grown past the configured size so it too becomes reclaimable.
            if inner.checkpoints.len() == 1
                && inner.open().num_non_meta_items() >= self.config.chk_max_items
            {
                self.add_new_checkpoint(&mut inner, None);
                new_open_created = true;
            }
        }

        RemovalResult {
            items_removed,
            new_open_created,
        }
    }

    /// Names of cursors eligible for dropping, most lagging first.
    ///
    /// The persistence cursor is never eligible; neither is any cursor at or
    /// ahead of it.
    pub fn cursors_eligible_for_drop(&self) -> Vec<String> {
        let inner = self.inner.lock();
        let persistence_pos = match inner.cursors.get(PERSISTENCE_CURSOR_NAME) {
            Some(c) => c.position(),
            None => return Vec::new(),
        };
        let mut candidates: Vec<(&String, (u64, usize))> = inner
            .cursors
            .iter()
            .filter(|(_, c)| !c.is_persistence() && c.position() < persistence_pos)
            .map(|(name, c)| (name, c.position()))
            .collect();
        candidates.sort_by_key(|(_, pos)| *pos);
        candidates.into_iter().map(|(name, _)| name.clone()).collect()
    }

    /// Take the cursors from another manager, resetting them to the start of
    /// this manager's checkpoint list (vbucket reset).
    pub fn take_and_reset_cursors(&self, other: &CheckpointManager) {
        let names: Vec<String> = {
            let mut other_inner = other.inner.lock();
            let names = other_inner.cursors.keys().cloned().collect();
            other_inner.cursors.clear();
            names
        };
        let mut inner = self.inner.lock();
        let front_id = inner.checkpoints.front().expect("list never empty").id();
        for name in names {
            inner
                .cursors
                .insert(name.clone(), CheckpointCursor::new(name, front_id, 0));
        }
        // The persistence cursor must always exist.
        if !inner.cursors.contains_key(PERSISTENCE_CURSOR_NAME) {
            inner.cursors.insert(
                PERSISTENCE_CURSOR_NAME.to_string(),
                CheckpointCursor::new(PERSISTENCE_CURSOR_NAME, front_id, 0),
            );
        }
    }

    /// Memory held by all checkpoints.
    pub fn memory_usage(&self) -> usize {
        self.inner
            .lock()
            .checkpoints
            .iter()
            .map(|c| c.mem_bytes())
            .sum()
    }

    /// Memory held by closed checkpoints no cursor references.
    pub fn unref_checkpoint_memory(&self) -> usize {
        let inner = self.inner.lock();
        inner
            .checkpoints
            .iter()
            .filter(|c| !c.is_open() && !inner.has_cursor_in(c.id()))
            .map(|c| c.mem_bytes())
            .sum()
    }

    /// True if at least one closed checkpoint can be removed.
    pub fn has_closed_unref_checkpoint(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .checkpoints
            .iter()
            .any(|c| !c.is_open() && !inner.has_cursor_in(c.id()))
    }

    /// Highest seqno assigned in this vbucket.
    pub fn high_seqno(&self) -> i64 {
        self.inner.lock().last_by_seqno
    }

    /// Id of the open checkpoint.
    pub fn open_checkpoint_id(&self) -> u64 {
        self.inner.lock().open().id()
    }

    /// Number of checkpoints currently in the list.
    pub fn num_checkpoints(&self) -> usize {
        self.inner.lock().checkpoints.len()
    }

    /// Kind of the open checkpoint.
    pub fn open_checkpoint_kind(&self) -> CheckpointKind {
        self.inner.lock().open().kind()
    }

    /// Snapshot boundaries of the open checkpoint.
    pub fn snapshot_info(&self) -> SnapshotInfo {
        let inner = self.inner.lock();
        let open = inner.open();
        SnapshotInfo {
            start: open.snap_start(),
            end: open.snap_end(),
            high_seqno: inner.last_by_seqno,
        }
    }

    /// True once a seqno-ordering violation has poisoned this vbucket.
    pub fn is_poisoned(&self) -> bool {
        self.inner.lock().poisoned
    }

    fn maybe_rollover_for_limits(&self, inner: &mut Inner) {
        let open = inner.open();
        if open.num_non_meta_items() == 0 {
            return;
        }
        if open.num_non_meta_items() >= self.config.chk_max_items
            || open.age() >= self.config.chk_period
        {
            self.add_new_checkpoint(inner, None);
        }
    }

    /// Close the open checkpoint and append a fresh one.
    ///
    /// `snapshot` overrides the new checkpoint's boundaries and kind; by
    /// default it opens a Memory checkpoint at the current high seqno.
    fn add_new_checkpoint(
        &self,
        inner: &mut Inner,
        snapshot: Option<(u64, u64, Option<u64>, CheckpointKind)>,
    ) {
        let boundary_seqno = inner.last_by_seqno + 1;
        let old_id = {
            let open = inner.open_mut();
            let id = open.id();
            open.push(Item::new_checkpoint_meta(
                QueueOp::CheckpointEnd,
                id,
                boundary_seqno,
            ));
            open.close();
            id
        };

        let (snap_start, snap_end, hcs, kind) = snapshot.unwrap_or_else(|| {
            let snap = inner.last_by_seqno.max(0) as u64;
            (snap, snap, None, CheckpointKind::Memory)
        });

        let new_id = old_id + 1;
        let mut next = Checkpoint::new(new_id, snap_start, snap_end, hcs, kind);
        next.push(Item::new_checkpoint_meta(
            QueueOp::CheckpointStart,
            new_id,
            boundary_seqno,
        ));
        inner.checkpoints.push_back(next);
    }

    /// Locate the registration position for `start_seqno`.
    ///
    /// Returns `(checkpoint id, slot, actual seqno, on checkpoint boundary)`.
    fn locate_seqno(inner: &Inner, start_seqno: u64) -> (u64, usize, u64, bool) {
        for c in &inner.checkpoints {
            if c.snap_end() < start_seqno {
                continue;
            }
            // Earliest checkpoint that can cover the seqno; find the first
            // non-meta item at or after it.
            let mut slot = 0;
            let mut first_non_meta_slot = None;
            while let Some(s) = c.next_occupied(slot) {
                let item = c.get(s).expect("occupied slot");
                slot = s + 1;
                if item.is_meta() {
                    continue;
                }
                if first_non_meta_slot.is_none() {
                    first_non_meta_slot = Some(s);
                }
                if item.by_seqno() >= start_seqno as i64 {
                    let boundary = first_non_meta_slot == Some(s);
                    return (c.id(), s, item.by_seqno() as u64, boundary);
                }
            }
            // Checkpoint covers the seqno but holds nothing at or after it
            // (de-duplication); fall through to the next checkpoint.
        }

        // Nothing at or after the seqno: start at the end of the open
        // checkpoint and pick up future items.
        let open = inner.open();
        (
            open.id(),
            open.num_slots(),
            inner.last_by_seqno.max(0) as u64,
            false,
        )
    }

    fn items_remain(checkpoints: &VecDeque<Checkpoint>, idx: usize, slot: usize) -> bool {
        if idx >= checkpoints.len() {
            return false;
        }
        if checkpoints[idx].next_occupied(slot).is_some() {
            return true;
        }
        checkpoints
            .iter()
            .skip(idx + 1)
            .any(|c| c.next_occupied(0).is_some())
    }
}
