//! Cursors: named forward-only positions in the checkpoint list.

use crate::checkpoint::CheckpointKind;
use crate::item::QueuedItem;

/// Reserved name of the persistence cursor.
pub const PERSISTENCE_CURSOR_NAME: &str = "persistence";

/// A named position inside the checkpoint list.
///
/// `slot` is the next slot the cursor will read within checkpoint
/// `checkpoint_id`. Cursors only ever move forward.
#[derive(Debug, Clone)]
pub(crate) struct CheckpointCursor {
    pub(crate) name: String,
    pub(crate) checkpoint_id: u64,
    pub(crate) slot: usize,
    /// Set when the cursor entered a new checkpoint since the last batch.
    pub(crate) crossed_boundary: bool,
}

impl CheckpointCursor {
    pub(crate) fn new(name: impl Into<String>, checkpoint_id: u64, slot: usize) -> Self {
        CheckpointCursor {
            name: name.into(),
            checkpoint_id,
            slot,
            crossed_boundary: false,
        }
    }

    /// True if this is the privileged persistence cursor.
    pub(crate) fn is_persistence(&self) -> bool {
        self.name == PERSISTENCE_CURSOR_NAME
    }

    /// Ordering key: earlier (more lagging) positions sort first.
    pub(crate) fn position(&self) -> (u64, usize) {
        (self.checkpoint_id, self.slot)
    }
}

/// Result of registering a cursor by seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorRegResult {
    /// The seqno the cursor will actually start on.
    pub seqno: u64,
    /// Whether the cursor starts at the beginning of a checkpoint, in which
    /// case the consumer must emit a snapshot marker.
    pub on_checkpoint_boundary: bool,
}

/// Snapshot range spanned by a batch of items, with the high completed seqno
/// required when flushing Disk checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointSnapshotRange {
    /// Snapshot start seqno.
    pub start: u64,
    /// Snapshot end seqno.
    pub end: u64,
    /// High completed seqno; set only for Disk checkpoints.
    pub high_completed_seqno: Option<u64>,
}

/// Items handed to a cursor's consumer, plus the bookkeeping it needs.
#[derive(Debug, Default)]
pub struct ItemsForCursor {
    /// Items in insertion order, meta items included in-band.
    pub items: Vec<QueuedItem>,
    /// Snapshot ranges of the checkpoints spanned.
    pub ranges: Vec<CheckpointSnapshotRange>,
    /// True if more items remained after the batch budget was hit.
    pub more_available: bool,
    /// Kind of the checkpoints the batch was taken from (never mixed).
    pub checkpoint_kind: CheckpointKind,
    /// Highest deleted-item revision seqno spanned, for flusher use.
    pub max_deleted_rev_seqno: Option<u64>,
}

/// Result of an expel pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpelResult {
    /// Items removed from memory.
    pub count: usize,
    /// Estimated bytes recovered.
    pub estimated_bytes: usize,
}

/// Result of removing closed unreferenced checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RemovalResult {
    /// Live items purged with the removed checkpoints.
    pub items_removed: usize,
    /// Whether removal triggered creation of a new open checkpoint.
    pub new_open_created: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_position_ordering() {
        let a = CheckpointCursor::new("a", 1, 5);
        let b = CheckpointCursor::new("b", 2, 0);
        assert!(a.position() < b.position());
    }

    #[test]
    fn test_persistence_cursor_name() {
        let c = CheckpointCursor::new(PERSISTENCE_CURSOR_NAME, 1, 0);
        assert!(c.is_persistence());
        let d = CheckpointCursor::new("replication:n1", 1, 0);
        assert!(!d.is_persistence());
    }
}
