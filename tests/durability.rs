//! Integration tests for the durability path: prepare/commit/abort flow,
//! flush-time de-duplication and completion.

use std::sync::Arc;
use std::time::{Duration, Instant};

use oxibucket::bucket::{Bucket, VBucketMap};
use oxibucket::config::EngineConfig;
use oxibucket::durability::{DurabilityCompletionTask, ReplicationTopology, SyncWriteCookie};
use oxibucket::flusher::{DiskDocKey, Flusher, KVStore, MemoryKVStore};
use oxibucket::item::{DocKey, DurabilityLevel, DurabilityRequirements, Item, QueueOp};
use oxibucket::stats::EngineStats;
use oxibucket::status::Status;
use oxibucket::task::BackgroundTask;
use oxibucket::vbucket::{VBucket, VBucketState};
use oxibucket::Vbid;

fn active_vbucket() -> (Arc<VBucket>, Arc<EngineStats>) {
    let stats = Arc::new(EngineStats::new());
    let vb = VBucket::new(
        Vbid(0),
        VBucketState::Active,
        Arc::new(EngineConfig::default()),
        Arc::clone(&stats),
        ReplicationTopology::new(["active", "replica"]),
        true,
    );
    (vb, stats)
}

fn pending(key: &str, value: &str, level: DurabilityLevel) -> oxibucket::QueuedItem {
    Item::new_pending(
        key,
        value.as_bytes().to_vec(),
        DurabilityRequirements::new(level),
    )
}

fn prepared_key(key: &str) -> DiskDocKey {
    DiskDocKey {
        key: DocKey::from(key),
        prepared: true,
    }
}

#[test]
fn test_prepare_abort_prepare_keeps_second_prepare_on_disk() {
    let (vb, stats) = active_vbucket();

    // Prepare, abort, prepare again for the same key.
    assert_eq!(
        vb.set(pending("key", "a", DurabilityLevel::Majority)),
        Status::WouldBlock
    );
    assert_eq!(vb.abort(&DocKey::from("key")), Status::Success);
    assert_eq!(
        vb.set(pending("key", "b", DurabilityLevel::Majority)),
        Status::WouldBlock
    );

    // Never de-duplicated in memory: three checkpoints hold the three
    // items.
    assert_eq!(vb.checkpoint_manager().num_checkpoints(), 3);
    assert_eq!(vb.checkpoint_manager().num_items_for_persistence(), 3);

    // Prepare and abort share a disk key, so the flush leaves only the
    // second prepare.
    let store = MemoryKVStore::new();
    let flusher = Flusher::new(store.clone() as Arc<dyn KVStore>, stats);
    flusher.flush_vbucket_to_empty(&vb).unwrap();

    let doc = store.get(Vbid(0), &prepared_key("key")).unwrap();
    assert!(doc.is_prepare());
    assert_eq!(doc.value, b"b");
    assert_eq!(doc.by_seqno, 3);
    assert_eq!(store.num_docs(Vbid(0)), 1);
}

#[test]
fn test_prepare_abort_twice_keeps_final_abort_on_disk() {
    let (vb, stats) = active_vbucket();

    vb.set(pending("key", "a", DurabilityLevel::Majority));
    vb.abort(&DocKey::from("key"));
    vb.set(pending("key", "b", DurabilityLevel::Majority));
    let second_prepare_seqno = vb.checkpoint_manager().high_seqno();
    vb.abort(&DocKey::from("key"));

    // Four checkpoints in memory: prepare / abort / prepare / abort.
    assert_eq!(vb.checkpoint_manager().num_checkpoints(), 4);

    let store = MemoryKVStore::new();
    let flusher = Flusher::new(store.clone() as Arc<dyn KVStore>, stats);
    flusher.flush_vbucket_to_empty(&vb).unwrap();

    // One abort tombstone survives, directly after the second prepare.
    let doc = store.get(Vbid(0), &prepared_key("key")).unwrap();
    assert!(doc.is_abort());
    assert!(doc.deleted);
    assert_eq!(doc.by_seqno, second_prepare_seqno + 1);
    assert_eq!(store.num_docs(Vbid(0)), 1);
}

#[test]
fn test_majority_ack_with_persistence_commits_all() {
    let stats = Arc::new(EngineStats::new());
    let config = Arc::new(EngineConfig::default());
    let vb = VBucket::new(
        Vbid(1),
        VBucketState::Active,
        Arc::clone(&config),
        Arc::clone(&stats),
        ReplicationTopology::new(["active", "replica"]),
        true,
    );
    let map = Arc::new(VBucketMap::new(4));
    map.set(Vbid(1), Arc::clone(&vb));
    let completion = DurabilityCompletionTask::new(Arc::clone(&map));

    // Three PersistToMajority prepares.
    let cookies: Vec<_> = (0..3).map(|_| SyncWriteCookie::new()).collect();
    for (i, cookie) in cookies.iter().enumerate() {
        let status = vb.set_with_cookie(
            pending(
                &format!("key-{i}"),
                "value",
                DurabilityLevel::PersistToMajority,
            ),
            Some(Arc::clone(cookie)),
        );
        assert_eq!(status, Status::WouldBlock);
    }

    // Replica ack up to seqno 3: still uncommitted, local persistence
    // pending.
    assert!(!vb.seqno_acknowledged("replica", 3));
    assert_eq!(vb.durability_monitor().num_resolved(), 0);
    assert_eq!(vb.durability_monitor().num_tracked(), 3);

    // Flush all three prepares; the persistence notification resolves them.
    let store = MemoryKVStore::new();
    let flusher = Flusher::new(store as Arc<dyn KVStore>, Arc::clone(&stats));
    let result = flusher.flush_vbucket_to_empty(&vb).unwrap();
    assert!(result.resolved_sync_writes);
    assert_eq!(vb.durability_monitor().num_resolved(), 3);

    // The completion task drains them into the checkpoint manager.
    completion.notify_sync_writes_to_complete(Vbid(1));
    completion.run();
    assert_eq!(vb.durability_monitor().num_resolved(), 0);
    for cookie in &cookies {
        assert_eq!(cookie.outcome(), Some(Status::Success));
    }

    // Commit items follow the prepares: seqnos 4..6.
    assert_eq!(vb.checkpoint_manager().high_seqno(), 6);
    let batch = vb
        .checkpoint_manager()
        .items_for_cursor(oxibucket::checkpoint::PERSISTENCE_CURSOR_NAME, usize::MAX)
        .unwrap();
    let commits = batch
        .items
        .iter()
        .filter(|i| i.op() == QueueOp::CommitSyncWrite)
        .count();
    assert_eq!(commits, 3);

    // After the flush drains the commits, the log collapses back to a
    // single checkpoint.
    vb.checkpoint_manager()
        .remove_closed_unref_checkpoints(usize::MAX);
    assert_eq!(vb.checkpoint_manager().num_checkpoints(), 1);
}

#[test]
fn test_commit_emitted_strictly_after_prepare() {
    let (vb, _stats) = active_vbucket();
    let cookie = SyncWriteCookie::new();
    vb.set_with_cookie(
        pending("key", "v", DurabilityLevel::Majority),
        Some(Arc::clone(&cookie)),
    );
    vb.seqno_acknowledged("replica", 1);
    vb.process_resolved_sync_writes();

    let batch = vb
        .checkpoint_manager()
        .items_for_cursor(oxibucket::checkpoint::PERSISTENCE_CURSOR_NAME, usize::MAX)
        .unwrap();
    let positions: Vec<(QueueOp, i64)> = batch
        .items
        .iter()
        .filter(|i| !i.is_meta())
        .map(|i| (i.op(), i.by_seqno()))
        .collect();
    assert_eq!(
        positions,
        vec![
            (QueueOp::PendingSyncWrite, 1),
            (QueueOp::CommitSyncWrite, 2)
        ]
    );
}

#[test]
fn test_singleton_topology_sync_write_impossible() {
    let stats = Arc::new(EngineStats::new());
    let vb = VBucket::new(
        Vbid(0),
        VBucketState::Active,
        Arc::new(EngineConfig::default()),
        stats,
        ReplicationTopology::new(["active"]),
        true,
    );

    assert_eq!(
        vb.set(pending("key", "v", DurabilityLevel::Majority)),
        Status::DurabilityImpossible
    );
    // Non-sync writes are unaffected.
    assert_eq!(
        vb.set(Item::new_mutation("key", b"v".to_vec())),
        Status::Success
    );
    assert_eq!(vb.checkpoint_manager().high_seqno(), 1);
}

#[test]
fn test_sync_write_timeout_reports_ambiguous() {
    let (vb, _stats) = active_vbucket();
    let cookie = SyncWriteCookie::new();
    let prepare = Item::new_pending(
        "key",
        b"v".to_vec(),
        DurabilityRequirements::with_timeout(
            DurabilityLevel::Majority,
            Duration::from_millis(5),
        ),
    );
    assert_eq!(
        vb.set_with_cookie(prepare, Some(Arc::clone(&cookie))),
        Status::WouldBlock
    );

    assert!(vb.process_timeouts(Instant::now() + Duration::from_secs(1)));
    vb.process_resolved_sync_writes();
    assert_eq!(cookie.outcome(), Some(Status::SyncWriteAmbiguous));

    // The abort landed in the log after the prepare.
    let batch = vb
        .checkpoint_manager()
        .items_for_cursor(oxibucket::checkpoint::PERSISTENCE_CURSOR_NAME, usize::MAX)
        .unwrap();
    let ops: Vec<QueueOp> = batch
        .items
        .iter()
        .filter(|i| !i.is_meta())
        .map(|i| i.op())
        .collect();
    assert_eq!(
        ops,
        vec![QueueOp::PendingSyncWrite, QueueOp::AbortSyncWrite]
    );
}

#[test]
fn test_state_change_notifies_once_and_preserves_tracked() {
    let (vb, _stats) = active_vbucket();
    let cookie = SyncWriteCookie::new();
    vb.set_with_cookie(
        pending("key", "v", DurabilityLevel::Majority),
        Some(Arc::clone(&cookie)),
    );

    vb.set_state(VBucketState::Replica);
    assert_eq!(cookie.outcome(), Some(Status::SyncWriteAmbiguous));
    assert_eq!(vb.durability_monitor().num_tracked(), 1);

    // A second transition does not re-notify.
    vb.set_state(VBucketState::Dead);
    assert_eq!(cookie.outcome(), Some(Status::SyncWriteAmbiguous));
}

#[test]
fn test_bucket_end_to_end_sync_write() {
    let bucket = Bucket::new(EngineConfig::default(), true);
    let vb = bucket.create_vbucket(
        Vbid(0),
        VBucketState::Active,
        ReplicationTopology::new(["active", "replica"]),
    );

    let cookie = SyncWriteCookie::new();
    assert_eq!(
        vb.set_with_cookie(
            pending("key", "v", DurabilityLevel::Majority),
            Some(Arc::clone(&cookie))
        ),
        Status::WouldBlock
    );

    bucket.seqno_acknowledged(Vbid(0), "replica", 1);

    let deadline = Instant::now() + Duration::from_secs(5);
    while cookie.outcome().is_none() {
        assert!(Instant::now() < deadline, "sync write never completed");
        std::thread::yield_now();
    }
    assert_eq!(cookie.outcome(), Some(Status::Success));
}
