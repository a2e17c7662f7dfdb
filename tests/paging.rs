//! Integration tests for the item pager: eviction thresholds, expiry and
//! phase rotation.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use oxibucket::checkpoint::PERSISTENCE_CURSOR_NAME;
use oxibucket::config::EngineConfig;
use oxibucket::durability::ReplicationTopology;
use oxibucket::item::{DocKey, DurabilityLevel, DurabilityRequirements, Item};
use oxibucket::paging::{PagerPhase, PagingVisitor, SharedPagerPhase, MAX_PERSISTENCE_QUEUE_SIZE};
use oxibucket::stats::EngineStats;
use oxibucket::vbucket::{VBucket, VBucketState};
use oxibucket::Vbid;

fn small_quota_config() -> EngineConfig {
    EngineConfig {
        max_size: 8192,
        ..EngineConfig::default()
    }
}

fn vbucket(state: VBucketState, stats: &Arc<EngineStats>) -> Arc<VBucket> {
    VBucket::new(
        Vbid(0),
        state,
        Arc::new(small_quota_config()),
        Arc::clone(stats),
        ReplicationTopology::new(["active", "replica"]),
        true,
    )
}

fn visitor_with(
    config: EngineConfig,
    phase: PagerPhase,
    stats: &Arc<EngineStats>,
) -> PagingVisitor {
    PagingVisitor::new(
        Arc::new(config),
        Arc::clone(stats),
        SharedPagerPhase::new(phase),
        false,
    )
}

fn visitor(phase: PagerPhase, stats: &Arc<EngineStats>) -> PagingVisitor {
    visitor_with(small_quota_config(), phase, stats)
}

fn fill(vb: &VBucket, count: usize) {
    for i in 0..count {
        vb.set(Item::new_mutation(
            format!("key-{i:03}").as_str(),
            vec![0u8; 64],
        ));
    }
}

fn resident_share(vb: &VBucket, from: &str, to: &str) -> f64 {
    let mut total = 0usize;
    let mut resident = 0usize;
    vb.hash_table().visit(|key, sv| {
        if key.as_bytes() >= from.as_bytes() && key.as_bytes() < to.as_bytes() {
            total += 1;
            if sv.is_resident() {
                resident += 1;
            }
        }
        true
    });
    if total == 0 {
        1.0
    } else {
        resident as f64 / total as f64
    }
}

#[test]
fn test_pager_evicts_cold_over_hot() {
    let stats = Arc::new(EngineStats::new());
    let vb = vbucket(VBucketState::Active, &stats);

    // 200 cold items and 50 hot ones.
    fill(&vb, 250);
    vb.hash_table().visit(|key, sv| {
        if key.as_bytes() >= b"key-200".as_slice() {
            sv.set_freq_counter(200);
        }
        true
    });
    assert!(stats.mem_used() > small_quota_config().mem_low_wat_bytes());

    let mut pager = visitor(PagerPhase::ActiveAndPendingOnly, &stats);
    pager.visit_vbucket(&vb);

    assert!(pager.num_ejected() > 0);
    assert!(vb.hash_table().resident_ratio() < 1.0);
    // Threshold-level behaviour: the cold range loses a larger share of
    // its values than the hot range.
    let cold = resident_share(&vb, "key-000", "key-200");
    let hot = resident_share(&vb, "key-200", "key-250");
    assert!(
        cold < hot,
        "cold residency {cold} should be below hot residency {hot}"
    );
    assert_eq!(
        stats.num_value_ejects.load(Ordering::Relaxed),
        pager.num_ejected() as u64
    );
}

#[test]
fn test_pager_never_touches_prepares() {
    let stats = Arc::new(EngineStats::new());
    let vb = vbucket(VBucketState::Active, &stats);

    vb.set(Item::new_pending(
        "prepared-key",
        vec![0u8; 64],
        DurabilityRequirements::new(DurabilityLevel::Majority),
    ));
    fill(&vb, 200);

    let mut pager = visitor(PagerPhase::ActiveAndPendingOnly, &stats);
    pager.visit_vbucket(&vb);

    let prepared = vb.hash_table().peek(&DocKey::from("prepared-key")).unwrap();
    assert!(prepared.is_pending());
    assert!(prepared.is_resident());
}

#[test]
fn test_pager_skips_out_of_phase_vbuckets() {
    let stats = Arc::new(EngineStats::new());
    let vb = vbucket(VBucketState::Active, &stats);
    fill(&vb, 200);

    // Replica-only phase ignores the active vbucket entirely.
    let mut pager = visitor(PagerPhase::ReplicaOnly, &stats);
    pager.visit_vbucket(&vb);
    assert_eq!(pager.num_ejected(), 0);
    assert_eq!(vb.hash_table().resident_ratio(), 1.0);
}

#[test]
fn test_pager_purges_expired_items() {
    let stats = Arc::new(EngineStats::new());
    let vb = vbucket(VBucketState::Active, &stats);
    fill(&vb, 150);
    // Drain persistence so the expiry deletions are counted fresh.
    let _ = vb
        .checkpoint_manager()
        .items_for_cursor(PERSISTENCE_CURSOR_NAME, usize::MAX)
        .unwrap();

    // Expire a couple of keys in the past.
    vb.hash_table().visit(|key, sv| {
        if key.as_bytes() < b"key-002".as_slice() {
            sv.set_exptime(1);
        }
        true
    });

    let mut pager = visitor(PagerPhase::ActiveAndPendingOnly, &stats);
    pager.visit_vbucket(&vb);

    assert_eq!(pager.num_expired(), 2);
    assert!(vb.hash_table().peek(&DocKey::from("key-000")).is_none());
    assert!(vb.hash_table().peek(&DocKey::from("key-001")).is_none());
    // Expiry deletions are queued for persistence.
    assert_eq!(vb.checkpoint_manager().num_items_for_persistence(), 2);
    assert_eq!(stats.num_expired_by_pager.load(Ordering::Relaxed), 2);
}

#[test]
fn test_phase_rotation() {
    let stats = Arc::new(EngineStats::new());
    let phase = SharedPagerPhase::new(PagerPhase::ReplicaOnly);

    let mut pager = PagingVisitor::new(
        Arc::new(small_quota_config()),
        Arc::clone(&stats),
        Arc::clone(&phase),
        false,
    );
    pager.complete();
    assert_eq!(phase.get(), PagerPhase::ActiveAndPendingOnly);

    let mut pager = PagingVisitor::new(
        Arc::new(small_quota_config()),
        Arc::clone(&stats),
        Arc::clone(&phase),
        false,
    );
    pager.complete();
    assert_eq!(phase.get(), PagerPhase::ReplicaOnly);
}

#[test]
fn test_ephemeral_stays_replica_only() {
    let stats = Arc::new(EngineStats::new());
    let phase = SharedPagerPhase::new(PagerPhase::ReplicaOnly);
    let mut pager = PagingVisitor::new(
        Arc::new(small_quota_config()),
        Arc::clone(&stats),
        Arc::clone(&phase),
        true,
    );
    pager.complete();
    assert_eq!(phase.get(), PagerPhase::ReplicaOnly);
}

#[test]
fn test_pager_pauses_on_persistence_backlog() {
    let stats = Arc::new(EngineStats::new());
    stats
        .disk_queue_size
        .store(MAX_PERSISTENCE_QUEUE_SIZE, Ordering::Relaxed);
    let pager = visitor(PagerPhase::ActiveAndPendingOnly, &stats);
    assert!(pager.pause_needed());
}

#[test]
fn test_active_spared_when_less_resident_than_replicas() {
    let stats = Arc::new(EngineStats::new());
    let vb = vbucket(VBucketState::Active, &stats);
    fill(&vb, 200);

    // A quota large enough that usage sits between the (zeroed) low mark
    // and the high mark, so the resident-ratio comparison applies.
    let roomy = EngineConfig {
        max_size: 10_000_000,
        mem_low_wat: 0.0,
        ..EngineConfig::default()
    };

    let mut spared = visitor_with(roomy.clone(), PagerPhase::ActiveAndPendingOnly, &stats);
    spared.set_resident_ratios(0.2, 0.9);
    spared.visit_vbucket(&vb);
    assert_eq!(spared.num_ejected(), 0);
    assert_eq!(vb.hash_table().resident_ratio(), 1.0);

    // With equal ratios the same vbucket is visited and evicts.
    let mut working = visitor_with(roomy, PagerPhase::ActiveAndPendingOnly, &stats);
    working.set_resident_ratios(0.9, 0.9);
    working.visit_vbucket(&vb);
    assert!(working.num_ejected() > 0);
}
