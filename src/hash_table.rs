//! Per-vbucket hash table of resident documents.
//!
//! The hash table is what the item pager visits: each entry carries the
//! frequency counter and CAS the eviction decision is made from. Values can
//! be paged out (made non-resident) while their metadata stays behind.
//! Resident value bytes are accounted against the engine-wide memory gauge.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::Rng;

use crate::item::{DocKey, QueuedItem};
use crate::stats::EngineStats;

/// Division factor for the probabilistic counter increment curve: the higher
/// the counter, the less likely a further increment.
const FREQ_INCREMENT_FACTOR: f64 = 16.0;

/// Probabilistically increment an 8-bit frequency counter.
pub fn probabilistic_increment(counter: u8, rng: &mut impl Rng) -> u8 {
    if counter == u8::MAX {
        return counter;
    }
    let p = 1.0 / (1.0 + f64::from(counter) / FREQ_INCREMENT_FACTOR);
    if rng.gen::<f64>() < p {
        counter + 1
    } else {
        counter
    }
}

/// Commit state of a stored value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommittedState {
    /// A regular committed document.
    Committed,
    /// A prepare awaiting resolution.
    Pending,
    /// A prepare that has been committed; purged later by the tombstone
    /// purger, never by the pager.
    PrepareCommitted,
}

/// A document entry in the hash table.
#[derive(Debug, Clone)]
pub struct StoredValue {
    value: Option<Vec<u8>>,
    cas: u64,
    by_seqno: i64,
    deleted: bool,
    committed: CommittedState,
    freq_counter: u8,
    /// Expiry as unix seconds; 0 means no expiry.
    exptime: u32,
}

impl StoredValue {
    fn from_item(item: &QueuedItem, committed: CommittedState) -> Self {
        StoredValue {
            value: Some(item.value().to_vec()),
            cas: item.cas(),
            by_seqno: item.by_seqno(),
            deleted: item.is_deleted(),
            committed,
            freq_counter: item.freq_counter(),
            exptime: 0,
        }
    }

    fn resident_bytes(&self) -> usize {
        self.value.as_ref().map_or(0, Vec::len)
    }

    /// True while the value bytes are in memory.
    pub fn is_resident(&self) -> bool {
        self.value.is_some()
    }

    /// True for a prepare awaiting resolution.
    pub fn is_pending(&self) -> bool {
        self.committed == CommittedState::Pending
    }

    /// True for a completed prepare.
    pub fn is_completed(&self) -> bool {
        self.committed == CommittedState::PrepareCommitted
    }

    /// True when the document has expired as of `now_secs`.
    pub fn is_expired(&self, now_secs: u32) -> bool {
        self.exptime != 0 && self.exptime <= now_secs && !self.deleted
    }

    /// CAS stamp.
    pub fn cas(&self) -> u64 {
        self.cas
    }

    /// Sequence number.
    pub fn by_seqno(&self) -> i64 {
        self.by_seqno
    }

    /// True if deleted.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Current frequency counter value.
    pub fn freq_counter(&self) -> u8 {
        self.freq_counter
    }

    /// Overwrite the frequency counter (used by the pager's decay).
    pub fn set_freq_counter(&mut self, value: u8) {
        self.freq_counter = value;
    }

    /// Bump the frequency counter probabilistically (called on access).
    pub fn on_access(&mut self, rng: &mut impl Rng) {
        self.freq_counter = probabilistic_increment(self.freq_counter, rng);
    }

    /// Set the expiry time in unix seconds (0 clears it).
    pub fn set_exptime(&mut self, exptime: u32) {
        self.exptime = exptime;
    }

    /// Drop the value bytes, keeping metadata. Returns the bytes freed.
    ///
    /// Callers going through [`HashTable`] should use
    /// [`HashTable::page_out`] so the memory gauge stays accurate.
    pub fn page_out(&mut self) -> usize {
        self.value.take().map_or(0, |v| v.len())
    }

    /// Resident value bytes, if any.
    pub fn value(&self) -> Option<&[u8]> {
        self.value.as_deref()
    }
}

/// Hash table of one vbucket's documents.
#[derive(Debug)]
pub struct HashTable {
    map: RwLock<HashMap<DocKey, StoredValue>>,
    stats: Arc<EngineStats>,
}

impl HashTable {
    /// Create an empty table accounting against `stats`.
    pub fn new(stats: Arc<EngineStats>) -> Self {
        HashTable {
            map: RwLock::new(HashMap::new()),
            stats,
        }
    }

    fn insert(&self, key: DocKey, sv: StoredValue) {
        let mut map = self.map.write();
        self.stats.add_mem_used(sv.resident_bytes() as u64);
        if let Some(old) = map.insert(key, sv) {
            self.stats.sub_mem_used(old.resident_bytes() as u64);
        }
    }

    /// Insert or update the committed entry for an item.
    pub fn upsert_committed(&self, item: &QueuedItem) {
        self.insert(
            item.key().clone(),
            StoredValue::from_item(item, CommittedState::Committed),
        );
    }

    /// Insert or update the pending entry for a prepare.
    pub fn upsert_pending(&self, item: &QueuedItem) {
        self.insert(
            item.key().clone(),
            StoredValue::from_item(item, CommittedState::Pending),
        );
    }

    /// Commit a prepare: the entry becomes a completed prepare carrying the
    /// committed value.
    pub fn commit(&self, item: &QueuedItem) {
        self.insert(
            item.key().clone(),
            StoredValue::from_item(item, CommittedState::PrepareCommitted),
        );
    }

    /// Abort a prepare: the pending entry is removed.
    pub fn abort(&self, key: &DocKey) {
        let mut map = self.map.write();
        if map.get(key).is_some_and(StoredValue::is_pending) {
            if let Some(old) = map.remove(key) {
                self.stats.sub_mem_used(old.resident_bytes() as u64);
            }
        }
    }

    /// Remove an entry outright.
    pub fn remove(&self, key: &DocKey) -> bool {
        match self.map.write().remove(key) {
            Some(old) => {
                self.stats.sub_mem_used(old.resident_bytes() as u64);
                true
            }
            None => false,
        }
    }

    /// Read an entry, bumping its frequency counter.
    pub fn get(&self, key: &DocKey, rng: &mut impl Rng) -> Option<StoredValue> {
        let mut map = self.map.write();
        let sv = map.get_mut(key)?;
        sv.on_access(rng);
        Some(sv.clone())
    }

    /// Read an entry without touching the frequency counter.
    pub fn peek(&self, key: &DocKey) -> Option<StoredValue> {
        self.map.read().get(key).cloned()
    }

    /// Number of entries.
    pub fn num_items(&self) -> usize {
        self.map.read().len()
    }

    /// Fraction of entries whose value is resident (1.0 for an empty table).
    pub fn resident_ratio(&self) -> f64 {
        let map = self.map.read();
        if map.is_empty() {
            return 1.0;
        }
        let resident = map.values().filter(|sv| sv.is_resident()).count();
        resident as f64 / map.len() as f64
    }

    /// Visit every entry; the visitor returns `false` to stop early.
    ///
    /// The table's write lock is held for the duration of the visit, so
    /// visitors must be cheap per item. Bytes freed by visitors paging
    /// values out are settled against the memory gauge on the way out.
    pub fn visit<F>(&self, mut f: F)
    where
        F: FnMut(&DocKey, &mut StoredValue) -> bool,
    {
        let mut freed = 0usize;
        {
            let mut map = self.map.write();
            for (key, sv) in map.iter_mut() {
                let before = sv.resident_bytes();
                let keep_going = f(key, sv);
                freed += before.saturating_sub(sv.resident_bytes());
                if !keep_going {
                    break;
                }
            }
        }
        if freed > 0 {
            self.stats.sub_mem_used(freed as u64);
        }
    }

    /// Scale every frequency counter down to `percent` of its value.
    ///
    /// Run when counters approach saturation so recent access patterns stay
    /// distinguishable. Returns the number of entries touched.
    pub fn decay_freq_counters(&self, percent: u8) -> usize {
        let percent = u16::from(percent.min(100));
        let mut map = self.map.write();
        for sv in map.values_mut() {
            let decayed = (u16::from(sv.freq_counter) * percent / 100) as u8;
            sv.freq_counter = decayed;
        }
        map.len()
    }

    /// True if any entry's frequency counter has reached its ceiling.
    pub fn has_saturated_freq_counter(&self) -> bool {
        self.map
            .read()
            .values()
            .any(|sv| sv.freq_counter == u8::MAX)
    }

    /// Page out the value for `key`, returning bytes freed.
    pub fn page_out(&self, key: &DocKey) -> usize {
        let freed = self
            .map
            .write()
            .get_mut(key)
            .map_or(0, StoredValue::page_out);
        if freed > 0 {
            self.stats.sub_mem_used(freed as u64);
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Item;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    fn rng() -> SmallRng {
        SmallRng::seed_from_u64(42)
    }

    fn table() -> (HashTable, Arc<EngineStats>) {
        let stats = Arc::new(EngineStats::new());
        (HashTable::new(Arc::clone(&stats)), stats)
    }

    #[test]
    fn test_upsert_and_get() {
        let (ht, stats) = table();
        let item = Item::new_mutation("k", b"v".to_vec());
        item.set_by_seqno(1);
        ht.upsert_committed(&item);
        assert_eq!(stats.mem_used(), 1);

        let sv = ht.get(&DocKey::from("k"), &mut rng()).unwrap();
        assert_eq!(sv.value(), Some(&b"v"[..]));
        assert!(sv.is_resident());
        assert!(!sv.is_pending());
    }

    #[test]
    fn test_replace_settles_memory() {
        let (ht, stats) = table();
        ht.upsert_committed(&Item::new_mutation("k", vec![0u8; 100]));
        assert_eq!(stats.mem_used(), 100);
        ht.upsert_committed(&Item::new_mutation("k", vec![0u8; 40]));
        assert_eq!(stats.mem_used(), 40);
        ht.remove(&DocKey::from("k"));
        assert_eq!(stats.mem_used(), 0);
    }

    #[test]
    fn test_pending_lifecycle() {
        let (ht, _stats) = table();
        let prepare = Item::new_pending(
            "k",
            b"v".to_vec(),
            crate::item::DurabilityRequirements::new(crate::item::DurabilityLevel::Majority),
        );
        ht.upsert_pending(&prepare);
        assert!(ht.peek(&DocKey::from("k")).unwrap().is_pending());

        let commit = Item::new_commit(DocKey::from("k"), b"v".to_vec(), false);
        ht.commit(&commit);
        let sv = ht.peek(&DocKey::from("k")).unwrap();
        assert!(sv.is_completed());
        assert!(!sv.is_pending());
    }

    #[test]
    fn test_abort_removes_only_pending() {
        let (ht, _stats) = table();
        let committed = Item::new_mutation("k", b"v".to_vec());
        ht.upsert_committed(&committed);
        // Abort leaves a committed entry alone.
        ht.abort(&DocKey::from("k"));
        assert!(ht.peek(&DocKey::from("k")).is_some());

        let prepare = Item::new_pending(
            "k2",
            b"v".to_vec(),
            crate::item::DurabilityRequirements::new(crate::item::DurabilityLevel::Majority),
        );
        ht.upsert_pending(&prepare);
        ht.abort(&DocKey::from("k2"));
        assert!(ht.peek(&DocKey::from("k2")).is_none());
    }

    #[test]
    fn test_page_out_keeps_metadata() {
        let (ht, stats) = table();
        let item = Item::new_mutation("k", b"value-bytes".to_vec());
        item.set_by_seqno(3);
        ht.upsert_committed(&item);

        let freed = ht.page_out(&DocKey::from("k"));
        assert_eq!(freed, b"value-bytes".len());
        assert_eq!(stats.mem_used(), 0);
        let sv = ht.peek(&DocKey::from("k")).unwrap();
        assert!(!sv.is_resident());
        assert_eq!(sv.by_seqno(), 3);
        // Paging out again frees nothing.
        assert_eq!(ht.page_out(&DocKey::from("k")), 0);
    }

    #[test]
    fn test_visit_settles_paged_out_bytes() {
        let (ht, stats) = table();
        for i in 0..4 {
            ht.upsert_committed(&Item::new_mutation(
                format!("k{i}").as_str(),
                vec![0u8; 10],
            ));
        }
        assert_eq!(stats.mem_used(), 40);
        ht.visit(|_, sv| {
            sv.page_out();
            true
        });
        assert_eq!(stats.mem_used(), 0);
    }

    #[test]
    fn test_resident_ratio() {
        let (ht, _stats) = table();
        assert_eq!(ht.resident_ratio(), 1.0);
        for i in 0..4 {
            let item = Item::new_mutation(format!("k{i}").as_str(), b"v".to_vec());
            ht.upsert_committed(&item);
        }
        ht.page_out(&DocKey::from("k0"));
        ht.page_out(&DocKey::from("k1"));
        assert!((ht.resident_ratio() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_probabilistic_increment_monotone() {
        let mut rng = rng();
        // At zero the increment always fires.
        assert_eq!(probabilistic_increment(0, &mut rng), 1);
        // At the ceiling the counter never moves.
        assert_eq!(probabilistic_increment(u8::MAX, &mut rng), u8::MAX);

        // High counters move less often than low ones.
        let mut low_moves = 0;
        let mut high_moves = 0;
        for _ in 0..2000 {
            if probabilistic_increment(4, &mut rng) > 4 {
                low_moves += 1;
            }
            if probabilistic_increment(200, &mut rng) > 200 {
                high_moves += 1;
            }
        }
        assert!(low_moves > high_moves);
    }

    #[test]
    fn test_decay_freq_counters() {
        let (ht, _stats) = table();
        for i in 0..3 {
            ht.upsert_committed(&Item::new_mutation(format!("k{i}").as_str(), b"v".to_vec()));
        }
        ht.visit(|_, sv| {
            sv.set_freq_counter(u8::MAX);
            true
        });
        assert!(ht.has_saturated_freq_counter());

        let touched = ht.decay_freq_counters(50);
        assert_eq!(touched, 3);
        assert!(!ht.has_saturated_freq_counter());
        ht.visit(|_, sv| {
            assert_eq!(sv.freq_counter(), 127);
            true
        });

        // Decaying to zero percent clears every counter.
        ht.decay_freq_counters(0);
        ht.visit(|_, sv| {
            assert_eq!(sv.freq_counter(), 0);
            true
        });
    }

    #[test]
    fn test_expiry() {
        let (ht, _stats) = table();
        let item = Item::new_mutation("k", b"v".to_vec());
        ht.upsert_committed(&item);
        ht.visit(|_, sv| {
            sv.set_exptime(100);
            true
        });
        let sv = ht.peek(&DocKey::from("k")).unwrap();
        assert!(!sv.is_expired(99));
        assert!(sv.is_expired(100));
        assert!(sv.is_expired(101));
    }
}
