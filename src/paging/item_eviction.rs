//! Frequency and age histograms driving eviction thresholds.
//!
//! The pager learns thresholds from the population it visits: frequency
//! counters go into a 256-bucket histogram, item ages into log2 buckets.
//! Thresholds are recomputed while learning and then at a periodic interval
//! so each pass evicts approximately the configured percentage.

/// Population below which every visit updates the thresholds.
pub const LEARNING_POPULATION: u64 = 100;

const FREQ_BUCKETS: usize = 256;
const AGE_BUCKETS: usize = 64;

/// Histogram state for one vbucket visit.
#[derive(Debug)]
pub struct ItemEviction {
    freq_histogram: [u64; FREQ_BUCKETS],
    age_histogram: [u64; AGE_BUCKETS],
    population: u64,
    update_interval: u64,
    since_update: u64,
}

impl Default for ItemEviction {
    fn default() -> Self {
        ItemEviction {
            freq_histogram: [0; FREQ_BUCKETS],
            age_histogram: [0; AGE_BUCKETS],
            population: 0,
            update_interval: LEARNING_POPULATION,
            since_update: 0,
        }
    }
}

impl ItemEviction {
    /// Create empty histograms.
    pub fn new() -> Self {
        ItemEviction::default()
    }

    /// Clear the histograms for a new vbucket visit.
    pub fn reset(&mut self) {
        self.freq_histogram = [0; FREQ_BUCKETS];
        self.age_histogram = [0; AGE_BUCKETS];
        self.population = 0;
        self.since_update = 0;
    }

    /// Record one visited item's frequency and age.
    pub fn add(&mut self, freq: u8, age: u64) {
        self.freq_histogram[usize::from(freq)] += 1;
        self.age_histogram[Self::age_bucket(age)] += 1;
        self.population += 1;
        self.since_update += 1;
    }

    /// Number of items recorded since the last reset.
    pub fn population(&self) -> u64 {
        self.population
    }

    /// True while the sample is too small to trust the thresholds.
    pub fn is_learning(&self) -> bool {
        self.population < LEARNING_POPULATION
    }

    /// True when enough items were visited to recompute the thresholds.
    pub fn should_update(&self) -> bool {
        self.since_update >= self.update_interval
    }

    /// Set how many visits elapse between threshold updates.
    pub fn set_update_interval(&mut self, interval: u64) {
        self.update_interval = interval.max(1);
    }

    /// Compute `(freq threshold, age threshold)`.
    ///
    /// `evict_percent` is the percentage of the visited population the next
    /// visits should evict; `age_percentile` selects the age above which an
    /// item counts as old.
    pub fn thresholds(&mut self, evict_percent: f64, age_percentile: u8) -> (u8, u64) {
        self.since_update = 0;
        let freq = Self::percentile(&self.freq_histogram, self.population, evict_percent);
        let age_bucket = Self::percentile(
            &self.age_histogram,
            self.population,
            f64::from(age_percentile),
        );
        let age = if age_bucket == 0 {
            0
        } else {
            1u64 << (age_bucket - 1)
        };
        (freq as u8, age)
    }

    fn age_bucket(age: u64) -> usize {
        ((u64::BITS - age.leading_zeros()) as usize).min(AGE_BUCKETS - 1)
    }

    fn percentile(histogram: &[u64], population: u64, percent: f64) -> usize {
        if population == 0 {
            return 0;
        }
        let target = ((population as f64) * percent.clamp(0.0, 100.0) / 100.0).ceil() as u64;
        let mut cumulative = 0u64;
        for (bucket, count) in histogram.iter().enumerate() {
            cumulative += count;
            if cumulative >= target {
                return bucket;
            }
        }
        histogram.len() - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_learning_then_updating() {
        let mut eviction = ItemEviction::new();
        assert!(eviction.is_learning());
        for _ in 0..LEARNING_POPULATION {
            eviction.add(1, 10);
        }
        assert!(!eviction.is_learning());

        eviction.set_update_interval(50);
        let _ = eviction.thresholds(10.0, 30);
        assert!(!eviction.should_update());
        for _ in 0..50 {
            eviction.add(1, 10);
        }
        assert!(eviction.should_update());
    }

    #[test]
    fn test_freq_threshold_tracks_percentile() {
        let mut eviction = ItemEviction::new();
        // 100 items: half at freq 0, half at freq 200.
        for _ in 0..50 {
            eviction.add(0, 1);
        }
        for _ in 0..50 {
            eviction.add(200, 1);
        }
        let (freq, _) = eviction.thresholds(50.0, 30);
        // Evicting half the population needs only the cold half.
        assert_eq!(freq, 0);

        let (freq, _) = eviction.thresholds(90.0, 30);
        assert_eq!(freq, 200);
    }

    #[test]
    fn test_age_threshold_is_log_bucketed() {
        let mut eviction = ItemEviction::new();
        for _ in 0..100 {
            eviction.add(0, 1024);
        }
        let (_, age) = eviction.thresholds(10.0, 50);
        // 1024 lands in the bucket for [1024, 2047]; the threshold is its
        // lower bound.
        assert_eq!(age, 1024);
    }

    #[test]
    fn test_reset_clears_population() {
        let mut eviction = ItemEviction::new();
        eviction.add(3, 7);
        assert_eq!(eviction.population(), 1);
        eviction.reset();
        assert_eq!(eviction.population(), 0);
        assert!(eviction.is_learning());
    }

    #[test]
    fn test_empty_histogram_thresholds() {
        let mut eviction = ItemEviction::new();
        assert_eq!(eviction.thresholds(50.0, 30), (0, 0));
    }
}
