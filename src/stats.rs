use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live operation counters, updated lock-free from writers and daemons.
/// Counters use `Relaxed` ordering; readers may observe slightly stale
/// values but never torn ones.
#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub inserts: AtomicU64,
    pub deletes: AtomicU64,
    pub lookups: AtomicU64,
    pub compacts: AtomicU64,
    pub splits: AtomicU64,
    pub merges: AtomicU64,

    /// Resident chain memory in bytes. Signed: concurrent retire/install can
    /// transiently decrement before the matching increment lands.
    pub mem_size: AtomicI64,
    pub num_pages: AtomicI64,

    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,

    pub num_record_swap_out: AtomicU64,
    pub num_record_swap_in: AtomicU64,
    pub num_pages_swap_out: AtomicU64,
    pub num_pages_swap_in: AtomicU64,
}

impl Counters {
    pub fn add_mem(&self, bytes: i64) {
        self.mem_size.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Stats {
        Stats {
            inserts: self.inserts.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            compacts: self.compacts.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            merges: self.merges.load(Ordering::Relaxed),
            mem_size: self.mem_size.load(Ordering::Relaxed).max(0) as u64,
            num_pages: self.num_pages.load(Ordering::Relaxed).max(0) as u64,
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            num_record_swap_out: self.num_record_swap_out.load(Ordering::Relaxed),
            num_record_swap_in: self.num_record_swap_in.load(Ordering::Relaxed),
            num_pages_swap_out: self.num_pages_swap_out.load(Ordering::Relaxed),
            num_pages_swap_in: self.num_pages_swap_in.load(Ordering::Relaxed),
            lss_fragmentation_pct: 0,
            lss_data_size: 0,
            lss_used_space: 0,
        }
    }
}

/// Point-in-time snapshot of store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub inserts: u64,
    pub deletes: u64,
    pub lookups: u64,
    pub compacts: u64,
    pub splits: u64,
    pub merges: u64,
    pub mem_size: u64,
    pub num_pages: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub num_record_swap_out: u64,
    pub num_record_swap_in: u64,
    pub num_pages_swap_out: u64,
    pub num_pages_swap_in: u64,
    pub lss_fragmentation_pct: u64,
    pub lss_data_size: u64,
    pub lss_used_space: u64,
}

impl std::fmt::Display for Stats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stats(memory_size={} num_pages={} inserts={} deletes={} lookups={} \
             compacts={} splits={} merges={} cache_hits={} cache_misses={} \
             rec_swapout={} rec_swapin={} pages_swapout={} pages_swapin={} \
             lss_frag={}% lss_data_size={} lss_used_space={})",
            self.mem_size,
            self.num_pages,
            self.inserts,
            self.deletes,
            self.lookups,
            self.compacts,
            self.splits,
            self.merges,
            self.cache_hits,
            self.cache_misses,
            self.num_record_swap_out,
            self.num_record_swap_in,
            self.num_pages_swap_out,
            self.num_pages_swap_in,
            self.lss_fragmentation_pct,
            self.lss_data_size,
            self.lss_used_space,
        )
    }
}

/// LSS occupancy summary returned by `Plasma::get_lss_info`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LssInfo {
    /// `(used_space - data_size) * 100 / used_space`, the percent of the log
    /// occupied by dead records.
    pub fragmentation_pct: u64,
    /// Bytes of live records.
    pub data_size: u64,
    /// `tail - head`, the span of the log still on disk.
    pub used_space: u64,
}

impl std::fmt::Display for LssInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "lss(frag={}% data_size={} used_space={})",
            self.fragmentation_pct, self.data_size, self.used_space
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counters() {
        let counters = Counters::default();
        counters.inserts.fetch_add(5, Ordering::Relaxed);
        counters.add_mem(1024);
        counters.add_mem(-24);

        let stats = counters.snapshot();
        assert_eq!(stats.inserts, 5);
        assert_eq!(stats.mem_size, 1000);
    }

    #[test]
    fn test_negative_mem_clamped() {
        let counters = Counters::default();
        counters.add_mem(-50);
        assert_eq!(counters.snapshot().mem_size, 0);
    }
}
