use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::item::{CompareFn, ItemSizeFn};
use crate::quota::{quota_swapper, TriggerSwapperFn};

/// Configuration for a plasma store.
#[derive(Clone)]
pub struct Config {
    /// Delta chain length that triggers page consolidation (default: 200)
    pub max_delta_chain_len: usize,

    /// Item count that triggers a page split (default: 400)
    pub max_page_items: usize,

    /// Item count below which a page merges into its left sibling (default: 25)
    pub min_page_items: usize,

    /// Hard cap on a page's chained LSS flush records before a full
    /// (consolidated) record is forced (default: 4)
    pub max_page_lss_segments: usize,

    /// Total order over item payloads (default: lexicographic bytes)
    pub compare: CompareFn,

    /// Logical item size charged against the memory quota (default: byte length)
    pub item_size: ItemSizeFn,

    /// Size of an item when used as an index key (default: `item_size`)
    pub index_key_size: Option<ItemSizeFn>,

    /// Directory holding the log segment files. `None` forces in-memory-only
    /// operation: no persistence, no cleaning, no auto-swap.
    pub file: Option<PathBuf>,

    /// Size of each LSS flush buffer (default: 1 MiB)
    pub flush_buffer_size: usize,

    /// Size of each log segment file (default: 4 GiB)
    pub lss_log_segment_size: u64,

    /// Memory-map segment files for reads instead of positional reads
    pub use_mmap: bool,

    /// Compress serialized page payloads in flush records
    pub use_compression: bool,

    /// Worker threads driving `persist_all` (default: CPU count)
    pub num_persistor_threads: usize,

    /// Worker threads driving `evict_all` (default: CPU count)
    pub num_evictor_threads: usize,

    /// Run the LSS cleaner as a background daemon
    pub auto_lss_cleaning: bool,

    /// Run the quota swapper as a background daemon
    pub auto_swapper: bool,

    /// Policy deciding when the auto-swapper evicts (default: quota swapper)
    pub trigger_swapper: Option<TriggerSwapperFn>,

    /// Fragmentation percent above which the cleaner compacts (default: 10)
    pub lss_cleaner_threshold: u8,

    /// Fragmentation percent above which persists throttle until the cleaner
    /// catches up (default: `lss_cleaner_threshold + 10`)
    pub lss_cleaner_max_threshold: u8,

    /// Log size below which cleaning is suppressed (default: 16 MiB)
    pub lss_cleaner_min_size: u64,

    /// Log size below which throttling is suppressed (default: 1 GiB,
    /// clamped up to `lss_cleaner_min_size`)
    pub lss_cleaner_throttle_min_size: u64,

    /// Accept snapshot-related tunables. The snapshot subsystem itself is an
    /// external collaborator; these only gate sequence-number stamping.
    pub enable_snapshots: bool,

    /// Max sequence-number sync frequency (default: 360_000)
    pub max_sn_sync_frequency: u32,

    /// Background persist interval in seconds; 0 disables the persistor
    /// daemon (default: 0)
    pub sync_interval: u64,

    /// Derived: persistence enabled. Forced off when `file` is `None`.
    pub(crate) should_persist: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_delta_chain_len: 200,
            max_page_items: 400,
            min_page_items: 25,
            max_page_lss_segments: 4,
            compare: Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)),
            item_size: Arc::new(|itm: &[u8]| itm.len()),
            index_key_size: None,
            file: None,
            flush_buffer_size: 1024 * 1024,
            lss_log_segment_size: 4 * 1024 * 1024 * 1024,
            use_mmap: false,
            use_compression: true,
            num_persistor_threads: 0,
            num_evictor_threads: 0,
            auto_lss_cleaning: true,
            auto_swapper: false,
            trigger_swapper: None,
            lss_cleaner_threshold: 10,
            lss_cleaner_max_threshold: 0,
            lss_cleaner_min_size: 16 * 1024 * 1024,
            lss_cleaner_throttle_min_size: 1024 * 1024 * 1024,
            enable_snapshots: true,
            max_sn_sync_frequency: 0,
            sync_interval: 0,
            should_persist: false,
        }
    }
}

impl Config {
    /// Create a config persisting to the given directory.
    pub fn new(file: impl Into<PathBuf>) -> Self {
        Self {
            file: Some(file.into()),
            ..Default::default()
        }
    }

    /// Create an in-memory-only config.
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn max_delta_chain_len(mut self, len: usize) -> Self {
        self.max_delta_chain_len = len;
        self
    }

    pub fn max_page_items(mut self, n: usize) -> Self {
        self.max_page_items = n;
        self
    }

    pub fn min_page_items(mut self, n: usize) -> Self {
        self.min_page_items = n;
        self
    }

    pub fn max_page_lss_segments(mut self, n: usize) -> Self {
        self.max_page_lss_segments = n;
        self
    }

    pub fn compare(mut self, cmp: CompareFn) -> Self {
        self.compare = cmp;
        self
    }

    pub fn item_size(mut self, size: ItemSizeFn) -> Self {
        self.item_size = size;
        self
    }

    pub fn flush_buffer_size(mut self, bytes: usize) -> Self {
        self.flush_buffer_size = bytes;
        self
    }

    pub fn lss_log_segment_size(mut self, bytes: u64) -> Self {
        self.lss_log_segment_size = bytes;
        self
    }

    pub fn use_mmap(mut self, enabled: bool) -> Self {
        self.use_mmap = enabled;
        self
    }

    pub fn use_compression(mut self, enabled: bool) -> Self {
        self.use_compression = enabled;
        self
    }

    pub fn num_persistor_threads(mut self, n: usize) -> Self {
        self.num_persistor_threads = n;
        self
    }

    pub fn num_evictor_threads(mut self, n: usize) -> Self {
        self.num_evictor_threads = n;
        self
    }

    pub fn auto_lss_cleaning(mut self, enabled: bool) -> Self {
        self.auto_lss_cleaning = enabled;
        self
    }

    pub fn auto_swapper(mut self, enabled: bool) -> Self {
        self.auto_swapper = enabled;
        self
    }

    pub fn trigger_swapper(mut self, trigger: TriggerSwapperFn) -> Self {
        self.trigger_swapper = Some(trigger);
        self
    }

    pub fn lss_cleaner_threshold(mut self, pct: u8) -> Self {
        self.lss_cleaner_threshold = pct;
        self
    }

    pub fn lss_cleaner_max_threshold(mut self, pct: u8) -> Self {
        self.lss_cleaner_max_threshold = pct;
        self
    }

    pub fn lss_cleaner_min_size(mut self, bytes: u64) -> Self {
        self.lss_cleaner_min_size = bytes;
        self
    }

    pub fn sync_interval(mut self, seconds: u64) -> Self {
        self.sync_interval = seconds;
        self
    }

    /// Applies derived defaults and validates the result. Called once at
    /// store construction; every component sees only the normalized config.
    pub(crate) fn normalized(mut self) -> Result<Self> {
        if self.num_persistor_threads == 0 {
            self.num_persistor_threads = num_cpus();
        }
        if self.num_evictor_threads == 0 {
            self.num_evictor_threads = num_cpus();
        }
        if self.trigger_swapper.is_none() {
            self.trigger_swapper = Some(quota_swapper());
        }
        if self.file.is_none() {
            self.auto_lss_cleaning = false;
            self.auto_swapper = false;
            self.should_persist = false;
        } else {
            self.should_persist = true;
        }
        if self.max_sn_sync_frequency == 0 {
            self.max_sn_sync_frequency = 360_000;
        }
        if self.lss_log_segment_size == 0 {
            self.lss_log_segment_size = 4 * 1024 * 1024 * 1024;
        }
        if self.max_page_lss_segments == 0 {
            self.max_page_lss_segments = 4;
        }
        if self.index_key_size.is_none() {
            self.index_key_size = Some(self.item_size.clone());
        }
        if self.lss_cleaner_max_threshold == 0 {
            self.lss_cleaner_max_threshold = self.lss_cleaner_threshold + 10;
        }
        if self.lss_cleaner_throttle_min_size < self.lss_cleaner_min_size {
            self.lss_cleaner_throttle_min_size = self.lss_cleaner_min_size;
        }

        if self.max_page_items < 2 {
            return Err(Error::InvalidConfig(
                "max_page_items must be at least 2".into(),
            ));
        }
        if self.min_page_items >= self.max_page_items {
            return Err(Error::InvalidConfig(format!(
                "min_page_items {} must be below max_page_items {}",
                self.min_page_items, self.max_page_items
            )));
        }
        if self.max_delta_chain_len == 0 {
            return Err(Error::InvalidConfig(
                "max_delta_chain_len must be nonzero".into(),
            ));
        }
        if self.lss_cleaner_threshold > 100 || self.lss_cleaner_max_threshold > 100 {
            return Err(Error::InvalidConfig(
                "cleaner thresholds are percentages, max 100".into(),
            ));
        }
        if self.flush_buffer_size < 4096 {
            return Err(Error::InvalidConfig(
                "flush_buffer_size must be at least 4 KiB".into(),
            ));
        }
        if self.lss_log_segment_size < self.flush_buffer_size as u64 {
            return Err(Error::InvalidConfig(
                "lss_log_segment_size must hold at least one flush buffer".into(),
            ));
        }
        Ok(self)
    }

    pub(crate) fn index_key_size(&self) -> &ItemSizeFn {
        self.index_key_size.as_ref().unwrap_or(&self.item_size)
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("max_delta_chain_len", &self.max_delta_chain_len)
            .field("max_page_items", &self.max_page_items)
            .field("min_page_items", &self.min_page_items)
            .field("max_page_lss_segments", &self.max_page_lss_segments)
            .field("file", &self.file)
            .field("flush_buffer_size", &self.flush_buffer_size)
            .field("lss_log_segment_size", &self.lss_log_segment_size)
            .field("use_mmap", &self.use_mmap)
            .field("use_compression", &self.use_compression)
            .field("num_persistor_threads", &self.num_persistor_threads)
            .field("num_evictor_threads", &self.num_evictor_threads)
            .field("auto_lss_cleaning", &self.auto_lss_cleaning)
            .field("auto_swapper", &self.auto_swapper)
            .field("lss_cleaner_threshold", &self.lss_cleaner_threshold)
            .field("lss_cleaner_max_threshold", &self.lss_cleaner_max_threshold)
            .field("lss_cleaner_min_size", &self.lss_cleaner_min_size)
            .field(
                "lss_cleaner_throttle_min_size",
                &self.lss_cleaner_throttle_min_size,
            )
            .field("enable_snapshots", &self.enable_snapshots)
            .field("sync_interval", &self.sync_interval)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.max_delta_chain_len, 200);
        assert_eq!(config.max_page_items, 400);
        assert_eq!(config.min_page_items, 25);
        assert_eq!(config.flush_buffer_size, 1024 * 1024);
        assert_eq!(config.lss_cleaner_threshold, 10);
        assert!(config.use_compression);
        assert!(config.file.is_none());
    }

    #[test]
    fn test_config_builder() {
        let config = Config::new("/tmp/plasma-test")
            .max_page_items(64)
            .min_page_items(8)
            .flush_buffer_size(64 * 1024)
            .auto_lss_cleaning(false);

        assert_eq!(config.file, Some(PathBuf::from("/tmp/plasma-test")));
        assert_eq!(config.max_page_items, 64);
        assert_eq!(config.min_page_items, 8);
        assert_eq!(config.flush_buffer_size, 64 * 1024);
        assert!(!config.auto_lss_cleaning);
    }

    #[test]
    fn test_normalized_derived_defaults() {
        let config = Config::new("/tmp/plasma-test").normalized().unwrap();
        assert!(config.num_persistor_threads > 0);
        assert!(config.num_evictor_threads > 0);
        assert!(config.trigger_swapper.is_some());
        assert!(config.index_key_size.is_some());
        assert!(config.should_persist);
        assert_eq!(config.lss_cleaner_max_threshold, 20);
        assert_eq!(config.max_sn_sync_frequency, 360_000);
        assert_eq!(
            config.lss_cleaner_throttle_min_size,
            1024 * 1024 * 1024,
            "throttle min already above cleaner min"
        );
    }

    #[test]
    fn test_in_memory_disables_background_io() {
        let config = Config::in_memory()
            .auto_lss_cleaning(true)
            .auto_swapper(true)
            .normalized()
            .unwrap();
        assert!(!config.auto_lss_cleaning);
        assert!(!config.auto_swapper);
        assert!(!config.should_persist);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(Config::new("/tmp/x")
            .max_page_items(8)
            .min_page_items(8)
            .normalized()
            .is_err());
        assert!(Config::new("/tmp/x")
            .flush_buffer_size(16)
            .normalized()
            .is_err());
        assert!(Config::new("/tmp/x")
            .lss_cleaner_threshold(120)
            .normalized()
            .is_err());
    }
}
