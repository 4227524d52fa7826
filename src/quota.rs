use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-wide memory quota in bytes, shared by every store in the process.
/// Initialized unbounded; mutable at any time via [`set_memory_quota`].
static MEMORY_QUOTA: AtomicU64 = AtomicU64::new(u64::MAX);

/// Sets the process-wide memory quota in bytes.
pub fn set_memory_quota(bytes: u64) {
    MEMORY_QUOTA.store(bytes, Ordering::Relaxed);
}

/// Returns the process-wide memory quota in bytes.
pub fn get_memory_quota() -> u64 {
    MEMORY_QUOTA.load(Ordering::Relaxed)
}

/// Snapshot handed to the swapper trigger policy.
#[derive(Debug, Clone, Copy)]
pub struct SwapperContext {
    /// Resident chain memory of the store, in bytes.
    pub mem_size: u64,
    /// The process-wide quota at evaluation time.
    pub quota: u64,
}

/// Policy deciding whether the auto-swapper should evict right now.
pub type TriggerSwapperFn = Arc<dyn Fn(&SwapperContext) -> bool + Send + Sync>;

/// Default policy: evict while resident memory exceeds the quota.
pub fn quota_swapper() -> TriggerSwapperFn {
    Arc::new(|ctx: &SwapperContext| ctx.mem_size > ctx.quota)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_swapper_policy() {
        let trigger = quota_swapper();
        assert!(trigger(&SwapperContext {
            mem_size: 100,
            quota: 10
        }));
        assert!(!trigger(&SwapperContext {
            mem_size: 10,
            quota: 100
        }));
    }
}
