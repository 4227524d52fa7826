//! Background daemons: periodic persist, LSS cleaning, and quota-driven
//! eviction. Each is a small wrapper that re-reads store state every tick;
//! foreground operations never wait on them except through the documented
//! throttle.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::lss::cleaner;
use crate::quota::{get_memory_quota, SwapperContext};
use crate::scheduler::{Context, Daemon};
use crate::store::StoreInner;

/// Bytes of log the cleaner walks per tick.
const CLEANER_PASS_BUDGET: u64 = 8 * 1024 * 1024;

pub(crate) struct PersistorDaemon {
    pub store: Arc<StoreInner>,
}

#[async_trait::async_trait]
impl Daemon for PersistorDaemon {
    fn name(&self) -> &'static str {
        "persistor"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.store.config.sync_interval.max(1))
    }

    async fn tick(&self, _ctx: Context) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.persist_all())
            .await
            .map_err(|e| {
                crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
    }
}

pub(crate) struct CleanerDaemon {
    pub store: Arc<StoreInner>,
}

#[async_trait::async_trait]
impl Daemon for CleanerDaemon {
    fn name(&self) -> &'static str {
        "lss-cleaner"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(500)
    }

    async fn tick(&self, _ctx: Context) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.clean_lss_once(CLEANER_PASS_BUDGET))
            .await
            .map_err(|e| {
                crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
            .map(|_| ())
    }
}

pub(crate) struct SwapperDaemon {
    pub store: Arc<StoreInner>,
}

#[async_trait::async_trait]
impl Daemon for SwapperDaemon {
    fn name(&self) -> &'static str {
        "auto-swapper"
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(100)
    }

    async fn tick(&self, _ctx: Context) -> Result<()> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.run_swapper_pass())
            .await
            .map_err(|e| {
                crate::error::Error::Io(std::io::Error::new(std::io::ErrorKind::Other, e))
            })?
    }
}

impl StoreInner {
    /// One cleaner pass: compact when fragmentation is over the threshold
    /// and the log is big enough to bother. Returns whether the head moved.
    pub(crate) fn clean_lss_once(&self, budget: u64) -> Result<bool> {
        let Some(lss) = &self.lss else {
            return Ok(false);
        };
        if lss.used_space() < self.config.lss_cleaner_min_size {
            return Ok(false);
        }
        if lss.fragmentation_pct() <= self.config.lss_cleaner_threshold as u64 {
            return Ok(false);
        }
        // One pass at a time; overlapping passes would fight over the head.
        let Ok(_pass) = self.cleaning.try_lock() else {
            return Ok(false);
        };
        cleaner::clean_once(lss, self, budget)
    }

    /// Evict pages while the trigger policy says memory is over budget.
    pub(crate) fn run_swapper_pass(&self) -> Result<()> {
        let Some(trigger) = &self.config.trigger_swapper else {
            return Ok(());
        };
        let ctx = SwapperContext {
            mem_size: self.stats.snapshot().mem_size,
            quota: get_memory_quota(),
        };
        if !trigger(&ctx) {
            return Ok(());
        }
        for pid in self.index.page_ids() {
            self.evict_page(pid)?;
            let ctx = SwapperContext {
                mem_size: self.stats.snapshot().mem_size,
                quota: get_memory_quota(),
            };
            if !trigger(&ctx) {
                break;
            }
        }
        Ok(())
    }
}
