//! The store top level: lifecycle, recovery-on-open, writer/iterator
//! handles, persist-all / evict-all driving, and background daemon wiring.

mod iterator;
mod ops;
mod persist;
mod recovery;
mod swapper;
mod tasks;
mod writer;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub use iterator::Iterator;
pub use writer::Writer;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::index::OrderIndex;
use crate::lss::Lss;
use crate::page::PageId;
use crate::pagetable::PageTable;
use crate::scheduler::Scheduler;
use crate::stats::{Counters, LssInfo, Stats};
use tasks::{CleanerDaemon, PersistorDaemon, SwapperDaemon};

pub(crate) struct StoreInner {
    pub(crate) config: Config,
    pub(crate) index: OrderIndex,
    pub(crate) table: PageTable,
    pub(crate) lss: Option<Lss>,
    pub(crate) stats: Counters,
    pub(crate) closed: AtomicBool,
    /// Serializes cleaner passes; foreground ops never take it.
    pub(crate) cleaning: Mutex<()>,
}

impl StoreInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush every dirty page and sync the log.
    pub(crate) fn persist_all(&self) -> Result<()> {
        let Some(lss) = &self.lss else {
            return Ok(());
        };
        if self.is_closed() {
            return Ok(());
        }
        self.maybe_throttle()?;
        let pids = self.index.page_ids();
        self.fan_out(pids, self.config.num_persistor_threads, |pid| {
            self.persist_page(pid, false)
        })?;
        lss.sync()
    }

    /// Swap out every page, flushing dirty ones first. After a quiescent
    /// pass, resident chain memory for persisted state is zero.
    pub(crate) fn evict_all(&self) -> Result<()> {
        let Some(lss) = &self.lss else {
            return Ok(());
        };
        lss.sync()?;
        let pids = self.index.page_ids();
        self.fan_out(pids, self.config.num_evictor_threads, |pid| {
            self.evict_page(pid).map(|_| ())
        })
    }

    fn fan_out<F>(&self, pids: Vec<PageId>, workers: usize, f: F) -> Result<()>
    where
        F: Fn(PageId) -> Result<()> + Sync,
    {
        if pids.is_empty() {
            return Ok(());
        }
        let workers = workers.clamp(1, pids.len());
        if workers == 1 {
            for pid in pids {
                f(pid)?;
            }
            return Ok(());
        }
        let chunk = pids.len().div_ceil(workers);
        let failure: Mutex<Option<Error>> = Mutex::new(None);
        std::thread::scope(|scope| {
            for part in pids.chunks(chunk) {
                let f = &f;
                let failure = &failure;
                scope.spawn(move || {
                    for pid in part {
                        if failure.lock().unwrap().is_some() {
                            return;
                        }
                        if let Err(e) = f(*pid) {
                            failure.lock().unwrap().get_or_insert(e);
                        }
                    }
                });
            }
        });
        match failure.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Writers block here while fragmentation exceeds the max threshold:
    /// either waiting out the cleaner daemon or driving passes inline.
    fn maybe_throttle(&self) -> Result<()> {
        let Some(lss) = &self.lss else {
            return Ok(());
        };
        for _ in 0..10_000 {
            if lss.is_degraded() {
                return Ok(());
            }
            if lss.used_space() < self.config.lss_cleaner_throttle_min_size
                || lss.fragmentation_pct() <= self.config.lss_cleaner_max_threshold as u64
            {
                return Ok(());
            }
            if self.config.auto_lss_cleaning {
                std::thread::sleep(std::time::Duration::from_millis(1));
            } else if !self.clean_lss_once(8 * 1024 * 1024)? {
                return Ok(());
            }
        }
        tracing::warn!("persist throttle gave up waiting for the cleaner");
        Ok(())
    }

    pub(crate) fn lss_info(&self) -> LssInfo {
        self.lss.as_ref().map(|l| l.info()).unwrap_or_default()
    }
}

/// A plasma store: a persistent, concurrent ordered key-value index over
/// log-structured storage.
pub struct Plasma {
    inner: Arc<StoreInner>,
    runtime: Mutex<Option<tokio::runtime::Runtime>>,
    scheduler: Option<Arc<Scheduler>>,
}

impl Plasma {
    /// Open (creating or recovering) a store.
    pub fn new(config: Config) -> Result<Self> {
        let config = config.normalized()?;
        tracing::info!(?config, "opening plasma store");

        let lss = match &config.file {
            Some(dir) if config.should_persist => Some(Lss::open(
                dir,
                config.lss_log_segment_size,
                config.flush_buffer_size,
                config.use_mmap,
            )?),
            _ => None,
        };

        let index = OrderIndex::new(config.compare.clone());
        let inner = Arc::new(StoreInner {
            index,
            table: PageTable::new(),
            lss,
            stats: Counters::default(),
            closed: AtomicBool::new(false),
            cleaning: Mutex::new(()),
            config,
        });
        recovery::recover(&inner)?;

        let wants_daemons = inner.config.auto_lss_cleaning
            || inner.config.auto_swapper
            || (inner.config.should_persist && inner.config.sync_interval > 0);
        let (runtime, scheduler) = if wants_daemons {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(1)
                .thread_name("plasma-daemon")
                .enable_time()
                .build()?;
            let scheduler = Arc::new(Scheduler::new());
            {
                let _rt = runtime.enter();
                if inner.config.auto_lss_cleaning {
                    scheduler.register(Arc::new(CleanerDaemon {
                        store: inner.clone(),
                    }));
                }
                if inner.config.auto_swapper {
                    scheduler.register(Arc::new(SwapperDaemon {
                        store: inner.clone(),
                    }));
                }
                if inner.config.should_persist && inner.config.sync_interval > 0 {
                    scheduler.register(Arc::new(PersistorDaemon {
                        store: inner.clone(),
                    }));
                }
            }
            (Some(runtime), Some(scheduler))
        } else {
            (None, None)
        };

        Ok(Self {
            inner,
            runtime: Mutex::new(runtime),
            scheduler,
        })
    }

    /// A new write handle. Handles are independent and thread-safe.
    pub fn new_writer(&self) -> Writer {
        Writer::new(self.inner.clone())
    }

    /// A new forward-scan cursor.
    pub fn new_iterator(&self) -> Iterator {
        Iterator::new(self.inner.clone())
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Flush every dirty page and durably sync the log.
    pub fn persist_all(&self) -> Result<()> {
        self.check_open()?;
        self.inner.persist_all()
    }

    /// Swap out every page (flushing dirty ones first).
    pub fn evict_all(&self) -> Result<()> {
        self.check_open()?;
        self.inner.evict_all()
    }

    pub fn get_stats(&self) -> Stats {
        let mut stats = self.inner.stats.snapshot();
        let info = self.inner.lss_info();
        stats.lss_fragmentation_pct = info.fragmentation_pct;
        stats.lss_data_size = info.data_size;
        stats.lss_used_space = info.used_space;
        stats
    }

    pub fn get_lss_info(&self) -> LssInfo {
        self.inner.lss_info()
    }

    /// Stop the daemons (handshake + join), drain pending flushes, and sync
    /// the log. All handles fail with `Closed` afterwards.
    pub fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        tracing::info!("closing plasma store");
        let runtime = self.runtime.lock().unwrap().take();
        if let (Some(runtime), Some(scheduler)) = (runtime, &self.scheduler) {
            runtime.block_on(scheduler.shutdown());
            drop(runtime);
        }
        if let Some(lss) = &self.inner.lss {
            lss.close();
        }
        Ok(())
    }
}

impl Drop for Plasma {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "error while closing store");
        }
    }
}
