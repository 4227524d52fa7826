//! Plasma: a persistent, concurrent ordered key-value store.
//!
//! The index is a Bw-tree: each page is a chain of immutable delta nodes
//! over a flat base, installed with single-word CAS on a page table, with an
//! ordered index mapping split keys to page ids. Persistence is a
//! log-structured store of page flush records with an online cleaner, and a
//! quota-driven swapper exchanges clean pages between memory and the log.
//!
//! ```no_run
//! use plasma::{Config, Plasma};
//!
//! let store = Plasma::new(Config::new("/tmp/demo-store"))?;
//! let writer = store.new_writer();
//! writer.insert(b"hello")?;
//! assert!(writer.lookup(b"hello")?.is_some());
//!
//! let mut iter = store.new_iterator();
//! iter.seek_first()?;
//! while iter.valid() {
//!     println!("{:?}", iter.get());
//!     iter.next()?;
//! }
//! store.close()?;
//! # Ok::<(), plasma::Error>(())
//! ```

pub mod config;
pub mod error;
pub mod item;
pub mod quota;
pub mod stats;

mod index;
mod lss;
mod page;
mod pagetable;
mod scheduler;
mod store;

pub use config::Config;
pub use error::{Error, Result};
pub use item::{CompareFn, Item, ItemSizeFn};
pub use quota::{get_memory_quota, set_memory_quota, SwapperContext, TriggerSwapperFn};
pub use stats::{LssInfo, Stats};
pub use store::{Iterator, Plasma, Writer};
