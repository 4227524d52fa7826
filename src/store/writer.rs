//! The per-thread write handle.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::item::Item;
use crate::page::Op;
use crate::store::StoreInner;

/// A handle for mutating the store. Handles are cheap, independent, and
/// thread-safe; create one per worker thread. Operations pin a reclamation
/// epoch for their duration and are lock-free except for swap-in I/O.
pub struct Writer {
    inner: Arc<StoreInner>,
}

impl Writer {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    fn check_open(&self) -> Result<()> {
        if self.inner.is_closed() {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Insert an item, replacing any item that compares equal.
    pub fn insert(&self, item: &[u8]) -> Result<()> {
        self.check_open()?;
        self.inner.update(item, Op::Insert)
    }

    /// Delete the item comparing equal to `item`, if present.
    pub fn delete(&self, item: &[u8]) -> Result<()> {
        self.check_open()?;
        self.inner.update(item, Op::Delete)
    }

    /// Find the stored item comparing equal to `item`. Absence is `None`,
    /// not an error.
    pub fn lookup(&self, item: &[u8]) -> Result<Option<Item>> {
        self.check_open()?;
        self.inner.lookup_item(item)
    }

    /// Consolidate every page's delta chain.
    pub fn compact_all(&self) -> Result<()> {
        self.check_open()?;
        self.inner.compact_all()
    }
}
