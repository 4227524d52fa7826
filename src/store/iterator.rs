//! Forward range scans.
//!
//! An iterator materializes one page at a time: the page's merged view is
//! captured atomically on entry, so reads within a page are consistent;
//! cross-page reads are not a store-wide snapshot. Page hops follow the
//! order index, and each page's view is truncated at the next index entry
//! so racing splits never yield a key twice.

use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;

use crossbeam_epoch as epoch;

use crate::error::Result;
use crate::item::{Item, Key};
use crate::page::{build_view, ViewOutcome};
use crate::store::StoreInner;

/// A forward cursor over the store's live items in comparator order.
pub struct Iterator {
    inner: Arc<StoreInner>,
    items: Vec<Item>,
    pos: usize,
    /// Where the next page load starts; `None` when the scan is exhausted.
    next_from: Option<Key>,
    end_key: Option<Item>,
    exhausted: bool,
}

impl Iterator {
    pub(crate) fn new(inner: Arc<StoreInner>) -> Self {
        Self {
            inner,
            items: Vec::new(),
            pos: 0,
            next_from: None,
            end_key: None,
            exhausted: true,
        }
    }

    /// Bound the scan: iteration stops before the first item at or beyond
    /// `end`. Takes effect on the next seek.
    pub fn set_end_key(&mut self, end: &[u8]) {
        self.end_key = Some(Item::from(end));
    }

    /// Position at the smallest live item.
    pub fn seek_first(&mut self) -> Result<()> {
        self.load_page(Key::Min)?;
        self.skip_exhausted_pages()
    }

    /// Position at the smallest live item at or above `key`.
    pub fn seek(&mut self, key: &[u8]) -> Result<()> {
        self.load_page(Key::item(key))?;
        self.skip_exhausted_pages()
    }

    pub fn valid(&self) -> bool {
        !self.exhausted && self.pos < self.items.len()
    }

    /// The current item, when positioned.
    pub fn get(&self) -> Option<&[u8]> {
        if self.valid() {
            Some(self.items[self.pos].as_ref())
        } else {
            None
        }
    }

    /// Advance to the next item.
    pub fn next(&mut self) -> Result<()> {
        if self.exhausted {
            return Ok(());
        }
        self.pos += 1;
        self.skip_exhausted_pages()
    }

    fn skip_exhausted_pages(&mut self) -> Result<()> {
        while self.pos >= self.items.len() {
            let Some(from) = self.next_from.take() else {
                self.exhausted = true;
                return Ok(());
            };
            self.load_page(from)?;
        }
        Ok(())
    }

    /// Materialize the page containing `from` and position at the first
    /// item at or above it.
    fn load_page(&mut self, from: Key) -> Result<()> {
        let cmp = self.inner.config.compare.clone();
        loop {
            let guard = epoch::pin();
            let (low, pid) = self.inner.index.seek_bound(&from);
            let head = self.inner.table.head(pid, &guard);
            if head.is_null() {
                continue;
            }
            let view = match build_view(head, &cmp, &guard) {
                ViewOutcome::View(v) => v,
                ViewOutcome::SwappedOut => {
                    self.inner.swap_in(pid, head, &guard)?;
                    continue;
                }
                ViewOutcome::Removed => {
                    self.inner.complete_merge(pid, &guard)?;
                    continue;
                }
                ViewOutcome::Missing => continue,
            };
            self.inner.help_view(&view, &guard);

            // Truncate at the next index entry: a concurrent split's right
            // half is visited through its own entry, never twice.
            let bound = self.inner.index.next_above(&low);
            let mut items = view.items;
            if let Some((bound_key, _)) = &bound {
                items.retain(|it| bound_key.order_item(it, &cmp) == CmpOrdering::Greater);
            }
            if let Some(end) = &self.end_key {
                items.retain(|it| cmp(it, end) == CmpOrdering::Less);
            }

            self.pos = match &from {
                Key::Min => 0,
                Key::Max => items.len(),
                Key::Item(probe) => items
                    .binary_search_by(|it| cmp(it, probe))
                    .unwrap_or_else(|i| i),
            };
            self.items = items;
            self.exhausted = false;
            self.next_from = match bound {
                Some((key, _)) => {
                    let past_end = self
                        .end_key
                        .as_ref()
                        .map(|end| key.order_item(end, &cmp) != CmpOrdering::Less)
                        .unwrap_or(false);
                    if past_end {
                        None
                    } else {
                        Some(key)
                    }
                }
                None => None,
            };
            return Ok(());
        }
    }
}
