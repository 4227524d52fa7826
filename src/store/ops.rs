//! Per-page operations: delta installs, consolidation, and structural
//! modifications with their helping protocol.
//!
//! Structural modifications are multi-step. Every step after the deciding
//! CAS is deterministic and idempotent, so any thread that observes a
//! half-done split or merge completes the remaining steps before retrying
//! its own operation. Nothing here blocks except swap-in I/O.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::error::Result;
use crate::item::{Item, Key};
use crate::page::{
    self, build_view, BasePage, Delta, Lookup, MergeInfo, Op, PageId, PageNode, RetiredPids,
    View, ViewOutcome,
};
use crate::store::StoreInner;

impl StoreInner {
    pub(crate) fn items_mem(&self, items: &[Item]) -> usize {
        items.iter().map(|it| (self.config.item_size)(it)).sum()
    }

    /// Drop retired-pid entries whose records are already below the log
    /// head: the evidence they guard against is physically gone.
    pub(crate) fn filter_retired(&self, retired: RetiredPids) -> RetiredPids {
        match &self.lss {
            Some(lss) => {
                let head = lss.head();
                retired.into_iter().filter(|(_, off)| *off >= head).collect()
            }
            None => retired,
        }
    }

    /// Insert or delete one item.
    pub(crate) fn update(&self, payload: &[u8], op: Op) -> Result<()> {
        let item: Item = Item::from(payload);
        loop {
            let guard = epoch::pin();
            let (_, pid) = self.index.seek(payload);
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                continue;
            }
            match page::lookup(head, payload, &self.config.compare, &guard) {
                Lookup::OutOfRange {
                    pending_split: Some((key, right)),
                } => {
                    self.index.insert(Key::Item(key), right);
                    continue;
                }
                Lookup::OutOfRange { pending_split: None } => continue,
                Lookup::SwappedOut => {
                    self.swap_in(pid, head, &guard)?;
                    continue;
                }
                Lookup::Removed => {
                    self.complete_merge(pid, &guard)?;
                    continue;
                }
                Lookup::Found(_) | Lookup::NotFound => {}
            }

            let (chain_len, item_count, chain_mem) = {
                let node = unsafe { head.deref() };
                (node.chain_len, node.item_count, node.chain_mem)
            };
            let contribution = (self.config.item_size)(&item);
            let new_count = match op {
                Op::Insert => item_count + 1,
                Op::Delete => item_count.saturating_sub(1),
            };
            let delta = match op {
                Op::Insert => Delta::Insert(item.clone()),
                Op::Delete => Delta::Delete(item.clone()),
            };
            let node = Owned::new(PageNode {
                delta,
                next: Atomic::null(),
                chain_len: chain_len + 1,
                item_count: new_count,
                chain_mem: chain_mem + contribution,
            });
            node.next.store(head, Ordering::Relaxed);
            match self.table.cas(pid, head, node, &guard) {
                Ok(_) => {
                    self.stats.add_mem(contribution as i64);
                    match op {
                        Op::Insert => self.stats.inserts.fetch_add(1, Ordering::Relaxed),
                        Op::Delete => self.stats.deletes.fetch_add(1, Ordering::Relaxed),
                    };
                    drop(guard);
                    return self.maintain(pid, chain_len + 1, new_count);
                }
                Err(lost) => {
                    drop(lost);
                    continue;
                }
            }
        }
    }

    /// Point lookup. Lock-free except for swap-in I/O.
    pub(crate) fn lookup_item(&self, probe: &[u8]) -> Result<Option<Item>> {
        let mut swapped = false;
        loop {
            let guard = epoch::pin();
            let (_, pid) = self.index.seek(probe);
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                continue;
            }
            match page::lookup(head, probe, &self.config.compare, &guard) {
                Lookup::Found(item) => {
                    self.stats.lookups.fetch_add(1, Ordering::Relaxed);
                    if !swapped {
                        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(Some(item));
                }
                Lookup::NotFound => {
                    self.stats.lookups.fetch_add(1, Ordering::Relaxed);
                    if !swapped {
                        self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    }
                    return Ok(None);
                }
                Lookup::OutOfRange {
                    pending_split: Some((key, right)),
                } => {
                    self.index.insert(Key::Item(key), right);
                    continue;
                }
                Lookup::OutOfRange { pending_split: None } => continue,
                Lookup::SwappedOut => {
                    self.swap_in(pid, head, &guard)?;
                    swapped = true;
                    continue;
                }
                Lookup::Removed => {
                    self.complete_merge(pid, &guard)?;
                    continue;
                }
            }
        }
    }

    /// Post-operation threshold checks.
    fn maintain(&self, pid: PageId, chain_len: usize, item_count: usize) -> Result<()> {
        if chain_len > self.config.max_delta_chain_len {
            self.consolidate(pid)?;
        } else if item_count > self.config.max_page_items {
            self.split(pid)?;
        } else if item_count < self.config.min_page_items {
            self.try_merge(pid)?;
        }
        Ok(())
    }

    /// Rebuild a flat base from the chain. Also the repair path that resets
    /// the cached chain statistics to exact values.
    pub(crate) fn consolidate(&self, pid: PageId) -> Result<()> {
        loop {
            let guard = epoch::pin();
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                return Ok(());
            }
            let view = match build_view(head, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v,
                _ => return Ok(()),
            };
            if view.chain_len == 0 {
                return Ok(());
            }
            self.help_view(&view, &guard);

            let contribution = self.items_mem(&view.items);
            let item_count = view.items.len();
            let node = Owned::new(PageNode::terminal(
                Delta::Base(BasePage {
                    low_key: view.low_key.clone(),
                    high_key: view.high_key.clone(),
                    items: view.items.clone(),
                    stale_flush: view.live_flush.clone(),
                    retired: self.filter_retired(view.retired.clone()),
                }),
                item_count,
                contribution,
            ));
            match self.table.cas(pid, head, node, &guard) {
                Ok(_) => {
                    self.stats
                        .add_mem(contribution as i64 - view.chain_mem as i64);
                    self.stats.compacts.fetch_add(1, Ordering::Relaxed);
                    self.table.retire_chain(head, &guard);
                    return Ok(());
                }
                Err(lost) => {
                    drop(lost);
                    continue;
                }
            }
        }
    }

    /// Complete the idempotent tails of any split or merge recorded in a
    /// chain view: installing the order-index entry, and retiring absorbed
    /// pages.
    pub(crate) fn help_view(&self, view: &View, guard: &Guard) {
        for (key, right) in &view.pending_splits {
            self.index.insert(Key::Item(key.clone()), *right);
        }
        for (rpid, rlow) in &view.merged_pids {
            self.retire_right(*rpid, rlow, guard);
        }
    }

    /// Split a page at the median of its consolidated view.
    pub(crate) fn split(&self, pid: PageId) -> Result<()> {
        loop {
            let guard = epoch::pin();
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                return Ok(());
            }
            let view = match build_view(head, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v,
                _ => return Ok(()),
            };
            self.help_view(&view, &guard);
            if view.items.len() <= self.config.max_page_items {
                // The cached item count over-estimated; a consolidation
                // resets it so the trigger stops firing.
                if view.chain_len > 0 {
                    self.consolidate(pid)?;
                }
                return Ok(());
            }

            let mid = view.items.len() / 2;
            let split_key = view.items[mid].clone();
            if (self.config.compare)(&split_key, &view.items[0]) == std::cmp::Ordering::Equal {
                return Ok(());
            }

            let rpid = self.table.alloc();
            let right_items: Vec<Item> = view.items[mid..].to_vec();
            let right_mem = self.items_mem(&right_items);
            let right_count = right_items.len();
            let right = Owned::new(PageNode::terminal(
                Delta::Base(BasePage {
                    low_key: Key::Item(split_key.clone()),
                    high_key: view.high_key.clone(),
                    items: right_items,
                    stale_flush: None,
                    retired: Vec::new(),
                }),
                right_count,
                right_mem,
            ));
            self.table
                .cas(rpid, Shared::null(), right, &guard)
                .ok()
                .expect("fresh page id slot must be empty");

            let key_mem = (self.config.index_key_size())(&split_key);
            let (chain_len, chain_mem) = {
                let node = unsafe { head.deref() };
                (node.chain_len, node.chain_mem)
            };
            let split_node = Owned::new(PageNode {
                delta: Delta::Split {
                    split_key: split_key.clone(),
                    right: rpid,
                },
                next: Atomic::null(),
                chain_len: chain_len + 1,
                item_count: mid,
                chain_mem: chain_mem + key_mem,
            });
            split_node.next.store(head, Ordering::Relaxed);
            match self.table.cas(pid, head, split_node, &guard) {
                Ok(_) => {
                    self.index.insert(Key::Item(split_key), rpid);
                    self.stats.splits.fetch_add(1, Ordering::Relaxed);
                    self.stats.num_pages.fetch_add(1, Ordering::Relaxed);
                    self.stats.add_mem((right_mem + key_mem) as i64);
                    return Ok(());
                }
                Err(lost) => {
                    drop(lost);
                    // Unwind the unreachable right page and retry.
                    let rhead = self.table.head(rpid, &guard);
                    if self.table.clear(rpid, rhead, &guard) {
                        self.table.retire_chain(rhead, &guard);
                    }
                    continue;
                }
            }
        }
    }

    /// Merge an underpopulated page into its left sibling.
    pub(crate) fn try_merge(&self, pid: PageId) -> Result<()> {
        loop {
            let guard = epoch::pin();
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                return Ok(());
            }
            match unsafe { &head.deref().delta } {
                Delta::Remove => {
                    self.complete_merge(pid, &guard)?;
                    return Ok(());
                }
                Delta::Swapout(_) => return Ok(()),
                _ => {}
            }
            let view = match build_view(head, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v,
                _ => return Ok(()),
            };
            if view.items.len() >= self.config.min_page_items
                || matches!(view.low_key, Key::Min)
            {
                // The cached count under-estimated; reset it.
                if view.chain_len > 0 && view.items.len() >= self.config.min_page_items {
                    self.consolidate(pid)?;
                }
                return Ok(());
            }
            self.help_view(&view, &guard);

            let chain_mem = unsafe { head.deref() }.chain_mem;
            let chain_len = unsafe { head.deref() }.chain_len;
            let remove = Owned::new(PageNode {
                delta: Delta::Remove,
                next: Atomic::null(),
                chain_len: chain_len + 1,
                item_count: 0,
                chain_mem,
            });
            remove.next.store(head, Ordering::Relaxed);
            match self.table.cas(pid, head, remove, &guard) {
                Ok(_) => {
                    self.complete_merge(pid, &guard)?;
                    return Ok(());
                }
                Err(lost) => {
                    drop(lost);
                    continue;
                }
            }
        }
    }

    /// Finish a merge whose remove delta is installed: materialize the
    /// victim into its left sibling, drop the index entry, clear the slot.
    /// Safe to call from any thread, any number of times.
    pub(crate) fn complete_merge(&self, rpid: PageId, guard: &Guard) -> Result<()> {
        let rhead = self.table.head(rpid, guard);
        if rhead.is_null() {
            return Ok(());
        }
        if !matches!(unsafe { &rhead.deref().delta }, Delta::Remove) {
            return Ok(());
        }
        let under = unsafe { rhead.deref() }
            .next
            .load(Ordering::Acquire, guard);
        let view = match build_view(under, &self.config.compare, guard) {
            ViewOutcome::View(v) => v,
            _ => return Ok(()),
        };
        self.help_view(&view, guard);

        let mut retired = self.filter_retired(view.retired.clone());
        if let Some(info) = &view.live_flush {
            retired.push((rpid, info.offset));
        }

        loop {
            let Some((_, lpid)) = self.index.prev(&view.low_key) else {
                // The leftmost page is never merged; a missing left sibling
                // means the index entry chain is mid-update. Retry via the
                // caller.
                return Ok(());
            };
            let lhead = self.table.head(lpid, guard);
            if lhead.is_null() {
                continue;
            }
            match unsafe { &lhead.deref().delta } {
                Delta::Remove => {
                    self.complete_merge(lpid, guard)?;
                    continue;
                }
                Delta::Swapout(_) => {
                    self.swap_in(lpid, lhead, guard)?;
                    continue;
                }
                _ => {}
            }
            if chain_has_merge(lhead, rpid, guard) {
                break;
            }
            // The victim's slot is cleared only after a merge delta for it
            // exists; a cleared slot here means another helper finished.
            let rnow = self.table.head(rpid, guard);
            if rnow.is_null() || !matches!(unsafe { &rnow.deref().delta }, Delta::Remove) {
                return Ok(());
            }

            let contribution = self.items_mem(&view.items);
            let (l_len, l_count, l_mem) = {
                let node = unsafe { lhead.deref() };
                (node.chain_len, node.item_count, node.chain_mem)
            };
            let merge = Owned::new(PageNode {
                delta: Delta::Merge(MergeInfo {
                    right_pid: rpid,
                    low_key: view.low_key.clone(),
                    high_key: view.high_key.clone(),
                    items: view.items.clone(),
                    retired: retired.clone(),
                }),
                next: Atomic::null(),
                chain_len: l_len + 1,
                item_count: l_count + view.items.len(),
                chain_mem: l_mem + contribution,
            });
            merge.next.store(lhead, Ordering::Relaxed);
            match self.table.cas(lpid, lhead, merge, guard) {
                Ok(_) => {
                    self.stats.add_mem(contribution as i64);
                    self.stats.merges.fetch_add(1, Ordering::Relaxed);
                    break;
                }
                Err(lost) => {
                    drop(lost);
                    continue;
                }
            }
        }

        self.retire_right(rpid, &view.low_key, guard);
        Ok(())
    }

    /// Idempotent merge epilogue: remove the victim's index entry (only
    /// while it still maps to the victim), clear its slot, and account the
    /// retired chain. Runs after a merge delta for the victim exists.
    pub(crate) fn retire_right(&self, rpid: PageId, rlow: &Key, guard: &Guard) {
        self.index.remove(rlow, rpid);
        let rhead = self.table.head(rpid, guard);
        if rhead.is_null() {
            return;
        }
        if !matches!(unsafe { &rhead.deref().delta }, Delta::Remove) {
            return;
        }
        if self.table.clear(rpid, rhead, guard) {
            if let Some(lss) = &self.lss {
                if let Some(info) = page::lss_chain(rhead, guard) {
                    lss.add_data_size(-(info.chain_bytes as i64));
                }
            }
            let mem = unsafe { rhead.deref() }.chain_mem;
            self.stats.add_mem(-(mem as i64));
            self.stats.num_pages.fetch_sub(1, Ordering::Relaxed);
            self.table.retire_chain(rhead, guard);
        }
    }

    /// Consolidate every page (`Writer::compact_all`).
    pub(crate) fn compact_all(&self) -> Result<()> {
        for pid in self.index.page_ids() {
            self.consolidate(pid)?;
        }
        Ok(())
    }
}

/// Does the chain already carry a merge delta for this victim?
fn chain_has_merge(head: Shared<'_, PageNode>, rpid: PageId, guard: &Guard) -> bool {
    let mut cursor = head;
    while !cursor.is_null() {
        let node = unsafe { cursor.deref() };
        match &node.delta {
            Delta::Merge(m) if m.right_pid == rpid => return true,
            Delta::Base(_) | Delta::Swapout(_) => return false,
            _ => {}
        }
        cursor = node.next.load(Ordering::Acquire, guard);
    }
    false
}
