//! Eviction and swap-in: the two halves of the memory/LSS exchange.
//!
//! Eviction replaces a clean page's chain with a swapout sentinel carrying
//! its LSS chain. Swap-in reads that chain back, rebuilds a flat base, and
//! CAS-replaces the sentinel; racing hydrations are resolved by the CAS and
//! losers discard their work.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

use crate::error::Result;
use crate::lss::RecordKind;
use crate::page::{
    build_view, codec, BasePage, Delta, Op, PageId, PageNode, SwapoutInfo, ViewOutcome,
};
use crate::store::StoreInner;

impl StoreInner {
    /// Hydrate a swapped-out page from its LSS chain. Returns after the
    /// page has a resident chain again, whether installed by us or by a
    /// racing thread.
    pub(crate) fn swap_in(
        &self,
        pid: PageId,
        head: Shared<'_, PageNode>,
        guard: &Guard,
    ) -> Result<()> {
        let info = match unsafe { &head.deref().delta } {
            Delta::Swapout(info) => info,
            _ => return Ok(()),
        };
        let lss = self
            .lss
            .as_ref()
            .ok_or_else(|| crate::corruption!("swapped-out page in an in-memory store"))?;

        // Read the record chain: delta records newest-first down to the
        // covering full record.
        let mut batches: Vec<Vec<(Op, crate::item::Item)>> = Vec::new();
        let mut items;
        let mut offset = info.flush.offset;
        loop {
            let (kind, payload) = lss.read_record(offset)?;
            match kind {
                RecordKind::DeltaPage => {
                    let (header, ops) = codec::decode_delta(&payload)?;
                    batches.push(ops);
                    offset = header.prev_offset.ok_or_else(|| {
                        crate::corruption!("delta record at {offset} lacks a predecessor")
                    })?;
                }
                RecordKind::FullPage => {
                    let (_, base_items) = codec::decode_full(&payload)?;
                    items = base_items;
                    break;
                }
                other => {
                    return Err(crate::corruption!(
                        "unexpected {other:?} record in page chain at {offset}"
                    ))
                }
            }
        }

        // Replay delta batches oldest-first on top of the base.
        let cmp = &self.config.compare;
        for ops in batches.iter().rev() {
            for (op, item) in ops {
                match items.binary_search_by(|it| cmp(it, item)) {
                    Ok(i) => match op {
                        Op::Insert => items[i] = item.clone(),
                        Op::Delete => {
                            items.remove(i);
                        }
                    },
                    Err(i) => {
                        if *op == Op::Insert {
                            items.insert(i, item.clone());
                        }
                    }
                }
            }
        }

        let count = items.len();
        let mem = self.items_mem(&items);
        let base = Owned::new(PageNode::terminal(
            Delta::Base(BasePage {
                low_key: info.low_key.clone(),
                high_key: info.high_key.clone(),
                items,
                stale_flush: None,
                retired: info.retired.clone(),
            }),
            count,
            mem,
        ));
        // Hydrated chain: flush delta over base, so the page is immediately
        // clean and re-evictable without another write.
        let node = Owned::new(PageNode {
            delta: Delta::Flush(info.flush.clone()),
            next: Atomic::from(base),
            chain_len: 1,
            item_count: count,
            chain_mem: mem,
        });

        match self.table.cas(pid, head, node, guard) {
            Ok(_) => {
                self.stats.add_mem(mem as i64);
                self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);
                self.stats.num_pages_swap_in.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .num_record_swap_in
                    .fetch_add(count as u64, Ordering::Relaxed);
                self.table.retire_chain(head, guard);
                Ok(())
            }
            Err(lost) => {
                // Another thread hydrated first; discard our build.
                drop_local_chain(lost);
                Ok(())
            }
        }
    }

    /// Evict one page: flush it if dirty, then replace the chain with a
    /// swapout sentinel. Returns whether an eviction happened.
    pub(crate) fn evict_page(&self, pid: PageId) -> Result<bool> {
        if self.lss.is_none() {
            return Ok(false);
        }
        loop {
            let guard = epoch::pin();
            let head = self.table.head(pid, &guard);
            if head.is_null() {
                return Ok(false);
            }
            let flush_info = match unsafe { &head.deref().delta } {
                Delta::Swapout(_) | Delta::Remove => return Ok(false),
                Delta::Flush(info) => info.clone(),
                _ => {
                    // Dirty: write it out first, then re-examine.
                    self.persist_page(pid, false)?;
                    continue;
                }
            };

            let view = match build_view(head, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v,
                _ => return Ok(false),
            };
            // Routing metadata must not leave memory half-installed.
            self.help_view(&view, &guard);

            let count = view.items.len();
            let node = Owned::new(PageNode::terminal(
                Delta::Swapout(SwapoutInfo {
                    low_key: view.low_key.clone(),
                    high_key: view.high_key.clone(),
                    item_count: count,
                    flush: flush_info,
                    retired: self.filter_retired(view.retired.clone()),
                }),
                count,
                0,
            ));
            match self.table.cas(pid, head, node, &guard) {
                Ok(_) => {
                    self.stats.add_mem(-(view.chain_mem as i64));
                    self.stats.num_pages_swap_out.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .num_record_swap_out
                        .fetch_add(count as u64, Ordering::Relaxed);
                    self.table.retire_chain(head, &guard);
                    return Ok(true);
                }
                Err(lost) => {
                    drop(lost);
                    continue;
                }
            }
        }
    }
}

/// Free a locally built two-node chain that lost its install CAS. The nodes
/// were never shared, so they are dropped directly.
fn drop_local_chain(node: Owned<PageNode>) {
    let guard = unsafe { epoch::unprotected() };
    let mut next = node.next.load(Ordering::Relaxed, guard);
    drop(node);
    while !next.is_null() {
        let after = unsafe { next.deref() }.next.load(Ordering::Relaxed, guard);
        drop(unsafe { next.into_owned() });
        next = after;
    }
}
