//! Flushing pages to the LSS, and the cleaner's relocation entry point.

use std::sync::atomic::Ordering;

use crossbeam_epoch::{self as epoch, Atomic, Owned};

use crate::error::Result;
use crate::lss::{cleaner::Relocator, RecordKind, RECORD_HEADER_SIZE};
use crate::page::{self, build_view, codec, Delta, FlushInfo, PageId, PageNode, ViewOutcome};
use crate::store::StoreInner;

impl StoreInner {
    /// Flush one page. A clean page is a no-op unless `force_full`, which
    /// rewrites the page as a single full record at the tail (consolidation
    /// of its LSS chain; used by the cleaner and the segment-chain cap).
    pub(crate) fn persist_page(&self, pid: PageId, force_full: bool) -> Result<()> {
        let Some(lss) = &self.lss else {
            return Ok(());
        };
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
                Delta::Swapout(_) => {
                    if !force_full {
                        return Ok(());
                    }
                    // Relocation of an evicted page: hydrate, then rewrite.
                    self.swap_in(pid, head, &guard)?;
                    continue;
                }
                Delta::Flush(_) if !force_full => return Ok(()),
                _ => {}
            }

            let view = match build_view(head, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v,
                _ => return Ok(()),
            };
            if view.clean && !force_full {
                return Ok(());
            }
            self.help_view(&view, &guard);

            let chain_len_so_far = view
                .live_flush
                .as_ref()
                .map(|f| f.chain.len())
                .unwrap_or(0);
            let full = force_full
                || view.live_flush.is_none()
                || view.ops_since_flush.is_none()
                || chain_len_so_far >= self.config.max_page_lss_segments;

            let compress = self.config.use_compression;
            let (kind, payload, extended) = if full {
                let retired = self.filter_retired(view.retired.clone());
                let payload = codec::encode_full(
                    pid,
                    &view.low_key,
                    &view.high_key,
                    &retired,
                    &view.items,
                    compress,
                )?;
                (RecordKind::FullPage, payload, None)
            } else {
                let prev = view.live_flush.as_ref().expect("checked above");
                let ops = view.ops_since_flush.as_ref().expect("checked above");
                if ops.is_empty() {
                    return Ok(());
                }
                let payload = codec::encode_delta(
                    pid,
                    prev.offset,
                    &view.low_key,
                    &view.high_key,
                    ops,
                    compress,
                )?;
                (RecordKind::DeltaPage, payload, Some(prev.clone()))
            };

            let res = lss.reserve_record(payload.len())?;
            let offset = res.offset;
            let framed = (payload.len() + RECORD_HEADER_SIZE) as u64;
            lss.fill_record(&res, kind, &payload);

            let info = match &extended {
                None => FlushInfo {
                    offset,
                    chain: vec![offset],
                    chain_bytes: framed,
                },
                Some(prev) => {
                    let mut chain = Vec::with_capacity(prev.chain.len() + 1);
                    chain.push(offset);
                    chain.extend_from_slice(&prev.chain);
                    FlushInfo {
                        offset,
                        chain,
                        chain_bytes: framed + prev.chain_bytes,
                    }
                }
            };

            let (chain_len, item_count, chain_mem) = {
                let node = unsafe { head.deref() };
                (node.chain_len, node.item_count, node.chain_mem)
            };
            let node = Owned::new(PageNode {
                delta: Delta::Flush(info),
                next: Atomic::null(),
                chain_len: chain_len + 1,
                item_count,
                chain_mem,
            });
            node.next.store(head, Ordering::Relaxed);
            match self.table.cas(pid, head, node, &guard) {
                Ok(_) => {
                    lss.commit_record(res, true);
                    if full {
                        if let Some(old) = &view.live_flush {
                            lss.add_data_size(-(old.chain_bytes as i64));
                        }
                    }
                    return Ok(());
                }
                Err(lost) => {
                    // The record is already in the log but nothing points at
                    // it: commit it dead and retry against the new head.
                    drop(lost);
                    lss.commit_record(res, false);
                    continue;
                }
            }
        }
    }
}

impl Relocator for StoreInner {
    fn relocate(&self, pid: PageId, record_offset: u64) -> Result<bool> {
        let guard = epoch::pin();
        let head = self.table.head(pid, &guard);
        if head.is_null() {
            return Ok(false);
        }
        let Some(info) = page::lss_chain(head, &guard) else {
            return Ok(false);
        };
        if !info.chain.contains(&record_offset) {
            return Ok(false);
        }

        if matches!(unsafe { &head.deref().delta }, Delta::Remove) {
            // Half-merged victim: its live data moves with the absorber.
            // Complete the merge, then force-flush the page now owning the
            // range so the absorbed items are durable before the head moves.
            let under = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);
            let low_key = match build_view(under, &self.config.compare, &guard) {
                ViewOutcome::View(v) => v.low_key.clone(),
                _ => return Ok(false),
            };
            self.complete_merge(pid, &guard)?;
            drop(guard);
            let (_, owner) = self.index.seek_bound(&low_key);
            self.persist_page(owner, true)?;
            return Ok(true);
        }

        drop(guard);
        self.persist_page(pid, true)?;
        Ok(true)
    }
}
