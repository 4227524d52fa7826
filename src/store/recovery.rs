//! Rebuilding the index and page table from the log on open.
//!
//! The log is scanned forward once to find frame boundaries (truncating at
//! the first corrupt or partial frame), then the collected records are
//! replayed newest-first: the newest record per page wins, older records
//! are superseded, and pages named in a winner's retired list are dead. No
//! item payloads are decoded; pages hydrate lazily on first access.

use std::collections::{HashMap, HashSet};

use crossbeam_epoch::{self as epoch, Owned, Shared};

use crate::error::Result;
use crate::item::Key;
use crate::lss::{RecordKind, RECORD_HEADER_SIZE};
use crate::page::{codec, BasePage, Delta, FlushInfo, PageId, PageNode, SwapoutInfo};
use crate::store::StoreInner;

struct ScannedRecord {
    offset: u64,
    framed: u64,
    header: codec::RecordHeader,
}

pub(crate) fn recover(inner: &StoreInner) -> Result<()> {
    let Some(lss) = &inner.lss else {
        install_initial_page(inner, Key::Max);
        return Ok(());
    };

    let mut records: Vec<ScannedRecord> = Vec::new();
    lss.scan(None, &mut |offset, kind, payload| {
        if matches!(kind, RecordKind::FullPage | RecordKind::DeltaPage) {
            records.push(ScannedRecord {
                offset,
                framed: (payload.len() + RECORD_HEADER_SIZE) as u64,
                header: codec::decode_header(kind, payload)?,
            });
        }
        Ok(true)
    })?;

    let by_offset: HashMap<u64, usize> = records
        .iter()
        .enumerate()
        .map(|(i, r)| (r.offset, i))
        .collect();

    let mut dead: HashSet<PageId> = HashSet::new();
    let mut restored: HashSet<PageId> = HashSet::new();
    let mut lowest_restored: Option<Key> = None;
    let guard = epoch::pin();

    for record in records.iter().rev() {
        let pid = record.header.pid;
        if dead.contains(&pid) || restored.contains(&pid) {
            continue;
        }

        // Walk the prev chain to gather the full record set for this page.
        let mut chain = Vec::new();
        let mut chain_bytes = 0u64;
        let mut item_count = 0usize;
        let mut cursor = Some(record);
        while let Some(rec) = cursor {
            chain.push(rec.offset);
            chain_bytes += rec.framed;
            item_count += rec.header.count as usize;
            cursor = match rec.header.prev_offset {
                Some(prev) => match by_offset.get(&prev) {
                    Some(&i) => Some(&records[i]),
                    None => {
                        tracing::warn!(
                            pid,
                            prev,
                            "page chain references a missing record; truncating chain"
                        );
                        None
                    }
                },
                None => None,
            };
        }

        for (rpid, _) in &record.header.retired {
            dead.insert(*rpid);
        }
        restored.insert(pid);

        let node = Owned::new(PageNode::terminal(
            Delta::Swapout(SwapoutInfo {
                low_key: record.header.low_key.clone(),
                high_key: record.header.high_key.clone(),
                item_count,
                flush: FlushInfo {
                    offset: record.offset,
                    chain,
                    chain_bytes,
                },
                retired: record.header.retired.clone(),
            }),
            item_count,
            0,
        ));
        inner.table.reserve_through(pid);
        inner
            .table
            .cas(pid, Shared::null(), node, &guard)
            .ok()
            .expect("recovered page id must be vacant");
        inner.index.insert(record.header.low_key.clone(), pid);
        inner
            .stats
            .num_pages
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        lss.add_data_size(chain_bytes as i64);

        let is_lower = match &lowest_restored {
            None => true,
            Some(current) => {
                record
                    .header
                    .low_key
                    .order(current, &inner.config.compare)
                    .is_lt()
            }
        };
        if is_lower {
            lowest_restored = Some(record.header.low_key.clone());
        }
    }
    drop(guard);

    match lowest_restored {
        None => install_initial_page(inner, Key::Max),
        // A torn log can lose the leftmost page; the key space must still
        // be fully tiled.
        Some(Key::Min) => {}
        Some(other) => {
            tracing::warn!("leftmost page missing after recovery; installing empty cover");
            install_initial_page(inner, other);
        }
    }

    tracing::info!(
        pages = restored.len(),
        superseded_dead = dead.len(),
        data_size = lss.data_size(),
        used_space = lss.used_space(),
        "recovery complete"
    );
    Ok(())
}

/// Install an empty page spanning `[min, high)`; the fresh-store and
/// torn-log cover page.
pub(crate) fn install_initial_page(inner: &StoreInner, high: Key) {
    let guard = epoch::pin();
    let pid = inner.table.alloc();
    let node = Owned::new(PageNode::terminal(
        Delta::Base(BasePage {
            low_key: Key::Min,
            high_key: high,
            items: Vec::new(),
            stale_flush: None,
            retired: Vec::new(),
        }),
        0,
        0,
    ));
    inner
        .table
        .cas(pid, Shared::null(), node, &guard)
        .ok()
        .expect("initial page slot must be vacant");
    inner.index.insert(Key::Min, pid);
    inner
        .stats
        .num_pages
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
}
