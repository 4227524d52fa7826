//! Pages and their delta chains.
//!
//! A page's logical contents are a flat sorted base plus the chain of deltas
//! prepended since the last consolidation, newest first. Chains are read
//! under an epoch guard and modified only by CAS on the page-table head
//! slot, so every walk sees an immutable snapshot.

pub(crate) mod codec;
mod delta;

use std::cmp::Ordering as CmpOrdering;

use crossbeam_epoch::{Guard, Shared};

pub(crate) use delta::{
    BasePage, Delta, FlushInfo, MergeInfo, Op, PageId, PageNode, RetiredPids, SwapoutInfo,
};

use crate::item::{CompareFn, Item, Key};

/// Outcome of a point lookup on one page chain.
pub(crate) enum Lookup {
    Found(Item),
    NotFound,
    /// The probe is at or above the page's effective high bound. When the
    /// boundary came from a split delta, the split is reported so the caller
    /// can help install its order-index entry.
    OutOfRange {
        pending_split: Option<(Item, PageId)>,
    },
    /// Chain is a swapout sentinel; hydrate before retrying.
    SwappedOut,
    /// Page retired by an in-flight merge; help complete, then retry.
    Removed,
}

/// Binary search by the user comparator.
pub(crate) fn find_item<'a>(items: &'a [Item], probe: &[u8], cmp: &CompareFn) -> Option<&'a Item> {
    items
        .binary_search_by(|it| cmp(it, probe))
        .ok()
        .map(|i| &items[i])
}

/// Point lookup over a chain snapshot. Walks newest-first; the first
/// matching delta is authoritative.
pub(crate) fn lookup(
    head: Shared<'_, PageNode>,
    probe: &[u8],
    cmp: &CompareFn,
    guard: &Guard,
) -> Lookup {
    let mut cursor = head;
    loop {
        if cursor.is_null() {
            return Lookup::Removed;
        }
        // Chain nodes are freed only through epoch reclamation after being
        // unlinked; the guard keeps this snapshot alive.
        let node = unsafe { cursor.deref() };
        match &node.delta {
            Delta::Insert(item) => {
                if cmp(item, probe) == CmpOrdering::Equal {
                    return Lookup::Found(item.clone());
                }
            }
            Delta::Delete(item) => {
                if cmp(item, probe) == CmpOrdering::Equal {
                    return Lookup::NotFound;
                }
            }
            Delta::Split { split_key, right } => {
                if cmp(probe, split_key) != CmpOrdering::Less {
                    return Lookup::OutOfRange {
                        pending_split: Some((split_key.clone(), *right)),
                    };
                }
            }
            Delta::Merge(merge) => {
                if merge.high_key.order_item(probe, cmp) != CmpOrdering::Greater {
                    return Lookup::OutOfRange {
                        pending_split: None,
                    };
                }
                if merge.low_key.order_item(probe, cmp) != CmpOrdering::Greater {
                    // The absorbed range is decided entirely by this node;
                    // anything newer was already visited.
                    return match find_item(&merge.items, probe, cmp) {
                        Some(item) => Lookup::Found(item.clone()),
                        None => Lookup::NotFound,
                    };
                }
            }
            Delta::Flush(_) => {}
            Delta::Remove => return Lookup::Removed,
            Delta::Swapout(_) => return Lookup::SwappedOut,
            Delta::Base(base) => {
                if base.high_key.order_item(probe, cmp) != CmpOrdering::Greater {
                    return Lookup::OutOfRange {
                        pending_split: None,
                    };
                }
                return match find_item(&base.items, probe, cmp) {
                    Some(item) => Lookup::Found(item.clone()),
                    None => Lookup::NotFound,
                };
            }
        }
        cursor = node.next.load(std::sync::atomic::Ordering::Acquire, guard);
    }
}

/// A materialized page snapshot: the merged, live, sorted contents plus the
/// bookkeeping a consolidation, flush, or eviction needs.
pub(crate) struct View {
    pub low_key: Key,
    /// Effective exclusive upper bound after splits and merges.
    pub high_key: Key,
    pub items: Vec<Item>,
    pub chain_len: usize,
    pub chain_mem: usize,
    /// LSS chain currently covering this page's persisted state.
    pub live_flush: Option<FlushInfo>,
    /// Head is a flush delta: nothing to persist.
    pub clean: bool,
    /// Operations above the newest flush delta, oldest first. `None` when a
    /// structural delta intervened, forcing the next flush to be full.
    pub ops_since_flush: Option<Vec<(Op, Item)>>,
    pub retired: RetiredPids,
    /// Unfinished splits observed in the chain (index entry may be missing).
    pub pending_splits: Vec<(Item, PageId)>,
    /// Right pages absorbed by merge deltas in this chain, with the low key
    /// each covered, for finishing their retirement.
    pub merged_pids: Vec<(PageId, Key)>,
}

pub(crate) enum ViewOutcome {
    View(Box<View>),
    SwappedOut,
    Removed,
    Missing,
}

/// Materialize a chain snapshot into a flat sorted view, O(base + deltas).
pub(crate) fn build_view(
    head: Shared<'_, PageNode>,
    cmp: &CompareFn,
    guard: &Guard,
) -> ViewOutcome {
    if head.is_null() {
        return ViewOutcome::Missing;
    }

    struct SeqOp {
        seq: usize,
        op: Op,
        item: Item,
    }

    let mut ops: Vec<SeqOp> = Vec::new();
    let mut effective_high: Option<Key> = None;
    let mut merge_runs: Vec<(Key, Vec<Item>)> = Vec::new();
    let mut retired: RetiredPids = Vec::new();
    let mut pending_splits = Vec::new();
    let mut merged_pids = Vec::new();
    let mut flush: Option<FlushInfo> = None;
    // A flush delta in the chain means the ops above it are exactly the
    // unpersisted tail. A base's stale flush info gives no such guarantee:
    // consolidation folds unpersisted ops into the base.
    let mut flush_node_seen = false;
    let mut smo_above_flush = false;
    let mut ops_above_flush = 0usize;

    let (head_len, head_mem) = {
        let node = unsafe { head.deref() };
        (node.chain_len, node.chain_mem)
    };
    let clean = matches!(unsafe { &head.deref().delta }, Delta::Flush(_));

    let mut seq = 0usize;
    let mut cursor = head;
    let (low_key, base_high, base_items) = loop {
        if cursor.is_null() {
            return ViewOutcome::Missing;
        }
        let node = unsafe { cursor.deref() };
        match &node.delta {
            Delta::Insert(item) => {
                ops.push(SeqOp {
                    seq,
                    op: Op::Insert,
                    item: item.clone(),
                });
                if flush.is_none() {
                    ops_above_flush += 1;
                }
            }
            Delta::Delete(item) => {
                ops.push(SeqOp {
                    seq,
                    op: Op::Delete,
                    item: item.clone(),
                });
                if flush.is_none() {
                    ops_above_flush += 1;
                }
            }
            Delta::Split { split_key, right } => {
                if effective_high.is_none() {
                    effective_high = Some(Key::Item(split_key.clone()));
                }
                pending_splits.push((split_key.clone(), *right));
                if flush.is_none() {
                    smo_above_flush = true;
                }
            }
            Delta::Merge(merge) => {
                if effective_high.is_none() {
                    effective_high = Some(merge.high_key.clone());
                }
                merge_runs.push((merge.low_key.clone(), merge.items.clone()));
                retired.extend(merge.retired.iter().copied());
                merged_pids.push((merge.right_pid, merge.low_key.clone()));
                if flush.is_none() {
                    smo_above_flush = true;
                }
            }
            Delta::Flush(info) => {
                if flush.is_none() {
                    flush = Some(info.clone());
                    flush_node_seen = true;
                }
            }
            Delta::Remove => return ViewOutcome::Removed,
            Delta::Swapout(_) => return ViewOutcome::SwappedOut,
            Delta::Base(base) => {
                retired.extend(base.retired.iter().copied());
                if flush.is_none() {
                    flush = base.stale_flush.clone();
                }
                break (base.low_key.clone(), base.high_key.clone(), &base.items);
            }
        }
        seq += 1;
        cursor = node.next.load(std::sync::atomic::Ordering::Acquire, guard);
    };

    let high_key = effective_high.unwrap_or(base_high);
    let in_range = |item: &Item| high_key.order_item(item, cmp) == CmpOrdering::Greater;

    // Newest op per key wins. Sort by (key, seq): the lowest seq is the
    // newest delta, so dedup keeps it.
    ops.sort_by(|a, b| match cmp(&a.item, &b.item) {
        CmpOrdering::Equal => a.seq.cmp(&b.seq),
        other => other,
    });
    ops.dedup_by(|next, first| cmp(&first.item, &next.item) == CmpOrdering::Equal);

    // Base and merge runs cover disjoint, ascending ranges: the base spans
    // [low, base.high) and each merge picks up where the previous bound
    // ended. Walking merges oldest-first restores ascending order.
    let mut underlay: Vec<Item> = Vec::with_capacity(
        base_items.len() + merge_runs.iter().map(|(_, run)| run.len()).sum::<usize>(),
    );
    underlay.extend(base_items.iter().filter(|it| in_range(it)).cloned());
    for (_, run) in merge_runs.iter().rev() {
        underlay.extend(run.iter().filter(|it| in_range(it)).cloned());
    }

    // Two-pointer merge of the sorted underlay with the sorted op list.
    let mut items = Vec::with_capacity(underlay.len() + ops.len());
    let mut u = underlay.into_iter().peekable();
    let mut o = ops
        .into_iter()
        .filter(|op| in_range(&op.item))
        .peekable();
    loop {
        match (u.peek(), o.peek()) {
            (Some(ui), Some(oi)) => match cmp(ui, &oi.item) {
                CmpOrdering::Less => items.push(u.next().unwrap()),
                CmpOrdering::Greater => {
                    let op = o.next().unwrap();
                    if op.op == Op::Insert {
                        items.push(op.item);
                    }
                }
                CmpOrdering::Equal => {
                    u.next();
                    let op = o.next().unwrap();
                    if op.op == Op::Insert {
                        items.push(op.item);
                    }
                }
            },
            (Some(_), None) => items.push(u.next().unwrap()),
            (None, Some(_)) => {
                let op = o.next().unwrap();
                if op.op == Op::Insert {
                    items.push(op.item);
                }
            }
            (None, None) => break,
        }
    }

    // Ops above the newest flush, oldest first, for incremental records.
    let ops_since_flush = if smo_above_flush || !flush_node_seen {
        None
    } else {
        let mut since: Vec<(Op, Item)> = Vec::with_capacity(ops_above_flush);
        let mut cursor = head;
        let mut collected = Vec::new();
        for _ in 0..ops_above_flush {
            let node = unsafe { cursor.deref() };
            match &node.delta {
                Delta::Insert(item) => collected.push((Op::Insert, item.clone())),
                Delta::Delete(item) => collected.push((Op::Delete, item.clone())),
                _ => {}
            }
            cursor = node.next.load(std::sync::atomic::Ordering::Acquire, guard);
        }
        since.extend(collected.into_iter().rev());
        Some(since)
    };

    ViewOutcome::View(Box::new(View {
        low_key,
        high_key,
        items,
        chain_len: head_len,
        chain_mem: head_mem,
        live_flush: flush,
        clean,
        ops_since_flush,
        retired,
        pending_splits,
        merged_pids,
    }))
}

/// The LSS record offsets currently holding this page's persisted state.
/// `None` when the page has never been flushed. A remove delta is skipped:
/// a half-merged page's records stay attributed to it until its slot is
/// cleared.
pub(crate) fn lss_chain(head: Shared<'_, PageNode>, guard: &Guard) -> Option<FlushInfo> {
    let mut cursor = head;
    while !cursor.is_null() {
        let node = unsafe { cursor.deref() };
        match &node.delta {
            Delta::Flush(info) => return Some(info.clone()),
            Delta::Swapout(info) => return Some(info.flush.clone()),
            Delta::Base(base) => return base.stale_flush.clone(),
            _ => {}
        }
        cursor = node.next.load(std::sync::atomic::Ordering::Acquire, guard);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_epoch::{self as epoch, Atomic, Owned};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn cmp() -> CompareFn {
        Arc::new(|a: &[u8], b: &[u8]| a.cmp(b))
    }

    fn item(bytes: &[u8]) -> Item {
        Arc::from(bytes)
    }

    fn base_chain(items: &[&[u8]]) -> Atomic<PageNode> {
        let base = BasePage {
            low_key: Key::Min,
            high_key: Key::Max,
            items: items.iter().map(|b| item(b)).collect(),
            stale_flush: None,
            retired: Vec::new(),
        };
        let count = base.items.len();
        Atomic::new(PageNode::terminal(Delta::Base(base), count, 0))
    }

    fn push(head: &Atomic<PageNode>, delta: Delta) {
        let guard = epoch::pin();
        let current = head.load(Ordering::Acquire, &guard);
        let (len, count, mem) = {
            let node = unsafe { current.deref() };
            (node.chain_len, node.item_count, node.chain_mem)
        };
        let node = Owned::new(PageNode {
            delta,
            next: Atomic::null(),
            chain_len: len + 1,
            item_count: count,
            chain_mem: mem,
        });
        node.next.store(current, Ordering::Relaxed);
        head.store(node, Ordering::Release);
    }

    fn lookup_at(head: &Atomic<PageNode>, probe: &[u8]) -> Lookup {
        let guard = epoch::pin();
        let cmp = cmp();
        lookup(head.load(Ordering::Acquire, &guard), probe, &cmp, &guard)
    }

    fn view_of(head: &Atomic<PageNode>) -> Box<View> {
        let guard = epoch::pin();
        let cmp = cmp();
        match build_view(head.load(Ordering::Acquire, &guard), &cmp, &guard) {
            ViewOutcome::View(v) => v,
            _ => panic!("expected a view"),
        }
    }

    #[test]
    fn test_lookup_delta_shadows_base() {
        let head = base_chain(&[b"b", b"d"]);
        push(&head, Delta::Insert(item(b"c")));
        push(&head, Delta::Delete(item(b"b")));

        assert!(matches!(lookup_at(&head, b"c"), Lookup::Found(_)));
        assert!(matches!(lookup_at(&head, b"b"), Lookup::NotFound));
        assert!(matches!(lookup_at(&head, b"d"), Lookup::Found(_)));
        assert!(matches!(lookup_at(&head, b"x"), Lookup::NotFound));
    }

    #[test]
    fn test_lookup_newest_delta_wins() {
        let head = base_chain(&[]);
        push(&head, Delta::Insert(item(b"k")));
        push(&head, Delta::Delete(item(b"k")));
        assert!(matches!(lookup_at(&head, b"k"), Lookup::NotFound));

        push(&head, Delta::Insert(item(b"k")));
        assert!(matches!(lookup_at(&head, b"k"), Lookup::Found(_)));
    }

    #[test]
    fn test_lookup_respects_split_boundary() {
        let head = base_chain(&[b"a", b"m", b"z"]);
        push(
            &head,
            Delta::Split {
                split_key: item(b"m"),
                right: 7,
            },
        );

        assert!(matches!(lookup_at(&head, b"a"), Lookup::Found(_)));
        match lookup_at(&head, b"z") {
            Lookup::OutOfRange {
                pending_split: Some((key, right)),
            } => {
                assert_eq!(key.as_ref(), b"m");
                assert_eq!(right, 7);
            }
            _ => panic!("expected out-of-range with pending split"),
        }
    }

    #[test]
    fn test_lookup_merge_delta_covers_absorbed_range() {
        let head = base_chain(&[b"a"]);
        push(
            &head,
            Delta::Merge(MergeInfo {
                right_pid: 9,
                low_key: Key::item(b"m"),
                high_key: Key::Max,
                items: vec![item(b"n"), item(b"p")],
                retired: Vec::new(),
            }),
        );

        assert!(matches!(lookup_at(&head, b"n"), Lookup::Found(_)));
        assert!(matches!(lookup_at(&head, b"o"), Lookup::NotFound));
        assert!(matches!(lookup_at(&head, b"a"), Lookup::Found(_)));
        // Deletes layered above the merge shadow absorbed items.
        push(&head, Delta::Delete(item(b"n")));
        assert!(matches!(lookup_at(&head, b"n"), Lookup::NotFound));
    }

    #[test]
    fn test_view_merges_ops_and_base() {
        let head = base_chain(&[b"b", b"d", b"f"]);
        push(&head, Delta::Insert(item(b"c")));
        push(&head, Delta::Delete(item(b"d")));
        push(&head, Delta::Insert(item(b"a")));

        let view = view_of(&head);
        let got: Vec<&[u8]> = view.items.iter().map(|i| i.as_ref()).collect();
        assert_eq!(got, vec![b"a".as_ref(), b"b", b"c", b"f"]);
        assert_eq!(view.chain_len, 3);
    }

    #[test]
    fn test_view_split_filters_moved_items() {
        let head = base_chain(&[b"a", b"b", b"x", b"y"]);
        push(&head, Delta::Insert(item(b"z")));
        push(
            &head,
            Delta::Split {
                split_key: item(b"x"),
                right: 3,
            },
        );
        push(&head, Delta::Insert(item(b"c")));

        let view = view_of(&head);
        let got: Vec<&[u8]> = view.items.iter().map(|i| i.as_ref()).collect();
        assert_eq!(got, vec![b"a".as_ref(), b"b", b"c"]);
        match &view.high_key {
            Key::Item(k) => assert_eq!(k.as_ref(), b"x"),
            other => panic!("unexpected high key {other:?}"),
        }
        assert_eq!(view.pending_splits.len(), 1);
        assert!(view.ops_since_flush.is_none(), "smo forces full flush");
    }

    #[test]
    fn test_view_merge_appends_absorbed_run() {
        let head = base_chain(&[b"a", b"c"]);
        // Base originally spanned [min, "m"); absorb ["m", max).
        push(
            &head,
            Delta::Merge(MergeInfo {
                right_pid: 4,
                low_key: Key::item(b"m"),
                high_key: Key::Max,
                items: vec![item(b"m"), item(b"q")],
                retired: vec![(4, 123)],
            }),
        );
        push(&head, Delta::Delete(item(b"q")));
        push(&head, Delta::Insert(item(b"b")));

        let view = view_of(&head);
        let got: Vec<&[u8]> = view.items.iter().map(|i| i.as_ref()).collect();
        assert_eq!(got, vec![b"a".as_ref(), b"b", b"c", b"m"]);
        assert_eq!(view.retired, vec![(4, 123)]);
        assert_eq!(view.merged_pids.len(), 1);
        assert_eq!(view.merged_pids[0].0, 4);
    }

    #[test]
    fn test_view_ops_since_flush() {
        let head = base_chain(&[b"a"]);
        push(&head, Delta::Insert(item(b"b")));
        push(
            &head,
            Delta::Flush(FlushInfo {
                offset: 100,
                chain: vec![100],
                chain_bytes: 64,
            }),
        );
        push(&head, Delta::Insert(item(b"c")));
        push(&head, Delta::Delete(item(b"a")));

        let view = view_of(&head);
        assert!(!view.clean);
        let ops = view.ops_since_flush.as_ref().expect("delta ops available");
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].0, Op::Insert);
        assert_eq!(ops[0].1.as_ref(), b"c");
        assert_eq!(ops[1].0, Op::Delete);
        assert_eq!(ops[1].1.as_ref(), b"a");
        assert_eq!(view.live_flush.as_ref().unwrap().offset, 100);
    }

    #[test]
    fn test_view_clean_when_head_is_flush() {
        let head = base_chain(&[b"a"]);
        push(
            &head,
            Delta::Flush(FlushInfo {
                offset: 50,
                chain: vec![50],
                chain_bytes: 32,
            }),
        );
        let view = view_of(&head);
        assert!(view.clean);
        assert_eq!(view.ops_since_flush.as_deref(), Some(&[][..]));
    }

    #[test]
    fn test_lss_chain_finds_covering_records() {
        let guard = epoch::pin();
        let head = base_chain(&[b"a"]);
        push(&head, Delta::Insert(item(b"b")));
        assert!(lss_chain(head.load(Ordering::Acquire, &guard), &guard).is_none());

        push(
            &head,
            Delta::Flush(FlushInfo {
                offset: 10,
                chain: vec![10, 4],
                chain_bytes: 80,
            }),
        );
        let info = lss_chain(head.load(Ordering::Acquire, &guard), &guard).unwrap();
        assert_eq!(info.chain, vec![10, 4]);
    }
}
