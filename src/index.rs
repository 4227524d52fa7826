//! The order index: an ordered map from page low key to page id, backing
//! point lookups and page-to-page iteration. Built on a concurrent skiplist;
//! inserts are idempotent and removes are entry-exact, which is what the
//! split/merge helping protocol needs.

use std::ops::Bound;

use crossbeam_skiplist::SkipMap;

use crate::item::{CompareFn, IndexKey, Key};
use crate::page::PageId;

pub(crate) struct OrderIndex {
    map: SkipMap<IndexKey, PageId>,
    cmp: CompareFn,
}

impl OrderIndex {
    pub fn new(cmp: CompareFn) -> Self {
        Self {
            map: SkipMap::new(),
            cmp,
        }
    }

    fn wrap(&self, key: Key) -> IndexKey {
        IndexKey::new(key, self.cmp.clone())
    }

    /// The page owning `probe`: the entry with the greatest low key at or
    /// below it. The leftmost page's `Key::Min` entry makes this total.
    pub fn seek(&self, probe: &[u8]) -> (Key, PageId) {
        self.seek_bound(&Key::item(probe))
    }

    pub fn seek_bound(&self, bound: &Key) -> (Key, PageId) {
        let probe = self.wrap(bound.clone());
        let entry = self
            .map
            .upper_bound(Bound::Included(&probe))
            .or_else(|| self.map.front())
            .expect("order index always holds the leftmost entry");
        (entry.key().key().clone(), *entry.value())
    }

    /// The entry strictly below `bound`: the left sibling during merges.
    pub fn prev(&self, bound: &Key) -> Option<(Key, PageId)> {
        let probe = self.wrap(bound.clone());
        self.map
            .upper_bound(Bound::Excluded(&probe))
            .map(|e| (e.key().key().clone(), *e.value()))
    }

    /// The entry strictly above `bound`: the next page during scans.
    pub fn next_above(&self, bound: &Key) -> Option<(Key, PageId)> {
        let probe = self.wrap(bound.clone());
        self.map
            .lower_bound(Bound::Excluded(&probe))
            .map(|e| (e.key().key().clone(), *e.value()))
    }

    /// Idempotent install of a split key. The first writer wins; helpers
    /// re-issuing the insert observe the existing entry.
    pub fn insert(&self, key: Key, pid: PageId) {
        self.map.get_or_insert(self.wrap(key), pid);
    }

    /// Remove `key` only while it still maps to `pid`. A helper completing a
    /// stale merge cannot disturb a newer entry that reused the key.
    pub fn remove(&self, key: &Key, pid: PageId) -> bool {
        let probe = self.wrap(key.clone());
        if let Some(entry) = self.map.get(&probe) {
            if *entry.value() == pid {
                return entry.remove();
            }
        }
        false
    }

    /// Snapshot of every page id, in key order.
    pub fn page_ids(&self) -> Vec<PageId> {
        self.map.iter().map(|e| *e.value()).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn index() -> OrderIndex {
        OrderIndex::new(Arc::new(|a: &[u8], b: &[u8]| a.cmp(b)))
    }

    #[test]
    fn test_seek_resolves_containing_page() {
        let idx = index();
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);
        idx.insert(Key::item(b"t"), 2);

        assert_eq!(idx.seek(b"a").1, 0);
        assert_eq!(idx.seek(b"m").1, 1);
        assert_eq!(idx.seek(b"p").1, 1);
        assert_eq!(idx.seek(b"t").1, 2);
        assert_eq!(idx.seek(b"zz").1, 2);
    }

    #[test]
    fn test_prev_finds_left_sibling() {
        let idx = index();
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);

        let (key, pid) = idx.prev(&Key::item(b"m")).unwrap();
        assert!(matches!(key, Key::Min));
        assert_eq!(pid, 0);
        assert!(idx.prev(&Key::Min).is_none());
    }

    #[test]
    fn test_next_above_walks_pages() {
        let idx = index();
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);
        idx.insert(Key::item(b"t"), 2);

        let (key, pid) = idx.next_above(&Key::Min).unwrap();
        assert_eq!(key.as_item().unwrap().as_ref(), b"m");
        assert_eq!(pid, 1);
        let (_, pid) = idx.next_above(&key).unwrap();
        assert_eq!(pid, 2);
        assert!(idx.next_above(&Key::item(b"t")).is_none());
    }

    #[test]
    fn test_insert_idempotent() {
        let idx = index();
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);
        // A helper re-issuing the install must not clobber the winner.
        idx.insert(Key::item(b"m"), 99);
        assert_eq!(idx.seek(b"m").1, 1);
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_remove_is_pid_exact() {
        let idx = index();
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);

        assert!(!idx.remove(&Key::item(b"m"), 42), "wrong pid is a no-op");
        assert_eq!(idx.len(), 2);
        assert!(idx.remove(&Key::item(b"m"), 1));
        assert_eq!(idx.len(), 1);
        assert!(!idx.remove(&Key::item(b"m"), 1), "second remove is a no-op");
    }

    #[test]
    fn test_page_ids_in_key_order() {
        let idx = index();
        idx.insert(Key::item(b"t"), 2);
        idx.insert(Key::Min, 0);
        idx.insert(Key::item(b"m"), 1);
        assert_eq!(idx.page_ids(), vec![0, 1, 2]);
    }
}
