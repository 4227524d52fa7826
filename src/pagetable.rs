//! The page table: page-id to chain-head mapping.
//!
//! A two-level directory of fixed-size chunks. Chunk pointers are installed
//! with CAS on first touch and never move, so `get` is a pair of loads with
//! no locking. Head installs are single-word CAS on the slot.

use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use crossbeam_epoch::{Atomic, Guard, Owned, Shared};

use crate::page::{PageId, PageNode};

const CHUNK_BITS: usize = 12;
const CHUNK_SIZE: usize = 1 << CHUNK_BITS;
const MAX_CHUNKS: usize = 1 << 16;

struct Chunk {
    slots: [Atomic<PageNode>; CHUNK_SIZE],
}

impl Chunk {
    fn new() -> Box<Self> {
        const NULL: Atomic<PageNode> = Atomic::null();
        Box::new(Self {
            slots: [NULL; CHUNK_SIZE],
        })
    }
}

pub(crate) struct PageTable {
    chunks: Box<[AtomicPtr<Chunk>]>,
    next_pid: AtomicU64,
}

impl PageTable {
    pub fn new() -> Self {
        let chunks: Vec<AtomicPtr<Chunk>> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            chunks: chunks.into_boxed_slice(),
            next_pid: AtomicU64::new(0),
        }
    }

    /// Allocate a fresh page id. Ids are monotonic and never reused within a
    /// session.
    pub fn alloc(&self) -> PageId {
        let pid = self.next_pid.fetch_add(1, Ordering::Relaxed);
        assert!(
            (pid as usize) < MAX_CHUNKS << CHUNK_BITS,
            "page table capacity exhausted"
        );
        pid
    }

    /// Raise the allocation watermark; used by recovery after restoring
    /// persisted page ids.
    pub fn reserve_through(&self, pid: PageId) {
        let mut current = self.next_pid.load(Ordering::Relaxed);
        while current <= pid {
            match self.next_pid.compare_exchange_weak(
                current,
                pid + 1,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    fn chunk(&self, pid: PageId) -> Option<&Chunk> {
        let index = pid as usize >> CHUNK_BITS;
        let ptr = self.chunks[index].load(Ordering::Acquire);
        if ptr.is_null() {
            None
        } else {
            // Chunks are never freed while the table is alive.
            Some(unsafe { &*ptr })
        }
    }

    fn chunk_or_install(&self, pid: PageId) -> &Chunk {
        let index = pid as usize >> CHUNK_BITS;
        let existing = self.chunks[index].load(Ordering::Acquire);
        if !existing.is_null() {
            return unsafe { &*existing };
        }
        let fresh = Box::into_raw(Chunk::new());
        match self.chunks[index].compare_exchange(
            std::ptr::null_mut(),
            fresh,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // Lost the install race; discard ours.
                drop(unsafe { Box::from_raw(fresh) });
                unsafe { &*winner }
            }
        }
    }

    fn slot(&self, pid: PageId) -> Option<&Atomic<PageNode>> {
        self.chunk(pid)
            .map(|c| &c.slots[pid as usize & (CHUNK_SIZE - 1)])
    }

    /// Current chain head for the page, or null if the page does not exist
    /// (never created, or retired by a merge).
    pub fn head<'g>(&self, pid: PageId, guard: &'g Guard) -> Shared<'g, PageNode> {
        match self.slot(pid) {
            Some(slot) => slot.load(Ordering::Acquire, guard),
            None => Shared::null(),
        }
    }

    /// Install a new head if the slot still holds `current`. On failure the
    /// new node is handed back for the caller to retry or discard.
    pub fn cas<'g>(
        &self,
        pid: PageId,
        current: Shared<'_, PageNode>,
        new: Owned<PageNode>,
        guard: &'g Guard,
    ) -> std::result::Result<Shared<'g, PageNode>, Owned<PageNode>> {
        let slot = if current.is_null() {
            &self.chunk_or_install(pid).slots[pid as usize & (CHUNK_SIZE - 1)]
        } else {
            self.slot(pid).expect("page with a head must have a chunk")
        };
        match slot.compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire, guard) {
            Ok(shared) => Ok(shared),
            Err(err) => Err(err.new),
        }
    }

    /// Clear a retired page's slot. Succeeds only against the expected head.
    pub fn clear(
        &self,
        pid: PageId,
        current: Shared<'_, PageNode>,
        guard: &Guard,
    ) -> bool {
        match self.slot(pid) {
            Some(slot) => slot
                .compare_exchange(
                    current,
                    Shared::null(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                    guard,
                )
                .is_ok(),
            None => false,
        }
    }

    /// Retire every node of an unlinked chain. The chain must no longer be
    /// reachable from any slot.
    pub fn retire_chain(&self, head: Shared<'_, PageNode>, guard: &Guard) {
        let mut cursor = head;
        while !cursor.is_null() {
            let node = unsafe { cursor.deref() };
            let next = node.next.load(Ordering::Acquire, guard);
            unsafe { guard.defer_destroy(cursor) };
            cursor = next;
        }
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        // Exclusive access: free every chain still installed, then the
        // chunks themselves. Deferred nodes are handled by the collector.
        let guard = unsafe { crossbeam_epoch::unprotected() };
        for chunk_ptr in self.chunks.iter() {
            let ptr = chunk_ptr.load(Ordering::Acquire);
            if ptr.is_null() {
                continue;
            }
            let chunk = unsafe { Box::from_raw(ptr) };
            for slot in chunk.slots.iter() {
                let mut cursor = slot.load(Ordering::Acquire, guard);
                while !cursor.is_null() {
                    let next = unsafe { cursor.deref() }.next.load(Ordering::Acquire, guard);
                    drop(unsafe { cursor.into_owned() });
                    cursor = next;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::Key;
    use crate::page::{BasePage, Delta};
    use crossbeam_epoch as epoch;

    fn empty_base() -> Owned<PageNode> {
        Owned::new(PageNode::terminal(
            Delta::Base(BasePage {
                low_key: Key::Min,
                high_key: Key::Max,
                items: Vec::new(),
                stale_flush: None,
                retired: Vec::new(),
            }),
            0,
            0,
        ))
    }

    #[test]
    fn test_alloc_monotonic() {
        let table = PageTable::new();
        assert_eq!(table.alloc(), 0);
        assert_eq!(table.alloc(), 1);
        table.reserve_through(10);
        assert_eq!(table.alloc(), 11);
    }

    #[test]
    fn test_install_and_head() {
        let table = PageTable::new();
        let pid = table.alloc();
        let guard = epoch::pin();

        assert!(table.head(pid, &guard).is_null());
        assert!(table.cas(pid, Shared::null(), empty_base(), &guard).is_ok());
        assert!(!table.head(pid, &guard).is_null());
    }

    #[test]
    fn test_cas_fails_on_stale_head() {
        let table = PageTable::new();
        let pid = table.alloc();
        let guard = epoch::pin();

        assert!(table.cas(pid, Shared::null(), empty_base(), &guard).is_ok());
        // A CAS expecting the pre-install head must fail.
        assert!(table.cas(pid, Shared::null(), empty_base(), &guard).is_err());

        let head = table.head(pid, &guard);
        assert!(table.cas(pid, head, empty_base(), &guard).is_ok());
    }

    #[test]
    fn test_clear_retires_page() {
        let table = PageTable::new();
        let pid = table.alloc();
        let guard = epoch::pin();

        assert!(table.cas(pid, Shared::null(), empty_base(), &guard).is_ok());
        let head = table.head(pid, &guard);
        assert!(table.clear(pid, head, &guard));
        assert!(table.head(pid, &guard).is_null());
        table.retire_chain(head, &guard);
    }

    #[test]
    fn test_sparse_pids_span_chunks() {
        let table = PageTable::new();
        let guard = epoch::pin();
        let far = (CHUNK_SIZE * 3 + 17) as PageId;
        table.reserve_through(far);
        assert!(table.cas(far, Shared::null(), empty_base(), &guard).is_ok());
        assert!(!table.head(far, &guard).is_null());
        assert!(table.head(far - 1, &guard).is_null());
    }
}
