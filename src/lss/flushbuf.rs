use std::cell::UnsafeCell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use super::segment::SegmentSet;
use crate::error::{Error, Result};

/// Ring depth. Reservations block once every buffer is sealed and waiting on
/// the flusher.
const NUM_BUFFERS: usize = 4;

const UNSEALED: usize = usize::MAX;

/// A reserved byte range. The holder owns bytes `[start, start + len)` of
/// buffer `buf` exclusively until `commit`.
#[derive(Debug)]
pub(crate) struct Reservation {
    pub offset: u64,
    pub len: usize,
    buf: usize,
    start: usize,
}

struct BufCell(UnsafeCell<Box<[u8]>>);

// Reservations hand out disjoint ranges, and a buffer is recycled only after
// every reservation in it committed and the flusher wrote it out, so
// concurrent cell access always touches non-overlapping bytes.
unsafe impl Sync for BufCell {}
unsafe impl Send for BufCell {}

struct FlushBuffer {
    cell: BufCell,
    /// Logical offset of byte 0 for the current round.
    base: AtomicU64,
    committed: AtomicUsize,
    /// `UNSEALED` while accepting reservations; final byte count once sealed.
    sealed_len: AtomicUsize,
    queued: AtomicBool,
}

impl FlushBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            cell: BufCell(UnsafeCell::new(vec![0u8; capacity].into_boxed_slice())),
            base: AtomicU64::new(0),
            committed: AtomicUsize::new(0),
            sealed_len: AtomicUsize::new(UNSEALED),
            queued: AtomicBool::new(false),
        }
    }

    fn copy_in(&self, start: usize, data: &[u8]) {
        // Exclusive range ownership per the Reservation contract.
        unsafe {
            let buf = &mut *self.cell.0.get();
            buf[start..start + data.len()].copy_from_slice(data);
        }
    }
}

struct RingState {
    active: usize,
    /// Bytes reserved in the active buffer.
    reserved: usize,
    /// Next logical offset to hand out.
    tail: u64,
    free: [bool; NUM_BUFFERS],
}

struct FlushJob {
    buf: usize,
    base: u64,
    len: usize,
}

struct RingShared {
    bufs: Vec<FlushBuffer>,
    capacity: usize,
    segment_size: u64,
    state: Mutex<RingState>,
    space: Condvar,
    /// Durable watermark: every logical offset below it has been written.
    flushed: Mutex<u64>,
    flushed_cv: Condvar,
    degraded: Arc<AtomicBool>,
    tx: Mutex<Option<Sender<FlushJob>>>,
}

/// Bounded ring of flush buffers in front of the segment files. Reservations
/// are allocated under a short mutex; payload copies and commits proceed in
/// parallel. Sealed, fully committed buffers are handed to a dedicated
/// flusher thread which writes them in offset order.
pub(crate) struct FlushBufferRing {
    shared: Arc<RingShared>,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl FlushBufferRing {
    pub fn new(
        segments: Arc<SegmentSet>,
        capacity: usize,
        tail: u64,
        degraded: Arc<AtomicBool>,
    ) -> Self {
        let bufs: Vec<FlushBuffer> = (0..NUM_BUFFERS).map(|_| FlushBuffer::new(capacity)).collect();
        bufs[0].base.store(tail, Ordering::SeqCst);

        let mut free = [true; NUM_BUFFERS];
        free[0] = false;

        let (tx, rx) = bounded::<FlushJob>(NUM_BUFFERS);
        let shared = Arc::new(RingShared {
            bufs,
            capacity,
            segment_size: segments.segment_size(),
            state: Mutex::new(RingState {
                active: 0,
                reserved: 0,
                tail,
                free,
            }),
            space: Condvar::new(),
            flushed: Mutex::new(tail),
            flushed_cv: Condvar::new(),
            degraded,
            tx: Mutex::new(Some(tx)),
        });

        let flusher = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("plasma-lss-flusher".into())
                .spawn(move || flusher_loop(shared, segments, rx, tail))
                .expect("failed to spawn lss flusher")
        };

        Self {
            shared,
            flusher: Mutex::new(Some(flusher)),
        }
    }

    pub fn tail(&self) -> u64 {
        self.shared.state.lock().unwrap().tail
    }

    pub fn flushed_tail(&self) -> u64 {
        *self.shared.flushed.lock().unwrap()
    }

    /// Reserve `n` contiguous bytes. Never hands out a range crossing a
    /// segment boundary; the remainder of a too-short segment is padded with
    /// a frame produced by `frame_pad`.
    pub fn reserve(&self, n: usize, frame_pad: impl Fn(usize) -> Vec<u8>) -> Result<Reservation> {
        let sh = &*self.shared;
        if n > sh.capacity {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("record of {n} bytes exceeds flush buffer capacity"),
            )));
        }
        let mut st = sh.state.lock().unwrap();
        loop {
            if sh.degraded.load(Ordering::SeqCst) {
                return Err(degraded_error("reserve"));
            }
            let seg_room = sh.segment_size - (st.tail % sh.segment_size);
            if (n as u64) > seg_room {
                let pad = frame_pad(seg_room as usize);
                debug_assert_eq!(pad.len() as u64, seg_room);
                st = sh.push_pad(st, &pad)?;
                continue;
            }
            if n <= sh.capacity - st.reserved {
                let res = Reservation {
                    offset: st.tail,
                    len: n,
                    buf: st.active,
                    start: st.reserved,
                };
                st.reserved += n;
                st.tail += n as u64;
                if st.reserved == sh.capacity {
                    st = sh.seal_and_rotate(st)?;
                }
                return Ok(res);
            }
            st = sh.seal_and_rotate(st)?;
        }
    }

    /// Copy the payload into the reserved slice.
    pub fn write(&self, res: &Reservation, data: &[u8]) {
        debug_assert_eq!(data.len(), res.len);
        self.shared.bufs[res.buf].copy_in(res.start, data);
    }

    /// Mark the reservation filled. The buffer ships once every reservation
    /// in it has committed.
    pub fn commit(&self, res: Reservation) {
        let sh = &*self.shared;
        sh.bufs[res.buf].committed.fetch_add(res.len, Ordering::SeqCst);
        sh.maybe_enqueue(res.buf);
    }

    /// Seal whatever is pending and wait until all bytes reserved before the
    /// call have reached the OS, then fsync the segments.
    pub fn sync(&self, segments: &SegmentSet) -> Result<()> {
        let sh = &*self.shared;
        let target = {
            let mut st = sh.state.lock().unwrap();
            let target = st.tail;
            if st.reserved > 0 {
                st = sh.seal_and_rotate(st)?;
            }
            drop(st);
            target
        };
        let mut flushed = sh.flushed.lock().unwrap();
        while *flushed < target {
            if sh.degraded.load(Ordering::SeqCst) {
                return Err(degraded_error("sync"));
            }
            let (guard, _) = sh
                .flushed_cv
                .wait_timeout(flushed, Duration::from_millis(100))
                .unwrap();
            flushed = guard;
        }
        drop(flushed);
        if sh.degraded.load(Ordering::SeqCst) {
            return Err(degraded_error("sync"));
        }
        segments.sync()
    }

    pub fn close(&self) {
        self.shared.tx.lock().unwrap().take();
        if let Some(handle) = self.flusher.lock().unwrap().take() {
            handle.join().ok();
        }
    }
}

impl RingShared {
    fn seal(&self, st: &mut RingState) {
        self.bufs[st.active]
            .sealed_len
            .store(st.reserved, Ordering::SeqCst);
        self.maybe_enqueue(st.active);
    }

    fn rotate<'a>(
        &self,
        mut st: MutexGuard<'a, RingState>,
    ) -> Result<MutexGuard<'a, RingState>> {
        let next = (st.active + 1) % NUM_BUFFERS;
        while !st.free[next] {
            if self.degraded.load(Ordering::SeqCst) {
                return Err(degraded_error("rotate"));
            }
            let (guard, _) = self
                .space
                .wait_timeout(st, Duration::from_millis(100))
                .unwrap();
            st = guard;
        }
        st.free[next] = false;
        let buf = &self.bufs[next];
        buf.base.store(st.tail, Ordering::SeqCst);
        buf.committed.store(0, Ordering::SeqCst);
        buf.sealed_len.store(UNSEALED, Ordering::SeqCst);
        buf.queued.store(false, Ordering::SeqCst);
        st.active = next;
        st.reserved = 0;
        Ok(st)
    }

    fn seal_and_rotate<'a>(
        &self,
        mut st: MutexGuard<'a, RingState>,
    ) -> Result<MutexGuard<'a, RingState>> {
        self.seal(&mut st);
        self.rotate(st)
    }

    /// Pad bytes are committed in place, spilling across seals as needed.
    fn push_pad<'a>(
        &self,
        mut st: MutexGuard<'a, RingState>,
        pad: &[u8],
    ) -> Result<MutexGuard<'a, RingState>> {
        let mut written = 0;
        while written < pad.len() {
            if st.reserved == self.capacity {
                st = self.seal_and_rotate(st)?;
            }
            let chunk = (self.capacity - st.reserved).min(pad.len() - written);
            let buf = &self.bufs[st.active];
            buf.copy_in(st.reserved, &pad[written..written + chunk]);
            buf.committed.fetch_add(chunk, Ordering::SeqCst);
            st.reserved += chunk;
            st.tail += chunk as u64;
            written += chunk;
        }
        Ok(st)
    }

    fn maybe_enqueue(&self, idx: usize) {
        let buf = &self.bufs[idx];
        let sealed = buf.sealed_len.load(Ordering::SeqCst);
        if sealed == UNSEALED || buf.committed.load(Ordering::SeqCst) != sealed {
            return;
        }
        if buf
            .queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let job = FlushJob {
            buf: idx,
            base: buf.base.load(Ordering::SeqCst),
            len: sealed,
        };
        if let Some(tx) = self.tx.lock().unwrap().as_ref() {
            // At most NUM_BUFFERS jobs outstanding; the channel never fills.
            tx.send(job).ok();
        }
    }

    fn note_flushed(&self, upto: u64, freed_buf: usize) {
        {
            let mut st = self.state.lock().unwrap();
            st.free[freed_buf] = true;
        }
        self.space.notify_all();
        {
            let mut flushed = self.flushed.lock().unwrap();
            if upto > *flushed {
                *flushed = upto;
            }
        }
        self.flushed_cv.notify_all();
    }
}

fn degraded_error(op: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("lss degraded by earlier write failure ({op})"),
    ))
}

fn flusher_loop(
    shared: Arc<RingShared>,
    segments: Arc<SegmentSet>,
    rx: Receiver<FlushJob>,
    mut next_base: u64,
) {
    // Jobs can arrive out of offset order when a later buffer commits first;
    // writes are issued strictly in order so the durable watermark stays a
    // simple prefix.
    let mut pending: BTreeMap<u64, FlushJob> = BTreeMap::new();

    while let Ok(job) = rx.recv() {
        pending.insert(job.base, job);
        while let Some((&base, _)) = pending.iter().next() {
            if base != next_base {
                break;
            }
            let job = pending.remove(&base).unwrap();
            let buf = &shared.bufs[job.buf];
            if job.len > 0 && !shared.degraded.load(Ordering::SeqCst) {
                // The round is fully committed; no reservation can touch
                // these bytes anymore.
                let data = unsafe {
                    let slice = &*buf.cell.0.get();
                    &slice[..job.len]
                };
                if let Err(e) = segments.write_at(job.base, data) {
                    tracing::error!(error = %e, offset = job.base, "lss write failed, degrading store");
                    shared.degraded.store(true, Ordering::SeqCst);
                }
            }
            next_base = base + job.len as u64;
            shared.note_flushed(next_base, job.buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn pad_frame(n: usize) -> Vec<u8> {
        vec![0xEE; n]
    }

    fn new_ring(dir: &std::path::Path, capacity: usize, segment: u64) -> (FlushBufferRing, Arc<SegmentSet>) {
        let segs = Arc::new(SegmentSet::open(dir, segment, false).unwrap());
        let ring = FlushBufferRing::new(
            segs.clone(),
            capacity,
            0,
            Arc::new(AtomicBool::new(false)),
        );
        (ring, segs)
    }

    #[test]
    fn test_reserve_commit_sync() {
        let dir = tempdir().unwrap();
        let (ring, segs) = new_ring(dir.path(), 4096, 1 << 20);

        let res = ring.reserve(5, pad_frame).unwrap();
        assert_eq!(res.offset, 0);
        ring.write(&res, b"alpha");
        ring.commit(res);

        let res = ring.reserve(4, pad_frame).unwrap();
        assert_eq!(res.offset, 5);
        ring.write(&res, b"beta");
        ring.commit(res);

        ring.sync(&segs).unwrap();
        assert_eq!(ring.flushed_tail(), 9);

        let mut buf = [0u8; 9];
        segs.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"alphabeta");
        ring.close();
    }

    #[test]
    fn test_buffer_rollover() {
        let dir = tempdir().unwrap();
        let (ring, segs) = new_ring(dir.path(), 64, 1 << 20);

        // Fill several buffer rounds.
        for i in 0..32u8 {
            let res = ring.reserve(16, pad_frame).unwrap();
            ring.write(&res, &[i; 16]);
            ring.commit(res);
        }
        ring.sync(&segs).unwrap();
        assert_eq!(ring.flushed_tail(), 512);

        let mut buf = [0u8; 16];
        segs.read_at(16 * 31, &mut buf).unwrap();
        assert_eq!(buf, [31u8; 16]);
        ring.close();
    }

    #[test]
    fn test_segment_padding() {
        let dir = tempdir().unwrap();
        let (ring, segs) = new_ring(dir.path(), 128, 100);

        let res = ring.reserve(90, pad_frame).unwrap();
        assert_eq!(res.offset, 0);
        ring.write(&res, &[1u8; 90]);
        ring.commit(res);

        // Doesn't fit in the 10 bytes left of segment 0; lands at 100.
        let res = ring.reserve(20, pad_frame).unwrap();
        assert_eq!(res.offset, 100);
        ring.write(&res, &[2u8; 20]);
        ring.commit(res);

        ring.sync(&segs).unwrap();
        let mut buf = [0u8; 10];
        segs.read_at(90, &mut buf).unwrap();
        assert_eq!(buf, [0xEE; 10]);
        ring.close();
    }

    #[test]
    fn test_out_of_order_commit_still_flushes_in_order() {
        let dir = tempdir().unwrap();
        let (ring, segs) = new_ring(dir.path(), 4096, 1 << 20);

        let a = ring.reserve(8, pad_frame).unwrap();
        let b = ring.reserve(8, pad_frame).unwrap();
        ring.write(&b, b"bbbbbbbb");
        ring.commit(b);
        ring.write(&a, b"aaaaaaaa");
        ring.commit(a);

        ring.sync(&segs).unwrap();
        let mut buf = [0u8; 16];
        segs.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"aaaaaaaabbbbbbbb");
        ring.close();
    }
}
