//! Log-structured storage: an append-only logical byte space striped over
//! fixed-size segment files, written through a ring of flush buffers and
//! compacted online by the cleaner.
//!
//! Offsets are absolute positions in the logical log. The `tail` grows with
//! every reservation; the `head` trails it and everything below the head is
//! reclaimable. Records are framed as `u32 length|kind, u32 checksum,
//! payload` and never cross a segment boundary (short segment remainders are
//! padded).

pub(crate) mod cleaner;
mod flushbuf;
mod segment;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use crc::Crc;

use crate::error::{Error, Result};
pub(crate) use flushbuf::Reservation;
use segment::SegmentSet;

const CHECKSUM: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_ISCSI);

pub(crate) const RECORD_HEADER_SIZE: usize = 8;

/// Payload length lives in the low 29 bits of the first header word.
const LEN_MASK: u32 = (1 << 29) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordKind {
    /// Full serialized page: base items after consolidation.
    FullPage,
    /// Incremental record: operations since the previous flush of the page.
    DeltaPage,
    /// Segment-remainder filler; carries no data.
    Pad,
}

impl RecordKind {
    fn tag(self) -> u32 {
        match self {
            RecordKind::FullPage => 1,
            RecordKind::DeltaPage => 2,
            RecordKind::Pad => 3,
        }
    }

    fn from_tag(tag: u32) -> Option<Self> {
        match tag {
            1 => Some(RecordKind::FullPage),
            2 => Some(RecordKind::DeltaPage),
            3 => Some(RecordKind::Pad),
            _ => None,
        }
    }
}

/// The log-structured store.
pub(crate) struct Lss {
    segments: Arc<SegmentSet>,
    ring: flushbuf::FlushBufferRing,
    head: AtomicU64,
    /// Bytes of live (referenced) records, including frame headers.
    data_size: AtomicI64,
    degraded: Arc<AtomicBool>,
}

impl Lss {
    /// Open the log in `dir`. The head is the start of the lowest surviving
    /// segment; the tail is found by scanning forward until the first
    /// truncated, corrupt, or unwritten frame.
    pub fn open(
        dir: &Path,
        segment_size: u64,
        flush_buffer_size: usize,
        use_mmap: bool,
    ) -> Result<Self> {
        let segments = Arc::new(SegmentSet::open(dir, segment_size, use_mmap)?);
        let head = segments
            .indexes()
            .first()
            .map(|i| i * segment_size)
            .unwrap_or(0);
        let tail = scan_region(&segments, head, u64::MAX, &mut |_, _, _| Ok(true))?;
        tracing::info!(head, tail, "opened lss");

        let degraded = Arc::new(AtomicBool::new(false));
        let ring =
            flushbuf::FlushBufferRing::new(segments.clone(), flush_buffer_size, tail, degraded.clone());
        Ok(Self {
            segments,
            ring,
            head: AtomicU64::new(head),
            data_size: AtomicI64::new(0),
            degraded,
        })
    }

    pub fn head(&self) -> u64 {
        self.head.load(Ordering::Acquire)
    }

    pub fn tail(&self) -> u64 {
        self.ring.tail()
    }

    pub fn used_space(&self) -> u64 {
        self.tail().saturating_sub(self.head())
    }

    pub fn data_size(&self) -> u64 {
        self.data_size.load(Ordering::Relaxed).max(0) as u64
    }

    /// Adjust the live-byte count: positive for fresh records, negative when
    /// records are superseded.
    pub fn add_data_size(&self, delta: i64) {
        self.data_size.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn fragmentation_pct(&self) -> u64 {
        let used = self.used_space();
        if used == 0 {
            return 0;
        }
        used.saturating_sub(self.data_size()) * 100 / used
    }

    pub fn info(&self) -> crate::stats::LssInfo {
        crate::stats::LssInfo {
            fragmentation_pct: self.fragmentation_pct(),
            data_size: self.data_size(),
            used_space: self.used_space(),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Reserve space for a record with the given payload size. The returned
    /// reservation's offset is the record's durable identity.
    pub fn reserve_record(&self, payload_len: usize) -> Result<Reservation> {
        if payload_len as u32 > LEN_MASK {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "record payload too large",
            )));
        }
        self.ring
            .reserve(RECORD_HEADER_SIZE + payload_len, frame_pad)
    }

    /// Frame and copy the record into its reserved slice.
    pub fn fill_record(&self, res: &Reservation, kind: RecordKind, payload: &[u8]) {
        debug_assert_eq!(res.len, RECORD_HEADER_SIZE + payload.len());
        let mut framed = Vec::with_capacity(res.len);
        let mut header = [0u8; RECORD_HEADER_SIZE];
        BigEndian::write_u32(&mut header[0..4], (kind.tag() << 29) | payload.len() as u32);
        BigEndian::write_u32(&mut header[4..8], CHECKSUM.checksum(payload));
        framed.extend_from_slice(&header);
        framed.extend_from_slice(payload);
        self.ring.write(res, &framed);
    }

    /// Commit the reservation. `live` records count toward `data_size`;
    /// records orphaned by a lost CAS race commit dead.
    pub fn commit_record(&self, res: Reservation, live: bool) {
        let len = res.len as i64;
        self.ring.commit(res);
        if live {
            self.add_data_size(len);
        }
    }

    /// Read a record by offset. Succeeds for any committed offset at or
    /// above the head; offsets still in flight are synced first.
    pub fn read_record(&self, offset: u64) -> Result<(RecordKind, Vec<u8>)> {
        if offset < self.head() {
            return Err(crate::corruption!(
                "read at {offset} below lss head {}",
                self.head()
            ));
        }
        if offset + RECORD_HEADER_SIZE as u64 > self.ring.flushed_tail() {
            self.sync()?;
        }
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.segments.read_at(offset, &mut header)?;
        let word = BigEndian::read_u32(&header[0..4]);
        let checksum = BigEndian::read_u32(&header[4..8]);
        let kind = RecordKind::from_tag(word >> 29)
            .ok_or_else(|| crate::corruption!("bad record kind at {offset}"))?;
        let len = (word & LEN_MASK) as usize;
        if offset + (RECORD_HEADER_SIZE + len) as u64 > self.ring.flushed_tail() {
            self.sync()?;
        }
        let mut payload = vec![0u8; len];
        self.segments
            .read_at(offset + RECORD_HEADER_SIZE as u64, &mut payload)?;
        if kind != RecordKind::Pad && CHECKSUM.checksum(&payload) != checksum {
            return Err(crate::corruption!("checksum mismatch at {offset}"));
        }
        Ok((kind, payload))
    }

    /// Walk the log from `from` (or the head) to the tail, invoking the
    /// callback for every data record. The callback returns `false` to stop
    /// early. Stops cleanly at the first truncated or corrupt frame and
    /// returns the offset one past the last frame consumed.
    pub fn scan<F>(&self, from: Option<u64>, cb: &mut F) -> Result<u64>
    where
        F: FnMut(u64, RecordKind, &[u8]) -> Result<bool>,
    {
        scan_region(&self.segments, from.unwrap_or_else(|| self.head()), self.tail(), cb)
    }

    /// Advance the reclaim watermark; whole segments strictly below it are
    /// deleted.
    pub fn set_head(&self, offset: u64) -> Result<()> {
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            if offset <= current {
                return Ok(());
            }
            match self.head.compare_exchange(
                current,
                offset,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        self.segments.delete_below(offset)?;
        Ok(())
    }

    /// Durably persist everything reserved and committed before the call.
    pub fn sync(&self) -> Result<()> {
        self.ring.sync(&self.segments)
    }

    pub fn close(&self) {
        if let Err(e) = self.sync() {
            tracing::warn!(error = %e, "final lss sync failed");
        }
        self.ring.close();
    }
}

/// Pad frame for a short segment remainder. Gaps under the header size are
/// raw zeros; the scanner skips sub-header remainders unconditionally.
fn frame_pad(gap: usize) -> Vec<u8> {
    let mut pad = vec![0u8; gap];
    if gap >= RECORD_HEADER_SIZE {
        let word = (RecordKind::Pad.tag() << 29) | (gap - RECORD_HEADER_SIZE) as u32;
        BigEndian::write_u32(&mut pad[0..4], word);
    }
    pad
}

fn scan_region<F>(segments: &SegmentSet, from: u64, limit: u64, cb: &mut F) -> Result<u64>
where
    F: FnMut(u64, RecordKind, &[u8]) -> Result<bool>,
{
    let segment_size = segments.segment_size();
    let mut off = from;
    loop {
        if off >= limit {
            return Ok(off);
        }
        let index = off / segment_size;
        if !segments.indexes().contains(&index) {
            return Ok(off);
        }
        let seg_len = segments.len_of(index)?;
        let intra = off % segment_size;
        if segment_size - intra < RECORD_HEADER_SIZE as u64 {
            off = (index + 1) * segment_size;
            continue;
        }
        if intra + RECORD_HEADER_SIZE as u64 > seg_len {
            return Ok(off);
        }
        let mut header = [0u8; RECORD_HEADER_SIZE];
        segments.read_at(off, &mut header)?;
        let word = BigEndian::read_u32(&header[0..4]);
        if word == 0 {
            return Ok(off);
        }
        let checksum = BigEndian::read_u32(&header[4..8]);
        let Some(kind) = RecordKind::from_tag(word >> 29) else {
            tracing::warn!(offset = off, "unknown record kind, truncating scan");
            return Ok(off);
        };
        let len = (word & LEN_MASK) as u64;
        if intra + RECORD_HEADER_SIZE as u64 + len > segment_size {
            tracing::warn!(offset = off, "frame exceeds segment, truncating scan");
            return Ok(off);
        }
        if intra + RECORD_HEADER_SIZE as u64 + len > seg_len {
            // Partial trailing record.
            return Ok(off);
        }
        let mut payload = vec![0u8; len as usize];
        segments.read_at(off + RECORD_HEADER_SIZE as u64, &mut payload)?;
        if kind != RecordKind::Pad {
            if CHECKSUM.checksum(&payload) != checksum {
                tracing::warn!(offset = off, "checksum mismatch, truncating scan");
                return Ok(off);
            }
            if !cb(off, kind, &payload)? {
                return Ok(off);
            }
        }
        off += RECORD_HEADER_SIZE as u64 + len;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn append(lss: &Lss, kind: RecordKind, payload: &[u8]) -> u64 {
        let res = lss.reserve_record(payload.len()).unwrap();
        let offset = res.offset;
        lss.fill_record(&res, kind, payload);
        lss.commit_record(res, true);
        offset
    }

    #[test]
    fn test_append_read_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;

        let a = append(&lss, RecordKind::FullPage, b"page-one");
        let b = append(&lss, RecordKind::DeltaPage, b"delta-two");
        lss.sync()?;

        let (kind, payload) = lss.read_record(a)?;
        assert_eq!(kind, RecordKind::FullPage);
        assert_eq!(payload, b"page-one");

        let (kind, payload) = lss.read_record(b)?;
        assert_eq!(kind, RecordKind::DeltaPage);
        assert_eq!(payload, b"delta-two");

        assert_eq!(lss.data_size(), (8 + 8 + 8 + 9) as u64);
        assert_eq!(lss.used_space(), lss.data_size());
        lss.close();
        Ok(())
    }

    #[test]
    fn test_read_before_sync() -> Result<()> {
        let dir = tempdir().unwrap();
        let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
        let a = append(&lss, RecordKind::FullPage, b"unsynced");
        // read_record syncs on demand.
        let (_, payload) = lss.read_record(a)?;
        assert_eq!(payload, b"unsynced");
        lss.close();
        Ok(())
    }

    #[test]
    fn test_scan_replays_in_order() -> Result<()> {
        let dir = tempdir().unwrap();
        let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
        let offsets = [
            append(&lss, RecordKind::FullPage, b"a"),
            append(&lss, RecordKind::DeltaPage, b"bb"),
            append(&lss, RecordKind::FullPage, b"ccc"),
        ];
        lss.sync()?;

        let mut seen = Vec::new();
        lss.scan(None, &mut |off, kind, payload| {
            seen.push((off, kind, payload.to_vec()));
            Ok(true)
        })?;
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], (offsets[0], RecordKind::FullPage, b"a".to_vec()));
        assert_eq!(seen[1], (offsets[1], RecordKind::DeltaPage, b"bb".to_vec()));
        assert_eq!(seen[2], (offsets[2], RecordKind::FullPage, b"ccc".to_vec()));
        lss.close();
        Ok(())
    }

    #[test]
    fn test_reopen_resumes_at_tail() -> Result<()> {
        let dir = tempdir().unwrap();
        let first;
        {
            let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
            first = append(&lss, RecordKind::FullPage, b"persisted");
            lss.close();
        }
        let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
        assert_eq!(lss.tail(), first + 8 + 9);
        let second = append(&lss, RecordKind::FullPage, b"more");
        assert!(second > first);
        lss.close();
        Ok(())
    }

    #[test]
    fn test_corrupt_tail_truncates_scan() -> Result<()> {
        let dir = tempdir().unwrap();
        let good_end;
        {
            let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
            append(&lss, RecordKind::FullPage, b"good");
            good_end = lss.tail();
            let bad = append(&lss, RecordKind::FullPage, b"bad-record");
            lss.close();
            // Flip a payload byte of the second record.
            let path = dir.path().join("000000.data");
            let mut bytes = std::fs::read(&path).unwrap();
            bytes[(bad + 8) as usize] ^= 0xFF;
            std::fs::write(&path, bytes).unwrap();
        }
        let lss = Lss::open(dir.path(), 1 << 20, 64 * 1024, false)?;
        assert_eq!(lss.tail(), good_end, "scan stops before the corrupt frame");
        let mut count = 0;
        lss.scan(None, &mut |_, _, _| {
            count += 1;
            Ok(true)
        })?;
        assert_eq!(count, 1);
        lss.close();
        Ok(())
    }

    #[test]
    fn test_records_never_cross_segments() -> Result<()> {
        let dir = tempdir().unwrap();
        let lss = Lss::open(dir.path(), 128, 4096, false)?;

        // Each record is 8 + 100; the second cannot fit in segment 0.
        let a = append(&lss, RecordKind::FullPage, &[1u8; 100]);
        let b = append(&lss, RecordKind::FullPage, &[2u8; 100]);
        assert_eq!(a, 0);
        assert_eq!(b, 128);
        lss.sync()?;

        let mut seen = Vec::new();
        lss.scan(None, &mut |off, _, payload| {
            seen.push((off, payload[0]));
            Ok(true)
        })?;
        assert_eq!(seen, vec![(0, 1), (128, 2)]);
        lss.close();
        Ok(())
    }

    #[test]
    fn test_set_head_reclaims_segments() -> Result<()> {
        let dir = tempdir().unwrap();
        let lss = Lss::open(dir.path(), 128, 4096, false)?;
        for i in 0..4u8 {
            append(&lss, RecordKind::FullPage, &[i; 100]);
        }
        lss.sync()?;
        assert_eq!(lss.used_space(), 4 * 128 - (128 - 108));

        lss.set_head(2 * 128)?;
        assert!(!dir.path().join("000000.data").exists());
        assert!(!dir.path().join("000001.data").exists());
        assert!(dir.path().join("000002.data").exists());
        assert!(lss.read_record(2 * 128).is_ok());
        assert!(lss.read_record(0).is_err());
        lss.close();
        Ok(())
    }
}
