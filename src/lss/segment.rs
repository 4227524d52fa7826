use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use memmap2::Mmap;

use crate::error::Result;

/// One log segment file, addressed by `index = offset / segment_size`.
pub(crate) struct Segment {
    file: File,
    /// Read-only map of the file, refreshed when a read lands past its end.
    map: RwLock<Option<Mmap>>,
    use_mmap: bool,
    dirty: AtomicBool,
}

impl Segment {
    fn open(path: &Path, use_mmap: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        Ok(Self {
            file,
            map: RwLock::new(None),
            use_mmap,
            dirty: AtomicBool::new(false),
        })
    }

    fn write_at(&self, pos: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, pos)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn read_at(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if self.use_mmap {
            if self.try_mapped_read(pos, buf) {
                return Ok(());
            }
            self.remap()?;
            if self.try_mapped_read(pos, buf) {
                return Ok(());
            }
            // Fresh write not visible through the map yet; fall through.
        }
        self.file.read_exact_at(buf, pos)?;
        Ok(())
    }

    fn try_mapped_read(&self, pos: u64, buf: &mut [u8]) -> bool {
        let guard = self.map.read().unwrap();
        if let Some(map) = guard.as_ref() {
            let end = pos as usize + buf.len();
            if end <= map.len() {
                buf.copy_from_slice(&map[pos as usize..end]);
                return true;
            }
        }
        false
    }

    fn remap(&self) -> Result<()> {
        let mut guard = self.map.write().unwrap();
        // Safety contract of memmap2: the mapped region must not be truncated
        // while mapped. Segments are append-only and deleted only as whole
        // files after every reader has moved past them.
        let map = unsafe { Mmap::map(&self.file)? };
        *guard = Some(map);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

/// The set of segment files backing the logical LSS byte space. Logical
/// offset `o` lives in segment `o / segment_size` at position
/// `o % segment_size`.
pub(crate) struct SegmentSet {
    dir: PathBuf,
    segment_size: u64,
    use_mmap: bool,
    segments: RwLock<BTreeMap<u64, Arc<Segment>>>,
}

impl SegmentSet {
    pub fn open(dir: &Path, segment_size: u64, use_mmap: bool) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let set = Self {
            dir: dir.to_path_buf(),
            segment_size,
            use_mmap,
            segments: RwLock::new(BTreeMap::new()),
        };
        for index in set.scan_dir()? {
            set.ensure(index)?;
        }
        Ok(set)
    }

    fn scan_dir(&self) -> Result<Vec<u64>> {
        let mut indexes = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".data") {
                if let Ok(index) = stem.parse::<u64>() {
                    indexes.push(index);
                }
            }
        }
        indexes.sort_unstable();
        Ok(indexes)
    }

    fn path(&self, index: u64) -> PathBuf {
        self.dir.join(format!("{index:06}.data"))
    }

    pub fn segment_size(&self) -> u64 {
        self.segment_size
    }

    /// Sorted indexes of the segments currently on disk.
    pub fn indexes(&self) -> Vec<u64> {
        self.segments.read().unwrap().keys().copied().collect()
    }

    /// Size in bytes of the segment file, as written so far.
    pub fn len_of(&self, index: u64) -> Result<u64> {
        let seg = self.ensure(index)?;
        Ok(seg.file.metadata()?.len())
    }

    fn ensure(&self, index: u64) -> Result<Arc<Segment>> {
        if let Some(seg) = self.segments.read().unwrap().get(&index) {
            return Ok(seg.clone());
        }
        let mut guard = self.segments.write().unwrap();
        if let Some(seg) = guard.get(&index) {
            return Ok(seg.clone());
        }
        let seg = Arc::new(Segment::open(&self.path(index), self.use_mmap)?);
        guard.insert(index, seg.clone());
        Ok(seg)
    }

    /// Write at a logical offset, splitting across segment boundaries.
    pub fn write_at(&self, mut offset: u64, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            let index = offset / self.segment_size;
            let pos = offset % self.segment_size;
            let room = (self.segment_size - pos).min(data.len() as u64) as usize;
            self.ensure(index)?.write_at(pos, &data[..room])?;
            offset += room as u64;
            data = &data[room..];
        }
        Ok(())
    }

    /// Read at a logical offset, splitting across segment boundaries.
    pub fn read_at(&self, mut offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let index = offset / self.segment_size;
            let pos = offset % self.segment_size;
            let room = (self.segment_size - pos).min((buf.len() - filled) as u64) as usize;
            self.ensure(index)?
                .read_at(pos, &mut buf[filled..filled + room])?;
            offset += room as u64;
            filled += room;
        }
        Ok(())
    }

    /// Delete segment files strictly below the head offset's segment.
    pub fn delete_below(&self, head: u64) -> Result<usize> {
        let keep_from = head / self.segment_size;
        let doomed: Vec<u64> = {
            let guard = self.segments.read().unwrap();
            guard.keys().copied().filter(|i| *i < keep_from).collect()
        };
        let mut removed = 0;
        for index in doomed {
            let seg = self.segments.write().unwrap().remove(&index);
            if let Some(seg) = seg {
                // Drop the map before unlinking.
                *seg.map.write().unwrap() = None;
                match fs::remove_file(self.path(index)) {
                    Ok(()) => {
                        removed += 1;
                        tracing::debug!(segment = index, "deleted log segment");
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(removed)
    }

    /// fsync every segment written since the last sync.
    pub fn sync(&self) -> Result<()> {
        let segs: Vec<Arc<Segment>> = self.segments.read().unwrap().values().cloned().collect();
        for seg in segs {
            seg.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_read_roundtrip() -> Result<()> {
        let dir = tempdir().unwrap();
        let set = SegmentSet::open(dir.path(), 1024, false)?;

        set.write_at(0, b"hello")?;
        set.write_at(100, b"world")?;

        let mut buf = [0u8; 5];
        set.read_at(0, &mut buf)?;
        assert_eq!(&buf, b"hello");
        set.read_at(100, &mut buf)?;
        assert_eq!(&buf, b"world");
        Ok(())
    }

    #[test]
    fn test_boundary_spanning_write() -> Result<()> {
        let dir = tempdir().unwrap();
        let set = SegmentSet::open(dir.path(), 64, false)?;

        let data: Vec<u8> = (0..200).map(|i| i as u8).collect();
        set.write_at(10, &data)?;
        assert_eq!(set.indexes(), vec![0, 1, 2, 3]);

        let mut buf = vec![0u8; 200];
        set.read_at(10, &mut buf)?;
        assert_eq!(buf, data);
        Ok(())
    }

    #[test]
    fn test_delete_below_head() -> Result<()> {
        let dir = tempdir().unwrap();
        let set = SegmentSet::open(dir.path(), 64, false)?;
        set.write_at(0, &[1u8; 200])?;
        assert_eq!(set.indexes().len(), 4);

        let removed = set.delete_below(130)?;
        assert_eq!(removed, 2);
        assert_eq!(set.indexes(), vec![2, 3]);
        Ok(())
    }

    #[test]
    fn test_reopen_finds_segments() -> Result<()> {
        let dir = tempdir().unwrap();
        {
            let set = SegmentSet::open(dir.path(), 64, false)?;
            set.write_at(0, &[7u8; 100])?;
            set.sync()?;
        }
        let set = SegmentSet::open(dir.path(), 64, false)?;
        assert_eq!(set.indexes(), vec![0, 1]);
        let mut buf = [0u8; 4];
        set.read_at(60, &mut buf)?;
        assert_eq!(buf, [7u8; 4]);
        Ok(())
    }

    #[test]
    fn test_mmap_read() -> Result<()> {
        let dir = tempdir().unwrap();
        let set = SegmentSet::open(dir.path(), 1024, true)?;
        set.write_at(5, b"mapped")?;
        let mut buf = [0u8; 6];
        set.read_at(5, &mut buf)?;
        assert_eq!(&buf, b"mapped");
        Ok(())
    }
}
