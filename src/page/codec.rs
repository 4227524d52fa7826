//! Flush-record encoding.
//!
//! A full record carries a page's consolidated items; a delta record carries
//! the operations since the page's previous flush and references it by
//! offset. Item sections can be zstd-compressed per page.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::item::{Item, Key};
use crate::lss::RecordKind;
use crate::page::{Op, PageId, RetiredPids};

const FLAG_COMPRESSED: u8 = 0x01;

const KEY_TAG_MIN: u8 = 0;
const KEY_TAG_ITEM: u8 = 1;
const KEY_TAG_MAX: u8 = 2;

/// Decoded fixed-size portion of a flush record. Item payloads are decoded
/// separately so recovery can stay header-only.
#[derive(Debug)]
pub(crate) struct RecordHeader {
    pub pid: PageId,
    /// Previous record in this page's chain; `None` on full records.
    pub prev_offset: Option<u64>,
    pub low_key: Key,
    pub high_key: Key,
    pub retired: RetiredPids,
    /// Item count (full) or operation count (delta).
    pub count: u32,
}

fn write_key(buf: &mut Vec<u8>, key: &Key) {
    match key {
        Key::Min => buf.push(KEY_TAG_MIN),
        Key::Max => buf.push(KEY_TAG_MAX),
        Key::Item(item) => {
            buf.push(KEY_TAG_ITEM);
            buf.write_u32::<BigEndian>(item.len() as u32).unwrap();
            buf.extend_from_slice(item);
        }
    }
}

fn read_key(cursor: &mut Cursor<&[u8]>) -> Result<Key> {
    match cursor.read_u8().map_err(bad_frame)? {
        KEY_TAG_MIN => Ok(Key::Min),
        KEY_TAG_MAX => Ok(Key::Max),
        KEY_TAG_ITEM => {
            let len = cursor.read_u32::<BigEndian>().map_err(bad_frame)? as usize;
            let mut bytes = vec![0u8; len];
            cursor.read_exact(&mut bytes).map_err(bad_frame)?;
            Ok(Key::Item(bytes.into()))
        }
        tag => Err(crate::corruption!("unknown key tag {tag}")),
    }
}

fn bad_frame(err: std::io::Error) -> Error {
    Error::Corruption(format!("truncated flush record: {err}"))
}

fn finish_sections(buf: &mut Vec<u8>, section: Vec<u8>, compress: bool) -> Result<()> {
    if compress {
        buf[8] |= FLAG_COMPRESSED;
        let packed = zstd::bulk::compress(&section, 1)?;
        buf.write_u32::<BigEndian>(section.len() as u32).unwrap();
        buf.extend_from_slice(&packed);
    } else {
        buf.extend_from_slice(&section);
    }
    Ok(())
}

/// Encode a full page record: every live item after consolidation.
pub(crate) fn encode_full(
    pid: PageId,
    low_key: &Key,
    high_key: &Key,
    retired: &RetiredPids,
    items: &[Item],
    compress: bool,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + items.iter().map(|i| i.len() + 4).sum::<usize>());
    buf.write_u64::<BigEndian>(pid).unwrap();
    buf.push(0); // flags, patched by finish_sections
    write_key(&mut buf, low_key);
    write_key(&mut buf, high_key);
    buf.write_u16::<BigEndian>(retired.len() as u16).unwrap();
    for (rpid, offset) in retired {
        buf.write_u64::<BigEndian>(*rpid).unwrap();
        buf.write_u64::<BigEndian>(*offset).unwrap();
    }
    buf.write_u32::<BigEndian>(items.len() as u32).unwrap();

    let mut section = Vec::new();
    for item in items {
        section.write_u32::<BigEndian>(item.len() as u32).unwrap();
        section.extend_from_slice(item);
    }
    finish_sections(&mut buf, section, compress)?;
    Ok(buf)
}

/// Encode a delta record: operations since the previous flush, oldest first.
pub(crate) fn encode_delta(
    pid: PageId,
    prev_offset: u64,
    low_key: &Key,
    high_key: &Key,
    ops: &[(Op, Item)],
    compress: bool,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(64 + ops.iter().map(|(_, i)| i.len() + 5).sum::<usize>());
    buf.write_u64::<BigEndian>(pid).unwrap();
    buf.push(0);
    write_key(&mut buf, low_key);
    write_key(&mut buf, high_key);
    buf.write_u64::<BigEndian>(prev_offset).unwrap();
    buf.write_u32::<BigEndian>(ops.len() as u32).unwrap();

    let mut section = Vec::new();
    for (op, item) in ops {
        section.push(op.tag());
        section.write_u32::<BigEndian>(item.len() as u32).unwrap();
        section.extend_from_slice(item);
    }
    finish_sections(&mut buf, section, compress)?;
    Ok(buf)
}

struct DecodedPrefix {
    header: RecordHeader,
    flags: u8,
    /// Byte offset where the (possibly compressed) item section begins.
    section_start: usize,
}

fn decode_prefix(kind: RecordKind, payload: &[u8]) -> Result<DecodedPrefix> {
    let mut cursor = Cursor::new(payload);
    let pid = cursor.read_u64::<BigEndian>().map_err(bad_frame)?;
    let flags = cursor.read_u8().map_err(bad_frame)?;
    let low_key = read_key(&mut cursor)?;
    let high_key = read_key(&mut cursor)?;

    let (prev_offset, retired) = match kind {
        RecordKind::FullPage => {
            let n = cursor.read_u16::<BigEndian>().map_err(bad_frame)? as usize;
            let mut retired = Vec::with_capacity(n);
            for _ in 0..n {
                let rpid = cursor.read_u64::<BigEndian>().map_err(bad_frame)?;
                let offset = cursor.read_u64::<BigEndian>().map_err(bad_frame)?;
                retired.push((rpid, offset));
            }
            (None, retired)
        }
        RecordKind::DeltaPage => {
            let prev = cursor.read_u64::<BigEndian>().map_err(bad_frame)?;
            (Some(prev), Vec::new())
        }
        other => return Err(crate::corruption!("not a page record: {other:?}")),
    };

    let count = cursor.read_u32::<BigEndian>().map_err(bad_frame)?;
    Ok(DecodedPrefix {
        header: RecordHeader {
            pid,
            prev_offset,
            low_key,
            high_key,
            retired,
            count,
        },
        flags,
        section_start: cursor.position() as usize,
    })
}

/// Decode only the header portion; item payloads are not touched.
pub(crate) fn decode_header(kind: RecordKind, payload: &[u8]) -> Result<RecordHeader> {
    Ok(decode_prefix(kind, payload)?.header)
}

fn section_bytes(prefix: &DecodedPrefix, payload: &[u8]) -> Result<Vec<u8>> {
    let raw = &payload[prefix.section_start..];
    if prefix.flags & FLAG_COMPRESSED != 0 {
        let mut cursor = Cursor::new(raw);
        let raw_len = cursor.read_u32::<BigEndian>().map_err(bad_frame)? as usize;
        let packed = &raw[cursor.position() as usize..];
        Ok(zstd::bulk::decompress(packed, raw_len)
            .map_err(|e| crate::corruption!("zstd decompress failed: {e}"))?)
    } else {
        Ok(raw.to_vec())
    }
}

/// Decode a full record's header and items.
pub(crate) fn decode_full(payload: &[u8]) -> Result<(RecordHeader, Vec<Item>)> {
    let prefix = decode_prefix(RecordKind::FullPage, payload)?;
    let section = section_bytes(&prefix, payload)?;
    let mut cursor = Cursor::new(section.as_slice());
    let mut items = Vec::with_capacity(prefix.header.count as usize);
    for _ in 0..prefix.header.count {
        let len = cursor.read_u32::<BigEndian>().map_err(bad_frame)? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(bad_frame)?;
        items.push(Item::from(bytes));
    }
    Ok((prefix.header, items))
}

/// Decode a delta record's header and operations, oldest first.
pub(crate) fn decode_delta(payload: &[u8]) -> Result<(RecordHeader, Vec<(Op, Item)>)> {
    let prefix = decode_prefix(RecordKind::DeltaPage, payload)?;
    let section = section_bytes(&prefix, payload)?;
    let mut cursor = Cursor::new(section.as_slice());
    let mut ops = Vec::with_capacity(prefix.header.count as usize);
    for _ in 0..prefix.header.count {
        let tag = cursor.read_u8().map_err(bad_frame)?;
        let op = Op::from_tag(tag).ok_or_else(|| crate::corruption!("unknown op tag {tag}"))?;
        let len = cursor.read_u32::<BigEndian>().map_err(bad_frame)? as usize;
        let mut bytes = vec![0u8; len];
        cursor.read_exact(&mut bytes).map_err(bad_frame)?;
        ops.push((op, Item::from(bytes)));
    }
    Ok((prefix.header, ops))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(bytes: &[u8]) -> Item {
        Item::from(bytes)
    }

    #[test]
    fn test_full_record_roundtrip() -> Result<()> {
        let items = vec![item(b"alpha"), item(b"beta"), item(b"gamma")];
        let retired = vec![(42, 4096), (7, 128)];
        let payload = encode_full(
            3,
            &Key::item(b"alpha"),
            &Key::Max,
            &retired,
            &items,
            false,
        )?;

        let header = decode_header(RecordKind::FullPage, &payload)?;
        assert_eq!(header.pid, 3);
        assert_eq!(header.count, 3);
        assert_eq!(header.prev_offset, None);
        assert_eq!(header.retired, retired);
        assert_eq!(header.low_key.as_item().unwrap().as_ref(), b"alpha");
        assert!(matches!(header.high_key, Key::Max));

        let (_, decoded) = decode_full(&payload)?;
        assert_eq!(decoded, items);
        Ok(())
    }

    #[test]
    fn test_delta_record_roundtrip() -> Result<()> {
        let ops = vec![
            (Op::Insert, item(b"k1")),
            (Op::Delete, item(b"k2")),
            (Op::Insert, item(b"k3")),
        ];
        let payload = encode_delta(9, 777, &Key::Min, &Key::item(b"zz"), &ops, false)?;

        let header = decode_header(RecordKind::DeltaPage, &payload)?;
        assert_eq!(header.pid, 9);
        assert_eq!(header.prev_offset, Some(777));
        assert_eq!(header.count, 3);

        let (_, decoded) = decode_delta(&payload)?;
        assert_eq!(decoded, ops);
        Ok(())
    }

    #[test]
    fn test_compressed_roundtrip() -> Result<()> {
        let items: Vec<Item> = (0..100u32)
            .map(|i| item(format!("item-{i:05}").as_bytes()))
            .collect();
        let payload = encode_full(1, &Key::Min, &Key::Max, &Vec::new(), &items, true)?;
        let plain = encode_full(1, &Key::Min, &Key::Max, &Vec::new(), &items, false)?;
        assert!(payload.len() < plain.len());

        let (header, decoded) = decode_full(&payload)?;
        assert_eq!(header.count, 100);
        assert_eq!(decoded, items);
        Ok(())
    }

    #[test]
    fn test_truncated_record_rejected() {
        let payload = encode_full(1, &Key::Min, &Key::Max, &Vec::new(), &[item(b"x")], false)
            .unwrap();
        let err = decode_full(&payload[..payload.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Corruption(_)));
    }

    #[test]
    fn test_empty_page_record() -> Result<()> {
        let payload = encode_full(5, &Key::Min, &Key::Max, &Vec::new(), &[], false)?;
        let (header, items) = decode_full(&payload)?;
        assert_eq!(header.count, 0);
        assert!(items.is_empty());
        Ok(())
    }
}
