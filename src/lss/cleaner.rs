//! The log cleaner: relocates live records away from the head so whole
//! segments can be reclaimed.
//!
//! The head region is walked record by record. A record is live when it is
//! still part of the owning page's current flush chain; relocation rewrites
//! that page as a fresh full record at the tail, which supersedes the old
//! chain. Dead records are skipped. Once a prefix has been processed the
//! head advances and the segments below it are deleted.

use super::{Lss, RecordKind};
use crate::error::Result;
use crate::page::{codec, PageId};

/// The store-side half of relocation: liveness is decided against the page
/// table, rewriting goes through the page flush path.
pub(crate) trait Relocator: Sync {
    /// If `record_offset` is part of the page's current chain, rewrite the
    /// page's live data at the tail. Returns whether the record was live.
    fn relocate(&self, pid: PageId, record_offset: u64) -> Result<bool>;
}

/// Process up to `budget` bytes from the head. Returns whether the head
/// advanced.
pub(crate) fn clean_once(lss: &Lss, relocator: &dyn Relocator, budget: u64) -> Result<bool> {
    let head = lss.head();
    let mut relocated = 0u64;
    let mut dead = 0u64;

    let processed_to = lss.scan(Some(head), &mut |offset, kind, payload| {
        if offset - head >= budget {
            return Ok(false);
        }
        match kind {
            RecordKind::FullPage | RecordKind::DeltaPage => {
                let pid = codec::decode_header(kind, payload)?.pid;
                if relocator.relocate(pid, offset)? {
                    relocated += 1;
                } else {
                    dead += 1;
                }
            }
            RecordKind::Pad => {}
        }
        Ok(true)
    })?;

    if processed_to <= head {
        return Ok(false);
    }
    // Relocated records must be durable before their old copies become
    // unreachable.
    lss.sync()?;
    lss.set_head(processed_to)?;
    tracing::debug!(
        from = head,
        to = processed_to,
        relocated,
        dead,
        fragmentation = lss.fragmentation_pct(),
        "cleaner advanced the log head"
    );
    Ok(true)
}
