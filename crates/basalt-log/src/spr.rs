//! Single-page recovery: roll one page forward from its log chain.
//!
//! Invoked by the buffer pool on the critical path of a fix when a page
//! image read from disk fails its checksum, or when its LSN is older than
//! the expected-minimum LSN the parent vouches for. Pull-based: nothing
//! happens until a fix actually needs the page.

use basalt_error::{BasaltError, Result};
use basalt_types::{Lsn, Page, PageId, VolumeId};
use tracing::{debug, warn};

use crate::manager::LogManager;

/// Roll `(vol, pid)` forward to at least `emlsn`.
///
/// `base` is the image read from disk: `Some` if the checksum held (the page
/// is merely stale), `None` if it was corrupt and must be rebuilt from its
/// last format record. With a null `emlsn` (no parent information) the page
/// is rolled all the way to the log tail.
pub fn recover_page(
    log: &LogManager,
    vol: VolumeId,
    pid: PageId,
    base: Option<Page>,
    emlsn: Lsn,
) -> Result<Page> {
    debug_assert!(!pid.is_swizzled());
    let records = log.scan_page(vol, pid)?;
    if records.is_empty() && base.is_none() {
        return Err(BasaltError::ReadFailed {
            vol,
            pid,
            detail: "corrupt image and no log records to rebuild from".into(),
        });
    }

    let mut page = match base {
        Some(page) => page,
        None => {
            // Rebuild from scratch: the chain must contain a format record.
            if !records
                .iter()
                .any(|r| matches!(r.payload, crate::record::LogPayload::PageFormat { .. }))
            {
                return Err(BasaltError::ReadFailed {
                    vol,
                    pid,
                    detail: "corrupt image and no format record in the log chain".into(),
                });
            }
            Page::new(vol, pid, basalt_types::StoreId::RESERVED)
        }
    };

    let start_lsn = page.lsn();
    let mut applied = 0usize;
    for rec in &records {
        if rec.lsn <= page.lsn() && !page.lsn().is_null() {
            continue;
        }
        if !emlsn.is_null() && rec.lsn > emlsn {
            break;
        }
        rec.redo(&mut page)?;
        applied += 1;
    }

    if !emlsn.is_null() && page.lsn() < emlsn {
        warn!(
            target: "basalt.log",
            vol = %vol, pid = %pid, page_lsn = %page.lsn(), emlsn = %emlsn,
            "single-page recovery fell short of the expected LSN"
        );
        return Err(BasaltError::WrongPageLsnChain {
            pid,
            expected: emlsn,
            found: page.lsn(),
        });
    }

    debug!(
        target: "basalt.log",
        vol = %vol, pid = %pid, from = %start_lsn, to = %page.lsn(), applied,
        "single-page recovery complete"
    );
    Ok(page)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{LogPayload, LogRecord};
    use basalt_types::{EngineOptions, StoreId, TxnId};

    fn setup() -> (tempfile::TempDir, LogManager) {
        let dir = tempfile::tempdir().unwrap();
        let log = LogManager::open(dir.path(), &EngineOptions::default()).unwrap();
        (dir, log)
    }

    fn write_history(log: &LogManager, vol: VolumeId, pid: PageId) -> Vec<Lsn> {
        let mut lsns = Vec::new();
        let fmt = LogRecord::system(vol, pid, LogPayload::PageFormat { store: StoreId::new(1) });
        lsns.push(log.append(fmt).unwrap());
        for i in 0..4u8 {
            let mut rec = LogRecord::transactional(
                TxnId::new(1),
                vol,
                pid,
                true,
                LogPayload::PageWrite {
                    offset: u32::from(i) * 8,
                    before: vec![0u8; 8],
                    after: vec![i + 1; 8],
                },
            );
            rec.prev_lsn = *lsns.last().unwrap();
            lsns.push(log.append(rec).unwrap());
        }
        lsns
    }

    #[test]
    fn rebuild_from_scratch() {
        let (_dir, log) = setup();
        let vol = VolumeId::new(1);
        let pid = PageId::new(9);
        let lsns = write_history(&log, vol, pid);

        let page = recover_page(&log, vol, pid, None, *lsns.last().unwrap()).unwrap();
        assert_eq!(page.lsn(), *lsns.last().unwrap());
        assert_eq!(&page.payload()[..8], &[1u8; 8]);
        assert_eq!(&page.payload()[24..32], &[4u8; 8]);
    }

    #[test]
    fn stale_image_rolls_forward_only_the_tail() {
        let (_dir, log) = setup();
        let vol = VolumeId::new(1);
        let pid = PageId::new(9);
        let lsns = write_history(&log, vol, pid);

        // An image current up to the second write.
        let mut stale = recover_page(&log, vol, pid, None, lsns[2]).unwrap();
        assert_eq!(stale.lsn(), lsns[2]);
        stale = recover_page(&log, vol, pid, Some(stale), *lsns.last().unwrap()).unwrap();
        assert_eq!(stale.lsn(), *lsns.last().unwrap());
        assert_eq!(&stale.payload()[24..32], &[4u8; 8]);
    }

    #[test]
    fn missing_chain_is_a_read_failure() {
        let (_dir, log) = setup();
        let err = recover_page(&log, VolumeId::new(1), PageId::new(77), None, Lsn::new(1, 64))
            .unwrap_err();
        assert!(matches!(err, BasaltError::ReadFailed { .. }));
    }

    #[test]
    fn short_chain_reports_lsn_mismatch() {
        let (_dir, log) = setup();
        let vol = VolumeId::new(1);
        let pid = PageId::new(9);
        let lsns = write_history(&log, vol, pid);

        // Demand an LSN beyond everything logged for the page.
        let bogus = lsns.last().unwrap().advance(10_000);
        let err = recover_page(&log, vol, pid, None, bogus).unwrap_err();
        assert!(matches!(err, BasaltError::WrongPageLsnChain { .. }));
    }

    #[test]
    fn null_emlsn_rolls_to_tail() {
        let (_dir, log) = setup();
        let vol = VolumeId::new(1);
        let pid = PageId::new(9);
        let lsns = write_history(&log, vol, pid);

        let page = recover_page(&log, vol, pid, None, Lsn::NULL).unwrap();
        assert_eq!(page.lsn(), *lsns.last().unwrap());
    }
}
