//! Log record types and their wire framing.
//!
//! # Framing
//!
//! ```text
//! [0..4)   total length (header + payload)
//! [4..12)  xxh3 checksum of bytes [12..len)
//! [12..20) LSN (assigned at append)
//! [20..28) transaction id (0 = system record)
//! [28..32) volume id
//! [32..36) page id (0 = no page)
//! [36..44) previous LSN of the same transaction
//! [44..45) kind tag
//! [45..46) flags (bit 0: undoable)
//! [46..48) reserved
//! [48..)   kind-specific payload
//! ```
//!
//! Records are length-prefixed so a sequential scan can walk a partition
//! file; a zero length word marks the unwritten tail.

use basalt_error::{BasaltError, Result};
use basalt_types::{Lsn, Page, PageId, StoreId, TxnId, VolumeId};
use xxhash_rust::xxh3::xxh3_64;

/// Size of the fixed record header.
pub const RECORD_HEADER_SIZE: usize = 48;

const FLAG_UNDOABLE: u8 = 1 << 0;

// ---------------------------------------------------------------------------
// Store-node entry image
// ---------------------------------------------------------------------------

/// The 8-byte persistent record for one store on the store-node page:
/// root page id, store flags, deleting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StnodeImage {
    pub root: u32,
    pub flags: u16,
    pub deleting: u16,
}

impl StnodeImage {
    pub const ENCODED_SIZE: usize = 8;

    #[must_use]
    pub fn encode(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.root.to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.to_le_bytes());
        out[6..8].copy_from_slice(&self.deleting.to_le_bytes());
        out
    }

    #[must_use]
    pub fn decode(bytes: &[u8]) -> Self {
        Self {
            root: u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")),
            flags: u16::from_le_bytes(bytes[4..6].try_into().expect("2 bytes")),
            deleting: u16::from_le_bytes(bytes[6..8].try_into().expect("2 bytes")),
        }
    }
}

// ---------------------------------------------------------------------------
// LogPayload
// ---------------------------------------------------------------------------

/// Kind-specific content of a log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    /// Format a fresh page for `store`. REDO resets the page to an empty
    /// image with this identity.
    PageFormat { store: StoreId },

    /// Byte-range update of the page payload region. Carries both images so
    /// the record can be replayed forward and rolled back.
    PageWrite { offset: u32, before: Vec<u8>, after: Vec<u8> },

    /// Update one child-pointer slot.
    ChildPointer { slot: u16, before: PageId, after: PageId },

    /// Update the expected-minimum LSN the parent vouches for one child.
    /// Emitted by eviction as a non-transactional system record.
    ChildEmlsn { slot: u16, emlsn: Lsn },

    /// Toggle the page's to-be-deleted flag.
    SetDeleted { deleted: bool },

    /// Mutate one entry of the store-node page.
    StoreOp { store: StoreId, before: StnodeImage, after: StnodeImage },

    /// Transaction commit point.
    Commit,

    /// Transaction chose to roll back (logged before UNDO begins).
    Abort,

    /// Transaction fully finished (locks released, stores freed).
    TxnEnd,

    /// Compensation: everything back to `undo_next` is already undone.
    Compensate { undo_next: Lsn },

    /// Free-form marker, used by tests and debugging.
    Comment { text: String },
}

impl LogPayload {
    const TAG_PAGE_FORMAT: u8 = 1;
    const TAG_PAGE_WRITE: u8 = 2;
    const TAG_CHILD_POINTER: u8 = 3;
    const TAG_CHILD_EMLSN: u8 = 4;
    const TAG_SET_DELETED: u8 = 5;
    const TAG_STORE_OP: u8 = 6;
    const TAG_COMMIT: u8 = 7;
    const TAG_ABORT: u8 = 8;
    const TAG_TXN_END: u8 = 9;
    const TAG_COMPENSATE: u8 = 10;
    const TAG_COMMENT: u8 = 11;

    #[must_use]
    fn tag(&self) -> u8 {
        match self {
            Self::PageFormat { .. } => Self::TAG_PAGE_FORMAT,
            Self::PageWrite { .. } => Self::TAG_PAGE_WRITE,
            Self::ChildPointer { .. } => Self::TAG_CHILD_POINTER,
            Self::ChildEmlsn { .. } => Self::TAG_CHILD_EMLSN,
            Self::SetDeleted { .. } => Self::TAG_SET_DELETED,
            Self::StoreOp { .. } => Self::TAG_STORE_OP,
            Self::Commit => Self::TAG_COMMIT,
            Self::Abort => Self::TAG_ABORT,
            Self::TxnEnd => Self::TAG_TXN_END,
            Self::Compensate { .. } => Self::TAG_COMPENSATE,
            Self::Comment { .. } => Self::TAG_COMMENT,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Self::PageFormat { .. } => 4,
            Self::PageWrite { before, after, .. } => 8 + before.len() + after.len(),
            Self::ChildPointer { .. } => 10,
            Self::ChildEmlsn { .. } => 10,
            Self::SetDeleted { .. } => 1,
            Self::StoreOp { .. } => 4 + 2 * StnodeImage::ENCODED_SIZE,
            Self::Commit | Self::Abort | Self::TxnEnd => 0,
            Self::Compensate { .. } => 8,
            Self::Comment { text } => text.len(),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::PageFormat { store } => out.extend_from_slice(&store.get().to_le_bytes()),
            Self::PageWrite { offset, before, after } => {
                debug_assert_eq!(before.len(), after.len());
                out.extend_from_slice(&offset.to_le_bytes());
                out.extend_from_slice(&(before.len() as u32).to_le_bytes());
                out.extend_from_slice(before);
                out.extend_from_slice(after);
            }
            Self::ChildPointer { slot, before, after } => {
                out.extend_from_slice(&slot.to_le_bytes());
                out.extend_from_slice(&before.bits().to_le_bytes());
                out.extend_from_slice(&after.bits().to_le_bytes());
            }
            Self::ChildEmlsn { slot, emlsn } => {
                out.extend_from_slice(&slot.to_le_bytes());
                out.extend_from_slice(&emlsn.data().to_le_bytes());
            }
            Self::SetDeleted { deleted } => out.push(u8::from(*deleted)),
            Self::StoreOp { store, before, after } => {
                out.extend_from_slice(&store.get().to_le_bytes());
                out.extend_from_slice(&before.encode());
                out.extend_from_slice(&after.encode());
            }
            Self::Commit | Self::Abort | Self::TxnEnd => {}
            Self::Compensate { undo_next } => {
                out.extend_from_slice(&undo_next.data().to_le_bytes());
            }
            Self::Comment { text } => out.extend_from_slice(text.as_bytes()),
        }
    }

    fn decode(tag: u8, bytes: &[u8]) -> Result<Self> {
        let short = || BasaltError::internal(format!("log payload truncated for tag {tag}"));
        match tag {
            Self::TAG_PAGE_FORMAT => {
                let store = u32::from_le_bytes(bytes.get(..4).ok_or_else(short)?.try_into().expect("4 bytes"));
                Ok(Self::PageFormat { store: StoreId::new(store) })
            }
            Self::TAG_PAGE_WRITE => {
                let offset = u32::from_le_bytes(bytes.get(..4).ok_or_else(short)?.try_into().expect("4 bytes"));
                let len = u32::from_le_bytes(bytes.get(4..8).ok_or_else(short)?.try_into().expect("4 bytes")) as usize;
                let before = bytes.get(8..8 + len).ok_or_else(short)?.to_vec();
                let after = bytes.get(8 + len..8 + 2 * len).ok_or_else(short)?.to_vec();
                Ok(Self::PageWrite { offset, before, after })
            }
            Self::TAG_CHILD_POINTER => {
                let slot = u16::from_le_bytes(bytes.get(..2).ok_or_else(short)?.try_into().expect("2 bytes"));
                let before = u32::from_le_bytes(bytes.get(2..6).ok_or_else(short)?.try_into().expect("4 bytes"));
                let after = u32::from_le_bytes(bytes.get(6..10).ok_or_else(short)?.try_into().expect("4 bytes"));
                Ok(Self::ChildPointer {
                    slot,
                    before: PageId::from_bits(before),
                    after: PageId::from_bits(after),
                })
            }
            Self::TAG_CHILD_EMLSN => {
                let slot = u16::from_le_bytes(bytes.get(..2).ok_or_else(short)?.try_into().expect("2 bytes"));
                let emlsn = u64::from_le_bytes(bytes.get(2..10).ok_or_else(short)?.try_into().expect("8 bytes"));
                Ok(Self::ChildEmlsn { slot, emlsn: Lsn::from_data(emlsn) })
            }
            Self::TAG_SET_DELETED => {
                Ok(Self::SetDeleted { deleted: *bytes.first().ok_or_else(short)? != 0 })
            }
            Self::TAG_STORE_OP => {
                let store = u32::from_le_bytes(bytes.get(..4).ok_or_else(short)?.try_into().expect("4 bytes"));
                let before = StnodeImage::decode(bytes.get(4..12).ok_or_else(short)?);
                let after = StnodeImage::decode(bytes.get(12..20).ok_or_else(short)?);
                Ok(Self::StoreOp { store: StoreId::new(store), before, after })
            }
            Self::TAG_COMMIT => Ok(Self::Commit),
            Self::TAG_ABORT => Ok(Self::Abort),
            Self::TAG_TXN_END => Ok(Self::TxnEnd),
            Self::TAG_COMPENSATE => {
                let undo_next = u64::from_le_bytes(bytes.get(..8).ok_or_else(short)?.try_into().expect("8 bytes"));
                Ok(Self::Compensate { undo_next: Lsn::from_data(undo_next) })
            }
            Self::TAG_COMMENT => Ok(Self::Comment {
                text: String::from_utf8_lossy(bytes).into_owned(),
            }),
            other => Err(BasaltError::internal(format!("unknown log record tag {other}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// LogRecord
// ---------------------------------------------------------------------------

/// One log record, in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Assigned when the record passes through the append path.
    pub lsn: Lsn,
    /// Owning transaction; [`TxnId::NULL`] for system records.
    pub txn: TxnId,
    /// Target page, if any.
    pub vol: VolumeId,
    pub pid: PageId,
    /// Previous record of the same transaction (the per-transaction chain
    /// walked by rollback).
    pub prev_lsn: Lsn,
    /// Whether rollback must undo this record.
    pub undoable: bool,
    pub payload: LogPayload,
}

impl LogRecord {
    /// A system record (no transaction) targeting a page.
    #[must_use]
    pub fn system(vol: VolumeId, pid: PageId, payload: LogPayload) -> Self {
        Self {
            lsn: Lsn::NULL,
            txn: TxnId::NULL,
            vol,
            pid,
            prev_lsn: Lsn::NULL,
            undoable: false,
            payload,
        }
    }

    /// A transactional record; `prev_lsn` and `lsn` are filled by the
    /// transaction's append path.
    #[must_use]
    pub fn transactional(
        txn: TxnId,
        vol: VolumeId,
        pid: PageId,
        undoable: bool,
        payload: LogPayload,
    ) -> Self {
        Self {
            lsn: Lsn::NULL,
            txn,
            vol,
            pid,
            prev_lsn: Lsn::NULL,
            undoable,
            payload,
        }
    }

    /// Encoded size in bytes, as reported to the consolidation array.
    #[must_use]
    pub fn encoded_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.payload.encoded_len()
    }

    /// True when this record targets a page.
    #[must_use]
    pub fn has_page(&self) -> bool {
        !self.pid.is_null()
    }

    /// Serialize with framing and checksum. `self.lsn` must be assigned.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(!self.pid.is_swizzled(), "never log a swizzled page id");
        let len = self.encoded_size();
        let mut out = Vec::with_capacity(len);
        out.extend_from_slice(&(len as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 8]); // checksum backpatched below
        out.extend_from_slice(&self.lsn.data().to_le_bytes());
        out.extend_from_slice(&self.txn.get().to_le_bytes());
        out.extend_from_slice(&self.vol.get().to_le_bytes());
        out.extend_from_slice(&self.pid.bits().to_le_bytes());
        out.extend_from_slice(&self.prev_lsn.data().to_le_bytes());
        out.push(self.payload.tag());
        out.push(if self.undoable { FLAG_UNDOABLE } else { 0 });
        out.extend_from_slice(&[0u8; 2]);
        self.payload.encode_into(&mut out);
        debug_assert_eq!(out.len(), len);
        let sum = xxh3_64(&out[12..]);
        out[4..12].copy_from_slice(&sum.to_le_bytes());
        out
    }

    /// Decode one record from the front of `bytes`, returning it and the
    /// number of bytes consumed. `Ok(None)` means the scan hit the unwritten
    /// tail (zero length word or not enough bytes for a header).
    pub fn decode_from(bytes: &[u8]) -> Result<Option<(Self, usize)>> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len < RECORD_HEADER_SIZE || len > bytes.len() {
            return Err(BasaltError::internal(format!(
                "log record framing corrupt: length {len}"
            )));
        }
        let frame = &bytes[..len];
        let stored = u64::from_le_bytes(frame[4..12].try_into().expect("8 bytes"));
        let computed = xxh3_64(&frame[12..]);
        if stored != computed {
            return Err(BasaltError::internal(format!(
                "log record checksum mismatch: stored {stored:#x}, computed {computed:#x}"
            )));
        }
        let tag = frame[44];
        let flags = frame[45];
        let record = Self {
            lsn: Lsn::from_data(u64::from_le_bytes(frame[12..20].try_into().expect("8 bytes"))),
            txn: TxnId::new(u64::from_le_bytes(frame[20..28].try_into().expect("8 bytes"))),
            vol: VolumeId::new(u32::from_le_bytes(frame[28..32].try_into().expect("4 bytes"))),
            pid: PageId::from_bits(u32::from_le_bytes(frame[32..36].try_into().expect("4 bytes"))),
            prev_lsn: Lsn::from_data(u64::from_le_bytes(frame[36..44].try_into().expect("8 bytes"))),
            undoable: flags & FLAG_UNDOABLE != 0,
            payload: LogPayload::decode(tag, &frame[RECORD_HEADER_SIZE..])?,
        };
        Ok(Some((record, len)))
    }

    /// Apply this record's forward (REDO) effect to `page` and stamp the
    /// page with the record's LSN.
    pub fn redo(&self, page: &mut Page) -> Result<()> {
        match &self.payload {
            LogPayload::PageFormat { store } => {
                *page = Page::new(self.vol, self.pid, *store);
            }
            LogPayload::PageWrite { offset, after, .. } => {
                page.patch_payload(*offset as usize, after)
                    .map_err(|e| BasaltError::internal(e.to_string()))?;
            }
            LogPayload::ChildPointer { slot, after, .. } => {
                let slot = *slot as usize;
                if slot >= page.child_count() {
                    page.set_child_count(slot + 1);
                }
                page.set_child(slot, *after);
            }
            LogPayload::ChildEmlsn { slot, emlsn } => {
                let slot = *slot as usize;
                if slot >= page.child_count() {
                    page.set_child_count(slot + 1);
                }
                page.set_child_emlsn(slot, *emlsn);
            }
            LogPayload::SetDeleted { deleted } => {
                if *deleted {
                    page.flags_mut().insert(basalt_types::PageFlags::TO_BE_DELETED);
                } else {
                    page.flags_mut().remove(basalt_types::PageFlags::TO_BE_DELETED);
                }
            }
            LogPayload::StoreOp { store, after, .. } => {
                let at = store.index() * StnodeImage::ENCODED_SIZE;
                page.patch_payload(at, &after.encode())
                    .map_err(|e| BasaltError::internal(e.to_string()))?;
            }
            LogPayload::Commit
            | LogPayload::Abort
            | LogPayload::TxnEnd
            | LogPayload::Compensate { .. }
            | LogPayload::Comment { .. } => {}
        }
        page.set_lsn(self.lsn);
        Ok(())
    }

    /// Build the compensation record whose forward effect reverses this
    /// record. Returns `None` for records with nothing to undo.
    #[must_use]
    pub fn undo_record(&self, undo_next: Lsn) -> Option<Self> {
        if !self.undoable {
            return None;
        }
        let inverse = match &self.payload {
            LogPayload::PageWrite { offset, before, after } => LogPayload::PageWrite {
                offset: *offset,
                before: after.clone(),
                after: before.clone(),
            },
            LogPayload::ChildPointer { slot, before, after } => LogPayload::ChildPointer {
                slot: *slot,
                before: *after,
                after: *before,
            },
            LogPayload::SetDeleted { deleted } => LogPayload::SetDeleted { deleted: !deleted },
            LogPayload::StoreOp { store, before, after } => LogPayload::StoreOp {
                store: *store,
                before: *after,
                after: *before,
            },
            _ => return None,
        };
        let mut rec = Self::transactional(self.txn, self.vol, self.pid, false, inverse);
        rec.prev_lsn = undo_next;
        Some(rec)
    }
}

// ---------------------------------------------------------------------------
// RecordSink
// ---------------------------------------------------------------------------

/// Anything that can take a log record and hand back its LSN.
///
/// The log manager implements this for non-transactional system records;
/// transactions implement it to route records through their reservation
/// accounting. Code that must log but should not care which (the page
/// handle's delete flag, the store catalog) takes a `&dyn RecordSink`.
pub trait RecordSink {
    /// Append `record`, assigning and returning its LSN.
    fn sink_append(&self, record: LogRecord) -> Result<Lsn>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn round_trip(rec: &LogRecord) -> LogRecord {
        let bytes = rec.encode();
        let (back, used) = LogRecord::decode_from(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        back
    }

    #[test]
    fn page_write_round_trip_and_sizes() {
        let mut rec = LogRecord::transactional(
            TxnId::new(3),
            VolumeId::new(1),
            PageId::new(40),
            true,
            LogPayload::PageWrite {
                offset: 96,
                before: vec![0u8; 16],
                after: (0u8..16).collect(),
            },
        );
        rec.lsn = Lsn::new(1, 512);
        rec.prev_lsn = Lsn::new(1, 300);
        assert_eq!(rec.encode().len(), rec.encoded_size());
        assert_eq!(round_trip(&rec), rec);
    }

    #[test]
    fn zero_length_means_tail() {
        assert!(LogRecord::decode_from(&[0u8; 64]).unwrap().is_none());
        assert!(LogRecord::decode_from(&[0u8; 4]).unwrap().is_none());
    }

    #[test]
    fn checksum_failure_is_an_error() {
        let mut rec = LogRecord::system(
            VolumeId::new(1),
            PageId::new(2),
            LogPayload::Comment { text: "hello".into() },
        );
        rec.lsn = Lsn::new(1, 0);
        let mut bytes = rec.encode();
        bytes[20] ^= 0x01;
        assert!(LogRecord::decode_from(&bytes).is_err());
    }

    #[test]
    fn redo_page_write_patches_and_stamps() {
        let mut page = Page::new(VolumeId::new(1), PageId::new(40), StoreId::new(2));
        let mut rec = LogRecord::transactional(
            TxnId::new(1),
            VolumeId::new(1),
            PageId::new(40),
            true,
            LogPayload::PageWrite { offset: 10, before: vec![0, 0, 0], after: vec![7, 8, 9] },
        );
        rec.lsn = Lsn::new(1, 128);
        rec.redo(&mut page).unwrap();
        assert_eq!(&page.payload()[10..13], &[7, 8, 9]);
        assert_eq!(page.lsn(), Lsn::new(1, 128));
    }

    #[test]
    fn undo_record_swaps_images() {
        let rec = LogRecord::transactional(
            TxnId::new(1),
            VolumeId::new(1),
            PageId::new(40),
            true,
            LogPayload::PageWrite { offset: 0, before: vec![1], after: vec![2] },
        );
        let clr = rec.undo_record(Lsn::new(1, 64)).unwrap();
        assert!(!clr.undoable, "compensation must not be undone again");
        assert_eq!(clr.prev_lsn, Lsn::new(1, 64));
        match clr.payload {
            LogPayload::PageWrite { before, after, .. } => {
                assert_eq!(before, vec![2]);
                assert_eq!(after, vec![1]);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn commit_has_no_undo() {
        let rec =
            LogRecord::transactional(TxnId::new(1), VolumeId::new(1), PageId::NULL, false, LogPayload::Commit);
        assert!(rec.undo_record(Lsn::NULL).is_none());
    }

    #[test]
    fn stnode_image_round_trip() {
        let img = StnodeImage { root: 44, flags: 0b10, deleting: 1 };
        assert_eq!(StnodeImage::decode(&img.encode()), img);
    }

    proptest! {
        #[test]
        fn arbitrary_page_write_round_trips(
            offset in 0u32..7000,
            len in 0usize..128,
            seed in any::<u8>(),
            lsn in 1u64..u64::MAX,
        ) {
            let before = vec![seed; len];
            let after = vec![seed.wrapping_add(1); len];
            let mut rec = LogRecord::transactional(
                TxnId::new(9),
                VolumeId::new(2),
                PageId::new(77),
                true,
                LogPayload::PageWrite { offset, before, after },
            );
            rec.lsn = Lsn::from_data(lsn);
            prop_assert_eq!(round_trip(&rec), rec);
        }
    }
}
