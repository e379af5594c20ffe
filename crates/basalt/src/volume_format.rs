//! On-disk volume layout.
//!
//! Page 0 does not exist (the null id). Page 1 is the volume header, page 2
//! the page-allocation bitmap, page 3 the store-node page; data pages start
//! at 4. Formatting writes the three system pages; the allocation bitmap
//! maps bit N to page id N, with the system pages pre-marked.

use basalt_bufpool::PageDevice;
use basalt_error::{BasaltError, Result};
use basalt_types::{PAGE_PAYLOAD_SIZE, Page, PageId, StoreId, VolumeId};

/// Volume header page.
pub const HEADER_PAGE: PageId = PageId::new(1);
/// Page-allocation bitmap page.
pub const ALLOC_PAGE: PageId = PageId::new(2);

/// Highest allocatable page id (one bit per page in the bitmap payload).
pub const MAX_PAGE_ID: u32 = (PAGE_PAYLOAD_SIZE * 8 - 1) as u32;

const HEADER_MAGIC: &[u8; 8] = b"BASALTVL";

/// Whether the device already carries a formatted volume.
pub fn is_formatted(device: &dyn PageDevice) -> Result<bool> {
    match device.read_page(HEADER_PAGE)? {
        Some(image) if Page::checksum_ok(&image) => {
            let page = Page::decode_unchecked(&image);
            Ok(&page.payload()[..8] == HEADER_MAGIC)
        }
        _ => Ok(false),
    }
}

/// Write a fresh volume: header, allocation bitmap (system pages marked),
/// empty store-node page.
pub fn format_volume(device: &dyn PageDevice, vol: VolumeId) -> Result<()> {
    let mut header = Page::new(vol, HEADER_PAGE, StoreId::RESERVED);
    header.patch_payload(0, HEADER_MAGIC).map_err(fmt_err)?;
    header
        .patch_payload(8, &vol.get().to_le_bytes())
        .map_err(fmt_err)?;
    device.write_page(HEADER_PAGE, &header.encode())?;

    let mut alloc = Page::new(vol, ALLOC_PAGE, StoreId::RESERVED);
    // Pages 0 (null) through 3 (store-node) are never allocatable.
    alloc.patch_payload(0, &[0b0000_1111]).map_err(fmt_err)?;
    device.write_page(ALLOC_PAGE, &alloc.encode())?;

    let stnode = Page::new(vol, super::catalog::STNODE_PAGE, StoreId::RESERVED);
    device.write_page(super::catalog::STNODE_PAGE, &stnode.encode())?;
    device.sync()?;
    Ok(())
}

fn fmt_err(e: basalt_types::PageDecodeError) -> BasaltError {
    BasaltError::internal(e.to_string())
}

/// Find the first clear bit in the bitmap payload; returns `(byte, mask,
/// page id)`. The caller owns the exclusively fixed bitmap page.
#[must_use]
pub fn first_free_bit(payload: &[u8]) -> Option<(usize, u8, PageId)> {
    for (byte_idx, &byte) in payload.iter().enumerate() {
        if byte != 0xFF {
            let bit = byte.trailing_ones() as usize;
            let pid = (byte_idx * 8 + bit) as u32;
            if pid > MAX_PAGE_ID {
                return None;
            }
            return Some((byte_idx, 1 << bit, PageId::new(pid)));
        }
    }
    None
}

/// Locate the bitmap byte and mask for `pid`.
#[must_use]
pub fn bit_of(pid: PageId) -> (usize, u8) {
    let n = pid.bits() as usize;
    (n / 8, 1 << (n % 8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_bufpool::MemDevice;

    #[test]
    fn format_and_detect() {
        let dev = MemDevice::new();
        assert!(!is_formatted(&dev).unwrap());
        format_volume(&dev, VolumeId::new(1)).unwrap();
        assert!(is_formatted(&dev).unwrap());
        assert_eq!(dev.page_count(), 3);
    }

    #[test]
    fn bitmap_allocates_past_system_pages() {
        let dev = MemDevice::new();
        format_volume(&dev, VolumeId::new(1)).unwrap();
        let image = dev.read_page(ALLOC_PAGE).unwrap().unwrap();
        let page = Page::decode(&image).unwrap();
        let (byte, mask, pid) = first_free_bit(page.payload()).unwrap();
        assert_eq!((byte, mask), (0, 1 << 4));
        assert_eq!(pid, PageId::new(4));
    }

    #[test]
    fn bit_addressing_round_trips() {
        let (byte, mask) = bit_of(PageId::new(4));
        assert_eq!((byte, mask), (0, 0b0001_0000));
        let (byte, mask) = bit_of(PageId::new(8));
        assert_eq!((byte, mask), (1, 0b0000_0001));
    }
}
