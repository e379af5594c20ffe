//! Mounted volumes and the page device abstraction.
//!
//! The on-disk volume format itself is owned by the layer above; the buffer
//! pool only needs to read and write raw page images and to remember, per
//! volume, which frame holds each store's root page.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use basalt_error::Result;
use basalt_types::{FrameId, PAGE_SIZE, PageId, StoreId, VolumeId};
use parking_lot::{Mutex, RwLock};

// ---------------------------------------------------------------------------
// PageDevice
// ---------------------------------------------------------------------------

/// Raw page I/O for one volume.
pub trait PageDevice: Send + Sync {
    /// Read the raw image of `pid`. `Ok(None)` when the page has never been
    /// written (reads past the end of the device).
    fn read_page(&self, pid: PageId) -> Result<Option<Vec<u8>>>;

    /// Write the raw image of `pid`.
    fn write_page(&self, pid: PageId, image: &[u8]) -> Result<()>;

    /// Flush device buffers.
    fn sync(&self) -> Result<()>;
}

/// In-memory device, used by tests and as the backing for scratch volumes.
#[derive(Debug, Default)]
pub struct MemDevice {
    pages: Mutex<HashMap<u32, Vec<u8>>>,
}

impl MemDevice {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Flip bytes `range` of the stored image of `pid`. Test hook for
    /// exercising single-page recovery.
    pub fn corrupt_page(&self, pid: PageId, range: std::ops::Range<usize>) {
        let mut pages = self.pages.lock();
        if let Some(image) = pages.get_mut(&pid.bits()) {
            for b in &mut image[range] {
                *b ^= 0xFF;
            }
        }
    }

    /// Number of pages ever written.
    #[must_use]
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }
}

impl PageDevice for MemDevice {
    fn read_page(&self, pid: PageId) -> Result<Option<Vec<u8>>> {
        Ok(self.pages.lock().get(&pid.bits()).cloned())
    }

    fn write_page(&self, pid: PageId, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        self.pages.lock().insert(pid.bits(), image.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed device: a flat sequence of fixed-size pages, page id as the
/// file offset divisor.
#[derive(Debug)]
pub struct FileDevice {
    file: Mutex<File>,
}

impl FileDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self { file: Mutex::new(file) })
    }
}

impl PageDevice for FileDevice {
    fn read_page(&self, pid: PageId) -> Result<Option<Vec<u8>>> {
        let mut file = self.file.lock();
        let offset = u64::from(pid.bits()) * PAGE_SIZE as u64;
        if offset + PAGE_SIZE as u64 > file.metadata()?.len() {
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset))?;
        let mut image = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut image)?;
        Ok(Some(image))
    }

    fn write_page(&self, pid: PageId, image: &[u8]) -> Result<()> {
        debug_assert_eq!(image.len(), PAGE_SIZE);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(u64::from(pid.bits()) * PAGE_SIZE as u64))?;
        file.write_all(image)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Volume
// ---------------------------------------------------------------------------

/// Descriptor of a mounted volume: device plus the root frame index per
/// store. Root frames are pinned for the lifetime of the mount, so the
/// indices here are always valid.
pub struct Volume {
    id: VolumeId,
    device: Box<dyn PageDevice>,
    roots: RwLock<HashMap<StoreId, FrameId>>,
}

impl Volume {
    #[must_use]
    pub fn new(id: VolumeId, device: Box<dyn PageDevice>) -> Self {
        Self { id, device, roots: RwLock::new(HashMap::new()) }
    }

    #[must_use]
    pub fn id(&self) -> VolumeId {
        self.id
    }

    #[must_use]
    pub fn device(&self) -> &dyn PageDevice {
        &*self.device
    }

    #[must_use]
    pub fn root_frame(&self, store: StoreId) -> Option<FrameId> {
        self.roots.read().get(&store).copied()
    }

    pub fn set_root_frame(&self, store: StoreId, frame: FrameId) {
        self.roots.write().insert(store, frame);
    }

    pub fn clear_root_frame(&self, store: StoreId) -> Option<FrameId> {
        self.roots.write().remove(&store)
    }

    /// Frames currently registered as roots (unmount path).
    #[must_use]
    pub fn all_root_frames(&self) -> Vec<(StoreId, FrameId)> {
        self.roots.read().iter().map(|(s, f)| (*s, *f)).collect()
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("id", &self.id)
            .field("roots", &self.roots.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basalt_types::Page;

    #[test]
    fn mem_device_round_trip_and_corruption() {
        let dev = MemDevice::new();
        let pid = PageId::new(7);
        assert!(dev.read_page(pid).unwrap().is_none());

        let page = Page::new(VolumeId::new(1), pid, StoreId::new(1));
        dev.write_page(pid, &page.encode()).unwrap();
        let image = dev.read_page(pid).unwrap().unwrap();
        assert!(Page::checksum_ok(&image));

        dev.corrupt_page(pid, 1234..2220);
        let image = dev.read_page(pid).unwrap().unwrap();
        assert!(!Page::checksum_ok(&image));
    }

    #[test]
    fn file_device_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let dev = FileDevice::open(dir.path().join("vol.db")).unwrap();
        let pid = PageId::new(3);
        assert!(dev.read_page(pid).unwrap().is_none());

        let mut page = Page::new(VolumeId::new(1), pid, StoreId::new(2));
        page.patch_payload(0, b"persisted").unwrap();
        dev.write_page(pid, &page.encode()).unwrap();
        dev.sync().unwrap();

        let image = dev.read_page(pid).unwrap().unwrap();
        let back = Page::decode(&image).unwrap();
        assert_eq!(&back.payload()[..9], b"persisted");
        // Sparse write: earlier pages read back as never-written or zeroed.
        match dev.read_page(PageId::new(1)).unwrap() {
            None => {}
            Some(image) => assert!(!Page::checksum_ok(&image)),
        }
    }

    #[test]
    fn volume_root_registry() {
        let vol = Volume::new(VolumeId::new(1), Box::new(MemDevice::new()));
        assert!(vol.root_frame(StoreId::new(1)).is_none());
        vol.set_root_frame(StoreId::new(1), FrameId::new(4));
        assert_eq!(vol.root_frame(StoreId::new(1)), Some(FrameId::new(4)));
        assert_eq!(vol.all_root_frames(), vec![(StoreId::new(1), FrameId::new(4))]);
        assert_eq!(vol.clear_root_frame(StoreId::new(1)), Some(FrameId::new(4)));
    }
}
