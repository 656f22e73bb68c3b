use std::fs::File;
use std::os::unix::fs::FileExt;
use std::slice;

use log::trace;
use memmap2::{MmapOptions, MmapRaw};

use crate::error::{Error, Result};
use crate::types::Pgno;

/// Memory-mapped data file.
///
/// The map is created once with the length of the geometry upper bound, so
/// slices handed to readers never move. Only the file length follows the
/// database as it grows. Pages are read through the map; in the default mode
/// they are written with positioned writes to the file, with `WRITEMAP` they
/// are copied through a writable map.
pub(crate) struct Store {
    file: File,
    map: MmapRaw,
    page_size: usize,
    writemap: bool,
}

impl Store {
    pub(crate) fn open(file: File, page_size: usize, map_pages: usize, writemap: bool) -> Result<Self> {
        let len = map_pages * page_size;
        let map = if writemap {
            MmapOptions::new().len(len).map_raw(&file)?
        } else {
            MmapOptions::new().len(len).map_raw_read_only(&file)?
        };
        trace!("mapped {} bytes (writemap: {})", len, writemap);
        Ok(Store {
            file,
            map,
            page_size,
            writemap,
        })
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.page_size
    }

    #[inline]
    pub(crate) fn map_len(&self) -> usize {
        self.map.len()
    }

    #[inline]
    pub(crate) fn file(&self) -> &File {
        &self.file
    }

    /// `npages` pages starting at `pgno`, as mapped.
    pub(crate) fn pages(&self, pgno: Pgno, npages: usize) -> Result<&[u8]> {
        let off = pgno as usize * self.page_size;
        let len = npages * self.page_size;
        if npages == 0 || off + len > self.map.len() {
            return Err(Error::corrupted(pgno, "page beyond the mapped region"));
        }
        // The map lives as long as `self` and never shrinks or moves. Bytes
        // below the committed boundary are only rewritten for pages that no
        // live snapshot references.
        Ok(unsafe { slice::from_raw_parts(self.map.as_ptr().add(off), len) })
    }

    #[inline]
    pub(crate) fn page(&self, pgno: Pgno) -> Result<&[u8]> {
        self.pages(pgno, 1)
    }

    /// Writes whole pages at `pgno`.
    pub(crate) fn write(&self, pgno: Pgno, bytes: &[u8]) -> Result<()> {
        let off = pgno as usize * self.page_size;
        if self.writemap {
            if off + bytes.len() > self.map.len() {
                return Err(Error::MapFull);
            }
            // Pages written here are either unreachable from every snapshot
            // or meta slots that readers validate before use.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes.as_ptr(),
                    self.map.as_mut_ptr().add(off),
                    bytes.len(),
                );
            }
        } else {
            self.file.write_all_at(bytes, off as u64)?;
        }
        Ok(())
    }

    /// Flushes written data pages.
    pub(crate) fn sync_data(&self) -> Result<()> {
        if self.writemap {
            self.map.flush()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Flushes the meta slot `pgno`.
    pub(crate) fn sync_meta(&self, pgno: Pgno) -> Result<()> {
        if self.writemap {
            self.map
                .flush_range(pgno as usize * self.page_size, self.page_size)?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    /// Current length of the data file in bytes.
    pub(crate) fn file_len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Extends the file to hold `pages` pages. Never shrinks it.
    pub(crate) fn ensure_len(&self, pages: Pgno) -> Result<()> {
        let want = pages as u64 * self.page_size as u64;
        if want > self.map.len() as u64 {
            return Err(Error::MapFull);
        }
        if self.file_len()? < want {
            trace!("extending data file to {} pages", pages);
            self.file.set_len(want)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open_store(dir: &TempDir, writemap: bool) -> Store {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(dir.path().join("store.dat"))
            .unwrap();
        file.set_len(4 * 256).unwrap();
        Store::open(file, 256, 16, writemap).unwrap()
    }

    #[test]
    fn writes_are_visible_through_the_map() {
        for writemap in [false, true] {
            let dir = TempDir::new().unwrap();
            let store = open_store(&dir, writemap);
            store.write(2, &[0xAB; 256]).unwrap();
            store.sync_data().unwrap();
            assert_eq!(store.page(2).unwrap(), &[0xABu8; 256][..]);
            assert_eq!(store.page(1).unwrap(), &[0u8; 256][..]);
        }
    }

    #[test]
    fn file_grows_up_to_the_map() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir, false);
        store.ensure_len(8).unwrap();
        assert_eq!(store.file_len().unwrap(), 8 * 256);
        store.ensure_len(2).unwrap();
        assert_eq!(store.file_len().unwrap(), 8 * 256);
        assert!(matches!(store.ensure_len(17), Err(Error::MapFull)));
        assert!(store.pages(15, 2).is_err());
    }
}
