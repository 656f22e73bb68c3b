//! Shared reader table kept in the lock file.
//!
//! ```text
//! 0    u64  lock magic and version
//! 8    u32  format id
//! 12   u32  slot capacity
//! 16   u32  slots ever claimed
//! 24   u64  free-slot stack head: tag << 32 | (index + 1), 0 when empty
//! 128  slots, 32 bytes each:
//!        0   u64  snapshot txnid (0 while not reading)
//!        8   u64  thread id
//!        16  u32  process id
//!        20  u32  next free slot (index + 1)
//!        24  u32  snapshot page count
//! ```
//!
//! Every field is accessed atomically in place so independent processes
//! sharing the file coordinate without a lock.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use log::{debug, warn};
use memmap2::{MmapOptions, MmapRaw};
use once_cell::sync::Lazy;

use crate::constants::LOCK_MAGIC_AND_VERSION;
use crate::error::{Error, Result};
use crate::types::{Pgno, ReaderInfo, Txnid};

const LCK_MAGIC: usize = 0;
const LCK_FORMAT: usize = 8;
const LCK_CAPACITY: usize = 12;
const LCK_NUM_READERS: usize = 16;
const LCK_FREE_HEAD: usize = 24;
const LCK_SLOTS: usize = 128;
const SLOT_SIZE: usize = 32;

const S_TXNID: usize = 0;
const S_TID: usize = 8;
const S_PID: usize = 16;
const S_NEXT: usize = 20;
const S_PAGES: usize = 24;

const FORMAT_ID: u32 = 1;

static PID: Lazy<u32> = Lazy::new(std::process::id);

thread_local! {
    static TID: Cell<u64> = const { Cell::new(0) };
}

fn current_tid() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    TID.with(|tid| {
        if tid.get() == 0 {
            tid.set(NEXT.fetch_add(1, Ordering::Relaxed));
        }
        tid.get()
    })
}

pub(crate) struct ReaderTable {
    file: File,
    map: MmapRaw,
    capacity: u32,
}

impl ReaderTable {
    /// Opens (and, for the first opener, reinitialises) the lock file.
    pub(crate) fn open(path: &Path, capacity: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let exclusive = fs2::FileExt::try_lock_exclusive(&file).is_ok();
        if !exclusive {
            fs2::FileExt::lock_shared(&file)?;
        }

        let len = if exclusive {
            let len = LCK_SLOTS + SLOT_SIZE * capacity as usize;
            file.set_len(0)?;
            file.set_len(len as u64)?;
            len
        } else {
            file.metadata()?.len() as usize
        };
        if len < LCK_SLOTS {
            return Err(Error::Invalid);
        }
        let map = MmapOptions::new().len(len).map_raw(&file)?;
        let mut table = ReaderTable {
            file,
            map,
            capacity,
        };

        if exclusive {
            table.u32_at(LCK_FORMAT).store(FORMAT_ID, Ordering::Relaxed);
            table.u32_at(LCK_CAPACITY).store(capacity, Ordering::Relaxed);
            table.u32_at(LCK_NUM_READERS).store(0, Ordering::Relaxed);
            table.u64_at(LCK_FREE_HEAD).store(0, Ordering::Relaxed);
            table
                .u64_at(LCK_MAGIC)
                .store(LOCK_MAGIC_AND_VERSION, Ordering::Release);
            debug!("initialised reader table {:?} with {} slots", path, capacity);
            fs2::FileExt::lock_shared(&table.file)?;
        } else {
            if table.u64_at(LCK_MAGIC).load(Ordering::Acquire) != LOCK_MAGIC_AND_VERSION
                || table.u32_at(LCK_FORMAT).load(Ordering::Relaxed) != FORMAT_ID
            {
                return Err(Error::VersionMismatch);
            }
            let stored = table.u32_at(LCK_CAPACITY).load(Ordering::Relaxed);
            if LCK_SLOTS + SLOT_SIZE * stored as usize > len {
                return Err(Error::Invalid);
            }
            table.capacity = stored;
        }
        Ok(table)
    }

    fn u64_at(&self, off: usize) -> &AtomicU64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.map.len());
        // The map is page aligned and `off` is a multiple of 8 inside it.
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU64) }
    }

    fn u32_at(&self, off: usize) -> &AtomicU32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.map.len());
        unsafe { &*(self.map.as_mut_ptr().add(off) as *const AtomicU32) }
    }

    fn slot_off(slot: usize) -> usize {
        LCK_SLOTS + SLOT_SIZE * slot
    }

    #[inline]
    pub(crate) fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Claims a slot: the most recently released one, else a never-used one.
    pub(crate) fn acquire(&self) -> Result<usize> {
        let slot = match self.pop_free() {
            Some(slot) => slot,
            None => self.claim_new()?,
        };
        let off = Self::slot_off(slot);
        self.u64_at(off + S_TXNID).store(0, Ordering::Relaxed);
        self.u64_at(off + S_TID).store(current_tid(), Ordering::Relaxed);
        self.u32_at(off + S_PID).store(*PID, Ordering::Relaxed);
        Ok(slot)
    }

    fn pop_free(&self) -> Option<usize> {
        let head = self.u64_at(LCK_FREE_HEAD);
        let mut cur = head.load(Ordering::Acquire);
        loop {
            let idx = cur as u32;
            if idx == 0 {
                return None;
            }
            let slot = idx as usize - 1;
            let next = self
                .u32_at(Self::slot_off(slot) + S_NEXT)
                .load(Ordering::Acquire);
            let tag = (cur >> 32).wrapping_add(1);
            match head.compare_exchange_weak(
                cur,
                tag << 32 | next as u64,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(slot),
                Err(actual) => cur = actual,
            }
        }
    }

    fn claim_new(&self) -> Result<usize> {
        let count = self.u32_at(LCK_NUM_READERS);
        let mut cur = count.load(Ordering::Acquire);
        loop {
            if cur >= self.capacity {
                return Err(Error::ReadersFull);
            }
            match count.compare_exchange_weak(cur, cur + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => return Ok(cur as usize),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Publishes the snapshot a reader is about to use.
    pub(crate) fn publish(&self, slot: usize, txnid: Txnid, pages: Pgno) {
        let off = Self::slot_off(slot);
        self.u32_at(off + S_PAGES).store(pages, Ordering::Relaxed);
        self.u64_at(off + S_TXNID).store(txnid, Ordering::SeqCst);
    }

    /// Clears the slot and pushes it on the free stack.
    pub(crate) fn release(&self, slot: usize) {
        let off = Self::slot_off(slot);
        self.u64_at(off + S_TXNID).store(0, Ordering::SeqCst);
        self.u64_at(off + S_TID).store(0, Ordering::Relaxed);
        self.u32_at(off + S_PID).store(0, Ordering::Relaxed);

        let head = self.u64_at(LCK_FREE_HEAD);
        let mut cur = head.load(Ordering::Acquire);
        loop {
            self.u32_at(off + S_NEXT).store(cur as u32, Ordering::Release);
            let tag = (cur >> 32).wrapping_add(1);
            match head.compare_exchange_weak(
                cur,
                tag << 32 | (slot as u64 + 1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Oldest snapshot still in use, or `fallback` when nobody reads.
    pub(crate) fn oldest(&self, fallback: Txnid) -> Txnid {
        let claimed = self
            .u32_at(LCK_NUM_READERS)
            .load(Ordering::Acquire)
            .min(self.capacity) as usize;
        (0..claimed)
            .map(|slot| {
                self.u64_at(Self::slot_off(slot) + S_TXNID)
                    .load(Ordering::SeqCst)
            })
            .filter(|&txnid| txnid != 0)
            .fold(fallback, Txnid::min)
    }

    /// Number of slots currently reading.
    pub(crate) fn active(&self) -> u32 {
        self.list().len() as u32
    }

    pub(crate) fn list(&self) -> Vec<ReaderInfo> {
        let claimed = self
            .u32_at(LCK_NUM_READERS)
            .load(Ordering::Acquire)
            .min(self.capacity) as usize;
        (0..claimed)
            .filter_map(|slot| {
                let off = Self::slot_off(slot);
                let txnid = self.u64_at(off + S_TXNID).load(Ordering::Acquire);
                if txnid == 0 {
                    return None;
                }
                Some(ReaderInfo {
                    slot,
                    pid: self.u32_at(off + S_PID).load(Ordering::Relaxed),
                    tid: self.u64_at(off + S_TID).load(Ordering::Relaxed),
                    txnid,
                })
            })
            .collect()
    }
}

impl Drop for ReaderTable {
    fn drop(&mut self) {
        if let Err(e) = fs2::FileExt::unlock(&self.file) {
            warn!("failed to unlock the reader table: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn released_slots_are_reused_lifo() {
        let dir = TempDir::new().unwrap();
        let table = ReaderTable::open(&dir.path().join("t.lck"), 4).unwrap();
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        let c = table.acquire().unwrap();
        assert_eq!((a, b, c), (0, 1, 2));
        table.release(a);
        table.release(c);
        assert_eq!(table.acquire().unwrap(), c);
        assert_eq!(table.acquire().unwrap(), a);
        assert_eq!(table.acquire().unwrap(), 3);
        assert!(matches!(table.acquire(), Err(Error::ReadersFull)));
    }

    #[test]
    fn oldest_ignores_idle_slots() {
        let dir = TempDir::new().unwrap();
        let table = ReaderTable::open(&dir.path().join("t.lck"), 8).unwrap();
        assert_eq!(table.oldest(50), 50);
        let a = table.acquire().unwrap();
        let b = table.acquire().unwrap();
        let _idle = table.acquire().unwrap();
        table.publish(a, 12, 100);
        table.publish(b, 9, 90);
        assert_eq!(table.oldest(50), 9);
        assert_eq!(table.list().len(), 2);
        assert_eq!(table.list()[1].pid, std::process::id());
        table.release(b);
        assert_eq!(table.oldest(50), 12);
        assert_eq!(table.active(), 1);
    }

    #[test]
    fn second_opener_shares_the_table() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.lck");
        let first = ReaderTable::open(&path, 8).unwrap();
        let slot = first.acquire().unwrap();
        first.publish(slot, 7, 10);
        let second = ReaderTable::open(&path, 2).unwrap();
        assert_eq!(second.capacity(), 8);
        assert_eq!(second.oldest(100), 7);
    }
}
