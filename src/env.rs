use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, trace, warn};
use once_cell::sync::Lazy;

use crate::constants::{
    DbFlags, EnvFlags, CHANGEABLE, DATASIGN_STEADY, DATASIGN_WEAK, DATA_FILENAME,
    DEFAULT_MAX_DBS, DEFAULT_MAX_READERS, DEFAULT_PAGE_SIZE, LOCK_FILENAME, LOCK_SUFFIX,
    MAX_PAGE_SIZE, META_SIZE, MIN_PAGE_SIZE, NUM_METAS, PAGE_HEADER_SIZE,
};
use crate::comparator::Comparator;
use crate::database::{Database, DbRegistry};
use crate::error::{Error, Result};
use crate::lock::WriterLock;
use crate::meta::{self, Meta, MetaGeometry};
use crate::page::{max_key_size, PageRef};
use crate::reader::ReaderTable;
use crate::store::Store;
use crate::transaction::{RoTransaction, RwTransaction, Transaction};
use crate::types::{EnvInfo, Geometry, Pgno, ReaderInfo, Stat};

/// Largest page number a geometry may reach.
const MAX_PAGENO: Pgno = 0x7FFF_FFFF;

/// Identifier of the running system boot; zeroes where the kernel does not
/// expose one. Weak metas written under another boot are not trusted.
static BOOT_ID: Lazy<[u8; 16]> = Lazy::new(|| {
    let mut id = [0u8; 16];
    if let Ok(text) = fs::read_to_string("/proc/sys/kernel/random/boot_id") {
        let digits = text.bytes().filter_map(|b| (b as char).to_digit(16));
        for (i, d) in digits.take(32).enumerate() {
            id[i / 2] |= (d as u8) << if i % 2 == 0 { 4 } else { 0 };
        }
    }
    id
});

pub(crate) fn boot_id() -> [u8; 16] {
    *BOOT_ID
}

/// Configuration of an environment, applied by [`EnvironmentBuilder::open`].
#[derive(Debug, Clone)]
pub struct EnvironmentBuilder {
    flags: EnvFlags,
    page_size: usize,
    geometry: Geometry,
    max_readers: u32,
    max_dbs: u32,
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        EnvironmentBuilder {
            flags: EnvFlags::empty(),
            page_size: DEFAULT_PAGE_SIZE,
            geometry: Geometry::default(),
            max_readers: DEFAULT_MAX_READERS,
            max_dbs: DEFAULT_MAX_DBS,
        }
    }
}

impl EnvironmentBuilder {
    /// Page size of a newly created file. Existing files keep their own.
    pub fn set_page_size(&mut self, page_size: usize) -> &mut Self {
        self.page_size = page_size;
        self
    }

    pub fn set_geometry(&mut self, geometry: Geometry) -> &mut Self {
        self.geometry = geometry;
        self
    }

    /// Set the maximum size of the data file (the geometry upper bound)
    pub fn set_map_size(&mut self, size: usize) -> &mut Self {
        self.geometry.size_upper = size;
        self
    }

    /// Set the number of reader slots
    pub fn set_max_readers(&mut self, readers: u32) -> &mut Self {
        self.max_readers = readers;
        self
    }

    /// Set the maximum number of named databases
    pub fn set_max_dbs(&mut self, dbs: u32) -> &mut Self {
        self.max_dbs = dbs;
        self
    }

    pub fn set_flags(&mut self, flags: EnvFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(Error::InvalidConfig(
                "page size must be a power of two between 256 and 65536",
            ));
        }
        if self.max_readers == 0 {
            return Err(Error::InvalidConfig("at least one reader slot is required"));
        }
        let geo = &self.geometry;
        if geo.size_upper < geo.size_lower.max(geo.size_now) {
            return Err(Error::InvalidConfig("geometry upper bound below the lower bound"));
        }
        Ok(())
    }

    /// Geometry in pages for a file with `page_size` pages.
    fn meta_geometry(&self, page_size: usize) -> Result<MetaGeometry> {
        let to_pages = |bytes: usize| (bytes + page_size - 1) / page_size;
        let upper = to_pages(self.geometry.size_upper).min(MAX_PAGENO as usize) as Pgno;
        let lower = to_pages(self.geometry.size_lower).max(NUM_METAS) as Pgno;
        if upper < lower {
            return Err(Error::InvalidConfig("geometry upper bound is too small"));
        }
        let now = (to_pages(self.geometry.size_now) as Pgno).clamp(lower, upper);
        let growth = to_pages(self.geometry.growth_step).max(1);
        Ok(MetaGeometry {
            grow_pv: growth.min(u16::MAX as usize) as u16,
            shrink_pv: 0,
            lower,
            upper,
            now,
            first_unallocated: NUM_METAS as Pgno,
        })
    }

    /// Open (creating when allowed) the environment at `path`.
    ///
    /// Without `NOSUBDIR`, `path` is a directory holding `mdbx.dat` and
    /// `mdbx.lck`; with it, `path` is the data file and the lock file sits
    /// next to it with a `-lck` suffix.
    pub fn open<P: AsRef<Path>>(&self, path: P) -> Result<Environment> {
        self.validate()?;
        let path = path.as_ref();
        let flags = self.flags;
        let rdonly = flags.contains(EnvFlags::RDONLY);

        let (data_path, lock_path) = if flags.contains(EnvFlags::NOSUBDIR) {
            let mut lock = OsString::from(path.as_os_str());
            lock.push(LOCK_SUFFIX);
            (path.to_path_buf(), PathBuf::from(lock))
        } else {
            if !rdonly {
                fs::create_dir_all(path)?;
            }
            (path.join(DATA_FILENAME), path.join(LOCK_FILENAME))
        };

        let file = OpenOptions::new()
            .read(true)
            .write(!rdonly)
            .create(!rdonly)
            .open(&data_path)?;
        if file.metadata()?.len() == 0 {
            if rdonly {
                return Err(Error::Invalid);
            }
            fs2::FileExt::lock_exclusive(&file)?;
            let created = self.init_file(&file);
            fs2::FileExt::unlock(&file)?;
            created?;
        }

        let mut head_page = vec![0u8; PAGE_HEADER_SIZE + META_SIZE];
        file.read_exact_at(&mut head_page, 0)?;
        let page_size = Meta::peek_page_size(&head_page)?;
        if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
            return Err(Error::Invalid);
        }

        let mut metas: [Option<Meta>; NUM_METAS] = Default::default();
        let mut page = vec![0u8; page_size];
        for (i, slot) in metas.iter_mut().enumerate() {
            file.read_exact_at(&mut page, (i * page_size) as u64)?;
            match Meta::decode(&page) {
                Ok(meta) if trusted(&meta) => *slot = Some(meta),
                Ok(meta) => warn!(
                    "meta slot {} (txn {}) is weak from an earlier boot, ignored",
                    i, meta.txnid
                ),
                Err(e) => warn!("meta slot {} of {:?} is unusable: {}", i, data_path, e),
            }
        }
        let head = meta::head_slot(&metas).ok_or(Error::Corrupted)?;
        let Some(meta) = metas[head].take() else {
            return Err(Error::Corrupted);
        };
        let file_len = file.metadata()?.len();
        if file_len < meta.geometry.first_unallocated as u64 * page_size as u64 {
            return Err(Error::Corrupted);
        }

        let mut upper_pages = meta.geometry.upper;
        let growth_pages;
        if rdonly {
            growth_pages = meta.geometry.grow_pv.max(1) as Pgno;
        } else {
            let configured = self.meta_geometry(page_size)?;
            upper_pages = upper_pages.max(configured.upper);
            growth_pages = configured.grow_pv.max(1) as Pgno;
        }

        let writemap = flags.contains(EnvFlags::WRITEMAP) && !rdonly;
        let store = Store::open(file, page_size, upper_pages as usize, writemap)?;
        let readers = ReaderTable::open(&lock_path, self.max_readers)?;
        let main_flags = DbFlags::from_bits_truncate(meta.main_tree().flags as u32);

        debug!(
            "opened {:?}: page size {}, txn {} in meta slot {}, {} of {} pages used",
            data_path, page_size, meta.txnid, head, meta.geometry.first_unallocated, upper_pages
        );
        Ok(Environment {
            path: path.to_path_buf(),
            flags: AtomicU32::new(flags.bits()),
            store,
            readers,
            writer: WriterLock::new(),
            dbs: DbRegistry::new(main_flags, self.max_dbs),
            max_dbs: self.max_dbs,
            upper_pages,
            growth_pages,
        })
    }

    /// Writes the three initial metas of an empty data file.
    fn init_file(&self, file: &File) -> Result<()> {
        if file.metadata()?.len() != 0 {
            return Ok(());
        }
        let page_size = self.page_size;
        let geometry = self.meta_geometry(page_size)?;
        let meta = Meta::initial(page_size, geometry, new_dxbid());
        let mut buf = vec![0u8; page_size * NUM_METAS];
        for (i, page) in buf.chunks_mut(page_size).enumerate() {
            meta.encode(i as Pgno, page);
        }
        file.set_len(geometry.now as u64 * page_size as u64)?;
        file.write_all_at(&buf, 0)?;
        file.sync_all()?;
        debug!(
            "created data file: page size {}, {} pages, upper bound {} pages",
            page_size, geometry.now, geometry.upper
        );
        Ok(())
    }
}

fn new_dxbid() -> [u8; 16] {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64);
    let mut id = [0u8; 16];
    id[..8].copy_from_slice(&nanos.to_le_bytes());
    id[8..12].copy_from_slice(&std::process::id().to_le_bytes());
    id[12..].copy_from_slice(&BOOT_ID[..4]);
    id
}

/// A weak meta only counts if it was written during the current boot.
fn trusted(meta: &Meta) -> bool {
    meta.sign != DATASIGN_WEAK || meta.bootid == [0; 16] || meta.bootid == *BOOT_ID
}

/// An open database environment: one data file, its lock file, and the
/// state shared by all transactions on it.
pub struct Environment {
    path: PathBuf,
    flags: AtomicU32,
    store: Store,
    readers: ReaderTable,
    writer: WriterLock,
    dbs: DbRegistry,
    max_dbs: u32,
    upper_pages: Pgno,
    growth_pages: Pgno,
}

impl Environment {
    /// Start configuring an environment
    #[allow(clippy::new_ret_no_self)]
    pub fn new() -> EnvironmentBuilder {
        EnvironmentBuilder::default()
    }

    /// Begin a read-only transaction on the latest committed snapshot
    pub fn begin_ro_txn(&self) -> Result<RoTransaction<'_>> {
        RoTransaction::new(self)
    }

    /// Begin the write transaction, waiting for the current writer to finish
    pub fn begin_rw_txn(&self) -> Result<RwTransaction<'_>> {
        self.check_writable()?;
        let guard = self.writer.lock(self.store.file())?;
        RwTransaction::new(self, guard)
    }

    /// Begin the write transaction, or fail with `Busy` if one is running
    pub fn try_begin_rw_txn(&self) -> Result<RwTransaction<'_>> {
        self.check_writable()?;
        let guard = self.writer.try_lock(self.store.file())?;
        RwTransaction::new(self, guard)
    }

    fn check_writable(&self) -> Result<()> {
        if self.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        Ok(())
    }

    /// Open an existing database; `None` is the main database
    pub fn open_db(&self, name: Option<&str>) -> Result<Database> {
        let txn = self.begin_ro_txn()?;
        txn.open_db(name)
    }

    /// Open a database, creating it in its own write transaction if needed
    pub fn create_db(&self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        let mut txn = self.begin_rw_txn()?;
        let db = txn.create_db(name, flags)?;
        txn.commit()?;
        Ok(db)
    }

    /// Set a custom key comparator for `db`
    pub fn set_compare(&self, db: Database, cmp: Comparator) -> Result<()> {
        self.dbs.set_compare(db.dbi(), cmp)
    }

    /// Set a custom duplicate comparator for a DupSort `db`
    pub fn set_dupsort(&self, db: Database, cmp: Comparator) -> Result<()> {
        self.dbs.set_dup_compare(db.dbi(), cmp)
    }

    /// Flush the data file. A weak head meta is made steady; with `force`
    /// the file is flushed even when nothing is pending.
    pub fn sync(&self, force: bool) -> Result<()> {
        if self.flags().contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        let _guard = self.writer.lock(self.store.file())?;
        let (mut metas, head) = self.read_metas()?;
        let Some(mut meta) = metas[head].take() else {
            return Err(Error::Corrupted);
        };
        if meta.is_steady() && !force {
            return Ok(());
        }
        self.store.sync_data()?;
        if !meta.is_steady() {
            meta.sign = DATASIGN_STEADY;
            let mut page = vec![0u8; self.page_size()];
            meta.encode(head as Pgno, &mut page);
            self.store.write(head as Pgno, &page)?;
            self.store.sync_meta(head as Pgno)?;
            debug!("meta of txn {} in slot {} made steady", meta.txnid, head);
        }
        Ok(())
    }

    /// Turn changeable flags (`NOSYNC`, `NOMETASYNC`) on or off
    pub fn set_flags(&self, flags: EnvFlags, onoff: bool) -> Result<()> {
        if !CHANGEABLE.contains(flags) {
            return Err(Error::InvalidConfig("only sync flags can change after open"));
        }
        if onoff {
            self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
        } else {
            self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
        }
        trace!("environment flags now {:?}", self.flags());
        Ok(())
    }

    pub fn get_flags(&self) -> EnvFlags {
        self.flags()
    }

    pub fn get_path(&self) -> &Path {
        &self.path
    }

    pub fn get_max_readers(&self) -> u32 {
        self.readers.capacity()
    }

    pub fn get_max_dbs(&self) -> u32 {
        self.max_dbs
    }

    /// Largest key accepted by a plain database
    pub fn get_max_key_size(&self) -> u32 {
        max_key_size(self.page_size(), false) as u32
    }

    /// Statistics of the main database at the latest commit
    pub fn stat(&self) -> Result<Stat> {
        let meta = self.head()?;
        Ok(meta.main_tree().stat(self.page_size()))
    }

    pub fn info(&self) -> Result<EnvInfo> {
        let (mut metas, head) = self.read_metas()?;
        let Some(meta) = metas[head].take() else {
            return Err(Error::Corrupted);
        };
        Ok(EnvInfo {
            map_size: self.store.map_len(),
            file_size: self.store.file_len()? as usize,
            last_pgno: meta.geometry.first_unallocated.saturating_sub(1),
            last_txnid: meta.txnid,
            max_readers: self.readers.capacity(),
            num_readers: self.readers.active(),
            head_slot: head,
        })
    }

    /// Snapshot of the reader slots currently holding a transaction
    pub fn reader_list(&self) -> Vec<ReaderInfo> {
        self.readers.list()
    }

    pub(crate) fn flags(&self) -> EnvFlags {
        EnvFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn page_size(&self) -> usize {
        self.store.page_size()
    }

    pub(crate) fn store(&self) -> &Store {
        &self.store
    }

    pub(crate) fn readers(&self) -> &ReaderTable {
        &self.readers
    }

    pub(crate) fn dbs(&self) -> &DbRegistry {
        &self.dbs
    }

    pub(crate) fn upper_pages(&self) -> Pgno {
        self.upper_pages
    }

    pub(crate) fn growth_pages(&self) -> Pgno {
        self.growth_pages
    }

    /// The three meta slots as currently mapped and the index of the head.
    ///
    /// A commit may be rewriting one slot while this runs. The slot the
    /// writer targets is never the head, and a half-written slot has
    /// `txnid_a != txnid_b` and decodes as torn. Passes repeat until two in
    /// a row see the same txnids, so a slot that changed mid-decode is
    /// never used.
    pub(crate) fn read_metas(&self) -> Result<([Option<Meta>; NUM_METAS], usize)> {
        let mut metas = self.decode_metas()?;
        loop {
            let again = self.decode_metas()?;
            let same = metas
                .iter()
                .zip(again.iter())
                .all(|(a, b)| a.as_ref().map(|m| m.txnid) == b.as_ref().map(|m| m.txnid));
            metas = again;
            if same {
                break;
            }
        }
        let head = meta::head_slot(&metas).ok_or(Error::Corrupted)?;
        Ok((metas, head))
    }

    fn decode_metas(&self) -> Result<[Option<Meta>; NUM_METAS]> {
        let mut metas: [Option<Meta>; NUM_METAS] = Default::default();
        for (i, slot) in metas.iter_mut().enumerate() {
            *slot = Meta::decode(self.store.page(i as Pgno)?)
                .ok()
                .filter(trusted);
        }
        Ok(metas)
    }

    /// The latest committed meta.
    pub(crate) fn head(&self) -> Result<Meta> {
        let (mut metas, head) = self.read_metas()?;
        metas[head].take().ok_or(Error::Corrupted)
    }

    /// A validated tree page of a snapshot whose allocated area ends at
    /// `limit`.
    pub(crate) fn map_page(&self, pgno: Pgno, limit: Pgno) -> Result<PageRef<'_>> {
        if (pgno as usize) < NUM_METAS || pgno >= limit {
            return Err(Error::corrupted(pgno, "page number outside the snapshot"));
        }
        PageRef::validated(self.store.page(pgno)?)
    }

    /// All pages of the large-value chain starting at `pgno`.
    pub(crate) fn map_large(&self, pgno: Pgno, limit: Pgno) -> Result<&[u8]> {
        let head = self.map_page(pgno, limit)?;
        if !head.is_large() {
            return Err(Error::corrupted(pgno, "expected a large page"));
        }
        let npages = head.large_pages();
        if pgno as u64 + npages as u64 > limit as u64 {
            return Err(Error::corrupted(pgno, "large value runs past the snapshot"));
        }
        self.store.pages(pgno, npages as usize)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        debug!("closing environment {:?}", self.path);
    }
}
