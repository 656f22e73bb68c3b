use std::cell::RefCell;
use std::mem;

use log::{debug, trace, warn};

use crate::constants::{
    DbFlags, EnvFlags, WriteFlags, CORE_DBS, DATASIGN_STEADY, DATASIGN_WEAK, FREE_DBI, MAIN_DBI,
    PERSISTENT_DB_FLAGS,
};
use crate::cursor::{RoCursor, RwCursor};
use crate::database::Database;
use crate::dirty::DirtyPages;
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::gc::{self, GcState};
use crate::lock::WriterGuard;
use crate::meta::{self, Meta, TreeDesc};
use crate::page::{max_key_size, PageMut, PageRef};
use crate::tree::{self, DbCtx, PageSource, PageWriter};
use crate::types::{Pgno, Stat, Txnid};

use self::private::Sealed as _;

mod private {
    use super::*;

    pub trait Sealed {
        fn env(&self) -> &Environment;

        fn source(&self) -> &dyn PageSource;

        fn check(&self) -> Result<()>;

        /// Current descriptor of the tree behind `dbi`.
        fn lookup_tree(&self, dbi: u32) -> Result<TreeDesc>;
    }
}

/// Operations shared by read-only and read-write transactions.
pub trait Transaction: private::Sealed {
    /// Snapshot id for a reader, the id being written for a writer.
    fn id(&self) -> Txnid;

    /// Value stored under `key`; the first duplicate on a DupSort database.
    fn get(&self, db: Database, key: &[u8]) -> Result<Option<&[u8]>> {
        self.check()?;
        let tree = self.lookup_tree(db.dbi())?;
        let ctx = self.env().dbs().ctx(db.dbi())?;
        tree::get(self.source(), &tree, &ctx, key)
    }

    /// Opens the main database (`None`) or an existing named database.
    fn open_db(&self, name: Option<&str>) -> Result<Database> {
        self.check()?;
        let Some(name) = name else {
            return Ok(Database::new(MAIN_DBI));
        };
        let dbs = self.env().dbs();
        if let Some(dbi) = dbs.lookup(name) {
            if self.lookup_tree(dbi).is_ok() {
                return Ok(Database::new(dbi));
            }
        }
        let main = self.lookup_tree(MAIN_DBI)?;
        let desc = tree::find_named(self.source(), &main, &dbs.ctx(MAIN_DBI)?, name.as_bytes())?
            .ok_or(Error::NotFound)?;
        let dbi = dbs.register(name, DbFlags::from_bits_truncate(desc.flags as u32))?;
        Ok(Database::new(dbi))
    }

    fn open_ro_cursor(&self, db: Database) -> Result<RoCursor<'_>> {
        self.check()?;
        let tree = self.lookup_tree(db.dbi())?;
        let ctx = self.env().dbs().ctx(db.dbi())?;
        Ok(RoCursor::new(self.source(), ctx, tree.root))
    }

    fn stat(&self, db: Database) -> Result<Stat> {
        self.check()?;
        let tree = self.lookup_tree(db.dbi())?;
        Ok(tree.stat(self.env().page_size()))
    }

    /// Persistent flags of the database.
    fn db_flags(&self, db: Database) -> Result<DbFlags> {
        self.check()?;
        let tree = self.lookup_tree(db.dbi())?;
        Ok(DbFlags::from_bits_truncate(tree.flags as u32))
    }

    /// Records of the GC tree as `(freeing txnid, pages)`, oldest first.
    fn gc_entries(&self) -> Result<Vec<(Txnid, Vec<Pgno>)>> {
        self.check()?;
        let gc_tree = self.lookup_tree(FREE_DBI)?;
        gc::list_records(self.source(), &gc_tree)
    }
}

fn named_tree<S: PageSource + ?Sized>(
    env: &Environment,
    src: &S,
    main: &TreeDesc,
    dbi: u32,
) -> Result<TreeDesc> {
    let dbs = env.dbs();
    let name = dbs.name(dbi)?;
    tree::find_named(src, main, &dbs.ctx(MAIN_DBI)?, name.as_bytes())?.ok_or(Error::BadDbi)
}

/// A consistent snapshot for reading.
///
/// Holds a reader slot for its whole life, which keeps the pages of its
/// snapshot from being reused.
pub struct RoTransaction<'env> {
    env: &'env Environment,
    slot: usize,
    meta: Meta,
    trees: RefCell<Vec<Option<TreeDesc>>>,
}

impl<'env> RoTransaction<'env> {
    pub(crate) fn new(env: &'env Environment) -> Result<Self> {
        let slot = env.readers().acquire()?;
        match Self::pin(env, slot) {
            Ok(meta) => {
                trace!("read txn {} uses reader slot {}", meta.txnid, slot);
                Ok(RoTransaction {
                    env,
                    slot,
                    meta,
                    trees: RefCell::new(Vec::new()),
                })
            }
            Err(e) => {
                env.readers().release(slot);
                Err(e)
            }
        }
    }

    /// Publishes the head snapshot, retrying if a commit lands in between.
    fn pin(env: &Environment, slot: usize) -> Result<Meta> {
        loop {
            let meta = env.head()?;
            env.readers()
                .publish(slot, meta.txnid, meta.geometry.first_unallocated);
            if env.head()?.txnid == meta.txnid {
                return Ok(meta);
            }
        }
    }

    /// Ends the transaction. Read transactions have nothing to commit.
    pub fn commit(self) -> Result<()> {
        Ok(())
    }

    pub fn abort(self) {}
}

impl Drop for RoTransaction<'_> {
    fn drop(&mut self) {
        self.env.readers().release(self.slot);
    }
}

impl PageSource for RoTransaction<'_> {
    fn page_size(&self) -> usize {
        self.env.page_size()
    }

    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        self.env
            .map_page(pgno, self.meta.geometry.first_unallocated)
    }

    fn large(&self, pgno: Pgno) -> Result<&[u8]> {
        self.env
            .map_large(pgno, self.meta.geometry.first_unallocated)
    }
}

impl private::Sealed for RoTransaction<'_> {
    fn env(&self) -> &Environment {
        self.env
    }

    fn source(&self) -> &dyn PageSource {
        self
    }

    fn check(&self) -> Result<()> {
        Ok(())
    }

    fn lookup_tree(&self, dbi: u32) -> Result<TreeDesc> {
        match dbi {
            FREE_DBI => return Ok(*self.meta.gc_tree()),
            MAIN_DBI => return Ok(*self.meta.main_tree()),
            _ => {}
        }
        let i = dbi as usize;
        let cached = self.trees.borrow().get(i).copied().flatten();
        if let Some(desc) = cached {
            return Ok(desc);
        }
        let desc = named_tree(self.env, self, self.meta.main_tree(), dbi)?;
        let mut trees = self.trees.borrow_mut();
        if trees.len() <= i {
            trees.resize(i + 1, None);
        }
        trees[i] = Some(desc);
        Ok(desc)
    }
}

impl Transaction for RoTransaction<'_> {
    fn id(&self) -> Txnid {
        self.meta.txnid
    }
}

#[derive(Debug, Clone, Copy)]
struct TreeSlot {
    desc: TreeDesc,
    /// Changed since the transaction began; written back at commit.
    dirty: bool,
}

/// Everything a write transaction has changed so far. A nested transaction
/// parks its parent's state in `parent`.
#[derive(Default)]
pub(crate) struct WriteState {
    dirty: DirtyPages,
    gc: GcState,
    trees: Vec<Option<TreeSlot>>,
    parent: Option<Box<WriteState>>,
}

impl WriteState {
    fn find_dirty(&self, pgno: Pgno) -> Option<&[u8]> {
        match self.dirty.get(pgno) {
            Some(page) => Some(page),
            None => self.parent.as_ref()?.find_dirty(pgno),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TxnStatus {
    Active,
    /// A fatal error happened; only abort is allowed.
    Errored,
    Done,
}

/// The single write transaction of an environment, or a nested transaction
/// inside it.
///
/// Modified pages are kept in memory until commit. Dropping the transaction
/// without committing aborts it.
pub struct RwTransaction<'env> {
    env: &'env Environment,
    txnid: Txnid,
    head: Meta,
    /// GC records from this txnid on may hold pages of the newest steady
    /// snapshot and stay untouched.
    durable_bound: Txnid,
    state: WriteState,
    /// Where a nested transaction hands its state back to the parent.
    home: Option<&'env mut WriteState>,
    status: TxnStatus,
    _guard: Option<WriterGuard<'env>>,
}

impl<'env> RwTransaction<'env> {
    pub(crate) fn new(env: &'env Environment, guard: WriterGuard<'env>) -> Result<Self> {
        let (mut metas, slot) = env.read_metas()?;
        let steady = meta::steady_slot(&metas).and_then(|i| metas[i].as_ref().map(|m| m.txnid));
        let head = metas[slot].take().ok_or(Error::Corrupted)?;
        let txnid = head.txnid + 1;
        let durable_bound = steady.map_or(txnid, |t| t + 1);
        let state = WriteState {
            dirty: DirtyPages::new(),
            gc: GcState::new(&head.geometry),
            trees: vec![
                Some(TreeSlot {
                    desc: *head.gc_tree(),
                    dirty: false,
                }),
                Some(TreeSlot {
                    desc: *head.main_tree(),
                    dirty: false,
                }),
            ],
            parent: None,
        };
        debug!("write txn {} begins on snapshot {}", txnid, head.txnid);
        if durable_bound < txnid {
            debug!("write txn {} keeps pages of steady txn {}", txnid, durable_bound - 1);
        }
        Ok(RwTransaction {
            env,
            txnid,
            head,
            durable_bound,
            state,
            home: None,
            status: TxnStatus::Active,
            _guard: Some(guard),
        })
    }

    /// Starts a nested transaction. Its changes reach this transaction only
    /// if it commits; the parent cannot be used until the child ends.
    pub fn begin_nested(&mut self) -> Result<RwTransaction<'_>> {
        self.check()?;
        let parent = mem::take(&mut self.state);
        let state = WriteState {
            dirty: DirtyPages::new(),
            gc: parent.gc.clone(),
            trees: parent.trees.clone(),
            parent: Some(Box::new(parent)),
        };
        trace!("nested txn inside write txn {}", self.txnid);
        Ok(RwTransaction {
            env: self.env,
            txnid: self.txnid,
            head: self.head.clone(),
            durable_bound: self.durable_bound,
            state,
            home: Some(&mut self.state),
            status: TxnStatus::Active,
            _guard: None,
        })
    }

    pub(crate) fn gc_mut(&mut self) -> &mut GcState {
        &mut self.state.gc
    }

    /// Descriptor of `dbi`, loaded into the transaction on first use.
    pub(crate) fn tree_desc(&mut self, dbi: u32) -> Result<TreeDesc> {
        if let Some(Some(slot)) = self.state.trees.get(dbi as usize) {
            return Ok(slot.desc);
        }
        let desc = private::Sealed::lookup_tree(self, dbi)?;
        self.set_slot(dbi, Some(TreeSlot { desc, dirty: false }));
        Ok(desc)
    }

    /// Records a possibly changed descriptor of `dbi`.
    pub(crate) fn store_tree(&mut self, dbi: u32, desc: TreeDesc) {
        let i = dbi as usize;
        if self.state.trees.len() <= i {
            self.state.trees.resize(i + 1, None);
        }
        let slot = &mut self.state.trees[i];
        match slot {
            Some(s) if s.desc == desc => {}
            _ => *slot = Some(TreeSlot { desc, dirty: true }),
        }
    }

    fn set_slot(&mut self, dbi: u32, slot: Option<TreeSlot>) {
        let i = dbi as usize;
        if self.state.trees.len() <= i {
            self.state.trees.resize(i + 1, None);
        }
        self.state.trees[i] = slot;
    }

    fn prepare(&mut self, db: Database) -> Result<(DbCtx, TreeDesc)> {
        self.check()?;
        let ctx = self.env.dbs().ctx(db.dbi())?;
        let desc = self.tree_desc(db.dbi())?;
        Ok((ctx, desc))
    }

    /// Keeps the descriptor after an operation, or poisons the transaction
    /// if the operation failed half-way.
    fn finish<T>(&mut self, dbi: u32, desc: TreeDesc, result: Result<T>) -> Result<T> {
        match &result {
            Err(e) if e.is_fatal() => {
                warn!("write txn {} failed: {}", self.txnid, e);
                self.status = TxnStatus::Errored;
            }
            _ => self.store_tree(dbi, desc),
        }
        result
    }

    pub fn put(&mut self, db: Database, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        let (ctx, mut desc) = self.prepare(db)?;
        let result = tree::put(self, &mut desc, &ctx, key, data, flags);
        self.finish(db.dbi(), desc, result)
    }

    /// Deletes `key`, or only its duplicate `data` on a DupSort database.
    pub fn del(&mut self, db: Database, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        let (ctx, mut desc) = self.prepare(db)?;
        let result = tree::del(self, &mut desc, &ctx, key, data);
        self.finish(db.dbi(), desc, result)
    }

    /// Stores a zeroed value of `len` bytes under `key` and returns it for
    /// the caller to fill. Not available on DupSort databases.
    pub fn reserve(
        &mut self,
        db: Database,
        key: &[u8],
        len: usize,
        flags: WriteFlags,
    ) -> Result<&mut [u8]> {
        let (ctx, mut desc) = self.prepare(db)?;
        if ctx.is_dupsort() {
            return Err(Error::Incompatible);
        }
        let result = tree::put(self, &mut desc, &ctx, key, &vec![0u8; len], flags);
        self.finish(db.dbi(), desc, result)?;
        tree::value_mut(self, &desc, &ctx, key)
    }

    /// Opens `name` (the main database for `None`), creating it if missing.
    ///
    /// Persistent flags given here must match those of an existing
    /// database; an empty main database adopts them.
    pub fn create_db(&mut self, name: Option<&str>, flags: DbFlags) -> Result<Database> {
        self.check()?;
        let wanted = flags.bits() & PERSISTENT_DB_FLAGS;
        let env = self.env;
        let dbs = env.dbs();
        let Some(name) = name else {
            let mut main = self.tree_desc(MAIN_DBI)?;
            if wanted != 0 && wanted != main.flags as u32 {
                if main.items != 0 {
                    return Err(Error::Incompatible);
                }
                main.flags = wanted as u16;
                self.store_tree(MAIN_DBI, main);
                dbs.set_flags(MAIN_DBI, DbFlags::from_bits_truncate(wanted))?;
            }
            return Ok(Database::new(MAIN_DBI));
        };

        let max_key = max_key_size(env.page_size(), false);
        if name.len() > max_key {
            return Err(Error::KeyTooLarge {
                size: name.len(),
                max: max_key,
            });
        }
        let existing = match dbs.lookup(name) {
            Some(dbi) => private::Sealed::lookup_tree(self, dbi).ok(),
            None => None,
        };
        let existing = match existing {
            Some(desc) => Some(desc),
            None => {
                let main = self.tree_desc(MAIN_DBI)?;
                tree::find_named(&*self, &main, &dbs.ctx(MAIN_DBI)?, name.as_bytes())?
            }
        };
        if let Some(desc) = existing {
            if wanted != 0 && wanted != desc.flags as u32 {
                return Err(Error::Incompatible);
            }
            let dbi = dbs.register(name, DbFlags::from_bits_truncate(desc.flags as u32))?;
            if !matches!(self.state.trees.get(dbi as usize), Some(Some(_))) {
                self.set_slot(dbi, Some(TreeSlot { desc, dirty: false }));
            }
            return Ok(Database::new(dbi));
        }

        let dbi = dbs.register(name, DbFlags::from_bits_truncate(wanted))?;
        self.set_slot(
            dbi,
            Some(TreeSlot {
                desc: TreeDesc::empty(wanted as u16),
                dirty: true,
            }),
        );
        debug!("created database {:?} as dbi {} in txn {}", name, dbi, self.txnid);
        Ok(Database::new(dbi))
    }

    /// Frees every page of a named database; with `delete` its name goes too
    /// and the handle becomes stale.
    pub fn drop_db(&mut self, db: Database, delete: bool) -> Result<()> {
        self.check()?;
        let dbi = db.dbi();
        if dbi < CORE_DBS {
            return Err(Error::Incompatible);
        }
        let mut desc = self.tree_desc(dbi)?;
        let result = tree::drop_tree(self, desc.root);
        if result.is_ok() {
            desc = TreeDesc::empty(desc.flags);
        }
        self.finish(dbi, desc, result)?;
        if !delete {
            return Ok(());
        }

        let env = self.env;
        let dbs = env.dbs();
        let name = dbs.name(dbi)?;
        let main_ctx = dbs.ctx(MAIN_DBI)?;
        let mut main = self.tree_desc(MAIN_DBI)?;
        let result = match tree::del_named(self, &mut main, &main_ctx, name.as_bytes()) {
            Err(Error::NotFound) => Ok(()),
            other => other,
        };
        self.finish(MAIN_DBI, main, result)?;
        self.set_slot(dbi, None);
        debug!("deleted database {:?} in txn {}", name, self.txnid);
        Ok(())
    }

    pub fn open_rw_cursor(&mut self, db: Database) -> Result<RwCursor<'_, 'env>> {
        let (ctx, desc) = self.prepare(db)?;
        Ok(RwCursor::new(self, db.dbi(), ctx, desc.root))
    }

    /// Pages modified or allocated by this transaction, ascending.
    pub fn dirty_pgnos(&self) -> Vec<Pgno> {
        self.state.dirty.pgnos()
    }

    /// Committed pages this transaction has freed so far, descending.
    pub fn retired_pages(&self) -> Vec<Pgno> {
        self.state.gc.retired.as_slice().to_vec()
    }

    /// Makes the changes durable (top level) or hands them to the parent
    /// (nested). On error the transaction is aborted.
    pub fn commit(mut self) -> Result<()> {
        if self.status != TxnStatus::Active {
            self.rollback();
            return Err(Error::BadTxn);
        }
        let result = if self.home.is_some() {
            self.commit_nested()
        } else {
            self.commit_top()
        };
        match result {
            Ok(()) => {
                self.status = TxnStatus::Done;
                Ok(())
            }
            Err(e) => {
                warn!("commit of write txn {} failed: {}", self.txnid, e);
                self.rollback();
                Err(e)
            }
        }
    }

    pub fn abort(mut self) {
        self.rollback();
    }

    fn rollback(&mut self) {
        self.status = TxnStatus::Done;
        match self.home.take() {
            Some(home) => {
                if let Some(parent) = self.state.parent.take() {
                    *home = *parent;
                }
                trace!("nested txn inside write txn {} aborted", self.txnid);
            }
            None => debug!("write txn {} aborted", self.txnid),
        }
    }

    fn commit_nested(&mut self) -> Result<()> {
        let mut child = mem::take(&mut self.state);
        let mut parent = match child.parent.take() {
            Some(parent) => *parent,
            None => return Err(Error::Problem("nested transaction without a parent")),
        };
        let home = self
            .home
            .take()
            .ok_or(Error::Problem("nested transaction without a parent"))?;

        let page_size = self.env.page_size();
        // Pages the parent allocated were never committed, so freeing them
        // makes them reusable at once.
        let stale: Vec<Pgno> = child
            .gc
            .retired
            .iter()
            .filter(|&pgno| parent.dirty.contains(pgno))
            .collect();
        for pgno in stale {
            if let Some(page) = parent.dirty.remove(pgno) {
                let span = page.len() / page_size;
                for p in pgno..pgno + span as Pgno {
                    child.gc.retired.remove(p);
                }
                child.gc.reclaim(pgno, span);
            }
        }
        let freed: Vec<Pgno> = child
            .gc
            .reclaimed
            .iter()
            .filter(|&pgno| parent.dirty.contains(pgno))
            .collect();
        for pgno in freed {
            parent.dirty.remove(pgno);
        }

        trace!(
            "nested txn inside write txn {} merges {} dirty pages",
            self.txnid,
            child.dirty.len()
        );
        parent.dirty.absorb(child.dirty);
        parent.gc = child.gc;
        parent.trees = child.trees;
        *home = parent;
        Ok(())
    }

    fn commit_top(&mut self) -> Result<()> {
        let env = self.env;
        let changed =
            !self.state.dirty.is_empty() || self.state.trees.iter().flatten().any(|s| s.dirty);
        if !changed {
            debug!("write txn {} committed without changes", self.txnid);
            return Ok(());
        }

        let named: Vec<(u32, TreeDesc)> = self
            .state
            .trees
            .iter()
            .enumerate()
            .skip(CORE_DBS as usize)
            .filter_map(|(i, slot)| match slot {
                Some(s) if s.dirty => Some((i as u32, s.desc)),
                _ => None,
            })
            .collect();
        if !named.is_empty() {
            let main_ctx = env.dbs().ctx(MAIN_DBI)?;
            let mut main = self.tree_desc(MAIN_DBI)?;
            for (dbi, desc) in named {
                let name = env.dbs().name(dbi)?;
                tree::put_named(self, &mut main, &main_ctx, name.as_bytes(), &desc)?;
            }
            self.store_tree(MAIN_DBI, main);
        }

        gc::update_gc(self)?;

        let gc_tree = self.tree_desc(FREE_DBI)?;
        let main = self.tree_desc(MAIN_DBI)?;
        let store = env.store();
        store.ensure_len(self.state.gc.now_pgno)?;
        let dirty = mem::take(&mut self.state.dirty);
        let written = dirty.len();
        for (pgno, page) in dirty.into_sorted() {
            store.write(pgno, &page)?;
        }

        let flags = env.flags();
        let weak = flags.intersects(EnvFlags::NOSYNC | EnvFlags::NOMETASYNC);
        if !flags.contains(EnvFlags::NOSYNC) {
            store.sync_data()?;
        }

        let (metas, head) = env.read_metas()?;
        let slot = meta::target_slot(&metas, head);
        let mut meta = self.head.clone();
        meta.txnid = self.txnid;
        meta.trees = [gc_tree, main];
        meta.geometry.first_unallocated = self.state.gc.next_pgno;
        meta.geometry.now = self.state.gc.now_pgno;
        meta.geometry.upper = env.upper_pages();
        meta.bootid = crate::env::boot_id();
        meta.pages_retired += self.state.gc.retired.len() as u64;
        meta.sign = if weak { DATASIGN_WEAK } else { DATASIGN_STEADY };
        let mut page = vec![0u8; env.page_size()];
        meta.encode(slot as Pgno, &mut page);
        store.write(slot as Pgno, &page)?;
        if !weak {
            store.sync_meta(slot as Pgno)?;
        }
        debug!(
            "write txn {} committed: {} pages written, {} retired, meta slot {}{}",
            self.txnid,
            written,
            self.state.gc.retired.len(),
            slot,
            if weak { " (weak)" } else { "" }
        );
        Ok(())
    }
}

impl Drop for RwTransaction<'_> {
    fn drop(&mut self) {
        if self.status != TxnStatus::Done {
            self.rollback();
        }
    }
}

impl PageSource for RwTransaction<'_> {
    fn page_size(&self) -> usize {
        self.env.page_size()
    }

    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
        match self.state.find_dirty(pgno) {
            Some(page) => PageRef::new(&page[..self.env.page_size()]),
            None => self
                .env
                .map_page(pgno, self.head.geometry.first_unallocated),
        }
    }

    fn large(&self, pgno: Pgno) -> Result<&[u8]> {
        match self.state.find_dirty(pgno) {
            Some(pages) => Ok(pages),
            None => self
                .env
                .map_large(pgno, self.head.geometry.first_unallocated),
        }
    }
}

impl PageWriter for RwTransaction<'_> {
    fn txnid(&self) -> Txnid {
        self.txnid
    }

    fn is_own_dirty(&self, pgno: Pgno) -> bool {
        self.state.dirty.contains(pgno)
    }

    fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
        self.state
            .dirty
            .get_mut(pgno)
            .ok_or(Error::Problem("page is not dirty in this transaction"))
    }

    fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
        if self.state.dirty.contains(pgno) {
            return Ok(pgno);
        }
        let inherited = self
            .state
            .parent
            .as_ref()
            .and_then(|parent| parent.find_dirty(pgno))
            .map(Box::<[u8]>::from);
        if let Some(copy) = inherited {
            self.state.dirty.insert(pgno, copy);
            return Ok(pgno);
        }

        let image = self
            .env
            .map_page(pgno, self.head.geometry.first_unallocated)?
            .bytes()
            .to_vec();
        let new = self.alloc(1)?;
        let txnid = self.txnid;
        let buf = self.page_mut(new)?;
        buf.copy_from_slice(&image);
        let mut page = PageMut::new(buf);
        page.set_pgno(new);
        page.set_txnid(txnid);
        self.retire(pgno, 1)?;
        trace!("page {} copied to {}", pgno, new);
        Ok(new)
    }

    fn alloc(&mut self, npages: usize) -> Result<Pgno> {
        let pgno = loop {
            if let Some(pgno) = self.state.gc.take(npages) {
                break pgno;
            }
            let oldest = self
                .env
                .readers()
                .oldest(self.txnid)
                .min(self.durable_bound);
            let Some(below) = self.state.gc.fetch_bound(oldest) else {
                break self.state.gc.extend(
                    npages,
                    self.env.upper_pages(),
                    self.env.growth_pages(),
                )?;
            };
            let gc_tree = private::Sealed::lookup_tree(self, FREE_DBI)?;
            match gc::fetch_record(&*self, &gc_tree, below)? {
                Some((txnid, pages)) => self.state.gc.accept(txnid, &pages),
                None => self.state.gc.mark_exhausted(),
            }
        };
        let len = npages * self.env.page_size();
        self.state
            .dirty
            .insert(pgno, vec![0u8; len].into_boxed_slice());
        trace!("allocated {} page(s) at {}", npages, pgno);
        Ok(pgno)
    }

    fn retire(&mut self, pgno: Pgno, npages: usize) -> Result<()> {
        if self.state.dirty.remove(pgno).is_some() {
            self.state.gc.reclaim(pgno, npages);
        } else {
            self.state.gc.retired.insert_span(pgno, npages);
        }
        Ok(())
    }
}

impl private::Sealed for RwTransaction<'_> {
    fn env(&self) -> &Environment {
        self.env
    }

    fn source(&self) -> &dyn PageSource {
        self
    }

    fn check(&self) -> Result<()> {
        match self.status {
            TxnStatus::Active => Ok(()),
            _ => Err(Error::BadTxn),
        }
    }

    fn lookup_tree(&self, dbi: u32) -> Result<TreeDesc> {
        if let Some(Some(slot)) = self.state.trees.get(dbi as usize) {
            return Ok(slot.desc);
        }
        if dbi < CORE_DBS {
            return Err(Error::BadDbi);
        }
        let main = match self.state.trees.get(MAIN_DBI as usize) {
            Some(Some(slot)) => slot.desc,
            _ => return Err(Error::Problem("main tree missing from the transaction")),
        };
        named_tree(self.env, self, &main, dbi)
    }
}

impl Transaction for RwTransaction<'_> {
    fn id(&self) -> Txnid {
        self.txnid
    }
}
