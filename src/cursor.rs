use std::cmp::Ordering;

use crate::constants::{WriteFlags, P_INVALID};
use crate::database::Database;
use crate::error::{Error, Result};
use crate::meta::TreeDesc;
use crate::page::PageRef;
use crate::transaction::RwTransaction;
use crate::tree::{
    descend, leaf_search, next_leaf, node_data, on_right_edge, prev_leaf, DbCtx, Frame, PageSource,
    Seek,
};
use crate::types::Pgno;

/// Key/value pair borrowed from a transaction.
pub type Pair<'txn> = (&'txn [u8], &'txn [u8]);

/// Position among the duplicates of the current key.
#[derive(Debug, Clone)]
enum DupState {
    /// Values packed in a sub-page inside the leaf node.
    Inline { idx: usize, count: usize },
    /// Values in a nested tree, walked by a cursor of its own.
    Tree(Box<CursorCore>),
}

/// Position inside one tree; the page source is passed to every call.
#[derive(Debug, Clone)]
pub(crate) struct CursorCore {
    db: DbCtx,
    root: Pgno,
    stack: Vec<Frame>,
    dup: Option<DupState>,
}

impl CursorCore {
    pub(crate) fn new(db: DbCtx, root: Pgno) -> Self {
        CursorCore {
            db,
            root,
            stack: Vec::new(),
            dup: None,
        }
    }

    fn reset(&mut self) {
        self.stack.clear();
        self.dup = None;
    }

    pub(crate) fn set_root(&mut self, root: Pgno) {
        self.root = root;
        self.reset();
    }

    /// Item under the cursor; `None` when unpositioned or past the end.
    pub(crate) fn current<'s, S: PageSource + ?Sized>(&self, src: &'s S) -> Result<Option<Pair<'s>>> {
        let Some(frame) = self.stack.last() else {
            return Ok(None);
        };
        let page = src.page(frame.pgno)?;
        if frame.idx >= page.num_keys() {
            return Ok(None);
        }
        let node = page.leaf_node(frame.idx)?;
        let data = match &self.dup {
            None => node_data(src, &node)?,
            Some(DupState::Inline { idx, .. }) => PageRef::validated(node.stored())?.key(*idx)?,
            Some(DupState::Tree(sub)) => match sub.current(src)? {
                Some((value, _)) => value,
                None => return Ok(None),
            },
        };
        Ok(Some((node.key(), data)))
    }

    /// Sets up the duplicate position for the node under the cursor.
    fn enter_dups<S: PageSource + ?Sized>(&mut self, src: &S, last: bool) -> Result<()> {
        self.dup = None;
        let Some(frame) = self.stack.last() else {
            return Ok(());
        };
        let page = src.page(frame.pgno)?;
        if frame.idx >= page.num_keys() {
            return Ok(());
        }
        let node = page.leaf_node(frame.idx)?;
        if !node.is_dup() {
            return Ok(());
        }
        if node.is_tree() {
            let sub = TreeDesc::decode(node.stored())?;
            let mut core = CursorCore::new(self.db.dup_ctx(), sub.root);
            if last {
                core.last(src)?;
            } else {
                core.first(src)?;
            }
            self.dup = Some(DupState::Tree(Box::new(core)));
        } else {
            let count = PageRef::validated(node.stored())?.num_keys();
            let idx = if last { count.saturating_sub(1) } else { 0 };
            self.dup = Some(DupState::Inline { idx, count });
        }
        Ok(())
    }

    /// Whether the stack already runs down the left (or right) edge of the
    /// tree, so only the leaf index has to move.
    fn on_edge<S: PageSource + ?Sized>(&self, src: &S, right: bool) -> Result<bool> {
        match self.stack.first() {
            Some(top) if top.pgno == self.root => {}
            _ => return Ok(false),
        }
        let branches = &self.stack[..self.stack.len() - 1];
        if right {
            on_right_edge(src, branches)
        } else {
            Ok(branches.iter().all(|frame| frame.idx == 0))
        }
    }

    /// Positions on the lower bound of `key`; true on an exact match.
    fn seek<S: PageSource + ?Sized>(&mut self, src: &S, key: &[u8]) -> Result<bool> {
        self.dup = None;
        if self.root == P_INVALID {
            self.stack.clear();
            return Ok(false);
        }
        let (path, exact) = descend(src, self.root, Seek::Key(key), self.db.cmp)?;
        self.stack = path;
        Ok(exact)
    }

    pub(crate) fn first<'s, S: PageSource + ?Sized>(&mut self, src: &'s S) -> Result<Option<Pair<'s>>> {
        if self.root == P_INVALID {
            self.reset();
            return Ok(None);
        }
        if self.on_edge(src, false)? {
            let last = self.stack.len() - 1;
            self.stack[last].idx = 0;
        } else {
            self.stack = descend(src, self.root, Seek::First, self.db.cmp)?.0;
        }
        self.enter_dups(src, false)?;
        self.current(src)
    }

    pub(crate) fn last<'s, S: PageSource + ?Sized>(&mut self, src: &'s S) -> Result<Option<Pair<'s>>> {
        if self.root == P_INVALID {
            self.reset();
            return Ok(None);
        }
        if self.on_edge(src, true)? {
            let last = self.stack.len() - 1;
            let n = src.page(self.stack[last].pgno)?.num_keys();
            self.stack[last].idx = n.saturating_sub(1);
        } else {
            self.stack = descend(src, self.root, Seek::Last, self.db.cmp)?.0;
        }
        self.enter_dups(src, true)?;
        self.current(src)
    }

    /// Moves within the duplicates of the current key.
    fn step_dup<S: PageSource + ?Sized>(&mut self, src: &S, forward: bool) -> Result<bool> {
        match &mut self.dup {
            None => Ok(false),
            Some(DupState::Inline { idx, count }) => {
                if forward && *idx + 1 < *count {
                    *idx += 1;
                    Ok(true)
                } else if !forward && *idx > 0 {
                    *idx -= 1;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Some(DupState::Tree(sub)) => {
                let moved = if forward { sub.next(src)? } else { sub.prev(src)? };
                Ok(moved.is_some())
            }
        }
    }

    pub(crate) fn next<'s, S: PageSource + ?Sized>(&mut self, src: &'s S) -> Result<Option<Pair<'s>>> {
        if self.stack.is_empty() {
            return self.first(src);
        }
        if self.step_dup(src, true)? {
            return self.current(src);
        }
        self.next_nodup(src)
    }

    pub(crate) fn prev<'s, S: PageSource + ?Sized>(&mut self, src: &'s S) -> Result<Option<Pair<'s>>> {
        if self.stack.is_empty() {
            return self.last(src);
        }
        if self.step_dup(src, false)? {
            return self.current(src);
        }
        self.prev_nodup(src)
    }

    /// First duplicate of the next key. Stays put at the end.
    pub(crate) fn next_nodup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        if self.stack.is_empty() {
            return self.first(src);
        }
        let last = self.stack.len() - 1;
        let n = src.page(self.stack[last].pgno)?.num_keys();
        if self.stack[last].idx + 1 < n {
            self.stack[last].idx += 1;
        } else if !next_leaf(src, &mut self.stack)? {
            return Ok(None);
        }
        self.enter_dups(src, false)?;
        self.current(src)
    }

    /// Last duplicate of the previous key. Stays put at the start.
    pub(crate) fn prev_nodup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        if self.stack.is_empty() {
            return self.last(src);
        }
        let last = self.stack.len() - 1;
        if self.stack[last].idx > 0 {
            self.stack[last].idx -= 1;
        } else if !prev_leaf(src, &mut self.stack)? {
            return Ok(None);
        }
        self.enter_dups(src, true)?;
        self.current(src)
    }

    /// Exact match of `key`. A miss leaves the cursor unpositioned.
    pub(crate) fn set<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: &[u8],
    ) -> Result<Option<Pair<'s>>> {
        if !self.seek(src, key)? {
            self.reset();
            return Ok(None);
        }
        self.enter_dups(src, false)?;
        self.current(src)
    }

    /// First key not less than `key`. Past the last key the cursor stays
    /// behind it, so `prev` yields the last item.
    pub(crate) fn set_range<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: &[u8],
    ) -> Result<Option<Pair<'s>>> {
        self.seek(src, key)?;
        let Some(&frame) = self.stack.last() else {
            return Ok(None);
        };
        let n = src.page(frame.pgno)?.num_keys();
        if frame.idx >= n && !next_leaf(src, &mut self.stack)? {
            return Ok(None);
        }
        self.enter_dups(src, false)?;
        self.current(src)
    }

    pub(crate) fn get_both<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<Pair<'s>>> {
        self.seek_dup(src, key, data, true)
    }

    /// `key` with its first duplicate not less than `data`.
    pub(crate) fn get_both_range<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: &[u8],
        data: &[u8],
    ) -> Result<Option<Pair<'s>>> {
        self.seek_dup(src, key, data, false)
    }

    fn seek_dup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
        key: &[u8],
        data: &[u8],
        exact: bool,
    ) -> Result<Option<Pair<'s>>> {
        if !self.seek(src, key)? {
            self.reset();
            return Ok(None);
        }
        let Some(&frame) = self.stack.last() else {
            return Ok(None);
        };
        let page = src.page(frame.pgno)?;
        let node = page.leaf_node(frame.idx)?;
        if !node.is_dup() {
            let value = node_data(src, &node)?;
            let ord = (self.db.dcmp)(value, data);
            let hit = if exact {
                ord == Ordering::Equal
            } else {
                ord != Ordering::Less
            };
            if !hit {
                self.reset();
                return Ok(None);
            }
            return Ok(Some((node.key(), value)));
        }
        if node.is_tree() {
            let sub = TreeDesc::decode(node.stored())?;
            let mut core = CursorCore::new(self.db.dup_ctx(), sub.root);
            let found = if exact {
                core.set(src, data)?
            } else {
                core.set_range(src, data)?
            };
            if found.is_none() {
                self.reset();
                return Ok(None);
            }
            self.dup = Some(DupState::Tree(Box::new(core)));
        } else {
            let subpage = PageRef::validated(node.stored())?;
            let (idx, eq) = leaf_search(&subpage, data, self.db.dcmp);
            let count = subpage.num_keys();
            if idx >= count || (exact && !eq) {
                self.reset();
                return Ok(None);
            }
            self.dup = Some(DupState::Inline { idx, count });
        }
        self.current(src)
    }

    pub(crate) fn first_dup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        self.enter_dups(src, false)?;
        self.current(src)
    }

    pub(crate) fn last_dup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        self.enter_dups(src, true)?;
        self.current(src)
    }

    pub(crate) fn next_dup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        if self.step_dup(src, true)? {
            self.current(src)
        } else {
            Ok(None)
        }
    }

    pub(crate) fn prev_dup<'s, S: PageSource + ?Sized>(
        &mut self,
        src: &'s S,
    ) -> Result<Option<Pair<'s>>> {
        if self.step_dup(src, false)? {
            self.current(src)
        } else {
            Ok(None)
        }
    }

    /// Number of values under the current key.
    pub(crate) fn count<S: PageSource + ?Sized>(&self, src: &S) -> Result<usize> {
        let Some(frame) = self.stack.last() else {
            return Err(Error::NotFound);
        };
        let page = src.page(frame.pgno)?;
        if frame.idx >= page.num_keys() {
            return Err(Error::NotFound);
        }
        let node = page.leaf_node(frame.idx)?;
        if !node.is_dup() {
            return Ok(1);
        }
        if node.is_tree() {
            return Ok(TreeDesc::decode(node.stored())?.items as usize);
        }
        Ok(PageRef::validated(node.stored())?.num_keys())
    }
}

/// Read cursor over one database of a transaction.
///
/// Positioning calls return the item they land on, or `None` when there is
/// none. Moving past either end does not wrap around.
pub struct RoCursor<'txn> {
    src: &'txn dyn PageSource,
    core: CursorCore,
}

impl<'txn> RoCursor<'txn> {
    pub(crate) fn new(src: &'txn dyn PageSource, db: DbCtx, root: Pgno) -> Self {
        RoCursor {
            src,
            core: CursorCore::new(db, root),
        }
    }

    pub fn first(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.first(self.src)
    }

    pub fn last(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.last(self.src)
    }

    pub fn next(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.next(self.src)
    }

    pub fn prev(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.prev(self.src)
    }

    pub fn next_nodup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.next_nodup(self.src)
    }

    pub fn prev_nodup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.prev_nodup(self.src)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<Pair<'txn>>> {
        self.core.set(self.src, key)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Pair<'txn>>> {
        self.core.set_range(self.src, key)
    }

    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'txn>>> {
        self.core.get_both(self.src, key, data)
    }

    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'txn>>> {
        self.core.get_both_range(self.src, key, data)
    }

    pub fn first_dup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.first_dup(self.src)
    }

    pub fn last_dup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.last_dup(self.src)
    }

    pub fn next_dup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.next_dup(self.src)
    }

    pub fn prev_dup(&mut self) -> Result<Option<Pair<'txn>>> {
        self.core.prev_dup(self.src)
    }

    pub fn get_current(&self) -> Result<Option<Pair<'txn>>> {
        self.core.current(self.src)
    }

    pub fn count(&self) -> Result<usize> {
        self.core.count(self.src)
    }

    /// Every item of the database, duplicates included.
    pub fn iter(&mut self) -> Iter<'_, 'txn> {
        Iter::new(self, IterStart::First)
    }

    /// Items from the first key not less than `key`.
    pub fn iter_from(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        Iter::new(self, IterStart::From(key.to_vec()))
    }

    /// The duplicates of `key`.
    pub fn iter_dup_of(&mut self, key: &[u8]) -> Iter<'_, 'txn> {
        Iter::new(self, IterStart::DupOf(key.to_vec()))
    }
}

enum IterStart {
    First,
    From(Vec<u8>),
    DupOf(Vec<u8>),
}

/// Iterator over a cursor. Stops at the first error after yielding it.
pub struct Iter<'c, 'txn> {
    cursor: &'c mut RoCursor<'txn>,
    start: Option<IterStart>,
    dups_only: bool,
    done: bool,
}

impl<'c, 'txn> Iter<'c, 'txn> {
    fn new(cursor: &'c mut RoCursor<'txn>, start: IterStart) -> Self {
        let dups_only = matches!(start, IterStart::DupOf(_));
        Iter {
            cursor,
            start: Some(start),
            dups_only,
            done: false,
        }
    }
}

impl<'txn> Iterator for Iter<'_, 'txn> {
    type Item = Result<Pair<'txn>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let step = match self.start.take() {
            Some(IterStart::First) => self.cursor.first(),
            Some(IterStart::From(key)) => self.cursor.set_range(&key),
            Some(IterStart::DupOf(key)) => self.cursor.set(&key),
            None if self.dups_only => self.cursor.next_dup(),
            None => self.cursor.next(),
        };
        match step {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Cursor that can also write through its transaction.
///
/// After `del` the cursor rests on the item that followed the deleted one,
/// and the next call to `next` returns that item.
pub struct RwCursor<'txn, 'env> {
    txn: &'txn mut RwTransaction<'env>,
    dbi: u32,
    core: CursorCore,
    after_del: bool,
}

impl<'txn, 'env> RwCursor<'txn, 'env> {
    pub(crate) fn new(txn: &'txn mut RwTransaction<'env>, dbi: u32, db: DbCtx, root: Pgno) -> Self {
        RwCursor {
            txn,
            dbi,
            core: CursorCore::new(db, root),
            after_del: false,
        }
    }

    pub fn first(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.first(&*self.txn)
    }

    pub fn last(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.last(&*self.txn)
    }

    pub fn next(&mut self) -> Result<Option<Pair<'_>>> {
        if std::mem::take(&mut self.after_del) {
            return self.core.current(&*self.txn);
        }
        self.core.next(&*self.txn)
    }

    pub fn prev(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.prev(&*self.txn)
    }

    pub fn next_nodup(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.next_nodup(&*self.txn)
    }

    pub fn prev_nodup(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.prev_nodup(&*self.txn)
    }

    pub fn set(&mut self, key: &[u8]) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.set(&*self.txn, key)
    }

    pub fn set_range(&mut self, key: &[u8]) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.set_range(&*self.txn, key)
    }

    pub fn get_both(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.get_both(&*self.txn, key, data)
    }

    pub fn get_both_range(&mut self, key: &[u8], data: &[u8]) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.get_both_range(&*self.txn, key, data)
    }

    pub fn next_dup(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.next_dup(&*self.txn)
    }

    pub fn prev_dup(&mut self) -> Result<Option<Pair<'_>>> {
        self.after_del = false;
        self.core.prev_dup(&*self.txn)
    }

    pub fn get_current(&self) -> Result<Option<Pair<'_>>> {
        self.core.current(&*self.txn)
    }

    pub fn count(&self) -> Result<usize> {
        self.core.count(&*self.txn)
    }

    fn refresh(&mut self) -> Result<()> {
        let root = self.txn.tree_desc(self.dbi)?.root;
        self.core.set_root(root);
        Ok(())
    }

    /// Stores a pair and leaves the cursor on it.
    ///
    /// With `CURRENT` the item under the cursor is replaced; its key must
    /// equal `key`.
    pub fn put(&mut self, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        self.after_del = false;
        let db = Database::new(self.dbi);
        if flags.contains(WriteFlags::CURRENT) {
            let (cur_key, cur_data) = match self.core.current(&*self.txn)? {
                Some((k, d)) => (k.to_vec(), d.to_vec()),
                None => return Err(Error::NotFound),
            };
            if (self.core.db.cmp)(&cur_key, key) != Ordering::Equal {
                return Err(Error::NotFound);
            }
            if self.core.db.is_dupsort() {
                self.txn.del(db, key, Some(&cur_data))?;
                self.txn.put(db, key, data, flags - WriteFlags::CURRENT)?;
            } else {
                self.txn.put(db, key, data, flags)?;
            }
        } else {
            self.txn.put(db, key, data, flags)?;
        }
        self.refresh()?;
        if self.core.db.is_dupsort() {
            self.core.get_both(&*self.txn, key, data)?;
        } else {
            self.core.set(&*self.txn, key)?;
        }
        Ok(())
    }

    /// Deletes the item under the cursor; with `ALLDUPS` every duplicate of
    /// its key.
    pub fn del(&mut self, flags: WriteFlags) -> Result<()> {
        let (key, data) = match self.core.current(&*self.txn)? {
            Some((k, d)) => (k.to_vec(), d.to_vec()),
            None => return Err(Error::NotFound),
        };
        let db = Database::new(self.dbi);
        let dupsort = self.core.db.is_dupsort();
        if dupsort && !flags.contains(WriteFlags::ALLDUPS) {
            self.txn.del(db, &key, Some(&data))?;
        } else {
            self.txn.del(db, &key, None)?;
        }
        self.refresh()?;
        self.after_del = true;

        if dupsort && self.core.get_both_range(&*self.txn, &key, &data)?.is_some() {
            return Ok(());
        }
        if let Some((k, _)) = self.core.set_range(&*self.txn, &key)? {
            if (self.core.db.cmp)(k, &key) == Ordering::Equal {
                self.core.next_nodup(&*self.txn)?;
            }
        }
        Ok(())
    }
}
