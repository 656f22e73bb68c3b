//! B+tree search and mutation over the page codec.
//!
//! Mutations copy pages on write through a [`PageWriter`]: every page on the
//! path from the root to the target leaf is touched first, which gives the
//! transaction its own copy, and the new page numbers are written into the
//! parents top-down. Splits and merges rebuild pages from their raw nodes.
//! After a structural change the caller's path is stale; callers that need a
//! position afterwards search again.

use std::cmp::Ordering;

use log::trace;

use crate::comparator::Comparator;
use crate::constants::{
    DbFlags, NodeFlags, PageFlags, WriteFlags, NODE_HEADER_SIZE as NODESZ,
    PAGE_HEADER_SIZE as PAGEHDRSZ, P_INVALID,
};
use crate::error::{Error, Result};
use crate::meta::TreeDesc;
use crate::page::{
    branch_node_bytes, build_subpage, large_pages_needed, leaf_node_bytes,
    leaf_node_max, max_key_size, max_value_size, needs_large, node_footprint, node_with_key,
    page_space, read_u16, subpage_size, LeafNode, NodeValue, PageMut, PageRef,
};
use crate::types::{Pgno, Txnid};

/// Guard against cycles in corrupted files.
const MAX_DEPTH: usize = 32;

/// Read access to the pages of one snapshot.
pub trait PageSource {
    fn page_size(&self) -> usize;

    /// A branch or leaf page, structurally checked.
    fn page(&self, pgno: Pgno) -> Result<PageRef<'_>>;

    /// A whole large-value chain, header included.
    fn large(&self, pgno: Pgno) -> Result<&[u8]>;
}

/// Page allocation and copy-on-write for a write transaction.
pub(crate) trait PageWriter: PageSource {
    fn txnid(&self) -> Txnid;

    /// Whether the page was allocated or copied by this transaction itself.
    fn is_own_dirty(&self, pgno: Pgno) -> bool;

    /// Buffer of a page this transaction already owns.
    fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]>;

    /// Makes the page writable, copying it if needed. Returns its (possibly
    /// new) page number.
    fn touch(&mut self, pgno: Pgno) -> Result<Pgno>;

    /// Allocates `npages` contiguous pages as a zeroed dirty buffer.
    fn alloc(&mut self, npages: usize) -> Result<Pgno>;

    /// Frees `npages` pages starting at `pgno`.
    fn retire(&mut self, pgno: Pgno, npages: usize) -> Result<()>;
}

/// Ordering and flags of one database.
#[derive(Clone, Copy)]
pub struct DbCtx {
    pub flags: DbFlags,
    pub cmp: Comparator,
    pub dcmp: Comparator,
}

impl std::fmt::Debug for DbCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbCtx").field("flags", &self.flags).finish()
    }
}

impl DbCtx {
    pub fn new(flags: DbFlags, cmp: Comparator, dcmp: Comparator) -> Self {
        DbCtx { flags, cmp, dcmp }
    }

    #[inline]
    pub fn is_dupsort(&self) -> bool {
        self.flags.contains(DbFlags::DUPSORT)
    }

    /// Context of the nested tree that holds one key's duplicates.
    pub fn dup_ctx(&self) -> DbCtx {
        DbCtx {
            flags: DbFlags::empty(),
            cmp: self.dcmp,
            dcmp: self.dcmp,
        }
    }
}

/// One step of a root-to-leaf path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub pgno: Pgno,
    pub idx: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Seek<'k> {
    Key(&'k [u8]),
    First,
    Last,
}

/// Child slot of a branch page that may hold `key`.
pub(crate) fn branch_search(page: &PageRef<'_>, key: &[u8], cmp: Comparator) -> usize {
    let n = page.num_keys();
    let (mut lo, mut hi) = (1, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        // SAFETY: pages reach the tree validated or built by this process,
        // and 1 <= mid < n.
        let k = unsafe { page.key_unchecked(mid) };
        if cmp(k, key) == Ordering::Greater {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo - 1
}

/// First slot of a leaf page whose key is not less than `key`, and whether
/// it matches exactly.
pub(crate) fn leaf_search(page: &PageRef<'_>, key: &[u8], cmp: Comparator) -> (usize, bool) {
    let n = page.num_keys();
    let (mut lo, mut hi) = (0, n);
    while lo < hi {
        let mid = (lo + hi) / 2;
        // SAFETY: as in `branch_search`, with mid < n.
        let k = unsafe { page.key_unchecked(mid) };
        if cmp(k, key) == Ordering::Less {
            lo = mid + 1;
        } else {
            hi = mid;
        }
    }
    // SAFETY: lo < n is checked first.
    let exact = lo < n && cmp(unsafe { page.key_unchecked(lo) }, key) == Ordering::Equal;
    (lo, exact)
}

/// Walks from `root` to a leaf.
pub(crate) fn descend<S: PageSource + ?Sized>(
    src: &S,
    root: Pgno,
    seek: Seek<'_>,
    cmp: Comparator,
) -> Result<(Vec<Frame>, bool)> {
    let mut path = Vec::with_capacity(8);
    let mut pgno = root;
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::corrupted(pgno, "tree deeper than supported"));
        }
        let page = src.page(pgno)?;
        let n = page.num_keys();
        if page.is_branch() {
            let idx = match seek {
                Seek::Key(key) => branch_search(&page, key, cmp),
                Seek::First => 0,
                Seek::Last => n - 1,
            };
            path.push(Frame { pgno, idx });
            pgno = page.branch_node(idx)?.child();
        } else if page.is_leaf() {
            let (idx, exact) = match seek {
                Seek::Key(key) => leaf_search(&page, key, cmp),
                Seek::First => (0, false),
                Seek::Last => (n.saturating_sub(1), false),
            };
            path.push(Frame { pgno, idx });
            return Ok((path, exact));
        } else {
            return Err(Error::corrupted(pgno, "unexpected page type inside a tree"));
        }
    }
}

fn descend_edge<S: PageSource + ?Sized>(
    src: &S,
    path: &mut Vec<Frame>,
    mut pgno: Pgno,
    rightmost: bool,
) -> Result<()> {
    loop {
        if path.len() >= MAX_DEPTH {
            return Err(Error::corrupted(pgno, "tree deeper than supported"));
        }
        let page = src.page(pgno)?;
        let n = page.num_keys();
        let idx = if rightmost { n.saturating_sub(1) } else { 0 };
        path.push(Frame { pgno, idx });
        if page.is_leaf() {
            return Ok(());
        }
        pgno = page.branch_node(idx)?.child();
    }
}

/// Moves `path` to the first slot of the next leaf. False at the right edge.
pub(crate) fn next_leaf<S: PageSource + ?Sized>(src: &S, path: &mut Vec<Frame>) -> Result<bool> {
    let mut level = path.len() - 1;
    while level > 0 {
        level -= 1;
        let page = src.page(path[level].pgno)?;
        if path[level].idx + 1 < page.num_keys() {
            path[level].idx += 1;
            let child = page.branch_node(path[level].idx)?.child();
            path.truncate(level + 1);
            descend_edge(src, path, child, false)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Moves `path` to the last slot of the previous leaf. False at the left edge.
pub(crate) fn prev_leaf<S: PageSource + ?Sized>(src: &S, path: &mut Vec<Frame>) -> Result<bool> {
    let mut level = path.len() - 1;
    while level > 0 {
        level -= 1;
        if path[level].idx > 0 {
            path[level].idx -= 1;
            let child = src
                .page(path[level].pgno)?
                .branch_node(path[level].idx)?
                .child();
            path.truncate(level + 1);
            descend_edge(src, path, child, true)?;
            return Ok(true);
        }
    }
    Ok(false)
}

/// Value bytes of a leaf node, following large-value chains.
pub(crate) fn node_data<'s, S: PageSource + ?Sized>(
    src: &'s S,
    node: &LeafNode<'s>,
) -> Result<&'s [u8]> {
    match node.value() {
        NodeValue::Inline(data) => Ok(data),
        NodeValue::Large { pgno, len } => src
            .large(pgno)?
            .get(PAGEHDRSZ..PAGEHDRSZ + len)
            .ok_or_else(|| Error::corrupted(pgno, "large value longer than its chain")),
    }
}

/// Looks up `key`; on a DupSort database yields its first duplicate.
pub(crate) fn get<'s, S: PageSource + ?Sized>(
    src: &'s S,
    tree: &TreeDesc,
    db: &DbCtx,
    key: &[u8],
) -> Result<Option<&'s [u8]>> {
    if tree.is_empty() {
        return Ok(None);
    }
    let (path, exact) = descend(src, tree.root, Seek::Key(key), db.cmp)?;
    if !exact {
        return Ok(None);
    }
    let leaf = path[path.len() - 1];
    let node = src.page(leaf.pgno)?.leaf_node(leaf.idx)?;
    if !node.is_dup() {
        return node_data(src, &node).map(Some);
    }
    if node.is_tree() {
        let sub = TreeDesc::decode(node.stored())?;
        let (sub_path, _) = descend(src, sub.root, Seek::First, db.dcmp)?;
        let first = sub_path[sub_path.len() - 1];
        return Ok(Some(src.page(first.pgno)?.key(first.idx)?));
    }
    Ok(Some(PageRef::validated(node.stored())?.key(0)?))
}

fn raw_key(raw: &[u8]) -> &[u8] {
    let ksize = read_u16(raw, 6) as usize;
    &raw[NODESZ..NODESZ + ksize]
}

fn raw_nodes(page: &PageRef<'_>) -> Result<Vec<Vec<u8>>> {
    (0..page.num_keys())
        .map(|i| page.raw_node(i).map(|raw| raw.to_vec()))
        .collect()
}

/// Whether every branch frame points at its last child.
pub(crate) fn on_right_edge<S: PageSource + ?Sized>(src: &S, frames: &[Frame]) -> Result<bool> {
    for frame in frames {
        if frame.idx + 1 != src.page(frame.pgno)?.num_keys() {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Makes every page on `path` writable, relinking moved pages.
fn touch_path<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &mut [Frame],
) -> Result<()> {
    for level in 0..path.len() {
        let old = path[level].pgno;
        let new = w.touch(old)?;
        if new != old {
            path[level].pgno = new;
            if level == 0 {
                tree.root = new;
            } else {
                let parent = path[level - 1];
                PageMut::new(w.page_mut(parent.pgno)?).set_child(parent.idx, new)?;
            }
        }
    }
    tree.mod_txnid = w.txnid();
    Ok(())
}

/// Split point for `nodes` (already holding the new node). An append at the
/// right edge leaves the new node alone on the right page.
fn choose_split(nodes: &[Vec<u8>], space: usize, append: bool) -> Result<usize> {
    let sizes: Vec<usize> = nodes.iter().map(|n| node_footprint(n.len())).collect();
    let total: usize = sizes.iter().sum();
    let last = nodes.len() - 1;
    if append && last >= 1 && total - sizes[last] <= space && sizes[last] <= space {
        return Ok(last);
    }
    let mut best: Option<(usize, usize)> = None;
    let mut left = 0;
    for split in 1..nodes.len() {
        left += sizes[split - 1];
        let right = total - left;
        if left <= space && right <= space {
            let diff = left.abs_diff(right);
            if best.map_or(true, |(_, d)| diff < d) {
                best = Some((split, diff));
            }
        }
    }
    best.map(|(split, _)| split)
        .ok_or(Error::Problem("no split point fits both pages"))
}

/// Inserts `raw` at slot `idx` of the page at `path[level]`, splitting as
/// needed.
fn insert_at<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &[Frame],
    level: usize,
    idx: usize,
    raw: Vec<u8>,
) -> Result<()> {
    let pgno = path[level].pgno;
    let mut page = PageMut::new(w.page_mut(pgno)?);
    if page.fits(raw.len()) {
        return page.insert_raw(idx, &raw);
    }
    split_insert(w, tree, path, level, idx, raw)
}

fn split_insert<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &[Frame],
    level: usize,
    idx: usize,
    raw: Vec<u8>,
) -> Result<()> {
    let pgno = path[level].pgno;
    let ps = w.page_size();
    let (is_branch, flags, mut nodes) = {
        let page = w.page(pgno)?;
        (page.is_branch(), page.flags(), raw_nodes(&page)?)
    };
    let old_count = nodes.len();
    nodes.insert(idx, raw);

    let append = idx == old_count && on_right_edge(&*w, &path[..level])?;
    let split = choose_split(&nodes, page_space(ps), append)?;

    let mut right_nodes = nodes.split_off(split);
    let sep = raw_key(&right_nodes[0]).to_vec();
    if is_branch {
        right_nodes[0] = node_with_key(&right_nodes[0], b"");
    }

    let right = w.alloc(1)?;
    let txnid = w.txnid();
    {
        let mut page = PageMut::new(w.page_mut(pgno)?);
        page.clear();
        for (i, node) in nodes.iter().enumerate() {
            page.insert_raw(i, node)?;
        }
    }
    {
        let mut page = PageMut::init(w.page_mut(right)?, right, flags, txnid);
        for (i, node) in right_nodes.iter().enumerate() {
            page.insert_raw(i, node)?;
        }
    }
    if is_branch {
        tree.branch_pages += 1;
    } else {
        tree.leaf_pages += 1;
    }
    trace!(
        "split page {} at {}/{} into {} (append: {})",
        pgno,
        split,
        old_count + 1,
        right,
        append
    );

    let sep_node = branch_node_bytes(&sep, right);
    if level == 0 {
        let root = w.alloc(1)?;
        let mut page = PageMut::init(w.page_mut(root)?, root, PageFlags::BRANCH, txnid);
        page.insert_raw(0, &branch_node_bytes(b"", pgno))?;
        page.insert_raw(1, &sep_node)?;
        tree.root = root;
        tree.height += 1;
        tree.branch_pages += 1;
        trace!("new root {} at height {}", root, tree.height);
        return Ok(());
    }
    let parent = path[level - 1];
    insert_at(w, tree, path, level - 1, parent.idx + 1, sep_node)
}

/// Replaces the node at the leaf of `path` with `raw`.
fn replace_leaf_node<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &[Frame],
    raw: Vec<u8>,
) -> Result<()> {
    let level = path.len() - 1;
    let leaf = path[level];
    PageMut::new(w.page_mut(leaf.pgno)?).remove(leaf.idx)?;
    insert_at(w, tree, path, level, leaf.idx, raw)
}

/// Replaces the separator key of branch slot `idx` at `path[level]`.
fn replace_separator<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &[Frame],
    level: usize,
    idx: usize,
    key: &[u8],
) -> Result<()> {
    let pgno = path[level].pgno;
    let raw = w.page(pgno)?.raw_node(idx)?.to_vec();
    PageMut::new(w.page_mut(pgno)?).remove(idx)?;
    insert_at(w, tree, path, level, idx, node_with_key(&raw, key))
}

/// Large-chain page count, read from the chain header.
fn large_chain_pages<S: PageSource + ?Sized>(src: &S, pgno: Pgno) -> Result<usize> {
    Ok(PageRef::new(src.large(pgno)?)?.large_pages() as usize)
}

/// Builds the leaf node for a plain value, spilling it to a large chain when
/// it does not fit inline. `old` is the chain the node pointed to before.
fn value_node<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    key: &[u8],
    data: &[u8],
    old: Option<Pgno>,
) -> Result<Vec<u8>> {
    let ps = w.page_size();
    let old = match old {
        Some(pgno) => Some((pgno, large_chain_pages(&*w, pgno)?)),
        None => None,
    };
    if !needs_large(ps, key.len(), data.len()) {
        if let Some((pgno, pages)) = old {
            w.retire(pgno, pages)?;
            tree.large_pages = tree.large_pages.saturating_sub(pages as u32);
        }
        return Ok(leaf_node_bytes(key, NodeFlags::empty(), data.len() as u32, data));
    }

    let need = large_pages_needed(ps, data.len());
    let (pgno, pages) = match old {
        Some((pgno, pages)) if pages >= need && w.is_own_dirty(pgno) => (pgno, pages),
        _ => {
            if let Some((pgno, pages)) = old {
                w.retire(pgno, pages)?;
                tree.large_pages = tree.large_pages.saturating_sub(pages as u32);
            }
            let pgno = w.alloc(need)?;
            tree.large_pages += need as u32;
            (pgno, need)
        }
    };
    let txnid = w.txnid();
    let buf = w.page_mut(pgno)?;
    PageMut::init_large(&mut buf[..], pgno, pages as u32, txnid);
    buf[PAGEHDRSZ..PAGEHDRSZ + data.len()].copy_from_slice(data);
    trace!("value of {} bytes stored in {} large pages at {}", data.len(), pages, pgno);
    Ok(leaf_node_bytes(
        key,
        NodeFlags::BIG,
        data.len() as u32,
        &pgno.to_le_bytes(),
    ))
}

/// Duplicates of one key, as stored in its leaf node.
enum Dups {
    Single(Vec<u8>),
    Inline(Vec<Vec<u8>>),
    Tree(TreeDesc),
}

impl Dups {
    fn read(node: &LeafNode<'_>) -> Result<Dups> {
        if !node.is_dup() {
            return Ok(Dups::Single(node.stored().to_vec()));
        }
        if node.is_tree() {
            return Ok(Dups::Tree(TreeDesc::decode(node.stored())?));
        }
        let sub = PageRef::validated(node.stored())?;
        let values = (0..sub.num_keys())
            .map(|i| sub.key(i).map(|k| k.to_vec()))
            .collect::<Result<_>>()?;
        Ok(Dups::Inline(values))
    }

    fn count(&self) -> u64 {
        match self {
            Dups::Single(_) => 1,
            Dups::Inline(values) => values.len() as u64,
            Dups::Tree(sub) => sub.items,
        }
    }
}

/// Encodes sorted duplicates as a plain node, an inline sub-page or a
/// nested tree, whichever is the smallest that fits.
fn dup_node<W: PageWriter + ?Sized>(
    w: &mut W,
    db: &DbCtx,
    key: &[u8],
    values: &[Vec<u8>],
) -> Result<Vec<u8>> {
    let ps = w.page_size();
    if values.len() == 1 && !needs_large(ps, key.len(), values[0].len()) {
        let v = &values[0];
        return Ok(leaf_node_bytes(key, NodeFlags::empty(), v.len() as u32, v));
    }
    let size = subpage_size(values.iter().map(|v| v.as_slice()));
    if NODESZ + key.len() + size <= leaf_node_max(ps) {
        let refs: Vec<&[u8]> = values.iter().map(|v| v.as_slice()).collect();
        let sub = build_subpage(&refs)?;
        return Ok(leaf_node_bytes(key, NodeFlags::DUP, sub.len() as u32, &sub));
    }
    let dup_db = db.dup_ctx();
    let mut sub = TreeDesc::empty(0);
    for v in values {
        put(w, &mut sub, &dup_db, v, &[], WriteFlags::APPEND)?;
    }
    trace!("moved {} duplicates into a nested tree at {}", values.len(), sub.root);
    Ok(leaf_node_bytes(
        key,
        NodeFlags::DUP | NodeFlags::TREE,
        sub.to_bytes().len() as u32,
        &sub.to_bytes(),
    ))
}

/// Inserts or replaces `key` → `data`.
pub(crate) fn put<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    db: &DbCtx,
    key: &[u8],
    data: &[u8],
    flags: WriteFlags,
) -> Result<()> {
    let ps = w.page_size();
    let dupsort = db.is_dupsort();
    let max_key = max_key_size(ps, dupsort);
    if key.len() > max_key {
        return Err(Error::KeyTooLarge {
            size: key.len(),
            max: max_key,
        });
    }
    let max_val = max_value_size(ps, dupsort);
    if data.len() > max_val {
        return Err(Error::ValueTooLarge {
            size: data.len(),
            max: max_val,
        });
    }

    if tree.is_empty() {
        if flags.contains(WriteFlags::CURRENT) {
            return Err(Error::NotFound);
        }
        let pgno = w.alloc(1)?;
        let txnid = w.txnid();
        PageMut::init(w.page_mut(pgno)?, pgno, PageFlags::LEAF, txnid);
        tree.root = pgno;
        tree.height = 1;
        tree.leaf_pages = 1;
        tree.mod_txnid = txnid;
        let raw = if dupsort {
            dup_node(w, db, key, &[data.to_vec()])?
        } else {
            value_node(w, tree, key, data, None)?
        };
        let path = [Frame { pgno, idx: 0 }];
        insert_at(w, tree, &path, 0, 0, raw)?;
        tree.items = 1;
        return Ok(());
    }

    let (mut path, exact) = descend(&*w, tree.root, Seek::Key(key), db.cmp)?;
    if flags.contains(WriteFlags::APPEND) {
        let leaf = path[path.len() - 1];
        let at_end = leaf.idx == w.page(leaf.pgno)?.num_keys()
            && on_right_edge(&*w, &path[..path.len() - 1])?;
        if !at_end && !(exact && dupsort) {
            return Err(Error::KeyExist);
        }
    }

    if !exact {
        if flags.contains(WriteFlags::CURRENT) {
            return Err(Error::NotFound);
        }
        touch_path(w, tree, &mut path)?;
        let raw = if dupsort {
            dup_node(w, db, key, &[data.to_vec()])?
        } else {
            value_node(w, tree, key, data, None)?
        };
        let level = path.len() - 1;
        let idx = path[level].idx;
        insert_at(w, tree, &path, level, idx, raw)?;
        tree.items += 1;
        return Ok(());
    }

    if flags.contains(WriteFlags::NOOVERWRITE) {
        return Err(Error::KeyExist);
    }
    if dupsort && flags.contains(WriteFlags::ALLDUPS) {
        del(w, tree, db, key, None)?;
        return put(w, tree, db, key, data, flags - WriteFlags::ALLDUPS);
    }

    touch_path(w, tree, &mut path)?;
    let leaf = path[path.len() - 1];
    let (old_large, dups, named) = {
        let page = w.page(leaf.pgno)?;
        let node = page.leaf_node(leaf.idx)?;
        let old_large = match node.value() {
            NodeValue::Large { pgno, .. } => Some(pgno),
            NodeValue::Inline(_) => None,
        };
        let dups = if dupsort { Some(Dups::read(&node)?) } else { None };
        (old_large, dups, node.is_tree() && !node.is_dup())
    };

    let Some(dups) = dups else {
        if named {
            return Err(Error::Incompatible);
        }
        let raw = value_node(w, tree, key, data, old_large)?;
        return replace_leaf_node(w, tree, &path, raw);
    };

    let dcmp = db.dcmp;
    let nodupdata = flags.contains(WriteFlags::NODUPDATA);
    let appenddup = flags.contains(WriteFlags::APPENDDUP);
    let mut values = match dups {
        Dups::Single(existing) => vec![existing],
        Dups::Inline(values) => values,
        Dups::Tree(mut sub) => {
            let dup_db = db.dup_ctx();
            if get(&*w, &sub, &dup_db, data)?.is_some() {
                return if nodupdata {
                    Err(Error::KeyExist)
                } else {
                    Ok(())
                };
            }
            let sub_flags = if appenddup {
                WriteFlags::APPEND
            } else {
                WriteFlags::empty()
            };
            put(w, &mut sub, &dup_db, data, &[], sub_flags)?;
            PageMut::new(w.page_mut(leaf.pgno)?)
                .into_leaf_value(leaf.idx)?
                .copy_from_slice(&sub.to_bytes());
            tree.items += 1;
            return Ok(());
        }
    };
    match values.binary_search_by(|v| dcmp(v, data)) {
        Ok(_) if nodupdata => return Err(Error::KeyExist),
        Ok(_) => return Ok(()),
        Err(pos) if appenddup && pos != values.len() => return Err(Error::KeyExist),
        Err(pos) => values.insert(pos, data.to_vec()),
    }
    let raw = dup_node(w, db, key, &values)?;
    replace_leaf_node(w, tree, &path, raw)?;
    tree.items += 1;
    Ok(())
}

/// Writable value bytes of a key whose leaf (and large chain) this
/// transaction already owns.
pub(crate) fn value_mut<'w, W: PageWriter + ?Sized>(
    w: &'w mut W,
    tree: &TreeDesc,
    db: &DbCtx,
    key: &[u8],
) -> Result<&'w mut [u8]> {
    let (path, exact) = descend(&*w, tree.root, Seek::Key(key), db.cmp)?;
    if !exact {
        return Err(Error::NotFound);
    }
    let leaf = path[path.len() - 1];
    let large = match w.page(leaf.pgno)?.leaf_node(leaf.idx)?.value() {
        NodeValue::Large { pgno, len } => Some((pgno, len)),
        NodeValue::Inline(_) => None,
    };
    match large {
        Some((pgno, len)) => {
            let buf = w.page_mut(pgno)?;
            Ok(&mut buf[PAGEHDRSZ..PAGEHDRSZ + len])
        }
        None => PageMut::new(w.page_mut(leaf.pgno)?).into_leaf_value(leaf.idx),
    }
}

/// Deletes `key`, or only its duplicate `data` on a DupSort database.
pub(crate) fn del<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    db: &DbCtx,
    key: &[u8],
    data: Option<&[u8]>,
) -> Result<()> {
    if tree.is_empty() {
        return Err(Error::NotFound);
    }
    let (mut path, exact) = descend(&*w, tree.root, Seek::Key(key), db.cmp)?;
    if !exact {
        return Err(Error::NotFound);
    }
    let leaf = path[path.len() - 1];
    let (large, dups) = {
        let page = w.page(leaf.pgno)?;
        let node = page.leaf_node(leaf.idx)?;
        if node.is_tree() && !node.is_dup() {
            return Err(Error::Incompatible);
        }
        let large = match node.value() {
            NodeValue::Large { pgno, .. } => Some(pgno),
            NodeValue::Inline(_) => None,
        };
        let dups = if db.is_dupsort() {
            Some(Dups::read(&node)?)
        } else {
            None
        };
        (large, dups)
    };

    if let (Some(dups), Some(data)) = (&dups, data) {
        let dcmp = db.dcmp;
        match dups {
            Dups::Single(existing) => {
                if dcmp(existing, data) != Ordering::Equal {
                    return Err(Error::NotFound);
                }
            }
            Dups::Inline(values) if values.len() > 1 => {
                let pos = values
                    .binary_search_by(|v| dcmp(v, data))
                    .map_err(|_| Error::NotFound)?;
                let mut values = values.clone();
                values.remove(pos);
                touch_path(w, tree, &mut path)?;
                let raw = dup_node(w, db, key, &values)?;
                replace_leaf_node(w, tree, &path, raw)?;
                tree.items -= 1;
                return Ok(());
            }
            Dups::Inline(values) => {
                if values.iter().all(|v| dcmp(v, data) != Ordering::Equal) {
                    return Err(Error::NotFound);
                }
            }
            Dups::Tree(sub) => {
                let mut sub = *sub;
                touch_path(w, tree, &mut path)?;
                del(w, &mut sub, &db.dup_ctx(), data, None)?;
                tree.items -= 1;
                if !sub.is_empty() {
                    let leaf = path[path.len() - 1];
                    PageMut::new(w.page_mut(leaf.pgno)?)
                        .into_leaf_value(leaf.idx)?
                        .copy_from_slice(&sub.to_bytes());
                    return Ok(());
                }
                return remove_leaf_node(w, tree, &mut path);
            }
        }
    }

    touch_path(w, tree, &mut path)?;
    if let Some(pgno) = large {
        let pages = large_chain_pages(&*w, pgno)?;
        w.retire(pgno, pages)?;
        tree.large_pages = tree.large_pages.saturating_sub(pages as u32);
    }
    let removed = match &dups {
        Some(Dups::Tree(sub)) => {
            drop_tree(w, sub.root)?;
            sub.items
        }
        Some(d) => d.count(),
        None => 1,
    };
    tree.items = tree.items.saturating_sub(removed);
    remove_leaf_node(w, tree, &mut path)
}

/// Descriptor of the named database `name`, stored as a `TREE` record in
/// the main tree.
pub(crate) fn find_named<S: PageSource + ?Sized>(
    src: &S,
    main: &TreeDesc,
    db: &DbCtx,
    name: &[u8],
) -> Result<Option<TreeDesc>> {
    if main.is_empty() {
        return Ok(None);
    }
    let (path, exact) = descend(src, main.root, Seek::Key(name), db.cmp)?;
    if !exact {
        return Ok(None);
    }
    let leaf = path[path.len() - 1];
    let node = src.page(leaf.pgno)?.leaf_node(leaf.idx)?;
    if !node.is_tree() || node.is_dup() {
        return Err(Error::Incompatible);
    }
    TreeDesc::decode(node.stored()).map(Some)
}

/// Creates or updates the record of a named database.
pub(crate) fn put_named<W: PageWriter + ?Sized>(
    w: &mut W,
    main: &mut TreeDesc,
    db: &DbCtx,
    name: &[u8],
    desc: &TreeDesc,
) -> Result<()> {
    let bytes = desc.to_bytes();
    if find_named(&*w, main, db, name)?.is_none() {
        put(w, main, db, name, &bytes, WriteFlags::NOOVERWRITE)?;
    }
    let (mut path, _) = descend(&*w, main.root, Seek::Key(name), db.cmp)?;
    touch_path(w, main, &mut path)?;
    let leaf = path[path.len() - 1];
    let mut page = PageMut::new(w.page_mut(leaf.pgno)?);
    page.set_node_flags(leaf.idx, NodeFlags::TREE)?;
    page.into_leaf_value(leaf.idx)?.copy_from_slice(&bytes);
    Ok(())
}

/// Removes the record of a named database; its pages are freed separately.
pub(crate) fn del_named<W: PageWriter + ?Sized>(
    w: &mut W,
    main: &mut TreeDesc,
    db: &DbCtx,
    name: &[u8],
) -> Result<()> {
    if find_named(&*w, main, db, name)?.is_none() {
        return Err(Error::NotFound);
    }
    let (mut path, _) = descend(&*w, main.root, Seek::Key(name), db.cmp)?;
    touch_path(w, main, &mut path)?;
    main.items = main.items.saturating_sub(1);
    remove_leaf_node(w, main, &mut path)
}

fn remove_leaf_node<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &mut Vec<Frame>,
) -> Result<()> {
    let level = path.len() - 1;
    let leaf = path[level];
    PageMut::new(w.page_mut(leaf.pgno)?).remove(leaf.idx)?;
    rebalance(w, tree, path, level)
}

/// Restores fill after a removal at `path[level]`: collapse the root, merge
/// with a sibling when both fit one page, or borrow one node from it.
fn rebalance<W: PageWriter + ?Sized>(
    w: &mut W,
    tree: &mut TreeDesc,
    path: &mut Vec<Frame>,
    level: usize,
) -> Result<()> {
    let ps = w.page_size();
    let pgno = path[level].pgno;
    let (n, used, is_branch) = {
        let page = w.page(pgno)?;
        (page.num_keys(), page.used_space(), page.is_branch())
    };

    if level == 0 {
        if !is_branch && n == 0 {
            w.retire(pgno, 1)?;
            tree.root = P_INVALID;
            tree.height = 0;
            tree.leaf_pages = 0;
            tree.branch_pages = 0;
            path.clear();
            trace!("tree emptied, root {} freed", pgno);
        } else if is_branch && n == 1 {
            let child = w.page(pgno)?.branch_node(0)?.child();
            w.retire(pgno, 1)?;
            tree.root = child;
            tree.height -= 1;
            tree.branch_pages = tree.branch_pages.saturating_sub(1);
            path.remove(0);
            trace!("root {} collapsed into {}", pgno, child);
            if !path.is_empty() {
                return rebalance(w, tree, path, 0);
            }
        }
        return Ok(());
    }

    let min_keys = if is_branch { 2 } else { 1 };
    if n >= min_keys && used >= page_space(ps) / 4 {
        return Ok(());
    }

    let parent = path[level - 1];
    if w.page(parent.pgno)?.num_keys() < 2 {
        return Ok(());
    }
    let (li, ri) = if parent.idx > 0 {
        (parent.idx - 1, parent.idx)
    } else {
        (0, 1)
    };
    let sib_idx = if parent.idx > 0 { li } else { ri };
    let sib_old = w.page(parent.pgno)?.branch_node(sib_idx)?.child();
    let sib = w.touch(sib_old)?;
    if sib != sib_old {
        PageMut::new(w.page_mut(parent.pgno)?).set_child(sib_idx, sib)?;
    }
    let (left, right) = if sib_idx == li { (sib, pgno) } else { (pgno, sib) };
    let sep = w.page(parent.pgno)?.key(ri)?.to_vec();

    let left_used = w.page(left)?.used_space();
    let mut right_nodes = raw_nodes(&w.page(right)?)?;
    if is_branch {
        right_nodes[0] = node_with_key(&right_nodes[0], &sep);
    }
    let right_size: usize = right_nodes.iter().map(|n| node_footprint(n.len())).sum();

    if left_used + right_size <= page_space(ps) {
        {
            let mut page = PageMut::new(w.page_mut(left)?);
            let base = page.as_ref().num_keys();
            for (i, node) in right_nodes.iter().enumerate() {
                page.insert_raw(base + i, node)?;
            }
        }
        w.retire(right, 1)?;
        if is_branch {
            tree.branch_pages = tree.branch_pages.saturating_sub(1);
        } else {
            tree.leaf_pages = tree.leaf_pages.saturating_sub(1);
        }
        PageMut::new(w.page_mut(parent.pgno)?).remove(ri)?;
        trace!("merged page {} into {}", right, left);
        path.truncate(level);
        path[level - 1].idx = li;
        return rebalance(w, tree, path, level - 1);
    }

    let new_sep = if sib_idx == li {
        // Borrow the last node of the left sibling.
        let (moved, count) = {
            let page = w.page(left)?;
            let count = page.num_keys();
            (page.raw_node(count - 1)?.to_vec(), count)
        };
        let need = node_footprint(moved.len()) + if is_branch { sep.len() + 1 } else { 0 };
        if count < 2 || w.page(pgno)?.free_space() < need {
            return Ok(());
        }
        PageMut::new(w.page_mut(left)?).remove(count - 1)?;
        let key = raw_key(&moved).to_vec();
        if is_branch {
            let first = w.page(pgno)?.raw_node(0)?.to_vec();
            let mut page = PageMut::new(w.page_mut(pgno)?);
            page.remove(0)?;
            page.insert_raw(0, &node_with_key(&first, &sep))?;
            page.insert_raw(0, &node_with_key(&moved, b""))?;
        } else {
            PageMut::new(w.page_mut(pgno)?).insert_raw(0, &moved)?;
        }
        key
    } else {
        // Borrow the first node of the right sibling.
        let count = w.page(right)?.num_keys();
        let moved = right_nodes[0].clone();
        if count < 2 || w.page(pgno)?.free_space() < node_footprint(moved.len()) {
            return Ok(());
        }
        {
            let mut page = PageMut::new(w.page_mut(pgno)?);
            let base = page.as_ref().num_keys();
            page.insert_raw(base, &moved)?;
        }
        let next = w.page(right)?.raw_node(1)?.to_vec();
        let key = raw_key(&next).to_vec();
        let mut page = PageMut::new(w.page_mut(right)?);
        page.remove(0)?;
        if is_branch {
            page.remove(0)?;
            page.insert_raw(0, &node_with_key(&next, b""))?;
        }
        key
    };
    trace!("rotated one node between {} and {}", left, right);
    replace_separator(w, tree, &path[..level], level - 1, ri, &new_sep)
}

/// Frees every page of the tree rooted at `root`, nested trees and large
/// chains included.
pub(crate) fn drop_tree<W: PageWriter + ?Sized>(w: &mut W, root: Pgno) -> Result<()> {
    if root == P_INVALID {
        return Ok(());
    }
    let mut stack = vec![root];
    while let Some(pgno) = stack.pop() {
        let mut larges = Vec::new();
        {
            let page = w.page(pgno)?;
            if page.is_branch() {
                for i in 0..page.num_keys() {
                    stack.push(page.branch_node(i)?.child());
                }
            } else {
                for i in 0..page.num_keys() {
                    let node = page.leaf_node(i)?;
                    if let NodeValue::Large { pgno, .. } = node.value() {
                        larges.push(pgno);
                    } else if node.is_dup() && node.is_tree() {
                        stack.push(TreeDesc::decode(node.stored())?.root);
                    }
                }
            }
        }
        for large in larges {
            let pages = large_chain_pages(&*w, large)?;
            w.retire(large, pages)?;
        }
        w.retire(pgno, 1)?;
    }
    Ok(())
}

/// Counts of a subtree walk, used to cross-check descriptors in tests.
#[cfg(test)]
pub(crate) fn collect<S: PageSource + ?Sized>(
    src: &S,
    tree: &TreeDesc,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let mut out = Vec::new();
    if tree.is_empty() {
        return Ok(out);
    }
    let (mut path, _) = descend(src, tree.root, Seek::First, crate::comparator::cmp_lexical)?;
    loop {
        let leaf = path[path.len() - 1];
        let page = src.page(leaf.pgno)?;
        for i in 0..page.num_keys() {
            let node = page.leaf_node(i)?;
            out.push((node.key().to_vec(), node_data(src, &node)?.to_vec()));
        }
        if !next_leaf(src, &mut path)? {
            return Ok(out);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Heap-backed page store for exercising the tree without a file.

    use super::*;
    use crate::pnl::Pnl;
    use rustc_hash::FxHashMap;

    pub(crate) struct MemPages {
        pub page_size: usize,
        pub pages: FxHashMap<Pgno, Vec<u8>>,
        pub next: Pgno,
        pub freed: Pnl,
    }

    impl MemPages {
        pub(crate) fn new(page_size: usize) -> Self {
            MemPages {
                page_size,
                pages: FxHashMap::default(),
                next: 3,
                freed: Pnl::new(),
            }
        }
    }

    impl PageSource for MemPages {
        fn page_size(&self) -> usize {
            self.page_size
        }

        fn page(&self, pgno: Pgno) -> Result<PageRef<'_>> {
            let buf = self
                .pages
                .get(&pgno)
                .ok_or_else(|| Error::corrupted(pgno, "missing page"))?;
            PageRef::validated(&buf[..self.page_size])
        }

        fn large(&self, pgno: Pgno) -> Result<&[u8]> {
            self.pages
                .get(&pgno)
                .map(|b| &b[..])
                .ok_or_else(|| Error::corrupted(pgno, "missing page"))
        }
    }

    impl PageWriter for MemPages {
        fn txnid(&self) -> Txnid {
            2
        }

        fn is_own_dirty(&self, pgno: Pgno) -> bool {
            self.pages.contains_key(&pgno)
        }

        fn page_mut(&mut self, pgno: Pgno) -> Result<&mut [u8]> {
            self.pages
                .get_mut(&pgno)
                .map(|b| &mut b[..])
                .ok_or(Error::Problem("page is not dirty"))
        }

        fn touch(&mut self, pgno: Pgno) -> Result<Pgno> {
            Ok(pgno)
        }

        fn alloc(&mut self, npages: usize) -> Result<Pgno> {
            let pgno = self.next;
            self.next += npages as Pgno;
            self.pages.insert(pgno, vec![0u8; npages * self.page_size]);
            Ok(pgno)
        }

        fn retire(&mut self, pgno: Pgno, npages: usize) -> Result<()> {
            self.pages.remove(&pgno);
            self.freed.insert_span(pgno, npages);
            Ok(())
        }
    }
}
