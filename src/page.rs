//! Page and node codec.
//!
//! Every page starts with a 20-byte header:
//!
//! ```text
//! 0   u64  txnid
//! 8   u16  dupfix key size
//! 10  u16  flags
//! 12  u16  lower   (low half of the page count on large pages)
//! 14  u16  upper   (high half of the page count on large pages)
//! 16  u32  pgno
//! ```
//!
//! Branch and leaf pages follow with an array of `u16` node offsets. Offsets,
//! `lower` and `upper` are relative to the end of the header. Nodes are packed
//! from `upper` to the end of the page, each 2-byte aligned:
//!
//! ```text
//! 0   u32  data size (leaf) or child pgno (branch)
//! 4   u8   node flags
//! 5   u8   reserved
//! 6   u16  key size
//! 8   key, then data (or a 4-byte pgno for big values)
//! ```
//!
//! All integers are little-endian. Fields are always read at explicit offsets;
//! nothing here reinterprets mapped bytes as a struct.

use crate::constants::{
    NodeFlags, PageFlags, NODE_HEADER_SIZE as NODESZ, PAGE_HEADER_SIZE as PAGEHDRSZ, TREE_SIZE,
};
use crate::error::{Error, Result};
use crate::types::{Pgno, Txnid};

const OFF_TXNID: usize = 0;
const OFF_DUPFIX_KSIZE: usize = 8;
const OFF_FLAGS: usize = 10;
const OFF_LOWER: usize = 12;
const OFF_UPPER: usize = 14;
const OFF_PGNO: usize = 16;

/// Largest value accepted for a plain (non-DupSort) database.
pub const MAX_DATA_SIZE: usize = 0x7FFF_0000;

#[inline]
pub(crate) fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

#[inline]
pub(crate) fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[inline]
pub(crate) fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(bytes)
}

#[inline]
pub(crate) fn write_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub(crate) fn write_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

#[inline]
pub(crate) fn write_u64(buf: &mut [u8], off: usize, val: u64) {
    buf[off..off + 8].copy_from_slice(&val.to_le_bytes());
}

/// # Safety
/// `off + 2 <= buf.len()`
#[inline]
unsafe fn read_u16_unchecked(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([*buf.get_unchecked(off), *buf.get_unchecked(off + 1)])
}

/// # Safety
/// `off + 4 <= buf.len()`
#[inline]
unsafe fn read_u32_unchecked(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([
        *buf.get_unchecked(off),
        *buf.get_unchecked(off + 1),
        *buf.get_unchecked(off + 2),
        *buf.get_unchecked(off + 3),
    ])
}

#[inline]
pub(crate) const fn even_ceil(n: usize) -> usize {
    (n + 1) & !1
}

#[inline]
pub(crate) const fn even_floor(n: usize) -> usize {
    n & !1
}

/// Usable bytes of a page after its header.
pub const fn page_space(page_size: usize) -> usize {
    page_size - PAGEHDRSZ
}

/// Largest leaf node (header, key and inline data, padded) that still lets
/// two nodes share a page.
pub const fn leaf_node_max(page_size: usize) -> usize {
    even_floor(page_space(page_size) / 2) - 2
}

/// Largest branch node.
pub const fn branch_node_max(page_size: usize) -> usize {
    even_floor((page_space(page_size) - 2 - NODESZ) / 2 - 2)
}

/// Largest key accepted for a page size.
pub fn max_key_size(page_size: usize, dupsort: bool) -> usize {
    let limit = branch_node_max(page_size) - NODESZ;
    if dupsort {
        limit.min(leaf_node_max(page_size) - NODESZ - TREE_SIZE)
    } else {
        limit
    }
}

/// Largest value accepted for a page size. Duplicate values become keys of a
/// nested tree, so they share the key limit.
pub fn max_value_size(page_size: usize, dupsort: bool) -> usize {
    if dupsort {
        max_key_size(page_size, false)
    } else {
        MAX_DATA_SIZE
    }
}

/// Largest value stored inline next to a key of `key_len` bytes; anything
/// longer goes to a chain of large pages.
pub fn max_inline_data_size(page_size: usize, key_len: usize) -> usize {
    leaf_node_max(page_size).saturating_sub(NODESZ + key_len)
}

/// Number of contiguous pages holding a large value of `len` bytes.
pub fn large_pages_needed(page_size: usize, len: usize) -> usize {
    (PAGEHDRSZ + len + page_size - 1) / page_size
}

/// Whether a leaf node for `key_len` + `data_len` must spill its value.
#[inline]
pub(crate) fn needs_large(page_size: usize, key_len: usize, data_len: usize) -> bool {
    NODESZ + key_len + data_len > leaf_node_max(page_size)
}

/// Bytes a raw node consumes in a page, including its offset slot.
#[inline]
pub(crate) fn node_footprint(raw_len: usize) -> usize {
    even_ceil(raw_len) + 2
}

/// Read-only view over a page image.
#[derive(Clone, Copy)]
pub struct PageRef<'a> {
    data: &'a [u8],
}

impl<'a> std::fmt::Debug for PageRef<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRef")
            .field("pgno", &self.pgno())
            .field("flags", &self.flags())
            .field("lower", &self.lower())
            .field("upper", &self.upper())
            .finish()
    }
}

impl<'a> PageRef<'a> {
    /// Header-level view: the header fits and the free-space bounds are sane.
    pub fn new(data: &'a [u8]) -> Result<Self> {
        if data.len() < PAGEHDRSZ {
            return Err(Error::corrupted(0, "page shorter than its header"));
        }
        let page = PageRef { data };
        let flags = page.flags();
        if flags.intersects(PageFlags::LARGE | PageFlags::META) {
            return Ok(page);
        }
        let (lower, upper) = (page.lower(), page.upper());
        if lower % 2 != 0 || lower > upper || PAGEHDRSZ + upper > data.len() {
            return Err(Error::corrupted(page.pgno(), "free-space bounds out of range"));
        }
        Ok(page)
    }

    /// Full structural check: every offset and every node extent lies inside
    /// the page. Pages read from the map pass through here before any
    /// unchecked accessor may touch them.
    pub fn validated(data: &'a [u8]) -> Result<Self> {
        let page = Self::new(data)?;
        let flags = page.flags();
        let pgno = page.pgno();
        if flags.contains(PageFlags::LARGE) {
            if page.large_pages() == 0 {
                return Err(Error::corrupted(pgno, "large page with zero length"));
            }
            return Ok(page);
        }
        if flags.contains(PageFlags::META) {
            return Ok(page);
        }
        if flags.contains(PageFlags::LEAF) == flags.contains(PageFlags::BRANCH) {
            return Err(Error::corrupted(pgno, "unknown page type"));
        }
        if flags.contains(PageFlags::DUPFIX) {
            return Err(Error::corrupted(pgno, "dupfix pages are not supported"));
        }
        let upper = page.upper();
        let n = page.num_keys();
        if page.is_branch() && n == 0 {
            return Err(Error::corrupted(pgno, "empty branch page"));
        }
        for i in 0..n {
            let ptr = read_u16(data, PAGEHDRSZ + 2 * i) as usize;
            if ptr < upper || ptr % 2 != 0 {
                return Err(Error::corrupted(pgno, "node offset outside the node area"));
            }
            if page.is_branch() {
                page.branch_node(i)?;
            } else {
                page.leaf_node(i)?;
            }
        }
        Ok(page)
    }

    #[inline]
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn txnid(&self) -> Txnid {
        read_u64(self.data, OFF_TXNID)
    }

    #[inline]
    pub fn pgno(&self) -> Pgno {
        read_u32(self.data, OFF_PGNO)
    }

    #[inline]
    pub fn flags(&self) -> PageFlags {
        PageFlags::from_bits_retain(read_u16(self.data, OFF_FLAGS))
    }

    #[inline]
    pub fn lower(&self) -> usize {
        read_u16(self.data, OFF_LOWER) as usize
    }

    #[inline]
    pub fn upper(&self) -> usize {
        read_u16(self.data, OFF_UPPER) as usize
    }

    /// Page count of a large page chain.
    #[inline]
    pub fn large_pages(&self) -> u32 {
        read_u32(self.data, OFF_LOWER)
    }

    #[inline]
    pub fn num_keys(&self) -> usize {
        self.lower() / 2
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.flags().contains(PageFlags::LEAF)
    }

    #[inline]
    pub fn is_branch(&self) -> bool {
        self.flags().contains(PageFlags::BRANCH)
    }

    #[inline]
    pub fn is_large(&self) -> bool {
        self.flags().contains(PageFlags::LARGE)
    }

    #[inline]
    pub fn free_space(&self) -> usize {
        self.upper() - self.lower()
    }

    /// Bytes used by offsets and nodes.
    #[inline]
    pub fn used_space(&self) -> usize {
        self.data.len() - PAGEHDRSZ - self.free_space()
    }

    fn node_offset(&self, i: usize) -> Result<usize> {
        if i >= self.num_keys() {
            return Err(Error::corrupted(self.pgno(), "node index out of range"));
        }
        let off = PAGEHDRSZ + read_u16(self.data, PAGEHDRSZ + 2 * i) as usize;
        if off + NODESZ > self.data.len() {
            return Err(Error::corrupted(self.pgno(), "node header past page end"));
        }
        Ok(off)
    }

    fn node_key(&self, off: usize) -> Result<&'a [u8]> {
        let ksize = read_u16(self.data, off + 6) as usize;
        self.data
            .get(off + NODESZ..off + NODESZ + ksize)
            .ok_or_else(|| Error::corrupted(self.pgno(), "node key past page end"))
    }

    /// Leaf node `i`.
    pub fn leaf_node(&self, i: usize) -> Result<LeafNode<'a>> {
        let off = self.node_offset(i)?;
        let key = self.node_key(off)?;
        let flags = NodeFlags::from_bits_retain(self.data[off + 4]);
        let dsize = read_u32(self.data, off);
        let stored = if flags.contains(NodeFlags::BIG) {
            4
        } else {
            dsize as usize
        };
        let start = off + NODESZ + key.len();
        let data = self
            .data
            .get(start..start + stored)
            .ok_or_else(|| Error::corrupted(self.pgno(), "node data past page end"))?;
        if flags.contains(NodeFlags::TREE) && !flags.contains(NodeFlags::BIG) && stored != TREE_SIZE {
            return Err(Error::corrupted(self.pgno(), "tree node with bad descriptor size"));
        }
        Ok(LeafNode {
            flags,
            key,
            dsize,
            data,
        })
    }

    /// Branch node `i`.
    pub fn branch_node(&self, i: usize) -> Result<BranchNode<'a>> {
        let off = self.node_offset(i)?;
        let key = self.node_key(off)?;
        Ok(BranchNode {
            key,
            child: read_u32(self.data, off),
        })
    }

    /// Key of node `i`, whatever the page type.
    pub fn key(&self, i: usize) -> Result<&'a [u8]> {
        let off = self.node_offset(i)?;
        self.node_key(off)
    }

    /// The exact encoded bytes of node `i` (without alignment padding).
    pub(crate) fn raw_node(&self, i: usize) -> Result<&'a [u8]> {
        let off = self.node_offset(i)?;
        let ksize = read_u16(self.data, off + 6) as usize;
        let len = if self.is_branch() {
            NODESZ + ksize
        } else if NodeFlags::from_bits_retain(self.data[off + 4]).contains(NodeFlags::BIG) {
            NODESZ + ksize + 4
        } else {
            NODESZ + ksize + read_u32(self.data, off) as usize
        };
        self.data
            .get(off..off + len)
            .ok_or_else(|| Error::corrupted(self.pgno(), "node past page end"))
    }

    /// # Safety
    /// The page passed [`PageRef::validated`] (or was encoded by this process)
    /// and `i < self.num_keys()`.
    #[inline]
    pub unsafe fn key_unchecked(&self, i: usize) -> &'a [u8] {
        let off = PAGEHDRSZ + read_u16_unchecked(self.data, PAGEHDRSZ + 2 * i) as usize;
        let ksize = read_u16_unchecked(self.data, off + 6) as usize;
        self.data.get_unchecked(off + NODESZ..off + NODESZ + ksize)
    }

    /// # Safety
    /// Same contract as [`PageRef::key_unchecked`], on a branch page.
    #[inline]
    pub unsafe fn branch_child_unchecked(&self, i: usize) -> Pgno {
        let off = PAGEHDRSZ + read_u16_unchecked(self.data, PAGEHDRSZ + 2 * i) as usize;
        read_u32_unchecked(self.data, off)
    }

    /// # Safety
    /// Same contract as [`PageRef::key_unchecked`], on a leaf page.
    #[inline]
    pub unsafe fn leaf_node_unchecked(&self, i: usize) -> LeafNode<'a> {
        let off = PAGEHDRSZ + read_u16_unchecked(self.data, PAGEHDRSZ + 2 * i) as usize;
        let ksize = read_u16_unchecked(self.data, off + 6) as usize;
        let flags = NodeFlags::from_bits_retain(*self.data.get_unchecked(off + 4));
        let dsize = read_u32_unchecked(self.data, off);
        let stored = if flags.contains(NodeFlags::BIG) {
            4
        } else {
            dsize as usize
        };
        let start = off + NODESZ + ksize;
        LeafNode {
            flags,
            key: self.data.get_unchecked(off + NODESZ..start),
            dsize,
            data: self.data.get_unchecked(start..start + stored),
        }
    }
}

/// Where a leaf value lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeValue<'a> {
    Inline(&'a [u8]),
    Large { pgno: Pgno, len: usize },
}

/// A node on a leaf page.
#[derive(Debug, Clone, Copy)]
pub struct LeafNode<'a> {
    flags: NodeFlags,
    key: &'a [u8],
    dsize: u32,
    data: &'a [u8],
}

impl<'a> LeafNode<'a> {
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    #[inline]
    pub fn flags(&self) -> NodeFlags {
        self.flags
    }

    /// Logical length of the value.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.dsize as usize
    }

    #[inline]
    pub fn is_big(&self) -> bool {
        self.flags.contains(NodeFlags::BIG)
    }

    #[inline]
    pub fn is_tree(&self) -> bool {
        self.flags.contains(NodeFlags::TREE)
    }

    #[inline]
    pub fn is_dup(&self) -> bool {
        self.flags.contains(NodeFlags::DUP)
    }

    /// Bytes stored in the node after the key.
    #[inline]
    pub fn stored(&self) -> &'a [u8] {
        self.data
    }

    pub fn value(&self) -> NodeValue<'a> {
        if self.is_big() {
            NodeValue::Large {
                pgno: read_u32(self.data, 0),
                len: self.dsize as usize,
            }
        } else {
            NodeValue::Inline(self.data)
        }
    }
}

/// A node on a branch page.
#[derive(Debug, Clone, Copy)]
pub struct BranchNode<'a> {
    key: &'a [u8],
    child: Pgno,
}

impl<'a> BranchNode<'a> {
    #[inline]
    pub fn key(&self) -> &'a [u8] {
        self.key
    }

    #[inline]
    pub fn child(&self) -> Pgno {
        self.child
    }
}

/// Encodes a leaf node.
pub(crate) fn leaf_node_bytes(key: &[u8], flags: NodeFlags, dsize: u32, data: &[u8]) -> Vec<u8> {
    let mut raw = vec![0u8; NODESZ + key.len() + data.len()];
    write_u32(&mut raw, 0, dsize);
    raw[4] = flags.bits();
    write_u16(&mut raw, 6, key.len() as u16);
    raw[NODESZ..NODESZ + key.len()].copy_from_slice(key);
    raw[NODESZ + key.len()..].copy_from_slice(data);
    raw
}

/// Encodes a branch node.
pub(crate) fn branch_node_bytes(key: &[u8], child: Pgno) -> Vec<u8> {
    let mut raw = vec![0u8; NODESZ + key.len()];
    write_u32(&mut raw, 0, child);
    write_u16(&mut raw, 6, key.len() as u16);
    raw[NODESZ..].copy_from_slice(key);
    raw
}

/// Rewrites the key of an encoded node, keeping its header fields and data.
pub(crate) fn node_with_key(raw: &[u8], key: &[u8]) -> Vec<u8> {
    let old_klen = read_u16(raw, 6) as usize;
    let tail = &raw[NODESZ + old_klen..];
    let mut out = Vec::with_capacity(NODESZ + key.len() + tail.len());
    out.extend_from_slice(&raw[..NODESZ]);
    write_u16(&mut out, 6, key.len() as u16);
    out.extend_from_slice(key);
    out.extend_from_slice(tail);
    out
}

/// Byte size of a compact sub-page holding `values`.
pub(crate) fn subpage_size<'v>(values: impl IntoIterator<Item = &'v [u8]>) -> usize {
    PAGEHDRSZ
        + values
            .into_iter()
            .map(|v| node_footprint(NODESZ + v.len()))
            .sum::<usize>()
}

/// Builds a compact (`lower == upper`) sub-page from values already in order.
pub(crate) fn build_subpage(values: &[&[u8]]) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; subpage_size(values.iter().copied())];
    let mut page = PageMut::init(&mut buf, 0, PageFlags::LEAF | PageFlags::SUBP, 0);
    for (i, v) in values.iter().enumerate() {
        page.insert_raw(i, &leaf_node_bytes(v, NodeFlags::empty(), 0, &[]))?;
    }
    Ok(buf)
}

/// Mutable view used to encode a page in place.
pub struct PageMut<'a> {
    data: &'a mut [u8],
}

impl<'a> PageMut<'a> {
    /// Wraps a buffer that already holds a page encoded by this process.
    pub fn new(data: &'a mut [u8]) -> Self {
        PageMut { data }
    }

    /// Formats an empty branch or leaf page.
    pub fn init(data: &'a mut [u8], pgno: Pgno, flags: PageFlags, txnid: Txnid) -> Self {
        data[..PAGEHDRSZ].fill(0);
        let upper = (data.len() - PAGEHDRSZ) as u16;
        write_u64(data, OFF_TXNID, txnid);
        write_u16(data, OFF_DUPFIX_KSIZE, 0);
        write_u16(data, OFF_FLAGS, flags.bits());
        write_u16(data, OFF_LOWER, 0);
        write_u16(data, OFF_UPPER, upper);
        write_u32(data, OFF_PGNO, pgno);
        PageMut { data }
    }

    /// Formats the head of a large page chain of `pages` pages.
    pub fn init_large(data: &'a mut [u8], pgno: Pgno, pages: u32, txnid: Txnid) -> Self {
        data[..PAGEHDRSZ].fill(0);
        write_u64(data, OFF_TXNID, txnid);
        write_u16(data, OFF_FLAGS, PageFlags::LARGE.bits());
        write_u32(data, OFF_LOWER, pages);
        write_u32(data, OFF_PGNO, pgno);
        PageMut { data }
    }

    #[inline]
    pub fn as_ref(&self) -> PageRef<'_> {
        PageRef { data: self.data }
    }

    #[inline]
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn set_pgno(&mut self, pgno: Pgno) {
        write_u32(self.data, OFF_PGNO, pgno);
    }

    pub fn set_txnid(&mut self, txnid: Txnid) {
        write_u64(self.data, OFF_TXNID, txnid);
    }

    pub fn set_flags(&mut self, flags: PageFlags) {
        write_u16(self.data, OFF_FLAGS, flags.bits());
    }

    fn set_bounds(&mut self, lower: usize, upper: usize) {
        write_u16(self.data, OFF_LOWER, lower as u16);
        write_u16(self.data, OFF_UPPER, upper as u16);
    }

    /// Whether a raw node of `raw_len` bytes fits in the free space.
    #[inline]
    pub fn fits(&self, raw_len: usize) -> bool {
        node_footprint(raw_len) <= self.as_ref().free_space()
    }

    /// Inserts an encoded node at position `idx`.
    pub fn insert_raw(&mut self, idx: usize, raw: &[u8]) -> Result<()> {
        let page = self.as_ref();
        let (n, lower, upper) = (page.num_keys(), page.lower(), page.upper());
        if idx > n {
            return Err(Error::Problem("node insert position out of range"));
        }
        let size = even_ceil(raw.len());
        if lower + 2 + size > upper {
            return Err(Error::Problem("node does not fit in page"));
        }
        let new_upper = upper - size;
        let slot = PAGEHDRSZ + 2 * idx;
        self.data
            .copy_within(slot..PAGEHDRSZ + 2 * n, slot + 2);
        write_u16(self.data, slot, new_upper as u16);
        let at = PAGEHDRSZ + new_upper;
        self.data[at..at + raw.len()].copy_from_slice(raw);
        if size > raw.len() {
            self.data[at + raw.len()] = 0;
        }
        self.set_bounds(lower + 2, new_upper);
        Ok(())
    }

    /// Removes node `idx` and compacts the node area.
    pub fn remove(&mut self, idx: usize) -> Result<()> {
        let page = self.as_ref();
        let (n, lower, upper) = (page.num_keys(), page.lower(), page.upper());
        let size = even_ceil(page.raw_node(idx)?.len());
        let ptr = read_u16(self.data, PAGEHDRSZ + 2 * idx) as usize;

        self.data
            .copy_within(PAGEHDRSZ + upper..PAGEHDRSZ + ptr, PAGEHDRSZ + upper + size);
        for j in 0..n {
            let at = PAGEHDRSZ + 2 * j;
            let p = read_u16(self.data, at) as usize;
            if p < ptr {
                write_u16(self.data, at, (p + size) as u16);
            }
        }
        self.data.copy_within(
            PAGEHDRSZ + 2 * (idx + 1)..PAGEHDRSZ + 2 * n,
            PAGEHDRSZ + 2 * idx,
        );
        self.set_bounds(lower - 2, upper + size);
        Ok(())
    }

    /// Points branch node `idx` at a new child.
    pub fn set_child(&mut self, idx: usize, child: Pgno) -> Result<()> {
        let off = self.as_ref().node_offset(idx)?;
        write_u32(self.data, off, child);
        Ok(())
    }

    pub fn set_node_flags(&mut self, idx: usize, flags: NodeFlags) -> Result<()> {
        let off = self.as_ref().node_offset(idx)?;
        self.data[off + 4] = flags.bits();
        Ok(())
    }

    /// Mutable bytes stored after the key of leaf node `idx`, borrowed for as
    /// long as the page buffer itself.
    pub fn into_leaf_value(self, idx: usize) -> Result<&'a mut [u8]> {
        let (start, len) = {
            let page = self.as_ref();
            let node = page.leaf_node(idx)?;
            let off = page.node_offset(idx)?;
            (off + NODESZ + node.key().len(), node.stored().len())
        };
        let data = self.data;
        Ok(&mut data[start..start + len])
    }

    /// Drops every node, keeping the header identity.
    pub fn clear(&mut self) {
        let upper = self.data.len() - PAGEHDRSZ;
        self.set_bounds(0, upper);
    }
}
