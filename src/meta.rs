use crate::constants::{
    PageFlags, DATASIGN_WEAK, DATA_VERSION, FREE_DBI, MAGIC_AND_VERSION, MAIN_DBI, MDBX_MAGIC,
    META_SIZE, MIN_TXNID, NUM_METAS, PAGE_HEADER_SIZE, P_INVALID, TREE_SIZE,
};
use crate::error::{Error, Result};
use crate::page::{read_u16, read_u32, read_u64, write_u16, write_u32, write_u64, PageMut};
use crate::types::{Pgno, Stat, Txnid};

// Offsets inside the meta body, which starts right after the page header.
const M_MAGIC: usize = 0;
const M_TXNID_A: usize = 8;
const M_VALIDATOR: usize = 18;
const M_EXTRA_PAGEHDR: usize = 19;
const M_GEO: usize = 20;
const M_TREES: usize = 40;
const M_CANARY: usize = 136;
const M_SIGN: usize = 168;
const M_TXNID_B: usize = 176;
const M_PAGES_RETIRED: usize = 184;
const M_BOOTID: usize = 192;
const M_DXBID: usize = 208;

/// Tree descriptor: the 48-byte record naming a B+tree root and its counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeDesc {
    pub flags: u16,
    pub height: u16,
    pub dupfix_size: u32,
    pub root: Pgno,
    pub branch_pages: u32,
    pub leaf_pages: u32,
    pub large_pages: u32,
    pub sequence: u64,
    pub items: u64,
    pub mod_txnid: Txnid,
}

impl Default for TreeDesc {
    fn default() -> Self {
        TreeDesc::empty(0)
    }
}

impl TreeDesc {
    pub fn empty(flags: u16) -> Self {
        TreeDesc {
            flags,
            height: 0,
            dupfix_size: 0,
            root: P_INVALID,
            branch_pages: 0,
            leaf_pages: 0,
            large_pages: 0,
            sequence: 0,
            items: 0,
            mod_txnid: 0,
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.root == P_INVALID
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < TREE_SIZE {
            return Err(Error::Corrupted);
        }
        Ok(TreeDesc {
            flags: read_u16(buf, 0),
            height: read_u16(buf, 2),
            dupfix_size: read_u32(buf, 4),
            root: read_u32(buf, 8),
            branch_pages: read_u32(buf, 12),
            leaf_pages: read_u32(buf, 16),
            large_pages: read_u32(buf, 20),
            sequence: read_u64(buf, 24),
            items: read_u64(buf, 32),
            mod_txnid: read_u64(buf, 40),
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        write_u16(buf, 0, self.flags);
        write_u16(buf, 2, self.height);
        write_u32(buf, 4, self.dupfix_size);
        write_u32(buf, 8, self.root);
        write_u32(buf, 12, self.branch_pages);
        write_u32(buf, 16, self.leaf_pages);
        write_u32(buf, 20, self.large_pages);
        write_u64(buf, 24, self.sequence);
        write_u64(buf, 32, self.items);
        write_u64(buf, 40, self.mod_txnid);
    }

    pub fn to_bytes(&self) -> [u8; TREE_SIZE] {
        let mut buf = [0u8; TREE_SIZE];
        self.encode(&mut buf);
        buf
    }

    pub fn stat(&self, page_size: usize) -> Stat {
        Stat {
            page_size: page_size as u32,
            depth: self.height as u32,
            branch_pages: self.branch_pages as usize,
            leaf_pages: self.leaf_pages as usize,
            overflow_pages: self.large_pages as usize,
            entries: self.items as usize,
        }
    }
}

/// File geometry in pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaGeometry {
    pub grow_pv: u16,
    pub shrink_pv: u16,
    pub lower: Pgno,
    pub upper: Pgno,
    pub now: Pgno,
    pub first_unallocated: Pgno,
}

/// Decoded meta page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Meta {
    pub txnid: Txnid,
    pub validator: u8,
    pub extra_pagehdr: i8,
    pub geometry: MetaGeometry,
    /// GC tree then main tree
    pub trees: [TreeDesc; 2],
    pub canary: [u64; 4],
    pub sign: u64,
    pub pages_retired: u64,
    pub bootid: [u8; 16],
    pub dxbid: [u8; 16],
}

impl Meta {
    /// State of a freshly created file.
    pub fn initial(page_size: usize, geometry: MetaGeometry, dxbid: [u8; 16]) -> Meta {
        let mut gc = TreeDesc::empty(crate::constants::DbFlags::INTEGERKEY.bits() as u16);
        gc.dupfix_size = page_size as u32;
        Meta {
            txnid: MIN_TXNID,
            validator: 0,
            extra_pagehdr: 0,
            geometry,
            trees: [gc, TreeDesc::empty(0)],
            canary: [0; 4],
            sign: crate::constants::DATASIGN_STEADY,
            pages_retired: 0,
            bootid: [0; 16],
            dxbid,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.trees[FREE_DBI as usize].dupfix_size as usize
    }

    #[inline]
    pub fn gc_tree(&self) -> &TreeDesc {
        &self.trees[FREE_DBI as usize]
    }

    #[inline]
    pub fn main_tree(&self) -> &TreeDesc {
        &self.trees[MAIN_DBI as usize]
    }

    #[inline]
    pub fn is_steady(&self) -> bool {
        self.sign > DATASIGN_WEAK
    }

    /// Page size recorded in a meta page image, without validating the rest.
    pub fn peek_page_size(page: &[u8]) -> Result<usize> {
        if page.len() < PAGE_HEADER_SIZE + META_SIZE {
            return Err(Error::Invalid);
        }
        check_magic(read_u64(page, PAGE_HEADER_SIZE + M_MAGIC))?;
        let trees = PAGE_HEADER_SIZE + M_TREES;
        Ok(read_u32(page, trees + 4) as usize)
    }

    /// Decodes a meta page; a torn write (`txnid_a != txnid_b`) is `Corrupted`.
    pub fn decode(page: &[u8]) -> Result<Meta> {
        if page.len() < PAGE_HEADER_SIZE + META_SIZE {
            return Err(Error::Invalid);
        }
        let flags = PageFlags::from_bits_retain(read_u16(page, 10));
        if !flags.contains(PageFlags::META) {
            return Err(Error::Invalid);
        }
        let body = &page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE];
        check_magic(read_u64(body, M_MAGIC))?;
        let txnid = read_u64(body, M_TXNID_A);
        if txnid != read_u64(body, M_TXNID_B) || txnid < MIN_TXNID {
            return Err(Error::Corrupted);
        }
        let geo = &body[M_GEO..];
        let geometry = MetaGeometry {
            grow_pv: read_u16(geo, 0),
            shrink_pv: read_u16(geo, 2),
            lower: read_u32(geo, 4),
            upper: read_u32(geo, 8),
            now: read_u32(geo, 12),
            first_unallocated: read_u32(geo, 16),
        };
        if geometry.first_unallocated > geometry.now || geometry.now > geometry.upper {
            return Err(Error::Corrupted);
        }
        let gc = TreeDesc::decode(&body[M_TREES..])?;
        let main = TreeDesc::decode(&body[M_TREES + TREE_SIZE..])?;
        let mut canary = [0u64; 4];
        for (i, c) in canary.iter_mut().enumerate() {
            *c = read_u64(body, M_CANARY + 8 * i);
        }
        let mut bootid = [0u8; 16];
        bootid.copy_from_slice(&body[M_BOOTID..M_BOOTID + 16]);
        let mut dxbid = [0u8; 16];
        dxbid.copy_from_slice(&body[M_DXBID..M_DXBID + 16]);
        Ok(Meta {
            txnid,
            validator: body[M_VALIDATOR],
            extra_pagehdr: body[M_EXTRA_PAGEHDR] as i8,
            geometry,
            trees: [gc, main],
            canary,
            sign: read_u64(body, M_SIGN),
            pages_retired: read_u64(body, M_PAGES_RETIRED),
            bootid,
            dxbid,
        })
    }

    /// Encodes the meta into slot `pgno`. `page` is a whole page buffer.
    pub fn encode(&self, pgno: Pgno, page: &mut [u8]) {
        page.fill(0);
        PageMut::init(page, pgno, PageFlags::META, self.txnid);
        let body = &mut page[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + META_SIZE];
        write_u64(body, M_MAGIC, MAGIC_AND_VERSION);
        write_u64(body, M_TXNID_A, self.txnid);
        body[M_VALIDATOR] = self.validator;
        body[M_EXTRA_PAGEHDR] = self.extra_pagehdr as u8;
        {
            let geo = &mut body[M_GEO..M_GEO + 20];
            write_u16(geo, 0, self.geometry.grow_pv);
            write_u16(geo, 2, self.geometry.shrink_pv);
            write_u32(geo, 4, self.geometry.lower);
            write_u32(geo, 8, self.geometry.upper);
            write_u32(geo, 12, self.geometry.now);
            write_u32(geo, 16, self.geometry.first_unallocated);
        }
        self.trees[0].encode(&mut body[M_TREES..M_TREES + TREE_SIZE]);
        self.trees[1].encode(&mut body[M_TREES + TREE_SIZE..M_TREES + 2 * TREE_SIZE]);
        for (i, c) in self.canary.iter().enumerate() {
            write_u64(body, M_CANARY + 8 * i, *c);
        }
        write_u64(body, M_SIGN, self.sign);
        write_u64(body, M_TXNID_B, self.txnid);
        write_u64(body, M_PAGES_RETIRED, self.pages_retired);
        body[M_BOOTID..M_BOOTID + 16].copy_from_slice(&self.bootid);
        body[M_DXBID..M_DXBID + 16].copy_from_slice(&self.dxbid);
    }
}

fn check_magic(magic_and_version: u64) -> Result<()> {
    if magic_and_version >> 8 != MDBX_MAGIC {
        return Err(Error::Invalid);
    }
    if magic_and_version as u8 != DATA_VERSION {
        return Err(Error::VersionMismatch);
    }
    Ok(())
}

/// Index of the head meta: the valid slot with the highest txnid, lowest
/// slot on ties.
pub(crate) fn head_slot(metas: &[Option<Meta>; NUM_METAS]) -> Option<usize> {
    let mut head: Option<usize> = None;
    for (i, meta) in metas.iter().enumerate() {
        if let Some(m) = meta {
            match head {
                Some(h) if metas[h].as_ref().map_or(0, |hm| hm.txnid) >= m.txnid => {}
                _ => head = Some(i),
            }
        }
    }
    head
}

/// Index of the newest steady meta.
pub(crate) fn steady_slot(metas: &[Option<Meta>; NUM_METAS]) -> Option<usize> {
    let mut best: Option<(usize, Txnid)> = None;
    for (i, meta) in metas.iter().enumerate() {
        match meta {
            Some(m) if m.is_steady() && best.map_or(true, |(_, t)| m.txnid > t) => {
                best = Some((i, m.txnid))
            }
            _ => {}
        }
    }
    best.map(|(i, _)| i)
}

/// Slot the next commit writes to: the oldest slot that is not the head.
/// Torn or invalid slots count as oldest. While the head is weak, the
/// newest steady meta is left alone so a crash can still fall back to it.
pub(crate) fn target_slot(metas: &[Option<Meta>; NUM_METAS], head: usize) -> usize {
    let keep = steady_slot(metas).filter(|&s| s != head);
    let mut target = (head + 1) % NUM_METAS;
    let mut oldest = Txnid::MAX;
    for (i, meta) in metas.iter().enumerate() {
        if i == head || Some(i) == keep {
            continue;
        }
        let txnid = meta.as_ref().map_or(0, |m| m.txnid);
        if txnid < oldest {
            oldest = txnid;
            target = i;
        }
    }
    target
}
