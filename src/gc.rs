//! Free-page bookkeeping of a write transaction and the GC tree.
//!
//! The GC tree maps the txnid that freed a set of pages to the page list.
//! A record becomes reusable once no reader can still see the snapshot
//! before that txnid. Records are consumed newest first.

use log::{debug, trace};

use crate::comparator::{cmp_integer, cmp_lexical};
use crate::constants::{DbFlags, WriteFlags, FREE_DBI, GC_UPDATE_ROUNDS, MIN_TXNID};
use crate::error::{Error, Result};
use crate::meta::{MetaGeometry, TreeDesc};
use crate::pnl::Pnl;
use crate::transaction::RwTransaction;
use crate::tree::{
    self, descend, next_leaf, node_data, prev_leaf, DbCtx, PageSource, PageWriter, Seek,
};
use crate::types::{Pgno, Txnid};

/// Allocator state; cloned into nested transactions.
#[derive(Debug, Clone, Default)]
pub(crate) struct GcState {
    /// Pages this transaction freed that older snapshots may still read.
    pub(crate) retired: Pnl,
    /// Pages that can be handed out right away.
    pub(crate) reclaimed: Pnl,
    /// Pages in the order they joined `reclaimed`; entries already taken
    /// as part of a run are skipped.
    recent: Vec<Pgno>,
    /// GC records drained into `reclaimed`, deleted at commit.
    pub(crate) consumed: Vec<Txnid>,
    pub(crate) next_pgno: Pgno,
    pub(crate) now_pgno: Pgno,
    /// Set while the GC tree itself is being rewritten.
    pub(crate) frozen: bool,
    exhausted: bool,
    last_fetched: Option<Txnid>,
}

impl GcState {
    pub(crate) fn new(geometry: &MetaGeometry) -> Self {
        GcState {
            next_pgno: geometry.first_unallocated,
            now_pgno: geometry.now,
            ..GcState::default()
        }
    }

    /// Takes `npages` contiguous pages from the reclaimed pool. A single
    /// page is the one that joined the pool last.
    pub(crate) fn take(&mut self, npages: usize) -> Option<Pgno> {
        if npages == 1 {
            while let Some(pgno) = self.recent.pop() {
                if self.reclaimed.remove(pgno) {
                    return Some(pgno);
                }
            }
        }
        self.reclaimed.take_run(npages)
    }

    /// Makes `npages` pages starting at `pgno` reusable at once.
    pub(crate) fn reclaim(&mut self, pgno: Pgno, npages: usize) {
        self.reclaimed.insert_span(pgno, npages);
        self.recent.extend((pgno..pgno + npages as Pgno).rev());
    }

    /// Upper bound (exclusive) for the next GC record to pull, if pulling is
    /// still allowed.
    pub(crate) fn fetch_bound(&self, oldest: Txnid) -> Option<Txnid> {
        if self.frozen || self.exhausted {
            return None;
        }
        Some(self.last_fetched.map_or(oldest, |last| last.min(oldest)))
    }

    pub(crate) fn accept(&mut self, txnid: Txnid, pages: &Pnl) {
        debug!("reusing {} pages freed by txn {}", pages.len(), txnid);
        self.reclaimed.merge(pages);
        self.recent.extend(pages.iter());
        self.consumed.push(txnid);
        self.last_fetched = Some(txnid);
    }

    pub(crate) fn mark_exhausted(&mut self) {
        self.exhausted = true;
    }

    /// Allocates past the end of the used area, growing the file size in
    /// `growth` steps up to `upper`.
    pub(crate) fn extend(&mut self, npages: usize, upper: Pgno, growth: Pgno) -> Result<Pgno> {
        let pgno = self.next_pgno;
        let end = pgno as u64 + npages as u64;
        if end > upper as u64 {
            return Err(Error::MapFull);
        }
        self.next_pgno = end as Pgno;
        if self.next_pgno > self.now_pgno {
            let step = growth.max(1) as u64;
            let now = (end + step - 1) / step * step;
            self.now_pgno = now.min(upper as u64) as Pgno;
            trace!("file grows to {} pages", self.now_pgno);
        }
        Ok(pgno)
    }

    /// Every page the commit must record as free.
    pub(crate) fn pending(&self) -> Pnl {
        let mut pages = self.retired.clone();
        pages.merge(&self.reclaimed);
        pages
    }
}

/// Ordering of the GC tree: 8-byte txnid keys.
pub(crate) fn gc_ctx() -> DbCtx {
    DbCtx::new(DbFlags::INTEGERKEY, cmp_integer, cmp_lexical)
}

fn record_txnid(key: &[u8], pgno: Pgno) -> Result<Txnid> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::corrupted(pgno, "GC key is not a txnid"))?;
    Ok(Txnid::from_le_bytes(bytes))
}

/// Newest GC record with a txnid below `below`.
pub(crate) fn fetch_record<S: PageSource + ?Sized>(
    src: &S,
    gc: &TreeDesc,
    below: Txnid,
) -> Result<Option<(Txnid, Pnl)>> {
    if gc.is_empty() || below <= MIN_TXNID {
        return Ok(None);
    }
    let key = below.to_le_bytes();
    let (mut path, _) = descend(src, gc.root, Seek::Key(&key), cmp_integer)?;
    let last = path.len() - 1;
    if path[last].idx > 0 {
        path[last].idx -= 1;
    } else if !prev_leaf(src, &mut path)? {
        return Ok(None);
    }
    let leaf = path[path.len() - 1];
    let page = src.page(leaf.pgno)?;
    let node = page.leaf_node(leaf.idx)?;
    let txnid = record_txnid(node.key(), leaf.pgno)?;
    let pages = Pnl::decode(node_data(src, &node)?)?;
    Ok(Some((txnid, pages)))
}

/// Every GC record, oldest first.
pub(crate) fn list_records<S: PageSource + ?Sized>(
    src: &S,
    gc: &TreeDesc,
) -> Result<Vec<(Txnid, Vec<Pgno>)>> {
    let mut records = Vec::new();
    if gc.is_empty() {
        return Ok(records);
    }
    let (mut path, _) = descend(src, gc.root, Seek::First, cmp_integer)?;
    loop {
        let leaf = path[path.len() - 1];
        let page = src.page(leaf.pgno)?;
        for i in 0..page.num_keys() {
            let node = page.leaf_node(i)?;
            let txnid = record_txnid(node.key(), leaf.pgno)?;
            let pages = Pnl::decode(node_data(src, &node)?)?;
            records.push((txnid, pages.as_slice().to_vec()));
        }
        if !next_leaf(src, &mut path)? {
            return Ok(records);
        }
    }
}

/// Rewrites the GC tree for a committing transaction: drops the records it
/// consumed and stores everything it freed under its own txnid.
///
/// Writing the record can itself free or take pages, so the value is
/// reserved first, the list recomputed, and the reservation grown until the
/// list fits.
pub(crate) fn update_gc(txn: &mut RwTransaction<'_>) -> Result<()> {
    let db = gc_ctx();
    let mut desc = txn.tree_desc(FREE_DBI)?;
    txn.gc_mut().frozen = true;

    let consumed = std::mem::take(&mut txn.gc_mut().consumed);
    for txnid in &consumed {
        tree::del(txn, &mut desc, &db, &txnid.to_le_bytes(), None)?;
    }

    let key = txn.txnid().to_le_bytes();
    let mut slack = 0;
    for round in 0..GC_UPDATE_ROUNDS {
        let pending = txn.gc_mut().pending();
        if round == 0 && pending.is_empty() {
            txn.store_tree(FREE_DBI, desc);
            return Ok(());
        }
        let reserved = Pnl::encoded_len(pending.len() + slack);
        tree::put(txn, &mut desc, &db, &key, &vec![0u8; reserved], WriteFlags::empty())?;

        let list = txn.gc_mut().pending();
        if Pnl::encoded_len(list.len()) <= reserved {
            txn.store_tree(FREE_DBI, desc);
            debug!(
                "txn {} records {} free pages after {} round(s), {} records consumed",
                txn.txnid(),
                list.len(),
                round + 1,
                consumed.len()
            );
            let buf = tree::value_mut(txn, &desc, &db, &key)?;
            return list.encode_into(buf);
        }
        slack = slack * 2 + 4 + (list.len() - pending.len().min(list.len()));
    }
    Err(Error::Problem("GC record did not settle"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::testing::MemPages;
    use crate::tree::put;

    #[test]
    fn extend_grows_in_steps() {
        let geo = MetaGeometry {
            now: 16,
            first_unallocated: 14,
            upper: 40,
            ..MetaGeometry::default()
        };
        let mut gc = GcState::new(&geo);
        assert_eq!(gc.extend(2, 40, 16).unwrap(), 14);
        assert_eq!(gc.now_pgno, 16);
        assert_eq!(gc.extend(1, 40, 16).unwrap(), 16);
        assert_eq!(gc.now_pgno, 32);
        assert_eq!(gc.extend(20, 40, 16).unwrap(), 17);
        assert_eq!(gc.now_pgno, 40);
        assert!(matches!(gc.extend(4, 40, 16), Err(Error::MapFull)));
        assert_eq!(gc.next_pgno, 37);
    }

    #[test]
    fn fetch_bound_follows_readers_and_history() {
        let mut gc = GcState::default();
        assert_eq!(gc.fetch_bound(10), Some(10));
        gc.accept(6, &[40, 41].into_iter().collect());
        assert_eq!(gc.fetch_bound(10), Some(6));
        assert_eq!(gc.fetch_bound(4), Some(4));
        assert_eq!(gc.take(2), Some(40));
        gc.mark_exhausted();
        assert_eq!(gc.fetch_bound(10), None);
    }

    #[test]
    fn single_pages_come_from_the_newest_source() {
        let mut gc = GcState::default();
        gc.accept(5, &[50, 51].into_iter().collect());
        gc.accept(9, &[90, 91].into_iter().collect());
        gc.reclaim(7, 1);

        assert_eq!(gc.take(1), Some(7));
        assert_eq!(gc.take(1), Some(90));
        assert_eq!(gc.take(1), Some(91));
        // Runs still come from wherever the pages are contiguous
        assert_eq!(gc.take(2), Some(50));
        assert_eq!(gc.take(1), None);
        assert!(gc.reclaimed.is_empty());

        gc.reclaim(20, 3);
        assert_eq!(gc.take(2), Some(20));
        gc.accept(11, &[110].into_iter().collect());
        assert_eq!(gc.take(1), Some(110));
        assert_eq!(gc.take(1), Some(22));
    }

    #[test]
    fn newest_record_below_the_bound_is_fetched() {
        let mut w = MemPages::new(256);
        let mut desc = TreeDesc::empty(DbFlags::INTEGERKEY.bits() as u16);
        let db = gc_ctx();
        for txnid in [3u64, 5, 9, 12, 20, 21, 22, 30] {
            let pages: Pnl = [txnid as Pgno * 10, txnid as Pgno * 10 + 1].into_iter().collect();
            let mut buf = vec![0u8; Pnl::encoded_len(pages.len())];
            pages.encode_into(&mut buf).unwrap();
            put(&mut w, &mut desc, &db, &txnid.to_le_bytes(), &buf, WriteFlags::empty()).unwrap();
        }
        assert!(desc.height > 1);

        let (txnid, pages) = fetch_record(&w, &desc, 21).unwrap().unwrap();
        assert_eq!(txnid, 20);
        assert_eq!(pages.as_slice(), &[201, 200]);
        assert_eq!(fetch_record(&w, &desc, 100).unwrap().unwrap().0, 30);
        assert_eq!(fetch_record(&w, &desc, 4).unwrap().unwrap().0, 3);
        assert!(fetch_record(&w, &desc, 3).unwrap().is_none());

        let all = list_records(&w, &desc).unwrap();
        assert_eq!(all.len(), 8);
        assert_eq!(all[0], (3, vec![31, 30]));
    }
}
