use rustc_hash::FxHashMap;

use crate::types::Pgno;

/// Pages copied or allocated by a write transaction, keyed by page number.
///
/// A large value chain is one entry keyed by its first page and spanning
/// several pages of buffer.
#[derive(Debug, Default)]
pub(crate) struct DirtyPages {
    pages: FxHashMap<Pgno, Box<[u8]>>,
}

impl DirtyPages {
    pub(crate) fn new() -> Self {
        DirtyPages {
            pages: FxHashMap::default(),
        }
    }

    #[inline]
    pub(crate) fn get(&self, pgno: Pgno) -> Option<&[u8]> {
        self.pages.get(&pgno).map(|b| &b[..])
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, pgno: Pgno) -> Option<&mut [u8]> {
        self.pages.get_mut(&pgno).map(|b| &mut b[..])
    }

    #[inline]
    pub(crate) fn contains(&self, pgno: Pgno) -> bool {
        self.pages.contains_key(&pgno)
    }

    pub(crate) fn insert(&mut self, pgno: Pgno, page: Box<[u8]>) {
        self.pages.insert(pgno, page);
    }

    pub(crate) fn remove(&mut self, pgno: Pgno) -> Option<Box<[u8]>> {
        self.pages.remove(&pgno)
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.pages.len()
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub(crate) fn pgnos(&self) -> Vec<Pgno> {
        let mut pgnos: Vec<Pgno> = self.pages.keys().copied().collect();
        pgnos.sort_unstable();
        pgnos
    }

    /// Moves every page of `child` over this set, replacing older copies.
    pub(crate) fn absorb(&mut self, child: DirtyPages) {
        self.pages.extend(child.pages);
    }

    /// Pages in ascending page order, for writing out.
    pub(crate) fn into_sorted(self) -> Vec<(Pgno, Box<[u8]>)> {
        let mut pages: Vec<(Pgno, Box<[u8]>)> = self.pages.into_iter().collect();
        pages.sort_unstable_by_key(|(pgno, _)| *pgno);
        pages
    }
}
