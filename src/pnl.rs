use crate::error::{Error, Result};
use crate::page::{read_u32, write_u32};
use crate::types::Pgno;

/// Page number list, kept sorted in descending order.
///
/// Encoded in the GC tree as a `u32` count followed by the page numbers,
/// all little-endian. Bytes past the counted entries are padding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Pnl {
    pgnos: Vec<Pgno>,
}

impl Pnl {
    pub fn new() -> Self {
        Pnl { pgnos: Vec::new() }
    }

    /// Builds a list from page numbers in any order.
    pub fn from_unsorted(mut pgnos: Vec<Pgno>) -> Self {
        pgnos.sort_unstable_by(|a, b| b.cmp(a));
        pgnos.dedup();
        Pnl { pgnos }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.pgnos.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.pgnos.is_empty()
    }

    pub fn as_slice(&self) -> &[Pgno] {
        &self.pgnos
    }

    pub fn iter(&self) -> impl Iterator<Item = Pgno> + '_ {
        self.pgnos.iter().copied()
    }

    fn search(&self, pgno: Pgno) -> std::result::Result<usize, usize> {
        self.pgnos.binary_search_by(|probe| pgno.cmp(probe))
    }

    pub fn contains(&self, pgno: Pgno) -> bool {
        self.search(pgno).is_ok()
    }

    /// Inserts a page number; returns false if it was already present.
    pub fn insert(&mut self, pgno: Pgno) -> bool {
        match self.search(pgno) {
            Ok(_) => false,
            Err(pos) => {
                self.pgnos.insert(pos, pgno);
                true
            }
        }
    }

    /// Inserts `count` consecutive page numbers starting at `pgno`.
    pub fn insert_span(&mut self, pgno: Pgno, count: usize) {
        for p in pgno..pgno + count as Pgno {
            self.insert(p);
        }
    }

    pub fn remove(&mut self, pgno: Pgno) -> bool {
        match self.search(pgno) {
            Ok(pos) => {
                self.pgnos.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    /// Merges another list into this one.
    pub fn merge(&mut self, other: &Pnl) {
        if other.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(self.len() + other.len());
        let (mut a, mut b) = (self.pgnos.iter().peekable(), other.pgnos.iter().peekable());
        loop {
            let next = match (a.peek(), b.peek()) {
                (Some(&&x), Some(&&y)) if x > y => a.next(),
                (Some(&&x), Some(&&y)) if x < y => b.next(),
                (Some(_), Some(_)) => {
                    b.next();
                    a.next()
                }
                (Some(_), None) => a.next(),
                (None, Some(_)) => b.next(),
                (None, None) => break,
            };
            if let Some(&p) = next {
                merged.push(p);
            }
        }
        self.pgnos = merged;
    }

    /// Takes the lowest page number.
    pub fn pop_lowest(&mut self) -> Option<Pgno> {
        self.pgnos.pop()
    }

    /// Takes the lowest run of `count` consecutive page numbers, returning
    /// its first page.
    pub fn take_run(&mut self, count: usize) -> Option<Pgno> {
        if count == 0 || self.len() < count {
            return None;
        }
        if count == 1 {
            return self.pop_lowest();
        }
        let span = (count - 1) as Pgno;
        // Descending order: a run p..p+count-1 occupies indices i-count+1..=i
        // with pgnos[i - count + 1] == pgnos[i] + span.
        let mut i = self.len() - 1;
        while i + 1 >= count {
            let start = i + 1 - count;
            if self.pgnos[start] == self.pgnos[i] + span {
                let first = self.pgnos[i];
                self.pgnos.drain(start..=i);
                return Some(first);
            }
            if i == 0 {
                break;
            }
            i -= 1;
        }
        None
    }

    /// Size of the encoded list in bytes.
    pub fn encoded_len(count: usize) -> usize {
        4 * (count + 1)
    }

    /// Writes the list into `buf`, zero-filling the rest.
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < Self::encoded_len(self.len()) {
            return Err(Error::Problem("page list does not fit its reservation"));
        }
        buf.fill(0);
        write_u32(buf, 0, self.len() as u32);
        for (i, p) in self.pgnos.iter().enumerate() {
            write_u32(buf, 4 * (i + 1), *p);
        }
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Pnl> {
        if buf.len() < 4 {
            return Err(Error::Corrupted);
        }
        let count = read_u32(buf, 0) as usize;
        if buf.len() < Self::encoded_len(count) {
            return Err(Error::Corrupted);
        }
        let pgnos: Vec<Pgno> = (0..count).map(|i| read_u32(buf, 4 * (i + 1))).collect();
        if pgnos.windows(2).any(|w| w[0] <= w[1]) {
            return Ok(Pnl::from_unsorted(pgnos));
        }
        Ok(Pnl { pgnos })
    }
}

impl FromIterator<Pgno> for Pnl {
    fn from_iter<I: IntoIterator<Item = Pgno>>(iter: I) -> Self {
        Pnl::from_unsorted(iter.into_iter().collect())
    }
}
