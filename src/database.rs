use parking_lot::RwLock;

use crate::comparator::{cmp_integer, cmp_lexical, default_dup_cmp, default_key_cmp, Comparator};
use crate::constants::{DbFlags, WriteFlags, CORE_DBS, FREE_DBI, MAIN_DBI};
use crate::cursor::{RoCursor, RwCursor};
use crate::env::Environment;
use crate::error::{Error, Result};
use crate::transaction::{RwTransaction, Transaction};
use crate::tree::DbCtx;
use crate::types::Stat;

/// Database handle
///
/// A plain index into the environment's table of opened databases. It stays
/// valid across transactions until the database is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Database {
    dbi: u32,
}

impl Database {
    pub(crate) fn new(dbi: u32) -> Self {
        Database { dbi }
    }

    /// Index of the database in the environment
    pub fn dbi(&self) -> u32 {
        self.dbi
    }

    /// Open an existing database; `None` is the main database
    pub fn open<T: Transaction>(txn: &T, name: Option<&str>) -> Result<Self> {
        txn.open_db(name)
    }

    /// Open a database, creating it if needed
    pub fn create(txn: &mut RwTransaction<'_>, name: Option<&str>, flags: DbFlags) -> Result<Self> {
        txn.create_db(name, flags)
    }

    /// Get database statistics
    pub fn stat<T: Transaction>(&self, txn: &T) -> Result<Stat> {
        txn.stat(*self)
    }

    /// Get database flags
    pub fn flags<T: Transaction>(&self, txn: &T) -> Result<DbFlags> {
        txn.db_flags(*self)
    }

    /// Empty the database; with `delete` remove it from the environment too
    pub fn drop(&self, txn: &mut RwTransaction<'_>, delete: bool) -> Result<()> {
        txn.drop_db(*self, delete)
    }

    /// Get a value by key
    pub fn get<'t, T: Transaction>(&self, txn: &'t T, key: &[u8]) -> Result<Option<&'t [u8]>> {
        txn.get(*self, key)
    }

    /// Put a key/value pair
    pub fn put(&self, txn: &mut RwTransaction<'_>, key: &[u8], data: &[u8], flags: WriteFlags) -> Result<()> {
        txn.put(*self, key, data, flags)
    }

    /// Delete a key, or one duplicate of it
    pub fn del(&self, txn: &mut RwTransaction<'_>, key: &[u8], data: Option<&[u8]>) -> Result<()> {
        txn.del(*self, key, data)
    }

    /// Create a read cursor for this database
    pub fn cursor<'t, T: Transaction>(&self, txn: &'t T) -> Result<RoCursor<'t>> {
        txn.open_ro_cursor(*self)
    }

    /// Create a write cursor for this database
    pub fn rw_cursor<'t, 'env>(&self, txn: &'t mut RwTransaction<'env>) -> Result<RwCursor<'t, 'env>> {
        txn.open_rw_cursor(*self)
    }

    /// Set custom key comparison function
    pub fn set_compare(&self, env: &Environment, cmp: Comparator) -> Result<()> {
        env.set_compare(*self, cmp)
    }

    /// Set custom duplicate data comparison function
    pub fn set_dupsort(&self, env: &Environment, cmp: Comparator) -> Result<()> {
        env.set_dupsort(*self, cmp)
    }
}

/// Environment-side state of an opened database.
#[derive(Clone)]
struct DbDesc {
    name: Option<String>,
    flags: DbFlags,
    cmp: Comparator,
    dcmp: Comparator,
    custom_cmp: bool,
    custom_dcmp: bool,
}

impl DbDesc {
    fn new(name: Option<String>, flags: DbFlags) -> Self {
        DbDesc {
            name,
            flags,
            cmp: default_key_cmp(flags),
            dcmp: default_dup_cmp(flags),
            custom_cmp: false,
            custom_dcmp: false,
        }
    }

    fn set_flags(&mut self, flags: DbFlags) {
        self.flags = flags;
        if !self.custom_cmp {
            self.cmp = default_key_cmp(flags);
        }
        if !self.custom_dcmp {
            self.dcmp = default_dup_cmp(flags);
        }
    }
}

/// Table of databases opened in an environment, shared by all its
/// transactions. Slots are never reused, so a handle of a deleted database
/// stays stale.
pub(crate) struct DbRegistry {
    dbs: RwLock<Vec<DbDesc>>,
    max_dbs: u32,
}

impl DbRegistry {
    pub(crate) fn new(main_flags: DbFlags, max_dbs: u32) -> Self {
        let mut gc = DbDesc::new(None, DbFlags::INTEGERKEY);
        gc.cmp = cmp_integer;
        gc.dcmp = cmp_lexical;
        DbRegistry {
            dbs: RwLock::new(vec![gc, DbDesc::new(None, main_flags)]),
            max_dbs,
        }
    }

    pub(crate) fn ctx(&self, dbi: u32) -> Result<DbCtx> {
        let dbs = self.dbs.read();
        let desc = dbs.get(dbi as usize).ok_or(Error::BadDbi)?;
        Ok(DbCtx::new(desc.flags, desc.cmp, desc.dcmp))
    }

    pub(crate) fn name(&self, dbi: u32) -> Result<String> {
        let dbs = self.dbs.read();
        dbs.get(dbi as usize)
            .and_then(|desc| desc.name.clone())
            .ok_or(Error::BadDbi)
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<u32> {
        self.dbs
            .read()
            .iter()
            .position(|desc| desc.name.as_deref() == Some(name))
            .map(|i| i as u32)
    }

    /// Index of `name`, adding it when new.
    pub(crate) fn register(&self, name: &str, flags: DbFlags) -> Result<u32> {
        let mut dbs = self.dbs.write();
        if let Some(i) = dbs.iter().position(|desc| desc.name.as_deref() == Some(name)) {
            if dbs[i].flags != flags {
                dbs[i].set_flags(flags);
            }
            return Ok(i as u32);
        }
        if dbs.len() >= (self.max_dbs + CORE_DBS) as usize {
            return Err(Error::DbsFull);
        }
        dbs.push(DbDesc::new(Some(name.to_owned()), flags));
        Ok(dbs.len() as u32 - 1)
    }

    pub(crate) fn set_flags(&self, dbi: u32, flags: DbFlags) -> Result<()> {
        let mut dbs = self.dbs.write();
        dbs.get_mut(dbi as usize).ok_or(Error::BadDbi)?.set_flags(flags);
        Ok(())
    }

    pub(crate) fn set_compare(&self, dbi: u32, cmp: Comparator) -> Result<()> {
        if dbi == FREE_DBI {
            return Err(Error::BadDbi);
        }
        let mut dbs = self.dbs.write();
        let desc = dbs.get_mut(dbi as usize).ok_or(Error::BadDbi)?;
        desc.cmp = cmp;
        desc.custom_cmp = true;
        Ok(())
    }

    pub(crate) fn set_dup_compare(&self, dbi: u32, cmp: Comparator) -> Result<()> {
        if dbi == FREE_DBI {
            return Err(Error::BadDbi);
        }
        let mut dbs = self.dbs.write();
        let desc = dbs.get_mut(dbi as usize).ok_or(Error::BadDbi)?;
        if dbi != MAIN_DBI && !desc.flags.contains(DbFlags::DUPSORT) {
            return Err(Error::Incompatible);
        }
        desc.dcmp = cmp;
        desc.custom_dcmp = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comparator::cmp_reverse;

    #[test]
    fn registry_hands_out_stable_indices() {
        let reg = DbRegistry::new(DbFlags::empty(), 2);
        assert_eq!(reg.register("a", DbFlags::empty()).unwrap(), 2);
        assert_eq!(reg.register("b", DbFlags::DUPSORT).unwrap(), 3);
        assert_eq!(reg.register("a", DbFlags::empty()).unwrap(), 2);
        assert!(matches!(reg.register("c", DbFlags::empty()), Err(Error::DbsFull)));
        assert_eq!(reg.lookup("b"), Some(3));
        assert_eq!(reg.name(3).unwrap(), "b");
        assert!(matches!(reg.name(MAIN_DBI), Err(Error::BadDbi)));
        assert!(reg.ctx(3).unwrap().is_dupsort());
        assert!(matches!(reg.ctx(9), Err(Error::BadDbi)));
    }

    #[test]
    fn custom_comparators_survive_flag_changes() {
        let reg = DbRegistry::new(DbFlags::empty(), 4);
        let dbi = reg.register("r", DbFlags::DUPSORT).unwrap();
        reg.set_compare(dbi, cmp_reverse).unwrap();
        reg.set_flags(dbi, DbFlags::DUPSORT | DbFlags::INTEGERDUP).unwrap();
        let ctx = reg.ctx(dbi).unwrap();
        assert_eq!((ctx.cmp)(b"ab", b"ba"), cmp_reverse(b"ab", b"ba"));
        assert_eq!((ctx.dcmp)(&2u32.to_le_bytes(), &256u32.to_le_bytes()), std::cmp::Ordering::Less);

        let plain = reg.register("p", DbFlags::empty()).unwrap();
        assert!(matches!(reg.set_dup_compare(plain, cmp_reverse), Err(Error::Incompatible)));
    }
}
