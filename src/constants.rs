use bitflags::bitflags;
use lazy_static::lazy_static;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        const NOSUBDIR = 0x4000;
        const NOSYNC = 0x10000;
        const RDONLY = 0x20000;
        const NOMETASYNC = 0x40000;
        const WRITEMAP = 0x80000;
    }
}

// Database flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DbFlags: u32 {
        const REVERSEKEY = 0x02;
        const DUPSORT = 0x04;
        const INTEGERKEY = 0x08;
        const INTEGERDUP = 0x20;
        const REVERSEDUP = 0x40;
        const CREATE = 0x40000;
    }
}

// Write operation flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WriteFlags: u32 {
        const NOOVERWRITE = 0x10;
        const NODUPDATA = 0x20;
        const CURRENT = 0x40;
        const ALLDUPS = 0x80;
        const APPEND = 0x20000;
        const APPENDDUP = 0x40000;
    }
}

// Node flags, stored in the 5th byte of the node header
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct NodeFlags: u8 {
        const BIG = 0x01;
        const TREE = 0x02;
        const DUP = 0x04;
    }
}

// Page flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PageFlags: u16 {
        const BRANCH = 0x01;
        const LEAF = 0x02;
        const LARGE = 0x04;
        const META = 0x08;
        const DUPFIX = 0x20;
        const SUBP = 0x40;
    }
}

lazy_static! {
    /// Flags that may be toggled on an open environment.
    pub(crate) static ref CHANGEABLE: EnvFlags = EnvFlags::NOSYNC | EnvFlags::NOMETASYNC;
}

/// Flags persisted in a tree descriptor.
pub(crate) const PERSISTENT_DB_FLAGS: u32 = DbFlags::REVERSEKEY.bits()
    | DbFlags::DUPSORT.bits()
    | DbFlags::INTEGERKEY.bits()
    | DbFlags::INTEGERDUP.bits()
    | DbFlags::REVERSEDUP.bits();

/// Size of the fixed page header.
pub const PAGE_HEADER_SIZE: usize = 20;
/// Size of the fixed node header.
pub const NODE_HEADER_SIZE: usize = 8;
/// Size of an encoded tree descriptor.
pub const TREE_SIZE: usize = 48;
/// Size of the meta body that follows the page header.
pub const META_SIZE: usize = 224;

pub const MIN_PAGE_SIZE: usize = 256;
pub const MAX_PAGE_SIZE: usize = 65536;
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Number of rotating meta pages at the head of the data file.
pub const NUM_METAS: usize = 3;

/// Magic number of the data file format
pub const MDBX_MAGIC: u64 = 0x0059_659D_BDEF_4C11;
/// On-disk data format version
pub const DATA_VERSION: u8 = 3;
/// Lock file format version
pub const LOCK_VERSION: u8 = 6;
pub const MAGIC_AND_VERSION: u64 = MDBX_MAGIC << 8 | DATA_VERSION as u64;
pub const LOCK_MAGIC_AND_VERSION: u64 = MDBX_MAGIC << 8 | LOCK_VERSION as u64;

/// Meta signature values; anything above `DATASIGN_WEAK` is a steady (synced) meta.
pub const DATASIGN_NONE: u64 = 0;
pub const DATASIGN_WEAK: u64 = 1;
pub const DATASIGN_STEADY: u64 = !DATASIGN_NONE;

/// Core database identifiers
pub const FREE_DBI: u32 = 0;
pub const MAIN_DBI: u32 = 1;
pub const CORE_DBS: u32 = 2;

pub const MIN_TXNID: u64 = 1;
/// Root page number of an empty tree
pub const P_INVALID: u32 = u32::MAX;

pub const DEFAULT_MAX_READERS: u32 = 126;
pub const DEFAULT_MAX_DBS: u32 = 16;
pub const DEFAULT_SIZE_UPPER: usize = 256 << 20;
pub const DEFAULT_GROWTH_STEP: usize = 1 << 20;

pub const DATA_FILENAME: &str = "mdbx.dat";
pub const LOCK_FILENAME: &str = "mdbx.lck";
pub const LOCK_SUFFIX: &str = "-lck";

/// Upper bound on reserve/fill rounds when writing the GC record at commit.
pub(crate) const GC_UPDATE_ROUNDS: usize = 16;
