/// Page number within the data file
pub type Pgno = u32;

/// Transaction identifier
pub type Txnid = u64;

/// Size limits of the data file, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    /// Minimum file size
    pub size_lower: usize,
    /// Initial file size
    pub size_now: usize,
    /// Maximum file size; also the length of the memory map
    pub size_upper: usize,
    /// Growth step when the file has to be extended
    pub growth_step: usize,
}

impl Default for Geometry {
    fn default() -> Self {
        Geometry {
            size_lower: 0,
            size_now: 0,
            size_upper: crate::constants::DEFAULT_SIZE_UPPER,
            growth_step: crate::constants::DEFAULT_GROWTH_STEP,
        }
    }
}

/// Database statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    /// Size of a database page
    pub page_size: u32,
    /// Depth (height) of the B-tree
    pub depth: u32,
    /// Number of internal (non-leaf) pages
    pub branch_pages: usize,
    /// Number of leaf pages
    pub leaf_pages: usize,
    /// Number of overflow pages
    pub overflow_pages: usize,
    /// Number of data entries
    pub entries: usize,
}

/// Environment information
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvInfo {
    pub map_size: usize,
    pub file_size: usize,
    pub last_pgno: Pgno,
    pub last_txnid: Txnid,
    pub max_readers: u32,
    pub num_readers: u32,
    /// Meta slot currently holding the latest committed state
    pub head_slot: usize,
}

/// One registered reader, as listed by `Environment::reader_list`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    pub slot: usize,
    pub pid: u32,
    pub tid: u64,
    pub txnid: Txnid,
}
