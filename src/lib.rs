//! Embedded transactional key-value store using the MDBX data file format.
//!
//! One writer and any number of readers share a memory-mapped copy-on-write
//! B+tree. Readers see the snapshot that was committed when they began.

mod comparator;
pub mod constants;
mod cursor;
mod database;
mod dirty;
mod env;
mod error;
mod gc;
mod lock;
mod meta;
pub mod page;
mod pnl;
mod reader;
mod store;
mod transaction;
mod tree;
mod types;

pub use comparator::{cmp_integer, cmp_lexical, cmp_reverse, Comparator};
pub use constants::{DbFlags, EnvFlags, WriteFlags};
pub use cursor::{Iter, Pair, RoCursor, RwCursor};
pub use database::Database;
pub use env::{Environment, EnvironmentBuilder};
pub use error::{Error, Result};
pub use meta::{Meta, MetaGeometry, TreeDesc};
pub use pnl::Pnl;
pub use transaction::{RoTransaction, RwTransaction, Transaction};
pub use types::{EnvInfo, Geometry, Pgno, ReaderInfo, Stat, Txnid};
