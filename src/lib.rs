//! # emberdb
//!
//! An embedded, ordered key-value storage engine organized as a
//! log-structured merge tree.
//!
//! Writes land in a write-ahead log and an in-memory skip list; full
//! memtables rotate out and are flushed to immutable sorted tables, which
//! background compactions merge down a small hierarchy of levels. A
//! manifest log records which tables constitute the database at every
//! instant, so an interrupted process recovers to a consistent snapshot.
//!
//! ```text
//!  put/delete ──> WAL ──> memtable ──rotate──> immutable memtable
//!                                                    │ flush
//!                                                    v
//!  get/scan <── memtable + immutable + levels   level 0 (overlapping)
//!                                                    │ compaction
//!                                                    v
//!                                               levels 1..6 (disjoint)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use emberdb::{Db, Options, ReadOptions, WriteOptions};
//!
//! # fn main() -> emberdb::Result<()> {
//! let db = Db::open("./data", Options::default())?;
//! db.put(&WriteOptions::default(), b"key", b"value")?;
//! let value = db.get(&ReadOptions::default(), b"key")?;
//! assert_eq!(value, b"value");
//! # Ok(())
//! # }
//! ```

pub mod batch;
pub mod coding;
pub mod config;
pub mod db;
pub mod error;
pub mod filename;
pub mod filter;
pub mod flock;
pub mod iterator;
pub mod keys;
pub mod memtable;
pub mod sstable;
pub mod table_cache;
pub mod version;
pub mod wal;

pub use batch::WriteBatch;
pub use config::{Options, ReadOptions, WriteOptions};
pub use db::{Db, DbIterator};
pub use error::{Error, Result};
pub use filter::{BloomFilterPolicy, FilterPolicy};
pub use iterator::Iter;
pub use keys::Comparator;
