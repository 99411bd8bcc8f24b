//! A trivial key/value database engine.
//!
//! One file holds a fixed header, a table of hash-chain heads and a heap of
//! variable-length records. Any number of handles, in this process or
//! others, share the file and coordinate through byte-range locks.
//!
//! - **Data**: [`Tdb::fetch`], [`Tdb::store`], [`Tdb::delete`],
//!   [`Tdb::append`] and friends.
//! - **Iteration**: [`Tdb::traverse`], [`Tdb::traverse_read`] and the
//!   [`Tdb::first_key`] / [`Tdb::next_key`] cursor.
//! - **Transactions**: nestable, with a two-phase commit that survives a
//!   crash at any point via the recovery area.
//! - **Maintenance**: [`Tdb::check`], [`Tdb::wipe_all`], [`Tdb::summary`].
//!
//! ```no_run
//! use trivdb::{StoreMode, TdbConfig};
//!
//! let mut db = TdbConfig::builder().with_hash_size(1031).build().open("cache.tdb")?;
//! db.store(b"greeting", b"hello", StoreMode::Replace)?;
//! assert_eq!(db.fetch(b"greeting")?.as_deref(), Some(&b"hello"[..]));
//! # Ok::<(), trivdb::Error>(())
//! ```

mod chain;
mod check;
mod config;
mod database;
mod freelist;
mod io;
mod layout;
mod lock;
mod log;
mod recovery;
mod registry;
mod summary;
mod transaction;
mod traverse;

pub use check::CheckVisitor;
pub use config::{LogFn, TdbConfig, TdbConfigBuilder};
pub use database::Tdb;
pub use registry::{FileIdentity, HandleRegistry};
pub use summary::{ChainStats, Summary};
pub use trivdb_core::{
    default_hash, Error, ErrorCode, Flags, HashFn, LockKind, LogLevel, Result, StoreMode,
    DEFAULT_HASH_SIZE, TRIVDB_LOG_VAR,
};
