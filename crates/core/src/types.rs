use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::{ACTIVE_MAGIC, DEAD_MAGIC, FREE_MAGIC};
use crate::errors::{Error, Result};

/// A position inside the database file. Zero is the null link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Offset(u32);

impl Offset {
    pub const NULL: Offset = Offset(0);

    #[must_use]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Advance by `len` bytes, failing instead of wrapping past 4 GiB
    pub fn checked_add(self, len: u32) -> Result<Offset> {
        self.0
            .checked_add(len)
            .map(Offset)
            .ok_or_else(|| Error::corrupt(format!("offset {} + {} overflows", self.0, len)))
    }
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    /// Behaviour flags fixed when a handle is opened
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Flags: u32 {
        /// Re-create the database if no other handle has it open
        const CLEAR_IF_FIRST = 1;
        /// Keep the database in process memory only
        const INTERNAL = 2;
        /// Skip all byte-range locking
        const NOLOCK = 4;
        /// Use positioned reads and writes instead of a mapping
        const NOMMAP = 8;
        /// Create the file in the opposite byte order
        const CONVERT = 16;
        /// Skip every durable flush, including the recovery record
        const NOSYNC = 64;
        /// Bump the header sequence number on every mutation
        const SEQNUM = 128;
    }
}

/// How `store` treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreMode {
    /// Fail with `Exists` if the key is present
    Insert,
    /// Overwrite or create
    Replace,
    /// Overwrite, failing with `NotFound` if the key is absent
    Modify,
}

/// Read or write byte-range lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Read,
    Write,
}

/// Severity handed to a caller-supplied log callback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    Fatal,
    Error,
    Warning,
    Trace,
}

/// State tag of a record on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Active,
    Free,
    Tombstone,
}

impl RecordState {
    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            ACTIVE_MAGIC => Some(RecordState::Active),
            FREE_MAGIC => Some(RecordState::Free),
            DEAD_MAGIC => Some(RecordState::Tombstone),
            _ => None,
        }
    }
}

/// Key hash function
pub type HashFn = fn(&[u8]) -> u32;

/// The default key hash: a shift-and-add mix finished with an LCG step
pub fn default_hash(key: &[u8]) -> u32 {
    let mut value = 0x238F_13AFu32.wrapping_mul(key.len() as u32);
    for (i, &byte) in key.iter().enumerate() {
        let shift = (i as u32).wrapping_mul(5) % 24;
        value = value.wrapping_add(u32::from(byte) << shift);
    }
    1_103_515_243u32.wrapping_mul(value).wrapping_add(12345)
}
