//! Advisory byte-range locks on the database file.
//!
//! Lock classes, by offset:
//!
//! - `GLOBAL_LOCK` (0): held exclusively while a handle opens the file or a
//!   transaction commits, so nobody runs recovery under a live commit.
//! - `ACTIVE_LOCK` (4): shared by every open handle; whoever can take it
//!   exclusively is the only user of the file.
//! - `TRANSACTION_LOCK` (8): serializes transactions across handles.
//! - chain `list` at `FREELIST_TOP + 4 * list`, with list -1 the free list.
//! - whole table: `[FREELIST_TOP, EOF)`, covering every chain and record.
//! - a record's own offset, taken shared by traversals to pin the record.
//!
//! On Linux these are open-file-description locks, so two handles in one
//! process contend exactly like two processes would.

use std::fs::File;
use std::io;
use std::os::unix::io::AsRawFd;
use trivdb_core::{
    Error, LockKind, Result, ACTIVE_LOCK, FREELIST_TOP, GLOBAL_LOCK, OFFSET_SIZE, SEQNUM_OFFSET,
    TRANSACTION_LOCK,
};

/// Chain number of the free list
pub(crate) const FREELIST_CHAIN: i64 = -1;

#[cfg(target_os = "linux")]
const SETLK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(target_os = "linux")]
const SETLKW: libc::c_int = libc::F_OFD_SETLKW;
#[cfg(target_os = "linux")]
const GETLK: libc::c_int = libc::F_OFD_GETLK;

#[cfg(not(target_os = "linux"))]
const SETLK: libc::c_int = libc::F_SETLK;
#[cfg(not(target_os = "linux"))]
const SETLKW: libc::c_int = libc::F_SETLKW;
#[cfg(not(target_os = "linux"))]
const GETLK: libc::c_int = libc::F_GETLK;

fn flock(kind: libc::c_short, offset: u32, len: u32) -> libc::flock {
    // SAFETY: flock is plain old data; all-zero is a valid value
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = kind;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = offset as libc::off_t;
    fl.l_len = len as libc::off_t;
    fl
}

fn fcntl_lock(file: &File, cmd: libc::c_int, fl: &mut libc::flock) -> io::Result<()> {
    loop {
        // SAFETY: fd is owned by `file` and `fl` outlives the call
        let ret = unsafe { libc::fcntl(file.as_raw_fd(), cmd, fl as *mut libc::flock) };
        if ret == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

fn raw_kind(kind: LockKind) -> libc::c_short {
    match kind {
        LockKind::Read => libc::F_RDLCK as libc::c_short,
        LockKind::Write => libc::F_WRLCK as libc::c_short,
    }
}

pub(crate) fn chain_offset(list: i64) -> u32 {
    (i64::from(FREELIST_TOP) + list * i64::from(OFFSET_SIZE)) as u32
}

#[derive(Debug, Clone, Copy)]
struct ChainLock {
    list: i64,
    count: u32,
}

#[derive(Debug, Clone, Copy)]
struct AllRecordLock {
    count: u32,
    kind: LockKind,
    for_transaction: bool,
}

#[derive(Debug, Clone, Copy)]
struct RecordPin {
    off: u32,
    real: bool,
}

/// Per-handle lock bookkeeping on top of the raw fcntl calls
pub(crate) struct Locker {
    /// Duplicate of the database descriptor; `None` disables locking
    file: Option<File>,
    read_only: bool,
    hash_size: u32,
    chains: Vec<ChainLock>,
    allrecord: Option<AllRecordLock>,
    pins: Vec<RecordPin>,
    transaction_count: u32,
    global_count: u32,
    /// Read-only traversals in progress on this handle
    pub read_traversals: u32,
    /// Traversals of any kind in progress on this handle
    pub traversals: u32,
}

impl Locker {
    pub fn new(file: Option<File>, read_only: bool) -> Self {
        Self {
            file,
            read_only,
            hash_size: 0,
            chains: Vec::new(),
            allrecord: None,
            pins: Vec::new(),
            transaction_count: 0,
            global_count: 0,
            read_traversals: 0,
            traversals: 0,
        }
    }

    pub fn set_hash_size(&mut self, hash_size: u32) {
        self.hash_size = hash_size;
    }

    /// Take a raw lock on `[offset, offset + len)`; `len == 0` means to EOF
    pub fn brlock(&self, offset: u32, kind: LockKind, len: u32, blocking: bool) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        if kind == LockKind::Write && (self.read_only || self.read_traversals > 0) {
            return Err(Error::ReadOnly);
        }
        let mut fl = flock(raw_kind(kind), offset, len);
        let cmd = if blocking { SETLKW } else { SETLK };
        match fcntl_lock(file, cmd, &mut fl) {
            Ok(()) => Ok(()),
            Err(e)
                if !blocking
                    && matches!(e.raw_os_error(), Some(libc::EAGAIN) | Some(libc::EACCES)) =>
            {
                Err(Error::NoLock { offset })
            }
            Err(e) => {
                tracing::error!(offset, len, ?kind, error = %e, "brlock failed");
                Err(Error::lock(format!(
                    "{kind:?} lock at offset {offset} len {len} failed: {e}"
                )))
            }
        }
    }

    pub fn brunlock(&self, offset: u32, len: u32) -> Result<()> {
        let Some(file) = &self.file else {
            return Ok(());
        };
        let mut fl = flock(libc::F_UNLCK as libc::c_short, offset, len);
        fcntl_lock(file, SETLK, &mut fl)
            .map_err(|e| Error::lock(format!("unlock at offset {offset} failed: {e}")))
    }

    /// Whether some other handle holds any lock on the byte at `offset`
    fn foreign_lock_at(&self, offset: u32) -> Result<bool> {
        let Some(file) = &self.file else {
            return Ok(false);
        };
        let mut fl = flock(libc::F_WRLCK as libc::c_short, offset, 1);
        fcntl_lock(file, GETLK, &mut fl)
            .map_err(|e| Error::lock(format!("lock probe at offset {offset} failed: {e}")))?;
        Ok(fl.l_type != libc::F_UNLCK as libc::c_short)
    }

    /// A transaction's whole-table lock covers chain writes even while it is
    /// still shared: chain bytes inside it must never be relocked or unlocked.
    fn covered_by_allrecord(&self, kind: LockKind) -> bool {
        self.allrecord.is_some_and(|all| {
            all.for_transaction || all.kind == LockKind::Write || kind == LockKind::Read
        })
    }

    /// Lock hash chain `list` (-1 for the free list). Re-entrant per chain.
    pub fn lock_chain(&mut self, list: i64, kind: LockKind, blocking: bool) -> Result<()> {
        if list < FREELIST_CHAIN || list >= i64::from(self.hash_size) {
            return Err(Error::invalid(format!("chain {list} out of range")));
        }
        if self.covered_by_allrecord(kind) {
            return Ok(());
        }
        if self.allrecord.is_some() {
            return Err(Error::lock(
                "chain write lock requested while holding a whole-table read lock",
            ));
        }
        if kind == LockKind::Write && (self.read_only || self.read_traversals > 0) {
            return Err(Error::ReadOnly);
        }
        if let Some(held) = self.chains.iter_mut().find(|c| c.list == list) {
            held.count += 1;
            return Ok(());
        }
        self.brlock(chain_offset(list), kind, 1, blocking)?;
        self.chains.push(ChainLock { list, count: 1 });
        Ok(())
    }

    pub fn unlock_chain(&mut self, list: i64, kind: LockKind) -> Result<()> {
        if self.covered_by_allrecord(kind) {
            return Ok(());
        }
        let Some(idx) = self.chains.iter().position(|c| c.list == list) else {
            return Err(Error::lock(format!("chain {list} is not locked")));
        };
        self.chains[idx].count -= 1;
        if self.chains[idx].count == 0 {
            self.chains.swap_remove(idx);
            self.brunlock(chain_offset(list), 1)?;
        }
        Ok(())
    }

    /// Lock every chain and record at once
    pub fn lock_all(&mut self, kind: LockKind, blocking: bool, for_transaction: bool) -> Result<()> {
        if let Some(all) = &mut self.allrecord {
            if all.kind == kind && !for_transaction {
                all.count += 1;
                return Ok(());
            }
            return Err(Error::lock("whole-table lock already held in another mode"));
        }
        if !self.chains.is_empty() {
            return Err(Error::lock("whole-table lock requested while holding chain locks"));
        }
        self.brlock(FREELIST_TOP, kind, 0, blocking)?;
        self.allrecord = Some(AllRecordLock {
            count: 1,
            kind,
            for_transaction,
        });
        Ok(())
    }

    pub fn unlock_all(&mut self, kind: LockKind) -> Result<()> {
        let Some(all) = &mut self.allrecord else {
            return Err(Error::lock("whole-table lock is not held"));
        };
        if all.kind != kind && !all.for_transaction {
            return Err(Error::lock("whole-table lock held in another mode"));
        }
        all.count -= 1;
        if all.count == 0 {
            self.allrecord = None;
            self.brunlock(FREELIST_TOP, 0)?;
        }
        Ok(())
    }

    /// Turn the transaction's shared whole-table lock into an exclusive one
    pub fn upgrade_all(&mut self) -> Result<()> {
        let Some(all) = self.allrecord else {
            return Err(Error::lock("no whole-table lock to upgrade"));
        };
        if all.kind == LockKind::Write {
            return Ok(());
        }
        self.brlock(FREELIST_TOP, LockKind::Write, 0, true)?;
        self.allrecord = Some(AllRecordLock {
            kind: LockKind::Write,
            ..all
        });
        Ok(())
    }

    pub fn holds_allrecord(&self) -> bool {
        self.allrecord.is_some()
    }

    /// Any lock a transaction start or reopen must refuse to run under
    pub fn holds_locks(&self) -> bool {
        !self.chains.is_empty() || self.allrecord.is_some() || self.global_count > 0
    }

    /// Pin `off` for a traversal
    pub fn lock_record(&mut self, off: u32) -> Result<()> {
        if off == 0 {
            return Ok(());
        }
        let real = self.allrecord.is_none();
        if real {
            self.brlock(off, LockKind::Read, 1, true)?;
        }
        self.pins.push(RecordPin { off, real });
        Ok(())
    }

    pub fn unlock_record(&mut self, off: u32) -> Result<()> {
        if off == 0 {
            return Ok(());
        }
        let Some(idx) = self.pins.iter().position(|p| p.off == off) else {
            return Err(Error::lock(format!("record {off} is not pinned")));
        };
        let pin = self.pins.swap_remove(idx);
        // another traversal of ours may still hold the same record
        let still_pinned = self.pins.iter().any(|p| p.off == off && p.real);
        if pin.real && !still_pinned {
            self.brunlock(off, 1)?;
        }
        Ok(())
    }

    /// Whether a traversal, ours or another handle's, has `off` pinned.
    /// Callers hold the record's chain lock, so no new pin can appear.
    pub fn record_in_use(&self, off: u32) -> Result<bool> {
        if self.pins.iter().any(|p| p.off == off) {
            return Ok(true);
        }
        if self
            .allrecord
            .is_some_and(|all| all.kind == LockKind::Write)
        {
            return Ok(false);
        }
        self.foreign_lock_at(off)
    }

    pub fn lock_transaction(&mut self) -> Result<()> {
        if self.transaction_count == 0 {
            self.brlock(TRANSACTION_LOCK, LockKind::Write, 1, true)?;
        }
        self.transaction_count += 1;
        Ok(())
    }

    pub fn unlock_transaction(&mut self) -> Result<()> {
        match self.transaction_count {
            0 => Err(Error::lock("transaction lock is not held")),
            1 => {
                self.transaction_count = 0;
                self.brunlock(TRANSACTION_LOCK, 1)
            }
            _ => {
                self.transaction_count -= 1;
                Ok(())
            }
        }
    }

    pub fn lock_global(&mut self, kind: LockKind) -> Result<()> {
        if self.global_count == 0 {
            self.brlock(GLOBAL_LOCK, kind, 1, true)?;
        }
        self.global_count += 1;
        Ok(())
    }

    pub fn unlock_global(&mut self) -> Result<()> {
        match self.global_count {
            0 => Err(Error::lock("global lock is not held")),
            1 => {
                self.global_count = 0;
                self.brunlock(GLOBAL_LOCK, 1)
            }
            _ => {
                self.global_count -= 1;
                Ok(())
            }
        }
    }

    pub fn holds_global(&self) -> bool {
        self.global_count > 0
    }

    /// Try to become the only user of the file
    pub fn try_active_exclusive(&self) -> bool {
        self.file.is_some()
            && self
                .brlock(ACTIVE_LOCK, LockKind::Write, 1, false)
                .is_ok()
    }

    /// Mark this handle as a live user of the file
    pub fn hold_active(&self) -> Result<()> {
        self.brlock(ACTIVE_LOCK, LockKind::Read, 1, true)
    }

    pub fn lock_seqnum(&self) -> Result<()> {
        self.brlock(SEQNUM_OFFSET, LockKind::Write, 1, true)
    }

    pub fn unlock_seqnum(&self) -> Result<()> {
        self.brunlock(SEQNUM_OFFSET, 1)
    }

    /// Drop every chain lock, e.g. ones a cancelled transaction left behind
    pub fn release_chains(&mut self) -> Result<()> {
        let mut result = Ok(());
        for chain in std::mem::take(&mut self.chains) {
            if let Err(e) = self.brunlock(chain_offset(chain.list), 1) {
                result = Err(e);
            }
        }
        result
    }

    /// Release the transaction's whole-table lock regardless of nesting
    pub fn release_transaction_allrecord(&mut self) -> Result<()> {
        match self.allrecord {
            Some(all) if all.for_transaction => {
                self.allrecord = None;
                self.brunlock(FREELIST_TOP, 0)
            }
            _ => Ok(()),
        }
    }

    /// Release everything; used when the handle goes away
    pub fn release_all(&mut self) -> Result<()> {
        let mut result = self.release_chains();
        let pins: Vec<u32> = self.pins.iter().filter(|p| p.real).map(|p| p.off).collect();
        self.pins.clear();
        for off in pins {
            if let Err(e) = self.brunlock(off, 1) {
                result = Err(e);
            }
        }
        if self.allrecord.take().is_some() {
            if let Err(e) = self.brunlock(FREELIST_TOP, 0) {
                result = Err(e);
            }
        }
        if self.transaction_count > 0 {
            self.transaction_count = 0;
            if let Err(e) = self.brunlock(TRANSACTION_LOCK, 1) {
                result = Err(e);
            }
        }
        if self.global_count > 0 {
            self.global_count = 0;
            if let Err(e) = self.brunlock(GLOBAL_LOCK, 1) {
                result = Err(e);
            }
        }
        result
    }
}
