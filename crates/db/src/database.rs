//! The database handle and its open / reopen / close lifecycle.

use crate::config::TdbConfig;
use crate::io::{Backend, DirectIo, StorageIo};
use crate::layout::{data_start, decode_u32, encode_u32, Header, RecordHeader};
use crate::lock::Locker;
use crate::log::Logger;
use crate::registry::{FileIdentity, HandleRegistry, Registration};
use crate::transaction::TransactionState;
use crate::traverse::TraverseLock;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use trivdb_core::{
    default_hash, Error, ErrorCode, Flags, HashFn, LockKind, Offset, RecordState, Result,
    ALIGNMENT, DEFAULT_HASH_SIZE, DEFAULT_PAGE_SIZE, HASH_CHECK_1, HASH_CHECK_2, HEADER_SIZE,
    MAX_HASH_SIZE, OFFSET_SIZE, RECORD_HEADER_SIZE,
};

/// An open database.
///
/// A handle is used from one thread at a time; separate handles (in this or
/// other processes) coordinate through byte-range locks on the file.
pub struct Tdb {
    pub(crate) name: Option<PathBuf>,
    pub(crate) backend: Backend,
    pub(crate) locks: Locker,
    pub(crate) hash_size: u32,
    pub(crate) flags: Flags,
    pub(crate) read_only: bool,
    pub(crate) convert: bool,
    pub(crate) max_dead: u32,
    pub(crate) page_size: u32,
    pub(crate) hash_fn: HashFn,
    pub(crate) logger: Logger,
    pub(crate) transaction: Option<TransactionState>,
    pub(crate) cursor: Option<TraverseLock>,
    identity: Option<FileIdentity>,
    registration: Option<Registration>,
    last_error: ErrorCode,
    closed: bool,
}

impl std::fmt::Debug for Tdb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tdb")
            .field("name", &self.name)
            .field("hash_size", &self.hash_size)
            .field("flags", &self.flags)
            .field("read_only", &self.read_only)
            .field("map_size", &self.map_size())
            .field("in_transaction", &self.transaction.is_some())
            .finish()
    }
}

/// Fingerprint of `hash_fn` stored in the header; never both zero
pub(crate) fn hash_fingerprint(hash_fn: HashFn) -> (u32, u32) {
    let (first, second) = (hash_fn(HASH_CHECK_1), hash_fn(HASH_CHECK_2));
    if first == 0 && second == 0 {
        (1, 0)
    } else {
        (first, second)
    }
}

/// Header followed by an empty free list and empty buckets
fn new_database_image(hash_size: u32, convert: bool, hash_fn: HashFn) -> Vec<u8> {
    let (magic1, magic2) = hash_fingerprint(hash_fn);
    let mut image = Header::new(hash_size, magic1, magic2).encode(convert);
    image.resize(data_start(hash_size) as usize, 0);
    image
}

fn read_header(io: &mut DirectIo) -> Result<(Header, bool)> {
    let mut bytes = vec![0u8; HEADER_SIZE as usize];
    io.read(0, &mut bytes)?;
    Header::decode(&bytes)
}

fn system_page_size() -> u32 {
    // SAFETY: sysconf has no preconditions
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u32::try_from(size)
        .ok()
        .filter(|size| size.is_power_of_two())
        .unwrap_or(DEFAULT_PAGE_SIZE)
}

impl Tdb {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>, config: &TdbConfig) -> Result<Tdb> {
        Self::open_with(Some(path.as_ref()), config, None)
    }

    /// Open through `registry`, refusing a second handle on the same file
    pub fn open_in(
        path: impl AsRef<Path>,
        config: &TdbConfig,
        registry: &HandleRegistry,
    ) -> Result<Tdb> {
        Self::open_with(Some(path.as_ref()), config, Some(registry))
    }

    /// A database living only in this process's memory
    pub fn open_memory(config: &TdbConfig) -> Result<Tdb> {
        Self::open_with(None, config, None)
    }

    fn open_with(
        path: Option<&Path>,
        config: &TdbConfig,
        registry: Option<&HandleRegistry>,
    ) -> Result<Tdb> {
        let hash_size = match config.hash_size {
            0 => DEFAULT_HASH_SIZE,
            n if n > MAX_HASH_SIZE => {
                return Err(Error::invalid(format!("hash size {n} too large")));
            }
            n => n,
        };
        let page_size = match config.page_size {
            None => system_page_size(),
            Some(size) if size.is_power_of_two() && size >= ALIGNMENT => size,
            Some(size) => {
                return Err(Error::invalid(format!("page size {size} is not a power of two")));
            }
        };
        let mut flags = config.flags;
        let path = match path {
            Some(path) if !flags.contains(Flags::INTERNAL) => path,
            _ => {
                flags |= Flags::INTERNAL | Flags::NOLOCK | Flags::NOMMAP;
                return Self::open_internal(path, config, flags, hash_size, page_size);
            }
        };

        let read_only = config.read_only;
        if read_only && flags.contains(Flags::CLEAR_IF_FIRST) {
            return Err(Error::invalid("cannot clear a database opened read-only"));
        }
        let logger = Logger::new(config.logger.clone(), path.display().to_string());

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(config.create && !read_only)
            .truncate(config.truncate && !read_only)
            .mode(config.mode)
            .open(path)
            .map_err(|e| Error::io("open database", e))?;
        let identity = FileIdentity::from(
            &file
                .metadata()
                .map_err(|e| Error::io("stat database", e))?,
        );
        let registration = registry
            .map(|registry| registry.register(identity, path))
            .transpose()?;

        let lock_file = if flags.contains(Flags::NOLOCK) {
            None
        } else {
            Some(
                file.try_clone()
                    .map_err(|e| Error::io("duplicate descriptor", e))?,
            )
        };
        let mut locks = Locker::new(lock_file, read_only);
        // keeps recovery and creation away from other openers
        locks.lock_global(if read_only { LockKind::Read } else { LockKind::Write })?;

        let cleared = !read_only
            && flags.contains(Flags::CLEAR_IF_FIRST)
            && locks.try_active_exclusive();
        let mut io = DirectIo::open_file(file, read_only, !flags.contains(Flags::NOMMAP))?;
        if cleared {
            tracing::debug!(path = %path.display(), "first opener, clearing database");
            io.truncate(0)?;
        }

        let (header, convert) = match read_header(&mut io) {
            Ok(found) => found,
            Err(e) if read_only || !(config.create || cleared) => {
                logger.error(format!("not a database file: {e}"));
                return Err(e);
            }
            Err(_) => {
                let image = new_database_image(
                    hash_size,
                    flags.contains(Flags::CONVERT),
                    config.hash_fn,
                );
                io.truncate(0)?;
                io.expand_file(0, image.len() as u32)?;
                io.write(0, &image)?;
                if !flags.contains(Flags::NOSYNC) {
                    io.sync(0, image.len() as u32)?;
                }
                tracing::debug!(path = %path.display(), hash_size, "created database");
                read_header(&mut io)?
            }
        };

        if header.rwlocks != 0 {
            return Err(Error::invalid("spinlock databases are not supported"));
        }
        let expected = hash_fingerprint(config.hash_fn);
        let matches = if header.magic1_hash == 0 && header.magic2_hash == 0 {
            // older files carry no fingerprint and always used the default hash
            expected == hash_fingerprint(default_hash)
        } else {
            (header.magic1_hash, header.magic2_hash) == expected
        };
        if !matches {
            logger.error("database was created with a different hash function");
            return Err(Error::invalid("wrong hash function"));
        }
        if header.hash_size == 0
            || header.hash_size > MAX_HASH_SIZE
            || data_start(header.hash_size) > io.size()
        {
            return Err(Error::corrupt(format!(
                "hash size {} does not fit a {} byte file",
                header.hash_size,
                io.size()
            )));
        }
        locks.set_hash_size(header.hash_size);
        locks.hold_active()?;

        let mut tdb = Tdb {
            name: Some(path.to_path_buf()),
            backend: Backend::Direct(io),
            locks,
            hash_size: header.hash_size,
            flags,
            read_only,
            convert,
            max_dead: config.max_dead_records,
            page_size,
            hash_fn: config.hash_fn,
            logger,
            transaction: None,
            cursor: None,
            identity: Some(identity),
            registration,
            last_error: ErrorCode::Success,
            closed: false,
        };

        // a commit that died half way leaves a live recovery record behind
        if tdb.recovery_pending()? {
            if read_only {
                tdb.logger.error("attempt to recover a read-only database");
                return Err(Error::corrupt("database needs recovery but is read-only"));
            }
            tdb.replay_recovery()?;
        }
        tdb.locks.unlock_global()?;
        Ok(tdb)
    }

    fn open_internal(
        path: Option<&Path>,
        config: &TdbConfig,
        flags: Flags,
        hash_size: u32,
        page_size: u32,
    ) -> Result<Tdb> {
        let convert = flags.contains(Flags::CONVERT);
        let image = new_database_image(hash_size, convert, config.hash_fn);
        let mut locks = Locker::new(None, false);
        locks.set_hash_size(hash_size);
        let label = path.map_or_else(|| "<memory>".to_string(), |p| p.display().to_string());
        Ok(Tdb {
            name: path.map(Path::to_path_buf),
            backend: Backend::Direct(DirectIo::memory(image)?),
            locks,
            hash_size,
            flags,
            read_only: false,
            convert,
            max_dead: config.max_dead_records,
            page_size,
            hash_fn: config.hash_fn,
            logger: Logger::new(config.logger.clone(), label),
            transaction: None,
            cursor: None,
            identity: None,
            registration: None,
            last_error: ErrorCode::Success,
            closed: false,
        })
    }

    /// Drop and re-acquire the descriptor, mapping and locks, e.g. in a
    /// child after `fork`
    pub fn reopen(&mut self) -> Result<()> {
        let result = self.reopen_inner();
        self.finish(result)
    }

    fn reopen_inner(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::invalid("reopen inside a transaction"));
        }
        if self.locks.holds_locks() || self.locks.traversals > 0 {
            return Err(Error::lock("reopen with locks held"));
        }
        if self.flags.contains(Flags::INTERNAL) {
            return Ok(());
        }
        let Some(path) = self.name.clone() else {
            return Err(Error::invalid("database has no file to reopen"));
        };
        self.release_cursor()?;

        // the old descriptor goes first, taking its locks with it
        self.backend = Backend::Direct(DirectIo::detached());
        self.locks = Locker::new(None, self.read_only);

        let file = OpenOptions::new()
            .read(true)
            .write(!self.read_only)
            .open(&path)
            .map_err(|e| Error::io("reopen database", e))?;
        let identity = FileIdentity::from(
            &file
                .metadata()
                .map_err(|e| Error::io("stat database", e))?,
        );
        if self.identity != Some(identity) {
            self.logger.error("file dev/inode has changed");
            return Err(Error::io(
                "reopen database",
                std::io::Error::other(format!("{} was replaced", path.display())),
            ));
        }
        let lock_file = if self.flags.contains(Flags::NOLOCK) {
            None
        } else {
            Some(
                file.try_clone()
                    .map_err(|e| Error::io("duplicate descriptor", e))?,
            )
        };
        let mut locks = Locker::new(lock_file, self.read_only);
        locks.set_hash_size(self.hash_size);
        locks.hold_active()?;
        let io = DirectIo::open_file(file, self.read_only, !self.flags.contains(Flags::NOMMAP))?;
        self.backend = Backend::Direct(io);
        self.locks = locks;
        Ok(())
    }

    /// Close the handle, cancelling any open transaction
    pub fn close(mut self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        if self.transaction.is_some() {
            result = self.cancel_transaction();
        }
        self.cursor = None;
        if let Err(e) = self.locks.release_all() {
            result = result.and(Err(e));
        }
        self.backend = Backend::Direct(DirectIo::detached());
        self.locks = Locker::new(None, true);
        drop(self.registration.take());
        result
    }

    /// Drop the descriptor without cancelling or cleaning anything, as if
    /// the process had died at this point
    #[cfg(test)]
    pub(crate) fn abandon(mut self) {
        self.transaction = None;
        self.closed = true;
    }

    pub fn name(&self) -> Option<&Path> {
        self.name.as_deref()
    }

    pub fn hash_size(&self) -> u32 {
        self.hash_size
    }

    /// Current logical size of the database in bytes
    pub fn map_size(&self) -> u32 {
        self.backend.io_ref().size()
    }

    pub fn flags(&self) -> Flags {
        self.flags
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_mapped(&self) -> bool {
        self.backend.base_ref().is_mapped()
    }

    /// Let each chain keep up to `max_dead` tombstones before deletes purge it
    pub fn set_max_dead(&mut self, max_dead: u32) {
        self.max_dead = max_dead;
    }

    /// Code of the most recent failed public operation
    pub fn last_error(&self) -> ErrorCode {
        self.last_error
    }

    pub(crate) fn finish<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.last_error = e.code();
        }
        result
    }

    pub(crate) fn io(&mut self) -> &mut dyn StorageIo {
        self.backend.io()
    }

    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.read_only || self.locks.read_traversals > 0 {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }

    pub(crate) fn hash(&self, key: &[u8]) -> u32 {
        (self.hash_fn)(key)
    }

    pub(crate) fn bucket(&self, hash: u32) -> u32 {
        hash % self.hash_size
    }

    pub(crate) fn word_read(&mut self, off: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.io().read(off, &mut word)?;
        Ok(decode_u32(&word, self.convert))
    }

    pub(crate) fn word_write(&mut self, off: u32, value: u32) -> Result<()> {
        let word = encode_u32(value, self.convert);
        self.io().write(off, &word)
    }

    pub(crate) fn ofs_read(&mut self, off: u32) -> Result<Offset> {
        self.word_read(off).map(Offset::new)
    }

    pub(crate) fn ofs_write(&mut self, off: u32, value: Offset) -> Result<()> {
        self.word_write(off, value.get())
    }

    /// Read a record header without judging its tag
    pub(crate) fn rec_read_raw(&mut self, off: Offset) -> Result<RecordHeader> {
        let mut bytes = [0u8; RecordHeader::SIZE];
        self.io().read(off.get(), &mut bytes)?;
        Ok(RecordHeader::decode(&bytes, self.convert))
    }

    /// Read the header of a record reached through a hash chain
    pub(crate) fn rec_read(&mut self, off: Offset) -> Result<RecordHeader> {
        let rec = self.rec_read_raw(off)?;
        if !matches!(
            rec.state(),
            Some(RecordState::Active) | Some(RecordState::Tombstone)
        ) {
            self.logger
                .error(format!("bad magic {:#x} at offset {off}", rec.magic));
            return Err(Error::corrupt(format!(
                "bad record magic {:#x} at offset {off}",
                rec.magic
            )));
        }
        self.io()
            .oob(u64::from(rec.next.get()) + u64::from(RECORD_HEADER_SIZE), false)?;
        Ok(rec)
    }

    pub(crate) fn rec_write(&mut self, off: Offset, rec: &RecordHeader) -> Result<()> {
        let bytes = rec.encode(self.convert);
        self.io().write(off.get(), &bytes)
    }

    /// Store the record's total size in its last word
    pub(crate) fn update_tailer(&mut self, off: Offset, rec: &RecordHeader) -> Result<()> {
        let at = off
            .checked_add(rec.total_size())?
            .get()
            .checked_sub(OFFSET_SIZE)
            .ok_or_else(|| Error::corrupt(format!("record at {off} has no room for a tailer")))?;
        self.word_write(at, rec.tailer())
    }

    pub(crate) fn read_bytes(&mut self, off: u32, len: u32) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len as usize)
            .map_err(|_| Error::OutOfMemory {
                requested: len as usize,
            })?;
        buf.resize(len as usize, 0);
        self.io().read(off, &mut buf)?;
        Ok(buf)
    }
}

impl Drop for Tdb {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!(error = %e, "error while closing database");
        }
    }
}
