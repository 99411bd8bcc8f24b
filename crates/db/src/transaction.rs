//! Nestable transactions with a two-phase commit.
//!
//! While a transaction is open every write lands in an in-memory overlay
//! and the handle holds the transaction lock plus a shared lock over the
//! whole table, so readers elsewhere keep seeing the committed state.
//! Preparing upgrades that lock, saves the bytes about to be overwritten in
//! the recovery area and arms it; committing then writes the overlay out
//! and disarms the recovery record.

use crate::database::Tdb;
use crate::io::StorageIo;
use crate::layout::encode_u32;
use trivdb_core::{
    Error, Flags, LockKind, Result, FREELIST_TOP, OFFSET_SIZE, RECOVERY_INVALID_MAGIC,
};

/// Book-keeping for the open transaction of a handle
#[derive(Debug)]
pub(crate) struct TransactionState {
    /// Inner `transaction_start` calls not yet matched by commit or cancel
    nesting: u32,
    /// Set by an inner cancel; the outermost commit must then fail
    error: bool,
    prepared: bool,
    /// Magic word of the armed recovery record, cleared after apply
    magic_offset: Option<u32>,
    /// File size when the transaction began
    old_size: u32,
}

fn cancelled_error(operation: &'static str) -> Error {
    Error::io(
        operation,
        std::io::Error::other("transaction cancelled by a nested cancel"),
    )
}

impl Tdb {
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    /// Begin a transaction, or nest inside the one already open
    pub fn transaction_start(&mut self) -> Result<()> {
        let result = self.transaction_start_inner();
        self.finish(result)
    }

    fn transaction_start_inner(&mut self) -> Result<()> {
        if self.read_only || self.locks.read_traversals > 0 {
            return Err(Error::invalid("transactions need a writable handle"));
        }
        if self.flags.contains(Flags::INTERNAL) {
            return Err(Error::invalid(
                "transactions are not supported on in-memory databases",
            ));
        }
        if let Some(tx) = &mut self.transaction {
            if tx.prepared {
                return Err(Error::invalid("transaction already prepared"));
            }
            tx.nesting += 1;
            tracing::trace!(nesting = tx.nesting, "nested transaction start");
            return Ok(());
        }
        if self.locks.holds_locks() {
            return Err(Error::lock("cannot start a transaction with locks held"));
        }
        if self.locks.traversals > 0 {
            return Err(Error::lock("cannot start a transaction within a traverse"));
        }

        self.locks.lock_transaction()?;
        if let Err(e) = self.locks.lock_all(LockKind::Read, true, true) {
            self.locks.unlock_transaction()?;
            return Err(e);
        }
        // pick up growth by other handles before taking the snapshot
        let size = self.map_size();
        let _ = self.io().oob(u64::from(size) + 1, true);

        let heads = match self.read_heads() {
            Ok(heads) => heads,
            Err(e) => {
                self.locks.release_transaction_allrecord()?;
                self.locks.unlock_transaction()?;
                return Err(e);
            }
        };
        let old_size = self.map_size();
        self.backend.begin_shadow(heads);
        self.transaction = Some(TransactionState {
            nesting: 0,
            error: false,
            prepared: false,
            magic_offset: None,
            old_size,
        });
        tracing::debug!(size = old_size, "transaction started");
        Ok(())
    }

    /// Raw free-list and bucket head words
    fn read_heads(&mut self) -> Result<Vec<u32>> {
        let words = self.hash_size + 1;
        let bytes = self.read_bytes(FREELIST_TOP, words * OFFSET_SIZE)?;
        Ok(bytes
            .chunks_exact(4)
            .map(|word| u32::from_ne_bytes([word[0], word[1], word[2], word[3]]))
            .collect())
    }

    /// Run the first commit phase: lock out readers and arm the recovery
    /// record. A later `transaction_commit` only has to write.
    pub fn transaction_prepare_commit(&mut self) -> Result<()> {
        let result = self.transaction_prepare_inner();
        self.finish(result)
    }

    fn transaction_prepare_inner(&mut self) -> Result<()> {
        let Some(tx) = &self.transaction else {
            return Err(Error::invalid("no transaction to prepare"));
        };
        if tx.prepared {
            return Err(Error::invalid("transaction already prepared"));
        }
        if tx.error {
            self.cancel_logged();
            return Err(cancelled_error("prepare transaction"));
        }
        if tx.nesting > 0 {
            return Ok(());
        }
        if let Err(e) = self.prepare_locked() {
            self.cancel_logged();
            return Err(e);
        }
        Ok(())
    }

    fn prepare_locked(&mut self) -> Result<()> {
        let has_writes = self
            .backend
            .shadow_ref()
            .is_some_and(|shadow| shadow.has_writes());
        let mut magic_offset = None;
        if has_writes {
            self.locks.upgrade_all()?;
            self.locks.lock_global(LockKind::Write)?;
            if !self.flags.contains(Flags::NOSYNC) {
                let old_size = self.transaction.as_ref().map_or(0, |tx| tx.old_size);
                magic_offset = Some(self.setup_recovery(old_size)?);
            }
        }
        if let Some(tx) = &mut self.transaction {
            tx.prepared = true;
            tx.magic_offset = magic_offset;
        }
        Ok(())
    }

    /// Commit the outermost transaction; an inner commit only unnests
    pub fn transaction_commit(&mut self) -> Result<()> {
        let result = self.transaction_commit_inner();
        self.finish(result)
    }

    fn transaction_commit_inner(&mut self) -> Result<()> {
        let Some(tx) = &mut self.transaction else {
            return Err(Error::invalid("no transaction to commit"));
        };
        if tx.error {
            self.cancel_logged();
            return Err(cancelled_error("commit transaction"));
        }
        if tx.nesting > 0 {
            tx.nesting -= 1;
            return Ok(());
        }
        let prepared = tx.prepared;
        let has_writes = self
            .backend
            .shadow_ref()
            .is_some_and(|shadow| shadow.has_writes());
        if !has_writes {
            return self.cancel_transaction();
        }
        if !prepared {
            if let Err(e) = self.prepare_locked() {
                self.cancel_logged();
                return Err(e);
            }
        }
        if let Err(e) = self.apply_transaction() {
            self.logger
                .error(format!("commit failed, rolling back: {e}"));
            self.cancel_logged();
            return Err(e);
        }
        if let Some(tx) = &mut self.transaction {
            tx.magic_offset = None;
        }
        tracing::debug!("transaction committed");
        self.cancel_transaction()
    }

    /// Write the overlay to the real file and disarm the recovery record
    fn apply_transaction(&mut self) -> Result<()> {
        let nosync = self.flags.contains(Flags::NOSYNC);
        let convert = self.convert;
        let magic_offset = self.transaction.as_ref().and_then(|tx| tx.magic_offset);
        let Some(shadow) = self.backend.shadow() else {
            return Err(Error::invalid("no transaction to commit"));
        };
        let logical = shadow.size();
        let base_size = shadow.base().size();
        if logical > base_size {
            shadow.base().expand_file(base_size, logical - base_size)?;
        }
        shadow.apply()?;
        if !nosync {
            shadow.base().sync(0, logical)?;
        }
        if let Some(magic) = magic_offset {
            let base = shadow.base();
            base.write(magic, &encode_u32(RECOVERY_INVALID_MAGIC, convert))?;
            if !nosync {
                base.sync(magic, OFFSET_SIZE)?;
            }
        }
        Ok(())
    }

    /// Abandon the transaction. Inside a nested transaction this only
    /// marks the outer one as failed.
    pub fn transaction_cancel(&mut self) -> Result<()> {
        let result = self.transaction_cancel_inner();
        self.finish(result)
    }

    fn transaction_cancel_inner(&mut self) -> Result<()> {
        let Some(tx) = &mut self.transaction else {
            return Err(Error::invalid("no transaction to cancel"));
        };
        if tx.nesting > 0 {
            tx.error = true;
            tx.nesting -= 1;
            return Ok(());
        }
        self.cancel_transaction()
    }

    fn cancel_logged(&mut self) {
        if let Err(e) = self.cancel_transaction() {
            self.logger
                .error(format!("failed to cancel transaction: {e}"));
        }
    }

    /// Tear the transaction down, rolling the file back first if phase one
    /// already armed a recovery record
    pub(crate) fn cancel_transaction(&mut self) -> Result<()> {
        let Some(tx) = self.transaction.take() else {
            return Ok(());
        };
        drop(self.backend.end_shadow());

        let mut result = Ok(());
        if tx.magic_offset.is_some() {
            if let Err(e) = self.replay_recovery() {
                self.logger
                    .error(format!("failed to roll back prepared transaction: {e}"));
                result = Err(e);
            }
        }
        // locks taken inside the transaction go with it
        for released in [
            self.locks.release_chains(),
            if self.locks.holds_global() {
                self.locks.unlock_global()
            } else {
                Ok(())
            },
            self.locks.release_transaction_allrecord(),
            self.locks.unlock_transaction(),
        ] {
            result = result.and(released);
        }
        result
    }

    /// Prepare, then write only the first `blocks` extents and drop the
    /// handle as a crashed process would
    #[cfg(test)]
    pub(crate) fn crash_during_commit(mut self, blocks: usize) -> Result<()> {
        self.transaction_prepare_inner()?;
        let Some(shadow) = self.backend.shadow() else {
            return Err(Error::invalid("no transaction"));
        };
        let logical = shadow.size();
        let base_size = shadow.base().size();
        if logical > base_size {
            shadow.base().expand_file(base_size, logical - base_size)?;
        }
        shadow.fail_after(blocks);
        // a partial apply is the point
        let _ = shadow.apply();
        self.abandon();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TdbConfig;
    use crate::database::Tdb;
    use tempfile::TempDir;
    use trivdb_core::{ErrorCode, Flags, StoreMode, RECOVERY_HEAD};

    fn config() -> TdbConfig {
        TdbConfig::builder().with_hash_size(7).build()
    }

    fn seeded(dir: &TempDir, name: &str) -> (std::path::PathBuf, Tdb) {
        let path = dir.path().join(name);
        let mut tdb = Tdb::open(&path, &config()).unwrap();
        tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
        tdb.store(b"b", b"2", StoreMode::Insert).unwrap();
        (path, tdb)
    }

    #[test]
    fn test_commit_makes_writes_visible() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "commit.tdb");
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"one", StoreMode::Replace).unwrap();
        tdb.delete(b"b").unwrap();
        tdb.store(b"c", b"3", StoreMode::Insert).unwrap();
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"one"[..]));
        tdb.transaction_commit().unwrap();
        assert!(!tdb.in_transaction());
        drop(tdb);

        let mut tdb = Tdb::open(&path, &config()).unwrap();
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"one"[..]));
        assert!(!tdb.exists(b"b").unwrap());
        assert_eq!(tdb.fetch(b"c").unwrap().as_deref(), Some(&b"3"[..]));
        tdb.check(None).unwrap();
    }

    #[test]
    fn test_cancel_discards_writes() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tdb) = seeded(&dir, "cancel.tdb");
        let size = tdb.map_size();
        tdb.transaction_start().unwrap();
        tdb.store(b"big", &vec![7u8; 50_000], StoreMode::Insert).unwrap();
        tdb.delete(b"a").unwrap();
        tdb.transaction_cancel().unwrap();
        assert_eq!(tdb.map_size(), size);
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert!(!tdb.exists(b"big").unwrap());
        tdb.check(None).unwrap();
    }

    #[test]
    fn test_nested_cancel_fails_outer_commit() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tdb) = seeded(&dir, "nested.tdb");
        tdb.transaction_start().unwrap();
        tdb.store(b"x", b"1", StoreMode::Insert).unwrap();
        tdb.transaction_start().unwrap();
        tdb.store(b"y", b"2", StoreMode::Insert).unwrap();
        tdb.transaction_cancel().unwrap();
        assert!(tdb.in_transaction());

        let err = tdb.transaction_commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(!tdb.in_transaction());
        assert!(!tdb.exists(b"x").unwrap());
        assert!(!tdb.exists(b"y").unwrap());
    }

    #[test]
    fn test_nested_commit_defers_to_outer() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tdb) = seeded(&dir, "nested_commit.tdb");
        tdb.transaction_start().unwrap();
        tdb.transaction_start().unwrap();
        tdb.store(b"x", b"1", StoreMode::Insert).unwrap();
        tdb.transaction_commit().unwrap();
        assert!(tdb.in_transaction());
        tdb.transaction_commit().unwrap();
        assert!(!tdb.in_transaction());
        assert!(tdb.exists(b"x").unwrap());
    }

    #[test]
    fn test_cancel_after_prepare_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "prepared.tdb");
        let before = std::fs::read(&path).unwrap();
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"changed", StoreMode::Replace).unwrap();
        tdb.store(b"big", &vec![1u8; 20_000], StoreMode::Insert).unwrap();
        tdb.transaction_prepare_commit().unwrap();
        tdb.transaction_cancel().unwrap();
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert!(!tdb.exists(b"big").unwrap());
        tdb.check(None).unwrap();
        drop(tdb);
        let after = std::fs::read(&path).unwrap();
        assert_eq!(after.len(), before.len());
    }

    #[test]
    fn test_start_refuses_held_locks_and_read_only() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "refuse.tdb");
        tdb.chain_lock(b"a").unwrap();
        assert!(tdb.transaction_start().unwrap_err().is_lock_error());
        tdb.chain_unlock(b"a").unwrap();
        drop(tdb);

        let mut ro = Tdb::open(&path, &TdbConfig::builder().read_only(true).build()).unwrap();
        assert_eq!(
            ro.transaction_start().unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
    }

    #[test]
    fn test_commit_without_transaction_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tdb) = seeded(&dir, "none.tdb");
        assert_eq!(
            tdb.transaction_commit().unwrap_err().code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(tdb.last_error(), ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_crash_mid_commit_is_undone_on_open() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "crash.tdb");
        let before = std::fs::metadata(&path).unwrap().len();
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"changed", StoreMode::Replace).unwrap();
        tdb.store(b"c", &vec![3u8; 9000], StoreMode::Insert).unwrap();
        tdb.crash_during_commit(1).unwrap();

        let mut tdb = Tdb::open(&path, &config()).unwrap();
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert_eq!(tdb.fetch(b"b").unwrap().as_deref(), Some(&b"2"[..]));
        assert!(!tdb.exists(b"c").unwrap());
        assert_eq!(u64::from(tdb.map_size()), before);
        tdb.check(None).unwrap();
    }

    #[test]
    fn test_failed_apply_rolls_back_before_reporting() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "torn.tdb");
        let before = std::fs::read(&path).unwrap();
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"changed", StoreMode::Replace).unwrap();
        tdb.store(b"c", &vec![3u8; 9000], StoreMode::Insert).unwrap();
        tdb.transaction_prepare_commit().unwrap();
        assert!(tdb.recovery_pending().unwrap());
        tdb.backend.shadow().unwrap().fail_after(1);

        let err = tdb.transaction_commit().unwrap_err();
        assert_eq!(err.code(), ErrorCode::Io);
        assert!(!tdb.in_transaction());
        assert!(!tdb.recovery_pending().unwrap());
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"1"[..]));
        assert!(!tdb.exists(b"c").unwrap());
        tdb.check(None).unwrap();
        drop(tdb);
        assert_eq!(std::fs::read(&path).unwrap(), before);
    }

    #[test]
    fn test_recovery_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (path, mut tdb) = seeded(&dir, "twice.tdb");
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"changed", StoreMode::Replace).unwrap();
        tdb.delete(b"b").unwrap();
        tdb.crash_during_commit(usize::MAX).unwrap();

        let copy = dir.path().join("twice-copy.tdb");
        std::fs::copy(&path, &copy).unwrap();

        drop(Tdb::open(&path, &config()).unwrap());
        let mut tdb = Tdb::open(&copy, &config()).unwrap();
        tdb.recover().unwrap();
        drop(tdb);

        assert_eq!(std::fs::read(&path).unwrap(), std::fs::read(&copy).unwrap());
        let mut tdb = Tdb::open(&copy, &config()).unwrap();
        assert_eq!(tdb.fetch(b"b").unwrap().as_deref(), Some(&b"2"[..]));
    }

    #[test]
    fn test_nosync_commit_skips_recovery_area() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nosync.tdb");
        let config = TdbConfig::builder()
            .with_hash_size(7)
            .with_flags(Flags::NOSYNC)
            .build();
        let mut tdb = Tdb::open(&path, &config).unwrap();
        tdb.transaction_start().unwrap();
        tdb.store(b"k", b"v", StoreMode::Insert).unwrap();
        tdb.transaction_commit().unwrap();
        assert_eq!(tdb.fetch(b"k").unwrap().as_deref(), Some(&b"v"[..]));
        assert_eq!(tdb.word_read(RECOVERY_HEAD).unwrap(), 0);
    }

    #[test]
    fn test_recovery_area_is_reused() {
        let dir = TempDir::new().unwrap();
        let (_path, mut tdb) = seeded(&dir, "reuse.tdb");
        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"x", StoreMode::Replace).unwrap();
        tdb.transaction_commit().unwrap();
        let head = tdb.word_read(RECOVERY_HEAD).unwrap();
        assert_ne!(head, 0);
        let size = tdb.map_size();

        tdb.transaction_start().unwrap();
        tdb.store(b"a", b"y", StoreMode::Replace).unwrap();
        tdb.transaction_commit().unwrap();
        assert_eq!(tdb.word_read(RECOVERY_HEAD).unwrap(), head);
        assert_eq!(tdb.map_size(), size);
        tdb.check(None).unwrap();
    }
}
