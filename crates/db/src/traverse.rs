//! Whole-database iteration.
//!
//! A traversal holds one chain lock at a time and pins the record it is
//! positioned on with a shared record lock, so the callback may run with no
//! chain locked and still find its way to the next record afterwards.
//! Deleting a pinned record only tombstones it.

use crate::database::Tdb;
use crate::layout::{bucket_top, RecordHeader};
use std::ops::ControlFlow;
use trivdb_core::{Error, LockKind, Offset, Result, RECORD_HEADER_SIZE};

/// Position of a traversal: the pinned record, if any, and its bucket
#[derive(Debug, Clone, Copy)]
pub(crate) struct TraverseLock {
    pub off: Offset,
    pub bucket: u32,
    pub kind: LockKind,
}

impl TraverseLock {
    fn start(kind: LockKind) -> Self {
        Self {
            off: Offset::NULL,
            bucket: 0,
            kind,
        }
    }
}

impl Tdb {
    /// Move `tl` to the next live record. On `Some` the chain `tl.bucket` is
    /// locked and `tl.off` pinned; on `None` or error nothing is held.
    fn next_lock(&mut self, tl: &mut TraverseLock) -> Result<Option<RecordHeader>> {
        let hash_size = self.hash_size;
        while tl.bucket < hash_size {
            if tl.off.is_null() {
                // skip runs of empty chains without locking them
                let next = self.io().next_hash_chain(tl.bucket, hash_size)?;
                if next >= hash_size {
                    break;
                }
                tl.bucket = next;
            }
            self.locks.lock_chain(i64::from(tl.bucket), tl.kind, true)?;
            match self.scan_chain(tl) {
                Ok(Some(rec)) => return Ok(Some(rec)),
                Ok(None) => {
                    self.locks.unlock_chain(i64::from(tl.bucket), tl.kind)?;
                    tl.bucket += 1;
                }
                Err(e) => {
                    if let Err(unlock) = self.locks.unlock_chain(i64::from(tl.bucket), tl.kind) {
                        tracing::warn!(error = %unlock, "unlock after failed traversal step");
                    }
                    return Err(e);
                }
            }
        }
        Ok(None)
    }

    /// With the chain locked, step from the pinned record (or the chain head)
    /// to the next live record and pin it
    fn scan_chain(&mut self, tl: &mut TraverseLock) -> Result<Option<RecordHeader>> {
        let mut off = if tl.off.is_null() {
            self.ofs_read(bucket_top(tl.bucket))?
        } else {
            let current = tl.off;
            tl.off = Offset::NULL;
            let rec = self.rec_read(current);
            // the chain lock protects our position from here on
            self.locks.unlock_record(current.get())?;
            let rec = rec?;
            if tl.kind == LockKind::Write && rec.is_dead() {
                self.do_delete(current, rec)?;
            }
            rec.next
        };

        let limit = self.walk_limit();
        let mut steps = 0u64;
        while !off.is_null() {
            let rec = self.rec_read(off)?;
            let next = rec.next;
            if !rec.is_dead() {
                self.locks.lock_record(off.get())?;
                tl.off = off;
                return Ok(Some(rec));
            }
            if tl.kind == LockKind::Write {
                // tidy up tombstones on the way past
                self.do_delete(off, rec)?;
            }
            off = next;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!(
                    "hash chain {} contains a loop",
                    tl.bucket
                )));
            }
        }
        Ok(None)
    }

    fn traverse_internal<F>(&mut self, kind: LockKind, mut f: F) -> Result<usize>
    where
        F: FnMut(&mut Tdb, &[u8], &[u8]) -> ControlFlow<()>,
    {
        let mut tl = TraverseLock::start(kind);
        let mut count = 0usize;
        self.locks.traversals += 1;
        let result = loop {
            let rec = match self.next_lock(&mut tl) {
                Ok(Some(rec)) => rec,
                Ok(None) => break Ok(count),
                Err(e) => break Err(e),
            };
            count += 1;
            let payload = tl
                .off
                .checked_add(RECORD_HEADER_SIZE)
                .and_then(|at| self.read_bytes(at.get(), rec.payload_len()));
            // the callback runs with no chain locked
            let unlocked = self.locks.unlock_chain(i64::from(tl.bucket), kind);
            let payload = match payload.and_then(|p| unlocked.map(|()| p)) {
                Ok(payload) => payload,
                Err(e) => break Err(e),
            };
            let (key, data) = payload.split_at(rec.key_len as usize);
            if f(self, key, data).is_break() {
                break Ok(count);
            }
        };
        self.locks.traversals -= 1;
        let released = self.locks.unlock_record(tl.off.get());
        let count = result?;
        released?;
        Ok(count)
    }

    /// Visit every record. The callback may modify the database, including
    /// deleting the record it was handed; returning `Break` stops early.
    /// Returns the number of records visited.
    pub fn traverse<F>(&mut self, f: F) -> Result<usize>
    where
        F: FnMut(&mut Tdb, &[u8], &[u8]) -> ControlFlow<()>,
    {
        let kind = if self.read_only || self.locks.read_traversals > 0 {
            LockKind::Read
        } else {
            LockKind::Write
        };
        let result = self.traverse_internal(kind, f);
        self.finish(result)
    }

    /// Visit every record with shared locks only; the handle refuses writes
    /// until the traversal ends
    pub fn traverse_read<F>(&mut self, f: F) -> Result<usize>
    where
        F: FnMut(&mut Tdb, &[u8], &[u8]) -> ControlFlow<()>,
    {
        self.locks.read_traversals += 1;
        let result = self.traverse_internal(LockKind::Read, f);
        self.locks.read_traversals -= 1;
        self.finish(result)
    }

    /// Number of live records
    pub fn count(&mut self) -> Result<usize> {
        self.traverse_read(|_, _, _| ControlFlow::Continue(()))
    }

    pub(crate) fn release_cursor(&mut self) -> Result<()> {
        match self.cursor.take() {
            Some(tl) => self.locks.unlock_record(tl.off.get()),
            None => Ok(()),
        }
    }

    /// Read the key at the freshly locked position and drop the chain lock
    fn cursor_key(&mut self, tl: TraverseLock, rec: &RecordHeader) -> Result<Vec<u8>> {
        let key = tl
            .off
            .checked_add(RECORD_HEADER_SIZE)
            .and_then(|at| self.read_bytes(at.get(), rec.key_len));
        let unlocked = self.locks.unlock_chain(i64::from(tl.bucket), tl.kind);
        match key.and_then(|key| unlocked.map(|()| key)) {
            Ok(key) => {
                self.cursor = Some(tl);
                Ok(key)
            }
            Err(e) => {
                self.locks.unlock_record(tl.off.get())?;
                Err(e)
            }
        }
    }

    /// First key of an iteration in storage order
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        let result = self.first_key_inner();
        self.finish(result)
    }

    fn first_key_inner(&mut self) -> Result<Option<Vec<u8>>> {
        self.release_cursor()?;
        let mut tl = TraverseLock::start(LockKind::Read);
        match self.next_lock(&mut tl)? {
            Some(rec) => self.cursor_key(tl, &rec).map(Some),
            None => Ok(None),
        }
    }

    /// Key following `previous`. Fails with `NotFound` if `previous` has
    /// since been deleted and the cursor lost its place.
    pub fn next_key(&mut self, previous: &[u8]) -> Result<Option<Vec<u8>>> {
        let result = self.next_key_inner(previous);
        self.finish(result)
    }

    fn next_key_inner(&mut self, previous: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut tl = self
            .cursor
            .take()
            .unwrap_or_else(|| TraverseLock::start(LockKind::Read));

        // is the cursor still sitting on `previous`?
        if !tl.off.is_null() {
            let on_previous = self.with_chain(tl.bucket, LockKind::Read, |db| {
                let rec = db.rec_read(tl.off)?;
                Ok(!rec.is_dead()
                    && rec.key_len as usize == previous.len()
                    && db.key_matches(tl.off, previous)?)
            });
            if !matches!(on_previous, Ok(true)) {
                self.locks.unlock_record(tl.off.get())?;
                tl.off = Offset::NULL;
                on_previous?;
            }
        }

        if tl.off.is_null() {
            let hash = self.hash(previous);
            let bucket = self.bucket(hash);
            let found = self.with_chain(bucket, LockKind::Read, |db| {
                let found = db.find(previous, hash)?;
                if let Some((off, _)) = found {
                    db.locks.lock_record(off.get())?;
                }
                Ok(found)
            })?;
            let Some((off, _)) = found else {
                return Err(Error::NotFound);
            };
            tl = TraverseLock {
                off,
                bucket,
                kind: LockKind::Read,
            };
        }

        match self.next_lock(&mut tl)? {
            Some(rec) => self.cursor_key(tl, &rec).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TdbConfig;
    use crate::database::Tdb;
    use std::collections::BTreeSet;
    use std::ops::ControlFlow;
    use trivdb_core::{Error, StoreMode};

    fn filled(n: u32) -> Tdb {
        let mut tdb = TdbConfig::builder()
            .with_hash_size(5)
            .build()
            .open_memory()
            .unwrap();
        for i in 0..n {
            tdb.store(format!("key{i}").as_bytes(), format!("v{i}").as_bytes(), StoreMode::Insert)
                .unwrap();
        }
        tdb
    }

    #[test]
    fn test_traverse_visits_every_record_once() {
        let mut tdb = filled(40);
        let mut seen = BTreeSet::new();
        let count = tdb
            .traverse_read(|_, key, value| {
                let key = String::from_utf8(key.to_vec()).unwrap();
                assert_eq!(value, format!("v{}", &key[3..]).as_bytes());
                assert!(seen.insert(key));
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(count, 40);
        assert_eq!(seen.len(), 40);
    }

    #[test]
    fn test_break_stops_early() {
        let mut tdb = filled(10);
        let count = tdb.traverse(|_, _, _| ControlFlow::Break(())).unwrap();
        assert_eq!(count, 1);
        // nothing left pinned: a delete frees for real
        tdb.delete(b"key3").unwrap();
        assert_eq!(tdb.count().unwrap(), 9);
    }

    #[test]
    fn test_delete_everything_from_inside_traverse() {
        let mut tdb = filled(30);
        let count = tdb
            .traverse(|db, key, _| {
                db.delete(key).unwrap();
                ControlFlow::Continue(())
            })
            .unwrap();
        assert_eq!(count, 30);
        assert_eq!(tdb.count().unwrap(), 0);
        tdb.check(None).unwrap();
    }

    #[test]
    fn test_traverse_read_refuses_writes() {
        let mut tdb = filled(3);
        tdb.traverse_read(|db, key, _| {
            assert!(matches!(db.delete(key), Err(Error::ReadOnly)));
            assert!(matches!(
                db.store(b"new", b"x", StoreMode::Insert),
                Err(Error::ReadOnly)
            ));
            ControlFlow::Continue(())
        })
        .unwrap();
        tdb.store(b"new", b"x", StoreMode::Insert).unwrap();
    }

    #[test]
    fn test_first_and_next_key_walk_all_keys() {
        let mut tdb = filled(25);
        let mut keys = BTreeSet::new();
        let mut key = tdb.first_key().unwrap();
        while let Some(k) = key {
            assert!(keys.insert(k.clone()));
            key = tdb.next_key(&k).unwrap();
        }
        assert_eq!(keys.len(), 25);
        assert!(keys.contains(&b"key24".to_vec()));
    }

    #[test]
    fn test_next_key_recovers_position_by_lookup() {
        let mut tdb = filled(5);
        let first = tdb.first_key().unwrap().unwrap();
        // a fresh cursor finds its place from the key alone
        tdb.release_cursor().unwrap();
        let second = tdb.next_key(&first).unwrap();
        assert!(second.is_some());
        assert_ne!(second.unwrap(), first);
        assert!(matches!(tdb.next_key(b"absent"), Err(Error::NotFound)));
    }

    #[test]
    fn test_empty_database() {
        let mut tdb = filled(0);
        assert_eq!(tdb.first_key().unwrap(), None);
        assert_eq!(tdb.count().unwrap(), 0);
    }
}
