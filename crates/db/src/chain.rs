//! Hash-chain record operations.
//!
//! A key hashes to one bucket; its record lives somewhere in that bucket's
//! singly linked chain. Every operation runs under the bucket's chain lock.

use crate::database::Tdb;
use crate::layout::{bucket_top, RecordHeader};
use trivdb_core::{
    Error, Flags, LockKind, Offset, Result, StoreMode, ACTIVE_MAGIC, DEAD_MAGIC,
    RECORD_HEADER_SIZE, SEQNUM_OFFSET,
};

/// Keys longer than this are compared in pieces when no mapping is present
const COMPARE_CHUNK: usize = 256;

/// Outcome of trying to overwrite a value inside its existing record
enum InPlace {
    Updated,
    TooSmall,
    Missing,
}

impl Tdb {
    /// Run `f` holding the chain lock of `bucket`, releasing it on every path
    pub(crate) fn with_chain<T>(
        &mut self,
        bucket: u32,
        kind: LockKind,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.locks.lock_chain(i64::from(bucket), kind, true)?;
        let result = f(self);
        let unlocked = self.locks.unlock_chain(i64::from(bucket), kind);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Walk the chain `hash` selects looking for a live record holding `key`.
    /// The caller holds the chain lock.
    pub(crate) fn find(&mut self, key: &[u8], hash: u32) -> Result<Option<(Offset, RecordHeader)>> {
        let limit = self.walk_limit();
        let mut rec_ptr = self.ofs_read(bucket_top(self.bucket(hash)))?;
        let mut steps = 0u64;
        while !rec_ptr.is_null() {
            let rec = self.rec_read(rec_ptr)?;
            if !rec.is_dead()
                && rec.full_hash == hash
                && rec.key_len as usize == key.len()
                && self.key_matches(rec_ptr, key)?
            {
                return Ok(Some((rec_ptr, rec)));
            }
            rec_ptr = rec.next;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!(
                    "hash chain {} contains a loop",
                    self.bucket(hash)
                )));
            }
        }
        Ok(None)
    }

    /// Compare the stored key at `rec_ptr` against `key` without reading the
    /// whole key into memory
    pub(crate) fn key_matches(&mut self, rec_ptr: Offset, key: &[u8]) -> Result<bool> {
        let start = rec_ptr.checked_add(RECORD_HEADER_SIZE)?.get();
        if let Some(stored) = self.backend.io_ref().view(start, key.len() as u32) {
            return Ok(stored == key);
        }
        let mut buf = [0u8; COMPARE_CHUNK];
        for (i, piece) in key.chunks(COMPARE_CHUNK).enumerate() {
            let at = start + (i * COMPARE_CHUNK) as u32;
            let buf = &mut buf[..piece.len()];
            self.io().read(at, buf)?;
            if buf != piece {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Value stored under `key`, if any
    pub fn fetch(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let result = match self.parse_record_inner(key, <[u8]>::to_vec) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        };
        self.finish(result)
    }

    pub fn exists(&mut self, key: &[u8]) -> Result<bool> {
        let hash = self.hash(key);
        let result = self.with_chain(self.bucket(hash), LockKind::Read, |db| {
            Ok(db.find(key, hash)?.is_some())
        });
        self.finish(result)
    }

    /// Hand the stored value to `parser` without copying it when the file
    /// is mapped. Fails with `NotFound` if the key is absent.
    pub fn parse_record<R>(&mut self, key: &[u8], parser: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let result = self.parse_record_inner(key, parser);
        self.finish(result)
    }

    fn parse_record_inner<R>(&mut self, key: &[u8], parser: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let hash = self.hash(key);
        self.with_chain(self.bucket(hash), LockKind::Read, |db| {
            let (rec_ptr, rec) = db.find(key, hash)?.ok_or(Error::NotFound)?;
            let data_off = rec_ptr
                .checked_add(RECORD_HEADER_SIZE)?
                .checked_add(rec.key_len)?
                .get();
            if let Some(value) = db.backend.io_ref().view(data_off, rec.data_len) {
                return Ok(parser(value));
            }
            let value = db.read_bytes(data_off, rec.data_len)?;
            Ok(parser(&value))
        })
    }

    /// Store `value` under `key` according to `mode`
    pub fn store(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        let result = self.store_inner(key, value, mode);
        self.finish(result)
    }

    fn store_inner(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<()> {
        self.check_writable()?;
        let hash = self.hash(key);
        self.with_chain(self.bucket(hash), LockKind::Write, |db| {
            db.store_locked(key, value, mode, hash)
        })
    }

    pub(crate) fn store_locked(
        &mut self,
        key: &[u8],
        value: &[u8],
        mode: StoreMode,
        hash: u32,
    ) -> Result<()> {
        if mode == StoreMode::Insert {
            if self.find(key, hash)?.is_some() {
                return Err(Error::Exists);
            }
        } else {
            match self.update_in_place(key, hash, value)? {
                InPlace::Updated => return self.increment_seqnum(),
                InPlace::Missing if mode == StoreMode::Modify => return Err(Error::NotFound),
                InPlace::Missing => {}
                // deleting first reduces fragmentation and keeps the old
                // record from coalescing into the one about to be written
                InPlace::TooSmall => match self.delete_hash(key, hash) {
                    Ok(()) | Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                },
            }
        }

        let payload = key.len() + value.len();
        let bucket = self.bucket(hash);
        if self.max_dead > 0 {
            if let Some((rec_ptr, mut rec)) = self.find_dead(bucket, payload)? {
                // a tombstone in this chain is big enough: reuse it in place
                rec.key_len = key.len() as u32;
                rec.data_len = value.len() as u32;
                rec.full_hash = hash;
                rec.magic = ACTIVE_MAGIC;
                self.write_record(rec_ptr, &rec, key, value)?;
                return self.increment_seqnum();
            }
        }

        let (rec_ptr, mut rec) = self.allocate(payload)?;
        rec.next = self.ofs_read(bucket_top(bucket))?;
        rec.key_len = key.len() as u32;
        rec.data_len = value.len() as u32;
        rec.full_hash = hash;
        rec.magic = ACTIVE_MAGIC;
        self.write_record(rec_ptr, &rec, key, value)?;
        // link in only once the record is complete
        self.ofs_write(bucket_top(bucket), rec_ptr)?;
        self.increment_seqnum()
    }

    fn write_record(
        &mut self,
        rec_ptr: Offset,
        rec: &RecordHeader,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(RecordHeader::SIZE + key.len() + value.len())
            .map_err(|_| Error::OutOfMemory {
                requested: RecordHeader::SIZE + key.len() + value.len(),
            })?;
        buf.extend_from_slice(&rec.encode(self.convert));
        buf.extend_from_slice(key);
        buf.extend_from_slice(value);
        self.io().write(rec_ptr.get(), &buf)
    }

    fn update_in_place(&mut self, key: &[u8], hash: u32, value: &[u8]) -> Result<InPlace> {
        let Some((rec_ptr, mut rec)) = self.find(key, hash)? else {
            return Ok(InPlace::Missing);
        };
        // must be long enough for key, data and tailer
        if (rec.capacity() as usize) < key.len() + value.len() {
            return Ok(InPlace::TooSmall);
        }
        let data_off = rec_ptr
            .checked_add(RECORD_HEADER_SIZE)?
            .checked_add(rec.key_len)?
            .get();
        self.io().write(data_off, value)?;
        if rec.data_len as usize != value.len() {
            rec.data_len = value.len() as u32;
            self.rec_write(rec_ptr, &rec)?;
        }
        Ok(InPlace::Updated)
    }

    /// A tombstone in `bucket` able to hold `payload` bytes
    fn find_dead(&mut self, bucket: u32, payload: usize) -> Result<Option<(Offset, RecordHeader)>> {
        let limit = self.walk_limit();
        let mut rec_ptr = self.ofs_read(bucket_top(bucket))?;
        let mut steps = 0u64;
        while !rec_ptr.is_null() {
            let rec = self.rec_read(rec_ptr)?;
            if rec.is_dead() && rec.capacity() as usize >= payload {
                return Ok(Some((rec_ptr, rec)));
            }
            rec_ptr = rec.next;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!("hash chain {bucket} contains a loop")));
            }
        }
        Ok(None)
    }

    fn count_dead(&mut self, bucket: u32) -> Result<u32> {
        let limit = self.walk_limit();
        let mut rec_ptr = self.ofs_read(bucket_top(bucket))?;
        let (mut dead, mut steps) = (0u32, 0u64);
        while !rec_ptr.is_null() {
            let rec = self.rec_read(rec_ptr)?;
            if rec.is_dead() {
                dead += 1;
            }
            rec_ptr = rec.next;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!("hash chain {bucket} contains a loop")));
            }
        }
        Ok(dead)
    }

    /// Free every tombstone in `bucket` that no traversal is sitting on
    pub(crate) fn purge_dead(&mut self, bucket: u32) -> Result<()> {
        let limit = self.walk_limit();
        let mut rec_ptr = self.ofs_read(bucket_top(bucket))?;
        let mut steps = 0u64;
        while !rec_ptr.is_null() {
            let rec = self.rec_read(rec_ptr)?;
            let next = rec.next;
            if rec.is_dead() {
                self.do_delete(rec_ptr, rec)?;
            }
            rec_ptr = next;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!("hash chain {bucket} contains a loop")));
            }
        }
        Ok(())
    }

    /// Remove `key`; fails with `NotFound` if it is absent
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let result = self.delete_inner(key);
        self.finish(result)
    }

    fn delete_inner(&mut self, key: &[u8]) -> Result<()> {
        self.check_writable()?;
        let hash = self.hash(key);
        self.with_chain(self.bucket(hash), LockKind::Write, |db| db.delete_hash(key, hash))
    }

    pub(crate) fn delete_hash(&mut self, key: &[u8], hash: u32) -> Result<()> {
        let (rec_ptr, mut rec) = self.find(key, hash)?.ok_or(Error::NotFound)?;
        if self.max_dead > 0 {
            let bucket = self.bucket(hash);
            if self.count_dead(bucket)? >= self.max_dead {
                // the chain is over budget: clear it out, this record too
                self.purge_dead(bucket)?;
                let rec = self.rec_read(rec_ptr)?;
                self.do_delete(rec_ptr, rec)?;
            } else {
                rec.magic = DEAD_MAGIC;
                self.rec_write(rec_ptr, &rec)?;
            }
        } else {
            self.do_delete(rec_ptr, rec)?;
        }
        self.increment_seqnum()
    }

    /// Unlink `rec_ptr` from its chain and free it. A record some traversal
    /// is sitting on is only tombstoned; the traversal needs its `next`.
    pub(crate) fn do_delete(&mut self, rec_ptr: Offset, mut rec: RecordHeader) -> Result<()> {
        if self.locks.record_in_use(rec_ptr.get())? {
            tracing::debug!(offset = rec_ptr.get(), "record pinned by a traversal, marking dead");
            rec.magic = DEAD_MAGIC;
            return self.rec_write(rec_ptr, &rec);
        }

        let bucket = self.bucket(rec.full_hash);
        let limit = self.walk_limit();
        let mut last_ptr = bucket_top(bucket);
        let mut i = self.ofs_read(last_ptr)?;
        let mut steps = 0u64;
        while i != rec_ptr {
            if i.is_null() {
                return Err(Error::corrupt(format!(
                    "record at offset {rec_ptr} is not in hash chain {bucket}"
                )));
            }
            last_ptr = i.get();
            i = self.ofs_read(last_ptr)?;
            steps += 1;
            if steps > limit {
                return Err(Error::corrupt(format!("hash chain {bucket} contains a loop")));
            }
        }
        self.ofs_write(last_ptr, rec.next)?;
        self.free(rec_ptr, rec)
    }

    /// Concatenate `extra` onto the value of `key`, creating it if absent
    pub fn append(&mut self, key: &[u8], extra: &[u8]) -> Result<()> {
        let result = self.append_inner(key, extra);
        self.finish(result)
    }

    fn append_inner(&mut self, key: &[u8], extra: &[u8]) -> Result<()> {
        self.check_writable()?;
        let hash = self.hash(key);
        self.with_chain(self.bucket(hash), LockKind::Write, |db| {
            let mut value = match db.find(key, hash)? {
                Some((rec_ptr, rec)) => {
                    let data_off = rec_ptr
                        .checked_add(RECORD_HEADER_SIZE)?
                        .checked_add(rec.key_len)?
                        .get();
                    db.read_bytes(data_off, rec.data_len)?
                }
                None => Vec::new(),
            };
            value
                .try_reserve(extra.len())
                .map_err(|_| Error::OutOfMemory {
                    requested: value.len() + extra.len(),
                })?;
            value.extend_from_slice(extra);
            db.store_locked(key, &value, StoreMode::Replace, hash)
        })
    }

    /// Bump the header sequence number when `SEQNUM` is on
    fn increment_seqnum(&mut self) -> Result<()> {
        if !self.flags.contains(Flags::SEQNUM) {
            return Ok(());
        }
        // a transaction already excludes every other writer
        let lock = self.transaction.is_none();
        if lock {
            self.locks.lock_seqnum()?;
        }
        let result = self
            .word_read(SEQNUM_OFFSET)
            .and_then(|seq| self.word_write(SEQNUM_OFFSET, seq.wrapping_add(1)));
        if lock {
            self.locks.unlock_seqnum()?;
        }
        result
    }

    /// Current header sequence number
    pub fn seqnum(&mut self) -> Result<u32> {
        let result = self.word_read(SEQNUM_OFFSET);
        self.finish(result)
    }

    /// Start bumping the sequence number on every mutation
    pub fn enable_seqnum(&mut self) {
        self.flags |= Flags::SEQNUM;
    }

    fn key_bucket(&self, key: &[u8]) -> i64 {
        i64::from(self.bucket(self.hash(key)))
    }

    /// Exclusive lock on the chain holding `key`
    pub fn chain_lock(&mut self, key: &[u8]) -> Result<()> {
        let list = self.key_bucket(key);
        let result = self.locks.lock_chain(list, LockKind::Write, true);
        self.finish(result)
    }

    /// Like [`Tdb::chain_lock`] but fails with `NoLock` instead of waiting
    pub fn chain_lock_nonblock(&mut self, key: &[u8]) -> Result<()> {
        let list = self.key_bucket(key);
        let result = self.locks.lock_chain(list, LockKind::Write, false);
        self.finish(result)
    }

    pub fn chain_unlock(&mut self, key: &[u8]) -> Result<()> {
        let list = self.key_bucket(key);
        let result = self.locks.unlock_chain(list, LockKind::Write);
        self.finish(result)
    }

    pub fn chain_lock_read(&mut self, key: &[u8]) -> Result<()> {
        let list = self.key_bucket(key);
        let result = self.locks.lock_chain(list, LockKind::Read, true);
        self.finish(result)
    }

    pub fn chain_unlock_read(&mut self, key: &[u8]) -> Result<()> {
        let list = self.key_bucket(key);
        let result = self.locks.unlock_chain(list, LockKind::Read);
        self.finish(result)
    }

    /// Exclusive lock on every chain at once
    pub fn lock_all(&mut self) -> Result<()> {
        let result = self.locks.lock_all(LockKind::Write, true, false);
        self.finish(result)
    }

    pub fn lock_all_nonblock(&mut self) -> Result<()> {
        let result = self.locks.lock_all(LockKind::Write, false, false);
        self.finish(result)
    }

    pub fn unlock_all(&mut self) -> Result<()> {
        let result = self.locks.unlock_all(LockKind::Write);
        self.finish(result)
    }

    pub fn lock_all_read(&mut self) -> Result<()> {
        let result = self.locks.lock_all(LockKind::Read, true, false);
        self.finish(result)
    }

    pub fn unlock_all_read(&mut self) -> Result<()> {
        let result = self.locks.unlock_all(LockKind::Read);
        self.finish(result)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TdbConfig;
    use crate::database::Tdb;
    use trivdb_core::{Error, ErrorCode, Flags, StoreMode};

    fn memory_db(hash_size: u32) -> Tdb {
        TdbConfig::builder()
            .with_hash_size(hash_size)
            .build()
            .open_memory()
            .unwrap()
    }

    #[test]
    fn test_store_modes() {
        let mut tdb = memory_db(7);
        tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
        assert!(matches!(
            tdb.store(b"a", b"2", StoreMode::Insert),
            Err(Error::Exists)
        ));
        assert_eq!(tdb.last_error(), ErrorCode::Exists);
        assert!(matches!(
            tdb.store(b"b", b"2", StoreMode::Modify),
            Err(Error::NotFound)
        ));
        tdb.store(b"a", b"3", StoreMode::Modify).unwrap();
        tdb.store(b"b", b"4", StoreMode::Replace).unwrap();
        assert_eq!(tdb.fetch(b"a").unwrap().as_deref(), Some(&b"3"[..]));
        assert_eq!(tdb.fetch(b"b").unwrap().as_deref(), Some(&b"4"[..]));
    }

    #[test]
    fn test_in_place_update_keeps_record_offset() {
        let mut tdb = memory_db(1);
        tdb.store(b"key", &[1u8; 64], StoreMode::Insert).unwrap();
        let hash = tdb.hash(b"key");
        let (before, _) = tdb.find(b"key", hash).unwrap().unwrap();
        tdb.store(b"key", &[2u8; 16], StoreMode::Replace).unwrap();
        let (after, rec) = tdb.find(b"key", hash).unwrap().unwrap();
        assert_eq!(before, after);
        assert_eq!(rec.data_len, 16);
        // growing past capacity moves the record
        tdb.store(b"key", &[3u8; 256], StoreMode::Replace).unwrap();
        assert_eq!(tdb.fetch(b"key").unwrap().unwrap(), vec![3u8; 256]);
    }

    #[test]
    fn test_delete_then_lookups_miss() {
        let mut tdb = memory_db(3);
        tdb.store(b"gone", b"x", StoreMode::Insert).unwrap();
        tdb.delete(b"gone").unwrap();
        assert!(!tdb.exists(b"gone").unwrap());
        assert_eq!(tdb.fetch(b"gone").unwrap(), None);
        assert!(tdb.delete(b"gone").unwrap_err().is_not_found());
        assert!(tdb.parse_record(b"gone", |v| v.len()).unwrap_err().is_not_found());
    }

    #[test]
    fn test_colliding_keys_share_a_chain() {
        let mut tdb = memory_db(1);
        for i in 0..20u32 {
            tdb.store(format!("k{i}").as_bytes(), &i.to_le_bytes(), StoreMode::Insert)
                .unwrap();
        }
        for i in 0..20u32 {
            let value = tdb.fetch(format!("k{i}").as_bytes()).unwrap().unwrap();
            assert_eq!(value, i.to_le_bytes());
        }
        tdb.delete(b"k7").unwrap();
        assert_eq!(tdb.fetch(b"k8").unwrap().unwrap(), 8u32.to_le_bytes());
    }

    #[test]
    fn test_parse_record_sees_value() {
        let mut tdb = memory_db(3);
        tdb.store(b"k", b"hello", StoreMode::Insert).unwrap();
        let len = tdb.parse_record(b"k", |v| {
            assert_eq!(v, b"hello");
            v.len()
        });
        assert_eq!(len.unwrap(), 5);
    }

    #[test]
    fn test_append_creates_then_extends() {
        let mut tdb = memory_db(3);
        tdb.append(b"log", b"one").unwrap();
        tdb.append(b"log", b",two").unwrap();
        assert_eq!(tdb.fetch(b"log").unwrap().as_deref(), Some(&b"one,two"[..]));
    }

    #[test]
    fn test_long_keys_compare_in_pieces() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut tdb = TdbConfig::builder()
            .with_hash_size(1)
            .with_flags(Flags::NOMMAP)
            .build()
            .open(dir.path().join("long.tdb"))
            .unwrap();
        assert!(!tdb.is_mapped());
        let long_a = vec![b'a'; 1000];
        let mut long_b = long_a.clone();
        long_b[999] = b'b';
        tdb.store(&long_a, b"A", StoreMode::Insert).unwrap();
        tdb.store(&long_b, b"B", StoreMode::Insert).unwrap();
        assert_eq!(tdb.fetch(&long_a).unwrap().as_deref(), Some(&b"A"[..]));
        assert_eq!(tdb.fetch(&long_b).unwrap().as_deref(), Some(&b"B"[..]));
    }

    #[test]
    fn test_dead_records_are_reused() {
        let mut tdb = memory_db(1);
        tdb.set_max_dead(5);
        tdb.store(b"first", &[0u8; 32], StoreMode::Insert).unwrap();
        tdb.delete(b"first").unwrap();
        let size = tdb.map_size();
        let free = tdb.freelist_size().unwrap();
        tdb.store(b"second", &[1u8; 16], StoreMode::Insert).unwrap();
        assert_eq!(tdb.map_size(), size);
        assert_eq!(tdb.freelist_size().unwrap(), free);
        assert_eq!(tdb.fetch(b"second").unwrap().unwrap(), vec![1u8; 16]);
        assert_eq!(tdb.fetch(b"first").unwrap(), None);
    }

    #[test]
    fn test_seqnum_counts_mutations() {
        let mut tdb = memory_db(3);
        tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
        assert_eq!(tdb.seqnum().unwrap(), 0);
        tdb.enable_seqnum();
        tdb.store(b"a", b"2", StoreMode::Replace).unwrap();
        tdb.store(b"b", b"2", StoreMode::Insert).unwrap();
        tdb.delete(b"a").unwrap();
        assert_eq!(tdb.seqnum().unwrap(), 3);
    }

    #[test]
    fn test_chain_lock_api_nests() {
        let mut tdb = memory_db(3);
        tdb.chain_lock(b"a").unwrap();
        tdb.store(b"a", b"1", StoreMode::Insert).unwrap();
        tdb.chain_unlock(b"a").unwrap();
        assert!(tdb.chain_unlock(b"a").unwrap_err().is_lock_error());

        tdb.lock_all().unwrap();
        assert!(tdb.lock_all_read().unwrap_err().is_lock_error());
        tdb.store(b"b", b"2", StoreMode::Insert).unwrap();
        tdb.unlock_all().unwrap();
    }
}
