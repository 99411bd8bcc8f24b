//! Full structural verification of a database.

use crate::database::Tdb;
use crate::layout::{bucket_top, data_start, Header, RecordHeader};
use std::collections::{BTreeSet, HashSet};
use trivdb_core::{
    Error, LockKind, Offset, RecordState, Result, ALIGNMENT, FREELIST_TOP, FREE_MAGIC,
    HEADER_SIZE, MIN_REC_SIZE, OFFSET_SIZE, RECORD_HEADER_SIZE, RECOVERY_HEAD,
    RECOVERY_INVALID_MAGIC, RECOVERY_MAGIC,
};

/// Callback handed every live record found by [`Tdb::check`]
pub type CheckVisitor<'a> = &'a mut dyn FnMut(&[u8], &[u8]) -> Result<()>;

fn corrupt(tdb: &Tdb, message: String) -> Error {
    tdb.logger.error(&message);
    Error::corrupt(message)
}

impl Tdb {
    /// Verify the header, the free list, every hash chain and the layout
    /// of the whole record heap. `visitor` sees each live key and value and
    /// may veto the database by returning an error.
    pub fn check(&mut self, visitor: Option<CheckVisitor<'_>>) -> Result<()> {
        let result = self.check_inner(visitor);
        self.finish(result)
    }

    fn check_inner(&mut self, visitor: Option<CheckVisitor<'_>>) -> Result<()> {
        let take_lock = self.transaction.is_none() && !self.locks.holds_allrecord();
        if take_lock {
            self.locks.lock_all(LockKind::Read, true, false)?;
        }
        let result = self.check_locked(visitor);
        if take_lock {
            self.locks.unlock_all(LockKind::Read)?;
        }
        result
    }

    fn check_locked(&mut self, mut visitor: Option<CheckVisitor<'_>>) -> Result<()> {
        // another handle may have grown the file
        let size = self.map_size();
        let _ = self.io().oob(u64::from(size) + 1, true);
        let size = self.map_size();

        let header_bytes = self.read_bytes(0, HEADER_SIZE)?;
        let (header, _) = Header::decode(&header_bytes)?;
        if header.hash_size != self.hash_size {
            return Err(corrupt(
                self,
                format!(
                    "header hash size {} differs from open hash size {}",
                    header.hash_size, self.hash_size
                ),
            ));
        }
        if header.rwlocks != 0 {
            return Err(corrupt(self, "header has spinlocks enabled".to_string()));
        }
        let heap_start = data_start(self.hash_size);
        if heap_start > size {
            return Err(corrupt(
                self,
                format!("{size} byte file cannot hold {} buckets", self.hash_size),
            ));
        }

        let free = self.check_freelist(heap_start, size)?;
        let used = self.check_chains(heap_start, size, &mut visitor)?;
        let recovery = self.ofs_read(RECOVERY_HEAD)?;

        // walk the heap record by record
        let mut off = heap_start;
        let mut previous_free = false;
        let (mut seen_free, mut seen_used) = (0usize, 0usize);
        while off < size {
            if u64::from(off) + u64::from(MIN_REC_SIZE) > u64::from(size) {
                return Err(corrupt(
                    self,
                    format!("{} trailing bytes at offset {off}", size - off),
                ));
            }
            let rec = self.rec_read_raw(Offset::new(off))?;
            let total = rec.total_size();
            if total < MIN_REC_SIZE
                || total % ALIGNMENT != 0
                || u64::from(off) + u64::from(total) > u64::from(size)
            {
                return Err(corrupt(
                    self,
                    format!("record at {off} has impossible length {}", rec.rec_len),
                ));
            }
            let tailer = self.word_read(off + total - OFFSET_SIZE)?;
            if tailer != rec.tailer() {
                return Err(corrupt(
                    self,
                    format!("record at {off} has tailer {tailer}, expected {total}"),
                ));
            }

            let is_free = rec.magic == FREE_MAGIC;
            match rec.magic {
                FREE_MAGIC => {
                    if previous_free {
                        return Err(corrupt(
                            self,
                            format!("free record at {off} follows another free record"),
                        ));
                    }
                    if !free.contains(&off) {
                        return Err(corrupt(
                            self,
                            format!("free record at {off} is not on the free list"),
                        ));
                    }
                    seen_free += 1;
                }
                RECOVERY_MAGIC | RECOVERY_INVALID_MAGIC => {
                    if recovery.get() != off {
                        return Err(corrupt(
                            self,
                            format!("stray recovery record at {off}"),
                        ));
                    }
                }
                _ if rec.state().is_some() => {
                    if !used.contains(&off) {
                        return Err(corrupt(
                            self,
                            format!("record at {off} is not on any hash chain"),
                        ));
                    }
                    seen_used += 1;
                }
                magic => {
                    return Err(corrupt(
                        self,
                        format!("bad magic {magic:#x} in heap at offset {off}"),
                    ));
                }
            }
            previous_free = is_free;
            off += total;
        }

        if seen_free != free.len() {
            return Err(corrupt(
                self,
                format!(
                    "free list holds {} records but the heap has {seen_free}",
                    free.len()
                ),
            ));
        }
        if seen_used != used.len() {
            return Err(corrupt(
                self,
                format!(
                    "hash chains hold {} records but the heap has {seen_used}",
                    used.len()
                ),
            ));
        }
        tracing::debug!(
            size,
            free = seen_free,
            records = seen_used,
            "database check passed"
        );
        Ok(())
    }

    fn check_offset(&self, off: u32, heap_start: u32, size: u32) -> Result<()> {
        if off < heap_start
            || off % ALIGNMENT != 0
            || u64::from(off) + u64::from(RECORD_HEADER_SIZE) > u64::from(size)
        {
            return Err(corrupt(
                self,
                format!("offset {off} points outside the record heap"),
            ));
        }
        Ok(())
    }

    fn check_freelist(&mut self, heap_start: u32, size: u32) -> Result<BTreeSet<u32>> {
        let mut free = BTreeSet::new();
        let mut ptr = self.ofs_read(FREELIST_TOP)?;
        while !ptr.is_null() {
            self.check_offset(ptr.get(), heap_start, size)?;
            if !free.insert(ptr.get()) {
                return Err(corrupt(self, "free list contains a loop".to_string()));
            }
            let rec = self.rec_read_raw(ptr)?;
            if rec.magic != FREE_MAGIC {
                return Err(corrupt(
                    self,
                    format!("bad magic {:#x} on free list at {ptr}", rec.magic),
                ));
            }
            ptr = rec.next;
        }
        Ok(free)
    }

    fn check_chains(
        &mut self,
        heap_start: u32,
        size: u32,
        visitor: &mut Option<CheckVisitor<'_>>,
    ) -> Result<BTreeSet<u32>> {
        let mut used = BTreeSet::new();
        for bucket in 0..self.hash_size {
            let mut keys: HashSet<Vec<u8>> = HashSet::new();
            let mut ptr = self.ofs_read(bucket_top(bucket))?;
            while !ptr.is_null() {
                self.check_offset(ptr.get(), heap_start, size)?;
                if !used.insert(ptr.get()) {
                    return Err(corrupt(
                        self,
                        format!("record at {ptr} is linked twice"),
                    ));
                }
                let rec = self.rec_read_raw(ptr)?;
                self.check_record(ptr, &rec, bucket)?;
                if rec.state() == Some(RecordState::Active) {
                    let start = ptr.get() + RECORD_HEADER_SIZE;
                    let key = self.read_bytes(start, rec.key_len)?;
                    let data = self.read_bytes(start + rec.key_len, rec.data_len)?;
                    if self.hash(&key) != rec.full_hash {
                        return Err(corrupt(
                            self,
                            format!("record at {ptr} does not hash to its stored hash"),
                        ));
                    }
                    if let Some(visit) = visitor.as_mut() {
                        visit(&key, &data)?;
                    }
                    if !keys.insert(key) {
                        return Err(corrupt(
                            self,
                            format!("duplicate key in chain {bucket} at {ptr}"),
                        ));
                    }
                }
                ptr = rec.next;
            }
        }
        Ok(used)
    }

    fn check_record(&self, ptr: Offset, rec: &RecordHeader, bucket: u32) -> Result<()> {
        if !matches!(
            rec.state(),
            Some(RecordState::Active) | Some(RecordState::Tombstone)
        ) {
            return Err(corrupt(
                self,
                format!("bad magic {:#x} on chain {bucket} at {ptr}", rec.magic),
            ));
        }
        if self.bucket(rec.full_hash) != bucket {
            return Err(corrupt(
                self,
                format!(
                    "record at {ptr} belongs to chain {}, found on {bucket}",
                    self.bucket(rec.full_hash)
                ),
            ));
        }
        if u64::from(rec.key_len) + u64::from(rec.data_len) + u64::from(OFFSET_SIZE)
            > u64::from(rec.rec_len)
        {
            return Err(corrupt(
                self,
                format!("record at {ptr} overflows its allocation"),
            ));
        }
        Ok(())
    }
}
