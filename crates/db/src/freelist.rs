//! The free-record allocator.
//!
//! Free records form a singly linked list headed at `FREELIST_TOP`. The list
//! is guarded by the chain lock of list -1. Freed space is coalesced with
//! free neighbours on both sides, found via the tailer word every record
//! carries at its end, so no two free records are ever adjacent.

use crate::database::Tdb;
use crate::layout::{align_up, data_start, record_length, RecordHeader};
use crate::lock::FREELIST_CHAIN;
use trivdb_core::{
    Error, LockKind, Offset, Result, ACTIVE_MAGIC, FREELIST_TOP, FREE_MAGIC, MIN_REC_SIZE,
    OFFSET_SIZE, RECORD_HEADER_SIZE, RECOVERY_HEAD, RECOVERY_INVALID_MAGIC, RECOVERY_MAGIC,
};

/// Best candidate found so far by the allocator
#[derive(Debug, Clone, Copy)]
struct Candidate {
    off: Offset,
    last_ptr: u32,
    rec_len: u32,
}

impl Tdb {
    /// Upper bound on list length; anything longer must loop
    pub(crate) fn walk_limit(&self) -> u64 {
        u64::from(self.map_size()) / u64::from(RECORD_HEADER_SIZE) + 1
    }

    /// Run `f` holding the free-list lock, releasing it on every path
    pub(crate) fn with_freelist<T>(
        &mut self,
        kind: LockKind,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        self.locks.lock_chain(FREELIST_CHAIN, kind, true)?;
        let result = f(self);
        let unlocked = self.locks.unlock_chain(FREELIST_CHAIN, kind);
        let value = result?;
        unlocked?;
        Ok(value)
    }

    /// Read a free-list entry. An `Active` tag here is left over from an
    /// interrupted delete and is repaired when the handle may write.
    fn rec_free_read(&mut self, off: Offset) -> Result<RecordHeader> {
        let mut rec = self.rec_read_raw(off)?;
        if rec.magic == ACTIVE_MAGIC && self.check_writable().is_ok() {
            self.logger.warn(format!(
                "converting non-free magic on free list at offset {off}"
            ));
            rec.magic = FREE_MAGIC;
            self.rec_write(off, &rec)?;
        }
        if rec.magic != FREE_MAGIC {
            self.logger
                .error(format!("bad magic {:#x} on free list at offset {off}", rec.magic));
            return Err(Error::corrupt(format!(
                "bad magic {:#x} on free list at offset {off}",
                rec.magic
            )));
        }
        self.io()
            .oob(u64::from(rec.next.get()) + u64::from(RECORD_HEADER_SIZE), false)?;
        Ok(rec)
    }

    /// Unlink `off` from the free list, given its `next` pointer
    fn remove_from_freelist(&mut self, off: Offset, next: Offset) -> Result<()> {
        let limit = self.walk_limit();
        let mut last_ptr = FREELIST_TOP;
        let mut i = self.ofs_read(last_ptr)?;
        let mut steps = 0u64;
        while !i.is_null() {
            if i == off {
                return self.ofs_write(last_ptr, next);
            }
            // the next pointer is the first word of a record
            last_ptr = i.get();
            i = self.ofs_read(last_ptr)?;
            steps += 1;
            if steps > limit {
                self.logger.error("free list contains a loop");
                return Err(Error::corrupt("free list contains a loop"));
            }
        }
        self.logger
            .error(format!("free record at offset {off} is not on the free list"));
        Err(Error::corrupt(format!(
            "free record at offset {off} is not on the free list"
        )))
    }

    /// Return a record to the free list, merging it with free neighbours
    pub(crate) fn free(&mut self, off: Offset, rec: RecordHeader) -> Result<()> {
        self.with_freelist(LockKind::Write, |db| db.free_locked(off, rec))
    }

    fn free_locked(&mut self, mut off: Offset, mut rec: RecordHeader) -> Result<()> {
        self.update_tailer(off, &rec)?;

        // merge with a free record directly to the right
        let right = off.checked_add(rec.total_size())?;
        if u64::from(right.get()) + u64::from(RECORD_HEADER_SIZE) <= u64::from(self.map_size()) {
            match self.rec_read_raw(right) {
                Ok(r) if r.magic == FREE_MAGIC => {
                    self.remove_from_freelist(right, r.next)?;
                    rec.rec_len += r.total_size();
                    self.update_tailer(off, &rec)?;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(offset = right.get(), error = %e, "right neighbour unreadable");
                }
            }
        }

        // and with one directly to the left, found through its tailer
        let heap_start = data_start(self.hash_size);
        if off.get() >= heap_start + RECORD_HEADER_SIZE + OFFSET_SIZE {
            let left_size = self.word_read(off.get() - OFFSET_SIZE)?;
            let fits = left_size >= RECORD_HEADER_SIZE + OFFSET_SIZE
                && left_size <= off.get() - heap_start;
            if fits {
                let left = Offset::new(off.get() - left_size);
                match self.rec_read_raw(left) {
                    Ok(l) if l.magic == FREE_MAGIC && l.total_size() == left_size => {
                        self.remove_from_freelist(left, l.next)?;
                        rec = RecordHeader {
                            rec_len: l.rec_len + rec.total_size(),
                            ..l
                        };
                        off = left;
                        self.update_tailer(off, &rec)?;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(offset = left.get(), error = %e, "left neighbour unreadable");
                    }
                }
            }
        }

        rec.magic = FREE_MAGIC;
        rec.next = self.ofs_read(FREELIST_TOP)?;
        self.rec_write(off, &rec)?;
        self.ofs_write(FREELIST_TOP, off)
    }

    /// Find space for `payload` bytes of key and value. The returned header
    /// is tagged `Active` with a null `next`; the caller fills in the rest.
    pub(crate) fn allocate(&mut self, payload: usize) -> Result<(Offset, RecordHeader)> {
        let length = record_length(payload)?;
        self.with_freelist(LockKind::Write, |db| db.allocate_locked(length))
    }

    fn allocate_locked(&mut self, length: u32) -> Result<(Offset, RecordHeader)> {
        loop {
            if let Some(best) = self.best_fit(length)? {
                let rec = self.rec_free_read(best.off)?;
                return self.allocate_from(length, best.off, rec, best.last_ptr);
            }
            // nothing fits: grow the file and look again
            self.expand(length)?;
        }
    }

    /// Smallest free record of at least `length`, stopping early once a
    /// candidate is within twice the request
    fn best_fit(&mut self, length: u32) -> Result<Option<Candidate>> {
        let limit = self.walk_limit();
        let mut best: Option<Candidate> = None;
        let mut last_ptr = FREELIST_TOP;
        let mut rec_ptr = self.ofs_read(FREELIST_TOP)?;
        let mut steps = 0u64;
        while !rec_ptr.is_null() {
            let rec = self.rec_free_read(rec_ptr)?;
            if rec.rec_len >= length && best.map_or(true, |b| rec.rec_len < b.rec_len) {
                best = Some(Candidate {
                    off: rec_ptr,
                    last_ptr,
                    rec_len: rec.rec_len,
                });
            }
            last_ptr = rec_ptr.get();
            rec_ptr = rec.next;

            if best.is_some_and(|b| u64::from(b.rec_len) < 2 * u64::from(length)) {
                break;
            }
            steps += 1;
            if steps > limit {
                self.logger.error("free list contains a loop");
                return Err(Error::corrupt("free list contains a loop"));
            }
        }
        Ok(best)
    }

    /// Carve `length` bytes out of the free record at `rec_ptr`, whose
    /// predecessor link lives at `last_ptr`
    fn allocate_from(
        &mut self,
        length: u32,
        rec_ptr: Offset,
        mut rec: RecordHeader,
        last_ptr: u32,
    ) -> Result<(Offset, RecordHeader)> {
        if rec.rec_len < length + MIN_REC_SIZE {
            // too small to split: hand out the whole record
            self.ofs_write(last_ptr, rec.next)?;
            rec.next = Offset::NULL;
            rec.magic = ACTIVE_MAGIC;
            self.rec_write(rec_ptr, &rec)?;
            return Ok((rec_ptr, rec));
        }

        // the tail stays free and takes our place in the list
        let tail_off = rec_ptr.checked_add(RECORD_HEADER_SIZE + length)?;
        let tail = RecordHeader {
            next: rec.next,
            rec_len: rec.rec_len - length - RECORD_HEADER_SIZE,
            magic: FREE_MAGIC,
            ..RecordHeader::default()
        };
        self.rec_write(tail_off, &tail)?;
        self.update_tailer(tail_off, &tail)?;
        self.ofs_write(last_ptr, tail_off)?;

        let head = RecordHeader {
            next: Offset::NULL,
            rec_len: length,
            magic: ACTIVE_MAGIC,
            ..RecordHeader::default()
        };
        self.rec_write(rec_ptr, &head)?;
        self.update_tailer(rec_ptr, &head)?;
        Ok((rec_ptr, head))
    }

    /// Grow the file by enough for at least one `length` record and put the
    /// new space on the free list
    fn expand(&mut self, length: u32) -> Result<()> {
        // another handle may have grown the file already; only the refreshed
        // size matters here, so a failed probe is expected
        let size = self.map_size();
        let _ = self.io().oob(u64::from(size) + 1, true);
        let size = self.map_size();

        let want = u64::from(length)
            .saturating_mul(10)
            .max(u64::from(RECORD_HEADER_SIZE) + u64::from(length));
        let target = u64::from(size) + want;
        let target = u32::try_from(target)
            .map_err(|_| Error::invalid("database would exceed 4 GiB"))?;
        let new_size = align_up(target, self.page_size)?;
        let addition = new_size - size;

        tracing::debug!(size, addition, "expanding database");
        self.io().expand_file(size, addition)?;

        let rec = RecordHeader {
            rec_len: addition - RECORD_HEADER_SIZE,
            magic: FREE_MAGIC,
            ..RecordHeader::default()
        };
        self.rec_write(Offset::new(size), &rec)?;
        self.free_locked(Offset::new(size), rec)
    }

    /// Number of records on the free list
    pub fn freelist_size(&mut self) -> Result<usize> {
        let result = self.with_freelist(LockKind::Read, |db| {
            let limit = db.walk_limit();
            let mut count = 0usize;
            let mut ptr = db.ofs_read(FREELIST_TOP)?;
            while !ptr.is_null() {
                count += 1;
                if count as u64 > limit {
                    return Err(Error::corrupt("free list contains a loop"));
                }
                ptr = db.ofs_read(ptr.get())?;
            }
            Ok(count)
        });
        self.finish(result)
    }

    /// Remove every record, keeping the hash size and any recovery area
    pub fn wipe_all(&mut self) -> Result<()> {
        let result = self.wipe_all_inner();
        self.finish(result)
    }

    fn wipe_all_inner(&mut self) -> Result<()> {
        self.check_writable()?;
        // a transaction already owns the table; it wipes inside its overlay
        let take_lock = self.transaction.is_none();
        if take_lock {
            self.locks.lock_all(LockKind::Write, true, false)?;
        }
        let result = self.wipe_locked();
        if take_lock {
            self.locks.unlock_all(LockKind::Write)?;
        }
        result
    }

    fn wipe_locked(&mut self) -> Result<()> {
        let heap_start = data_start(self.hash_size);
        let size = self.map_size();

        let head = self.ofs_read(RECOVERY_HEAD)?;
        let mut recovery = None;
        if !head.is_null() && u64::from(head.get()) + u64::from(RECORD_HEADER_SIZE) <= u64::from(size) {
            let rec = self.rec_read_raw(head)?;
            if matches!(rec.magic, RECOVERY_MAGIC | RECOVERY_INVALID_MAGIC) {
                recovery = Some((head.get(), head.get().saturating_add(rec.total_size())));
            }
        }

        // empty the free list and every bucket
        let heads = vec![0u8; (heap_start - FREELIST_TOP) as usize];
        self.io().write(FREELIST_TOP, &heads)?;

        let regions = match recovery {
            Some((start, end)) => vec![(heap_start, start), (end.min(size), size)],
            None => vec![(heap_start, size)],
        };
        for (start, end) in regions {
            if end <= start {
                continue;
            }
            if end - start < RECORD_HEADER_SIZE + OFFSET_SIZE {
                return Err(Error::corrupt(format!(
                    "{} byte gap at offset {start} cannot hold a record",
                    end - start
                )));
            }
            let rec = RecordHeader {
                rec_len: end - start - RECORD_HEADER_SIZE,
                magic: FREE_MAGIC,
                ..RecordHeader::default()
            };
            self.rec_write(Offset::new(start), &rec)?;
            self.free(Offset::new(start), rec)?;
        }
        tracing::debug!(size, "wiped database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TdbConfig;
    use crate::database::Tdb;
    use crate::layout::{data_start, RecordHeader};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use trivdb_core::{
        LogLevel, Offset, StoreMode, ACTIVE_MAGIC, FREELIST_TOP, FREE_MAGIC, RECORD_HEADER_SIZE,
    };

    fn memory_db() -> Tdb {
        TdbConfig::builder()
            .with_hash_size(3)
            .with_page_size(4096)
            .build()
            .open_memory()
            .unwrap()
    }

    #[test]
    fn test_first_allocation_expands_by_whole_pages() {
        let mut tdb = memory_db();
        let before = tdb.map_size();
        let (off, rec) = tdb.allocate(8).unwrap();
        assert_eq!(off.get(), before);
        assert_eq!(rec.rec_len, 12);
        assert_eq!(tdb.map_size() % 4096, 0);
        // the remainder went back on the free list as one record
        assert_eq!(tdb.freelist_size().unwrap(), 1);
    }

    #[test]
    fn test_adjacent_frees_coalesce() {
        let mut tdb = memory_db();
        let (a, ra) = tdb.allocate(100).unwrap();
        let (b, rb) = tdb.allocate(100).unwrap();
        let (c, rc) = tdb.allocate(100).unwrap();
        assert_eq!(b.get(), a.get() + ra.total_size());
        assert_eq!(c.get(), b.get() + rb.total_size());
        let remainder = tdb.freelist_size().unwrap();

        tdb.free(a, ra).unwrap();
        tdb.free(c, rc).unwrap();
        // c merged into the trailing free space
        assert_eq!(tdb.freelist_size().unwrap(), remainder + 1);
        tdb.free(b, rb).unwrap();
        // a, b, c and the tail are now a single free record
        assert_eq!(tdb.freelist_size().unwrap(), 1);

        let head = tdb.rec_read_raw(Offset::new(data_start(3))).unwrap();
        assert_eq!(head.magic, FREE_MAGIC);
        assert_eq!(head.total_size(), tdb.map_size() - data_start(3));
    }

    #[test]
    fn test_active_tag_on_free_list_is_corrected() {
        let warnings = Arc::new(Mutex::new(Vec::new()));
        let sink = warnings.clone();
        let mut tdb = TdbConfig::builder()
            .with_hash_size(3)
            .with_page_size(4096)
            .with_logger(move |level, msg| {
                if level == LogLevel::Warning {
                    sink.lock().push(msg.to_string());
                }
            })
            .build()
            .open_memory()
            .unwrap();
        tdb.allocate(8).unwrap();
        let head = tdb.ofs_read(FREELIST_TOP).unwrap();
        let mut rec = tdb.rec_read_raw(head).unwrap();
        rec.magic = ACTIVE_MAGIC;
        tdb.rec_write(head, &rec).unwrap();

        let (off, _) = tdb.allocate(8).unwrap();
        assert_eq!(off, head);
        assert_eq!(warnings.lock().len(), 1);
        assert!(warnings.lock()[0].contains("non-free magic"));
        assert_eq!(tdb.freelist_size().unwrap(), 1);
    }

    #[test]
    fn test_freed_space_is_reused() {
        let mut tdb = memory_db();
        let (a, ra) = tdb.allocate(64).unwrap();
        let _guard = tdb.allocate(64).unwrap();
        tdb.free(a, ra).unwrap();
        let (again, rec) = tdb.allocate(60).unwrap();
        assert_eq!(again, a);
        // 64 bytes cannot be split to leave a minimum record
        assert_eq!(rec.rec_len, ra.rec_len);
    }

    #[test]
    fn test_large_request_grows_file() {
        let mut tdb = memory_db();
        let before = tdb.map_size();
        let (_, rec) = tdb.allocate(100_000).unwrap();
        assert!(rec.rec_len >= 100_004);
        assert!(tdb.map_size() >= before + 100_000 * 10);
    }

    #[test]
    fn test_wipe_all_leaves_one_free_record() {
        let mut tdb = memory_db();
        for i in 0..50u32 {
            let key = i.to_string();
            tdb.store(key.as_bytes(), &[7u8; 40], StoreMode::Insert).unwrap();
        }
        let size = tdb.map_size();
        tdb.wipe_all().unwrap();
        assert_eq!(tdb.map_size(), size);
        assert!(!tdb.exists(b"7").unwrap());
        assert_eq!(tdb.freelist_size().unwrap(), 1);
        let rec: RecordHeader = tdb.rec_read_raw(Offset::new(data_start(3))).unwrap();
        assert_eq!(rec.rec_len, size - data_start(3) - RECORD_HEADER_SIZE);
        tdb.check(None).unwrap();
    }
}
