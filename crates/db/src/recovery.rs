//! The recovery area that makes commits atomic.
//!
//! Before a transaction touches the real file, the bytes it is about to
//! overwrite are saved into a record reached from the header's recovery
//! pointer. The record is only trusted once its magic reads
//! `RECOVERY_MAGIC`, and that word is written (and synced) last. Replaying a
//! live record puts the saved bytes back and cuts the file to its old size.
//!
//! Layout of the area: an ordinary record header whose `key_len` holds the
//! file size before the transaction and whose `data_len` holds the length of
//! the saved entries. Each entry is an offset word, a length word and that
//! many bytes. The record's last word is its tailer like any other record.

use crate::database::Tdb;
use crate::io::StorageIo;
use crate::layout::{align_up, decode_u32, encode_u32, RecordHeader};
use trivdb_core::{
    Error, Flags, LockKind, Offset, Result, OFFSET_SIZE, RECORD_HEADER_SIZE, RECORD_MAGIC_OFFSET,
    RECOVERY_HEAD, RECOVERY_INVALID_MAGIC, RECOVERY_MAGIC,
};

impl Tdb {
    fn base_word_read(&mut self, off: u32) -> Result<u32> {
        let mut word = [0u8; 4];
        self.backend.base().read(off, &mut word)?;
        Ok(decode_u32(&word, self.convert))
    }

    fn base_word_write(&mut self, off: u32, value: u32) -> Result<()> {
        let word = encode_u32(value, self.convert);
        self.backend.base().write(off, &word)
    }

    fn base_sync(&mut self, off: u32, len: u32) -> Result<()> {
        if self.flags.contains(Flags::NOSYNC) {
            return Ok(());
        }
        self.backend.base().sync(off, len)
    }

    /// The recovery record on disk, if the header points at one that fits
    fn base_recovery_record(&mut self) -> Result<Option<(u32, RecordHeader)>> {
        let head = self.base_word_read(RECOVERY_HEAD)?;
        if head == 0 {
            return Ok(None);
        }
        let size = self.backend.base_ref().size();
        if u64::from(head) + u64::from(RECORD_HEADER_SIZE) > u64::from(size) {
            self.logger.error(format!(
                "recovery pointer {head} lies beyond the {size} byte file"
            ));
            return Err(Error::corrupt(format!(
                "recovery record at {head} is past end of file"
            )));
        }
        let mut bytes = [0u8; RecordHeader::SIZE];
        self.backend.base().read(head, &mut bytes)?;
        Ok(Some((head, RecordHeader::decode(&bytes, self.convert))))
    }

    /// Whether a commit died after arming its recovery record
    pub(crate) fn recovery_pending(&mut self) -> Result<bool> {
        Ok(self
            .base_recovery_record()?
            .is_some_and(|(_, rec)| rec.magic == RECOVERY_MAGIC))
    }

    /// Undo an interrupted commit from the recovery record. Does nothing if
    /// no live record exists, so running it twice is harmless.
    pub(crate) fn replay_recovery(&mut self) -> Result<()> {
        let Some((head, rec)) = self.base_recovery_record()? else {
            return Ok(());
        };
        if rec.magic != RECOVERY_MAGIC {
            return Ok(());
        }
        if self.read_only {
            self.logger.error("attempt to recover a read-only database");
            return Err(Error::corrupt("database needs recovery but is read-only"));
        }
        let old_size = rec.key_len;
        if rec.data_len > rec.rec_len {
            return Err(Error::corrupt(format!(
                "recovery record at {head} claims {} bytes in a {} byte area",
                rec.data_len, rec.rec_len
            )));
        }

        let mut data = Vec::new();
        data.try_reserve_exact(rec.data_len as usize)
            .map_err(|_| Error::OutOfMemory {
                requested: rec.data_len as usize,
            })?;
        data.resize(rec.data_len as usize, 0);
        self.backend.base().read(head + RECORD_HEADER_SIZE, &mut data)?;

        let mut pos = 0usize;
        while pos < data.len() {
            if pos + 8 > data.len() {
                return Err(Error::corrupt("truncated recovery entry"));
            }
            let off = decode_u32(&data[pos..], self.convert);
            let len = decode_u32(&data[pos + 4..], self.convert) as usize;
            pos += 8;
            let end = pos
                .checked_add(len)
                .filter(|end| *end <= data.len())
                .ok_or_else(|| Error::corrupt("recovery entry runs past the record"))?;
            if let Err(e) = self.backend.base().write(off, &data[pos..end]) {
                self.logger
                    .error(format!("failed to restore {len} bytes at offset {off}: {e}"));
                return Err(e);
            }
            pos = end;
        }
        let size = self.backend.base_ref().size();
        self.base_sync(0, size)?;

        // the area is about to be cut off; don't leave a pointer into it
        if self.base_word_read(RECOVERY_HEAD)? == head && old_size <= head {
            self.base_word_write(RECOVERY_HEAD, 0)?;
        }
        self.base_word_write(head + RECORD_MAGIC_OFFSET, RECOVERY_INVALID_MAGIC)?;
        self.base_sync(0, size)?;

        if old_size < size {
            self.backend.base().truncate(old_size)?;
            self.base_sync(0, old_size)?;
        }
        self.logger.warn(format!("recovered {old_size} byte database"));
        Ok(())
    }

    /// Save the on-disk bytes the transaction will overwrite below
    /// `old_size` and arm the record. Returns the offset of its magic word,
    /// which the commit clears once every write has landed.
    pub(crate) fn setup_recovery(&mut self, old_size: u32) -> Result<u32> {
        let head = self.ofs_read(RECOVERY_HEAD)?;
        let existing = if head.is_null() {
            None
        } else {
            Some(self.rec_read_raw(head)?)
        }
        .filter(|rec| matches!(rec.magic, RECOVERY_MAGIC | RECOVERY_INVALID_MAGIC));

        let undo_len = |db: &Tdb| -> Result<u32> {
            let len = db
                .backend
                .shadow_ref()
                .map_or(0, |shadow| shadow.undo_len(old_size));
            u32::try_from(len).map_err(|_| Error::invalid("transaction too large to recover"))
        };
        let needed = undo_len(self)?
            .checked_add(OFFSET_SIZE)
            .ok_or_else(|| Error::invalid("transaction too large to recover"))?;

        let (rec_off, capacity, relocated) = match existing {
            Some(rec) if rec.rec_len >= needed => (head.get(), rec.rec_len, false),
            _ => {
                if let Some(rec) = existing {
                    // too small: hand the old area back through the transaction
                    self.free(head, rec)?;
                }
                let new_off = self.map_size();
                self.ofs_write(RECOVERY_HEAD, Offset::new(new_off))?;
                let needed = undo_len(self)?
                    .checked_add(RECORD_HEADER_SIZE + OFFSET_SIZE)
                    .ok_or_else(|| Error::invalid("transaction too large to recover"))?;
                let total = align_up(needed, self.page_size)?;
                let end = new_off
                    .checked_add(total)
                    .ok_or_else(|| Error::invalid("database would exceed 4 GiB"))?;
                let base = self.backend.base();
                let base_size = base.size();
                if end > base_size {
                    base.expand_file(base_size, end - base_size)?;
                }
                tracing::debug!(offset = new_off, size = total, "moved recovery area");
                (new_off, total - RECORD_HEADER_SIZE, true)
            }
        };

        let payload_len = undo_len(self)?;
        let rec = RecordHeader {
            next: Offset::NULL,
            rec_len: capacity,
            key_len: old_size,
            data_len: payload_len,
            full_hash: 0,
            magic: RECOVERY_INVALID_MAGIC,
        };
        let mut buf = Vec::new();
        buf.try_reserve_exact(RecordHeader::SIZE + payload_len as usize)
            .map_err(|_| Error::OutOfMemory {
                requested: RecordHeader::SIZE + payload_len as usize,
            })?;
        buf.extend_from_slice(&rec.encode(self.convert));
        let convert = self.convert;
        let Some(shadow) = self.backend.shadow() else {
            return Err(Error::invalid("no transaction to recover"));
        };
        shadow.capture_originals(old_size, convert, &mut buf)?;

        let base = shadow.base();
        base.write(rec_off, &buf)?;
        let tailer_off = rec_off + RECORD_HEADER_SIZE + capacity - OFFSET_SIZE;
        base.write(tailer_off, &encode_u32(rec.tailer(), convert))?;
        if relocated {
            base.write(RECOVERY_HEAD, &encode_u32(rec_off, convert))?;
        }
        self.base_sync(0, rec_off + rec.total_size())?;

        // only now does the record count
        let magic_off = rec_off + RECORD_MAGIC_OFFSET;
        self.base_word_write(magic_off, RECOVERY_MAGIC)?;
        self.base_sync(magic_off, OFFSET_SIZE)?;
        tracing::debug!(offset = rec_off, bytes = payload_len, "recovery area armed");
        Ok(magic_off)
    }

    /// Replay an interrupted commit left by another process, if any
    pub fn recover(&mut self) -> Result<()> {
        let result = self.recover_inner();
        self.finish(result)
    }

    fn recover_inner(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(Error::invalid("cannot recover inside a transaction"));
        }
        self.check_writable()?;
        self.locks.lock_global(LockKind::Write)?;
        let result = self.replay_recovery();
        self.locks.unlock_global()?;
        result
    }
}
