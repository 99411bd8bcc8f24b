//! Space and chain statistics for a database.

use crate::database::Tdb;
use crate::layout::bucket_top;
use serde::Serialize;
use std::fmt;
use trivdb_core::{Error, LockKind, RecordState, Result, FREELIST_TOP, RECORD_HEADER_SIZE};

/// Shortest, longest and mean hash chain length
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ChainStats {
    pub min: usize,
    pub max: usize,
    pub avg: f64,
}

/// Snapshot of how a database uses its file
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Summary {
    pub size: u32,
    pub hash_size: u32,
    pub records: usize,
    /// Key and value bytes of live records
    pub record_bytes: u64,
    pub dead_records: usize,
    pub dead_bytes: u64,
    pub free_records: usize,
    pub free_bytes: u64,
    /// Headers, tailers and padding of every record on a chain
    pub overhead_bytes: u64,
    pub chains: ChainStats,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Size of file/data: {}/{}", self.size, self.record_bytes)?;
        writeln!(f, "Number of records: {}", self.records)?;
        writeln!(f, "Hash size: {}", self.hash_size)?;
        writeln!(
            f,
            "Dead records: {} ({} bytes)",
            self.dead_records, self.dead_bytes
        )?;
        writeln!(
            f,
            "Free records: {} ({} bytes)",
            self.free_records, self.free_bytes
        )?;
        writeln!(f, "Overhead bytes: {}", self.overhead_bytes)?;
        write!(
            f,
            "Chain lengths: min {} max {} avg {:.2}",
            self.chains.min, self.chains.max, self.chains.avg
        )
    }
}

impl Tdb {
    /// Gather a [`Summary`] under a whole-table read lock
    pub fn summary(&mut self) -> Result<Summary> {
        let result = self.summary_inner();
        self.finish(result)
    }

    fn summary_inner(&mut self) -> Result<Summary> {
        let take_lock = self.transaction.is_none() && !self.locks.holds_allrecord();
        if take_lock {
            self.locks.lock_all(LockKind::Read, true, false)?;
        }
        let result = self.summary_locked();
        if take_lock {
            self.locks.unlock_all(LockKind::Read)?;
        }
        result
    }

    fn summary_locked(&mut self) -> Result<Summary> {
        let limit = self.walk_limit();
        let mut summary = Summary {
            size: self.map_size(),
            hash_size: self.hash_size,
            ..Summary::default()
        };

        let mut ptr = self.ofs_read(FREELIST_TOP)?;
        while !ptr.is_null() {
            let rec = self.rec_read_raw(ptr)?;
            summary.free_records += 1;
            summary.free_bytes += u64::from(rec.total_size());
            if summary.free_records as u64 > limit {
                return Err(Error::corrupt("free list contains a loop"));
            }
            ptr = rec.next;
        }

        let mut lengths = Vec::with_capacity(self.hash_size as usize);
        for bucket in 0..self.hash_size {
            let mut length = 0usize;
            let mut ptr = self.ofs_read(bucket_top(bucket))?;
            while !ptr.is_null() {
                let rec = self.rec_read(ptr)?;
                length += 1;
                if length as u64 > limit {
                    return Err(Error::corrupt(format!("hash chain {bucket} contains a loop")));
                }
                let payload = u64::from(rec.payload_len());
                if rec.state() == Some(RecordState::Tombstone) {
                    summary.dead_records += 1;
                    summary.dead_bytes += u64::from(rec.total_size());
                } else {
                    summary.records += 1;
                    summary.record_bytes += payload;
                    summary.overhead_bytes += u64::from(RECORD_HEADER_SIZE)
                        + u64::from(rec.rec_len).saturating_sub(payload);
                }
                ptr = rec.next;
            }
            lengths.push(length);
        }

        if !lengths.is_empty() {
            summary.chains = ChainStats {
                min: lengths.iter().copied().min().unwrap_or(0),
                max: lengths.iter().copied().max().unwrap_or(0),
                avg: lengths.iter().sum::<usize>() as f64 / lengths.len() as f64,
            };
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::TdbConfig;
    use crate::database::Tdb;
    use trivdb_core::StoreMode;

    #[test]
    fn test_summary_counts_records_and_space() {
        let mut tdb = Tdb::open_memory(
            &TdbConfig::builder()
                .with_hash_size(3)
                .with_max_dead_records(10)
                .build(),
        )
        .unwrap();
        tdb.store(b"one", b"1", StoreMode::Insert).unwrap();
        tdb.store(b"two", b"22", StoreMode::Insert).unwrap();
        tdb.store(b"three", b"333", StoreMode::Insert).unwrap();
        tdb.delete(b"two").unwrap();

        let summary = tdb.summary().unwrap();
        assert_eq!(summary.hash_size, 3);
        assert_eq!(summary.records, 2);
        assert_eq!(summary.record_bytes, 4 + 8);
        assert_eq!(summary.dead_records, 1);
        assert_eq!(summary.free_records, 1);
        assert!(summary.chains.max >= 1);
        assert!(summary.to_string().contains("Number of records: 2"));

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["records"], 2);
        assert_eq!(json["chains"]["min"], summary.chains.min);
    }
}
