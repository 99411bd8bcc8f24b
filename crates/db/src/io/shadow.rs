use super::{DirectIo, StorageIo};
use crate::layout::encode_u32;
use std::collections::BTreeMap;
use trivdb_core::{Error, Result, FREELIST_TOP, OFFSET_SIZE};

/// Transaction overlay: buffers every write in memory and serves reads from
/// the buffered extents first, falling through to the real file for the
/// gaps. Extents never overlap and never touch; a write that meets an
/// existing extent is merged into it.
pub(crate) struct ShadowIo {
    pub(super) base: DirectIo,
    blocks: BTreeMap<u32, Vec<u8>>,
    size: u32,
    /// Raw head words: index 0 is the free list, `b + 1` is bucket `b`
    hash_heads: Vec<u32>,
    /// Extents `apply` writes before failing
    #[cfg(test)]
    fail_after: Option<usize>,
}

impl ShadowIo {
    pub fn new(base: DirectIo, hash_heads: Vec<u32>) -> Self {
        let size = base.size();
        Self {
            base,
            blocks: BTreeMap::new(),
            size,
            hash_heads,
            #[cfg(test)]
            fail_after: None,
        }
    }

    pub fn base(&mut self) -> &mut DirectIo {
        &mut self.base
    }

    pub fn has_writes(&self) -> bool {
        !self.blocks.is_empty()
    }

    /// Buffered extents in address order
    #[cfg(test)]
    pub fn blocks(&self) -> impl Iterator<Item = (u32, &[u8])> {
        self.blocks.iter().map(|(off, data)| (*off, data.as_slice()))
    }

    /// Bytes needed to save the current contents of every extent below
    /// `limit`: an offset word, a length word and the bytes themselves each
    pub fn undo_len(&self, limit: u32) -> u64 {
        self.blocks
            .iter()
            .filter(|(off, _)| **off < limit)
            .map(|(off, data)| 8 + u64::from((limit - off).min(data.len() as u32)))
            .sum()
    }

    /// Append the on-disk bytes each extent below `limit` is about to
    /// overwrite, as `offset, length, bytes` entries
    pub fn capture_originals(&mut self, limit: u32, convert: bool, out: &mut Vec<u8>) -> Result<()> {
        for (off, data) in &self.blocks {
            if *off >= limit {
                continue;
            }
            let len = (limit - off).min(data.len() as u32);
            out.extend_from_slice(&encode_u32(*off, convert));
            out.extend_from_slice(&encode_u32(len, convert));
            let at = out.len();
            out.resize(at + len as usize, 0);
            self.base.read(*off, &mut out[at..])?;
        }
        Ok(())
    }

    /// Write every extent to the real file, in address order
    pub fn apply(&mut self) -> Result<()> {
        let limit = self.write_limit();
        for (off, data) in self.blocks.iter().take(limit) {
            self.base.write(*off, data)?;
        }
        if self.blocks.len() > limit {
            return Err(Error::io(
                "apply transaction",
                std::io::Error::other("write failed"),
            ));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn write_limit(&self) -> usize {
        usize::MAX
    }

    #[cfg(test)]
    fn write_limit(&self) -> usize {
        self.fail_after.unwrap_or(usize::MAX)
    }

    /// Make `apply` fail once `count` extents have reached the file
    #[cfg(test)]
    pub fn fail_after(&mut self, count: usize) {
        self.fail_after = Some(count);
    }

    fn note_hash_heads(&mut self, off: u32, data: &[u8]) {
        let end = off as u64 + data.len() as u64;
        let heads_end = u64::from(FREELIST_TOP) + self.hash_heads.len() as u64 * 4;
        if end <= u64::from(FREELIST_TOP) || u64::from(off) >= heads_end {
            return;
        }
        for (i, head) in self.hash_heads.iter_mut().enumerate() {
            let word = u64::from(FREELIST_TOP) + i as u64 * u64::from(OFFSET_SIZE);
            if word >= u64::from(off) && word + 4 <= end {
                let at = (word - u64::from(off)) as usize;
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&data[at..at + 4]);
                *head = u32::from_ne_bytes(raw);
            }
        }
    }

    fn buffer(&mut self, off: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.note_hash_heads(off, data);
        let start = off;
        let end = off
            .checked_add(data.len() as u32)
            .ok_or_else(|| Error::invalid("transaction write beyond 4 GiB"))?;

        // every extent that overlaps or touches [start, end)
        let touching: Vec<u32> = self
            .blocks
            .range(..=end)
            .rev()
            .take_while(|(s, b)| **s + b.len() as u32 >= start)
            .map(|(s, _)| *s)
            .collect();

        if let [only] = touching.as_slice() {
            if *only <= start {
                if let Some(block) = self.blocks.get_mut(only) {
                    let rel = (start - *only) as usize;
                    if rel + data.len() > block.len() {
                        block.resize(rel + data.len(), 0);
                    }
                    block[rel..rel + data.len()].copy_from_slice(data);
                    return Ok(());
                }
            }
        }

        let mut merged_start = start;
        let mut merged_end = end;
        for s in &touching {
            if let Some(block) = self.blocks.get(s) {
                merged_start = merged_start.min(*s);
                merged_end = merged_end.max(*s + block.len() as u32);
            }
        }
        let mut merged = vec![0u8; (merged_end - merged_start) as usize];
        for s in touching {
            if let Some(block) = self.blocks.remove(&s) {
                let rel = (s - merged_start) as usize;
                merged[rel..rel + block.len()].copy_from_slice(&block);
            }
        }
        let rel = (start - merged_start) as usize;
        merged[rel..rel + data.len()].copy_from_slice(data);
        self.blocks.insert(merged_start, merged);
        Ok(())
    }
}

impl StorageIo for ShadowIo {
    fn size(&self) -> u32 {
        self.size
    }

    fn oob(&mut self, end: u64, probe: bool) -> Result<()> {
        if end <= u64::from(self.size) {
            return Ok(());
        }
        if !probe {
            tracing::error!(end, size = self.size, "transaction access beyond end of file");
        }
        Err(Error::short_io("transaction bounds check", end, self.size))
    }

    fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let end = u64::from(off) + buf.len() as u64;
        self.oob(end, false)?;
        let end = end as u32;

        let first = self
            .blocks
            .range(..=off)
            .next_back()
            .filter(|(s, b)| **s + b.len() as u32 > off)
            .map(|(s, _)| *s);
        let later: Vec<u32> = self
            .blocks
            .range(off.saturating_add(1)..end)
            .map(|(s, _)| *s)
            .collect();

        let mut pos = off;
        for s in first.into_iter().chain(later) {
            let Some(block) = self.blocks.get(&s) else {
                continue;
            };
            if s > pos {
                let (from, to) = ((pos - off) as usize, (s - off) as usize);
                self.base.read(pos, &mut buf[from..to])?;
                pos = s;
            }
            let copy_end = end.min(s + block.len() as u32);
            let (from, to) = ((pos - off) as usize, (copy_end - off) as usize);
            let rel = (pos - s) as usize;
            buf[from..to].copy_from_slice(&block[rel..rel + (to - from)]);
            pos = copy_end;
        }
        if pos < end {
            let from = (pos - off) as usize;
            self.base.read(pos, &mut buf[from..])?;
        }
        Ok(())
    }

    fn write(&mut self, off: u32, data: &[u8]) -> Result<()> {
        self.oob(u64::from(off) + data.len() as u64, false)?;
        self.buffer(off, data)
    }

    fn expand_file(&mut self, size: u32, addition: u32) -> Result<()> {
        let new_size = size
            .checked_add(addition)
            .ok_or_else(|| Error::invalid("database would exceed 4 GiB"))?;
        let mut padding = Vec::new();
        padding
            .try_reserve_exact(addition as usize)
            .map_err(|_| Error::OutOfMemory {
                requested: addition as usize,
            })?;
        padding.resize(addition as usize, 0);
        self.size = new_size;
        self.buffer(size, &padding)
    }

    fn view(&self, _off: u32, _len: u32) -> Option<&[u8]> {
        None
    }

    fn next_hash_chain(&mut self, from: u32, hash_size: u32) -> Result<u32> {
        let mut bucket = from;
        while bucket < hash_size {
            match self.hash_heads.get(bucket as usize + 1) {
                Some(0) => bucket += 1,
                _ => break,
            }
        }
        Ok(bucket)
    }
}
