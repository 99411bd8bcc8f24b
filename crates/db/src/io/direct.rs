use super::StorageIo;
use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::File;
use std::os::unix::fs::FileExt;
use trivdb_core::{Error, Result};

const FILL_CHUNK: usize = 64 * 1024;

/// A live mapping of the whole file
enum Mapping {
    ReadOnly(Mmap),
    ReadWrite(MmapMut),
}

impl Mapping {
    fn bytes(&self) -> &[u8] {
        match self {
            Mapping::ReadOnly(map) => map,
            Mapping::ReadWrite(map) => map,
        }
    }
}

enum Store {
    File { file: File, map: Option<Mapping> },
    Memory(Vec<u8>),
}

/// Positioned reads and writes, or a memory mapping, over the real file.
/// In-memory databases keep their bytes in a plain buffer instead.
pub(crate) struct DirectIo {
    store: Store,
    size: u32,
    read_only: bool,
    use_mmap: bool,
}

impl DirectIo {
    pub fn open_file(file: File, read_only: bool, use_mmap: bool) -> Result<Self> {
        let len = file
            .metadata()
            .map_err(|e| Error::io("stat database", e))?
            .len();
        let size = u32::try_from(len)
            .map_err(|_| Error::invalid(format!("database of {len} bytes exceeds 4 GiB")))?;
        let mut io = Self {
            store: Store::File { file, map: None },
            size,
            read_only,
            use_mmap,
        };
        io.remap()?;
        Ok(io)
    }

    pub fn memory(bytes: Vec<u8>) -> Result<Self> {
        let size = u32::try_from(bytes.len())
            .map_err(|_| Error::invalid("in-memory database exceeds 4 GiB"))?;
        Ok(Self {
            store: Store::Memory(bytes),
            size,
            read_only: false,
            use_mmap: false,
        })
    }

    /// Placeholder used while the real backend is being moved around
    pub fn detached() -> Self {
        Self {
            store: Store::Memory(Vec::new()),
            size: 0,
            read_only: true,
            use_mmap: false,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self.store, Store::File { map: Some(_), .. })
    }

    /// Drop and re-create the mapping so it covers the current size
    pub fn remap(&mut self) -> Result<()> {
        let (read_only, use_mmap, size) = (self.read_only, self.use_mmap, self.size);
        if let Store::File { file, map } = &mut self.store {
            *map = None;
            if !use_mmap || size == 0 {
                return Ok(());
            }
            let mut options = MmapOptions::new();
            options.len(size as usize);
            let mapping = if read_only {
                unsafe { options.map(&*file) }.map(Mapping::ReadOnly)
            } else {
                unsafe { options.map_mut(&*file) }.map(Mapping::ReadWrite)
            };
            match mapping {
                Ok(mapping) => *map = Some(mapping),
                Err(e) => {
                    // fall back to positioned I/O for the rest of this handle
                    tracing::warn!(error = %e, "mmap failed, using read/write");
                    self.use_mmap = false;
                }
            }
        }
        Ok(())
    }

    /// Durably flush `[off, off + len)`
    pub fn sync(&mut self, off: u32, len: u32) -> Result<()> {
        if let Store::File { file, map } = &mut self.store {
            if let Some(Mapping::ReadWrite(map)) = map {
                let end = (off as usize).saturating_add(len as usize).min(map.len());
                let start = (off as usize).min(end);
                map.flush_range(start, end - start)
                    .map_err(|e| Error::io("msync", e))?;
            }
            file.sync_data().map_err(|e| Error::io("fsync", e))?;
        }
        Ok(())
    }

    /// Cut the file down (or extend it sparsely) to exactly `len` bytes
    pub fn truncate(&mut self, len: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        match &mut self.store {
            Store::File { file, map } => {
                *map = None;
                file.set_len(u64::from(len))
                    .map_err(|e| Error::io("truncate", e))?;
            }
            Store::Memory(bytes) => bytes.resize(len as usize, 0),
        }
        self.size = len;
        self.remap()
    }

    /// Re-read the file length from the filesystem
    fn refresh_size(&mut self) -> Result<()> {
        if let Store::File { file, .. } = &self.store {
            let len = file
                .metadata()
                .map_err(|e| Error::io("stat database", e))?
                .len();
            let len = u32::try_from(len)
                .map_err(|_| Error::corrupt(format!("database grew to {len} bytes")))?;
            if len != self.size {
                self.size = len;
                self.remap()?;
            }
        }
        Ok(())
    }
}

impl StorageIo for DirectIo {
    fn size(&self) -> u32 {
        self.size
    }

    fn oob(&mut self, end: u64, probe: bool) -> Result<()> {
        if end <= u64::from(self.size) {
            return Ok(());
        }
        self.refresh_size()?;
        if end <= u64::from(self.size) {
            return Ok(());
        }
        if !probe {
            tracing::error!(end, size = self.size, "access beyond end of file");
        }
        Err(Error::short_io("bounds check", end, self.size))
    }

    fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.oob(u64::from(off) + buf.len() as u64, false)?;
        let start = off as usize;
        match &self.store {
            Store::File { map: Some(map), .. } => {
                buf.copy_from_slice(&map.bytes()[start..start + buf.len()]);
            }
            Store::File { file, map: None } => {
                file.read_exact_at(buf, u64::from(off))
                    .map_err(|e| Error::io("read", e))?;
            }
            Store::Memory(bytes) => buf.copy_from_slice(&bytes[start..start + buf.len()]),
        }
        Ok(())
    }

    fn write(&mut self, off: u32, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        self.oob(u64::from(off) + data.len() as u64, false)?;
        let start = off as usize;
        match &mut self.store {
            Store::File {
                map: Some(Mapping::ReadWrite(map)),
                ..
            } => map[start..start + data.len()].copy_from_slice(data),
            Store::File { file, .. } => file
                .write_all_at(data, u64::from(off))
                .map_err(|e| Error::io("write", e))?,
            Store::Memory(bytes) => bytes[start..start + data.len()].copy_from_slice(data),
        }
        Ok(())
    }

    fn expand_file(&mut self, size: u32, addition: u32) -> Result<()> {
        if self.read_only {
            return Err(Error::ReadOnly);
        }
        let new_size = size
            .checked_add(addition)
            .ok_or_else(|| Error::invalid("database would exceed 4 GiB"))?;
        match &mut self.store {
            Store::File { file, map } => {
                *map = None;
                file.set_len(u64::from(new_size))
                    .map_err(|e| Error::io("expand file", e))?;
                // write the new space out so a full disk fails here, not on a
                // later store through the mapping
                let zeros = vec![0u8; FILL_CHUNK.min(addition as usize)];
                let mut pos = u64::from(size);
                while pos < u64::from(new_size) {
                    let n = zeros.len().min((u64::from(new_size) - pos) as usize);
                    file.write_all_at(&zeros[..n], pos)
                        .map_err(|e| Error::io("expand file", e))?;
                    pos += n as u64;
                }
            }
            Store::Memory(bytes) => {
                bytes
                    .try_reserve(addition as usize)
                    .map_err(|_| Error::OutOfMemory {
                        requested: addition as usize,
                    })?;
                bytes.resize(new_size as usize, 0);
            }
        }
        self.size = new_size;
        self.remap()
    }

    fn view(&self, off: u32, len: u32) -> Option<&[u8]> {
        let start = off as usize;
        let end = start.checked_add(len as usize)?;
        match &self.store {
            Store::File { map: Some(map), .. } => map.bytes().get(start..end),
            Store::File { map: None, .. } => None,
            Store::Memory(bytes) => bytes.get(start..end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use tempfile::TempDir;

    fn open(dir: &TempDir, use_mmap: bool) -> DirectIo {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(dir.path().join("io.tdb"))
            .unwrap();
        DirectIo::open_file(file, false, use_mmap).unwrap()
    }

    #[test]
    fn test_grow_then_read_write() {
        for use_mmap in [true, false] {
            let dir = TempDir::new().unwrap();
            let mut io = open(&dir, use_mmap);
            assert_eq!(io.size(), 0);
            io.expand_file(0, 8192).unwrap();
            assert_eq!(io.size(), 8192);
            io.write(100, b"hello").unwrap();
            let mut buf = [0u8; 5];
            io.read(100, &mut buf).unwrap();
            assert_eq!(&buf, b"hello");
            assert_eq!(io.view(100, 5).is_some(), use_mmap);
        }
    }

    #[test]
    fn test_out_of_bounds_is_io_error() {
        let dir = TempDir::new().unwrap();
        let mut io = open(&dir, true);
        io.expand_file(0, 16).unwrap();
        let mut buf = [0u8; 8];
        let err = io.read(12, &mut buf).unwrap_err();
        assert_eq!(err.code(), trivdb_core::ErrorCode::Io);
    }

    #[test]
    fn test_oob_notices_growth_by_someone_else() {
        let dir = TempDir::new().unwrap();
        let mut io = open(&dir, true);
        io.expand_file(0, 16).unwrap();
        OpenOptions::new()
            .write(true)
            .open(dir.path().join("io.tdb"))
            .unwrap()
            .set_len(64)
            .unwrap();
        io.oob(64, true).unwrap();
        assert_eq!(io.size(), 64);
    }

    #[test]
    fn test_memory_backend() {
        let mut io = DirectIo::memory(vec![0u8; 32]).unwrap();
        io.write(0, b"abcd").unwrap();
        assert_eq!(io.view(0, 4), Some(&b"abcd"[..]));
        io.truncate(8).unwrap();
        assert_eq!(io.size(), 8);
    }
}
