//! Byte-level access to the database file.
//!
//! Everything above this module addresses the file through [`StorageIo`].
//! While a transaction is open the handle swaps its [`Backend`] to the
//! shadowing variant, so the allocator and hash-chain code never need to
//! know whether their writes are landing on disk or in memory.

mod direct;
mod shadow;

pub(crate) use direct::DirectIo;
pub(crate) use shadow::ShadowIo;

use crate::layout::bucket_top;
use trivdb_core::Result;

/// Uniform read/write/grow contract shared by the direct and shadow backends
pub(crate) trait StorageIo {
    /// Logical size of the database in bytes
    fn size(&self) -> u32;

    /// Make sure `[0, end)` lies inside the file, refreshing the cached size
    /// (and mapping) if another handle grew it. `probe` suppresses logging.
    fn oob(&mut self, end: u64, probe: bool) -> Result<()>;

    fn read(&mut self, off: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&mut self, off: u32, data: &[u8]) -> Result<()>;

    /// Grow the file from `size` by `addition` bytes
    fn expand_file(&mut self, size: u32, addition: u32) -> Result<()>;

    /// Borrow `[off, off + len)` without copying, when the backend can
    fn view(&self, off: u32, len: u32) -> Option<&[u8]>;

    /// First bucket at or after `from` whose head is non-empty, or
    /// `hash_size` when none is left
    fn next_hash_chain(&mut self, from: u32, hash_size: u32) -> Result<u32> {
        let mut bucket = from;
        while bucket < hash_size {
            let mut word = [0u8; 4];
            self.read(bucket_top(bucket), &mut word)?;
            // zero is zero in either byte order
            if word != [0u8; 4] {
                break;
            }
            bucket += 1;
        }
        Ok(bucket)
    }
}

/// The backend currently serving a handle
pub(crate) enum Backend {
    Direct(DirectIo),
    Shadow(Box<ShadowIo>),
}

impl Backend {
    pub fn io(&mut self) -> &mut dyn StorageIo {
        match self {
            Backend::Direct(direct) => direct,
            Backend::Shadow(shadow) => shadow.as_mut(),
        }
    }

    pub fn io_ref(&self) -> &dyn StorageIo {
        match self {
            Backend::Direct(direct) => direct,
            Backend::Shadow(shadow) => shadow.as_ref(),
        }
    }

    /// The real file, bypassing any shadow
    pub fn base(&mut self) -> &mut DirectIo {
        match self {
            Backend::Direct(direct) => direct,
            Backend::Shadow(shadow) => &mut shadow.base,
        }
    }

    pub fn base_ref(&self) -> &DirectIo {
        match self {
            Backend::Direct(direct) => direct,
            Backend::Shadow(shadow) => &shadow.base,
        }
    }

    pub fn shadow(&mut self) -> Option<&mut ShadowIo> {
        match self {
            Backend::Direct(_) => None,
            Backend::Shadow(shadow) => Some(shadow.as_mut()),
        }
    }

    pub fn shadow_ref(&self) -> Option<&ShadowIo> {
        match self {
            Backend::Direct(_) => None,
            Backend::Shadow(shadow) => Some(shadow.as_ref()),
        }
    }

    /// Route all further access through an in-memory overlay
    pub fn begin_shadow(&mut self, hash_heads: Vec<u32>) {
        if let Backend::Direct(direct) = self {
            let base = std::mem::replace(direct, DirectIo::detached());
            *self = Backend::Shadow(Box::new(ShadowIo::new(base, hash_heads)));
        }
    }

    /// Drop the overlay and hand it back; the direct backend serves again
    pub fn end_shadow(&mut self) -> Option<ShadowIo> {
        let base = match self {
            Backend::Shadow(shadow) => std::mem::replace(&mut shadow.base, DirectIo::detached()),
            Backend::Direct(_) => return None,
        };
        match std::mem::replace(self, Backend::Direct(base)) {
            Backend::Shadow(shadow) => Some(*shadow),
            Backend::Direct(_) => None,
        }
    }
}
