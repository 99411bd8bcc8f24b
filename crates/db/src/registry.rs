//! Tracks which files already have a handle, so one context never opens the
//! same database twice (two handles of one owner would step on each other's
//! locks).

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use trivdb_core::{Error, Result};

/// Device and inode of an open database file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub dev: u64,
    pub ino: u64,
}

impl From<&Metadata> for FileIdentity {
    fn from(meta: &Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }
}

/// Registry of open handles, shared by every handle opened through it
#[derive(Debug, Clone, Default)]
pub struct HandleRegistry {
    open: Arc<Mutex<HashMap<FileIdentity, PathBuf>>>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, identity: FileIdentity, path: &Path) -> Result<Registration> {
        let mut open = self.open.lock();
        if let Some(existing) = open.get(&identity) {
            return Err(Error::invalid(format!(
                "{} is already open as {}",
                path.display(),
                existing.display()
            )));
        }
        open.insert(identity, path.to_path_buf());
        Ok(Registration {
            registry: self.clone(),
            identity,
        })
    }

    pub fn contains(&self, identity: &FileIdentity) -> bool {
        self.open.lock().contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }

    pub fn open_paths(&self) -> Vec<PathBuf> {
        self.open.lock().values().cloned().collect()
    }
}

/// A handle's entry in a registry; removed again on drop
#[derive(Debug)]
pub(crate) struct Registration {
    registry: HandleRegistry,
    identity: FileIdentity,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.identity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_refuses_duplicates_until_dropped() {
        let registry = HandleRegistry::new();
        let id = FileIdentity { dev: 1, ino: 42 };
        let first = registry.register(id, Path::new("/tmp/a.tdb")).unwrap();
        assert!(registry.contains(&id));
        let err = registry.register(id, Path::new("/tmp/b.tdb")).unwrap_err();
        assert!(err.to_string().contains("already open"));
        drop(first);
        assert!(registry.is_empty());
        registry.register(id, Path::new("/tmp/b.tdb")).unwrap();
    }
}
