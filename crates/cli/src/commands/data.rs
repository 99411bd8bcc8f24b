//! Reading and editing records.

use super::Result;
use crate::escape::escape;
use std::io::{self, Write};
use std::ops::ControlFlow;
use std::path::Path;
use trivdb::{StoreMode, Tdb, TdbConfig};

pub(crate) fn open_existing(path: &Path, read_only: bool) -> trivdb::Result<Tdb> {
    TdbConfig::builder()
        .create(false)
        .read_only(read_only)
        .build()
        .open(path)
}

/// Walk every record read-only, stopping at the first output error
fn for_each_record(
    tdb: &mut Tdb,
    mut f: impl FnMut(&[u8], &[u8]) -> io::Result<()>,
) -> Result<usize> {
    let mut failure = None;
    let visited = tdb.traverse_read(|_, key, value| match f(key, value) {
        Ok(()) => ControlFlow::Continue(()),
        Err(e) => {
            failure = Some(e);
            ControlFlow::Break(())
        }
    })?;
    match failure {
        Some(e) => Err(e.into()),
        None => Ok(visited),
    }
}

pub fn keys(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, true)?;
    for_each_record(&mut tdb, |key, _| writeln!(out, "{}", escape(key)))?;
    Ok(())
}

pub fn dump(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, true)?;
    for_each_record(&mut tdb, |key, value| {
        writeln!(out, "key({}) = \"{}\"", key.len(), escape(key))?;
        writeln!(out, "data({}) = \"{}\"", value.len(), escape(value))?;
        writeln!(out)
    })?;
    Ok(())
}

pub fn get(path: &Path, key: &str, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, true)?;
    match tdb.fetch(key.as_bytes())? {
        Some(value) => writeln!(out, "{}", escape(&value))?,
        None => return Err(trivdb::Error::NotFound.into()),
    }
    Ok(())
}

pub fn set(path: &Path, key: &str, value: &str, insert: bool, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, false)?;
    let mode = if insert {
        StoreMode::Insert
    } else {
        StoreMode::Replace
    };
    tdb.store(key.as_bytes(), value.as_bytes(), mode)?;
    tdb.close()?;
    tracing::debug!(key, "stored");
    writeln!(out, "Stored {}", escape(key.as_bytes()))?;
    Ok(())
}

pub fn delete(path: &Path, key: &str, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, false)?;
    tdb.delete(key.as_bytes())?;
    tdb.close()?;
    writeln!(out, "Deleted {}", escape(key.as_bytes()))?;
    Ok(())
}
