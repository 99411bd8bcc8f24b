//! Whole-database commands.

use super::data::open_existing;
use super::Result;
use std::io::Write;
use std::path::Path;
use trivdb::TdbConfig;

pub fn create(path: &Path, hash_size: u32, out: &mut dyn Write) -> Result<()> {
    let tdb = TdbConfig::builder()
        .with_hash_size(hash_size)
        .truncate(true)
        .build()
        .open(path)?;
    let hash_size = tdb.hash_size();
    tdb.close()?;
    writeln!(
        out,
        "Created {} with {hash_size} hash buckets",
        path.display()
    )?;
    Ok(())
}

pub fn info(path: &Path, json: bool, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, true)?;
    let summary = tdb.summary()?;
    if json {
        serde_json::to_writer_pretty(&mut *out, &summary)?;
        writeln!(out)?;
    } else {
        writeln!(out, "{summary}")?;
    }
    Ok(())
}

pub fn check(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, true)?;
    let mut records = 0usize;
    let mut count = |_: &[u8], _: &[u8]| -> trivdb::Result<()> {
        records += 1;
        Ok(())
    };
    tdb.check(Some(&mut count))?;
    writeln!(
        out,
        "Database integrity is OK and has {records} records."
    )?;
    Ok(())
}

pub fn wipe(path: &Path, out: &mut dyn Write) -> Result<()> {
    let mut tdb = open_existing(path, false)?;
    tdb.wipe_all()?;
    tdb.close()?;
    writeln!(out, "Wiped {}", path.display())?;
    Ok(())
}

pub fn recover(path: &Path, out: &mut dyn Write) -> Result<()> {
    // opening replays a pending recovery record already
    let mut tdb = open_existing(path, false)?;
    tdb.recover()?;
    tdb.close()?;
    writeln!(out, "Recovery complete for {}", path.display())?;
    Ok(())
}
