use std::path::{Path, PathBuf};
use tempfile::TempDir;
use trivdb_cli::{CliError, Commands};

fn run(path: &Path, command: Commands) -> Result<String, CliError> {
    let mut out = Vec::new();
    command.execute(path, &mut out)?;
    Ok(String::from_utf8(out).unwrap())
}

fn created(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("tool.tdb");
    run(&path, Commands::Create { hash_size: 17 }).unwrap();
    path
}

fn set(path: &Path, key: &str, value: &str) {
    run(
        path,
        Commands::Set {
            key: key.to_string(),
            value: value.to_string(),
            insert: false,
        },
    )
    .unwrap();
}

#[test]
fn test_set_get_delete() {
    let dir = TempDir::new().unwrap();
    let path = created(&dir);
    set(&path, "colour", "blue");

    let value = run(&path, Commands::Get { key: "colour".into() }).unwrap();
    assert_eq!(value, "blue\n");

    run(&path, Commands::Delete { key: "colour".into() }).unwrap();
    let err = run(&path, Commands::Get { key: "colour".into() }).unwrap_err();
    assert!(matches!(err, CliError::Database(trivdb::Error::NotFound)));
}

#[test]
fn test_insert_refuses_existing_key() {
    let dir = TempDir::new().unwrap();
    let path = created(&dir);
    set(&path, "k", "v");
    let err = run(
        &path,
        Commands::Set {
            key: "k".into(),
            value: "w".into(),
            insert: true,
        },
    )
    .unwrap_err();
    assert!(matches!(err, CliError::Database(trivdb::Error::Exists)));
}

#[test]
fn test_keys_and_dump_escape_bytes() {
    let dir = TempDir::new().unwrap();
    let path = created(&dir);
    set(&path, "a", "line\nbreak");
    set(&path, "b", "2");

    let keys = run(&path, Commands::Keys).unwrap();
    let mut keys: Vec<&str> = keys.lines().collect();
    keys.sort_unstable();
    assert_eq!(keys, ["a", "b"]);

    let dump = run(&path, Commands::Dump).unwrap();
    assert!(dump.contains("key(1) = \"a\"\ndata(10) = \"line\\x0Abreak\"\n"));
}

#[test]
fn test_info_json_and_text() {
    let dir = TempDir::new().unwrap();
    let path = created(&dir);
    set(&path, "x", "1");

    let json = run(&path, Commands::Info { json: true }).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["records"], 1);
    assert_eq!(value["hash_size"], 17);

    let text = run(&path, Commands::Info { json: false }).unwrap();
    assert!(text.contains("Number of records: 1"));
}

#[test]
fn test_check_wipe_recover() {
    let dir = TempDir::new().unwrap();
    let path = created(&dir);
    set(&path, "one", "1");
    set(&path, "two", "2");

    let report = run(&path, Commands::Check).unwrap();
    assert!(report.contains("has 2 records"));

    run(&path, Commands::Wipe).unwrap();
    assert_eq!(run(&path, Commands::Keys).unwrap(), "");
    run(&path, Commands::Recover).unwrap();
    assert!(run(&path, Commands::Check).unwrap().contains("has 0 records"));
}

#[test]
fn test_missing_database_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = run(&dir.path().join("absent.tdb"), Commands::Keys).unwrap_err();
    assert!(matches!(err, CliError::Database(trivdb::Error::Io { .. })));
}
