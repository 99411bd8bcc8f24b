use clap::Subcommand;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

pub mod data;
pub mod maintenance;

/// Failure of a `trivdbtool` command
#[derive(Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Database(#[from] trivdb::Error),

    #[error("failed to write output: {0}")]
    Output(#[from] std::io::Error),

    #[error("failed to encode summary: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Create a new, empty database (an existing file is truncated)
    Create {
        /// Number of hash buckets
        #[arg(long, default_value_t = trivdb::DEFAULT_HASH_SIZE)]
        hash_size: u32,
    },

    /// Show space usage and chain statistics
    Info {
        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// List every key
    Keys,

    /// Print every key and value
    Dump,

    /// Print the value stored under KEY
    Get { key: String },

    /// Store VALUE under KEY
    Set {
        key: String,
        value: String,
        /// Fail if the key already exists
        #[arg(long)]
        insert: bool,
    },

    /// Remove KEY
    Delete { key: String },

    /// Verify the structure of the whole database
    Check,

    /// Remove every record
    Wipe,

    /// Roll back a commit that was interrupted by a crash
    Recover,
}

impl Commands {
    pub fn execute(self, path: &Path, out: &mut dyn Write) -> Result<()> {
        match self {
            Commands::Create { hash_size } => maintenance::create(path, hash_size, out),
            Commands::Info { json } => maintenance::info(path, json, out),
            Commands::Keys => data::keys(path, out),
            Commands::Dump => data::dump(path, out),
            Commands::Get { key } => data::get(path, &key, out),
            Commands::Set { key, value, insert } => data::set(path, &key, &value, insert, out),
            Commands::Delete { key } => data::delete(path, &key, out),
            Commands::Check => maintenance::check(path, out),
            Commands::Wipe => maintenance::wipe(path, out),
            Commands::Recover => maintenance::recover(path, out),
        }
    }
}
