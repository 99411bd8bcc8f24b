use clap::Parser;
use std::path::PathBuf;
use trivdb_cli::Commands;

#[derive(Parser)]
#[command(name = "trivdbtool")]
#[command(about = "Inspect and edit trivdb databases", long_about = None)]
#[command(version)]
struct Cli {
    /// Database file to operate on
    database: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

fn main() -> eyre::Result<()> {
    trivdb_cli::logging::init().map_err(|e| eyre::eyre!(e))?;
    let cli = Cli::parse();

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    cli.command.execute(&cli.database, &mut out)?;
    Ok(())
}
