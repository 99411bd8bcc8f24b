//! Command implementations behind the `trivdbtool` binary.

pub mod commands;
pub mod escape;
pub mod logging;

pub use commands::{CliError, Commands};
