//! Core types, errors, and on-disk constants for `trivdb`.
//!
//! - **`errors`**: the `Error` enum, the flat `ErrorCode` and the `Result`
//!   alias shared by every crate in the workspace.
//! - **`types`**: `Offset`, `Flags`, store modes, lock kinds and the default
//!   key hash.
//! - **`constants`**: header layout, record tags and lock offsets.

pub mod constants;
pub mod errors;
pub mod types;

pub use self::{
    constants::*,
    errors::{Error, ErrorCode, Result},
    types::*,
};
