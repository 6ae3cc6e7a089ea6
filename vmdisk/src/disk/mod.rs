//! Disk image helpers.
//!
//! This module provides the on-host pieces every operation needs:
//! - `StagingDir` - RAII wrapper for exclusively owned staging directories
//! - `user_chosen_size` - the "pre-sized, do not auto-resize" marker
//! - `constants` - file modes, block sizes, compression levels

pub mod constants;
mod staging;
pub mod user_chosen_size;

pub use staging::StagingDir;
