//! vmdisk shared code.
//!
//! Error taxonomy and on-disk format constants used by both the
//! operation engine (vmdisk) and the command-line driver.

pub mod constants;
pub mod errors;

pub use errors::{VmDiskError, VmDiskResult};
