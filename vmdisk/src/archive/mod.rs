//! Archive and codec plumbing for disk image operations.
//!
//! - `handles` - reader/writer ownership with a fixed release order
//! - `format` - container detection and owned import readers
//! - `frame_writer` - zstd writer with a per-frame input cap
//! - `seek_table` - seekable trailer codec, scanner and random access
//! - `digest` - SHA-256 tee over exported bytes
//! - `sparse` - hole-preserving output writer

pub mod digest;
pub mod format;
mod frame_writer;
mod handles;
pub mod seek_table;
mod sparse;

pub use digest::{DigestWriter, SharedDigest};
pub use format::ContainerFormat;
pub use frame_writer::FrameWriter;
pub use handles::ArchiveHandles;
pub use seek_table::{FrameLocation, FrameScanner, SeekTable, SeekTableEntry, SeekTableError};
pub use sparse::SparseWriter;
