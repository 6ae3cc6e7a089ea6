//! Sparse-preserving file writer.
//!
//! Disk images are mostly holes. Writing decompressed zeros back would
//! allocate every block, so all-zero runs are skipped with a seek and the
//! final length is fixed with `set_len`.

use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};

use crate::disk::constants::copy::HOLE_GRANULARITY;

pub struct SparseWriter {
    file: File,
    position: u64,
    /// Bytes skipped as holes, for logging.
    hole_bytes: u64,
}

impl SparseWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            position: 0,
            hole_bytes: 0,
        }
    }

    /// Logical size written so far, holes included.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn hole_bytes(&self) -> u64 {
        self.hole_bytes
    }

    /// Write `data` at the current position, punching holes for zero runs.
    pub fn write_block(&mut self, data: &[u8]) -> io::Result<()> {
        let mut pending_hole = 0u64;
        for chunk in data.chunks(HOLE_GRANULARITY) {
            if chunk.iter().all(|&b| b == 0) {
                pending_hole += chunk.len() as u64;
                continue;
            }
            if pending_hole > 0 {
                self.skip(pending_hole)?;
                pending_hole = 0;
            }
            self.file.write_all(chunk)?;
            self.position += chunk.len() as u64;
        }
        if pending_hole > 0 {
            self.skip(pending_hole)?;
        }
        Ok(())
    }

    /// Extend the file over any trailing hole and return it.
    pub fn finish(self) -> io::Result<File> {
        self.file.set_len(self.position)?;
        self.file.sync_all()?;
        Ok(self.file)
    }

    fn skip(&mut self, len: u64) -> io::Result<()> {
        self.file.seek(SeekFrom::Current(len as i64))?;
        self.position += len;
        self.hole_bytes += len;
        Ok(())
    }
}
