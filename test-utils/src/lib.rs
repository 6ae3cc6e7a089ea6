//! Shared fixtures for vmdisk integration tests.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::TempDir;
use vmdisk::{DiskImageOperation, DiskImageStatus, VmId};

/// Isolated scratch directory, removed when dropped.
pub struct TestContext {
    pub root: PathBuf,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        Self {
            root: temp_dir.path().to_path_buf(),
            _temp_dir: temp_dir,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    /// Write `bytes` to `name` and return its path.
    pub fn write_file(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent dir");
        }
        fs::write(&path, bytes).expect("Failed to write fixture");
        path
    }

    /// Create a sparse file of `len` bytes with `chunks` written at the
    /// given offsets and holes everywhere else.
    pub fn sparse_file(&self, name: &str, len: u64, chunks: &[(u64, &[u8])]) -> PathBuf {
        let path = self.path(name);
        let mut file = File::create(&path).expect("Failed to create sparse fixture");
        file.set_len(len).expect("Failed to size sparse fixture");
        for (offset, data) in chunks {
            file.seek(SeekFrom::Start(*offset)).unwrap();
            file.write_all(data).unwrap();
        }
        path
    }

    /// Empty file opened for reading and writing, as export outputs need.
    pub fn output(&self, name: &str) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.path(name))
            .expect("Failed to create output file")
    }

    pub fn open(&self, name: &str) -> File {
        File::open(self.path(name)).expect("Failed to open fixture")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

pub fn vm() -> VmId {
    VmId::new("0123456789abcdef", "termina")
}

/// Deterministic, moderately compressible image contents.
pub fn image_bytes(len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 512) as u8).wrapping_mul(31) ^ (i % 13) as u8)
        .collect()
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> String {
    sha256_hex(&fs::read(path).expect("Failed to read file for digest"))
}

/// Run `op` with `io_limit` until it leaves IN_PROGRESS.
///
/// Panics if `processed_size` ever decreases or the operation needs an
/// absurd number of steps.
pub fn drive_to_completion(op: &mut DiskImageOperation, io_limit: u64) -> DiskImageStatus {
    let mut last = op.processed_size();
    for _ in 0..1_000_000 {
        if op.status() != DiskImageStatus::InProgress {
            return op.status();
        }
        op.run(io_limit).expect("run() on unfinished operation");
        assert!(op.processed_size() >= last, "processed_size went backwards");
        last = op.processed_size();
    }
    panic!("operation {} did not finish", op.uuid());
}
