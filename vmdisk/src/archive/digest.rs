//! Running SHA-256 over everything an export writes.

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, Write};
use std::rc::Rc;

use sha2::{Digest, Sha256};
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

#[derive(Default)]
struct DigestState {
    hasher: Sha256,
    bytes: u64,
}

/// Handle on a digest that a [`DigestWriter`] keeps updating.
///
/// The writer usually ends up buried inside an archive writer; the
/// operation keeps a clone of this handle so it can read the result
/// without unwrapping the writer stack. Operations are driven from one
/// thread, so a plain `Rc` suffices.
#[derive(Clone, Default)]
pub struct SharedDigest(Rc<RefCell<DigestState>>);

impl SharedDigest {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, data: &[u8]) {
        let mut state = self.0.borrow_mut();
        state.hasher.update(data);
        state.bytes += data.len() as u64;
    }

    /// Number of bytes hashed so far (equals bytes written to the sink).
    pub fn bytes(&self) -> u64 {
        self.0.borrow().bytes
    }

    /// Lowercase hex SHA-256 of everything hashed so far.
    pub fn hex_digest(&self) -> String {
        hex::encode(self.0.borrow().hasher.clone().finalize())
    }
}

/// Writer that forwards to `inner` and hashes exactly the bytes accepted.
pub struct DigestWriter<W> {
    inner: W,
    digest: SharedDigest,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(inner: W, digest: SharedDigest) -> Self {
        Self { inner, digest }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.digest.update(&buf[..written]);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write `digest` in hex plus a trailing newline to the digest sink.
pub fn write_digest_file(sink: &mut File, digest: &SharedDigest) -> VmDiskResult<()> {
    let line = format!("{}\n", digest.hex_digest());
    sink.write_all(line.as_bytes())
        .and_then(|_| sink.flush())
        .map_err(|e| VmDiskError::from_io("failed to write digest", e))
}
