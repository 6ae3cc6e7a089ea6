//! Guest (Termina) VM disk export into a seekable zstd container.
//!
//! Two passes over the data: the source is compressed into frames of at
//! most 128 KiB of input, then the written payload is walked frame by
//! frame to build the seek table, which is appended as a trailer. The
//! declared source size is twice the file length so progress covers both
//! passes.

use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;

use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

use super::{DiskImageOperation, DiskImageStatus, OperationState, VmId};
use crate::archive::digest::write_digest_file;
use crate::archive::{
    ArchiveHandles, DigestWriter, FrameScanner, FrameWriter, SeekTable, SharedDigest,
};
use crate::options::DiskOpsOptions;
use crate::util::chunk_len;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExportPhase {
    BeforeOnlyEntry,
    Copying,
    FinishedCopy,
    CalculatingSeekTable { offset: u64 },
    WriteSeekTable,
    Done,
}

pub struct TerminaVmExportOperation {
    state: OperationState,
    source: PathBuf,
    block_size: usize,
    phase: ExportPhase,
    handles: ArchiveHandles<File, FrameWriter<DigestWriter<File>>>,
    /// Output once the payload is complete; the trailer goes here.
    sealed: Option<DigestWriter<File>>,
    payload_end: u64,
    table: SeekTable,
    scanner: Option<FrameScanner>,
    digest: SharedDigest,
    digest_sink: Option<File>,
    buffer: Vec<u8>,
}

impl TerminaVmExportOperation {
    /// Export the disk image at `source` into `out`.
    ///
    /// `out` must be an empty regular file opened for reading and
    /// writing: the seek table pass reads the payload back from it.
    pub fn create(
        vm_id: VmId,
        source: PathBuf,
        out: File,
        digest_sink: Option<File>,
        options: &DiskOpsOptions,
    ) -> DiskImageOperation {
        let mut op = Self {
            state: OperationState::new(vm_id),
            source,
            block_size: options.block_size(),
            phase: ExportPhase::BeforeOnlyEntry,
            handles: ArchiveHandles::new(),
            sealed: None,
            payload_end: 0,
            table: SeekTable::new(),
            scanner: None,
            digest: SharedDigest::new(),
            digest_sink,
            buffer: Vec::new(),
        };

        let prepared = op
            .prepare_input()
            .and_then(|_| op.prepare_output(out, options.export_compression_level));
        if prepared.is_err() {
            op.release();
        }
        op.state.finish_prepare(prepared);

        tracing::info!(
            uuid = %op.state.uuid(),
            vm = %op.state.vm_id(),
            source = %op.source.display(),
            status = %op.state.status(),
            "Created guest VM export operation"
        );
        DiskImageOperation::GuestExport(op)
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Number of frames in the seek table built so far.
    pub fn frame_count(&self) -> usize {
        self.table.len()
    }

    fn prepare_input(&mut self) -> VmDiskResult<()> {
        let source = File::open(&self.source).map_err(|e| {
            VmDiskError::from_io(format!("failed to open {}", self.source.display()), e)
        })?;
        let metadata = source.metadata().map_err(|e| {
            VmDiskError::from_io(format!("failed to stat {}", self.source.display()), e)
        })?;
        if metadata.is_dir() {
            return Err(VmDiskError::InvalidArgument(format!(
                "{} is a directory, expected a disk image file",
                self.source.display()
            )));
        }
        if !metadata.is_file() {
            return Err(VmDiskError::InvalidArgument(format!(
                "{} is not a regular file",
                self.source.display()
            )));
        }

        self.state.set_source_size(metadata.len().saturating_mul(2));
        self.handles.set_reader(source);
        Ok(())
    }

    fn prepare_output(&mut self, out: File, level: i32) -> VmDiskResult<()> {
        let existing = out
            .metadata()
            .map_err(|e| VmDiskError::from_io("failed to stat export output", e))?
            .len();
        if existing != 0 {
            return Err(VmDiskError::InvalidArgument(format!(
                "export output already holds {} bytes",
                existing
            )));
        }

        let writer = FrameWriter::new(DigestWriter::new(out, self.digest.clone()), level)
            .map_err(|e| VmDiskError::Codec(format!("failed to create zstd compressor: {}", e)))?;
        self.handles.set_writer(writer);
        self.buffer = vec![0u8; self.block_size];
        Ok(())
    }

    pub(crate) fn execute_io(&mut self, io_limit: u64) -> bool {
        match self.advance(io_limit) {
            Ok(done) => done,
            Err(e) => {
                self.release();
                self.state.fail(e);
                false
            }
        }
    }

    fn advance(&mut self, io_limit: u64) -> VmDiskResult<bool> {
        let mut budget = io_limit;
        while self.state.is_in_progress() && budget > 0 {
            match self.phase {
                ExportPhase::BeforeOnlyEntry => {
                    tracing::debug!(
                        uuid = %self.state.uuid(),
                        source = %self.source.display(),
                        "Compressing disk image"
                    );
                    self.phase = ExportPhase::Copying;
                }
                ExportPhase::Copying => {
                    let n = self.copy_chunk(budget)?;
                    if n == 0 {
                        self.phase = ExportPhase::FinishedCopy;
                        continue;
                    }
                    self.state.add_processed(n);
                    budget = budget.saturating_sub(n);
                }
                ExportPhase::FinishedCopy => self.seal_payload()?,
                ExportPhase::CalculatingSeekTable { offset } => {
                    if offset >= self.payload_end {
                        self.phase = ExportPhase::WriteSeekTable;
                        continue;
                    }
                    let decompressed = self.measure_frame(offset)?;
                    self.state.add_processed(decompressed);
                    budget = budget.saturating_sub(decompressed);
                }
                ExportPhase::WriteSeekTable => {
                    self.write_seek_table()?;
                    self.phase = ExportPhase::Done;
                    return Ok(true);
                }
                ExportPhase::Done => return Ok(true),
            }
        }
        Ok(false)
    }

    fn copy_chunk(&mut self, budget: u64) -> VmDiskResult<u64> {
        let (reader, writer) = self.handles.both_mut().ok_or_else(|| {
            VmDiskError::InvalidState("export handles already released".to_string())
        })?;

        let len = chunk_len(budget, self.block_size);
        let n = loop {
            match reader.read(&mut self.buffer[..len]) {
                Ok(n) => break n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    return Err(VmDiskError::from_io(
                        format!("failed to read {}", self.source.display()),
                        e,
                    ));
                }
            }
        };
        if n > 0 {
            writer
                .write_input(&self.buffer[..n])
                .map_err(|e| VmDiskError::from_io("failed to write compressed payload", e))?;
        }
        Ok(n as u64)
    }

    /// Close the compressor and get ready to scan what it wrote.
    fn seal_payload(&mut self) -> VmDiskResult<()> {
        self.handles.close_reader();
        let writer = self.handles.take_writer().ok_or_else(|| {
            VmDiskError::InvalidState("export writer already released".to_string())
        })?;
        let frames = writer.frames();
        let sealed = writer
            .finish()
            .map_err(|e| VmDiskError::from_io("failed to flush compressed payload", e))?;

        self.payload_end = self.digest.bytes();
        self.sealed = Some(sealed);
        self.scanner = Some(FrameScanner::new()?);
        self.phase = ExportPhase::CalculatingSeekTable { offset: 0 };
        tracing::debug!(
            uuid = %self.state.uuid(),
            payload = self.payload_end,
            frames,
            "Compressed payload written, building seek table"
        );
        Ok(())
    }

    /// Record the frame at `offset`; returns its decompressed size.
    fn measure_frame(&mut self, offset: u64) -> VmDiskResult<u64> {
        let (Some(sealed), Some(scanner)) = (self.sealed.as_ref(), self.scanner.as_mut()) else {
            return Err(VmDiskError::InvalidState(
                "export output already released".to_string(),
            ));
        };

        let entry = scanner.measure(sealed.get_ref(), offset, self.payload_end)?;
        if entry.compressed_size == 0 {
            return Err(VmDiskError::Integrity(format!(
                "empty frame at offset {}",
                offset
            )));
        }
        self.table.push(entry)?;
        self.phase = ExportPhase::CalculatingSeekTable {
            offset: offset + u64::from(entry.compressed_size),
        };
        tracing::trace!(
            uuid = %self.state.uuid(),
            offset,
            compressed = entry.compressed_size,
            decompressed = entry.decompressed_size,
            "Measured payload frame"
        );
        Ok(u64::from(entry.decompressed_size))
    }

    fn write_seek_table(&mut self) -> VmDiskResult<()> {
        let trailer = self.table.encode()?;
        let sealed = self.sealed.as_mut().ok_or_else(|| {
            VmDiskError::InvalidState("export output already released".to_string())
        })?;
        sealed
            .write_all(&trailer)
            .and_then(|_| sealed.flush())
            .map_err(|e| VmDiskError::from_io("failed to write seek table", e))?;

        tracing::debug!(
            uuid = %self.state.uuid(),
            frames = self.table.len(),
            bytes = trailer.len(),
            "Seek table written"
        );
        Ok(())
    }

    pub(crate) fn finalize(&mut self) {
        if let Err(e) = self.commit() {
            self.release();
            self.state.fail(e);
        }
    }

    fn commit(&mut self) -> VmDiskResult<()> {
        self.scanner = None;
        if let Some(sealed) = self.sealed.take() {
            sealed
                .into_inner()
                .sync_all()
                .map_err(|e| VmDiskError::from_io("failed to sync export output", e))?;
        }

        if let Some(sink) = self.digest_sink.as_mut() {
            write_digest_file(sink, &self.digest)?;
        }
        self.state.set_status(DiskImageStatus::Created);
        Ok(())
    }

    fn release(&mut self) {
        self.handles.release();
        self.scanner = None;
        self.sealed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};
    use std::fs::OpenOptions;
    use tempfile::TempDir;
    use vmdisk_shared::constants::seekable::MAX_FRAME_INPUT;

    fn open_rw(path: &std::path::Path) -> File {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .unwrap()
    }

    fn image(len: usize) -> Vec<u8> {
        (0..len).map(|i| ((i / 1000) % 7) as u8).collect()
    }

    #[test]
    fn test_export_builds_consistent_seek_table() {
        let dir = TempDir::new().unwrap();
        let data = image(3 * MAX_FRAME_INPUT + 1234);
        let source = dir.path().join("termina.img");
        std::fs::write(&source, &data).unwrap();
        let out_path = dir.path().join("termina.zst");
        let digest_path = dir.path().join("termina.sha256");

        let mut op = TerminaVmExportOperation::create(
            VmId::new("owner", "termina"),
            source,
            open_rw(&out_path),
            Some(File::create(&digest_path).unwrap()),
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.source_size(), 2 * data.len() as u64);

        let mut last = 0;
        while op.status() == DiskImageStatus::InProgress {
            op.run(50_000).unwrap();
            assert!(op.processed_size() >= last);
            last = op.processed_size();
        }
        assert_eq!(op.status(), DiskImageStatus::Created);
        assert_eq!(op.processed_size(), 2 * data.len() as u64);

        let out = std::fs::read(&out_path).unwrap();
        assert_eq!(zstd::decode_all(&out[..]).unwrap(), data);

        let table = SeekTable::read_from(&File::open(&out_path).unwrap()).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table.decompressed_size(), data.len() as u64);
        assert!(
            table
                .entries()
                .iter()
                .all(|e| e.decompressed_size as usize <= MAX_FRAME_INPUT)
        );

        let digest = std::fs::read_to_string(&digest_path).unwrap();
        assert_eq!(digest, format!("{}\n", hex::encode(Sha256::digest(&out))));
    }

    #[test]
    fn test_empty_image_gets_one_empty_frame() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("empty.img");
        std::fs::write(&source, b"").unwrap();
        let out_path = dir.path().join("empty.zst");

        let mut op = TerminaVmExportOperation::create(
            VmId::new("owner", "termina"),
            source,
            open_rw(&out_path),
            None,
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.run(1).unwrap(), DiskImageStatus::Created);

        let out = std::fs::read(&out_path).unwrap();
        assert_eq!(&out[..4], &[0x28, 0xB5, 0x2F, 0xFD]);

        let table = SeekTable::read_from(&File::open(&out_path).unwrap()).unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.entries()[0].decompressed_size, 0);
        assert_eq!(table.decompressed_size(), 0);
    }

    #[test]
    fn test_directory_source_is_rejected() {
        let dir = TempDir::new().unwrap();
        let op = TerminaVmExportOperation::create(
            VmId::new("owner", "termina"),
            dir.path().to_path_buf(),
            open_rw(&dir.path().join("out.zst")),
            None,
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.status(), DiskImageStatus::Failed);
        assert!(op.failure_reason().contains("is a directory"));
    }

    #[test]
    fn test_non_empty_output_is_rejected() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("termina.img");
        std::fs::write(&source, b"data").unwrap();
        let out_path = dir.path().join("out.zst");
        std::fs::write(&out_path, b"stale").unwrap();

        let op = TerminaVmExportOperation::create(
            VmId::new("owner", "termina"),
            source,
            OpenOptions::new()
                .read(true)
                .write(true)
                .open(&out_path)
                .unwrap(),
            None,
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.status(), DiskImageStatus::Failed);
    }

    #[test]
    fn test_write_only_output_fails_during_scan() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("termina.img");
        std::fs::write(&source, image(1000)).unwrap();

        let mut op = TerminaVmExportOperation::create(
            VmId::new("owner", "termina"),
            source,
            File::create(dir.path().join("out.zst")).unwrap(),
            None,
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.run(u64::MAX).unwrap(), DiskImageStatus::Failed);
        assert!(op.run(u64::MAX).is_err());
    }
}
