//! Guest (Termina) VM disk import.
//!
//! Accepts either export container: a raw zstd stream (with or without
//! the seek table trailer) or a ZIP holding one entry named after the
//! destination. The image is extracted into `<dest><suffix>/` and only
//! renamed onto `dest` once complete, so a failed import never leaves a
//! partial file at the destination. The staging directory doubles as the
//! guard against two concurrent imports of the same destination.

use std::cell::Cell;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, Permissions};
use std::io::Read;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::rc::Rc;

use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

use super::{DiskImageOperation, DiskImageStatus, OperationState, VmId};
use crate::archive::format::{self, ZipEntryInfo};
use crate::archive::{ArchiveHandles, ContainerFormat, SeekTable, SeekTableError, SparseWriter};
use crate::disk::constants::modes;
use crate::disk::{StagingDir, user_chosen_size};
use crate::options::{DiskOpsOptions, ImageOwner};
use crate::util::read_full;

pub struct TerminaVmImportOperation {
    state: OperationState,
    dest: PathBuf,
    /// Base name of `dest`; ZIP entries must carry exactly this name.
    entry_name: String,
    block_size: usize,
    owner: ImageOwner,
    format: Option<ContainerFormat>,
    zip_entry: Option<ZipEntryInfo>,
    /// Bytes the container says the image holds, when it says so.
    expected_size: Option<u64>,
    staging: Option<StagingDir>,
    staged_path: PathBuf,
    handles: ArchiveHandles<Box<dyn Read>, SparseWriter>,
    consumed: Rc<Cell<u64>>,
    accounted: u64,
    buffer: Vec<u8>,
}

impl TerminaVmImportOperation {
    /// Import the container in `source` as the disk image `dest`.
    pub fn create(
        vm_id: VmId,
        source: File,
        dest: PathBuf,
        options: &DiskOpsOptions,
    ) -> DiskImageOperation {
        let mut op = Self {
            state: OperationState::new(vm_id),
            entry_name: String::new(),
            dest,
            block_size: options.block_size(),
            owner: options.resolved_import_owner(),
            format: None,
            zip_entry: None,
            expected_size: None,
            staging: None,
            staged_path: PathBuf::new(),
            handles: ArchiveHandles::new(),
            consumed: Rc::new(Cell::new(0)),
            accounted: 0,
            buffer: Vec::new(),
        };

        let prepared = op
            .prepare_input(source)
            .and_then(|_| op.prepare_output(&options.staging_suffix));
        if prepared.is_err() {
            op.release();
        }
        op.state.finish_prepare(prepared);

        tracing::info!(
            uuid = %op.state.uuid(),
            vm = %op.state.vm_id(),
            dest = %op.dest.display(),
            format = op.format.map(|f| f.as_str()).unwrap_or("unknown"),
            status = %op.state.status(),
            "Created guest VM import operation"
        );
        DiskImageOperation::GuestImport(op)
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    fn prepare_input(&mut self, source: File) -> VmDiskResult<()> {
        let metadata = source
            .metadata()
            .map_err(|e| VmDiskError::from_io("failed to stat import source", e))?;
        self.state.set_source_size(metadata.len());

        let container = format::detect(&source)?;
        self.format = Some(container);

        let (reader, consumed) = match container {
            ContainerFormat::ZstdRaw => {
                self.expected_size = trailer_size(&source)?;
                format::open_zstd_stream(source)?
            }
            ContainerFormat::Zip => {
                let entry = format::read_zip_entry(&source)?;
                self.expected_size = Some(entry.size);
                let opened = format::open_zip_entry(source, &entry)?;
                self.zip_entry = Some(entry);
                opened
            }
        };

        tracing::debug!(
            uuid = %self.state.uuid(),
            format = %container,
            expected = ?self.expected_size,
            "Detected import container"
        );
        self.handles.set_reader(reader);
        self.consumed = consumed;
        Ok(())
    }

    fn prepare_output(&mut self, staging_suffix: &str) -> VmDiskResult<()> {
        self.entry_name = self
            .dest
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                VmDiskError::InvalidArgument(format!(
                    "destination {} has no usable file name",
                    self.dest.display()
                ))
            })?
            .to_string();

        let mut staging_path = OsString::from(self.dest.as_os_str());
        staging_path.push(staging_suffix);
        let staging = StagingDir::create(&PathBuf::from(staging_path)).map_err(|e| match e {
            VmDiskError::AlreadyExists(_) => VmDiskError::AlreadyExists(format!(
                "{} is already being imported",
                self.dest.display()
            )),
            other => other,
        })?;

        self.staged_path = staging.path().join(&self.entry_name);
        self.staging = Some(staging);
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
        if self.handles.writer_mut().is_none() {
            self.start_entry()?;
        }

        let mut budget = io_limit;
        while self.state.is_in_progress() && budget > 0 {
            let (reader, writer) = self.handles.both_mut().ok_or_else(|| {
                VmDiskError::InvalidState("import handles already released".to_string())
            })?;

            let n = read_full(reader, &mut self.buffer, "failed to read import source")?;
            if n == 0 {
                return Ok(true);
            }
            writer
                .write_block(&self.buffer[..n])
                .map_err(|e| VmDiskError::from_io("failed to write disk image", e))?;

            let consumed = self.consumed.get();
            let delta = consumed.saturating_sub(self.accounted);
            self.accounted = consumed;
            self.state.add_processed(delta);
            budget = budget.saturating_sub(delta.max(n as u64));
        }
        Ok(false)
    }

    /// Create the staged image file with its final owner, marker and mode.
    fn start_entry(&mut self) -> VmDiskResult<()> {
        if let Some(entry) = &self.zip_entry {
            if entry.name != self.entry_name {
                return Err(VmDiskError::Integrity(format!(
                    "archive entry {} does not match destination {}",
                    entry.name, self.entry_name
                )));
            }
        }

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(modes::IMPORTED_IMAGE)
            .open(&self.staged_path)
            .map_err(|e| {
                VmDiskError::from_io(
                    format!("failed to create {}", self.staged_path.display()),
                    e,
                )
            })?;

        std::os::unix::fs::fchown(&file, Some(self.owner.uid), Some(self.owner.gid)).map_err(
            |e| {
                VmDiskError::from_io(
                    format!(
                        "failed to chown {} to {}:{}",
                        self.staged_path.display(),
                        self.owner.uid,
                        self.owner.gid
                    ),
                    e,
                )
            },
        )?;
        user_chosen_size::mark(&self.staged_path)?;
        // The umask may have trimmed the creation mode
        file.set_permissions(Permissions::from_mode(modes::IMPORTED_IMAGE))
            .map_err(|e| {
                VmDiskError::from_io(
                    format!("failed to set mode on {}", self.staged_path.display()),
                    e,
                )
            })?;

        tracing::debug!(
            uuid = %self.state.uuid(),
            path = %self.staged_path.display(),
            uid = self.owner.uid,
            gid = self.owner.gid,
            "Extracting disk image"
        );
        self.handles.set_writer(SparseWriter::new(file));
        Ok(())
    }

    pub(crate) fn finalize(&mut self) {
        if let Err(e) = self.commit() {
            self.release();
            self.state.fail(e);
        }
    }

    fn commit(&mut self) -> VmDiskResult<()> {
        self.handles.close_reader();
        let writer = self.handles.take_writer().ok_or_else(|| {
            VmDiskError::InvalidState("import writer already released".to_string())
        })?;
        let written = writer.position();
        let holes = writer.hole_bytes();
        writer
            .finish()
            .map_err(|e| VmDiskError::from_io("failed to flush imported image", e))?;

        if let Some(expected) = self.expected_size {
            if written != expected {
                return Err(VmDiskError::Integrity(format!(
                    "extracted {} bytes, container declared {}",
                    written, expected
                )));
            }
        }

        fs::rename(&self.staged_path, &self.dest).map_err(|e| {
            VmDiskError::from_io(
                format!(
                    "failed to move {} to {}",
                    self.staged_path.display(),
                    self.dest.display()
                ),
                e,
            )
        })?;
        if let Some(staging) = self.staging.take() {
            if let Err(e) = staging.remove_empty() {
                tracing::warn!(uuid = %self.state.uuid(), "Staging directory left behind: {}", e);
            }
        }

        tracing::debug!(
            uuid = %self.state.uuid(),
            dest = %self.dest.display(),
            bytes = written,
            holes,
            "Disk image imported"
        );
        self.state.set_status(DiskImageStatus::Created);
        Ok(())
    }

    fn release(&mut self) {
        self.handles.release();
        // Dropping the guard removes any partially extracted image
        self.staging = None;
    }
}

/// Decompressed size recorded in a seek table trailer, if there is one.
///
/// A plain zstd stream has no trailer and imports without the size
/// check. A trailer that announces itself but does not parse is corrupt,
/// including one whose frame count runs past the start of the file.
fn trailer_size(source: &File) -> VmDiskResult<Option<u64>> {
    match SeekTable::read_from(source) {
        Ok(table) => Ok(Some(table.decompressed_size())),
        Err(SeekTableError::Truncated(_))
        | Err(SeekTableError::BadMagic {
            what: "seekable footer",
            ..
        }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}
