//! Plugin VM export into a ZIP container.
//!
//! A directory source becomes one entry per file, directory and symlink,
//! all under `<vm_name>.pvm/`. A single-file source becomes one entry
//! named after the file. The output is written in streaming mode (local
//! headers followed by data descriptors, no seeking back), so every byte
//! can be hashed as it leaves.

use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{Read, Take, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use vmdisk_shared::errors::{VmDiskError, VmDiskResult};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::{SimpleFileOptions, StreamWriter};
use zip::{CompressionMethod, ZipWriter};

use super::{DiskImageOperation, DiskImageStatus, OperationState, VmId};
use crate::archive::digest::write_digest_file;
use crate::archive::{ArchiveHandles, DigestWriter, SharedDigest};
use crate::disk::constants::plugin::BUNDLE_SUFFIX;
use crate::options::DiskOpsOptions;
use crate::util::chunk_len;

type ExportZip = ZipWriter<StreamWriter<DigestWriter<File>>>;

#[derive(Debug)]
enum EntryKind {
    File { size: u64 },
    Directory,
    Symlink { target: String },
}

/// A source entry waiting to be written.
#[derive(Debug)]
struct PendingEntry {
    path: PathBuf,
    name: String,
    mode: u32,
    kind: EntryKind,
}

pub struct PluginVmExportOperation {
    state: OperationState,
    source: PathBuf,
    compression_level: i64,
    block_size: usize,
    pending: VecDeque<PendingEntry>,
    handles: ArchiveHandles<Take<File>, ExportZip>,
    digest: SharedDigest,
    digest_sink: Option<File>,
    buffer: Vec<u8>,
}

impl PluginVmExportOperation {
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
            compression_level: options.zip_compression_level,
            block_size: options.block_size(),
            pending: VecDeque::new(),
            handles: ArchiveHandles::new(),
            digest: SharedDigest::new(),
            digest_sink,
            buffer: Vec::new(),
        };

        let prepared = op.prepare_input();
        match prepared {
            Ok(()) => op.prepare_output(out),
            Err(_) => op.release(),
        }
        op.state.finish_prepare(prepared);

        tracing::info!(
            uuid = %op.state.uuid(),
            vm = %op.state.vm_id(),
            source = %op.source.display(),
            entries = op.pending.len(),
            status = %op.state.status(),
            "Created plugin VM export operation"
        );
        DiskImageOperation::PluginExport(op)
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    /// Collect the entries to export and total their sizes.
    ///
    /// The walk stays on the source filesystem and does not follow
    /// symlinks; extended attributes and file flags are not exported.
    fn prepare_input(&mut self) -> VmDiskResult<()> {
        let metadata = fs::symlink_metadata(&self.source).map_err(|e| {
            VmDiskError::from_io(format!("failed to stat {}", self.source.display()), e)
        })?;

        if metadata.is_file() {
            let name = self
                .source
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    VmDiskError::InvalidArgument(format!(
                        "source {} has no usable file name",
                        self.source.display()
                    ))
                })?
                .to_string();
            self.pending.push_back(PendingEntry {
                path: self.source.clone(),
                name,
                mode: metadata.permissions().mode() & 0o7777,
                kind: EntryKind::File {
                    size: metadata.len(),
                },
            });
        } else if metadata.is_dir() {
            self.collect_tree()?;
        } else {
            return Err(VmDiskError::InvalidArgument(format!(
                "{} is neither a file nor a directory",
                self.source.display()
            )));
        }

        let total = self
            .pending
            .iter()
            .map(|entry| match entry.kind {
                EntryKind::File { size } => size,
                _ => 0,
            })
            .sum();
        self.state.set_source_size(total);
        Ok(())
    }

    fn collect_tree(&mut self) -> VmDiskResult<()> {
        let prefix = format!("{}{}", self.state.vm_id().name, BUNDLE_SUFFIX);
        let walker = WalkDir::new(&self.source)
            .follow_links(false)
            .same_file_system(true)
            .sort_by_file_name();

        for entry in walker {
            let entry = entry.map_err(|e| {
                VmDiskError::from_io(
                    format!("failed to walk {}", self.source.display()),
                    e.into(),
                )
            })?;
            // The root itself is represented by the prefix
            if entry.depth() == 0 {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.source)
                .ok()
                .and_then(Path::to_str)
                .ok_or_else(|| {
                    VmDiskError::InvalidArgument(format!(
                        "cannot name {} inside the export",
                        entry.path().display()
                    ))
                })?;
            let name = format!("{}/{}", prefix, relative);

            let metadata = entry.metadata().map_err(|e| {
                VmDiskError::from_io(
                    format!("failed to stat {}", entry.path().display()),
                    e.into(),
                )
            })?;
            let mode = metadata.permissions().mode() & 0o7777;
            let file_type = metadata.file_type();

            let kind = if file_type.is_dir() {
                EntryKind::Directory
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path()).map_err(|e| {
                    VmDiskError::from_io(
                        format!("failed to read link {}", entry.path().display()),
                        e,
                    )
                })?;
                let target = target.to_str().map(str::to_string).ok_or_else(|| {
                    VmDiskError::InvalidArgument(format!(
                        "symlink target of {} is not UTF-8",
                        entry.path().display()
                    ))
                })?;
                EntryKind::Symlink { target }
            } else if file_type.is_file() {
                EntryKind::File {
                    size: metadata.len(),
                }
            } else {
                tracing::warn!(
                    uuid = %self.state.uuid(),
                    path = %entry.path().display(),
                    "Skipping special file in plugin VM export"
                );
                continue;
            };

            self.pending.push_back(PendingEntry {
                path: entry.into_path(),
                name,
                mode,
                kind,
            });
        }
        Ok(())
    }

    fn prepare_output(&mut self, out: File) {
        let writer = DigestWriter::new(out, self.digest.clone());
        self.handles.set_writer(ZipWriter::new_stream(writer));
        self.buffer = vec![0u8; self.block_size];
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
            if let Some((reader, writer)) = self.handles.both_mut() {
                let len = chunk_len(budget, self.block_size);
                let n = match reader.read(&mut self.buffer[..len]) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(VmDiskError::from_io("failed to read export source", e)),
                };
                if n == 0 {
                    self.handles.close_reader();
                    continue;
                }
                writer
                    .write_all(&self.buffer[..n])
                    .map_err(|e| VmDiskError::from_io("failed to write zip entry data", e))?;
                self.state.add_processed(n as u64);
                budget = budget.saturating_sub(n as u64);
                continue;
            }

            match self.pending.pop_front() {
                Some(entry) => self.start_entry(entry)?,
                None => return Ok(true),
            }
        }
        Ok(false)
    }

    fn start_entry(&mut self, entry: PendingEntry) -> VmDiskResult<()> {
        let writer = self.handles.writer_mut().ok_or_else(|| {
            VmDiskError::InvalidState("zip writer already released".to_string())
        })?;
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(Some(self.compression_level))
            .unix_permissions(entry.mode);

        tracing::trace!(uuid = %self.state.uuid(), entry = %entry.name, "Adding zip entry");
        match entry.kind {
            EntryKind::Directory => writer
                .add_directory(entry.name.as_str(), options)
                .map_err(|e| zip_error(&entry.name, e)),
            EntryKind::Symlink { target } => writer
                .add_symlink(entry.name.as_str(), target.as_str(), options)
                .map_err(|e| zip_error(&entry.name, e)),
            EntryKind::File { size } => {
                let file = File::open(&entry.path).map_err(|e| {
                    VmDiskError::from_io(format!("failed to open {}", entry.path.display()), e)
                })?;
                writer
                    .start_file(
                        entry.name.as_str(),
                        options.large_file(size >= u64::from(u32::MAX)),
                    )
                    .map_err(|e| zip_error(&entry.name, e))?;
                // Size was fixed when the entry was collected
                self.handles.set_reader(file.take(size));
                Ok(())
            }
        }
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
            VmDiskError::InvalidState("zip writer already released".to_string())
        })?;
        writer
            .finish()
            .map_err(|e| zip_error("central directory", e))?;

        if let Some(sink) = self.digest_sink.as_mut() {
            write_digest_file(sink, &self.digest)?;
        }
        tracing::debug!(
            uuid = %self.state.uuid(),
            bytes = self.digest.bytes(),
            sha256 = %self.digest.hex_digest(),
            "Plugin VM export written"
        );

        self.state.set_status(DiskImageStatus::Created);
        Ok(())
    }

    fn release(&mut self) {
        self.handles.release();
        self.pending.clear();
    }
}

fn zip_error(what: &str, err: ZipError) -> VmDiskError {
    let context = format!("failed to write zip entry {}", what);
    match err {
        ZipError::Io(e) => VmDiskError::from_io(context, e),
        other => VmDiskError::Archive(format!("{}: {}", context, other)),
    }
}
