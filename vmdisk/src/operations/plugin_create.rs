//! Plugin VM creation from an install image stream.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

use super::{DiskImageOperation, DiskImageStatus, OperationState, VmId};
use crate::archive::ArchiveHandles;
use crate::disk::StagingDir;
use crate::disk::constants::modes;
use crate::options::DiskOpsOptions;
use crate::util::chunk_len;

/// Side effects performed once the install image is in place.
///
/// Implemented by whatever manages plugin VMs on the host.
pub trait PluginVmHost {
    /// Register a new VM whose files live in `vm_dir`.
    fn create_vm(&mut self, vm: &VmId, vm_dir: &Path) -> VmDiskResult<()>;

    /// Attach the copied install image to the VM.
    fn attach_install_image(&mut self, vm: &VmId, image: &Path) -> VmDiskResult<()>;

    /// Attach the guest tools image to the VM.
    fn attach_tools(&mut self, vm: &VmId) -> VmDiskResult<()>;

    /// Undo `create_vm`.
    fn delete_vm(&mut self, vm: &VmId) -> VmDiskResult<()>;
}

pub struct PluginVmCreateOperation {
    state: OperationState,
    host: Box<dyn PluginVmHost>,
    block_size: usize,
    staging: Option<StagingDir>,
    image_path: PathBuf,
    handles: ArchiveHandles<File, File>,
    buffer: Vec<u8>,
}

impl PluginVmCreateOperation {
    /// Prepare to copy `source` into `<vm_dir>/<install image name>`.
    ///
    /// `vm_dir` must not exist yet; it is removed again unless the VM is
    /// fully set up.
    pub fn create(
        vm_id: VmId,
        source: File,
        vm_dir: PathBuf,
        host: Box<dyn PluginVmHost>,
        options: &DiskOpsOptions,
    ) -> DiskImageOperation {
        let image_path = vm_dir.join(&options.plugin_install_image_name);
        let mut op = Self {
            state: OperationState::new(vm_id),
            host,
            block_size: options.block_size(),
            staging: None,
            image_path,
            handles: ArchiveHandles::new(),
            buffer: Vec::new(),
        };

        let prepared = op
            .prepare_input(source)
            .and_then(|_| op.prepare_output(&vm_dir));
        if prepared.is_err() {
            op.release();
        }
        op.state.finish_prepare(prepared);

        tracing::info!(
            uuid = %op.state.uuid(),
            vm = %op.state.vm_id(),
            dir = %vm_dir.display(),
            status = %op.state.status(),
            "Created plugin VM create operation"
        );
        DiskImageOperation::PluginCreate(op)
    }

    pub fn state(&self) -> &OperationState {
        &self.state
    }

    fn prepare_input(&mut self, source: File) -> VmDiskResult<()> {
        // Pipes and sockets have no meaningful length; progress stays at 0
        let metadata = source
            .metadata()
            .map_err(|e| VmDiskError::from_io("failed to stat install image source", e))?;
        if metadata.is_file() {
            self.state.set_source_size(metadata.len());
        }
        self.handles.set_reader(source);
        Ok(())
    }

    fn prepare_output(&mut self, vm_dir: &Path) -> VmDiskResult<()> {
        let staging = StagingDir::create(vm_dir)?;

        let image = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(modes::INSTALL_IMAGE)
            .open(&self.image_path)
            .map_err(|e| {
                VmDiskError::from_io(format!("failed to create {}", self.image_path.display()), e)
            })?;

        self.handles.set_writer(image);
        self.staging = Some(staging);
        self.buffer = vec![0u8; self.block_size];
        Ok(())
    }

    pub(crate) fn execute_io(&mut self, io_limit: u64) -> bool {
        match self.copy_blocks(io_limit) {
            Ok(done) => done,
            Err(e) => {
                self.release();
                self.state.fail(e);
                false
            }
        }
    }

    fn copy_blocks(&mut self, io_limit: u64) -> VmDiskResult<bool> {
        let mut budget = io_limit;
        while self.state.is_in_progress() && budget > 0 {
            let (reader, writer) = self.handles.both_mut().ok_or_else(|| {
                VmDiskError::InvalidState("install image handles already released".to_string())
            })?;

            let len = chunk_len(budget, self.block_size);
            let n = match reader.read(&mut self.buffer[..len]) {
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(VmDiskError::from_io("failed to read install image", e)),
            };
            if n == 0 {
                return Ok(true);
            }

            writer
                .write_all(&self.buffer[..n])
                .map_err(|e| VmDiskError::from_io("failed to write install image", e))?;
            self.state.add_processed(n as u64);
            budget = budget.saturating_sub(n as u64);
            tracing::trace!(uuid = %self.state.uuid(), bytes = n, "Copied install image block");
        }
        Ok(false)
    }

    pub(crate) fn finalize(&mut self) {
        if let Err(e) = self.commit() {
            self.release();
            self.state.fail(e);
        }
    }

    fn commit(&mut self) -> VmDiskResult<()> {
        self.handles.close_reader();
        if let Some(image) = self.handles.take_writer() {
            image
                .sync_all()
                .map_err(|e| VmDiskError::from_io("failed to sync install image", e))?;
        }

        let vm_dir = match &self.staging {
            Some(staging) => staging.path().to_path_buf(),
            None => {
                return Err(VmDiskError::InvalidState(
                    "VM directory already released".to_string(),
                ));
            }
        };
        let vm = self.state.vm_id().clone();

        self.host.create_vm(&vm, &vm_dir)?;
        tracing::debug!(uuid = %self.state.uuid(), vm = %vm, "Plugin VM registered");

        let attached = self
            .host
            .attach_install_image(&vm, &self.image_path)
            .and_then(|_| self.host.attach_tools(&vm));
        if let Err(e) = attached {
            if let Err(rollback) = self.host.delete_vm(&vm) {
                tracing::warn!(
                    uuid = %self.state.uuid(),
                    vm = %vm,
                    "Failed to delete VM after attach failure: {}",
                    rollback
                );
            }
            return Err(e);
        }

        if let Some(staging) = self.staging.take() {
            staging.take();
        }
        self.state.set_status(DiskImageStatus::Created);
        Ok(())
    }

    fn release(&mut self) {
        self.handles.release();
        // Dropping the guard removes the partially created VM directory
        self.staging = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingHost {
        calls: Rc<RefCell<Vec<String>>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingHost {
        fn record(&self, call: &'static str) -> VmDiskResult<()> {
            self.calls.borrow_mut().push(call.to_string());
            if self.fail_on == Some(call) {
                return Err(VmDiskError::Internal(format!("{} refused", call)));
            }
            Ok(())
        }
    }

    impl PluginVmHost for RecordingHost {
        fn create_vm(&mut self, _vm: &VmId, vm_dir: &Path) -> VmDiskResult<()> {
            assert!(vm_dir.is_dir());
            self.record("create_vm")
        }

        fn attach_install_image(&mut self, _vm: &VmId, image: &Path) -> VmDiskResult<()> {
            assert!(image.is_file());
            self.record("attach_install_image")
        }

        fn attach_tools(&mut self, _vm: &VmId) -> VmDiskResult<()> {
            self.record("attach_tools")
        }

        fn delete_vm(&mut self, _vm: &VmId) -> VmDiskResult<()> {
            self.record("delete_vm")
        }
    }

    fn source(dir: &TempDir, bytes: &[u8]) -> File {
        let path = dir.path().join("install-src.iso");
        std::fs::write(&path, bytes).unwrap();
        File::open(path).unwrap()
    }

    fn run_to_end(op: &mut DiskImageOperation) {
        while op.status() == DiskImageStatus::InProgress {
            op.run(1000).unwrap();
        }
    }

    #[test]
    fn test_creates_vm_with_install_image() {
        let temp_dir = TempDir::new().unwrap();
        let data = vec![7u8; 4500];
        let vm_dir = temp_dir.path().join("pvm");
        let calls = Rc::new(RefCell::new(Vec::new()));
        let host = RecordingHost {
            calls: Rc::clone(&calls),
            fail_on: None,
        };

        let mut op = PluginVmCreateOperation::create(
            VmId::new("owner", "PvmDefault"),
            source(&temp_dir, &data),
            vm_dir.clone(),
            Box::new(host),
            &DiskOpsOptions::default(),
        );
        assert_eq!(op.status(), DiskImageStatus::InProgress);
        assert_eq!(op.source_size(), 4500);

        op.run(1000).unwrap();
        assert_eq!(op.processed_size(), 1000);
        run_to_end(&mut op);

        assert_eq!(op.status(), DiskImageStatus::Created);
        assert_eq!(
            *calls.borrow(),
            vec!["create_vm", "attach_install_image", "attach_tools"]
        );
        let image = vm_dir.join("install.iso");
        assert_eq!(std::fs::read(&image).unwrap(), data);
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(&image).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_attach_failure_rolls_back() {
        let temp_dir = TempDir::new().unwrap();
        let vm_dir = temp_dir.path().join("pvm");
        let calls = Rc::new(RefCell::new(Vec::new()));
        let host = RecordingHost {
            calls: Rc::clone(&calls),
            fail_on: Some("attach_tools"),
        };

        let mut op = PluginVmCreateOperation::create(
            VmId::new("owner", "PvmDefault"),
            source(&temp_dir, b"iso"),
            vm_dir.clone(),
            Box::new(host),
            &DiskOpsOptions::default(),
        );
        run_to_end(&mut op);

        assert_eq!(op.status(), DiskImageStatus::Failed);
        assert!(op.failure_reason().contains("attach_tools refused"));
        assert_eq!(
            *calls.borrow(),
            vec![
                "create_vm",
                "attach_install_image",
                "attach_tools",
                "delete_vm"
            ]
        );
        assert!(!vm_dir.exists());
    }

    #[test]
    fn test_existing_vm_dir_fails_prepare() {
        let temp_dir = TempDir::new().unwrap();
        let vm_dir = temp_dir.path().join("pvm");
        std::fs::create_dir(&vm_dir).unwrap();
        std::fs::write(vm_dir.join("keep"), b"x").unwrap();

        let op = PluginVmCreateOperation::create(
            VmId::new("owner", "PvmDefault"),
            source(&temp_dir, b"iso"),
            vm_dir.clone(),
            Box::new(RecordingHost::default()),
            &DiskOpsOptions::default(),
        );

        assert_eq!(op.status(), DiskImageStatus::Failed);
        assert!(vm_dir.join("keep").exists(), "foreign directory untouched");
    }
}
