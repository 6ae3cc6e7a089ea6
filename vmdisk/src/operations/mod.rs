//! Disk image operations.
//!
//! Every operation is created by a factory that prepares its inputs and
//! outputs, then driven by a scheduler through repeated
//! [`DiskImageOperation::run`] calls. Each call does roughly `io_limit`
//! bytes of work and returns; nothing blocks beyond one block copy and
//! nothing spawns threads.

mod plugin_create;
mod plugin_export;
mod resize;
pub mod status;
mod termina_export;
mod termina_import;

pub use plugin_create::{PluginVmCreateOperation, PluginVmHost};
pub use plugin_export::PluginVmExportOperation;
pub use resize::{ResizePoll, ResizeUpdate, VmResizeOperation};
pub use status::DiskImageStatus;
pub use termina_export::TerminaVmExportOperation;
pub use termina_import::TerminaVmImportOperation;

use serde::{Deserialize, Serialize};
use vmdisk_shared::errors::{VmDiskError, VmDiskResult};

/// Identifies the VM an operation works on.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VmId {
    pub owner_id: String,
    pub name: String,
}

impl VmId {
    pub fn new(owner_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for VmId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.owner_id, self.name)
    }
}

/// Operation kinds, used in snapshots and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    PluginCreate,
    PluginExport,
    GuestExport,
    GuestImport,
    Resize,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::PluginCreate => "plugin_create",
            OperationKind::PluginExport => "plugin_export",
            OperationKind::GuestExport => "guest_export",
            OperationKind::GuestImport => "guest_import",
            OperationKind::Resize => "resize",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Point-in-time view of an operation, for status reporting.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationInfo {
    pub uuid: String,
    pub kind: OperationKind,
    pub vm: VmId,
    pub status: DiskImageStatus,
    pub failure_reason: String,
    pub source_size: u64,
    pub processed_size: u64,
    pub progress: u8,
}

/// Bookkeeping shared by all operation kinds.
///
/// Only the owning operation mutates it. Status changes go through
/// [`OperationState::set_status`], which keeps terminal values final, and
/// `processed_size` only moves forward through
/// [`OperationState::add_processed`].
#[derive(Debug)]
pub struct OperationState {
    uuid: String,
    vm_id: VmId,
    status: DiskImageStatus,
    failure_reason: String,
    source_size: u64,
    processed_size: u64,
}

impl OperationState {
    pub(crate) fn new(vm_id: VmId) -> Self {
        Self {
            uuid: uuid::Uuid::new_v4().to_string(),
            vm_id,
            status: DiskImageStatus::Unknown,
            failure_reason: String::new(),
            source_size: 0,
            processed_size: 0,
        }
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn vm_id(&self) -> &VmId {
        &self.vm_id
    }

    pub fn status(&self) -> DiskImageStatus {
        self.status
    }

    pub fn failure_reason(&self) -> &str {
        &self.failure_reason
    }

    pub fn source_size(&self) -> u64 {
        self.source_size
    }

    pub fn processed_size(&self) -> u64 {
        self.processed_size
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == DiskImageStatus::InProgress
    }

    /// Progress in percent.
    ///
    /// Terminal operations report 100, failed ones included. An
    /// operation whose source size is still unknown reports 0.
    pub fn progress(&self) -> u8 {
        if self.status.is_terminal() {
            return 100;
        }
        if self.source_size == 0 {
            return 0;
        }
        let percent = u128::from(self.processed_size) * 100 / u128::from(self.source_size);
        percent.min(100) as u8
    }

    /// Move to `status`. Ignored once the current status is terminal.
    pub(crate) fn set_status(&mut self, status: DiskImageStatus) {
        if self.status.is_terminal() {
            if status != self.status {
                tracing::warn!(
                    uuid = %self.uuid,
                    current = %self.status,
                    requested = %status,
                    "Ignoring status change on finished operation"
                );
            }
            return;
        }
        self.status = status;
    }

    pub(crate) fn set_failure_reason(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.failure_reason = reason.into();
    }

    pub(crate) fn set_source_size(&mut self, size: u64) {
        self.source_size = size;
    }

    pub(crate) fn add_processed(&mut self, bytes: u64) {
        self.processed_size = self.processed_size.saturating_add(bytes);
    }

    /// Record `err` as the final outcome.
    ///
    /// Out-of-space and missing-source errors get their own statuses so
    /// callers can show actionable messages; everything else is FAILED.
    pub(crate) fn fail(&mut self, err: VmDiskError) {
        if self.status.is_terminal() {
            tracing::warn!(uuid = %self.uuid, error = %err, "Error after operation finished");
            return;
        }
        let status = match &err {
            VmDiskError::NotEnoughSpace(_) => DiskImageStatus::NotEnoughSpace,
            VmDiskError::NotFound(_) => DiskImageStatus::DoesNotExist,
            _ => DiskImageStatus::Failed,
        };
        tracing::warn!(
            uuid = %self.uuid,
            vm = %self.vm_id,
            status = %status,
            "Disk image operation failed: {}",
            err
        );
        self.status = status;
        self.failure_reason = err.to_string();
    }

    /// Settle preparation: IN_PROGRESS on success, a failure status otherwise.
    pub(crate) fn finish_prepare(&mut self, result: VmDiskResult<()>) {
        match result {
            Ok(()) => self.set_status(DiskImageStatus::InProgress),
            Err(e) => self.fail(e),
        }
    }
}

/// A disk image job of one of the five supported kinds.
pub enum DiskImageOperation {
    PluginCreate(PluginVmCreateOperation),
    PluginExport(PluginVmExportOperation),
    GuestExport(TerminaVmExportOperation),
    GuestImport(TerminaVmImportOperation),
    Resize(VmResizeOperation),
}

impl DiskImageOperation {
    /// Do up to about `io_limit` bytes of work.
    ///
    /// Commits the result when the work is complete. Returns the status
    /// after this step; failures show up as failure statuses, not as
    /// `Err`. Calling `run` on an operation that already finished is a
    /// caller bug and returns `InvalidState` without touching anything.
    pub fn run(&mut self, io_limit: u64) -> VmDiskResult<DiskImageStatus> {
        let status = self.status();
        if status.is_terminal() {
            tracing::warn!(
                uuid = %self.uuid(),
                kind = %self.kind(),
                status = %status,
                "run() called on finished operation"
            );
            return Err(VmDiskError::InvalidState(format!(
                "operation {} already finished with status {}",
                self.uuid(),
                status
            )));
        }

        let ready = match self {
            DiskImageOperation::PluginCreate(op) => op.execute_io(io_limit),
            DiskImageOperation::PluginExport(op) => op.execute_io(io_limit),
            DiskImageOperation::GuestExport(op) => op.execute_io(io_limit),
            DiskImageOperation::GuestImport(op) => op.execute_io(io_limit),
            DiskImageOperation::Resize(op) => op.execute_io(io_limit),
        };

        if ready {
            match self {
                DiskImageOperation::PluginCreate(op) => op.finalize(),
                DiskImageOperation::PluginExport(op) => op.finalize(),
                DiskImageOperation::GuestExport(op) => op.finalize(),
                DiskImageOperation::GuestImport(op) => op.finalize(),
                DiskImageOperation::Resize(op) => op.finalize(),
            }
            let state = self.state();
            if state.status().is_success() {
                tracing::info!(
                    uuid = %state.uuid(),
                    vm = %state.vm_id(),
                    kind = %self.kind(),
                    processed = state.processed_size(),
                    "Disk image operation completed with {}",
                    state.status()
                );
            }
        }

        Ok(self.status())
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            DiskImageOperation::PluginCreate(_) => OperationKind::PluginCreate,
            DiskImageOperation::PluginExport(_) => OperationKind::PluginExport,
            DiskImageOperation::GuestExport(_) => OperationKind::GuestExport,
            DiskImageOperation::GuestImport(_) => OperationKind::GuestImport,
            DiskImageOperation::Resize(_) => OperationKind::Resize,
        }
    }

    pub fn state(&self) -> &OperationState {
        match self {
            DiskImageOperation::PluginCreate(op) => op.state(),
            DiskImageOperation::PluginExport(op) => op.state(),
            DiskImageOperation::GuestExport(op) => op.state(),
            DiskImageOperation::GuestImport(op) => op.state(),
            DiskImageOperation::Resize(op) => op.state(),
        }
    }

    pub fn uuid(&self) -> &str {
        self.state().uuid()
    }

    pub fn vm_id(&self) -> &VmId {
        self.state().vm_id()
    }

    pub fn status(&self) -> DiskImageStatus {
        self.state().status()
    }

    pub fn failure_reason(&self) -> &str {
        self.state().failure_reason()
    }

    pub fn source_size(&self) -> u64 {
        self.state().source_size()
    }

    pub fn processed_size(&self) -> u64 {
        self.state().processed_size()
    }

    pub fn progress(&self) -> u8 {
        self.state().progress()
    }

    pub fn info(&self) -> OperationInfo {
        let state = self.state();
        OperationInfo {
            uuid: state.uuid().to_string(),
            kind: self.kind(),
            vm: state.vm_id().clone(),
            status: state.status(),
            failure_reason: state.failure_reason().to_string(),
            source_size: state.source_size(),
            processed_size: state.processed_size(),
            progress: state.progress(),
        }
    }
}

impl std::fmt::Debug for DiskImageOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskImageOperation")
            .field("kind", &self.kind())
            .field("state", self.state())
            .finish()
    }
}
