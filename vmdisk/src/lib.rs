//! vmdisk - incremental disk image operations for VM hosts
//!
//! Creates, exports, imports and resizes VM disk images as cooperative
//! jobs: each job is driven by repeated `run(io_limit)` calls from a
//! single-threaded scheduler and never blocks for longer than one block
//! of I/O.

pub mod archive;
pub mod disk;
pub mod operations;
pub mod options;
pub mod util;

pub use operations::{
    DiskImageOperation, DiskImageStatus, OperationInfo, OperationKind, OperationState,
    PluginVmCreateOperation, PluginVmExportOperation, PluginVmHost, ResizePoll, ResizeUpdate,
    TerminaVmExportOperation, TerminaVmImportOperation, VmId, VmResizeOperation,
};
pub use options::{DiskOpsOptions, ImageOwner};
pub use vmdisk_shared::{VmDiskError, VmDiskResult};
