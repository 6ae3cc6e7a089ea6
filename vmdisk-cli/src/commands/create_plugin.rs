use std::path::{Path, PathBuf};

use clap::Args;
use vmdisk::{PluginVmCreateOperation, PluginVmHost, VmDiskResult, VmId};

use super::{drive, open_input};
use crate::cli::VmArgs;

#[derive(Args, Debug)]
pub struct CreatePluginArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Install image to copy into the new VM directory
    pub install_image: PathBuf,

    /// Directory to create for the VM (must not exist)
    #[arg(long)]
    pub vm_dir: PathBuf,
}

/// Host without a plugin VM manager: records each step in the log.
struct LoggingHost;

impl PluginVmHost for LoggingHost {
    fn create_vm(&mut self, vm: &VmId, vm_dir: &Path) -> VmDiskResult<()> {
        tracing::info!(vm = %vm, dir = %vm_dir.display(), "create_vm");
        Ok(())
    }

    fn attach_install_image(&mut self, vm: &VmId, image: &Path) -> VmDiskResult<()> {
        tracing::info!(vm = %vm, image = %image.display(), "attach_install_image");
        Ok(())
    }

    fn attach_tools(&mut self, vm: &VmId) -> VmDiskResult<()> {
        tracing::info!(vm = %vm, "attach_tools");
        Ok(())
    }

    fn delete_vm(&mut self, vm: &VmId) -> VmDiskResult<()> {
        tracing::info!(vm = %vm, "delete_vm");
        Ok(())
    }
}

pub async fn execute(
    args: CreatePluginArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let source = open_input(&args.install_image)?;

    let op = PluginVmCreateOperation::create(
        args.vm.vm_id(),
        source,
        args.vm_dir,
        Box::new(LoggingHost),
        &options,
    );
    drive(op, global).await
}
