use std::path::PathBuf;

use clap::Args;
use vmdisk::TerminaVmImportOperation;

use super::{drive, open_input};
use crate::cli::VmArgs;

#[derive(Args, Debug)]
pub struct ImportGuestArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Container produced by export-guest (zstd) or a ZIP archive
    pub source: PathBuf,

    /// Path of the restored disk image
    #[arg(short, long)]
    pub dest: PathBuf,
}

pub async fn execute(
    args: ImportGuestArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let source = open_input(&args.source)?;

    let op = TerminaVmImportOperation::create(args.vm.vm_id(), source, args.dest, &options);
    drive(op, global).await
}
