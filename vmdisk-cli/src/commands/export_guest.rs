use std::path::PathBuf;

use clap::Args;
use vmdisk::TerminaVmExportOperation;

use super::{create_output, drive};
use crate::cli::VmArgs;

#[derive(Args, Debug)]
pub struct ExportGuestArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Disk image to export
    pub source: PathBuf,

    /// Output container path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Write the SHA-256 of the output here
    #[arg(long)]
    pub digest: Option<PathBuf>,
}

pub async fn execute(
    args: ExportGuestArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let out = create_output(&args.output)?;
    let digest = args.digest.as_deref().map(create_output).transpose()?;

    let op = TerminaVmExportOperation::create(args.vm.vm_id(), args.source, out, digest, &options);
    drive(op, global).await
}
