use std::path::PathBuf;

use clap::Args;
use vmdisk::PluginVmExportOperation;

use super::{create_output, drive};
use crate::cli::VmArgs;

#[derive(Args, Debug)]
pub struct ExportPluginArgs {
    #[command(flatten)]
    pub vm: VmArgs,

    /// Plugin VM directory, or a single file
    pub source: PathBuf,

    /// Output ZIP path
    #[arg(short, long)]
    pub output: PathBuf,

    /// Write the SHA-256 of the output here
    #[arg(long)]
    pub digest: Option<PathBuf>,
}

pub async fn execute(
    args: ExportPluginArgs,
    global: &crate::cli::GlobalFlags,
) -> anyhow::Result<()> {
    let options = global.load_options()?;
    let out = create_output(&args.output)?;
    let digest = args.digest.as_deref().map(create_output).transpose()?;

    let op = PluginVmExportOperation::create(args.vm.vm_id(), args.source, out, digest, &options);
    drive(op, global).await
}
